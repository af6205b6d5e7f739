//! The interactive debugger.
//!
//! Reached from a debug operation in the program, a wrap-around break, a
//! left-bound fault, or an interrupt. The break location is recovered by
//! mapping the native code offset back to the nearest program node; the REPL
//! then runs on standard error, reading commands from standard input.

use std::io::{self, BufRead, Write};
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::parser::{NodeKind, find_node_at};
use crate::vm::{Cell, Vm};

/// Outstanding `continue` count: 0 breaks interactively, N skips the next
/// N-1 breaks, -1 never breaks again.
static CONTINUE: AtomicI64 = AtomicI64::new(0);

struct Command {
    name: &'static str,
    usage: &'static str,
    handler: fn(&mut Vm, &mut *mut Cell, &str),
}

static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        usage: "[<command>]\n\
\tDisplays usage information for all matching commands. Without an argument,\n\
\tdisplays information on all commands.\n",
        handler: cmd_help,
    },
    Command {
        name: "quit",
        usage: "\n\tAborts the currently running program and quits the debugger.\n",
        handler: cmd_quit,
    },
    Command {
        name: "continue",
        usage: "[<N>]\n\
\tResumes execution until the N'th next breakpoint. Without argument, N\n\
\tdefaults to 1 (break at the next breakpoint). When N is 0, continues\n\
\texecution indefinitely, never breaking again.\n",
        handler: cmd_continue,
    },
    Command {
        name: "display",
        usage: "[<start> [<width>] [<height>]]\n\
\tDisplays tape memory, starting at offset `start' (or near the tape head if\n\
\tstart is not given), in `height' lines showing `width' bytes each.\n",
        handler: cmd_display,
    },
    Command {
        name: "head",
        usage: "[<position>]\n\
\tWithout an argument, displays the current (zero-based) position of the\n\
\ttape head. With an argument, places the head at the specified position.\n",
        handler: cmd_head,
    },
    Command {
        name: "move",
        usage: "<distance>\n\
\tMoves the tape head by the given distance, which may be positive or\n\
\tnegative.\n",
        handler: cmd_move,
    },
    Command {
        name: "write",
        usage: "<value> [<offset>]\n\
\tWrite a value to the cell at an offset relative to the tape head.\n\
\tIf no offset is provided, it is assumed to be 0.\n",
        handler: cmd_write,
    },
    Command {
        name: "add",
        usage: "<value> [<offset>]\n\
\tAdd a value to the cell at an offset relative to the tape head.\n\
\tIf no offset is provided, it is assumed to be 0.\n",
        handler: cmd_add,
    },
    Command {
        name: "subtract",
        usage: "<value> [<offset>]\n\
\tSubtract a value from the cell at an offset relative to the tape head.\n\
\tIf no offset is provided, it is assumed to be 0.\n",
        handler: cmd_subtract,
    },
];

/// Suspend execution and talk to the user. `offset` is the position in the
/// code buffer where the break happened, when known.
pub fn debug_break(vm: &mut Vm, head: &mut *mut Cell, offset: Option<usize>) {
    vm.flush_output();
    report_location(vm, offset);

    while CONTINUE.load(Ordering::Relaxed) == 0 {
        eprint!("(debug) ");
        let _ = io::stderr().flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                eprintln!();
                process::exit(0);
            }
            Ok(_) => {}
        }

        let matched: Vec<&Command> = COMMANDS
            .iter()
            .filter(|c| command_match(c.name, &line))
            .collect();
        match matched.as_slice() {
            [command] => (command.handler)(vm, head, &line),
            [] => {
                eprintln!("Command not recognized. Type `help' for a list of supported commands.");
            }
            _ => {
                eprintln!("Command is ambiguous. Type `help' for a list of supported commands.");
            }
        }
    }

    let remaining = CONTINUE.load(Ordering::Relaxed);
    if remaining > 0 {
        CONTINUE.store(remaining - 1, Ordering::Relaxed);
    }
}

/// Map the break offset back to a source position and announce it. A loop
/// has two interesting endpoints; which one was hit follows from whether the
/// break lies before the loop's body.
fn report_location(vm: &Vm, offset: Option<usize>) {
    let Some(offset) = offset else { return };
    let Some(node) = find_node_at(vm.program(), offset) else {
        return;
    };

    let mut begin = node.origin.begin;
    let mut end = node.origin.end;
    if let NodeKind::Loop(children) = &node.kind
        && let Some(first) = children.first()
    {
        if first.code.begin >= offset {
            end = begin;
        } else {
            begin = end;
        }
    }

    if begin == end {
        println!("Break at source line {}, column {}.", begin.line, begin.column);
    } else if begin.line == end.line {
        println!(
            "Break at source line {}, between column {} and {}.",
            begin.line, begin.column, end.column
        );
    } else {
        println!(
            "Break between source line {}, column {} and line {}, column {}.",
            begin.line, begin.column, end.line, end.column
        );
    }
}

/// True when the first word of `line` is a prefix of `name`. An empty line
/// matches every command (and is therefore ambiguous).
fn command_match(name: &str, line: &str) -> bool {
    let word = line.split_whitespace().next().unwrap_or("");
    name.starts_with(word)
}

/// The `index`-th argument after the command word.
fn arg<T: FromStr>(line: &str, index: usize) -> Option<T> {
    line.split_whitespace().nth(index + 1)?.parse().ok()
}

fn head_position(vm: &Vm, head: *mut Cell) -> i64 {
    head as i64 - vm.tape().base() as i64
}

/// Grow the tape until `pos` is addressable, keeping `head` valid across
/// relocations.
fn extend_tape(vm: &mut Vm, head: &mut *mut Cell, pos: i64) {
    while pos >= 0 && usize::try_from(pos).unwrap() >= vm.tape().size() {
        vm.grow_tape(head);
    }
}

fn set_head_position(vm: &mut Vm, head: &mut *mut Cell, pos: i64) {
    extend_tape(vm, head, pos);
    let pos = usize::try_from(pos.max(0)).unwrap();
    *head = unsafe { vm.tape().base().add(pos) };
    eprintln!("{pos}");
}

fn cmd_help(_vm: &mut Vm, _head: &mut *mut Cell, line: &str) {
    let filter: Option<&str> = line.split_whitespace().nth(1);
    if filter.is_none() {
        eprintln!(
            "The debugger supports the following commands. Each command can be abbreviated\n\
             to a unique prefix of the command (e.g. `c' instead of `continue')."
        );
    }
    for command in COMMANDS {
        if let Some(prefix) = filter
            && !command.name.starts_with(prefix)
        {
            continue;
        }
        eprintln!("\n{} {}", command.name, command.usage);
    }
}

fn cmd_quit(_vm: &mut Vm, _head: &mut *mut Cell, _line: &str) {
    process::exit(0);
}

fn cmd_continue(_vm: &mut Vm, _head: &mut *mut Cell, line: &str) {
    let n: i64 = arg(line, 0).filter(|n| *n >= 0).unwrap_or(1);
    CONTINUE.store(if n == 0 { -1 } else { n }, Ordering::Relaxed);
}

fn cmd_display(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    let head_pos = head_position(vm, *head);
    let start = arg::<i64>(line, 0).unwrap_or(head_pos - 6).max(0);
    let cols = arg::<i64>(line, 1).filter(|v| *v > 0).unwrap_or(14);
    let rows = arg::<i64>(line, 2).filter(|v| *v > 0).unwrap_or(1);

    let tape = vm.tape().bytes();
    let mut pos = usize::try_from(start).unwrap().min(tape.len());
    for row in 0..rows {
        eprint!("{:8}: ", start + cols * row);
        for _ in 0..cols {
            let value = tape.get(pos).copied().unwrap_or(0);
            if i64::try_from(pos).unwrap() == head_pos {
                eprint!("[{value:3}]");
            } else {
                eprint!(" {value:3} ");
            }
            pos += 1;
        }
        eprintln!();
    }
}

fn cmd_head(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    if let Some(pos) = arg::<i64>(line, 0) {
        set_head_position(vm, head, pos);
    } else {
        eprintln!("{}", head_position(vm, *head));
    }
}

fn cmd_move(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    let Some(dist) = arg::<i64>(line, 0) else {
        eprintln!("Too few arguments for `move' command!");
        return;
    };
    let pos = head_position(vm, *head) + dist;
    set_head_position(vm, head, pos);
}

/// Shared implementation of write/add/subtract:
/// `cell = keep*cell + sign*value`, all modulo 256.
fn change_value(vm: &mut Vm, head: &mut *mut Cell, line: &str, name: &str, keep: i64, sign: i64) {
    let Some(value) = arg::<i64>(line, 0) else {
        eprintln!("Too few arguments for `{name}' command!");
        return;
    };
    let offset: i64 = arg(line, 1).unwrap_or(0);

    let pos = head_position(vm, *head) + offset;
    if pos < 0 {
        eprintln!("Target position ({pos}) out of bounds!");
        return;
    }
    extend_tape(vm, head, pos);
    unsafe {
        let cell = vm.tape().base().add(usize::try_from(pos).unwrap());
        *cell = (keep * i64::from(*cell) + sign * value) as u8;
    }
}

fn cmd_write(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    change_value(vm, head, line, "write", 0, 1);
}

fn cmd_add(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    change_value(vm, head, line, "add", 1, 1);
}

fn cmd_subtract(vm: &mut Vm, head: &mut *mut Cell, line: &str) {
    change_value(vm, head, line, "subtract", 1, -1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_match_unique_prefixes() {
        assert!(command_match("continue", "c 3\n"));
        assert!(command_match("continue", "continue\n"));
        assert!(!command_match("continue", "continues\n"));
        assert!(!command_match("quit", "help\n"));
        // Leading whitespace is ignored.
        assert!(command_match("head", "  hea\n"));
    }

    #[test]
    fn empty_line_matches_everything() {
        for command in COMMANDS {
            assert!(command_match(command.name, "\n"));
        }
    }

    #[test]
    fn prefixes_resolve_uniquely_where_expected() {
        let count = |line: &str| {
            COMMANDS
                .iter()
                .filter(|c| command_match(c.name, line))
                .count()
        };
        assert_eq!(count("q\n"), 1);
        assert_eq!(count("d\n"), 1);
        assert_eq!(count("s\n"), 1);
        // `h' is help or head.
        assert_eq!(count("h\n"), 2);
    }

    #[test]
    fn arguments_parse_positionally() {
        assert_eq!(arg::<i64>("write 12 -3\n", 0), Some(12));
        assert_eq!(arg::<i64>("write 12 -3\n", 1), Some(-3));
        assert_eq!(arg::<i64>("write\n", 0), None);
        assert_eq!(arg::<i64>("display x\n", 0), None);
    }
}
