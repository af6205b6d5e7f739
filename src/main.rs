#[macro_use]
extern crate serde_derive;

mod debugger;
mod elf;
mod optimizer;
mod parser;
mod vm;

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, LineWriter, Read, Write};

use anyhow::{Context, Result, bail};
use docopt::Docopt;

use parser::ParseResult;
use vm::Vm;

const USAGE: &str = "
Brainfuck interpreter and JIT compiler.

Usage:
  bfvm [options] [<source>]
  bfvm (-h | --help)

Options:
  -h --help   Show this screen.
  -e <code>   Use <code> as the program source (don't read from a file).
  -d <char>   Debug breakpoint character; an empty argument selects `#'.
  -s <char>   Separator between source code and program input; an empty
              argument selects `!'.
  -O          Optimize the program before code generation.
  -w          Break to the debugger when a cell value wraps around.
  -c          Compile an object file (don't execute).
  -p          Print the program in compact form (don't execute).
  -t          Print the program tree (don't execute).
  -i <path>   Read program input from <path> instead of standard input.
  -o <path>   Write program output to <path> instead of standard output.
  -b <mode>   Output buffering for -o: none, line or full [default: line].
  -m <size>   Tape memory limit (K, M or G suffix recognized).
  -z <byte>   Value stored when a read hits end of input (default: none).
  -P          Enable the sampling profiler; prints the annotated tree at exit.
";

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct Args {
    arg_source: Option<String>,
    flag_e: Option<String>,
    flag_d: Option<String>,
    flag_s: Option<String>,
    flag_O: bool,
    flag_w: bool,
    flag_c: bool,
    flag_p: bool,
    flag_t: bool,
    flag_i: Option<String>,
    flag_o: Option<String>,
    flag_b: String,
    flag_m: Option<String>,
    flag_z: Option<String>,
    flag_P: bool,
}

fn main() -> Result<()> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    run(&args)
}

fn run(args: &Args) -> Result<()> {
    let debug_char = char_option(args.flag_d.as_deref(), b'#');
    let separator = char_option(args.flag_s.as_deref(), b'!');
    if args.flag_e.is_some() && separator.is_some() {
        bail!("cannot specify both -e and -s");
    }

    // Parse the program. In separator mode the rest of the source stream
    // becomes the program's input.
    let mut source_stream: Option<Box<dyn BufRead>> = None;
    let result: ParseResult = if let Some(code) = &args.flag_e {
        parser::parse_str(code, debug_char)
    } else {
        let path = args.arg_source.as_deref().unwrap_or("-");
        let mut reader: Box<dyn BufRead> = if path == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(path)
                .with_context(|| format!("could not open source file `{path}'"))?;
            Box::new(BufReader::new(file))
        };
        let result = parser::parse_reader(&mut *reader, debug_char, separator);
        if separator.is_some() && args.flag_i.is_none() {
            let mut byte = [0u8; 1];
            match reader.read_exact(&mut byte) {
                Ok(()) if Some(byte[0]) == separator => {}
                _ => eprintln!("Warning: missing separator at end of input!"),
            }
            source_stream = Some(reader);
        }
        result
    };

    report_messages(&result);

    let mut nodes = result.nodes;
    if args.flag_O {
        nodes = optimizer::optimize(nodes);
    }

    let mut vm = Vm::new();
    vm.set_wrap_check(args.flag_w);

    if args.flag_p {
        parser::print_code(
            &nodes,
            &mut io::stdout(),
            parser::DEFAULT_LINE_WIDTH,
            debug_char,
        )
        .context("failed to print program")?;
    }

    if args.flag_t {
        vm.load(nodes.clone());
        parser::print_tree(vm.program(), None, &mut io::stdout())
            .context("failed to print program tree")?;
    }

    if args.flag_c {
        let path = args.flag_o.as_deref().unwrap_or("a.out");
        match File::create(path) {
            Err(_) => eprintln!("Could not open object file `{path}'!"),
            Ok(mut file) => {
                vm.load(nodes.clone());
                elf::write_object(&mut file, vm.code_bytes())
                    .with_context(|| format!("failed to write object file `{path}'"))?;
            }
        }
    }

    if args.flag_p || args.flag_t || args.flag_c {
        return Ok(());
    }

    let input: Box<dyn Read> = if let Some(path) = &args.flag_i {
        match File::open(path) {
            Ok(file) => Box::new(file),
            Err(_) => {
                eprintln!("Could not open input file `{path}'!");
                return Ok(());
            }
        }
    } else if let Some(stream) = source_stream {
        stream
    } else {
        Box::new(io::stdin())
    };

    let output: Box<dyn Write> = if let Some(path) = &args.flag_o {
        match File::create(path) {
            Ok(file) => buffered_writer(file, &args.flag_b)?,
            Err(_) => {
                eprintln!("Could not open output file `{path}'!");
                return Ok(());
            }
        }
    } else {
        Box::new(io::stdout())
    };

    if let Some(size) = &args.flag_m {
        vm.set_memory_limit(parse_size(size)?);
    }
    if let Some(byte) = &args.flag_z {
        vm.set_eof_value(parse_byte(byte)?);
    }
    vm.set_profiling(args.flag_P);
    vm.set_input(input);
    vm.set_output(output);
    vm.load(nodes);
    vm.exec();

    if let Some(samples) = vm.take_profile() {
        parser::print_tree(vm.program(), Some(&samples), &mut io::stdout())
            .context("failed to print profile")?;
    }

    Ok(())
}

/// Decode a `-d`/`-s` style option: absent means disabled, an empty
/// argument selects the documented default, anything else contributes its
/// first byte.
fn char_option(flag: Option<&str>, default: u8) -> Option<u8> {
    flag.map(|s| s.bytes().next().unwrap_or(default))
}

fn report_messages(result: &ParseResult) {
    for message in &result.warnings {
        eprintln!(
            "Warning at line {} column {}: {}!",
            message.origin.line, message.origin.column, message.message
        );
    }
    for message in &result.errors {
        eprintln!(
            "Error at line {} column {}: {}!",
            message.origin.line, message.origin.column, message.message
        );
    }
    let (warnings, errors) = (result.warnings.len(), result.errors.len());
    if warnings + errors > 0 {
        eprintln!("{warnings} warnings, {errors} errors in total.");
    }
}

fn buffered_writer(file: File, mode: &str) -> Result<Box<dyn Write>> {
    Ok(match mode {
        "none" => Box::new(file),
        "line" => Box::new(LineWriter::new(file)),
        "full" => Box::new(BufWriter::new(file)),
        other => bail!("unrecognized buffering mode `{other}' (expected none, line or full)"),
    })
}

/// A byte count with an optional K/M/G suffix.
fn parse_size(arg: &str) -> Result<usize> {
    let digits = arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len());
    let value: usize = arg[..digits]
        .parse()
        .with_context(|| format!("invalid memory size `{arg}'"))?;
    let multiplier: usize = match &arg[digits..] {
        "" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        suffix => bail!("unrecognized size suffix `{suffix}'"),
    };
    Ok(value * multiplier)
}

fn parse_byte(arg: &str) -> Result<u8> {
    let value: i64 = arg
        .parse()
        .with_context(|| format!("invalid byte value `{arg}'"))?;
    Ok((value & 0xff) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("2m").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("12X").is_err());
        assert!(parse_size("no-digits").is_err());
    }

    #[test]
    fn byte_values_wrap_to_a_byte() {
        assert_eq!(parse_byte("0").unwrap(), 0);
        assert_eq!(parse_byte("255").unwrap(), 255);
        assert_eq!(parse_byte("256").unwrap(), 0);
        assert_eq!(parse_byte("-1").unwrap(), 255);
        assert!(parse_byte("ten").is_err());
    }

    #[test]
    fn char_options_fall_back_to_their_default() {
        assert_eq!(char_option(None, b'#'), None);
        assert_eq!(char_option(Some(""), b'#'), Some(b'#'));
        assert_eq!(char_option(Some("@"), b'#'), Some(b'@'));
        assert_eq!(char_option(Some("ab"), b'#'), Some(b'a'));
    }
}
