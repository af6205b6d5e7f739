use std::fs;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn bfvm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bfvm"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run bfvm")
}

fn bfvm_with_input(args: &[&str], input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_bfvm"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start bfvm");
    child
        .stdin
        .as_mut()
        .expect("stdin is piped")
        .write_all(input)
        .expect("failed to write stdin");
    child.wait_with_output().expect("failed to collect output")
}

fn temp_path(suffix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("/tmp/bfvm_test_{}_{nanos}{suffix}", std::process::id())
}

#[test]
fn help_prints_usage() {
    let output = bfvm(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("bfvm"));
}

#[test]
fn unknown_flags_exit_with_usage() {
    let output = bfvm(&["-X"]);
    assert!(!output.status.success());
}

#[test]
fn runs_hello_world_from_a_file() {
    let output = bfvm(&["tests/programs/hello_world.bf"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello, World!\n");
}

#[test]
fn runs_hello_world_optimized() {
    let output = bfvm(&["-O", "tests/programs/hello_world.bf"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello, World!\n");
}

#[test]
fn inline_source_reads_program_input_from_stdin() {
    let output = bfvm_with_input(&["-e", ",[.,]"], b"abc");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "abc");
}

#[test]
fn missing_source_file_is_fatal() {
    let output = bfvm(&["no_such_program.bf"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no_such_program.bf"));
}

#[test]
fn compact_print_round_trips() {
    let output = bfvm(&["-p", "-e", "+[>+<-]"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "+[>+<-]\n");
}

#[test]
fn optimizer_deletes_a_leading_loop() {
    // The tape starts zeroed, so a loop at the start of the program can
    // never run.
    let output = bfvm(&["-O", "-p", "-e", "[-]"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "");
}

#[test]
fn unmatched_closing_bracket_warns_but_parses() {
    let output = bfvm_with_input(&["-p", "-e", "]+"], b"");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Warning at line 1 column 0: ignored unmatched closing bracket!"));
    assert!(stderr.contains("1 warnings, 0 errors in total."));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "+\n");
}

#[test]
fn separator_splits_source_from_input() {
    let output = bfvm_with_input(&["-s", "!"], b",+.!X");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Y");
}

#[test]
fn missing_separator_is_reported() {
    let output = bfvm_with_input(&["-s", "!"], b"++.");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Warning: missing separator at end of input!"));
}

#[test]
fn tree_print_shows_annotated_nodes() {
    let output = bfvm(&["-t", "-e", "+[-]"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ADD 1 origin=[1:0,1:0]"));
    assert!(stdout.contains("LOOP 0 origin=[1:1,1:3]"));
    assert!(stdout.contains("\tADD -1"));
}

#[test]
fn compiled_object_is_an_elf_relocatable() {
    let path = temp_path(".o");
    let output = bfvm(&["-c", "-o", &path, "-e", "+."]);
    assert!(output.status.success());
    let object = fs::read(&path).expect("object file written");
    fs::remove_file(&path).ok();
    assert_eq!(&object[..4], b"\x7fELF");
    assert_eq!(object[16], 1); // relocatable
    // The symbol table names the entry point.
    assert!(object.windows(7).any(|w| w == b"\0bfmain"));
}

#[test]
fn program_output_can_go_to_a_file() {
    let path = temp_path(".out");
    let output = bfvm(&["-o", &path, "-b", "full", "tests/programs/hello_world.bf"]);
    assert!(output.status.success());
    let content = fs::read_to_string(&path).expect("output file written");
    fs::remove_file(&path).ok();
    assert_eq!(content, "Hello, World!\n");
}

#[test]
fn program_input_can_come_from_a_file() {
    let path = temp_path(".in");
    fs::write(&path, b"hi").unwrap();
    let output = bfvm(&["-i", &path, "-e", ",.,."]);
    fs::remove_file(&path).ok();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hi");
}

#[test]
fn eof_value_flag_overrides_reads_at_end_of_input() {
    let output = bfvm_with_input(&["-z", "65", "-e", ",.,."], b"B");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "BA");
}

#[test]
fn tiny_memory_limit_is_rejected() {
    let output = bfvm(&["-m", "1", "-e", "+."]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("memory limit too small"));
}

#[test]
fn left_bound_violation_reports_and_breaks() {
    // With stdin closed the debugger sees end of input and exits cleanly.
    let output = bfvm_with_input(&["-e", "<"], b"");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("tape head exceeds left bound!"));
}

#[test]
fn debug_character_breaks_into_the_debugger() {
    let output = bfvm_with_input(&["-d", "#", "-e", "+#."], b"quit\n");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Break at source line 1, column 1."));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("(debug) "));
}

#[test]
fn debugger_continue_resumes_execution() {
    let output = bfvm_with_input(&["-d", "#", "-e", "+#."], b"continue\n");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // The break message, then the program's own output (byte 1).
    assert!(stdout.contains("Break at source line 1, column 1."));
    assert!(stdout.as_bytes().contains(&1));
}

#[test]
fn debugger_can_inspect_and_edit_the_tape() {
    // Write 65 into the cell, display it, then continue; the program prints
    // the edited cell.
    let output = bfvm_with_input(
        &["-d", "#", "-e", "#."],
        b"write 65\ndisplay 0 4\ncontinue\n",
    );
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[ 65]"));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains('A'));
}

#[test]
fn wrap_check_breaks_on_wrap_around() {
    let output = bfvm_with_input(&["-w", "-e", "-."], b"quit\n");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cell value wrapped around!"));
}

#[test]
fn profiler_prints_an_annotated_tree() {
    let output = bfvm(&["-P", "-e", "-[-]."]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("samples"));
    assert!(stdout.contains("LOOP"));
}

#[test]
fn rejects_inline_source_with_separator() {
    let output = bfvm(&["-e", "+.", "-s", "!"]);
    assert!(!output.status.success());
}
