use std::fs::File;
use std::io::{BufRead, BufReader};

use super::ast::{CallType, Node, NodeKind, SourceLocation, SrcSpan};

/// A diagnostic produced while parsing, tagged with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessage {
    pub origin: SourceLocation,
    pub message: String,
}

/// The outcome of a parse: the tree plus warning and error lists.
///
/// The parser never aborts on malformed input. When errors are present the
/// tree may be incomplete.
#[derive(Debug)]
pub struct ParseResult {
    pub nodes: Vec<Node>,
    pub warnings: Vec<ParseMessage>,
    pub errors: Vec<ParseMessage>,
}

/// Parse a source string. `debug_char` is an optional byte recognized as a
/// call to the debug handler.
pub fn parse_str(source: &str, debug_char: Option<u8>) -> ParseResult {
    let mut bytes = source.as_bytes();
    parse_reader(&mut bytes, debug_char, None)
}

/// Parse program source from a buffered reader.
///
/// When `separator` is given, parsing stops at the first occurrence of that
/// byte, which is left unconsumed so the caller can verify it and hand the
/// remainder of the stream to the program as its input.
pub fn parse_reader(
    input: &mut dyn BufRead,
    debug_char: Option<u8>,
    separator: Option<u8>,
) -> ParseResult {
    let mut parser = Parser {
        input,
        debug_char,
        separator,
        line: 1,
        column: 0,
        last: SourceLocation::new(1, 0),
        warnings: Vec::new(),
        errors: Vec::new(),
    };
    let nodes = parser.parse_nodes(0);
    ParseResult {
        nodes,
        warnings: parser.warnings,
        errors: parser.errors,
    }
}

/// Parse the file at `path`. A file that cannot be opened yields a result
/// with an error message rather than a panic, matching the parse contract.
pub fn parse_path(path: &str, debug_char: Option<u8>) -> ParseResult {
    match File::open(path) {
        Ok(file) => parse_reader(&mut BufReader::new(file), debug_char, None),
        Err(_) => ParseResult {
            nodes: Vec::new(),
            warnings: Vec::new(),
            errors: vec![ParseMessage {
                origin: SourceLocation::new(0, 0),
                message: "failed to open input file".to_string(),
            }],
        },
    }
}

struct Parser<'a> {
    input: &'a mut dyn BufRead,
    debug_char: Option<u8>,
    separator: Option<u8>,
    /// 1-based line of the next byte.
    line: u32,
    /// 0-based column of the next byte.
    column: u32,
    /// Location of the most recently consumed byte.
    last: SourceLocation,
    warnings: Vec<ParseMessage>,
    errors: Vec<ParseMessage>,
}

impl Parser<'_> {
    /// The intentionally non-optimizing recursive descent. Each significant
    /// character contributes to exactly one node (with same-sign run
    /// coalescing for add/move), so printing the tree reproduces the source
    /// and diagnostics point at exact characters.
    fn parse_nodes(&mut self, depth: u32) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut run: Option<Node> = None;

        loop {
            let Some((byte, loc)) = self.next_byte() else {
                if depth > 0 {
                    self.warn(
                        SourceLocation::new(self.line, self.column),
                        "closed unmatched opening bracket",
                    );
                }
                flush_run(&mut run, &mut nodes);
                return nodes;
            };

            match byte {
                b'[' => {
                    flush_run(&mut run, &mut nodes);
                    let children = self.parse_nodes(depth + 1);
                    nodes.push(Node::new(
                        NodeKind::Loop(children),
                        SrcSpan {
                            begin: loc,
                            end: self.last,
                        },
                    ));
                }
                b']' => {
                    if depth > 0 {
                        flush_run(&mut run, &mut nodes);
                        return nodes;
                    }
                    self.warn(loc, "ignored unmatched closing bracket");
                }
                b'+' => extend_run(&mut run, &mut nodes, loc, true, 1),
                b'-' => extend_run(&mut run, &mut nodes, loc, true, -1),
                b'>' => extend_run(&mut run, &mut nodes, loc, false, 1),
                b'<' => extend_run(&mut run, &mut nodes, loc, false, -1),
                b',' => {
                    flush_run(&mut run, &mut nodes);
                    nodes.push(Node::new(NodeKind::Call(CallType::Read), SrcSpan::at(loc)));
                }
                b'.' => {
                    flush_run(&mut run, &mut nodes);
                    nodes.push(Node::new(NodeKind::Call(CallType::Write), SrcSpan::at(loc)));
                }
                b'\n' => continue,
                _ => {}
            }

            // The debug character may shadow an operation character, in which
            // case both effects apply.
            if self.debug_char == Some(byte) {
                flush_run(&mut run, &mut nodes);
                nodes.push(Node::new(NodeKind::Call(CallType::Debug), SrcSpan::at(loc)));
            }
        }
    }

    /// Consume and locate the next byte. Returns `None` at end of input, on a
    /// read error (recorded as a parse error) or at the configured separator,
    /// which is left unread.
    fn next_byte(&mut self) -> Option<(u8, SourceLocation)> {
        let next = loop {
            match self.input.fill_buf().map(|buf| buf.first().copied()) {
                Ok(next) => break next,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.errors.push(ParseMessage {
                        origin: SourceLocation::new(self.line, self.column),
                        message: format!("read error: {err}"),
                    });
                    return None;
                }
            }
        };
        let byte = next?;
        if self.separator == Some(byte) {
            return None;
        }
        self.input.consume(1);

        let loc = SourceLocation::new(self.line, self.column);
        self.last = loc;
        if byte == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some((byte, loc))
    }

    fn warn(&mut self, origin: SourceLocation, message: &str) {
        self.warnings.push(ParseMessage {
            origin,
            message: message.to_string(),
        });
    }
}

/// Fold one `+`/`-`/`>`/`<` into the open run, or start a new run. A sign
/// change closes the current node so the printed form round-trips exactly.
fn extend_run(run: &mut Option<Node>, nodes: &mut Vec<Node>, loc: SourceLocation, is_add: bool, step: i32) {
    let continues = match run {
        Some(node) => match (&node.kind, is_add) {
            (NodeKind::Add(v), true) | (NodeKind::Move(v), false) => {
                if step > 0 { *v >= 0 } else { *v <= 0 }
            }
            _ => false,
        },
        None => false,
    };

    if !continues {
        flush_run(run, nodes);
        let kind = if is_add { NodeKind::Add(0) } else { NodeKind::Move(0) };
        *run = Some(Node::new(kind, SrcSpan::at(loc)));
    }

    let node = run.as_mut().unwrap();
    match &mut node.kind {
        NodeKind::Add(v) | NodeKind::Move(v) => *v += step,
        _ => unreachable!(),
    }
    node.origin.end = loc;
}

fn flush_run(run: &mut Option<Node>, nodes: &mut Vec<Node>) {
    if let Some(node) = run.take() {
        nodes.push(node);
    }
}
