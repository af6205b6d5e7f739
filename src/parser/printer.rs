use std::io::{self, Write};

use super::ast::{CallType, Node, NodeKind};

pub const DEFAULT_LINE_WIDTH: usize = 80;

/// Print a program back as Brainfuck text, breaking lines at `line_width`
/// characters. Parser output round-trips: the printed text is the source
/// filtered down to its operation characters.
pub fn print_code(
    nodes: &[Node],
    out: &mut dyn Write,
    line_width: usize,
    debug_char: Option<u8>,
) -> io::Result<()> {
    let mut pc = PrintContext {
        out,
        printed: 0,
        line_width,
        debug_char,
    };
    pc.print_nodes(nodes)?;
    if pc.printed % pc.line_width != 0 {
        pc.out.write_all(b"\n")?;
    }
    Ok(())
}

struct PrintContext<'a> {
    out: &'a mut dyn Write,
    printed: usize,
    line_width: usize,
    debug_char: Option<u8>,
}

impl PrintContext<'_> {
    fn put(&mut self, ch: u8) -> io::Result<()> {
        self.out.write_all(&[ch])?;
        self.printed += 1;
        if self.printed % self.line_width == 0 {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn put_add(&mut self, value: i32) -> io::Result<()> {
        for _ in 0..value {
            self.put(b'+')?;
        }
        for _ in value..0 {
            self.put(b'-')?;
        }
        Ok(())
    }

    fn put_move(&mut self, value: i32) -> io::Result<()> {
        for _ in 0..value {
            self.put(b'>')?;
        }
        for _ in value..0 {
            self.put(b'<')?;
        }
        Ok(())
    }

    fn print_nodes(&mut self, nodes: &[Node]) -> io::Result<()> {
        for node in nodes {
            match &node.kind {
                NodeKind::Loop(children) => {
                    self.put(b'[')?;
                    self.print_nodes(children)?;
                    self.put(b']')?;
                }
                NodeKind::Add(v) => self.put_add(*v)?,
                NodeKind::Move(v) => self.put_move(*v)?,
                NodeKind::Call(CallType::Read) => self.put(b',')?,
                NodeKind::Call(CallType::Write) => self.put(b'.')?,
                NodeKind::Call(CallType::Debug) => {
                    if let Some(ch) = self.debug_char {
                        self.put(ch)?;
                    }
                }
                NodeKind::Call(CallType::Wrapped) => {
                    unreachable!("wrap calls are synthesized by the code generator, never parsed")
                }
                // Fused nodes print as an equivalent move/add sequence,
                // walking toward the final head position.
                NodeKind::AddMove(am) => {
                    if am.offset < 0 {
                        self.put_move(am.end - 1)?;
                        for pos in (am.begin + 1..am.end).rev() {
                            self.put_add(i32::from(am.delta(pos)))?;
                            self.put_move(-1)?;
                        }
                        self.put_add(i32::from(am.delta(am.begin)))?;
                        self.put_move(am.offset - am.begin)?;
                    } else {
                        self.put_move(am.begin)?;
                        for pos in am.begin..am.end - 1 {
                            self.put_add(i32::from(am.delta(pos)))?;
                            self.put_move(1)?;
                        }
                        self.put_add(i32::from(am.delta(am.end - 1)))?;
                        self.put_move(am.offset - (am.end - 1))?;
                    }
                }
            }
        }
        Ok(())
    }
}

const fn kind_name(node: &Node) -> &'static str {
    match node.kind {
        NodeKind::Loop(_) => "LOOP",
        NodeKind::Add(_) => "ADD",
        NodeKind::Move(_) => "MOVE",
        NodeKind::Call(_) => "CALL",
        NodeKind::AddMove(_) => "ADD_MOVE",
    }
}

/// Print the program tree, one tab-indented line per node, annotated with
/// source and code spans. With `samples` (a prefix-summed profile), each
/// line also shows the node's inclusive sample count.
pub fn print_tree(
    nodes: &[Node],
    samples: Option<&[usize]>,
    out: &mut dyn Write,
) -> io::Result<()> {
    print_tree_indented(nodes, 0, samples, out)
}

fn print_tree_indented(
    nodes: &[Node],
    depth: usize,
    samples: Option<&[usize]>,
    out: &mut dyn Write,
) -> io::Result<()> {
    for node in nodes {
        for _ in 0..depth {
            out.write_all(b"\t")?;
        }
        write!(
            out,
            "{} {} origin=[{}:{},{}:{}] code=[{:x}h,{:x}h)",
            kind_name(node),
            node.value(),
            node.origin.begin.line,
            node.origin.begin.column,
            node.origin.end.line,
            node.origin.end.column,
            node.code.begin,
            node.code.end,
        )?;
        if let Some(samples) = samples {
            write!(out, " {} samples", samples[node.code.end] - samples[node.code.begin])?;
        }
        writeln!(out)?;
        if let NodeKind::Loop(children) = &node.kind {
            print_tree_indented(children, depth + 1, samples, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::AddMove;
    use crate::parser::parse_str;

    fn print_to_string(nodes: &[Node], width: usize, debug_char: Option<u8>) -> String {
        let mut out = Vec::new();
        print_code(nodes, &mut out, width, debug_char).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn round_trips_parser_output() {
        let source = "++[>,.<-]>>[-]<";
        let result = parse_str(source, None);
        assert_eq!(print_to_string(&result.nodes, 80, None), format!("{source}\n"));
    }

    #[test]
    fn round_trip_filters_comments() {
        let result = parse_str("say + and - twice: +-", None);
        assert_eq!(print_to_string(&result.nodes, 80, None), "+-+-\n");
    }

    #[test]
    fn wraps_at_line_width() {
        let result = parse_str("++++++++", None);
        assert_eq!(print_to_string(&result.nodes, 4, None), "++++\n++++\n");
    }

    #[test]
    fn debug_calls_print_as_the_debug_char() {
        let result = parse_str("+#+", Some(b'#'));
        assert_eq!(print_to_string(&result.nodes, 80, Some(b'#')), "+#+\n");
        // Without a configured character the call is omitted.
        assert_eq!(print_to_string(&result.nodes, 80, None), "++\n");
    }

    #[test]
    fn add_move_prints_as_an_equivalent_sequence() {
        let am = AddMove::new(1, -1, 2, vec![2, -1, 3]);
        let node = Node::new(
            NodeKind::AddMove(am),
            crate::parser::ast::SrcSpan::at(crate::parser::ast::SourceLocation::new(1, 0)),
        );
        assert_eq!(print_to_string(&[node], 80, None), "<++>->+++\n");
    }

    #[test]
    fn add_move_with_negative_offset_walks_backwards() {
        let am = AddMove::new(-1, -1, 2, vec![2, -1, 3]);
        let node = Node::new(
            NodeKind::AddMove(am),
            crate::parser::ast::SrcSpan::at(crate::parser::ast::SourceLocation::new(1, 0)),
        );
        // Move to the rightmost cell, add walking left, then to the offset.
        assert_eq!(print_to_string(&[node], 80, None), ">+++<-<++\n");
    }
}
