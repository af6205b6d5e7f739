pub mod ast;
mod parse;
mod printer;

pub use self::ast::{
    AddMove, CALL_COUNT, CallType, CellState, CodeSpan, Node, NodeKind, SourceLocation, SrcSpan,
    find_node_at,
};
pub use self::parse::{ParseMessage, ParseResult, parse_path, parse_reader, parse_str};
pub use self::printer::{DEFAULT_LINE_WIDTH, print_code, print_tree};
