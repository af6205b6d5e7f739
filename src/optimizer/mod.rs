use std::mem;

use crate::parser::{AddMove, CellState, Node, NodeKind, SrcSpan};

/// Rewrite a program tree into a denser form that admits better code
/// generation. Three passes: coalesce and prune with a cell-state dataflow,
/// drop the unobservable tail, then fuse add/move runs into single nodes.
///
/// Optimizing an already-optimized tree is a no-op.
pub fn optimize(mut nodes: Vec<Node>) -> Vec<Node> {
    pass1(&mut nodes, CellState::Zero);
    pass2(&mut nodes);
    pass3(&mut nodes);
    nodes
}

/// Coalesce adjacent adds and moves, canonicalize add deltas to a signed
/// byte, and discard loops that can never be entered. The abstract cell
/// state threads through the walk: loops begin with a non-zero cell and
/// leave a zero one behind.
///
/// Returns the cell state after the sequence. A loop that is entered with a
/// known non-zero cell and whose body provably keeps it non-zero never
/// terminates; everything after it is dropped.
fn pass1(nodes: &mut Vec<Node>, mut cell: CellState) -> CellState {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    let mut input = mem::take(nodes).into_iter().peekable();

    while let Some(node) = input.next() {
        let Node { kind, mut origin, code } = node;
        match kind {
            NodeKind::Add(first) => {
                let mut value = first;
                while let Some(next) = input.peek() {
                    if let NodeKind::Add(v) = next.kind {
                        value += v;
                        origin.end = next.origin.end;
                        input.next();
                    } else {
                        break;
                    }
                }
                // Cell arithmetic is modulo 256; fold the sum down to a
                // signed byte before testing for a no-op.
                value = i32::from(value as i8);
                if value != 0 {
                    cell = if cell == CellState::Zero {
                        CellState::NonZero
                    } else {
                        // Adding to an unknown or non-zero cell may wrap to 0.
                        CellState::Unknown
                    };
                    out.push(Node { kind: NodeKind::Add(value), origin, code });
                }
            }
            NodeKind::Move(first) => {
                let mut value = first;
                while let Some(next) = input.peek() {
                    if let NodeKind::Move(v) = next.kind {
                        value += v;
                        origin.end = next.origin.end;
                        input.next();
                    } else {
                        break;
                    }
                }
                if value != 0 {
                    cell = CellState::Unknown;
                    out.push(Node { kind: NodeKind::Move(value), origin, code });
                }
            }
            NodeKind::Call(call) => {
                cell = CellState::Unknown;
                out.push(Node { kind: NodeKind::Call(call), origin, code });
            }
            NodeKind::AddMove(am) => {
                cell = CellState::Unknown;
                out.push(Node { kind: NodeKind::AddMove(am), origin, code });
            }
            NodeKind::Loop(mut children) => {
                if cell == CellState::Zero {
                    // Never entered: at the start of the program or right
                    // after another loop.
                    continue;
                }
                let body_state = pass1(&mut children, CellState::NonZero);
                let never_exits = cell == CellState::NonZero && body_state == CellState::NonZero;
                cell = CellState::Zero;
                out.push(Node { kind: NodeKind::Loop(children), origin, code });
                if never_exits {
                    break;
                }
            }
        }
    }

    *nodes = out;
    cell
}

/// Everything after the last loop or call in the root list is unobservable.
fn pass2(nodes: &mut Vec<Node>) {
    let keep = nodes
        .iter()
        .rposition(|n| matches!(n.kind, NodeKind::Loop(_) | NodeKind::Call(_)))
        .map_or(0, |i| i + 1);
    nodes.truncate(keep);
}

/// Replace every maximal run of add/move nodes with a single fused node.
/// Uniformly general instructions turn out to be easier to lower well than
/// special-casing short runs.
fn pass3(nodes: &mut Vec<Node>) {
    let mut out = Vec::with_capacity(nodes.len());
    let mut run: Vec<Node> = Vec::new();

    for mut node in mem::take(nodes) {
        match node.kind {
            NodeKind::Add(_) | NodeKind::Move(_) => run.push(node),
            _ => {
                if !run.is_empty() {
                    out.push(collapse_run(mem::take(&mut run)));
                }
                if let NodeKind::Loop(children) = &mut node.kind {
                    pass3(children);
                }
                out.push(node);
            }
        }
    }
    if !run.is_empty() {
        out.push(collapse_run(run));
    }

    *nodes = out;
}

/// Collapse a run of add/move nodes into one fused node by replaying the
/// head movement, then shrink the range to the minimum that still covers the
/// start position, the final position and every non-zero delta.
fn collapse_run(run: Vec<Node>) -> Node {
    let (mut begin, mut end, mut pos) = (0i32, 1i32, 0i32);
    for node in &run {
        if let NodeKind::Move(v) = node.kind {
            pos += v;
            if pos >= end {
                end = pos + 1;
            } else if pos < begin {
                begin = pos;
            }
        }
    }

    let mut add = vec![0i8; usize::try_from(end - begin).unwrap()];
    pos = 0;
    for node in &run {
        match node.kind {
            NodeKind::Move(v) => pos += v,
            NodeKind::Add(v) => {
                let slot = &mut add[usize::try_from(pos - begin).unwrap()];
                *slot = slot.wrapping_add(v as i8);
            }
            _ => unreachable!("only add/move nodes are collapsed"),
        }
    }
    let offset = pos;

    let delta_at = |p: i32| add[usize::try_from(p - begin).unwrap()];
    let mut new_begin = begin;
    while new_begin < 0 && new_begin < offset && delta_at(new_begin) == 0 {
        new_begin += 1;
    }
    let mut new_end = end;
    while new_end > 1 && new_end - 1 > offset && delta_at(new_end - 1) == 0 {
        new_end -= 1;
    }
    let trimmed: Vec<i8> = (new_begin..new_end).map(delta_at).collect();

    let origin = SrcSpan {
        begin: run.first().unwrap().origin.begin,
        end: run.last().unwrap().origin.end,
    };
    Node::new(
        NodeKind::AddMove(AddMove::new(offset, new_begin, new_end, trimmed)),
        origin,
    )
}
