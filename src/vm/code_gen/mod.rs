mod x86_64;

use crate::parser::{AddMove, CallType, CellState, CodeSpan, Node, NodeKind};
use crate::vm::code_buf::CodeBuf;

/// Emit the whole program as one function with the signature
/// `(head, callbacks) -> head`, recording each node's code span as it is
/// lowered.
pub fn emit_program(code: &mut CodeBuf, nodes: &mut [Node], page_size: usize, wrap_check: bool) {
    let mut r#gen = CodeGen {
        code,
        page_size,
        wrap_check,
        // The tape starts zeroed and no test has run yet.
        cell: CellState::Zero,
        zf_valid: false,
    };
    r#gen.code.append(x86_64::PROLOGUE);
    r#gen.emit_seq(nodes);
    // Validate the final head position before returning it.
    x86_64::bound_probe(r#gen.code);
    r#gen.code.append(x86_64::EPILOGUE);
}

struct CodeGen<'a> {
    code: &'a mut CodeBuf,
    page_size: usize,
    wrap_check: bool,
    /// Best known value of the cell under the head: non-zero at the start of
    /// every loop body, zero after every loop, unknown after most else.
    cell: CellState,
    /// Whether the processor's zero flag currently reflects `*head`.
    zf_valid: bool,
}

impl CodeGen<'_> {
    fn emit_seq(&mut self, nodes: &mut [Node]) {
        for i in 0..nodes.len() {
            let followed_by_move = nodes
                .get(i + 1)
                .is_some_and(|n| matches!(n.kind, NodeKind::Move(_)));
            let node = &mut nodes[i];
            let begin = self.code.len();

            if matches!(node.kind, NodeKind::Loop(_)) {
                self.emit_loop(node);
            } else {
                match &node.kind {
                    NodeKind::Add(v) => self.emit_add(*v),
                    NodeKind::Move(v) => {
                        if *v != 0 {
                            self.emit_move(*v);
                            // One probing read per run of adjacent moves.
                            if !followed_by_move {
                                x86_64::bound_probe(self.code);
                            }
                            self.cell = CellState::Unknown;
                            self.zf_valid = false;
                        }
                    }
                    NodeKind::Call(call) => self.emit_call(*call),
                    NodeKind::AddMove(am) => self.emit_add_move(am),
                    NodeKind::Loop(_) => unreachable!(),
                }
            }

            nodes[i].code = CodeSpan {
                begin,
                end: self.code.len(),
            };
        }
    }

    /// addb/subb at the head, with an optional carry-checked call to the
    /// wrap callback. A delta of 256 or more always wraps, so its check is
    /// omitted and the callback runs unconditionally.
    fn emit_add(&mut self, value: i32) {
        if value as i8 == 0 {
            return;
        }
        x86_64::add_head(self.code, value);
        self.cell = if self.cell == CellState::Zero {
            CellState::NonZero
        } else {
            CellState::Unknown
        };
        self.zf_valid = true;

        if self.wrap_check {
            let start = self.code.len();
            self.emit_call(CallType::Wrapped);
            if value > -256 && value < 256 {
                let skip = u8::try_from(self.code.len() - start).unwrap();
                self.code.insert(&x86_64::jnc_short(skip), start);
            }
        }
    }

    /// Move the head. Distances beyond one page are taken in page-sized
    /// steps, each followed by a probing read so the right guard page faults
    /// before the head can skip past it.
    fn emit_move(&mut self, mut dist: i32) {
        let page = i32::try_from(self.page_size).unwrap();
        while dist > page {
            x86_64::move_head_long(self.code, page);
            x86_64::bound_probe(self.code);
            dist -= page;
        }
        while dist < -page {
            x86_64::move_head_long(self.code, -page);
            x86_64::bound_probe(self.code);
            dist += page;
        }
        if dist == 0 {
        } else if (-128..128).contains(&dist) {
            x86_64::move_head_short(self.code, dist);
        } else {
            x86_64::move_head_long(self.code, dist);
        }
    }

    fn emit_call(&mut self, call: CallType) {
        x86_64::call_vector(self.code, call as usize);
        self.cell = CellState::Unknown;
        self.zf_valid = false;
    }

    /// Lower a fused node: out-of-place adds first, then the head movement,
    /// then the add at the final head position, so the zero flag ends up
    /// reflecting the cell under the head.
    fn emit_add_move(&mut self, am: &AddMove) {
        let page = i32::try_from(self.page_size).unwrap();
        assert!(
            am.begin >= -page && am.end - 1 <= page,
            "fused node reaches past the guard pages"
        );

        for pos in am.begin..am.end {
            if pos == am.offset || am.delta(pos) == 0 {
                continue;
            }
            if pos == 0 {
                x86_64::add_head_delta(self.code, am.delta(pos));
            } else {
                x86_64::add_at_offset(self.code, pos, am.delta(pos));
            }
        }

        self.emit_move(am.offset);

        if am.delta(am.offset) != 0 {
            x86_64::add_head_delta(self.code, am.delta(am.offset));
            self.zf_valid = true;
        } else {
            self.zf_valid = false;
        }

        if am.offset != 0 {
            self.cell = CellState::Unknown;
        } else if am.delta(0) != 0 {
            self.cell = if self.cell == CellState::Zero {
                CellState::NonZero
            } else {
                CellState::Unknown
            };
        }
        // Otherwise neither the head nor the cell changed.
    }

    /// Lower a loop: emit the body first, measure it, then insert the entry
    /// test in front and append the back branch. Either test drops its
    /// compare when the zero flag is already valid, and disappears entirely
    /// when the dataflow has decided it.
    fn emit_loop(&mut self, node: &mut Node) {
        if self.emit_copy_loop(node) {
            return;
        }

        let prefix_cmp: usize = if self.zf_valid { 0 } else { 3 };
        let gen_prefix = self.cell != CellState::NonZero;
        // Either the prefix uses (but does not change) the zero flag, or it
        // is elided, in which case the body's own leading test is elided by
        // the same reasoning.
        self.zf_valid = true;
        self.cell = CellState::NonZero;

        let start = self.code.len();
        let NodeKind::Loop(children) = &mut node.kind else {
            unreachable!()
        };
        self.emit_seq(children);
        let body_size = self.code.len() - start;

        let suffix_cmp: usize = if self.zf_valid { 0 } else { 3 };
        let gen_suffix = self.cell != CellState::Zero;
        self.cell = CellState::Zero;
        self.zf_valid = true;

        // Both branches jump over the suffix only: forward past it, or back
        // from behind it to the body start. The distances must agree.
        let mut suffix_size = suffix_cmp + if body_size + suffix_cmp + 2 <= 128 { 2 } else { 6 };
        let dist_back = -i32::try_from(body_size + suffix_size).unwrap();
        if !gen_suffix {
            suffix_size = 0;
        }

        let mut prefix_size = prefix_cmp + if body_size + suffix_size + 2 <= 127 { 2 } else { 6 };
        let dist_fwd = i32::try_from(body_size + suffix_size).unwrap();
        if !gen_prefix {
            prefix_size = 0;
        }

        if gen_prefix {
            let prefix =
                x86_64::cond_branch(prefix_cmp != 0, false, dist_fwd, prefix_size - prefix_cmp == 2);
            debug_assert_eq!(prefix.len(), prefix_size);
            self.code.insert(&prefix, start);
            shift_spans(children, prefix_size);
        }
        if gen_suffix {
            let suffix =
                x86_64::cond_branch(suffix_cmp != 0, true, dist_back, suffix_size - suffix_cmp == 2);
            debug_assert_eq!(suffix.len(), suffix_size);
            self.code.append(&suffix);
        }
    }

    /// The copy/multiply rewrite: a loop whose body is one fused node that
    /// does not move the head and steps the current cell by exactly one adds
    /// a constant multiple of the cell to each affected neighbor. The
    /// multiples are built bit-parallel out of a doubling scratch register,
    /// and the loop vanishes.
    ///
    /// When the cell is not known non-zero on entry the whole rewrite is
    /// guarded by a zero test: a skipped loop must not touch the neighbors.
    fn emit_copy_loop(&mut self, node: &mut Node) -> bool {
        let NodeKind::Loop(children) = &mut node.kind else {
            unreachable!()
        };
        if children.len() != 1 {
            return false;
        }
        let am = match &children[0].kind {
            NodeKind::AddMove(am) if am.offset == 0 && matches!(am.delta(0), 1 | -1) => am.clone(),
            _ => return false,
        };

        let mut num_bits = 0u32;
        for pos in am.begin..am.end {
            if pos != 0 {
                let bits = 32 - i32::from(am.delta(pos)).unsigned_abs().leading_zeros();
                num_bits = num_bits.max(bits);
            }
        }

        let needs_check = self.cell != CellState::NonZero;
        let check_cmp = !self.zf_valid;
        let start = self.code.len();

        if num_bits > 0 {
            x86_64::load_scratch(self.code);
            for bit in 0..num_bits {
                if bit > 0 {
                    x86_64::double_scratch(self.code);
                }
                for pos in am.begin..am.end {
                    if pos == 0 {
                        continue;
                    }
                    let multiple = i32::from(am.delta(pos)) / -i32::from(am.delta(0));
                    if multiple >= 0 && multiple & (1 << bit) != 0 {
                        x86_64::add_scratch_at(self.code, pos);
                    } else if multiple < 0 && -multiple & (1 << bit) != 0 {
                        x86_64::sub_scratch_at(self.code, pos);
                    }
                }
            }
        }
        // movb does not touch the flags; a trailing test is unlikely anyway.
        x86_64::clear_head(self.code);

        let mut prefix_size = 0;
        if needs_check {
            let body_size = self.code.len() - start;
            let jump: usize = if body_size + 2 <= 127 { 2 } else { 6 };
            prefix_size = jump + if check_cmp { 3 } else { 0 };
            let prefix = x86_64::cond_branch(
                check_cmp,
                false,
                i32::try_from(body_size).unwrap(),
                jump == 2,
            );
            debug_assert_eq!(prefix.len(), prefix_size);
            self.code.insert(&prefix, start);
        }
        let body_begin = start + prefix_size;
        children[0].code = CodeSpan {
            begin: body_begin,
            end: body_begin,
        };

        self.cell = CellState::Zero;
        self.zf_valid = false;
        true
    }
}

fn shift_spans(nodes: &mut [Node], delta: usize) {
    for node in nodes {
        node.code.begin += delta;
        node.code.end += delta;
        if let NodeKind::Loop(children) = &mut node.kind {
            shift_spans(children, delta);
        }
    }
}
