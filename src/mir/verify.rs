use crate::mir::*;
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug)]
pub enum VerifyError {
    BadValue(ValueId),
    BadBlock(BlockId),
    BadOperand {
        user: ValueId,
        operand: ValueId,
    },
    DetachedOperand {
        block: BlockId,
        value: ValueId,
    },
    MisplacedValue {
        block: BlockId,
        value: ValueId,
    },
    FloatingInBlock {
        block: BlockId,
        value: ValueId,
    },
    PhiNotAtStart {
        block: BlockId,
        value: ValueId,
    },
    InvalidPhiArgs {
        phi_val: ValueId,
        expected: usize,
        got: usize,
    },
    InvalidPhiSource {
        phi_val: ValueId,
        block: BlockId,
    },
    BadLayout(BlockId),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadValue(v) => write!(f, "Invalid ValueId: {}", v),
            VerifyError::BadBlock(b) => write!(f, "Invalid BlockId: {}", b),
            VerifyError::BadOperand { user, operand } => {
                write!(f, "Value {} has invalid operand {}", user, operand)
            }
            VerifyError::DetachedOperand { block, value } => {
                write!(f, "Block {} uses erased value {}", block, value)
            }
            VerifyError::MisplacedValue { block, value } => write!(
                f,
                "Value {} is listed in block {} but records another parent",
                value, block
            ),
            VerifyError::FloatingInBlock { block, value } => {
                write!(f, "Floating value {} is placed in block {}", value, block)
            }
            VerifyError::PhiNotAtStart { block, value } => {
                write!(f, "Phi {} is not grouped at the start of block {}", value, block)
            }
            VerifyError::InvalidPhiArgs {
                phi_val,
                expected,
                got,
            } => write!(
                f,
                "Phi {} has wrong arg count. Expected {}, got {}",
                phi_val, expected, got
            ),
            VerifyError::InvalidPhiSource { phi_val, block } => write!(
                f,
                "Phi {} references invalid predecessor block {}",
                phi_val, block
            ),
            VerifyError::BadLayout(b) => write!(f, "Block {} is missing from or repeated in the layout", b),
        }
    }
}

pub fn verify(fn_ir: &FnIR) -> Result<(), VerifyError> {
    verify_ir(fn_ir)
}

pub fn verify_ir(fn_ir: &FnIR) -> Result<(), VerifyError> {
    check_blk(fn_ir, fn_ir.entry)?;

    // 1. Layout lists every block exactly once
    let mut seen = FxHashSet::default();
    for &bb in &fn_ir.layout {
        check_blk(fn_ir, bb)?;
        if !seen.insert(bb) {
            return Err(VerifyError::BadLayout(bb));
        }
    }
    if seen.len() != fn_ir.blocks.len() {
        let missing = (0..fn_ir.blocks.len()).find(|b| !seen.contains(b));
        return Err(VerifyError::BadLayout(missing.unwrap_or(0)));
    }

    let reachable: FxHashSet<BlockId> = fn_ir.reverse_post_order().into_iter().collect();
    let preds = build_pred_map(fn_ir);

    // 2. Placement and operands
    for (bid, blk) in fn_ir.blocks.iter().enumerate() {
        if blk.id != bid {
            return Err(VerifyError::BadBlock(bid));
        }
        let mut past_phis = false;
        for &inst in &blk.insts {
            check_val(fn_ir, inst)?;
            let val = &fn_ir.values[inst];
            if val.id != inst {
                return Err(VerifyError::BadValue(inst));
            }
            if val.kind.is_floating() {
                return Err(VerifyError::FloatingInBlock {
                    block: bid,
                    value: inst,
                });
            }
            if val.block != Some(bid) {
                return Err(VerifyError::MisplacedValue {
                    block: bid,
                    value: inst,
                });
            }
            if val.kind.is_phi() {
                if past_phis {
                    return Err(VerifyError::PhiNotAtStart {
                        block: bid,
                        value: inst,
                    });
                }
            } else {
                past_phis = true;
            }
            for op in val.kind.operands() {
                if op >= fn_ir.values.len() {
                    return Err(VerifyError::BadOperand {
                        user: inst,
                        operand: op,
                    });
                }
                if fn_ir.is_detached(op) {
                    return Err(VerifyError::DetachedOperand {
                        block: bid,
                        value: op,
                    });
                }
            }
            if let ValueKind::Phi { args } = &val.kind {
                if !reachable.contains(&bid) {
                    continue;
                }
                let block_preds = preds.get(&bid).cloned().unwrap_or_default();
                let mut sources = FxHashSet::default();
                for (_, b) in args {
                    check_blk(fn_ir, *b)?;
                    if !block_preds.contains(b) || !sources.insert(*b) {
                        return Err(VerifyError::InvalidPhiSource {
                            phi_val: inst,
                            block: *b,
                        });
                    }
                }
                if args.len() != block_preds.len() {
                    return Err(VerifyError::InvalidPhiArgs {
                        phi_val: inst,
                        expected: block_preds.len(),
                        got: args.len(),
                    });
                }
            }
        }

        for succ in blk.term.successors() {
            check_blk(fn_ir, succ)?;
        }
        if let Some(v) = blk.term.operand() {
            check_val(fn_ir, v)?;
            if fn_ir.is_detached(v) {
                return Err(VerifyError::DetachedOperand {
                    block: bid,
                    value: v,
                });
            }
        }
    }

    Ok(())
}

fn check_val(fn_ir: &FnIR, vid: ValueId) -> Result<(), VerifyError> {
    if vid >= fn_ir.values.len() {
        Err(VerifyError::BadValue(vid))
    } else {
        Ok(())
    }
}

fn check_blk(fn_ir: &FnIR, bid: BlockId) -> Result<(), VerifyError> {
    if bid >= fn_ir.blocks.len() {
        Err(VerifyError::BadBlock(bid))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_use_of_erased_value() {
        let mut f = FnIR::new("erased");
        let a = f.add_block("a");
        f.entry = a;
        let p = f.param(0, false, "p");
        let ld = f.push_inst(a, ValueKind::Load { ptr: p }, None);
        f.set_term(a, Terminator::Return(Some(ld)));
        assert!(verify_ir(&f).is_ok());
        f.erase_inst(ld);
        assert!(matches!(
            verify_ir(&f),
            Err(VerifyError::DetachedOperand { .. })
        ));
    }

    #[test]
    fn rejects_phi_with_missing_predecessor() {
        let mut f = FnIR::new("phi");
        let a = f.add_block("a");
        let b = f.add_block("b");
        let c = f.add_block("c");
        f.entry = a;
        let p = f.param(0, false, "p");
        let phi = f.push_inst(
            c,
            ValueKind::Phi {
                args: vec![(p, a)],
            },
            None,
        );
        f.set_term(
            a,
            Terminator::If {
                cond: p,
                then_bb: b,
                else_bb: c,
            },
        );
        f.set_term(b, Terminator::Goto(c));
        f.set_term(c, Terminator::Return(Some(phi)));
        assert!(matches!(
            verify_ir(&f),
            Err(VerifyError::InvalidPhiArgs {
                expected: 2,
                got: 1,
                ..
            })
        ));
    }
}
