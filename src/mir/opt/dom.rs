use crate::mir::*;
use rustc_hash::FxHashMap;
use std::fmt;

/// Immediate-dominator tree over the blocks reachable from the entry.
///
/// Built once per function and then updated in place as blocks are added;
/// `verify` recomputes from scratch and compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomTree {
    root: BlockId,
    idom: FxHashMap<BlockId, BlockId>,
}

#[derive(Debug)]
pub enum DomVerifyError {
    Missing(BlockId),
    Stale(BlockId),
    WrongIdom {
        block: BlockId,
        expected: BlockId,
        got: BlockId,
    },
}

impl fmt::Display for DomVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomVerifyError::Missing(b) => write!(f, "block {} is reachable but has no dominator", b),
            DomVerifyError::Stale(b) => write!(f, "block {} is unreachable but still in the tree", b),
            DomVerifyError::WrongIdom {
                block,
                expected,
                got,
            } => write!(
                f,
                "block {} has idom {} but the CFG says {}",
                block, got, expected
            ),
        }
    }
}

impl DomTree {
    pub fn compute(fn_ir: &FnIR) -> Self {
        // Iterative RPO formulation (Cooper, Harvey, Kennedy).
        let rpo = fn_ir.reverse_post_order();
        let mut order: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, &b) in rpo.iter().enumerate() {
            order.insert(b, i);
        }
        let preds = build_pred_map(fn_ir);

        let mut idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        idom.insert(fn_ir.entry, fn_ir.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in preds.get(&bb).map(Vec::as_slice).unwrap_or(&[]) {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &order, p, cur),
                    });
                }
                if let Some(d) = new_idom {
                    if idom.get(&bb) != Some(&d) {
                        idom.insert(bb, d);
                        changed = true;
                    }
                }
            }
        }

        idom.remove(&fn_ir.entry);
        Self {
            root: fn_ir.entry,
            idom,
        }
    }

    pub fn contains(&self, bb: BlockId) -> bool {
        bb == self.root || self.idom.contains_key(&bb)
    }

    pub fn idom(&self, bb: BlockId) -> Option<BlockId> {
        self.idom.get(&bb).copied()
    }

    /// Blocks whose immediate dominator is `bb`, in block order.
    pub fn children(&self, bb: BlockId) -> Vec<BlockId> {
        let mut out: Vec<BlockId> = self
            .idom
            .iter()
            .filter(|&(_, &d)| d == bb)
            .map(|(&b, _)| b)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.contains(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(up) => cur = up,
                None => return false,
            }
        }
    }

    pub fn add_new_block(&mut self, bb: BlockId, idom: BlockId) {
        debug_assert!(!self.contains(bb), "block already in dominator tree");
        self.idom.insert(bb, idom);
    }

    pub fn change_idom(&mut self, bb: BlockId, idom: BlockId) {
        debug_assert!(self.contains(bb), "block not in dominator tree");
        self.idom.insert(bb, idom);
    }

    pub fn verify(&self, fn_ir: &FnIR) -> Result<(), DomVerifyError> {
        let fresh = DomTree::compute(fn_ir);
        for (&bb, &expected) in &fresh.idom {
            match self.idom.get(&bb) {
                None => return Err(DomVerifyError::Missing(bb)),
                Some(&got) if got != expected => {
                    return Err(DomVerifyError::WrongIdom {
                        block: bb,
                        expected,
                        got,
                    });
                }
                _ => {}
            }
        }
        for &bb in self.idom.keys() {
            if !fresh.idom.contains_key(&bb) {
                return Err(DomVerifyError::Stale(bb));
            }
        }
        Ok(())
    }
}

fn intersect(
    idom: &FxHashMap<BlockId, BlockId>,
    order: &FxHashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while order[&a] > order[&b] {
            a = idom[&a];
        }
        while order[&b] > order[&a] {
            b = idom[&b];
        }
    }
    a
}
