use crate::mir::opt::dom::DomTree;
use crate::mir::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

pub type LoopId = usize;

#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub header: BlockId,
    pub blocks: Vec<BlockId>, // header first, then reverse post-order
    block_set: FxHashSet<BlockId>,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
}

impl Loop {
    pub fn contains(&self, bb: BlockId) -> bool {
        self.block_set.contains(&bb)
    }
}

/// The loop-nest forest of one function.
///
/// Loops live in an arena; parent/child links and the block-to-innermost-loop
/// map are plain handle maps so cloning can re-bind them freely.
#[derive(Debug, Clone, Default)]
pub struct LoopNest {
    loops: Vec<Loop>,
    top_level: Vec<LoopId>,
    innermost: FxHashMap<BlockId, LoopId>,
}

#[derive(Debug)]
pub enum LoopVerifyError {
    LoopCount {
        expected: usize,
        got: usize,
    },
    MissingLoop {
        header: BlockId,
    },
    Blocks {
        header: BlockId,
    },
    Parent {
        header: BlockId,
    },
    Innermost {
        block: BlockId,
    },
}

impl fmt::Display for LoopVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopVerifyError::LoopCount { expected, got } => {
                write!(f, "expected {} loops, found {}", expected, got)
            }
            LoopVerifyError::MissingLoop { header } => {
                write!(f, "no loop recorded for header {}", header)
            }
            LoopVerifyError::Blocks { header } => {
                write!(f, "loop at header {} has the wrong block set", header)
            }
            LoopVerifyError::Parent { header } => {
                write!(f, "loop at header {} has the wrong parent", header)
            }
            LoopVerifyError::Innermost { block } => {
                write!(f, "block {} is attached to the wrong innermost loop", block)
            }
        }
    }
}

impl LoopNest {
    pub fn analyze(fn_ir: &FnIR, dom: &DomTree) -> Self {
        let rpo = fn_ir.reverse_post_order();
        let rpo_index: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let preds = build_pred_map(fn_ir);

        // 1. Back-edges src -> dst where dst dominates src. dst is the header.
        let mut headers: Vec<BlockId> = Vec::new();
        let mut latches: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &src in &rpo {
            for dst in fn_ir.successors(src) {
                if dom.dominates(dst, src) {
                    if !latches.contains_key(&dst) {
                        headers.push(dst);
                    }
                    latches.entry(dst).or_default().push(src);
                }
            }
        }
        headers.sort_by_key(|h| rpo_index[h]);

        let mut nest = LoopNest::default();
        for header in headers {
            // 2. Natural loop body: reach backwards from the latches to the header.
            let mut body = FxHashSet::default();
            body.insert(header);
            let mut stack: Vec<BlockId> = latches[&header].clone();
            while let Some(node) = stack.pop() {
                if !rpo_index.contains_key(&node) || !body.insert(node) {
                    continue;
                }
                if let Some(node_preds) = preds.get(&node) {
                    stack.extend(node_preds.iter().copied().filter(|p| !body.contains(p)));
                }
            }
            let mut blocks: Vec<BlockId> = body.iter().copied().collect();
            blocks.sort_by_key(|b| rpo_index[b]);

            let id = nest.loops.len();
            nest.loops.push(Loop {
                id,
                header,
                blocks,
                block_set: body,
                parent: None,
                children: Vec::new(),
            });
        }

        // 3. Nesting: the parent is the smallest earlier loop holding our header.
        for id in 0..nest.loops.len() {
            let header = nest.loops[id].header;
            let parent = (0..id)
                .filter(|&p| nest.loops[p].contains(header))
                .min_by_key(|&p| nest.loops[p].blocks.len());
            nest.loops[id].parent = parent;
            match parent {
                Some(p) => nest.loops[p].children.push(id),
                None => nest.top_level.push(id),
            }
        }

        // 4. Innermost loop per block.
        for lp in &nest.loops {
            for &bb in &lp.blocks {
                let replace = match nest.innermost.get(&bb) {
                    Some(&cur) => nest.loops[cur].blocks.len() > lp.blocks.len(),
                    None => true,
                };
                if replace {
                    nest.innermost.insert(bb, lp.id);
                }
            }
        }
        nest
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn header(&self, lp: LoopId) -> BlockId {
        self.loops[lp].header
    }

    pub fn blocks(&self, lp: LoopId) -> &[BlockId] {
        &self.loops[lp].blocks
    }

    pub fn parent(&self, lp: LoopId) -> Option<LoopId> {
        self.loops[lp].parent
    }

    pub fn contains(&self, lp: LoopId, bb: BlockId) -> bool {
        self.loops[lp].contains(bb)
    }

    pub fn loop_for(&self, bb: BlockId) -> Option<LoopId> {
        self.innermost.get(&bb).copied()
    }

    pub fn is_innermost(&self, lp: LoopId) -> bool {
        self.loops[lp].children.is_empty()
    }

    pub fn depth(&self, lp: LoopId) -> usize {
        let mut d = 1;
        let mut cur = self.loops[lp].parent;
        while let Some(p) = cur {
            d += 1;
            cur = self.loops[p].parent;
        }
        d
    }

    /// Innermost loops in depth-first preorder of the forest.
    pub fn innermost_loops(&self) -> Vec<LoopId> {
        let mut out = Vec::new();
        let mut stack: Vec<LoopId> = self.top_level.iter().rev().copied().collect();
        while let Some(lp) = stack.pop() {
            if self.is_innermost(lp) {
                out.push(lp);
            }
            stack.extend(self.loops[lp].children.iter().rev().copied());
        }
        out
    }

    /// The unique out-of-loop predecessor of the header, if it only branches to the header.
    pub fn preheader(&self, fn_ir: &FnIR, lp: LoopId) -> Option<BlockId> {
        let header = self.header(lp);
        let outside: Vec<BlockId> = fn_ir
            .predecessors(header)
            .into_iter()
            .filter(|p| !self.contains(lp, *p))
            .collect();
        match outside.as_slice() {
            [ph] if fn_ir.successors(*ph).as_slice() == [header] => Some(*ph),
            _ => None,
        }
    }

    pub fn latch(&self, fn_ir: &FnIR, lp: LoopId) -> Option<BlockId> {
        let inside: Vec<BlockId> = fn_ir
            .predecessors(self.header(lp))
            .into_iter()
            .filter(|p| self.contains(lp, *p))
            .collect();
        match inside.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    pub fn exiting_blocks(&self, fn_ir: &FnIR, lp: LoopId) -> Vec<BlockId> {
        self.blocks(lp)
            .iter()
            .copied()
            .filter(|&b| fn_ir.successors(b).iter().any(|s| !self.contains(lp, *s)))
            .collect()
    }

    pub fn exiting_block(&self, fn_ir: &FnIR, lp: LoopId) -> Option<BlockId> {
        match self.exiting_blocks(fn_ir, lp).as_slice() {
            [b] => Some(*b),
            _ => None,
        }
    }

    /// Targets of every exit edge, one entry per edge.
    pub fn exit_edges(&self, fn_ir: &FnIR, lp: LoopId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &b in self.blocks(lp) {
            for s in fn_ir.successors(b) {
                if !self.contains(lp, s) {
                    out.push(s);
                }
            }
        }
        out
    }

    /// The exit block, if every exit edge leads to the same block.
    pub fn exit_block(&self, fn_ir: &FnIR, lp: LoopId) -> Option<BlockId> {
        let edges = self.exit_edges(fn_ir, lp);
        let (&first, rest) = edges.split_first()?;
        rest.iter().all(|&e| e == first).then_some(first)
    }

    /// Whether `bb` only runs on some iterations, i.e. it does not dominate the latch.
    pub fn block_needs_predication(
        &self,
        fn_ir: &FnIR,
        dom: &DomTree,
        lp: LoopId,
        bb: BlockId,
    ) -> bool {
        match self.latch(fn_ir, lp) {
            Some(latch) => !dom.dominates(bb, latch),
            None => true,
        }
    }

    pub fn add_loop(&mut self, parent: Option<LoopId>, header: BlockId) -> LoopId {
        let id = self.loops.len();
        self.loops.push(Loop {
            id,
            header,
            blocks: Vec::new(),
            block_set: FxHashSet::default(),
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.loops[p].children.push(id),
            None => self.top_level.push(id),
        }
        id
    }

    pub fn set_header(&mut self, lp: LoopId, header: BlockId) {
        self.loops[lp].header = header;
    }

    /// Adds `bb` to `lp` and every enclosing loop, making `lp` its innermost loop.
    pub fn add_block_to_loop(&mut self, bb: BlockId, lp: LoopId) {
        self.innermost.insert(bb, lp);
        let mut cur = Some(lp);
        while let Some(l) = cur {
            let node = &mut self.loops[l];
            if node.block_set.insert(bb) {
                node.blocks.push(bb);
            }
            cur = node.parent;
        }
    }

    pub fn verify(&self, fn_ir: &FnIR, dom: &DomTree) -> Result<(), LoopVerifyError> {
        let fresh = LoopNest::analyze(fn_ir, dom);
        if fresh.loops.len() != self.loops.len() {
            return Err(LoopVerifyError::LoopCount {
                expected: fresh.loops.len(),
                got: self.loops.len(),
            });
        }
        let by_header: FxHashMap<BlockId, LoopId> =
            self.loops.iter().map(|l| (l.header, l.id)).collect();
        for expected in &fresh.loops {
            let Some(&ours) = by_header.get(&expected.header) else {
                return Err(LoopVerifyError::MissingLoop {
                    header: expected.header,
                });
            };
            if self.loops[ours].block_set != expected.block_set {
                return Err(LoopVerifyError::Blocks {
                    header: expected.header,
                });
            }
            let want_parent = expected.parent.map(|p| fresh.loops[p].header);
            let got_parent = self.loops[ours].parent.map(|p| self.loops[p].header);
            if want_parent != got_parent {
                return Err(LoopVerifyError::Parent {
                    header: expected.header,
                });
            }
        }
        for (&bb, &lp) in &fresh.innermost {
            let ours = self.innermost.get(&bb).map(|&l| self.loops[l].header);
            if ours != Some(fresh.loops[lp].header) {
                return Err(LoopVerifyError::Innermost { block: bb });
            }
        }
        if self.innermost.len() != fresh.innermost.len() {
            let stray = self
                .innermost
                .keys()
                .copied()
                .find(|b| !fresh.innermost.contains_key(b))
                .unwrap_or(fn_ir.entry);
            return Err(LoopVerifyError::Innermost { block: stray });
        }
        Ok(())
    }
}
