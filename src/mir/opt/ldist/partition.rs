use crate::bail;
use crate::error::{LD, LDCode, Stage};
use crate::mir::analyze::access::LoopAccessInfo;
use crate::mir::display::{render_value, value_ref};
use crate::mir::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Stable identity of a partition. Survives reordering and removal of
/// other partitions in the container.
pub type PartitionHandle = usize;

/// A loop copy produced for one partition.
#[derive(Debug, Clone)]
pub struct ClonedLoop {
    pub lp: usize,
    pub preheader: BlockId,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub handle: PartitionHandle,
    set: FxHashSet<ValueId>,
    dep_cycle: bool,
    /// Original-to-copy mapping. Empty for the partition that keeps the
    /// original loop.
    pub vmap: ValueMap,
    pub cloned: Option<ClonedLoop>,
}

impl Partition {
    fn new(handle: PartitionHandle, inst: ValueId, dep_cycle: bool) -> Self {
        let mut set = FxHashSet::default();
        set.insert(inst);
        Self {
            handle,
            set,
            dep_cycle,
            vmap: ValueMap::default(),
            cloned: None,
        }
    }

    pub fn add(&mut self, inst: ValueId) {
        self.set.insert(inst);
    }

    pub fn contains(&self, inst: ValueId) -> bool {
        self.set.contains(&inst)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn has_dep_cycle(&self) -> bool {
        self.dep_cycle
    }

    pub fn insts(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.set.iter().copied()
    }

    /// Moves every operation into `other`, leaving this partition empty.
    pub fn move_to(&mut self, other: &mut Partition) {
        other.set.extend(self.set.drain());
        other.dep_cycle |= self.dep_cycle;
    }

    /// The copy of `v` living in this partition's loop, or `v` itself.
    pub fn mapped(&self, v: ValueId) -> ValueId {
        self.vmap.value(v)
    }

    pub fn mapped_block(&self, bb: BlockId) -> BlockId {
        self.vmap.block(bb)
    }

    /// Closes the set over operand edges inside the loop. Every terminator
    /// of the loop seeds the closure, so the copy keeps its control flow.
    pub fn populate_used_set(&mut self, fn_ir: &FnIR, loop_blocks: &[BlockId]) {
        let in_loop: FxHashSet<BlockId> = loop_blocks.iter().copied().collect();
        let defined_in_loop =
            |v: ValueId| fn_ir.values[v].block.is_some_and(|b| in_loop.contains(&b));

        let mut worklist: Vec<ValueId> = self.set.iter().copied().collect();
        for &bb in loop_blocks {
            if let Some(op) = fn_ir.blocks[bb].term.operand() {
                if defined_in_loop(op) && self.set.insert(op) {
                    worklist.push(op);
                }
            }
        }
        while let Some(v) = worklist.pop() {
            for op in fn_ir.values[v].kind.operands() {
                if defined_in_loop(op) && self.set.insert(op) {
                    worklist.push(op);
                }
            }
        }
    }

    /// Deletes from this partition's loop every operation outside its set.
    /// Uses are first redirected to `undef`; deletion runs back to front.
    pub fn remove_unused_insts(&self, fn_ir: &mut FnIR, loop_blocks: &[BlockId]) -> usize {
        let mut unused = Vec::new();
        for &bb in loop_blocks {
            for &inst in &fn_ir.blocks[bb].insts {
                if !self.set.contains(&inst) {
                    unused.push(self.mapped(inst));
                }
            }
        }
        let undef = fn_ir.undef();
        for &inst in unused.iter().rev() {
            fn_ir.replace_all_uses(inst, undef);
            fn_ir.erase_inst(inst);
        }
        unused.len()
    }

    /// Marks forwarding loads as not aliasing the other stores of this
    /// partition. `eligible_store` filters the stores that may carry the scope.
    pub fn annotate_no_alias(
        &self,
        fn_ir: &mut FnIR,
        loop_blocks: &[BlockId],
        scope: ScopeId,
        forwarding: &FxHashSet<ValueId>,
        eligible_store: impl Fn(&FnIR, ValueId) -> bool,
    ) {
        let mut order = Vec::new();
        for &bb in loop_blocks {
            order.extend(
                fn_ir.blocks[bb]
                    .insts
                    .iter()
                    .copied()
                    .filter(|i| self.set.contains(i)),
            );
        }
        for orig in order {
            let inst = self.mapped(orig);
            match fn_ir.values[inst].kind.op_class() {
                OpClass::MemRead if forwarding.contains(&orig) => {
                    fn_ir.values[inst].meta.noalias.push(scope);
                }
                OpClass::MemWrite
                    if !forwarding.contains(&orig) && eligible_store(fn_ir, orig) =>
                {
                    fn_ir.values[inst].meta.scopes.push(scope);
                }
                _ => {}
            }
        }
    }
}

/// Union-find over partition handles.
#[derive(Debug, Clone, Default)]
pub struct DisjointSet {
    parent: FxHashMap<PartitionHandle, PartitionHandle>,
}

impl DisjointSet {
    pub fn find(&mut self, x: PartitionHandle) -> PartitionHandle {
        let p = *self.parent.entry(x).or_insert(x);
        if p == x {
            return x;
        }
        let root = self.find(p);
        self.parent.insert(x, root);
        root
    }

    pub fn union(&mut self, a: PartitionHandle, b: PartitionHandle) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn contains(&self, x: PartitionHandle) -> bool {
        self.parent.contains_key(&x)
    }
}

/// Ordered partitions of one loop plus the instruction-to-partition index.
#[derive(Debug, Clone, Default)]
pub struct PartitionContainer {
    parts: Vec<Partition>,
    next_handle: PartitionHandle,
    inst_to_partition: FxHashMap<ValueId, i32>,
}

impl PartitionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Partition {
        &self.parts[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Partition {
        &mut self.parts[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    fn push(&mut self, inst: ValueId, dep_cycle: bool) {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.parts.push(Partition::new(handle, inst, dep_cycle));
    }

    pub fn add_to_cyclic_partition(&mut self, inst: ValueId) {
        match self.parts.last_mut() {
            Some(last) if last.dep_cycle => last.add(inst),
            Some(_) | None => self.push(inst, true),
        }
    }

    pub fn add_to_new_non_cyclic_partition(&mut self, inst: ValueId) {
        self.push(inst, false);
    }

    /// Folds each run of adjacent partitions matching `pred` into the first
    /// of the run. Returns whether anything merged.
    pub fn merge_adjacent_partitions_if(&mut self, pred: impl Fn(&Partition) -> bool) -> bool {
        let mut out: Vec<Partition> = Vec::with_capacity(self.parts.len());
        let mut prev_match = false;
        let mut merged = false;
        for mut part in std::mem::take(&mut self.parts) {
            let matches = pred(&part);
            if prev_match && matches {
                if let Some(head) = out.last_mut() {
                    part.move_to(head);
                    merged = true;
                    continue;
                }
            }
            prev_match = matches;
            out.push(part);
        }
        self.parts = out;
        merged
    }

    pub fn merge_adjacent_non_cyclic(&mut self) -> bool {
        self.merge_adjacent_partitions_if(|p| !p.has_dep_cycle())
    }

    /// Folds partitions whose stores all need predication into the cyclic
    /// partitions next to them.
    pub fn merge_non_if_convertible(
        &mut self,
        fn_ir: &FnIR,
        needs_predication: impl Fn(BlockId) -> bool,
    ) -> bool {
        self.merge_adjacent_partitions_if(|p| {
            if p.has_dep_cycle() {
                return true;
            }
            let mut seen_store = false;
            for inst in p.insts() {
                let val = &fn_ir.values[inst];
                if val.kind.is_store() {
                    seen_store = true;
                    if !val.block.is_some_and(&needs_predication) {
                        return false;
                    }
                }
            }
            seen_store
        })
    }

    pub fn merge_before_populating(
        &mut self,
        fn_ir: &FnIR,
        distribute_non_if_convertible: bool,
        needs_predication: impl Fn(BlockId) -> bool,
    ) {
        self.merge_adjacent_non_cyclic();
        if !distribute_non_if_convertible {
            self.merge_non_if_convertible(fn_ir, needs_predication);
        }
    }

    pub fn populate_used_set(&mut self, fn_ir: &FnIR, loop_blocks: &[BlockId]) {
        for p in &mut self.parts {
            p.populate_used_set(fn_ir, loop_blocks);
        }
    }

    /// If a load is claimed by two partitions, everything from the first
    /// claimant up to the later one is folded into the first.
    pub fn merge_to_avoid_duplicated_loads(&mut self, fn_ir: &FnIR) -> bool {
        let mut load_to_partition: FxHashMap<ValueId, usize> = FxHashMap::default();
        let mut to_be_merged = DisjointSet::default();
        for (i, part) in self.parts.iter().enumerate() {
            let mut loads: Vec<ValueId> = part
                .insts()
                .filter(|&v| fn_ir.values[v].kind.is_load())
                .collect();
            loads.sort_unstable();
            for ld in loads {
                match load_to_partition.get(&ld) {
                    None => {
                        load_to_partition.insert(ld, i);
                    }
                    Some(&first) => {
                        log::trace!(
                            target: "loop-distribute",
                            "merging partitions {}..={} to keep {} unique",
                            first,
                            i,
                            value_ref(fn_ir, ld)
                        );
                        for j in first..i {
                            to_be_merged.union(self.parts[j].handle, part.handle);
                        }
                    }
                }
            }
        }
        if to_be_merged.is_empty() {
            return false;
        }

        // The leader of each class is its first member in program order.
        let mut leader_pos: FxHashMap<PartitionHandle, usize> = FxHashMap::default();
        let mut parts = std::mem::take(&mut self.parts);
        let mut kept: Vec<Partition> = Vec::with_capacity(parts.len());
        for mut part in parts.drain(..) {
            if !to_be_merged.contains(part.handle) {
                kept.push(part);
                continue;
            }
            let root = to_be_merged.find(part.handle);
            match leader_pos.get(&root) {
                Some(&pos) => part.move_to(&mut kept[pos]),
                None => {
                    leader_pos.insert(root, kept.len());
                    kept.push(part);
                }
            }
        }
        kept.retain(|p| !p.is_empty());
        self.parts = kept;
        true
    }

    /// Builds the instruction-to-partition index; -1 marks duplicates.
    pub fn setup_partition_id_on_instructions(&mut self) {
        self.inst_to_partition.clear();
        for (id, part) in self.parts.iter().enumerate() {
            for inst in part.insts() {
                self.inst_to_partition
                    .entry(inst)
                    .and_modify(|p| *p = -1)
                    .or_insert(id as i32);
            }
        }
    }

    pub fn partition_id(&self, inst: ValueId) -> Option<i32> {
        self.inst_to_partition.get(&inst).copied()
    }

    /// Partition of every pointer descriptor, -1 when used from several.
    pub fn compute_partition_set_for_pointers(&self, lai: &LoopAccessInfo) -> LD<Vec<i32>> {
        let mut out = Vec::with_capacity(lai.pointers.len());
        for (idx, ptr) in lai.pointers.iter().enumerate() {
            // -2: no member seen yet.
            let mut partition = -2;
            for &inst in &ptr.members {
                let Some(this) = self.partition_id(inst) else {
                    bail!(
                        "PartitionContainer",
                        LDCode::E4002,
                        Stage::Partition,
                        "access %v{} of pointer #{} is not in any partition",
                        inst,
                        idx
                    );
                };
                if partition == -2 {
                    partition = this;
                } else if partition == -1 {
                    break;
                } else if partition != this {
                    partition = -1;
                }
            }
            if partition == -2 {
                bail!(
                    "PartitionContainer",
                    LDCode::E4002,
                    Stage::Partition,
                    "pointer #{} (%v{}) does not belong to any partition",
                    idx,
                    ptr.ptr
                );
            }
            out.push(partition);
        }
        Ok(out)
    }

    /// Mints one alias scope and annotates every cyclic partition with it.
    pub fn annotate_no_alias(
        &self,
        fn_ir: &mut FnIR,
        loop_blocks: &[BlockId],
        forwarding: &FxHashSet<ValueId>,
        eligible_store: impl Fn(&FnIR, ValueId) -> bool,
    ) -> ScopeId {
        let scope = fn_ir.new_alias_scope();
        for p in self.parts.iter().filter(|p| p.has_dep_cycle()) {
            p.annotate_no_alias(fn_ir, loop_blocks, scope, forwarding, &eligible_store);
        }
        scope
    }

    pub fn remove_unused_insts(&self, fn_ir: &mut FnIR, loop_blocks: &[BlockId]) -> usize {
        self.parts
            .iter()
            .map(|p| p.remove_unused_insts(fn_ir, loop_blocks))
            .sum()
    }

    pub fn display<'a>(&'a self, fn_ir: &'a FnIR) -> PartitionsDisplay<'a> {
        PartitionsDisplay { parts: self, fn_ir }
    }
}

pub struct PartitionsDisplay<'a> {
    parts: &'a PartitionContainer,
    fn_ir: &'a FnIR,
}

impl fmt::Display for PartitionsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.parts.iter().enumerate() {
            write!(f, "Partition {} (#{})", i, p.handle)?;
            if p.has_dep_cycle() {
                write!(f, " (cycle)")?;
            }
            writeln!(f, ":")?;
            let mut insts: Vec<ValueId> = p.insts().collect();
            insts.sort_unstable();
            for v in insts {
                writeln!(f, "  {}", render_value(self.fn_ir, v))?;
            }
        }
        Ok(())
    }
}
