//! Loop distribution.
//!
//! Splits an innermost loop whose memory accesses form dependence cycles
//! into a chain of loops, one per partition, so that the cycle-free parts
//! can be vectorized on their own. When the partitions cannot be proven to
//! touch disjoint memory, the whole chain is guarded by run-time checks and
//! an untouched copy of the loop is kept as the fallback.

use crate::bail;
use crate::error::{LD, LDCode, LDCtx, Stage};
use crate::mir::analyze::access::{Dependence, LoopAccessInfo};
use crate::mir::analyze::alias::underlying_object;
use crate::mir::opt::dom::DomTree;
use crate::mir::opt::loop_analysis::{LoopId, LoopNest};
use crate::mir::opt::{LdistConfig, LdistStats};
use crate::mir::*;
use rustc_hash::FxHashSet;

pub mod clone;
pub mod partition;
pub mod seed;
pub mod version;

use clone::{clone_loops, split_block};
use partition::PartitionContainer;
use seed::UnsafeDeltas;
use version::RuntimeCheckVersioner;

/// Why a loop was left alone. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInnermost,
    NoPreheader,
    MultipleExitingBlocks,
    MultipleExitBlocks,
    ExitHasOtherPredecessors,
    MemorySafe,
    NoUnsafeDependences,
    TooFewPartitions,
    ChecksNotPossible,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::NotInnermost => "not an innermost loop",
            SkipReason::NoPreheader => "no preheader",
            SkipReason::MultipleExitingBlocks => "multiple exiting blocks",
            SkipReason::MultipleExitBlocks => "multiple exit blocks",
            SkipReason::ExitHasOtherPredecessors => "exit block is reachable from outside the loop",
            SkipReason::MemorySafe => "memory operations are safe for vectorization",
            SkipReason::NoUnsafeDependences => "no unsafe dependences to isolate",
            SkipReason::TooFewPartitions => "fewer than two partitions",
            SkipReason::ChecksNotPossible => "required run-time checks cannot be emitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Distributed { partitions: usize, versioned: bool },
    Skipped(SkipReason),
}

impl LoopOutcome {
    pub fn is_distributed(&self) -> bool {
        matches!(self, LoopOutcome::Distributed { .. })
    }
}

/// Instructions of `lp` with at least one user outside the loop, in
/// program order.
pub fn find_defs_used_outside(fn_ir: &FnIR, loops: &LoopNest, lp: LoopId) -> Vec<ValueId> {
    let mut out = Vec::new();
    for &bb in loops.blocks(lp) {
        for &inst in &fn_ir.blocks[bb].insts {
            let escapes = fn_ir.users_of(inst).into_iter().any(|u| {
                fn_ir
                    .user_block(u)
                    .is_some_and(|b| !loops.contains(lp, b))
            });
            if escapes {
                out.push(inst);
            }
        }
    }
    out
}

/// Loads and stores linked by a possibly-backward load -> store dependence,
/// with their addresses.
fn store_to_load_forwarding(
    fn_ir: &FnIR,
    lai: &LoopAccessInfo,
    unsafe_deps: &[Dependence],
) -> (FxHashSet<ValueId>, FxHashSet<ValueId>) {
    let mut insts = FxHashSet::default();
    let mut ptrs = FxHashSet::default();
    for dep in unsafe_deps {
        let (src, dst) = (&lai.accesses[dep.source], &lai.accesses[dep.destination]);
        let classes = (
            fn_ir.values[src.inst].kind.op_class(),
            fn_ir.values[dst.inst].kind.op_class(),
        );
        if classes == (OpClass::MemRead, OpClass::MemWrite) {
            insts.insert(src.inst);
            ptrs.insert(src.ptr);
            insts.insert(dst.inst);
            ptrs.insert(dst.ptr);
        }
    }
    (insts, ptrs)
}

pub struct LoopDistribute {
    config: LdistConfig,
}

impl LoopDistribute {
    pub fn new(config: LdistConfig) -> Self {
        Self { config }
    }

    /// Distributes every innermost loop of the function. The worklist is
    /// taken up front, so loops created here are never revisited.
    pub fn run(
        &self,
        fn_ir: &mut FnIR,
        dt: &mut DomTree,
        loops: &mut LoopNest,
    ) -> LD<LdistStats> {
        let mut stats = LdistStats::default();
        let worklist = loops.innermost_loops();
        for lp in worklist {
            let header = fn_ir.blocks[loops.header(lp)].name.clone();
            match self.process_loop(fn_ir, dt, loops, lp).ctx("run")? {
                LoopOutcome::Distributed {
                    partitions,
                    versioned,
                } => {
                    stats.loops_distributed += 1;
                    stats.partitions_created += partitions;
                    if versioned {
                        stats.loops_versioned += 1;
                    }
                }
                LoopOutcome::Skipped(reason) => {
                    stats.loops_skipped += 1;
                    log::debug!(
                        target: "loop-distribute",
                        "{}: skipping loop at {}: {}",
                        fn_ir.name,
                        header,
                        reason.describe()
                    );
                }
            }
        }
        Ok(stats)
    }

    pub fn process_loop(
        &self,
        fn_ir: &mut FnIR,
        dt: &mut DomTree,
        loops: &mut LoopNest,
        lp: LoopId,
    ) -> LD<LoopOutcome> {
        use LoopOutcome::Skipped;

        if !loops.is_innermost(lp) {
            return Ok(Skipped(SkipReason::NotInnermost));
        }
        log::debug!(
            target: "loop-distribute",
            "{}: checking loop at {}",
            fn_ir.name,
            fn_ir.blocks[loops.header(lp)].name
        );
        let Some(ph) = loops.preheader(fn_ir, lp) else {
            return Ok(Skipped(SkipReason::NoPreheader));
        };
        let Some(exit) = loops.exit_block(fn_ir, lp) else {
            return Ok(Skipped(SkipReason::MultipleExitBlocks));
        };
        let Some(exiting) = loops.exiting_block(fn_ir, lp) else {
            return Ok(Skipped(SkipReason::MultipleExitingBlocks));
        };
        if fn_ir.predecessors(exit) != [exiting] {
            return Ok(Skipped(SkipReason::ExitHasOtherPredecessors));
        }

        let lai = LoopAccessInfo::analyze(fn_ir, loops, lp);
        if lai.can_vectorize_memory {
            return Ok(Skipped(SkipReason::MemorySafe));
        }
        let unsafe_deps: Vec<Dependence> = lai.possibly_backward().copied().collect();
        if unsafe_deps.is_empty() {
            return Ok(Skipped(SkipReason::NoUnsafeDependences));
        }

        // 1. Seed: memory accesses in program order, then escaping values.
        let mut parts = PartitionContainer::new();
        let deltas = UnsafeDeltas::new(lai.accesses.len(), &unsafe_deps).ctx("process_loop")?;
        deltas
            .seed(&lai.memory_instructions(), &mut parts)
            .ctx("process_loop")?;
        let defs_used_outside = find_defs_used_outside(fn_ir, loops, lp);
        for &d in &defs_used_outside {
            parts.add_to_new_non_cyclic_partition(d);
        }
        log::trace!(target: "loop-distribute", "seeded partitions:\n{}", parts.display(fn_ir));
        if parts.len() < 2 {
            return Ok(Skipped(SkipReason::TooFewPartitions));
        }

        // 2. Merge heuristics.
        {
            let (fn_view, dt_view, loops_view) = (&*fn_ir, &*dt, &*loops);
            parts.merge_before_populating(
                fn_view,
                self.config.distribute_non_if_convertible,
                |bb| loops_view.block_needs_predication(fn_view, dt_view, lp, bb),
            );
        }
        log::trace!(target: "loop-distribute", "merged partitions:\n{}", parts.display(fn_ir));
        if parts.len() < 2 {
            return Ok(Skipped(SkipReason::TooFewPartitions));
        }

        // 3. Close over operands, then keep every load in a single partition.
        let loop_blocks: Vec<BlockId> = loops.blocks(lp).to_vec();
        parts.populate_used_set(fn_ir, &loop_blocks);
        log::trace!(target: "loop-distribute", "populated partitions:\n{}", parts.display(fn_ir));
        if parts.merge_to_avoid_duplicated_loads(fn_ir) {
            log::trace!(
                target: "loop-distribute",
                "partitions merged to keep loads unique:\n{}",
                parts.display(fn_ir)
            );
            if parts.len() < 2 {
                return Ok(Skipped(SkipReason::TooFewPartitions));
            }
        }
        parts.setup_partition_id_on_instructions();

        // 4. Decide on run-time checks before touching the CFG.
        let (fwd_insts, fwd_ptrs) = if self.config.add_checks_for_store_to_load_forwarding {
            store_to_load_forwarding(fn_ir, &lai, &unsafe_deps)
        } else {
            (FxHashSet::default(), FxHashSet::default())
        };
        let ptr_partition = parts
            .compute_partition_set_for_pointers(&lai)
            .ctx("process_loop")?;
        log::trace!(
            target: "loop-distribute",
            "pointer partitions: {:?}",
            lai.pointers
                .iter()
                .zip(&ptr_partition)
                .map(|(p, part)| (p.ptr, p.is_write, *part))
                .collect::<Vec<_>>()
        );
        let mut versioner = RuntimeCheckVersioner::new(&lai, lp, ptr_partition, &fwd_ptrs);
        if versioner.needs_runtime_checks() && !versioner.can_emit_checks() {
            return Ok(Skipped(SkipReason::ChecksNotPossible));
        }

        log::debug!(
            target: "loop-distribute",
            "{}: distributing loop at {} into {} partitions",
            fn_ir.name,
            fn_ir.blocks[loops.header(lp)].name,
            parts.len()
        );

        // 5. From here on the loop is rewritten. Start from an empty
        // preheader with a single predecessor.
        if fn_ir.single_predecessor(ph).is_none() || !fn_ir.blocks[ph].insts.is_empty() {
            let name = format!("{}.split", fn_ir.blocks[ph].name);
            split_block(fn_ir, dt, loops, ph, name);
        }

        let versioned = versioner.needs_runtime_checks();
        if versioned {
            versioner
                .version_loop(fn_ir, dt, loops)
                .ctx("process_loop")?;
            versioner
                .add_phi_nodes(fn_ir, loops, &defs_used_outside)
                .ctx("process_loop")?;
            if !fwd_insts.is_empty() {
                let fwd_bases: FxHashSet<ValueId> = fwd_insts
                    .iter()
                    .filter(|&&i| fn_ir.values[i].kind.is_load())
                    .filter_map(|&i| fn_ir.values[i].kind.access())
                    .map(|acc| underlying_object(fn_ir, acc.ptr))
                    .collect();
                parts.annotate_no_alias(fn_ir, &loop_blocks, &fwd_insts, |f, st| {
                    f.values[st]
                        .kind
                        .access()
                        .is_some_and(|acc| !fwd_bases.contains(&underlying_object(f, acc.ptr)))
                });
            }
        }

        // 6. One loop per partition, chained in program order.
        clone_loops(fn_ir, dt, loops, lp, &mut parts).ctx("process_loop")?;
        versioner.commit();

        // 7. Code after the loop reads the copy owned by the last partition
        // computing each value.
        rewire_defs_used_outside(fn_ir, &loop_blocks, &parts, &defs_used_outside);

        // 8. Strip every loop down to its partition.
        let removed = parts.remove_unused_insts(fn_ir, &loop_blocks);
        log::trace!(
            target: "loop-distribute",
            "removed {} unused instruction(s); result:\n{}",
            removed,
            fn_ir
        );

        if self.config.verify {
            verify_analyses(fn_ir, dt, loops).ctx("process_loop")?;
        }

        Ok(LoopOutcome::Distributed {
            partitions: parts.len(),
            versioned,
        })
    }
}

fn rewire_defs_used_outside(
    fn_ir: &mut FnIR,
    loop_blocks: &[BlockId],
    parts: &PartitionContainer,
    defs_used_outside: &[ValueId],
) {
    let in_loop: FxHashSet<BlockId> = loop_blocks.iter().copied().collect();
    for &d in defs_used_outside {
        let Some(owner) = (0..parts.len()).rev().find(|&i| parts.get(i).contains(d)) else {
            continue;
        };
        let new = parts.get(owner).mapped(d);
        if new == d {
            continue;
        }
        for user in fn_ir.users_of(d) {
            if fn_ir.user_block(user).is_some_and(|b| !in_loop.contains(&b)) {
                fn_ir.replace_uses_in(user, d, new);
            }
        }
    }
}

pub fn verify_analyses(fn_ir: &FnIR, dt: &DomTree, loops: &LoopNest) -> LD<()> {
    if let Err(e) = crate::mir::verify::verify_ir(fn_ir) {
        bail!("LoopDistribute", LDCode::E4003, Stage::Verify, "invalid MIR: {}", e);
    }
    if let Err(e) = dt.verify(fn_ir) {
        bail!("LoopDistribute", LDCode::E4003, Stage::Verify, "dominator tree: {}", e);
    }
    if let Err(e) = loops.verify(fn_ir, dt) {
        bail!("LoopDistribute", LDCode::E4003, Stage::Verify, "loop nest: {}", e);
    }
    Ok(())
}

/// Computes the analyses and distributes every innermost loop of `fn_ir`.
pub fn optimize(fn_ir: &mut FnIR, config: &LdistConfig) -> LD<LdistStats> {
    let mut dt = DomTree::compute(fn_ir);
    let mut loops = LoopNest::analyze(fn_ir, &dt);
    LoopDistribute::new(*config).run(fn_ir, &mut dt, &mut loops)
}
