use crate::error::{LD, LDCode, Stage};
use crate::mir::analyze::access::LoopAccessInfo;
use crate::mir::opt::dom::DomTree;
use crate::mir::opt::ldist::clone::{clone_loop_with_preheader, remap_blocks, split_block};
use crate::mir::opt::ldist::partition::ClonedLoop;
use crate::mir::opt::loop_analysis::{LoopId, LoopNest};
use crate::mir::*;
use crate::{bail, ensure};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// No guard exists.
    Unchecked,
    /// The fallback loop and the guarded branch are in place.
    Checked,
    /// The distributed side has been cloned; the fallback is final.
    Committed,
}

/// Decides whether a distributed loop needs run-time alias checks and, if
/// so, versions it: a guard picks the distributed path when the checked
/// objects are disjoint and an untouched copy of the loop otherwise.
pub struct RuntimeCheckVersioner<'a> {
    lai: &'a LoopAccessInfo,
    lp: LoopId,
    ptr_partition: Vec<i32>,
    checks: Vec<(usize, usize)>,
    state: VersionState,
    vmap: ValueMap,
    fallback: Option<ClonedLoop>,
    memcheck: Option<BlockId>,
}

impl<'a> RuntimeCheckVersioner<'a> {
    pub fn new(
        lai: &'a LoopAccessInfo,
        lp: LoopId,
        ptr_partition: Vec<i32>,
        forwarding_ptrs: &FxHashSet<ValueId>,
    ) -> Self {
        let checks = lai.required_checks(&ptr_partition, forwarding_ptrs);
        Self {
            lai,
            lp,
            ptr_partition,
            checks,
            state: VersionState::Unchecked,
            vmap: ValueMap::default(),
            fallback: None,
            memcheck: None,
        }
    }

    pub fn state(&self) -> VersionState {
        self.state
    }

    pub fn ptr_partition(&self) -> &[i32] {
        &self.ptr_partition
    }

    pub fn checks(&self) -> &[(usize, usize)] {
        &self.checks
    }

    pub fn needs_runtime_checks(&self) -> bool {
        !self.checks.is_empty()
    }

    /// Every object a required check compares is available before the loop.
    pub fn can_emit_checks(&self) -> bool {
        self.lai.can_check(&self.checks)
    }

    pub fn fallback(&self) -> Option<&ClonedLoop> {
        self.fallback.as_ref()
    }

    pub fn memcheck_block(&self) -> Option<BlockId> {
        self.memcheck
    }

    /// Turns the (empty) preheader into the check block, clones the fallback
    /// loop in front of a fresh preheader and installs the guarded branch.
    pub fn version_loop(
        &mut self,
        fn_ir: &mut FnIR,
        dt: &mut DomTree,
        loops: &mut LoopNest,
    ) -> LD<()> {
        ensure!(
            self.state == VersionState::Unchecked,
            "RuntimeCheckVersioner",
            LDCode::ICE9001,
            Stage::Version,
            "loop versioned twice"
        );
        let lp = self.lp;
        let Some(memcheck) = loops.preheader(fn_ir, lp) else {
            bail!(
                "RuntimeCheckVersioner",
                LDCode::ICE9001,
                Stage::Version,
                "versioned loop has no preheader"
            );
        };
        let Some(guard) = self.lai.add_runtime_checks(fn_ir, memcheck, &self.checks) else {
            bail!(
                "RuntimeCheckVersioner",
                LDCode::ICE9001,
                Stage::Version,
                "versioning requested but no checks are needed"
            );
        };
        let header_name = fn_ir.blocks[loops.header(lp)].name.clone();
        fn_ir.blocks[memcheck].name = format!("{}.ldist.memcheck", header_name);

        let ph = split_block(fn_ir, dt, loops, memcheck, format!("{}.ph", header_name));
        let (fb_loop, blocks) = clone_loop_with_preheader(
            fn_ir,
            dt,
            loops,
            lp,
            ph,
            memcheck,
            &mut self.vmap,
            ".ldist.nondist",
        )?;
        remap_blocks(fn_ir, &blocks, &self.vmap);

        let fb_ph = blocks[0];
        fn_ir.set_term(
            memcheck,
            Terminator::If {
                cond: guard,
                then_bb: ph,
                else_bb: fb_ph,
            },
        );
        let Some(exit) = loops.exit_block(fn_ir, lp) else {
            bail!(
                "RuntimeCheckVersioner",
                LDCode::ICE9001,
                Stage::Version,
                "versioned loop has no single exit block"
            );
        };
        // Both loops now meet in the exit block.
        dt.change_idom(exit, memcheck);

        log::debug!(
            target: "loop-distribute",
            "versioned {} behind {} check(s) in {}",
            header_name,
            self.checks.len(),
            fn_ir.blocks[memcheck].name
        );
        self.fallback = Some(ClonedLoop {
            lp: fb_loop,
            preheader: fb_ph,
            blocks,
        });
        self.memcheck = Some(memcheck);
        self.state = VersionState::Checked;
        Ok(())
    }

    /// Joins every value used after the loop with its fallback copy at the
    /// exit block, and feeds the remaining exit phis from the fallback side.
    pub fn add_phi_nodes(
        &mut self,
        fn_ir: &mut FnIR,
        loops: &LoopNest,
        defs_used_outside: &[ValueId],
    ) -> LD<()> {
        ensure!(
            self.state == VersionState::Checked,
            "RuntimeCheckVersioner",
            LDCode::ICE9001,
            Stage::Version,
            "join values requested before versioning"
        );
        let lp = self.lp;
        let (Some(exit), Some(exiting)) =
            (loops.exit_block(fn_ir, lp), loops.exiting_block(fn_ir, lp))
        else {
            bail!(
                "RuntimeCheckVersioner",
                LDCode::ICE9001,
                Stage::Version,
                "versioned loop lost its exit"
            );
        };
        let fb_exiting = self.vmap.block(exiting);

        for &d in defs_used_outside {
            let nd = self.vmap.value(d);
            let existing = fn_ir.phis(exit).into_iter().find(|&phi| {
                matches!(&fn_ir.values[phi].kind, ValueKind::Phi { args } if args.len() == 1 && args[0].0 == d)
            });
            let pn = match existing {
                Some(pn) => pn,
                None => {
                    let name = match &fn_ir.values[d].name {
                        Some(n) => format!("{}.ldist", n),
                        None => format!("v{}.ldist", d),
                    };
                    fn_ir.insert_inst(
                        exit,
                        0,
                        ValueKind::Phi {
                            args: vec![(d, exiting)],
                        },
                        Some(&name),
                    )
                }
            };
            for user in fn_ir.users_of(d) {
                let Some(bb) = fn_ir.user_block(user) else {
                    continue;
                };
                if loops.contains(lp, bb) {
                    continue;
                }
                // Exit phis read `d` on the loop edge already.
                if bb == exit && matches!(user, User::Value(v) if fn_ir.values[v].kind.is_phi()) {
                    continue;
                }
                fn_ir.replace_uses_in(user, d, pn);
            }
            if let ValueKind::Phi { args } = &mut fn_ir.values[pn].kind {
                args.push((nd, fb_exiting));
            }
        }

        for phi in fn_ir.phis(exit) {
            let vmap = &self.vmap;
            if let ValueKind::Phi { args } = &mut fn_ir.values[phi].kind {
                if args.iter().any(|(_, b)| *b == fb_exiting) {
                    continue;
                }
                if let Some(&(v, _)) = args.iter().find(|(_, b)| *b == exiting) {
                    args.push((vmap.value(v), fb_exiting));
                }
            }
        }
        Ok(())
    }

    pub fn commit(&mut self) {
        if self.state == VersionState::Checked {
            self.state = VersionState::Committed;
        }
    }
}
