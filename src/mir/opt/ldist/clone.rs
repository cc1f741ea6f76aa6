use crate::error::{LD, LDCode, Stage};
use crate::mir::opt::dom::DomTree;
use crate::mir::opt::ldist::partition::{ClonedLoop, PartitionContainer};
use crate::mir::opt::loop_analysis::{LoopId, LoopNest};
use crate::mir::*;
use crate::{bail, ensure};

/// Splits `bb` before its terminator, keeping the dominator tree and loop
/// nest in sync. Returns the new block, which takes over the terminator.
pub fn split_block(
    fn_ir: &mut FnIR,
    dt: &mut DomTree,
    loops: &mut LoopNest,
    bb: BlockId,
    name: impl Into<String>,
) -> BlockId {
    let dominated = dt.children(bb);
    let new_bb = fn_ir.split_before_term(bb, name);
    dt.add_new_block(new_bb, bb);
    for child in dominated {
        dt.change_idom(child, new_bb);
    }
    if let Some(lp) = loops.loop_for(bb) {
        loops.add_block_to_loop(new_bb, lp);
    }
    new_bb
}

/// Copies `lp` together with its preheader and places the copy in front of
/// `before`. The new preheader is dominated by `dom_bb`.
///
/// Operands are not remapped here; callers do it once the value map is
/// complete. Returns the new loop and its blocks, preheader first.
pub fn clone_loop_with_preheader(
    fn_ir: &mut FnIR,
    dt: &mut DomTree,
    loops: &mut LoopNest,
    lp: LoopId,
    before: BlockId,
    dom_bb: BlockId,
    vmap: &mut ValueMap,
    suffix: &str,
) -> LD<(LoopId, Vec<BlockId>)> {
    let Some(orig_ph) = loops.preheader(fn_ir, lp) else {
        bail!(
            "LoopCloner",
            LDCode::ICE9001,
            Stage::Clone,
            "loop at {} lost its preheader",
            fn_ir.blocks[loops.header(lp)].name
        );
    };
    let parent = loops.parent(lp);
    let new_loop = loops.add_loop(parent, loops.header(lp));

    let new_ph = fn_ir.clone_block(orig_ph, vmap, suffix);
    if let Some(p) = parent {
        loops.add_block_to_loop(new_ph, p);
    }
    dt.add_new_block(new_ph, dom_bb);
    let mut blocks = vec![new_ph];

    let orig_blocks: Vec<BlockId> = loops.blocks(lp).to_vec();
    for bb in orig_blocks {
        let new_bb = fn_ir.clone_block(bb, vmap, suffix);
        loops.add_block_to_loop(new_bb, new_loop);
        let Some(idom) = dt.idom(bb) else {
            bail!(
                "LoopCloner",
                LDCode::ICE9001,
                Stage::Clone,
                "loop block {} has no immediate dominator",
                fn_ir.blocks[bb].name
            );
        };
        dt.add_new_block(new_bb, vmap.block(idom));
        blocks.push(new_bb);
    }
    loops.set_header(new_loop, vmap.block(loops.header(lp)));

    fn_ir.splice_before(&blocks, before);
    Ok((new_loop, blocks))
}

pub fn remap_blocks(fn_ir: &mut FnIR, blocks: &[BlockId], vmap: &ValueMap) {
    for &bb in blocks {
        fn_ir.remap_block(bb, vmap);
    }
}

/// Gives every partition but the last its own copy of the loop and chains
/// the copies in partition order in front of the original loop, which the
/// last partition keeps.
pub fn clone_loops(
    fn_ir: &mut FnIR,
    dt: &mut DomTree,
    loops: &mut LoopNest,
    lp: LoopId,
    parts: &mut PartitionContainer,
) -> LD<()> {
    let (Some(orig_ph), Some(exit), Some(orig_exiting)) = (
        loops.preheader(fn_ir, lp),
        loops.exit_block(fn_ir, lp),
        loops.exiting_block(fn_ir, lp),
    ) else {
        bail!(
            "LoopCloner",
            LDCode::ICE9001,
            Stage::Clone,
            "loop at {} is no longer in canonical form",
            fn_ir.blocks[loops.header(lp)].name
        );
    };
    let Some(pred) = fn_ir.single_predecessor(orig_ph) else {
        bail!(
            "LoopCloner",
            LDCode::ICE9001,
            Stage::Clone,
            "preheader {} does not have a single predecessor",
            fn_ir.blocks[orig_ph].name
        );
    };
    ensure!(
        fn_ir.blocks[orig_ph].insts.is_empty(),
        "LoopCloner",
        LDCode::ICE9001,
        Stage::Clone,
        "preheader {} is not empty",
        fn_ir.blocks[orig_ph].name
    );
    ensure!(
        parts.len() >= 2,
        "LoopCloner",
        LDCode::ICE9001,
        Stage::Clone,
        "at least two partitions expected, got {}",
        parts.len()
    );

    // Reverse order: each copy goes in front of the previous top preheader.
    let mut top_ph = orig_ph;
    for idx in (0..parts.len() - 1).rev() {
        let part = parts.get_mut(idx);
        let suffix = format!(".ldist{}", idx + 1);
        let (new_loop, blocks) =
            clone_loop_with_preheader(fn_ir, dt, loops, lp, top_ph, pred, &mut part.vmap, &suffix)?;
        part.vmap.blocks.insert(exit, top_ph);
        remap_blocks(fn_ir, &blocks, &part.vmap);
        let new_ph = blocks[0];
        part.cloned = Some(ClonedLoop {
            lp: new_loop,
            preheader: new_ph,
            blocks,
        });
        top_ph = new_ph;
    }
    fn_ir.blocks[pred].term.replace_successor(orig_ph, top_ph);

    // Each loop's preheader is now reached from the previous loop's exit.
    for idx in 1..parts.len() {
        let prev = parts.get(idx - 1);
        let prev_exiting = prev.mapped_block(orig_exiting);
        let ph = parts
            .get(idx)
            .cloned
            .as_ref()
            .map_or(orig_ph, |c| c.preheader);
        dt.change_idom(ph, prev_exiting);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // entry -> ph -> h <-> latch ; h -> exit
    fn simple_loop() -> (FnIR, [BlockId; 5]) {
        let mut f = FnIR::new("simple");
        let entry = f.add_block("entry");
        let ph = f.add_block("ph");
        let h = f.add_block("h");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        f.entry = entry;
        let c = f.param(0, false, "c");
        let x = f.push_inst(entry, ValueKind::Load { ptr: c }, Some("x"));
        f.set_term(entry, Terminator::Goto(ph));
        f.set_term(ph, Terminator::Goto(h));
        f.set_term(
            h,
            Terminator::If {
                cond: x,
                then_bb: latch,
                else_bb: exit,
            },
        );
        f.set_term(latch, Terminator::Goto(h));
        f.set_term(exit, Terminator::Return(None));
        (f, [entry, ph, h, latch, exit])
    }

    #[test]
    fn split_block_updates_dominators_and_loops() {
        let (mut f, [entry, ph, h, _, _]) = simple_loop();
        let mut dt = DomTree::compute(&f);
        let mut nest = LoopNest::analyze(&f, &dt);
        let tail = split_block(&mut f, &mut dt, &mut nest, entry, "entry.split");
        assert_eq!(dt.idom(tail), Some(entry));
        assert_eq!(dt.idom(ph), Some(tail));
        assert!(dt.verify(&f).is_ok());
        assert!(nest.verify(&f, &dt).is_ok());
        assert_eq!(nest.preheader(&f, 0), Some(ph));
        assert_eq!(dt.idom(h), Some(ph));
    }

    #[test]
    fn cloned_loop_keeps_analyses_consistent() {
        let (mut f, [entry, ph, h, latch, exit]) = simple_loop();
        let mut dt = DomTree::compute(&f);
        let mut nest = LoopNest::analyze(&f, &dt);
        let mut vmap = ValueMap::default();
        let (new_loop, blocks) =
            clone_loop_with_preheader(&mut f, &mut dt, &mut nest, 0, ph, entry, &mut vmap, ".c")
                .unwrap();
        // Send the copy's exit into the original preheader and enter it first.
        vmap.blocks.insert(exit, ph);
        remap_blocks(&mut f, &blocks, &vmap);
        f.blocks[entry].term.replace_successor(ph, blocks[0]);
        let copy_h = vmap.block(h);
        dt.change_idom(ph, copy_h);

        assert_eq!(blocks.len(), 3);
        assert_eq!(nest.header(new_loop), copy_h);
        assert_eq!(nest.latch(&f, new_loop), Some(vmap.block(latch)));
        assert_eq!(f.layout[..4], [entry, blocks[0], blocks[1], blocks[2]]);
        assert!(dt.verify(&f).is_ok());
        assert!(nest.verify(&f, &dt).is_ok());
        assert!(crate::mir::verify::verify_ir(&f).is_ok());
    }
}
