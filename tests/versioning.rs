mod common;

use common::*;
use ldist::error::{LDCode, Stage};
use ldist::mir::opt::dom::DomTree;
use ldist::mir::opt::ldist::{LoopDistribute, LoopOutcome, optimize, verify_analyses};
use ldist::mir::opt::loop_analysis::LoopNest;
use ldist::mir::opt::LdistConfig;
use ldist::mir::verify::verify_ir;
use ldist::mir::*;

fn checked() -> LdistConfig {
    LdistConfig {
        verify: true,
        ..LdistConfig::default()
    }
}

fn layout_names(f: &FnIR) -> Vec<&str> {
    f.layout.iter().map(|&b| f.blocks[b].name.as_str()).collect()
}

fn named(f: &FnIR, name: &str) -> ValueId {
    f.values
        .iter()
        .find(|v| v.name.as_deref() == Some(name) && !f.is_detached(v.id))
        .map(|v| v.id)
        .unwrap_or_else(|| panic!("no live value named {name}\n{f}"))
}

fn mem_checks(f: &FnIR, bb: BlockId) -> usize {
    f.blocks[bb]
        .insts
        .iter()
        .filter(|&&v| matches!(f.values[v].kind, ValueKind::MemCheck { .. }))
        .count()
}

// p[i+1] = p[i]; q[i] = q[i] + 1; return i
// p and q are plain parameters and may overlap.
fn may_alias_pair() -> (FnIR, ValueId, ValueId) {
    let mut l = CountedLoop::new("pair");
    let p = l.array("p", false);
    let q = l.array("q", false);
    let x = l.load(p, 0, "x");
    l.store(p, 1, x, "sp");
    let y = l.load(q, 0, "y");
    let one = l.constant(1);
    let z = l.binary(BinOp::Add, y, one, "z");
    l.store(q, 0, z, "sq");
    let i = l.i;
    (l.finish_returning(Some(i)), p, q)
}

#[test]
fn aliasing_partitions_are_versioned_behind_a_guard() {
    let (mut f, p, q) = may_alias_pair();
    let stats = optimize(&mut f, &checked()).expect("distribution failed");
    assert_eq!(stats.loops_distributed, 1);
    assert_eq!(stats.loops_versioned, 1);
    assert_eq!(stats.partitions_created, 2);

    assert_eq!(
        layout_names(&f),
        vec![
            "entry",
            "header.ldist.memcheck",
            "header.ph.ldist.nondist",
            "header.ldist.nondist",
            "body.ldist.nondist",
            "latch.ldist.nondist",
            "header.ph.ldist1",
            "header.ldist1",
            "body.ldist1",
            "latch.ldist1",
            "header.ph",
            "header",
            "body",
            "latch",
            "exit",
        ]
    );

    let memcheck = block_named(&f, "header.ldist.memcheck");
    assert_eq!(mem_checks(&f, memcheck), 1);
    let Terminator::If {
        cond,
        then_bb,
        else_bb,
    } = f.blocks[memcheck].term
    else {
        panic!("guard is not a branch\n{f}");
    };
    assert!(matches!(
        f.values[cond].kind,
        ValueKind::MemCheck { lhs, rhs } if (lhs, rhs) == (p.min(q), p.max(q))
    ));
    assert_eq!(then_bb, block_named(&f, "header.ph.ldist1"));
    assert_eq!(else_bb, block_named(&f, "header.ph.ldist.nondist"));

    // The distributed chain plus the untouched fallback.
    let dt = DomTree::compute(&f);
    let nest = LoopNest::analyze(&f, &dt);
    assert_eq!(nest.len(), 3);
    let exit = block_named(&f, "exit");
    assert_eq!(dt.idom(exit), Some(memcheck));

    // The fallback keeps every access.
    let fb_body = block_named(&f, "body.ldist.nondist");
    assert_eq!(accesses_of(&f, fb_body, p).len(), 2);
    assert_eq!(accesses_of(&f, fb_body, q).len(), 2);
    assert!(verify_ir(&f).is_ok());
}

#[test]
fn value_used_after_the_loop_is_joined_with_the_fallback() {
    let (mut f, _, _) = may_alias_pair();
    optimize(&mut f, &checked()).expect("distribution failed");

    let exit = block_named(&f, "exit");
    let join = named(&f, "i.ldist");
    assert_eq!(f.blocks[exit].insts.first(), Some(&join));
    assert_eq!(f.blocks[exit].term, Terminator::Return(Some(join)));
    let ValueKind::Phi { args } = &f.values[join].kind else {
        panic!("join is not a phi");
    };
    let i = named(&f, "i");
    let fb_i = named(&f, "i.ldist.nondist");
    assert_eq!(
        args,
        &vec![
            (i, block_named(&f, "header")),
            (fb_i, block_named(&f, "header.ldist.nondist")),
        ]
    );
}

#[test]
fn fallback_is_not_annotated_but_forwarding_load_is() {
    let (mut f, _, _) = may_alias_pair();
    optimize(&mut f, &checked()).expect("distribution failed");
    let x = named(&f, "x.ldist1");
    assert_eq!(f.values[x].meta.noalias, vec![0]);
    assert!(f.values[x].meta.scopes.is_empty());
    let fb_x = named(&f, "x.ldist.nondist");
    assert_eq!(f.values[fb_x].meta, AliasMeta::default());
}

// x = a[i]; e[i] = x; a[i+1] = x; d[i] = c[i]
// a and e may overlap but share the recurrence's partition.
fn forwarding_next_to_other_store() -> FnIR {
    let mut l = CountedLoop::new("forward");
    let a = l.array("a", false);
    let e = l.array("e", false);
    let c = l.array("c", true);
    let d = l.array("d", true);
    let x = l.load(a, 0, "x");
    l.store(e, 0, x, "se");
    l.store(a, 1, x, "sa");
    let y = l.load(c, 0, "y");
    l.store(d, 0, y, "sd");
    l.finish()
}

#[test]
fn store_to_load_forwarding_adds_checks() {
    let mut f = forwarding_next_to_other_store();
    let stats = optimize(&mut f, &checked()).expect("distribution failed");
    assert_eq!(stats.loops_distributed, 1);
    assert_eq!(stats.loops_versioned, 1);
    assert_eq!(mem_checks(&f, block_named(&f, "header.ldist.memcheck")), 1);

    // Both sides of the scope live in the cyclic partition's copy.
    let x = named(&f, "x.ldist1");
    let se = named(&f, "se.ldist1");
    let sa = named(&f, "sa.ldist1");
    assert_eq!(f.values[x].meta.noalias, vec![0]);
    assert_eq!(f.values[se].meta.scopes, vec![0]);
    assert_eq!(f.values[sa].meta, AliasMeta::default());
    let sd = named(&f, "sd");
    assert_eq!(f.values[sd].meta, AliasMeta::default());
}

#[test]
fn forwarding_checks_can_be_turned_off() {
    let mut f = forwarding_next_to_other_store();
    let config = LdistConfig {
        add_checks_for_store_to_load_forwarding: false,
        ..checked()
    };
    let stats = optimize(&mut f, &config).expect("distribution failed");
    assert_eq!(stats.loops_distributed, 1);
    assert_eq!(stats.loops_versioned, 0);
    assert!(!has_block(&f, "header.ldist.memcheck"));
    assert!(f.values.iter().all(|v| v.meta == AliasMeta::default()));
}

#[test]
fn process_loop_reports_versioning() {
    let (mut f, _, _) = may_alias_pair();
    let mut dt = DomTree::compute(&f);
    let mut loops = LoopNest::analyze(&f, &dt);
    let lp = loops.innermost_loops()[0];
    let outcome = LoopDistribute::new(checked())
        .process_loop(&mut f, &mut dt, &mut loops, lp)
        .expect("distribution failed");
    assert_eq!(
        outcome,
        LoopOutcome::Distributed {
            partitions: 2,
            versioned: true
        }
    );
    assert!(outcome.is_distributed());
    assert_eq!(loops.len(), 3);
    assert!(dt.verify(&f).is_ok());
    assert!(loops.verify(&f, &dt).is_ok());
}

#[test]
fn stale_dominator_tree_fails_verification() {
    let (mut f, _, _) = may_alias_pair();
    let dt = DomTree::compute(&f);
    let loops = LoopNest::analyze(&f, &dt);
    let entry = f.entry;
    f.split_before_term(entry, "entry.split");
    let err = verify_analyses(&f, &dt, &loops).unwrap_err();
    assert_eq!(err.code, LDCode::E4003);
    assert_eq!(err.stage, Stage::Verify);
    assert!(!err.is_internal());
}
