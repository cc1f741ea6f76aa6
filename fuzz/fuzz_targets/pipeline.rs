#![no_main]

use ldist::mir::opt::{LdistConfig, TachyonEngine};
use ldist::mir::verify::verify_ir;
use ldist::mir::*;
use libfuzzer_sys::fuzz_target;
use rustc_hash::FxHashMap;

const ARRAYS: usize = 4;

// Builds `for (i = 0; i < n; i++) { .. }` whose body is driven by `data`:
// every byte pair picks an array, an offset in -2..=2 and load or store.
fn build(data: &[u8]) -> Option<FnIR> {
    let (&flags, ops) = data.split_first()?;
    let mut f = FnIR::new("fuzz");
    let entry = f.add_block("entry");
    let ph = f.add_block("ph");
    let header = f.add_block("header");
    let body = f.add_block("body");
    let latch = f.add_block("latch");
    let exit = f.add_block("exit");
    f.entry = entry;

    let n = f.param(0, false, "n");
    let arrays: Vec<ValueId> = (0..ARRAYS)
        .map(|k| f.param(k + 1, flags & (1 << k) != 0, &format!("a{k}")))
        .collect();
    let zero = f.const_int(0);
    let one = f.const_int(1);
    let i = f.push_inst(header, ValueKind::Phi { args: vec![(zero, ph)] }, Some("i"));
    let cond = f.push_inst(
        header,
        ValueKind::Binary { op: BinOp::Lt, lhs: i, rhs: n },
        Some("cond"),
    );

    let in_header = flags & 0x10 != 0;
    let at = if in_header { header } else { body };
    let mut last = one;
    for pair in ops.chunks_exact(2).take(24) {
        let base = arrays[(pair[0] as usize) % ARRAYS];
        let offset = i64::from(pair[1] % 5) - 2;
        let idx = if offset == 0 {
            i
        } else {
            let c = f.const_int(offset);
            f.push_inst(at, ValueKind::Binary { op: BinOp::Add, lhs: i, rhs: c }, None)
        };
        let ptr = f.push_inst(at, ValueKind::Addr { base, idx }, None);
        if pair[0] & 0x80 != 0 {
            f.push_inst(at, ValueKind::Store { ptr, val: last }, None);
        } else {
            last = f.push_inst(at, ValueKind::Load { ptr }, None);
        }
    }

    let next = f.push_inst(
        latch,
        ValueKind::Binary { op: BinOp::Add, lhs: i, rhs: one },
        Some("i.next"),
    );
    if let ValueKind::Phi { args } = &mut f.values[i].kind {
        args.push((next, latch));
    }
    f.set_term(entry, Terminator::Goto(ph));
    f.set_term(ph, Terminator::Goto(header));
    f.set_term(header, Terminator::If { cond, then_bb: body, else_bb: exit });
    f.set_term(body, Terminator::Goto(latch));
    f.set_term(latch, Terminator::Goto(header));
    // Values computed in the header may escape the loop.
    let ret = (in_header && flags & 0x20 != 0).then_some(last);
    f.set_term(exit, Terminator::Return(ret));
    Some(f)
}

fuzz_target!(|data: &[u8]| {
    let Some(fn_ir) = build(data) else {
        return;
    };
    let config = LdistConfig {
        verify: true,
        distribute_non_if_convertible: data.len() % 2 == 0,
        add_checks_for_store_to_load_forwarding: data.len() % 3 != 0,
    };

    let mut all_fns = FxHashMap::default();
    all_fns.insert("fuzz".to_string(), fn_ir);
    let engine = TachyonEngine::with_config(config);
    if let Err(e) = engine.run_program(&mut all_fns) {
        panic!("loop distribution failed:\n{}", e);
    }
    for fn_ir in all_fns.values() {
        assert!(verify_ir(fn_ir).is_ok(), "invalid MIR after distribution:\n{}", fn_ir);
    }
});
