#![allow(dead_code)]

use ldist::mir::*;

/// `for (i = 0; i < n; i++) { .. }` in the canonical shape the pass expects:
///
/// entry -> ph -> header -> body -> latch -> header ; header -> exit
pub struct CountedLoop {
    pub f: FnIR,
    pub entry: BlockId,
    pub ph: BlockId,
    pub header: BlockId,
    pub body: BlockId,
    pub latch: BlockId,
    pub exit: BlockId,
    pub i: ValueId,
    pub n: ValueId,
    at: BlockId,
    next_param: usize,
}

impl CountedLoop {
    pub fn new(name: &str) -> Self {
        let mut f = FnIR::new(name);
        let entry = f.add_block("entry");
        let ph = f.add_block("ph");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        f.entry = entry;

        let n = f.param(0, false, "n");
        let zero = f.const_int(0);
        let i = f.push_inst(
            header,
            ValueKind::Phi {
                args: vec![(zero, ph)],
            },
            Some("i"),
        );
        let cond = f.push_inst(
            header,
            ValueKind::Binary {
                op: BinOp::Lt,
                lhs: i,
                rhs: n,
            },
            Some("cond"),
        );
        f.set_term(entry, Terminator::Goto(ph));
        f.set_term(ph, Terminator::Goto(header));
        f.set_term(
            header,
            Terminator::If {
                cond,
                then_bb: body,
                else_bb: exit,
            },
        );
        f.set_term(body, Terminator::Goto(latch));
        f.set_term(latch, Terminator::Goto(header));
        f.set_term(exit, Terminator::Return(None));

        Self {
            f,
            entry,
            ph,
            header,
            body,
            latch,
            exit,
            i,
            n,
            at: body,
            next_param: 1,
        }
    }

    /// An array parameter. `noalias` ones never need run-time checks.
    pub fn array(&mut self, name: &str, noalias: bool) -> ValueId {
        let p = self.f.param(self.next_param, noalias, name);
        self.next_param += 1;
        p
    }

    /// Emit into the header instead of the body; the header dominates the exit.
    pub fn in_header(&mut self) -> &mut Self {
        self.at = self.header;
        self
    }

    pub fn in_body(&mut self) -> &mut Self {
        self.at = self.body;
        self
    }

    pub fn addr(&mut self, base: ValueId, offset: i64) -> ValueId {
        let idx = if offset == 0 {
            self.i
        } else {
            let c = self.f.const_int(offset);
            self.f.push_inst(
                self.at,
                ValueKind::Binary {
                    op: BinOp::Add,
                    lhs: self.i,
                    rhs: c,
                },
                None,
            )
        };
        self.f
            .push_inst(self.at, ValueKind::Addr { base, idx }, None)
    }

    pub fn load(&mut self, base: ValueId, offset: i64, name: &str) -> ValueId {
        let ptr = self.addr(base, offset);
        self.f
            .push_inst(self.at, ValueKind::Load { ptr }, Some(name))
    }

    pub fn store(&mut self, base: ValueId, offset: i64, val: ValueId, name: &str) -> ValueId {
        let ptr = self.addr(base, offset);
        self.f
            .push_inst(self.at, ValueKind::Store { ptr, val }, Some(name))
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        self.f
            .push_inst(self.at, ValueKind::Binary { op, lhs, rhs }, Some(name))
    }

    pub fn constant(&mut self, n: i64) -> ValueId {
        self.f.const_int(n)
    }

    /// Closes the induction cycle and returns the function.
    pub fn finish(self) -> FnIR {
        self.finish_returning(None)
    }

    pub fn finish_returning(mut self, ret: Option<ValueId>) -> FnIR {
        let one = self.f.const_int(1);
        let next = self.f.push_inst(
            self.latch,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: self.i,
                rhs: one,
            },
            Some("i.next"),
        );
        if let ValueKind::Phi { args } = &mut self.f.values[self.i].kind {
            args.push((next, self.latch));
        }
        self.f.set_term(self.exit, Terminator::Return(ret));
        self.f
    }
}

pub fn block_named(f: &FnIR, name: &str) -> BlockId {
    f.blocks
        .iter()
        .find(|b| b.name == name)
        .map(|b| b.id)
        .unwrap_or_else(|| panic!("no block named {name}\n{f}"))
}

pub fn has_block(f: &FnIR, name: &str) -> bool {
    f.blocks.iter().any(|b| b.name == name)
}

/// Live loads and stores whose address is an element of `base`.
pub fn accesses_of(f: &FnIR, bb: BlockId, base: ValueId) -> Vec<ValueId> {
    f.blocks[bb]
        .insts
        .iter()
        .copied()
        .filter(|&v| {
            f.values[v].kind.access().is_some_and(|acc| {
                matches!(f.values[acc.ptr].kind, ValueKind::Addr { base: b, .. } if b == base)
            })
        })
        .collect()
}

pub fn live_loads_of(f: &FnIR, base: ValueId) -> usize {
    f.layout
        .iter()
        .flat_map(|&bb| accesses_of(f, bb, base))
        .filter(|&v| f.values[v].kind.is_load())
        .count()
}

pub fn live_stores_of(f: &FnIR, base: ValueId) -> usize {
    f.layout
        .iter()
        .flat_map(|&bb| accesses_of(f, bb, base))
        .filter(|&v| f.values[v].kind.is_store())
        .count()
}
