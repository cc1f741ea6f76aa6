use crate::mir::analyze::alias::{alias_class_for_base, may_alias, underlying_object};
use crate::mir::opt::loop_analysis::{LoopId, LoopNest};
use crate::mir::*;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InductionVar {
    pub phi: ValueId,
    pub step: i64,
}

/// Element subscript of an access, relative to the induction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscript {
    Affine(i64),
    Invariant(ValueId),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub inst: ValueId,
    pub ptr: ValueId,
    pub is_write: bool,
    pub base: ValueId,
    pub subscript: Subscript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Forward,
    Backward,
    Unknown,
}

/// A loop-carried dependence between two accesses, named by their position
/// in program order. `source` always precedes `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependence {
    pub source: usize,
    pub destination: usize,
    pub kind: DepKind,
}

impl Dependence {
    pub fn is_possibly_backward(&self) -> bool {
        matches!(self.kind, DepKind::Backward | DepKind::Unknown)
    }
}

#[derive(Debug, Clone)]
pub struct PointerInfo {
    pub ptr: ValueId,
    pub is_write: bool,
    pub base: ValueId,
    pub members: SmallVec<[ValueId; 2]>,
    // Pointers into the same object share a dependence set; their relation
    // is already decided statically.
    pub dep_set: usize,
    pub alias_set: usize,
    pub checkable: bool,
}

#[derive(Debug, Clone)]
pub struct LoopAccessInfo {
    pub accesses: Vec<Access>,
    pub dependences: Vec<Dependence>,
    pub pointers: Vec<PointerInfo>,
    pub can_vectorize_memory: bool,
}

fn const_value(fn_ir: &FnIR, v: ValueId) -> Option<i64> {
    match fn_ir.values[v].kind {
        ValueKind::Const(n) => Some(n),
        _ => None,
    }
}

pub fn is_loop_invariant(fn_ir: &FnIR, loops: &LoopNest, lp: LoopId, v: ValueId) -> bool {
    let val = &fn_ir.values[v];
    if val.kind.is_floating() {
        return true;
    }
    match val.block {
        Some(bb) => !loops.contains(lp, bb),
        None => false,
    }
}

/// A header phi that advances by a constant 1 or -1 along the latch edge.
pub fn find_induction_var(fn_ir: &FnIR, loops: &LoopNest, lp: LoopId) -> Option<InductionVar> {
    let latch = loops.latch(fn_ir, lp)?;
    for phi in fn_ir.phis(loops.header(lp)) {
        let ValueKind::Phi { args } = &fn_ir.values[phi].kind else {
            continue;
        };
        let Some(&(next, _)) = args.iter().find(|(_, b)| *b == latch) else {
            continue;
        };
        let step = match fn_ir.values[next].kind {
            ValueKind::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } if lhs == phi => const_value(fn_ir, rhs),
            ValueKind::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } if rhs == phi => const_value(fn_ir, lhs),
            ValueKind::Binary {
                op: BinOp::Sub,
                lhs,
                rhs,
            } if lhs == phi => const_value(fn_ir, rhs).and_then(i64::checked_neg),
            _ => None,
        };
        if let Some(step @ (1 | -1)) = step {
            return Some(InductionVar { phi, step });
        }
    }
    None
}

fn subscript_of(
    fn_ir: &FnIR,
    loops: &LoopNest,
    lp: LoopId,
    iv: Option<InductionVar>,
    idx: ValueId,
) -> Subscript {
    if is_loop_invariant(fn_ir, loops, lp, idx) {
        return Subscript::Invariant(idx);
    }
    let Some(iv) = iv else {
        return Subscript::Unknown;
    };
    if idx == iv.phi {
        return Subscript::Affine(0);
    }
    let offset = match fn_ir.values[idx].kind {
        ValueKind::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
        } if lhs == iv.phi => const_value(fn_ir, rhs),
        ValueKind::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
        } if rhs == iv.phi => const_value(fn_ir, lhs),
        ValueKind::Binary {
            op: BinOp::Sub,
            lhs,
            rhs,
        } if lhs == iv.phi => const_value(fn_ir, rhs).and_then(i64::checked_neg),
        _ => None,
    };
    offset.map_or(Subscript::Unknown, Subscript::Affine)
}

impl LoopAccessInfo {
    pub fn analyze(fn_ir: &FnIR, loops: &LoopNest, lp: LoopId) -> Self {
        let iv = find_induction_var(fn_ir, loops, lp);

        // 1. Accesses in program order.
        let mut accesses = Vec::new();
        for &bb in loops.blocks(lp) {
            for &inst in &fn_ir.blocks[bb].insts {
                let Some(acc) = fn_ir.values[inst].kind.access() else {
                    continue;
                };
                let base = underlying_object(fn_ir, acc.ptr);
                let subscript = match fn_ir.values[acc.ptr].kind {
                    ValueKind::Addr { base: b, idx } if b == base => {
                        subscript_of(fn_ir, loops, lp, iv, idx)
                    }
                    ValueKind::Addr { .. } => Subscript::Unknown,
                    _ => Subscript::Invariant(acc.ptr),
                };
                accesses.push(Access {
                    inst,
                    ptr: acc.ptr,
                    is_write: acc.is_write,
                    base,
                    subscript,
                });
            }
        }

        // 2. Pairwise dependences over accesses to the same object.
        let step = iv.map_or(1, |iv| iv.step);
        let mut dependences = Vec::new();
        for i in 0..accesses.len() {
            for j in (i + 1)..accesses.len() {
                let (a, b) = (&accesses[i], &accesses[j]);
                if !(a.is_write || b.is_write) || a.base != b.base {
                    continue;
                }
                let kind = if !is_loop_invariant(fn_ir, loops, lp, a.base) {
                    Some(DepKind::Unknown)
                } else {
                    classify(fn_ir, a.subscript, b.subscript, step)
                };
                if let Some(kind) = kind {
                    dependences.push(Dependence {
                        source: i,
                        destination: j,
                        kind,
                    });
                }
            }
        }
        let can_vectorize_memory = !dependences.iter().any(Dependence::is_possibly_backward);

        // 3. Pointer descriptors, grouped by (address, is_write).
        let mut pointers: Vec<PointerInfo> = Vec::new();
        let mut by_key: FxHashMap<(ValueId, bool), usize> = FxHashMap::default();
        let mut bases: Vec<ValueId> = Vec::new();
        for acc in &accesses {
            let idx = *by_key.entry((acc.ptr, acc.is_write)).or_insert_with(|| {
                let dep_set = match bases.iter().position(|&b| b == acc.base) {
                    Some(p) => p,
                    None => {
                        bases.push(acc.base);
                        bases.len() - 1
                    }
                };
                pointers.push(PointerInfo {
                    ptr: acc.ptr,
                    is_write: acc.is_write,
                    base: acc.base,
                    members: SmallVec::new(),
                    dep_set,
                    alias_set: 0,
                    checkable: is_loop_invariant(fn_ir, loops, lp, acc.base),
                });
                pointers.len() - 1
            });
            pointers[idx].members.push(acc.inst);
        }

        // Alias sets: may-alias closure over the base objects.
        let classes: Vec<_> = bases.iter().map(|&b| alias_class_for_base(fn_ir, b)).collect();
        let mut set_of: Vec<usize> = (0..bases.len()).collect();
        for i in 0..bases.len() {
            for j in 0..i {
                if may_alias(&classes[i], &classes[j]) {
                    let (from, to) = (set_of[i], set_of[j]);
                    for s in set_of.iter_mut() {
                        if *s == from {
                            *s = to;
                        }
                    }
                }
            }
        }
        for p in pointers.iter_mut() {
            p.alias_set = set_of[p.dep_set];
        }

        Self {
            accesses,
            dependences,
            pointers,
            can_vectorize_memory,
        }
    }

    pub fn memory_instructions(&self) -> Vec<ValueId> {
        self.accesses.iter().map(|a| a.inst).collect()
    }

    pub fn possibly_backward(&self) -> impl Iterator<Item = &Dependence> {
        self.dependences.iter().filter(|d| d.is_possibly_backward())
    }

    /// Whether pointers `i` and `j` must be proven disjoint at run time.
    ///
    /// `ptr_partition` holds the partition of each pointer (-1 when shared).
    /// `forwarding` holds the addresses taking part in store-to-load
    /// forwarding; a non-empty set forces checks between those and every
    /// other write in their alias set.
    pub fn needs_checking(
        &self,
        i: usize,
        j: usize,
        ptr_partition: &[i32],
        forwarding: &FxHashSet<ValueId>,
    ) -> bool {
        let (a, b) = (&self.pointers[i], &self.pointers[j]);
        if !a.is_write && !b.is_write {
            return false;
        }
        if a.alias_set != b.alias_set || a.dep_set == b.dep_set {
            return false;
        }
        if forwarding.contains(&a.ptr) != forwarding.contains(&b.ptr) {
            return true;
        }
        let (pa, pb) = (ptr_partition[i], ptr_partition[j]);
        !(pa != -1 && pa == pb)
    }

    pub fn required_checks(
        &self,
        ptr_partition: &[i32],
        forwarding: &FxHashSet<ValueId>,
    ) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for i in 0..self.pointers.len() {
            for j in (i + 1)..self.pointers.len() {
                if self.needs_checking(i, j, ptr_partition, forwarding) {
                    out.push((i, j));
                }
            }
        }
        out
    }

    pub fn needs_any_checking(&self, ptr_partition: &[i32], forwarding: &FxHashSet<ValueId>) -> bool {
        !self.required_checks(ptr_partition, forwarding).is_empty()
    }

    pub fn can_check(&self, pairs: &[(usize, usize)]) -> bool {
        pairs
            .iter()
            .all(|&(i, j)| self.pointers[i].checkable && self.pointers[j].checkable)
    }

    /// Emits one `MemCheck` per distinct pair of base objects at the end of
    /// `bb` and folds them into a single guard. `None` if nothing is required.
    pub fn add_runtime_checks(
        &self,
        fn_ir: &mut FnIR,
        bb: BlockId,
        pairs: &[(usize, usize)],
    ) -> Option<ValueId> {
        let mut seen: FxHashSet<(ValueId, ValueId)> = FxHashSet::default();
        let mut guard: Option<ValueId> = None;
        for &(i, j) in pairs {
            let (a, b) = (self.pointers[i].base, self.pointers[j].base);
            let key = if a <= b { (a, b) } else { (b, a) };
            if !seen.insert(key) {
                continue;
            }
            let check = fn_ir.push_inst(
                bb,
                ValueKind::MemCheck { lhs: key.0, rhs: key.1 },
                Some("ldist.check"),
            );
            guard = Some(match guard {
                None => check,
                Some(prev) => fn_ir.push_inst(
                    bb,
                    ValueKind::Binary {
                        op: BinOp::And,
                        lhs: prev,
                        rhs: check,
                    },
                    Some("ldist.guard"),
                ),
            });
        }
        guard
    }
}

fn classify(fn_ir: &FnIR, a: Subscript, b: Subscript, step: i64) -> Option<DepKind> {
    match (a, b) {
        (Subscript::Affine(x), Subscript::Affine(y)) => {
            // The earlier access at iteration t+d touches what the later one
            // touched at iteration t.
            let Some(d) = y.checked_sub(x).and_then(|d| d.checked_mul(step)) else {
                return Some(DepKind::Unknown);
            };
            match d {
                0 => None,
                d if d > 0 => Some(DepKind::Backward),
                _ => Some(DepKind::Forward),
            }
        }
        (Subscript::Invariant(p), Subscript::Invariant(q)) => {
            if p == q {
                return Some(DepKind::Backward);
            }
            match (const_value(fn_ir, p), const_value(fn_ir, q)) {
                (Some(x), Some(y)) if x == y => Some(DepKind::Backward),
                (Some(_), Some(_)) => None,
                _ => Some(DepKind::Unknown),
            }
        }
        _ => Some(DepKind::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::opt::dom::DomTree;

    struct Counted {
        f: FnIR,
        body: BlockId,
        i: ValueId,
        a: ValueId,
        b: ValueId,
    }

    // ph -> header(i = phi; i < n) -> body -> header ; header -> exit
    fn counted(noalias: bool) -> Counted {
        let mut f = FnIR::new("counted");
        let ph = f.add_block("ph");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");
        f.entry = ph;
        let a = f.param(0, noalias, "a");
        let b = f.param(1, noalias, "b");
        let n = f.param(2, false, "n");
        let zero = f.const_int(0);
        let one = f.const_int(1);
        let i = f.push_inst(header, ValueKind::Phi { args: vec![] }, Some("i"));
        let cond = f.push_inst(
            header,
            ValueKind::Binary {
                op: BinOp::Lt,
                lhs: i,
                rhs: n,
            },
            None,
        );
        f.set_term(ph, Terminator::Goto(header));
        f.set_term(
            header,
            Terminator::If {
                cond,
                then_bb: body,
                else_bb: exit,
            },
        );
        f.set_term(body, Terminator::Goto(header));
        f.set_term(exit, Terminator::Return(None));
        let next = f.push_inst(
            body,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: i,
                rhs: one,
            },
            Some("i.next"),
        );
        f.values[i].kind = ValueKind::Phi {
            args: vec![(zero, ph), (next, body)],
        };
        Counted { f, body, i, a, b }
    }

    fn at(c: &mut Counted, base: ValueId, offset: i64) -> ValueId {
        let k = c.f.const_int(offset);
        let idx = c.f.insert_inst(
            c.body,
            0,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: c.i,
                rhs: k,
            },
            None,
        );
        let pos = c.f.blocks[c.body].insts.len() - 1;
        c.f.insert_inst(c.body, pos, ValueKind::Addr { base, idx }, None)
    }

    fn before_step(c: &mut Counted, kind: ValueKind) -> ValueId {
        let pos = c.f.blocks[c.body].insts.len() - 1;
        c.f.insert_inst(c.body, pos, kind, None)
    }

    fn analyze(f: &FnIR) -> LoopAccessInfo {
        let dt = DomTree::compute(f);
        let nest = LoopNest::analyze(f, &dt);
        LoopAccessInfo::analyze(f, &nest, nest.innermost_loops()[0])
    }

    #[test]
    fn recognizes_unit_stride_induction() {
        let c = counted(false);
        let dt = DomTree::compute(&c.f);
        let nest = LoopNest::analyze(&c.f, &dt);
        let iv = find_induction_var(&c.f, &nest, 0);
        assert_eq!(iv, Some(InductionVar { phi: c.i, step: 1 }));
    }

    #[test]
    fn store_ahead_of_load_is_backward() {
        // a[i+1] = a[i]
        let mut c = counted(false);
        let a = c.a;
        let p_ld = at(&mut c, a, 0);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, a, 1);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });

        let lai = analyze(&c.f);
        assert_eq!(lai.accesses.len(), 2);
        assert!(!lai.can_vectorize_memory);
        assert_eq!(
            lai.dependences,
            vec![Dependence {
                source: 0,
                destination: 1,
                kind: DepKind::Backward
            }]
        );
    }

    #[test]
    fn load_ahead_of_store_is_forward() {
        // a[i] = a[i+1]
        let mut c = counted(false);
        let a = c.a;
        let p_ld = at(&mut c, a, 1);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, a, 0);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });

        let lai = analyze(&c.f);
        assert!(lai.can_vectorize_memory);
        assert_eq!(lai.dependences[0].kind, DepKind::Forward);
        assert_eq!(lai.possibly_backward().count(), 0);
    }

    #[test]
    fn overflowing_distance_is_unknown() {
        // a[i + MAX] = a[i + MIN]
        let mut c = counted(false);
        let a = c.a;
        let p_ld = at(&mut c, a, i64::MIN);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, a, i64::MAX);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });

        let lai = analyze(&c.f);
        assert_eq!(lai.accesses[0].subscript, Subscript::Affine(i64::MIN));
        assert_eq!(lai.dependences[0].kind, DepKind::Unknown);
        assert!(!lai.can_vectorize_memory);
    }

    #[test]
    fn subtracting_min_is_not_affine() {
        // a[i - MIN]
        let mut c = counted(false);
        let (a, i) = (c.a, c.i);
        let k = c.f.const_int(i64::MIN);
        let idx = before_step(
            &mut c,
            ValueKind::Binary {
                op: BinOp::Sub,
                lhs: i,
                rhs: k,
            },
        );
        let ptr = before_step(&mut c, ValueKind::Addr { base: a, idx });
        before_step(&mut c, ValueKind::Load { ptr });

        let lai = analyze(&c.f);
        assert_eq!(lai.accesses[0].subscript, Subscript::Unknown);
    }

    #[test]
    fn pointers_get_dependence_and_alias_sets() {
        // b[i] = a[i]  with plain params: different objects that may alias
        let mut c = counted(false);
        let (a, b) = (c.a, c.b);
        let p_ld = at(&mut c, a, 0);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, b, 0);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });

        let lai = analyze(&c.f);
        assert_eq!(lai.pointers.len(), 2);
        assert_ne!(lai.pointers[0].dep_set, lai.pointers[1].dep_set);
        assert_eq!(lai.pointers[0].alias_set, lai.pointers[1].alias_set);
        assert!(lai.can_check(&[(0, 1)]));

        let none = FxHashSet::default();
        assert!(lai.needs_checking(0, 1, &[0, 1], &none));
        assert!(!lai.needs_checking(0, 1, &[1, 1], &none));
        assert!(lai.needs_checking(0, 1, &[-1, -1], &none));

        let fwd: FxHashSet<ValueId> = [p_ld].into_iter().collect();
        assert!(lai.needs_checking(0, 1, &[1, 1], &fwd));
    }

    #[test]
    fn noalias_params_never_need_checks() {
        let mut c = counted(true);
        let (a, b) = (c.a, c.b);
        let p_ld = at(&mut c, a, 0);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, b, 0);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });

        let lai = analyze(&c.f);
        assert_ne!(lai.pointers[0].alias_set, lai.pointers[1].alias_set);
        assert!(!lai.needs_any_checking(&[0, 1], &FxHashSet::default()));
    }

    #[test]
    fn runtime_checks_fold_into_one_guard() {
        let mut c = counted(false);
        let (a, b) = (c.a, c.b);
        let p_ld = at(&mut c, a, 0);
        let ld = before_step(&mut c, ValueKind::Load { ptr: p_ld });
        let p_st = at(&mut c, b, 0);
        before_step(&mut c, ValueKind::Store { ptr: p_st, val: ld });
        let p_st2 = at(&mut c, b, 2);
        before_step(&mut c, ValueKind::Store { ptr: p_st2, val: ld });

        let lai = analyze(&c.f);
        let pairs = lai.required_checks(&[0, 1, 2], &FxHashSet::default());
        assert_eq!(pairs, vec![(0, 1), (0, 2)]);
        let ph = c.f.entry;
        let guard = lai.add_runtime_checks(&mut c.f, ph, &pairs);
        // Both pairs compare the same two objects: one check, no fold.
        assert_eq!(c.f.blocks[ph].insts.len(), 1);
        assert!(matches!(
            guard.map(|g| &c.f.values[g].kind),
            Some(&ValueKind::MemCheck { lhs, rhs }) if lhs == a && rhs == b
        ));
    }
}
