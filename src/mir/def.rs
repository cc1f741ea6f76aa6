use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{SmallVec, smallvec};

pub type BlockId = usize;
pub type ValueId = usize;
pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FnIR {
    pub name: String,
    pub blocks: Vec<Block>, // indices are BlockIds
    pub values: Vec<Value>, // indices are ValueIds
    pub entry: BlockId,
    // Physical block order. Cloned regions are spliced in here.
    pub layout: Vec<BlockId>,
    next_scope: ScopeId,
    undef: Option<ValueId>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub insts: Vec<ValueId>,
    pub term: Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Terminator {
    Goto(BlockId),
    If {
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Return(Option<ValueId>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Goto(t) => smallvec![*t],
            Terminator::If {
                then_bb, else_bb, ..
            } => smallvec![*then_bb, *else_bb],
            _ => SmallVec::new(),
        }
    }

    pub fn operand(&self) -> Option<ValueId> {
        match self {
            Terminator::If { cond, .. } => Some(*cond),
            Terminator::Return(v) => *v,
            _ => None,
        }
    }

    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        match self {
            Terminator::If { cond, .. } => *cond = f(*cond),
            Terminator::Return(Some(v)) => *v = f(*v),
            _ => {}
        }
    }

    pub fn map_blocks(&mut self, mut f: impl FnMut(BlockId) -> BlockId) {
        match self {
            Terminator::Goto(t) => *t = f(*t),
            Terminator::If {
                then_bb, else_bb, ..
            } => {
                *then_bb = f(*then_bb);
                *else_bb = f(*else_bb);
            }
            _ => {}
        }
    }

    pub fn replace_successor(&mut self, old: BlockId, new: BlockId) {
        self.map_blocks(|b| if b == old { new } else { b });
    }
}

/// Memory access capability of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub ptr: ValueId,
    pub is_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    MemRead,
    MemWrite,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    // Floating values (never placed in a block)
    Const(i64),
    Param {
        index: usize,
        noalias: bool,
    },
    Undef,

    // Fresh memory object: does not alias anything else in the function.
    Alloc {
        len: ValueId,
    },
    Phi {
        args: Vec<(ValueId, BlockId)>,
    },
    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    // Element address: &base[idx]
    Addr {
        base: ValueId,
        idx: ValueId,
    },
    Load {
        ptr: ValueId,
    },
    Store {
        ptr: ValueId,
        val: ValueId,
    },
    // True when the regions reachable from the two base objects during the
    // guarded loop do not overlap.
    MemCheck {
        lhs: ValueId,
        rhs: ValueId,
    },
}

impl ValueKind {
    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            ValueKind::Const(_) | ValueKind::Param { .. } | ValueKind::Undef
        )
    }

    pub fn access(&self) -> Option<MemAccess> {
        match self {
            ValueKind::Load { ptr } => Some(MemAccess {
                ptr: *ptr,
                is_write: false,
            }),
            ValueKind::Store { ptr, .. } => Some(MemAccess {
                ptr: *ptr,
                is_write: true,
            }),
            _ => None,
        }
    }

    pub fn op_class(&self) -> OpClass {
        match self.access() {
            Some(MemAccess { is_write: true, .. }) => OpClass::MemWrite,
            Some(MemAccess {
                is_write: false, ..
            }) => OpClass::MemRead,
            None => OpClass::Other,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, ValueKind::Load { .. })
    }

    pub fn is_store(&self) -> bool {
        matches!(self, ValueKind::Store { .. })
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, ValueKind::Phi { .. })
    }

    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        match self {
            ValueKind::Const(_) | ValueKind::Param { .. } | ValueKind::Undef => SmallVec::new(),
            ValueKind::Alloc { len } => smallvec![*len],
            ValueKind::Phi { args } => args.iter().map(|(v, _)| *v).collect(),
            ValueKind::Binary { lhs, rhs, .. } => smallvec![*lhs, *rhs],
            ValueKind::Addr { base, idx } => smallvec![*base, *idx],
            ValueKind::Load { ptr } => smallvec![*ptr],
            ValueKind::Store { ptr, val } => smallvec![*ptr, *val],
            ValueKind::MemCheck { lhs, rhs } => smallvec![*lhs, *rhs],
        }
    }

    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        match self {
            ValueKind::Const(_) | ValueKind::Param { .. } | ValueKind::Undef => {}
            ValueKind::Alloc { len } => *len = f(*len),
            ValueKind::Phi { args } => {
                for (v, _) in args.iter_mut() {
                    *v = f(*v);
                }
            }
            ValueKind::Binary { lhs, rhs, .. } | ValueKind::MemCheck { lhs, rhs } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            ValueKind::Addr { base, idx } => {
                *base = f(*base);
                *idx = f(*idx);
            }
            ValueKind::Load { ptr } => *ptr = f(*ptr),
            ValueKind::Store { ptr, val } => {
                *ptr = f(*ptr);
                *val = f(*val);
            }
        }
    }

    pub fn map_blocks(&mut self, mut f: impl FnMut(BlockId) -> BlockId) {
        if let ValueKind::Phi { args } = self {
            for (_, b) in args.iter_mut() {
                *b = f(*b);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasMeta {
    pub scopes: Vec<ScopeId>,
    pub noalias: Vec<ScopeId>,
}

#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub block: Option<BlockId>, // None for floating or erased values
    pub name: Option<String>,
    pub meta: AliasMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum User {
    Value(ValueId),
    Term(BlockId),
}

/// Original-to-copy mapping filled while cloning a region.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    pub values: FxHashMap<ValueId, ValueId>,
    pub blocks: FxHashMap<BlockId, BlockId>,
}

impl ValueMap {
    pub fn value(&self, v: ValueId) -> ValueId {
        self.values.get(&v).copied().unwrap_or(v)
    }

    pub fn block(&self, b: BlockId) -> BlockId {
        self.blocks.get(&b).copied().unwrap_or(b)
    }
}

impl FnIR {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            values: Vec::new(),
            entry: 0,
            layout: Vec::new(),
            next_scope: 0,
            undef: None,
        }
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            name: name.into(),
            insts: Vec::new(),
            // Set to a real terminator when the block is finalized.
            term: Terminator::Unreachable,
        });
        self.layout.push(id);
        id
    }

    fn new_value(&mut self, kind: ValueKind, block: Option<BlockId>, name: Option<String>) -> ValueId {
        let id = self.values.len();
        self.values.push(Value {
            id,
            kind,
            block,
            name,
            meta: AliasMeta::default(),
        });
        id
    }

    pub fn const_int(&mut self, n: i64) -> ValueId {
        self.new_value(ValueKind::Const(n), None, None)
    }

    pub fn param(&mut self, index: usize, noalias: bool, name: &str) -> ValueId {
        self.new_value(
            ValueKind::Param { index, noalias },
            None,
            Some(name.to_string()),
        )
    }

    pub fn undef(&mut self) -> ValueId {
        if let Some(u) = self.undef {
            return u;
        }
        let u = self.new_value(ValueKind::Undef, None, None);
        self.undef = Some(u);
        u
    }

    /// Appends an operation to the end of `bb` (before its terminator).
    pub fn push_inst(&mut self, bb: BlockId, kind: ValueKind, name: Option<&str>) -> ValueId {
        let pos = self.blocks[bb].insts.len();
        self.insert_inst(bb, pos, kind, name)
    }

    pub fn insert_inst(
        &mut self,
        bb: BlockId,
        pos: usize,
        kind: ValueKind,
        name: Option<&str>,
    ) -> ValueId {
        debug_assert!(!kind.is_floating(), "floating values are not placed");
        let id = self.new_value(kind, Some(bb), name.map(str::to_string));
        self.blocks[bb].insts.insert(pos, id);
        id
    }

    pub fn set_term(&mut self, bb: BlockId, term: Terminator) {
        self.blocks[bb].term = term;
    }

    pub fn successors(&self, bb: BlockId) -> SmallVec<[BlockId; 2]> {
        self.blocks[bb].term.successors()
    }

    pub fn predecessors(&self, bb: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &b in &self.layout {
            if self.blocks[b].term.successors().contains(&bb) && !out.contains(&b) {
                out.push(b);
            }
        }
        out
    }

    pub fn single_predecessor(&self, bb: BlockId) -> Option<BlockId> {
        let preds = self.predecessors(bb);
        if preds.len() == 1 { Some(preds[0]) } else { None }
    }

    pub fn phis(&self, bb: BlockId) -> Vec<ValueId> {
        self.blocks[bb]
            .insts
            .iter()
            .copied()
            .take_while(|v| self.values[*v].kind.is_phi())
            .collect()
    }

    pub fn users_of(&self, v: ValueId) -> Vec<User> {
        let mut users = Vec::new();
        for &bb in &self.layout {
            let blk = &self.blocks[bb];
            for &inst in &blk.insts {
                if self.values[inst].kind.operands().contains(&v) {
                    users.push(User::Value(inst));
                }
            }
            if blk.term.operand() == Some(v) {
                users.push(User::Term(bb));
            }
        }
        users
    }

    pub fn user_block(&self, user: User) -> Option<BlockId> {
        match user {
            User::Value(v) => self.values[v].block,
            User::Term(bb) => Some(bb),
        }
    }

    pub fn replace_uses_in(&mut self, user: User, old: ValueId, new: ValueId) {
        let swap = |x: ValueId| if x == old { new } else { x };
        match user {
            User::Value(v) => self.values[v].kind.map_operands(swap),
            User::Term(bb) => self.blocks[bb].term.map_operands(swap),
        }
    }

    /// Rewrites every placed use of `old` to `new`. Returns the number of users touched.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let users = self.users_of(old);
        for &u in &users {
            self.replace_uses_in(u, old, new);
        }
        users.len()
    }

    /// Detaches a placed operation from its block. The arena slot stays.
    pub fn erase_inst(&mut self, v: ValueId) {
        if let Some(bb) = self.values[v].block.take() {
            self.blocks[bb].insts.retain(|&i| i != v);
        }
    }

    pub fn is_detached(&self, v: ValueId) -> bool {
        let val = &self.values[v];
        !val.kind.is_floating() && val.block.is_none()
    }

    pub fn new_alias_scope(&mut self) -> ScopeId {
        let s = self.next_scope;
        self.next_scope += 1;
        s
    }

    /// Moves `blocks` (in the given order) directly in front of `before` in the layout.
    pub fn splice_before(&mut self, blocks: &[BlockId], before: BlockId) {
        let moving: FxHashSet<BlockId> = blocks.iter().copied().collect();
        self.layout.retain(|b| !moving.contains(b));
        let at = self
            .layout
            .iter()
            .position(|&b| b == before)
            .unwrap_or(self.layout.len());
        for (i, &b) in blocks.iter().enumerate() {
            self.layout.insert(at + i, b);
        }
    }

    /// Splits `bb` right before its terminator. The new block receives the
    /// terminator and `bb` falls through into it. Phis in the successors are
    /// redirected to the new block.
    pub fn split_before_term(&mut self, bb: BlockId, name: impl Into<String>) -> BlockId {
        let new_bb = self.add_block(name);
        let term = std::mem::replace(&mut self.blocks[bb].term, Terminator::Goto(new_bb));
        for succ in term.successors() {
            for phi in self.phis(succ) {
                self.values[phi]
                    .kind
                    .map_blocks(|b| if b == bb { new_bb } else { b });
            }
        }
        self.blocks[new_bb].term = term;
        // Keep the physical order readable: the new block follows `bb`.
        self.layout.retain(|&b| b != new_bb);
        let at = self
            .layout
            .iter()
            .position(|&b| b == bb)
            .map_or(self.layout.len(), |p| p + 1);
        self.layout.insert(at, new_bb);
        new_bb
    }

    /// Copies `bb` (operations and terminator, operands not yet remapped)
    /// into a fresh block at the end of the layout.
    pub fn clone_block(&mut self, bb: BlockId, vmap: &mut ValueMap, suffix: &str) -> BlockId {
        let name = format!("{}{}", self.blocks[bb].name, suffix);
        let new_bb = self.add_block(name);
        let insts = self.blocks[bb].insts.clone();
        for inst in insts {
            let src = &self.values[inst];
            let kind = src.kind.clone();
            let meta = src.meta.clone();
            let name = src.name.as_ref().map(|n| format!("{}{}", n, suffix));
            let copy = self.new_value(kind, Some(new_bb), name);
            self.values[copy].meta = meta;
            self.blocks[new_bb].insts.push(copy);
            vmap.values.insert(inst, copy);
        }
        self.blocks[new_bb].term = self.blocks[bb].term.clone();
        vmap.blocks.insert(bb, new_bb);
        new_bb
    }

    /// Rewrites operands, phi sources and successors of `bb` through `vmap`.
    /// Missing entries are left untouched.
    pub fn remap_block(&mut self, bb: BlockId, vmap: &ValueMap) {
        let insts = self.blocks[bb].insts.clone();
        for inst in insts {
            let kind = &mut self.values[inst].kind;
            kind.map_operands(|v| vmap.value(v));
            kind.map_blocks(|b| vmap.block(b));
        }
        let term = &mut self.blocks[bb].term;
        term.map_operands(|v| vmap.value(v));
        term.map_blocks(|b| vmap.block(b));
    }

    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;
        while let Some((bb, idx)) = stack.pop() {
            let succs = self.successors(bb);
            if idx < succs.len() {
                stack.push((bb, idx + 1));
                let next = succs[idx];
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            } else {
                post.push(bb);
            }
        }
        post.reverse();
        post
    }
}

pub fn build_pred_map(fn_ir: &FnIR) -> FxHashMap<BlockId, Vec<BlockId>> {
    let mut map: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for &src in &fn_ir.layout {
        for t in fn_ir.successors(src) {
            let preds = map.entry(t).or_default();
            if !preds.contains(&src) {
                preds.push(src);
            }
        }
    }
    map
}
