use crate::mir::*;
use std::fmt::{self, Write};

pub fn value_ref(fn_ir: &FnIR, v: ValueId) -> String {
    let val = &fn_ir.values[v];
    match &val.kind {
        ValueKind::Const(n) => n.to_string(),
        ValueKind::Undef => "undef".to_string(),
        _ => match &val.name {
            Some(name) => format!("%{}", name),
            None => format!("%v{}", v),
        },
    }
}

pub fn render_value(fn_ir: &FnIR, v: ValueId) -> String {
    let r = |x: ValueId| value_ref(fn_ir, x);
    let val = &fn_ir.values[v];
    let body = match &val.kind {
        ValueKind::Const(n) => format!("const {}", n),
        ValueKind::Param { index, noalias } => {
            if *noalias {
                format!("param {} noalias", index)
            } else {
                format!("param {}", index)
            }
        }
        ValueKind::Undef => "undef".to_string(),
        ValueKind::Alloc { len } => format!("alloc {}", r(*len)),
        ValueKind::Phi { args } => {
            let parts: Vec<String> = args
                .iter()
                .map(|(a, b)| format!("[{}, {}]", r(*a), fn_ir.blocks[*b].name))
                .collect();
            format!("phi {}", parts.join(", "))
        }
        ValueKind::Binary { op, lhs, rhs } => format!("{} {} {}", r(*lhs), op.symbol(), r(*rhs)),
        ValueKind::Addr { base, idx } => format!("&{}[{}]", r(*base), r(*idx)),
        ValueKind::Load { ptr } => format!("load {}", r(*ptr)),
        ValueKind::Store { ptr, val } => format!("store {}, {}", r(*val), r(*ptr)),
        ValueKind::MemCheck { lhs, rhs } => format!("memcheck {}, {}", r(*lhs), r(*rhs)),
    };
    if val.kind.is_store() {
        format!("{}{}", body, meta(&val.meta))
    } else {
        format!("{} = {}{}", r(v), body, meta(&val.meta))
    }
}

fn meta(m: &AliasMeta) -> String {
    let mut out = String::new();
    if !m.scopes.is_empty() {
        let _ = write!(out, " !alias.scope {:?}", m.scopes);
    }
    if !m.noalias.is_empty() {
        let _ = write!(out, " !noalias {:?}", m.noalias);
    }
    out
}

pub fn render_term(fn_ir: &FnIR, term: &Terminator) -> String {
    let name = |b: BlockId| fn_ir.blocks[b].name.clone();
    match term {
        Terminator::Goto(t) => format!("goto {}", name(*t)),
        Terminator::If {
            cond,
            then_bb,
            else_bb,
        } => format!(
            "if {} then {} else {}",
            value_ref(fn_ir, *cond),
            name(*then_bb),
            name(*else_bb)
        ),
        Terminator::Return(Some(v)) => format!("return {}", value_ref(fn_ir, *v)),
        Terminator::Return(None) => "return".to_string(),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

pub fn render_block(fn_ir: &FnIR, bb: BlockId) -> String {
    let blk = &fn_ir.blocks[bb];
    let mut out = format!("{}:\n", blk.name);
    for &inst in &blk.insts {
        out.push_str("  ");
        out.push_str(&render_value(fn_ir, inst));
        out.push('\n');
    }
    out.push_str("  ");
    out.push_str(&render_term(fn_ir, &blk.term));
    out.push('\n');
    out
}

impl fmt::Display for FnIR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {} {{", self.name)?;
        for &bb in &self.layout {
            write!(f, "{}", render_block(self, bb))?;
        }
        write!(f, "}}")
    }
}
