use crate::mir::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AliasClass {
    Fresh(ValueId),
    Restrict(usize),
    Param(usize),
    Unknown,
}

/// Strips element-address arithmetic down to the object being indexed.
pub fn underlying_object(fn_ir: &FnIR, ptr: ValueId) -> ValueId {
    let mut cur = ptr;
    while let ValueKind::Addr { base, .. } = &fn_ir.values[cur].kind {
        cur = *base;
    }
    cur
}

pub fn alias_class_for_base(fn_ir: &FnIR, base: ValueId) -> AliasClass {
    match &fn_ir.values[base].kind {
        ValueKind::Alloc { .. } => AliasClass::Fresh(base),
        ValueKind::Param { index, noalias } => {
            if *noalias {
                AliasClass::Restrict(*index)
            } else {
                AliasClass::Param(*index)
            }
        }
        _ => AliasClass::Unknown,
    }
}

pub fn may_alias(a: &AliasClass, b: &AliasClass) -> bool {
    match (a, b) {
        _ if a == b => true,
        (AliasClass::Fresh(_), _) | (_, AliasClass::Fresh(_)) => false,
        (AliasClass::Restrict(_), _) | (_, AliasClass::Restrict(_)) => false,
        _ => true,
    }
}
