//! The restricted constant-expression interpreter used for global
//! initializers and element/data segment offsets (§4.F phase 3).
//!
//! Wasm 1.0 only allows a single instruction here, drawn from a small set
//! that needs no control flow or operand stack of its own — evaluating one
//! is just a match over the AST's `ConstExpr`, with `global.get` resolved
//! against the partially built `ModuleInst`'s import table (only imported
//! globals may be referenced, per the spec: a module's own globals aren't
//! initialized yet at this point).

use crate::ast::ConstExpr;
use crate::runtime::Store;
use crate::value::Value;

use super::PartialInst;

/// Evaluate a constant expression in the context of a module instance still
/// being built. `partial` only needs its `globaladdrs` filled in so far,
/// which phase 1 (import resolution) guarantees before this runs.
pub fn eval(expr: ConstExpr, store: &Store, partial: &PartialInst) -> Value {
    match expr {
        ConstExpr::I32Const(v) => Value::I32(v),
        ConstExpr::I64Const(v) => Value::I64(v),
        ConstExpr::F32Const(v) => Value::F32(v),
        ConstExpr::F64Const(v) => Value::F64(v),
        ConstExpr::GlobalGet(idx) => {
            let addr = partial.globaladdrs[idx as usize];
            store.global_value(addr)
        }
    }
}

/// Evaluate a constant expression that must yield an `i32`, as required by
/// element and data segment offsets. Returns the offset as a `usize`,
/// rejecting negative values the same way the original runtime does: by
/// treating the i32 bit pattern as unsigned.
pub fn eval_i32_offset(expr: crate::ast::ConstExprKind, store: &Store, partial: &PartialInst) -> usize {
    match eval(expr.into(), store, partial) {
        Value::I32(v) => v as u32 as usize,
        other => panic!("segment offset expression produced non-i32 value {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::GlobalAddr;
    use crate::value::ValType;

    #[test]
    fn const_i32_evaluates_directly() {
        let store = Store::new();
        let partial = PartialInst::default();
        assert_eq!(eval(ConstExpr::I32Const(42), &store, &partial), Value::I32(42));
    }

    #[test]
    fn global_get_reads_through_partial_instance() {
        let mut store = Store::new();
        let addr = store.add_global(crate::runtime::GlobalInst::new(Value::I64(7), false));
        let mut partial = PartialInst::default();
        partial.globaladdrs.push(addr);
        assert_eq!(eval(ConstExpr::GlobalGet(0), &store, &partial), Value::I64(7));
        let _: GlobalAddr = addr;
        let _ = ValType::I64;
    }
}
