//! The embedding API (§4.K / §6): the only surface a host — a CLI driver, a
//! character-device ioctl handler, a binfmt hook, none of which this crate
//! implements — needs to load, link, and run wasm modules.
//!
//! A loaded [`Module`] is kept alive in an `Rc` for as long as any
//! instantiation of it can still be invoked: compiled code carries
//! `RelocKind::FuncTypeDesc` pointers straight at a `Module`'s `FuncType`
//! values, so those values must never move or be freed while reachable.

use std::rc::Rc;

use crate::ast::{ElemType, GlobalType, ImportDesc, Limits, MemoryType, Module, TableType};
use crate::error::{DecodeError, LinkError};
use crate::link;
use crate::runtime::{ExternAddr, FuncAddr, FuncInst, FuncKind, GlobalAddr, GlobalInst, MemAddr, MemInst, Store, TableAddr, TableInst};
use crate::value::{FuncType, Value};

/// Create a fresh, empty `Store`.
pub fn store_new() -> Store {
    Store::new()
}

/// Register a host-owned memory under `(module, name)`, available to later
/// `instantiate` calls as an import.
pub fn import_memory(store: &mut Store, module: &str, name: &str, size_pages: u32, max_pages: Option<u32>) -> MemAddr {
    let addr = store.add_memory(MemInst::new(size_pages, max_pages));
    store.bind_name(module, name, ExternAddr::Mem(addr));
    addr
}

/// Register a host function under `(module, name)`. `f` is called with the
/// wasm arguments already typed per `signature`; returning `Err` raises the
/// given trap at the call site instead of returning normally.
pub fn import_function<F>(store: &mut Store, module: &str, name: &str, signature: FuncType, f: F) -> FuncAddr
where
    F: Fn(&[Value]) -> Result<Option<Value>, crate::error::TrapCode> + Send + Sync + 'static,
{
    let trampoline_buf_size = 256;
    let mut codebuf = crate::compiler::codebuf::CodeBuffer::new(trampoline_buf_size).expect("host trampoline allocation");
    // The closure needs a `Store` address before the trampoline can bake it
    // in, so reserve the `FuncInst` first with a placeholder entry, build
    // the trampoline against that address, then patch `entry` in.
    let addr = store.add_function(FuncInst {
        ty: signature.clone(),
        kind: FuncKind::Host(Box::new(f)),
        entry: std::ptr::null(),
        relocs: Vec::new(),
    });
    let offset = crate::compiler::helpers::build_host_trampoline(&mut codebuf, &signature, addr);
    codebuf.mark_executable().expect("host trampoline mark_executable");
    let entry = codebuf.entry_at(offset);
    store.func_mut(addr).entry = entry;
    store.code_buffers.push(codebuf);
    store.bind_name(module, name, ExternAddr::Func(addr));
    addr
}

/// Register a host-owned table under `(module, name)`.
pub fn import_table(store: &mut Store, module: &str, name: &str, elemtype: ElemType, length: u32, max: Option<u32>) -> TableAddr {
    let addr = store.add_table(TableInst::new(length, max, elemtype));
    store.bind_name(module, name, ExternAddr::Table(addr));
    addr
}

/// Register a host-owned global under `(module, name)`.
pub fn import_global(store: &mut Store, module: &str, name: &str, value: Value, mutable: bool) -> GlobalAddr {
    let addr = store.add_global(GlobalInst::new(value, mutable));
    store.bind_name(module, name, ExternAddr::Global(addr));
    addr
}

/// Decode a wasm binary into a [`Module`], not yet instantiated.
pub fn load_module(bytes: &[u8]) -> Result<Rc<Module>, DecodeError> {
    let module = crate::decode::decode_module(bytes)?;
    log::debug!(
        "decoded module: {} types, {} funcs, {} tables, {} memories, {} globals",
        module.types.len(),
        module.functions.len(),
        module.tables.len(),
        module.memories.len(),
        module.globals.len(),
    );
    Ok(Rc::new(module))
}

/// Instantiate `module` against `store` under `module_name`, resolving
/// imports, running element/data segments, and invoking the start function
/// if present. Returns the start function's entry address, if any.
pub fn instantiate(module: &Rc<Module>, module_name: &str, store: &mut Store) -> Result<Option<FuncAddr>, LinkError> {
    let start = link::instantiate(module, module_name, store)?;
    store.retain_module(Rc::clone(module));
    Ok(start)
}

/// Look up an export by `(module_name, name)`.
pub fn get_export(store: &Store, module_name: &str, name: &str) -> Option<ExternAddr> {
    store.lookup(module_name, name)
}

/// Call an exported (or otherwise addressed) function with `args`, typed
/// per its own declared signature.
pub fn invoke(store: &Store, addr: FuncAddr, args: &[Value]) -> Result<Option<Value>, crate::error::TrapCode> {
    let finst = store.func(addr);
    let ty = finst.ty.clone();
    let entry = finst.entry;
    crate::invoke::invoke(store, entry, &ty, args)
}

/// Convenience constructor for a plain `(limits, elemtype)` table import
/// descriptor shape, mirroring how `embed` callers typically build up an
/// `ImportDesc` to check compatibility against before instantiating — not
/// exercised by the linker itself, which reads these fields straight off
/// the decoded `Module`.
pub fn table_desc(min: u32, max: Option<u32>, elemtype: ElemType) -> ImportDesc {
    ImportDesc::Table(TableType { elemtype, limits: Limits { min, max } })
}

pub fn memory_desc(min: u32, max: Option<u32>) -> ImportDesc {
    ImportDesc::Memory(MemoryType { limits: Limits { min, max } })
}

pub fn global_desc(valtype: crate::value::ValType, mutable: bool) -> ImportDesc {
    ImportDesc::Global(GlobalType { valtype, mutable })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValType;

    #[test]
    fn store_new_starts_empty() {
        let store = store_new();
        assert!(store.lookup("env", "anything").is_none());
    }

    #[test]
    fn import_function_is_invocable_directly() {
        let mut store = store_new();
        let ty = FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        let addr = import_function(&mut store, "env", "add", ty, |args| {
            let a = args[0].as_i32().unwrap();
            let b = args[1].as_i32().unwrap();
            Ok(Some(Value::I32(a + b)))
        });
        let result = invoke(&store, addr, &[Value::I32(2), Value::I32(40)]).unwrap();
        assert_eq!(result, Some(Value::I32(42)));
    }

    #[test]
    fn import_function_trap_propagates() {
        let mut store = store_new();
        let ty = FuncType::new(vec![], vec![]);
        let addr = import_function(&mut store, "env", "boom", ty, |_| Err(crate::error::TrapCode::Abort));
        let err = invoke(&store, addr, &[]).unwrap_err();
        assert_eq!(err, crate::error::TrapCode::Abort);
    }
}
