//! The linker: turns a decoded [`Module`] plus a [`Store`] into a live
//! [`ModuleInst`], in the eleven phases a complete instantiation needs —
//! import resolution, allocation, constant-expression evaluation, global
//! initialization, compilation, segment execution, relocation patching,
//! code-page freezing, export registration, and finally the start function.
//!
//! Any failure from phase 2 onward rolls the `Store` back to exactly the
//! state it had before `instantiate` was called, via `Store::mark`/
//! `Store::rollback_to` — a module either lands whole or not at all.

mod constexpr;

use crate::ast::{ExternKind, ImportDesc, Module};
use crate::compiler::codebuf::CodeBuffer;
use crate::compiler::codegen;
use crate::error::LinkError;
use crate::runtime::{ExternAddr, FuncAddr, FuncInst, FuncKind, GlobalInst, MemInst, ModuleInst, Reloc, RelocKind, Store, TableInst};
use crate::value::{FuncType, Value};

/// `ModuleInst` under construction; grows one field at a time as each phase
/// runs. The finished product is exactly a `ModuleInst` once phase 11 is
/// done, so this is just an alias rather than a separate type.
pub type PartialInst = ModuleInst;

/// Instantiate `module` against `store`, registering every export under
/// `module_name`. Returns the address of the start function's entry point,
/// if the module has one — mirroring `startaddr` in spec.md §4.F, not
/// invoked a second time by the caller (phase 11 already ran it).
pub fn instantiate(module: &Module, module_name: &str, store: &mut Store) -> Result<Option<FuncAddr>, LinkError> {
    let marks = store.mark();
    match instantiate_inner(module, module_name, store) {
        Ok(start) => Ok(start),
        Err(e) => {
            log::warn!("instantiation of {module_name} failed, rolling back: {e}");
            store.rollback_to(marks);
            Err(e)
        }
    }
}

fn instantiate_inner(module: &Module, module_name: &str, store: &mut Store) -> Result<Option<FuncAddr>, LinkError> {
    let mut inst = PartialInst::default();

    // Phase 1: resolve imports.
    for imp in &module.imports {
        let found = store
            .lookup(&imp.module, &imp.name)
            .ok_or_else(|| LinkError::MissingImport { module: imp.module.clone(), name: imp.name.clone() })?;
        if found.kind() != imp.desc.kind() {
            return Err(LinkError::KindMismatch { module: imp.module.clone(), name: imp.name.clone() });
        }
        match (&imp.desc, found) {
            (ImportDesc::Func(tyidx), ExternAddr::Func(addr)) => {
                let expected = &module.types[*tyidx as usize];
                let actual = &store.func(addr).ty;
                if actual.inputs != expected.inputs || actual.outputs != expected.outputs {
                    return Err(LinkError::TypeMismatch { module: imp.module.clone(), name: imp.name.clone() });
                }
                inst.func_types.push(expected.clone());
                inst.funcaddrs.push(addr);
            }
            (ImportDesc::Table(ty), ExternAddr::Table(addr)) => {
                let actual = store.table(addr);
                if actual.elemtype != ty.elemtype || !limits_compatible(ty.limits, actual.elements.len() as u32, actual.max) {
                    return Err(LinkError::TypeMismatch { module: imp.module.clone(), name: imp.name.clone() });
                }
                inst.tableaddrs.push(addr);
            }
            (ImportDesc::Memory(ty), ExternAddr::Mem(addr)) => {
                let actual = store.mem(addr);
                if !limits_compatible(ty.limits, actual.size_pages(), actual.max_pages) {
                    return Err(LinkError::TypeMismatch { module: imp.module.clone(), name: imp.name.clone() });
                }
                inst.memaddrs.push(addr);
            }
            (ImportDesc::Global(ty), ExternAddr::Global(addr)) => {
                let actual = store.global(addr);
                if actual.ty != ty.valtype || actual.mutable != ty.mutable {
                    return Err(LinkError::TypeMismatch { module: imp.module.clone(), name: imp.name.clone() });
                }
                inst.globaladdrs.push(addr);
            }
            _ => unreachable!("kind already checked to match above"),
        }
    }

    // Phase 2: allocate this module's own tables/memories/globals (globals
    // get a placeholder zero value here; phase 3/4 fills in the real one).
    for t in &module.tables {
        inst.tableaddrs.push(store.add_table(TableInst::new(t.limits.min, t.limits.max, t.elemtype)));
    }
    for m in &module.memories {
        inst.memaddrs.push(store.add_memory(MemInst::new(m.limits.min, m.limits.max)));
    }
    let own_globals_start = inst.globaladdrs.len();
    for (ty, _) in &module.globals {
        inst.globaladdrs.push(store.add_global(GlobalInst::new(zero_value(ty.valtype), ty.mutable)));
    }

    // Phase 3 + 4: evaluate each global's initializer and store the real value.
    for (i, (_, init)) in module.globals.iter().enumerate() {
        let v = constexpr::eval((*init).into(), store, &inst);
        store.set_global_value(inst.globaladdrs[own_globals_start + i], v);
    }

    // Phase 5: compile every function into one CodeBuffer sized for the module.
    let n_imported = module.n_imported_funcs();
    let size_estimate: usize = module.code.iter().map(|b| 64 + b.instructions.len() * 32).sum();
    let mut codebuf = CodeBuffer::new(size_estimate.max(64))?;

    // (code offset within codebuf, pending relocations, declared type)
    let mut compiled: Vec<(usize, Vec<Reloc>, FuncType)> = Vec::with_capacity(module.code.len());
    for (local_idx, body) in module.code.iter().enumerate() {
        let funcidx = (n_imported + local_idx) as u32;
        let tyidx = module.functions[local_idx];
        let ty = module.types[tyidx as usize].clone();
        let result = codegen::compile_function(module, funcidx, &ty, body)?;
        let offset = codebuf.write(&result.code);
        log::trace!("compiled function {funcidx}: {} bytes at offset {offset}", result.code.len());
        compiled.push((offset, result.relocs, ty));
    }

    // Register a `FuncInst` for each, entry point left null until phase 9
    // freezes the code pages.
    let mut own_func_addrs = Vec::with_capacity(compiled.len());
    for (offset, relocs, ty) in compiled {
        let addr = store.add_function(FuncInst {
            ty: ty.clone(),
            kind: FuncKind::Compiled { code: std::ptr::null(), code_size: 0 },
            entry: std::ptr::null(),
            relocs,
        });
        inst.func_types.push(ty);
        inst.funcaddrs.push(addr);
        own_func_addrs.push((addr, offset));
    }

    // Phase 6: run element segments.
    for seg in &module.elements {
        let table_addr = inst.tableaddrs[seg.table_index as usize];
        let offset = constexpr::eval_i32_offset(seg.offset, store, &inst);
        let len = seg.func_indices.len();
        let table = store.table(table_addr);
        if offset.checked_add(len).map(|end| end > table.elements.len()).unwrap_or(true) {
            return Err(LinkError::ElementOutOfBounds { table: table_addr.0, offset, len });
        }
        let table = store.table_mut(table_addr);
        for (i, funcidx) in seg.func_indices.iter().enumerate() {
            table.elements[offset + i] = Some(inst.funcaddrs[*funcidx as usize]);
        }
    }

    // Phase 7: run data segments.
    for seg in &module.data {
        let mem_addr = inst.memaddrs[seg.mem_index as usize];
        let offset = constexpr::eval_i32_offset(seg.offset, store, &inst);
        let len = seg.bytes.len();
        let mem = store.mem(mem_addr);
        if offset.checked_add(len).map(|end| end > mem.size_bytes()).unwrap_or(true) {
            return Err(LinkError::DataOutOfBounds { mem: mem_addr.0, offset, len });
        }
        let mem = store.mem_mut(mem_addr);
        mem.data_mut()[offset..offset + len].copy_from_slice(&seg.bytes);
    }

    // Phase 8: patch relocations, now that every address any function could
    // reference (other functions, tables, memories, globals) is final. A
    // call target compiled in this same module resolves through `own_entries`
    // (offsets into `codebuf`, whose base address never moves, even though
    // the pages aren't executable yet); anything else — an import — already
    // has a real `entry` in the `Store`.
    let own_entries: std::collections::HashMap<FuncAddr, usize> = own_func_addrs.iter().copied().collect();
    for (addr, offset) in &own_func_addrs {
        let relocs = store.func(*addr).relocs.clone();
        for r in &relocs {
            patch_one(&mut codebuf, *offset, r, module, &inst, store, &own_entries)?;
        }
    }

    // Phase 9: freeze the code pages read+execute.
    codebuf.mark_executable()?;
    for (addr, offset) in &own_func_addrs {
        let entry = codebuf.entry_at(*offset);
        let finst = store.func_mut(*addr);
        finst.entry = entry;
        finst.kind = FuncKind::Compiled { code: entry, code_size: 0 };
    }
    store.code_buffers.push(codebuf);

    // Phase 10: register exports.
    for exp in &module.exports {
        let addr = match exp.kind {
            ExternKind::Func => ExternAddr::Func(inst.funcaddrs[exp.index as usize]),
            ExternKind::Table => ExternAddr::Table(inst.tableaddrs[exp.index as usize]),
            ExternKind::Memory => ExternAddr::Mem(inst.memaddrs[exp.index as usize]),
            ExternKind::Global => ExternAddr::Global(inst.globaladdrs[exp.index as usize]),
        };
        store.bind_name(module_name, &exp.name, addr);
    }

    // Phase 11: invoke the start function, if any.
    let start_addr = module.start.map(|idx| inst.funcaddrs[idx as usize]);
    if let Some(addr) = start_addr {
        let finst = store.func(addr);
        let ty = finst.ty.clone();
        let entry = finst.entry;
        crate::invoke::invoke(store, entry, &ty, &[]).map_err(LinkError::StartFailure)?;
    }

    Ok(start_addr)
}

/// Patch one relocation at `func_offset + r.code_offset` within `codebuf`,
/// resolving the module-local index it carries through `inst` (for this
/// module's own objects) to a final `Store` address or helper function
/// pointer.
fn patch_one(
    codebuf: &mut CodeBuffer,
    func_offset: usize,
    r: &Reloc,
    module: &Module,
    inst: &PartialInst,
    store: &Store,
    own_entries: &std::collections::HashMap<FuncAddr, usize>,
) -> Result<(), LinkError> {
    let at = func_offset + r.code_offset;
    let value: u64 = match r.kind {
        RelocKind::CallTarget(funcidx) => {
            let addr = inst.funcaddrs[funcidx as usize];
            match own_entries.get(&addr) {
                Some(&offset) => codebuf.entry_at(offset) as u64,
                None => store.func(addr).entry as u64,
            }
        }
        RelocKind::MemoryBase(memidx) => store.mem(inst.memaddrs[memidx as usize]).base_ptr() as u64,
        RelocKind::MemorySize(memidx) => store.mem(inst.memaddrs[memidx as usize]).size_bytes_ptr() as u64,
        RelocKind::MemoryIndex(memidx) => inst.memaddrs[memidx as usize].0 as u64,
        RelocKind::GlobalAddr(globalidx) => store.global_raw_ptr(inst.globaladdrs[globalidx as usize]) as u64,
        RelocKind::Table(tableidx) => store.table(inst.tableaddrs[tableidx as usize]) as *const TableInst as u64,
        RelocKind::FuncTypeDesc(typeidx) => &module.types[typeidx as usize] as *const FuncType as u64,
        RelocKind::ResolveIndirectCall => crate::compiler::helpers::resolve_indirect_call as usize as u64,
        RelocKind::TrapHelper => crate::compiler::helpers::trap_helper as usize as u64,
    };
    codebuf.patch(at, &value.to_le_bytes());
    Ok(())
}

fn limits_compatible(required: crate::ast::Limits, actual_min: u32, actual_max: Option<u32>) -> bool {
    if actual_min < required.min {
        return false;
    }
    match (required.max, actual_max) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(req_max), Some(act_max)) => act_max <= req_max,
    }
}

fn zero_value(ty: crate::value::ValType) -> Value {
    match ty {
        crate::value::ValType::I32 => Value::I32(0),
        crate::value::ValType::I64 => Value::I64(0),
        crate::value::ValType::F32 => Value::F32(0.0),
        crate::value::ValType::F64 => Value::F64(0.0),
    }
}
