//! Runtime instance model: `Store` owns every durable object; `ModuleInst`
//! is a per-instantiation view translating module-local indices to stable
//! `Store` addresses.
//!
//! `Store` is the single owner of every concrete object (§3 invariant);
//! everything else — `ModuleInst`, relocation records, exports — holds a
//! plain integer handle into one of `Store`'s vectors. Objects are never
//! relocated within a `Store` once allocated, so a handle stays valid for
//! the `Store`'s whole lifetime.

mod instance;

pub use instance::{FuncInst, FuncKind, GlobalInst, MemInst, RelocKind, Reloc, TableInst};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{ExternKind, Module};
use crate::compiler::codebuf::CodeBuffer;
use crate::error::LinkError;
use crate::invoke::Invoker;
use crate::value::{FuncType, Value};

macro_rules! addr_newtype {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub usize);
    };
}

addr_newtype!(FuncAddr);
addr_newtype!(TableAddr);
addr_newtype!(MemAddr);
addr_newtype!(GlobalAddr);

/// Stable address of any one of the four addressable kinds, as stored in
/// the `Store`'s name table for exports/imports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExternAddr {
    Func(FuncAddr),
    Table(TableAddr),
    Mem(MemAddr),
    Global(GlobalAddr),
}

impl ExternAddr {
    pub fn kind(self) -> ExternKind {
        match self {
            ExternAddr::Func(_) => ExternKind::Func,
            ExternAddr::Table(_) => ExternKind::Table,
            ExternAddr::Mem(_) => ExternKind::Memory,
            ExternAddr::Global(_) => ExternKind::Global,
        }
    }
}

/// `(module, name) -> (kind, addr)` table, linear like the original C
/// implementation's `Namespace` — insertion order doesn't matter, lookups
/// are exact-match. Kept as a flat vector rather than a `HashMap` so two
/// entries may legitimately collide on name with different kinds without
/// either overwriting the other (decided in DESIGN.md).
#[derive(Default)]
struct Namespace {
    entries: Vec<(String, String, ExternAddr)>,
}

impl Namespace {
    fn bind(&mut self, module: &str, name: &str, addr: ExternAddr) {
        self.entries.push((module.to_string(), name.to_string(), addr));
    }

    fn lookup(&self, module: &str, name: &str) -> Option<ExternAddr> {
        self.entries
            .iter()
            .find(|(m, n, _)| m == module && n == name)
            .map(|(_, _, a)| *a)
    }
}

/// The runtime-wide container of all instantiated objects. Not `Sync`: a
/// `Store` must not be accessed from multiple threads concurrently (§5).
#[derive(Default)]
pub struct Store {
    // Boxed so a `&FuncInst`/`&MemInst`/... handed out today (or a raw
    // pointer baked into compiled code as a relocation target) stays valid
    // after a later `instantiate` grows these vectors — growing a
    // `Vec<Box<T>>` only moves the `Box` pointers, never the `T` values
    // they point at.
    pub(crate) funcs: Vec<Box<FuncInst>>,
    pub(crate) tables: Vec<Box<TableInst>>,
    pub(crate) mems: Vec<Box<MemInst>>,
    pub(crate) globals: Vec<Box<GlobalInst>>,
    names: Namespace,
    /// Code pages owned by this store, kept alive until the store is dropped.
    pub(crate) code_buffers: Vec<CodeBuffer>,
    /// Decoded modules that some `FuncInst` in this store still points into
    /// (`RelocKind::FuncTypeDesc` bakes a raw `*const FuncType` straight at
    /// a `Module`'s `types` vector) — retained here so that pointer stays
    /// valid for the store's whole lifetime even if the embedder drops its
    /// own `Rc<Module>` right after instantiating.
    pub(crate) retained_modules: Vec<Rc<Module>>,
    /// Cached per-shape invoker thunks, keyed by (inputs, outputs) (§4.H).
    /// `RefCell` because lookups happen from `invoke`, which only ever
    /// holds `&Store` — a `Store` is single-threaded (§5) so this never
    /// races.
    invoker_cache: RefCell<HashMap<(Vec<crate::value::ValType>, Vec<crate::value::ValType>), Invoker>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, inst: FuncInst) -> FuncAddr {
        self.funcs.push(Box::new(inst));
        FuncAddr(self.funcs.len() - 1)
    }

    pub fn add_table(&mut self, inst: TableInst) -> TableAddr {
        self.tables.push(Box::new(inst));
        TableAddr(self.tables.len() - 1)
    }

    pub fn add_memory(&mut self, inst: MemInst) -> MemAddr {
        self.mems.push(Box::new(inst));
        MemAddr(self.mems.len() - 1)
    }

    pub fn add_global(&mut self, inst: GlobalInst) -> GlobalAddr {
        self.globals.push(Box::new(inst));
        GlobalAddr(self.globals.len() - 1)
    }

    pub fn bind_name(&mut self, module: &str, name: &str, addr: ExternAddr) {
        self.names.bind(module, name, addr);
    }

    /// Keep `module` alive for as long as this store lives — see the
    /// `retained_modules` field doc for why this is load-bearing, not just
    /// a convenience.
    pub(crate) fn retain_module(&mut self, module: Rc<Module>) {
        self.retained_modules.push(module);
    }

    pub fn lookup(&self, module: &str, name: &str) -> Option<ExternAddr> {
        self.names.lookup(module, name)
    }

    pub fn func(&self, addr: FuncAddr) -> &FuncInst {
        &self.funcs[addr.0]
    }

    pub fn func_mut(&mut self, addr: FuncAddr) -> &mut FuncInst {
        &mut self.funcs[addr.0]
    }

    pub fn table(&self, addr: TableAddr) -> &TableInst {
        &self.tables[addr.0]
    }

    pub fn table_mut(&mut self, addr: TableAddr) -> &mut TableInst {
        &mut self.tables[addr.0]
    }

    pub fn mem(&self, addr: MemAddr) -> &MemInst {
        &self.mems[addr.0]
    }

    pub fn mem_mut(&mut self, addr: MemAddr) -> &mut MemInst {
        &mut self.mems[addr.0]
    }

    pub fn global(&self, addr: GlobalAddr) -> &GlobalInst {
        &self.globals[addr.0]
    }

    pub fn global_mut(&mut self, addr: GlobalAddr) -> &mut GlobalInst {
        &mut self.globals[addr.0]
    }

    pub fn global_value(&self, addr: GlobalAddr) -> Value {
        self.globals[addr.0].value()
    }

    pub fn set_global_value(&mut self, addr: GlobalAddr, v: Value) {
        self.globals[addr.0].set_value(v);
    }

    /// Stable address of a global's raw payload, baked into compiled code
    /// as a `RelocKind::GlobalAddr` target.
    pub(crate) fn global_raw_ptr(&self, addr: GlobalAddr) -> *mut u64 {
        &self.globals[addr.0].raw as *const u64 as *mut u64
    }

    /// Stable address of a memory's data buffer, baked in as
    /// `RelocKind::MemoryBase`. Valid for the `Store`'s lifetime because
    /// `MemInst` never reallocates its backing buffer (see `MemInst::grow`).
    pub(crate) fn mem_base_raw_ptr(&self, addr: MemAddr) -> *mut u8 {
        self.mems[addr.0].base_ptr() as *mut u8
    }

    /// Stable address of a memory's current-size-in-bytes word, baked in as
    /// `RelocKind::MemorySize`.
    pub(crate) fn mem_size_raw_ptr(&self, addr: MemAddr) -> *const usize {
        self.mems[addr.0].size_bytes_ptr()
    }

    /// Grow memory `addr` by `delta_pages`, called by
    /// `compiler::helpers::memory_grow_helper`. Takes `&self` for the same
    /// reason `MemInst::grow` does.
    pub(crate) fn mem_grow(&self, addr: MemAddr, delta_pages: u32) -> Option<u32> {
        self.mems[addr.0].grow(delta_pages)
    }

    /// Truncate every table back to `marks`, used to roll back a failed
    /// instantiation (§4.F: "on any failure after phase 2, all newly
    /// allocated Store entries for this module are rolled back").
    pub(crate) fn rollback_to(&mut self, marks: StoreMarks) {
        self.funcs.truncate(marks.funcs);
        self.tables.truncate(marks.tables);
        self.mems.truncate(marks.mems);
        self.globals.truncate(marks.globals);
        self.code_buffers.truncate(marks.code_buffers);
        self.names.entries.truncate(marks.names);
    }

    /// Look up (building and caching on first use) the invoker thunk for
    /// `ty`'s shape. Fails once, permanently for that shape, if the
    /// signature exceeds the calling convention's register budget (more
    /// than 6 integer or 8 float arguments).
    pub(crate) fn invoker_for(&self, ty: &FuncType) -> Result<std::cell::Ref<'_, Invoker>, LinkError> {
        let key = (ty.inputs.clone(), ty.outputs.clone());
        if !self.invoker_cache.borrow().contains_key(&key) {
            let invoker = Invoker::build(ty)?;
            self.invoker_cache.borrow_mut().insert(key.clone(), invoker);
        }
        Ok(std::cell::Ref::map(self.invoker_cache.borrow(), |m| &m[&key]))
    }

    pub(crate) fn mark(&self) -> StoreMarks {
        StoreMarks {
            funcs: self.funcs.len(),
            tables: self.tables.len(),
            mems: self.mems.len(),
            globals: self.globals.len(),
            code_buffers: self.code_buffers.len(),
            names: self.names.entries.len(),
        }
    }
}

#[derive(Copy, Clone)]
pub(crate) struct StoreMarks {
    funcs: usize,
    tables: usize,
    mems: usize,
    globals: usize,
    code_buffers: usize,
    names: usize,
}

/// Per-instantiation index tables translating module-local indices for each
/// kind to `Store` addresses. Owns no objects directly.
#[derive(Default, Clone)]
pub struct ModuleInst {
    pub funcaddrs: Vec<FuncAddr>,
    pub tableaddrs: Vec<TableAddr>,
    pub memaddrs: Vec<MemAddr>,
    pub globaladdrs: Vec<GlobalAddr>,
    /// `func_types[i]` is the declared type of the function at `funcaddrs[i]`,
    /// aligned one-to-one so callers needn't round-trip through the `Store`.
    pub func_types: Vec<FuncType>,
}

impl ModuleInst {
    pub fn func_type(&self, funcidx: u32) -> Option<&FuncType> {
        self.func_types.get(funcidx as usize)
    }
}
