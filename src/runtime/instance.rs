//! The four addressable object kinds a `Store` owns.

use crate::ast::ElemType;
use crate::value::{FuncType, Value};

use super::FuncAddr;

/// A relocation kind, paired with the byte offset of the 8-byte immediate in
/// `code` that needs patching once the target's final address is known.
/// Every variant that names a kind of object also carries the *module-local*
/// index of that object; the linker translates it through the `ModuleInst`
/// being built before patching (§4.F phase 9).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute address of another function's compiled entry point, or of
    /// the host-call trampoline if that function is a host import.
    CallTarget(u32),
    /// Pointer to the active `MemInst`'s byte buffer base.
    MemoryBase(u32),
    /// Pointer to the active `MemInst`'s current-size-in-bytes word.
    MemorySize(u32),
    /// Raw `Store`-wide memory index, passed (not dereferenced) to the
    /// `memory.size`/`memory.grow` helpers so they can find the right
    /// `MemInst` without generated code needing to know its layout.
    MemoryIndex(u32),
    /// Absolute address of a `GlobalInst`'s value slot.
    GlobalAddr(u32),
    /// Absolute address of the `TableInst`, used by `call_indirect` to reach
    /// the element array and its current length.
    Table(u32),
    /// A function type's shape, compared bit-for-bit by `call_indirect`
    /// against the callee's declared type before the call proceeds.
    FuncTypeDesc(u32),
    /// Address of the `resolve_indirect_call` helper.
    ResolveIndirectCall,
    /// Address of the `trap` helper.
    TrapHelper,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    pub code_offset: usize,
}

/// What a `FuncInst` is backed by; see `IS_HOST` in the original C
/// (`!code_size` meant host). Either way `FuncInst::entry` is a directly
/// callable System-V entry point — a host import's `entry` is a small
/// generated trampoline (`compiler::helpers::build_host_trampoline`), not
/// the closure itself, so call sites never need to distinguish the two.
pub enum FuncKind {
    /// Compiled wasm function: `code` points into a store-owned executable
    /// page, relocations have already been patched.
    Compiled { code: *const u8, code_size: usize },
    /// Host function supplied at import time. `entry` points at a
    /// trampoline that reads this closure back out of the `Store` by
    /// address and marshals arguments into it.
    Host(Box<dyn Fn(&[Value]) -> Result<Option<Value>, crate::error::TrapCode> + Send + Sync>),
}

pub struct FuncInst {
    pub ty: FuncType,
    pub kind: FuncKind,
    /// Directly callable entry point: the compiled body for a wasm
    /// function, or the host trampoline for an imported one. Always valid
    /// by the time this `FuncInst` is reachable from a `Store`.
    pub entry: *const u8,
    /// Pending relocations against this function's compiled code; empty for
    /// host functions. Consumed (not cleared) once the linker patches them.
    pub relocs: Vec<Reloc>,
}

impl FuncInst {
    pub fn is_host(&self) -> bool {
        matches!(self.kind, FuncKind::Host(_))
    }
}

// SAFETY: `code` is a raw pointer into a store-owned executable mapping
// that outlives every `FuncInst` referencing it (§3 invariant 1); it is
// never mutated after `CodeBuffer::mark_executable`, so sharing it across
// threads under the caller's own exclusion discipline (§5) is sound.
unsafe impl Send for FuncInst {}
unsafe impl Sync for FuncInst {}

/// A memory's backing storage is allocated once, at its full declared
/// capacity (`max_pages`, or a generous default if the module didn't
/// declare one), and never reallocated afterward. `memory.grow` only moves
/// `size_bytes` forward within that reservation. This keeps the base
/// pointer baked into compiled code (`RelocKind::MemoryBase`) valid for the
/// `Store`'s whole lifetime instead of needing an extra box-of-box
/// indirection to survive a reallocating grow.
pub struct MemInst {
    data: Vec<u8>,
    /// `Cell` so `memory.grow` can advance this through the shared `&Store`
    /// that's all `invoke` ever holds — the data buffer itself never moves
    /// (see the type's own doc comment), only this logical-size cursor does.
    size_bytes: std::cell::Cell<usize>,
    pub capacity_bytes: usize,
    pub max_pages: Option<u32>,
}

pub const WASM_PAGE_SIZE: usize = 65536;
/// Cap applied to memories with no declared maximum, so an unbounded
/// `memory.grow` loop can't exhaust address space on a whim. 4 GiB, wasm
/// 1.0's own hard ceiling on 32-bit linear memory.
const DEFAULT_CAPACITY_PAGES: u32 = 65536;

impl MemInst {
    pub fn new(min_pages: u32, max_pages: Option<u32>) -> Self {
        let cap_pages = max_pages.unwrap_or(DEFAULT_CAPACITY_PAGES);
        let capacity_bytes = cap_pages as usize * WASM_PAGE_SIZE;
        let size_bytes = min_pages as usize * WASM_PAGE_SIZE;
        Self {
            data: vec![0u8; capacity_bytes],
            size_bytes: std::cell::Cell::new(size_bytes),
            capacity_bytes,
            max_pages,
        }
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn base_ptr_mut(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Writable view of the live (size-bytes) prefix, for data-segment
    /// initialization during instantiation.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.size_bytes.get();
        &mut self.data[..len]
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.size_bytes.get()]
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.get()
    }

    pub fn size_pages(&self) -> u32 {
        (self.size_bytes.get() / WASM_PAGE_SIZE) as u32
    }

    /// Grow by `delta_pages`, returning the previous size in pages, or
    /// `None` if that would exceed the declared (or default) maximum.
    /// Takes `&self`: the reservation backing `data` never moves, so this
    /// only needs to advance the size cursor, which a shared `&Store` can
    /// still do through the `Cell`.
    pub fn grow(&self, delta_pages: u32) -> Option<u32> {
        let old_pages = self.size_pages();
        let new_pages = old_pages.checked_add(delta_pages)?;
        if new_pages as usize * WASM_PAGE_SIZE > self.capacity_bytes {
            return None;
        }
        self.size_bytes.set(new_pages as usize * WASM_PAGE_SIZE);
        Some(old_pages)
    }

    /// Pointer to the size-in-bytes cursor itself, read directly by
    /// generated bounds-check code via `RelocKind::MemorySize`.
    pub fn size_bytes_ptr(&self) -> *const usize {
        self.size_bytes.as_ptr()
    }
}

pub struct TableInst {
    pub elemtype: ElemType,
    pub elements: Vec<Option<FuncAddr>>,
    pub max: Option<u32>,
}

impl TableInst {
    pub fn new(min: u32, max: Option<u32>, elemtype: ElemType) -> Self {
        Self { elemtype, elements: vec![None; min as usize], max }
    }
}

/// A global's value is stored as a raw 8-byte payload rather than the
/// `Value` enum: generated machine code reads and writes it directly
/// through a baked-in pointer (`RelocKind::GlobalAddr`), and a Rust enum's
/// layout isn't something raw code can rely on.
pub struct GlobalInst {
    pub raw: u64,
    pub ty: crate::value::ValType,
    pub mutable: bool,
}

impl GlobalInst {
    pub fn new(value: Value, mutable: bool) -> Self {
        Self { raw: value.to_raw64(), ty: value.ty(), mutable }
    }

    pub fn value(&self) -> Value {
        Value::from_raw64(self.raw, self.ty)
    }

    pub fn set_value(&mut self, v: Value) {
        debug_assert_eq!(v.ty(), self.ty);
        self.raw = v.to_raw64();
    }
}
