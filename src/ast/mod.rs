//! The typed module AST produced by the decoder and consumed by the linker.
//!
//! Mirrors the section structure of the wasm 1.0 binary format directly —
//! no desugaring, no validation beyond what §4.B requires at parse time.

mod instr;

pub use instr::{BlockType, Instruction, MemArg};

use crate::value::{FuncType, ValType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElemType {
    FuncRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableType {
    pub elemtype: ElemType,
    pub limits: Limits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub limits: Limits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalType {
    pub valtype: ValType,
    pub mutable: bool,
}

/// What kind of thing an import or export names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportDesc {
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDesc::Func(_) => ExternKind::Func,
            ImportDesc::Table(_) => ExternKind::Table,
            ImportDesc::Memory(_) => ExternKind::Memory,
            ImportDesc::Global(_) => ExternKind::Global,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// A single-instruction constant initializer, as used by global initializers
/// and element/data segment offsets. Restricted per §4.F phase 3 to
/// {i32.const, i64.const, f32.const, f64.const, global.get (imported only)}.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstExpr {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    GlobalGet(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementSegment {
    pub table_index: u32,
    pub offset: ConstExprKind,
    pub func_indices: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSegment {
    pub mem_index: u32,
    pub offset: ConstExprKind,
    pub bytes: Vec<u8>,
}

/// `ConstExpr` without the `PartialEq`-unfriendly floats, for the AST types
/// that need `Eq`. Holds the same payload as [`ConstExpr`] bit for bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstExprKind {
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    GlobalGet(u32),
}

impl From<ConstExprKind> for ConstExpr {
    fn from(k: ConstExprKind) -> Self {
        match k {
            ConstExprKind::I32Const(v) => ConstExpr::I32Const(v),
            ConstExprKind::I64Const(v) => ConstExpr::I64Const(v),
            ConstExprKind::F32Const(v) => ConstExpr::F32Const(f32::from_bits(v)),
            ConstExprKind::F64Const(v) => ConstExpr::F64Const(f64::from_bits(v)),
            ConstExprKind::GlobalGet(i) => ConstExpr::GlobalGet(i),
        }
    }
}

/// A local function's declared locals (beyond its parameters) and body.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncBody {
    /// (count, type) runs, in declaration order, as the code section encodes them.
    pub locals: Vec<(u32, ValType)>,
    pub instructions: Vec<Instruction>,
}

impl FuncBody {
    pub fn n_locals(&self) -> u32 {
        self.locals.iter().map(|(n, _)| *n).sum()
    }
}

/// The full decoded module: one field per wasm 1.0 section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index for each function declared by the function section, in order.
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<(GlobalType, ConstExprKind)>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub code: Vec<FuncBody>,
    pub data: Vec<DataSegment>,
}

impl Module {
    /// Number of imported functions, which occupy the low function indices
    /// before any module-defined functions.
    pub fn n_imported_funcs(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Func(_)))
            .count()
    }

    /// Resolve a function index (import or local) to its `FuncType`.
    pub fn func_type(&self, funcidx: u32) -> Option<&FuncType> {
        let n_imported = self.n_imported_funcs();
        if (funcidx as usize) < n_imported {
            let mut seen = 0;
            for imp in &self.imports {
                if let ImportDesc::Func(tyidx) = imp.desc {
                    if seen == funcidx as usize {
                        return self.types.get(tyidx as usize);
                    }
                    seen += 1;
                }
            }
            None
        } else {
            let local_idx = funcidx as usize - n_imported;
            let tyidx = *self.functions.get(local_idx)?;
            self.types.get(tyidx as usize)
        }
    }
}
