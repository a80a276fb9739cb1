//! Error taxonomy: decode errors, link errors, compile errors, and traps.
//!
//! Decode and link errors are non-recoverable for the affected module: the
//! caller gets a diagnostic and the partially built state is discarded.
//! Traps are a distinguished, expected outcome of `invoke` — not boxed
//! behind `dyn std::error::Error`, since the `Store` remains perfectly
//! usable afterwards.

use std::fmt;

use thiserror::Error;

/// Kind of decode failure, independent of where in the byte stream it occurred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    BadMagic,
    BadVersion,
    TruncatedInput,
    UnknownOpcode(u8),
    UnknownSectionId(u8),
    BadSectionOrder,
    OversizedVector,
    UnsupportedFeature(&'static str),
    TooManyOutputs,
    InvalidValType(u8),
    InvalidBlockType(u8),
    InvalidMutability(u8),
    MissingElseOrEnd,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::BadMagic => write!(f, "bad magic number"),
            DecodeErrorKind::BadVersion => write!(f, "unsupported wasm version"),
            DecodeErrorKind::TruncatedInput => write!(f, "truncated input"),
            DecodeErrorKind::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x}"),
            DecodeErrorKind::UnknownSectionId(id) => write!(f, "unknown section id {id}"),
            DecodeErrorKind::BadSectionOrder => write!(f, "sections out of order"),
            DecodeErrorKind::OversizedVector => write!(f, "vector length overflows u32"),
            DecodeErrorKind::UnsupportedFeature(name) => write!(f, "unsupported feature: {name}"),
            DecodeErrorKind::TooManyOutputs => write!(f, "function type has more than one output"),
            DecodeErrorKind::InvalidValType(b) => write!(f, "invalid value type byte 0x{b:02x}"),
            DecodeErrorKind::InvalidBlockType(b) => write!(f, "invalid block type byte 0x{b:02x}"),
            DecodeErrorKind::InvalidMutability(b) => write!(f, "invalid mutability byte 0x{b:02x}"),
            DecodeErrorKind::MissingElseOrEnd => write!(f, "missing matching else/end"),
        }
    }
}

/// A decode failure at a specific byte offset into the module.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("decode error at offset {offset}: {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: usize,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

/// Kind of compile-time structural failure within a single function body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    StackUnderflow,
    TypeMismatch { expected: &'static str, found: &'static str },
    UnbalancedControl,
    UnknownLocal(u32),
    UnknownGlobal(u32),
    UnknownFunc(u32),
    UnknownType(u32),
    UnknownTable(u32),
    UnknownLabel(u32),
    InvalidBranchArity,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::StackUnderflow => write!(f, "operand stack underflow"),
            CompileErrorKind::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            CompileErrorKind::UnbalancedControl => write!(f, "unbalanced control construct"),
            CompileErrorKind::UnknownLocal(i) => write!(f, "unknown local {i}"),
            CompileErrorKind::UnknownGlobal(i) => write!(f, "unknown global {i}"),
            CompileErrorKind::UnknownFunc(i) => write!(f, "unknown function {i}"),
            CompileErrorKind::UnknownType(i) => write!(f, "unknown type {i}"),
            CompileErrorKind::UnknownTable(i) => write!(f, "unknown table {i}"),
            CompileErrorKind::UnknownLabel(i) => write!(f, "unknown label {i}"),
            CompileErrorKind::InvalidBranchArity => write!(f, "branch target arity mismatch"),
        }
    }
}

/// A code generation failure, scoped to the function and byte offset in its
/// code-section body where the problem was detected.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("compile error in function {function_index} at code offset {byte_offset_in_code}: {kind}")]
pub struct CompileError {
    pub function_index: u32,
    pub byte_offset_in_code: usize,
    pub kind: CompileErrorKind,
}

/// A failure to link (instantiate) a module against a `Store`.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("missing import {module}.{name}")]
    MissingImport { module: String, name: String },

    #[error("import {module}.{name} has the wrong kind")]
    KindMismatch { module: String, name: String },

    #[error("import {module}.{name} has an incompatible type")]
    TypeMismatch { module: String, name: String },

    #[error("element segment out of bounds: table {table} offset {offset} len {len}")]
    ElementOutOfBounds { table: usize, offset: usize, len: usize },

    #[error("data segment out of bounds: memory {mem} offset {offset} len {len}")]
    DataOutOfBounds { mem: usize, offset: usize, len: usize },

    #[error("start function trapped: {0}")]
    StartFailure(TrapCode),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to allocate executable code storage: {0}")]
    CodeBufferAlloc(#[from] std::io::Error),
}

/// A non-local exit raised by wasm semantics (division by zero, OOB access,
/// unreachable, etc). Delivered to the nearest `invoke` boundary. Unlike
/// [`DecodeError`]/[`LinkError`], a trap does not poison the `Store`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapCode {
    Unreachable,
    IntegerOverflow,
    IntegerDivideByZero,
    InvalidConversionToInteger,
    OutOfBoundsMemoryAccess,
    OutOfBoundsTableAccess,
    IndirectCallTypeMismatch,
    StackOverflow,
    MismatchedType,
    Abort,
    Interrupted,
}

impl TrapCode {
    /// Stable non-zero wire code. Zero is reserved to mean "no trap" by the
    /// jump-buffer convention in the invocation bridge (§4.H).
    pub const fn code(self) -> u32 {
        match self {
            TrapCode::Unreachable => 1,
            TrapCode::IntegerOverflow => 2,
            TrapCode::IntegerDivideByZero => 3,
            TrapCode::InvalidConversionToInteger => 4,
            TrapCode::OutOfBoundsMemoryAccess => 5,
            TrapCode::OutOfBoundsTableAccess => 6,
            TrapCode::IndirectCallTypeMismatch => 7,
            TrapCode::StackOverflow => 8,
            TrapCode::MismatchedType => 9,
            TrapCode::Abort => 10,
            TrapCode::Interrupted => 11,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => TrapCode::Unreachable,
            2 => TrapCode::IntegerOverflow,
            3 => TrapCode::IntegerDivideByZero,
            4 => TrapCode::InvalidConversionToInteger,
            5 => TrapCode::OutOfBoundsMemoryAccess,
            6 => TrapCode::OutOfBoundsTableAccess,
            7 => TrapCode::IndirectCallTypeMismatch,
            8 => TrapCode::StackOverflow,
            9 => TrapCode::MismatchedType,
            10 => TrapCode::Abort,
            11 => TrapCode::Interrupted,
            _ => return None,
        })
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrapCode::Unreachable => "unreachable executed",
            TrapCode::IntegerOverflow => "integer overflow",
            TrapCode::IntegerDivideByZero => "integer divide by zero",
            TrapCode::InvalidConversionToInteger => "invalid conversion to integer",
            TrapCode::OutOfBoundsMemoryAccess => "out of bounds memory access",
            TrapCode::OutOfBoundsTableAccess => "out of bounds table access",
            TrapCode::IndirectCallTypeMismatch => "indirect call type mismatch",
            TrapCode::StackOverflow => "call stack exhausted",
            TrapCode::MismatchedType => "mismatched type",
            TrapCode::Abort => "aborted",
            TrapCode::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}
