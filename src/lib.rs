//! JIT compiler and runtime for WebAssembly 1.0 MVP modules, targeting
//! x86-64. Decodes a wasm binary, compiles each function straight to
//! machine code in a single pass, links it against a [`runtime::Store`],
//! and runs it through a `setjmp`/`longjmp` trap bridge.
//!
//! [`embed`] is the only module external collaborators should depend on.

pub mod ast;
pub mod binary;
pub mod compiler;
pub mod decode;
pub mod embed;
pub mod error;
pub mod invoke;
pub mod link;
pub mod runtime;
pub mod util;
pub mod value;
