//! Non-local exit bridge between generated machine code and `invoke`, and
//! the thunk that turns a `&[Value]` argument slice into a real call into
//! compiled code.
//!
//! A trap raised deep inside a chain of JIT-compiled call frames cannot be
//! propagated by unwinding through them: the generated code carries no
//! DWARF CFI, so Rust's unwinder cannot walk back through it safely. Traps
//! are delivered instead with a real `setjmp`/`longjmp` pair, the same
//! mechanism the original C runtime uses: [`invoke`] marks its own stack
//! position with `setjmp` before jumping into compiled code, and
//! `trap_helper` (called directly by generated code, see `compiler::helpers`)
//! `longjmp`s straight back to it. There's nothing to unwind past: a wasm
//! call frame owns nothing but plain bytes on the native stack, no
//! destructors to run.

use std::cell::Cell;
use std::os::raw::c_int;

use crate::error::TrapCode;
use crate::runtime::Store;
use crate::value::{FuncType, Value};

/// Opaque `jmp_buf` storage, sized generously over the ~200 bytes glibc's
/// x86-64 `jmp_buf` actually needs (including the saved signal mask).
/// POSIX/x86-64 only, matching the rest of this crate's platform scope.
#[repr(C, align(16))]
struct JmpBuf([u8; 256]);

impl JmpBuf {
    fn new() -> Self {
        JmpBuf([0; 256])
    }
}

extern "C" {
    #[link_name = "setjmp"]
    fn c_setjmp(env: *mut JmpBuf) -> c_int;
    #[link_name = "longjmp"]
    fn c_longjmp(env: *mut JmpBuf, val: c_int) -> !;
}

thread_local! {
    static CURRENT_STORE: Cell<*const Store> = Cell::new(std::ptr::null());
    static CURRENT_JMP: Cell<*mut JmpBuf> = Cell::new(std::ptr::null_mut());
}

/// RAII guard held for the duration of one top-level [`invoke`] call.
/// Restores the previous (possibly null) thread-local store pointer on
/// every exit path — including the `longjmp` that lands back at this
/// guard's `setjmp` point, since `Drop::drop` runs there too.
struct InvokeGuard {
    prev_store: *const Store,
    prev_jmp: *mut JmpBuf,
}

impl InvokeGuard {
    fn enter(store: *const Store, jmp: *mut JmpBuf) -> Self {
        let prev_store = CURRENT_STORE.with(|c| c.replace(store));
        let prev_jmp = CURRENT_JMP.with(|c| c.replace(jmp));
        Self { prev_store, prev_jmp }
    }
}

impl Drop for InvokeGuard {
    fn drop(&mut self) {
        CURRENT_STORE.with(|c| c.set(self.prev_store));
        CURRENT_JMP.with(|c| c.set(self.prev_jmp));
    }
}

/// The `Store` of the innermost active invocation on this thread. Called
/// only from helpers reached by generated code, which only ever runs while
/// some `invoke` is on the stack.
pub(crate) fn current_store<'a>() -> &'a Store {
    let ptr = CURRENT_STORE.with(|c| c.get());
    debug_assert!(!ptr.is_null(), "helper called with no active invocation");
    // SAFETY: non-null only while an `InvokeGuard` covering that `Store` is
    // on this thread's stack below the generated code that called us.
    unsafe { &*ptr }
}

/// Called from `trap_helper`: `longjmp`s straight back to the innermost
/// active [`invoke`]. Never returns.
pub(crate) fn raise_trap(code: TrapCode) -> ! {
    let buf = CURRENT_JMP.with(|c| c.get());
    debug_assert!(!buf.is_null(), "trap raised with no active invocation");
    // SAFETY: `buf` was armed by `setjmp` in `invoke` earlier in this same
    // call chain, and that frame is still live -- it's what we're resuming.
    unsafe { c_longjmp(buf, code.code() as c_int) }
}

/// Marker placed in the `Store`'s invoker cache once a given (inputs,
/// outputs) shape has been validated. The actual marshalling in
/// [`Invoker::call`] is shape-independent (System-V assigns argument
/// registers positionally within each class, so a 2-int-1-float shape and a
/// 1-int-2-float shape marshal through the exact same code path) — the
/// per-shape cache exists to reject shapes the single-pass calling
/// convention can't express (more than 6 integer or 8 float arguments)
/// exactly once rather than on every call.
pub struct Invoker {
    _priv: (),
}

impl Invoker {
    pub(crate) fn build(ty: &FuncType) -> Result<Self, crate::error::LinkError> {
        if ty.n_integer_args() > 6 || ty.n_float_args() > 8 {
            return Err(crate::error::LinkError::TypeMismatch {
                module: String::new(),
                name: "<invoker>".to_string(),
            });
        }
        Ok(Self { _priv: () })
    }

    /// Call `entry` (a compiled function or host trampoline of exactly
    /// `ty`'s shape) with `args`, returning its single result if any.
    ///
    /// # Safety
    /// `entry` must point at executable code generated for exactly `ty`'s
    /// shape and must remain valid for the duration of the call.
    unsafe fn call(&self, entry: *const u8, args: &[Value], ty: &FuncType) -> Option<Value> {
        let mut ints = [0u64; 6];
        let mut floats = [0f64; 8];
        let mut ii = 0usize;
        let mut fi = 0usize;
        for a in args {
            match a {
                Value::I32(v) => {
                    ints[ii] = *v as u32 as u64;
                    ii += 1;
                }
                Value::I64(v) => {
                    ints[ii] = *v as u64;
                    ii += 1;
                }
                // Widened bit-for-bit (not numerically) so the callee's
                // 32-bit float load off the low half of the xmm register
                // sees the original f32 pattern untouched.
                Value::F32(v) => {
                    floats[fi] = f64::from_bits(v.to_bits() as u64);
                    fi += 1;
                }
                Value::F64(v) => {
                    floats[fi] = *v;
                    fi += 1;
                }
            }
        }

        match ty.outputs.first() {
            None | Some(crate::value::ValType::I32) | Some(crate::value::ValType::I64) => {
                type F = extern "C" fn(u64, u64, u64, u64, u64, u64, f64, f64, f64, f64, f64, f64, f64, f64) -> u64;
                // SAFETY: `entry` was compiled (or its trampoline built) for
                // a System-V-compatible function of this shape; unused
                // trailing register arguments are simply never read by it.
                let f: F = std::mem::transmute(entry);
                let raw = f(
                    ints[0], ints[1], ints[2], ints[3], ints[4], ints[5],
                    floats[0], floats[1], floats[2], floats[3], floats[4], floats[5], floats[6], floats[7],
                );
                match ty.outputs.first() {
                    Some(crate::value::ValType::I64) => Some(Value::I64(raw as i64)),
                    Some(crate::value::ValType::I32) => Some(Value::I32(raw as u32 as i32)),
                    _ => None,
                }
            }
            Some(crate::value::ValType::F32) | Some(crate::value::ValType::F64) => {
                type F = extern "C" fn(u64, u64, u64, u64, u64, u64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64;
                let f: F = std::mem::transmute(entry);
                let raw = f(
                    ints[0], ints[1], ints[2], ints[3], ints[4], ints[5],
                    floats[0], floats[1], floats[2], floats[3], floats[4], floats[5], floats[6], floats[7],
                );
                match ty.outputs[0] {
                    crate::value::ValType::F64 => Some(Value::F64(raw)),
                    crate::value::ValType::F32 => Some(Value::F32(f32::from_bits(raw.to_bits() as u32))),
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Call `entry` with `args` per `ty`'s calling convention, returning the
/// single result value or the trap that interrupted execution.
///
/// This is the one place raw machine code is ever jumped into from safe
/// Rust. `store` must be the `Store` that owns `entry` and everything it
/// was linked against; `entry` must have been compiled (or, for a host
/// import, have had its trampoline built) for exactly `ty`'s shape.
pub fn invoke(store: &Store, entry: *const u8, ty: &FuncType, args: &[Value]) -> Result<Option<Value>, TrapCode> {
    assert_eq!(args.len(), ty.inputs.len(), "argument count must match function type");
    for (a, t) in args.iter().zip(&ty.inputs) {
        assert_eq!(a.ty(), *t, "argument type must match function type");
    }

    let mut jmp = JmpBuf::new();
    let guard = InvokeGuard::enter(store as *const Store, &mut jmp as *mut JmpBuf);

    // SAFETY: `jmp` lives on this stack frame for as long as `guard` (and
    // therefore any generated code that might `longjmp` back to it) is alive.
    let code = unsafe { c_setjmp(&mut jmp as *mut JmpBuf) };
    if code != 0 {
        let trap = TrapCode::from_code(code as u32).expect("trap_helper only raises known codes");
        drop(guard);
        log::debug!("invocation trapped: {trap}");
        return Err(trap);
    }

    let invoker = store.invoker_for(ty).expect("invoker shape already validated at link time");
    let invoker = &*invoker;
    // SAFETY: `entry` belongs to `store` and was compiled for `ty`'s shape
    // (guaranteed by every caller in `embed`/`runtime`); `args` was checked
    // against `ty` above.
    let result = unsafe { invoker.call(entry, args, ty) };

    drop(guard);
    Ok(result)
}
