//! The small set of real Rust function addresses that generated machine
//! code calls into directly — trap delivery, `call_indirect` resolution,
//! and the host-import trampoline's glue. Every compiled function's
//! relocation table points at one of these (or at another compiled
//! function, or at a host trampoline built by [`build_host_trampoline`]).

use crate::error::TrapCode;
use crate::invoke;
use crate::runtime::{FuncKind, TableAddr};
use crate::value::{FuncType, Value};

use super::codebuf::CodeBuffer;
use super::x64::{self, Reg, Xmm};

/// Called directly by generated code whenever a trap condition is detected
/// (integer division overflow, out-of-bounds access, `unreachable`, a
/// `call_indirect` signature mismatch, ...). Never returns.
pub extern "C" fn trap_helper(code: u32) -> ! {
    let trap = TrapCode::from_code(code).unwrap_or(TrapCode::Abort);
    invoke::raise_trap(trap)
}

/// Called by `call_indirect` sites after evaluating the table index.
/// `table_addr_raw` and `expected_ty` are baked in as relocations at
/// compile time (the module-local table index resolved to a `Store`
/// address, and a pointer at the declared callee type respectively);
/// `elem_index` is the dynamic operand popped off the wasm stack.
pub extern "C" fn resolve_indirect_call(table_addr_raw: usize, elem_index: u32, expected_ty: *const FuncType) -> *const u8 {
    let store = invoke::current_store();
    let table = store.table(TableAddr(table_addr_raw));
    let slot = table.elements.get(elem_index as usize).copied();
    let Some(Some(func_addr)) = slot else {
        trap_helper(TrapCode::OutOfBoundsTableAccess.code());
    };
    let finst = store.func(func_addr);
    // SAFETY: `expected_ty` points at a `FuncType` owned by the `Module`
    // the caller was compiled from, kept alive for as long as any instance
    // of it can still be invoked (embedding API contract, §4.K).
    let expected = unsafe { &*expected_ty };
    if finst.ty.inputs != expected.inputs || finst.ty.outputs != expected.outputs {
        trap_helper(TrapCode::IndirectCallTypeMismatch.code());
    }
    finst.entry
}

/// Called by a host trampoline built with [`build_host_trampoline`].
/// Reconstructs the boxed closure from `func_addr_raw`, rebuilds a typed
/// `&[Value]` out of the raw argument buffer, and writes the raw result
/// bits back through `raw_out`. Returns a `TrapCode::code()` value, or 0.
pub extern "C" fn host_call_glue(func_addr_raw: usize, raw_args: *const u64, raw_out: *mut u64, has_out: u32) -> u32 {
    let store = invoke::current_store();
    let finst = store.func(crate::runtime::FuncAddr(func_addr_raw));
    let FuncKind::Host(closure) = &finst.kind else {
        panic!("host_call_glue invoked against a non-host FuncInst");
    };
    let mut args = Vec::with_capacity(finst.ty.inputs.len());
    for (i, ty) in finst.ty.inputs.iter().enumerate() {
        // SAFETY: `raw_args` points at `inputs.len()` consecutive u64s
        // written by the trampoline immediately before this call.
        let raw = unsafe { *raw_args.add(i) };
        args.push(Value::from_raw64(raw, *ty));
    }
    match closure(&args) {
        Ok(result) => {
            if has_out != 0 {
                let v = result.expect("host function declared an output but returned none");
                // SAFETY: `raw_out` points at one writable u64 reserved by
                // the trampoline for the return value.
                unsafe { *raw_out = v.to_raw64() };
            }
            0
        }
        Err(trap) => trap.code(),
    }
}

/// `memory.size`: called with the raw `Store`-wide memory index baked in by
/// `RelocKind::MemoryIndex`.
pub extern "C" fn memory_size_helper(mem_addr_raw: usize) -> u32 {
    invoke::current_store().mem(crate::runtime::MemAddr(mem_addr_raw)).size_pages()
}

/// `memory.grow`: returns the previous size in pages, or -1 if growing by
/// `delta_pages` would exceed the memory's declared (or default) maximum.
pub extern "C" fn memory_grow_helper(mem_addr_raw: usize, delta_pages: u32) -> i32 {
    let store = invoke::current_store();
    match store.mem_grow(crate::runtime::MemAddr(mem_addr_raw), delta_pages) {
        Some(old) => old as i32,
        None => -1,
    }
}

/// Build a trampoline that lets generated code call a host function through
/// the same uniform "load registers, `call`" sequence it uses for compiled
/// wasm functions. Returns the offset within `codebuf` the trampoline
/// starts at; the caller marks the buffer executable and reads the address
/// back out once every trampoline it needs has been appended.
pub fn build_host_trampoline(codebuf: &mut CodeBuffer, ty: &FuncType, func_addr: crate::runtime::FuncAddr) -> usize {
    let mut out = Vec::new();

    let n_in = ty.inputs.len();
    // raw_args[n_in] (8 bytes each) + one out slot (8 bytes), 16-aligned.
    let frame = {
        let raw = 8 * (n_in + 1);
        (raw + 15) / 16 * 16
    };

    x64::emit_push_r(&mut out, Reg::Rbp);
    x64::emit_mov_r_r(&mut out, Reg::Rbp, Reg::Rsp, true);
    x64::emit_alu_r_imm32(&mut out, x64::AluOp::Sub, Reg::Rsp, frame as i32, true);

    let int_regs = x64::INT_ARG_REGS;
    let float_regs = x64::FLOAT_ARG_REGS;
    let mut ii = 0usize;
    let mut fi = 0usize;
    for (i, ty) in ty.inputs.iter().enumerate() {
        let disp = -(8 * (i as i32 + 1));
        if ty.is_float() {
            x64::emit_movsd_store(&mut out, Reg::Rbp, disp, float_regs[fi]);
            fi += 1;
        } else {
            x64::emit_store_disp32(&mut out, Reg::Rbp, disp, int_regs[ii], true);
            ii += 1;
        }
    }

    let args_base_disp = -(8 * n_in as i32);
    let out_disp = -(8 * (n_in as i32 + 1));

    x64::emit_mov_r64_imm64(&mut out, Reg::Rdi, func_addr.0 as u64);
    x64::emit_lea_disp32(&mut out, Reg::Rsi, Reg::Rbp, args_base_disp);
    x64::emit_lea_disp32(&mut out, Reg::Rdx, Reg::Rbp, out_disp);
    x64::emit_mov_r_imm32(&mut out, Reg::Rcx, if ty.outputs.is_empty() { 0 } else { 1 }, false);
    x64::emit_mov_r64_imm64(&mut out, Reg::Rax, host_call_glue as usize as u64);
    x64::emit_call_r(&mut out, Reg::Rax);

    // eax holds a trap code, 0 meaning none.
    x64::emit_test_r_r(&mut out, Reg::Rax, Reg::Rax, false);
    let skip_trap = x64::emit_jcc_rel32(&mut out, x64::Cond::E);
    x64::emit_mov_r_r(&mut out, Reg::Rdi, Reg::Rax, false);
    x64::emit_mov_r64_imm64(&mut out, Reg::Rax, trap_helper as usize as u64);
    x64::emit_call_r(&mut out, Reg::Rax);

    let after_trap_check = out.len();
    x64::patch_rel32(&mut out, skip_trap, after_trap_check);

    if let Some(out_ty) = ty.outputs.first() {
        if out_ty.is_float() {
            x64::emit_movsd_load(&mut out, Xmm(0), Reg::Rbp, out_disp);
        } else {
            x64::emit_load_disp32(&mut out, Reg::Rax, Reg::Rbp, out_disp, true);
        }
    }

    x64::emit_mov_r_r(&mut out, Reg::Rsp, Reg::Rbp, true);
    x64::emit_pop_r(&mut out, Reg::Rbp);
    x64::emit_ret(&mut out);

    codebuf.write(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValType;

    #[test]
    fn host_trampoline_builds_without_overflowing_a_small_buffer() {
        let ty = FuncType { inputs: vec![ValType::I32, ValType::F64], outputs: vec![ValType::I32] };
        let mut buf = CodeBuffer::new(512).unwrap();
        let off = build_host_trampoline(&mut buf, &ty, crate::runtime::FuncAddr(3));
        assert_eq!(off, 0);
        assert!(buf.len() > 0);
    }
}
