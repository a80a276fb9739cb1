//! The code generator proper: one compiled x86-64 function body per wasm
//! function, built in a single pass over its instruction tree. No
//! optimization passes, no register allocation — every value lives in a
//! compile-time-known stack slot, exactly as the static operand stack model
//! describes. Mirrors the teacher's per-opcode `match` structure in spirit,
//! not the instruction set it was written against.

use crate::ast::{BlockType, FuncBody, Instruction, MemArg, Module};
use crate::error::{CompileError, CompileErrorKind};
use crate::runtime::{Reloc, RelocKind};
use crate::value::{FuncType, ValType};

use super::sstack::{operand_slot_offset, LabelFrame, LabelKind, LabelStack, LocalsLayout, OperandStack};
use super::x64::{self, AluOp, Cond, Reg, ShiftOp, Xmm};

pub struct FuncCompileResult {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
}

const SCRATCH_INT_A: Reg = Reg::Rax;
const SCRATCH_INT_B: Reg = Reg::Rcx;
const SCRATCH_INT_C: Reg = Reg::Rdx;
const SCRATCH_FLOAT_A: Xmm = Xmm(0);
const SCRATCH_FLOAT_B: Xmm = Xmm(1);

struct Codegen<'m> {
    module: &'m Module,
    function_index: u32,
    out: Vec<u8>,
    relocs: Vec<Reloc>,
    operand: OperandStack,
    labels: LabelStack,
    locals: LocalsLayout,
    func_exit_fixups: Vec<usize>,
    /// Offset of the `sub rsp, imm32` in the prologue, patched once the
    /// operand stack's high-water mark is known.
    frame_size_fixup: usize,
}

pub fn compile_function(module: &Module, function_index: u32, ty: &FuncType, body: &FuncBody) -> Result<FuncCompileResult, CompileError> {
    let locals = LocalsLayout::new(&ty.inputs, &body.locals);
    let mut cg = Codegen {
        module,
        function_index,
        out: Vec::new(),
        relocs: Vec::new(),
        operand: OperandStack::new(),
        labels: LabelStack::new(),
        locals,
        func_exit_fixups: Vec::new(),
        frame_size_fixup: 0,
    };
    cg.emit_prologue(ty);
    cg.compile_seq(&body.instructions)?;
    cg.emit_epilogue(ty)?;
    Ok(FuncCompileResult { code: cg.out, relocs: cg.relocs })
}

fn err(cg: &Codegen, kind: CompileErrorKind) -> CompileError {
    CompileError { function_index: cg.function_index, byte_offset_in_code: cg.out.len(), kind }
}

impl<'m> Codegen<'m> {
    fn emit_prologue(&mut self, ty: &FuncType) {
        x64::emit_push_r(&mut self.out, Reg::Rbp);
        x64::emit_mov_r_r(&mut self.out, Reg::Rbp, Reg::Rsp, true);
        x64::emit_alu_r_r(&mut self.out, AluOp::Xor, Reg::Rax, Reg::Rax, false);
        x64::emit_alu_r_imm32(&mut self.out, AluOp::Sub, Reg::Rsp, 0, true);
        self.frame_size_fixup = self.out.len() - 4;

        let int_regs = x64::INT_ARG_REGS;
        let float_regs = x64::FLOAT_ARG_REGS;
        let mut ii = 0usize;
        let mut fi = 0usize;
        for (i, t) in ty.inputs.iter().enumerate() {
            let off = self.locals.offset(i as u32);
            if t.is_float() {
                x64::emit_movsd_store(&mut self.out, Reg::Rbp, off, float_regs[fi]);
                fi += 1;
            } else {
                x64::emit_store_disp32(&mut self.out, Reg::Rbp, off, int_regs[ii], matches!(t, ValType::I64));
                ii += 1;
            }
        }
        // rax was zeroed above; zero-initialize declared locals beyond the parameters.
        for i in ty.inputs.len()..self.locals.count() {
            let off = self.locals.offset(i as u32);
            x64::emit_store_disp32(&mut self.out, Reg::Rbp, off, Reg::Rax, true);
        }
    }

    fn emit_epilogue(&mut self, ty: &FuncType) -> Result<(), CompileError> {
        let exit_offset = self.out.len();
        for fixup in std::mem::take(&mut self.func_exit_fixups) {
            x64::patch_rel32(&mut self.out, fixup, exit_offset);
        }
        // The function's final fallthrough also lands here with its result,
        // if any, already the top of the operand stack.
        if let Some(out_ty) = ty.outputs.first() {
            match self.operand.pop() {
                Some(slot) if slot.ty == *out_ty => self.load_slot(slot.depth, *out_ty, SCRATCH_INT_A, SCRATCH_FLOAT_A),
                Some(slot) => {
                    return Err(err_mismatch(self, slot.ty, *out_ty));
                }
                None => return Err(CompileError { function_index: self.function_index, byte_offset_in_code: self.out.len(), kind: CompileErrorKind::StackUnderflow }),
            }
            if out_ty.is_float() {
                x64::emit_movsd_xx(&mut self.out, Xmm(0), SCRATCH_FLOAT_A);
            } else {
                x64::emit_mov_r_r(&mut self.out, Reg::Rax, SCRATCH_INT_A, true);
            }
        }
        let frame_size = self.frame_size();
        x64::patch_i32(&mut self.out, self.frame_size_fixup, frame_size as i32);
        x64::emit_mov_r_r(&mut self.out, Reg::Rsp, Reg::Rbp, true);
        x64::emit_pop_r(&mut self.out, Reg::Rbp);
        x64::emit_ret(&mut self.out);
        Ok(())
    }

    fn frame_size(&self) -> usize {
        let slots = self.locals.count() + self.operand.max_depth();
        let bytes = 8 * slots + 8; // +8 keeps rsp 16-aligned after `push rbp`
        (bytes + 15) / 16 * 16
    }

    fn slot_offset(&self, depth: usize) -> i32 {
        operand_slot_offset(self.locals.count(), depth)
    }

    fn push_result(&mut self, ty: ValType, int_src: Reg, float_src: Xmm) {
        let slot = self.operand.push(ty);
        let off = self.slot_offset(slot.depth);
        if ty.is_float() {
            x64::emit_movsd_store(&mut self.out, Reg::Rbp, off, float_src);
        } else {
            x64::emit_store_disp32(&mut self.out, Reg::Rbp, off, int_src, ty == ValType::I64);
        }
    }

    fn load_slot(&mut self, depth: usize, ty: ValType, int_dst: Reg, float_dst: Xmm) {
        let off = self.slot_offset(depth);
        if ty.is_float() {
            x64::emit_movsd_load(&mut self.out, float_dst, Reg::Rbp, off);
        } else {
            x64::emit_load_disp32(&mut self.out, int_dst, Reg::Rbp, off, ty == ValType::I64);
        }
    }

    fn pop_int(&mut self, dst: Reg) -> Result<ValType, CompileError> {
        let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
        if slot.ty.is_float() {
            return Err(err_mismatch(self, slot.ty, ValType::I32));
        }
        self.load_slot(slot.depth, slot.ty, dst, Xmm(0));
        Ok(slot.ty)
    }

    fn pop_float(&mut self, dst: Xmm) -> Result<ValType, CompileError> {
        let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
        if !slot.ty.is_float() {
            return Err(err_mismatch(self, slot.ty, ValType::F64));
        }
        self.load_slot(slot.depth, slot.ty, Reg::Rax, dst);
        Ok(slot.ty)
    }

    fn pop_any(&mut self) -> Result<(ValType, usize), CompileError> {
        let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
        Ok((slot.ty, slot.depth))
    }

    fn emit_trap_call(&mut self, code: crate::error::TrapCode) {
        x64::emit_mov_r_imm32(&mut self.out, Reg::Rdi, code.code() as i32, false);
        let off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rax, 0);
        self.relocs.push(Reloc { kind: RelocKind::TrapHelper, code_offset: off });
        x64::emit_call_r(&mut self.out, Reg::Rax);
    }

    /// Emit `cond`-true skip-over-the-trap pattern: traps unless `cond` holds.
    fn emit_trap_unless(&mut self, cond: Cond, code: crate::error::TrapCode) {
        let skip = x64::emit_jcc_rel32(&mut self.out, cond);
        self.emit_trap_call(code);
        let here = self.out.len();
        x64::patch_rel32(&mut self.out, skip, here);
    }

    fn compile_seq(&mut self, instrs: &[Instruction]) -> Result<(), CompileError> {
        for i in instrs {
            self.compile_one(i)?;
        }
        Ok(())
    }

    fn block_arity(bt: BlockType) -> u8 {
        match bt {
            BlockType::Empty => 0,
            BlockType::Value(_) => 1,
        }
    }

    fn truncate_for_branch(&mut self, target_depth: usize, arity: u8) {
        // The branch's result (if any) is the current top of stack; move it
        // down to sit exactly at `target_depth` before the label's
        // continuation reads it from there.
        if arity == 1 {
            let (ty, from_depth) = (self.operand.peek().unwrap().ty, self.operand.peek().unwrap().depth);
            if from_depth != target_depth {
                self.load_slot(from_depth, ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                let off = self.slot_offset(target_depth);
                if ty.is_float() {
                    x64::emit_movsd_store(&mut self.out, Reg::Rbp, off, SCRATCH_FLOAT_A);
                } else {
                    x64::emit_store_disp32(&mut self.out, Reg::Rbp, off, SCRATCH_INT_A, ty == ValType::I64);
                }
            }
        }
    }

    fn compile_one(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        use Instruction as I;
        match instr {
            I::Unreachable => self.emit_trap_call(crate::error::TrapCode::Unreachable),
            I::Nop => x64::emit_nop(&mut self.out),

            I::Block { blockty, body } => {
                let arity = Self::block_arity(*blockty);
                let entry_depth = self.operand.depth();
                self.labels.push(LabelFrame {
                    kind: LabelKind::Block,
                    arity,
                    stack_depth_at_entry: entry_depth,
                    loop_start: None,
                    branch_fixups: Vec::new(),
                    else_fixup: None,
                });
                self.compile_seq(body)?;
                let frame = self.labels.pop().unwrap();
                let here = self.out.len();
                for f in frame.branch_fixups {
                    x64::patch_rel32(&mut self.out, f, here);
                }
                self.reconcile_block_result(entry_depth, arity)?;
            }

            I::Loop { blockty, body } => {
                let arity = Self::block_arity(*blockty);
                let entry_depth = self.operand.depth();
                let loop_start = self.out.len();
                self.labels.push(LabelFrame {
                    kind: LabelKind::Loop,
                    arity,
                    stack_depth_at_entry: entry_depth,
                    loop_start: Some(loop_start),
                    branch_fixups: Vec::new(),
                    else_fixup: None,
                });
                self.compile_seq(body)?;
                let frame = self.labels.pop().unwrap();
                debug_assert!(frame.branch_fixups.is_empty());
                self.reconcile_block_result(entry_depth, arity)?;
            }

            I::If { blockty, then_body, else_body } => {
                let arity = Self::block_arity(*blockty);
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_test_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, false);
                let jz = x64::emit_jcc_rel32(&mut self.out, Cond::E);
                let entry_depth = self.operand.depth();

                self.labels.push(LabelFrame {
                    kind: LabelKind::If,
                    arity,
                    stack_depth_at_entry: entry_depth,
                    loop_start: None,
                    branch_fixups: Vec::new(),
                    else_fixup: None,
                });
                self.compile_seq(then_body)?;
                self.reconcile_block_result(entry_depth, arity)?;
                let jmp_end = x64::emit_jmp_rel32(&mut self.out);
                let else_start = self.out.len();
                x64::patch_rel32(&mut self.out, jz, else_start);
                self.operand.truncate(entry_depth);
                self.compile_seq(else_body)?;
                self.reconcile_block_result(entry_depth, arity)?;
                let end = self.out.len();
                x64::patch_rel32(&mut self.out, jmp_end, end);

                let frame = self.labels.pop().unwrap();
                for f in frame.branch_fixups {
                    x64::patch_rel32(&mut self.out, f, end);
                }
            }

            I::Br(depth) => self.emit_branch(*depth)?,
            I::BrIf(depth) => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_test_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, false);
                let skip = x64::emit_jcc_rel32(&mut self.out, Cond::E);
                self.emit_branch(*depth)?;
                let here = self.out.len();
                x64::patch_rel32(&mut self.out, skip, here);
            }
            I::BrTable { labels, default } => self.emit_br_table(labels, *default)?,

            I::Return => {
                // Move the return value (if any) down to the function's
                // base slot depth so the shared epilogue always finds it at
                // the same place regardless of which `return` fired.
                let out_depth = 0usize;
                let arity = if self.operand.peek().is_some() { 1 } else { 0 };
                if arity == 1 {
                    self.truncate_for_branch(out_depth, 1);
                }
                let off = x64::emit_jmp_rel32(&mut self.out);
                self.func_exit_fixups.push(off);
            }

            I::Call(funcidx) => self.emit_call(*funcidx)?,
            I::CallIndirect(typeidx) => self.emit_call_indirect(*typeidx)?,

            I::Drop => {
                self.operand.pop().ok_or_else(|| stack_underflow(self))?;
            }
            I::Select => {
                self.pop_int(SCRATCH_INT_C)?;
                let (ty_b, depth_b) = self.pop_any()?;
                let (ty_a, depth_a) = self.pop_any()?;
                if ty_a != ty_b {
                    return Err(err_mismatch(self, ty_b, ty_a));
                }
                x64::emit_test_r_r(&mut self.out, SCRATCH_INT_C, SCRATCH_INT_C, false);
                let use_b = x64::emit_jcc_rel32(&mut self.out, Cond::E);
                self.load_slot(depth_a, ty_a, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                let done = x64::emit_jmp_rel32(&mut self.out);
                let b_start = self.out.len();
                x64::patch_rel32(&mut self.out, use_b, b_start);
                self.load_slot(depth_b, ty_b, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                let after = self.out.len();
                x64::patch_rel32(&mut self.out, done, after);
                self.push_result(ty_a, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }

            I::LocalGet(idx) => {
                let ty = self.locals.ty(*idx).ok_or_else(|| unknown_local(self, *idx))?;
                let off = self.locals.offset(*idx);
                if ty.is_float() {
                    x64::emit_movsd_load(&mut self.out, SCRATCH_FLOAT_A, Reg::Rbp, off);
                } else {
                    x64::emit_load_disp32(&mut self.out, SCRATCH_INT_A, Reg::Rbp, off, ty == ValType::I64);
                }
                self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::LocalSet(idx) | I::LocalTee(idx) => {
                let ty = self.locals.ty(*idx).ok_or_else(|| unknown_local(self, *idx))?;
                let is_tee = matches!(instr, I::LocalTee(_));
                let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
                if slot.ty != ty {
                    return Err(err_mismatch(self, slot.ty, ty));
                }
                self.load_slot(slot.depth, ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                let off = self.locals.offset(*idx);
                if ty.is_float() {
                    x64::emit_movsd_store(&mut self.out, Reg::Rbp, off, SCRATCH_FLOAT_A);
                } else {
                    x64::emit_store_disp32(&mut self.out, Reg::Rbp, off, SCRATCH_INT_A, ty == ValType::I64);
                }
                if is_tee {
                    self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                }
            }
            I::GlobalGet(idx) => {
                let ty = self.global_type(*idx)?;
                let off = x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_C, 0);
                self.relocs.push(Reloc { kind: RelocKind::GlobalAddr(*idx), code_offset: off });
                if ty.is_float() {
                    x64::emit_movsd_load(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_C, 0);
                } else {
                    x64::emit_load_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0, true);
                }
                self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::GlobalSet(idx) => {
                let ty = self.global_type(*idx)?;
                let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
                if slot.ty != ty {
                    return Err(err_mismatch(self, slot.ty, ty));
                }
                self.load_slot(slot.depth, ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                let off = x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_C, 0);
                self.relocs.push(Reloc { kind: RelocKind::GlobalAddr(*idx), code_offset: off });
                if ty.is_float() {
                    x64::emit_movsd_store(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_FLOAT_A);
                } else {
                    x64::emit_store_disp32(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_INT_A, true);
                }
            }

            I::I32Load(m) => self.emit_load(m, ValType::I32, 4, false, false)?,
            I::I64Load(m) => self.emit_load(m, ValType::I64, 8, false, false)?,
            I::F32Load(m) => self.emit_load(m, ValType::F32, 4, false, false)?,
            I::F64Load(m) => self.emit_load(m, ValType::F64, 8, false, false)?,
            I::I32Load8S(m) => self.emit_load(m, ValType::I32, 1, true, false)?,
            I::I32Load8U(m) => self.emit_load(m, ValType::I32, 1, false, false)?,
            I::I32Load16S(m) => self.emit_load(m, ValType::I32, 2, true, false)?,
            I::I32Load16U(m) => self.emit_load(m, ValType::I32, 2, false, false)?,
            I::I64Load8S(m) => self.emit_load(m, ValType::I64, 1, true, true)?,
            I::I64Load8U(m) => self.emit_load(m, ValType::I64, 1, false, true)?,
            I::I64Load16S(m) => self.emit_load(m, ValType::I64, 2, true, true)?,
            I::I64Load16U(m) => self.emit_load(m, ValType::I64, 2, false, true)?,
            I::I64Load32S(m) => self.emit_load(m, ValType::I64, 4, true, true)?,
            I::I64Load32U(m) => self.emit_load(m, ValType::I64, 4, false, true)?,

            I::I32Store(m) => self.emit_store(m, ValType::I32, 4)?,
            I::I64Store(m) => self.emit_store(m, ValType::I64, 8)?,
            I::F32Store(m) => self.emit_store(m, ValType::F32, 4)?,
            I::F64Store(m) => self.emit_store(m, ValType::F64, 8)?,
            I::I32Store8(m) => self.emit_store(m, ValType::I32, 1)?,
            I::I32Store16(m) => self.emit_store(m, ValType::I32, 2)?,
            I::I64Store8(m) => self.emit_store(m, ValType::I64, 1)?,
            I::I64Store16(m) => self.emit_store(m, ValType::I64, 2)?,
            I::I64Store32(m) => self.emit_store(m, ValType::I64, 4)?,

            I::MemorySize => {
                let off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rdi, 0);
                self.relocs.push(Reloc { kind: RelocKind::MemoryIndex(0), code_offset: off });
                let helper_off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rax, memory_size_helper_addr());
                let _ = helper_off;
                x64::emit_call_r(&mut self.out, Reg::Rax);
                x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, Reg::Rax, false);
                self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::MemoryGrow => {
                self.pop_int(Reg::Rsi)?;
                let off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rdi, 0);
                self.relocs.push(Reloc { kind: RelocKind::MemoryIndex(0), code_offset: off });
                x64::emit_mov_r64_imm64(&mut self.out, Reg::Rax, memory_grow_helper_addr());
                x64::emit_call_r(&mut self.out, Reg::Rax);
                x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, Reg::Rax, false);
                self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }

            I::I32Const(v) => {
                x64::emit_mov_r_imm32(&mut self.out, SCRATCH_INT_A, *v, false);
                self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::I64Const(v) => {
                x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_A, *v as u64);
                self.push_result(ValType::I64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::F32Const(v) => {
                x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_A, v.to_bits() as u64);
                x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
                self.push_result(ValType::F32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::F64Const(v) => {
                x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_A, v.to_bits());
                x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
                self.push_result(ValType::F64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }

            I::I32Eqz => self.unary_cmp_zero(ValType::I32)?,
            I::I64Eqz => self.unary_cmp_zero(ValType::I64)?,

            I::I32Eq => self.int_cmp(ValType::I32, Cond::E)?,
            I::I32Ne => self.int_cmp(ValType::I32, Cond::Ne)?,
            I::I32LtS => self.int_cmp(ValType::I32, Cond::L)?,
            I::I32LtU => self.int_cmp(ValType::I32, Cond::B)?,
            I::I32GtS => self.int_cmp(ValType::I32, Cond::G)?,
            I::I32GtU => self.int_cmp(ValType::I32, Cond::A)?,
            I::I32LeS => self.int_cmp(ValType::I32, Cond::Le)?,
            I::I32LeU => self.int_cmp(ValType::I32, Cond::Be)?,
            I::I32GeS => self.int_cmp(ValType::I32, Cond::Ge)?,
            I::I32GeU => self.int_cmp(ValType::I32, Cond::Ae)?,

            I::I64Eq => self.int_cmp(ValType::I64, Cond::E)?,
            I::I64Ne => self.int_cmp(ValType::I64, Cond::Ne)?,
            I::I64LtS => self.int_cmp(ValType::I64, Cond::L)?,
            I::I64LtU => self.int_cmp(ValType::I64, Cond::B)?,
            I::I64GtS => self.int_cmp(ValType::I64, Cond::G)?,
            I::I64GtU => self.int_cmp(ValType::I64, Cond::A)?,
            I::I64LeS => self.int_cmp(ValType::I64, Cond::Le)?,
            I::I64LeU => self.int_cmp(ValType::I64, Cond::Be)?,
            I::I64GeS => self.int_cmp(ValType::I64, Cond::Ge)?,
            I::I64GeU => self.int_cmp(ValType::I64, Cond::Ae)?,

            I::F32Eq => self.float_cmp(ValType::F32, Cond::E)?,
            I::F32Ne => self.float_cmp(ValType::F32, Cond::Ne)?,
            I::F32Lt => self.float_cmp(ValType::F32, Cond::B)?,
            I::F32Gt => self.float_cmp(ValType::F32, Cond::A)?,
            I::F32Le => self.float_cmp(ValType::F32, Cond::Be)?,
            I::F32Ge => self.float_cmp(ValType::F32, Cond::Ae)?,
            I::F64Eq => self.float_cmp(ValType::F64, Cond::E)?,
            I::F64Ne => self.float_cmp(ValType::F64, Cond::Ne)?,
            I::F64Lt => self.float_cmp(ValType::F64, Cond::B)?,
            I::F64Gt => self.float_cmp(ValType::F64, Cond::A)?,
            I::F64Le => self.float_cmp(ValType::F64, Cond::Be)?,
            I::F64Ge => self.float_cmp(ValType::F64, Cond::Ae)?,

            I::I32Clz => self.unary_count(ValType::I32, CountOp::Clz)?,
            I::I32Ctz => self.unary_count(ValType::I32, CountOp::Ctz)?,
            I::I32Popcnt => self.unary_count(ValType::I32, CountOp::Popcnt)?,
            I::I64Clz => self.unary_count(ValType::I64, CountOp::Clz)?,
            I::I64Ctz => self.unary_count(ValType::I64, CountOp::Ctz)?,
            I::I64Popcnt => self.unary_count(ValType::I64, CountOp::Popcnt)?,

            I::I32Add => self.int_binop(ValType::I32, AluOp::Add)?,
            I::I32Sub => self.int_binop(ValType::I32, AluOp::Sub)?,
            I::I32And => self.int_binop(ValType::I32, AluOp::And)?,
            I::I32Or => self.int_binop(ValType::I32, AluOp::Or)?,
            I::I32Xor => self.int_binop(ValType::I32, AluOp::Xor)?,
            I::I64Add => self.int_binop(ValType::I64, AluOp::Add)?,
            I::I64Sub => self.int_binop(ValType::I64, AluOp::Sub)?,
            I::I64And => self.int_binop(ValType::I64, AluOp::And)?,
            I::I64Or => self.int_binop(ValType::I64, AluOp::Or)?,
            I::I64Xor => self.int_binop(ValType::I64, AluOp::Xor)?,

            I::I32Mul => self.int_mul(ValType::I32)?,
            I::I64Mul => self.int_mul(ValType::I64)?,

            I::I32DivS => self.int_div_rem(ValType::I32, DivOp::DivSigned)?,
            I::I32DivU => self.int_div_rem(ValType::I32, DivOp::DivUnsigned)?,
            I::I32RemS => self.int_div_rem(ValType::I32, DivOp::RemSigned)?,
            I::I32RemU => self.int_div_rem(ValType::I32, DivOp::RemUnsigned)?,
            I::I64DivS => self.int_div_rem(ValType::I64, DivOp::DivSigned)?,
            I::I64DivU => self.int_div_rem(ValType::I64, DivOp::DivUnsigned)?,
            I::I64RemS => self.int_div_rem(ValType::I64, DivOp::RemSigned)?,
            I::I64RemU => self.int_div_rem(ValType::I64, DivOp::RemUnsigned)?,

            I::I32Shl => self.shift_op(ValType::I32, ShiftOp::Shl)?,
            I::I32ShrS => self.shift_op(ValType::I32, ShiftOp::Sar)?,
            I::I32ShrU => self.shift_op(ValType::I32, ShiftOp::Shr)?,
            I::I32Rotl => self.shift_op(ValType::I32, ShiftOp::Rol)?,
            I::I32Rotr => self.shift_op(ValType::I32, ShiftOp::Ror)?,
            I::I64Shl => self.shift_op(ValType::I64, ShiftOp::Shl)?,
            I::I64ShrS => self.shift_op(ValType::I64, ShiftOp::Sar)?,
            I::I64ShrU => self.shift_op(ValType::I64, ShiftOp::Shr)?,
            I::I64Rotl => self.shift_op(ValType::I64, ShiftOp::Rol)?,
            I::I64Rotr => self.shift_op(ValType::I64, ShiftOp::Ror)?,

            I::F32Add => self.float_binop(ValType::F32, FloatOp::Add)?,
            I::F32Sub => self.float_binop(ValType::F32, FloatOp::Sub)?,
            I::F32Mul => self.float_binop(ValType::F32, FloatOp::Mul)?,
            I::F32Div => self.float_binop(ValType::F32, FloatOp::Div)?,
            I::F64Add => self.float_binop(ValType::F64, FloatOp::Add)?,
            I::F64Sub => self.float_binop(ValType::F64, FloatOp::Sub)?,
            I::F64Mul => self.float_binop(ValType::F64, FloatOp::Mul)?,
            I::F64Div => self.float_binop(ValType::F64, FloatOp::Div)?,

            I::F32Min => self.float_minmax(ValType::F32, true)?,
            I::F32Max => self.float_minmax(ValType::F32, false)?,
            I::F64Min => self.float_minmax(ValType::F64, true)?,
            I::F64Max => self.float_minmax(ValType::F64, false)?,

            I::F32Copysign => self.float_copysign(ValType::F32)?,
            I::F64Copysign => self.float_copysign(ValType::F64)?,

            I::F32Abs => self.float_unary_bits(ValType::F32, FloatUnaryBits::Abs)?,
            I::F32Neg => self.float_unary_bits(ValType::F32, FloatUnaryBits::Neg)?,
            I::F64Abs => self.float_unary_bits(ValType::F64, FloatUnaryBits::Abs)?,
            I::F64Neg => self.float_unary_bits(ValType::F64, FloatUnaryBits::Neg)?,

            I::F32Sqrt => self.float_sqrt(ValType::F32)?,
            I::F64Sqrt => self.float_sqrt(ValType::F64)?,

            I::F32Ceil => self.float_round(ValType::F32, 2)?,
            I::F32Floor => self.float_round(ValType::F32, 1)?,
            I::F32Trunc => self.float_round(ValType::F32, 3)?,
            I::F32Nearest => self.float_round(ValType::F32, 0)?,
            I::F64Ceil => self.float_round(ValType::F64, 2)?,
            I::F64Floor => self.float_round(ValType::F64, 1)?,
            I::F64Trunc => self.float_round(ValType::F64, 3)?,
            I::F64Nearest => self.float_round(ValType::F64, 0)?,

            I::I32WrapI64 => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, false); // 32-bit mov zero-extends, truncating the high half
                self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::I64ExtendI32U => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, false);
                self.push_result(ValType::I64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::I64ExtendI32S => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_movsxd_rr(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A);
                self.push_result(ValType::I64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }

            I::I32TruncF32S | I::I32TruncF64S => self.float_to_int(ValType::I32, true)?,
            I::I32TruncF32U | I::I32TruncF64U => self.float_to_int(ValType::I32, false)?,
            I::I64TruncF32S | I::I64TruncF64S => self.float_to_int(ValType::I64, true)?,
            I::I64TruncF32U | I::I64TruncF64U => self.float_to_int(ValType::I64, false)?,

            I::F32ConvertI32S | I::F32ConvertI64S => self.int_to_float(ValType::F32, true)?,
            I::F32ConvertI32U | I::F32ConvertI64U => self.int_to_float(ValType::F32, false)?,
            I::F64ConvertI32S | I::F64ConvertI64S => self.int_to_float(ValType::F64, true)?,
            I::F64ConvertI32U | I::F64ConvertI64U => self.int_to_float(ValType::F64, false)?,

            I::F32DemoteF64 => {
                self.pop_float(SCRATCH_FLOAT_A)?;
                x64::emit_cvtsd2ss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
                self.push_result(ValType::F32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::F64PromoteF32 => {
                self.pop_float(SCRATCH_FLOAT_A)?;
                x64::emit_cvtss2sd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
                self.push_result(ValType::F64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }

            I::I32ReinterpretF32 => {
                self.pop_float(SCRATCH_FLOAT_A)?;
                x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::I64ReinterpretF64 => {
                self.pop_float(SCRATCH_FLOAT_A)?;
                x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                self.push_result(ValType::I64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::F32ReinterpretI32 => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_movd_xmm_from_r32(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
                self.push_result(ValType::F32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
            I::F64ReinterpretI64 => {
                self.pop_int(SCRATCH_INT_A)?;
                x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
                self.push_result(ValType::F64, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
        }
        Ok(())
    }

    fn reconcile_block_result(&mut self, entry_depth: usize, arity: u8) -> Result<(), CompileError> {
        if arity == 1 {
            let slot = self.operand.peek().ok_or_else(|| stack_underflow(self))?;
            if slot.depth != entry_depth {
                self.load_slot(slot.depth, slot.ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
                self.operand.truncate(entry_depth);
                self.push_result(slot.ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
        } else {
            self.operand.truncate(entry_depth);
        }
        Ok(())
    }

    fn emit_branch(&mut self, depth: u32) -> Result<(), CompileError> {
        let frame_depth_at_entry;
        let arity;
        let is_loop;
        let loop_start;
        {
            let frame = self.labels.nth_from_innermost(depth).ok_or_else(|| unknown_label(self, depth))?;
            frame_depth_at_entry = frame.stack_depth_at_entry;
            arity = frame.arity;
            is_loop = frame.loop_start.is_some();
            loop_start = frame.loop_start;
        }
        // A loop's own label targets its start (arity 0 by construction of
        // the wasm type system for loop branch targets); a block/if's label
        // targets its end, with its result already moved into place.
        let target_depth = if is_loop { frame_depth_at_entry } else { frame_depth_at_entry };
        self.truncate_for_branch(target_depth, if is_loop { 0 } else { arity });
        if let Some(start) = loop_start {
            let off = x64::emit_jmp_rel32(&mut self.out);
            x64::patch_rel32(&mut self.out, off, start);
        } else {
            let off = x64::emit_jmp_rel32(&mut self.out);
            self.labels.nth_from_innermost_mut(depth).unwrap().branch_fixups.push(off);
        }
        Ok(())
    }

    fn emit_br_table(&mut self, labels: &[u32], default: u32) -> Result<(), CompileError> {
        self.pop_int(SCRATCH_INT_A)?; // selector

        let mut arm_fixups = Vec::with_capacity(labels.len());
        for (i, _) in labels.iter().enumerate() {
            x64::emit_alu_r_imm32(&mut self.out, AluOp::Cmp, SCRATCH_INT_A, i as i32, false);
            let je = x64::emit_jcc_rel32(&mut self.out, Cond::E);
            arm_fixups.push(je);
        }
        // None matched: fall through to the default arm.
        self.emit_branch(default)?;

        for (fixup, label) in arm_fixups.into_iter().zip(labels) {
            let here = self.out.len();
            x64::patch_rel32(&mut self.out, fixup, here);
            self.emit_branch(*label)?;
        }
        Ok(())
    }

    fn global_type(&self, idx: u32) -> Result<ValType, CompileError> {
        let n_imported = self
            .module
            .imports
            .iter()
            .filter(|i| matches!(i.desc, crate::ast::ImportDesc::Global(_)))
            .count();
        if (idx as usize) < n_imported {
            let mut seen = 0;
            for imp in &self.module.imports {
                if let crate::ast::ImportDesc::Global(gt) = &imp.desc {
                    if seen == idx as usize {
                        return Ok(gt.valtype);
                    }
                    seen += 1;
                }
            }
        } else if let Some((gt, _)) = self.module.globals.get(idx as usize - n_imported) {
            return Ok(gt.valtype);
        }
        Err(unknown_global(self, idx))
    }

    fn emit_call(&mut self, funcidx: u32) -> Result<(), CompileError> {
        let ty = self.module.func_type(funcidx).cloned().ok_or_else(|| unknown_func(self, funcidx))?;
        self.marshal_call_args(&ty)?;
        let off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rax, 0);
        self.relocs.push(Reloc { kind: RelocKind::CallTarget(funcidx), code_offset: off });
        x64::emit_call_r(&mut self.out, Reg::Rax);
        self.unmarshal_call_result(&ty);
        Ok(())
    }

    fn emit_call_indirect(&mut self, typeidx: u32) -> Result<(), CompileError> {
        let ty = self.module.types.get(typeidx as usize).cloned().ok_or_else(|| unknown_type(self, typeidx))?;
        self.pop_int(Reg::Rsi)?; // element index

        let table_off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rdi, 0);
        self.relocs.push(Reloc { kind: RelocKind::Table(0), code_offset: table_off });
        let ty_off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rdx, 0);
        self.relocs.push(Reloc { kind: RelocKind::FuncTypeDesc(typeidx), code_offset: ty_off });
        let resolve_off = x64::emit_mov_r64_imm64(&mut self.out, Reg::Rax, 0);
        self.relocs.push(Reloc { kind: RelocKind::ResolveIndirectCall, code_offset: resolve_off });
        x64::emit_call_r(&mut self.out, Reg::Rax);
        x64::emit_push_r(&mut self.out, Reg::Rax); // stash resolved entry across arg marshalling

        self.marshal_call_args(&ty)?;
        x64::emit_pop_r(&mut self.out, Reg::R10);
        x64::emit_call_r(&mut self.out, Reg::R10);
        self.unmarshal_call_result(&ty);
        Ok(())
    }

    fn marshal_call_args(&mut self, ty: &FuncType) -> Result<(), CompileError> {
        let n = ty.inputs.len();
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(self.pop_any()?);
        }
        slots.reverse();
        let int_regs = x64::INT_ARG_REGS;
        let float_regs = x64::FLOAT_ARG_REGS;
        let mut ii = 0usize;
        let mut fi = 0usize;
        for ((ty_actual, depth), declared) in slots.into_iter().zip(&ty.inputs) {
            if ty_actual != *declared {
                return Err(err_mismatch(self, ty_actual, *declared));
            }
            if declared.is_float() {
                x64::emit_movsd_load(&mut self.out, float_regs[fi], Reg::Rbp, self.slot_offset(depth));
                fi += 1;
            } else {
                x64::emit_load_disp32(&mut self.out, int_regs[ii], Reg::Rbp, self.slot_offset(depth), *declared == ValType::I64);
                ii += 1;
            }
        }
        Ok(())
    }

    fn unmarshal_call_result(&mut self, ty: &FuncType) {
        if let Some(out_ty) = ty.outputs.first() {
            if out_ty.is_float() {
                self.push_result(*out_ty, SCRATCH_INT_A, Xmm(0));
            } else {
                x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, Reg::Rax, *out_ty == ValType::I64);
                self.push_result(*out_ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            }
        }
    }

    fn unary_cmp_zero(&mut self, ty: ValType) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_A)?;
        x64::emit_test_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, w);
        x64::emit_setcc_zx(&mut self.out, Cond::E, SCRATCH_INT_A);
        self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn int_cmp(&mut self, ty: ValType, cond: Cond) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_B)?;
        self.pop_int(SCRATCH_INT_A)?;
        x64::emit_alu_r_r(&mut self.out, AluOp::Cmp, SCRATCH_INT_A, SCRATCH_INT_B, w);
        x64::emit_setcc_zx(&mut self.out, cond, SCRATCH_INT_A);
        self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_cmp(&mut self, ty: ValType, cond: Cond) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_B)?;
        self.pop_float(SCRATCH_FLOAT_A)?;
        if ty == ValType::F32 {
            x64::emit_ucomiss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        } else {
            x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        }
        x64::emit_setcc_zx(&mut self.out, cond, SCRATCH_INT_A);
        self.push_result(ValType::I32, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn unary_count(&mut self, ty: ValType, op: CountOp) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_A)?;
        match op {
            CountOp::Clz => x64::emit_lzcnt(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, w),
            CountOp::Ctz => x64::emit_tzcnt(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, w),
            CountOp::Popcnt => x64::emit_popcnt(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, w),
        }
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn int_binop(&mut self, ty: ValType, op: AluOp) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_B)?;
        self.pop_int(SCRATCH_INT_A)?;
        x64::emit_alu_r_r(&mut self.out, op, SCRATCH_INT_A, SCRATCH_INT_B, w);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn int_mul(&mut self, ty: ValType) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_B)?;
        self.pop_int(SCRATCH_INT_A)?;
        x64::emit_imul_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_B, w);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn shift_op(&mut self, ty: ValType, op: ShiftOp) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(Reg::Rcx)?; // shift amount must be in CL
        self.pop_int(SCRATCH_INT_A)?;
        x64::emit_shift_cl(&mut self.out, op, SCRATCH_INT_A, w);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn int_div_rem(&mut self, ty: ValType, op: DivOp) -> Result<(), CompileError> {
        let w = ty == ValType::I64;
        self.pop_int(SCRATCH_INT_C)?; // divisor, kept off rax/rdx until cdq/cqo
        self.pop_int(Reg::Rax)?;
        x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_B, SCRATCH_INT_C, w);
        x64::emit_test_r_r(&mut self.out, SCRATCH_INT_B, SCRATCH_INT_B, w);
        self.emit_trap_unless(Cond::Ne, crate::error::TrapCode::IntegerDivideByZero);

        if matches!(op, DivOp::DivSigned) {
            // INT_MIN / -1 overflows; INT_MIN % -1 is well-defined as 0 per
            // the wasm spec, so only the division form needs this guard.
            x64::emit_alu_r_imm32(&mut self.out, AluOp::Cmp, SCRATCH_INT_B, -1, w);
            let not_neg_one = x64::emit_jcc_rel32(&mut self.out, Cond::Ne);
            let min = if w { i64::MIN as i32 } else { i32::MIN };
            x64::emit_alu_r_imm32(&mut self.out, AluOp::Cmp, Reg::Rax, min, w);
            self.emit_trap_unless(Cond::Ne, crate::error::TrapCode::IntegerOverflow);
            let here = self.out.len();
            x64::patch_rel32(&mut self.out, not_neg_one, here);
        }

        match op {
            DivOp::DivSigned | DivOp::RemSigned => x64::emit_cdq_cqo(&mut self.out, w),
            DivOp::DivUnsigned | DivOp::RemUnsigned => {
                x64::emit_alu_r_r(&mut self.out, AluOp::Xor, Reg::Rdx, Reg::Rdx, w);
            }
        }
        let signed = matches!(op, DivOp::DivSigned | DivOp::RemSigned);
        x64::emit_idiv_r(&mut self.out, SCRATCH_INT_B, w, signed);
        let result_reg = match op {
            DivOp::DivSigned | DivOp::DivUnsigned => Reg::Rax,
            DivOp::RemSigned | DivOp::RemUnsigned => Reg::Rdx,
        };
        x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_A, result_reg, w);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_binop(&mut self, ty: ValType, op: FloatOp) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_B)?;
        self.pop_float(SCRATCH_FLOAT_A)?;
        let f32 = ty == ValType::F32;
        match (op, f32) {
            (FloatOp::Add, true) => x64::emit_addss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Add, false) => x64::emit_addsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Sub, true) => x64::emit_subss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Sub, false) => x64::emit_subsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Mul, true) => x64::emit_mulss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Mul, false) => x64::emit_mulsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Div, true) => x64::emit_divss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
            (FloatOp::Div, false) => x64::emit_divsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B),
        }
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    /// wasm `min`/`max` differ from `minss`/`maxss` on NaN and on +-0, so
    /// they're built from compares rather than a single instruction.
    fn float_minmax(&mut self, ty: ValType, is_min: bool) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_B)?;
        self.pop_float(SCRATCH_FLOAT_A)?;
        if ty == ValType::F32 {
            x64::emit_ucomiss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        } else {
            x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        }
        // ucomis[sd] sets ZF (and PF) on equal, and sets ZF+PF+CF together on
        // unordered — check PF first so the equal branch below only ever
        // sees true numeric equality, never a NaN operand.
        let unordered = x64::emit_jcc_rel32(&mut self.out, Cond::P);
        let is_equal = x64::emit_jcc_rel32(&mut self.out, Cond::E);
        let cond = if is_min { Cond::B } else { Cond::A };
        let a_wins = x64::emit_jcc_rel32(&mut self.out, cond);
        x64::emit_movsd_xx(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        let b_wins_done = x64::emit_jmp_rel32(&mut self.out);

        let equal_path = self.out.len();
        x64::patch_rel32(&mut self.out, is_equal, equal_path);
        // Equal and not unordered: apart from +0/-0, IEEE 754 values that
        // compare equal are bit-identical, so combining full words with
        // AND/OR leaves non-zero operands untouched and picks the right
        // zero sign (min favors -0, max favors +0) since the bit patterns
        // for +0/-0 differ only in that sign bit.
        if ty == ValType::F32 {
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_B, SCRATCH_FLOAT_B);
            let op = if is_min { AluOp::Or } else { AluOp::And };
            x64::emit_alu_r_r(&mut self.out, op, SCRATCH_INT_A, SCRATCH_INT_B, false);
            x64::emit_movd_xmm_from_r32(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        } else {
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_B, SCRATCH_FLOAT_B);
            let op = if is_min { AluOp::Or } else { AluOp::And };
            x64::emit_alu_r_r(&mut self.out, op, SCRATCH_INT_A, SCRATCH_INT_B, true);
            x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        }
        let equal_done = x64::emit_jmp_rel32(&mut self.out);

        let unordered_path = self.out.len();
        x64::patch_rel32(&mut self.out, unordered, unordered_path);
        // Either operand is NaN: propagate it. addsd/addss on a NaN operand
        // always yields NaN, regardless of the other operand.
        if ty == ValType::F32 {
            x64::emit_addss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        } else {
            x64::emit_addsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        }

        let a_wins_target = self.out.len();
        x64::patch_rel32(&mut self.out, a_wins, a_wins_target);
        let here = self.out.len();
        x64::patch_rel32(&mut self.out, b_wins_done, here);
        x64::patch_rel32(&mut self.out, equal_done, here);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_copysign(&mut self, ty: ValType) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_B)?;
        self.pop_float(SCRATCH_FLOAT_A)?;
        if ty == ValType::F32 {
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_B, SCRATCH_FLOAT_B);
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            x64::emit_alu_r_imm32(&mut self.out, AluOp::And, SCRATCH_INT_B, i32::MIN, false);
            x64::emit_alu_r_imm32(&mut self.out, AluOp::And, SCRATCH_INT_A, i32::MAX, false);
            x64::emit_alu_r_r(&mut self.out, AluOp::Or, SCRATCH_INT_A, SCRATCH_INT_B, false);
            x64::emit_movd_xmm_from_r32(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        } else {
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_B, SCRATCH_FLOAT_B);
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            x64::emit_mov_r64_imm64(&mut self.out, Reg::R10, 0x8000_0000_0000_0000);
            x64::emit_alu_r_r(&mut self.out, AluOp::And, SCRATCH_INT_B, Reg::R10, true);
            x64::emit_mov_r64_imm64(&mut self.out, Reg::R10, 0x7FFF_FFFF_FFFF_FFFF);
            x64::emit_alu_r_r(&mut self.out, AluOp::And, SCRATCH_INT_A, Reg::R10, true);
            x64::emit_alu_r_r(&mut self.out, AluOp::Or, SCRATCH_INT_A, SCRATCH_INT_B, true);
            x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        }
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_unary_bits(&mut self, ty: ValType, op: FloatUnaryBits) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_A)?;
        if ty == ValType::F32 {
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            match op {
                FloatUnaryBits::Abs => x64::emit_alu_r_imm32(&mut self.out, AluOp::And, SCRATCH_INT_A, i32::MAX, false),
                FloatUnaryBits::Neg => x64::emit_alu_r_imm32(&mut self.out, AluOp::Xor, SCRATCH_INT_A, i32::MIN, false),
            }
            x64::emit_movd_xmm_from_r32(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        } else {
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
            let mask = match op {
                FloatUnaryBits::Abs => 0x7FFF_FFFF_FFFF_FFFFu64,
                FloatUnaryBits::Neg => 0x8000_0000_0000_0000u64,
            };
            x64::emit_mov_r64_imm64(&mut self.out, Reg::R10, mask);
            match op {
                FloatUnaryBits::Abs => x64::emit_alu_r_r(&mut self.out, AluOp::And, SCRATCH_INT_A, Reg::R10, true),
                FloatUnaryBits::Neg => x64::emit_alu_r_r(&mut self.out, AluOp::Xor, SCRATCH_INT_A, Reg::R10, true),
            }
            x64::emit_movq_xmm_from_r64(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A);
        }
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_sqrt(&mut self, ty: ValType) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_A)?;
        x64::emit_sqrt(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A, ty == ValType::F32);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn float_round(&mut self, ty: ValType, mode: u8) -> Result<(), CompileError> {
        self.pop_float(SCRATCH_FLOAT_A)?;
        x64::emit_round(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A, ty == ValType::F32, mode);
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    /// Load a compile-time f64 constant into an xmm register via the
    /// general-purpose scratch `c` slot (never live across this call).
    fn load_f64_const(&mut self, dst: Xmm, value: f64) {
        x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_C, value.to_bits());
        x64::emit_movq_xmm_from_r64(&mut self.out, dst, SCRATCH_INT_C);
    }

    fn float_to_int(&mut self, int_ty: ValType, signed: bool) -> Result<(), CompileError> {
        let src_ty = self.operand.peek().ok_or_else(|| stack_underflow(self))?.ty;
        self.pop_float(SCRATCH_FLOAT_A)?;
        if src_ty == ValType::F32 {
            // Promoting f32 up to f64 first is exact (no precision lost) and
            // lets every bound check and the truncation itself share one
            // code path regardless of source width.
            x64::emit_cvtss2sd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
        }
        let w = int_ty == ValType::I64;

        x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
        self.emit_trap_unless(Cond::Np, crate::error::TrapCode::InvalidConversionToInteger);

        let (lo, hi): (f64, f64) = match (w, signed) {
            (false, true) => (-2147483649.0, 2147483648.0),
            (false, false) => (-1.0, 4294967296.0),
            (true, true) => (-9223372036854775808.0, 9223372036854775808.0),
            (true, false) => (-1.0, 18446744073709551616.0),
        };
        // Every `lo` above is already one step below the true minimum except
        // the signed-i64 case, where `-2^63` is itself a valid result (the
        // minimum i64) and so needs an inclusive bound.
        let lo_cond = if w && signed { Cond::Ae } else { Cond::A };
        self.load_f64_const(SCRATCH_FLOAT_B, lo);
        x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        self.emit_trap_unless(lo_cond, crate::error::TrapCode::InvalidConversionToInteger);
        self.load_f64_const(SCRATCH_FLOAT_B, hi);
        x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
        self.emit_trap_unless(Cond::B, crate::error::TrapCode::InvalidConversionToInteger);

        if !signed && w {
            // cvttsd2si only covers the signed i64 range; values at or past
            // 2^63 are converted by subtracting it off, truncating, then
            // restoring the high bit in the integer result.
            self.load_f64_const(SCRATCH_FLOAT_B, 9223372036854775808.0);
            x64::emit_ucomisd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
            let below = x64::emit_jcc_rel32(&mut self.out, Cond::B);
            x64::emit_subsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_B);
            x64::emit_cvttsd2si(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A, true);
            x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_B, 0x8000_0000_0000_0000);
            x64::emit_alu_r_r(&mut self.out, AluOp::Xor, SCRATCH_INT_A, SCRATCH_INT_B, true);
            let done = x64::emit_jmp_rel32(&mut self.out);
            let below_path = self.out.len();
            x64::patch_rel32(&mut self.out, below, below_path);
            x64::emit_cvttsd2si(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A, true);
            let here = self.out.len();
            x64::patch_rel32(&mut self.out, done, here);
        } else {
            // Unsigned i32 also goes through the 64-bit form: its whole
            // valid range fits in the signed 64-bit output, so the extra
            // width costs nothing and the low 32 bits are what get stored.
            let conv_w = w || !signed;
            x64::emit_cvttsd2si(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A, conv_w);
        }
        self.push_result(int_ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn int_to_float(&mut self, float_ty: ValType, signed: bool) -> Result<(), CompileError> {
        let src_ty = self.pop_int(SCRATCH_INT_A)?;
        let w = src_ty == ValType::I64;
        if signed || !w {
            // Signed conversions of either width, plus unsigned i32: the
            // 32-bit load that produced this value already zero-extended it
            // into a 64-bit register, so treating it as a signed 64-bit
            // source yields the correct unsigned result too.
            let conv_w = w || !signed;
            if float_ty == ValType::F32 {
                x64::emit_cvtsi2ss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, conv_w);
            } else {
                x64::emit_cvtsi2sd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, conv_w);
            }
        } else {
            // i64 -> float, unsigned: split at 2^63, the one range
            // `cvtsi2s[sd]`'s signed source can't reach directly.
            x64::emit_test_r_r(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_A, true);
            let negative = x64::emit_jcc_rel32(&mut self.out, Cond::L);
            if float_ty == ValType::F32 {
                x64::emit_cvtsi2ss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, true);
            } else {
                x64::emit_cvtsi2sd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, true);
            }
            let done = x64::emit_jmp_rel32(&mut self.out);
            let negative_path = self.out.len();
            x64::patch_rel32(&mut self.out, negative, negative_path);
            x64::emit_mov_r_r(&mut self.out, SCRATCH_INT_B, SCRATCH_INT_A, true);
            x64::emit_shr_by1(&mut self.out, SCRATCH_INT_A, true);
            x64::emit_alu_r_imm32(&mut self.out, AluOp::And, SCRATCH_INT_B, 1, true);
            x64::emit_alu_r_r(&mut self.out, AluOp::Or, SCRATCH_INT_A, SCRATCH_INT_B, true);
            if float_ty == ValType::F32 {
                x64::emit_cvtsi2ss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, true);
                x64::emit_addss(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
            } else {
                x64::emit_cvtsi2sd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_A, true);
                x64::emit_addsd(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_FLOAT_A);
            }
            let here = self.out.len();
            x64::patch_rel32(&mut self.out, done, here);
        }
        self.push_result(float_ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }
}

enum CountOp {
    Clz,
    Ctz,
    Popcnt,
}

enum DivOp {
    DivSigned,
    DivUnsigned,
    RemSigned,
    RemUnsigned,
}

enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

enum FloatUnaryBits {
    Abs,
    Neg,
}

fn stack_underflow(cg: &Codegen) -> CompileError {
    err(cg, CompileErrorKind::StackUnderflow)
}

fn err_mismatch(cg: &Codegen, found: ValType, expected: ValType) -> CompileError {
    let expected: &'static str = match expected {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
    };
    let found: &'static str = match found {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
    };
    err(cg, CompileErrorKind::TypeMismatch { expected, found })
}

fn unknown_local(cg: &Codegen, idx: u32) -> CompileError {
    err(cg, CompileErrorKind::UnknownLocal(idx))
}
fn unknown_global(cg: &Codegen, idx: u32) -> CompileError {
    err(cg, CompileErrorKind::UnknownGlobal(idx))
}
fn unknown_func(cg: &Codegen, idx: u32) -> CompileError {
    err(cg, CompileErrorKind::UnknownFunc(idx))
}
fn unknown_type(cg: &Codegen, idx: u32) -> CompileError {
    err(cg, CompileErrorKind::UnknownType(idx))
}
fn unknown_label(cg: &Codegen, idx: u32) -> CompileError {
    err(cg, CompileErrorKind::UnknownLabel(idx))
}

fn memory_size_helper_addr() -> u64 {
    super::helpers::memory_size_helper as usize as u64
}
fn memory_grow_helper_addr() -> u64 {
    super::helpers::memory_grow_helper as usize as u64
}

impl<'m> Codegen<'m> {
    fn emit_load(&mut self, m: &MemArg, ty: ValType, access_size: u32, sign_extend: bool, w: bool) -> Result<(), CompileError> {
        self.emit_bounds_check(m, access_size)?;
        // SCRATCH_INT_C holds the checked effective address (base + offset + index).
        if ty.is_float() {
            x64::emit_movsd_load(&mut self.out, SCRATCH_FLOAT_A, SCRATCH_INT_C, 0);
        } else if access_size == 1 {
            if sign_extend {
                x64::emit_movsx8_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0, w);
            } else {
                x64::emit_movzx8_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0);
            }
        } else if access_size == 2 {
            if sign_extend {
                x64::emit_movsx16_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0, w);
            } else {
                x64::emit_movzx16_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0);
            }
        } else if access_size == 4 && w && sign_extend {
            x64::emit_movsxd_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0);
        } else if access_size == 4 && w {
            x64::emit_load_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0, false);
        } else {
            x64::emit_load_disp32(&mut self.out, SCRATCH_INT_A, SCRATCH_INT_C, 0, w);
        }
        self.push_result(ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        Ok(())
    }

    fn emit_store(&mut self, m: &MemArg, ty: ValType, access_size: u32) -> Result<(), CompileError> {
        let slot = self.operand.pop().ok_or_else(|| stack_underflow(self))?;
        if slot.ty != ty {
            return Err(err_mismatch(self, slot.ty, ty));
        }
        self.load_slot(slot.depth, ty, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        if ty == ValType::F32 {
            x64::emit_movd_r32_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        } else if ty == ValType::F64 {
            x64::emit_movq_r64_from_xmm(&mut self.out, SCRATCH_INT_A, SCRATCH_FLOAT_A);
        }
        x64::emit_push_r(&mut self.out, SCRATCH_INT_A);

        self.emit_bounds_check(m, access_size)?;
        x64::emit_pop_r(&mut self.out, SCRATCH_INT_A);
        match access_size {
            1 => x64::emit_store8_disp32(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_INT_A),
            2 => x64::emit_store16_disp32(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_INT_A),
            4 => x64::emit_store_disp32(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_INT_A, false),
            _ => x64::emit_store_disp32(&mut self.out, SCRATCH_INT_C, 0, SCRATCH_INT_A, true),
        }
        Ok(())
    }

    /// Evaluates `base + memarg.offset + dynamic_index`, bounds-checks it
    /// against the memory's current size, and leaves the checked address in
    /// `SCRATCH_INT_C`. The dynamic index must already have been pushed by
    /// the caller before the value being stored (for `store`) or be the
    /// sole remaining operand (for `load`).
    fn emit_bounds_check(&mut self, m: &MemArg, access_size: u32) -> Result<(), CompileError> {
        self.pop_int(SCRATCH_INT_A)?; // dynamic index, wasm i32, already zero-extended in its slot
        x64::emit_mov_r_imm32(&mut self.out, SCRATCH_INT_B, m.offset as i32, false);
        x64::emit_alu_r_r(&mut self.out, AluOp::Add, SCRATCH_INT_A, SCRATCH_INT_B, true);

        let size_off = x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_B, 0);
        self.relocs.push(Reloc { kind: RelocKind::MemorySize(0), code_offset: size_off });
        x64::emit_load_disp32(&mut self.out, SCRATCH_INT_B, SCRATCH_INT_B, 0, true);

        x64::emit_mov_r_imm32(&mut self.out, Reg::R10, access_size as i32, false);
        x64::emit_alu_r_r(&mut self.out, AluOp::Add, Reg::R10, SCRATCH_INT_A, true);
        x64::emit_alu_r_r(&mut self.out, AluOp::Cmp, Reg::R10, SCRATCH_INT_B, true);
        self.emit_trap_unless(Cond::Be, crate::error::TrapCode::OutOfBoundsMemoryAccess);

        let base_off = x64::emit_mov_r64_imm64(&mut self.out, SCRATCH_INT_C, 0);
        self.relocs.push(Reloc { kind: RelocKind::MemoryBase(0), code_offset: base_off });
        x64::emit_alu_r_r(&mut self.out, AluOp::Add, SCRATCH_INT_C, SCRATCH_INT_A, true);
        Ok(())
    }
}
