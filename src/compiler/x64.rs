//! Minimal x86-64 instruction encoder.
//!
//! Not a general-purpose assembler: just the handful of forms the code
//! generator in `codegen.rs` needs, each written out by hand the way a
//! template-style single-pass JIT does it (c.f. the original wasmjit's
//! `compile.c`, which inlines raw opcode bytes at each call site rather than
//! going through an assembler library). Every `emit_*` function appends
//! bytes to the caller's `Vec<u8>` and returns nothing except where the
//! caller needs the offset of an immediate to patch later (relocations,
//! branch displacements).

/// General-purpose register, encoded 0-15 per the x86-64 REX extension.
/// RSP and RBP are reserved for the frame; RBX/R12-R15 are callee-saved and
/// deliberately unused so the generated prologue never needs to save them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    fn needs_ext(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// SSE register, xmm0-xmm7 (enough for the 8 float argument registers).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Xmm(pub u8);

/// Integer argument registers in System-V AMD64 order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
/// Float argument registers in System-V AMD64 order.
pub const FLOAT_ARG_REGS: [Xmm; 8] = [
    Xmm(0), Xmm(1), Xmm(2), Xmm(3), Xmm(4), Xmm(5), Xmm(6), Xmm(7),
];

/// Condition codes used by `Jcc`/`Setcc`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
    B = 0x2,
    Ae = 0x3,
    Be = 0x6,
    A = 0x7,
    /// Parity set — the usual way to test "unordered" after a `ucomis[sd]`
    /// comparing an operand against itself (true exactly on NaN).
    P = 0xA,
    Np = 0xB,
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Emit a REX prefix if needed (W, or either operand is r8-r15).
fn emit_rex_if_needed(out: &mut Vec<u8>, w: bool, reg: Reg, rm: Reg) {
    let r = reg.needs_ext();
    let b = rm.needs_ext();
    if w || r || b {
        out.push(rex(w, r, false, b));
    }
}

/// `mov r64, imm64` (absolute load, used for every relocatable constant:
/// call targets, memory base/size pointers, global addresses, helpers).
/// Returns the byte offset of the 8-byte immediate for later patching.
pub fn emit_mov_r64_imm64(out: &mut Vec<u8>, dst: Reg, imm: u64) -> usize {
    out.push(rex(true, false, false, dst.needs_ext()));
    out.push(0xB8 + dst.low3());
    let off = out.len();
    out.extend_from_slice(&imm.to_le_bytes());
    off
}

pub fn patch_u64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// `mov r32/r64, imm32` (zero/sign extended per `w`).
pub fn emit_mov_r_imm32(out: &mut Vec<u8>, dst: Reg, imm: i32, w: bool) {
    if w {
        out.push(rex(true, false, false, dst.needs_ext()));
        out.push(0xC7);
        out.push(modrm(3, 0, dst.low3()));
    } else {
        if dst.needs_ext() {
            out.push(rex(false, false, false, true));
        }
        out.push(0xB8 + dst.low3());
        out.extend_from_slice(&(imm as u32).to_le_bytes());
        return;
    }
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dst, src` (register to register), 32- or 64-bit.
pub fn emit_mov_r_r(out: &mut Vec<u8>, dst: Reg, src: Reg, w: bool) {
    emit_rex_if_needed(out, w, src, dst);
    out.push(0x89);
    out.push(modrm(3, src.low3(), dst.low3()));
}

/// `mov dst, [base+disp32]` (load).
pub fn emit_load_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32, w: bool) {
    emit_rex_if_needed(out, w, dst, base);
    out.push(0x8B);
    emit_modrm_disp32(out, dst, base, disp);
}

/// `mov [base+disp32], src` (store).
pub fn emit_store_disp32(out: &mut Vec<u8>, base: Reg, disp: i32, src: Reg, w: bool) {
    emit_rex_if_needed(out, w, src, base);
    out.push(0x89);
    emit_modrm_disp32(out, src, base, disp);
}

/// `mov [base+disp32], src8` (8-bit store). A REX prefix is required even
/// with no extended registers whenever `src` is RSP/RBP/RSI/RDI — without
/// one those encode SPL/BPL/SIL/DIL, but the legacy encoding would instead
/// address AH/CH/DH/BH.
pub fn emit_store8_disp32(out: &mut Vec<u8>, base: Reg, disp: i32, src: Reg) {
    let r_ext = src.needs_ext();
    let b_ext = base.needs_ext();
    let needs_plain_rex = matches!(src, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi);
    if r_ext || b_ext || needs_plain_rex {
        out.push(rex(false, r_ext, false, b_ext));
    }
    out.push(0x88);
    emit_modrm_disp32(out, src, base, disp);
}

/// `mov [base+disp32], src16` (16-bit store, 0x66 operand-size override).
pub fn emit_store16_disp32(out: &mut Vec<u8>, base: Reg, disp: i32, src: Reg) {
    out.push(0x66);
    emit_rex_if_needed(out, false, src, base);
    out.push(0x89);
    emit_modrm_disp32(out, src, base, disp);
}

fn emit_modrm_disp32(out: &mut Vec<u8>, reg: Reg, base: Reg, disp: i32) {
    out.push(modrm(2, reg.low3(), base.low3()));
    if base.low3() == 4 {
        // RSP/R12 as a base requires an explicit SIB byte (no index, scale 1).
        out.push(0x24);
    }
    out.extend_from_slice(&disp.to_le_bytes());
}

/// Zero-extend an 8-bit load: `movzx dst32, [base+disp32]`.
pub fn emit_movzx8_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
    emit_rex_if_needed(out, false, dst, base);
    out.push(0x0F);
    out.push(0xB6);
    emit_modrm_disp32(out, dst, base, disp);
}

pub fn emit_movsx8_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32, w: bool) {
    emit_rex_if_needed(out, w, dst, base);
    out.push(0x0F);
    out.push(0xBE);
    emit_modrm_disp32(out, dst, base, disp);
}

pub fn emit_movzx16_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
    emit_rex_if_needed(out, false, dst, base);
    out.push(0x0F);
    out.push(0xB7);
    emit_modrm_disp32(out, dst, base, disp);
}

pub fn emit_movsx16_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32, w: bool) {
    emit_rex_if_needed(out, w, dst, base);
    out.push(0x0F);
    out.push(0xBF);
    emit_modrm_disp32(out, dst, base, disp);
}

/// `movsxd dst64, [base+disp32]` (sign-extend a 32-bit load to 64 bits).
pub fn emit_movsxd_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
    emit_rex_if_needed(out, true, dst, base);
    out.push(0x63);
    emit_modrm_disp32(out, dst, base, disp);
}

/// `movsxd dst64, src32` (sign-extend a 32-bit register into a 64-bit one).
pub fn emit_movsxd_rr(out: &mut Vec<u8>, dst: Reg, src: Reg) {
    out.push(rex(true, dst.needs_ext(), false, src.needs_ext()));
    out.push(0x63);
    out.push(modrm(3, dst.low3(), src.low3()));
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

impl AluOp {
    fn opcode_rr(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Sub => 0x29,
            AluOp::And => 0x21,
            AluOp::Or => 0x09,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        }
    }

    fn modrm_ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Sub => 5,
            AluOp::And => 4,
            AluOp::Or => 1,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// `<op> dst, src` register-register, 32- or 64-bit.
pub fn emit_alu_r_r(out: &mut Vec<u8>, op: AluOp, dst: Reg, src: Reg, w: bool) {
    emit_rex_if_needed(out, w, src, dst);
    out.push(op.opcode_rr());
    out.push(modrm(3, src.low3(), dst.low3()));
}

/// `<op> dst, imm32`.
pub fn emit_alu_r_imm32(out: &mut Vec<u8>, op: AluOp, dst: Reg, imm: i32, w: bool) {
    emit_rex_if_needed(out, w, Reg::Rax, dst);
    out.push(0x81);
    out.push(modrm(3, op.modrm_ext(), dst.low3()));
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `imul dst, src`.
pub fn emit_imul_r_r(out: &mut Vec<u8>, dst: Reg, src: Reg, w: bool) {
    emit_rex_if_needed(out, w, dst, src);
    out.push(0x0F);
    out.push(0xAF);
    out.push(modrm(3, dst.low3(), src.low3()));
}

/// `cqo`/`cdq`: sign-extend RAX/EAX into RDX:RAX / EDX:EAX ahead of `idiv`.
pub fn emit_cdq_cqo(out: &mut Vec<u8>, w: bool) {
    if w {
        out.push(rex(true, false, false, false));
    }
    out.push(0x99);
}

/// `idiv`/`div` divisor (RDX:RAX / divisor -> RAX quotient, RDX remainder).
pub fn emit_idiv_r(out: &mut Vec<u8>, divisor: Reg, w: bool, signed: bool) {
    emit_rex_if_needed(out, w, Reg::Rax, divisor);
    out.push(0xF7);
    out.push(modrm(3, if signed { 7 } else { 6 }, divisor.low3()));
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

/// `<op> dst, cl` (shift/rotate amount implicitly taken from CL).
pub fn emit_shift_cl(out: &mut Vec<u8>, op: ShiftOp, dst: Reg, w: bool) {
    emit_rex_if_needed(out, w, Reg::Rax, dst);
    out.push(0xD3);
    let ext = match op {
        ShiftOp::Rol => 0,
        ShiftOp::Ror => 1,
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    };
    out.push(modrm(3, ext, dst.low3()));
}

/// `shr dst, 1` (single-bit shift-by-one form, distinct opcode from the
/// by-CL form above; used by the unsigned int-to-float split).
pub fn emit_shr_by1(out: &mut Vec<u8>, dst: Reg, w: bool) {
    emit_rex_if_needed(out, w, Reg::Rax, dst);
    out.push(0xD1);
    out.push(modrm(3, 5, dst.low3()));
}

fn emit_f3_0f_rr(out: &mut Vec<u8>, opcode: u8, dst: Reg, src: Reg, w: bool) {
    out.push(0xF3);
    emit_rex_if_needed(out, w, dst, src);
    out.push(0x0F);
    out.push(opcode);
    out.push(modrm(3, dst.low3(), src.low3()));
}

/// `lzcnt dst, src` (BMI1; counts leading zero bits, width on a zero input).
pub fn emit_lzcnt(out: &mut Vec<u8>, dst: Reg, src: Reg, w: bool) {
    emit_f3_0f_rr(out, 0xBD, dst, src, w);
}

/// `tzcnt dst, src` (BMI1; counts trailing zero bits, width on a zero input).
pub fn emit_tzcnt(out: &mut Vec<u8>, dst: Reg, src: Reg, w: bool) {
    emit_f3_0f_rr(out, 0xBC, dst, src, w);
}

/// `popcnt dst, src`.
pub fn emit_popcnt(out: &mut Vec<u8>, dst: Reg, src: Reg, w: bool) {
    emit_f3_0f_rr(out, 0xB8, dst, src, w);
}

pub fn patch_i32(out: &mut [u8], offset: usize, value: i32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn emit_test_r_r(out: &mut Vec<u8>, a: Reg, b: Reg, w: bool) {
    emit_rex_if_needed(out, w, b, a);
    out.push(0x85);
    out.push(modrm(3, b.low3(), a.low3()));
}

/// `setcc dst8` then `movzx dst32, dst8` so the result is a clean i32 0/1.
pub fn emit_setcc_zx(out: &mut Vec<u8>, cond: Cond, dst: Reg) {
    if dst.needs_ext() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x0F);
    out.push(0x90 + cond as u8);
    out.push(modrm(3, 0, dst.low3()));
    emit_rex_if_needed(out, false, dst, dst);
    out.push(0x0F);
    out.push(0xB6);
    out.push(modrm(3, dst.low3(), dst.low3()));
}

/// `jmp rel32`. Returns the offset of the 4-byte displacement to patch.
pub fn emit_jmp_rel32(out: &mut Vec<u8>) -> usize {
    out.push(0xE9);
    let off = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    off
}

/// `jcc rel32`. Returns the offset of the 4-byte displacement to patch.
pub fn emit_jcc_rel32(out: &mut Vec<u8>, cond: Cond) -> usize {
    out.push(0x0F);
    out.push(0x80 + cond as u8);
    let off = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    off
}

/// Patch a previously emitted rel32 branch: `target - (disp_offset + 4)`.
pub fn patch_rel32(out: &mut [u8], disp_offset: usize, target: usize) {
    let rel = target as i64 - (disp_offset as i64 + 4);
    out[disp_offset..disp_offset + 4].copy_from_slice(&(rel as i32).to_le_bytes());
}

pub fn emit_call_r(out: &mut Vec<u8>, target: Reg) {
    if target.needs_ext() {
        out.push(rex(false, false, false, true));
    }
    out.push(0xFF);
    out.push(modrm(3, 2, target.low3()));
}

pub fn emit_push_r(out: &mut Vec<u8>, r: Reg) {
    if r.needs_ext() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x50 + r.low3());
}

pub fn emit_pop_r(out: &mut Vec<u8>, r: Reg) {
    if r.needs_ext() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x58 + r.low3());
}

pub fn emit_ret(out: &mut Vec<u8>) {
    out.push(0xC3);
}

pub fn emit_nop(out: &mut Vec<u8>) {
    out.push(0x90);
}

/// `lea dst, [base+disp32]`.
pub fn emit_lea_disp32(out: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
    emit_rex_if_needed(out, true, dst, base);
    out.push(0x8D);
    emit_modrm_disp32(out, dst, base, disp);
}

// ── SSE2 scalar float ops ──────────────────────────────────────────────

fn xmm_modrm_rr(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    let r_ext = dst.0 >= 8;
    let b_ext = src.0 >= 8;
    if r_ext || b_ext {
        out.push(rex(false, r_ext, false, b_ext));
    }
}

pub fn emit_movsd_xx(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    out.push(0xF2);
    xmm_modrm_rr(out, dst, src);
    out.push(0x0F);
    out.push(0x10);
    out.push(modrm(3, dst.0 & 7, src.0 & 7));
}

pub fn emit_movss_xx(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    out.push(0xF3);
    xmm_modrm_rr(out, dst, src);
    out.push(0x0F);
    out.push(0x10);
    out.push(modrm(3, dst.0 & 7, src.0 & 7));
}

fn emit_sse_binop(out: &mut Vec<u8>, prefix: u8, opcode: u8, dst: Xmm, src: Xmm) {
    out.push(prefix);
    xmm_modrm_rr(out, dst, src);
    out.push(0x0F);
    out.push(opcode);
    out.push(modrm(3, dst.0 & 7, src.0 & 7));
}

pub fn emit_addsd(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF2, 0x58, dst, src);
}
pub fn emit_subsd(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF2, 0x5C, dst, src);
}
pub fn emit_mulsd(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF2, 0x59, dst, src);
}
pub fn emit_divsd(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF2, 0x5E, dst, src);
}
pub fn emit_addss(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF3, 0x58, dst, src);
}
pub fn emit_subss(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF3, 0x5C, dst, src);
}
pub fn emit_mulss(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF3, 0x59, dst, src);
}
pub fn emit_divss(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF3, 0x5E, dst, src);
}

pub fn emit_ucomisd(out: &mut Vec<u8>, a: Xmm, b: Xmm) {
    out.push(0x66);
    xmm_modrm_rr(out, a, b);
    out.push(0x0F);
    out.push(0x2E);
    out.push(modrm(3, a.0 & 7, b.0 & 7));
}

pub fn emit_ucomiss(out: &mut Vec<u8>, a: Xmm, b: Xmm) {
    xmm_modrm_rr(out, a, b);
    out.push(0x0F);
    out.push(0x2E);
    out.push(modrm(3, a.0 & 7, b.0 & 7));
}

/// `cvtsi2sd`/`cvtsi2ss`: GPR -> scalar float, `w` selects 32/64-bit source.
pub fn emit_cvtsi2sd(out: &mut Vec<u8>, dst: Xmm, src: Reg, w: bool) {
    out.push(0xF2);
    let r_ext = dst.0 >= 8;
    if w || r_ext || src.needs_ext() {
        out.push(rex(w, r_ext, false, src.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x2A);
    out.push(modrm(3, dst.0 & 7, src.low3()));
}

pub fn emit_cvtsi2ss(out: &mut Vec<u8>, dst: Xmm, src: Reg, w: bool) {
    out.push(0xF3);
    let r_ext = dst.0 >= 8;
    if w || r_ext || src.needs_ext() {
        out.push(rex(w, r_ext, false, src.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x2A);
    out.push(modrm(3, dst.0 & 7, src.low3()));
}

/// `cvttsd2si`/`cvttss2si`: scalar float -> GPR, truncating toward zero.
pub fn emit_cvttsd2si(out: &mut Vec<u8>, dst: Reg, src: Xmm, w: bool) {
    out.push(0xF2);
    let b_ext = src.0 >= 8;
    if w || dst.needs_ext() || b_ext {
        out.push(rex(w, dst.needs_ext(), false, b_ext));
    }
    out.push(0x0F);
    out.push(0x2C);
    out.push(modrm(3, dst.low3(), src.0 & 7));
}

pub fn emit_cvttss2si(out: &mut Vec<u8>, dst: Reg, src: Xmm, w: bool) {
    out.push(0xF3);
    let b_ext = src.0 >= 8;
    if w || dst.needs_ext() || b_ext {
        out.push(rex(w, dst.needs_ext(), false, b_ext));
    }
    out.push(0x0F);
    out.push(0x2C);
    out.push(modrm(3, dst.low3(), src.0 & 7));
}

pub fn emit_cvtss2sd(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF3, 0x5A, dst, src);
}

pub fn emit_cvtsd2ss(out: &mut Vec<u8>, dst: Xmm, src: Xmm) {
    emit_sse_binop(out, 0xF2, 0x5A, dst, src);
}

/// `sqrtsd`/`sqrtss` dst, src.
pub fn emit_sqrt(out: &mut Vec<u8>, dst: Xmm, src: Xmm, f32: bool) {
    if f32 {
        emit_sse_binop(out, 0xF3, 0x51, dst, src);
    } else {
        emit_sse_binop(out, 0xF2, 0x51, dst, src);
    }
}

/// `roundsd`/`roundss` dst, src, imm8 (SSE4.1). `mode`: 0 = nearest,
/// 1 = floor, 2 = ceil, 3 = truncate; bit 3 of the immediate is set to
/// suppress the precision exception, matching what compilers emit here.
pub fn emit_round(out: &mut Vec<u8>, dst: Xmm, src: Xmm, f32: bool, mode: u8) {
    out.push(0x66);
    xmm_modrm_rr(out, dst, src);
    out.push(0x0F);
    out.push(0x3A);
    out.push(if f32 { 0x0A } else { 0x0B });
    out.push(modrm(3, dst.0 & 7, src.0 & 7));
    out.push(mode | 0x08);
}

/// `movq xmm, r64` / `movq r64, xmm` (bit reinterpretation, 64-bit).
pub fn emit_movq_xmm_from_r64(out: &mut Vec<u8>, dst: Xmm, src: Reg) {
    out.push(0x66);
    out.push(rex(true, dst.0 >= 8, false, src.needs_ext()));
    out.push(0x0F);
    out.push(0x6E);
    out.push(modrm(3, dst.0 & 7, src.low3()));
}

pub fn emit_movq_r64_from_xmm(out: &mut Vec<u8>, dst: Reg, src: Xmm) {
    out.push(0x66);
    out.push(rex(true, src.0 >= 8, false, dst.needs_ext()));
    out.push(0x0F);
    out.push(0x7E);
    out.push(modrm(3, src.0 & 7, dst.low3()));
}

/// `movd xmm, r32` / `movd r32, xmm` (bit reinterpretation, 32-bit).
pub fn emit_movd_xmm_from_r32(out: &mut Vec<u8>, dst: Xmm, src: Reg) {
    out.push(0x66);
    if dst.0 >= 8 || src.needs_ext() {
        out.push(rex(false, dst.0 >= 8, false, src.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x6E);
    out.push(modrm(3, dst.0 & 7, src.low3()));
}

pub fn emit_movd_r32_from_xmm(out: &mut Vec<u8>, dst: Reg, src: Xmm) {
    out.push(0x66);
    if src.0 >= 8 || dst.needs_ext() {
        out.push(rex(false, src.0 >= 8, false, dst.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x7E);
    out.push(modrm(3, src.0 & 7, dst.low3()));
}

/// Load/store a scalar xmm through `[base+disp32]`.
pub fn emit_movsd_load(out: &mut Vec<u8>, dst: Xmm, base: Reg, disp: i32) {
    out.push(0xF2);
    if dst.0 >= 8 || base.needs_ext() {
        out.push(rex(false, dst.0 >= 8, false, base.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x10);
    emit_modrm_disp32_xmm(out, dst.0 & 7, base, disp);
}

pub fn emit_movsd_store(out: &mut Vec<u8>, base: Reg, disp: i32, src: Xmm) {
    out.push(0xF2);
    if src.0 >= 8 || base.needs_ext() {
        out.push(rex(false, src.0 >= 8, false, base.needs_ext()));
    }
    out.push(0x0F);
    out.push(0x11);
    emit_modrm_disp32_xmm(out, src.0 & 7, base, disp);
}

fn emit_modrm_disp32_xmm(out: &mut Vec<u8>, reg3: u8, base: Reg, disp: i32) {
    out.push(modrm(2, reg3, base.low3()));
    if base.low3() == 4 {
        out.push(0x24);
    }
    out.extend_from_slice(&disp.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movabs_rax_encodes_b8_form() {
        let mut out = Vec::new();
        let off = emit_mov_r64_imm64(&mut out, Reg::Rax, 0x1122_3344_5566_7788);
        assert_eq!(&out[0..2], &[0x48, 0xB8]);
        assert_eq!(off, 2);
        patch_u64(&mut out, off, 0xAABBCCDDu64);
        assert_eq!(&out[2..10], &0xAABBCCDDu64.to_le_bytes());
    }

    #[test]
    fn add_r64_r64_has_rex_w() {
        let mut out = Vec::new();
        emit_alu_r_r(&mut out, AluOp::Add, Reg::Rax, Reg::Rcx, true);
        assert_eq!(out, vec![0x48, 0x01, 0xC8]);
    }

    #[test]
    fn jmp_rel32_patches_forward_target() {
        let mut out = vec![0u8; 5];
        let disp_off = emit_jmp_rel32(&mut out);
        out.extend_from_slice(&[0; 10]);
        let target = out.len();
        patch_rel32(&mut out, disp_off, target);
        let rel = i32::from_le_bytes(out[disp_off..disp_off + 4].try_into().unwrap());
        assert_eq!(rel, (target as i64 - (disp_off as i64 + 4)) as i32);
    }

    #[test]
    fn push_pop_high_registers_use_rex_b() {
        let mut out = Vec::new();
        emit_push_r(&mut out, Reg::R12);
        assert_eq!(out, vec![0x41, 0x54]);
    }

    #[test]
    fn store8_disp32_uses_0x88_not_the_dword_opcode() {
        let mut out = Vec::new();
        emit_store8_disp32(&mut out, Reg::Rdx, 0, Reg::Rax);
        assert_eq!(out, vec![0x88, 0x82, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn store8_disp32_forces_rex_for_sil_dil_bpl_spl() {
        let mut out = Vec::new();
        emit_store8_disp32(&mut out, Reg::Rdx, 0, Reg::Rsi);
        assert_eq!(&out[0..1], &[0x40]);
    }

    #[test]
    fn store16_disp32_has_operand_size_prefix_and_0x89() {
        let mut out = Vec::new();
        emit_store16_disp32(&mut out, Reg::Rdx, 4, Reg::Rax);
        assert_eq!(out, vec![0x66, 0x89, 0x82, 0x04, 0x00, 0x00, 0x00]);
    }
}
