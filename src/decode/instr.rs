//! Instruction decoding: dispatch on opcode byte.
//!
//! Structured opcodes (block, loop, if) read a blocktype byte (`0x40`
//! meaning empty, else a `ValType`), then recursively decode a nested
//! instruction sequence terminated by `0x0B`. `if` additionally handles an
//! optional `else` arm terminated by `0x05` before the closing `0x0B`.
//! `br_table` reads a vector of label indices plus a default index. Memory
//! ops read `(align, offset)` as uleb32s. Constants read their typed
//! payload (i32/i64 via sleb, f32/f64 via fixed bytes).

use crate::ast::{BlockType, Instruction, MemArg};
use crate::binary::Reader;
use crate::error::{DecodeError, DecodeErrorKind};

fn read_blockty(r: &mut Reader, offset: usize) -> Result<BlockType, DecodeError> {
    let b = r.peek_u8()?;
    if b == 0x40 {
        r.read_u8()?;
        return Ok(BlockType::Empty);
    }
    if let Some(vt) = crate::value::ValType::from_byte(b) {
        r.read_u8()?;
        return Ok(BlockType::Value(vt));
    }
    Err(DecodeError::new(DecodeErrorKind::InvalidBlockType(b), offset))
}

fn read_memarg(r: &mut Reader) -> Result<MemArg, DecodeError> {
    let align = r.read_uleb32()?;
    let offset = r.read_uleb32()?;
    Ok(MemArg { align, offset })
}

/// Decode instructions until a terminating `end` (0x0B) or `else` (0x05) is
/// consumed. `base` is added to the reader's local position when reporting
/// offsets, since the reader here is scoped to the function body.
pub fn decode_instructions(r: &mut Reader, base: usize) -> Result<Vec<Instruction>, DecodeError> {
    let (body, _term) = decode_seq(r, base)?;
    Ok(body)
}

/// Returns the decoded sequence plus the terminating byte (0x0B or 0x05) that
/// ended it, so callers (namely `if`) can tell which one it was.
fn decode_seq(r: &mut Reader, base: usize) -> Result<(Vec<Instruction>, u8), DecodeError> {
    let mut out = Vec::new();
    loop {
        let offset = base + r.pos();
        let op = r.read_u8()?;
        match op {
            0x0B | 0x05 => return Ok((out, op)),
            _ => out.push(decode_one(r, base, op, offset)?),
        }
    }
}

fn decode_one(r: &mut Reader, base: usize, op: u8, offset: usize) -> Result<Instruction, DecodeError> {
    use Instruction as I;
    Ok(match op {
        0x00 => I::Unreachable,
        0x01 => I::Nop,
        0x02 => {
            let blockty = read_blockty(r, offset)?;
            let (body, term) = decode_seq(r, base)?;
            if term != 0x0B {
                return Err(DecodeError::new(DecodeErrorKind::MissingElseOrEnd, offset));
            }
            I::Block { blockty, body }
        }
        0x03 => {
            let blockty = read_blockty(r, offset)?;
            let (body, term) = decode_seq(r, base)?;
            if term != 0x0B {
                return Err(DecodeError::new(DecodeErrorKind::MissingElseOrEnd, offset));
            }
            I::Loop { blockty, body }
        }
        0x04 => {
            let blockty = read_blockty(r, offset)?;
            let (then_body, term) = decode_seq(r, base)?;
            let else_body = if term == 0x05 {
                let (body, term2) = decode_seq(r, base)?;
                if term2 != 0x0B {
                    return Err(DecodeError::new(DecodeErrorKind::MissingElseOrEnd, offset));
                }
                body
            } else {
                Vec::new()
            };
            I::If { blockty, then_body, else_body }
        }
        0x0C => I::Br(r.read_uleb32()?),
        0x0D => I::BrIf(r.read_uleb32()?),
        0x0E => {
            let n = r.read_uleb32()?;
            let mut labels = Vec::new();
            for _ in 0..n {
                labels.push(r.read_uleb32()?);
            }
            let default = r.read_uleb32()?;
            I::BrTable { labels, default }
        }
        0x0F => I::Return,
        0x10 => I::Call(r.read_uleb32()?),
        0x11 => {
            let typeidx = r.read_uleb32()?;
            let tableidx = r.read_uleb32()?;
            if tableidx != 0 {
                return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("multi-table"), offset));
            }
            I::CallIndirect(typeidx)
        }
        0x1A => I::Drop,
        0x1B => I::Select,

        0x20 => I::LocalGet(r.read_uleb32()?),
        0x21 => I::LocalSet(r.read_uleb32()?),
        0x22 => I::LocalTee(r.read_uleb32()?),
        0x23 => I::GlobalGet(r.read_uleb32()?),
        0x24 => I::GlobalSet(r.read_uleb32()?),

        0x28 => I::I32Load(read_memarg(r)?),
        0x29 => I::I64Load(read_memarg(r)?),
        0x2A => I::F32Load(read_memarg(r)?),
        0x2B => I::F64Load(read_memarg(r)?),
        0x2C => I::I32Load8S(read_memarg(r)?),
        0x2D => I::I32Load8U(read_memarg(r)?),
        0x2E => I::I32Load16S(read_memarg(r)?),
        0x2F => I::I32Load16U(read_memarg(r)?),
        0x30 => I::I64Load8S(read_memarg(r)?),
        0x31 => I::I64Load8U(read_memarg(r)?),
        0x32 => I::I64Load16S(read_memarg(r)?),
        0x33 => I::I64Load16U(read_memarg(r)?),
        0x34 => I::I64Load32S(read_memarg(r)?),
        0x35 => I::I64Load32U(read_memarg(r)?),
        0x36 => I::I32Store(read_memarg(r)?),
        0x37 => I::I64Store(read_memarg(r)?),
        0x38 => I::F32Store(read_memarg(r)?),
        0x39 => I::F64Store(read_memarg(r)?),
        0x3A => I::I32Store8(read_memarg(r)?),
        0x3B => I::I32Store16(read_memarg(r)?),
        0x3C => I::I64Store8(read_memarg(r)?),
        0x3D => I::I64Store16(read_memarg(r)?),
        0x3E => I::I64Store32(read_memarg(r)?),
        0x3F => {
            let reserved = r.read_u8()?;
            if reserved != 0 {
                return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("memory.size reserved"), offset));
            }
            I::MemorySize
        }
        0x40 => {
            let reserved = r.read_u8()?;
            if reserved != 0 {
                return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("memory.grow reserved"), offset));
            }
            I::MemoryGrow
        }

        0x41 => I::I32Const(r.read_sleb32()?),
        0x42 => I::I64Const(r.read_sleb64()?),
        0x43 => I::F32Const(r.read_f32_le()?),
        0x44 => I::F64Const(r.read_f64_le()?),

        0x45 => I::I32Eqz,
        0x46 => I::I32Eq,
        0x47 => I::I32Ne,
        0x48 => I::I32LtS,
        0x49 => I::I32LtU,
        0x4A => I::I32GtS,
        0x4B => I::I32GtU,
        0x4C => I::I32LeS,
        0x4D => I::I32LeU,
        0x4E => I::I32GeS,
        0x4F => I::I32GeU,

        0x50 => I::I64Eqz,
        0x51 => I::I64Eq,
        0x52 => I::I64Ne,
        0x53 => I::I64LtS,
        0x54 => I::I64LtU,
        0x55 => I::I64GtS,
        0x56 => I::I64GtU,
        0x57 => I::I64LeS,
        0x58 => I::I64LeU,
        0x59 => I::I64GeS,
        0x5A => I::I64GeU,

        0x5B => I::F32Eq,
        0x5C => I::F32Ne,
        0x5D => I::F32Lt,
        0x5E => I::F32Gt,
        0x5F => I::F32Le,
        0x60 => I::F32Ge,
        0x61 => I::F64Eq,
        0x62 => I::F64Ne,
        0x63 => I::F64Lt,
        0x64 => I::F64Gt,
        0x65 => I::F64Le,
        0x66 => I::F64Ge,

        0x67 => I::I32Clz,
        0x68 => I::I32Ctz,
        0x69 => I::I32Popcnt,
        0x6A => I::I32Add,
        0x6B => I::I32Sub,
        0x6C => I::I32Mul,
        0x6D => I::I32DivS,
        0x6E => I::I32DivU,
        0x6F => I::I32RemS,
        0x70 => I::I32RemU,
        0x71 => I::I32And,
        0x72 => I::I32Or,
        0x73 => I::I32Xor,
        0x74 => I::I32Shl,
        0x75 => I::I32ShrS,
        0x76 => I::I32ShrU,
        0x77 => I::I32Rotl,
        0x78 => I::I32Rotr,

        0x79 => I::I64Clz,
        0x7A => I::I64Ctz,
        0x7B => I::I64Popcnt,
        0x7C => I::I64Add,
        0x7D => I::I64Sub,
        0x7E => I::I64Mul,
        0x7F => I::I64DivS,
        0x80 => I::I64DivU,
        0x81 => I::I64RemS,
        0x82 => I::I64RemU,
        0x83 => I::I64And,
        0x84 => I::I64Or,
        0x85 => I::I64Xor,
        0x86 => I::I64Shl,
        0x87 => I::I64ShrS,
        0x88 => I::I64ShrU,
        0x89 => I::I64Rotl,
        0x8A => I::I64Rotr,

        0x8B => I::F32Abs,
        0x8C => I::F32Neg,
        0x8D => I::F32Ceil,
        0x8E => I::F32Floor,
        0x8F => I::F32Trunc,
        0x90 => I::F32Nearest,
        0x91 => I::F32Sqrt,
        0x92 => I::F32Add,
        0x93 => I::F32Sub,
        0x94 => I::F32Mul,
        0x95 => I::F32Div,
        0x96 => I::F32Min,
        0x97 => I::F32Max,
        0x98 => I::F32Copysign,

        0x99 => I::F64Abs,
        0x9A => I::F64Neg,
        0x9B => I::F64Ceil,
        0x9C => I::F64Floor,
        0x9D => I::F64Trunc,
        0x9E => I::F64Nearest,
        0x9F => I::F64Sqrt,
        0xA0 => I::F64Add,
        0xA1 => I::F64Sub,
        0xA2 => I::F64Mul,
        0xA3 => I::F64Div,
        0xA4 => I::F64Min,
        0xA5 => I::F64Max,
        0xA6 => I::F64Copysign,

        0xA7 => I::I32WrapI64,
        0xA8 => I::I32TruncF32S,
        0xA9 => I::I32TruncF32U,
        0xAA => I::I32TruncF64S,
        0xAB => I::I32TruncF64U,
        0xAC => I::I64ExtendI32S,
        0xAD => I::I64ExtendI32U,
        0xAE => I::I64TruncF32S,
        0xAF => I::I64TruncF32U,
        0xB0 => I::I64TruncF64S,
        0xB1 => I::I64TruncF64U,
        0xB2 => I::F32ConvertI32S,
        0xB3 => I::F32ConvertI32U,
        0xB4 => I::F32ConvertI64S,
        0xB5 => I::F32ConvertI64U,
        0xB6 => I::F32DemoteF64,
        0xB7 => I::F64ConvertI32S,
        0xB8 => I::F64ConvertI32U,
        0xB9 => I::F64ConvertI64S,
        0xBA => I::F64ConvertI64U,
        0xBB => I::F64PromoteF32,
        0xBC => I::I32ReinterpretF32,
        0xBD => I::I64ReinterpretF64,
        0xBE => I::F32ReinterpretI32,
        0xBF => I::F64ReinterpretI64,

        other => return Err(DecodeError::new(DecodeErrorKind::UnknownOpcode(other), offset)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_sequence() {
        let bytes = [0x41, 0x2A, 0x0B]; // i32.const 42, end
        let mut r = Reader::new(&bytes);
        let body = decode_instructions(&mut r, 0).unwrap();
        assert_eq!(body, vec![Instruction::I32Const(42)]);
    }

    #[test]
    fn decodes_nested_block() {
        // block (empty) { nop } end, end
        let bytes = [0x02, 0x40, 0x01, 0x0B, 0x0B];
        let mut r = Reader::new(&bytes);
        let body = decode_instructions(&mut r, 0).unwrap();
        assert_eq!(
            body,
            vec![Instruction::Block { blockty: BlockType::Empty, body: vec![Instruction::Nop] }]
        );
    }

    #[test]
    fn decodes_if_else() {
        // if (empty) { nop } else { unreachable } end, end
        let bytes = [0x04, 0x40, 0x01, 0x05, 0x00, 0x0B, 0x0B];
        let mut r = Reader::new(&bytes);
        let body = decode_instructions(&mut r, 0).unwrap();
        assert_eq!(
            body,
            vec![Instruction::If {
                blockty: BlockType::Empty,
                then_body: vec![Instruction::Nop],
                else_body: vec![Instruction::Unreachable],
            }]
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        let bytes = [0xFF, 0x0B];
        let mut r = Reader::new(&bytes);
        let err = decode_instructions(&mut r, 0).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnknownOpcode(0xFF));
    }
}
