//! AST decoder: `decode_module(bytes) -> Module | DecodeError`.
//!
//! Checks magic `\0asm` and version 1, then loops reading
//! `(section_id: u8, size: uleb32)` pairs. Each section id dispatches to a
//! dedicated decoder. Section ids must appear in ascending order except
//! `custom` (id 0), which may appear anywhere and is skipped wholesale.

mod instr;

use log::debug;

use crate::ast::*;
use crate::binary::Reader;
use crate::error::{DecodeError, DecodeErrorKind};
use crate::util::vector::reserve_checked;
use crate::value::{FuncType, ValType};

const MAGIC: [u8; 4] = *b"\0asm";
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

pub fn decode_module(bytes: &[u8]) -> Result<Module, DecodeError> {
    let mut r = Reader::new(bytes);
    let magic = r.read_bytes(4)?;
    if magic != MAGIC {
        return Err(DecodeError::new(DecodeErrorKind::BadMagic, 0));
    }
    let version = r.read_bytes(4)?;
    if version != VERSION {
        return Err(DecodeError::new(DecodeErrorKind::BadVersion, 4));
    }

    let mut module = Module::default();
    let mut last_id: u8 = 0;

    while !r.eof() {
        let section_start = r.pos();
        let id = r.read_u8()?;
        let size = r.read_uleb32()? as usize;
        let body_start = r.pos();
        let body = r.read_bytes(size)?;

        if id == 0 {
            // custom section: may appear anywhere, contents are not
            // semantically interpreted.
            continue;
        }
        if id == 0 || id > 11 {
            return Err(DecodeError::new(DecodeErrorKind::UnknownSectionId(id), section_start));
        }
        if id <= last_id {
            return Err(DecodeError::new(DecodeErrorKind::BadSectionOrder, section_start));
        }
        last_id = id;

        let mut sr = Reader::new(body);
        match id {
            1 => module.types = decode_type_section(&mut sr, body_start)?,
            2 => module.imports = decode_import_section(&mut sr, body_start)?,
            3 => module.functions = decode_function_section(&mut sr, body_start)?,
            4 => module.tables = decode_table_section(&mut sr, body_start)?,
            5 => module.memories = decode_memory_section(&mut sr, body_start)?,
            6 => module.globals = decode_global_section(&mut sr, body_start)?,
            7 => module.exports = decode_export_section(&mut sr, body_start)?,
            8 => module.start = Some(decode_start_section(&mut sr)?),
            9 => module.elements = decode_element_section(&mut sr, body_start)?,
            10 => module.code = decode_code_section(&mut sr, body_start)?,
            11 => module.data = decode_data_section(&mut sr, body_start)?,
            _ => unreachable!(),
        }
    }

    debug!(
        "decoded module: {} types, {} imports, {} funcs, {} exports",
        module.types.len(),
        module.imports.len(),
        module.functions.len(),
        module.exports.len()
    );

    Ok(module)
}

fn read_valtype(r: &mut Reader, offset: usize) -> Result<ValType, DecodeError> {
    let b = r.read_u8()?;
    ValType::from_byte(b).ok_or(DecodeError::new(DecodeErrorKind::InvalidValType(b), offset))
}

fn decode_type_section(r: &mut Reader, base: usize) -> Result<Vec<FuncType>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    reserve_checked(&mut out, n, base)?;
    for _ in 0..n {
        let form = r.read_u8()?;
        if form != 0x60 {
            return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("non-func type"), base + r.pos()));
        }
        let n_in = r.read_uleb32()?;
        let mut inputs = Vec::new();
        reserve_checked(&mut inputs, n_in, base + r.pos())?;
        for _ in 0..n_in {
            inputs.push(read_valtype(r, base + r.pos())?);
        }
        let n_out = r.read_uleb32()?;
        if n_out > 1 {
            return Err(DecodeError::new(DecodeErrorKind::TooManyOutputs, base + r.pos()));
        }
        let mut outputs = Vec::new();
        for _ in 0..n_out {
            outputs.push(read_valtype(r, base + r.pos())?);
        }
        out.push(FuncType::new(inputs, outputs));
    }
    Ok(out)
}

fn decode_limits(r: &mut Reader) -> Result<Limits, DecodeError> {
    let flags = r.read_u8()?;
    let min = r.read_uleb32()?;
    let max = if flags & 1 != 0 { Some(r.read_uleb32()?) } else { None };
    Ok(Limits { min, max })
}

fn decode_table_type(r: &mut Reader, offset: usize) -> Result<TableType, DecodeError> {
    let elem = r.read_u8()?;
    if elem != 0x70 {
        return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("non-funcref table"), offset));
    }
    Ok(TableType { elemtype: ElemType::FuncRef, limits: decode_limits(r)? })
}

fn decode_global_type(r: &mut Reader, offset: usize) -> Result<GlobalType, DecodeError> {
    let valtype = read_valtype(r, offset)?;
    let m = r.read_u8()?;
    let mutable = match m {
        0 => false,
        1 => true,
        _ => return Err(DecodeError::new(DecodeErrorKind::InvalidMutability(m), offset)),
    };
    Ok(GlobalType { valtype, mutable })
}

fn decode_import_section(r: &mut Reader, base: usize) -> Result<Vec<Import>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    reserve_checked(&mut out, n, base)?;
    for _ in 0..n {
        let module = r.read_str()?.to_string();
        let name = r.read_str()?.to_string();
        let kind = r.read_u8()?;
        let desc = match kind {
            0x00 => ImportDesc::Func(r.read_uleb32()?),
            0x01 => ImportDesc::Table(decode_table_type(r, base + r.pos())?),
            0x02 => ImportDesc::Memory(MemoryType { limits: decode_limits(r)? }),
            0x03 => ImportDesc::Global(decode_global_type(r, base + r.pos())?),
            _ => return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("import kind"), base + r.pos())),
        };
        out.push(Import { module, name, desc });
    }
    Ok(out)
}

fn decode_function_section(r: &mut Reader, base: usize) -> Result<Vec<u32>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    reserve_checked(&mut out, n, base)?;
    for _ in 0..n {
        out.push(r.read_uleb32()?);
    }
    Ok(out)
}

fn decode_table_section(r: &mut Reader, base: usize) -> Result<Vec<TableType>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(decode_table_type(r, base + r.pos())?);
    }
    Ok(out)
}

fn decode_memory_section(r: &mut Reader, _base: usize) -> Result<Vec<MemoryType>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(MemoryType { limits: decode_limits(r)? });
    }
    Ok(out)
}

fn decode_const_expr(r: &mut Reader, offset: usize) -> Result<ConstExprKind, DecodeError> {
    let op = r.read_u8()?;
    let expr = match op {
        0x41 => ConstExprKind::I32Const(r.read_sleb32()?),
        0x42 => ConstExprKind::I64Const(r.read_sleb64()?),
        0x43 => ConstExprKind::F32Const(r.read_f32_le()?.to_bits()),
        0x44 => ConstExprKind::F64Const(r.read_f64_le()?.to_bits()),
        0x23 => ConstExprKind::GlobalGet(r.read_uleb32()?),
        _ => return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("const expr opcode"), offset)),
    };
    let end = r.read_u8()?;
    if end != 0x0B {
        return Err(DecodeError::new(DecodeErrorKind::MissingElseOrEnd, offset));
    }
    Ok(expr)
}

fn decode_global_section(
    r: &mut Reader,
    base: usize,
) -> Result<Vec<(GlobalType, ConstExprKind)>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    for _ in 0..n {
        let ty = decode_global_type(r, base + r.pos())?;
        let expr = decode_const_expr(r, base + r.pos())?;
        out.push((ty, expr));
    }
    Ok(out)
}

fn decode_export_section(r: &mut Reader, base: usize) -> Result<Vec<Export>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    reserve_checked(&mut out, n, base)?;
    for _ in 0..n {
        let name = r.read_str()?.to_string();
        let kind_byte = r.read_u8()?;
        let kind = match kind_byte {
            0x00 => ExternKind::Func,
            0x01 => ExternKind::Table,
            0x02 => ExternKind::Memory,
            0x03 => ExternKind::Global,
            _ => return Err(DecodeError::new(DecodeErrorKind::UnsupportedFeature("export kind"), base + r.pos())),
        };
        let index = r.read_uleb32()?;
        out.push(Export { name, kind, index });
    }
    Ok(out)
}

fn decode_start_section(r: &mut Reader) -> Result<u32, DecodeError> {
    r.read_uleb32()
}

fn decode_element_section(r: &mut Reader, base: usize) -> Result<Vec<ElementSegment>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    for _ in 0..n {
        let table_index = r.read_uleb32()?;
        let offset = decode_const_expr(r, base + r.pos())?;
        let count = r.read_uleb32()?;
        let mut func_indices = Vec::new();
        reserve_checked(&mut func_indices, count, base + r.pos())?;
        for _ in 0..count {
            func_indices.push(r.read_uleb32()?);
        }
        out.push(ElementSegment { table_index, offset, func_indices });
    }
    Ok(out)
}

fn decode_code_section(r: &mut Reader, base: usize) -> Result<Vec<FuncBody>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    reserve_checked(&mut out, n, base)?;
    for _ in 0..n {
        let body_size = r.read_uleb32()? as usize;
        let body_bytes = r.read_bytes(body_size)?;
        let mut br = Reader::new(body_bytes);
        let n_local_decls = br.read_uleb32()?;
        let mut locals = Vec::new();
        for _ in 0..n_local_decls {
            let count = br.read_uleb32()?;
            let ty = read_valtype(&mut br, base + r.pos())?;
            locals.push((count, ty));
        }
        let instructions = instr::decode_instructions(&mut br, base + r.pos())?;
        out.push(FuncBody { locals, instructions });
    }
    Ok(out)
}

fn decode_data_section(r: &mut Reader, base: usize) -> Result<Vec<DataSegment>, DecodeError> {
    let n = r.read_uleb32()?;
    let mut out = Vec::new();
    for _ in 0..n {
        let mem_index = r.read_uleb32()?;
        let offset = decode_const_expr(r, base + r.pos())?;
        let len = r.read_uleb32()? as usize;
        let bytes = r.read_bytes(len)?.to_vec();
        out.push(DataSegment { mem_index, offset, bytes });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leb(mut v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    fn empty_module() -> Vec<u8> {
        let mut b = MAGIC.to_vec();
        b.extend_from_slice(&VERSION);
        b
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode_module(b"xxxx\x01\x00\x00\x00").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadMagic);
    }

    #[test]
    fn rejects_bad_version() {
        let err = decode_module(b"\0asm\x02\x00\x00\x00").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadVersion);
    }

    #[test]
    fn decodes_empty_module() {
        let m = decode_module(&empty_module()).unwrap();
        assert!(m.types.is_empty());
    }

    #[test]
    fn rejects_out_of_order_sections() {
        let mut b = empty_module();
        // type section (id 1), empty
        b.push(1);
        b.extend(leb(1));
        b.push(0); // vector len 0
        // import section (id 2) placed before a second type section (id 1) -> error
        b.push(1);
        b.extend(leb(1));
        b.push(0);
        let err = decode_module(&b).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadSectionOrder);
    }

    #[test]
    fn custom_sections_may_repeat_anywhere() {
        let mut b = empty_module();
        for _ in 0..2 {
            b.push(0); // custom section id
            let body: Vec<u8> = {
                let mut v = leb(0); // name length 0
                v
            };
            b.extend(leb(body.len() as u32));
            b.extend(body);
        }
        let m = decode_module(&b).unwrap();
        assert!(m.types.is_empty());
    }

    #[test]
    fn rejects_func_type_with_two_outputs() {
        let mut b = empty_module();
        let mut body = leb(1); // 1 type
        body.push(0x60); // func form
        body.extend(leb(0)); // 0 inputs
        body.extend(leb(2)); // 2 outputs -> error
        body.push(0x7F);
        body.push(0x7F);
        b.push(1);
        b.extend(leb(body.len() as u32));
        b.extend(body);
        let err = decode_module(&b).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::TooManyOutputs);
    }
}
