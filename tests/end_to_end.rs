//! End-to-end scenarios driving the whole pipeline (decode, link, invoke)
//! against hand-built wasm binaries — no external `.wasm` fixtures.

use wasmjit::embed;
use wasmjit::runtime::ExternAddr;
use wasmjit::value::{FuncType, Value, ValType};

/// Minimal byte-level wasm module builder. Each `section` call appends one
/// section with its length prefix computed automatically.
struct Builder {
    out: Vec<u8>,
}

fn leb_u(mut v: u32) -> Vec<u8> {
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

fn leb_s(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut more = true;
    while more {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0) {
            more = false;
        } else {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

impl Builder {
    fn new() -> Self {
        let mut out = b"\0asm".to_vec();
        out.extend_from_slice(&[1, 0, 0, 0]);
        Self { out }
    }

    fn section(mut self, id: u8, body: Vec<u8>) -> Self {
        self.out.push(id);
        self.out.extend(leb_u(body.len() as u32));
        self.out.extend(body);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

fn vec_of(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = leb_u(items.len() as u32);
    for i in items {
        out.extend(i);
    }
    out
}

fn functype(inputs: &[u8], outputs: &[u8]) -> Vec<u8> {
    let mut out = vec![0x60];
    out.extend(leb_u(inputs.len() as u32));
    out.extend_from_slice(inputs);
    out.extend(leb_u(outputs.len() as u32));
    out.extend_from_slice(outputs);
    out
}

fn code_entry(locals: &[(u32, u8)], body: &[u8]) -> Vec<u8> {
    let mut inner = leb_u(locals.len() as u32);
    for (count, ty) in locals {
        inner.extend(leb_u(*count));
        inner.push(*ty);
    }
    inner.extend_from_slice(body);
    inner.push(0x0B); // end
    let mut out = leb_u(inner.len() as u32);
    out.extend(inner);
    out
}

const I32: u8 = 0x7F;
const I64: u8 = 0x7E;
const F32: u8 = 0x7D;
const F64: u8 = 0x7C;

fn memarg(align: u32, offset: u32) -> Vec<u8> {
    let mut out = leb_u(align);
    out.extend(leb_u(offset));
    out
}

/// `identity(x: i32) -> i32`: `local.get 0`.
#[test]
fn identity_i32_round_trips_through_the_whole_pipeline() {
    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[I32], &[I32])]))
        .section(3, vec_of(vec![leb_u(0)]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(5);
            e.extend(b"ident");
            e.push(0x00);
            e.extend(leb_u(0));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &[0x20, 0x00])]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "ident").unwrap() else { panic!() };
    let result = embed::invoke(&store, addr, &[Value::I32(77)]).unwrap();
    assert_eq!(result, Some(Value::I32(77)));
}

/// `fac(n: i64) -> i64`, recursive: `n == 0 ? 1 : n * fac(n - 1)`.
#[test]
fn recursive_factorial_computes_correctly() {
    let body = vec![
        0x20, 0x00, // local.get 0
        0x50, // i64.eqz
        0x04, 0x7E, // if (result i64)
        0x42, 0x01, // i64.const 1
        0x05, // else
        0x20, 0x00, // local.get 0
        0x20, 0x00, // local.get 0
        0x42, 0x01, // i64.const 1
        0x7D, // i64.sub
        0x10, 0x00, // call 0 (self)
        0x7E, // i64.mul
        0x0B, // end (if)
    ];

    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[I64], &[I64])]))
        .section(3, vec_of(vec![leb_u(0)]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(3);
            e.extend(b"fac");
            e.push(0x00);
            e.extend(leb_u(0));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &body)]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "fac").unwrap() else { panic!() };
    let result = embed::invoke(&store, addr, &[Value::I64(10)]).unwrap();
    assert_eq!(result, Some(Value::I64(3628800)));
}

/// One memory page, `load_byte(addr: i32) -> i32` reading `i32.load8_u`.
/// Exercises the out-of-bounds trap at the page boundary.
#[test]
fn memory_load_traps_out_of_bounds() {
    let body = vec![0x20, 0x00, 0x2D, 0x00, 0x00]; // local.get 0; i32.load8_u align=0 offset=0
    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[I32], &[I32])]))
        .section(3, vec_of(vec![leb_u(0)]))
        .section(5, vec_of(vec![{
            let mut e = vec![0x00]; // flags: no max
            e.extend(leb_u(1)); // min 1 page
            e
        }]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(4);
            e.extend(b"load");
            e.push(0x00);
            e.extend(leb_u(0));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &body)]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "load").unwrap() else { panic!() };

    let ok = embed::invoke(&store, addr, &[Value::I32(0)]).unwrap();
    assert_eq!(ok, Some(Value::I32(0)));

    let trap = embed::invoke(&store, addr, &[Value::I32(65536)]).unwrap_err();
    assert_eq!(trap, wasmjit::error::TrapCode::OutOfBoundsMemoryAccess);
}

/// A start function writes `0xDEADBEEF` (little-endian) to memory address 0;
/// an exported reader function confirms it landed.
#[test]
fn start_function_writes_deadbeef_before_any_export_runs() {
    // fn 0 (start): i32.const 0; i32.const 0xDEADBEEFu32 as i32; i32.store
    let start_body = vec![
        0x41, 0x00, // i32.const 0
        0x41, // i32.const <DEADBEEF as signed leb>
    ];
    let mut start_body = start_body;
    start_body.extend(leb_s(0xDEADBEEFu32 as i32 as i64));
    start_body.push(0x36); // i32.store
    start_body.extend(leb_u(0)); // align
    start_body.extend(leb_u(0)); // offset

    // fn 1 (export "read"): i32.const 0; i32.load
    let read_body = vec![0x41, 0x00, 0x28, 0x00, 0x00];

    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[], &[]), functype(&[], &[I32])]))
        .section(3, vec_of(vec![leb_u(0), leb_u(1)]))
        .section(5, vec_of(vec![{
            let mut e = vec![0x00];
            e.extend(leb_u(1));
            e
        }]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(4);
            e.extend(b"read");
            e.push(0x00);
            e.extend(leb_u(1));
            e
        }]))
        .section(8, leb_u(0))
        .section(10, vec_of(vec![code_entry(&[], &start_body), code_entry(&[], &read_body)]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "read").unwrap() else { panic!() };
    let result = embed::invoke(&store, addr, &[]).unwrap();
    assert_eq!(result, Some(Value::I32(0xDEADBEEFu32 as i32)));
}

/// A table of two functions (identity, negate); `dispatch(i: i32, x: i32)`
/// calls table[i](x) indirectly. Also checks the out-of-bounds table trap.
#[test]
fn indirect_call_dispatches_and_traps_out_of_bounds() {
    // type 0: (i32) -> i32, used by both table entries and call_indirect.
    // fn 0: identity  -- local.get 0
    // fn 1: negate    -- i32.const 0; local.get 0; i32.sub
    // fn 2: dispatch(i32, i32) -> i32 -- local.get 1; local.get 0; call_indirect 0
    let f_identity = vec![0x20, 0x00];
    let f_negate = vec![0x41, 0x00, 0x20, 0x00, 0x6B];
    let f_dispatch = vec![0x20, 0x01, 0x20, 0x00, 0x11, 0x00, 0x00];

    let wasm = Builder::new()
        .section(
            1,
            vec_of(vec![functype(&[I32], &[I32]), functype(&[I32, I32], &[I32])]),
        )
        .section(3, vec_of(vec![leb_u(0), leb_u(0), leb_u(1)]))
        .section(4, vec_of(vec![{
            let mut e = vec![0x70, 0x00]; // funcref, flags=no max
            e.extend(leb_u(2)); // min 2
            e
        }]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(8);
            e.extend(b"dispatch");
            e.push(0x00);
            e.extend(leb_u(2));
            e
        }]))
        .section(9, vec_of(vec![{
            let mut e = leb_u(0); // table index 0
            e.push(0x41); // i32.const
            e.extend(leb_s(0));
            e.push(0x0B); // end
            e.extend(leb_u(2)); // 2 func indices
            e.extend(leb_u(0));
            e.extend(leb_u(1));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &f_identity), code_entry(&[], &f_negate), code_entry(&[], &f_dispatch)]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "dispatch").unwrap() else { panic!() };

    let via_identity = embed::invoke(&store, addr, &[Value::I32(0), Value::I32(9)]).unwrap();
    assert_eq!(via_identity, Some(Value::I32(9)));

    let via_negate = embed::invoke(&store, addr, &[Value::I32(1), Value::I32(9)]).unwrap();
    assert_eq!(via_negate, Some(Value::I32(-9)));

    let trap = embed::invoke(&store, addr, &[Value::I32(5), Value::I32(9)]).unwrap_err();
    assert_eq!(trap, wasmjit::error::TrapCode::OutOfBoundsTableAccess);
}

/// `add3(x: i32) -> i32` calls a host import `env.add` twice.
#[test]
fn host_import_is_callable_from_compiled_code() {
    let mut store = embed::store_new();
    let add_ty = FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    embed::import_function(&mut store, "env", "add", add_ty, |args| {
        let a = args[0].as_i32().unwrap();
        let b = args[1].as_i32().unwrap();
        Ok(Some(Value::I32(a + b)))
    });

    // add3(x) = add(add(x, 1), 2)
    let body = vec![
        0x20, 0x00, // local.get 0
        0x41, 0x01, // i32.const 1
        0x10, 0x00, // call 0 (import)
        0x41, 0x02, // i32.const 2
        0x10, 0x00, // call 0 (import)
    ];

    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[I32, I32], &[I32]), functype(&[I32], &[I32])]))
        .section(2, vec_of(vec![{
            let mut e = leb_u(3);
            e.extend(b"env");
            e.extend(leb_u(3));
            e.extend(b"add");
            e.push(0x00); // func import
            e.extend(leb_u(0)); // type index 0: (i32,i32)->i32
            e
        }]))
        .section(3, vec_of(vec![leb_u(1)])) // add3: type index 1: (i32)->i32
        .section(7, vec_of(vec![{
            let mut e = leb_u(4);
            e.extend(b"add3");
            e.push(0x00);
            e.extend(leb_u(1)); // function index 1 (after the one import)
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &body)]))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    embed::instantiate(&module, "m", &mut store).unwrap();
    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "add3").unwrap() else { panic!() };
    let result = embed::invoke(&store, addr, &[Value::I32(39)]).unwrap();
    assert_eq!(result, Some(Value::I32(42)));
}

/// Re-instantiating the same decoded module under a different name produces
/// independent, non-interfering instances.
#[test]
fn same_module_instantiated_twice_under_different_names_is_independent() {
    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[], &[I32])]))
        .section(3, vec_of(vec![leb_u(0)]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(3);
            e.extend(b"get");
            e.push(0x00);
            e.extend(leb_u(0));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &[0x41, 0x2A])])) // i32.const 42
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "a", &mut store).unwrap();
    embed::instantiate(&module, "b", &mut store).unwrap();

    let ExternAddr::Func(a) = embed::get_export(&store, "a", "get").unwrap() else { panic!() };
    let ExternAddr::Func(b) = embed::get_export(&store, "b", "get").unwrap() else { panic!() };
    assert_ne!(a.0, b.0);
    assert_eq!(embed::invoke(&store, a, &[]).unwrap(), Some(Value::I32(42)));
    assert_eq!(embed::invoke(&store, b, &[]).unwrap(), Some(Value::I32(42)));
}

/// Narrow-width and float stores must touch only their declared access size,
/// and round-trip the exact bit pattern written. Drives `store_word` (the
/// already-trusted 4-byte store) to lay down an 0xFF sentinel around each
/// target address first, so a store that accidentally writes more than its
/// declared width shows up as a clobbered neighbor byte.
#[test]
fn narrow_and_float_stores_round_trip_without_clobbering_neighbors() {
    // type 0: (i32,i32) -> ()     store_word / store_i32_8 / store_i32_16
    // type 1: (i32) -> i32        load_byte_u
    // type 2: (i32,i64) -> ()     store_i64_8 / store_i64_16
    // type 3: (i32,f32) -> ()     store_f32
    // type 4: (i32) -> f32        load_f32
    // type 5: (i32,f64) -> ()     store_f64
    // type 6: (i32) -> f64        load_f64
    let types = vec![
        functype(&[I32, I32], &[]),
        functype(&[I32], &[I32]),
        functype(&[I32, I64], &[]),
        functype(&[I32, F32], &[]),
        functype(&[I32], &[F32]),
        functype(&[I32, F64], &[]),
        functype(&[I32], &[F64]),
    ];

    let load_byte_u = vec![0x20, 0x00, 0x2D].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();
    let store_i32_8 = vec![0x20, 0x00, 0x20, 0x01, 0x3A].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();
    let store_i32_16 = vec![0x20, 0x00, 0x20, 0x01, 0x3B].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();
    let store_i64_8 = vec![0x20, 0x00, 0x20, 0x01, 0x3C].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();
    let store_i64_16 = vec![0x20, 0x00, 0x20, 0x01, 0x3D].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();
    let store_f32 = vec![0x20, 0x00, 0x20, 0x01, 0x38].into_iter().chain(memarg(2, 0)).collect::<Vec<u8>>();
    let load_f32 = vec![0x20, 0x00, 0x2A].into_iter().chain(memarg(2, 0)).collect::<Vec<u8>>();
    let store_f64 = vec![0x20, 0x00, 0x20, 0x01, 0x39].into_iter().chain(memarg(3, 0)).collect::<Vec<u8>>();
    let load_f64 = vec![0x20, 0x00, 0x2B].into_iter().chain(memarg(3, 0)).collect::<Vec<u8>>();
    let store_word = vec![0x20, 0x00, 0x20, 0x01, 0x36].into_iter().chain(memarg(0, 0)).collect::<Vec<u8>>();

    let names: [&[u8]; 10] = [
        b"store_word", b"load_byte_u", b"store_i32_8", b"store_i32_16",
        b"store_i64_8", b"store_i64_16", b"store_f32", b"load_f32",
        b"store_f64", b"load_f64",
    ];
    let type_indices = [0u32, 1, 0, 0, 2, 2, 3, 4, 5, 6];
    let bodies = vec![
        store_word, load_byte_u, store_i32_8, store_i32_16, store_i64_8,
        store_i64_16, store_f32, load_f32, store_f64, load_f64,
    ];

    let exports = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut e = leb_u(name.len() as u32);
            e.extend_from_slice(*name);
            e.push(0x00);
            e.extend(leb_u(i as u32));
            e
        })
        .collect::<Vec<_>>();

    let wasm = Builder::new()
        .section(1, vec_of(types))
        .section(3, vec_of(type_indices.iter().map(|t| leb_u(*t)).collect()))
        .section(5, vec_of(vec![{
            let mut e = vec![0x00];
            e.extend(leb_u(1));
            e
        }]))
        .section(7, vec_of(exports))
        .section(10, vec_of(bodies.iter().map(|b| code_entry(&[], b)).collect()))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();

    let func = |name: &str| {
        let ExternAddr::Func(addr) = embed::get_export(&store, "m", name).unwrap() else { panic!() };
        addr
    };
    let (store_word, load_byte_u) = (func("store_word"), func("load_byte_u"));
    let (store_i32_8, store_i32_16) = (func("store_i32_8"), func("store_i32_16"));
    let (store_i64_8, store_i64_16) = (func("store_i64_8"), func("store_i64_16"));
    let (store_f32, load_f32) = (func("store_f32"), func("load_f32"));
    let (store_f64, load_f64) = (func("store_f64"), func("load_f64"));

    let byte_at = |store: &wasmjit::runtime::Store, addr: i32| -> i32 {
        embed::invoke(store, load_byte_u, &[Value::I32(addr)]).unwrap().unwrap().as_i32().unwrap()
    };

    // i32.store8 at address 4: sentinel-fill [0,16) with 0xFF first.
    for a in (0..16).step_by(4) {
        embed::invoke(&store, store_word, &[Value::I32(a), Value::I32(-1)]).unwrap();
    }
    embed::invoke(&store, store_i32_8, &[Value::I32(4), Value::I32(0xAB)]).unwrap();
    assert_eq!(byte_at(&store, 4), 0xAB);
    assert_eq!(byte_at(&store, 5), 0xFF, "i32.store8 must not touch the following byte");
    assert_eq!(byte_at(&store, 6), 0xFF);
    assert_eq!(byte_at(&store, 7), 0xFF);

    // i32.store16 at address 8.
    for a in (0..16).step_by(4) {
        embed::invoke(&store, store_word, &[Value::I32(a), Value::I32(-1)]).unwrap();
    }
    embed::invoke(&store, store_i32_16, &[Value::I32(8), Value::I32(0x1234)]).unwrap();
    assert_eq!(byte_at(&store, 8), 0x34);
    assert_eq!(byte_at(&store, 9), 0x12);
    assert_eq!(byte_at(&store, 10), 0xFF, "i32.store16 must not touch the third byte");
    assert_eq!(byte_at(&store, 11), 0xFF);

    // i64.store8 at address 16.
    for a in (16..24).step_by(4) {
        embed::invoke(&store, store_word, &[Value::I32(a), Value::I32(-1)]).unwrap();
    }
    embed::invoke(&store, store_i64_8, &[Value::I32(16), Value::I64(0xAB)]).unwrap();
    assert_eq!(byte_at(&store, 16), 0xAB);
    assert_eq!(byte_at(&store, 17), 0xFF, "i64.store8 must not touch the following byte");

    // i64.store16 at address 24.
    for a in (24..32).step_by(4) {
        embed::invoke(&store, store_word, &[Value::I32(a), Value::I32(-1)]).unwrap();
    }
    embed::invoke(&store, store_i64_16, &[Value::I32(24), Value::I64(0x1234)]).unwrap();
    assert_eq!(byte_at(&store, 24), 0x34);
    assert_eq!(byte_at(&store, 25), 0x12);
    assert_eq!(byte_at(&store, 26), 0xFF, "i64.store16 must not touch the third byte");

    // f32/f64 stores round-trip through their own loads.
    embed::invoke(&store, store_f32, &[Value::I32(32), Value::F32(3.5)]).unwrap();
    let got_f32 = embed::invoke(&store, load_f32, &[Value::I32(32)]).unwrap().unwrap();
    assert_eq!(got_f32, Value::F32(3.5));

    embed::invoke(&store, store_f64, &[Value::I32(40), Value::F64(-12.25)]).unwrap();
    let got_f64 = embed::invoke(&store, load_f64, &[Value::I32(40)]).unwrap().unwrap();
    assert_eq!(got_f64, Value::F64(-12.25));
}

/// `f32.min`/`f32.max`/`f64.min`/`f64.max` on equal operands must return
/// that same value, not twice it — and must still propagate NaN and
/// respect the +0/-0 tie-break (min favors -0, max favors +0).
#[test]
fn float_min_max_handle_equal_operands_nan_and_signed_zero() {
    let types = vec![functype(&[F32, F32], &[F32]), functype(&[F64, F64], &[F64])];
    let f32_min = vec![0x20, 0x00, 0x20, 0x01, 0x96];
    let f32_max = vec![0x20, 0x00, 0x20, 0x01, 0x97];
    let f64_min = vec![0x20, 0x00, 0x20, 0x01, 0xA4];
    let f64_max = vec![0x20, 0x00, 0x20, 0x01, 0xA5];

    let names: [&[u8]; 4] = [b"f32_min", b"f32_max", b"f64_min", b"f64_max"];
    let type_indices = [0u32, 0, 1, 1];
    let bodies = vec![f32_min, f32_max, f64_min, f64_max];

    let exports = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut e = leb_u(name.len() as u32);
            e.extend_from_slice(*name);
            e.push(0x00);
            e.extend(leb_u(i as u32));
            e
        })
        .collect::<Vec<_>>();

    let wasm = Builder::new()
        .section(1, vec_of(types))
        .section(3, vec_of(type_indices.iter().map(|t| leb_u(*t)).collect()))
        .section(7, vec_of(exports))
        .section(10, vec_of(bodies.iter().map(|b| code_entry(&[], b)).collect()))
        .finish();

    let module = embed::load_module(&wasm).unwrap();
    let mut store = embed::store_new();
    embed::instantiate(&module, "m", &mut store).unwrap();

    let func = |name: &str| {
        let ExternAddr::Func(addr) = embed::get_export(&store, "m", name).unwrap() else { panic!() };
        addr
    };
    let (f32_min, f32_max) = (func("f32_min"), func("f32_max"));
    let (f64_min, f64_max) = (func("f64_min"), func("f64_max"));

    // Equal, non-zero operands: must not double the value.
    let r = embed::invoke(&store, f32_min, &[Value::F32(3.0), Value::F32(3.0)]).unwrap().unwrap();
    assert_eq!(r, Value::F32(3.0));
    let r = embed::invoke(&store, f64_max, &[Value::F64(3.0), Value::F64(3.0)]).unwrap().unwrap();
    assert_eq!(r, Value::F64(3.0));

    // Ordinary ordered case still picks the right operand.
    let r = embed::invoke(&store, f32_min, &[Value::F32(1.0), Value::F32(2.0)]).unwrap().unwrap();
    assert_eq!(r, Value::F32(1.0));
    let r = embed::invoke(&store, f64_max, &[Value::F64(1.0), Value::F64(2.0)]).unwrap().unwrap();
    assert_eq!(r, Value::F64(2.0));

    // NaN propagates regardless of which operand carries it.
    let Value::F32(r) = embed::invoke(&store, f32_min, &[Value::F32(f32::NAN), Value::F32(1.0)]).unwrap().unwrap() else { panic!() };
    assert!(r.is_nan());
    let Value::F64(r) = embed::invoke(&store, f64_max, &[Value::F64(1.0), Value::F64(f64::NAN)]).unwrap().unwrap() else { panic!() };
    assert!(r.is_nan());

    // Signed-zero tie-break: min(+0,-0) = -0, max(+0,-0) = +0.
    let Value::F32(r) = embed::invoke(&store, f32_min, &[Value::F32(0.0), Value::F32(-0.0)]).unwrap().unwrap() else { panic!() };
    assert!(r == 0.0 && r.is_sign_negative());
    let Value::F64(r) = embed::invoke(&store, f64_max, &[Value::F64(0.0), Value::F64(-0.0)]).unwrap().unwrap() else { panic!() };
    assert!(r == 0.0 && r.is_sign_positive());
}

/// `call_indirect` reads a `FuncTypeDesc` relocation pointing straight into
/// a `Module`'s `types` vector. Dropping the embedder's own `Rc<Module>`
/// right after instantiating must not dangle that pointer — the store is
/// expected to keep the module alive on its own.
#[test]
fn indirect_call_survives_dropping_the_caller_module_handle() {
    let f_identity = vec![0x20, 0x00];
    let f_dispatch = vec![0x20, 0x01, 0x20, 0x00, 0x11, 0x00, 0x00];

    let wasm = Builder::new()
        .section(1, vec_of(vec![functype(&[I32], &[I32]), functype(&[I32, I32], &[I32])]))
        .section(3, vec_of(vec![leb_u(0), leb_u(1)]))
        .section(4, vec_of(vec![{
            let mut e = vec![0x70, 0x00];
            e.extend(leb_u(1));
            e
        }]))
        .section(7, vec_of(vec![{
            let mut e = leb_u(8);
            e.extend(b"dispatch");
            e.push(0x00);
            e.extend(leb_u(1));
            e
        }]))
        .section(9, vec_of(vec![{
            let mut e = leb_u(0);
            e.push(0x41);
            e.extend(leb_s(0));
            e.push(0x0B);
            e.extend(leb_u(1));
            e.extend(leb_u(0));
            e
        }]))
        .section(10, vec_of(vec![code_entry(&[], &f_identity), code_entry(&[], &f_dispatch)]))
        .finish();

    let mut store = embed::store_new();
    {
        let module = embed::load_module(&wasm).unwrap();
        embed::instantiate(&module, "m", &mut store).unwrap();
    }
    // `module`'s `Rc` is gone; only `store`'s own retained clone keeps the
    // decoded types alive for `call_indirect`'s type-mismatch check.

    let ExternAddr::Func(addr) = embed::get_export(&store, "m", "dispatch").unwrap() else { panic!() };
    let result = embed::invoke(&store, addr, &[Value::I32(0), Value::I32(9)]).unwrap();
    assert_eq!(result, Some(Value::I32(9)));
}
