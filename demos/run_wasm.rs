//! Manual smoke-test driver: load a `.wasm` file from argv, instantiate it
//! with no imports, and invoke its `_start` export (or a named export given
//! as a second argument). Not part of the library; carries no tests.

use std::process::ExitCode;

use wasmjit::embed;
use wasmjit::runtime::ExternAddr;
use wasmjit::value::Value;

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: run_wasm <module.wasm> [export-name]");
        return ExitCode::FAILURE;
    };
    let export_name = args.next().unwrap_or_else(|| "_start".to_string());

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let module = match embed::load_module(&bytes) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("decode error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut store = embed::store_new();
    if let Err(e) = embed::instantiate(&module, "main", &mut store) {
        eprintln!("instantiation error: {e}");
        return ExitCode::FAILURE;
    }

    let Some(ExternAddr::Func(addr)) = embed::get_export(&store, "main", &export_name) else {
        eprintln!("no exported function named {export_name}");
        return ExitCode::FAILURE;
    };

    match embed::invoke(&store, addr, &[]) {
        Ok(Some(Value::I32(code))) => ExitCode::from(code as u8),
        Ok(_) => ExitCode::SUCCESS,
        Err(trap) => {
            eprintln!("trapped: {trap}");
            ExitCode::FAILURE
        }
    }
}
