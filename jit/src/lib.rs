// bc2wasm - WebAssembly JIT backend for the bcvm translation engine
//
// Compiles hot basic blocks of BC bytecode to WebAssembly at runtime and
// executes them through an embedded wasmtime. The engine stays oblivious:
// it sees a `BlockCompiler` that returns invocable routines.
//
// # Pipeline
//
// 1. **Lowering** (`translate.rs`): basic block -> wasm instruction IR
// 2. **Encoding** (`builder.rs`): IR -> wasm module bytes (wasm-encoder)
// 3. **Execution** (`runtime.rs`): instantiate once, invoke per dispatch
//
// # ABI (`abi.rs`)
//
// Each block becomes its own module exporting `block: () -> i64` (the
// successor pc) plus a one-page scratch memory for the register file;
// guest RAM stays on the host side behind imported load/store helpers,
// and guest faults travel through an imported trap helper.

pub mod abi;
pub mod builder;
pub mod runtime;
pub mod translate;

pub use runtime::WasmJit;
