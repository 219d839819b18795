// bcvm - Dynamic binary translation engine for BC bytecode
//
// Executes a guest bytecode program by mixing interpretation with
// on-demand native compilation: every basic block starts life
// interpreted, and blocks that cross the hotness threshold are handed to
// a compiler backend and re-executed as native routines from then on.
// Either path must leave the guest state bit-for-bit identical.
//
// # Architecture
//
// 1. **Guest state** (`cpu.rs`): registers, flags, program counter
// 2. **Guest memory** (`mem.rs`): flat RAM with write tracking
// 3. **Decoding** (`decode.rs`): bytes at pc -> structured instruction
// 4. **Block discovery** (`block.rs`): decode forward to the first
//    control-flow terminator
// 5. **Interpretation** (`interp.rs`): the guaranteed-correct baseline
// 6. **Translation cache** (`cache.rs`): pc -> block, counter, routine
// 7. **Dispatch** (`dispatch.rs`): the interpret-or-invoke control loop
//
// The compiler itself is behind the `BlockCompiler` trait
// (`compiler.rs`); the `bc2wasm` crate provides the WebAssembly backend.

pub mod block;
pub mod cache;
pub mod compiler;
pub mod cpu;
pub mod decode;
pub mod dispatch;
pub mod interp;
pub mod mem;

pub use block::{BasicBlock, BlockLimits};
pub use cache::{TranslationBlock, TranslationCache};
pub use compiler::{BlockCompiler, CompileError, Routine};
pub use cpu::{CpuState, Flags, GuestTrap, TrapCause, LINK_REG, NUM_REGS};
pub use decode::{DecodeError, Flow, Instruction, Op};
pub use dispatch::{Engine, EngineConfig, EngineStats, Exit, Fault};
pub use mem::{GuestMemory, DEFAULT_MEMORY_SIZE};
