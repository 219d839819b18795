// compiler.rs - Compiler boundary
//
// The engine treats native-code generation as an opaque capability: it
// hands over an immutable basic block and gets back an invocable routine.
// The concrete backend lives in its own crate.

use thiserror::Error;

use crate::block::BasicBlock;
use crate::cpu::{CpuState, GuestTrap};

/// Compilation failure for one block. Recoverable: the dispatcher falls
/// back to interpreting that block permanently, and never escalates.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("instruction at {addr:#x} not supported for code generation")]
    UnsupportedInstruction { addr: u32 },
    #[error("code generation backend: {0}")]
    Backend(String),
}

/// A compiled native routine for one basic block.
///
/// Contract: `invoke` applies exactly the semantic effects the
/// interpreter would apply for the same block from the same state,
/// including leaving `cpu.pc` at the successor address. Guest-level
/// faults come back as `GuestTrap`, never as a host panic.
pub trait Routine {
    fn invoke(&mut self, cpu: &mut CpuState) -> Result<(), GuestTrap>;
}

/// The external compilation capability.
pub trait BlockCompiler {
    fn compile(&mut self, block: &BasicBlock) -> Result<Box<dyn Routine>, CompileError>;
}
