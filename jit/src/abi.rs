// abi.rs - Calling contract between the engine and compiled blocks
//
// Every compiled basic block is its own wasm module with one page of
// private linear memory holding the guest register file. The runtime
// copies the register file in, calls the exported block function, and
// copies it back out; the function's i64 return value is the successor
// program counter. Guest RAM is never copied: loads and stores call back
// into the host through the imported helpers below, and guest faults
// travel through the trap helper rather than the return value.

use bcvm::NUM_REGS;

/// Module name for all imports of generated modules.
pub const IMPORT_MODULE: &str = "env";

/// Guest 64-bit load: `(pc: i64, addr: i64) -> i64`.
pub const IMPORT_MEM_LOAD: &str = "mem_load_u64";

/// Guest 64-bit store: `(pc: i64, addr: i64, val: i64)`.
pub const IMPORT_MEM_STORE: &str = "mem_store_u64";

/// Guest fault: `(pc: i64, cause: i32)`. Never returns; the host raises
/// a wasm trap after recording the fault.
pub const IMPORT_GUEST_TRAP: &str = "guest_trap";

/// Export name of the block function: `() -> i64` (successor pc).
pub const EXPORT_BLOCK_FN: &str = "block";

/// Export name of the scratch memory holding the register file.
pub const EXPORT_MEMORY: &str = "memory";

// Function indices inside a generated module: imports first, in
// declaration order, then the block function itself.
pub const FN_MEM_LOAD: u32 = 0;
pub const FN_MEM_STORE: u32 = 1;
pub const FN_GUEST_TRAP: u32 = 2;
pub const FN_BLOCK: u32 = 3;

/// Byte offset of register `r` in the scratch memory.
pub const fn reg_offset(r: u8) -> u64 {
    r as u64 * 8
}

/// Byte offset of the flags word (Z=bit0, N=bit1, HALT=bit2).
pub const FLAGS_OFFSET: u64 = NUM_REGS as u64 * 8;

/// Total bytes copied across the boundary per invocation.
pub const STATE_SIZE: usize = NUM_REGS * 8 + 8;

pub const FLAG_ZERO: u64 = 1 << 0;
pub const FLAG_NEGATIVE: u64 = 1 << 1;
pub const FLAG_HALTED: u64 = 1 << 2;

/// Trap cause codes passed to `guest_trap`.
pub const CAUSE_DIV_BY_ZERO: i32 = 1;
