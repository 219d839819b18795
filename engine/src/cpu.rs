// cpu.rs - Guest machine state
//
// The single mutable snapshot of the emulated machine. Both the
// interpreter and compiled routines read and write exactly this state;
// nothing else in the engine holds register values.

use std::fmt;

use thiserror::Error;

/// Number of general-purpose guest registers (r0..r15).
pub const NUM_REGS: usize = 16;

/// Register used by CALL/RET to hold the return address.
pub const LINK_REG: usize = 15;

/// Condition flags set by ALU instructions and consumed by JZ/JNZ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Last ALU result was zero.
    pub zero: bool,
    /// Last ALU result was negative.
    pub negative: bool,
}

impl Flags {
    /// Derive flags from an ALU result.
    pub fn from_result(value: i64) -> Self {
        Self {
            zero: value == 0,
            negative: value < 0,
        }
    }
}

/// Register, flag, and program-counter state of one guest execution
/// context. Created at execution start, mutated continuously, never
/// duplicated while live (an aliased copy would desynchronize the two
/// execution paths).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuState {
    /// General-purpose registers.
    pub regs: [i64; NUM_REGS],
    /// Guest program counter.
    pub pc: u32,
    /// Condition flags.
    pub flags: Flags,
    /// Set by HALT; checked by the dispatcher at block boundaries.
    pub halted: bool,
}

impl CpuState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pc={:#010x} z={} n={} halted={}",
            self.pc, self.flags.zero as u8, self.flags.negative as u8, self.halted
        )?;
        for (i, v) in self.regs.iter().enumerate() {
            if i % 4 == 0 {
                writeln!(f)?;
            }
            write!(f, "  r{:<2} = {:<20}", i, v)?;
        }
        Ok(())
    }
}

/// Cause of a guest-level fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// DIV with a zero divisor.
    DivideByZero,
    /// Data access outside mapped guest memory.
    MemoryFault { addr: i64 },
}

/// A fault raised by the guest program itself. Recoverable by the
/// driver's fault handler; never a host bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest trap at {pc:#x}: {cause:?}")]
pub struct GuestTrap {
    /// Address of the faulting instruction.
    pub pc: u32,
    pub cause: TrapCause,
}
