// decode.rs - BC bytecode decoder
//
// Decodes one instruction at a guest address into structured form. The
// instruction set is a closed enum: the interpreter and the translator
// both match it totally, so the two execution paths cannot silently
// diverge on an opcode.
//
// Encoding: one opcode byte, register operands as single bytes (0..15),
// 32-bit little-endian immediates. `imm32` is sign-extended to 64 bits;
// branch targets are absolute 32-bit guest addresses.

use thiserror::Error;

use crate::cpu::NUM_REGS;
use crate::mem::GuestMemory;

/// Decode failure. Fatal for the block being built; reported up to the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid encoding {byte:#04x} at {addr:#x}")]
    InvalidEncoding { addr: u32, byte: u8 },
    #[error("instruction fetch at {addr:#x} outside mapped guest memory")]
    OutOfBounds { addr: u32 },
}

/// A decoded instruction: opcode tag plus operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Halt,
    /// rd = imm
    Movi { rd: u8, imm: i64 },
    /// rd = rs
    Mov { rd: u8, rs: u8 },
    Add { rd: u8, rs1: u8, rs2: u8 },
    Sub { rd: u8, rs1: u8, rs2: u8 },
    Mul { rd: u8, rs1: u8, rs2: u8 },
    /// Guest-traps on a zero divisor.
    Div { rd: u8, rs1: u8, rs2: u8 },
    /// rd = rs + imm
    Addi { rd: u8, rs: u8, imm: i64 },
    And { rd: u8, rs1: u8, rs2: u8 },
    Or { rd: u8, rs1: u8, rs2: u8 },
    Xor { rd: u8, rs1: u8, rs2: u8 },
    /// Flags from rs1 - rs2; registers untouched.
    Cmp { rs1: u8, rs2: u8 },
    /// rd = mem[rs + imm]
    Ld { rd: u8, rs: u8, imm: i64 },
    /// mem[rs1 + imm] = rs2
    St { rs1: u8, rs2: u8, imm: i64 },
    Jmp { target: u32 },
    /// Taken when Z is set.
    Jz { target: u32 },
    /// Taken when Z is clear.
    Jnz { target: u32 },
    /// Register-indirect jump; target known only at runtime.
    Jr { rs: u8 },
    /// Link register receives the return address, then jump.
    Call { target: u32 },
    /// Jump to the link register.
    Ret,
}

/// Control-flow classification of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Sequential,
    ConditionalBranch,
    UnconditionalBranch,
    Call,
    Return,
    Trap,
}

impl Op {
    pub fn flow(&self) -> Flow {
        match self {
            Op::Halt => Flow::Trap,
            Op::Jz { .. } | Op::Jnz { .. } => Flow::ConditionalBranch,
            Op::Jmp { .. } | Op::Jr { .. } => Flow::UnconditionalBranch,
            Op::Call { .. } => Flow::Call,
            Op::Ret => Flow::Return,
            _ => Flow::Sequential,
        }
    }

    /// Does this instruction end a basic block?
    pub fn is_terminator(&self) -> bool {
        !matches!(self.flow(), Flow::Sequential)
    }
}

/// A decoded instruction at its guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Guest address of the first encoded byte.
    pub addr: u32,
    /// Encoded length in bytes, always >= 1.
    pub len: u8,
    pub op: Op,
}

impl Instruction {
    /// Address of the next sequential instruction.
    pub fn next_addr(&self) -> u32 {
        self.addr.wrapping_add(self.len as u32)
    }
}

// Opcode bytes.
const OP_HALT: u8 = 0x00;
const OP_MOVI: u8 = 0x01;
const OP_MOV: u8 = 0x02;
const OP_ADD: u8 = 0x03;
const OP_SUB: u8 = 0x04;
const OP_MUL: u8 = 0x05;
const OP_DIV: u8 = 0x06;
const OP_ADDI: u8 = 0x07;
const OP_AND: u8 = 0x08;
const OP_OR: u8 = 0x09;
const OP_XOR: u8 = 0x0a;
const OP_CMP: u8 = 0x0b;
const OP_LD: u8 = 0x10;
const OP_ST: u8 = 0x11;
const OP_JMP: u8 = 0x20;
const OP_JZ: u8 = 0x21;
const OP_JNZ: u8 = 0x22;
const OP_JR: u8 = 0x23;
const OP_CALL: u8 = 0x24;
const OP_RET: u8 = 0x25;

/// Decode the instruction at `addr`. Pure: no side effects on memory or
/// any state.
pub fn decode(mem: &GuestMemory, addr: u32) -> Result<Instruction, DecodeError> {
    let opcode = mem
        .fetch_byte(addr)
        .ok_or(DecodeError::OutOfBounds { addr })?;

    let (op, len) = match opcode {
        OP_HALT => (Op::Halt, 1),
        OP_MOVI => {
            let rd = reg(mem, addr, 1)?;
            let imm = imm32(mem, addr, 2)?;
            (Op::Movi { rd, imm }, 6)
        }
        OP_MOV => {
            let rd = reg(mem, addr, 1)?;
            let rs = reg(mem, addr, 2)?;
            (Op::Mov { rd, rs }, 3)
        }
        OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_AND | OP_OR | OP_XOR => {
            let rd = reg(mem, addr, 1)?;
            let rs1 = reg(mem, addr, 2)?;
            let rs2 = reg(mem, addr, 3)?;
            let op = match opcode {
                OP_ADD => Op::Add { rd, rs1, rs2 },
                OP_SUB => Op::Sub { rd, rs1, rs2 },
                OP_MUL => Op::Mul { rd, rs1, rs2 },
                OP_DIV => Op::Div { rd, rs1, rs2 },
                OP_AND => Op::And { rd, rs1, rs2 },
                OP_OR => Op::Or { rd, rs1, rs2 },
                _ => Op::Xor { rd, rs1, rs2 },
            };
            (op, 4)
        }
        OP_ADDI => {
            let rd = reg(mem, addr, 1)?;
            let rs = reg(mem, addr, 2)?;
            let imm = imm32(mem, addr, 3)?;
            (Op::Addi { rd, rs, imm }, 7)
        }
        OP_CMP => {
            let rs1 = reg(mem, addr, 1)?;
            let rs2 = reg(mem, addr, 2)?;
            (Op::Cmp { rs1, rs2 }, 3)
        }
        OP_LD => {
            let rd = reg(mem, addr, 1)?;
            let rs = reg(mem, addr, 2)?;
            let imm = imm32(mem, addr, 3)?;
            (Op::Ld { rd, rs, imm }, 7)
        }
        OP_ST => {
            let rs1 = reg(mem, addr, 1)?;
            let rs2 = reg(mem, addr, 2)?;
            let imm = imm32(mem, addr, 3)?;
            (Op::St { rs1, rs2, imm }, 7)
        }
        OP_JMP | OP_JZ | OP_JNZ | OP_CALL => {
            let target = target32(mem, addr, 1)?;
            let op = match opcode {
                OP_JMP => Op::Jmp { target },
                OP_JZ => Op::Jz { target },
                OP_JNZ => Op::Jnz { target },
                _ => Op::Call { target },
            };
            (op, 5)
        }
        OP_JR => {
            let rs = reg(mem, addr, 1)?;
            (Op::Jr { rs }, 2)
        }
        OP_RET => (Op::Ret, 1),
        byte => return Err(DecodeError::InvalidEncoding { addr, byte }),
    };

    Ok(Instruction { addr, len, op })
}

fn reg(mem: &GuestMemory, base: u32, offset: u32) -> Result<u8, DecodeError> {
    let addr = base.wrapping_add(offset);
    let byte = mem
        .fetch_byte(addr)
        .ok_or(DecodeError::OutOfBounds { addr })?;
    if byte as usize >= NUM_REGS {
        // A register operand out of range means the bytes are not a valid
        // instruction, attributed to the instruction start.
        return Err(DecodeError::InvalidEncoding { addr: base, byte });
    }
    Ok(byte)
}

fn imm32(mem: &GuestMemory, base: u32, offset: u32) -> Result<i64, DecodeError> {
    let addr = base.wrapping_add(offset);
    let raw = mem
        .fetch_u32(addr)
        .ok_or(DecodeError::OutOfBounds { addr })?;
    Ok(raw as i32 as i64)
}

fn target32(mem: &GuestMemory, base: u32, offset: u32) -> Result<u32, DecodeError> {
    let addr = base.wrapping_add(offset);
    mem.fetch_u32(addr).ok_or(DecodeError::OutOfBounds { addr })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(bytes: &[u8]) -> GuestMemory {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        mem
    }

    #[test]
    fn decodes_movi() {
        let mem = memory_with(&[OP_MOVI, 3, 0xfe, 0xff, 0xff, 0xff]);
        let inst = decode(&mem, 0).unwrap();
        assert_eq!(inst.len, 6);
        assert_eq!(inst.op, Op::Movi { rd: 3, imm: -2 });
        assert!(!inst.op.is_terminator());
    }

    #[test]
    fn decodes_branches_and_classes() {
        let mem = memory_with(&[OP_JZ, 0x10, 0x20, 0, 0, OP_RET, OP_JR, 7]);
        let jz = decode(&mem, 0).unwrap();
        assert_eq!(jz.op, Op::Jz { target: 0x2010 });
        assert_eq!(jz.op.flow(), Flow::ConditionalBranch);
        let ret = decode(&mem, 5).unwrap();
        assert_eq!(ret.op.flow(), Flow::Return);
        let jr = decode(&mem, 6).unwrap();
        assert_eq!(jr.op, Op::Jr { rs: 7 });
        assert_eq!(jr.op.flow(), Flow::UnconditionalBranch);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mem = memory_with(&[0x7f]);
        assert_eq!(
            decode(&mem, 0),
            Err(DecodeError::InvalidEncoding { addr: 0, byte: 0x7f })
        );
    }

    #[test]
    fn rejects_register_out_of_range() {
        let mem = memory_with(&[OP_MOV, 16, 0]);
        assert_eq!(
            decode(&mem, 0),
            Err(DecodeError::InvalidEncoding { addr: 0, byte: 16 })
        );
    }

    #[test]
    fn fetch_past_end_is_out_of_bounds() {
        let mem = GuestMemory::new(4);
        assert_eq!(
            decode(&mem, 100),
            Err(DecodeError::OutOfBounds { addr: 100 })
        );

        // Opcode in range but the immediate runs off the end.
        let mem = GuestMemory::new(8);
        mem.load_image(5, &[OP_MOVI, 1]).unwrap();
        assert_eq!(decode(&mem, 5), Err(DecodeError::OutOfBounds { addr: 7 }));
    }

    #[test]
    fn every_len_is_positive() {
        let mem = memory_with(&[OP_HALT]);
        assert!(decode(&mem, 0).unwrap().len >= 1);
    }
}
