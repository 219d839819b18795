// interp.rs - Baseline interpreter
//
// Executes a basic block instruction by instruction against the guest
// state. This is the guaranteed-correct path; compiled routines must be
// side-effect-identical to it, which is the core correctness invariant
// of the whole translator.
//
// Arithmetic is wrapping two's-complement. DIV of i64::MIN by -1 yields
// i64::MIN: wasm's div_s traps on that input, so the translator guards
// it explicitly and the interpreter must agree.

use crate::block::BasicBlock;
use crate::cpu::{CpuState, Flags, GuestTrap, TrapCause, LINK_REG};
use crate::decode::Op;
use crate::mem::GuestMemory;

fn alu_result(cpu: &mut CpuState, rd: u8, value: i64) {
    cpu.regs[rd as usize] = value;
    cpu.flags = Flags::from_result(value);
}

fn wrapping_div(lhs: i64, rhs: i64) -> i64 {
    if lhs == i64::MIN && rhs == -1 {
        i64::MIN
    } else {
        lhs / rhs
    }
}

/// Execute every instruction of `block` in order, leaving `cpu.pc` at
/// the resolved successor address. Guest-level faults surface as
/// `GuestTrap`; they never unwind the host.
pub fn run_block(block: &BasicBlock, cpu: &mut CpuState, mem: &GuestMemory) -> Result<(), GuestTrap> {
    for inst in &block.instructions {
        let pc = inst.addr;
        match inst.op {
            Op::Halt => {
                cpu.halted = true;
                cpu.pc = inst.next_addr();
            }
            Op::Movi { rd, imm } => cpu.regs[rd as usize] = imm,
            Op::Mov { rd, rs } => cpu.regs[rd as usize] = cpu.regs[rs as usize],
            Op::Add { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize].wrapping_add(cpu.regs[rs2 as usize]);
                alu_result(cpu, rd, v);
            }
            Op::Sub { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize].wrapping_sub(cpu.regs[rs2 as usize]);
                alu_result(cpu, rd, v);
            }
            Op::Mul { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize].wrapping_mul(cpu.regs[rs2 as usize]);
                alu_result(cpu, rd, v);
            }
            Op::Div { rd, rs1, rs2 } => {
                let divisor = cpu.regs[rs2 as usize];
                if divisor == 0 {
                    return Err(GuestTrap {
                        pc,
                        cause: TrapCause::DivideByZero,
                    });
                }
                let v = wrapping_div(cpu.regs[rs1 as usize], divisor);
                alu_result(cpu, rd, v);
            }
            Op::Addi { rd, rs, imm } => {
                let v = cpu.regs[rs as usize].wrapping_add(imm);
                alu_result(cpu, rd, v);
            }
            Op::And { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize] & cpu.regs[rs2 as usize];
                alu_result(cpu, rd, v);
            }
            Op::Or { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize] | cpu.regs[rs2 as usize];
                alu_result(cpu, rd, v);
            }
            Op::Xor { rd, rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize] ^ cpu.regs[rs2 as usize];
                alu_result(cpu, rd, v);
            }
            Op::Cmp { rs1, rs2 } => {
                let v = cpu.regs[rs1 as usize].wrapping_sub(cpu.regs[rs2 as usize]);
                cpu.flags = Flags::from_result(v);
            }
            Op::Ld { rd, rs, imm } => {
                let addr = cpu.regs[rs as usize].wrapping_add(imm);
                let v = mem
                    .load_u64(addr)
                    .map_err(|cause| GuestTrap { pc, cause })?;
                cpu.regs[rd as usize] = v as i64;
            }
            Op::St { rs1, rs2, imm } => {
                let addr = cpu.regs[rs1 as usize].wrapping_add(imm);
                mem.store_u64(addr, cpu.regs[rs2 as usize] as u64)
                    .map_err(|cause| GuestTrap { pc, cause })?;
            }
            Op::Jmp { target } => cpu.pc = target,
            Op::Jz { target } => {
                cpu.pc = if cpu.flags.zero {
                    target
                } else {
                    inst.next_addr()
                };
            }
            Op::Jnz { target } => {
                cpu.pc = if cpu.flags.zero {
                    inst.next_addr()
                } else {
                    target
                };
            }
            Op::Jr { rs } => cpu.pc = cpu.regs[rs as usize] as u32,
            Op::Call { target } => {
                cpu.regs[LINK_REG] = inst.next_addr() as i64;
                cpu.pc = target;
            }
            Op::Ret => cpu.pc = cpu.regs[LINK_REG] as u32,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{build_block, BlockLimits};

    fn run(bytes: &[u8], setup: impl FnOnce(&mut CpuState)) -> (CpuState, GuestMemory) {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        let mut cpu = CpuState::new();
        setup(&mut cpu);
        run_block(&block, &mut cpu, &mem).unwrap();
        (cpu, mem)
    }

    #[test]
    fn arithmetic_and_flags() {
        // movi r0,5 ; addi r0,r0,1 ; jmp 0x40
        let mut p = vec![0x01, 0, 5, 0, 0, 0];
        p.extend_from_slice(&[0x07, 0, 0, 1, 0, 0, 0]);
        p.extend_from_slice(&[0x20, 0x40, 0, 0, 0]);
        let (cpu, _) = run(&p, |_| {});
        assert_eq!(cpu.regs[0], 6);
        assert_eq!(cpu.pc, 0x40);
        assert!(!cpu.flags.zero);
        assert!(!cpu.flags.negative);
    }

    #[test]
    fn sub_to_zero_sets_zero_flag() {
        // sub r2,r0,r1 ; jz 0x50
        let p = vec![0x04, 2, 0, 1, 0x21, 0x50, 0, 0, 0];
        let (cpu, _) = run(&p, |cpu| {
            cpu.regs[0] = 9;
            cpu.regs[1] = 9;
        });
        assert!(cpu.flags.zero);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.pc, 0x50);
    }

    #[test]
    fn conditional_falls_through_when_not_taken() {
        // cmp r0,r1 ; jz 0x50
        let p = vec![0x0b, 0, 1, 0x21, 0x50, 0, 0, 0];
        let (cpu, _) = run(&p, |cpu| {
            cpu.regs[0] = 1;
            cpu.regs[1] = 2;
        });
        assert!(!cpu.flags.zero);
        assert!(cpu.flags.negative);
        assert_eq!(cpu.pc, 8);
    }

    #[test]
    fn divide_by_zero_traps_at_faulting_address() {
        // movi r1,0 ; div r0,r0,r1 ; halt
        let mut p = vec![0x01, 1, 0, 0, 0, 0];
        p.extend_from_slice(&[0x06, 0, 0, 1]);
        p.push(0x00);
        let mem = GuestMemory::new(64);
        mem.load_image(0, &p).unwrap();
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        let mut cpu = CpuState::new();
        let err = run_block(&block, &mut cpu, &mem).unwrap_err();
        assert_eq!(
            err,
            GuestTrap {
                pc: 6,
                cause: TrapCause::DivideByZero
            }
        );
    }

    #[test]
    fn div_min_by_minus_one_wraps() {
        // div r0,r0,r1 ; halt
        let p = vec![0x06, 0, 0, 1, 0x00];
        let (cpu, _) = run(&p, |cpu| {
            cpu.regs[0] = i64::MIN;
            cpu.regs[1] = -1;
        });
        assert_eq!(cpu.regs[0], i64::MIN);
        assert!(cpu.flags.negative);
    }

    #[test]
    fn load_store_and_memory_fault() {
        // st [r1+0],r0 ; ld r2,[r1+0] ; halt
        let mut p = vec![0x11, 1, 0, 0, 0, 0, 0];
        p.extend_from_slice(&[0x10, 2, 1, 0, 0, 0, 0]);
        p.push(0x00);
        let (cpu, mem) = run(&p, |cpu| {
            cpu.regs[0] = -77;
            cpu.regs[1] = 0x80;
        });
        assert_eq!(cpu.regs[2], -77);
        assert_eq!(mem.load_u64(0x80).unwrap() as i64, -77);

        // An out-of-range store is a guest trap.
        let mem = GuestMemory::new(64);
        mem.load_image(0, &[0x11, 1, 0, 0, 0, 0, 0, 0x00]).unwrap();
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        let mut cpu = CpuState::new();
        cpu.regs[1] = 4096;
        let err = run_block(&block, &mut cpu, &mem).unwrap_err();
        assert_eq!(
            err,
            GuestTrap {
                pc: 0,
                cause: TrapCause::MemoryFault { addr: 4096 }
            }
        );
    }

    #[test]
    fn call_links_and_ret_returns() {
        // call 0x20
        let (cpu, _) = run(&[0x24, 0x20, 0, 0, 0], |_| {});
        assert_eq!(cpu.pc, 0x20);
        assert_eq!(cpu.regs[LINK_REG], 5);

        // ret
        let (cpu, _) = run(&[0x25], |cpu| cpu.regs[LINK_REG] = 0x44);
        assert_eq!(cpu.pc, 0x44);
    }

    #[test]
    fn halt_sets_flag_and_advances_pc() {
        let (cpu, _) = run(&[0x00], |_| {});
        assert!(cpu.halted);
        assert_eq!(cpu.pc, 1);
    }
}
