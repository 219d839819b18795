// translate.rs - Basic block to wasm IR lowering
//
// Lowers one decoded basic block to a flat sequence of wasm
// instructions for the block function. The lowering mirrors the
// interpreter op for op; anywhere wasm semantics diverge from guest
// semantics (signed division traps) an explicit guard is emitted so the
// two execution paths stay observably identical.
//
// Register file access is an i64 load/store at a fixed offset of the
// module's scratch memory. Guest RAM access calls back into the host.

use bcvm::{BasicBlock, CompileError, Instruction, Op, LINK_REG};

use crate::abi;

/// Wasm instruction subset emitted by the lowering (intermediate form;
/// `builder` maps it 1:1 onto `wasm_encoder`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmOp {
    I32Const(i32),
    I64Const(i64),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    /// i64 load from scratch memory at a static offset.
    I64Load { offset: u64 },
    /// i64 store to scratch memory at a static offset.
    I64Store { offset: u64 },
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64Eqz,
    I64Eq,
    I64LtS,
    I32And,
    I32WrapI64,
    I64ExtendI32U,
    Select,
    If(IfType),
    Else,
    End,
    Call(u32),
    Unreachable,
}

/// Result arity of an emitted `if` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfType {
    Empty,
    ResultI64,
}

/// Scratch locals of the block function.
const TMP: u32 = 0;
const TMP2: u32 = 1;
pub const NUM_LOCALS: u32 = 2;

/// Lower `block` to the body of its block function. The emitted body
/// leaves the successor pc on the stack as the function result.
pub fn translate_block(block: &BasicBlock) -> Result<Vec<WasmOp>, CompileError> {
    let mut out = Vec::new();
    for inst in &block.instructions {
        lower(&mut out, inst);
    }
    Ok(out)
}

fn reg_load(out: &mut Vec<WasmOp>, r: u8) {
    out.push(WasmOp::I32Const(0));
    out.push(WasmOp::I64Load {
        offset: abi::reg_offset(r),
    });
}

/// Store the value produced by `value` into register `r`.
fn reg_store_with(out: &mut Vec<WasmOp>, r: u8, value: impl FnOnce(&mut Vec<WasmOp>)) {
    out.push(WasmOp::I32Const(0));
    value(out);
    out.push(WasmOp::I64Store {
        offset: abi::reg_offset(r),
    });
}

/// Update the flags word from the ALU result sitting in `TMP`.
fn flags_from_tmp(out: &mut Vec<WasmOp>) {
    out.push(WasmOp::I32Const(0));
    out.push(WasmOp::LocalGet(TMP));
    out.push(WasmOp::I64Eqz);
    out.push(WasmOp::I64ExtendI32U);
    out.push(WasmOp::LocalGet(TMP));
    out.push(WasmOp::I64Const(0));
    out.push(WasmOp::I64LtS);
    out.push(WasmOp::I64ExtendI32U);
    out.push(WasmOp::I64Const(1));
    out.push(WasmOp::I64Shl);
    out.push(WasmOp::I64Or);
    out.push(WasmOp::I64Store {
        offset: abi::FLAGS_OFFSET,
    });
}

/// rd = rs1 <op> rs2, flags updated.
fn alu_rrr(out: &mut Vec<WasmOp>, rd: u8, rs1: u8, rs2: u8, op: WasmOp) {
    reg_store_with(out, rd, |out| {
        reg_load(out, rs1);
        reg_load(out, rs2);
        out.push(op);
        out.push(WasmOp::LocalTee(TMP));
    });
    flags_from_tmp(out);
}

/// Push the Z bit of the flags word as an i32 select condition.
fn zero_flag_cond(out: &mut Vec<WasmOp>) {
    out.push(WasmOp::I32Const(0));
    out.push(WasmOp::I64Load {
        offset: abi::FLAGS_OFFSET,
    });
    out.push(WasmOp::I64Const(abi::FLAG_ZERO as i64));
    out.push(WasmOp::I64And);
    out.push(WasmOp::I32WrapI64);
}

fn lower(out: &mut Vec<WasmOp>, inst: &Instruction) {
    let pc = inst.addr;
    match inst.op {
        Op::Movi { rd, imm } => {
            reg_store_with(out, rd, |out| out.push(WasmOp::I64Const(imm)));
        }
        Op::Mov { rd, rs } => {
            reg_store_with(out, rd, |out| reg_load(out, rs));
        }
        Op::Add { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64Add),
        Op::Sub { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64Sub),
        Op::Mul { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64Mul),
        Op::And { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64And),
        Op::Or { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64Or),
        Op::Xor { rd, rs1, rs2 } => alu_rrr(out, rd, rs1, rs2, WasmOp::I64Xor),
        Op::Div { rd, rs1, rs2 } => {
            // Divisor into TMP2; zero raises the guest trap before any
            // state changes.
            reg_load(out, rs2);
            out.push(WasmOp::LocalSet(TMP2));
            out.push(WasmOp::LocalGet(TMP2));
            out.push(WasmOp::I64Eqz);
            out.push(WasmOp::If(IfType::Empty));
            out.push(WasmOp::I64Const(pc as i64));
            out.push(WasmOp::I32Const(abi::CAUSE_DIV_BY_ZERO));
            out.push(WasmOp::Call(abi::FN_GUEST_TRAP));
            out.push(WasmOp::Unreachable);
            out.push(WasmOp::End);

            // wasm div_s traps on MIN / -1; the guest wraps instead.
            reg_load(out, rs1);
            out.push(WasmOp::LocalSet(TMP));
            reg_store_with(out, rd, |out| {
                out.push(WasmOp::LocalGet(TMP));
                out.push(WasmOp::I64Const(i64::MIN));
                out.push(WasmOp::I64Eq);
                out.push(WasmOp::LocalGet(TMP2));
                out.push(WasmOp::I64Const(-1));
                out.push(WasmOp::I64Eq);
                out.push(WasmOp::I32And);
                out.push(WasmOp::If(IfType::ResultI64));
                out.push(WasmOp::I64Const(i64::MIN));
                out.push(WasmOp::Else);
                out.push(WasmOp::LocalGet(TMP));
                out.push(WasmOp::LocalGet(TMP2));
                out.push(WasmOp::I64DivS);
                out.push(WasmOp::End);
                out.push(WasmOp::LocalTee(TMP));
            });
            flags_from_tmp(out);
        }
        Op::Addi { rd, rs, imm } => {
            reg_store_with(out, rd, |out| {
                reg_load(out, rs);
                out.push(WasmOp::I64Const(imm));
                out.push(WasmOp::I64Add);
                out.push(WasmOp::LocalTee(TMP));
            });
            flags_from_tmp(out);
        }
        Op::Cmp { rs1, rs2 } => {
            reg_load(out, rs1);
            reg_load(out, rs2);
            out.push(WasmOp::I64Sub);
            out.push(WasmOp::LocalSet(TMP));
            flags_from_tmp(out);
        }
        Op::Ld { rd, rs, imm } => {
            reg_store_with(out, rd, |out| {
                out.push(WasmOp::I64Const(pc as i64));
                reg_load(out, rs);
                out.push(WasmOp::I64Const(imm));
                out.push(WasmOp::I64Add);
                out.push(WasmOp::Call(abi::FN_MEM_LOAD));
            });
        }
        Op::St { rs1, rs2, imm } => {
            out.push(WasmOp::I64Const(pc as i64));
            reg_load(out, rs1);
            out.push(WasmOp::I64Const(imm));
            out.push(WasmOp::I64Add);
            reg_load(out, rs2);
            out.push(WasmOp::Call(abi::FN_MEM_STORE));
        }
        Op::Halt => {
            out.push(WasmOp::I32Const(0));
            out.push(WasmOp::I32Const(0));
            out.push(WasmOp::I64Load {
                offset: abi::FLAGS_OFFSET,
            });
            out.push(WasmOp::I64Const(abi::FLAG_HALTED as i64));
            out.push(WasmOp::I64Or);
            out.push(WasmOp::I64Store {
                offset: abi::FLAGS_OFFSET,
            });
            out.push(WasmOp::I64Const(inst.next_addr() as i64));
        }
        Op::Jmp { target } => out.push(WasmOp::I64Const(target as i64)),
        Op::Jz { target } => {
            out.push(WasmOp::I64Const(target as i64));
            out.push(WasmOp::I64Const(inst.next_addr() as i64));
            zero_flag_cond(out);
            out.push(WasmOp::Select);
        }
        Op::Jnz { target } => {
            out.push(WasmOp::I64Const(inst.next_addr() as i64));
            out.push(WasmOp::I64Const(target as i64));
            zero_flag_cond(out);
            out.push(WasmOp::Select);
        }
        Op::Jr { rs } => reg_load(out, rs),
        Op::Call { target } => {
            reg_store_with(out, LINK_REG as u8, |out| {
                out.push(WasmOp::I64Const(inst.next_addr() as i64));
            });
            out.push(WasmOp::I64Const(target as i64));
        }
        Op::Ret => reg_load(out, LINK_REG as u8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcvm::{block::build_block, BlockLimits, GuestMemory};

    fn block_of(bytes: &[u8]) -> BasicBlock {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        build_block(&mem, 0, BlockLimits::default()).unwrap()
    }

    #[test]
    fn jmp_lowers_to_constant_successor() {
        let ops = translate_block(&block_of(&[0x20, 0x34, 0x12, 0, 0])).unwrap();
        assert_eq!(ops, vec![WasmOp::I64Const(0x1234)]);
    }

    #[test]
    fn conditional_branch_uses_select_on_zero_flag() {
        // cmp r0,r1 ; jz 0x40
        let ops = translate_block(&block_of(&[0x0b, 0, 1, 0x21, 0x40, 0, 0, 0])).unwrap();
        assert!(ops.contains(&WasmOp::Select));
        // Both successors appear as constants: target and fall-through.
        assert!(ops.contains(&WasmOp::I64Const(0x40)));
        assert!(ops.contains(&WasmOp::I64Const(8)));
    }

    #[test]
    fn div_emits_trap_guard() {
        let ops = translate_block(&block_of(&[0x06, 0, 0, 1, 0x00])).unwrap();
        assert!(ops.contains(&WasmOp::Call(abi::FN_GUEST_TRAP)));
        assert!(ops.contains(&WasmOp::Unreachable));
        // The MIN / -1 guard selects the wrapped quotient.
        assert!(ops.contains(&WasmOp::If(IfType::ResultI64)));
    }

    #[test]
    fn memory_ops_call_host_helpers() {
        // ld r2,[r1+8] ; st [r1+8],r2 ; halt
        let mut p = vec![0x10, 2, 1, 8, 0, 0, 0];
        p.extend_from_slice(&[0x11, 1, 2, 8, 0, 0, 0]);
        p.push(0x00);
        let ops = translate_block(&block_of(&p)).unwrap();
        assert!(ops.contains(&WasmOp::Call(abi::FN_MEM_LOAD)));
        assert!(ops.contains(&WasmOp::Call(abi::FN_MEM_STORE)));
    }

    #[test]
    fn call_links_return_address() {
        let ops = translate_block(&block_of(&[0x24, 0x20, 0, 0, 0])).unwrap();
        assert!(ops.contains(&WasmOp::I64Store {
            offset: abi::reg_offset(LINK_REG as u8)
        }));
        // Return address (5) and target (0x20) both materialize.
        assert!(ops.contains(&WasmOp::I64Const(5)));
        assert_eq!(ops.last(), Some(&WasmOp::I64Const(0x20)));
    }
}
