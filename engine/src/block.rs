// block.rs - Basic block discovery
//
// Walks the decoder forward from a start address until the first
// control-flow-terminating instruction. Blocks are discovered lazily the
// first time the dispatcher lands on an address; there is no whole-image
// control flow graph in a dynamic translator.

use crate::decode::{self, DecodeError, Flow, Instruction, Op};
use crate::mem::GuestMemory;

/// Safety valve for block discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    /// Maximum instruction count per block. Exceeding it means the
    /// decoder failed to find a terminator, which is a host bug, and the
    /// builder aborts.
    pub max_insts: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self { max_insts: 4096 }
    }
}

/// A straight-line instruction sequence with one entry and one
/// terminating exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Guest address of the first instruction.
    pub start: u32,
    /// Guest address one past the last encoded byte.
    pub end: u32,
    /// Instructions in order; the last one is the terminator.
    pub instructions: Vec<Instruction>,
    /// Statically known successor addresses: empty for HALT and
    /// dynamic-target branches, one for JMP/CALL, two (target then
    /// fall-through) for conditional branches.
    pub successors: Vec<u32>,
}

impl BasicBlock {
    /// The control-flow instruction that ends this block.
    pub fn terminator(&self) -> &Instruction {
        self.instructions.last().expect("block is never empty")
    }

    /// Does the byte range of this block intersect `[start, start+len)`?
    pub fn overlaps(&self, range: &std::ops::Range<u32>) -> bool {
        range.start < self.end && self.start < range.end
    }
}

/// Compute the statically known successors of a terminator.
fn successors(inst: &Instruction) -> Vec<u32> {
    match inst.op {
        Op::Jmp { target } | Op::Call { target } => vec![target],
        Op::Jz { target } | Op::Jnz { target } => vec![target, inst.next_addr()],
        // Register-indirect targets are resolved from guest state at the
        // next dispatch step.
        Op::Jr { .. } | Op::Ret => Vec::new(),
        Op::Halt => Vec::new(),
        _ => vec![inst.next_addr()],
    }
}

/// Build the basic block starting at `start`. Decodes until the first
/// terminator, propagating decode failures.
pub fn build_block(
    mem: &GuestMemory,
    start: u32,
    limits: BlockLimits,
) -> Result<BasicBlock, DecodeError> {
    let mut instructions = Vec::new();
    let mut addr = start;

    loop {
        if instructions.len() >= limits.max_insts {
            panic!(
                "basic block at {start:#x} exceeded {} instructions without a terminator",
                limits.max_insts
            );
        }

        let inst = decode::decode(mem, addr)?;
        addr = inst.next_addr();
        let done = inst.op.is_terminator();
        instructions.push(inst);
        if done {
            break;
        }
    }

    let term = instructions[instructions.len() - 1];
    debug_assert!(instructions[..instructions.len() - 1]
        .iter()
        .all(|i| i.op.flow() == Flow::Sequential));

    Ok(BasicBlock {
        start,
        end: addr,
        successors: successors(&term),
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(bytes: &[u8]) -> GuestMemory {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        mem
    }

    // movi r0,5 ; addi r0,r0,1 ; jmp 0
    fn hot_loop() -> Vec<u8> {
        let mut p = vec![0x01, 0, 5, 0, 0, 0];
        p.extend_from_slice(&[0x07, 0, 0, 1, 0, 0, 0]);
        p.extend_from_slice(&[0x20, 0, 0, 0, 0]);
        p
    }

    #[test]
    fn stops_at_first_terminator() {
        let mem = memory_with(&hot_loop());
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(block.start, 0);
        assert_eq!(block.end, 18);
        assert_eq!(block.terminator().op, Op::Jmp { target: 0 });
        assert_eq!(block.successors, vec![0]);
        // No internal terminators.
        assert!(block.instructions[..2].iter().all(|i| !i.op.is_terminator()));
    }

    #[test]
    fn conditional_branch_has_two_successors() {
        // cmp r0,r1 ; jz 0x30
        let mem = memory_with(&[0x0b, 0, 1, 0x21, 0x30, 0, 0, 0]);
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        assert_eq!(block.successors, vec![0x30, 8]);
    }

    #[test]
    fn dynamic_target_has_no_static_successor() {
        let mem = memory_with(&[0x23, 4]); // jr r4
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        assert!(block.successors.is_empty());

        let mem = memory_with(&[0x25]); // ret
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        assert!(block.successors.is_empty());
    }

    #[test]
    fn halt_terminates_with_no_successor() {
        let mem = memory_with(&[0x00]);
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        assert_eq!(block.instructions.len(), 1);
        assert!(block.successors.is_empty());
    }

    #[test]
    fn decode_failure_propagates() {
        let mem = memory_with(&[0x02, 0, 1, 0x7f]); // mov r0,r1 ; <junk>
        assert_eq!(
            build_block(&mem, 0, BlockLimits::default()),
            Err(DecodeError::InvalidEncoding { addr: 3, byte: 0x7f })
        );
    }

    #[test]
    #[should_panic(expected = "exceeded 4 instructions")]
    fn runaway_block_aborts() {
        // An endless run of movs with no terminator in range.
        let mut bytes = Vec::new();
        for _ in 0..8 {
            bytes.extend_from_slice(&[0x02, 0, 1]);
        }
        let mem = memory_with(&bytes);
        let _ = build_block(&mem, 0, BlockLimits { max_insts: 4 });
    }
}
