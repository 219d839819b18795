// builder.rs - Wasm binary generation
//
// Assembles one compiled block into a complete wasm module using
// wasm-encoder: host-helper imports, one page of scratch memory for the
// register file, and the exported block function.

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, MemArg, MemorySection, MemoryType, Module, TypeSection, ValType,
};

use crate::abi;
use crate::translate::{IfType, WasmOp, NUM_LOCALS};

fn mem_arg(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 3,
        memory_index: 0,
    }
}

fn encode(op: &WasmOp) -> Instruction<'static> {
    match *op {
        WasmOp::I32Const(v) => Instruction::I32Const(v),
        WasmOp::I64Const(v) => Instruction::I64Const(v),
        WasmOp::LocalGet(i) => Instruction::LocalGet(i),
        WasmOp::LocalSet(i) => Instruction::LocalSet(i),
        WasmOp::LocalTee(i) => Instruction::LocalTee(i),
        WasmOp::I64Load { offset } => Instruction::I64Load(mem_arg(offset)),
        WasmOp::I64Store { offset } => Instruction::I64Store(mem_arg(offset)),
        WasmOp::I64Add => Instruction::I64Add,
        WasmOp::I64Sub => Instruction::I64Sub,
        WasmOp::I64Mul => Instruction::I64Mul,
        WasmOp::I64DivS => Instruction::I64DivS,
        WasmOp::I64And => Instruction::I64And,
        WasmOp::I64Or => Instruction::I64Or,
        WasmOp::I64Xor => Instruction::I64Xor,
        WasmOp::I64Shl => Instruction::I64Shl,
        WasmOp::I64Eqz => Instruction::I64Eqz,
        WasmOp::I64Eq => Instruction::I64Eq,
        WasmOp::I64LtS => Instruction::I64LtS,
        WasmOp::I32And => Instruction::I32And,
        WasmOp::I32WrapI64 => Instruction::I32WrapI64,
        WasmOp::I64ExtendI32U => Instruction::I64ExtendI32U,
        WasmOp::Select => Instruction::Select,
        WasmOp::If(IfType::Empty) => Instruction::If(BlockType::Empty),
        WasmOp::If(IfType::ResultI64) => Instruction::If(BlockType::Result(ValType::I64)),
        WasmOp::Else => Instruction::Else,
        WasmOp::End => Instruction::End,
        WasmOp::Call(f) => Instruction::Call(f),
        WasmOp::Unreachable => Instruction::Unreachable,
    }
}

/// Build the wasm module for one lowered block body.
pub fn build_module(body: &[WasmOp]) -> Vec<u8> {
    let mut module = Module::new();

    // Types: 0 = mem_load, 1 = mem_store, 2 = guest_trap, 3 = block fn.
    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I64, ValType::I64], vec![ValType::I64]);
    types
        .ty()
        .function(vec![ValType::I64, ValType::I64, ValType::I64], vec![]);
    types
        .ty()
        .function(vec![ValType::I64, ValType::I32], vec![]);
    types.ty().function(vec![], vec![ValType::I64]);
    module.section(&types);

    // Host helper imports; indices fixed by declaration order (abi.rs).
    let mut imports = ImportSection::new();
    imports.import(abi::IMPORT_MODULE, abi::IMPORT_MEM_LOAD, EntityType::Function(0));
    imports.import(abi::IMPORT_MODULE, abi::IMPORT_MEM_STORE, EntityType::Function(1));
    imports.import(abi::IMPORT_MODULE, abi::IMPORT_GUEST_TRAP, EntityType::Function(2));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(3);
    module.section(&functions);

    // One private page holds the register file.
    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(1),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export(abi::EXPORT_BLOCK_FN, ExportKind::Func, abi::FN_BLOCK);
    exports.export(abi::EXPORT_MEMORY, ExportKind::Memory, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut func = Function::new([(NUM_LOCALS, ValType::I64)]);
    for op in body {
        func.instruction(&encode(op));
    }
    func.instruction(&Instruction::End);
    codes.function(&func);
    module.section(&codes);

    module.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::translate_block;
    use bcvm::{block::build_block, BlockLimits, GuestMemory};

    fn module_for(bytes: &[u8]) -> Vec<u8> {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        let block = build_block(&mem, 0, BlockLimits::default()).unwrap();
        build_module(&translate_block(&block).unwrap())
    }

    #[test]
    fn emitted_modules_validate() {
        // One module per terminator class, plus ALU/memory traffic.
        let programs: &[&[u8]] = &[
            &[0x00],
            &[0x20, 0, 0, 0, 0],
            &[0x0b, 0, 1, 0x21, 0x40, 0, 0, 0],
            &[0x06, 0, 0, 1, 0x25],
            &[0x24, 0x20, 0, 0, 0],
            &[0x10, 2, 1, 8, 0, 0, 0, 0x11, 1, 2, 8, 0, 0, 0, 0x23, 2],
        ];
        for p in programs {
            let wasm = module_for(p);
            wasmparser::validate(&wasm).expect("generated module must validate");
        }
    }

    #[test]
    fn module_exports_block_and_memory() {
        let wasm = module_for(&[0x00]);
        let mut saw_block = false;
        let mut saw_memory = false;
        for payload in wasmparser::Parser::new(0).parse_all(&wasm) {
            if let wasmparser::Payload::ExportSection(reader) = payload.unwrap() {
                for export in reader {
                    let export = export.unwrap();
                    match export.name {
                        "block" => saw_block = true,
                        "memory" => saw_memory = true,
                        _ => {}
                    }
                }
            }
        }
        assert!(saw_block && saw_memory);
    }
}
