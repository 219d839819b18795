// runtime.rs - Compiled block execution via wasmtime
//
// `WasmJit` implements the engine's compiler boundary: lower the block,
// encode a module, instantiate it, and hand the engine a routine that
// owns the instance. Each invocation copies the register file into the
// module's scratch memory, calls the block function, and copies the
// result back; guest RAM is shared through the host-helper imports, so
// it is never copied.
//
// Guest faults raised inside compiled code (divide by zero, out-of-range
// access) are recorded in the store context by the host helpers and then
// surface as a wasm trap, which `invoke` converts back into the same
// `GuestTrap` the interpreter would have produced.

use log::debug;
use wasmtime::{Caller, Linker, Memory, Module, Store, TypedFunc};

use bcvm::{
    BasicBlock, BlockCompiler, CompileError, CpuState, GuestMemory, GuestTrap, Routine, TrapCause,
    NUM_REGS,
};

use crate::abi;
use crate::builder;
use crate::translate;

/// Host-side context visible to the generated code's imports.
struct JitCtx {
    mem: GuestMemory,
    /// Set by a host helper just before it raises a wasm trap.
    trap: Option<GuestTrap>,
}

/// WebAssembly compiler backend for the translation engine.
pub struct WasmJit {
    engine: wasmtime::Engine,
    linker: Linker<JitCtx>,
    mem: GuestMemory,
}

impl WasmJit {
    /// Create a backend bound to the guest address space that its
    /// compiled code will read and write.
    pub fn new(mem: GuestMemory) -> anyhow::Result<Self> {
        let engine = wasmtime::Engine::default();
        let mut linker: Linker<JitCtx> = Linker::new(&engine);

        linker.func_wrap(
            abi::IMPORT_MODULE,
            abi::IMPORT_MEM_LOAD,
            |mut caller: Caller<'_, JitCtx>, pc: i64, addr: i64| -> wasmtime::Result<i64> {
                let ctx = caller.data_mut();
                match ctx.mem.load_u64(addr) {
                    Ok(v) => Ok(v as i64),
                    Err(cause) => {
                        ctx.trap = Some(GuestTrap {
                            pc: pc as u32,
                            cause,
                        });
                        Err(wasmtime::Error::msg("guest memory fault"))
                    }
                }
            },
        )?;

        linker.func_wrap(
            abi::IMPORT_MODULE,
            abi::IMPORT_MEM_STORE,
            |mut caller: Caller<'_, JitCtx>, pc: i64, addr: i64, val: i64| -> wasmtime::Result<()> {
                let ctx = caller.data_mut();
                match ctx.mem.store_u64(addr, val as u64) {
                    Ok(()) => Ok(()),
                    Err(cause) => {
                        ctx.trap = Some(GuestTrap {
                            pc: pc as u32,
                            cause,
                        });
                        Err(wasmtime::Error::msg("guest memory fault"))
                    }
                }
            },
        )?;

        linker.func_wrap(
            abi::IMPORT_MODULE,
            abi::IMPORT_GUEST_TRAP,
            |mut caller: Caller<'_, JitCtx>, pc: i64, cause: i32| -> wasmtime::Result<()> {
                debug_assert_eq!(cause, abi::CAUSE_DIV_BY_ZERO);
                caller.data_mut().trap = Some(GuestTrap {
                    pc: pc as u32,
                    cause: TrapCause::DivideByZero,
                });
                Err(wasmtime::Error::msg("guest trap"))
            },
        )?;

        Ok(Self { engine, linker, mem })
    }
}

impl BlockCompiler for WasmJit {
    fn compile(&mut self, block: &BasicBlock) -> Result<Box<dyn Routine>, CompileError> {
        let body = translate::translate_block(block)?;
        let bytes = builder::build_module(&body);

        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        let mut store = Store::new(
            &self.engine,
            JitCtx {
                mem: self.mem.clone(),
                trap: None,
            },
        );
        let instance = self
            .linker
            .instantiate(&mut store, &module)
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        let func = instance
            .get_typed_func::<(), i64>(&mut store, abi::EXPORT_BLOCK_FN)
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        let memory = instance
            .get_memory(&mut store, abi::EXPORT_MEMORY)
            .ok_or_else(|| CompileError::Backend("generated module exports no memory".into()))?;

        debug!(
            "compiled block {:#x}..{:#x} into {} bytes of wasm",
            block.start,
            block.end,
            bytes.len()
        );

        Ok(Box::new(WasmRoutine {
            store,
            memory,
            func,
        }))
    }
}

/// One compiled basic block, owning its instantiated module.
struct WasmRoutine {
    store: Store<JitCtx>,
    memory: Memory,
    func: TypedFunc<(), i64>,
}

impl WasmRoutine {
    fn write_state(&mut self, cpu: &CpuState) {
        let mut state = [0u8; abi::STATE_SIZE];
        for (i, reg) in cpu.regs.iter().enumerate() {
            state[i * 8..(i + 1) * 8].copy_from_slice(&reg.to_le_bytes());
        }
        let mut flags = 0u64;
        if cpu.flags.zero {
            flags |= abi::FLAG_ZERO;
        }
        if cpu.flags.negative {
            flags |= abi::FLAG_NEGATIVE;
        }
        if cpu.halted {
            flags |= abi::FLAG_HALTED;
        }
        state[abi::FLAGS_OFFSET as usize..].copy_from_slice(&flags.to_le_bytes());

        self.memory
            .write(&mut self.store, 0, &state)
            .expect("register file stays within the scratch page");
    }

    /// Copy registers and flags back out of the scratch memory. The pc
    /// is not part of the copy: on success it comes from the function's
    /// return value, and on a guest fault it stays where it was, exactly
    /// as the interpreter leaves it.
    fn read_state(&mut self, cpu: &mut CpuState) {
        let mut state = [0u8; abi::STATE_SIZE];
        self.memory
            .read(&self.store, 0, &mut state)
            .expect("register file stays within the scratch page");
        for i in 0..NUM_REGS {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&state[i * 8..(i + 1) * 8]);
            cpu.regs[i] = i64::from_le_bytes(buf);
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&state[abi::FLAGS_OFFSET as usize..]);
        let flags = u64::from_le_bytes(buf);
        cpu.flags.zero = flags & abi::FLAG_ZERO != 0;
        cpu.flags.negative = flags & abi::FLAG_NEGATIVE != 0;
        cpu.halted = flags & abi::FLAG_HALTED != 0;
    }
}

impl Routine for WasmRoutine {
    fn invoke(&mut self, cpu: &mut CpuState) -> Result<(), GuestTrap> {
        self.write_state(cpu);
        self.store.data_mut().trap = None;

        match self.func.call(&mut self.store, ()) {
            Ok(next_pc) => {
                self.read_state(cpu);
                cpu.pc = next_pc as u32;
                Ok(())
            }
            Err(err) => match self.store.data_mut().trap.take() {
                // Register writes before the fault already landed in the
                // scratch memory, so the faulting state is as precise as
                // the interpreter's.
                Some(trap) => {
                    self.read_state(cpu);
                    Err(trap)
                }
                // A trap without a recorded guest fault means the
                // generated code itself is broken.
                None => panic!("compiled block trapped without a guest fault: {err}"),
            },
        }
    }
}
