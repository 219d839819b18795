// dispatch.rs - Dispatch loop
//
// The single driver of execution. Per step: look up (or build) the
// translation block for the current pc, invoke its compiled routine if
// one is installed, otherwise interpret it and run the hotness
// bookkeeping that triggers compilation. All guest state and cache
// mutation happens inside a step; the stop signal is only honored at
// block boundaries so a partially executed block can never be observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::block::BlockLimits;
use crate::cache::TranslationCache;
use crate::compiler::{BlockCompiler, Routine as _};
use crate::cpu::{CpuState, GuestTrap};
use crate::decode::DecodeError;
use crate::interp;
use crate::mem::GuestMemory;

/// Tunables supplied by the driver.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Interpreted executions before a block is compiled. The default of
    /// 1 compiles after the first interpreted run, so the second visit
    /// already executes natively.
    pub hot_threshold: u64,
    pub limits: BlockLimits,
    /// Translation cache capacity in blocks.
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 1,
            limits: BlockLimits::default(),
            cache_capacity: 64,
        }
    }
}

/// Execution counters, surfaced to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub blocks_built: usize,
    pub blocks_compiled: usize,
    pub compile_failures: usize,
    pub interp_runs: u64,
    pub native_runs: u64,
    pub invalidations: usize,
}

/// An unrecovered guest-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Trap(#[from] GuestTrap),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The guest executed HALT.
    Halted,
    /// The external stop signal was raised.
    Interrupted,
    /// The guest faulted and the driver gets to decide what that means.
    Faulted(Fault),
}

/// The translation engine: one guest context plus its translation cache
/// and optional compiler backend.
pub struct Engine {
    cpu: CpuState,
    mem: GuestMemory,
    cache: TranslationCache,
    compiler: Option<Box<dyn BlockCompiler>>,
    config: EngineConfig,
    stats: EngineStats,
    stop: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(mem: GuestMemory, config: EngineConfig) -> Self {
        Self {
            cpu: CpuState::new(),
            mem,
            cache: TranslationCache::new(config.cache_capacity),
            compiler: None,
            config,
            stats: EngineStats::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a compiler backend. Without one the engine interprets
    /// everything, which is always correct, only slower.
    pub fn with_compiler(mut self, compiler: Box<dyn BlockCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Handle the driver can raise from another thread (or a signal
    /// handler) to request termination at the next block boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run from `entry` until halt, interruption, or fault.
    pub fn run(&mut self, entry: u32) -> Exit {
        self.cpu.pc = entry;
        self.cpu.halted = false;
        info!("starting guest execution at {entry:#x}");

        loop {
            if self.stop.load(Ordering::Relaxed) {
                debug!("stop signal raised, leaving at block boundary");
                return Exit::Interrupted;
            }
            if self.cpu.halted {
                info!("guest halted, {}", self.cpu);
                return Exit::Halted;
            }
            if let Err(fault) = self.step() {
                warn!("guest faulted: {fault}");
                return Exit::Faulted(fault);
            }
        }
    }

    /// One dispatch step: exactly one basic block executes, by whichever
    /// path the cache dictates.
    fn step(&mut self) -> Result<(), Fault> {
        let pc = self.cpu.pc;
        let known = self.cache.contains(pc);
        let entry = self
            .cache
            .get_or_create(pc, &self.mem, self.config.limits)?;
        if !known {
            self.stats.blocks_built += 1;
        }

        if let Some(routine) = entry.routine.as_mut() {
            debug!("invoking compiled block at {pc:#x}");
            routine.invoke(&mut self.cpu)?;
            self.stats.native_runs += 1;
        } else {
            interp::run_block(&entry.block, &mut self.cpu, &self.mem)?;
            self.stats.interp_runs += 1;

            let count = entry.record_execution();
            if count >= self.config.hot_threshold && !entry.compile_failed {
                if let Some(compiler) = self.compiler.as_deref_mut() {
                    match compiler.compile(&entry.block) {
                        Ok(routine) => {
                            debug!("block at {pc:#x} went native after {count} executions");
                            entry.install_routine(routine);
                            self.stats.blocks_compiled += 1;
                        }
                        Err(err) => {
                            warn!("cannot compile block at {pc:#x}, staying interpreted: {err}");
                            entry.compile_failed = true;
                            self.stats.compile_failures += 1;
                        }
                    }
                }
            }
        }

        // Self-modifying code: any store this block performed kills the
        // translations it overlaps before the next dispatch.
        for range in self.mem.take_written_ranges() {
            self.stats.invalidations += self.cache.invalidate_overlapping(&range);
        }

        Ok(())
    }
}
