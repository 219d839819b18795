// bc2wasm - BC bytecode dynamic binary translator
//
// Runs a raw BC bytecode image, interpreting cold blocks and JIT-compiling
// hot ones to WebAssembly.
//
// Usage:
//   bc2wasm program.bin
//   bc2wasm program.bin --entry 0x40 --threshold 4 --verbose

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use bc2wasm::WasmJit;
use bcvm::{BlockLimits, Engine, EngineConfig, Exit, GuestMemory, DEFAULT_MEMORY_SIZE};

#[derive(Parser, Debug)]
#[command(name = "bc2wasm")]
#[command(about = "BC bytecode dynamic binary translator")]
#[command(version)]
struct Args {
    /// Raw guest program image, loaded at address 0
    input: PathBuf,

    /// Guest entry address
    #[arg(long, default_value_t = 0)]
    entry: u32,

    /// Interpreted executions before a block is compiled
    #[arg(long, default_value_t = 1)]
    threshold: u64,

    /// Maximum instructions per basic block
    #[arg(long, default_value_t = 4096)]
    max_block_insts: usize,

    /// Translation cache capacity in blocks
    #[arg(long, default_value_t = 64)]
    cache_capacity: usize,

    /// Guest memory size in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_SIZE)]
    mem_size: usize,

    /// Interpret everything; never compile
    #[arg(long)]
    no_jit: bool,

    /// Print final state and execution counters
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let image = std::fs::read(&args.input).context("Failed to read input image")?;

    let mem = GuestMemory::new(args.mem_size);
    mem.load_image(0, &image)
        .context("Failed to load image into guest memory")?;

    let config = EngineConfig {
        hot_threshold: args.threshold,
        limits: BlockLimits {
            max_insts: args.max_block_insts,
        },
        cache_capacity: args.cache_capacity,
    };

    let mut engine = Engine::new(mem.clone(), config);
    if !args.no_jit {
        let jit = WasmJit::new(mem).context("Failed to initialize wasm backend")?;
        engine = engine.with_compiler(Box::new(jit));
    }

    let exit = engine.run(args.entry);

    if args.verbose {
        eprintln!("{}", engine.cpu());
        let stats = engine.stats();
        eprintln!(
            "blocks: {} built, {} compiled, {} uncompilable",
            stats.blocks_built, stats.blocks_compiled, stats.compile_failures
        );
        eprintln!(
            "runs: {} interpreted, {} native, {} invalidations",
            stats.interp_runs, stats.native_runs, stats.invalidations
        );
    }

    match exit {
        Exit::Halted => Ok(()),
        Exit::Interrupted => bail!("execution interrupted"),
        Exit::Faulted(fault) => bail!("guest fault: {fault}"),
    }
}
