//! `mf-runner`: headless execution of a graph or cartridge.
//!
//! Runs the program through an engine with a synthesized single-kernel
//! pipeline for the requested number of frames, then dumps every
//! register and the heap statistics.

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use mathflow::backend::CpuBackend;
use mathflow::engine::{Engine, EngineConfig};
use mathflow_cli::{dump_registers, load_program};

#[derive(StructOpt)]
#[structopt(name = "mf-runner", about = "MathFlow headless runner")]
struct Opt {
    /// Input graph (.json) or compiled cartridge (.mfc).
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Number of frames to execute.
    #[structopt(long = "frames", default_value = "1")]
    frames: u32,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let program = match load_program(&opt.input) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("mf-runner: {}", e);
            process::exit(1);
        }
    };
    println!(
        "loaded {}: {} instructions, {} registers, {} tasks",
        opt.input.display(),
        program.instructions.len(),
        program.register_count,
        program.tasks.len()
    );

    let desc = Engine::synthesize_pipeline(&program, "main");
    let mut engine = match Engine::new(&desc, vec![program], EngineConfig::default()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("mf-runner: {}", e);
            process::exit(1);
        }
    };

    println!("running {} frame(s)...", opt.frames);
    for frame in 0..opt.frames {
        if let Err(e) = engine.dispatch(&CpuBackend) {
            eprintln!("mf-runner: frame {}: {}", frame, e);
            process::exit(1);
        }
    }

    println!("--- registers ---");
    dump_registers(engine.kernels()[0].vm());

    let stats = engine.heap_stats();
    println!(
        "[heap] used: {}, peak: {}, allocations: {}",
        stats.used, stats.peak, stats.alloc_count
    );
}
