use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vmsim::{Config, VmSim, PAGESIZE};

#[derive(Parser, Debug)]
#[command(name = "vmsim")]
#[command(about = "Run a paging workload against the vmsim engine", long_about = None)]
struct Args {
    /// Real-memory arena size in bytes (overrides VMSIM_REAL_MEM_SIZE)
    #[arg(long)]
    real_mem_size: Option<u32>,

    /// Keep the backing store at this path instead of an anonymous memfd
    #[arg(long)]
    store: Option<PathBuf>,

    /// Number of simulated pages in the working set
    #[arg(short, long, default_value_t = 64)]
    pages: u32,

    /// Number of random touches to perform
    #[arg(short, long, default_value_t = 4096)]
    iters: u32,

    /// Seed for the workload's RNG
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if args.pages == 0 {
        bail!("the working set needs at least one page");
    }

    let mut config = match args.real_mem_size {
        Some(size) => Config::with_real_size(size)?,
        None => Config::from_env()?,
    };
    if let Some(path) = &args.store {
        config = config.store_at(path);
    }

    let span = args
        .pages
        .checked_mul(PAGESIZE)
        .context("working set exceeds the simulated address space")?;
    let mut vm = VmSim::new(config).context("failed to bring up the engine")?;
    let base = vm.alloc(span);
    info!(
        pages = args.pages,
        iters = args.iters,
        base = format_args!("{base:#010x}"),
        "workload starting"
    );

    // Random single-page writes, tracked so every read-back is checkable.
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut shadow: Vec<Option<u8>> = vec![None; args.pages as usize];
    let mut buf = vec![0u8; PAGESIZE as usize];

    for i in 0..args.iters {
        let page = rng.gen_range(0..args.pages);
        let addr = base + page * PAGESIZE;
        if rng.gen_bool(0.5) {
            let byte = rng.gen::<u8>();
            buf.fill(byte);
            vm.write(addr, &buf);
            shadow[page as usize] = Some(byte);
        } else {
            vm.read(addr, &mut buf);
            let want = shadow[page as usize].unwrap_or(0);
            if buf.iter().any(|&b| b != want) {
                bail!("page {page} read back the wrong contents at iteration {i}");
            }
        }
        if i % 1024 == 0 {
            debug!(i, "workload progress");
        }
    }

    // Full sweep: every page must still hold its last written byte.
    for (page, want) in shadow.iter().enumerate() {
        let addr = base + page as u32 * PAGESIZE;
        vm.read(addr, &mut buf);
        let want = want.unwrap_or(0);
        if buf.iter().any(|&b| b != want) {
            bail!("page {page} lost its contents in the final sweep");
        }
    }

    let stats = vm.stats();
    info!(
        faults = stats.faults,
        lower_tables = stats.lower_tables,
        frames_bumped = stats.frames_bumped,
        evictions = stats.evictions,
        fetches = stats.fetches,
        "workload verified"
    );
    Ok(())
}
