//! ctstress - multi-threaded stress harness for the cachetable
//!
//! Runs random read and write pins from several threads over one block
//! file while the evictor, checkpointer and cleaner run, then closes
//! everything and verifies the on-disk image.

mod workload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cachetable::{Cachetable, CachetableConfig};
use clap::Parser;
use ftdisk::{LogFile, OpenFlags};
use tracing::info;

use crate::workload::{CounterBlocks, Workload};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for the block file and checkpoint log
    #[arg(short, long, default_value = "./ctstress-data")]
    dir: PathBuf,

    /// Cachetable memory budget in bytes (overrides the config file)
    #[arg(short, long)]
    size_limit: Option<usize>,

    /// Client threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Operations per thread
    #[arg(short, long, default_value_t = 100_000)]
    ops: u64,

    /// Distinct blocks
    #[arg(short, long, default_value_t = 1024)]
    blocks: u64,

    /// Periodic checkpoint interval (overrides the config file)
    #[arg(long)]
    checkpoint_ms: Option<u64>,

    /// One operation in N is a write pin
    #[arg(long, default_value_t = 4)]
    write_every: u32,

    /// RNG seed (random if not given)
    #[arg(long)]
    seed: Option<u64>,

    /// JSON cachetable configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<CachetableConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CachetableConfig {
            size_limit: 1 << 20,
            checkpoint_period_ms: 200,
            cleaner_period_ms: 0,
            ..CachetableConfig::default()
        },
    };
    if let Some(size_limit) = args.size_limit {
        config.size_limit = size_limit;
    }
    if let Some(checkpoint_ms) = args.checkpoint_ms {
        config.checkpoint_period_ms = checkpoint_ms;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    anyhow::ensure!(args.blocks > 0, "--blocks must be positive");
    anyhow::ensure!(args.threads > 0, "--threads must be positive");

    info!("Starting ctstress v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", args.dir.display());
    info!(
        "Size limit: {} bytes, {} threads x {} ops over {} blocks",
        config.size_limit, args.threads, args.ops, args.blocks
    );

    // Start from a fresh block file and log
    std::fs::create_dir_all(&args.dir)?;
    let path = args.dir.join("stress.ft");
    let log_dir = args.dir.join("log");
    for stale in [path.clone(), path.with_extension("ft.idx")] {
        if stale.exists() {
            std::fs::remove_file(&stale).with_context(|| format!("removing {}", stale.display()))?;
        }
    }
    if log_dir.exists() {
        std::fs::remove_dir_all(&log_dir).with_context(|| format!("removing {}", log_dir.display()))?;
    }

    let log = Arc::new(LogFile::open(&log_dir).context("opening checkpoint log")?);
    let ct = Cachetable::with_log(config, log.clone())?;
    let file = ct.open_file(&path, OpenFlags::CREATE, Arc::new(CounterBlocks))?;

    let workload = Workload {
        threads: args.threads,
        ops: args.ops,
        blocks: args.blocks,
        write_every: args.write_every,
        seed: args.seed.unwrap_or_else(|| fastrand::u64(..)),
    };
    info!("Seed: {}", workload.seed);

    let (writes, mut report) = workload::run(&ct, &file, &workload)?;
    file.close(false).context("closing block file")?;
    ct.close()?;
    info!(
        "Closed; last checkpoint {:?}, log durable to {}",
        log.last_checkpoint(),
        log.durable_lsn()
    );

    report.verified_blocks = workload::verify(&path, &writes)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
