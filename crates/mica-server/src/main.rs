use std::net::SocketAddr;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mica_server::{Server, ServerConfig};
use mica_table::EngineMode;

#[derive(Parser)]
#[command(name = "micad")]
#[command(version, about = "Mica in-memory cache daemon", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:11211", env = "MICA_LISTEN")]
    listen: SocketAddr,

    /// Total cache volume in bytes, split across partitions.
    #[arg(long, default_value_t = 64 * 1024 * 1024, env = "MICA_VOLUME")]
    volume: usize,

    /// Desired partition count, rounded down to a power of two.
    #[arg(long, default_value_t = 8, env = "MICA_PARTITIONS")]
    partitions: usize,

    /// Partition concurrency engine: combiner, delegate or locking.
    #[arg(long, default_value = "combiner", value_parser = parse_engine, env = "MICA_ENGINE")]
    engine: EngineMode,

    /// Number of runtimes; defaults to one per available CPU.
    #[arg(long, default_value_t = 0, env = "MICA_CORES")]
    cores: usize,

    /// Comma-separated CPU indices to pin runtimes to, e.g. "0,2,4".
    #[arg(long, env = "MICA_AFFINITY")]
    affinity: Option<String>,

    /// Worker pool cap per runtime.
    #[arg(long, default_value_t = 256)]
    workers_max: u32,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(long, conflicts_with = "verbose")]
    warning: bool,
}

fn parse_engine(s: &str) -> Result<EngineMode, String> {
    s.parse()
}

fn parse_affinity(s: &str) -> anyhow::Result<Vec<usize>> {
    s.split(',')
        .map(|part| part.trim().parse::<usize>().context("bad CPU index"))
        .collect()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.warning {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    let affinity = cli.affinity.as_deref().map(parse_affinity).transpose()?;

    let server = Server::start(ServerConfig {
        listen: cli.listen,
        volume: cli.volume,
        partitions: cli.partitions,
        engine: cli.engine,
        ncores: cli.cores,
        affinity,
        workers_max: cli.workers_max,
    })?;

    info!(addr = %server.local_addr(), "ready");

    // No graceful-shutdown surface: the cache holds no persisted state,
    // so termination by signal is fine.
    loop {
        std::thread::park();
    }
}
