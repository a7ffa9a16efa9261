use anyhow::Result;
use clap::Parser;
use limitd::server::{bootstrap, runtime};
use std::path::PathBuf;

#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Standalone rate-limiting service: decisioned traffic on one listener,
/// health and statistics on another.
#[derive(Parser)]
#[command(name = "limitd", version)]
struct Args {
    /// Listener for decisioned traffic
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Listener for health, stats, and metrics
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Config file (.toml or .json); built-in defaults when absent
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime::worker_threads())
        .enable_all()
        .build()?;

    runtime.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: args.config,
        listen: args.listen,
        admin_listen: args.admin_listen,
    }))
}
