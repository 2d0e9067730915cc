use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth::{DbConfig, Server, ServerConfig, SqlConnPool, SqlUserStore, TriggerMode};

#[derive(Debug, Parser)]
#[command(name = "hearth", about = "Reactor-style HTTP/1.1 static file server")]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = 1316, value_parser = clap::value_parser!(u16).range(1024..))]
    port: u16,

    /// Trigger mode: 0 = both level, 1 = conn edge, 2 = listen edge, 3 = both edge
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=3))]
    trigger_mode: u8,

    /// Idle connection timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,

    /// Linger on close so queued response bytes drain first
    #[arg(long)]
    linger: bool,

    /// Static resource directory
    #[arg(long, default_value = "./resources")]
    src_dir: PathBuf,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 65_536)]
    max_connections: usize,

    /// Worker threads
    #[arg(long, default_value_t = 6)]
    threads: usize,

    /// Database connection pool size
    #[arg(long, default_value_t = 12)]
    db_conns: usize,

    /// Log level: 0 = debug, 1 = info, 2 = warn, 3 = error
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=3))]
    log_level: u8,

    /// Disable logging entirely
    #[arg(long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if !args.quiet {
        let level = match args.log_level {
            0 => "debug",
            1 => "info",
            2 => "warn",
            _ => "error",
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
            )
            .init();
    }

    let db = DbConfig::from_env();
    let pool = SqlConnPool::connect(&db, args.db_conns).context("opening database pool")?;
    let store = Arc::new(SqlUserStore::new(pool));

    let cfg = ServerConfig {
        port: args.port,
        trigger_mode: TriggerMode::from_index(args.trigger_mode),
        timeout_ms: args.timeout_ms,
        linger: args.linger,
        src_dir: args.src_dir,
        max_connections: args.max_connections,
        worker_threads: args.threads,
    };
    let mut server = Server::new(&cfg, store).context("initializing server")?;
    server.run()?;
    Ok(())
}
