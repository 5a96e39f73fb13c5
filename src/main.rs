//! Shardgraph shard server
//!
//! Runs one graph shard: opens (or creates) the three storage files under
//! the data directory and serves the shard RPC surface. A cluster is a set
//! of these processes composed by the orchestrator client.

use anyhow::Result;
use clap::Parser;
use shardgraph::observability::OperationContext;
use shardgraph::{init_logging_at, log_operation, start_server, GraphEngine, LogLevel, Operation};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shardgraph shard server")]
struct Args {
    /// Data directory path
    #[arg(short = 'd', long, default_value = "./data", env = "SHARDGRAPH_DATA_DIR")]
    data_dir: PathBuf,

    /// Database name, used as the prefix of the storage files
    #[arg(short = 'n', long, default_value = "graph", env = "SHARDGRAPH_DB_NAME")]
    db_name: String,

    /// Server port
    #[arg(short = 'p', long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short = 'q', long, env = "QUIET_MODE")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.quiet {
        LogLevel::Quiet
    } else if args.verbose {
        LogLevel::Verbose
    } else {
        LogLevel::Normal
    };
    init_logging_at(level)?;

    let ctx = OperationContext::new("startup");
    log_operation(
        &ctx,
        &Operation::Startup {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        &Ok(()),
    );

    info!("Starting shardgraph shard server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", args.data_dir.display());
    info!("Port: {}", args.port);

    std::fs::create_dir_all(&args.data_dir)?;

    let engine = GraphEngine::open(args.data_dir.join(&args.db_name))?;
    let engine = Arc::new(RwLock::new(engine));

    start_server(engine, args.port).await
}
