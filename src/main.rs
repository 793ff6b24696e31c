use std::path::PathBuf;

use anyhow::Context;
use basket_server::ServerConfig;
use basket_store::{Database, Store};
use basket_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clap::Parser;
use tracing::Level;

/// Real-time shared shopping basket server.
#[derive(Debug, Parser)]
#[command(name = "basket", version)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "BASKET_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind; 0 picks a free port.
    #[arg(long, env = "BASKET_PORT", default_value_t = 8080)]
    port: u16,

    /// SQLite database file.
    #[arg(long, env = "BASKET_DB", default_value = "basket.db")]
    db: PathBuf,

    /// Per-client outbound queue capacity before the client is evicted.
    #[arg(long, env = "BASKET_MAX_SEND_QUEUE", default_value_t = 256)]
    max_send_queue: usize,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "BASKET_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// Log output: json or pretty.
    #[arg(long, env = "BASKET_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        format: args.log_format,
    })?;

    let db = Database::open(&args.db)
        .with_context(|| format!("failed to open database {}", args.db.display()))?;
    let store = Store::new(db);

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_send_queue: args.max_send_queue,
        ..Default::default()
    };
    let handle = basket_server::start(config, store.clone())
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "basket server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    store.close();
    Ok(())
}
