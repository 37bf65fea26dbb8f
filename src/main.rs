//! ack-server: a task-per-connection TCP acknowledgement server
//!
//! Every accepted connection is served by its own isolated worker task that
//! replies to each chunk it reads. Completed workers are reaped in the
//! background, and SIGINT/SIGTERM stop the acceptor without leaking workers.
//!
//! Features:
//! - Fixed acknowledgement or echo replies
//! - Optional admission control and idle timeout
//! - Drain or abort policy for in-flight connections on shutdown
//! - Configuration via CLI arguments or TOML file

mod config;
mod handler;
mod protocol;
mod server;
mod shutdown;
mod worker;

use config::Config;
use server::Server;
use shutdown::Shutdown;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        protocol = ?config.protocol,
        max_workers = ?config.max_workers,
        idle_timeout = ?config.idle_timeout,
        shutdown_policy = ?config.shutdown_policy,
        "Starting ack-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals().map_err(|e| {
        error!(error = %e, "Failed to install signal handlers");
        e
    })?;

    let server = Server::bind(config).map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;

    server.run(shutdown).await;
    signals.abort();
    Ok(())
}
