//! msgserver: a minimal pub/sub message server
//!
//! Speaks the core of a NATS-style text protocol:
//! - INFO greeting on accept
//! - CONNECT and PING/PONG
//! - PUB with an exact-length payload frame
//!
//! Subscriptions are not implemented; published messages go to a
//! dispatcher that drops them.
//!
//! Configuration via CLI arguments or TOML file. Type `exit` on standard
//! input or press Ctrl-C to stop.

mod config;
mod connection;
mod dispatch;
mod logging;
mod protocol;
mod server;

use config::Config;
use server::Server;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Typed on standard input to stop the server
const SHUTDOWN_KEYWORD: &str = "exit";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Printed regardless of log filtering
    println!("{}", banner());

    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        max_payload = config.max_payload,
        max_connections = config.max_connections,
        workers = ?config.workers,
        "Starting message server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let result = runtime.block_on(run(config));

    // The stdin reader sits on a blocking thread that never returns on its own
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn banner() -> String {
    format!("Message Server v{}", env!("CARGO_PKG_VERSION"))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(config);
    server.start().await?;

    wait_for_shutdown().await;

    let accepted = server.connections_accepted();
    server.stop().await;
    info!(connections = accepted, "Server stopped");
    Ok(())
}

/// Resolve on the shutdown keyword or Ctrl-C, whichever comes first.
async fn wait_for_shutdown() {
    tokio::select! {
        _ = read_shutdown_keyword() => {
            info!("Shutdown requested from console");
        }
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        },
    }
}

/// Ignore console input until the shutdown keyword shows up.
async fn read_shutdown_keyword() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == SHUTDOWN_KEYWORD => return,
            Ok(Some(_)) => continue,
            Ok(None) => {
                debug!("Standard input closed, waiting for Ctrl-C");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read standard input, waiting for Ctrl-C");
                break;
            }
        }
    }

    std::future::pending::<()>().await
}
