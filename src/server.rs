//! TCP listener and connection supervisor.
//!
//! Accepts connections, assigns each one a process-unique id and runs its
//! session on an independent task. A failing session is logged and dropped
//! without affecting the listener or any other session.

use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch::{Discard, Dispatch};
use crate::protocol::ProtocolError;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First pause after a failed accept; doubles per consecutive failure
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Longest pause between accept retries
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Server instance
pub struct Server {
    config: Config,
    dispatch: Arc<dyn Dispatch>,
    next_id: Arc<AtomicU64>,
    connection_limit: Arc<Semaphore>,
    running: Option<Running>,
}

/// Handles to a started accept loop.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Everything the accept loop hands to each session.
struct SessionContext {
    next_id: Arc<AtomicU64>,
    connection_limit: Arc<Semaphore>,
    dispatch: Arc<dyn Dispatch>,
    max_payload: usize,
}

impl Server {
    /// Create a server that discards published messages
    pub fn new(config: Config) -> Self {
        Self::with_dispatch(config, Arc::new(Discard))
    }

    /// Create a server handing published messages to `dispatch`
    pub fn with_dispatch(config: Config, dispatch: Arc<dyn Dispatch>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            dispatch,
            next_id: Arc::new(AtomicU64::new(1)),
            connection_limit,
            running: None,
        }
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns as soon as the socket is listening. A bind failure is
    /// returned to the caller; the server cannot work without its port.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = bind(&self.config.listen, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let ctx = SessionContext {
            next_id: Arc::clone(&self.next_id),
            connection_limit: Arc::clone(&self.connection_limit),
            dispatch: Arc::clone(&self.dispatch),
            max_payload: self.config.max_payload,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });

        Ok(local_addr)
    }

    /// Stop accepting connections.
    ///
    /// The listening socket is closed once the accept loop exits. Sessions
    /// already running are left to finish on their own.
    pub async fn stop(&mut self) {
        info!("Stopping server...");

        if let Some(running) = self.running.take() {
            // Receiver is gone only if the accept loop already exited
            let _ = running.shutdown.send(true);
            if let Err(e) = running.accept_task.await {
                error!(error = %e, "Accept loop terminated abnormally");
            }
        }

        info!("Bye.");
    }

    /// Address the listener is bound to, once started
    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Number of connections accepted so far
    pub fn connections_accepted(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

/// Create the listening socket with SO_REUSEADDR and the configured backlog.
fn bind(listen: &str, backlog: u32) -> io::Result<TcpListener> {
    let addr = listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address resolved for '{listen}'"),
        )
    })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = Arc::clone(&ctx.connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, addr) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    let delay = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    error!(error = %e, retry_in = ?delay, "Failed to accept connection");

                    // Slot goes back while we wait, e.g. for descriptors to free up
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };
        failures = 0;

        let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(client = id, peer = %addr, "Client connected");

        let dispatch = Arc::clone(&ctx.dispatch);
        let max_payload = ctx.max_payload;
        tokio::spawn(async move {
            handle_connection(id, stream, max_payload, dispatch).await;
            drop(permit);
        });
    }

    info!("Stopped accepting connections");
}

/// Pause before the next accept after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .checked_mul(1 << failures.min(16))
        .map_or(ACCEPT_BACKOFF_MAX, |delay| delay.min(ACCEPT_BACKOFF_MAX))
}

/// Run one session to completion and log how it ended.
async fn handle_connection(
    id: u64,
    stream: TcpStream,
    max_payload: usize,
    dispatch: Arc<dyn Dispatch>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = id, error = %e, "Failed to set TCP_NODELAY");
    }

    let mut conn = Connection::new(id, stream, max_payload, dispatch);

    match conn.run().await {
        Ok(()) => {}
        Err(ProtocolError::Io(e)) => {
            debug!(client = conn.id(), error = %e, "Client disconnected with error");
        }
        Err(e) => {
            warn!(client = conn.id(), error = %e, "Protocol error, closing connection");
        }
    }

    debug!(client = conn.id(), "Client disconnected");
}
