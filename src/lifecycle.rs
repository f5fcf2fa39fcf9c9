//! Server lifecycle: bind, serve in the background, shut down with a bound.
//!
//! [`start`] binds the listener up front so address problems surface to the
//! caller instead of inside a background task.  The accept loop then runs on
//! its own task and serves every connection on a task of its own, so the
//! returned [`ServerHandle`] can drive shutdown:
//!
//! 1. stop accepting and ask each connection to close once its current
//!    request is answered;
//! 2. if connections are still open when the grace period ends, abort their
//!    tasks, which drops the sockets and any handler still running on them.
//!
//! A connection that sits idle between requests for longer than the idle
//! timeout is closed.  If accepting keeps failing the loop gives up and
//! [`ServerHandle::stopped`] resolves.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// How a shutdown finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request completed within the grace period.
    Drained,
    /// The grace period ran out and open connections were closed.
    Forced,
}

/// Errors from starting or stopping the server.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("accept loop failed: {0}")]
    Serve(#[source] io::Error),

    #[error("server task panicked: {0}")]
    Task(#[source] tokio::task::JoinError),
}

/// Consecutive accept failures after which the loop gives up.
const MAX_ACCEPT_FAILURES: u32 = 10;

type HttpConnection = http1::Connection<TokioIo<TcpStream>, TowerToHyperService<Router>>;

/// Handle to a running server.
///
/// Dropping the handle without calling [`ServerHandle::shutdown`] starts a
/// graceful shutdown with no bound.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<watch::Sender<ServerState>>,
    drain_tx: watch::Sender<bool>,
    force_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

/// Bind `addr` and start serving `router` on a background task.
///
/// Connections idle for `idle_timeout` between requests are closed.
pub async fn start(
    addr: &str,
    router: Router,
    idle_timeout: Duration,
) -> Result<ServerHandle, LifecycleError> {
    let (state, _) = watch::channel(ServerState::Starting);
    let state = Arc::new(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| LifecycleError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr().map_err(LifecycleError::LocalAddr)?;

    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(idle_timeout);

    let (drain_tx, drain_rx) = watch::channel(false);
    let (force_tx, force_rx) = oneshot::channel::<()>();

    state.send_replace(ServerState::Running);
    let task_state = Arc::clone(&state);
    let task = tokio::spawn(async move {
        let result = accept_loop(listener, http, router, drain_rx, force_rx).await;
        if let Err(e) = &result {
            error!("Accept loop on {} failed: {}", local_addr, e);
        }
        task_state.send_replace(ServerState::Stopped);
        result
    });

    info!("Listening on {}", local_addr);
    Ok(ServerHandle {
        local_addr,
        state,
        drain_tx,
        force_tx: Some(force_tx),
        task,
    })
}

impl ServerHandle {
    /// The bound address. Useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Resolve once the accept loop has exited on its own.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|s| *s == ServerState::Stopped).await;
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests. Connections still open afterwards are closed.
    pub async fn shutdown(mut self, grace: Duration) -> Result<ShutdownOutcome, LifecycleError> {
        if self.state() != ServerState::Stopped {
            self.state.send_replace(ServerState::ShuttingDown);
        }
        self.drain_tx.send_replace(true);
        info!("Shutting down, waiting up to {:?} for in-flight requests", grace);

        let outcome = match tokio::time::timeout(grace, &mut self.task).await {
            Ok(joined) => {
                let served = joined.map_err(LifecycleError::Task)?;
                served.map_err(LifecycleError::Serve)?;
                info!("All connections drained");
                ShutdownOutcome::Drained
            }
            Err(_) => {
                warn!(
                    "Grace period of {:?} elapsed with requests in flight, closing connections",
                    grace
                );
                if let Some(force) = self.force_tx.take() {
                    let _ = force.send(());
                }
                let served = (&mut self.task).await.map_err(LifecycleError::Task)?;
                served.map_err(LifecycleError::Serve)?;
                ShutdownOutcome::Forced
            }
        };

        self.state.send_replace(ServerState::Stopped);
        Ok(outcome)
    }
}

// -- Connections --------------------------------------------------------------

/// Accept until draining starts, then wait for the open connections.
async fn accept_loop(
    listener: TcpListener,
    http: http1::Builder,
    router: Router,
    mut drain_rx: watch::Receiver<bool>,
    force_rx: oneshot::Receiver<()>,
) -> io::Result<()> {
    let mut connections = JoinSet::new();
    let conn_drain = drain_rx.clone();
    let mut failures = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!("Accept failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= MAX_ACCEPT_FAILURES {
                            return Err(e);
                        }
                        // Typically out of file descriptors; back off.
                        warn!("Accept failed ({} in a row): {}", failures, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
                }
                let conn = http.serve_connection(
                    TokioIo::new(stream),
                    TowerToHyperService::new(router.clone()),
                );
                connections.spawn(serve_connection(conn, remote, conn_drain.clone()));
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(joined);
            }
            // Also fires when the handle is dropped.
            _ = drain_rx.changed() => break,
        }
    }

    drop(listener);
    debug!("Stopped accepting, {} connection(s) open", connections.len());

    let forced = async {
        if force_rx.await.is_err() {
            // Handle dropped without forcing; drain without a bound.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = drain_connections(&mut connections) => {}
        _ = forced => {
            info!("Closing {} open connection(s)", connections.len());
            connections.abort_all();
            drain_connections(&mut connections).await;
        }
    }
    Ok(())
}

/// Drive one connection; once draining starts, finish the current request
/// and close.
async fn serve_connection(
    conn: HttpConnection,
    remote: SocketAddr,
    mut drain: watch::Receiver<bool>,
) {
    tokio::pin!(conn);
    let draining = async move {
        // A dropped handle drains as well.
        let _ = drain.wait_for(|draining| *draining).await;
    };

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = draining => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} closed with error: {}", remote, e);
    }
}

async fn drain_connections(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        log_connection_exit(joined);
    }
}

fn log_connection_exit(joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Connection task failed: {}", e),
    }
}

/// Failures that concern one connection only.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

// -- Signals ------------------------------------------------------------------

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
