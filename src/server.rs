//! HTTP server and graceful shutdown.
//!
//! Runs a [`Bridge`] over real sockets. hyper parses the wire protocol
//! (HTTP/1.1 or HTTP/2, whatever the client negotiates); every request is
//! handed to the bridge through a [`HyperTransport`] and answered through a
//! [`HyperSink`].
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C (or when the future passed to
//! [`Server::serve_with_shutdown`] resolves) the server:
//! 1. Stops `listener.accept()` immediately. No new connections are made.
//! 2. Asks every open connection to finish its in-flight requests and close.
//! 3. Returns once all connection tasks have completed.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bridge::Bridge;
use crate::conn::{HyperSink, HyperTransport, SinkBody};
use crate::error::Error;

/// The HTTP server.
pub struct Server {
    addr: String,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called. Resolution and binding errors surface from `serve`.
    ///
    /// ```rust,no_run
    /// use ferry::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        Self { addr: addr.to_owned() }
    }

    /// Starts accepting connections and answering them through `bridge`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, bridge: Bridge) -> Result<(), Error> {
        self.serve_with_shutdown(bridge, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but shuts down when `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, bridge: Bridge, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.addr).await?;
        Self::serve_on(listener, Arc::new(bridge), signal).await
    }

    /// Serves on an already bound listener.
    pub async fn serve_on<F>(listener: TcpListener, bridge: Arc<Bridge>, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %listener.local_addr()?, "ferry listening");

        // Flipped once on shutdown; every connection task watches it.
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown first, so a signal stops accepting even if more
                // connections are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_connection(stream, peer, Arc::clone(&bridge), stop_rx.clone()));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        stop_tx.send_replace(true);
        while tasks.join_next().await.is_some() {}

        info!("ferry stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: Arc<Bridge>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(%peer, "connection accepted");
    let svc = service_fn(move |req| respond(Arc::clone(&bridge), req));
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = stop.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        error!(%peer, "connection error: {e}");
    }
}

// ── Request bridging ──────────────────────────────────────────────────────────

/// Hands one request to the bridge and waits for the response head.
///
/// The bridge keeps running on its own task after the head is returned: it
/// still has to stream the body into the sink hyper is polling.
async fn respond(
    bridge: Arc<Bridge>,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<SinkBody>, Infallible> {
    let (parts, body) = req.into_parts();
    let mut transport = HyperTransport::new(&parts, body);
    let (mut sink, head) = HyperSink::new(bridge.config().write_hwm());

    tokio::spawn(async move {
        bridge.handle(&mut transport, &mut sink).await;
    });

    match head.await {
        Ok(response) => Ok(response),
        Err(_) => {
            error!(method = %parts.method, uri = %parts.uri, "request finished without a response head");
            let mut response = http::Response::new(SinkBody::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
