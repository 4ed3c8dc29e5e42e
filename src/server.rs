use std::{convert::Infallible, net::SocketAddr, time::Duration};

use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StdResultExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{Instrument, debug, error_span, info, warn};

use crate::handler::ProxyHandler;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serves HTTP/1.x proxy clients on TCP listeners.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    handler: ProxyHandler,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(handler: ProxyHandler) -> Self {
        Self {
            handler,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    /// Accepts connections from `listener` and serves each in a new task.
    ///
    /// Runs until [`Self::shutdown`] is called or accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening");
        }
        let mut id = 0u64;
        loop {
            let (stream, client_addr) = match listener
                .accept()
                .with_cancellation_token(&self.shutdown)
                .await
            {
                None => return Ok(()),
                Some(res) => res.std_context("failed to accept connection")?,
            };
            let handler = self.handler.clone();
            tokio::spawn(
                self.shutdown
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted connection");
                        if let Err(err) = serve_connection(handler, stream).await {
                            debug!("connection closed with error: {err:#}");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    /// Stops accepting connections and waits briefly for open tunnels.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = self.handler.tasks();
        tasks.close();
        debug!("shutting down ({} pending tasks)", tasks.len());
        match tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all tunnels closed cleanly"),
            Err(_) => warn!(remaining = tasks.len(), "not all tunnels closed in time"),
        }
    }
}

async fn serve_connection(handler: ProxyHandler, stream: TcpStream) -> Result<()> {
    let service = service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(request).await) }
    });
    http1::Builder::new()
        .auto_date_header(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .std_context("failed to serve connection")
}

/// Binds `addr` and serves it until the returned server is shut down.
///
/// Returns the bound address, which differs from `addr` for port 0.
pub async fn spawn(handler: ProxyHandler, addr: SocketAddr) -> Result<(ProxyServer, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .std_context(format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr().std_context("failed to get local address")?;
    let server = ProxyServer::new(handler);
    let serve = server.clone();
    tokio::spawn(async move {
        if let Err(err) = serve.serve(listener).await {
            warn!("proxy server stopped: {err:#}");
        }
    });
    Ok((server, local_addr))
}
