//! HTTP/1.1 proxy server.
//!
//! Lifecycle: `Stopped → Binding → Listening → {Listening | Degraded →
//! Binding}`. Binding walks forward from the configured port while it is in
//! use; listen errors and failed health checks broadcast on the error stream
//! and restart the listener after a one-second delay. Per-connection failures
//! are logged and contained to the connection.
//!
//! A health task dials the bound address on a fixed cadence; a dial that
//! cannot complete within its timeout counts as a failed check and degrades
//! the server into a rebind.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::dispatch::{classify, RequestKind};
use crate::proxy::hls::HlsPipeline;
use crate::proxy::range::RangePipeline;
use crate::proxy::request::{
    forward_headers, parse_range, read_request, resolve_origin, write_simple_response,
    ClientRequest,
};

/// How many successive ports to try past the configured one.
const MAX_BIND_ATTEMPTS: u16 = 100;
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Observable server lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Binding,
    Listening,
    Degraded,
}

pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    range: Arc<RangePipeline>,
    hls: Arc<HlsPipeline>,
    state_tx: watch::Sender<ServerState>,
    addr_tx: watch::Sender<Option<SocketAddr>>,
    error_tx: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(
        config: Arc<ProxyConfig>,
        range: Arc<RangePipeline>,
        hls: Arc<HlsPipeline>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        let (addr_tx, _) = watch::channel(None);
        let (error_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            range,
            hls,
            state_tx,
            addr_tx,
            error_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    pub fn state_stream(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// The address actually bound, once listening.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.addr_tx.borrow()
    }

    /// Await the listener coming up and return its address.
    pub async fn wait_bound(&self) -> ProxyResult<SocketAddr> {
        let mut rx = self.addr_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return Ok(addr);
            }
            if rx.changed().await.is_err() {
                return Err(ProxyError::msg("server stopped before binding"));
            }
        }
    }

    /// Broadcast stream of bind/listen/health failures.
    pub fn on_error(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// Stop the accept loop and the health-check timer.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run until closed. Spawned once by the engine.
    pub async fn run(self: Arc<Self>) {
        'restart: loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let _ = self.state_tx.send(ServerState::Binding);

            let listener = match self.bind_with_fallback().await {
                Ok(listener) => listener,
                Err(e) => {
                    self.report(format!("bind failed: {e}"));
                    let _ = self.state_tx.send(ServerState::Degraded);
                    if self.sleep_or_shutdown(RESTART_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    self.report(format!("listener address unavailable: {e}"));
                    continue;
                }
            };
            let _ = self.addr_tx.send(Some(addr));
            let _ = self.state_tx.send(ServerState::Listening);
            info!(%addr, "proxy listening");

            let unhealthy = CancellationToken::new();
            let health = tokio::spawn(health_check(
                addr,
                Arc::clone(&self.config),
                unhealthy.clone(),
                self.error_tx.clone(),
                self.shutdown.clone(),
            ));

            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        unhealthy.cancel();
                        health.abort();
                        break 'restart;
                    }
                    _ = unhealthy.cancelled() => {
                        let _ = self.state_tx.send(ServerState::Degraded);
                        if self.sleep_or_shutdown(RESTART_DELAY).await {
                            break 'restart;
                        }
                        continue 'restart;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            self.report(format!("accept failed: {e}"));
                            unhealthy.cancel();
                            health.abort();
                            let _ = self.state_tx.send(ServerState::Degraded);
                            if self.sleep_or_shutdown(RESTART_DELAY).await {
                                break 'restart;
                            }
                            continue 'restart;
                        }
                    }
                }
            }
        }

        let _ = self.addr_tx.send(None);
        let _ = self.state_tx.send(ServerState::Stopped);
    }

    /// Bind the configured address, walking the port forward while in use.
    async fn bind_with_fallback(&self) -> ProxyResult<TcpListener> {
        let mut port = self.config.port;
        for _ in 0..MAX_BIND_ATTEMPTS {
            match TcpListener::bind(SocketAddr::new(self.config.ip, port)).await {
                Ok(listener) => {
                    if port != self.config.port {
                        debug!(configured = self.config.port, bound = port, "port fallback");
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    port = port.wrapping_add(1).max(1);
                }
                Err(e) => return Err(ProxyError::Bind { port, source: e }),
            }
        }
        Err(ProxyError::Bind {
            port,
            source: io::Error::new(io::ErrorKind::AddrInUse, "no free port found"),
        })
    }

    async fn handle_connection(&self, mut stream: TcpStream, proxy_addr: SocketAddr) {
        let result = self.serve_connection(&mut stream, proxy_addr).await;
        if let Err(e) = result {
            match e {
                ProxyError::ClientDisconnect | ProxyError::Cancelled => {
                    debug!("connection closed early: {e}");
                }
                e => warn!("connection error: {e}"),
            }
        }
        let _ = stream.shutdown().await;
    }

    async fn serve_connection(
        &self,
        stream: &mut TcpStream,
        proxy_addr: SocketAddr,
    ) -> ProxyResult<()> {
        let request = match read_request(stream).await {
            Ok(request) => request,
            Err(ProxyError::ClientDisconnect) => return Ok(()),
            Err(e) => {
                write_simple_response(stream, 400, "text/plain", e.to_string().as_bytes()).await?;
                return Ok(());
            }
        };

        if request.method != "GET" {
            write_simple_response(stream, 405, "text/plain", b"").await?;
            return Ok(());
        }

        let origin = match resolve_origin(&request) {
            Ok(origin) => origin,
            Err(e) => {
                write_simple_response(stream, 400, "text/plain", e.to_string().as_bytes()).await?;
                return Ok(());
            }
        };

        self.dispatch(stream, &request, origin, proxy_addr).await
    }

    pub(crate) async fn dispatch(
        &self,
        stream: &mut TcpStream,
        request: &ClientRequest,
        origin: Url,
        proxy_addr: SocketAddr,
    ) -> ProxyResult<()> {
        let headers = forward_headers(&request.headers, proxy_addr);
        let kind = classify(
            &origin,
            self.hls.is_known_playlist(origin.as_str()),
            self.hls.is_known_segment(origin.as_str()),
        );
        debug!(origin = %origin, ?kind, "request dispatched");

        match kind {
            RequestKind::HlsPlaylist => {
                self.hls
                    .serve_playlist(stream, &origin, &headers, proxy_addr)
                    .await
            }
            RequestKind::HlsSegment => {
                let hls_key = self.hls.segment_hls_key(origin.as_str());
                let range = request.header("range").and_then(parse_range);
                self.range
                    .serve(stream, origin, headers, range, hls_key)
                    .await
            }
            RequestKind::ByteRange => {
                let range = request.header("range").and_then(parse_range);
                self.range.serve(stream, origin, headers, range, None).await
            }
            RequestKind::PassThrough => {
                self.range.serve_passthrough(stream, &origin, &headers).await
            }
        }
    }

    fn report(&self, message: String) {
        warn!("{message}");
        let _ = self.error_tx.send(message);
    }

    /// Returns true when shutdown fired during the sleep.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Periodically dial the bound address; cancel `unhealthy` on failure.
async fn health_check(
    addr: SocketAddr,
    config: Arc<ProxyConfig>,
    unhealthy: CancellationToken,
    error_tx: broadcast::Sender<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(config.health_check_interval) => {}
        }

        let dial = tokio::time::timeout(config.health_check_timeout, TcpStream::connect(addr)).await;
        match dial {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = error_tx.send(format!("health check failed: {e}"));
                unhealthy.cancel();
                return;
            }
            Err(_) => {
                let _ = error_tx.send("health check timed out".to_string());
                unhealthy.cancel();
                return;
            }
        }
    }
}
