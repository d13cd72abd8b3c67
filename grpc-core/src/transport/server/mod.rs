//! Server acceptor: listener lifecycle, per-connection HTTP/2 settings and graceful shutdown.

mod incoming;
mod routes;

pub use self::incoming::TcpIncoming;
pub use self::routes::{NamedService, Routes};

use crate::body::Body;
use crate::transport::service::{GrpcTimeout, RecoverError};
use crate::transport::Error;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::{
    future::Future,
    net::SocketAddr,
    pin::pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tower_service::Service;
use tracing::{debug, trace};

const MIN_FRAME_SIZE: u32 = 1 << 14;
const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Builder-style server configuration plus the accept loop.
///
/// Shutdown is graceful in the HTTP/2 sense: on the shutdown signal every open connection first
/// advertises GOAWAY with the maximum stream id (new streams are refused, in-flight ones keep
/// running), then, one round-trip later, a final GOAWAY with the highest stream id actually
/// processed; the accept loop returns once the last in-flight RPC has finished.
#[derive(Debug, Clone)]
pub struct Server {
    init_stream_window_size: Option<u32>,
    init_connection_window_size: Option<u32>,
    adaptive_window: Option<bool>,
    max_frame_size: Option<u32>,
    max_concurrent_streams: Option<u32>,
    max_header_list_size: Option<u32>,
    http2_keepalive_interval: Option<Duration>,
    http2_keepalive_timeout: Option<Duration>,
    timeout: Option<Duration>,
    tcp_nodelay: bool,
    tcp_keepalive: Option<Duration>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            init_stream_window_size: None,
            init_connection_window_size: None,
            adaptive_window: None,
            max_frame_size: None,
            max_concurrent_streams: None,
            max_header_list_size: None,
            http2_keepalive_interval: None,
            http2_keepalive_timeout: None,
            timeout: None,
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }
}

impl Server {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Sets the HTTP/2 initial per-stream flow-control window, capped at `2^31 - 1`.
    pub fn initial_stream_window_size(mut self, sz: impl Into<Option<u32>>) -> Self {
        self.init_stream_window_size = sz.into().map(|sz| sz.min(MAX_WINDOW_SIZE));
        self
    }

    /// Sets the HTTP/2 initial connection-level flow-control window, capped at `2^31 - 1`.
    pub fn initial_connection_window_size(mut self, sz: impl Into<Option<u32>>) -> Self {
        self.init_connection_window_size = sz.into().map(|sz| sz.min(MAX_WINDOW_SIZE));
        self
    }

    pub fn http2_adaptive_window(mut self, enabled: bool) -> Self {
        self.adaptive_window = Some(enabled);
        self
    }

    /// Sets the largest HTTP/2 frame this server will accept, clamped into the protocol's legal
    /// range `[2^14, 2^24 - 1]`.
    pub fn max_frame_size(mut self, sz: u32) -> Self {
        self.max_frame_size = Some(sz.clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE));
        self
    }

    pub fn max_concurrent_streams(mut self, max: impl Into<Option<u32>>) -> Self {
        self.max_concurrent_streams = max.into();
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = Some(size);
        self
    }

    /// Interval between server-initiated keepalive PINGs.
    pub fn http2_keepalive_interval(mut self, interval: impl Into<Option<Duration>>) -> Self {
        self.http2_keepalive_interval = interval.into();
        self
    }

    /// How long to wait for a PING acknowledgement before closing the connection.
    pub fn http2_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.http2_keepalive_timeout = Some(timeout);
        self
    }

    /// Server-side cap applied on top of each RPC's `grpc-timeout`; expiry surfaces as
    /// `deadlineExceeded`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    /// Serves until the process is killed.
    pub async fn serve<S>(self, addr: SocketAddr, svc: S) -> Result<(), Error>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<crate::BoxError> + Send,
    {
        self.serve_with_shutdown(addr, svc, std::future::pending::<()>())
            .await
    }

    /// Serves until `signal` resolves, then shuts down gracefully.
    pub async fn serve_with_shutdown<S, F>(
        self,
        addr: SocketAddr,
        svc: S,
        signal: F,
    ) -> Result<(), Error>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<crate::BoxError> + Send,
        F: Future<Output = ()>,
    {
        let incoming = TcpIncoming::bind(addr)
            .await
            .map_err(Error::from_source)?
            .with_nodelay(self.tcp_nodelay)
            .with_keepalive(self.tcp_keepalive);
        self.serve_with_incoming_shutdown(incoming, svc, signal).await
    }

    /// Serves connections accepted from `incoming` until `signal` resolves.
    pub async fn serve_with_incoming_shutdown<S, F>(
        self,
        incoming: TcpIncoming,
        svc: S,
        signal: F,
    ) -> Result<(), Error>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<crate::BoxError> + Send,
        F: Future<Output = ()>,
    {
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .initial_stream_window_size(self.init_stream_window_size)
            .initial_connection_window_size(self.init_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .keep_alive_interval(self.http2_keepalive_interval);
        if let Some(timeout) = self.http2_keepalive_timeout {
            builder.keep_alive_timeout(timeout);
        }
        if let Some(enabled) = self.adaptive_window {
            builder.adaptive_window(enabled);
        }
        if let Some(size) = self.max_header_list_size {
            builder.max_header_list_size(size);
        }

        // Per-connection stack: deadline enforcement inside, status recovery outside, so an
        // expired deadline still reaches the client as a trailers-only response.
        let svc = RecoverError::new(GrpcTimeout::new(svc, self.timeout));

        let (close_tx, close_rx) = watch::channel(());
        let (conn_done_tx, mut conn_done_rx) = mpsc::channel::<()>(1);

        let mut signal = pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    trace!("shutdown signal received");
                    break;
                }
                accepted = incoming.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            debug!(%error, "accept failed");
                            continue;
                        }
                    };
                    trace!(?peer, "accepted connection");

                    let conn = builder.serve_connection(
                        TokioIo::new(stream),
                        TowerToHyperService::new(AdaptInboundBody { inner: svc.clone() }),
                    );
                    let watcher = close_rx.clone();
                    let done = conn_done_tx.clone();

                    tokio::spawn(async move {
                        let mut conn = pin!(conn);
                        let mut watcher = watcher;
                        let mut draining = false;
                        loop {
                            if draining {
                                if let Err(error) = conn.as_mut().await {
                                    debug!(%error, "connection terminated during shutdown");
                                }
                                break;
                            }
                            tokio::select! {
                                result = &mut conn => {
                                    if let Err(error) = result {
                                        debug!(%error, "connection terminated");
                                    }
                                    break;
                                }
                                _ = watcher.changed() => {
                                    conn.as_mut().graceful_shutdown();
                                    draining = true;
                                }
                            }
                        }
                        drop(done);
                    });
                }
            }
        }

        // Begin graceful shutdown on every connection, then wait for the last one to drain.
        drop(close_rx);
        let _ = close_tx.send(());
        drop(conn_done_tx);
        let _ = conn_done_rx.recv().await;

        Ok(())
    }
}

/// Re-wraps hyper's inbound body type as this crate's [`Body`] before the gRPC stack sees it.
#[derive(Clone)]
struct AdaptInboundBody<S> {
    inner: S,
}

impl<S> Service<http::Request<hyper::body::Incoming>> for AdaptInboundBody<S>
where
    S: Service<http::Request<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        self.inner.call(req.map(Body::new))
    }
}
