//! Client channel: buffered, load-balanced dispatch over one or more reconnecting connections.
//!
//! A [`Channel`] is cheap to clone; all clones share the same connections and the same FIFO
//! dispatch queue. RPCs issued while no connection is ready queue in order and are resumed once
//! the transport comes up; dropping an RPC's response future dequeues it.

pub(crate) mod service;

mod backoff;
mod endpoint;
pub mod resolver;
mod throttle;

pub use self::endpoint::Endpoint;
pub use self::service::{Change, CloseReason, ConnectionEvent, Executor};
pub use self::throttle::RetryThrottle;

pub(crate) use crate::BoxFuture;

/// An outbound request as the connection middleware stack sees it, after the per-call gRPC
/// headers have been applied but before origin/user-agent rewriting.
pub(crate) type RawRequest<B> = http::Request<B>;

use self::service::{Connection, DynamicServiceStream, RoundRobin, SharedExec};
use crate::body::Body;
use crate::transport::Error;
use http::{Request, Response, Uri};
use hyper::rt;
use std::{
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use pin_project::pin_project;
use tokio::sync::mpsc::{channel, Sender};
use tower::buffer::{future::ResponseFuture as BufferResponseFuture, Buffer};
use tower::util::BoxService;
use tower_service::Service;

const DEFAULT_BUFFER_SIZE: usize = 1024;

type Svc = BoxService<Request<Body>, Response<Body>, crate::BoxError>;
type SvcFuture = BoxFuture<'static, Result<Response<Body>, crate::BoxError>>;

/// A gRPC client channel.
#[derive(Clone)]
pub struct Channel {
    svc: Buffer<Request<Body>, SvcFuture>,
    throttle: Option<Arc<RetryThrottle>>,
}

impl Channel {
    /// Starts configuring an endpoint for this URI.
    ///
    /// # Panics
    ///
    /// Panics if the URI is missing a scheme or authority; use [`Endpoint::from_shared`] for
    /// fallible construction.
    pub fn builder(uri: Uri) -> Endpoint {
        Endpoint::new(uri).expect("channel URI must carry a scheme and authority")
    }

    /// Shorthand for parsing a static target and connecting eagerly.
    pub async fn from_static_target(target: &'static str) -> Result<Self, Error> {
        Endpoint::from_static(target).connect().await
    }

    pub(crate) fn new<C>(connector: C, endpoint: Endpoint) -> Self
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
    {
        let throttle = endpoint
            .retry_throttle
            .map(|(max, ratio)| Arc::new(RetryThrottle::new(max, ratio)));
        let executor = endpoint.executor.clone();
        let svc = Connection::lazy(connector, endpoint);
        Self::from_service(BoxService::new(svc), throttle, executor)
    }

    pub(crate) async fn connect<C>(connector: C, endpoint: Endpoint) -> Result<Self, Error>
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Unpin + Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
    {
        let throttle = endpoint
            .retry_throttle
            .map(|(max, ratio)| Arc::new(RetryThrottle::new(max, ratio)));
        let executor = endpoint.executor.clone();
        let svc = Connection::connect(connector, endpoint, service::modifier_fn_default())
            .await
            .map_err(Error::from_source)?;
        Ok(Self::from_service(BoxService::new(svc), throttle, executor))
    }

    /// Balances RPCs round-robin over a dynamic endpoint set, updated through the returned
    /// sender.
    pub fn balance_channel<K>(capacity: usize) -> (Self, Sender<Change<K>>)
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        let (tx, rx) = channel(capacity);
        let discover = DynamicServiceStream::new(rx);
        let balance = RoundRobin::new(discover);
        let channel = Self::from_service(BoxService::new(balance), None, SharedExec::tokio());
        (channel, tx)
    }

    /// Balances RPCs round-robin over a fixed list of endpoints.
    pub fn balance_list(list: impl Iterator<Item = Endpoint>) -> Self {
        let (channel, tx) = Self::balance_channel(DEFAULT_BUFFER_SIZE);
        for (key, endpoint) in list.enumerate() {
            let _ = tx.try_send(Change::Insert(key, endpoint));
        }
        channel
    }

    fn from_service(svc: Svc, throttle: Option<Arc<RetryThrottle>>, executor: SharedExec) -> Self {
        let (svc, worker) = Buffer::pair(svc, DEFAULT_BUFFER_SIZE);
        executor.spawn(Box::pin(worker));
        Self { svc, throttle }
    }

    /// The retry throttle configured for this channel, for retry layers stacked above it.
    pub fn retry_throttle(&self) -> Option<&Arc<RetryThrottle>> {
        self.throttle.as_ref()
    }
}

impl Service<Request<Body>> for Channel {
    type Response = Response<Body>;
    type Error = crate::BoxError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.svc.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        ResponseFuture {
            inner: self.svc.call(request),
            throttle: self.throttle.clone(),
        }
    }
}

/// Response future for RPCs dispatched through a [`Channel`]; feeds transport-level outcomes
/// into the channel's retry throttle.
#[pin_project]
pub struct ResponseFuture {
    #[pin]
    inner: BufferResponseFuture<SvcFuture>,
    throttle: Option<Arc<RetryThrottle>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response<Body>, crate::BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        if let Some(throttle) = this.throttle {
            match &result {
                Ok(_) => throttle.record_success(),
                Err(_) => throttle.record_failure(),
            }
        }
        Poll::Ready(result)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish()
    }
}
