use super::{
    modifier_fn_default, AddOrigin, AsyncService, ConnectionEvent, ConnectionMachine, Effect,
    Input, ModifierFn, Reconnect, SharedExec, UserAgent,
};
use crate::{
    body::Body,
    transport::{
        channel::{BoxFuture, RawRequest},
        service::GrpcTimeout,
        Endpoint,
    },
};
use bytes::Bytes;
use http::{Request, Response, Uri};
use hyper::rt;
use hyper::{client::conn::http2::Builder, rt::Executor};
use hyper_util::rt::TokioTimer;
use pin_project::pin_project;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tower::{
    layer::Layer,
    limit::{concurrency::ConcurrencyLimitLayer, rate::RateLimitLayer},
    util::BoxService,
    ServiceBuilder, ServiceExt,
};
use tower_service::Service;
use tracing::{debug, trace};

/// One logical client connection: the full middleware stack over a reconnecting HTTP/2
/// transport to a single endpoint.
pub(crate) struct Connection {
    inner: BoxService<Request<Body>, Response<Body>, crate::BoxError>,
}

impl Connection {
    fn new<C>(connector: C, endpoint: Endpoint, is_lazy: bool) -> Self
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
    {
        Self::new_with_modifier_fn(connector, endpoint, is_lazy, modifier_fn_default())
            .expect("endpoint URI always carries a scheme and authority")
    }

    fn new_with_modifier_fn<C, M, MF>(
        connector: C,
        endpoint: Endpoint,
        is_lazy: bool,
        custom_modifier: M,
    ) -> Result<Self, crate::BoxError>
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
        M: FnOnce(RawRequest<Body>) -> MF + Send + 'static + Clone,
        MF: Future<Output = RawRequest<Body>> + Send + 'static,
    {
        let mut settings: Builder<SharedExec> = Builder::new(endpoint.executor.clone())
            .initial_stream_window_size(endpoint.init_stream_window_size)
            .initial_connection_window_size(endpoint.init_connection_window_size)
            .keep_alive_interval(endpoint.http2_keep_alive_interval)
            .timer(TokioTimer::new())
            .clone();

        if let Some(val) = endpoint.http2_keep_alive_timeout {
            settings.keep_alive_timeout(val);
        }

        if let Some(val) = endpoint.http2_keep_alive_while_idle {
            settings.keep_alive_while_idle(val);
        }

        if let Some(val) = endpoint.http2_adaptive_window {
            settings.adaptive_window(val);
        }

        if let Some(val) = endpoint.http2_max_header_list_size {
            settings.max_header_list_size(val);
        }

        let endpoint_origin = endpoint.uri().clone();
        let add_origin = AddOrigin::new(endpoint.origin.clone().unwrap_or(endpoint_origin.clone()))?;

        let stack = ServiceBuilder::new()
            .option_layer(endpoint.concurrency_limit.map(ConcurrencyLimitLayer::new))
            .option_layer(endpoint.rate_limit.map(|(l, d)| RateLimitLayer::new(l, d)))
            .layer(ModifierFn::new_layer_once(add_origin.to_request_fn()))
            .layer(ModifierFn::new_layer_once(
                UserAgent::new(endpoint.user_agent.clone()).to_request_fn(),
            ))
            .layer(ModifierFn::new_layer_once(custom_modifier))
            .layer_fn(|s| GrpcTimeout::new(s, endpoint.timeout))
            .into_inner();

        let make_service = MakeSendRequestService::new(
            connector,
            endpoint.executor,
            settings,
            endpoint.max_idle_time,
            endpoint.events,
        );

        let conn = Reconnect::new(make_service, endpoint_origin, is_lazy, endpoint.backoff);

        Ok(Self {
            inner: BoxService::new(stack.layer(conn)),
        })
    }

    /// Connects eagerly: resolves and performs the HTTP/2 handshake before returning.
    pub(crate) async fn connect<C, M, MF>(
        connector: C,
        endpoint: Endpoint,
        modifier_fn: M,
    ) -> Result<Self, crate::BoxError>
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Unpin + Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
        M: FnOnce(RawRequest<Body>) -> MF + Send + 'static + Clone,
        MF: Future<Output = RawRequest<Body>> + Send + 'static,
    {
        Self::new_with_modifier_fn(connector, endpoint, false, modifier_fn)?
            .ready_oneshot()
            .await
    }

    /// Defers the first connect until the first RPC polls this connection ready.
    pub(crate) fn lazy<C>(connector: C, endpoint: Endpoint) -> Self
    where
        C: Service<Uri> + Send + 'static,
        C::Error: Into<crate::BoxError> + Send,
        C::Future: Send,
        C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
    {
        Self::new(connector, endpoint, true)
    }
}

impl Service<Request<Body>> for Connection {
    type Response = Response<Body>;
    type Error = crate::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(&mut self.inner, cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        self.inner.call(req)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

struct SendRequest {
    inner: hyper::client::conn::http2::SendRequest<Body>,
    inputs: mpsc::UnboundedSender<Input>,
}

impl tower::Service<Request<Body>> for SendRequest {
    type Response = Response<Body>;
    type Error = crate::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        self.async_call(async move { req })
    }
}

impl AsyncService<Request<Body>> for SendRequest {
    fn async_call(
        &mut self,
        req: impl Future<Output = Request<Body>> + Send + 'static,
    ) -> Self::Future {
        // `hyper`'s SendRequest is a cheap handle onto the shared connection; cloning it here
        // lets the whole modifier chain collapse into this one boxed future.
        let mut send_request = self.inner.clone();
        let guard = StreamGuard::open(self.inputs.clone());

        Box::pin(async move {
            let response = send_request.send_request(req.await).await.map_err(|e| {
                if e.is_closed() {
                    crate::BoxError::from(crate::Status::unavailable("subchannel is unavailable"))
                } else {
                    e.into()
                }
            })?;

            // The stream stays open until the application drops or drains the response body.
            Ok(response.map(move |b| Body::new(TrackedBody { inner: b, _guard: guard })))
        })
    }
}

struct MakeSendRequestService<C> {
    connector: C,
    executor: SharedExec,
    settings: Arc<Builder<SharedExec>>,
    max_idle_time: Option<Duration>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl<C> MakeSendRequestService<C> {
    fn new(
        connector: C,
        executor: SharedExec,
        settings: Builder<SharedExec>,
        max_idle_time: Option<Duration>,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        Self {
            connector,
            executor,
            settings: settings.into(),
            max_idle_time,
            events,
        }
    }
}

impl<C> tower::Service<Uri> for MakeSendRequestService<C>
where
    C: Service<Uri> + Send + 'static,
    C::Error: Into<crate::BoxError> + Send,
    C::Future: Send,
    C::Response: rt::Read + rt::Write + Unpin + Send,
{
    type Response = SendRequest;
    type Error = crate::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, target: Uri) -> Self::Future {
        let fut = self.connector.call(target);
        let builder = self.settings.clone();
        let executor = self.executor.clone();
        let max_idle_time = self.max_idle_time;
        let events = self.events.clone();

        Box::pin(async move {
            let io = match fut.await {
                Ok(io) => io,
                Err(e) => {
                    if let Some(tx) = &events {
                        let _ = tx.send(ConnectionEvent::ConnectFailed);
                    }
                    return Err(e.into());
                }
            };
            let (send_request, conn) = match builder.handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    if let Some(tx) = &events {
                        let _ = tx.send(ConnectionEvent::ConnectFailed);
                    }
                    return Err(e.into());
                }
            };

            let (inputs, inputs_rx) = mpsc::unbounded_channel();
            let (close_tx, close_rx) = oneshot::channel();
            let _ = inputs.send(Input::ConnectSucceeded);

            // The monitor owns the lifecycle machine; keepalive PINGs themselves are handled by
            // hyper per the builder settings above, so the machine is configured without them and
            // the driver maps a keepalive-timeout connection error back into the machine.
            let machine = ConnectionMachine::new(None, max_idle_time);
            Executor::<BoxFuture<'static, ()>>::execute(
                &executor,
                Box::pin(run_monitor(machine, inputs_rx, close_tx, events)) as _,
            );

            let driver_inputs = inputs.clone();
            Executor::<BoxFuture<'static, ()>>::execute(
                &executor,
                Box::pin(async move {
                    tokio::select! {
                        result = conn => {
                            let input = match result {
                                Ok(()) => Input::GoAwayReceived,
                                Err(e) if e.is_timeout() => Input::PingTimedOut,
                                Err(e) => {
                                    debug!("connection task error: {:?}", e);
                                    Input::TransportError
                                }
                            };
                            let _ = driver_inputs.send(input);
                        }
                        // Dropping the `conn` future tears the transport down.
                        _ = close_rx => {}
                    }
                }) as _,
            );

            Ok(SendRequest {
                inner: send_request,
                inputs,
            })
        })
    }
}

/// Applies lifecycle effects: publishes events, arms/cancels the idle timer, and closes the
/// connection by signalling the driver task.
async fn run_monitor(
    mut machine: ConnectionMachine,
    mut inputs: mpsc::UnboundedReceiver<Input>,
    close: oneshot::Sender<()>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
) {
    let mut close = Some(close);
    let mut idle_deadline: Option<tokio::time::Instant> = None;

    loop {
        let input = match idle_deadline {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    idle_deadline = None;
                    Input::IdleElapsed
                }
                item = inputs.recv() => match item {
                    Some(input) => input,
                    None => return,
                },
            },
            None => match inputs.recv().await {
                Some(input) => input,
                None => return,
            },
        };

        for effect in machine.handle(input) {
            match effect {
                Effect::Emit(event) => {
                    trace!(?event, "connection lifecycle event");
                    if let Some(tx) = &events {
                        let _ = tx.send(event);
                    }
                }
                Effect::ArmIdle(d) => idle_deadline = Some(tokio::time::Instant::now() + d),
                Effect::CancelIdle => idle_deadline = None,
                Effect::CloseConnection => {
                    if let Some(tx) = close.take() {
                        let _ = tx.send(());
                    }
                }
                // PING and GOAWAY emission belong to hyper's connection task.
                Effect::SendPing(_)
                | Effect::SendGoAway
                | Effect::ArmKeepalive(_)
                | Effect::ArmPingTimeout(_)
                | Effect::CancelPingTimeout => {}
            }
        }

        if machine.is_closed() {
            return;
        }
    }
}

/// Reports stream open/finish to the lifecycle monitor; finish fires on drop so that error paths
/// and abandoned response bodies are counted the same as clean completions.
struct StreamGuard {
    inputs: mpsc::UnboundedSender<Input>,
}

impl StreamGuard {
    fn open(inputs: mpsc::UnboundedSender<Input>) -> Self {
        let _ = inputs.send(Input::StreamOpened);
        Self { inputs }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::StreamFinished);
    }
}

#[pin_project]
struct TrackedBody<B> {
    #[pin]
    inner: B,
    _guard: StreamGuard,
}

impl<B> http_body::Body for TrackedBody<B>
where
    B: http_body::Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
