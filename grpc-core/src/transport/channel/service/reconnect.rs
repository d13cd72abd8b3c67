use super::AsyncService;
use crate::transport::channel::backoff::Backoff;
use pin_project::pin_project;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tower_service::Service;
use tracing::trace;

enum State<F, S> {
    Idle,
    Connecting(Pin<Box<F>>),
    Connected(S),
    /// Reconnect failed and we're waiting out the backoff delay before trying again.
    Backoff(Pin<Box<tokio::time::Sleep>>),
}

/// Wraps a `MakeService<Target>` and transparently reconnects (with exponential backoff) whenever
/// the underlying service errors, so a dropped HTTP/2 connection doesn't surface as a permanent
/// channel failure.
pub(crate) struct Reconnect<M, Target>
where
    M: Service<Target>,
{
    mk_service: M,
    state: State<M::Future, M::Response>,
    target: Target,
    backoff: Backoff,
}

impl<M, Target> Reconnect<M, Target>
where
    M: Service<Target>,
    Target: Clone,
{
    /// `is_lazy` is accepted for parity with the non-lazy constructor; the first connect attempt
    /// always happens on the first `poll_ready`, whether or not a caller asked for eager connect.
    pub(crate) fn new(mk_service: M, target: Target, _is_lazy: bool, backoff: Backoff) -> Self {
        Self {
            mk_service,
            state: State::Idle,
            target,
            backoff,
        }
    }
}

impl<M, Target, Req> Service<Req> for Reconnect<M, Target>
where
    M: Service<Target>,
    M::Response: Service<Req>,
    M::Error: Into<crate::BoxError>,
    <M::Response as Service<Req>>::Error: Into<crate::BoxError>,
    Target: Clone,
{
    type Response = <M::Response as Service<Req>>::Response;
    type Error = crate::BoxError;
    type Future = ResponseFuture<<M::Response as Service<Req>>::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        loop {
            self.state = match &mut self.state {
                State::Idle => {
                    let target = self.target.clone();
                    let fut = self.mk_service.call(target);
                    State::Connecting(Box::pin(fut))
                }
                State::Connecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(service)) => {
                        self.backoff.reset();
                        State::Connected(service)
                    }
                    Poll::Ready(Err(e)) => {
                        let error: crate::BoxError = e.into();
                        let delay = self.backoff.next_delay();
                        trace!(%error, ?delay, "reconnect attempt failed");
                        State::Backoff(Box::pin(tokio::time::sleep(delay)))
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Backoff(sleep) => match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => State::Idle,
                    Poll::Pending => return Poll::Pending,
                },
                State::Connected(service) => match service.poll_ready(cx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Ok(())),
                    Poll::Ready(Err(_)) => State::Idle,
                    Poll::Pending => return Poll::Pending,
                },
            };
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match &mut self.state {
            State::Connected(service) => ResponseFuture::new(service.call(req)),
            _ => panic!("poll_ready was not called or did not return Ready"),
        }
    }
}

impl<M, Target, Req> AsyncService<Req> for Reconnect<M, Target>
where
    M: Service<Target>,
    M::Response: AsyncService<Req>,
    M::Error: Into<crate::BoxError>,
    <M::Response as Service<Req>>::Error: Into<crate::BoxError>,
    Target: Clone,
{
    fn async_call(&mut self, req: impl Future<Output = Req> + Send + 'static) -> Self::Future {
        match &mut self.state {
            State::Connected(service) => ResponseFuture::new(service.async_call(req)),
            _ => panic!("poll_ready was not called or did not return Ready"),
        }
    }
}

#[pin_project]
pub(crate) struct ResponseFuture<F> {
    #[pin]
    inner: F,
}

impl<F> ResponseFuture<F> {
    fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<crate::BoxError>,
{
    type Output = Result<T, crate::BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx).map_err(Into::into)
    }
}

impl<M, Target> fmt::Debug for Reconnect<M, Target>
where
    M: Service<Target>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnect").finish()
    }
}
