use crate::body::Body;
use crate::Status;
use pin_project::pin_project;
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tower_service::Service;

/// Turns service errors that carry a [`Status`] back into proper trailers-only gRPC responses,
/// so a deadline expiry or handler failure reaches the client as `grpc-status` instead of an
/// HTTP/2 stream reset.
///
/// Errors with no recoverable status (transport-level failures) pass through untouched and tear
/// the stream down.
#[derive(Debug, Clone)]
pub(crate) struct RecoverError<S> {
    inner: S,
}

impl<S> RecoverError<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, Req> Service<Req> for RecoverError<S>
where
    S: Service<Req, Response = http::Response<Body>>,
    S::Error: Into<crate::BoxError>,
{
    type Response = http::Response<Body>;
    type Error = crate::BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        ResponseFuture {
            inner: self.inner.call(req),
        }
    }
}

#[pin_project]
pub(crate) struct ResponseFuture<F> {
    #[pin]
    inner: F,
}

impl<F, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<Body>, E>>,
    E: Into<crate::BoxError>,
{
    type Output = Result<http::Response<Body>, crate::BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().inner.poll(cx)) {
            Ok(response) => Poll::Ready(Ok(response)),
            Err(err) => match Status::try_from_error(err.into()) {
                Ok(status) => Poll::Ready(Ok(status.to_http())),
                Err(err) => Poll::Ready(Err(err)),
            },
        }
    }
}
