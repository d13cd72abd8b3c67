//! The request/response body type used throughout this crate: a type-erased [`http_body::Body`]
//! carrying `Bytes` frames and `Status`-compatible trailers.

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt};
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

/// A type-erased request/response body.
pub struct Body {
    inner: UnsyncBoxBody<Bytes, crate::BoxError>,
}

impl Body {
    pub fn new<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        Self {
            inner: body.map_err(Into::into).boxed_unsync(),
        }
    }

    pub fn empty() -> Self {
        Self::new(
            http_body_util::Empty::new()
                .map_err(|never: std::convert::Infallible| -> crate::BoxError { match never {} }),
        )
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = crate::BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").finish()
    }
}

/// A type-erased response body produced by the server handler, before final boxing into [`Body`].
pub type BoxBody = UnsyncBoxBody<Bytes, crate::Status>;

pub(crate) fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes, Error = crate::Status> + Send + 'static,
{
    body.boxed_unsync()
}

/// Boxes an inbound request body of arbitrary error type into [`BoxBody`], folding any I/O-layer
/// error into an `internal` status so the deframer never has to know the concrete body type.
pub(crate) fn boxed_request<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<crate::BoxError>,
{
    body.map_err(|e| crate::Status::from_error_generic(e)).boxed_unsync()
}
