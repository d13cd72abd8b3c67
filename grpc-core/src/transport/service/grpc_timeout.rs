use crate::{metadata::GRPC_TIMEOUT_HEADER, TimeoutExpired};
use http::{HeaderMap, HeaderValue, Request};
use pin_project::pin_project;
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::{sync::oneshot, time::Sleep};
use tower_service::Service;

/// Enforces the per-call deadline: the shorter of the peer's `grpc-timeout` header and the
/// locally configured timeout, if either is set.
///
/// Used on both sides: the client stack applies its endpoint timeout, the server stack honors
/// the `grpc-timeout` the client sent.
#[derive(Debug, Clone)]
pub(crate) struct GrpcTimeout<S> {
    inner: S,
    local_timeout: Option<Duration>,
}

impl<S> GrpcTimeout<S> {
    pub(crate) fn new(inner: S, local_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            local_timeout,
        }
    }
}

fn effective_timeout(headers: &HeaderMap, local: Option<Duration>) -> Option<Duration> {
    let header_timeout = try_parse_grpc_timeout(headers).unwrap_or_else(|value| {
        tracing::trace!(?value, "ignoring unparseable grpc-timeout header");
        None
    });

    match (header_timeout, local) {
        (Some(header), Some(local)) => Some(header.min(local)),
        (timeout, None) | (None, timeout) => timeout,
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for GrpcTimeout<S>
where
    S: Service<Request<ReqBody>>,
    S::Error: Into<crate::BoxError>,
{
    type Response = S::Response;
    type Error = crate::BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let timeout = effective_timeout(req.headers(), self.local_timeout);

        ResponseFuture {
            inner: self.inner.call(req),
            deadline: DeadlineState::Known(timeout.map(tokio::time::sleep)),
        }
    }
}

#[cfg(feature = "channel")]
impl<S, ReqBody> crate::transport::channel::service::AsyncService<Request<ReqBody>>
    for GrpcTimeout<S>
where
    S: crate::transport::channel::service::AsyncService<Request<ReqBody>>,
    S::Error: Into<crate::BoxError>,
{
    fn async_call(
        &mut self,
        request: impl Future<Output = Request<ReqBody>> + Send + 'static,
    ) -> Self::Future {
        // The request headers only exist once the upstream future resolves, which happens inside
        // the inner call's future. The deadline is smuggled back out through a oneshot that is
        // written before the inner future yields its first response poll.
        let (tx, rx) = oneshot::channel();
        let local_timeout = self.local_timeout;

        let call = async move {
            let request = request.await;
            let _ = tx.send(effective_timeout(request.headers(), local_timeout));
            request
        };

        ResponseFuture {
            inner: self.inner.async_call(call),
            deadline: DeadlineState::Pending(rx),
        }
    }
}

#[pin_project]
pub(crate) struct ResponseFuture<F> {
    #[pin]
    inner: F,
    #[pin]
    deadline: DeadlineState,
}

/// The deadline is either already known (plain `call`) or still being computed alongside the
/// request future (`async_call`).
#[pin_project(project = DeadlineStateProj)]
enum DeadlineState {
    Pending(#[pin] oneshot::Receiver<Option<Duration>>),
    Known(#[pin] Option<Sleep>),
}

impl Future for DeadlineState {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                DeadlineStateProj::Pending(rx) => {
                    // The sender fires before the inner request is handed to the transport, so by
                    // the time anything polls us the value is buffered; a dropped sender means the
                    // request future itself was dropped and this future will never be polled again.
                    let timeout = ready!(rx.poll(cx)).unwrap_or(None);
                    self.set(DeadlineState::Known(timeout.map(tokio::time::sleep)));
                }
                DeadlineStateProj::Known(sleep) => {
                    return match sleep.as_pin_mut() {
                        Some(sleep) => sleep.poll(cx),
                        // No deadline configured anywhere: never fires.
                        None => Poll::Pending,
                    };
                }
            }
        }
    }
}

impl<F, Res, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Res, E>>,
    E: Into<crate::BoxError>,
{
    type Output = Result<Res, crate::BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let ready @ Poll::Ready(_) = this.inner.poll(cx) {
            return ready.map_err(Into::into);
        }

        ready!(this.deadline.poll(cx));
        Poll::Ready(Err(TimeoutExpired(()).into()))
    }
}

const SECONDS_IN_HOUR: u64 = 60 * 60;
const SECONDS_IN_MINUTE: u64 = 60;

/// Parses the `grpc-timeout` header (`[0-9]{1,8}` digits followed by one of `HMSmun`), returning
/// the rejected value on malformed input so the caller can log it.
fn try_parse_grpc_timeout(
    headers: &HeaderMap<HeaderValue>,
) -> Result<Option<Duration>, &HeaderValue> {
    let Some(val) = headers.get(GRPC_TIMEOUT_HEADER) else {
        return Ok(None);
    };

    // `to_str` succeeding means the value is ASCII, so `split_at` cannot land inside a
    // multi-byte character, and the non-empty check makes `len - 1` safe.
    let (digits, unit) = val
        .to_str()
        .map_err(|_| val)
        .and_then(|s| if s.is_empty() { Err(val) } else { Ok(s) })?
        .split_at(val.len() - 1);

    // The wire format caps the value at 8 digits, which also rules out u64 overflow below.
    if digits.len() > 8 {
        return Err(val);
    }

    let value: u64 = digits.parse().map_err(|_| val)?;

    let duration = match unit {
        "H" => Duration::from_secs(value * SECONDS_IN_HOUR),
        "M" => Duration::from_secs(value * SECONDS_IN_MINUTE),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        _ => return Err(val),
    };

    Ok(Some(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn parse(val: Option<&str>) -> Result<Option<Duration>, HeaderValue> {
        let mut headers = HeaderMap::new();
        if let Some(v) = val {
            headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_str(v).unwrap());
        }
        try_parse_grpc_timeout(&headers).map_err(|e| e.clone())
    }

    #[test]
    fn parses_every_timeout_unit() {
        assert_eq!(parse(Some("3H")).unwrap().unwrap(), Duration::from_secs(3 * 60 * 60));
        assert_eq!(parse(Some("1M")).unwrap().unwrap(), Duration::from_secs(60));
        assert_eq!(parse(Some("42S")).unwrap().unwrap(), Duration::from_secs(42));
        assert_eq!(parse(Some("13m")).unwrap().unwrap(), Duration::from_millis(13));
        assert_eq!(parse(Some("2u")).unwrap().unwrap(), Duration::from_micros(2));
        assert_eq!(parse(Some("82n")).unwrap().unwrap(), Duration::from_nanos(82));
    }

    #[test]
    fn absent_header_means_no_deadline() {
        assert!(parse(None).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse(Some("82f")).is_err());
    }

    #[test]
    fn rejects_more_than_eight_digits() {
        assert!(parse(Some("123456789H")).is_err());
    }

    #[test]
    fn rejects_non_numeric_value() {
        assert!(parse(Some("oneH")).is_err());
    }

    #[test]
    fn shorter_of_header_and_local_timeout_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("5S"));
        assert_eq!(
            effective_timeout(&headers, Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            effective_timeout(&headers, Some(Duration::from_secs(30))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(effective_timeout(&headers, None), Some(Duration::from_secs(5)));
        assert_eq!(
            effective_timeout(&HeaderMap::new(), Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(effective_timeout(&HeaderMap::new(), None), None);
    }

    #[quickcheck]
    fn arbitrary_header_values_never_panic(header_value: HeaderValueGen) -> bool {
        let _ = parse(Some(&header_value.0));
        true
    }

    /// Newtype generating strings restricted to valid `HeaderValue` bytes.
    #[derive(Clone, Debug)]
    struct HeaderValueGen(String);

    impl Arbitrary for HeaderValueGen {
        fn arbitrary(g: &mut Gen) -> Self {
            let max = g.choose(&(1..70).collect::<Vec<_>>()).copied().unwrap();
            let bytes: Vec<_> = (0..max)
                .map(|_| {
                    g.choose(b"ABCDEFGHIJKLMNOPQRSTUVabcdefghilpqrstuvwxyz0123456789----")
                        .copied()
                        .unwrap()
                })
                .collect();
            Self(String::from_utf8(bytes).unwrap())
        }
    }
}
