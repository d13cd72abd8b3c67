use super::service::{Connector, ConnectionEvent, SharedExec};
use super::{backoff::Backoff, resolver::ResolverRegistry, Channel};
use crate::transport::Error;
use bytes::Bytes;
use http::{uri::Uri, HeaderValue};
use std::{convert::TryInto, fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// The smallest keepalive interval the transport will actually use; shorter configured values
/// are clamped up to avoid flooding the peer with PINGs.
const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// A target endpoint plus every per-connection knob: windows, keepalive, idle timeout, backoff,
/// limits and timeouts.
///
/// Built with [`Channel::builder`] or one of the `TryFrom`/`FromStr` conversions, then consumed
/// by [`Endpoint::connect`] or [`Endpoint::connect_lazy`].
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) uri: Uri,
    pub(crate) origin: Option<Uri>,
    pub(crate) user_agent: Option<HeaderValue>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) concurrency_limit: Option<usize>,
    pub(crate) rate_limit: Option<(u64, Duration)>,
    pub(crate) init_stream_window_size: Option<u32>,
    pub(crate) init_connection_window_size: Option<u32>,
    pub(crate) http2_keep_alive_interval: Option<Duration>,
    pub(crate) http2_keep_alive_timeout: Option<Duration>,
    pub(crate) http2_keep_alive_while_idle: Option<bool>,
    pub(crate) http2_adaptive_window: Option<bool>,
    pub(crate) http2_max_header_list_size: Option<u32>,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) backoff: Backoff,
    pub(crate) retry_throttle: Option<(u32, f32)>,
    pub(crate) resolvers: Arc<ResolverRegistry>,
    pub(crate) executor: SharedExec,
    pub(crate) events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl Endpoint {
    pub(crate) fn new(uri: Uri) -> Result<Self, Error> {
        // Unix-socket targets carry the path in place of an authority.
        let authority_required = uri.scheme_str() != Some("unix");
        if uri.scheme().is_none() || (authority_required && uri.authority().is_none()) {
            return Err(Error::new_invalid_uri());
        }
        Ok(Self {
            uri,
            origin: None,
            user_agent: None,
            timeout: None,
            connect_timeout: None,
            concurrency_limit: None,
            rate_limit: None,
            init_stream_window_size: None,
            init_connection_window_size: None,
            http2_keep_alive_interval: None,
            http2_keep_alive_timeout: None,
            http2_keep_alive_while_idle: None,
            http2_adaptive_window: None,
            http2_max_header_list_size: None,
            max_idle_time: None,
            backoff: Backoff::default(),
            retry_throttle: None,
            resolvers: Arc::new(ResolverRegistry::default()),
            executor: SharedExec::tokio(),
            events: None,
        })
    }

    /// Creates an endpoint from a static string, panicking on an invalid URI.
    pub fn from_static(s: &'static str) -> Self {
        let uri = Uri::from_static(s);
        Self::new(uri).expect("static URI must carry a scheme and authority")
    }

    /// Creates an endpoint from shared bytes, validating the URI.
    pub fn from_shared(s: impl Into<Bytes>) -> Result<Self, Error> {
        let uri = Uri::from_maybe_shared(s.into()).map_err(|_| Error::new_invalid_uri())?;
        Self::new(uri)
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Overrides the `:scheme`/`:authority` the requests are sent with, without changing where
    /// the connection is made to.
    pub fn origin(mut self, origin: Uri) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Prepends a custom value to this crate's `user-agent`.
    pub fn user_agent<T>(mut self, user_agent: T) -> Result<Self, Error>
    where
        T: TryInto<HeaderValue>,
    {
        user_agent
            .try_into()
            .map(|ua| {
                self.user_agent = Some(ua);
                self
            })
            .map_err(|_| Error::new_invalid_user_agent())
    }

    /// Per-RPC timeout, applied to every request on this endpoint.
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    /// Timeout for establishing the underlying transport connection.
    pub fn connect_timeout(mut self, dur: Duration) -> Self {
        self.connect_timeout = Some(dur);
        self
    }

    /// Caps the number of in-flight requests on this endpoint.
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Caps request throughput to `limit` per `duration`.
    pub fn rate_limit(mut self, limit: u64, duration: Duration) -> Self {
        self.rate_limit = Some((limit, duration));
        self
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

    /// Interval between keepalive PINGs. Values below 10 seconds are clamped up.
    pub fn http2_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.http2_keep_alive_interval = Some(interval.max(MIN_KEEP_ALIVE_INTERVAL));
        self
    }

    /// How long to wait for a PING acknowledgement before tearing the connection down.
    pub fn keep_alive_timeout(mut self, duration: Duration) -> Self {
        self.http2_keep_alive_timeout = Some(duration);
        self
    }

    /// Whether keepalive PINGs are sent while no RPC is in flight.
    pub fn keep_alive_while_idle(mut self, enabled: bool) -> Self {
        self.http2_keep_alive_while_idle = Some(enabled);
        self
    }

    pub fn http2_adaptive_window(mut self, enabled: bool) -> Self {
        self.http2_adaptive_window = Some(enabled);
        self
    }

    pub fn http2_max_header_list_size(mut self, size: u32) -> Self {
        self.http2_max_header_list_size = Some(size);
        self
    }

    /// Closes the connection after it has carried no streams for this long; it is re-established
    /// transparently on the next RPC.
    pub fn max_idle_time(mut self, dur: Duration) -> Self {
        self.max_idle_time = Some(dur);
        self
    }

    /// First reconnect delay; later delays grow by the multiplier up to the maximum.
    pub fn initial_backoff(mut self, dur: Duration) -> Self {
        self.backoff = self.backoff.with_initial(dur);
        self
    }

    pub fn max_backoff(mut self, dur: Duration) -> Self {
        self.backoff = self.backoff.with_max(dur);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff = self.backoff.with_multiplier(multiplier);
        self
    }

    /// Jitter fraction in `[0, 1)` applied to every reconnect delay.
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff = self.backoff.with_jitter(jitter);
        self
    }

    /// Arms the per-endpoint retry throttle consulted by retry layers above the transport.
    pub fn retry_throttle(mut self, max_tokens: u32, token_ratio: f32) -> Self {
        self.retry_throttle = Some((max_tokens, token_ratio));
        self
    }

    /// Replaces the name-resolver registry used to turn the target URI into socket addresses.
    pub fn resolver_registry(mut self, resolvers: Arc<ResolverRegistry>) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Uses a custom executor for the background tasks driving this endpoint's connections.
    pub fn executor<E>(mut self, executor: E) -> Self
    where
        E: super::service::Executor<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>>
            + Send
            + Sync
            + 'static,
    {
        self.executor = SharedExec::new(executor);
        self
    }

    pub(crate) fn http_connector(&self) -> Connector {
        Connector::new(self.resolvers.clone(), self.connect_timeout)
    }

    /// Connects eagerly, failing fast if the endpoint is unreachable.
    pub async fn connect(&self) -> Result<Channel, Error> {
        Channel::connect(self.http_connector(), self.clone()).await
    }

    /// Creates a channel that only connects when the first RPC is dispatched.
    pub fn connect_lazy(&self) -> Channel {
        Channel::new(self.http_connector(), self.clone())
    }

    /// Like [`Endpoint::connect_lazy`], additionally returning the stream of connection
    /// lifecycle events (connect results, GOAWAY intake, close reasons).
    pub fn connect_lazy_with_events(
        &self,
    ) -> (Channel, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoint = self.clone();
        endpoint.events = Some(tx);
        let channel = Channel::new(endpoint.http_connector(), endpoint);
        (channel, rx)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_shared(s.to_string())
    }
}

impl TryFrom<&'static str> for Endpoint {
    type Error = Error;

    fn try_from(value: &'static str) -> Result<Self, Self::Error> {
        Self::from_shared(value.as_bytes())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_shared(value.into_bytes())
    }
}

impl TryFrom<Uri> for Endpoint {
    type Error = Error;

    fn try_from(uri: Uri) -> Result<Self, Self::Error> {
        Self::new(uri)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("uri", &self.uri).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_uri_without_scheme_or_authority() {
        assert!(Endpoint::from_shared("localhost:50051".to_string()).is_err());
        assert!(Endpoint::from_shared("/only/a/path".to_string()).is_err());
        assert!(Endpoint::from_shared("http://localhost:50051".to_string()).is_ok());
    }

    #[test]
    fn keep_alive_interval_is_clamped_up_to_ten_seconds() {
        let e = Endpoint::from_static("http://[::1]:50051")
            .http2_keep_alive_interval(Duration::from_millis(50));
        assert_eq!(e.http2_keep_alive_interval, Some(Duration::from_secs(10)));

        let e = Endpoint::from_static("http://[::1]:50051")
            .http2_keep_alive_interval(Duration::from_secs(30));
        assert_eq!(e.http2_keep_alive_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn window_sizes_are_capped_at_the_http2_maximum() {
        let e = Endpoint::from_static("http://[::1]:50051")
            .initial_stream_window_size(u32::MAX)
            .initial_connection_window_size(u32::MAX);
        assert_eq!(e.init_stream_window_size, Some((1 << 31) - 1));
        assert_eq!(e.init_connection_window_size, Some((1 << 31) - 1));
    }
}
