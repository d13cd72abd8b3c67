//! Client and server gRPC-over-HTTP/2 transport.
//!
//! This crate implements the three coupled subsystems that make up a gRPC transport:
//!
//! - the per-stream [`state_machine`] that validates headers, enforces call-lifecycle rules and
//!   distinguishes end-of-stream from fatal errors, for both the client and server roles;
//! - the length-prefixed [`codec`] that bridges arbitrary HTTP/2 DATA chunks to discrete gRPC
//!   messages, with optional gzip/deflate compression;
//! - the [`transport`] connection manager: name resolution, connect-with-backoff, idle timeout,
//!   keepalive, GOAWAY handling and graceful shutdown.
//!
//! HPACK header-block encoding/decoding and HTTP/2 frame parsing and flow control are delegated to
//! [`h2`] via [`hyper`]; this crate only produces and consumes [`http::Request`]/[`http::Response`]
//! values and `Bytes` payloads.

pub mod body;
pub mod client;
pub mod codec;
pub mod metadata;
pub mod request;
pub mod response;
pub mod server;
pub mod state_machine;
pub mod status;
#[cfg(any(feature = "channel", feature = "server"))]
pub mod transport;

pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::status::{Code, Status};

/// A type erased error that can occur internally before it is turned into a [`Status`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when a `grpc-timeout` (or server-side) deadline elapses before the inner
/// service produced a response.
#[derive(Debug)]
pub struct TimeoutExpired(pub(crate) ());

impl std::fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gRPC request did not complete within its deadline")
    }
}

impl std::error::Error for TimeoutExpired {}

pub(crate) type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A fully qualified gRPC method path, `/{service}/{method}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: std::borrow::Cow<'static, str>,
    method: std::borrow::Cow<'static, str>,
}

impl MethodDescriptor {
    /// Creates a new method descriptor from a service and method name.
    pub const fn new(service: &'static str, method: &'static str) -> Self {
        Self {
            service: std::borrow::Cow::Borrowed(service),
            method: std::borrow::Cow::Borrowed(method),
        }
    }

    /// The service name, e.g. `greeter.Greeter`.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method name, e.g. `SayHello`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The `/service/method` path this descriptor derives.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// Parses `/service/method` into a descriptor, failing if either segment is empty.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.strip_prefix('/')?;
        let (service, method) = path.split_once('/')?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }
        Some(Self {
            service: std::borrow::Cow::Owned(service.to_owned()),
            method: std::borrow::Cow::Owned(method.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_descriptor_round_trips_through_path() {
        let d = MethodDescriptor::new("greeter.Greeter", "SayHello");
        assert_eq!(d.path(), "/greeter.Greeter/SayHello");
        assert_eq!(MethodDescriptor::from_path(&d.path()).unwrap(), d);
    }

    #[test]
    fn method_descriptor_rejects_malformed_paths() {
        assert!(MethodDescriptor::from_path("no-leading-slash").is_none());
        assert!(MethodDescriptor::from_path("/onlyservice").is_none());
        assert!(MethodDescriptor::from_path("//method").is_none());
        assert!(MethodDescriptor::from_path("/service/").is_none());
        assert!(MethodDescriptor::from_path("/service/a/b").is_none());
    }
}
