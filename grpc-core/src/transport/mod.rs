//! Connection management for both ends of the transport.
//!
//! The [`channel`] side owns name resolution, connect-with-backoff, keepalive, idle timeout and
//! load balancing; the [`server`] side owns the listener, per-connection settings and graceful
//! shutdown. Both are thin orchestrations over `hyper`'s HTTP/2 connection types; the gRPC
//! semantics live in the per-stream machinery under [`crate::client`], [`crate::server`] and
//! [`crate::codec`].

#[cfg(feature = "channel")]
pub mod channel;
#[cfg(feature = "server")]
pub mod server;

mod error;
pub(crate) mod service;

pub use self::error::Error;

#[cfg(feature = "channel")]
pub use self::channel::{Change, Channel, CloseReason, ConnectionEvent, Endpoint, RetryThrottle};
#[cfg(feature = "server")]
pub use self::server::{NamedService, Routes, Server, TcpIncoming};
