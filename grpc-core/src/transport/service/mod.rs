//! Middleware shared by the channel and server transport stacks.

mod grpc_timeout;
pub(crate) use self::grpc_timeout::GrpcTimeout;

#[cfg(feature = "server")]
mod recover_error;
#[cfg(feature = "server")]
pub(crate) use self::recover_error::RecoverError;
