//! Server-side RPC dispatch: the four call-shape traits a generated service implements, and the
//! [`Grpc`] handler that maps an inbound HTTP/2 request onto one of them.

mod grpc;

pub use grpc::Grpc;

use crate::{Request, Response, Status};
use std::future::Future;
use tokio_stream::Stream;

/// A unary call: one request message, one response message.
pub trait UnaryService<R> {
    type Response;
    type Future: Future<Output = Result<Response<Self::Response>, Status>>;

    fn call(&mut self, request: Request<R>) -> Self::Future;
}

/// A client-streaming call: a stream of request messages, one response message.
pub trait ClientStreamingService<R> {
    type Response;
    type Future: Future<Output = Result<Response<Self::Response>, Status>>;

    fn call(&mut self, request: Request<crate::codec::Streaming<R>>) -> Self::Future;
}

/// A server-streaming call: one request message, a stream of response messages.
pub trait ServerStreamingService<R> {
    type Response;
    type ResponseStream: Stream<Item = Result<Self::Response, Status>>;
    type Future: Future<Output = Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<R>) -> Self::Future;
}

/// A bidirectional-streaming call: a stream of request messages, a stream of response messages.
pub trait StreamingService<R> {
    type Response;
    type ResponseStream: Stream<Item = Result<Self::Response, Status>>;
    type Future: Future<Output = Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<crate::codec::Streaming<R>>) -> Self::Future;
}
