//! Client-side RPC dispatch: turns a [`tower_service::Service`] transporting raw HTTP/2 request
//! and response bodies into the typed per-call API in [`grpc`].

pub mod grpc;

pub use grpc::Grpc;

use std::{
    future::Future,
    task::{Context, Poll},
};
use tower_service::Service;

/// The bound [`Grpc`] needs on its inner transport: a request/response service over raw HTTP
/// bodies, with an error type that can be folded into a terminal [`crate::Status`].
pub trait GrpcService<ReqBody> {
    type ResponseBody;
    type Error: Into<crate::BoxError>;
    type Future: Future<Output = Result<http::Response<Self::ResponseBody>, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future;
}

impl<T, ReqBody, ResBody> GrpcService<ReqBody> for T
where
    T: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    T::Error: Into<crate::BoxError>,
{
    type ResponseBody = ResBody;
    type Error = T::Error;
    type Future = T::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(self, cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        Service::call(self, request)
    }
}
