use crate::body::Body;
use crate::{MethodDescriptor, Status};
use std::{
    collections::HashMap,
    convert::Infallible,
    task::{Context, Poll},
};
use tower::util::BoxCloneService;
use tower_service::Service;

/// Implemented by generated service types so [`Routes`] can route by service name.
pub trait NamedService {
    /// The fully qualified protobuf service name, e.g. `greeter.Greeter`.
    const NAME: &'static str;
}

/// Dispatches inbound RPCs to registered services by the service segment of the request path.
///
/// Unknown services and malformed paths get a trailers-only `unimplemented` response, per the
/// gRPC routing contract.
#[derive(Default, Clone)]
pub struct Routes {
    services: HashMap<&'static str, BoxCloneService<http::Request<Body>, http::Response<Body>, Infallible>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service<S>(mut self, svc: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.services.insert(S::NAME, BoxCloneService::new(svc));
        self
    }

    fn unimplemented(path: &str) -> http::Response<Body> {
        Status::unimplemented(format!("service not found for path {path}")).to_http()
    }
}

impl Service<http::Request<Body>> for Routes {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = crate::BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        use tower::ServiceExt;

        let matched = MethodDescriptor::from_path(req.uri().path())
            .and_then(|descriptor| self.services.get(descriptor.service()).cloned());

        match matched {
            Some(svc) => Box::pin(svc.oneshot(req)),
            None => {
                let response = Self::unimplemented(req.uri().path());
                Box::pin(std::future::ready(Ok(response)))
            }
        }
    }
}

impl std::fmt::Debug for Routes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routes")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Echo;

    impl NamedService for Echo {
        const NAME: &'static str = "test.Echo";
    }

    impl Service<http::Request<Body>> for Echo {
        type Response = http::Response<Body>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: http::Request<Body>) -> Self::Future {
            std::future::ready(Ok(http::Response::new(Body::empty())))
        }
    }

    #[tokio::test]
    async fn routes_by_the_service_segment_of_the_path() {
        use tower::ServiceExt;

        let routes = Routes::new().add_service(Echo);

        let req = http::Request::builder()
            .uri("http://localhost/test.Echo/Ping")
            .body(Body::empty())
            .unwrap();
        let res = routes.clone().oneshot(req).await.unwrap();
        assert!(res.headers().get("grpc-status").is_none());

        let req = http::Request::builder()
            .uri("http://localhost/test.Unknown/Ping")
            .body(Body::empty())
            .unwrap();
        let res = routes.oneshot(req).await.unwrap();
        assert_eq!(
            res.headers().get("grpc-status").map(|v| v.to_str().unwrap()),
            Some("12")
        );
    }
}
