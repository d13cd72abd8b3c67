use crate::body::Body;
use http::{
    header::HeaderValue,
    uri::{PathAndQuery, Uri},
    Request,
};
use std::future::Ready;

/// Rewrites an outbound request's `:scheme`/`:authority` (and the `host` header, if present) to
/// the endpoint's configured origin, leaving the gRPC `:path` untouched.
#[derive(Clone)]
pub(crate) struct AddOrigin {
    scheme: http::uri::Scheme,
    authority: http::uri::Authority,
    origin_header: HeaderValue,
}

impl AddOrigin {
    pub(crate) fn new(origin: Uri) -> Result<Self, crate::BoxError> {
        let parts = origin.into_parts();
        let scheme = parts.scheme.ok_or("origin URI is missing a scheme")?;
        let authority = parts.authority.ok_or("origin URI is missing an authority")?;
        let origin_header = HeaderValue::from_str(authority.as_str())?;

        Ok(Self {
            scheme,
            authority,
            origin_header,
        })
    }

    pub(crate) fn to_request_fn(
        &self,
    ) -> impl FnOnce(Request<Body>) -> Ready<Request<Body>> + Clone {
        let this = self.clone();
        move |req| std::future::ready(this.apply(req))
    }

    fn apply(&self, req: Request<Body>) -> Request<Body> {
        let (mut parts, body) = req.into_parts();

        let pq = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        parts.uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(pq)
            .build()
            .expect("scheme, authority and path_and_query are all individually valid");

        parts
            .headers
            .insert(http::header::HOST, self.origin_header.clone());

        Request::from_parts(parts, body)
    }
}

impl std::fmt::Debug for AddOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddOrigin")
            .field("authority", &self.authority)
            .finish()
    }
}

/// Sets `user-agent` on outbound requests, appending a caller-provided value to this crate's own
/// identifier if one was configured on the [`Endpoint`](crate::transport::Endpoint).
#[derive(Clone, Debug)]
pub(crate) struct UserAgent {
    value: HeaderValue,
}

impl UserAgent {
    pub(crate) fn new(user_supplied: Option<HeaderValue>) -> Self {
        let value = match user_supplied {
            Some(v) => {
                let merged = format!("{} {}", v.to_str().unwrap_or(""), base_user_agent());
                HeaderValue::from_str(merged.trim()).unwrap_or_else(|_| base_user_agent_value())
            }
            None => base_user_agent_value(),
        };

        Self { value }
    }

    pub(crate) fn to_request_fn(
        &self,
    ) -> impl FnOnce(Request<Body>) -> Ready<Request<Body>> + Clone {
        let value = self.value.clone();
        move |mut req| {
            req.headers_mut().insert(http::header::USER_AGENT, value);
            std::future::ready(req)
        }
    }
}

fn base_user_agent() -> String {
    format!("grpc-core-rs/{}", env!("CARGO_PKG_VERSION"))
}

fn base_user_agent_value() -> HeaderValue {
    HeaderValue::from_str(&base_user_agent()).expect("crate version is always a valid header value")
}
