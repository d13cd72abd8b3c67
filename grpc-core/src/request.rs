use crate::metadata::MetadataMap;
use http::Extensions;

/// A gRPC request: an application message plus outbound/inbound metadata and request extensions.
#[derive(Debug, Clone)]
pub struct Request<T> {
    metadata: MetadataMap,
    message: T,
    extensions: Extensions,
}

/// Controls whether [`Request::into_http`] strips reserved pseudo-header names that a caller might
/// accidentally have placed in user metadata before handing headers to the HTTP/2 layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeHeaders {
    Yes,
    No,
}

impl<T> Request<T> {
    pub fn new(message: T) -> Self {
        Self {
            metadata: MetadataMap::new(),
            message,
            extensions: Extensions::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.message
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Applies `f` to the wrapped message, keeping metadata and extensions.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Request<U> {
        Request {
            metadata: self.metadata,
            message: f(self.message),
            extensions: self.extensions,
        }
    }

    pub(crate) fn from_http_parts(parts: http::request::Parts, message: T) -> Self {
        Self {
            metadata: MetadataMap::from_headers(parts.headers),
            message,
            extensions: parts.extensions,
        }
    }

    pub(crate) fn from_http(request: http::Request<T>) -> Self {
        let (parts, message) = request.into_parts();
        Self::from_http_parts(parts, message)
    }

    /// Converts this request into an `http::Request`, applying the gRPC URI and method and
    /// copying user metadata into the header map.
    pub(crate) fn into_http(
        self,
        uri: http::Uri,
        method: http::Method,
        version: http::Version,
        sanitize: SanitizeHeaders,
    ) -> http::Request<T> {
        let mut request = http::Request::new(self.message);
        *request.uri_mut() = uri;
        *request.method_mut() = method;
        *request.version_mut() = version;
        *request.extensions_mut() = self.extensions;

        let mut headers = self.metadata.into_headers();
        if sanitize == SanitizeHeaders::Yes {
            for reserved in [":method", ":scheme", ":path", ":authority"] {
                headers.remove(reserved);
            }
        }
        *request.headers_mut() = headers;

        request
    }
}
