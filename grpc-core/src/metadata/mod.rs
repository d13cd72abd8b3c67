//! Mapping between HPACK header lists and gRPC metadata.
//!
//! Keys ending in `-bin` carry base64-encoded binary values on the wire; every other key is
//! ASCII/UTF-8 text. Pseudo-headers and gRPC/HTTP framing headers are reserved and filtered from
//! user-visible metadata.

use base64::Engine as _;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;

pub(crate) const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
pub(crate) const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
pub(crate) const GRPC_STATUS_DETAILS_BIN: HeaderName =
    HeaderName::from_static("grpc-status-details-bin");
pub const GRPC_TIMEOUT_HEADER: HeaderName = HeaderName::from_static("grpc-timeout");
pub(crate) const GRPC_ENCODING_HEADER: HeaderName = HeaderName::from_static("grpc-encoding");
pub(crate) const GRPC_ACCEPT_ENCODING_HEADER: HeaderName =
    HeaderName::from_static("grpc-accept-encoding");

pub const GRPC_CONTENT_TYPE_STR: &str = "application/grpc";
pub const GRPC_CONTENT_TYPE: HeaderValue = HeaderValue::from_static(GRPC_CONTENT_TYPE_STR);

const BIN_SUFFIX: &str = "-bin";

/// True if `name` is one of the pseudo-headers or gRPC/HTTP framing headers that never surface as
/// user metadata.
pub(crate) fn is_reserved_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-type" | "te" | "user-agent" | "grpc-timeout"
    ) || name.as_str().starts_with("grpc-")
}

/// Requires a `content-type` beginning with `application/grpc` (`+proto`, `+json` and friends
/// match by prefix), producing the terminal status mandated for requests and responses that lack
/// one.
pub(crate) fn check_grpc_content_type(headers: &HeaderMap) -> Result<(), crate::Status> {
    match headers.get(http::header::CONTENT_TYPE) {
        None => Err(crate::Status::internal("Missing content-type header")),
        Some(value) => {
            let is_grpc = value
                .to_str()
                .map(|v| v.starts_with(GRPC_CONTENT_TYPE_STR))
                .unwrap_or(false);
            if is_grpc {
                Ok(())
            } else {
                Err(crate::Status::internal(format!(
                    "Invalid content-type: {value:?}"
                )))
            }
        }
    }
}

/// An ordered multimap of gRPC metadata: either UTF-8 text values, or (for `-bin` keys) opaque
/// byte values carried as base64 on the wire.
#[derive(Clone, Default)]
pub struct MetadataMap {
    headers: HeaderMap,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
        }
    }

    /// Builds a metadata map from a raw header map, dropping reserved headers and decoding
    /// `-bin` values from base64 (invalid base64 values are dropped).
    pub fn from_headers(headers: HeaderMap) -> Self {
        let mut out = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if is_reserved_header(name) {
                continue;
            }
            if name.as_str().ends_with(BIN_SUFFIX) {
                // Validate base64 now so `iter_binary` never has to fail; invalid entries are
                // dropped, matching the lenient-decode posture used for `grpc-message`.
                if base64::engine::general_purpose::STANDARD_NO_PAD
                    .decode(value.as_bytes())
                    .is_err()
                    && base64::engine::general_purpose::STANDARD
                        .decode(value.as_bytes())
                        .is_err()
                {
                    continue;
                }
            }
            out.append(name.clone(), value.clone());
        }
        Self { headers: out }
    }

    /// Consumes this map, re-exposing it as a raw header map suitable for an HTTP/2 frame.
    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Gets the first UTF-8 text value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Gets the first binary value for a `-bin` key, already base64-decoded.
    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        if !key.ends_with(BIN_SUFFIX) {
            return None;
        }
        let raw = self.headers.get(key)?;
        base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(raw.as_bytes())
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(raw.as_bytes()))
            .ok()
    }

    /// Inserts a UTF-8 text value, replacing any existing values for `key`.
    pub fn insert(&mut self, key: &str, value: impl AsRef<str>) -> Option<()> {
        if key.ends_with(BIN_SUFFIX) {
            return None;
        }
        let name = HeaderName::from_bytes(key.as_bytes()).ok()?;
        if is_reserved_header(&name) {
            return None;
        }
        let val = HeaderValue::from_str(value.as_ref()).ok()?;
        self.headers.insert(name, val);
        Some(())
    }

    /// Inserts a binary value under a `-bin` key, base64-encoding it for the wire.
    pub fn insert_bin(&mut self, key: &str, value: impl AsRef<[u8]>) -> Option<()> {
        if !key.ends_with(BIN_SUFFIX) {
            return None;
        }
        let name = HeaderName::from_bytes(key.as_bytes()).ok()?;
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(value.as_ref());
        let val = HeaderValue::from_str(&encoded).ok()?;
        self.headers.insert(name, val);
        Some(())
    }

    pub fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Merges `other` into this map, appending rather than overwriting duplicate keys.
    pub fn merge(&mut self, other: Self) {
        for (name, value) in other.headers {
            if let Some(name) = name {
                self.headers.append(name, value);
            }
        }
    }

    /// Iterates the user-visible text entries (skips `-bin` keys).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().filter_map(|(k, v)| {
            if k.as_str().ends_with(BIN_SUFFIX) {
                None
            } else {
                v.to_str().ok().map(|v| (k.as_str(), v))
            }
        })
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Strips a trailing `:port` from an authority when the preceding segment is a DNS hostname
/// (ASCII letters/digits/`-`/`.`) and the port is all-digits; used to compute the SNI host from an
/// `:authority` value. IP-literal and otherwise ambiguous authorities are returned unchanged.
pub fn sanitize_authority_for_sni(authority: &str) -> &str {
    let Some(idx) = authority.rfind(':') else {
        return authority;
    };
    let (host, port) = (&authority[..idx], &authority[idx + 1..]);

    if host.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) || port.is_empty() {
        return authority;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return authority;
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_value_round_trips() {
        let mut map = MetadataMap::new();
        map.insert("x-my-header", "hello").unwrap();
        assert_eq!(map.get("x-my-header"), Some("hello"));
    }

    #[test]
    fn binary_value_round_trips() {
        let mut map = MetadataMap::new();
        map.insert_bin("x-trace-bin", [1u8, 2, 3, 255]).unwrap();
        assert_eq!(map.get_bin("x-trace-bin"), Some(vec![1, 2, 3, 255]));
    }

    #[test]
    fn reserved_headers_are_filtered_on_ingest() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("grpc-encoding", HeaderValue::from_static("gzip"));
        headers.insert("user-agent", HeaderValue::from_static("grpc-core-rs"));
        headers.insert("x-user-key", HeaderValue::from_static("value"));

        let map = MetadataMap::from_headers(headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-user-key"), Some("value"));
    }

    #[test]
    fn content_type_check_matches_on_prefix() {
        let mut headers = HeaderMap::new();
        let err = check_grpc_content_type(&headers).unwrap_err();
        assert_eq!(err.message(), "Missing content-type header");

        headers.insert("content-type", HeaderValue::from_static("application/grpc+proto"));
        assert!(check_grpc_content_type(&headers).is_ok());

        headers.insert("content-type", HeaderValue::from_static("text/html"));
        assert!(check_grpc_content_type(&headers).is_err());
    }

    #[test]
    fn sni_authority_sanitization_matches_scenario_table() {
        assert_eq!(sanitize_authority_for_sni("foo.example.com"), "foo.example.com");
        assert_eq!(
            sanitize_authority_for_sni("foo.example.com:31415"),
            "foo.example.com"
        );
        assert_eq!(
            sanitize_authority_for_sni("foo.example-31415"),
            "foo.example-31415"
        );
        assert_eq!(
            sanitize_authority_for_sni("foo.example.com:abc123"),
            "foo.example.com:abc123"
        );
    }

    #[test]
    fn sni_authority_sanitization_leaves_ipv6_literals_alone() {
        assert_eq!(
            sanitize_authority_for_sni("[::1]:50051"),
            "[::1]:50051"
        );
    }
}
