//! Identity, gzip and deflate compression for framed gRPC messages.

use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderValue};
use std::fmt;

pub(crate) use crate::metadata::{GRPC_ACCEPT_ENCODING_HEADER as ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER as ENCODING_HEADER};

/// A single compression algorithm understood by this build; `identity` is represented as the
/// absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionEncoding {
    #[cfg(feature = "gzip")]
    Gzip,
    #[cfg(feature = "deflate")]
    Deflate,
}

impl CompressionEncoding {
    fn as_str(self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            Self::Deflate => "deflate",
        }
    }

    pub(crate) fn into_header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }

    /// Parses the `grpc-encoding` header of an outbound request/response, returning `Ok(None)` for
    /// `identity` or an absent header, and `Err` (a terminal `internal` status) for an algorithm
    /// this build does not support.
    pub fn from_encoding_header(
        headers: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Result<Option<Self>, Status> {
        let Some(value) = headers.get(ENCODING_HEADER) else {
            return Ok(None);
        };
        let name = value.to_str().unwrap_or("");
        if name == "identity" {
            return Ok(None);
        }
        let encoding = match name {
            #[cfg(feature = "gzip")]
            "gzip" => Self::Gzip,
            #[cfg(feature = "deflate")]
            "deflate" => Self::Deflate,
            other => {
                return Err(Status::new(
                    Code::Internal,
                    format!(
                        "The server picked a compression algorithm ('{other}') the client does not know about."
                    ),
                ))
            }
        };
        if !enabled.is_enabled(encoding) {
            return Err(Status::new(
                Code::Internal,
                format!(
                    "The server picked a compression algorithm ('{}') the client does not know about.",
                    encoding.as_str()
                ),
            ));
        }
        Ok(Some(encoding))
    }

    /// Parses the accept-encoding header sent by a peer to determine which compression encodings
    /// it is willing to receive, filtered to what we support locally.
    pub fn from_accept_encoding_header(
        headers: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Option<Self> {
        let value = headers.get(ACCEPT_ENCODING_HEADER)?;
        let value = value.to_str().ok()?;
        value.split(',').map(str::trim).find_map(|name| match name {
            #[cfg(feature = "gzip")]
            "gzip" if enabled.gzip => Some(Self::Gzip),
            #[cfg(feature = "deflate")]
            "deflate" if enabled.deflate => Some(Self::Deflate),
            _ => None,
        })
    }
}

impl fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bitmask of which compression algorithms are acceptable; `identity` is always implicitly
/// accepted and is not represented as a bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledCompressionEncodings {
    gzip: bool,
    deflate: bool,
}

impl EnabledCompressionEncodings {
    pub fn enable(&mut self, encoding: CompressionEncoding) {
        match encoding {
            #[cfg(feature = "gzip")]
            CompressionEncoding::Gzip => self.gzip = true,
            #[cfg(feature = "deflate")]
            CompressionEncoding::Deflate => self.deflate = true,
        }
    }

    pub fn is_enabled(&self, encoding: CompressionEncoding) -> bool {
        match encoding {
            #[cfg(feature = "gzip")]
            CompressionEncoding::Gzip => self.gzip,
            #[cfg(feature = "deflate")]
            CompressionEncoding::Deflate => self.deflate,
        }
    }

    /// Whether a peer-declared `grpc-encoding` wire name is one this endpoint can decode;
    /// `identity` always is.
    pub(crate) fn is_name_enabled(&self, name: &str) -> bool {
        match name {
            "identity" => true,
            "gzip" => self.gzip,
            "deflate" => self.deflate,
            _ => false,
        }
    }

    /// Builds the CSV `grpc-accept-encoding` header value, always including `identity`.
    pub fn into_accept_encoding_header_value(self) -> Option<HeaderValue> {
        let mut algos = vec!["identity"];
        if self.gzip {
            algos.push("gzip");
        }
        if self.deflate {
            algos.push("deflate");
        }
        HeaderValue::from_str(&algos.join(",")).ok()
    }
}

/// Compresses `input` with `encoding` into a freshly allocated buffer.
pub(crate) fn compress(encoding: CompressionEncoding, input: &[u8]) -> Result<Bytes, Status> {
    #[cfg(any(feature = "gzip", feature = "deflate"))]
    use std::io::Write;
    #[cfg(not(any(feature = "gzip", feature = "deflate")))]
    let _ = input;

    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(input)
                .and_then(|_| enc.finish())
                .map(Bytes::from)
                .map_err(|e| Status::new(Code::Internal, format!("Compression failed: {e}")))
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let mut enc =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(input)
                .and_then(|_| enc.finish())
                .map(Bytes::from)
                .map_err(|e| Status::new(Code::Internal, format!("Compression failed: {e}")))
        }
    }
}

/// Decompresses exactly `len` bytes from the front of `buf` with `encoding`, appending the result
/// into `out`.
pub(crate) fn decompress(
    encoding: CompressionEncoding,
    buf: &mut BytesMut,
    out: &mut BytesMut,
    len: usize,
) -> Result<(), Status> {
    #[cfg(any(feature = "gzip", feature = "deflate"))]
    use std::io::Write;
    #[cfg(not(any(feature = "gzip", feature = "deflate")))]
    let _ = (&buf, &out, &len);

    let result: std::io::Result<Vec<u8>> = match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut dec = flate2::write::GzDecoder::new(Vec::new());
            dec.write_all(&buf[..len]).and_then(|_| dec.finish())
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let mut dec = flate2::write::DeflateDecoder::new(Vec::new());
            dec.write_all(&buf[..len]).and_then(|_| dec.finish())
        }
    };
    buf.advance(len);
    match result {
        Ok(decoded) => {
            out.put_slice(&decoded);
            Ok(())
        }
        Err(e) => Err(Status::new(Code::Internal, format!("Error decompressing: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_round_trips() {
        let input = b"hello gRPC world, this is a framed message payload";
        let compressed = compress(CompressionEncoding::Gzip, input).unwrap();

        let mut buf = BytesMut::from(&compressed[..]);
        let mut out = BytesMut::new();
        decompress(CompressionEncoding::Gzip, &mut buf, &mut out, compressed.len()).unwrap();
        assert_eq!(&out[..], input);
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn deflate_round_trips() {
        let input = b"another payload, deflated this time";
        let compressed = compress(CompressionEncoding::Deflate, input).unwrap();

        let mut buf = BytesMut::from(&compressed[..]);
        let mut out = BytesMut::new();
        decompress(CompressionEncoding::Deflate, &mut buf, &mut out, compressed.len()).unwrap();
        assert_eq!(&out[..], input);
    }

    #[test]
    fn accept_encoding_header_always_includes_identity() {
        let enabled = EnabledCompressionEncodings::default();
        let header = enabled.into_accept_encoding_header_value().unwrap();
        assert_eq!(header, "identity");
    }
}
