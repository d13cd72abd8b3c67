use crate::metadata::{MetadataMap, GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS_BIN};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};
use std::{borrow::Cow, fmt, sync::Arc};

/// Characters that must be percent-encoded in `grpc-message`: anything outside the printable
/// ASCII range plus `%` itself.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// The result of a single RPC: a [`Code`] and a human readable message, mirroring the
/// `grpc-status`/`grpc-message` trailer pair.
#[derive(Clone)]
pub struct Status(Box<StatusInner>);

#[derive(Clone)]
struct StatusInner {
    code: Code,
    message: Cow<'static, str>,
    /// Opaque `grpc-status-details-bin` payload, passed through but never interpreted here.
    details: Bytes,
    metadata: MetadataMap,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Status {
    /// Creates a new status with the given code and message.
    pub fn new(code: Code, message: impl Into<Cow<'static, str>>) -> Self {
        Self(Box::new(StatusInner {
            code,
            message: message.into(),
            details: Bytes::new(),
            metadata: MetadataMap::new(),
            source: None,
        }))
    }

    pub fn ok(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Ok, message)
    }
    pub fn cancelled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Cancelled, message)
    }
    pub fn unknown(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unknown, message)
    }
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }
    pub fn deadline_exceeded(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }
    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::NotFound, message)
    }
    pub fn already_exists(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }
    pub fn permission_denied(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }
    pub fn resource_exhausted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }
    pub fn failed_precondition(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Aborted, message)
    }
    pub fn out_of_range(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::OutOfRange, message)
    }
    pub fn unimplemented(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unimplemented, message)
    }
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Internal, message)
    }
    pub fn unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unavailable, message)
    }
    pub fn data_loss(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::DataLoss, message)
    }
    pub fn unauthenticated(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn code(&self) -> Code {
        self.0.code
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// The opaque `grpc-status-details-bin` payload, if one was set.
    pub fn details(&self) -> &[u8] {
        &self.0.details
    }

    pub fn with_details(code: Code, message: impl Into<Cow<'static, str>>, details: Bytes) -> Self {
        let mut status = Self::new(code, message);
        status.0.details = details;
        status
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.0.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.0.metadata
    }

    /// Records the underlying error this status was derived from, for diagnostics.
    pub fn set_source(&mut self, source: Arc<dyn std::error::Error + Send + Sync + 'static>) {
        self.0.source = Some(source);
    }

    /// Builds a [`Status`] from any boxed error, preserving a `Status` already present in the
    /// source chain and otherwise falling back to [`Code::Unknown`].
    pub fn from_error(err: crate::BoxError) -> Self {
        Self::try_from_error(err).unwrap_or_else(|err| {
            let mut status = Self::new(Code::Unknown, err.to_string());
            status.set_source(Arc::from(err));
            status
        })
    }

    pub(crate) fn from_error_generic<E>(err: E) -> Self
    where
        E: Into<crate::BoxError>,
    {
        Self::from_error(err.into())
    }

    /// Walks the error's source chain looking for something that maps to a terminal status: a
    /// previously produced [`Status`], an expired deadline, or an HTTP/2 protocol error.
    pub fn try_from_error(err: crate::BoxError) -> Result<Self, crate::BoxError> {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err.as_ref());
        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Self>() {
                return Ok(status.clone());
            }
            if let Some(timeout) = err.downcast_ref::<crate::TimeoutExpired>() {
                return Ok(Self::deadline_exceeded(timeout.to_string()));
            }
            #[cfg(any(feature = "channel", feature = "server"))]
            if let Some(h2) = err.downcast_ref::<h2::Error>() {
                return Ok(Self::from_h2_error(h2));
            }
            cause = err.source();
        }
        Err(err)
    }

    /// Maps an `h2` stream or connection error to the status an RPC caller observes.
    #[cfg(any(feature = "channel", feature = "server"))]
    pub(crate) fn from_h2_error(err: &h2::Error) -> Self {
        use h2::Reason;

        match err.reason() {
            Some(Reason::CANCEL) => Self::cancelled("Received RST_STREAM with CANCEL"),
            Some(Reason::REFUSED_STREAM) => {
                Self::unavailable("Received RST_STREAM with REFUSED_STREAM")
            }
            Some(Reason::ENHANCE_YOUR_CALM) => {
                Self::resource_exhausted(format!("h2 protocol error: {err}"))
            }
            Some(Reason::INADEQUATE_SECURITY) => {
                Self::permission_denied(format!("h2 protocol error: {err}"))
            }
            Some(_) if err.is_reset() => Self::unavailable(
                "Stream unexpectedly closed: a RST_STREAM frame was received.",
            ),
            Some(_) => Self::internal(format!("h2 protocol error: {err}")),
            None if err.is_io() || err.is_go_away() => {
                Self::unavailable("Stream unexpectedly closed.")
            }
            None => Self::unknown(format!("h2 protocol error: {err}")),
        }
    }

    /// Detects a trailers-only response by reading `grpc-status`/`grpc-message` from a header
    /// map, without requiring a separate trailers frame.
    pub fn from_header_map(headers: &HeaderMap) -> Option<Self> {
        let code = Code::from_bytes(headers.get(GRPC_STATUS)?.as_bytes());

        let message = match headers.get(GRPC_MESSAGE) {
            Some(v) => decode_grpc_message(v.as_bytes()),
            None => String::new(),
        };

        let details = match headers.get(GRPC_STATUS_DETAILS_BIN) {
            Some(v) => base64::Engine::decode(&base64::engine::general_purpose::STANDARD, v)
                .map(Bytes::from)
                .unwrap_or_default(),
            None => Bytes::new(),
        };

        let mut other = headers.clone();
        other.remove(GRPC_STATUS);
        other.remove(GRPC_MESSAGE);
        other.remove(GRPC_STATUS_DETAILS_BIN);

        Some(Self(Box::new(StatusInner {
            code,
            message: Cow::Owned(message),
            details,
            metadata: MetadataMap::from_headers(other),
            source: None,
        })))
    }

    /// Serializes this status into `grpc-status`/`grpc-message`/`grpc-status-details-bin` trailer
    /// headers, plus any user-set trailing metadata.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = self.0.metadata.clone().into_headers();
        map.insert(GRPC_STATUS, self.0.code.to_header_value());
        if !self.0.message.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&encode_grpc_message(&self.0.message)) {
                map.insert(GRPC_MESSAGE, v);
            }
        }
        if !self.0.details.is_empty() {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &self.0.details);
            if let Ok(v) = HeaderValue::from_str(&encoded) {
                map.insert(GRPC_STATUS_DETAILS_BIN, v);
            }
        }
        map
    }

    /// Turns this status into a trailers-only HTTP/2 response: `:status=200`,
    /// `content-type: application/grpc`, and the `grpc-status`/`grpc-message` trailers promoted to
    /// headers (permitted for the single-HEADERS-frame trailers-only form).
    pub fn to_http<B: Default>(&self) -> http::Response<B> {
        let mut headers = self.to_header_map();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(crate::metadata::GRPC_CONTENT_TYPE_STR),
        );

        let mut response = http::Response::new(B::default());
        *response.status_mut() = StatusCode::OK;
        *response.headers_mut() = headers;
        response
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.0.code)
            .field("message", &self.0.message)
            .field("details", &self.0.details)
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, message: {:?}", self.0.code, self.0.message)
    }
}

impl std::error::Error for Status {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::WouldBlock
            | ErrorKind::WriteZero
            | ErrorKind::Interrupted => Code::Internal,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted => Code::Unavailable,
            ErrorKind::InvalidData => Code::DataLoss,
            ErrorKind::InvalidInput => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::PermissionDenied => Code::PermissionDenied,
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            _ => Code::Unknown,
        };
        let mut status = Self::new(code, err.to_string());
        status.set_source(Arc::new(err));
        status
    }
}

/// Maps a non-`200` initial-response HTTP status code or a trailers-less `200` response to a
/// terminal [`Status`], per §4.M.
pub(crate) fn infer_grpc_status(
    trailers: Option<&HeaderMap>,
    status_code: StatusCode,
) -> Result<(), Option<Status>> {
    if let Some(trailers) = trailers {
        if let Some(status) = Status::from_header_map(trailers) {
            return if status.code() == Code::Ok {
                Ok(())
            } else {
                Err(Some(status))
            };
        }
    }

    let code = match status_code {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        // A 200 with no trailers means the stream ended without a status; treat it as "done,
        // no error to report" rather than synthesizing one.
        StatusCode::OK => return Err(None),
        _ => Code::Unknown,
    };

    Err(Some(Status::new(
        code,
        "Unexpected non-200 HTTP Status Code.".to_string(),
    )))
}

/// gRPC status codes, see <https://github.com/grpc/grpc/blob/master/doc/statuscodes.md>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub const fn from_i32(i: i32) -> Self {
        match i {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<i32>().ok()) {
            Some(i) => Self::from_i32(i),
            None => Self::Unknown,
        }
    }

    fn to_header_value(self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Self::Ok => "0",
            Self::Cancelled => "1",
            Self::Unknown => "2",
            Self::InvalidArgument => "3",
            Self::DeadlineExceeded => "4",
            Self::NotFound => "5",
            Self::AlreadyExists => "6",
            Self::PermissionDenied => "7",
            Self::ResourceExhausted => "8",
            Self::FailedPrecondition => "9",
            Self::Aborted => "10",
            Self::OutOfRange => "11",
            Self::Unimplemented => "12",
            Self::Internal => "13",
            Self::Unavailable => "14",
            Self::DataLoss => "15",
            Self::Unauthenticated => "16",
        })
    }

    /// A short machine-readable name, as used by interop tooling (`grpcurl`-style output).
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        Self::from_i32(i)
    }
}

impl TryFrom<&str> for Code {
    type Error = ();

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "OK" => Self::Ok,
            "CANCELLED" => Self::Cancelled,
            "UNKNOWN" => Self::Unknown,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "NOT_FOUND" => Self::NotFound,
            "ALREADY_EXISTS" => Self::AlreadyExists,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "ABORTED" => Self::Aborted,
            "OUT_OF_RANGE" => Self::OutOfRange,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "INTERNAL" => Self::Internal,
            "UNAVAILABLE" => Self::Unavailable,
            "DATA_LOSS" => Self::DataLoss,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Percent-encodes a `grpc-message` value: bytes outside `0x20..=0x7E` and `%` become `%HH`.
pub(crate) fn encode_grpc_message(msg: &str) -> String {
    percent_encode(msg.as_bytes(), GRPC_MESSAGE_ENCODE_SET).to_string()
}

/// Percent-decodes a `grpc-message` value, substituting U+FFFD for invalid UTF-8 rather than
/// failing.
pub(crate) fn decode_grpc_message(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => percent_decode_str(s).decode_utf8_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_wire_bytes() {
        for code in [
            Code::Ok,
            Code::Cancelled,
            Code::Unknown,
            Code::InvalidArgument,
            Code::DeadlineExceeded,
            Code::NotFound,
            Code::AlreadyExists,
            Code::PermissionDenied,
            Code::ResourceExhausted,
            Code::FailedPrecondition,
            Code::Aborted,
            Code::OutOfRange,
            Code::Unimplemented,
            Code::Internal,
            Code::Unavailable,
            Code::DataLoss,
            Code::Unauthenticated,
        ] {
            let status = Status::new(code, "");
            let headers = status.to_header_map();
            let round_tripped = Status::from_header_map(&headers).unwrap();
            assert_eq!(round_tripped.code(), code);
        }
    }

    #[test]
    fn unknown_numeric_code_maps_to_unknown() {
        assert_eq!(Code::from_i32(999), Code::Unknown);
        assert_eq!(Code::from_bytes(b"not-a-number"), Code::Unknown);
    }

    #[quickcheck_macros::quickcheck]
    fn grpc_message_percent_encoding_round_trips(msg: String) -> bool {
        let encoded = encode_grpc_message(&msg);
        decode_grpc_message(encoded.as_bytes()) == msg
    }

    #[test]
    fn grpc_message_encodes_control_bytes_and_percent() {
        let encoded = encode_grpc_message("a b%c\nd");
        assert_eq!(encoded, "a%20b%25c%0Ad");
        assert_eq!(decode_grpc_message(encoded.as_bytes()), "a b%c\nd");
    }

    #[test]
    fn infer_grpc_status_maps_non_200_ranges() {
        assert_eq!(
            infer_grpc_status(None, StatusCode::BAD_REQUEST)
                .unwrap_err()
                .unwrap()
                .code(),
            Code::Internal
        );
        assert_eq!(
            infer_grpc_status(None, StatusCode::UNAUTHORIZED)
                .unwrap_err()
                .unwrap()
                .code(),
            Code::Unauthenticated
        );
        assert_eq!(
            infer_grpc_status(None, StatusCode::FORBIDDEN)
                .unwrap_err()
                .unwrap()
                .code(),
            Code::PermissionDenied
        );
        assert_eq!(
            infer_grpc_status(None, StatusCode::NOT_FOUND)
                .unwrap_err()
                .unwrap()
                .code(),
            Code::Unimplemented
        );
        for sc in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(
                infer_grpc_status(None, sc).unwrap_err().unwrap().code(),
                Code::Unavailable
            );
        }
        assert_eq!(
            infer_grpc_status(None, StatusCode::IM_A_TEAPOT)
                .unwrap_err()
                .unwrap()
                .code(),
            Code::Unknown
        );
    }

    #[test]
    fn infer_grpc_status_on_trailerless_200_is_silent_end_of_stream() {
        assert!(matches!(infer_grpc_status(None, StatusCode::OK), Err(None)));
    }

    #[test]
    fn infer_grpc_status_prefers_trailers_grpc_status() {
        let status = Status::ok("");
        let headers = status.to_header_map();
        assert!(infer_grpc_status(Some(&headers), StatusCode::OK).is_ok());
    }
}
