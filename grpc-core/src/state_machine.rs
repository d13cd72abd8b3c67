//! Per-RPC state machine shared by the client and server sides.
//!
//! Modeled on the tagged-enum-with-explicit-transitions idiom `h2` uses for its per-stream
//! `StreamState` (`Open { local, remote }` tracking each half independently): every transition is a
//! plain function that matches on `self`, validates the move, and returns an [`Action`] for the
//! I/O handler to execute. No I/O happens in here.

use crate::codec::EnabledCompressionEncodings;
use crate::metadata::{check_grpc_content_type, MetadataMap};
use crate::status::{Code, Status};
use crate::MethodDescriptor;
use http::{HeaderMap, Method, StatusCode, Uri};

/// Which end of the RPC this machine is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One half (local or remote) of an RPC's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    /// No HEADERS sent/received yet on this half.
    Idle,
    /// HEADERS seen; messages may still follow.
    Open,
    /// This half's end-of-stream has been observed.
    Closed,
}

/// What the I/O handler should do in response to a transition.
#[derive(Debug)]
pub enum Action {
    /// Nothing to deliver; keep reading (e.g. a 1xx informational status).
    Noop,
    /// Initial metadata is ready to hand to the application.
    DeliverMetadata(MetadataMap),
    /// Zero or more application messages were extracted from this frame.
    DeliverMessage,
    /// The RPC has reached its terminal status.
    Close(Status),
}

/// Per-RPC state, independent of transport details.
pub struct StreamMachine {
    role: Role,
    local: Half,
    remote: Half,
}

impl StreamMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            local: Half::Idle,
            remote: Half::Idle,
        }
    }

    /// A machine for a stream whose initial metadata has already been exchanged in both
    /// directions, tracking only the remaining message/trailer transitions. This is the state
    /// the body-level deframer attaches at.
    pub fn mid_stream(role: Role) -> Self {
        Self {
            role,
            local: Half::Open,
            remote: Half::Open,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.local == Half::Closed && self.remote == Half::Closed
    }

    /// Records that this endpoint has sent its own HEADERS (the initial request on the client, the
    /// initial response headers on the server).
    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), Status> {
        if self.local != Half::Idle {
            return Err(self.invalid_state());
        }
        self.local = if end_stream { Half::Closed } else { Half::Open };
        Ok(())
    }

    /// Records that this endpoint sent a message on the already-open local half.
    pub fn send_message(&self) -> Result<(), Status> {
        match self.local {
            Half::Open => Ok(()),
            _ => Err(self.invalid_state()),
        }
    }

    /// Records that this endpoint has finished its outbound half (status + trailers on the server,
    /// end-of-stream on the client).
    pub fn send_close(&mut self) -> Result<(), Status> {
        match self.local {
            Half::Open => {
                self.local = Half::Closed;
                Ok(())
            }
            _ => Err(self.invalid_state()),
        }
    }

    /// Processes an inbound response HEADERS frame on the client: initial metadata, a 1xx
    /// interim response, a trailers-only response, or (on an already-open stream) the trailers.
    pub fn recv_response_headers(
        &mut self,
        status_code: StatusCode,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Action {
        match self.remote {
            Half::Idle => {
                if status_code.is_informational() {
                    return Action::Noop;
                }
                match crate::status::infer_grpc_status(end_stream.then_some(headers), status_code)
                {
                    Err(Some(status)) => self.close_remote_with(status),
                    Err(None) => self.close_remote_with(Status::ok("")),
                    Ok(()) if end_stream => self.close_remote_with(Status::ok("")),
                    Ok(()) => {
                        if let Err(status) = check_grpc_content_type(headers) {
                            return self.close_remote_with(status);
                        }
                        self.remote = Half::Open;
                        Action::DeliverMetadata(MetadataMap::from_headers(headers.clone()))
                    }
                }
            }
            Half::Open => self.recv_trailers(headers),
            Half::Closed => Action::Close(self.invalid_state()),
        }
    }

    /// Processes an inbound request HEADERS frame on the server, validating the gRPC request
    /// contract before admitting the stream: `POST`, an `http`/`https` scheme, a
    /// `/service/method` path, a gRPC content type, `te: trailers`, and a `grpc-encoding` this
    /// endpoint accepts. Any failure closes the stream with the status the caller should send as
    /// a trailers-only response.
    pub fn recv_request_headers(
        &mut self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        accepted_encodings: EnabledCompressionEncodings,
        end_stream: bool,
    ) -> Action {
        if self.remote != Half::Idle {
            return Action::Close(self.invalid_state());
        }

        if method != Method::POST {
            return self
                .close_remote_with(Status::internal("Invalid request: :method must be POST"));
        }

        if let Some(scheme) = uri.scheme_str() {
            if scheme != "http" && scheme != "https" {
                return self.close_remote_with(Status::internal(format!(
                    "Invalid request: unsupported :scheme '{scheme}'"
                )));
            }
        }

        if MethodDescriptor::from_path(uri.path()).is_none() {
            return self.close_remote_with(Status::unimplemented(format!(
                "Invalid request path: {:?}",
                uri.path()
            )));
        }

        if let Err(status) = check_grpc_content_type(headers) {
            return self.close_remote_with(status);
        }

        let te_ok = headers
            .get(http::header::TE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("trailers")))
            .unwrap_or(false);
        if !te_ok {
            return self.close_remote_with(Status::internal(
                "Invalid request: te header must contain 'trailers'",
            ));
        }

        if let Some(value) = headers.get(crate::metadata::GRPC_ENCODING_HEADER) {
            let name = value.to_str().unwrap_or("");
            if !accepted_encodings.is_name_enabled(name) {
                return self.close_remote_with(Status::unimplemented(format!(
                    "Content is compressed with '{name}' which is not supported"
                )));
            }
        }

        self.remote = if end_stream { Half::Closed } else { Half::Open };
        Action::DeliverMetadata(MetadataMap::from_headers(headers.clone()))
    }

    /// Processes an inbound trailers frame. On the client this is the terminal status; on the
    /// server it is the end of the client's half.
    pub fn recv_trailers(&mut self, trailers: &HeaderMap) -> Action {
        if self.remote != Half::Open {
            return Action::Close(self.invalid_state());
        }
        match self.role {
            Role::Client => {
                let status = Status::from_header_map(trailers).unwrap_or_else(|| {
                    Status::new(Code::Unknown, "missing grpc-status in trailers")
                });
                self.close_remote_with(status)
            }
            Role::Server => {
                self.remote = Half::Closed;
                Action::Noop
            }
        }
    }

    /// Processes an inbound DATA frame carrying `len` bytes.
    ///
    /// End-of-stream set on a DATA frame is the client's normal half-close; a server is only
    /// allowed to finish by sending status and trailers, so the same flag inbound on the client
    /// is a protocol violation when the frame carries bytes.
    pub fn recv_data(&mut self, len: usize, end_stream: bool) -> Action {
        if self.remote != Half::Open {
            return Action::Close(self.invalid_state());
        }

        if self.role == Role::Client && end_stream && len > 0 {
            return self.close_remote_with(Status::new(
                Code::Internal,
                "Server sent EOS alongside a data frame, but server is only allowed to close by sending status and trailers.",
            ));
        }

        if end_stream {
            self.remote = Half::Closed;
        }
        Action::DeliverMessage
    }

    /// An RST_STREAM, connection teardown, or I/O error occurred before a terminal status was
    /// observed.
    pub fn recv_reset_or_error(&mut self, with_error: bool) -> Action {
        if self.is_closed() {
            return Action::Noop;
        }
        let message = if with_error {
            "Stream unexpectedly closed: a RST_STREAM frame was received."
        } else {
            "Stream unexpectedly closed."
        };
        self.close_remote_with(Status::new(Code::Unavailable, message))
    }

    fn close_remote_with(&mut self, status: Status) -> Action {
        self.remote = Half::Closed;
        self.local = Half::Closed;
        Action::Close(status)
    }

    fn invalid_state(&self) -> Status {
        Status::new(
            Code::Internal,
            format!("Invalid state: local={:?}, remote={:?}", self.local, self.remote),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::GRPC_CONTENT_TYPE;
    use http::HeaderValue;

    fn grpc_response_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);
        headers
    }

    fn grpc_request_headers() -> HeaderMap {
        let mut headers = grpc_response_headers();
        headers.insert(http::header::TE, HeaderValue::from_static("trailers"));
        headers
    }

    fn request_uri() -> Uri {
        Uri::from_static("http://localhost:50051/greeter.Greeter/SayHello")
    }

    #[test]
    fn client_happy_path_metadata_then_message_then_trailers() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();

        let action = m.recv_response_headers(StatusCode::OK, &grpc_response_headers(), false);
        assert!(matches!(action, Action::DeliverMetadata(_)));

        let action = m.recv_data(5, false);
        assert!(matches!(action, Action::DeliverMessage));

        let trailers = Status::ok("").to_header_map();
        let action = m.recv_trailers(&trailers);
        assert!(matches!(action, Action::Close(_)));
        assert!(m.is_closed());
    }

    #[test]
    fn informational_response_is_ignored() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();

        let action = m.recv_response_headers(StatusCode::CONTINUE, &HeaderMap::new(), false);
        assert!(matches!(action, Action::Noop));

        let action = m.recv_response_headers(StatusCode::OK, &grpc_response_headers(), false);
        assert!(matches!(action, Action::DeliverMetadata(_)));
    }

    #[test]
    fn client_trailers_only_response_closes_immediately() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();

        let status = Status::unavailable("down");
        let mut trailers = status.to_header_map();
        trailers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);

        let action = m.recv_response_headers(StatusCode::OK, &trailers, true);
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Unavailable),
            _ => panic!("expected Close"),
        }
        assert!(m.is_closed());
    }

    #[test]
    fn response_without_grpc_content_type_is_terminal() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();

        let action = m.recv_response_headers(StatusCode::OK, &HeaderMap::new(), false);
        match action {
            Action::Close(s) => {
                assert_eq!(s.code(), Code::Internal);
                assert_eq!(s.message(), "Missing content-type header");
            }
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn non_200_response_maps_to_a_terminal_status() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();

        let action = m.recv_response_headers(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), false);
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Unavailable),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn data_with_end_stream_and_bytes_is_a_protocol_violation_on_client() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();
        m.recv_response_headers(StatusCode::OK, &grpc_response_headers(), false);

        let action = m.recv_data(3, true);
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Internal),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn server_honors_end_stream_on_data_as_client_half_close() {
        let mut m = StreamMachine::new(Role::Server);
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &grpc_request_headers(),
            EnabledCompressionEncodings::default(),
            false,
        );
        assert!(matches!(action, Action::DeliverMetadata(_)));

        let action = m.recv_data(5, true);
        assert!(matches!(action, Action::DeliverMessage));

        // The client's half is closed now; more inbound data is out of sequence.
        let action = m.recv_data(1, false);
        assert!(matches!(action, Action::Close(_)));
    }

    #[test]
    fn reset_stream_produces_synthetic_unavailable() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();
        m.recv_response_headers(StatusCode::OK, &grpc_response_headers(), false);

        let action = m.recv_reset_or_error(true);
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Unavailable),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn reset_after_already_closed_is_a_noop() {
        let mut m = StreamMachine::new(Role::Client);
        m.send_headers(true).unwrap();
        m.recv_response_headers(StatusCode::OK, &grpc_response_headers(), false);
        m.recv_reset_or_error(true);

        assert!(matches!(m.recv_reset_or_error(true), Action::Noop));
    }

    #[test]
    fn sending_a_message_before_headers_is_invalid_state() {
        let m = StreamMachine::new(Role::Client);
        assert!(m.send_message().is_err());
    }

    #[test]
    fn server_accepts_a_valid_request_and_can_reply() {
        let mut m = StreamMachine::new(Role::Server);
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &grpc_request_headers(),
            EnabledCompressionEncodings::default(),
            true,
        );
        assert!(matches!(action, Action::DeliverMetadata(_)));

        // Server can still reply even though the client already closed its half.
        m.send_headers(false).unwrap();
        m.send_message().unwrap();
        m.send_close().unwrap();
        assert!(m.is_closed());
    }

    #[test]
    fn server_rejects_non_post_method() {
        let mut m = StreamMachine::new(Role::Server);
        let action = m.recv_request_headers(
            &Method::GET,
            &request_uri(),
            &grpc_request_headers(),
            EnabledCompressionEncodings::default(),
            false,
        );
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Internal),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn server_rejects_malformed_path() {
        let mut m = StreamMachine::new(Role::Server);
        let action = m.recv_request_headers(
            &Method::POST,
            &Uri::from_static("http://localhost:50051/not-a-grpc-path"),
            &grpc_request_headers(),
            EnabledCompressionEncodings::default(),
            false,
        );
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Unimplemented),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn server_rejects_missing_content_type_and_te() {
        let mut m = StreamMachine::new(Role::Server);
        let mut headers = grpc_request_headers();
        headers.remove(http::header::CONTENT_TYPE);
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &headers,
            EnabledCompressionEncodings::default(),
            false,
        );
        match action {
            Action::Close(s) => assert_eq!(s.message(), "Missing content-type header"),
            _ => panic!("expected Close"),
        }

        let mut m = StreamMachine::new(Role::Server);
        let mut headers = grpc_request_headers();
        headers.remove(http::header::TE);
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &headers,
            EnabledCompressionEncodings::default(),
            false,
        );
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Internal),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn server_rejects_unsupported_request_encoding() {
        let mut m = StreamMachine::new(Role::Server);
        let mut headers = grpc_request_headers();
        headers.insert(
            crate::metadata::GRPC_ENCODING_HEADER,
            HeaderValue::from_static("snappy"),
        );
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &headers,
            EnabledCompressionEncodings::default(),
            false,
        );
        match action {
            Action::Close(s) => assert_eq!(s.code(), Code::Unimplemented),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn server_accepts_identity_encoding_without_configuration() {
        let mut m = StreamMachine::new(Role::Server);
        let mut headers = grpc_request_headers();
        headers.insert(
            crate::metadata::GRPC_ENCODING_HEADER,
            HeaderValue::from_static("identity"),
        );
        let action = m.recv_request_headers(
            &Method::POST,
            &request_uri(),
            &headers,
            EnabledCompressionEncodings::default(),
            false,
        );
        assert!(matches!(action, Action::DeliverMetadata(_)));
    }
}
