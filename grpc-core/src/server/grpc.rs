use super::{ClientStreamingService, ServerStreamingService, StreamingService, UnaryService};
use crate::{
    body::{self, BoxBody},
    codec::{Codec, CompressionEncoding, EnabledCompressionEncodings, EncodeBody, Streaming},
    metadata::GRPC_CONTENT_TYPE,
    state_machine::{Action, Role, StreamMachine},
    Code, Request, Response, Status,
};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use std::fmt;
use tokio_stream::Stream;

/// Maps an inbound HTTP/2 request onto a generated service method, via the matching call-shape
/// trait, then frames the outgoing response.
pub struct Grpc<T> {
    codec: T,
    accept_compression_encodings: EnabledCompressionEncodings,
    send_compression_encodings: EnabledCompressionEncodings,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
}

impl<T> Grpc<T>
where
    T: Codec,
{
    pub fn new(codec: T) -> Self {
        Self {
            codec,
            accept_compression_encodings: EnabledCompressionEncodings::default(),
            send_compression_encodings: EnabledCompressionEncodings::default(),
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }

    pub fn apply_compression_config(
        mut self,
        accept: EnabledCompressionEncodings,
        send: EnabledCompressionEncodings,
    ) -> Self {
        self.accept_compression_encodings = accept;
        self.send_compression_encodings = send;
        self
    }

    pub fn apply_max_message_size_config(
        mut self,
        max_decoding: Option<usize>,
        max_encoding: Option<usize>,
    ) -> Self {
        self.max_decoding_message_size = max_decoding;
        self.max_encoding_message_size = max_encoding;
        self
    }

    pub async fn unary<S, B>(&mut self, mut service: S, req: http::Request<B>) -> http::Response<BoxBody>
    where
        S: UnaryService<T::Decode, Response = T::Encode>,
        T::Encode: Send + 'static,
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        let encoding = CompressionEncoding::from_accept_encoding_header(
            req.headers(),
            self.send_compression_encodings,
        );

        let request = match self.map_request_unary(req).await {
            Ok(r) => r,
            Err(status) => return self.status_response(status),
        };

        let response = service.call(request).await.map(|r| r.map(|m| tokio_stream::once(Ok(m))));

        self.map_response(response, encoding)
    }

    pub async fn server_streaming<S, B>(
        &mut self,
        mut service: S,
        req: http::Request<B>,
    ) -> http::Response<BoxBody>
    where
        S: ServerStreamingService<T::Decode, Response = T::Encode>,
        S::ResponseStream: Send + Unpin + 'static,
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        let encoding = CompressionEncoding::from_accept_encoding_header(
            req.headers(),
            self.send_compression_encodings,
        );

        let request = match self.map_request_unary(req).await {
            Ok(r) => r,
            Err(status) => return self.status_response(status),
        };

        let response = service.call(request).await;
        self.map_response(response, encoding)
    }

    pub async fn client_streaming<S, B>(&mut self, mut service: S, req: http::Request<B>) -> http::Response<BoxBody>
    where
        S: ClientStreamingService<T::Decode, Response = T::Encode>,
        T::Encode: Send + 'static,
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        let encoding = CompressionEncoding::from_accept_encoding_header(
            req.headers(),
            self.send_compression_encodings,
        );

        let request = match self.map_request_streaming(req) {
            Ok(r) => r,
            Err(status) => return self.status_response(status),
        };

        let response = service.call(request).await.map(|r| r.map(|m| tokio_stream::once(Ok(m))));
        self.map_response(response, encoding)
    }

    pub async fn streaming<S, B>(&mut self, mut service: S, req: http::Request<B>) -> http::Response<BoxBody>
    where
        S: StreamingService<T::Decode, Response = T::Encode> + Send,
        S::ResponseStream: Send + Unpin + 'static,
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        let encoding = CompressionEncoding::from_accept_encoding_header(
            req.headers(),
            self.send_compression_encodings,
        );

        let request = match self.map_request_streaming(req) {
            Ok(r) => r,
            Err(status) => return self.status_response(status),
        };

        let response = service.call(request).await;
        self.map_response(response, encoding)
    }

    /// Runs the request half of the stream machine over the inbound HEADERS: method, scheme,
    /// path, content type, `te` and `grpc-encoding` are all validated before any body byte is
    /// read. A failure becomes the trailers-only response the caller builds from the status.
    fn validate_request<B>(&self, request: &http::Request<B>) -> Result<(), Status>
    where
        B: HttpBody,
    {
        let mut machine = StreamMachine::new(Role::Server);
        match machine.recv_request_headers(
            request.method(),
            request.uri(),
            request.headers(),
            self.accept_compression_encodings,
            request.body().is_end_stream(),
        ) {
            Action::Close(status) => Err(status),
            _ => Ok(()),
        }
    }

    async fn map_request_unary<B>(&mut self, request: http::Request<B>) -> Result<Request<T::Decode>, Status>
    where
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        self.validate_request(&request)?;
        let encoding = CompressionEncoding::from_encoding_header(
            request.headers(),
            self.accept_compression_encodings,
        )?;

        let (parts, body) = request.into_parts();
        let body = body::boxed_request(body);
        let mut stream = Streaming::new_request(
            self.codec.decoder(),
            body,
            encoding,
            self.max_decoding_message_size,
        );

        let message = stream
            .message()
            .await?
            .ok_or_else(|| Status::new(Code::Internal, "Missing request message."))?;

        let mut req = Request::from_http_parts(parts, message);
        if let Some(trailers) = stream.trailers().await? {
            req.metadata_mut().merge(trailers);
        }
        Ok(req)
    }

    fn map_request_streaming<B>(
        &mut self,
        request: http::Request<B>,
    ) -> Result<Request<Streaming<T::Decode>>, Status>
    where
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<crate::BoxError>,
    {
        self.validate_request(&request)?;
        let encoding = CompressionEncoding::from_encoding_header(
            request.headers(),
            self.accept_compression_encodings,
        )?;
        let max = self.max_decoding_message_size;
        let decoder = self.codec.decoder();
        Ok(Request::from_http(request.map(|body| {
            Streaming::new_request(decoder, body::boxed_request(body), encoding, max)
        })))
    }

    fn map_response<S>(
        &mut self,
        response: Result<Response<S>, Status>,
        encoding: Option<CompressionEncoding>,
    ) -> http::Response<BoxBody>
    where
        S: Stream<Item = Result<T::Encode, Status>> + Send + Unpin + 'static,
    {
        let response = match response {
            Ok(r) => r,
            Err(status) => return self.status_response(status),
        };

        let (mut parts, body) = response.into_http().into_parts();
        parts.headers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);

        if let Some(encoding) = encoding {
            parts.headers.insert(crate::codec::ENCODING_HEADER, encoding.into_header_value());
        }
        if let Some(value) = self
            .send_compression_encodings
            .into_accept_encoding_header_value()
        {
            parts.headers.insert(crate::codec::ACCEPT_ENCODING_HEADER, value);
        }

        let body = EncodeBody::new_server(
            self.codec.encoder(),
            body,
            encoding,
            self.max_encoding_message_size,
        );

        http::Response::from_parts(parts, body::boxed(body))
    }

    fn status_response(&self, status: Status) -> http::Response<BoxBody> {
        let mut headers = status.to_header_map();
        headers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);

        let mut response = http::Response::new(body::boxed(http_body_util::Empty::new().map_err(
            |never: std::convert::Infallible| match never {},
        )));
        *response.status_mut() = http::StatusCode::OK;
        *response.headers_mut() = headers;
        response
    }
}

impl<T: fmt::Debug> fmt::Debug for Grpc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grpc").field("codec", &self.codec).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodeBuf, Decoder, EncodeBuf, Encoder};
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use http_body_util::Full;

    struct BytesCodec;

    struct BytesEncoder;

    impl Encoder for BytesEncoder {
        type Item = Vec<u8>;
        type Error = Status;

        fn encode(&mut self, item: Vec<u8>, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
            dst.put_slice(&item);
            Ok(())
        }
    }

    struct BytesDecoder;

    impl Decoder for BytesDecoder {
        type Item = Vec<u8>;
        type Error = Status;

        fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Vec<u8>>, Status> {
            let mut out = vec![0u8; src.remaining()];
            src.copy_to_slice(&mut out);
            Ok(Some(out))
        }
    }

    impl Codec for BytesCodec {
        type Encode = Vec<u8>;
        type Decode = Vec<u8>;
        type Encoder = BytesEncoder;
        type Decoder = BytesDecoder;

        fn encoder(&mut self) -> BytesEncoder {
            BytesEncoder
        }

        fn decoder(&mut self) -> BytesDecoder {
            BytesDecoder
        }
    }

    struct Echo;

    impl UnaryService<Vec<u8>> for Echo {
        type Response = Vec<u8>;
        type Future = std::future::Ready<Result<Response<Vec<u8>>, Status>>;

        fn call(&mut self, request: Request<Vec<u8>>) -> Self::Future {
            std::future::ready(Ok(Response::new(request.into_inner())))
        }
    }

    fn framed_body(payload: &[u8]) -> Full<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Full::new(buf.freeze())
    }

    fn request(with_te: bool) -> http::Request<Full<Bytes>> {
        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri("http://localhost:50051/test.Echo/Get")
            .header(http::header::CONTENT_TYPE, "application/grpc");
        if with_te {
            builder = builder.header(http::header::TE, "trailers");
        }
        builder.body(framed_body(&[0x01, 0x02])).unwrap()
    }

    fn grpc_status_header(response: &http::Response<BoxBody>) -> Option<&str> {
        response
            .headers()
            .get("grpc-status")
            .map(|v| v.to_str().unwrap())
    }

    #[tokio::test]
    async fn valid_unary_request_is_dispatched() {
        let mut grpc = Grpc::new(BytesCodec);
        let response = grpc.unary(Echo, request(true)).await;

        assert_eq!(response.status(), http::StatusCode::OK);
        // Not trailers-only: the status arrives with the body's trailers frame.
        assert_eq!(grpc_status_header(&response), None);
    }

    #[tokio::test]
    async fn request_without_te_trailers_gets_a_trailers_only_error() {
        let mut grpc = Grpc::new(BytesCodec);
        let response = grpc.unary(Echo, request(false)).await;

        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(grpc_status_header(&response), Some("13"));
    }

    #[tokio::test]
    async fn request_with_unsupported_encoding_gets_unimplemented() {
        let mut grpc = Grpc::new(BytesCodec);
        let mut req = request(true);
        req.headers_mut().insert(
            crate::metadata::GRPC_ENCODING_HEADER,
            http::HeaderValue::from_static("snappy"),
        );
        let response = grpc.unary(Echo, req).await;

        assert_eq!(grpc_status_header(&response), Some("12"));
    }

    #[tokio::test]
    async fn non_post_request_is_rejected() {
        let mut grpc = Grpc::new(BytesCodec);
        let mut req = request(true);
        *req.method_mut() = http::Method::GET;
        let response = grpc.unary(Echo, req).await;

        assert_eq!(grpc_status_header(&response), Some("13"));
    }
}
