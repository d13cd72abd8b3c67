use super::compression::{compress, CompressionEncoding};
use super::{EncodeBuf, Encoder, HEADER_SIZE};
use crate::status::{Code, Status};
use bytes::{BufMut, Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::Stream;

const BUFFER_SIZE: usize = 8 * 1024;

/// The bound `EncodeBody` needs on its message source: a fallible stream of application messages.
pub(crate) trait MessageStream: Stream<Item = Result<<Self as MessageStream>::Item, Status>> {
    type Item;
}

impl<S, T> MessageStream for S
where
    S: Stream<Item = Result<T, Status>>,
{
    type Item = T;
}

/// Which end this body is flowing out of; it decides how the stream terminates.
///
/// A client request body simply ends (the HTTP/2 layer sets END_STREAM on the last DATA frame);
/// a server response body must end with a trailers frame carrying `grpc-status`, and a
/// mid-stream failure becomes those trailers rather than a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Frames a stream of application messages as an outbound gRPC body: each message becomes one
/// length-prefixed, optionally compressed frame.
pub(crate) struct EncodeBody<S>
where
    S: MessageStream,
{
    encoder: Box<dyn Encoder<Item = <S as MessageStream>::Item, Error = Status> + Send + 'static>,
    source: S,
    compression: Option<CompressionEncoding>,
    max_message_size: Option<usize>,
    buf: BytesMut,
    role: Role,
    is_end_stream: bool,
}

impl<S> EncodeBody<S>
where
    S: MessageStream,
{
    /// A client request body. A failed encode surfaces as a body error, which resets the stream.
    pub(crate) fn new_client<E>(
        encoder: E,
        source: S,
        compression: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        E: Encoder<Item = <S as MessageStream>::Item, Error = Status> + Send + 'static,
    {
        Self::new(encoder, source, compression, max_message_size, Role::Client)
    }

    /// A server response body: ends with a trailers frame carrying the final `grpc-status`.
    pub(crate) fn new_server<E>(
        encoder: E,
        source: S,
        compression: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        E: Encoder<Item = <S as MessageStream>::Item, Error = Status> + Send + 'static,
    {
        Self::new(encoder, source, compression, max_message_size, Role::Server)
    }

    fn new<E>(
        encoder: E,
        source: S,
        compression: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
        role: Role,
    ) -> Self
    where
        E: Encoder<Item = <S as MessageStream>::Item, Error = Status> + Send + 'static,
    {
        Self {
            encoder: Box::new(encoder),
            source,
            compression,
            max_message_size,
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            role,
            is_end_stream: false,
        }
    }

    /// Encodes `item` as one frame, appended to `self.buf`, and returns it split off as `Bytes`.
    fn encode_frame(&mut self, item: <S as MessageStream>::Item) -> Result<Bytes, Status> {
        let start = self.buf.len();
        self.buf.put_bytes(0, HEADER_SIZE);
        self.encoder.encode(item, &mut EncodeBuf::new(&mut self.buf))?;
        let payload_len = self.buf.len() - start - HEADER_SIZE;

        if let Some(max) = self.max_message_size {
            if payload_len > max {
                self.buf.truncate(start);
                return Err(Status::new(
                    Code::ResourceExhausted,
                    format!("Message length too large: found {payload_len} bytes, the limit is: {max} bytes"),
                ));
            }
        }

        if let Some(encoding) = self.compression {
            let compressed = compress(encoding, &self.buf[start + HEADER_SIZE..])?;
            self.buf.truncate(start + HEADER_SIZE);
            self.buf[start] = 1;
            self.buf[start + 1..start + HEADER_SIZE]
                .copy_from_slice(&(compressed.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(&compressed);
        } else {
            self.buf[start] = 0;
            self.buf[start + 1..start + HEADER_SIZE]
                .copy_from_slice(&(payload_len as u32).to_be_bytes());
        }

        Ok(self.buf.split_off(start).freeze())
    }

    /// Terminates the body after a `status`-worth outcome, per role.
    fn finish(&mut self, status: Status) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        self.is_end_stream = true;
        match self.role {
            Role::Client if status.code() == Code::Ok => Poll::Ready(None),
            Role::Client => Poll::Ready(Some(Err(status))),
            Role::Server => Poll::Ready(Some(Ok(Frame::trailers(status.to_header_map())))),
        }
    }
}

impl<S> Body for EncodeBody<S>
where
    S: MessageStream + Unpin,
{
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.is_end_stream {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.source).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => match self.encode_frame(item) {
                Ok(bytes) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                Err(status) => self.finish(status),
            },
            Poll::Ready(Some(Err(status))) => self.finish(status),
            Poll::Ready(None) => self.finish(Status::ok("")),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.is_end_stream
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    struct Utf8Codec;

    impl Encoder for Utf8Codec {
        type Item = String;
        type Error = Status;

        fn encode(&mut self, item: String, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
            dst.put_slice(item.as_bytes());
            Ok(())
        }
    }

    #[test]
    fn frame_header_matches_payload_length() {
        let stream = tokio_stream::once(Ok::<_, Status>("hello".to_string()));
        let mut body = EncodeBody::new_client(Utf8Codec, stream, None, None);
        let frame = body.encode_frame("hello".to_string()).unwrap();

        assert_eq!(frame[0], 0);
        let len = u32::from_be_bytes(frame[1..5].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - HEADER_SIZE);
        assert_eq!(&frame[HEADER_SIZE..], b"hello");
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn frame_header_marks_compressed_payload() {
        let stream = tokio_stream::once(Ok::<_, Status>("x".repeat(200)));
        let mut body =
            EncodeBody::new_client(Utf8Codec, stream, Some(CompressionEncoding::Gzip), None);
        let frame = body.encode_frame("x".repeat(200)).unwrap();

        assert_eq!(frame[0], 1);
        let len = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);
        assert!(len < 200, "gzip of 200 repeated bytes should compress well below original size");
    }

    #[tokio::test]
    async fn server_body_ends_with_ok_status_trailers_after_data() {
        let stream =
            tokio_stream::iter(vec![Ok::<_, Status>("a".to_string()), Ok("b".to_string())]);
        let mut body = EncodeBody::new_server(Utf8Codec, stream, None, None);

        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            frames.push(frame.unwrap());
        }

        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_data() && frames[1].is_data());
        let trailers = frames[2].trailers_ref().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert!(http_body::Body::is_end_stream(&body));
    }

    #[tokio::test]
    async fn server_body_turns_a_handler_error_into_status_trailers() {
        let stream = tokio_stream::iter(vec![
            Ok::<_, Status>("a".to_string()),
            Err(Status::failed_precondition("nope")),
        ]);
        let mut body = EncodeBody::new_server(Utf8Codec, stream, None, None);

        let first = body.frame().await.unwrap().unwrap();
        assert!(first.is_data());

        let second = body.frame().await.unwrap().unwrap();
        let trailers = second.trailers_ref().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "9");

        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn client_body_oversized_message_fails_with_resource_exhausted() {
        let stream = tokio_stream::once(Ok::<_, Status>("too long".to_string()));
        let mut body = EncodeBody::new_client(Utf8Codec, stream, None, Some(4));

        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }
}
