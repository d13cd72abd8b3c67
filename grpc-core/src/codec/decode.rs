use super::compression::{decompress, CompressionEncoding};
use super::{DecodeBuf, Decoder, HEADER_SIZE};
use crate::body::BoxBody;
use crate::metadata::MetadataMap;
use crate::state_machine::{Action, Role, StreamMachine};
use crate::status::{infer_grpc_status, Code, Status};
use bytes::{Buf, BufMut, BytesMut};
use http::StatusCode;
use http_body::Body;
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::Stream;
use tracing::{debug, trace};

const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    ReadHeader,
    ReadBody { compression: bool, len: usize },
    Error,
}

/// Distinguishes which side of an RPC this deframer is reading, since the error messages and the
/// trailers-reading step differ between them.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Request,
    Response(StatusCode),
}

/// A decoded message stream attached to one HTTP/2 request or response body: reassembles
/// length-prefixed frames and hands decoded messages back one at a time, then surfaces the
/// trailing `grpc-status`/metadata once the body is exhausted.
pub struct Streaming<T> {
    decoder: Box<dyn Decoder<Item = T, Error = Status> + Send + 'static>,
    body: BoxBody,
    state: State,
    direction: Direction,
    machine: StreamMachine,
    buf: BytesMut,
    decompress_buf: BytesMut,
    encoding: Option<CompressionEncoding>,
    max_message_size: Option<usize>,
    trailers: Option<MetadataMap>,
}

impl<T> Unpin for Streaming<T> {}

impl<T> Streaming<T> {
    pub(crate) fn new_request<D>(
        decoder: D,
        body: BoxBody,
        encoding: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        D: Decoder<Item = T, Error = Status> + Send + 'static,
    {
        Self::new(decoder, body, Direction::Request, encoding, max_message_size)
    }

    pub(crate) fn new_response<D>(
        decoder: D,
        body: BoxBody,
        status_code: StatusCode,
        encoding: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        D: Decoder<Item = T, Error = Status> + Send + 'static,
    {
        Self::new(
            decoder,
            body,
            Direction::Response(status_code),
            encoding,
            max_message_size,
        )
    }

    /// Wraps a trailers-only response: the initial HEADERS frame already carried `grpc-status`, so
    /// there is no body to deframe and `trailers` is already known.
    pub(crate) fn new_empty<D>(decoder: D, body: BoxBody, trailers: Option<MetadataMap>) -> Self
    where
        D: Decoder<Item = T, Error = Status> + Send + 'static,
    {
        let mut this = Self::new(decoder, body, Direction::Request, None, None);
        this.state = State::Error;
        this.trailers = trailers;
        this
    }

    fn new<D>(
        decoder: D,
        body: BoxBody,
        direction: Direction,
        encoding: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        D: Decoder<Item = T, Error = Status> + Send + 'static,
    {
        let role = match direction {
            Direction::Request => Role::Server,
            Direction::Response(_) => Role::Client,
        };
        Self {
            decoder: Box::new(decoder),
            body,
            state: State::ReadHeader,
            direction,
            machine: StreamMachine::mid_stream(role),
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            decompress_buf: BytesMut::new(),
            encoding,
            max_message_size,
            trailers: None,
        }
    }

    /// Fetches the next message, or `None` once the stream is exhausted.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await.transpose()
    }

    /// Fetches the trailing metadata, draining any unread messages first.
    pub async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        if let Some(trailers) = self.trailers.take() {
            return Ok(Some(trailers));
        }
        while self.message().await?.is_some() {}
        Ok(self.trailers.take())
    }

    fn decode_chunk(&mut self) -> Result<Option<T>, Status> {
        if let State::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(None);
            }

            let is_compressed = match self.buf.get_u8() {
                0 => false,
                1 => {
                    if self.encoding.is_some() {
                        true
                    } else {
                        return Err(Status::new(
                            Code::Internal,
                            "protocol error: received message with compressed-flag but no grpc-encoding was specified",
                        ));
                    }
                }
                flag => {
                    trace!(flag, "unexpected compression flag");
                    return Err(Status::new(
                        Code::Internal,
                        format!("Invalid compression flag: {flag}"),
                    ));
                }
            };

            let len = self.buf.get_u32() as usize;

            if let Some(max) = self.max_message_size {
                if len > max {
                    return Err(Status::new(Code::Internal, "Failed to decode message"));
                }
            }

            self.buf.reserve(len);
            self.state = State::ReadBody {
                compression: is_compressed,
                len,
            };
        }

        let State::ReadBody { len, compression } = self.state else {
            return Ok(None);
        };

        if self.buf.remaining() < len {
            return Ok(None);
        }

        let decoded = if compression {
            self.decompress_buf.clear();
            let encoding = self
                .encoding
                .expect("compressed frame admitted only when an encoding was negotiated");
            decompress(encoding, &mut self.buf, &mut self.decompress_buf, len)?;
            let decompressed_len = self.decompress_buf.len();
            self.decoder
                .decode(&mut DecodeBuf::new(&mut self.decompress_buf, decompressed_len))?
        } else {
            self.decoder.decode(&mut DecodeBuf::new(&mut self.buf, len))?
        };

        match decoded {
            Some(msg) => {
                self.state = State::ReadHeader;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let State::Error = self.state {
                return Poll::Ready(None);
            }

            match self.decode_chunk() {
                Ok(Some(item)) => return Poll::Ready(Some(Ok(item))),
                Ok(None) => {}
                Err(status) => {
                    self.state = State::Error;
                    return Poll::Ready(Some(Err(status)));
                }
            }

            let frame = match Pin::new(&mut self.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => frame,
                Poll::Ready(Some(Err(status))) => {
                    self.state = State::Error;
                    debug!(%status, "decoder inner stream error");
                    return Poll::Ready(Some(Err(status)));
                }
                Poll::Ready(None) => break,
                Poll::Pending => return Poll::Pending,
            };

            match frame.into_data() {
                Ok(data) => {
                    // An END_STREAM flag on this DATA frame surfaces as the body reporting
                    // end-of-stream once the frame is out; a server ending the stream this way
                    // instead of via trailers is the violation the machine rejects.
                    let end_stream = self.body.is_end_stream();
                    if let Action::Close(status) = self.machine.recv_data(data.len(), end_stream) {
                        self.state = State::Error;
                        return Poll::Ready(Some(Err(status)));
                    }
                    self.buf.put(data);
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        // Sequencing only; the terminal status is derived below where the HTTP
                        // status code is also in hand.
                        let _ = self.machine.recv_trailers(&trailers);
                        return self.finish_with_trailers(Some(trailers));
                    }
                }
            }
        }

        if self.buf.has_remaining() {
            trace!("body ended mid-frame");
            self.state = State::Error;
            return Poll::Ready(Some(Err(Status::new(
                Code::Internal,
                "Message is truncated",
            ))));
        }

        self.finish_with_trailers(None)
    }
}

impl<T> Streaming<T> {
    fn finish_with_trailers(
        mut self: Pin<&mut Self>,
        trailers: Option<http::HeaderMap>,
    ) -> Poll<Option<Result<T, Status>>> {
        match self.direction {
            Direction::Response(status_code) => {
                match infer_grpc_status(trailers.as_ref(), status_code) {
                    Ok(()) => {
                        self.trailers = trailers.map(MetadataMap::from_headers);
                        Poll::Ready(None)
                    }
                    Err(Some(status)) => Poll::Ready(Some(Err(status))),
                    Err(None) => Poll::Ready(None),
                }
            }
            Direction::Request => {
                self.trailers = trailers.map(MetadataMap::from_headers);
                Poll::Ready(None)
            }
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming").finish()
    }
}

#[cfg(test)]
static_assertions::assert_impl_all!(Streaming<()>: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodeBuf;
    use bytes::Bytes;
    use http_body_util::{BodyExt, StreamBody};
    use tokio_stream::once;

    struct Utf8Decoder;

    impl Decoder for Utf8Decoder {
        type Item = String;
        type Error = Status;

        fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<String>, Status> {
            let mut bytes = vec![0u8; src.remaining()];
            src.copy_to_slice(&mut bytes);
            String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Status::internal(e.to_string()))
        }
    }

    fn frame_bytes(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(payload.len() as u32);
        {
            let mut dst = EncodeBuf::new(&mut buf);
            dst.put_slice(payload);
        }
        buf.freeze()
    }

    fn body_from_frame(payload: &[u8]) -> BoxBody {
        let frame = http_body::Frame::data(frame_bytes(payload));
        let stream = once(Ok::<_, Status>(frame));
        BodyExt::boxed_unsync(StreamBody::new(stream))
    }

    #[tokio::test]
    async fn reads_a_single_framed_message() {
        let body = body_from_frame(b"hello");
        let mut stream = Streaming::new_request(Utf8Decoder, body, None, None);
        assert_eq!(stream.message().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(stream.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_compressed_flag_without_negotiated_encoding() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32(0);
        let frame = http_body::Frame::data(buf.freeze());
        let stream_body = StreamBody::new(once(Ok::<_, Status>(frame)));
        let body = BodyExt::boxed_unsync(stream_body);

        let mut stream = Streaming::new_request(Utf8Decoder, body, None, None);
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn rejects_message_over_the_configured_size_limit() {
        let body = body_from_frame(b"hello world");
        let mut stream = Streaming::new_request(Utf8Decoder, body, None, Some(4));
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    /// A body whose final DATA frame carries END_STREAM, with no trailers frame to follow.
    fn body_ending_on_data_frame(payload: &[u8]) -> BoxBody {
        let full = http_body_util::Full::new(frame_bytes(payload));
        BodyExt::boxed_unsync(full.map_err(|never| match never {}))
    }

    #[tokio::test]
    async fn server_ending_the_stream_on_a_data_frame_is_a_protocol_violation() {
        let body = body_ending_on_data_frame(b"hi");
        let mut stream =
            Streaming::new_response(Utf8Decoder, body, StatusCode::OK, None, None);

        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().starts_with("Server sent EOS alongside a data frame"));
    }

    #[tokio::test]
    async fn client_half_close_on_a_data_frame_is_honored_on_the_server() {
        let body = body_ending_on_data_frame(b"hi");
        let mut stream = Streaming::new_request(Utf8Decoder, body, None, None);

        assert_eq!(stream.message().await.unwrap().as_deref(), Some("hi"));
        assert_eq!(stream.message().await.unwrap(), None);
    }
}
