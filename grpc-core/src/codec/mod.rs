//! Message framing: the `Codec` trait pair that turns application messages into length-prefixed
//! frames and back, plus the encode/decode streams that drive the wire format.

mod compression;
mod decode;
mod encode;

pub use compression::{CompressionEncoding, EnabledCompressionEncodings};
pub use decode::Streaming;
pub(crate) use compression::{ACCEPT_ENCODING_HEADER, ENCODING_HEADER};
pub(crate) use encode::EncodeBody;

use crate::status::Status;
use bytes::{Buf, BufMut};

/// Number of bytes in the gRPC length-prefix header: 1 compression-flag byte + 4 big-endian
/// length bytes.
pub(crate) const HEADER_SIZE: usize = 5;

/// A writable view over the frame being built for a single message, exposing only the operations
/// an [`Encoder`] needs.
pub struct EncodeBuf<'a> {
    buf: &'a mut dyn BufMut,
}

impl<'a> EncodeBuf<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self { buf }
    }
}

unsafe impl BufMut for EncodeBuf<'_> {
    fn remaining_mut(&self) -> usize {
        self.buf.remaining_mut()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.buf.advance_mut(cnt)
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        self.buf.chunk_mut()
    }
}

/// A readable view over exactly one message's worth of decoded bytes.
pub struct DecodeBuf<'a> {
    buf: &'a mut bytes::BytesMut,
    len: usize,
}

impl<'a> DecodeBuf<'a> {
    pub fn new(buf: &'a mut bytes::BytesMut, len: usize) -> Self {
        Self { buf, len }
    }
}

impl Buf for DecodeBuf<'_> {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        let chunk = self.buf.chunk();
        if chunk.len() > self.len {
            &chunk[..self.len]
        } else {
            chunk
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len, "tried to advance past the end of the message");
        self.len -= cnt;
        self.buf.advance(cnt);
    }
}

impl Drop for DecodeBuf<'_> {
    fn drop(&mut self) {
        // An encoder that didn't consume the whole message (e.g. ignored trailing bytes added by
        // a future protocol revision) must not desynchronize the frame boundary for the caller.
        if self.len > 0 {
            self.buf.advance(self.len);
        }
    }
}

/// Encodes one application message into a frame body.
pub trait Encoder {
    type Item;
    type Error: From<std::io::Error>;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error>;
}

/// Decodes one application message out of a fully buffered frame body.
pub trait Decoder {
    type Item;
    type Error;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error>;
}

/// Produces the matched encoder/decoder pair for a message type, e.g. a protobuf or JSON codec.
pub trait Codec {
    type Encode;
    type Decode;

    type Encoder: Encoder<Item = Self::Encode, Error = Status> + Send + 'static;
    type Decoder: Decoder<Item = Self::Decode, Error = Status> + Send + 'static;

    fn encoder(&mut self) -> Self::Encoder;
    fn decoder(&mut self) -> Self::Decoder;
}
