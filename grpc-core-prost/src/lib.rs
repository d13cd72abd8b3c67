//! A [`Codec`] implementation serializing messages with [`prost`], for services whose message
//! types derive [`prost::Message`].

use grpc_core::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use grpc_core::Status;
use prost::Message;
use std::marker::PhantomData;

/// A protobuf codec for a `(request, response)` message pair.
pub struct ProstCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for ProstCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for ProstCodec<T, U>
where
    T: Message + Send + 'static,
    U: Message + Default + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    type Encoder = ProstEncoder<T>;
    type Decoder = ProstDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        ProstEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        ProstDecoder(PhantomData)
    }
}

pub struct ProstEncoder<T>(PhantomData<T>);

impl<T: Message> Encoder for ProstEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: T, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("Error encoding message: {e}")))
    }
}

pub struct ProstDecoder<U>(PhantomData<U>);

impl<U: Message + Default> Decoder for ProstDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<U>, Status> {
        Message::decode(src)
            .map(Some)
            .map_err(|e| Status::internal(format!("Error decoding message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[derive(Clone, PartialEq, prost::Message)]
    struct EchoRequest {
        #[prost(string, tag = "1")]
        message: String,
        #[prost(uint64, tag = "2")]
        sequence: u64,
    }

    #[test]
    fn encoded_message_decodes_back() {
        let mut codec = ProstCodec::<EchoRequest, EchoRequest>::default();
        let original = EchoRequest {
            message: "ping".to_owned(),
            sequence: 42,
        };

        let mut buf = BytesMut::new();
        codec
            .encoder()
            .encode(original.clone(), &mut EncodeBuf::new(&mut buf))
            .unwrap();

        let len = buf.len();
        let decoded = codec
            .decoder()
            .decode(&mut DecodeBuf::new(&mut buf, len))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncated_message_is_an_internal_error() {
        let mut codec = ProstCodec::<EchoRequest, EchoRequest>::default();
        let original = EchoRequest {
            message: "ping".to_owned(),
            sequence: 42,
        };

        let mut buf = BytesMut::new();
        codec
            .encoder()
            .encode(original, &mut EncodeBuf::new(&mut buf))
            .unwrap();
        buf.truncate(buf.len() - 1);

        let len = buf.len();
        let err = codec
            .decoder()
            .decode(&mut DecodeBuf::new(&mut buf, len))
            .unwrap_err();
        assert_eq!(err.code(), grpc_core::Code::Internal);
    }
}
