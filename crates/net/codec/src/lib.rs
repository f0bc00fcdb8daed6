//! Length-prefixed protobuf framing shared by the SCP wire protocols.
//!
//! Every SCP frame on the wire is `uvarint(body_len) || body`, where the body
//! is a protobuf-encoded message. [`FrameCodec`] implements
//! [`asynchronous_codec::Encoder`]/[`Decoder`] for any domain type that can
//! convert to and from its wire struct through [`ProtoMessage`].
//!
//! The codec enforces a maximum body size *before* the body is consumed, so
//! an oversized frame fails without reading past the length prefix.

use std::marker::PhantomData;

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};
use prost::Message;

/// Conversion between a domain message and its protobuf wire struct.
///
/// Mirrors the split between protocol types and generated wire types: the
/// domain struct is what the rest of the system handles, the proto struct is
/// what goes on the wire.
pub trait ProtoMessage: Sized {
    /// The protobuf wire representation.
    type Proto: Message + Default;

    /// Convert the domain message into its wire struct.
    fn into_proto(self) -> Self::Proto;

    /// Build the domain message back from a decoded wire struct.
    fn from_proto(proto: Self::Proto) -> Result<Self, CodecError>;
}

/// Errors raised while framing or unframing SCP messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame body exceeds the negotiated maximum.
    #[error("frame of {got} bytes exceeds maximum of {max}")]
    FrameTooLarge { got: usize, max: usize },

    /// The length prefix or the body failed to decode.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Varint length-prefixed codec for a single message type.
pub struct FrameCodec<T> {
    max_frame_size: usize,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _marker: PhantomData,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<T: ProtoMessage> Encoder for FrameCodec<T> {
    type Item<'a> = T;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let proto = item.into_proto();
        let body_len = proto.encoded_len();
        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                got: body_len,
                max: self.max_frame_size,
            });
        }

        let mut len_buf = unsigned_varint::encode::usize_buffer();
        let prefix = unsigned_varint::encode::usize(body_len, &mut len_buf);
        dst.reserve(prefix.len() + body_len);
        dst.put_slice(prefix);
        proto
            .encode(dst)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        Ok(())
    }
}

impl<T: ProtoMessage> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (body_len, prefix_len) = match unsigned_varint::decode::usize(src.as_ref()) {
            Ok((len, rest)) => (len, src.len() - rest.len()),
            Err(unsigned_varint::decode::Error::Insufficient) => return Ok(None),
            Err(e) => return Err(CodecError::MalformedFrame(e.to_string())),
        };

        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                got: body_len,
                max: self.max_frame_size,
            });
        }
        if src.len() < prefix_len + body_len {
            src.reserve(prefix_len + body_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let body = src.split_to(body_len);
        let proto = T::Proto::decode(body.as_ref())
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        T::from_proto(proto).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct TestProto {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint64, tag = "2")]
        value: u64,
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct TestMsg {
        name: String,
        value: u64,
    }

    impl ProtoMessage for TestMsg {
        type Proto = TestProto;

        fn into_proto(self) -> TestProto {
            TestProto {
                name: self.name,
                value: self.value,
            }
        }

        fn from_proto(proto: TestProto) -> Result<Self, CodecError> {
            Ok(Self {
                name: proto.name,
                value: proto.value,
            })
        }
    }

    #[test]
    fn roundtrip() {
        let msg = TestMsg {
            name: "partner".to_owned(),
            value: 42,
        };
        let mut codec = FrameCodec::<TestMsg>::new(1024);
        let mut buf = BytesMut::new();

        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let msg = TestMsg {
            name: "x".repeat(100),
            value: 7,
        };
        let mut codec = FrameCodec::<TestMsg>::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn oversized_encode_rejected() {
        let msg = TestMsg {
            name: "x".repeat(64),
            value: 1,
        };
        let mut codec = FrameCodec::<TestMsg>::new(16);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_decode_rejected_before_body() {
        let mut codec = FrameCodec::<TestMsg>::new(16);
        // Length prefix claims a 1 MiB body, with no body bytes present.
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        let prefix = unsigned_varint::encode::usize(1 << 20, &mut len_buf);
        let mut buf = BytesMut::from(prefix);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { got, .. }) if got == 1 << 20
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut codec = FrameCodec::<TestMsg>::new(64);
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        let prefix = unsigned_varint::encode::usize(3, &mut len_buf);
        let mut buf = BytesMut::from(prefix);
        // Field 1 tagged as varint, truncated payload.
        buf.extend_from_slice(&[0x08, 0xff, 0xff]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MalformedFrame(_))
        ));
    }
}
