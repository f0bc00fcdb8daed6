//! Handshake credentials exchanged on first contact with a peer.

use ss_net_codec::{CodecError, FrameCodec, ProtoMessage};

use crate::proto;

/// Role and device identity a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeMsg {
    pub role: String,
    pub device_id: String,
}

impl HandshakeMsg {
    pub fn new(role: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            device_id: device_id.into(),
        }
    }
}

impl ProtoMessage for HandshakeMsg {
    type Proto = proto::Credentials;

    fn into_proto(self) -> Self::Proto {
        proto::Credentials {
            role: self.role,
            device_id: self.device_id,
        }
    }

    fn from_proto(proto: Self::Proto) -> Result<Self, CodecError> {
        Ok(Self {
            role: proto.role,
            device_id: proto.device_id,
        })
    }
}

pub type HandshakeCodec = FrameCodec<HandshakeMsg>;

#[cfg(test)]
mod tests {
    use super::*;
    use asynchronous_codec::{Decoder, Encoder};
    use bytes::BytesMut;

    use crate::MAX_MESSAGE_SIZE;

    #[test]
    fn roundtrip() {
        let original = HandshakeMsg::new("light-client", "lc_device_1");
        let mut codec = HandshakeCodec::new(MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn empty_fields_roundtrip() {
        let original = HandshakeMsg::default();
        let mut codec = HandshakeCodec::new(MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(original, decoded);
    }
}
