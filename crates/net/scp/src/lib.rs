//! Wire messages for the Streamspace Consumption Protocol.
//!
//! Two protocols are defined, each carrying a single message type:
//!
//! - [`HANDSHAKE_PROTOCOL`]: role and device identity, exchanged on first
//!   contact.
//! - [`MICROPAYMENT_PROTOCOL`]: signed consumption claims, emitted while
//!   blocks flow.
//!
//! Frames are varint length-prefixed protobuf bodies (see `ss-net-codec`),
//! capped at [`MAX_MESSAGE_SIZE`] bytes.

mod handshake;
mod micropayment;

#[allow(unreachable_pub)]
mod proto;

pub use handshake::{HandshakeCodec, HandshakeMsg};
pub use micropayment::{
    MetadataEntry, MetadataValue, MicropaymentCodec, MicropaymentMsg, SIGNED_METADATA_KEY,
};
pub use ss_net_codec::CodecError;

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Bytes, BytesMut};

/// Protocol URI for handshake streams.
pub const HANDSHAKE_PROTOCOL: &str = "/scp/handshake/1.0.0";

/// Protocol URI for micropayment streams.
pub const MICROPAYMENT_PROTOCOL: &str = "/scp/micropayment/1.0.0";

/// Maximum frame body size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 32_768;

/// The SCP protocol an incoming or outgoing stream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScpProtocol {
    Handshake,
    Micropayment,
}

impl ScpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScpProtocol::Handshake => HANDSHAKE_PROTOCOL,
            ScpProtocol::Micropayment => MICROPAYMENT_PROTOCOL,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            HANDSHAKE_PROTOCOL => Some(ScpProtocol::Handshake),
            MICROPAYMENT_PROTOCOL => Some(ScpProtocol::Micropayment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any SCP message, tagged with the protocol it travels on.
#[derive(Debug, Clone, PartialEq)]
pub enum ScpMessage {
    Handshake(HandshakeMsg),
    Micropayment(MicropaymentMsg),
}

impl ScpMessage {
    pub fn protocol(&self) -> ScpProtocol {
        match self {
            ScpMessage::Handshake(_) => ScpProtocol::Handshake,
            ScpMessage::Micropayment(_) => ScpProtocol::Micropayment,
        }
    }

    /// Encode the message into a single wire frame.
    pub fn into_frame(self) -> Result<Bytes, CodecError> {
        let mut codec = ScpStreamCodec::new(self.protocol());
        let mut buf = BytesMut::new();
        codec.encode(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl From<HandshakeMsg> for ScpMessage {
    fn from(msg: HandshakeMsg) -> Self {
        ScpMessage::Handshake(msg)
    }
}

impl From<MicropaymentMsg> for ScpMessage {
    fn from(msg: MicropaymentMsg) -> Self {
        ScpMessage::Micropayment(msg)
    }
}

/// Codec for one SCP stream: the protocol URI chosen at stream negotiation
/// decides which message type the frames decode to.
pub struct ScpStreamCodec {
    protocol: ScpProtocol,
    handshake: HandshakeCodec,
    micropayment: MicropaymentCodec,
}

impl ScpStreamCodec {
    pub fn new(protocol: ScpProtocol) -> Self {
        Self {
            protocol,
            handshake: HandshakeCodec::new(MAX_MESSAGE_SIZE),
            micropayment: MicropaymentCodec::new(MAX_MESSAGE_SIZE),
        }
    }

    pub fn protocol(&self) -> ScpProtocol {
        self.protocol
    }
}

impl Encoder for ScpStreamCodec {
    type Item<'a> = ScpMessage;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ScpMessage::Handshake(msg) => self.handshake.encode(msg, dst),
            ScpMessage::Micropayment(msg) => self.micropayment.encode(msg, dst),
        }
    }
}

impl Decoder for ScpStreamCodec {
    type Item = ScpMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.protocol {
            ScpProtocol::Handshake => Ok(self
                .handshake
                .decode(src)?
                .map(ScpMessage::Handshake)),
            ScpProtocol::Micropayment => Ok(self
                .micropayment
                .decode(src)?
                .map(ScpMessage::Micropayment)),
        }
    }
}
