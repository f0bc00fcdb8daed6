//! Narrow interfaces to the out-of-scope collaborators.
//!
//! The SCP core never talks to the transport, the DHT or the block-exchange
//! implementation directly; it sees them only through these traits. The
//! fetch driver supplies the real implementations.

use async_trait::async_trait;
use bytes::Bytes;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p_identity::{PeerId, PublicKey};

/// A negotiated bidirectional stream to a peer.
pub trait ScpStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ScpStream for T {}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("no route to peer {0}")]
    PeerUnreachable(PeerId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The local swarm host: identity plus the ability to open protocol streams.
#[async_trait]
pub trait SwarmHost: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Sign `payload` with the host's identity key.
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, HostError>;

    /// Open an outbound stream to `peer` negotiated under `protocol`.
    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> Result<Box<dyn ScpStream>, HostError>;
}

/// Lookup of peer public keys learned by the transport layer.
pub trait PeerKeystore: Send + Sync {
    fn public_key(&self, peer: &PeerId) -> Option<PublicKey>;
}

/// The payload of one block-exchange message: raw block bodies.
#[derive(Debug, Clone, Default)]
pub struct BlockBatch {
    pub blocks: Vec<Bytes>,
}

impl BlockBatch {
    pub fn new(blocks: Vec<Bytes>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.blocks.iter().map(|b| b.len() as u64).sum()
    }
}

/// The underlying block-exchange sender the shim delegates to.
#[async_trait]
pub trait BlockExchangeNetwork: Send + Sync {
    async fn send_message(&self, peer: PeerId, message: &BlockBatch) -> std::io::Result<()>;
}

/// The upper block-exchange layer receiving messages and peer events.
pub trait BlockExchangeReceiver: Send + Sync {
    fn receive_message(&self, peer: PeerId, message: &BlockBatch);
    fn peer_connected(&self, peer: PeerId);
    fn peer_disconnected(&self, peer: PeerId);
}
