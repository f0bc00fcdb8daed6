//! The seam to the p2p stack.
//!
//! Transport, DHT and the block-exchange protocol are external
//! collaborators; the driver only needs to build them once per fetch and
//! wire the SCP shim in between. [`StackBuilder`] produces the pieces,
//! [`BlockExchangeFactory::attach`] installs the shim the way the exchange
//! expects (it registers itself as the shim's delegate receiver).

use std::sync::Arc;

use async_trait::async_trait;
use libp2p_identity::Keypair;
use ss_scp::api::{BlockExchangeNetwork, PeerKeystore, SwarmHost};
use ss_scp::Scp;
use tokio::io::AsyncRead;

use crate::bootstrap::LeaderInfo;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("p2p transport backend not configured")]
    Unconfigured,

    #[error("failed setting up transport: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid file hash {0:?}")]
    BadHash(String),

    #[error("fetch failed: {0}")]
    Exchange(String),
}

/// Streams the file assembled from exchanged blocks.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// Connect to the given leader peers; returns how many connections
    /// succeeded.
    async fn connect(&self, leaders: &[LeaderInfo]) -> usize;

    /// Open the file identified by `hash`, returning its total size and a
    /// reader over the reassembled bytes.
    async fn open(
        &self,
        hash: &str,
    ) -> Result<(u64, Box<dyn AsyncRead + Send + Unpin>), FetchError>;
}

/// Builds the block-exchange around the SCP shim.
pub trait BlockExchangeFactory: Send + Sync {
    fn attach(&self, scp: &Scp) -> Arc<dyn FileFetcher>;
}

/// The assembled p2p stack for one fetch.
pub struct SwarmStack {
    pub host: Arc<dyn SwarmHost>,
    pub keystore: Arc<dyn PeerKeystore>,
    pub network: Arc<dyn BlockExchangeNetwork>,
    pub exchange: Arc<dyn BlockExchangeFactory>,
}

/// Builds the transport for one fetch attempt.
#[async_trait]
pub trait StackBuilder: Send + Sync {
    async fn build(&self, keypair: &Keypair, swarm_key: [u8; 32]) -> Result<SwarmStack, StackError>;
}

/// Placeholder builder for binaries shipped without a transport backend.
pub struct UnconfiguredStack;

#[async_trait]
impl StackBuilder for UnconfiguredStack {
    async fn build(
        &self,
        _keypair: &Keypair,
        _swarm_key: [u8; 32],
    ) -> Result<SwarmStack, StackError> {
        Err(StackError::Unconfigured)
    }
}
