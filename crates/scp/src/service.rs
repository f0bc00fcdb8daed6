//! The SCP shim around the block-exchange network.
//!
//! [`Scp`] sits between the block-exchange implementation and the wire: it
//! observes block batches in both directions to drive the engine, gates
//! `peer_connected` notifications on handshake completion, serves inbound
//! SCP streams, and owns the worker that drains the engine outbox onto peer
//! streams.
//!
//! The engine never names the shim: envelopes travel through the outbox
//! channel, which is what breaks the ownership cycle between the two.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use asynchronous_codec::FramedRead;
use futures::{AsyncWriteExt, TryStreamExt};
use libp2p_identity::PeerId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use ss_net_scp::{MetadataValue, ScpMessage, ScpProtocol, ScpStreamCodec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    BlockBatch, BlockExchangeNetwork, BlockExchangeReceiver, HostError, PeerKeystore, ScpStream,
    SwarmHost,
};
use crate::config::{ConfigError, StreamspaceConfig};
use crate::crypto::IdentityCrypto;
use crate::engine::{Engine, EngineOptions, Envelope, Receipt};
use crate::ledger::StoreError;

const SEND_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const STAT_BLOCKS: &str = "blocks";
const STAT_TOTAL: &str = "total";

/// Parameters for a full SCP module with identity-backed crypto.
pub struct ScpParams {
    pub device_id: String,
    pub role: String,
    pub metadata: std::collections::BTreeMap<String, MetadataValue>,
    /// String-encoded currency units per byte, as served by the bootstrap
    /// API.
    pub rate: String,
}

/// Per-key message counters exposed to the driver.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Stat {
    pub sent: u64,
    pub recvd: u64,
}

/// Events external consumers can attach callbacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PeerConnected,
}

/// Shared handle to the SCP shim.
#[derive(Clone)]
pub struct Scp {
    inner: Arc<ScpInner>,
}

struct ScpInner {
    host: Arc<dyn SwarmHost>,
    network: Arc<dyn BlockExchangeNetwork>,
    receiver: RwLock<Option<Arc<dyn BlockExchangeReceiver>>>,
    engine: Engine,
    stats: Mutex<HashMap<String, Stat>>,
    hooks: Mutex<HashMap<Hook, Arc<dyn Fn() + Send + Sync>>>,
}

impl Scp {
    /// Build the full SCP module: Streamspace config, identity-backed
    /// signer and verifier, engine and shim worker.
    pub fn with_params(
        token: CancellationToken,
        host: Arc<dyn SwarmHost>,
        keystore: Arc<dyn PeerKeystore>,
        network: Arc<dyn BlockExchangeNetwork>,
        params: ScpParams,
    ) -> Result<Self, ConfigError> {
        let config =
            StreamspaceConfig::new(params.device_id, params.role, params.metadata, &params.rate)?;
        let opts = EngineOptions::new()
            .with_config(Arc::new(config))
            .with_signer(Box::new(IdentityCrypto::new(
                Arc::clone(&host),
                Arc::clone(&keystore),
            )))
            .with_verifier(Box::new(IdentityCrypto::new(Arc::clone(&host), keystore)));
        let engine = Engine::new(token.clone(), opts);
        Ok(Self::new(token, host, network, engine))
    }

    /// Wrap an existing engine and start the worker draining its outbox.
    pub fn new(
        token: CancellationToken,
        host: Arc<dyn SwarmHost>,
        network: Arc<dyn BlockExchangeNetwork>,
        engine: Engine,
    ) -> Self {
        let outbox = engine.outbox();
        let inner = Arc::new(ScpInner {
            host,
            network,
            receiver: RwLock::new(None),
            engine,
            stats: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
        });
        match outbox {
            Some(rx) => {
                tokio::spawn(outbox_worker(Arc::clone(&inner), rx, token));
            }
            None => warn!("engine outbox already taken; SCP dispatch disabled"),
        }
        Self { inner }
    }

    /// Register the upper block-exchange layer receiving messages and peer
    /// events.
    pub fn set_delegate(&self, receiver: Arc<dyn BlockExchangeReceiver>) {
        *self.inner.receiver.write() = Some(receiver);
    }

    /// Sender override: delegate to the underlying network, then account
    /// the blocks that actually went out.
    pub async fn send_message(&self, peer: PeerId, message: &BlockBatch) -> std::io::Result<()> {
        self.inner.network.send_message(peer, message).await?;
        let total = message.total_len();
        if total > 0 {
            debug!(peer = %peer, total, "updating sent info");
            self.inner.engine.sent_to(peer, message.len() as u64, total);
            self.inner.record_block_transfer(message.len() as u64, total, Direction::Sent);
        }
        Ok(())
    }

    /// Receiver override: hand the blocks to the upper layer, then grow the
    /// invoice for what was consumed.
    pub fn receive_message(&self, peer: PeerId, message: &BlockBatch) {
        if let Some(receiver) = self.inner.receiver.read().clone() {
            receiver.receive_message(peer, message);
        }
        let total = message.total_len();
        if total > 0 {
            debug!(peer = %peer, total, "generating micropayment");
            self.inner.engine.generate_micropayment(peer, total);
            self.inner.engine.received_from(peer, message.len() as u64, total);
            self.inner
                .record_block_transfer(message.len() as u64, total, Direction::Recvd);
        }
    }

    /// Forwarded to the upper layer only once the handshake with `peer` is
    /// complete.
    pub fn peer_connected(&self, peer: PeerId) {
        self.inner.peer_connected(peer);
    }

    pub fn peer_disconnected(&self, peer: PeerId) {
        if let Some(receiver) = self.inner.receiver.read().clone() {
            receiver.peer_disconnected(peer);
        }
    }

    /// Serve one inbound SCP stream: decode frames and dispatch them until
    /// EOF. Handshake messages re-check the connection gate synchronously.
    pub fn handle_incoming_stream(
        &self,
        peer: PeerId,
        protocol: ScpProtocol,
        stream: Box<dyn ScpStream>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut framed = FramedRead::new(stream, ScpStreamCodec::new(protocol));
            loop {
                match framed.try_next().await {
                    Ok(Some(msg)) => {
                        inner.record_message(protocol, Direction::Recvd);
                        let is_handshake = matches!(msg, ScpMessage::Handshake(_));
                        inner.engine.handle_msg(peer, msg);
                        if is_handshake {
                            inner.peer_connected(peer);
                        }
                        debug!(peer = %peer, %protocol, "received SCP message");
                    }
                    Ok(None) => return,
                    Err(e) => {
                        error!(peer = %peer, %protocol, error = %e, "error on SCP stream");
                        return;
                    }
                }
            }
        });
    }

    /// Replace the callback fired for `hook`.
    pub fn add_hook(&self, hook: Hook, f: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.lock().insert(hook, Arc::new(f));
    }

    /// Snapshot of per-protocol and block transfer counters.
    pub fn stats(&self) -> HashMap<String, Stat> {
        self.inner.stats.lock().clone()
    }

    /// Receipts for the current billing cycle.
    pub fn get_micro_payments(&self) -> Result<Vec<Receipt>, StoreError> {
        self.inner.engine.get_current_txns()
    }

    /// Receipts across all pending billing cycles.
    pub fn get_pending_micro_payments(&self) -> Result<Vec<Receipt>, StoreError> {
        self.inner.engine.get_pending_txns()
    }

    pub fn clear_pending_cycles(&self, cycles: &[i64]) -> Result<Vec<i64>, StoreError> {
        self.inner.engine.clear_pending_txns(cycles)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Sent,
    Recvd,
}

impl ScpInner {
    fn peer_connected(&self, peer: PeerId) {
        if self.engine.ensure_handshake(peer) {
            info!(peer = %peer, "SCP handshake done; notifying block exchange");
            if let Some(receiver) = self.receiver.read().clone() {
                receiver.peer_connected(peer);
            }
            let hook = self.hooks.lock().get(&Hook::PeerConnected).cloned();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn record_message(&self, protocol: ScpProtocol, direction: Direction) {
        let mut stats = self.stats.lock();
        let stat = stats.entry(protocol.as_str().to_owned()).or_default();
        match direction {
            Direction::Sent => stat.sent += 1,
            Direction::Recvd => stat.recvd += 1,
        }
    }

    fn record_block_transfer(&self, count: u64, total: u64, direction: Direction) {
        let mut stats = self.stats.lock();
        for (key, amount) in [(STAT_BLOCKS, count), (STAT_TOTAL, total)] {
            let stat = stats.entry(key.to_owned()).or_default();
            match direction {
                Direction::Sent => stat.sent += amount,
                Direction::Recvd => stat.recvd += amount,
            }
        }
    }
}

/// Reads envelopes from the engine outbox and writes them to peer streams.
async fn outbox_worker(
    inner: Arc<ScpInner>,
    mut outbox: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) {
    debug!("SCP task worker started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            envelope = outbox.recv() => {
                let Some(envelope) = envelope else { break };
                send_envelope(&inner, envelope).await;
            }
        }
    }
    debug!("SCP task worker shutting down");
}

async fn send_envelope(inner: &Arc<ScpInner>, envelope: Envelope) {
    let protocol = envelope.message.protocol();
    let written = tokio::time::timeout(
        SEND_MESSAGE_TIMEOUT,
        write_message(inner, &envelope, protocol),
    )
    .await;
    match written {
        Ok(Ok(())) => {
            inner.record_message(protocol, Direction::Sent);
            debug!(peer = %envelope.peer, %protocol, "sent SCP message");
        }
        Ok(Err(e)) => {
            debug!(peer = %envelope.peer, %protocol, error = %e, "failed sending SCP message")
        }
        Err(_) => warn!(peer = %envelope.peer, %protocol, "timed out sending SCP message"),
    }
    // The callback runs whether or not the write succeeded, so its
    // side-effects land and the queue can progress.
    envelope.sent();
}

async fn write_message(
    inner: &Arc<ScpInner>,
    envelope: &Envelope,
    protocol: ScpProtocol,
) -> Result<(), HostError> {
    let frame = envelope
        .message
        .clone()
        .into_frame()
        .map_err(|e| HostError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let mut stream = inner
        .host
        .new_stream(envelope.peer, protocol.as_str())
        .await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    stream.close().await?;
    Ok(())
}
