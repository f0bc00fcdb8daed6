//! The SCP engine.
//!
//! Watches block traffic per peer, converts consumed bytes into a
//! monotonically growing invoice, signs and queues micropayments, verifies
//! incoming ones, and rolls the ledger forward in fixed-duration billing
//! cycles. Outbound messages leave through the [`Envelope`] outbox consumed
//! by the shim's dispatch worker.

mod merger;
mod workers;

pub use merger::ScpTaskMerger;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use libp2p_identity::PeerId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use ss_net_scp::{HandshakeMsg, MicropaymentMsg, ScpMessage};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{DummyConfig, ScpConfig, DUMMY_ROLE};
use crate::crypto::{
    DummySigner, DummyVerifier, DummyWhitelistChecker, MessageSigner, SignatureVerifier,
    WhitelistChecker,
};
use crate::ledger::{DummyStore, LedgerStore, MapLedgerStore, SsLedger, StoreError};
use crate::queue::{PeerTaskQueue, Task, Topic};

const TASK_PRIORITY: i32 = 100;
const MAX_HANDSHAKE_TRIES: u32 = 5;
const HANDSHAKE_RESEND_INTERVAL_SECS: i64 = 60;
const WHITELIST_RECHECK_SECS: i64 = 24 * 3600;

/// Per-peer handshake progress, in-memory only.
#[derive(Debug, Clone, Default)]
pub struct HandshakeState {
    pub sent: bool,
    pub received: bool,
    pub role: String,
    pub device_id: String,
    pub tries: u32,
    pub sent_at: i64,
}

impl HandshakeState {
    fn done(&self) -> bool {
        self.sent && self.received
    }
}

type SentCallback = Arc<dyn Fn() + Send + Sync>;

/// A scheduled outbound message. The `sent` callback runs on the dispatch
/// worker after the wire write finishes, successfully or not.
#[derive(Clone)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: ScpMessage,
    sent: SentCallback,
}

impl Envelope {
    pub fn new(peer: PeerId, message: ScpMessage, sent: SentCallback) -> Self {
        Self {
            peer,
            message,
            sent,
        }
    }

    /// Invoke the sent-callback.
    pub fn sent(&self) {
        (self.sent)()
    }

    pub(crate) fn callback(&self) -> SentCallback {
        Arc::clone(&self.sent)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("peer", &self.peer)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Externally visible snapshot of a ledger entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Receipt {
    pub partner: String,
    pub partner_device: String,
    pub role: String,
    pub sent: f64,
    pub recvd: f64,
    pub exchanges: u32,
    pub whitelisted: bool,
    pub signed_txn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub bill_cycle: i64,
    pub bytes_paid: u64,
    pub bytes_pay_recvd: u64,
    pub blocks_sent: u64,
    pub blocks_recvd: u64,
    pub bytes_sent: u64,
    pub bytes_recvd: u64,
}

impl Receipt {
    fn from_entry(entry: SsLedger, cycle: i64) -> Self {
        let metadata = if entry.metadata.is_empty() {
            None
        } else {
            serde_json::from_slice(&entry.metadata).ok()
        };
        Self {
            partner: entry.partner,
            partner_device: entry.device_id,
            role: entry.role,
            sent: entry.sent,
            recvd: entry.recvd,
            exchanges: entry.mp_exchange_count,
            whitelisted: entry.whitelisted,
            signed_txn: entry.signed_mp,
            metadata,
            bill_cycle: cycle,
            bytes_paid: entry.bytes_paid,
            bytes_pay_recvd: entry.bytes_pay_recvd,
            blocks_sent: entry.blocks_sent,
            blocks_recvd: entry.blocks_recvd,
            bytes_sent: entry.bytes_sent,
            bytes_recvd: entry.bytes_recvd,
        }
    }
}

/// Engine construction options. Missing pieces fall back to the dummy
/// family, which disables Streamspace validation.
#[derive(Default)]
pub struct EngineOptions {
    config: Option<Arc<dyn ScpConfig>>,
    store: Option<Box<dyn LedgerStore>>,
    signer: Option<Box<dyn MessageSigner>>,
    verifier: Option<Box<dyn SignatureVerifier>>,
    whitelist: Option<Box<dyn WhitelistChecker>>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Arc<dyn ScpConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Box<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_signer(mut self, signer: Box<dyn MessageSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_whitelist_checker(mut self, checker: Box<dyn WhitelistChecker>) -> Self {
        self.whitelist = Some(checker);
        self
    }
}

/// Shared, cheaply clonable handle to the engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    ledgers: RwLock<HashMap<PeerId, SsLedger>>,
    handshakes: DashMap<PeerId, HandshakeState>,
    queue: Mutex<PeerTaskQueue<Envelope, ScpTaskMerger>>,
    work_signal: Notify,
    outbox_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    store: Box<dyn LedgerStore>,
    config: Arc<dyn ScpConfig>,
    signer: Box<dyn MessageSigner>,
    verifier: Box<dyn SignatureVerifier>,
    whitelist: Box<dyn WhitelistChecker>,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Quantise to 9 fractional digits. Invoices accumulate many small float
/// products; fixed-precision formatting keeps them from drifting.
fn quantize(v: f64) -> f64 {
    format!("{v:.9}").parse().unwrap_or(v)
}

fn bytes_for(amount: f64, rate: f64) -> u64 {
    if rate > 0.0 {
        (amount / rate) as u64
    } else {
        0
    }
}

impl Engine {
    /// Build the engine and start its background workers. The workers stop
    /// when `token` is cancelled; the outbox closes with them.
    pub fn new(token: CancellationToken, opts: EngineOptions) -> Self {
        let EngineOptions {
            config,
            store,
            signer,
            verifier,
            whitelist,
        } = opts;

        let (config, store) = match config {
            Some(config) => (
                config,
                store.unwrap_or_else(|| Box::new(MapLedgerStore::new())),
            ),
            None => {
                warn!("Streamspace configuration not provided; running with relaxed validation");
                (
                    Arc::new(DummyConfig::default()) as Arc<dyn ScpConfig>,
                    Box::new(DummyStore) as Box<dyn LedgerStore>,
                )
            }
        };

        let (outbox_tx, outbox_rx) = mpsc::channel(1);
        let inner = Arc::new(EngineInner {
            ledgers: RwLock::new(HashMap::new()),
            handshakes: DashMap::new(),
            queue: Mutex::new(PeerTaskQueue::new(ScpTaskMerger)),
            work_signal: Notify::new(),
            outbox_rx: Mutex::new(Some(outbox_rx)),
            store,
            config,
            signer: signer.unwrap_or_else(|| Box::new(DummySigner)),
            verifier: verifier.unwrap_or_else(|| Box::new(DummyVerifier)),
            whitelist: whitelist.unwrap_or_else(|| Box::new(DummyWhitelistChecker)),
        });
        workers::start(&inner, outbox_tx, token);
        Self { inner }
    }

    /// Account blocks received from `peer` over the block-exchange layer.
    pub fn received_from(&self, peer: PeerId, block_count: u64, total_bytes: u64) {
        self.inner.received_from(peer, block_count, total_bytes)
    }

    /// Account blocks sent to `peer` over the block-exchange layer.
    pub fn sent_to(&self, peer: PeerId, block_count: u64, total_bytes: u64) {
        self.inner.sent_to(peer, block_count, total_bytes)
    }

    /// Grow the peer's invoice by `total_bytes * rate` and queue a signed
    /// micropayment for dispatch.
    pub fn generate_micropayment(&self, peer: PeerId, total_bytes: u64) {
        self.inner.generate_micropayment(peer, total_bytes)
    }

    pub fn handle_msg(&self, peer: PeerId, msg: ScpMessage) {
        self.inner.handle_msg(peer, msg)
    }

    /// Non-blocking handshake check; true once both sides exchanged
    /// credentials (or the retry budget ran out).
    pub fn handshake_done(&self, peer: PeerId) -> bool {
        self.inner.handshake_done(peer)
    }

    /// Like [`Engine::handshake_done`], but queues a handshake message when
    /// the exchange is still incomplete.
    pub fn ensure_handshake(&self, peer: PeerId) -> bool {
        self.inner.ensure_handshake(peer)
    }

    /// Commit live ledgers and return receipts for the current cycle.
    pub fn get_current_txns(&self) -> Result<Vec<Receipt>, StoreError> {
        self.inner.get_current_txns()
    }

    /// Receipts across all pending cycles. Entries that never carried a
    /// payment are skipped.
    pub fn get_pending_txns(&self) -> Result<Vec<Receipt>, StoreError> {
        self.inner.get_pending_txns()
    }

    pub fn clear_pending_txns(&self, cycles: &[i64]) -> Result<Vec<i64>, StoreError> {
        self.inner.store.clear_pending(cycles)
    }

    /// Take the outbox receiver. Yields one envelope at a time; `None` once
    /// already taken.
    pub fn outbox(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inner.outbox_rx.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl EngineInner {
    fn new_ledger(&self, peer: PeerId) -> SsLedger {
        let mut entry = SsLedger::new(peer.to_base58());
        match self.store.get(&mut entry) {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                if let Err(e) = self.store.store(&entry) {
                    warn!(peer = %peer, error = %e, "failed persisting new ledger entry");
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "failed loading ledger entry"),
        }
        entry
    }

    /// Make sure a live ledger entry exists for `peer`. Store access happens
    /// outside the map lock.
    fn ensure_ledger(&self, peer: PeerId) {
        if self.ledgers.read().contains_key(&peer) {
            return;
        }
        let entry = self.new_ledger(peer);
        self.ledgers.write().entry(peer).or_insert(entry);
    }

    fn received_from(&self, peer: PeerId, block_count: u64, total_bytes: u64) {
        self.ensure_ledger(peer);
        let mut ledgers = self.ledgers.write();
        if let Some(l) = ledgers.get_mut(&peer) {
            l.blocks_recvd += block_count;
            l.bytes_recvd += total_bytes;
        }
    }

    fn sent_to(&self, peer: PeerId, block_count: u64, total_bytes: u64) {
        self.ensure_ledger(peer);
        let mut ledgers = self.ledgers.write();
        if let Some(l) = ledgers.get_mut(&peer) {
            l.blocks_sent += block_count;
            l.bytes_sent += total_bytes;
        }
    }

    fn refresh_whitelist(&self, l: &mut SsLedger) {
        let now = now_ts();
        if now - l.last_whitelist_check > WHITELIST_RECHECK_SECS {
            l.whitelisted = self.whitelist.is_whitelisted(&l.partner);
            l.last_whitelist_check = now;
        }
    }

    fn generate_micropayment(self: &Arc<Self>, peer: PeerId, total_bytes: u64) {
        self.ensure_ledger(peer);
        let rate = self.config.rate();
        let cycle = self.store.billing_cycle();

        let mut msg = {
            let mut ledgers = self.ledgers.write();
            let Some(l) = ledgers.get_mut(&peer) else { return };
            self.refresh_whitelist(l);
            l.invoice = quantize(l.invoice + total_bytes as f64 * rate);
            MicropaymentMsg::new(l.invoice, cycle, l.device_id.clone(), self.config.metadata())
        };

        if let Err(e) = self.signer.sign_txn(&mut msg) {
            error!(peer = %peer, error = %e, "failed creating micropayment signature");
            return;
        }

        let amount = msg.amount;
        let weak = Arc::downgrade(self);
        let sent: SentCallback = Arc::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let mut ledgers = inner.ledgers.write();
            let Some(l) = ledgers.get_mut(&peer) else { return };
            l.sent = amount;
            l.bytes_paid = bytes_for(l.sent, rate);
            l.mp_exchange_count += 1;
            l.last_mp_exchange = now_ts();
            debug!(peer = %peer, sent = l.sent, bytes_paid = l.bytes_paid,
                "ledger updated after micropayment send");
        });

        debug!(peer = %peer, amount, cycle, "enqueued micropayment");
        self.queue.lock().push(
            peer,
            Task {
                topic: Topic::Micropayment,
                priority: TASK_PRIORITY,
                work: 1,
                data: Envelope::new(peer, msg.into(), sent),
            },
        );
    }

    fn handle_msg(self: &Arc<Self>, peer: PeerId, msg: ScpMessage) {
        match msg {
            ScpMessage::Handshake(hs) => self.handle_handshake(peer, hs),
            ScpMessage::Micropayment(mp) => self.handle_micropayment(peer, mp),
        }
    }

    fn handle_handshake(self: &Arc<Self>, peer: PeerId, msg: HandshakeMsg) {
        let resend = {
            let mut state = self.handshakes.entry(peer).or_default();
            state.received = true;
            state.role = msg.role;
            state.device_id = msg.device_id;
            debug!(peer = %peer, role = %state.role, "handshake received");
            // A peer that drops and reconnects finds our stale in-memory
            // state. If our last answer is old, answer again so its side can
            // complete; a fresh one is still in flight.
            now_ts() - state.sent_at > HANDSHAKE_RESEND_INTERVAL_SECS
        };
        if resend {
            debug!(peer = %peer, "resending handshake to complete exchange");
            self.send_handshake(peer);
        }
    }

    fn handle_micropayment(&self, peer: PeerId, mp: MicropaymentMsg) {
        self.ensure_ledger(peer);

        if self.config.role() != DUMMY_ROLE {
            let cycle = self.store.billing_cycle();
            if i64::from(mp.billing_cycle) != cycle {
                warn!(peer = %peer, expected = cycle, got = mp.billing_cycle,
                    "dropping payment for different billing cycle");
                return;
            }
            let recvd = self
                .ledgers
                .read()
                .get(&peer)
                .map(|l| l.recvd)
                .unwrap_or_default();
            if mp.amount < recvd {
                warn!(peer = %peer, amount = mp.amount, recvd, "dropping stale payment amount");
                return;
            }
            if mp.receiver != self.config.device_id() {
                error!(peer = %peer, receiver = %mp.receiver,
                    "dropping payment addressed to another device");
                return;
            }
        }
        if !self.verifier.verify_txn(&peer, &mp) {
            error!(peer = %peer, "dropping payment with invalid txn signature");
            return;
        }

        let rate = self.config.rate();
        let mut ledgers = self.ledgers.write();
        let Some(l) = ledgers.get_mut(&peer) else { return };
        l.recvd = mp.amount;
        l.bytes_pay_recvd = bytes_for(l.recvd, rate);
        l.mp_exchange_count += 1;
        l.last_mp_exchange = now_ts();
        l.signed_mp = mp.txn_hash.clone();
        l.metadata = mp.metadata_json().unwrap_or_default();
        debug!(peer = %peer, recvd = l.recvd, bytes_pay_recvd = l.bytes_pay_recvd,
            "incoming micropayment recorded");
    }

    fn send_handshake(self: &Arc<Self>, peer: PeerId) {
        let msg = HandshakeMsg::new(self.config.role(), self.config.device_id());
        let weak = Arc::downgrade(self);
        let sent: SentCallback = Arc::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            if let Some(mut state) = inner.handshakes.get_mut(&peer) {
                state.sent = true;
                state.sent_at = now_ts();
                state.tries += 1;
                debug!(peer = %peer, tries = state.tries, "handshake marked sent");
            };
        });

        self.queue.lock().push(
            peer,
            Task {
                topic: Topic::Handshake,
                priority: TASK_PRIORITY,
                work: 1,
                data: Envelope::new(peer, msg.into(), sent),
            },
        );
        debug!(peer = %peer, "enqueued handshake");
        self.signal_new_work();
    }

    fn handshake_done(&self, peer: PeerId) -> bool {
        use dashmap::mapref::entry::Entry;

        let identity = match self.handshakes.entry(peer) {
            Entry::Occupied(e) => {
                let state = e.get();
                if state.done() {
                    Some((state.role.clone(), state.device_id.clone()))
                } else if state.tries > MAX_HANDSHAKE_TRIES {
                    warn!(peer = %peer,
                        "handshake exhausted its retries; treating as done so it gets cleaned up");
                    return true;
                } else {
                    return false;
                }
            }
            Entry::Vacant(v) => {
                v.insert(HandshakeState::default());
                return false;
            }
        };

        if let Some((role, device_id)) = identity {
            self.ensure_ledger(peer);
            let mut ledgers = self.ledgers.write();
            if let Some(l) = ledgers.get_mut(&peer) {
                l.role = role;
                l.device_id = device_id;
            }
            debug!(peer = %peer, "handshake done");
            return true;
        }
        false
    }

    fn ensure_handshake(self: &Arc<Self>, peer: PeerId) -> bool {
        if self.handshake_done(peer) {
            return true;
        }
        self.send_handshake(peer);
        false
    }

    /// Persist live ledgers; when a billing cycle ends, reset the committed
    /// entries in place so partner identity survives.
    fn commit_live_ledgers(&self, end_cycle: bool) {
        let snapshot: Vec<SsLedger> = self.ledgers.read().values().cloned().collect();
        let mut committed = Vec::new();
        for entry in &snapshot {
            debug!(partner = %entry.partner, txn = %entry.short_txn(), "committing ledger");
            match self.store.store(entry) {
                Ok(()) => committed.push(entry.partner.clone()),
                Err(e) => warn!(partner = %entry.partner, error = %e, "failed committing ledger"),
            }
        }
        if end_cycle {
            let mut ledgers = self.ledgers.write();
            for l in ledgers.values_mut() {
                if committed.iter().any(|p| *p == l.partner) {
                    l.reset();
                }
            }
        }
    }

    fn computed_cycle(&self) -> i64 {
        let elapsed_ms = (Utc::now() - self.config.epoch()).num_milliseconds();
        let cycle_ms = self.config.cycle().as_millis() as i64;
        if cycle_ms <= 0 {
            return 0;
        }
        (elapsed_ms as f64 / cycle_ms as f64).ceil() as i64
    }

    fn end_billing_cycle(&self, new_cycle: i64) {
        self.commit_live_ledgers(true);
        debug!(from = self.store.billing_cycle(), to = new_cycle, "updating billing cycle");
        if let Err(e) = self.store.update(new_cycle) {
            // Running on with a stale cycle would corrupt every subsequent
            // accounting operation.
            panic!("failed moving ledger store to billing cycle {new_cycle}: {e}");
        }
    }

    fn get_current_txns(&self) -> Result<Vec<Receipt>, StoreError> {
        self.commit_live_ledgers(false);
        let list = self.store.list()?;
        let cycle = self.store.billing_cycle();
        Ok(list
            .into_iter()
            .map(|l| Receipt::from_entry(l, cycle))
            .collect())
    }

    fn get_pending_txns(&self) -> Result<Vec<Receipt>, StoreError> {
        let pending = self.store.get_pending()?;
        let mut receipts = Vec::new();
        for (cycle, entries) in pending {
            for entry in entries {
                if entry.signed_mp.is_empty() && entry.recvd == 0.0 && entry.bytes_paid == 0 {
                    debug!(partner = %entry.partner, cycle, "ignoring empty pending txn");
                    continue;
                }
                receipts.push(Receipt::from_entry(entry, cycle));
            }
        }
        Ok(receipts)
    }

    fn signal_new_work(&self) {
        self.work_signal.notify_one();
    }
}
