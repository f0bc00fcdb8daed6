//! End-to-end exchange tests: two SCP nodes wired over in-memory duplex
//! streams, with real framing, signing and verification in the path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use libp2p_identity::{Keypair, PeerId, PublicKey};
use parking_lot::Mutex;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;

use ss_net_scp::ScpProtocol;
use ss_scp::api::{
    BlockBatch, BlockExchangeNetwork, BlockExchangeReceiver, HostError, PeerKeystore, ScpStream,
    SwarmHost,
};
use ss_scp::config::StreamspaceConfig;
use ss_scp::{Engine, EngineOptions, Scp, ScpParams};

const RATE: &str = "0.000001";

/// Routes stream opens between registered SCP instances.
#[derive(Default, Clone)]
struct Switch {
    peers: Arc<Mutex<HashMap<PeerId, Scp>>>,
}

impl Switch {
    fn register(&self, peer: PeerId, scp: Scp) {
        self.peers.lock().insert(peer, scp);
    }
}

struct TestHost {
    keypair: Keypair,
    peer_id: PeerId,
    switch: Switch,
}

#[async_trait]
impl SwarmHost for TestHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, HostError> {
        self.keypair
            .sign(payload)
            .map_err(|e| HostError::Signing(e.to_string()))
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> Result<Box<dyn ScpStream>, HostError> {
        let remote = self
            .switch
            .peers
            .lock()
            .get(&peer)
            .cloned()
            .ok_or(HostError::PeerUnreachable(peer))?;
        let proto = ScpProtocol::from_uri(protocol).ok_or_else(|| {
            HostError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unknown protocol",
            ))
        })?;
        let (local, remote_end) = tokio::io::duplex(64 * 1024);
        remote.handle_incoming_stream(self.peer_id, proto, Box::new(remote_end.compat()));
        Ok(Box::new(local.compat()))
    }
}

#[derive(Default)]
struct TestKeystore {
    keys: Mutex<HashMap<PeerId, PublicKey>>,
}

impl PeerKeystore for TestKeystore {
    fn public_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.keys.lock().get(peer).cloned()
    }
}

struct NullNetwork;

#[async_trait]
impl BlockExchangeNetwork for NullNetwork {
    async fn send_message(&self, _peer: PeerId, _message: &BlockBatch) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReceiver {
    connected: Mutex<Vec<PeerId>>,
}

impl BlockExchangeReceiver for RecordingReceiver {
    fn receive_message(&self, _peer: PeerId, _message: &BlockBatch) {}

    fn peer_connected(&self, peer: PeerId) {
        self.connected.lock().push(peer);
    }

    fn peer_disconnected(&self, _peer: PeerId) {}
}

impl RecordingReceiver {
    fn saw(&self, peer: PeerId) -> bool {
        self.connected.lock().contains(&peer)
    }
}

struct TestNode {
    scp: Scp,
    peer_id: PeerId,
    receiver: Arc<RecordingReceiver>,
    _token: CancellationToken,
}

fn spawn_node(
    switch: &Switch,
    keystore: &Arc<TestKeystore>,
    device_id: &str,
    role: &str,
) -> TestNode {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id();
    keystore.keys.lock().insert(peer_id, keypair.public());

    let host = Arc::new(TestHost {
        keypair,
        peer_id,
        switch: switch.clone(),
    });
    let token = CancellationToken::new();
    let scp = Scp::with_params(
        token.clone(),
        host,
        Arc::clone(keystore) as Arc<dyn PeerKeystore>,
        Arc::new(NullNetwork),
        ScpParams {
            device_id: device_id.to_owned(),
            role: role.to_owned(),
            metadata: BTreeMap::new(),
            rate: RATE.to_owned(),
        },
    )
    .expect("valid params");
    let receiver = Arc::new(RecordingReceiver::default());
    scp.set_delegate(Arc::clone(&receiver) as Arc<dyn BlockExchangeReceiver>);
    switch.register(peer_id, scp.clone());

    TestNode {
        scp,
        peer_id,
        receiver,
        _token: token,
    }
}

/// Drive the connection gate like the transport would (it re-notifies on
/// connection events) until the upper layer got unblocked.
async fn await_connected(node: &TestNode, remote: PeerId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            node.scp.peer_connected(remote);
            if node.receiver.saw(remote) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("handshake should complete");
}

async fn complete_handshake(a: &TestNode, b: &TestNode) {
    await_connected(b, a.peer_id).await;
    await_connected(a, b.peer_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_completes_both_ways() {
    let switch = Switch::default();
    let keystore = Arc::new(TestKeystore::default());
    let a = spawn_node(&switch, &keystore, "d-A", "hive");
    let b = spawn_node(&switch, &keystore, "d-B", "light-client");

    complete_handshake(&a, &b).await;

    // Each ledger carries the partner's announced identity.
    let receipts = a.scp.get_micro_payments().unwrap();
    let of_b = receipts
        .iter()
        .find(|r| r.partner == b.peer_id.to_base58())
        .expect("ledger for b");
    assert_eq!(of_b.role, "light-client");
    assert_eq!(of_b.partner_device, "d-B");

    let receipts = b.scp.get_micro_payments().unwrap();
    let of_a = receipts
        .iter()
        .find(|r| r.partner == a.peer_id.to_base58())
        .expect("ledger for a");
    assert_eq!(of_a.role, "hive");
    assert_eq!(of_a.partner_device, "d-A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_micropayment_settles() {
    let switch = Switch::default();
    let keystore = Arc::new(TestKeystore::default());
    let a = spawn_node(&switch, &keystore, "d-A", "hive");
    let b = spawn_node(&switch, &keystore, "d-B", "light-client");
    complete_handshake(&a, &b).await;

    // B consumed one mebibyte of blocks served by A.
    let blocks = BlockBatch::new(vec![Bytes::from(vec![0u8; 1 << 20])]);
    b.scp.receive_message(a.peer_id, &blocks);

    // A verifies the incoming payment and records it.
    let of_b = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let receipts = a.scp.get_micro_payments().unwrap();
            if let Some(r) = receipts
                .iter()
                .find(|r| r.partner == b.peer_id.to_base58() && r.recvd > 0.0)
            {
                break r.clone();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("payment should arrive");

    assert_eq!(of_b.recvd, 1.048576);
    assert_eq!(of_b.bytes_pay_recvd, 1_048_576);
    assert_eq!(of_b.exchanges, 1);
    assert!(!of_b.signed_txn.is_empty());

    // B committed the sent amount through the envelope callback.
    let of_a = b
        .scp
        .get_micro_payments()
        .unwrap()
        .into_iter()
        .find(|r| r.partner == a.peer_id.to_base58())
        .expect("ledger for a");
    assert_eq!(of_a.sent, 1.048576);
    assert_eq!(of_a.bytes_paid, 1_048_576);
    assert_eq!(of_a.blocks_recvd, 1);
    assert_eq!(of_a.bytes_recvd, 1 << 20);

    // Both sides counted the micropayment stream.
    let stats = a.scp.stats();
    assert!(stats["/scp/micropayment/1.0.0"].recvd >= 1);
    let stats = b.scp.stats();
    assert!(stats["/scp/micropayment/1.0.0"].sent >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_consumption_keeps_amounts_monotone() {
    let switch = Switch::default();
    let keystore = Arc::new(TestKeystore::default());
    let a = spawn_node(&switch, &keystore, "d-A", "hive");
    let b = spawn_node(&switch, &keystore, "d-B", "light-client");
    complete_handshake(&a, &b).await;

    for _ in 0..5 {
        let blocks = BlockBatch::new(vec![Bytes::from(vec![0u8; 200_000])]);
        b.scp.receive_message(a.peer_id, &blocks);
    }

    // Five batches of 200 kB at 1e-6 per byte.
    let expected = 1.0;
    let of_b = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let receipts = a.scp.get_micro_payments().unwrap();
            if let Some(r) = receipts
                .iter()
                .find(|r| r.partner == b.peer_id.to_base58() && r.recvd >= expected)
            {
                break r.clone();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("final amount should arrive");

    assert_eq!(of_b.recvd, expected);
    assert_eq!(of_b.bytes_pay_recvd, 1_000_000);

    // Bursts collapse in the queue: A saw at most five payment messages,
    // and never a decreasing amount (recvd would have stayed behind).
    let stats = a.scp.stats();
    assert!(stats["/scp/micropayment/1.0.0"].recvd <= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_rollover_moves_ledger_to_pending() {
    // Private schedule: the billing cycle turns every two seconds.
    let config = StreamspaceConfig::new("d-local", "light-client", BTreeMap::new(), RATE)
        .unwrap()
        .with_schedule(Utc::now() - chrono::Duration::seconds(1), Duration::from_secs(2));
    let token = CancellationToken::new();
    let engine = Engine::new(
        token.clone(),
        EngineOptions::new().with_config(Arc::new(config)),
    );
    let peer = PeerId::random();

    engine.received_from(peer, 1, 500_000);
    engine.generate_micropayment(peer, 500_000);
    // Let the dispatch worker surface the envelope, then commit it as sent.
    let mut outbox = engine.outbox().expect("outbox untaken");
    let envelope = tokio::time::timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("dispatch should pop the task")
        .expect("outbox open");
    envelope.sent();

    let first_cycle = engine.get_current_txns().unwrap()[0].bill_cycle;

    // The 5 s cycle worker tick lands in a later cycle and rolls over.
    let pending = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let pending = engine.get_pending_txns().unwrap();
            if !pending.is_empty() {
                break pending;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("rollover should publish pending receipts");

    let entry = pending
        .iter()
        .find(|r| r.partner == peer.to_base58())
        .expect("pending entry");
    assert_eq!(entry.bill_cycle, first_cycle);
    assert_eq!(entry.sent, 0.5);
    assert_eq!(entry.bytes_paid, 500_000);

    // Live entry survived with identity intact and counters zeroed.
    let live = engine.get_current_txns().unwrap();
    let live_entry = live
        .iter()
        .find(|r| r.partner == peer.to_base58())
        .expect("live entry");
    assert!(live_entry.bill_cycle > first_cycle);
    assert_eq!(live_entry.sent, 0.0);
    assert_eq!(live_entry.bytes_recvd, 0);

    // Clearing the elapsed cycle empties the pending set.
    let cleared = engine.clear_pending_txns(&[first_cycle]).unwrap();
    assert_eq!(cleared, vec![first_cycle]);
    assert!(engine.get_pending_txns().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_connected_hook_fires_once_handshake_is_done() {
    let switch = Switch::default();
    let keystore = Arc::new(TestKeystore::default());
    let a = spawn_node(&switch, &keystore, "d-A", "hive");
    let b = spawn_node(&switch, &keystore, "d-B", "light-client");

    let fired = Arc::new(Mutex::new(0u32));
    let fired_clone = Arc::clone(&fired);
    b.scp.add_hook(ss_scp::Hook::PeerConnected, move || {
        *fired_clone.lock() += 1;
    });

    complete_handshake(&a, &b).await;
    assert!(*fired.lock() >= 1);
}
