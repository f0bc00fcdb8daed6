//! Engine background workers: billing-cycle rollover, handshake re-checks
//! and the dispatch loop feeding the outbox.

use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::Task;

use super::{Envelope, EngineInner, MAX_HANDSHAKE_TRIES};

const CYCLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const HANDSHAKE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const THAW_INTERVAL: Duration = Duration::from_millis(100);

pub(super) fn start(
    inner: &Arc<EngineInner>,
    outbox_tx: mpsc::Sender<Envelope>,
    token: CancellationToken,
) {
    tokio::spawn(accounting_worker(Arc::clone(inner), token.clone()));
    tokio::spawn(dispatch_worker(Arc::clone(inner), outbox_tx, token));
}

/// Rolls the billing cycle forward and re-checks stalled handshakes.
async fn accounting_worker(inner: Arc<EngineInner>, token: CancellationToken) {
    let mut cycle_tick = tokio::time::interval(CYCLE_CHECK_INTERVAL);
    cycle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut handshake_tick = tokio::time::interval(HANDSHAKE_CHECK_INTERVAL);
    handshake_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire once immediately, giving the startup cycle check.
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("accounting worker shutting down");
                return;
            }
            _ = cycle_tick.tick() => check_and_update(&inner),
            _ = handshake_tick.tick() => recheck_handshakes(&inner),
        }
    }
}

fn check_and_update(inner: &Arc<EngineInner>) {
    let computed = inner.computed_cycle();
    let stored = inner.store.billing_cycle();
    if computed == stored {
        return;
    }
    if computed < stored {
        // The store must never be ahead of the epoch.
        panic!("ledger store billing cycle {stored} is ahead of computed cycle {computed}");
    }
    inner.end_billing_cycle(computed);
}

fn recheck_handshakes(inner: &Arc<EngineInner>) {
    let outstanding: Vec<PeerId> = inner
        .handshakes
        .iter()
        .filter(|entry| !entry.value().done() && entry.value().tries <= MAX_HANDSHAKE_TRIES)
        .map(|entry| *entry.key())
        .collect();
    if outstanding.is_empty() {
        return;
    }
    info!(outstanding = outstanding.len(), "re-sending incomplete handshakes");
    for peer in outstanding {
        let _ = inner.ensure_handshake(peer);
    }
}

/// Pops one task at a time and publishes it on the outbox. The wrapped
/// sent-callback releases the task in the queue, so a failed wire write
/// still lets the queue progress.
async fn dispatch_worker(
    inner: Arc<EngineInner>,
    outbox: mpsc::Sender<Envelope>,
    token: CancellationToken,
) {
    let mut thaw_tick = tokio::time::interval(THAW_INTERVAL);
    thaw_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let (peer, task) = loop {
            let popped = inner.queue.lock().pop(1);
            if let Some((peer, mut tasks)) = popped {
                if let Some(task) = tasks.pop() {
                    break (peer, task);
                }
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("dispatch worker shutting down");
                    return;
                }
                _ = inner.work_signal.notified() => {}
                _ = thaw_tick.tick() => {
                    // A cancelled task may leave its peer frozen; thaw
                    // periodically so the queue cannot wedge.
                    inner.queue.lock().thaw_round();
                }
            }
        };

        let envelope = wrap_envelope(&inner, peer, task);
        tokio::select! {
            _ = token.cancelled() => return,
            sent = outbox.send(envelope) => {
                if sent.is_err() {
                    debug!("outbox receiver dropped; dispatch worker exiting");
                    return;
                }
            }
        }
    }
}

fn wrap_envelope(inner: &Arc<EngineInner>, peer: PeerId, task: Task<Envelope>) -> Envelope {
    let topic = task.topic;
    let envelope = task.data;
    let task_sent = envelope.callback();
    let weak = Arc::downgrade(inner);
    debug!(peer = %peer, %topic, "dispatching SCP message");
    Envelope::new(
        peer,
        envelope.message,
        Arc::new(move || {
            task_sent();
            if let Some(inner) = weak.upgrade() {
                inner.queue.lock().tasks_done(peer, &[topic]);
                inner.signal_new_work();
            }
        }),
    )
}
