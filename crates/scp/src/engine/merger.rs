//! Merge policy for queued SCP tasks.

use ss_net_scp::ScpMessage;

use crate::queue::{Task, TaskMerger, Topic};

use super::Envelope;

/// Handshakes never carry new information, so a queued one is simply kept
/// up to date. A micropayment supersedes queued ones only when it claims a
/// higher billing cycle or a higher amount; under bursty generation the
/// queue therefore collapses to the latest, strictly-higher invoice.
pub struct ScpTaskMerger;

impl TaskMerger<Envelope> for ScpTaskMerger {
    fn has_new_info(&self, task: &Task<Envelope>, existing: &[&Task<Envelope>]) -> bool {
        match task.topic {
            Topic::Handshake => false,
            Topic::Micropayment => {
                let ScpMessage::Micropayment(new) = &task.data.message else {
                    return false;
                };
                existing.iter().all(|et| match &et.data.message {
                    ScpMessage::Micropayment(old) => {
                        new.billing_cycle > old.billing_cycle || new.amount > old.amount
                    }
                    _ => true,
                })
            }
        }
    }

    fn merge(&self, task: Task<Envelope>, existing: &mut Task<Envelope>) {
        match task.topic {
            Topic::Handshake => existing.data = task.data,
            Topic::Micropayment => {
                let newer = match (&task.data.message, &existing.data.message) {
                    (ScpMessage::Micropayment(new), ScpMessage::Micropayment(old)) => {
                        new.billing_cycle > old.billing_cycle || new.amount > old.amount
                    }
                    _ => false,
                };
                if newer {
                    existing.data = task.data;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use libp2p_identity::PeerId;
    use ss_net_scp::{HandshakeMsg, MicropaymentMsg};

    use super::*;

    fn mp_task(peer: PeerId, amount: f64, cycle: i64) -> Task<Envelope> {
        let msg = MicropaymentMsg::new(amount, cycle, "d-B", &Default::default());
        Task {
            topic: Topic::Micropayment,
            priority: 100,
            work: 1,
            data: Envelope::new(peer, msg.into(), Arc::new(|| {})),
        }
    }

    fn hs_task(peer: PeerId, role: &str) -> Task<Envelope> {
        Task {
            topic: Topic::Handshake,
            priority: 100,
            work: 1,
            data: Envelope::new(peer, HandshakeMsg::new(role, "d-B").into(), Arc::new(|| {})),
        }
    }

    fn amount_of(task: &Task<Envelope>) -> f64 {
        match &task.data.message {
            ScpMessage::Micropayment(mp) => mp.amount,
            _ => panic!("not a micropayment"),
        }
    }

    #[test]
    fn handshake_never_has_new_info() {
        let peer = PeerId::random();
        let merger = ScpTaskMerger;
        assert!(!merger.has_new_info(&hs_task(peer, "light-client"), &[&hs_task(peer, "hive")]));
    }

    #[test]
    fn handshake_merge_replaces_verbatim() {
        let peer = PeerId::random();
        let merger = ScpTaskMerger;
        let mut existing = hs_task(peer, "old-role");
        merger.merge(hs_task(peer, "new-role"), &mut existing);
        let ScpMessage::Handshake(hs) = &existing.data.message else {
            panic!("not a handshake");
        };
        assert_eq!(hs.role, "new-role");
    }

    #[test]
    fn higher_amount_has_new_info() {
        let peer = PeerId::random();
        let merger = ScpTaskMerger;
        assert!(merger.has_new_info(&mp_task(peer, 5.0, 1), &[&mp_task(peer, 2.0, 1)]));
        assert!(!merger.has_new_info(&mp_task(peer, 3.0, 1), &[&mp_task(peer, 5.0, 1)]));
    }

    #[test]
    fn higher_cycle_has_new_info_despite_lower_amount() {
        let peer = PeerId::random();
        let merger = ScpTaskMerger;
        assert!(merger.has_new_info(&mp_task(peer, 0.5, 2), &[&mp_task(peer, 5.0, 1)]));
    }

    #[test]
    fn lower_amount_never_merges_over_higher() {
        let peer = PeerId::random();
        let merger = ScpTaskMerger;
        let mut existing = mp_task(peer, 5.0, 1);
        merger.merge(mp_task(peer, 3.0, 1), &mut existing);
        assert_eq!(amount_of(&existing), 5.0);

        merger.merge(mp_task(peer, 7.0, 1), &mut existing);
        assert_eq!(amount_of(&existing), 7.0);
    }
}
