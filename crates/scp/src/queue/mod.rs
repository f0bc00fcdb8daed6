//! Fair per-peer task queue with topic-aware merging.
//!
//! Each peer holds at most one queued task per topic: pushing a task whose
//! topic is already queued consults the [`TaskMerger`] instead of enqueuing
//! a duplicate. Popping round-robins across peers; within a peer, higher
//! priority wins and ties go to the oldest task.
//!
//! Removing tasks freezes the peer until the next [`PeerTaskQueue::thaw_round`],
//! which the dispatch worker invokes periodically so a cancellation can never
//! wedge the queue.

use std::collections::{HashMap, HashSet, VecDeque};

use libp2p_identity::PeerId;

/// Topics a task can be queued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Handshake,
    Micropayment,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Handshake => f.write_str("Handshake"),
            Topic::Micropayment => f.write_str("Micropayment"),
        }
    }
}

/// One unit of scheduled work for a peer.
#[derive(Debug, Clone)]
pub struct Task<D> {
    pub topic: Topic,
    pub priority: i32,
    pub work: usize,
    pub data: D,
}

/// Decides whether a newly pushed task adds information over queued or
/// in-flight tasks of the same topic, and how to fold it in.
pub trait TaskMerger<D>: Send {
    fn has_new_info(&self, task: &Task<D>, existing: &[&Task<D>]) -> bool;
    fn merge(&self, task: Task<D>, existing: &mut Task<D>);
}

struct QueuedTask<D> {
    seq: u64,
    task: Task<D>,
}

#[derive(Default)]
struct PeerTracker<D> {
    pending: HashMap<Topic, QueuedTask<D>>,
    active: HashMap<Topic, Task<D>>,
}

impl<D> PeerTracker<D> {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

pub struct PeerTaskQueue<D, M> {
    peers: HashMap<PeerId, PeerTracker<D>>,
    rotation: VecDeque<PeerId>,
    frozen: HashSet<PeerId>,
    merger: M,
    next_seq: u64,
}

impl<D: Clone, M: TaskMerger<D>> PeerTaskQueue<D, M> {
    pub fn new(merger: M) -> Self {
        Self {
            peers: HashMap::new(),
            rotation: VecDeque::new(),
            frozen: HashSet::new(),
            merger,
            next_seq: 0,
        }
    }

    /// Queue a task for `peer`, merging against existing same-topic work.
    pub fn push(&mut self, peer: PeerId, task: Task<D>) {
        let tracker = self.peers.entry(peer).or_insert_with(PeerTracker::new);

        if let Some(existing) = tracker.pending.get_mut(&task.topic) {
            if self.merger.has_new_info(&task, &[&existing.task]) {
                self.merger.merge(task, &mut existing.task);
            }
            return;
        }
        if let Some(active) = tracker.active.get(&task.topic) {
            // The task is already in flight; only queue a follow-up when it
            // actually carries new information.
            if !self.merger.has_new_info(&task, &[active]) {
                return;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        tracker.pending.insert(task.topic, QueuedTask { seq, task });
        if !self.rotation.contains(&peer) {
            self.rotation.push_back(peer);
        }
    }

    /// Pop up to `batch` tasks from the next peer in the rotation. Returns
    /// `None` when no unfrozen peer has pending work.
    pub fn pop(&mut self, batch: usize) -> Option<(PeerId, Vec<Task<D>>)> {
        for _ in 0..self.rotation.len() {
            let peer = self.rotation.pop_front()?;
            let tracker = match self.peers.get_mut(&peer) {
                Some(t) => t,
                None => continue,
            };
            if self.frozen.contains(&peer) || tracker.pending.is_empty() {
                if !tracker.is_idle() {
                    self.rotation.push_back(peer);
                } else {
                    self.peers.remove(&peer);
                }
                continue;
            }

            let mut popped = Vec::new();
            while popped.len() < batch {
                let best = tracker
                    .pending
                    .values()
                    .max_by(|a, b| {
                        a.task
                            .priority
                            .cmp(&b.task.priority)
                            .then(b.seq.cmp(&a.seq))
                    })
                    .map(|q| q.task.topic);
                let Some(topic) = best else { break };
                let queued = tracker
                    .pending
                    .remove(&topic)
                    .expect("topic chosen from pending");
                tracker.active.insert(topic, queued.task.clone());
                popped.push(queued.task);
            }
            self.rotation.push_back(peer);
            return Some((peer, popped));
        }
        None
    }

    /// Mark previously popped tasks as finished.
    pub fn tasks_done(&mut self, peer: PeerId, tasks: &[Topic]) {
        if let Some(tracker) = self.peers.get_mut(&peer) {
            for topic in tasks {
                tracker.active.remove(topic);
            }
            if tracker.is_idle() {
                self.peers.remove(&peer);
                self.rotation.retain(|p| *p != peer);
            }
        }
    }

    /// Drop a queued task and freeze the peer until the next thaw round.
    pub fn remove(&mut self, peer: PeerId, topic: Topic) {
        if let Some(tracker) = self.peers.get_mut(&peer) {
            tracker.pending.remove(&topic);
        }
        self.frozen.insert(peer);
    }

    /// Unfreeze every frozen peer.
    pub fn thaw_round(&mut self) {
        self.frozen.clear();
    }

    /// Number of pending tasks across all peers.
    pub fn len(&self) -> usize {
        self.peers.values().map(|t| t.pending.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Merger that keeps the larger payload.
    struct MaxMerger;

    impl TaskMerger<u64> for MaxMerger {
        fn has_new_info(&self, task: &Task<u64>, existing: &[&Task<u64>]) -> bool {
            existing.iter().all(|e| task.data > e.data)
        }

        fn merge(&self, task: Task<u64>, existing: &mut Task<u64>) {
            if task.data > existing.data {
                existing.data = task.data;
            }
        }
    }

    fn task(topic: Topic, priority: i32, data: u64) -> Task<u64> {
        Task {
            topic,
            priority,
            work: 1,
            data,
        }
    }

    #[test]
    fn pop_round_robins_across_peers() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        let b = PeerId::random();
        q.push(a, task(Topic::Micropayment, 100, 1));
        q.push(b, task(Topic::Micropayment, 100, 2));
        q.push(a, task(Topic::Handshake, 100, 3));

        let (first, _) = q.pop(1).unwrap();
        let (second, _) = q.pop(1).unwrap();
        assert_ne!(first, second);

        let (third, _) = q.pop(1).unwrap();
        assert_eq!(third, a);
    }

    #[test]
    fn priority_wins_within_a_peer() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        q.push(a, task(Topic::Micropayment, 10, 1));
        q.push(a, task(Topic::Handshake, 100, 2));

        let (_, tasks) = q.pop(1).unwrap();
        assert_eq!(tasks[0].topic, Topic::Handshake);
    }

    #[test]
    fn same_topic_merges_instead_of_duplicating() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        q.push(a, task(Topic::Micropayment, 100, 2));
        q.push(a, task(Topic::Micropayment, 100, 5));
        q.push(a, task(Topic::Micropayment, 100, 3));

        assert_eq!(q.len(), 1);
        let (_, tasks) = q.pop(1).unwrap();
        assert_eq!(tasks[0].data, 5);
    }

    #[test]
    fn stale_push_over_active_task_is_dropped() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        q.push(a, task(Topic::Micropayment, 100, 5));
        let _ = q.pop(1).unwrap();

        // Lower payload than the in-flight task: dropped.
        q.push(a, task(Topic::Micropayment, 100, 3));
        assert!(q.pop(1).map(|(_, t)| t.is_empty()).unwrap_or(true));

        // Higher payload: queued as a follow-up.
        q.push(a, task(Topic::Micropayment, 100, 9));
        let (_, tasks) = q.pop(1).unwrap();
        assert_eq!(tasks[0].data, 9);
    }

    #[test]
    fn tasks_done_releases_peer_state() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        q.push(a, task(Topic::Handshake, 100, 1));
        let (peer, tasks) = q.pop(1).unwrap();
        q.tasks_done(peer, &[tasks[0].topic]);
        assert!(q.is_empty());
        assert!(q.pop(1).is_none());
    }

    #[test]
    fn frozen_peer_is_skipped_until_thaw() {
        let mut q = PeerTaskQueue::new(MaxMerger);
        let a = PeerId::random();
        q.push(a, task(Topic::Micropayment, 100, 1));
        q.remove(a, Topic::Handshake);

        assert!(q.pop(1).is_none());
        q.thaw_round();
        assert!(q.pop(1).is_some());
    }
}
