//! Strict replication: broadcast a write, then wait for enough followers to
//! acknowledge it before the leader applies it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::AckPolicy;
use crate::error::{Error, Result};
use crate::leader::registry::{FollowerId, FollowerRegistry};
use crate::message::Message;
use crate::sequencer::Sequencer;
use crate::store::KvStore;

/// What recording one ACK did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// No write with that sequence is waiting (already resolved or never sent).
    Unknown,
    /// This follower already acknowledged the sequence.
    Duplicate,
    Counted { received: usize, required: usize },
    /// This ACK brought the write to its threshold.
    QuorumReached { received: usize, required: usize },
}

#[derive(Debug)]
struct PendingCommit {
    required: usize,
    acked: HashSet<FollowerId>,
    done: Option<oneshot::Sender<()>>,
}

/// A registered write whose acknowledgements are being collected.
#[derive(Debug)]
pub struct PendingAck {
    sequence: u64,
    required: usize,
    done: oneshot::Receiver<()>,
}

impl PendingAck {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn required(&self) -> usize {
        self.required
    }
}

/// Acknowledgements for in-flight strict writes, keyed by sequence number.
///
/// Follower reader tasks call [`AckTracker::record`]; the request handler that
/// registered the write waits on it with [`AckTracker::wait`].
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<u64, PendingCommit>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting acknowledgements for `sequence` from `followers`
    /// registered followers.
    ///
    /// Must be called before the write is sent so no early ACK is lost.
    pub fn register(&self, sequence: u64, followers: usize, policy: AckPolicy) -> PendingAck {
        let required = policy.required(followers);
        let (tx, rx) = oneshot::channel();
        let mut commit = PendingCommit {
            required,
            acked: HashSet::new(),
            done: Some(tx),
        };
        if required == 0 {
            if let Some(done) = commit.done.take() {
                let _ = done.send(());
            }
        }
        self.pending.lock().insert(sequence, commit);
        PendingAck {
            sequence,
            required,
            done: rx,
        }
    }

    /// Credits `follower` with an acknowledgement of `sequence`.
    ///
    /// `reported` is the id the follower put in the frame, kept for logging
    /// only; counting uses the leader-assigned connection id.
    pub fn record(&self, sequence: u64, follower: FollowerId, reported: Option<u32>) -> AckOutcome {
        let mut pending = self.pending.lock();
        let Some(commit) = pending.get_mut(&sequence) else {
            debug!(sequence, follower, "dropping ACK for unknown sequence");
            return AckOutcome::Unknown;
        };
        if !commit.acked.insert(follower) {
            debug!(sequence, follower, "duplicate ACK");
            return AckOutcome::Duplicate;
        }

        let received = commit.acked.len();
        let required = commit.required;
        debug!(sequence, follower, reported = ?reported, received, required, "received ACK");
        if received >= required {
            if let Some(done) = commit.done.take() {
                let _ = done.send(());
                return AckOutcome::QuorumReached { received, required };
            }
        }
        AckOutcome::Counted { received, required }
    }

    /// Waits until the threshold is met or `deadline` passes, then stops
    /// tracking the sequence.
    ///
    /// Returns the number of followers that acknowledged.
    pub async fn wait(&self, pending: PendingAck, deadline: Instant) -> Result<usize> {
        let PendingAck {
            sequence,
            required,
            done,
        } = pending;
        let _ = timeout_at(deadline, done).await;

        let received = self
            .pending
            .lock()
            .remove(&sequence)
            .map(|commit| commit.acked.len())
            .unwrap_or_default();
        if received >= required {
            Ok(received)
        } else {
            Err(Error::ReplicationTimeout {
                sequence,
                received,
                required,
            })
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Runs the broadcast-and-wait step of a strict write and applies the
/// committed result to the leader's store in sequence order.
#[derive(Debug)]
pub struct QuorumReplicator {
    tracker: Arc<AckTracker>,
    policy: AckPolicy,
    timeout: Duration,
    dispatch: Mutex<()>,
    applied: Mutex<HashMap<String, u64>>,
}

impl QuorumReplicator {
    pub fn new(policy: AckPolicy, timeout: Duration) -> Self {
        Self {
            tracker: Arc::new(AckTracker::new()),
            policy,
            timeout,
            dispatch: Mutex::new(()),
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Tracker that follower reader tasks report ACKs to.
    pub fn tracker(&self) -> Arc<AckTracker> {
        Arc::clone(&self.tracker)
    }

    /// Assigns `write` its sequence number, sends it to every follower
    /// registered right now and waits for the configured share of them to
    /// acknowledge it.
    ///
    /// # Ordering
    ///
    /// Sequence assignment, the membership snapshot and the enqueue onto each
    /// follower happen under one lock, so every follower receives strict
    /// writes in sequence order. Only the wait runs outside it; concurrent
    /// writes overlap their ACK round trips.
    ///
    /// # Outcome
    ///
    /// - No followers registered: `Ok(0)` immediately.
    /// - Threshold met before the deadline: `Ok(received)`, where `received`
    ///   may exceed the threshold when extra ACKs arrived in time.
    /// - Otherwise [`Error::ReplicationTimeout`] with the counts. Followers
    ///   that did acknowledge keep the write; there is no rollback.
    ///
    /// The caller applies a successful write with [`QuorumReplicator::apply`].
    pub async fn replicate(&self, sequencer: &Sequencer, registry: &FollowerRegistry, write: &mut Message) -> Result<usize> {
        let pending = {
            let _order = self.dispatch.lock();
            write.sequence = sequencer.next();
            let links = registry.snapshot();
            if links.is_empty() {
                debug!(sequence = write.sequence, "no followers registered, committing locally");
                return Ok(0);
            }

            let pending = self.tracker.register(write.sequence, links.len(), self.policy);
            debug!(
                sequence = write.sequence,
                followers = links.len(),
                required = pending.required(),
                "broadcasting write"
            );
            for link in &links {
                if let Err(err) = link.send(write) {
                    warn!(sequence = write.sequence, error = %err, "could not queue write");
                }
            }
            pending
        };
        let deadline = Instant::now() + self.timeout;

        match self.tracker.wait(pending, deadline).await {
            Ok(received) => {
                info!(sequence = write.sequence, received, "write replicated");
                Ok(received)
            }
            Err(err) => {
                warn!(error = %err, "write not replicated");
                Err(err)
            }
        }
    }

    /// Applies a replicated write to the leader's store unless a write with a
    /// higher sequence already reached the same key.
    ///
    /// Writes resume from [`QuorumReplicator::replicate`] in whatever order
    /// their tasks are scheduled. A superseded write reports `Ok(true)`.
    pub fn apply(&self, store: &KvStore, write: &Message) -> Result<bool> {
        let Some(op) = write.as_write() else {
            return Ok(false);
        };
        let mut applied = self.applied.lock();
        if let Some(&later) = applied.get(&write.key) {
            if later > write.sequence {
                debug!(sequence = write.sequence, later, key = %write.key, "write superseded before local apply");
                return Ok(true);
            }
        }
        let outcome = store.apply(op, write.timestamp);
        applied.insert(write.key.clone(), write.sequence);
        outcome
    }
}
