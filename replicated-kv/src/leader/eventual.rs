//! Eventual replication: commit locally, log the write, fan it out without
//! waiting, and replay the log to followers that (re)connect.

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::leader::oplog::OperationLog;
use crate::leader::registry::{FollowerLink, FollowerRegistry, OnSendFailure};
use crate::message::{Message, Status};
use crate::sequencer::Sequencer;
use crate::store::KvStore;

/// Outcome of committing one write.
#[derive(Debug)]
pub struct Commit {
    pub sequence: u64,
    /// What the local store did with the write (see [`KvStore::apply`]).
    pub applied: Result<bool>,
    /// Followers the write was queued for.
    pub queued: usize,
}

/// Owns the operation log.
///
/// The log lock is held from sequence assignment through the fan-out. Log
/// order and per-follower delivery order are both sequence order, and a
/// follower registering concurrently sees each write in its replay or live.
#[derive(Debug, Default)]
pub struct LogReplicator {
    log: Mutex<OperationLog>,
}

impl LogReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence to `write`, applies it, logs it and queues it
    /// for every registered follower.
    ///
    /// Unreachable followers are pruned; they catch up when they reconnect.
    pub fn commit(&self, sequencer: &Sequencer, store: &KvStore, registry: &FollowerRegistry, write: &Message) -> Commit {
        let mut log = self.log.lock();
        let mut entry = write.clone();
        entry.sequence = sequencer.next();
        entry.response.clear();
        entry.status = Status::Ok;

        let applied = match entry.as_write() {
            Some(op) => store.apply(op, entry.timestamp),
            None => Ok(false),
        };
        let report = registry.broadcast(&entry, OnSendFailure::Prune);
        let sequence = entry.sequence;
        if let Err(rejected) = log.append(entry) {
            error!(sequence = rejected.sequence, last = log.last_sequence(), "write logged out of order");
        }
        debug!(sequence, queued = report.delivered, "write committed");

        Commit {
            sequence,
            applied,
            queued: report.delivered,
        }
    }

    /// Logged writes after `after`, plus the highest logged sequence.
    pub fn catch_up(&self, after: u64) -> (Vec<Message>, u64) {
        let log = self.log.lock();
        (log.since(after).to_vec(), log.last_sequence())
    }

    /// Replays everything after `after` to a new follower, then adds it to the
    /// registry so it receives live writes from there on.
    ///
    /// # Parameters
    ///
    /// - `link`: the follower's freshly spawned connection. Nothing has been
    ///   queued on it yet.
    /// - `after`: the last sequence the follower reports having applied, taken
    ///   from its SYNC frame. `0` replays the whole log.
    ///
    /// # Handshake
    ///
    /// The follower receives, in order:
    ///
    /// ```text
    /// entry(after+1) .. entry(last) | ACK(seq = last, "Synced N operations")
    /// ```
    ///
    /// followed by live writes with sequences above `last`. The log lock is
    /// held across the replay and the registry insert, so a write committed
    /// concurrently lands either in the replay or in the live stream, never in
    /// neither and never in both.
    ///
    /// Returns the number of operations replayed. If the link is already
    /// closed the follower is not registered and the error is returned; the
    /// follower will retry with its backoff.
    pub fn register(&self, registry: &FollowerRegistry, link: FollowerLink, after: u64) -> Result<usize> {
        let log = self.log.lock();
        let backlog = log.since(after);
        for entry in backlog {
            link.send(entry)?;
        }
        let done = Message::ack(log.last_sequence(), None).reply_ok(sync_summary(backlog.len()));
        link.send(&done)?;

        let id = link.id();
        let followers = registry.insert(link);
        info!(follower = id, after, replayed = backlog.len(), followers, "follower synced");
        Ok(backlog.len())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.log.lock().len()
    }
}

/// Response text of the ACK that ends a replay.
pub fn sync_summary(replayed: usize) -> String {
    format!("Synced {replayed} operations")
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::Error;
    use crate::message::Kind;

    fn follower(registry: &FollowerRegistry) -> (FollowerLink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FollowerLink::detached(registry.next_id(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn commit_applies_logs_and_fans_out() {
        let (sequencer, store, registry) = (Sequencer::new(), KvStore::new(), FollowerRegistry::new());
        let replicator = LogReplicator::new();
        let (link, mut rx) = follower(&registry);
        registry.insert(link);

        let first = replicator.commit(&sequencer, &store, &registry, &Message::set("a", "1"));
        let second = replicator.commit(&sequencer, &store, &registry, &Message::delete("missing"));

        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(first.applied.unwrap());
        assert!(!second.applied.unwrap());
        assert_eq!(first.queued, 1);
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert_eq!(replicator.len(), 2);

        let sent = drain(&mut rx);
        assert_eq!(sent.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(sent[1].kind, Kind::Delete);
    }

    #[test]
    fn registration_replays_backlog_then_marks_end() {
        let (sequencer, store, registry) = (Sequencer::new(), KvStore::new(), FollowerRegistry::new());
        let replicator = LogReplicator::new();
        for n in 1..=4 {
            replicator.commit(&sequencer, &store, &registry, &Message::set(format!("k{n}"), "v"));
        }

        let (link, mut rx) = follower(&registry);
        assert_eq!(replicator.register(&registry, link, 2).unwrap(), 2);
        assert_eq!(registry.len(), 1);

        replicator.commit(&sequencer, &store, &registry, &Message::set("k5", "v"));

        let sent = drain(&mut rx);
        let kinds: Vec<(Kind, u64)> = sent.iter().map(|m| (m.kind, m.sequence)).collect();
        assert_eq!(
            kinds,
            vec![(Kind::Set, 3), (Kind::Set, 4), (Kind::Ack, 4), (Kind::Set, 5)]
        );
        assert_eq!(sent[2].response, "Synced 2 operations");
    }

    #[test]
    fn stale_lww_write_is_still_logged() {
        let (sequencer, store, registry) = (Sequencer::new(), KvStore::new(), FollowerRegistry::new());
        let replicator = LogReplicator::new();
        replicator.commit(&sequencer, &store, &registry, &Message::set("k", "new").with_timestamp(20));
        let stale = replicator.commit(&sequencer, &store, &registry, &Message::set("k", "old").with_timestamp(10));

        assert!(matches!(stale.applied, Err(Error::StaleWrite { .. })));
        assert_eq!(store.get("k"), Some("new".to_string()));
        let (entries, last) = replicator.catch_up(0);
        assert_eq!(entries.len(), 2);
        assert_eq!(last, 2);
    }

    #[test]
    fn registering_a_dead_link_fails_without_joining() {
        let registry = FollowerRegistry::new();
        let replicator = LogReplicator::new();
        let (link, rx) = follower(&registry);
        drop(rx);
        assert!(matches!(
            replicator.register(&registry, link, 0),
            Err(Error::PeerUnreachable { .. })
        ));
        assert!(registry.is_empty());
    }
}
