//! The set of connected followers and the per-follower connection tasks.
//!
//! Each registered follower gets two detached tasks:
//!
//! - a **writer** that drains the follower's outbound queue onto its socket
//! - a **reader** that consumes frames the follower sends back (ACKs in the
//!   strict strategy) and notices when the connection closes
//!
//! Sending to a follower only enqueues, so it never blocks on the network.
//! Delivery is best-effort with no retry: once either task stops, the queue is
//! closed and every later send reports [`Error::PeerUnreachable`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::leader::quorum::AckTracker;
use crate::message::{Kind, Message};
use crate::wire::{WireFormat, read_message, write_message};

/// Leader-assigned identifier of a follower connection.
pub type FollowerId = u64;

/// What a broadcast does with followers it can no longer reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSendFailure {
    /// Keep the follower registered; its missing ACKs keep failing strict writes.
    Retain,
    /// Drop it; it rejoins by reconnecting and syncing (eventual strategy).
    Prune,
}

/// Handle to one registered follower.
#[derive(Debug, Clone)]
pub struct FollowerLink {
    id: FollowerId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl FollowerLink {
    /// Starts the reader and writer tasks for an accepted follower connection.
    ///
    /// With `acks` set, ACK frames read from the follower are credited to this
    /// link's id.
    pub fn spawn(
        id: FollowerId,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        wire: WireFormat,
        acks: Option<Arc<AckTracker>>,
    ) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(run_reader(id, reader, wire, acks));
        tokio::spawn(run_writer(id, writer, wire, queue, reader_task));
        Self { id, peer, outbound }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: FollowerId, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            peer: SocketAddr::from(([127, 0, 0, 1], 0)),
            outbound,
        }
    }

    pub fn id(&self) -> FollowerId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a message for delivery.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.outbound
            .send(message.clone())
            .map_err(|_| Error::PeerUnreachable { follower: self.id })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Result of fanning one message out to the registry.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<FollowerId>,
}

#[derive(Debug, Default)]
pub struct FollowerRegistry {
    links: Mutex<Vec<FollowerLink>>,
    next_id: AtomicU64,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the id for a newly accepted follower connection.
    pub fn next_id(&self) -> FollowerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, link: FollowerLink) -> usize {
        let mut links = self.links.lock();
        links.push(link);
        links.len()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Copies the current membership, e.g. to fix a write's expected ACK count.
    pub fn snapshot(&self) -> Vec<FollowerLink> {
        self.links.lock().clone()
    }

    /// Queues `message` for every registered follower.
    pub fn broadcast(&self, message: &Message, on_failure: OnSendFailure) -> BroadcastReport {
        let mut links = self.links.lock();
        let mut report = BroadcastReport::default();
        for link in links.iter() {
            match link.send(message) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(follower = link.id, error = %err, "broadcast send failed");
                    report.failed.push(link.id);
                }
            }
        }

        if on_failure == OnSendFailure::Prune && !report.failed.is_empty() {
            links.retain(|link| {
                let dead = report.failed.contains(&link.id);
                if dead {
                    warn!(follower = link.id, peer = %link.peer, "pruning unreachable follower");
                }
                !dead
            });
        }
        report
    }
}

async fn run_writer(
    id: FollowerId,
    mut writer: OwnedWriteHalf,
    wire: WireFormat,
    mut queue: mpsc::UnboundedReceiver<Message>,
    mut reader_task: JoinHandle<()>,
) {
    loop {
        select! {
            next = queue.recv() => {
                let Some(message) = next else {
                    break;
                };
                if let Err(err) = write_message(&mut writer, wire, &message).await {
                    warn!(follower = id, error = %err, "failed to send to follower");
                    break;
                }
            }
            _ = &mut reader_task => {
                debug!(follower = id, "follower connection closed, stopping writer");
                return;
            }
        }
    }
    reader_task.abort();
}

async fn run_reader(id: FollowerId, mut reader: OwnedReadHalf, wire: WireFormat, acks: Option<Arc<AckTracker>>) {
    loop {
        match read_message(&mut reader, wire).await {
            Ok(Some(message)) if message.kind == Kind::Ack => match &acks {
                Some(acks) => {
                    acks.record(message.sequence, id, message.follower_id);
                }
                None => debug!(follower = id, sequence = message.sequence, "ignoring ACK"),
            },
            Ok(Some(message)) => {
                debug!(follower = id, kind = %message.kind, "ignoring frame from follower");
            }
            Ok(None) => {
                info!(follower = id, "follower disconnected");
                break;
            }
            Err(err) => {
                warn!(follower = id, error = %err, "follower connection failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(registry: &FollowerRegistry) -> (FollowerLink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FollowerLink::detached(registry.next_id(), tx), rx)
    }

    #[test]
    fn ids_are_unique_and_start_at_one() {
        let registry = FollowerRegistry::new();
        assert_eq!(registry.next_id(), 1);
        assert_eq!(registry.next_id(), 2);
    }

    #[test]
    fn broadcast_reaches_every_follower_in_order() {
        let registry = FollowerRegistry::new();
        let (a, mut rx_a) = link(&registry);
        let (b, mut rx_b) = link(&registry);
        registry.insert(a);
        registry.insert(b);

        for n in 1..=3 {
            let mut message = Message::set("k", format!("v{n}"));
            message.sequence = n;
            let report = registry.broadcast(&message, OnSendFailure::Prune);
            assert_eq!(report.delivered, 2);
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let sequences: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().sequence).collect();
            assert_eq!(sequences, vec![1, 2, 3]);
        }
    }

    #[test]
    fn pruning_drops_unreachable_followers() {
        let registry = FollowerRegistry::new();
        let (alive, _rx_alive) = link(&registry);
        let (dead, rx_dead) = link(&registry);
        let dead_id = dead.id();
        registry.insert(alive);
        registry.insert(dead);
        drop(rx_dead);

        let report = registry.broadcast(&Message::set("k", "v"), OnSendFailure::Prune);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![dead_id]);
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot().iter().all(|link| link.id() != dead_id));
    }

    #[test]
    fn retaining_keeps_unreachable_followers() {
        let registry = FollowerRegistry::new();
        let (dead, rx_dead) = link(&registry);
        registry.insert(dead);
        drop(rx_dead);

        let report = registry.broadcast(&Message::delete("k"), OnSendFailure::Retain);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot()[0].is_closed());
    }
}
