//! The leader node: accepts client requests and follower registrations and
//! replicates every write with the configured strategy.
//!
//! Two listeners are served from one accept loop: the client endpoint
//! answers SET/GET/DELETE/LIST (and SYNC under the eventual strategy), the
//! follower endpoint registers followers. Each connection runs on its own
//! task; all of them share one [`LeaderState`].

pub mod eventual;
pub mod oplog;
pub mod quorum;
pub mod registry;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::config::{ConflictPolicy, ConsistencyMode, LeaderConfig};
use crate::error::Error;
use crate::message::{Kind, MAX_RESPONSE_LEN, Message, truncate_to};
use crate::sequencer::Sequencer;
use crate::store::{KvStore, now_millis};
use crate::wire::{read_message, write_message};

pub use eventual::{Commit, LogReplicator, sync_summary};
pub use oplog::OperationLog;
pub use quorum::{AckOutcome, AckTracker, QuorumReplicator};
pub use registry::{FollowerId, FollowerLink, FollowerRegistry, OnSendFailure};

pub struct Leader {
    client_listener: TcpListener,
    follower_listener: TcpListener,
    state: Arc<LeaderState>,
}

impl Leader {
    pub fn new(client_listener: TcpListener, follower_listener: TcpListener, config: LeaderConfig) -> Self {
        Self {
            client_listener,
            follower_listener,
            state: Arc::new(LeaderState::new(config)),
        }
    }

    pub fn client_addr(&self) -> std::io::Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    pub fn follower_addr(&self) -> std::io::Result<SocketAddr> {
        self.follower_listener.local_addr()
    }

    /// Shared state, for inspecting the leader while it runs.
    pub fn state(&self) -> Arc<LeaderState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Leader {
            client_listener,
            follower_listener,
            state,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(followers = state.registry.len(), "leader shutting down");
                    break;
                }
                accepted = client_listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_client_handler(stream, peer, &state),
                    Err(err) => warn!(error = ?err, "failed to accept client connection"),
                },
                accepted = follower_listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_follower_handler(stream, peer, &state),
                    Err(err) => warn!(error = ?err, "failed to accept follower connection"),
                },
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<LeaderState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        debug!(peer = %peer, "client connected");
        if let Err(err) = handle_client(stream, &state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

fn spawn_follower_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<LeaderState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = register_follower(stream, peer, &state).await {
            warn!(peer = %peer, error = ?err, "follower registration failed");
        }
    });
}

async fn handle_client(stream: TcpStream, state: &LeaderState) -> Result<()> {
    let wire = state.config.wire;
    let (mut reader, mut writer) = stream.into_split();
    while let Some(request) = read_message(&mut reader, wire).await? {
        for reply in state.handle_request(request).await {
            write_message(&mut writer, wire, &reply).await?;
        }
    }
    Ok(())
}

async fn register_follower(stream: TcpStream, peer: SocketAddr, state: &LeaderState) -> Result<()> {
    let wire = state.config.wire;
    let id = state.registry.next_id();
    let (mut reader, writer) = stream.into_split();

    match &state.replication {
        Replication::Quorum(quorum) => {
            let link = FollowerLink::spawn(id, peer, reader, writer, wire, Some(quorum.tracker()));
            let followers = state.registry.insert(link);
            info!(follower = id, peer = %peer, followers, "follower registered");
        }
        Replication::Log(log) => {
            let after = match read_message(&mut reader, wire).await? {
                Some(first) if first.kind == Kind::Sync => first.sequence,
                Some(first) => {
                    warn!(follower = id, kind = %first.kind, "expected SYNC, replaying from the start");
                    0
                }
                None => bail!("follower disconnected before SYNC"),
            };
            let link = FollowerLink::spawn(id, peer, reader, writer, wire, None);
            log.register(&state.registry, link, after)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
enum Replication {
    Quorum(QuorumReplicator),
    Log(LogReplicator),
}

/// Everything the leader's connection tasks share.
#[derive(Debug)]
pub struct LeaderState {
    config: LeaderConfig,
    store: KvStore,
    sequencer: Sequencer,
    registry: FollowerRegistry,
    replication: Replication,
}

impl LeaderState {
    pub fn new(config: LeaderConfig) -> Self {
        let replication = match config.mode {
            ConsistencyMode::Strict => Replication::Quorum(QuorumReplicator::new(config.acks, config.ack_timeout)),
            ConsistencyMode::Eventual => Replication::Log(LogReplicator::new()),
        };
        Self {
            config,
            store: KvStore::new(),
            sequencer: Sequencer::new(),
            registry: FollowerRegistry::new(),
            replication,
        }
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn follower_count(&self) -> usize {
        self.registry.len()
    }

    /// Highest sequence number assigned so far.
    pub fn last_sequence(&self) -> u64 {
        self.sequencer.current()
    }

    /// Answers one client request.
    ///
    /// SYNC answers with the replayed writes followed by the terminating ACK;
    /// every other request gets exactly one reply.
    pub async fn handle_request(&self, request: Message) -> Vec<Message> {
        match request.kind {
            Kind::Set | Kind::Delete => vec![self.write(request).await],
            Kind::Get => vec![self.read(request)],
            Kind::List => vec![self.list(request)],
            Kind::Sync => self.sync(request),
            Kind::Ack => vec![request.reply_err("ACK is only accepted on the follower endpoint")],
        }
    }

    async fn write(&self, mut request: Message) -> Message {
        if self.config.conflict == ConflictPolicy::Lww && request.timestamp.is_none() {
            request.timestamp = Some(now_millis());
        }

        match &self.replication {
            Replication::Quorum(quorum) => {
                let outcome = quorum.replicate(&self.sequencer, &self.registry, &mut request).await;
                info!(sequence = request.sequence, kind = %request.kind, key = %request.key, "replicated write");
                match outcome {
                    Ok(replicated) => {
                        let applied = quorum.apply(&self.store, &request);
                        if let Err(err) = &applied {
                            debug!(error = %err, "leader store kept newer value");
                        }
                        describe_write(request, applied, &format!("(replicated to {replicated} followers)"), false)
                    }
                    Err(Error::ReplicationTimeout { received, required, .. }) => request.reply_err(format!(
                        "FAILED: replication timed out ({received}/{required} acks), write not applied"
                    )),
                    Err(err) => request.reply_err(format!("FAILED: {err}")),
                }
            }
            Replication::Log(log) => {
                let commit = log.commit(&self.sequencer, &self.store, &self.registry, &request);
                info!(sequence = commit.sequence, kind = %request.kind, key = %request.key, queued = commit.queued, "write committed");
                request.sequence = commit.sequence;
                if let Err(err) = &commit.applied {
                    debug!(error = %err, "leader store kept newer value");
                }
                describe_write(request, commit.applied, &format!("(seq: {})", commit.sequence), true)
            }
        }
    }

    fn read(&self, request: Message) -> Message {
        match self.lookup(&request.key) {
            Ok(value) => {
                let mut reply = request.reply_ok(value.clone());
                reply.value = value;
                reply
            }
            Err(Error::KeyNotFound(_)) => request.reply_err("Key not found"),
            Err(err) => request.reply_err(err.to_string()),
        }
    }

    fn lookup(&self, key: &str) -> crate::error::Result<String> {
        self.store.get(key).ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    fn list(&self, request: Message) -> Message {
        let mut listing = String::from("Keys: ");
        for (key, entry) in self.store.snapshot() {
            listing.push_str(&format!("{key}={}; ", entry.value));
        }
        truncate_to(&mut listing, MAX_RESPONSE_LEN);

        let on_failure = match self.replication {
            Replication::Quorum(_) => OnSendFailure::Retain,
            Replication::Log(_) => OnSendFailure::Prune,
        };
        let report = self.registry.broadcast(&Message::list(), on_failure);
        debug!(followers = report.delivered, "asked followers to log their contents");

        request.reply_ok(listing)
    }

    fn sync(&self, request: Message) -> Vec<Message> {
        let Replication::Log(log) = &self.replication else {
            return vec![request.reply_err("SYNC is only available in eventual mode")];
        };
        let (entries, last) = log.catch_up(request.sequence);
        info!(after = request.sequence, replayed = entries.len(), "serving SYNC");
        let done = Message::ack(last, None).reply_ok(sync_summary(entries.len()));
        entries.into_iter().chain(std::iter::once(done)).collect()
    }
}

/// Builds the client reply for a committed write.
///
/// A write the leader's store rejected as stale is still committed and
/// replicated, so it is reported like a successful one. `logged` marks writes
/// that took a log position even when they changed nothing.
///
/// A SET echoes its key and value, so the text is cut to the response limit.
fn describe_write(request: Message, applied: crate::error::Result<bool>, suffix: &str, logged: bool) -> Message {
    match (request.kind, applied) {
        (Kind::Delete, Ok(false)) if logged => request.reply_err(format!("Key not found {suffix}")),
        (Kind::Delete, Ok(false)) => request.reply_err("Key not found"),
        (Kind::Delete, _) => request.reply_ok(format!("Key deleted {suffix}")),
        _ => {
            let mut text = format!("SET {} = {} {suffix}", request.key, request.value);
            truncate_to(&mut text, MAX_RESPONSE_LEN);
            request.reply_ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::AckPolicy;
    use crate::message::{MAX_KEY_LEN, MAX_VALUE_LEN, Status};

    #[tokio::test]
    async fn strict_without_followers_applies_immediately() {
        let state = LeaderState::new(LeaderConfig::strict());
        let reply = state.handle_request(Message::set("k", "v")).await.remove(0);
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.response, "SET k = v (replicated to 0 followers)");
        assert_eq!(reply.sequence, 1);

        let reply = state.handle_request(Message::get("k")).await.remove(0);
        assert_eq!(reply.response, "v");
        assert_eq!(reply.value, "v");
    }

    #[tokio::test]
    async fn missing_keys_report_errors() {
        let state = LeaderState::new(LeaderConfig::strict());
        let get = state.handle_request(Message::get("nope")).await.remove(0);
        assert_eq!((get.status, get.response.as_str()), (Status::Error, "Key not found"));

        let delete = state.handle_request(Message::delete("nope")).await.remove(0);
        assert_eq!((delete.status, delete.response.as_str()), (Status::Error, "Key not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_timeout_leaves_store_untouched() {
        let config = LeaderConfig {
            acks: AckPolicy::Majority,
            ack_timeout: Duration::from_millis(200),
            ..LeaderConfig::strict()
        };
        let state = LeaderState::new(config);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.registry.insert(FollowerLink::detached(state.registry.next_id(), tx));

        let reply = state.handle_request(Message::set("k", "v")).await.remove(0);
        assert_eq!(reply.status, Status::Error);
        assert_eq!(reply.response, "FAILED: replication timed out (0/1 acks), write not applied");
        assert!(state.store().get("k").is_none());
    }

    #[tokio::test]
    async fn eventual_reports_sequence_and_serves_sync() {
        let state = LeaderState::new(LeaderConfig::eventual());
        let first = state.handle_request(Message::set("a", "1")).await.remove(0);
        assert_eq!(first.response, "SET a = 1 (seq: 1)");
        let second = state.handle_request(Message::delete("a")).await.remove(0);
        assert_eq!((second.status, second.response.as_str()), (Status::Ok, "Key deleted (seq: 2)"));
        let third = state.handle_request(Message::delete("a")).await.remove(0);
        assert_eq!((third.status, third.response.as_str()), (Status::Error, "Key not found (seq: 3)"));

        let replies = state.handle_request(Message::sync(1)).await;
        let sequences: Vec<(Kind, u64)> = replies.iter().map(|m| (m.kind, m.sequence)).collect();
        assert_eq!(sequences, vec![(Kind::Delete, 2), (Kind::Delete, 3), (Kind::Ack, 3)]);
        assert_eq!(replies[2].response, "Synced 2 operations");
    }

    #[tokio::test]
    async fn strict_rejects_sync_and_ack_from_clients() {
        let state = LeaderState::new(LeaderConfig::strict());
        let sync = state.handle_request(Message::sync(0)).await;
        assert_eq!(sync.len(), 1);
        assert_eq!(sync[0].status, Status::Error);
        let ack = state.handle_request(Message::ack(1, Some(1))).await.remove(0);
        assert_eq!(ack.status, Status::Error);
    }

    #[tokio::test]
    async fn full_size_set_reply_fits_the_response_limit() {
        let (key, value) = ("k".repeat(MAX_KEY_LEN), "v".repeat(MAX_VALUE_LEN));
        for config in [LeaderConfig::strict(), LeaderConfig::eventual()] {
            let state = LeaderState::new(config);
            let reply = state.handle_request(Message::set(key.clone(), value.clone())).await.remove(0);
            assert_eq!(reply.status, Status::Ok);
            assert_eq!(reply.response.len(), MAX_RESPONSE_LEN);
            assert!(reply.response.starts_with(&format!("SET {key} = v")));
            assert!(crate::wire::WireFormat::Fixed.encode(&reply).is_ok());
            assert_eq!(state.store().get(&key), Some(value.clone()));
        }
    }

    #[tokio::test]
    async fn list_is_ordered_and_stamps_lww_writes() {
        let config = LeaderConfig {
            conflict: ConflictPolicy::Lww,
            ..LeaderConfig::eventual()
        };
        let state = LeaderState::new(config);
        state.handle_request(Message::set("b", "2")).await;
        state.handle_request(Message::set("a", "1")).await;
        assert!(state.store().entry("a").unwrap().timestamp > 0);

        let reply = state.handle_request(Message::list()).await.remove(0);
        assert_eq!(reply.response, "Keys: a=1; b=2; ");
    }
}
