//! The follower agent: keeps a replica of the leader's store.
//!
//! A follower connects to the leader's follower endpoint and stays connected,
//! reconnecting with exponential backoff whenever the session ends. In strict
//! mode it applies each pushed write and acknowledges it. In eventual mode it
//! first asks for everything after its last applied sequence, then applies
//! live writes, persisting its position after every change.

pub mod backoff;
pub mod checkpoint;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::select;
use tracing::{debug, info, warn};

use crate::config::{ConsistencyMode, FollowerConfig};
use crate::error::{Error, Result};
use crate::message::{Kind, Message};
use crate::store::KvStore;
use crate::wire::{read_message, write_message};

pub use backoff::Backoff;
pub use checkpoint::Checkpoint;

#[derive(Debug, Default)]
struct Shared {
    store: KvStore,
    last_applied: AtomicU64,
    connected: AtomicBool,
}

/// Read access to a running follower.
#[derive(Debug, Clone)]
pub struct FollowerHandle {
    shared: Arc<Shared>,
}

impl FollowerHandle {
    pub fn store(&self) -> &KvStore {
        &self.shared.store
    }

    /// Highest sequence applied (eventual mode) or 0.
    pub fn last_applied(&self) -> u64 {
        self.shared.last_applied.load(Ordering::SeqCst)
    }

    /// Whether a session with the leader is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

pub struct Follower {
    config: FollowerConfig,
    checkpoint: Option<Checkpoint>,
    shared: Arc<Shared>,
}

impl Follower {
    pub fn new(config: FollowerConfig) -> Self {
        let checkpoint = match (config.mode, &config.state_dir) {
            (ConsistencyMode::Eventual, Some(dir)) => Some(Checkpoint::new(dir, config.id)),
            _ => None,
        };
        Self {
            config,
            checkpoint,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn handle(&self) -> FollowerHandle {
        FollowerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        select! {
            _ = &mut shutdown => {
                info!(follower = self.config.id, "follower shutting down");
                Ok(())
            }
            result = self.run() => result,
        }
    }

    pub async fn run_until_ctrl_c(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Connect, follow, reconnect. Only returns if the checkpoint is unreadable.
    async fn run(&self) -> anyhow::Result<()> {
        let id = self.config.id;
        if let Some(checkpoint) = &self.checkpoint {
            let last = checkpoint
                .load()
                .await
                .with_context(|| format!("failed to load checkpoint {}", checkpoint.path().display()))?;
            self.shared.last_applied.store(last, Ordering::SeqCst);
            info!(follower = id, last_applied = last, "loaded checkpoint");
        }

        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        loop {
            match TcpStream::connect(self.config.leader).await {
                Ok(stream) => {
                    backoff.reset();
                    info!(follower = id, leader = %self.config.leader, mode = ?self.config.mode, "connected to leader");
                    self.shared.connected.store(true, Ordering::SeqCst);
                    let result = self.session(stream).await;
                    self.shared.connected.store(false, Ordering::SeqCst);
                    match result {
                        Ok(()) => info!(follower = id, "leader closed the connection"),
                        Err(err) => warn!(follower = id, error = %err, "replication session failed"),
                    }
                }
                Err(err) => debug!(follower = id, error = %err, "could not reach leader"),
            }

            let delay = backoff.next_delay();
            info!(follower = id, retry_in = ?delay, "reconnecting to leader");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&self, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        match self.config.mode {
            ConsistencyMode::Strict => self.follow_strict(reader, writer).await,
            ConsistencyMode::Eventual => self.follow_eventual(reader, writer).await,
        }
    }

    async fn follow_strict(&self, mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) -> Result<()> {
        let wire = self.config.wire;
        while let Some(message) = read_message(&mut reader, wire).await? {
            match message.kind {
                Kind::Set | Kind::Delete => {
                    self.apply(&message);
                    let ack = Message::ack(message.sequence, Some(self.config.id));
                    write_message(&mut writer, wire, &ack).await?;
                    debug!(follower = self.config.id, sequence = message.sequence, "sent ACK");
                }
                Kind::List => self.log_contents(),
                other => debug!(follower = self.config.id, kind = %other, "ignoring frame from leader"),
            }
        }
        Ok(())
    }

    async fn follow_eventual(&self, mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) -> Result<()> {
        let wire = self.config.wire;
        let id = self.config.id;
        let from = self.last_applied();
        info!(follower = id, from, "requesting sync");
        write_message(&mut writer, wire, &Message::sync(from)).await?;

        let mut replayed = 0usize;
        loop {
            let Some(message) = read_message(&mut reader, wire).await? else {
                return Ok(());
            };
            match message.kind {
                Kind::Ack => {
                    self.shared.last_applied.store(message.sequence, Ordering::SeqCst);
                    self.persist().await;
                    info!(follower = id, replayed, last_applied = message.sequence, response = %message.response, "sync complete");
                    break;
                }
                Kind::Set | Kind::Delete => {
                    if self.apply(&message) {
                        self.advance(message.sequence);
                    }
                    replayed += 1;
                }
                other => debug!(follower = id, kind = %other, "ignoring frame during sync"),
            }
        }

        // `writer` stays open: dropping it would look like a disconnect to the leader.
        while let Some(message) = read_message(&mut reader, wire).await? {
            match message.kind {
                Kind::Set | Kind::Delete => {
                    if message.sequence <= self.last_applied() {
                        debug!(follower = id, sequence = message.sequence, "skipping already applied write");
                        continue;
                    }
                    if self.apply(&message) {
                        self.advance(message.sequence);
                        self.persist().await;
                    }
                }
                Kind::List => self.log_contents(),
                other => debug!(follower = id, kind = %other, "ignoring frame from leader"),
            }
        }
        Ok(())
    }

    /// Applies a pushed write. Returns false when LWW rejected it as stale.
    fn apply(&self, message: &Message) -> bool {
        let Some(write) = message.as_write() else {
            return false;
        };
        match self.shared.store.apply(write, message.timestamp) {
            Ok(changed) => {
                info!(
                    follower = self.config.id,
                    sequence = message.sequence,
                    kind = %message.kind,
                    key = %message.key,
                    changed,
                    "applied write"
                );
                true
            }
            Err(Error::StaleWrite { key, incoming, current }) => {
                info!(follower = self.config.id, sequence = message.sequence, key = %key, incoming, current, "rejected stale write");
                false
            }
            Err(err) => {
                warn!(follower = self.config.id, sequence = message.sequence, error = %err, "failed to apply write");
                false
            }
        }
    }

    fn last_applied(&self) -> u64 {
        self.shared.last_applied.load(Ordering::SeqCst)
    }

    fn advance(&self, sequence: u64) {
        self.shared.last_applied.fetch_max(sequence, Ordering::SeqCst);
    }

    async fn persist(&self) {
        let Some(checkpoint) = &self.checkpoint else {
            return;
        };
        if let Err(err) = checkpoint.save(self.last_applied()).await {
            warn!(follower = self.config.id, error = %err, "failed to persist checkpoint");
        }
    }

    fn log_contents(&self) {
        let snapshot = self.shared.store.snapshot();
        info!(follower = self.config.id, keys = snapshot.len(), "store contents");
        for (key, entry) in snapshot {
            info!(follower = self.config.id, key = %key, value = %entry.value, timestamp = entry.timestamp, "entry");
        }
    }
}
