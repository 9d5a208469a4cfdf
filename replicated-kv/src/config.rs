//! Leader and follower configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::WireFormat;

pub const DEFAULT_CLIENT_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_FOLLOWER_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Which consistency contract the leader enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConsistencyMode {
    /// Acknowledge a write only after the required followers applied it.
    #[default]
    Strict,
    /// Commit locally, replicate in the background, catch up via SYNC.
    Eventual,
}

/// How many acknowledgements the strict strategy requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AckPolicy {
    /// Every follower registered when the write was broadcast.
    #[default]
    All,
    /// `followers / 2 + 1` of them.
    Majority,
}

impl AckPolicy {
    /// Acks needed when `followers` were registered at broadcast time.
    pub fn required(self, followers: usize) -> usize {
        match self {
            AckPolicy::All => followers,
            AckPolicy::Majority => followers / 2 + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConflictPolicy {
    /// Writes apply in arrival order.
    #[default]
    None,
    /// Writes carry timestamps; older ones are discarded.
    Lww,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub mode: ConsistencyMode,
    pub acks: AckPolicy,
    /// Bound on the strict strategy's wait for acknowledgements.
    pub ack_timeout: Duration,
    pub conflict: ConflictPolicy,
    pub wire: WireFormat,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            mode: ConsistencyMode::Strict,
            acks: AckPolicy::All,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            conflict: ConflictPolicy::None,
            wire: WireFormat::Fixed,
        }
    }
}

impl LeaderConfig {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn eventual() -> Self {
        Self {
            mode: ConsistencyMode::Eventual,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub id: u32,
    /// The leader's follower-registration endpoint.
    pub leader: SocketAddr,
    pub mode: ConsistencyMode,
    /// Where the last applied sequence is persisted (eventual mode only).
    pub state_dir: Option<PathBuf>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub wire: WireFormat,
}

impl FollowerConfig {
    pub fn new(id: u32, leader: SocketAddr, mode: ConsistencyMode) -> Self {
        Self {
            id,
            leader,
            mode,
            state_dir: None,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            wire: WireFormat::Fixed,
        }
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}
