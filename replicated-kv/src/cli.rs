use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{AckPolicy, ConflictPolicy, ConsistencyMode, FollowerConfig, LeaderConfig};
use crate::wire::WireFormat;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the leader, serving clients and replicating to followers.
    Leader(LeaderArgs),
    /// Run a follower that replicates from a leader.
    Follower(FollowerArgs),
    /// Open an interactive session against a leader.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LeaderArgs {
    /// Address clients connect to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub client_listen: SocketAddr,

    /// Address followers register on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub follower_listen: SocketAddr,

    #[arg(long, value_enum, default_value_t = ConsistencyMode::Strict)]
    pub mode: ConsistencyMode,

    /// Acknowledgements a strict write needs.
    #[arg(long, value_enum, default_value_t = AckPolicy::All)]
    pub acks: AckPolicy,

    #[arg(long, default_value_t = 5000)]
    pub ack_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = ConflictPolicy::None)]
    pub conflict: ConflictPolicy,

    #[arg(long, value_enum, default_value_t = WireFormat::Fixed)]
    pub wire: WireFormat,
}

impl LeaderArgs {
    pub fn config(&self) -> LeaderConfig {
        LeaderConfig {
            mode: self.mode,
            acks: self.acks,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            conflict: self.conflict,
            wire: self.wire,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FollowerArgs {
    /// Identifier reported to the leader and used in the checkpoint name.
    #[arg(long)]
    pub id: u32,

    /// The leader's follower endpoint.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub leader: SocketAddr,

    /// Must match the leader's mode.
    #[arg(long, value_enum, default_value_t = ConsistencyMode::Strict)]
    pub mode: ConsistencyMode,

    /// Directory for the sequence checkpoint (eventual mode).
    #[arg(long, default_value = ".")]
    pub state_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = WireFormat::Fixed)]
    pub wire: WireFormat,
}

impl FollowerArgs {
    pub fn config(&self) -> FollowerConfig {
        let mut config = FollowerConfig::new(self.id, self.leader, self.mode);
        config.wire = self.wire;
        if self.mode == ConsistencyMode::Eventual {
            config = config.with_state_dir(&self.state_dir);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// The leader's client endpoint.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,

    #[arg(long, value_enum, default_value_t = WireFormat::Fixed)]
    pub wire: WireFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_defaults() {
        let cli = Cli::try_parse_from(["replicated-kv", "leader"]).unwrap();
        let Command::Leader(args) = cli.command else {
            panic!("expected leader subcommand");
        };
        assert_eq!(args.client_listen, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(args.follower_listen, "127.0.0.1:8080".parse().unwrap());
        let config = args.config();
        assert_eq!(config.mode, ConsistencyMode::Strict);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn leader_flags() {
        let cli = Cli::try_parse_from([
            "replicated-kv",
            "leader",
            "--mode",
            "eventual",
            "--acks",
            "majority",
            "--conflict",
            "lww",
            "--wire",
            "length-prefixed",
            "--ack-timeout-ms",
            "250",
        ])
        .unwrap();
        let Command::Leader(args) = cli.command else {
            panic!("expected leader subcommand");
        };
        let config = args.config();
        assert_eq!(config.mode, ConsistencyMode::Eventual);
        assert_eq!(config.acks, AckPolicy::Majority);
        assert_eq!(config.conflict, ConflictPolicy::Lww);
        assert_eq!(config.wire, WireFormat::LengthPrefixed);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
    }

    #[test]
    fn follower_requires_id_and_persists_only_when_eventual() {
        assert!(Cli::try_parse_from(["replicated-kv", "follower"]).is_err());

        let cli = Cli::try_parse_from(["replicated-kv", "follower", "--id", "2"]).unwrap();
        let Command::Follower(args) = cli.command else {
            panic!("expected follower subcommand");
        };
        assert!(args.config().state_dir.is_none());

        let cli = Cli::try_parse_from([
            "replicated-kv",
            "follower",
            "--id",
            "2",
            "--mode",
            "eventual",
            "--state-dir",
            "/tmp/kv",
        ])
        .unwrap();
        let Command::Follower(args) = cli.command else {
            panic!("expected follower subcommand");
        };
        let config = args.config();
        assert_eq!(config.id, 2);
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/kv")));
    }
}
