//! A replicated key-value store: one leader, any number of followers.
//!
//! The leader serves client requests and replicates every write with one of
//! two strategies:
//!
//! - **strict**: a write is broadcast and applied only after enough followers
//!   acknowledged it within a deadline (see [`leader::quorum`]),
//! - **eventual**: a write is applied and logged at once, fanned out in the
//!   background, and replayed to followers that reconnect
//!   (see [`leader::eventual`]).
//!
//! Modules:
//!
//! - [`store`] the in-memory map every node owns, with last-writer-wins.
//! - [`message`] and [`wire`] the request envelope and its two binary layouts.
//! - [`sequencer`] leader-side sequence numbers.
//! - [`leader`] and [`follower`] the two node roles.
//! - [`client`] and [`console`] the client API and its interactive shell.
//! - [`config`] and [`cli`] configuration structs and their command line.

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod follower;
pub mod leader;
pub mod message;
pub mod sequencer;
pub mod store;
pub mod wire;

pub use error::{Error, ProtocolError, Result};
