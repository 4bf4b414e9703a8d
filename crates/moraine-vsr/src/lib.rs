//! # moraine-vsr: Viewstamped Replication core
//!
//! A group of replicas agrees on a totally ordered sequence of opaque client
//! requests, surviving up to `f` crash failures among `2f+1` members. Each
//! committed request gets a unique, monotone log position that every
//! non-failing replica eventually agrees on.
//!
//! ## Architecture
//!
//! ```text
//! Client ──request──► Primary
//!                       │ append, self-ack
//!                       ├──commit──► Backup₁
//!                       ├──commit──► Backup₂
//!                       │              │ store, track ack/sack
//!                       │◄────ack──────┤
//!                       │◄────ack──────┘
//!                       │ quorum: advance commit
//! Client ◄─response───┘
//! ```
//!
//! Views change cooperatively (ack → confirm → adopt) driven by `view`
//! messages; membership grows one node at a time via `join`.
//!
//! ## Layout
//!
//! - [`config`]: per-instance timing configuration
//! - [`log`]: the absolute-indexed replicated log
//! - [`view`]: view snapshots, ack bookkeeping, quorum predicates
//! - [`replica`]: the pure replica state machine
//! - [`client`]: the pure client state machine
//! - [`channel`] / [`tcp`]: transport abstraction, in-memory network, TCP
//! - [`conn`]: the connection manager (handshake, duplicate resolution)
//! - [`event_loop`]: threaded drivers and handles
//!
//! ## Design
//!
//! The replica and client are pure, deterministic state machines: no I/O, no
//! clocks, no randomness. Drivers feed them messages and timer expirations
//! and carry out the outputs, which keeps every protocol path exercisable
//! under a deterministic simulation (see the test-only `simulation` module).

pub mod channel;
pub mod client;
pub mod config;
pub mod conn;
pub mod event_loop;
pub mod log;
pub mod replica;
pub mod tcp;
pub mod view;

#[cfg(test)]
mod simulation;

pub use channel::{Channel, ChannelPoll, MemoryEndpoint, MemoryNetwork, Transport};
pub use client::{Client, ClientOutput};
pub use config::ProtocolConfig;
pub use conn::{ConnectionManager, ManagerEvent};
pub use event_loop::{ClientHandle, ClientNode, ReplicaHandle, ReplicaNode, ReplicaStatus};
pub use log::{Log, LogItem, Overwrite};
pub use replica::{Envelope, Output, Replica, ReplicaEvent, TimeoutKind};
pub use tcp::{AddressBook, TcpChannel, TcpTransport};
pub use view::{Member, View};

use moraine_types::NodeUid;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the replication core.
///
/// Protocol-level disagreements (stale views, unusable acks) are not errors:
/// they are answered on the wire with `view` messages or dropped. This enum
/// covers what callers and drivers can actually observe.
#[derive(Debug, thiserror::Error)]
pub enum VsrError {
    /// A view description failed validation.
    #[error("malformed view: {0}")]
    MalformedView(String),

    /// No established channel to this peer.
    #[error("not connected to {0}")]
    NotConnected(NodeUid),

    /// A dial gave up before a channel was established.
    #[error("connect to {0} failed")]
    ConnectFailed(NodeUid),

    /// No address is known for this peer.
    #[error("no address for {0}")]
    UnknownAddress(NodeUid),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The node is shutting down; pending completions fail with this.
    #[error("shutting down")]
    ShuttingDown,
}

/// Result alias for core operations.
pub type VsrResult<T> = Result<T, VsrError>;
