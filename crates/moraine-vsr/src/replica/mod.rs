//! The replica state machine.
//!
//! The replica is a pure, deterministic state machine: it consumes
//! [`ReplicaEvent`]s and produces an [`Output`] of messages to send. It
//! performs no I/O, reads no clocks, and draws no randomness. Timers and
//! jitter live in the driver (`event_loop` in production, the simulation
//! harness in tests), which feeds expirations back in as
//! [`ReplicaEvent::Timeout`].
//!
//! # Protocol roles
//!
//! For a view `v`, a replica is `Primary(v)` when its current view is `v` and
//! its own index equals the primary index, `Backup(v)` when it is any other
//! member, and `Changing(v → v')` while its next view runs ahead of its
//! current one. Higher-numbered views are absorbed at any time.
//!
//! # Handlers
//!
//! - `Request`: append and replicate client payloads (primary)
//! - `Commit`: merge log extensions, advance commit/decide, ack (backup)
//! - `Ack`: account stored prefixes, advance commit/decide (primary)
//! - `View`: the ack, confirm, adopt view change protocol
//! - `Join`: admit a new member and start a view change

mod normal;
mod state;
mod view_change;

pub use state::Replica;

use moraine_types::{NodeUid, ViewNumber};
use moraine_wire::Message;

// ============================================================================
// Events
// ============================================================================

/// Events that drive the replica state machine.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A message arrived from a peer or client.
    Inbound {
        /// Remote uid of the channel the message arrived on.
        from: NodeUid,
        /// The message.
        message: Message,
    },

    /// A timer expired.
    Timeout(TimeoutKind),

    /// Ask a known peer to admit us into its group.
    StartJoin {
        /// The peer to send `join` to.
        peer: NodeUid,
    },
}

/// Timer expirations the driver can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Primary-side: no commit was broadcast recently; refresh the backups.
    PrimaryKeepalive,

    /// Backup-side: no commit was received within the keepalive window;
    /// the primary is suspect.
    BackupWatchdog,

    /// A view change to the given view number has been running too long.
    ///
    /// Anchored to the pending view number so that a stale timer from an
    /// already-completed change cancels itself.
    ViewChange(ViewNumber),
}

// ============================================================================
// Output
// ============================================================================

/// A message addressed to a remote uid.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Channel to send on, by remote uid.
    pub to: NodeUid,
    /// The message.
    pub message: Message,
}

/// Everything a processed event asks the driver to do.
#[derive(Debug, Default)]
pub struct Output {
    /// Messages to send, in order.
    pub sends: Vec<Envelope>,
}

impl Output {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Queues a message.
    pub fn send(&mut self, to: NodeUid, message: Message) {
        self.sends.push(Envelope { to, message });
    }

    /// Appends another output's sends after this one's.
    pub fn merge(&mut self, other: Output) {
        self.sends.extend(other.sends);
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }
}
