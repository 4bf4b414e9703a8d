//! Core types for the Moraine replication protocol.
//!
//! This crate defines the identifier and numbering types shared by the wire
//! protocol and the replica core:
//! - [`NodeUid`] - Opaque printable identity of a replica or client
//! - [`ConnectionUid`] - Random nonce minted at channel handshake
//! - [`ViewNumber`] - Circular view counter
//! - [`LogNumber`] - Circular absolute log position
//!
//! View and log numbers are *circular*: equality compares values, ordering
//! compares the wrapping difference reinterpreted as signed. The protocol
//! never compares two numbers more than half the ring apart, which keeps the
//! ordering consistent across wrap-around.

use std::fmt::{Debug, Display};
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identity
// ============================================================================

/// Opaque printable identity of a protocol participant.
///
/// Replicas and clients share one identifier space; a uid must be globally
/// unique within a deployment. The empty uid is reserved: a log item whose
/// client uid is empty is a placeholder, not a real request.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeUid(String);

impl NodeUid {
    /// Creates a uid from a printable string.
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// The reserved empty uid, used to mark placeholder log items.
    pub fn placeholder() -> Self {
        Self(String::new())
    }

    /// Returns the uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the reserved empty uid.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for NodeUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "~anon~")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for NodeUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<String> for NodeUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

// ============================================================================
// Connection Identity
// ============================================================================

/// Length of a generated connection uid in raw bytes (hex-encoded on the wire).
pub const CONNECTION_UID_LENGTH: usize = 16;

/// Random nonce exchanged at channel handshake.
///
/// When two endpoints connect to each other simultaneously, both compare the
/// two handshake uids lexicographically and keep the channel with the larger
/// one, so the race resolves the same way on both sides.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ConnectionUid(String);

impl ConnectionUid {
    /// Creates a connection uid from an existing string.
    pub fn from_string(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Mints a fresh random connection uid.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        let mut raw = [0u8; CONNECTION_UID_LENGTH];
        getrandom::fill(&mut raw).expect("CSPRNG failure is catastrophic");
        let mut hex = String::with_capacity(CONNECTION_UID_LENGTH * 2);
        for byte in raw {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Returns the uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for ConnectionUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = &self.0[..self.0.len().min(8)];
        write!(f, "ConnectionUid({head}...)")
    }
}

impl Display for ConnectionUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// View Number - Copy (circular 8-byte counter)
// ============================================================================

/// Circular view counter.
///
/// A view identifies a period during which one member is the primary. The
/// counter wraps; view zero is special (the singular bootstrap view) and is
/// skipped when advancing wraps around.
///
/// # Invariants
///
/// - A replica's view only moves forward (in circular order) over time
/// - Two views are only compared when less than half the ring apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// The bootstrap view number.
    pub const ZERO: ViewNumber = ViewNumber(0);

    /// Creates a view number.
    pub fn new(view: u64) -> Self {
        Self(view)
    }

    /// Returns the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true for the bootstrap view.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Signed circular distance from `other` to `self`.
    pub fn delta(&self, other: ViewNumber) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    /// The next view number, skipping zero on wrap.
    pub fn advanced(&self) -> Self {
        let next = self.0.wrapping_add(1);
        ViewNumber(if next == 0 { 1 } else { next })
    }
}

impl PartialOrd for ViewNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ViewNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.delta(*other).cmp(&0)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(view: u64) -> Self {
        Self(view)
    }
}

// ============================================================================
// Log Number - Copy (circular 8-byte position)
// ============================================================================

/// Circular absolute log position.
///
/// A log number names a position in the replicated log, not an offset into
/// any particular replica's storage. Like [`ViewNumber`] it is circular:
/// ordering is by signed wrapping difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LogNumber(u64);

impl LogNumber {
    /// The first log position.
    pub const ZERO: LogNumber = LogNumber(0);

    /// Creates a log number.
    pub fn new(logno: u64) -> Self {
        Self(logno)
    }

    /// Returns the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Signed circular distance from `other` to `self`.
    ///
    /// `a.delta(b) > 0` means `a` is ahead of `b`.
    pub fn delta(&self, other: LogNumber) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

impl PartialOrd for LogNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.delta(*other).cmp(&0)
    }
}

impl Add<u64> for LogNumber {
    type Output = LogNumber;

    fn add(self, rhs: u64) -> LogNumber {
        LogNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u64> for LogNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Display for LogNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log#{}", self.0)
    }
}

impl From<u64> for LogNumber {
    fn from(logno: u64) -> Self {
        Self(logno)
    }
}

// ============================================================================
// Quorum helpers
// ============================================================================

/// Minimum number of members that form a quorum.
///
/// A group of `2f+1` members needs `f+1` for any quorum, so any two quorums
/// intersect.
///
/// # Panics
///
/// Panics in debug builds if `group_size` is 0.
pub fn quorum_size(group_size: usize) -> usize {
    debug_assert!(group_size > 0, "group size must be positive");
    (group_size / 2) + 1
}

/// Maximum number of crash failures a group of this size tolerates.
pub fn max_failures(group_size: usize) -> usize {
    group_size / 2
}
