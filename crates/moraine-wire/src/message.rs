//! Protocol messages.
//!
//! ## Tag mapping
//!
//! Each message carries a small numeric tag on the wire. A positive tag is a
//! request; its reply uses the negated tag and echoes the request's `seq`:
//!
//! | Message | Tag |
//! |---|---|
//! | [`Request`] | 1 |
//! | [`Response`] | −1 |
//! | [`Commit`] | 3 |
//! | [`Ack`] | −3 |
//! | [`Handshake`] | 4 |
//! | [`HandshakeAck`] | −4 |
//! | [`Join`] | 5 |
//! | [`ViewMessage`] | 6 |
//! | [`ProtocolError`] | 100 |
//!
//! `Ack` is the reply to `Commit` (hence tag −3). `Join` has no direct reply;
//! it is answered with a [`ViewMessage`], which is a symmetric announcement
//! rather than a request/reply pair. Tag 0 is reserved.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use moraine_types::{ConnectionUid, LogNumber, NodeUid, ViewNumber};

/// Per-channel send sequence number.
pub type Seq = u64;

// ============================================================================
// Message Envelope
// ============================================================================

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client → primary: execute these payloads.
    Request(Request),

    /// Primary → client: committed results.
    Response(Response),

    /// Primary → backup: log extension and commit/decide advancement.
    Commit(Commit),

    /// Backup → primary: stored prefix acknowledgment.
    Ack(Ack),

    /// Active end → passive end: connection identity proposal.
    Handshake(Handshake),

    /// Passive end → active end: connection identity confirmation.
    HandshakeAck(HandshakeAck),

    /// Replica → replica: add me to your view.
    Join(Join),

    /// Any → any: view description, ack, and log transfer carrier.
    View(ViewMessage),

    /// Reply to a malformed or unprocessable message.
    Error(ProtocolError),
}

impl Message {
    /// Returns the wire tag for this message type.
    pub fn tag(&self) -> i16 {
        match self {
            Message::Request(_) => 1,
            Message::Response(_) => -1,
            Message::Commit(_) => 3,
            Message::Ack(_) => -3,
            Message::Handshake(_) => 4,
            Message::HandshakeAck(_) => -4,
            Message::Join(_) => 5,
            Message::View(_) => 6,
            Message::Error(_) => 100,
        }
    }

    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Request(_) => "Request",
            Message::Response(_) => "Response",
            Message::Commit(_) => "Commit",
            Message::Ack(_) => "Ack",
            Message::Handshake(_) => "Handshake",
            Message::HandshakeAck(_) => "HandshakeAck",
            Message::Join(_) => "Join",
            Message::View(_) => "View",
            Message::Error(_) => "Error",
        }
    }

    /// Returns the send sequence number of this message.
    pub fn seq(&self) -> Seq {
        match self {
            Message::Request(m) => m.seq,
            Message::Response(m) => m.seq,
            Message::Commit(m) => m.seq,
            Message::Ack(m) => m.seq,
            Message::Handshake(m) => m.seq,
            Message::HandshakeAck(m) => m.seq,
            Message::Join(m) => m.seq,
            Message::View(m) => m.seq,
            Message::Error(m) => m.seq,
        }
    }

    /// Returns the view number this message speaks about, if any.
    pub fn view_number(&self) -> Option<ViewNumber> {
        match self {
            Message::Commit(m) => Some(m.view_number),
            Message::Ack(m) => Some(m.view_number),
            Message::View(m) => Some(m.spec.view_number),
            Message::Request(_)
            | Message::Response(_)
            | Message::Handshake(_)
            | Message::HandshakeAck(_)
            | Message::Join(_)
            | Message::Error(_) => None,
        }
    }
}

// ============================================================================
// Client Traffic
// ============================================================================

/// Client → primary: execute these payloads.
///
/// Carries one or more opaque payloads at consecutive client sequence numbers
/// starting from `start_seqno`. A retransmission reuses the same seqnos, which
/// is what makes duplicate suppression possible on the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Send sequence on this channel.
    pub seq: Seq,

    /// Client sequence number of the first payload.
    pub start_seqno: u64,

    /// One or more opaque request payloads.
    pub payloads: Vec<Bytes>,
}

impl Request {
    /// Creates a request carrying a single payload.
    pub fn single(seq: Seq, seqno: u64, payload: Bytes) -> Self {
        Self {
            seq,
            start_seqno: seqno,
            payloads: vec![payload],
        }
    }

    /// Returns the client seqno of payload `i`.
    pub fn seqno_at(&self, i: usize) -> u64 {
        self.start_seqno.wrapping_add(i as u64)
    }
}

/// Primary → client: committed results.
///
/// A single response may settle several outstanding requests; each reply pair
/// names the client seqno it answers. Clients match on seqnos, not on `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Send sequence on this channel.
    pub seq: Seq,

    /// `(client_seqno, payload)` pairs, in seqno order.
    pub replies: Vec<(u64, Bytes)>,
}

// ============================================================================
// Replication
// ============================================================================

/// One log item as carried on the wire.
///
/// The item's view is encoded relative to the enclosing message's view number
/// (`view = enclosing_view - view_delta`), which keeps steady-state commits
/// at delta zero. An empty `client_uid` marks a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLogItem {
    /// How far behind the enclosing message's view this item was accepted.
    pub view_delta: u64,

    /// Originating client, or empty for a placeholder.
    pub client_uid: NodeUid,

    /// Originating client's sequence number.
    pub client_seqno: u64,

    /// Opaque request payload.
    pub payload: Bytes,
}

impl WireLogItem {
    /// Returns true if this item carries a real client request.
    pub fn is_real(&self) -> bool {
        !self.client_uid.is_empty()
    }
}

/// A contiguous run of log items starting at an absolute position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogExtension {
    /// Absolute log number of the first entry.
    pub start: LogNumber,

    /// The entries, at consecutive log numbers from `start`.
    pub entries: Vec<WireLogItem>,
}

impl LogExtension {
    /// Log number one past the last entry.
    pub fn end(&self) -> LogNumber {
        self.start + self.entries.len() as u64
    }
}

/// Primary → backup: log extension and commit/decide advancement.
///
/// `decide_delta` encodes the decide point relative to the commit point
/// (`decide_no = commit_no - decide_delta`), so the common fully-replicated
/// case costs one byte. The extension is absent for pure keepalives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Send sequence on this channel; the backup's [`Ack`] echoes it.
    pub seq: Seq,

    /// View this commit belongs to.
    pub view_number: ViewNumber,

    /// Highest quorum-replicated log number.
    pub commit_no: LogNumber,

    /// `commit_no - decide_no`.
    pub decide_delta: u64,

    /// New log entries, if any.
    pub extension: Option<LogExtension>,
}

impl Commit {
    /// The decide point encoded by this commit.
    pub fn decide_no(&self) -> LogNumber {
        LogNumber::new(self.commit_no.as_u64().wrapping_sub(self.decide_delta))
    }
}

/// Backup → primary: stored prefix acknowledgment.
///
/// `ack_no` is the backup's longest contiguous stored prefix; a positive
/// `sack_delta` reports a gap and asks the primary to retransmit
/// `[ack_no, ack_no + sack_delta)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Echoes the commit's send sequence.
    pub seq: Seq,

    /// View this ack belongs to.
    pub view_number: ViewNumber,

    /// Longest contiguous stored prefix.
    pub ack_no: LogNumber,

    /// Size of the gap to the furthest entry seen, 0 if none.
    pub sack_delta: u64,
}

// ============================================================================
// Connection Setup
// ============================================================================

/// Active end → passive end: connection identity proposal.
///
/// The active end mints a fresh [`ConnectionUid`] and sends it first; the
/// passive end echoes it in [`HandshakeAck`], after which both sides hold the
/// same uid and can resolve duplicate-connection races identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Send sequence on this channel.
    pub seq: Seq,

    /// Who is connecting. Inbound TCP channels learn the remote identity here.
    pub sender_uid: NodeUid,

    /// The proposed connection identity.
    pub connection_uid: ConnectionUid,

    /// Sender's wall-clock milliseconds, for diagnostics only.
    pub sent_at_ms: u64,
}

/// Passive end → active end: connection identity confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// Echoes the handshake's send sequence.
    pub seq: Seq,

    /// Who is accepting.
    pub sender_uid: NodeUid,

    /// The confirmed connection identity.
    pub connection_uid: ConnectionUid,
}

// ============================================================================
// Membership and Views
// ============================================================================

/// Replica → replica: add me to your view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Send sequence on this channel.
    pub seq: Seq,
}

/// One member as described in a view message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// The member's identity.
    pub uid: NodeUid,

    /// The member's network address, if known to the sender.
    pub addr: Option<String>,
}

/// A view description as carried on the wire.
///
/// Besides the configuration itself, the sender may attach its own
/// acknowledgment state (`ackno`, `confirm`) and a log segment for state
/// transfer to the incoming primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    /// The described view number.
    pub view_number: ViewNumber,

    /// The members, in index order.
    pub members: Vec<MemberSpec>,

    /// Index of the primary; must equal `view_number mod members.len()`.
    pub primary_index: usize,

    /// The sender's committed prefix, if it is acknowledging the view.
    pub ackno: Option<LogNumber>,

    /// True once the sender has itself heard acks from a quorum.
    pub confirm: bool,

    /// Absolute position of `log_entries[0]`, when a segment is attached.
    pub log_start: Option<LogNumber>,

    /// Log segment for state transfer; empty when not transferring.
    pub log_entries: Vec<WireLogItem>,
}

impl ViewSpec {
    /// Returns true if this spec carries a log segment.
    pub fn has_log(&self) -> bool {
        self.log_start.is_some() && !self.log_entries.is_empty()
    }
}

/// Any → any: view description, acknowledgment, and log transfer carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMessage {
    /// Send sequence on this channel.
    pub seq: Seq,

    /// The view being described or acknowledged.
    pub spec: ViewSpec,
}

// ============================================================================
// Faults
// ============================================================================

/// Reply to a malformed or unprocessable message.
///
/// On the wire the offending sequence travels negated (`error[100, -seq]`);
/// here it is stored as sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// The send sequence of the message being rejected.
    pub seq: Seq,
}
