//! # moraine-wire: protocol messages and framing
//!
//! This crate defines the messages exchanged between Moraine replicas and
//! clients, and the framing that carries them over a byte stream.
//!
//! ## Message families
//!
//! - **Client traffic**: [`Request`] / [`Response`]
//! - **Replication**: [`Commit`] (primary → backup) / [`Ack`] (backup → primary)
//! - **Connection setup**: [`Handshake`] / [`HandshakeAck`]
//! - **Membership and views**: [`Join`], [`ViewMessage`]
//! - **Faults**: [`ProtocolError`]
//!
//! Every message type has a small numeric tag (see [`Message::tag`]); a
//! positive tag marks a request, the negated tag marks its reply. The reply
//! echoes the request's `seq`.
//!
//! ## Framing
//!
//! Messages travel inside length-prefixed, CRC-checked frames produced by
//! [`FrameEncoder`] and consumed incrementally by [`FrameDecoder`], which
//! tolerates partial reads from non-blocking sockets.

mod error;
mod frame;
mod message;

pub use error::WireError;
pub use frame::{FrameDecoder, FrameEncoder, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{
    Ack, Commit, Handshake, HandshakeAck, Join, LogExtension, MemberSpec, Message, ProtocolError,
    Request, Response, Seq, ViewMessage, ViewSpec, WireLogItem,
};
