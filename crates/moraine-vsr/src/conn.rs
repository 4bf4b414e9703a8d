//! The connection manager: one live channel per remote uid.
//!
//! The manager owns every channel. Callers address peers by uid; the manager
//! dials, handshakes, deduplicates, and pumps inbound traffic.
//!
//! # Handshake
//!
//! The active end mints a [`ConnectionUid`] and sends `handshake`; the
//! passive end replies `handshake-ack` echoing the uid, so both sides hold
//! the same identity. The handshake is resent every `message_timeout` and
//! the channel discarded after `handshake_timeout`.
//!
//! # Duplicate resolution
//!
//! When a handshaked channel arrives for a peer that already has one, both
//! sides compare the two connection uids lexicographically and keep the
//! larger. The rule is symmetric, so simultaneous connects collapse to the
//! same surviving channel on both ends.
//!
//! # Deferred connects
//!
//! A connect to a peer with a dial already in flight joins that dial; the
//! first completion serves all callers. Every outbound dial waits a small
//! random delay first to thin out simultaneous-connect races.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use moraine_types::{ConnectionUid, NodeUid};
use moraine_wire::{Handshake, HandshakeAck, Message};

use crate::channel::{Channel, ChannelPoll, Transport};
use crate::config::ProtocolConfig;
use crate::VsrError;

// ============================================================================
// Manager Events
// ============================================================================

/// Observations produced by [`ConnectionManager::poll`].
#[derive(Debug)]
pub enum ManagerEvent {
    /// A channel to this peer is established and handshaked.
    Connected(NodeUid),

    /// A message arrived from an established peer.
    Inbound {
        /// The sending peer.
        from: NodeUid,
        /// The message.
        message: Message,
    },

    /// An established channel closed.
    Disconnected(NodeUid),

    /// A dial gave up (handshake budget exhausted or transport refusal).
    ConnectFailed(NodeUid),
}

// ============================================================================
// Internal connection states
// ============================================================================

/// An outbound dial in progress.
struct Dialing {
    /// Jitter wait before the transport connect actually happens.
    dial_at: Instant,
    /// The channel, once the transport produced it.
    channel: Option<Box<dyn Channel>>,
    /// Our proposed connection identity.
    connection_uid: ConnectionUid,
    /// When the whole attempt expires.
    deadline: Instant,
    /// When to resend the handshake.
    retry_at: Instant,
}

/// An accepted channel still waiting for its handshake.
struct InboundPending {
    channel: Box<dyn Channel>,
    deadline: Instant,
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Owns and multiplexes channels, one per remote uid.
pub struct ConnectionManager {
    local: NodeUid,
    config: ProtocolConfig,
    transport: Box<dyn Transport>,
    established: HashMap<NodeUid, Box<dyn Channel>>,
    dialing: HashMap<NodeUid, Dialing>,
    inbound_pending: Vec<InboundPending>,
    rng: SmallRng,
    seq: u64,
}

impl ConnectionManager {
    /// Creates a manager over a transport.
    pub fn new(config: ProtocolConfig, transport: Box<dyn Transport>) -> Self {
        let local = transport.local_uid().clone();
        Self {
            local,
            rng: SmallRng::seed_from_u64(config.rng_seed),
            config,
            transport,
            established: HashMap::new(),
            dialing: HashMap::new(),
            inbound_pending: Vec::new(),
            seq: 0,
        }
    }

    /// The local endpoint identity.
    pub fn local_uid(&self) -> &NodeUid {
        &self.local
    }

    /// True if a handshaked channel to this peer exists.
    pub fn is_connected(&self, peer: &NodeUid) -> bool {
        self.established.contains_key(peer)
    }

    /// Number of established peers.
    pub fn connected_count(&self) -> usize {
        self.established.len()
    }

    /// The connection uid agreed with a peer, if connected.
    pub fn connection_uid(&self, peer: &NodeUid) -> Option<&ConnectionUid> {
        self.established
            .get(peer)
            .and_then(|c| c.connection_uid())
    }

    /// Starts (or joins) a dial to a peer.
    ///
    /// A connect against an established or in-flight peer is a no-op: the
    /// caller shares the existing attempt's outcome.
    pub fn connect(&mut self, peer: &NodeUid, now: Instant) {
        if peer == &self.local || self.established.contains_key(peer) {
            return;
        }
        if self.dialing.contains_key(peer) {
            trace!(local = %self.local, peer = %peer, "connect deferred onto in-flight dial");
            return;
        }

        let jitter_nanos = self.config.connect_jitter.as_nanos() as u64;
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.rng.gen_range(0..=jitter_nanos))
        };

        debug!(local = %self.local, peer = %peer, ?jitter, "dialing");
        self.dialing.insert(
            peer.clone(),
            Dialing {
                dial_at: now + jitter,
                channel: None,
                connection_uid: ConnectionUid::generate(),
                deadline: now + self.config.handshake_timeout,
                retry_at: now,
            },
        );
    }

    /// Sends a message to an established peer.
    pub fn send(&mut self, peer: &NodeUid, message: Message) -> Result<(), VsrError> {
        match self.established.get_mut(peer) {
            Some(channel) => {
                channel.send(message);
                Ok(())
            }
            None => Err(VsrError::NotConnected(peer.clone())),
        }
    }

    /// Closes and removes the channel to a peer.
    pub fn remove(&mut self, peer: &NodeUid) {
        if let Some(mut channel) = self.established.remove(peer) {
            channel.close();
        }
        self.dialing.remove(peer);
    }

    /// Closes everything.
    pub fn shutdown(&mut self) {
        for (_, mut channel) in self.established.drain() {
            channel.close();
        }
        for (_, mut dial) in self.dialing.drain() {
            if let Some(channel) = dial.channel.as_mut() {
                channel.close();
            }
        }
        for pending in &mut self.inbound_pending {
            pending.channel.close();
        }
        self.inbound_pending.clear();
    }

    /// Advances all connection state machines and collects observations.
    pub fn poll(&mut self, now: Instant) -> Vec<ManagerEvent> {
        let mut events = Vec::new();
        self.transport.pump();
        self.accept_inbound(now);
        self.pump_inbound_pending(now, &mut events);
        self.pump_dialing(now, &mut events);
        self.pump_established(&mut events);
        events
    }

    // ========================================================================
    // Inbound channels
    // ========================================================================

    fn accept_inbound(&mut self, now: Instant) {
        while let Some(channel) = self.transport.accept() {
            trace!(local = %self.local, "accepted inbound channel");
            self.inbound_pending.push(InboundPending {
                channel,
                deadline: now + self.config.handshake_timeout,
            });
        }
    }

    fn pump_inbound_pending(&mut self, now: Instant, events: &mut Vec<ManagerEvent>) {
        let mut ready: Vec<Box<dyn Channel>> = Vec::new();
        let mut keep: Vec<InboundPending> = Vec::new();

        for mut pending in self.inbound_pending.drain(..) {
            if pending.deadline < now {
                debug!(local = %self.local, "inbound handshake timed out; discarding");
                pending.channel.close();
                continue;
            }
            match pending.channel.try_recv() {
                ChannelPoll::Message(Message::Handshake(handshake)) => {
                    pending.channel.set_remote_uid(handshake.sender_uid.clone());
                    pending
                        .channel
                        .set_connection_uid(handshake.connection_uid.clone());
                    let ack = HandshakeAck {
                        seq: handshake.seq,
                        sender_uid: self.local.clone(),
                        connection_uid: handshake.connection_uid,
                    };
                    pending.channel.send(Message::HandshakeAck(ack));
                    ready.push(pending.channel);
                }
                ChannelPoll::Message(other) => {
                    // Anything but a handshake on a fresh channel is a
                    // protocol violation; drop the channel.
                    warn!(local = %self.local, msg = other.name(), "expected handshake; closing");
                    pending.channel.close();
                }
                ChannelPoll::Empty => keep.push(pending),
                ChannelPoll::Closed => {}
            }
        }

        self.inbound_pending = keep;
        for channel in ready {
            self.install(channel, events);
        }
    }

    // ========================================================================
    // Outbound dials
    // ========================================================================

    fn pump_dialing(&mut self, now: Instant, events: &mut Vec<ManagerEvent>) {
        let peers: Vec<NodeUid> = self.dialing.keys().cloned().collect();

        for peer in peers {
            // A dial races any parallel inbound channel to completion; the
            // winner is decided by connection-uid comparison in `install`,
            // never by which one finished first, so both sides agree.
            let Some(dial) = self.dialing.get_mut(&peer) else {
                continue;
            };

            if dial.deadline < now {
                debug!(local = %self.local, peer = %peer, "handshake budget exhausted");
                if let Some(channel) = dial.channel.as_mut() {
                    channel.close();
                }
                self.dialing.remove(&peer);
                if !self.established.contains_key(&peer) {
                    events.push(ManagerEvent::ConnectFailed(peer));
                }
                continue;
            }

            if dial.channel.is_none() {
                if dial.dial_at > now {
                    continue;
                }
                match self.transport.connect(&peer) {
                    Ok(channel) => {
                        dial.channel = Some(channel);
                        dial.retry_at = now; // send the handshake below
                    }
                    Err(error) => {
                        debug!(local = %self.local, peer = %peer, %error, "transport connect failed");
                        self.dialing.remove(&peer);
                        events.push(ManagerEvent::ConnectFailed(peer));
                        continue;
                    }
                }
            }

            let expected_uid = dial.connection_uid.clone();
            let retry_due = dial.retry_at <= now;
            if retry_due {
                dial.retry_at = now + self.config.message_timeout;
            }

            // End the `dial` borrow before touching the map again.
            let channel = dial.channel.as_mut().expect("dialed above");
            if retry_due {
                self.seq = self.seq.wrapping_add(1);
                let handshake = Handshake {
                    seq: self.seq,
                    sender_uid: self.local.clone(),
                    connection_uid: expected_uid.clone(),
                    sent_at_ms: unix_millis(),
                };
                channel.send(Message::Handshake(handshake));
            }
            let poll = channel.try_recv();

            match poll {
                ChannelPoll::Message(Message::HandshakeAck(ack)) => {
                    if ack.connection_uid != expected_uid {
                        warn!(local = %self.local, peer = %peer, "handshake ack for a different uid; ignoring");
                        continue;
                    }
                    let mut dial = self.dialing.remove(&peer).expect("present");
                    let mut channel = dial.channel.take().expect("dialed above");
                    channel.set_connection_uid(dial.connection_uid);
                    channel.set_remote_uid(ack.sender_uid);
                    self.install(channel, events);
                }
                ChannelPoll::Message(other) => {
                    warn!(local = %self.local, peer = %peer, msg = other.name(), "expected handshake ack; closing");
                    let mut dial = self.dialing.remove(&peer).expect("present");
                    if let Some(channel) = dial.channel.as_mut() {
                        channel.close();
                    }
                    events.push(ManagerEvent::ConnectFailed(peer));
                }
                ChannelPoll::Empty => {}
                ChannelPoll::Closed => {
                    // Either the peer went away, or this dial lost a
                    // duplicate-resolution race on the other side.
                    debug!(local = %self.local, peer = %peer, "dial channel closed under us");
                    self.dialing.remove(&peer);
                    if !self.established.contains_key(&peer) {
                        events.push(ManagerEvent::ConnectFailed(peer));
                    }
                }
            }
        }
    }

    // ========================================================================
    // Established channels
    // ========================================================================

    /// Installs a handshaked channel, resolving duplicates.
    fn install(&mut self, mut channel: Box<dyn Channel>, events: &mut Vec<ManagerEvent>) {
        let Some(peer) = channel.remote_uid().cloned() else {
            warn!(local = %self.local, "handshaked channel without remote uid; closing");
            channel.close();
            return;
        };

        match self.established.get_mut(&peer) {
            None => {
                debug!(local = %self.local, peer = %peer, "channel established");
                self.established.insert(peer.clone(), channel);
                events.push(ManagerEvent::Connected(peer));
            }
            Some(existing) => {
                // Keep the larger connection uid; both sides agree.
                let keep_new = match (existing.connection_uid(), channel.connection_uid()) {
                    (Some(old), Some(new)) => new > old,
                    _ => true,
                };
                if keep_new {
                    debug!(local = %self.local, peer = %peer, "duplicate resolved in favor of new channel");
                    existing.close();
                    *existing = channel;
                } else {
                    debug!(local = %self.local, peer = %peer, "duplicate resolved in favor of existing channel");
                    channel.close();
                }
                // The peer was already connected; no new event.
            }
        }
    }

    fn pump_established(&mut self, events: &mut Vec<ManagerEvent>) {
        let mut dropped: Vec<NodeUid> = Vec::new();

        for (peer, channel) in &mut self.established {
            loop {
                match channel.try_recv() {
                    ChannelPoll::Message(Message::Handshake(handshake)) => {
                        // A late handshake retry on an already-winning
                        // channel; re-ack it.
                        let ack = HandshakeAck {
                            seq: handshake.seq,
                            sender_uid: self.local.clone(),
                            connection_uid: handshake.connection_uid,
                        };
                        channel.send(Message::HandshakeAck(ack));
                    }
                    ChannelPoll::Message(Message::HandshakeAck(_)) => {}
                    ChannelPoll::Message(message) => {
                        events.push(ManagerEvent::Inbound {
                            from: peer.clone(),
                            message,
                        });
                    }
                    ChannelPoll::Empty => break,
                    ChannelPoll::Closed => {
                        dropped.push(peer.clone());
                        break;
                    }
                }
            }
        }

        for peer in dropped {
            debug!(local = %self.local, peer = %peer, "channel lost");
            self.established.remove(&peer);
            events.push(ManagerEvent::Disconnected(peer));
        }
    }
}

/// Wall-clock milliseconds for handshake diagnostics.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryNetwork;
    use moraine_wire::Join;

    fn uid(s: &str) -> NodeUid {
        NodeUid::new(s)
    }

    fn config() -> ProtocolConfig {
        // Zero jitter keeps single-threaded pump loops deterministic.
        let mut config = ProtocolConfig::simulation();
        config.connect_jitter = Duration::ZERO;
        config
    }

    fn manager(net: &MemoryNetwork, name: &str, seed: u64) -> ConnectionManager {
        let endpoint = net.endpoint(uid(name));
        ConnectionManager::new(config().with_seed(seed), Box::new(endpoint))
    }

    /// Polls both managers until neither produces events for a few rounds.
    fn settle(a: &mut ConnectionManager, b: &mut ConnectionManager) -> Vec<ManagerEvent> {
        let mut all = Vec::new();
        let mut quiet = 0;
        for _ in 0..200 {
            let now = Instant::now();
            let mut produced = a.poll(now);
            produced.extend(b.poll(now));
            if produced.is_empty() {
                quiet += 1;
                if quiet >= 3 {
                    break;
                }
            } else {
                quiet = 0;
                all.extend(produced);
            }
        }
        all
    }

    #[test]
    fn connect_and_handshake() {
        let net = MemoryNetwork::new(1);
        let mut a = manager(&net, "a", 1);
        let mut b = manager(&net, "b", 2);

        a.connect(&uid("b"), Instant::now());
        let events = settle(&mut a, &mut b);

        assert!(a.is_connected(&uid("b")));
        assert!(b.is_connected(&uid("a")));
        assert_eq!(a.connection_uid(&uid("b")), b.connection_uid(&uid("a")));

        let a_connected = events
            .iter()
            .any(|e| matches!(e, ManagerEvent::Connected(p) if p == &uid("b")));
        assert!(a_connected);
    }

    #[test]
    fn messages_flow_after_handshake() {
        let net = MemoryNetwork::new(2);
        let mut a = manager(&net, "a", 1);
        let mut b = manager(&net, "b", 2);

        a.connect(&uid("b"), Instant::now());
        settle(&mut a, &mut b);

        a.send(&uid("b"), Message::Join(Join { seq: 42 })).expect("send");
        let events = settle(&mut a, &mut b);

        let delivered = events.iter().any(|e| {
            matches!(
                e,
                ManagerEvent::Inbound {
                    from,
                    message: Message::Join(j)
                } if from == &uid("a") && j.seq == 42
            )
        });
        assert!(delivered);
    }

    #[test]
    fn send_to_unconnected_peer_fails() {
        let net = MemoryNetwork::new(3);
        let mut a = manager(&net, "a", 1);
        let result = a.send(&uid("b"), Message::Join(Join { seq: 1 }));
        assert!(matches!(result, Err(VsrError::NotConnected(_))));
    }

    #[test]
    fn simultaneous_connects_collapse_to_one_channel() {
        let net = MemoryNetwork::new(4);
        let mut a = manager(&net, "a", 10);
        let mut b = manager(&net, "b", 20);

        // Both dial each other before either poll runs.
        let now = Instant::now();
        a.connect(&uid("b"), now);
        b.connect(&uid("a"), now);
        settle(&mut a, &mut b);

        assert!(a.is_connected(&uid("b")));
        assert!(b.is_connected(&uid("a")));
        assert_eq!(a.connected_count(), 1);
        assert_eq!(b.connected_count(), 1);

        // Both sides kept the channel with the same (larger) uid.
        assert_eq!(a.connection_uid(&uid("b")), b.connection_uid(&uid("a")));

        // The surviving pair still carries traffic both ways.
        a.send(&uid("b"), Message::Join(Join { seq: 7 })).expect("a→b");
        b.send(&uid("a"), Message::Join(Join { seq: 8 })).expect("b→a");
        let events = settle(&mut a, &mut b);
        let both = events
            .iter()
            .filter(|e| matches!(e, ManagerEvent::Inbound { .. }))
            .count();
        assert_eq!(both, 2);
    }

    #[test]
    fn repeated_connect_joins_in_flight_dial() {
        let net = MemoryNetwork::new(5);
        let mut a = manager(&net, "a", 1);
        let mut b = manager(&net, "b", 2);

        let now = Instant::now();
        a.connect(&uid("b"), now);
        a.connect(&uid("b"), now);
        a.connect(&uid("b"), now);
        settle(&mut a, &mut b);

        assert_eq!(a.connected_count(), 1);
        assert_eq!(b.connected_count(), 1);
    }

    #[test]
    fn dial_to_missing_peer_reports_failure() {
        let net = MemoryNetwork::new(6);
        let mut a = manager(&net, "a", 1);

        a.connect(&uid("ghost"), Instant::now());
        let mut failed = false;
        for _ in 0..50 {
            for event in a.poll(Instant::now()) {
                if matches!(&event, ManagerEvent::ConnectFailed(p) if p == &uid("ghost")) {
                    failed = true;
                }
            }
            if failed {
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn closed_peer_surfaces_disconnect() {
        let net = MemoryNetwork::new(8);
        let mut a = manager(&net, "a", 1);
        let mut b = manager(&net, "b", 2);

        a.connect(&uid("b"), Instant::now());
        settle(&mut a, &mut b);
        assert!(b.is_connected(&uid("a")));

        a.remove(&uid("b"));
        let mut disconnected = false;
        for _ in 0..50 {
            for event in b.poll(Instant::now()) {
                if matches!(&event, ManagerEvent::Disconnected(p) if p == &uid("a")) {
                    disconnected = true;
                }
            }
            if disconnected {
                break;
            }
        }
        assert!(disconnected);
        assert!(!b.is_connected(&uid("a")));
    }
}
