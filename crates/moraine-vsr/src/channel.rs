//! Channel and transport abstractions, plus the in-memory network.
//!
//! A [`Channel`] is a reliable, ordered, bidirectional message stream to one
//! remote endpoint. Sending never blocks; loss is modeled inside the
//! transport, not surfaced to callers. Receiving is polled: a closed channel
//! yields [`ChannelPoll::Closed`] as its sentinel and then nothing more.
//!
//! A [`Transport`] mints channels: actively via `connect`, passively via
//! `accept`. The TCP implementation lives in [`crate::tcp`]; this module
//! provides [`MemoryNetwork`], an in-process hub with configurable loss,
//! delay, and partitions for tests.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use moraine_types::{ConnectionUid, NodeUid};
use moraine_wire::Message;

use crate::VsrError;

// ============================================================================
// Channel
// ============================================================================

/// Result of polling a channel for one message.
#[derive(Debug)]
pub enum ChannelPoll {
    /// A message arrived.
    Message(Message),

    /// Nothing available right now.
    Empty,

    /// The channel is closed; no further messages will arrive.
    Closed,
}

/// A reliable, ordered, bidirectional message stream to one endpoint.
pub trait Channel: Send + Debug {
    /// Local endpoint identity.
    fn local_uid(&self) -> &NodeUid;

    /// Remote endpoint identity, once known.
    ///
    /// Known at connect time for outbound channels; inbound channels learn
    /// it from the handshake.
    fn remote_uid(&self) -> Option<&NodeUid>;

    /// Records the remote identity learned from a handshake.
    fn set_remote_uid(&mut self, uid: NodeUid);

    /// The agreed connection identity, once the handshake settled it.
    fn connection_uid(&self) -> Option<&ConnectionUid>;

    /// Sets the connection identity. May be called once.
    fn set_connection_uid(&mut self, uid: ConnectionUid);

    /// Enqueues a message. Never blocks; never fails from the caller's
    /// perspective.
    fn send(&mut self, message: Message);

    /// Polls for one inbound message.
    fn try_recv(&mut self) -> ChannelPoll;

    /// Closes the channel; the peer's receive loop observes the sentinel.
    fn close(&mut self);

    /// True once closed (locally or by the peer).
    fn is_closed(&self) -> bool;
}

/// A channel factory: actively dials peers and passively accepts.
pub trait Transport: Send {
    /// Local endpoint identity.
    fn local_uid(&self) -> &NodeUid;

    /// Opens a channel to a peer.
    fn connect(&mut self, peer: &NodeUid) -> Result<Box<dyn Channel>, VsrError>;

    /// Takes the next inbound channel, if one arrived.
    fn accept(&mut self) -> Option<Box<dyn Channel>>;

    /// Performs any pending I/O. No-op for in-memory transports.
    fn pump(&mut self) {}
}

// ============================================================================
// Memory Network
// ============================================================================

/// Fault plan for the in-memory network.
#[derive(Debug, Clone)]
struct Faults {
    /// Probability that any single send is dropped.
    loss: f64,

    /// Upper bound of the random per-message delivery delay.
    max_delay: Duration,

    /// Ordered pairs `(from, to)` whose traffic is dropped entirely.
    blocked: Vec<(NodeUid, NodeUid)>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            loss: 0.0,
            max_delay: Duration::ZERO,
            blocked: Vec::new(),
        }
    }
}

struct HubInner {
    /// Inbound-channel queues of registered endpoints.
    listeners: HashMap<NodeUid, Sender<Box<dyn Channel>>>,
    faults: Faults,
    rng: SmallRng,
}

impl HubInner {
    /// Decides the fate of one message: `None` to drop, or the delivery
    /// instant.
    fn schedule(&mut self, from: &NodeUid, to: &NodeUid) -> Option<Instant> {
        let blocked = self
            .faults
            .blocked
            .iter()
            .any(|(f, t)| f == from && t == to);
        if blocked {
            return None;
        }
        if self.faults.loss > 0.0 && self.rng.gen_bool(self.faults.loss) {
            return None;
        }
        let delay = if self.faults.max_delay.is_zero() {
            Duration::ZERO
        } else {
            let nanos = self.faults.max_delay.as_nanos() as u64;
            Duration::from_nanos(self.rng.gen_range(0..=nanos))
        };
        Some(Instant::now() + delay)
    }
}

/// An in-process network hub connecting [`MemoryEndpoint`]s.
///
/// Loss, delay, and partitions are driven by a seeded RNG, so a test with a
/// fixed seed sees the same fault pattern every run.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryNetwork {
    /// Creates a hub with no faults.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                listeners: HashMap::new(),
                faults: Faults::default(),
                rng: SmallRng::seed_from_u64(seed),
            })),
        }
    }

    /// Registers an endpoint on the hub.
    pub fn endpoint(&self, uid: NodeUid) -> MemoryEndpoint {
        let (tx, rx) = unbounded();
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .listeners
            .insert(uid.clone(), tx);
        MemoryEndpoint {
            uid,
            hub: self.inner.clone(),
            inbound: rx,
        }
    }

    /// Sets the per-message loss probability.
    pub fn set_loss(&self, probability: f64) {
        self.inner.lock().expect("hub lock poisoned").faults.loss = probability;
    }

    /// Sets the upper bound of the random delivery delay.
    pub fn set_max_delay(&self, delay: Duration) {
        self.inner.lock().expect("hub lock poisoned").faults.max_delay = delay;
    }

    /// Drops all traffic from `from` to `to` until unblocked.
    pub fn block(&self, from: NodeUid, to: NodeUid) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if !inner.faults.blocked.iter().any(|(f, t)| f == &from && t == &to) {
            inner.faults.blocked.push((from, to));
        }
    }

    /// Undoes [`block`](MemoryNetwork::block).
    pub fn unblock(&self, from: &NodeUid, to: &NodeUid) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.faults.blocked.retain(|(f, t)| !(f == from && t == to));
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    uid: NodeUid,
    hub: Arc<Mutex<HubInner>>,
    inbound: Receiver<Box<dyn Channel>>,
}

impl Transport for MemoryEndpoint {
    fn local_uid(&self) -> &NodeUid {
        &self.uid
    }

    fn connect(&mut self, peer: &NodeUid) -> Result<Box<dyn Channel>, VsrError> {
        let (to_peer_tx, to_peer_rx) = unbounded();
        let (to_us_tx, to_us_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let ours = MemoryChannel {
            local: self.uid.clone(),
            remote: Some(peer.clone()),
            connection_uid: None,
            hub: self.hub.clone(),
            tx: to_peer_tx,
            rx: to_us_rx,
            staged: VecDeque::new(),
            closed: closed.clone(),
        };
        let theirs = MemoryChannel {
            local: peer.clone(),
            // The passive end learns the remote identity from the handshake,
            // mirroring TCP accept.
            remote: None,
            connection_uid: None,
            hub: self.hub.clone(),
            tx: to_us_tx,
            rx: to_peer_rx,
            staged: VecDeque::new(),
            closed,
        };

        let hub = self.hub.lock().expect("hub lock poisoned");
        let listener = hub
            .listeners
            .get(peer)
            .ok_or_else(|| VsrError::ConnectFailed(peer.clone()))?;
        listener
            .send(Box::new(theirs))
            .map_err(|_| VsrError::ConnectFailed(peer.clone()))?;

        Ok(Box::new(ours))
    }

    fn accept(&mut self) -> Option<Box<dyn Channel>> {
        self.inbound.try_recv().ok()
    }
}

/// One half of an in-memory channel pair.
pub struct MemoryChannel {
    local: NodeUid,
    remote: Option<NodeUid>,
    connection_uid: Option<ConnectionUid>,
    hub: Arc<Mutex<HubInner>>,
    tx: Sender<(Instant, Message)>,
    rx: Receiver<(Instant, Message)>,
    /// Messages received but not yet due (delay fault in effect).
    staged: VecDeque<(Instant, Message)>,
    closed: Arc<AtomicBool>,
}

impl Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel for MemoryChannel {
    fn local_uid(&self) -> &NodeUid {
        &self.local
    }

    fn remote_uid(&self) -> Option<&NodeUid> {
        self.remote.as_ref()
    }

    fn set_remote_uid(&mut self, uid: NodeUid) {
        self.remote = Some(uid);
    }

    fn connection_uid(&self) -> Option<&ConnectionUid> {
        self.connection_uid.as_ref()
    }

    fn set_connection_uid(&mut self, uid: ConnectionUid) {
        debug_assert!(
            self.connection_uid.is_none(),
            "connection uid may be set once"
        );
        self.connection_uid = Some(uid);
    }

    fn send(&mut self, message: Message) {
        if self.is_closed() {
            return;
        }
        // Faults only apply between identified endpoints; handshake traffic
        // on a half-open channel always goes through.
        let deliver_at = match &self.remote {
            Some(remote) => {
                let mut hub = self.hub.lock().expect("hub lock poisoned");
                hub.schedule(&self.local, remote)
            }
            None => Some(Instant::now()),
        };
        match deliver_at {
            Some(at) => {
                let _ = self.tx.send((at, message));
            }
            None => {
                trace!(from = %self.local, "memory network dropped a message");
            }
        }
    }

    fn try_recv(&mut self) -> ChannelPoll {
        loop {
            match self.rx.try_recv() {
                Ok(item) => self.staged.push_back(item),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.staged.is_empty() {
                        return ChannelPoll::Closed;
                    }
                    break;
                }
            }
        }

        let now = Instant::now();
        if let Some(position) = self.staged.iter().position(|(at, _)| *at <= now) {
            let (_, message) = self.staged.remove(position).expect("position valid");
            return ChannelPoll::Message(message);
        }

        if self.is_closed() && self.staged.is_empty() {
            ChannelPoll::Closed
        } else {
            ChannelPoll::Empty
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
