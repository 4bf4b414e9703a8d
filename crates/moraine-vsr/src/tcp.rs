//! TCP transport: non-blocking framed channels over mio.
//!
//! Produces [`Channel`]s interchangeable with the in-memory ones, backed by
//! real sockets:
//!
//! - Non-blocking I/O via mio (no async runtime)
//! - Length-prefixed CRC-checked frames ([`moraine_wire`])
//! - `pump` drains socket readiness into per-channel message queues
//!
//! Peer identity is directory-based: an [`AddressBook`] maps uids to socket
//! addresses for outbound connects. Inbound channels carry no identity until
//! the connection manager completes the handshake.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use moraine_types::{ConnectionUid, NodeUid};
use moraine_wire::{FrameDecoder, FrameEncoder, Message};

use crate::channel::{Channel, ChannelPoll, Transport};
use crate::VsrError;

/// Token of the listener socket.
const LISTENER_TOKEN: Token = Token(0);

/// Read buffer size per pump iteration.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Events processed per poll.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Address Book
// ============================================================================

/// Directory of peer addresses for outbound connects.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    addresses: HashMap<NodeUid, SocketAddr>,
}

impl AddressBook {
    /// Creates a directory from a uid → address map.
    pub fn new(addresses: HashMap<NodeUid, SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Creates a directory from `(uid, addr)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (NodeUid, SocketAddr)>) -> Self {
        Self::new(pairs.into_iter().collect())
    }

    /// Address of a peer, if known.
    pub fn get(&self, uid: &NodeUid) -> Option<SocketAddr> {
        self.addresses.get(uid).copied()
    }

    /// Adds or replaces a peer's address.
    pub fn insert(&mut self, uid: NodeUid, addr: SocketAddr) {
        self.addresses.insert(uid, addr);
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// True if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

// ============================================================================
// Connection registry
// ============================================================================

type ConnId = usize;

struct Conn {
    stream: TcpStream,
    token: Token,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    write_buffer: Vec<u8>,
    inbound: VecDeque<Message>,
    /// Still waiting for the non-blocking connect to complete.
    connecting: bool,
    closed: bool,
}

impl Conn {
    fn flush(&mut self) {
        if self.closed || self.connecting || self.write_buffer.is_empty() {
            return;
        }
        loop {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => {
                    self.write_buffer.drain(..n);
                    if self.write_buffer.is_empty() {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "write error; closing connection");
                    self.closed = true;
                    return;
                }
            }
        }
    }

    fn read_into_queue(&mut self) {
        if self.closed {
            return;
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    trace!("peer closed connection");
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.decoder.push(&buf[..n]);
                    loop {
                        match self.decoder.next() {
                            Ok(Some(message)) => self.inbound.push_back(message),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "frame error; closing connection");
                                self.closed = true;
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "read error; closing connection");
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

struct TcpInner {
    poll: Poll,
    listener: Option<TcpListener>,
    conns: HashMap<ConnId, Conn>,
    tokens: HashMap<Token, ConnId>,
    accepted: VecDeque<ConnId>,
    next_id: ConnId,
}

impl TcpInner {
    fn register(&mut self, mut stream: TcpStream, connecting: bool) -> io::Result<ConnId> {
        let id = self.next_id;
        self.next_id += 1;
        let token = Token(id + 1); // 0 is the listener

        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        self.conns.insert(
            id,
            Conn {
                stream,
                token,
                decoder: FrameDecoder::new(),
                encoder: FrameEncoder::new(),
                write_buffer: Vec::new(),
                inbound: VecDeque::new(),
                connecting,
                closed: false,
            },
        );
        self.tokens.insert(token, id);
        Ok(id)
    }

    fn drop_conn(&mut self, id: ConnId) {
        if let Some(mut conn) = self.conns.remove(&id) {
            self.tokens.remove(&conn.token);
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn pump(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        if let Err(e) = self
            .poll
            .poll(&mut events, Some(std::time::Duration::ZERO))
        {
            if e.kind() != ErrorKind::Interrupted {
                warn!(error = %e, "poll failed");
            }
            return;
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_ready(),
                token => {
                    let Some(&id) = self.tokens.get(&token) else {
                        continue;
                    };
                    let Some(conn) = self.conns.get_mut(&id) else {
                        continue;
                    };
                    if event.is_writable() {
                        if conn.connecting {
                            // Writable readiness signals connect completion
                            // (or failure, surfaced by peer_addr).
                            match conn.stream.peer_addr() {
                                Ok(_) => {
                                    trace!("outbound connect completed");
                                    conn.connecting = false;
                                }
                                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                                Err(e) => {
                                    debug!(error = %e, "outbound connect failed");
                                    conn.closed = true;
                                }
                            }
                        }
                        conn.flush();
                    }
                    if event.is_readable() {
                        conn.read_into_queue();
                    }
                }
            }
        }

        // Opportunistic flush of anything still buffered.
        for conn in self.conns.values_mut() {
            conn.flush();
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted inbound connection");
                    match self.register(stream, false) {
                        Ok(id) => self.accepted.push_back(id),
                        Err(e) => warn!(error = %e, "failed to register inbound connection"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }
}

// ============================================================================
// TCP Transport
// ============================================================================

/// Framed TCP transport for one endpoint.
pub struct TcpTransport {
    local: NodeUid,
    addresses: AddressBook,
    inner: Arc<Mutex<TcpInner>>,
}

impl TcpTransport {
    /// Binds the endpoint's listener and prepares the registry.
    ///
    /// The listen address is looked up in the address book under the local
    /// uid.
    pub fn bind(local: NodeUid, addresses: AddressBook) -> Result<Self, VsrError> {
        let poll = Poll::new().map_err(VsrError::Io)?;

        let listen_addr = addresses
            .get(&local)
            .ok_or_else(|| VsrError::UnknownAddress(local.clone()))?;
        let mut listener = TcpListener::bind(listen_addr).map_err(VsrError::Io)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(VsrError::Io)?;

        debug!(local = %local, addr = %listen_addr, "transport listening");

        Ok(Self {
            local,
            addresses,
            inner: Arc::new(Mutex::new(TcpInner {
                poll,
                listener: Some(listener),
                conns: HashMap::new(),
                tokens: HashMap::new(),
                accepted: VecDeque::new(),
                next_id: 0,
            })),
        })
    }

    /// The local listen address (useful with port 0 in tests).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().ok()?;
        inner.listener.as_ref()?.local_addr().ok()
    }
}

impl Transport for TcpTransport {
    fn local_uid(&self) -> &NodeUid {
        &self.local
    }

    fn connect(&mut self, peer: &NodeUid) -> Result<Box<dyn Channel>, VsrError> {
        let addr = self
            .addresses
            .get(peer)
            .ok_or_else(|| VsrError::UnknownAddress(peer.clone()))?;
        let stream = TcpStream::connect(addr).map_err(VsrError::Io)?;

        let mut inner = self.inner.lock().expect("transport lock poisoned");
        let id = inner.register(stream, true).map_err(VsrError::Io)?;

        debug!(local = %self.local, peer = %peer, %addr, "connecting");
        Ok(Box::new(TcpChannel {
            inner: self.inner.clone(),
            id,
            local: self.local.clone(),
            remote: Some(peer.clone()),
            connection_uid: None,
        }))
    }

    fn accept(&mut self) -> Option<Box<dyn Channel>> {
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        let id = inner.accepted.pop_front()?;
        Some(Box::new(TcpChannel {
            inner: self.inner.clone(),
            id,
            local: self.local.clone(),
            remote: None,
            connection_uid: None,
        }))
    }

    fn pump(&mut self) {
        self.inner.lock().expect("transport lock poisoned").pump();
    }
}

// ============================================================================
// TCP Channel
// ============================================================================

/// One framed socket, owned through the transport's registry.
pub struct TcpChannel {
    inner: Arc<Mutex<TcpInner>>,
    id: ConnId,
    local: NodeUid,
    remote: Option<NodeUid>,
    connection_uid: Option<ConnectionUid>,
}

impl Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("id", &self.id)
            .finish()
    }
}

impl Channel for TcpChannel {
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
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        let Some(conn) = inner.conns.get_mut(&self.id) else {
            return;
        };
        if conn.closed {
            return;
        }
        match conn.encoder.encode(&message) {
            Ok(frame) => {
                conn.write_buffer.extend_from_slice(&frame);
                conn.flush();
            }
            Err(e) => warn!(error = %e, "failed to encode message; dropping"),
        }
    }

    fn try_recv(&mut self) -> ChannelPoll {
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        let Some(conn) = inner.conns.get_mut(&self.id) else {
            return ChannelPoll::Closed;
        };
        if let Some(message) = conn.inbound.pop_front() {
            return ChannelPoll::Message(message);
        }
        if conn.closed {
            ChannelPoll::Closed
        } else {
            ChannelPoll::Empty
        }
    }

    fn close(&mut self) {
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        if let Some(conn) = inner.conns.get_mut(&self.id) {
            conn.flush();
            conn.closed = true;
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        let inner = self.inner.lock().expect("transport lock poisoned");
        inner.conns.get(&self.id).map_or(true, |c| c.closed)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.drop_conn(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::conn::{ConnectionManager, ManagerEvent};
    use moraine_wire::Join;
    use std::time::{Duration, Instant};

    fn uid(s: &str) -> NodeUid {
        NodeUid::new(s)
    }

    fn local_pair() -> (TcpTransport, TcpTransport, AddressBook) {
        // Bind on ephemeral ports first, then rebuild the address book with
        // the real addresses.
        let mut book = AddressBook::default();
        book.insert(uid("a"), "127.0.0.1:0".parse().unwrap());
        book.insert(uid("b"), "127.0.0.1:0".parse().unwrap());

        let a = TcpTransport::bind(uid("a"), book.clone()).expect("bind a");
        let b = TcpTransport::bind(uid("b"), book.clone()).expect("bind b");

        let mut resolved = AddressBook::default();
        resolved.insert(uid("a"), a.local_addr().expect("addr a"));
        resolved.insert(uid("b"), b.local_addr().expect("addr b"));

        let a = TcpTransport {
            addresses: resolved.clone(),
            ..a
        };
        let b = TcpTransport {
            addresses: resolved.clone(),
            ..b
        };
        (a, b, resolved)
    }

    #[test]
    fn raw_channel_exchange() {
        let (mut a, mut b, _) = local_pair();

        let mut to_b = a.connect(&uid("b")).expect("connect");

        // Pump both sides until the inbound channel appears and the message
        // arrives.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut from_a = loop {
            a.pump();
            b.pump();
            if let Some(ch) = b.accept() {
                break ch;
            }
            assert!(Instant::now() < deadline, "accept timed out");
            std::thread::sleep(Duration::from_millis(1));
        };

        to_b.send(Message::Join(Join { seq: 5 }));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            a.pump();
            b.pump();
            match from_a.try_recv() {
                ChannelPoll::Message(Message::Join(j)) => {
                    assert_eq!(j.seq, 5);
                    break;
                }
                ChannelPoll::Message(other) => panic!("unexpected {}", other.name()),
                ChannelPoll::Empty => {
                    assert!(Instant::now() < deadline, "receive timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                ChannelPoll::Closed => panic!("channel closed"),
            }
        }
    }

    #[test]
    fn managers_handshake_over_tcp() {
        let (a, b, _) = local_pair();

        let config = {
            let mut c = ProtocolConfig::development();
            c.connect_jitter = Duration::ZERO;
            c
        };
        let mut ma = ConnectionManager::new(config.with_seed(1), Box::new(a));
        let mut mb = ConnectionManager::new(config.with_seed(2), Box::new(b));

        ma.connect(&uid("b"), Instant::now());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !(ma.is_connected(&uid("b")) && mb.is_connected(&uid("a"))) {
            let now = Instant::now();
            let _ = ma.poll(now);
            let _ = mb.poll(now);
            assert!(Instant::now() < deadline, "handshake timed out");
            std::thread::sleep(Duration::from_millis(1));
        }

        ma.send(&uid("b"), Message::Join(Join { seq: 9 })).expect("send");

        let deadline = Instant::now() + Duration::from_secs(5);
        'outer: loop {
            let now = Instant::now();
            let _ = ma.poll(now);
            for event in mb.poll(now) {
                if let ManagerEvent::Inbound {
                    from,
                    message: Message::Join(j),
                } = event
                {
                    assert_eq!(from, uid("a"));
                    assert_eq!(j.seq, 9);
                    break 'outer;
                }
            }
            assert!(Instant::now() < deadline, "delivery timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
