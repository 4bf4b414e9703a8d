//! Drivers: the per-replica event loop and the client loop.
//!
//! The pure state machines in [`crate::replica`] and [`crate::client`] know
//! nothing about clocks, sockets, or threads. The drivers here own all of
//! that:
//!
//! - one dedicated thread per node, owning the machine and its connection
//!   manager (all replica state is touched by exactly one thread);
//! - deadline tracking, feeding expirations in as timeout events;
//! - an outbox per peer, so sends to not-yet-connected peers trigger a dial
//!   and flush once the handshake completes;
//! - `at_view` / `at_store` / `at_commit` waiters, fired as the replica's
//!   numbers advance and failed with a sentinel on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use moraine_types::{LogNumber, NodeUid, ViewNumber};
use moraine_wire::Message;

use crate::channel::Transport;
use crate::client::Client;
use crate::config::ProtocolConfig;
use crate::conn::{ConnectionManager, ManagerEvent};
use crate::replica::{Replica, ReplicaEvent, TimeoutKind};
use crate::VsrError;

/// How long the loop sleeps when nothing is ready.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Messages buffered per unreachable peer. The protocol retransmits, so
/// overflow just drops the oldest traffic.
const OUTBOX_LIMIT: usize = 64;

// ============================================================================
// Replica status snapshot
// ============================================================================

/// Externally visible replica state, refreshed after every event.
#[derive(Debug, Clone, Default)]
pub struct ReplicaStatus {
    /// Serving view number.
    pub view_number: ViewNumber,
    /// True while a view change runs.
    pub in_view_change: bool,
    /// True if this replica is the stable primary.
    pub is_primary: bool,
    /// Member count of the serving view.
    pub members: usize,
    /// Quorum-replicated prefix.
    pub commit_no: LogNumber,
    /// Fully-replicated prefix.
    pub decide_no: LogNumber,
    /// Local log high-water mark.
    pub log_last: LogNumber,
    /// Established peer channels.
    pub connected_peers: usize,
}

// ============================================================================
// Commands and handles
// ============================================================================

enum NodeCommand {
    Join {
        peer: NodeUid,
    },
    Stop,
    Resume,
    WaitView {
        view: ViewNumber,
        notify: Sender<Result<ViewNumber, VsrError>>,
    },
    WaitStore {
        logno: LogNumber,
        notify: Sender<Result<LogNumber, VsrError>>,
    },
    WaitCommit {
        logno: LogNumber,
        notify: Sender<Result<LogNumber, VsrError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`ReplicaNode`].
#[derive(Clone)]
pub struct ReplicaHandle {
    commands: Sender<NodeCommand>,
    status: Arc<RwLock<ReplicaStatus>>,
}

impl ReplicaHandle {
    /// Asks the replica to join a known peer's group.
    pub fn join(&self, peer: NodeUid) {
        let _ = self.commands.send(NodeCommand::Join { peer });
    }

    /// Makes the replica drop all inbound traffic (test hook).
    pub fn stop(&self) {
        let _ = self.commands.send(NodeCommand::Stop);
    }

    /// Undoes [`stop`](ReplicaHandle::stop).
    pub fn resume(&self) {
        let _ = self.commands.send(NodeCommand::Resume);
    }

    /// Completion that fires once the serving view reaches `view`.
    ///
    /// Fails with [`VsrError::ShuttingDown`] if the node stops first.
    pub fn at_view(&self, view: ViewNumber) -> Receiver<Result<ViewNumber, VsrError>> {
        let (tx, rx) = unbounded();
        let _ = self.commands.send(NodeCommand::WaitView { view, notify: tx });
        rx
    }

    /// Completion that fires once the log end reaches `logno`.
    pub fn at_store(&self, logno: LogNumber) -> Receiver<Result<LogNumber, VsrError>> {
        let (tx, rx) = unbounded();
        let _ = self
            .commands
            .send(NodeCommand::WaitStore { logno, notify: tx });
        rx
    }

    /// Completion that fires once the commit pointer reaches `logno`.
    pub fn at_commit(&self, logno: LogNumber) -> Receiver<Result<LogNumber, VsrError>> {
        let (tx, rx) = unbounded();
        let _ = self
            .commands
            .send(NodeCommand::WaitCommit { logno, notify: tx });
        rx
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReplicaStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Requests shutdown; pending waiters fail with the sentinel.
    pub fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown);
    }
}

// ============================================================================
// Timers
// ============================================================================

struct Timers {
    config: ProtocolConfig,
    rng: SmallRng,
    last_commit_broadcast: Instant,
    last_commit_received: Instant,
    keepalive_check_at: Instant,
    watchdog_at: Instant,
    /// View-change retry deadline, anchored to the pending view number.
    view_change: Option<(ViewNumber, Instant)>,
}

impl Timers {
    fn new(config: ProtocolConfig, now: Instant) -> Self {
        let mut timers = Self {
            rng: SmallRng::seed_from_u64(config.rng_seed ^ 0x7431),
            config,
            last_commit_broadcast: now,
            last_commit_received: now,
            keepalive_check_at: now,
            watchdog_at: now,
            view_change: None,
        };
        timers.watchdog_at = timers.next_watchdog(now);
        timers
    }

    /// Backup watchdog interval: `keepalive · (0.375 + U(0, 0.125))`.
    fn next_watchdog(&mut self, now: Instant) -> Instant {
        let factor = 0.375 + self.rng.gen::<f64>() * 0.125;
        now + self.config.primary_keepalive_timeout.mul_f64(factor)
    }

    /// View change budget: `view_change_timeout · (1 + U(0, 0.125))`.
    fn view_change_deadline(&mut self, now: Instant) -> Instant {
        let factor = 1.0 + self.rng.gen::<f64>() * 0.125;
        now + self.config.view_change_timeout.mul_f64(factor)
    }

    /// Collects expirations for the replica's current role.
    fn due(&mut self, replica: &Replica, now: Instant) -> Vec<TimeoutKind> {
        let mut fired = Vec::new();
        let keepalive = self.config.primary_keepalive_timeout;

        if replica.is_primary() && replica.cur_view().size() > 1 {
            if now >= self.keepalive_check_at {
                self.keepalive_check_at = now + keepalive / 4;
                if now.duration_since(self.last_commit_broadcast) >= keepalive / 2 {
                    fired.push(TimeoutKind::PrimaryKeepalive);
                }
            }
        } else if replica.is_backup() && !replica.in_view_change() {
            if now >= self.watchdog_at {
                self.watchdog_at = self.next_watchdog(now);
                if now.duration_since(self.last_commit_received) >= keepalive {
                    fired.push(TimeoutKind::BackupWatchdog);
                }
            }
        }

        if replica.in_view_change() {
            let pending = replica.next_view().view_number;
            match self.view_change {
                Some((view, _)) if view == pending => {}
                _ => self.view_change = Some((pending, self.view_change_deadline(now))),
            }
            if let Some((view, at)) = self.view_change {
                if now >= at {
                    self.view_change = Some((view, self.view_change_deadline(now)));
                    fired.push(TimeoutKind::ViewChange(view));
                }
            }
        } else {
            self.view_change = None;
        }

        fired
    }
}

// ============================================================================
// Waiters
// ============================================================================

#[derive(Default)]
struct Waiters {
    view: Vec<(ViewNumber, Sender<Result<ViewNumber, VsrError>>)>,
    store: Vec<(LogNumber, Sender<Result<LogNumber, VsrError>>)>,
    commit: Vec<(LogNumber, Sender<Result<LogNumber, VsrError>>)>,
}

impl Waiters {
    fn fire(&mut self, replica: &Replica) {
        let view_number = replica.view_number();
        self.view.retain(|(view, notify)| {
            if view_number >= *view {
                let _ = notify.send(Ok(view_number));
                false
            } else {
                true
            }
        });

        let last = replica.log().last();
        self.store.retain(|(logno, notify)| {
            if last >= *logno {
                let _ = notify.send(Ok(last));
                false
            } else {
                true
            }
        });

        let commit_no = replica.commit_no();
        self.commit.retain(|(logno, notify)| {
            if commit_no >= *logno {
                let _ = notify.send(Ok(commit_no));
                false
            } else {
                true
            }
        });
    }

    fn fail_all(&mut self) {
        for (_, notify) in self.view.drain(..) {
            let _ = notify.send(Err(VsrError::ShuttingDown));
        }
        for (_, notify) in self.store.drain(..) {
            let _ = notify.send(Err(VsrError::ShuttingDown));
        }
        for (_, notify) in self.commit.drain(..) {
            let _ = notify.send(Err(VsrError::ShuttingDown));
        }
    }
}

// ============================================================================
// Replica node
// ============================================================================

/// A replica running on its own event-loop thread.
pub struct ReplicaNode {
    handle: ReplicaHandle,
    thread: Option<JoinHandle<()>>,
}

impl ReplicaNode {
    /// Starts a replica over the given transport.
    pub fn start(uid: NodeUid, config: ProtocolConfig, transport: Box<dyn Transport>) -> Self {
        let (command_tx, command_rx) = unbounded();
        let status = Arc::new(RwLock::new(ReplicaStatus::default()));
        let handle = ReplicaHandle {
            commands: command_tx,
            status: Arc::clone(&status),
        };

        let thread = thread::Builder::new()
            .name(format!("moraine-replica-{uid}"))
            .spawn(move || {
                let mut event_loop = ReplicaLoop::new(uid, config, transport, command_rx, status);
                event_loop.run();
            })
            .expect("spawn replica thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }

    /// A cloneable handle to the running node.
    pub fn handle(&self) -> ReplicaHandle {
        self.handle.clone()
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ReplicaLoop {
    replica: Option<Replica>,
    manager: ConnectionManager,
    timers: Timers,
    commands: Receiver<NodeCommand>,
    status: Arc<RwLock<ReplicaStatus>>,
    waiters: Waiters,
    /// Messages awaiting a channel, flushed on connect.
    outbox: HashMap<NodeUid, Vec<Message>>,
    running: bool,
}

impl ReplicaLoop {
    fn new(
        uid: NodeUid,
        config: ProtocolConfig,
        transport: Box<dyn Transport>,
        commands: Receiver<NodeCommand>,
        status: Arc<RwLock<ReplicaStatus>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            replica: Some(Replica::new(uid, config)),
            manager: ConnectionManager::new(config, transport),
            timers: Timers::new(config, now),
            commands,
            status,
            waiters: Waiters::default(),
            outbox: HashMap::new(),
            running: true,
        }
    }

    fn replica(&self) -> &Replica {
        self.replica.as_ref().expect("replica present outside dispatch")
    }

    fn run(&mut self) {
        info!(replica = %self.replica().uid(), "event loop starting");
        self.publish_status();

        while self.running {
            let now = Instant::now();
            let mut worked = false;

            worked |= self.drain_commands(now);

            let events = self.manager.poll(now);
            worked |= !events.is_empty();
            for event in events {
                self.on_manager_event(event, now);
            }

            let fired = {
                let replica = self.replica.as_ref().expect("replica present");
                self.timers.due(replica, now)
            };
            for kind in fired {
                worked = true;
                self.dispatch(ReplicaEvent::Timeout(kind), now);
            }

            if !worked {
                thread::sleep(IDLE_SLEEP);
            }
        }

        self.waiters.fail_all();
        self.manager.shutdown();
        info!(replica = %self.replica().uid(), "event loop stopped");
    }

    fn drain_commands(&mut self, now: Instant) -> bool {
        let mut worked = false;
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    worked = true;
                    match command {
                        NodeCommand::Join { peer } => {
                            self.manager.connect(&peer, now);
                            self.dispatch(ReplicaEvent::StartJoin { peer }, now);
                        }
                        NodeCommand::Stop => {
                            if let Some(replica) = self.replica.as_mut() {
                                replica.stop();
                            }
                        }
                        NodeCommand::Resume => {
                            if let Some(replica) = self.replica.as_mut() {
                                replica.resume();
                            }
                        }
                        NodeCommand::WaitView { view, notify } => {
                            self.waiters.view.push((view, notify));
                            self.waiters.fire(self.replica.as_ref().expect("present"));
                        }
                        NodeCommand::WaitStore { logno, notify } => {
                            self.waiters.store.push((logno, notify));
                            self.waiters.fire(self.replica.as_ref().expect("present"));
                        }
                        NodeCommand::WaitCommit { logno, notify } => {
                            self.waiters.commit.push((logno, notify));
                            self.waiters.fire(self.replica.as_ref().expect("present"));
                        }
                        NodeCommand::Shutdown => {
                            self.running = false;
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Every handle is gone; nothing can reach us anymore.
                    self.running = false;
                    break;
                }
            }
        }
        worked
    }

    fn on_manager_event(&mut self, event: ManagerEvent, now: Instant) {
        match event {
            ManagerEvent::Connected(peer) => {
                if let Some(queued) = self.outbox.remove(&peer) {
                    for message in queued {
                        if self.manager.send(&peer, message).is_err() {
                            warn!(peer = %peer, "peer lost while flushing outbox");
                            break;
                        }
                    }
                }
            }
            ManagerEvent::Inbound { from, message } => {
                if matches!(message, Message::Commit(_)) {
                    self.timers.last_commit_received = now;
                }
                self.dispatch(ReplicaEvent::Inbound { from, message }, now);
            }
            ManagerEvent::Disconnected(peer) => {
                debug!(peer = %peer, "peer channel lost");
                // Reconnect lazily: the next queued send dials again.
            }
            ManagerEvent::ConnectFailed(peer) => {
                if self.outbox.contains_key(&peer) {
                    // Still wanted; try again (with fresh jitter).
                    self.manager.connect(&peer, now);
                }
            }
        }
    }

    fn dispatch(&mut self, event: ReplicaEvent, now: Instant) {
        let replica = self.replica.take().expect("replica present");
        let (replica, output) = replica.process(event);
        self.replica = Some(replica);

        for envelope in output.sends {
            if matches!(envelope.message, Message::Commit(_)) {
                self.timers.last_commit_broadcast = now;
            }
            if self.manager.send(&envelope.to, envelope.message.clone()).is_err() {
                let queued = self.outbox.entry(envelope.to.clone()).or_default();
                if queued.len() >= OUTBOX_LIMIT {
                    queued.remove(0);
                }
                queued.push(envelope.message);
                self.manager.connect(&envelope.to, now);
            }
        }

        self.waiters.fire(self.replica.as_ref().expect("present"));
        self.publish_status();
    }

    fn publish_status(&self) {
        let replica = self.replica();
        if let Ok(mut status) = self.status.write() {
            status.view_number = replica.view_number();
            status.in_view_change = replica.in_view_change();
            status.is_primary = replica.is_primary();
            status.members = replica.cur_view().size();
            status.commit_no = replica.commit_no();
            status.decide_no = replica.decide_no();
            status.log_last = replica.log().last();
            status.connected_peers = self.manager.connected_count();
        }
    }
}

// ============================================================================
// Client node
// ============================================================================

enum ClientCommand {
    Request {
        payload: Bytes,
        notify: Sender<Result<Bytes, VsrError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`ClientNode`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: Sender<ClientCommand>,
}

impl ClientHandle {
    /// Submits a request; the receiver yields the committed response.
    ///
    /// The request is retried until it commits; the only error is the
    /// shutdown sentinel.
    pub fn request(&self, payload: Bytes) -> Receiver<Result<Bytes, VsrError>> {
        let (tx, rx) = unbounded();
        let _ = self.commands.send(ClientCommand::Request {
            payload,
            notify: tx,
        });
        rx
    }

    /// Requests shutdown; pending requests fail with the sentinel.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
    }
}

/// A protocol client running on its own thread.
pub struct ClientNode {
    handle: ClientHandle,
    thread: Option<JoinHandle<()>>,
}

impl ClientNode {
    /// Starts a client over the given transport, pointed at a known replica.
    pub fn start(
        uid: NodeUid,
        config: ProtocolConfig,
        transport: Box<dyn Transport>,
        bootstrap: NodeUid,
    ) -> Self {
        let (command_tx, command_rx) = unbounded();
        let handle = ClientHandle {
            commands: command_tx,
        };

        let thread = thread::Builder::new()
            .name(format!("moraine-client-{uid}"))
            .spawn(move || {
                client_loop(uid, config, transport, bootstrap, command_rx);
            })
            .expect("spawn client thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }

    /// A cloneable handle to the running client.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }
}

impl Drop for ClientNode {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn client_loop(
    uid: NodeUid,
    config: ProtocolConfig,
    transport: Box<dyn Transport>,
    bootstrap: NodeUid,
    commands: Receiver<ClientCommand>,
) {
    let mut client = Client::new(uid, &config);
    client.bootstrap(bootstrap);
    let mut manager = ConnectionManager::new(config, transport);
    let mut notifies: HashMap<u64, Sender<Result<Bytes, VsrError>>> = HashMap::new();
    let mut retransmit_at = Instant::now() + config.client_message_timeout;
    let mut last_target: Option<NodeUid> = None;
    let mut running = true;

    while running {
        let now = Instant::now();
        let mut worked = false;

        // Keep a dial going toward the current target.
        if let Some(target) = client.target().cloned() {
            if last_target.as_ref() != Some(&target) {
                last_target = Some(target.clone());
                manager.connect(&target, now);
            }
        }

        loop {
            match commands.try_recv() {
                Ok(ClientCommand::Request { payload, notify }) => {
                    worked = true;
                    let (seqno, out) = client.request(payload);
                    notifies.insert(seqno, notify);
                    deliver_client_sends(&mut manager, out.sends, now);
                }
                Ok(ClientCommand::Shutdown) => {
                    running = false;
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    running = false;
                    break;
                }
            }
        }

        for event in manager.poll(now) {
            worked = true;
            match event {
                ManagerEvent::Connected(_) => {
                    client.connect_succeeded();
                    let out = client.retransmit();
                    deliver_client_sends(&mut manager, out.sends, now);
                }
                ManagerEvent::Inbound { from, message } => {
                    let out = client.on_message(&from, message);
                    for (seqno, payload) in out.completions {
                        if let Some(notify) = notifies.remove(&seqno) {
                            let _ = notify.send(Ok(payload));
                        }
                    }
                }
                ManagerEvent::Disconnected(_) => {}
                ManagerEvent::ConnectFailed(peer) => {
                    if client.target() == Some(&peer) {
                        if let Some(next) = client.connect_failed() {
                            last_target = Some(next.clone());
                            manager.connect(&next, now);
                        }
                    }
                }
            }
        }

        if now >= retransmit_at {
            retransmit_at = now + config.client_message_timeout;
            let out = client.retransmit();
            if !out.sends.is_empty() {
                worked = true;
                deliver_client_sends(&mut manager, out.sends, now);
            }
        }

        if !worked {
            thread::sleep(IDLE_SLEEP);
        }
    }

    for (_, notify) in notifies.drain() {
        let _ = notify.send(Err(VsrError::ShuttingDown));
    }
    manager.shutdown();
}

/// Sends client messages, dialing targets that lack a channel.
///
/// Undeliverable messages are simply dropped: the retransmission timer is
/// the client's recovery mechanism, so there is no outbox to keep coherent.
fn deliver_client_sends(
    manager: &mut ConnectionManager,
    sends: Vec<crate::replica::Envelope>,
    now: Instant,
) {
    for envelope in sends {
        if manager.send(&envelope.to, envelope.message).is_err() {
            manager.connect(&envelope.to, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryNetwork;

    fn uid(s: &str) -> NodeUid {
        NodeUid::new(s)
    }

    fn config(seed: u64) -> ProtocolConfig {
        ProtocolConfig::development().with_seed(seed)
    }

    const WAIT: Duration = Duration::from_secs(20);

    #[test]
    fn join_and_serve_end_to_end() {
        let net = MemoryNetwork::new(11);

        let n0 = ReplicaNode::start(
            uid("n0"),
            config(1),
            Box::new(net.endpoint(uid("n0"))),
        );
        let n1 = ReplicaNode::start(
            uid("n1"),
            config(2),
            Box::new(net.endpoint(uid("n1"))),
        );

        // n0 announces itself to n1; both converge on view 1.
        let n0_at_v1 = n0.handle().at_view(ViewNumber::new(1));
        let n1_at_v1 = n1.handle().at_view(ViewNumber::new(1));
        n0.handle().join(uid("n1"));

        let v0 = n0_at_v1.recv_timeout(WAIT).expect("n0 waiter").expect("n0 view");
        let v1 = n1_at_v1.recv_timeout(WAIT).expect("n1 waiter").expect("n1 view");
        assert!(v0 >= ViewNumber::new(1));
        assert!(v1 >= ViewNumber::new(1));

        let status = n0.handle().status();
        assert_eq!(status.members, 2);

        // A client bootstrapped at a backup is steered to the primary and
        // still gets its answer.
        let client = ClientNode::start(
            uid("c0"),
            config(3),
            Box::new(net.endpoint(uid("c0"))),
            uid("n1"),
        );

        let response = client
            .handle()
            .request(Bytes::from_static(b"hello"))
            .recv_timeout(WAIT)
            .expect("client completion")
            .expect("committed response");
        assert_eq!(response, Bytes::from_static(b"hello"));

        // Both replicas eventually hold the committed entry.
        let stored = n1.handle().at_store(LogNumber::new(1));
        stored.recv_timeout(WAIT).expect("stored").expect("log grew");
    }

    #[test]
    fn shutdown_fails_pending_waiters() {
        let net = MemoryNetwork::new(12);
        let n0 = ReplicaNode::start(
            uid("n0"),
            config(1),
            Box::new(net.endpoint(uid("n0"))),
        );

        let waiter = n0.handle().at_view(ViewNumber::new(9));
        n0.handle().shutdown();

        let result = waiter.recv_timeout(WAIT).expect("waiter resolved");
        assert!(matches!(result, Err(VsrError::ShuttingDown)));
    }

    #[test]
    fn status_reflects_singular_primary() {
        let net = MemoryNetwork::new(13);
        let n0 = ReplicaNode::start(
            uid("n0"),
            config(1),
            Box::new(net.endpoint(uid("n0"))),
        );

        // Give the loop a moment to publish.
        let deadline = Instant::now() + WAIT;
        loop {
            let status = n0.handle().status();
            if status.is_primary && status.members == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "status never published");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
