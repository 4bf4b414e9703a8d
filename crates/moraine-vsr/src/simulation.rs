//! Deterministic simulation of whole clusters.
//!
//! Drives the pure replica and client state machines under a virtual clock
//! with a seeded RNG: message delays, loss, partitions, and crashes are all
//! reproducible from the seed. The harness re-implements the driver's timer
//! rules against virtual time, so every protocol path that runs in
//! production runs here, minus the sockets.
//!
//! Invariants checked over executions:
//!
//! 1. Agreement on the committed prefix across replicas
//! 2. Monotone, ordered log pointers per replica
//! 3. Decide implies full replication
//! 4. Commit implies quorum replication
//! 5. At most one primary per view
//! 6. Per-member acknowledged positions never decrease (enforced in
//!    `View::account_ack`; exercised constantly here)

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use moraine_types::{LogNumber, NodeUid, ViewNumber};
use moraine_wire::Message;

use crate::client::Client;
use crate::config::ProtocolConfig;
use crate::replica::{Replica, ReplicaEvent, TimeoutKind};

// ============================================================================
// Simulated nodes
// ============================================================================

/// Virtual-time driver state for one replica.
struct SimReplica {
    replica: Option<Replica>,
    last_commit_broadcast: u64,
    last_commit_received: u64,
    keepalive_check_at: u64,
    watchdog_at: u64,
    view_change: Option<(ViewNumber, u64)>,
    /// Monotonicity tracking for invariant 2.
    watermarks: (LogNumber, LogNumber, LogNumber, LogNumber),
}

/// Virtual-time driver state for one client.
struct SimClient {
    client: Client,
    retransmit_at: u64,
    completions: Vec<(u64, Bytes)>,
}

struct Delivery {
    at: u64,
    from: NodeUid,
    to: NodeUid,
    message: Message,
}

// ============================================================================
// The simulation
// ============================================================================

struct Sim {
    config: ProtocolConfig,
    time: u64,
    rng: SmallRng,
    replicas: BTreeMap<NodeUid, SimReplica>,
    clients: BTreeMap<NodeUid, SimClient>,
    /// In-flight messages ordered by `(delivery time, enqueue order)`.
    in_flight: BTreeMap<(u64, u64), Delivery>,
    enqueue_seq: u64,
    loss: f64,
    blocked: HashSet<(NodeUid, NodeUid)>,
    dead: HashSet<NodeUid>,
}

impl Sim {
    fn new(seed: u64) -> Self {
        Self {
            config: ProtocolConfig::simulation().with_seed(seed),
            time: 0,
            rng: SmallRng::seed_from_u64(seed),
            replicas: BTreeMap::new(),
            clients: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            enqueue_seq: 0,
            loss: 0.0,
            blocked: HashSet::new(),
            dead: HashSet::new(),
        }
    }

    fn uid(name: &str) -> NodeUid {
        NodeUid::new(name)
    }

    fn add_replica(&mut self, name: &str) {
        let uid = Self::uid(name);
        let replica = Replica::new(uid.clone(), self.config);
        let watchdog_at = self.watchdog_interval();
        self.replicas.insert(
            uid,
            SimReplica {
                replica: Some(replica),
                last_commit_broadcast: self.time,
                last_commit_received: self.time,
                keepalive_check_at: self.time,
                watchdog_at: self.time + watchdog_at,
                view_change: None,
                watermarks: Default::default(),
            },
        );
    }

    fn add_client(&mut self, name: &str, bootstrap: &str) {
        let uid = Self::uid(name);
        let mut client = Client::new(uid.clone(), &self.config);
        client.bootstrap(Self::uid(bootstrap));
        self.clients.insert(
            uid,
            SimClient {
                client,
                retransmit_at: self.time + self.config.client_message_timeout.as_millis() as u64,
                completions: Vec::new(),
            },
        );
    }

    fn watchdog_interval(&mut self) -> u64 {
        let keepalive = self.config.primary_keepalive_timeout.as_millis() as f64;
        (keepalive * (0.375 + self.rng.gen::<f64>() * 0.125)).ceil() as u64
    }

    fn view_change_budget(&mut self) -> u64 {
        let budget = self.config.view_change_timeout.as_millis() as f64;
        (budget * (1.0 + self.rng.gen::<f64>() * 0.125)).ceil() as u64
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    fn enqueue(&mut self, from: NodeUid, to: NodeUid, message: Message) {
        if self.dead.contains(&to) || self.dead.contains(&from) {
            return;
        }
        if self.blocked.contains(&(from.clone(), to.clone())) {
            return;
        }
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            return;
        }
        let delay = 1 + self.rng.gen_range(0..3);
        self.enqueue_seq += 1;
        self.in_flight.insert(
            (self.time + delay, self.enqueue_seq),
            Delivery {
                at: self.time + delay,
                from,
                to,
                message,
            },
        );
    }

    fn dispatch_replica(&mut self, uid: &NodeUid, event: ReplicaEvent) {
        let Some(node) = self.replicas.get_mut(uid) else {
            return;
        };
        let replica = node.replica.take().expect("replica present");
        let (replica, output) = replica.process(event);
        node.replica = Some(replica);

        let mut any_commit = false;
        let sends: Vec<_> = output.sends;
        for envelope in &sends {
            if matches!(envelope.message, Message::Commit(_)) {
                any_commit = true;
            }
        }
        if any_commit {
            self.replicas
                .get_mut(uid)
                .expect("present")
                .last_commit_broadcast = self.time;
        }
        for envelope in sends {
            self.enqueue(uid.clone(), envelope.to, envelope.message);
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let Delivery {
            from, to, message, ..
        } = delivery;

        if self.replicas.contains_key(&to) {
            if matches!(message, Message::Commit(_)) {
                self.replicas.get_mut(&to).expect("present").last_commit_received = self.time;
            }
            self.dispatch_replica(&to.clone(), ReplicaEvent::Inbound { from, message });
        } else if let Some(sim_client) = self.clients.get_mut(&to) {
            let out = sim_client.client.on_message(&from, message);
            sim_client.completions.extend(out.completions);
            for envelope in out.sends {
                self.enqueue(to.clone(), envelope.to, envelope.message);
            }
        }
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    fn step(&mut self) {
        self.time += 1;

        // Due deliveries, in enqueue order for equal times.
        let due: Vec<(u64, u64)> = self
            .in_flight
            .range(..=(self.time, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            let delivery = self.in_flight.remove(&key).expect("key present");
            debug_assert!(delivery.at <= self.time);
            if self.dead.contains(&delivery.to) {
                continue;
            }
            self.deliver(delivery);
        }

        // Replica timers.
        let uids: Vec<NodeUid> = self.replicas.keys().cloned().collect();
        for uid in uids {
            if self.dead.contains(&uid) {
                continue;
            }
            for kind in self.replica_timeouts(&uid) {
                self.dispatch_replica(&uid, ReplicaEvent::Timeout(kind));
            }
        }

        // Client retransmissions. A dead target models as a failed connect,
        // so the every-8th-retry random-member fallback gets exercised.
        let clients: Vec<NodeUid> = self.clients.keys().cloned().collect();
        for uid in clients {
            let timeout = self.config.client_message_timeout.as_millis() as u64;
            let target_dead = {
                let sim_client = self.clients.get(&uid).expect("present");
                sim_client
                    .client
                    .target()
                    .map_or(false, |t| self.dead.contains(t))
            };
            let sim_client = self.clients.get_mut(&uid).expect("present");
            if self.time >= sim_client.retransmit_at {
                sim_client.retransmit_at = self.time + timeout;
                if target_dead {
                    let _ = sim_client.client.connect_failed();
                }
                let out = sim_client.client.retransmit();
                for envelope in out.sends {
                    self.enqueue(uid.clone(), envelope.to, envelope.message);
                }
            }
        }

        self.check_invariants();
    }

    fn replica_timeouts(&mut self, uid: &NodeUid) -> Vec<TimeoutKind> {
        let keepalive = self.config.primary_keepalive_timeout.as_millis() as u64;
        let next_watchdog = self.watchdog_interval();
        let next_budget = self.view_change_budget();

        let node = self.replicas.get_mut(uid).expect("present");
        let replica = node.replica.as_ref().expect("present");
        let mut fired = Vec::new();

        if replica.is_primary() && replica.cur_view().size() > 1 {
            if self.time >= node.keepalive_check_at {
                node.keepalive_check_at = self.time + (keepalive / 4).max(1);
                if self.time - node.last_commit_broadcast >= keepalive / 2 {
                    fired.push(TimeoutKind::PrimaryKeepalive);
                }
            }
        } else if replica.is_backup() && !replica.in_view_change() {
            if self.time >= node.watchdog_at {
                node.watchdog_at = self.time + next_watchdog;
                if self.time - node.last_commit_received >= keepalive {
                    fired.push(TimeoutKind::BackupWatchdog);
                }
            }
        }

        if replica.in_view_change() {
            let pending = replica.next_view().view_number;
            match node.view_change {
                Some((view, _)) if view == pending => {}
                _ => node.view_change = Some((pending, self.time + next_budget)),
            }
            if let Some((view, at)) = node.view_change {
                if self.time >= at {
                    node.view_change = Some((view, self.time + next_budget));
                    fired.push(TimeoutKind::ViewChange(view));
                }
            }
        } else {
            node.view_change = None;
        }

        fired
    }

    fn run(&mut self, millis: u64) {
        for _ in 0..millis {
            self.step();
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    fn join(&mut self, who: &str, peer: &str) {
        self.dispatch_replica(
            &Self::uid(who),
            ReplicaEvent::StartJoin {
                peer: Self::uid(peer),
            },
        );
    }

    fn request(&mut self, who: &str, payload: Bytes) -> u64 {
        let uid = Self::uid(who);
        let sim_client = self.clients.get_mut(&uid).expect("client exists");
        let (seqno, out) = sim_client.client.request(payload);
        for envelope in out.sends {
            self.enqueue(uid.clone(), envelope.to, envelope.message);
        }
        seqno
    }

    fn kill(&mut self, name: &str) {
        self.dead.insert(Self::uid(name));
    }

    /// Blocks all traffic between the two groups, both directions.
    fn partition(&mut self, left: &[&str], right: &[&str]) {
        for l in left {
            for r in right {
                self.blocked.insert((Self::uid(l), Self::uid(r)));
                self.blocked.insert((Self::uid(r), Self::uid(l)));
            }
        }
    }

    fn heal(&mut self) {
        self.blocked.clear();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    fn replica(&self, name: &str) -> &Replica {
        self.replicas[&Self::uid(name)]
            .replica
            .as_ref()
            .expect("present")
    }

    fn completions(&self, name: &str) -> &[(u64, Bytes)] {
        &self.clients[&Self::uid(name)].completions
    }

    fn live_replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas
            .iter()
            .filter(|(uid, _)| !self.dead.contains(*uid))
            .map(|(_, node)| node.replica.as_ref().expect("present"))
    }

    fn converged(&self, size: usize) -> bool {
        let mut views = HashSet::new();
        for replica in self.live_replicas() {
            if replica.in_view_change() || replica.cur_view().size() != size {
                return false;
            }
            views.insert(replica.view_number().as_u64());
        }
        views.len() == 1
    }

    /// Builds a converged cluster of the given members via sequential joins.
    fn converge_cluster(&mut self, names: &[&str]) {
        self.add_replica(names[0]);
        for pair in names.windows(2) {
            self.add_replica(pair[1]);
            self.join(pair[1], pair[0]);
            for _ in 0..2000 {
                self.step();
                if self.converged(self.replicas.len() - self.dead.len()) {
                    break;
                }
            }
            assert!(
                self.converged(self.replicas.len() - self.dead.len()),
                "cluster failed to absorb {}",
                pair[1]
            );
        }
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    fn check_invariants(&mut self) {
        let replicas: Vec<(&NodeUid, &SimReplica)> = self
            .replicas
            .iter()
            .filter(|(uid, _)| !self.dead.contains(*uid))
            .collect();

        // 2. Pointer ordering per replica.
        for (uid, node) in &replicas {
            let r = node.replica.as_ref().expect("present");
            assert!(r.decide_no() <= r.commit_no(), "{uid}: decide > commit");
            assert!(r.commit_no() <= r.log().last(), "{uid}: commit > last");
            assert!(r.decide_no() <= r.ack_no(), "{uid}: decide > ack");
            assert!(r.ack_no() <= r.sack_no(), "{uid}: ack > sack");
            assert!(r.sack_no() <= r.log().last(), "{uid}: sack > last");
            assert!(r.log().first() <= r.decide_no(), "{uid}: first > decide");
        }

        // 1. Agreement below the common committed prefix.
        for (i, (_, a)) in replicas.iter().enumerate() {
            for (_, b) in replicas.iter().skip(i + 1) {
                let ra = a.replica.as_ref().expect("present");
                let rb = b.replica.as_ref().expect("present");
                let bound = ra.commit_no().min(rb.commit_no());
                for (logno, item_a) in ra.log().iter_from(ra.log().first()) {
                    if logno >= bound {
                        break;
                    }
                    if let Some(item_b) = rb.log().get(logno) {
                        if item_a.is_real() && item_b.is_real() {
                            assert_eq!(
                                item_a, item_b,
                                "committed logs disagree at {logno}"
                            );
                        }
                    }
                }
            }
        }

        // 3. Decide implies full replication among replicas spanning it.
        let max_decide = replicas
            .iter()
            .map(|(_, n)| n.replica.as_ref().expect("present").decide_no())
            .max();
        if let Some(max_decide) = max_decide {
            for (_, witness) in &replicas {
                let rw = witness.replica.as_ref().expect("present");
                for (logno, item) in rw.log().iter_from(rw.log().first()) {
                    if logno >= max_decide {
                        break;
                    }
                    for (uid, other) in &replicas {
                        let ro = other.replica.as_ref().expect("present");
                        if let Some(theirs) = ro.log().get(logno) {
                            if item.is_real() && theirs.is_real() {
                                assert_eq!(item, theirs, "{uid} differs at decided {logno}");
                            }
                        }
                    }
                }
            }
        }

        // 5. At most one primary per view number.
        let mut primaries: BTreeMap<u64, usize> = BTreeMap::new();
        for (_, node) in &replicas {
            let r = node.replica.as_ref().expect("present");
            if r.cur_view().i_am_primary() {
                *primaries.entry(r.view_number().as_u64()).or_insert(0) += 1;
            }
        }
        for (view, count) in primaries {
            assert!(count <= 1, "view {view} has {count} primaries");
        }

        // 2 (continued). Monotonicity against recorded watermarks. `sack_no`
        // is exempt: truncating a placeholder tail at view adoption can pull
        // it back to the shrunken log end.
        let uids: Vec<NodeUid> = replicas.iter().map(|(u, _)| (*u).clone()).collect();
        for uid in uids {
            let node = self.replicas.get_mut(&uid).expect("present");
            let r = node.replica.as_ref().expect("present");
            let (decide, commit, ack, _) = node.watermarks;
            assert!(r.decide_no() >= decide, "{uid}: decide went backwards");
            assert!(r.commit_no() >= commit, "{uid}: commit went backwards");
            assert!(r.ack_no() >= ack, "{uid}: ack went backwards");
            node.watermarks = (r.decide_no(), r.commit_no(), r.ack_no(), r.sack_no());
        }
    }

    /// 4. Commit implies quorum replication, checked at quiescent points.
    fn check_commit_quorum(&self) {
        for witness in self.live_replicas() {
            let quorum = witness.cur_view().quorum();
            for (logno, item) in witness.log().iter_from(witness.log().first()) {
                if logno >= witness.commit_no() {
                    break;
                }
                if !item.is_real() {
                    continue;
                }
                let holders = self
                    .live_replicas()
                    .filter(|r| r.log().get(logno) == Some(item))
                    .count();
                assert!(
                    holders >= quorum,
                    "committed {logno} held by {holders} < quorum {quorum}"
                );
            }
        }
    }
}

// ============================================================================
// Scenario tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_node_commit_with_client() {
        let mut sim = Sim::new(42);
        sim.converge_cluster(&["n0", "n1", "n2"]);

        let primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();

        sim.add_client("c0", primary.as_str());
        let seqno = sim.request("c0", Bytes::from_static(b"x"));
        sim.run(200);

        let completions = sim.completions("c0");
        assert_eq!(completions, &[(seqno, Bytes::from_static(b"x"))]);

        // Every replica stored and committed the entry.
        for replica in sim.live_replicas() {
            assert_eq!(replica.log().last(), LogNumber::new(1), "{}", replica.uid());
            assert_eq!(replica.commit_no(), LogNumber::new(1), "{}", replica.uid());
        }
        sim.check_commit_quorum();
    }

    #[test]
    fn client_bootstrapped_at_backup_is_steered() {
        let mut sim = Sim::new(7);
        sim.converge_cluster(&["n0", "n1", "n2"]);

        let backup = sim
            .live_replicas()
            .find(|r| !r.cur_view().i_am_primary())
            .expect("a backup")
            .uid()
            .clone();

        sim.add_client("c0", backup.as_str());
        let seqno = sim.request("c0", Bytes::from_static(b"steered"));
        sim.run(400);

        assert_eq!(
            sim.completions("c0"),
            &[(seqno, Bytes::from_static(b"steered"))]
        );
    }

    #[test]
    fn primary_failure_elects_replacement() {
        let mut sim = Sim::new(99);
        sim.converge_cluster(&["n0", "n1", "n2", "n3", "n4"]);

        let old_primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();
        let old_view = sim.live_replicas().next().unwrap().view_number();

        sim.kill(old_primary.as_str());
        sim.run(2000);

        let survivors: Vec<&Replica> = sim.live_replicas().collect();
        assert_eq!(survivors.len(), 4);
        let new_primary = survivors
            .iter()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a replacement primary");
        assert!(new_primary.view_number() > old_view);
        for replica in &survivors {
            assert!(!replica.in_view_change(), "{} stuck", replica.uid());
            assert_eq!(replica.view_number(), new_primary.view_number());
        }
    }

    #[test]
    fn failed_over_cluster_still_serves() {
        let mut sim = Sim::new(5);
        sim.converge_cluster(&["n0", "n1", "n2"]);

        let primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();

        sim.add_client("c0", primary.as_str());
        let first = sim.request("c0", Bytes::from_static(b"before"));
        sim.run(200);
        assert_eq!(sim.completions("c0").len(), 1);

        sim.kill(primary.as_str());
        sim.run(2000);

        let second = sim.request("c0", Bytes::from_static(b"after"));
        sim.run(2000);

        let completions = sim.completions("c0");
        assert_eq!(
            completions,
            &[
                (first, Bytes::from_static(b"before")),
                (second, Bytes::from_static(b"after")),
            ]
        );
        sim.check_commit_quorum();
    }

    #[test]
    fn lagging_backup_catches_up_via_sack() {
        let mut sim = Sim::new(21);
        sim.converge_cluster(&["n0", "n1", "n2"]);

        let primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();
        let laggard = sim
            .live_replicas()
            .find(|r| !r.cur_view().i_am_primary())
            .expect("a backup")
            .uid()
            .clone();

        // Cut the laggard off in both directions and commit traffic through
        // the remaining quorum.
        let others: Vec<&str> = ["n0", "n1", "n2"]
            .into_iter()
            .filter(|n| *n != laggard.as_str())
            .collect();
        sim.partition(&[laggard.as_str()], &others);

        sim.add_client("c0", primary.as_str());
        for payload in [b"a" as &[u8], b"b", b"c", b"d"] {
            sim.request("c0", Bytes::copy_from_slice(payload));
            sim.run(100);
        }
        assert_eq!(sim.completions("c0").len(), 4);
        assert_eq!(sim.replica(laggard.as_str()).log().last(), LogNumber::ZERO);

        // Heal; keepalives and selective retransmission fill the gap.
        sim.heal();
        sim.run(500);

        let laggard_replica = sim.replica(laggard.as_str());
        assert_eq!(laggard_replica.log().last(), LogNumber::new(4));
        assert_eq!(laggard_replica.ack_no(), LogNumber::new(4));
        sim.check_commit_quorum();
    }

    #[test]
    fn split_quorum_stalls_and_heals() {
        let mut sim = Sim::new(1234);
        sim.converge_cluster(&["n0", "n1", "n2", "n3", "n4", "n5"]);

        let primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();

        // Split 3 | 3 with the primary in the second half.
        let mut left: Vec<&str> = Vec::new();
        let mut right: Vec<&str> = vec![primary.as_str()];
        for name in ["n0", "n1", "n2", "n3", "n4", "n5"] {
            if name == primary.as_str() {
                continue;
            }
            if right.len() < 3 {
                right.push(name);
            } else {
                left.push(name);
            }
        }
        let commits_before: Vec<LogNumber> =
            sim.live_replicas().map(Replica::commit_no).collect();

        sim.partition(&left, &right);

        // Traffic into the primary's half cannot commit: 3 of 6 is not a
        // strict majority.
        sim.add_client("c0", primary.as_str());
        sim.request("c0", Bytes::from_static(b"split"));
        sim.run(1500);

        assert!(sim.completions("c0").is_empty(), "no commit during split");
        for (replica, before) in sim.live_replicas().zip(&commits_before) {
            assert_eq!(replica.commit_no(), *before, "{} advanced", replica.uid());
        }

        // Heal: a view change completes and the stalled request commits.
        sim.heal();
        sim.run(4000);

        assert_eq!(sim.completions("c0").len(), 1, "request settles after heal");
        let stable = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary after heal");
        assert!(!stable.in_view_change());
        sim.check_commit_quorum();
    }

    #[test]
    fn lossy_network_still_converges() {
        let mut sim = Sim::new(77);
        sim.converge_cluster(&["n0", "n1", "n2"]);

        let primary = sim
            .live_replicas()
            .find(|r| r.cur_view().i_am_primary())
            .expect("a primary")
            .uid()
            .clone();
        sim.add_client("c0", primary.as_str());

        sim.loss = 0.1;
        let mut expected = Vec::new();
        for payload in [b"p1" as &[u8], b"p2", b"p3"] {
            let payload = Bytes::copy_from_slice(payload);
            let seqno = sim.request("c0", payload.clone());
            expected.push((seqno, payload));
            sim.run(300);
        }
        sim.loss = 0.0;
        sim.run(1000);

        let mut completions = sim.completions("c0").to_vec();
        completions.sort_by_key(|(s, _)| *s);
        assert_eq!(completions, expected);
        sim.check_commit_quorum();
    }

    #[test]
    fn rejoining_replica_adopts_current_view() {
        let mut sim = Sim::new(3);
        sim.converge_cluster(&["n0", "n1", "n2"]);
        let view = sim.replica("n0").view_number();

        // A join from an existing member's uid is absorbed without a view
        // bump (it is already in the next view).
        sim.join("n2", "n0");
        sim.run(300);

        for replica in sim.live_replicas() {
            assert_eq!(replica.view_number(), view, "{} moved", replica.uid());
        }
    }
}
