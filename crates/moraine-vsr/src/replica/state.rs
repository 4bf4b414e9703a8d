//! Replica state structure and shared machinery.
//!
//! This module holds [`Replica`] itself, the event dispatch, and the helpers
//! shared between the normal-operation and view-change handlers: commit
//! construction, commit/decide advancement, and log-extension merging.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, info, trace};

use moraine_types::{LogNumber, NodeUid, ViewNumber};
use moraine_wire::{Commit, LogExtension, Message, Response, Seq, WireLogItem};

use crate::config::ProtocolConfig;
use crate::log::{Log, LogItem, Overwrite};
use crate::view::View;

use super::{Output, ReplicaEvent, TimeoutKind};

// ============================================================================
// Replica
// ============================================================================

/// The state of one replica.
///
/// # Invariants
///
/// - `decide_no <= commit_no <= log.last()`
/// - `decide_no <= ack_no <= sack_no <= log.last()`
/// - `next_view.view_number >= cur_view.view_number`; the two are equal
///   except during a view change
/// - `decide_no`, `commit_no`, and `ack_no` are monotone over the replica's
///   lifetime; `sack_no` is monotone except when a placeholder tail is
///   truncated at view adoption
#[derive(Debug, Clone)]
pub struct Replica {
    /// This replica's identity.
    pub(crate) uid: NodeUid,

    /// Timing configuration (carried for drivers; the pure machine itself
    /// never reads a clock).
    pub(crate) config: ProtocolConfig,

    /// The view currently serving.
    pub(crate) cur_view: View,

    /// The view being negotiated; equals `cur_view` when stable.
    pub(crate) next_view: View,

    /// The replicated log.
    pub(crate) log: Log,

    /// Every live member stores up to here; safe to truncate below.
    pub(crate) decide_no: LogNumber,

    /// A quorum stores up to here; safe to reply to clients.
    pub(crate) commit_no: LogNumber,

    /// Longest contiguous stored prefix (meaningful on backups).
    pub(crate) ack_no: LogNumber,

    /// Furthest position seen, for selective retransmission.
    pub(crate) sack_no: LogNumber,

    /// Test hook: drop all inbound traffic while set.
    pub(crate) stopped: bool,

    /// Whether we already confirmed the pending view change.
    pub(crate) confirm_sent: bool,

    /// Highest committed seqno per client, for duplicate suppression after
    /// the log's front has been truncated past the committed item.
    pub(crate) client_tally: BTreeMap<NodeUid, u64>,

    /// Outgoing send sequence counter.
    seq: Seq,
}

impl Replica {
    /// Creates a replica in a singular view of itself.
    pub fn new(uid: NodeUid, config: ProtocolConfig) -> Self {
        let view = View::singular(uid.clone());
        Self {
            uid,
            config,
            cur_view: view.clone(),
            next_view: view,
            log: Log::new(),
            decide_no: LogNumber::ZERO,
            commit_no: LogNumber::ZERO,
            ack_no: LogNumber::ZERO,
            sack_no: LogNumber::ZERO,
            stopped: false,
            confirm_sent: false,
            client_tally: BTreeMap::new(),
            seq: 0,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// This replica's uid.
    pub fn uid(&self) -> &NodeUid {
        &self.uid
    }

    /// Timing configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// The view currently serving.
    pub fn cur_view(&self) -> &View {
        &self.cur_view
    }

    /// The view being negotiated.
    pub fn next_view(&self) -> &View {
        &self.next_view
    }

    /// The replicated log.
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Every live member stores up to here.
    pub fn decide_no(&self) -> LogNumber {
        self.decide_no
    }

    /// A quorum stores up to here.
    pub fn commit_no(&self) -> LogNumber {
        self.commit_no
    }

    /// Longest contiguous stored prefix.
    pub fn ack_no(&self) -> LogNumber {
        self.ack_no
    }

    /// Furthest position seen.
    pub fn sack_no(&self) -> LogNumber {
        self.sack_no
    }

    /// The serving view's number.
    pub fn view_number(&self) -> ViewNumber {
        self.cur_view.view_number
    }

    /// True while a view change is in progress.
    pub fn in_view_change(&self) -> bool {
        self.next_view.view_number != self.cur_view.view_number
    }

    /// True if this replica is the serving view's primary and stable.
    pub fn is_primary(&self) -> bool {
        self.cur_view.i_am_primary() && !self.in_view_change()
    }

    /// True if this replica is a non-primary member of the serving view.
    pub fn is_backup(&self) -> bool {
        self.cur_view.my_index.is_some() && !self.cur_view.i_am_primary()
    }

    /// Makes the replica drop all inbound traffic (test hook).
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Undoes [`stop`](Replica::stop).
    pub fn resume(&mut self) {
        self.stopped = false;
    }

    /// True while the replica is dropping inbound traffic.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Next outgoing send sequence.
    pub(crate) fn next_seq(&mut self) -> Seq {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Processes one event and returns the new state and its output.
    ///
    /// The machine is pure: the caller sends the output's messages and owns
    /// every timer. A handler runs to completion before the next event is
    /// observed, so multi-step updates are atomic from peers' point of view.
    pub fn process(self, event: ReplicaEvent) -> (Self, Output) {
        match event {
            ReplicaEvent::Inbound { from, message } => self.on_message(from, message),
            ReplicaEvent::Timeout(kind) => self.on_timeout(kind),
            ReplicaEvent::StartJoin { peer } => self.on_start_join(peer),
        }
    }

    /// Routes an inbound message to its handler.
    fn on_message(self, from: NodeUid, message: Message) -> (Self, Output) {
        if self.stopped {
            trace!(replica = %self.uid, from = %from, msg = message.name(), "stopped; dropping");
            return (self, Output::empty());
        }

        match message {
            Message::Request(request) => self.on_request(from, request),
            Message::Commit(commit) => self.on_commit(from, commit),
            Message::Ack(ack) => self.on_ack(from, ack),
            Message::Join(join) => self.on_join(from, join),
            Message::View(view) => self.on_view(from, view),

            // Handshakes belong to the connection manager; responses and
            // errors carry nothing a replica acts on.
            Message::Handshake(_)
            | Message::HandshakeAck(_)
            | Message::Response(_)
            | Message::Error(_) => {
                debug!(replica = %self.uid, from = %from, msg = message.name(), "ignoring");
                (self, Output::empty())
            }
        }
    }

    /// Routes a timer expiration to its handler.
    fn on_timeout(self, kind: TimeoutKind) -> (Self, Output) {
        if self.stopped {
            return (self, Output::empty());
        }
        match kind {
            TimeoutKind::PrimaryKeepalive => self.on_primary_keepalive(),
            TimeoutKind::BackupWatchdog => self.on_backup_watchdog(),
            TimeoutKind::ViewChange(view) => self.on_view_change_timeout(view),
        }
    }

    // ========================================================================
    // Commit construction
    // ========================================================================

    /// Builds a commit for one backup, filling its log from `fill_from`.
    pub(crate) fn build_commit(&mut self, fill_from: LogNumber) -> Message {
        let last = self.log.last();
        self.build_commit_range(fill_from, last)
    }

    /// Builds a commit carrying `[fill_from, fill_to)`, clamped to the log.
    pub(crate) fn build_commit_range(
        &mut self,
        fill_from: LogNumber,
        fill_to: LogNumber,
    ) -> Message {
        let view_number = self.cur_view.view_number;
        let start = if fill_from < self.log.first() {
            self.log.first()
        } else {
            fill_from
        };
        let end = if fill_to > self.log.last() {
            self.log.last()
        } else {
            fill_to
        };

        let extension = if start < end {
            let entries: Vec<WireLogItem> = self
                .log
                .iter_from(start)
                .take_while(|(logno, _)| *logno < end)
                .map(|(_, item)| {
                    let delta = view_number.delta(item.view_number);
                    debug_assert!(delta >= 0, "log item from a future view");
                    WireLogItem {
                        view_delta: delta as u64,
                        client_uid: item.client_uid.clone(),
                        client_seqno: item.client_seqno,
                        payload: item.payload.clone(),
                    }
                })
                .collect();
            Some(LogExtension { start, entries })
        } else {
            None
        };

        Message::Commit(Commit {
            seq: self.next_seq(),
            view_number,
            commit_no: self.commit_no,
            decide_delta: self.commit_no.delta(self.decide_no) as u64,
            extension,
        })
    }

    /// The position a member's log should be filled from.
    ///
    /// Normally the member's acknowledged prefix; lowered to the recorded
    /// divergence point after a view change merged a conflicting segment.
    pub(crate) fn fill_point(&self, member_index: usize) -> LogNumber {
        let member = &self.cur_view.members[member_index];
        let mut fill = member.ackno.unwrap_or(self.log.first());
        if let Some(matching) = member.matching_logno {
            if matching < fill {
                fill = matching;
            }
        }
        fill
    }

    // ========================================================================
    // Commit / decide advancement
    // ========================================================================

    /// Advances `commit_no` toward `upto`, clamped to the log end. Silent:
    /// backups move the pointer without talking to clients.
    pub(crate) fn advance_commit(&mut self, upto: LogNumber) {
        let target = if upto > self.log.last() {
            self.log.last()
        } else {
            upto
        };
        if target <= self.commit_no {
            return;
        }

        for (logno, item) in self.log.iter_from(self.commit_no) {
            if logno >= target {
                break;
            }
            if item.is_real() {
                let tally = self.client_tally.entry(item.client_uid.clone()).or_insert(0);
                if item.client_seqno > *tally {
                    *tally = item.client_seqno;
                }
            }
        }

        debug!(replica = %self.uid, from = %self.commit_no, to = %target, "commit advanced");
        self.commit_no = target;
        if self.ack_no < self.commit_no {
            self.ack_no = self.commit_no;
        }
        if self.sack_no < self.ack_no {
            self.sack_no = self.ack_no;
        }
    }

    /// Primary-side commit advancement: moves the pointer and sends one
    /// aggregated response per client covering the newly committed items.
    pub(crate) fn advance_commit_replying(&mut self, upto: LogNumber, out: &mut Output) {
        let target = if upto > self.log.last() {
            self.log.last()
        } else {
            upto
        };
        if target <= self.commit_no {
            return;
        }

        let mut replies: BTreeMap<NodeUid, Vec<(u64, Bytes)>> = BTreeMap::new();
        for (logno, item) in self.log.iter_from(self.commit_no) {
            if logno >= target {
                break;
            }
            if item.is_real() {
                replies
                    .entry(item.client_uid.clone())
                    .or_default()
                    .push((item.client_seqno, item.payload.clone()));
            }
        }

        self.advance_commit(target);

        for (client, replies) in replies {
            let seq = self.next_seq();
            out.send(client, Message::Response(Response { seq, replies }));
        }
    }

    /// Advances `decide_no` toward `upto` (never past `commit_no`) and drops
    /// log items the whole group has stored.
    pub(crate) fn advance_decide(&mut self, upto: LogNumber) {
        let target = if upto > self.commit_no {
            self.commit_no
        } else {
            upto
        };
        if target <= self.decide_no {
            return;
        }

        self.decide_no = target;
        if self.ack_no < self.decide_no {
            self.ack_no = self.decide_no;
        }
        if self.sack_no < self.ack_no {
            self.sack_no = self.ack_no;
        }
        while self.log.first() < self.decide_no {
            self.log.pop_front();
        }
        trace!(replica = %self.uid, decide = %self.decide_no, first = %self.log.first(), "decide advanced");
    }

    // ========================================================================
    // Log merging
    // ========================================================================

    /// Merges a log extension received in a commit or view message.
    ///
    /// Item views arrive as deltas below `base_view`. Entries below `first`
    /// (already truncated here) are skipped. Returns the first position where
    /// the sender's log diverged from ours (we held the strictly newer item),
    /// if any.
    ///
    /// # Panics
    ///
    /// Panics if the extension carries an item that conflicts with a stored
    /// item from the same view: two different requests can never be accepted
    /// at one position in one view, so this is a broken replica, not a
    /// recoverable error.
    pub(crate) fn merge_extension(
        &mut self,
        extension: &LogExtension,
        base_view: ViewNumber,
    ) -> Option<LogNumber> {
        let mut diverged: Option<LogNumber> = None;

        for (i, wire) in extension.entries.iter().enumerate() {
            let logno = extension.start + i as u64;
            if logno < self.log.first() {
                continue;
            }

            let item_view =
                ViewNumber::new(base_view.as_u64().wrapping_sub(wire.view_delta));
            let item = if wire.is_real() {
                LogItem::new(
                    item_view,
                    wire.client_uid.clone(),
                    wire.client_seqno,
                    wire.payload.clone(),
                )
            } else {
                LogItem::placeholder(item_view)
            };

            // Fill any gap with placeholders so the slot is addressable.
            while self.log.last() < logno {
                self.log.push_back(LogItem::placeholder(item_view));
            }

            if logno == self.log.last() {
                self.log.push_back(item);
                continue;
            }

            let existing = self.log.get(logno).expect("slot inside [first, last)");
            let existing_was_real = existing.is_real();
            match existing.admit(&item) {
                Overwrite::Replace => {
                    if existing_was_real && diverged.is_none() {
                        diverged = Some(logno);
                    }
                    *self.log.get_mut(logno).expect("slot checked above") = item;
                }
                Overwrite::Skip => {
                    if existing_was_real && item.is_real() && diverged.is_none() {
                        diverged = Some(logno);
                    }
                }
                Overwrite::Equal => {}
                Overwrite::Conflict => {
                    panic!(
                        "log invariant violated at {logno}: stored {} vs incoming {} in the same view",
                        self.log.get(logno).expect("slot checked above"),
                        item
                    );
                }
            }
        }

        diverged
    }

    /// Extends `ack_no` over the contiguous real prefix and pulls `sack_no`
    /// up to the furthest stored position.
    pub(crate) fn refresh_ack_window(&mut self) {
        while self.log.get(self.ack_no).is_some_and(LogItem::is_real) {
            self.ack_no += 1;
        }
        if self.sack_no < self.ack_no {
            self.sack_no = self.ack_no;
        }
        if self.sack_no < self.log.last() {
            self.sack_no = self.log.last();
        }
    }

    /// Drops trailing placeholders above the committed prefix.
    pub(crate) fn trim_trailing_placeholders(&mut self) {
        let mut new_last = self.log.last();
        while new_last > self.commit_no && new_last > self.log.first() {
            let prev = LogNumber::new(new_last.as_u64().wrapping_sub(1));
            match self.log.get(prev) {
                Some(item) if !item.is_real() => new_last = prev,
                _ => break,
            }
        }
        if new_last < self.log.last() {
            info!(replica = %self.uid, from = %self.log.last(), to = %new_last, "trimming placeholder tail");
            self.log.truncate_to(new_last);
            if self.sack_no > self.log.last() {
                self.sack_no = self.log.last();
            }
            if self.ack_no > self.log.last() {
                self.ack_no = self.log.last();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(uid: &str) -> Replica {
        Replica::new(NodeUid::new(uid), ProtocolConfig::simulation())
    }

    fn real_item(view: u64, cuid: &str, seqno: u64) -> LogItem {
        LogItem::new(
            ViewNumber::new(view),
            NodeUid::new(cuid),
            seqno,
            Bytes::from_static(b"p"),
        )
    }

    #[test]
    fn new_replica_is_singular_primary() {
        let r = replica("n0");
        assert!(r.cur_view().is_singular());
        assert!(r.is_primary());
        assert!(!r.in_view_change());
        assert_eq!(r.commit_no(), LogNumber::ZERO);
        assert_eq!(r.decide_no(), LogNumber::ZERO);
    }

    #[test]
    fn stopped_replica_drops_messages() {
        let mut r = replica("n0");
        r.stop();

        let (r, out) = r.process(ReplicaEvent::Inbound {
            from: NodeUid::new("c0"),
            message: Message::Join(moraine_wire::Join { seq: 1 }),
        });
        assert!(out.is_empty());
        assert!(!r.in_view_change());
    }

    #[test]
    fn advance_commit_replies_per_client() {
        let mut r = replica("n0");
        r.log.push_back(real_item(0, "c0", 1));
        r.log.push_back(real_item(0, "c1", 1));
        r.log.push_back(real_item(0, "c0", 2));

        let mut out = Output::empty();
        r.advance_commit_replying(LogNumber::new(3), &mut out);

        assert_eq!(r.commit_no(), LogNumber::new(3));
        // One aggregated response per client.
        assert_eq!(out.sends.len(), 2);
        let to_c0 = out
            .sends
            .iter()
            .find(|e| e.to == NodeUid::new("c0"))
            .expect("reply to c0");
        match &to_c0.message {
            Message::Response(resp) => {
                let seqnos: Vec<u64> = resp.replies.iter().map(|(s, _)| *s).collect();
                assert_eq!(seqnos, vec![1, 2]);
            }
            other => panic!("expected response, got {}", other.name()),
        }
    }

    #[test]
    fn advance_commit_clamps_to_log_end() {
        let mut r = replica("n0");
        r.log.push_back(real_item(0, "c0", 1));

        let mut out = Output::empty();
        r.advance_commit_replying(LogNumber::new(10), &mut out);
        assert_eq!(r.commit_no(), LogNumber::new(1));
    }

    #[test]
    fn advance_decide_truncates_front() {
        let mut r = replica("n0");
        for i in 1..=3 {
            r.log.push_back(real_item(0, "c0", i));
        }
        let mut out = Output::empty();
        r.advance_commit_replying(LogNumber::new(3), &mut out);

        r.advance_decide(LogNumber::new(2));
        assert_eq!(r.decide_no(), LogNumber::new(2));
        assert_eq!(r.log.first(), LogNumber::new(2));
        assert_eq!(r.log.len(), 1);

        // Decide never outruns commit.
        r.advance_decide(LogNumber::new(9));
        assert_eq!(r.decide_no(), LogNumber::new(3));
    }

    #[test]
    fn merge_extension_fills_gaps_with_placeholders() {
        let mut r = replica("n0");
        let ext = LogExtension {
            start: LogNumber::new(2),
            entries: vec![WireLogItem {
                view_delta: 0,
                client_uid: NodeUid::new("c0"),
                client_seqno: 5,
                payload: Bytes::from_static(b"z"),
            }],
        };

        let diverged = r.merge_extension(&ext, ViewNumber::new(1));
        assert_eq!(diverged, None);
        assert_eq!(r.log.last(), LogNumber::new(3));
        assert!(!r.log.get(LogNumber::new(0)).unwrap().is_real());
        assert!(!r.log.get(LogNumber::new(1)).unwrap().is_real());
        assert!(r.log.get(LogNumber::new(2)).unwrap().is_real());

        r.refresh_ack_window();
        assert_eq!(r.ack_no(), LogNumber::ZERO);
        assert_eq!(r.sack_no(), LogNumber::new(3));
    }

    #[test]
    fn merge_extension_respects_view_precedence() {
        let mut r = replica("n0");
        r.log.push_back(real_item(2, "c0", 1));

        // An older-view item for the same slot is skipped and marks divergence.
        let stale = LogExtension {
            start: LogNumber::ZERO,
            entries: vec![WireLogItem {
                view_delta: 2, // base view 3 - 2 = view 1 < stored view 2
                client_uid: NodeUid::new("c9"),
                client_seqno: 9,
                payload: Bytes::from_static(b"old"),
            }],
        };
        let diverged = r.merge_extension(&stale, ViewNumber::new(3));
        assert_eq!(diverged, Some(LogNumber::ZERO));
        assert_eq!(r.log.get(LogNumber::ZERO).unwrap().client_uid, NodeUid::new("c0"));

        // A newer-view item replaces, and reports the divergence too.
        let fresh = LogExtension {
            start: LogNumber::ZERO,
            entries: vec![WireLogItem {
                view_delta: 0,
                client_uid: NodeUid::new("c1"),
                client_seqno: 4,
                payload: Bytes::from_static(b"new"),
            }],
        };
        let diverged = r.merge_extension(&fresh, ViewNumber::new(3));
        assert_eq!(diverged, Some(LogNumber::ZERO));
        assert_eq!(r.log.get(LogNumber::ZERO).unwrap().client_uid, NodeUid::new("c1"));
    }

    #[test]
    #[should_panic(expected = "log invariant violated")]
    fn merge_extension_conflict_is_fatal() {
        let mut r = replica("n0");
        r.log.push_back(real_item(1, "c0", 1));

        let conflicting = LogExtension {
            start: LogNumber::ZERO,
            entries: vec![WireLogItem {
                view_delta: 0,
                client_uid: NodeUid::new("c1"),
                client_seqno: 8,
                payload: Bytes::from_static(b"other"),
            }],
        };
        let _ = r.merge_extension(&conflicting, ViewNumber::new(1));
    }

    #[test]
    fn trim_trailing_placeholders_stops_at_commit() {
        let mut r = replica("n0");
        r.log.push_back(real_item(0, "c0", 1));
        r.log.push_back(LogItem::placeholder(ViewNumber::new(1)));
        r.log.push_back(LogItem::placeholder(ViewNumber::new(1)));

        let mut out = Output::empty();
        r.advance_commit_replying(LogNumber::new(1), &mut out);

        r.trim_trailing_placeholders();
        assert_eq!(r.log.last(), LogNumber::new(1));
    }

    #[test]
    fn skipped_entries_below_first_are_ignored() {
        let mut r = replica("n0");
        for i in 1..=2 {
            r.log.push_back(real_item(0, "c0", i));
        }
        let mut out = Output::empty();
        r.advance_commit_replying(LogNumber::new(2), &mut out);
        r.advance_decide(LogNumber::new(2));
        assert_eq!(r.log.first(), LogNumber::new(2));

        // Retransmission overlapping the truncated range is harmless.
        let ext = LogExtension {
            start: LogNumber::ZERO,
            entries: vec![
                WireLogItem {
                    view_delta: 0,
                    client_uid: NodeUid::new("c0"),
                    client_seqno: 1,
                    payload: Bytes::from_static(b"p"),
                },
                WireLogItem {
                    view_delta: 0,
                    client_uid: NodeUid::new("c0"),
                    client_seqno: 2,
                    payload: Bytes::from_static(b"p"),
                },
                WireLogItem {
                    view_delta: 0,
                    client_uid: NodeUid::new("c0"),
                    client_seqno: 3,
                    payload: Bytes::from_static(b"p"),
                },
            ],
        };
        let diverged = r.merge_extension(&ext, ViewNumber::new(0));
        assert_eq!(diverged, None);
        assert_eq!(r.log.first(), LogNumber::new(2));
        assert_eq!(r.log.last(), LogNumber::new(3));
    }
}
