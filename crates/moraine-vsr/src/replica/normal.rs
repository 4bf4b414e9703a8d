//! Normal-operation handlers: client requests, commits, and acks.
//!
//! The primary appends client payloads, replicates them to backups with
//! `Commit` messages, and advances the commit pointer as `Ack`s come back.
//! Backups merge commit extensions, maintain their contiguous stored prefix
//! (`ack_no`) and furthest-seen position (`sack_no`), and report gaps so the
//! primary retransmits selectively.

use bytes::Bytes;
use tracing::{debug, trace};

use moraine_types::NodeUid;
use moraine_wire::{Ack, Commit, Message, Request, Response, ViewMessage};

use crate::log::LogItem;

use super::{Output, Replica};

impl Replica {
    // ========================================================================
    // Request (client → primary)
    // ========================================================================

    /// Handles a client request.
    ///
    /// A replica that is not the stable primary steers the client with a view
    /// message. A retransmitted `(client_uid, client_seqno)` already in the
    /// committed log is answered from the log; one still in flight is
    /// absorbed.
    pub(crate) fn on_request(mut self, from: NodeUid, request: Request) -> (Self, Output) {
        let mut out = Output::empty();

        if !self.cur_view.i_am_primary() || self.in_view_change() {
            debug!(replica = %self.uid, client = %from, "steering client to primary");
            let seq = self.next_seq();
            let spec = self.next_view.to_spec();
            out.send(from, Message::View(ViewMessage { seq, spec }));
            return (self, out);
        }

        let first_new = self.log.last();
        let mut replays: Vec<(u64, Bytes)> = Vec::new();

        for (i, payload) in request.payloads.iter().enumerate() {
            let seqno = request.seqno_at(i);
            if self.client_tally.get(&from).is_some_and(|&t| seqno <= t) {
                // Committed earlier. Responses echo payloads, and a
                // retransmission carries the same payload, so the reply can
                // be rebuilt from the request itself.
                replays.push((seqno, payload.clone()));
            } else if self.in_flight(&from, seqno) {
                trace!(replica = %self.uid, client = %from, seqno, "duplicate in flight");
            } else {
                self.log.push_back(LogItem::new(
                    self.cur_view.view_number,
                    from.clone(),
                    seqno,
                    payload.clone(),
                ));
            }
        }

        if self.log.last() > first_new {
            let my_index = self.cur_view.my_index.expect("primary is a member");
            let last = self.log.last();
            self.cur_view.account_ack_at(my_index, last);
            self.ack_no = last;
            if self.sack_no < last {
                self.sack_no = last;
            }

            self.broadcast_commits(&mut out);

            // A singular view has its quorum already.
            if self.cur_view.is_quorum(self.cur_view.members[my_index].ackno_count) {
                self.advance_commit_replying(last, &mut out);
            }
            if self.cur_view.members[my_index].ackno_count == self.cur_view.size() {
                self.advance_decide(last);
            }
        }

        if !replays.is_empty() {
            let seq = self.next_seq();
            out.send(
                from,
                Message::Response(Response {
                    seq,
                    replies: replays,
                }),
            );
        }

        (self, out)
    }

    /// True if `(client_uid, client_seqno)` is appended but not yet committed.
    fn in_flight(&self, client_uid: &NodeUid, client_seqno: u64) -> bool {
        self.log.iter_from(self.commit_no).any(|(_, item)| {
            item.is_real() && &item.client_uid == client_uid && item.client_seqno == client_seqno
        })
    }

    /// Sends each backup a commit filling its log from its fill point.
    pub(crate) fn broadcast_commits(&mut self, out: &mut Output) {
        for index in 0..self.cur_view.members.len() {
            if Some(index) == self.cur_view.my_index {
                continue;
            }
            let fill = self.fill_point(index);
            let to = self.cur_view.members[index].uid.clone();
            let message = self.build_commit(fill);
            out.send(to, message);
        }
    }

    // ========================================================================
    // Commit (primary → backup)
    // ========================================================================

    /// Handles a commit from the primary.
    ///
    /// A commit for the pending view completes the view change on this
    /// backup. A commit for any other view, or one that arrives mid-change,
    /// is answered with our view so the peer resynchronizes.
    pub(crate) fn on_commit(mut self, from: NodeUid, commit: Commit) -> (Self, Output) {
        let mut out = Output::empty();

        if commit.view_number == self.next_view.view_number
            && self.in_view_change()
            && self.next_view.is_primary(&from)
            && !self.next_view.i_am_primary()
        {
            // The new primary is serving: adopt the pending view.
            debug!(replica = %self.uid, view = %self.next_view.view_number, "adopting view on commit");
            self.cur_view = self.next_view.clone();
            self.confirm_sent = false;
            self.trim_trailing_placeholders();
        } else if commit.view_number != self.cur_view.view_number || self.in_view_change() {
            debug!(
                replica = %self.uid,
                got = %commit.view_number,
                serving = %self.cur_view.view_number,
                "commit view mismatch; resynchronizing peer"
            );
            let message = self.view_announcement();
            out.send(from, message);
            return (self, out);
        } else if !self.cur_view.is_primary(&from) {
            debug!(replica = %self.uid, from = %from, "commit from non-primary; dropping");
            return (self, out);
        }

        let decide = commit.decide_no();

        if let Some(extension) = &commit.extension {
            self.merge_extension(extension, commit.view_number);
        }
        self.refresh_ack_window();

        // Commit what we actually hold, up to the primary's commit point.
        let commit_target = if commit.commit_no < self.ack_no {
            commit.commit_no
        } else {
            self.ack_no
        };
        self.advance_commit(commit_target);
        self.advance_decide(decide);

        let ack = Ack {
            seq: commit.seq,
            view_number: self.cur_view.view_number,
            ack_no: self.ack_no,
            sack_delta: self.sack_no.delta(self.ack_no) as u64,
        };
        out.send(from, Message::Ack(ack));

        (self, out)
    }

    // ========================================================================
    // Ack (backup → primary)
    // ========================================================================

    /// Handles a stored-prefix acknowledgment from a backup.
    pub(crate) fn on_ack(mut self, from: NodeUid, ack: Ack) -> (Self, Output) {
        let mut out = Output::empty();

        if !self.is_primary() || ack.view_number != self.cur_view.view_number {
            debug!(replica = %self.uid, from = %from, view = %ack.view_number, "unusable ack; dropping");
            return (self, out);
        }
        let Some(index) = self.cur_view.index_of(&from) else {
            debug!(replica = %self.uid, from = %from, "ack from non-member; dropping");
            return (self, out);
        };

        self.cur_view.account_ack_at(index, ack.ack_no);
        let ackno_count = self.cur_view.members[index].ackno_count;

        if self.cur_view.is_quorum(ackno_count) {
            self.advance_commit_replying(ack.ack_no, &mut out);
        }
        if ackno_count == self.cur_view.size() {
            self.advance_decide(ack.ack_no);
        }

        if ack.sack_delta > 0 {
            trace!(replica = %self.uid, peer = %from, from = %ack.ack_no, delta = ack.sack_delta, "gap reported; retransmitting");
            let message = self.build_commit_range(ack.ack_no, ack.ack_no + ack.sack_delta);
            out.send(from, message);
        }

        (self, out)
    }

    // ========================================================================
    // Primary keepalive
    // ========================================================================

    /// Refreshes every backup with a commit from its fill point.
    ///
    /// The driver fires this when nothing was broadcast within half the
    /// keepalive window; an idle primary thus keeps proving liveness.
    pub(crate) fn on_primary_keepalive(mut self) -> (Self, Output) {
        let mut out = Output::empty();
        if self.is_primary() {
            self.broadcast_commits(&mut out);
        }
        (self, out)
    }
}
