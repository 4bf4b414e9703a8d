//! The cooperative view change: join, view negotiation, and log transfer.
//!
//! A view change moves the group from `cur_view` to a higher-numbered
//! `next_view` in three phases:
//!
//! 1. **Ack**: every prospective member broadcasts a view message carrying
//!    its committed prefix (`ackno`); receivers record who acknowledged.
//! 2. **Confirm**: once a member sees quorums of acks in both the old and
//!    the new view, and the incoming primary itself has acked, it sends the
//!    incoming primary a `confirm` view message carrying its log segment.
//! 3. **Adopt**: with a quorum of confirms the incoming primary adopts the
//!    view, reconciles the merged log, and catches every confirmed member up
//!    with a commit; backups adopt when that commit arrives.
//!
//! Higher-numbered proposals are absorbed at any point; a stalled change is
//! retried with a freshly advanced view number.

use tracing::{debug, info, warn};

use moraine_types::{NodeUid, ViewNumber};
use moraine_wire::{
    Join, LogExtension, Message, ProtocolError, ViewMessage, ViewSpec, WireLogItem,
};

use crate::log::{LogItem, Overwrite};
use crate::view::View;

use super::{Output, Replica};

impl Replica {
    // ========================================================================
    // Announcements
    // ========================================================================

    /// Our plain view announcement: the next view plus our committed prefix.
    pub(crate) fn view_announcement(&mut self) -> Message {
        let mut spec = self.next_view.to_spec();
        spec.ackno = Some(self.commit_no);
        let seq = self.next_seq();
        Message::View(ViewMessage { seq, spec })
    }

    /// An announcement addressed to the member at `index`.
    ///
    /// When directed at the incoming primary and its declared `ackno` is
    /// known, the message carries our log segment from that point so the
    /// primary can reconstruct the union log.
    fn announcement_for(&mut self, index: usize, confirm: bool) -> Message {
        let mut spec = self.next_view.to_spec();
        spec.ackno = Some(self.commit_no);
        spec.confirm = confirm;

        if index == self.next_view.primary_index && !self.next_view.i_am_primary() {
            if let Some(primary_ackno) = self.next_view.primary().ackno {
                let start = if primary_ackno < self.log.first() {
                    self.log.first()
                } else {
                    primary_ackno
                };
                if start < self.log.last() {
                    spec.log_start = Some(start);
                    spec.log_entries = self.segment_from(start);
                }
            }
        }

        let seq = self.next_seq();
        Message::View(ViewMessage { seq, spec })
    }

    /// Renders `[start, log.last)` with views relative to the next view.
    fn segment_from(&self, start: moraine_types::LogNumber) -> Vec<WireLogItem> {
        let base = self.next_view.view_number;
        self.log
            .iter_from(start)
            .map(|(_, item)| {
                let delta = base.delta(item.view_number);
                debug_assert!(delta >= 0, "log item from a future view");
                WireLogItem {
                    view_delta: delta as u64,
                    client_uid: item.client_uid.clone(),
                    client_seqno: item.client_seqno,
                    payload: item.payload.clone(),
                }
            })
            .collect()
    }

    /// Marks ourselves acked in both views and accounts our committed prefix
    /// on the next view.
    fn preload_own_ack(&mut self) {
        if let Some(my) = self.cur_view.my_index {
            self.cur_view.members[my].acked = true;
        }
        if let Some(my) = self.next_view.my_index {
            self.next_view.members[my].acked = true;
            self.next_view.account_ack_at(my, self.commit_no);
        }
    }

    /// Broadcasts our announcement to every prospective member.
    fn broadcast_view(&mut self, out: &mut Output) {
        for index in 0..self.next_view.members.len() {
            if Some(index) == self.next_view.my_index {
                continue;
            }
            let to = self.next_view.members[index].uid.clone();
            let message = self.announcement_for(index, false);
            out.send(to, message);
        }
    }

    /// Starts negotiating the (already advanced) next view.
    pub(crate) fn initiate_view_change(&mut self, out: &mut Output) {
        info!(
            replica = %self.uid,
            from = %self.cur_view.view_number,
            to = %self.next_view.view_number,
            "starting view change"
        );
        self.confirm_sent = false;
        self.preload_own_ack();
        self.broadcast_view(out);
    }

    // ========================================================================
    // Join
    // ========================================================================

    /// Asks a known peer to admit us into its group.
    pub(crate) fn on_start_join(mut self, peer: NodeUid) -> (Self, Output) {
        let mut out = Output::empty();
        let seq = self.next_seq();
        info!(replica = %self.uid, peer = %peer, "requesting to join");
        out.send(peer, Message::Join(Join { seq }));
        (self, out)
    }

    /// Admits a new member: adds it to the next view (which advances the
    /// view number and reshuffles the primary) and starts the change.
    ///
    /// A join from a peer already in the next view is dropped; the pending
    /// change will reach it anyway.
    pub(crate) fn on_join(mut self, from: NodeUid, _join: Join) -> (Self, Output) {
        let mut out = Output::empty();

        if self.next_view.count(&from) > 0 {
            debug!(replica = %self.uid, peer = %from, "join from pending member; dropping");
            return (self, out);
        }

        info!(replica = %self.uid, peer = %from, "admitting member");
        self.next_view.add_member(from, None);
        self.initiate_view_change(&mut out);
        (self, out)
    }

    // ========================================================================
    // View messages
    // ========================================================================

    /// Handles a peer's view message: the ack → confirm → adopt protocol.
    pub(crate) fn on_view(mut self, from: NodeUid, vm: ViewMessage) -> (Self, Output) {
        let mut out = Output::empty();
        let spec = vm.spec;

        let v_new = match View::from_spec(&spec, &self.uid) {
            Ok(view) => view,
            Err(error) => {
                warn!(replica = %self.uid, from = %from, %error, "malformed view message");
                out.send(from, Message::Error(ProtocolError { seq: vm.seq }));
                return (self, out);
            }
        };

        if v_new.count(&from) == 0 {
            debug!(replica = %self.uid, from = %from, "view message excludes its sender; dropping");
            return (self, out);
        }

        let delta = v_new.view_number.delta(self.next_view.view_number);

        if delta < 0
            || (delta == 0 && !v_new.same_members(&self.next_view))
            || !self.next_view.shared_quorum(&v_new)
        {
            debug!(
                replica = %self.uid,
                from = %from,
                theirs = %v_new.view_number,
                ours = %self.next_view.view_number,
                "divergent view; resynchronizing peer"
            );
            let message = self.view_announcement();
            out.send(from, message);
            return (self, out);
        }

        if delta == 0 {
            self.cur_view.prepare(&from, &spec, false);
            self.next_view.prepare(&from, &spec, true);

            if spec.has_log() && self.next_view.i_am_primary() {
                if self.in_view_change() {
                    self.merge_transfer_segment(&from, &spec);
                } else {
                    self.note_matching(&from, &spec);
                }
            }
        } else {
            info!(replica = %self.uid, from = %from, view = %v_new.view_number, "absorbing proposed view");
            self.next_view = v_new;
            self.confirm_sent = false;
            self.cur_view.prepare(&from, &spec, false);
            self.next_view.prepare(&from, &spec, true);
            self.preload_own_ack();
            self.broadcast_view(&mut out);
        }

        self.check_change_progress(Some(&from), &mut out);
        (self, out)
    }

    /// Confirm and adopt checks, run after every piece of view progress.
    fn check_change_progress(&mut self, requester: Option<&NodeUid>, out: &mut Output) {
        // Confirm, once per change: quorums of acks in both views and an
        // acked incoming primary.
        if self.in_view_change()
            && !self.confirm_sent
            && self.cur_view.is_quorum(self.cur_view.acked_count())
            && self.next_view.is_quorum(self.next_view.acked_count())
            && self.next_view.primary().acked
        {
            self.confirm_sent = true;
            if self.next_view.i_am_primary() {
                let my = self.next_view.my_index.expect("primary is a member");
                self.next_view.members[my].confirmed = true;
            } else {
                let primary_index = self.next_view.primary_index;
                let to = self.next_view.members[primary_index].uid.clone();
                debug!(replica = %self.uid, to = %to, view = %self.next_view.view_number, "confirming view");
                let message = self.announcement_for(primary_index, true);
                out.send(to, message);
            }
        }

        // Adopt: the incoming primary finalizes on a quorum of confirms.
        if self.next_view.i_am_primary()
            && self
                .next_view
                .is_quorum(self.next_view.confirmed_count())
        {
            if self.in_view_change() {
                self.finalize_change(out);
            } else if let Some(peer) = requester {
                // The view did not change (already finalized); catch the
                // requesting peer up with a commit-log.
                if let Some(index) = self.cur_view.index_of(peer) {
                    let fill = self.fill_point(index);
                    let message = self.build_commit(fill);
                    out.send(peer.clone(), message);
                }
            }
        }
    }

    /// Completes the change on the incoming primary.
    fn finalize_change(&mut self, out: &mut Output) {
        info!(
            replica = %self.uid,
            view = %self.next_view.view_number,
            members = self.next_view.size(),
            "view change complete; serving as primary"
        );

        self.next_view.recount_acks();
        self.cur_view = self.next_view.clone();
        self.confirm_sent = false;

        self.trim_trailing_placeholders();

        if let Some(my) = self.cur_view.my_index {
            let last = self.log.last();
            self.cur_view.account_ack_at(my, last);
            self.ack_no = last;
            if self.sack_no < last {
                self.sack_no = last;
            }
        }
        self.next_view = self.cur_view.clone();

        for index in 0..self.cur_view.members.len() {
            if Some(index) == self.cur_view.my_index {
                continue;
            }
            if !self.cur_view.members[index].confirmed {
                continue;
            }
            let fill = self.fill_point(index);
            let to = self.cur_view.members[index].uid.clone();
            let message = self.build_commit(fill);
            out.send(to, message);
        }
    }

    // ========================================================================
    // Log transfer
    // ========================================================================

    /// Merges a backup's transfer segment into our log (incoming primary,
    /// mid-change) and records where the peer's log stops agreeing with the
    /// merged result.
    fn merge_transfer_segment(&mut self, from: &NodeUid, spec: &ViewSpec) {
        let Some(start) = spec.log_start else {
            return;
        };
        let extension = LogExtension {
            start,
            entries: spec.log_entries.clone(),
        };
        let diverged = self.merge_extension(&extension, spec.view_number);
        let agree_end = diverged.unwrap_or_else(|| extension.end());

        if let Some(member) = self.next_view.find_mut(from) {
            member.limit_matching(agree_end);
        }
        self.refresh_ack_window();
        debug!(
            replica = %self.uid,
            peer = %from,
            start = %start,
            agree_end = %agree_end,
            "merged transfer segment"
        );
    }

    /// Compares a late segment against our (already authoritative) log and
    /// records the peer's matching point without merging.
    fn note_matching(&mut self, from: &NodeUid, spec: &ViewSpec) {
        let Some(start) = spec.log_start else {
            return;
        };

        let mut agree_end = start + spec.log_entries.len() as u64;
        for (i, wire) in spec.log_entries.iter().enumerate() {
            let logno = start + i as u64;
            if logno < self.log.first() {
                continue;
            }
            if logno >= self.log.last() {
                agree_end = logno;
                break;
            }

            let item_view =
                ViewNumber::new(spec.view_number.as_u64().wrapping_sub(wire.view_delta));
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

            let existing = self.log.get(logno).expect("slot inside [first, last)");
            if existing.admit(&item) != Overwrite::Equal {
                agree_end = logno;
                break;
            }
        }

        if let Some(member) = self.cur_view.find_mut(from) {
            member.limit_matching(agree_end);
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    /// The primary went quiet: start a view change.
    pub(crate) fn on_backup_watchdog(mut self) -> (Self, Output) {
        let mut out = Output::empty();
        if !self.is_backup() || self.in_view_change() {
            return (self, out);
        }

        warn!(
            replica = %self.uid,
            view = %self.cur_view.view_number,
            primary = %self.cur_view.primary().uid,
            "primary unresponsive; starting view change"
        );
        self.next_view.advance();
        self.initiate_view_change(&mut out);
        (self, out)
    }

    /// A view change has been running too long: retry with a higher view.
    ///
    /// The timer is anchored to the view number it was armed for, so a
    /// firing that arrives after the change completed (or was superseded)
    /// cancels itself.
    pub(crate) fn on_view_change_timeout(mut self, view: ViewNumber) -> (Self, Output) {
        let mut out = Output::empty();
        if !self.in_view_change() || self.next_view.view_number != view {
            return (self, out);
        }

        warn!(
            replica = %self.uid,
            stalled = %view,
            "view change stalled; retrying with a higher view"
        );
        self.next_view.advance();
        self.initiate_view_change(&mut out);
        (self, out)
    }
}
