//! View snapshots and acknowledgment bookkeeping.
//!
//! A [`View`] is a configuration of the group at a point in time: the member
//! list, the primary (`view_number mod |members|`), and per-member progress
//! used while negotiating a view change and while advancing commits.
//!
//! The view change itself is driven by the replica; this module only provides
//! the bookkeeping operations: recording acks and confirms, accounting
//! acknowledged log positions, and the quorum predicates over them.

use moraine_types::{quorum_size, LogNumber, NodeUid, ViewNumber};
use moraine_wire::{MemberSpec, ViewSpec};

use crate::VsrError;

// ============================================================================
// Member
// ============================================================================

/// Per-member bookkeeping inside a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// The member's identity.
    pub uid: NodeUid,

    /// The member's network address, if known.
    pub addr: Option<String>,

    /// True once this member sent a view message matching this view.
    pub acked: bool,

    /// True once this member reported hearing acks from a quorum itself.
    pub confirmed: bool,

    /// Highest log number this member has acknowledged storing.
    pub ackno: Option<LogNumber>,

    /// How many members acknowledge at least `ackno`.
    pub ackno_count: usize,

    /// Highest position at which this member's log is known to agree with
    /// ours; maintained by the incoming primary during log transfer.
    pub matching_logno: Option<LogNumber>,
}

impl Member {
    /// Creates a fresh member with no recorded progress.
    pub fn new(uid: NodeUid, addr: Option<String>) -> Self {
        Self {
            uid,
            addr,
            acked: false,
            confirmed: false,
            ackno: None,
            ackno_count: 0,
            matching_logno: None,
        }
    }

    /// Clears all negotiation state, keeping identity and address.
    fn reset(&mut self) {
        self.acked = false;
        self.confirmed = false;
        self.ackno = None;
        self.ackno_count = 0;
        self.matching_logno = None;
    }

    /// Lowers `matching_logno` to `logno` if it currently lies above it.
    pub fn limit_matching(&mut self, logno: LogNumber) {
        match self.matching_logno {
            Some(current) if current <= logno => {}
            _ => self.matching_logno = Some(logno),
        }
    }
}

// ============================================================================
// View
// ============================================================================

/// An immutable-membership snapshot of the group plus mutable progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    /// The view counter.
    pub view_number: ViewNumber,

    /// Members in index order; order is part of the configuration.
    pub members: Vec<Member>,

    /// Index of the primary. Always `view_number mod members.len()`.
    pub primary_index: usize,

    /// Our own index, if we are a member.
    pub my_index: Option<usize>,
}

impl View {
    /// Creates the bootstrap view: a single member, view number zero.
    pub fn singular(uid: NodeUid) -> Self {
        Self {
            view_number: ViewNumber::ZERO,
            members: vec![Member::new(uid, None)],
            primary_index: 0,
            my_index: Some(0),
        }
    }

    /// Validates and adopts a peer's view description.
    ///
    /// Fails if the member list is empty or contains duplicates, or if the
    /// claimed primary index is not the one the view number derives.
    pub fn from_spec(spec: &ViewSpec, my_uid: &NodeUid) -> Result<Self, VsrError> {
        if spec.members.is_empty() {
            return Err(VsrError::MalformedView("empty member list".into()));
        }
        for (i, member) in spec.members.iter().enumerate() {
            if member.uid.is_empty() {
                return Err(VsrError::MalformedView("member with empty uid".into()));
            }
            if spec.members[..i].iter().any(|m| m.uid == member.uid) {
                return Err(VsrError::MalformedView(format!(
                    "duplicate member {}",
                    member.uid
                )));
            }
        }

        let derived = (spec.view_number.as_u64() % spec.members.len() as u64) as usize;
        if spec.primary_index >= spec.members.len() || spec.primary_index != derived {
            return Err(VsrError::MalformedView(format!(
                "primary index {} inconsistent with {} over {} members",
                spec.primary_index,
                spec.view_number,
                spec.members.len()
            )));
        }

        let members: Vec<Member> = spec
            .members
            .iter()
            .map(|m| Member::new(m.uid.clone(), m.addr.clone()))
            .collect();
        let my_index = members.iter().position(|m| &m.uid == my_uid);

        Ok(Self {
            view_number: spec.view_number,
            members,
            primary_index: spec.primary_index,
            my_index,
        })
    }

    /// Renders this view as a bare wire description (no ack state attached).
    pub fn to_spec(&self) -> ViewSpec {
        ViewSpec {
            view_number: self.view_number,
            members: self
                .members
                .iter()
                .map(|m| MemberSpec {
                    uid: m.uid.clone(),
                    addr: m.addr.clone(),
                })
                .collect(),
            primary_index: self.primary_index,
            ackno: None,
            confirm: false,
            log_start: None,
            log_entries: Vec::new(),
        }
    }

    // ========================================================================
    // Membership queries
    // ========================================================================

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Maximum tolerated failures: `(|members| - 1) / 2`.
    pub fn f(&self) -> usize {
        (self.members.len() - 1) / 2
    }

    /// Members needed for a quorum: a strict majority.
    ///
    /// Equals `f() + 1` for odd group sizes. For even sizes a strict
    /// majority is required, so two disjoint halves can never both make
    /// progress.
    pub fn quorum(&self) -> usize {
        quorum_size(self.members.len())
    }

    /// True if `count` members form a quorum.
    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum()
    }

    /// Returns 1 if `uid` is a member, else 0.
    pub fn count(&self, uid: &NodeUid) -> usize {
        usize::from(self.index_of(uid).is_some())
    }

    /// Index of a member by uid.
    pub fn index_of(&self, uid: &NodeUid) -> Option<usize> {
        self.members.iter().position(|m| &m.uid == uid)
    }

    /// Member record by uid.
    pub fn find(&self, uid: &NodeUid) -> Option<&Member> {
        self.index_of(uid).map(|i| &self.members[i])
    }

    /// Mutable member record by uid.
    pub fn find_mut(&mut self, uid: &NodeUid) -> Option<&mut Member> {
        self.index_of(uid).map(move |i| &mut self.members[i])
    }

    /// The primary member.
    pub fn primary(&self) -> &Member {
        &self.members[self.primary_index]
    }

    /// True if `uid` is the primary of this view.
    pub fn is_primary(&self, uid: &NodeUid) -> bool {
        &self.primary().uid == uid
    }

    /// True if the local replica is this view's primary.
    pub fn i_am_primary(&self) -> bool {
        self.my_index == Some(self.primary_index)
    }

    /// True for a view containing only the local replica.
    pub fn is_singular(&self) -> bool {
        self.members.len() == 1 && self.my_index == Some(0)
    }

    /// True if both views list the same members in the same order.
    pub fn same_members(&self, other: &View) -> bool {
        self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(&other.members)
                .all(|(a, b)| a.uid == b.uid)
    }

    /// True iff the member-set intersection is a strict majority of both
    /// views, or equals either view entirely.
    ///
    /// This gates whether a peer's proposed view is close enough to ours to
    /// negotiate with: overlapping majorities guarantee the two views cannot
    /// both make independent progress.
    pub fn shared_quorum(&self, other: &View) -> bool {
        let shared = self
            .members
            .iter()
            .filter(|m| other.count(&m.uid) > 0)
            .count();
        shared == self.members.len()
            || shared == other.members.len()
            || (shared * 2 > self.members.len() && shared * 2 > other.members.len())
    }

    // ========================================================================
    // Acknowledgment bookkeeping
    // ========================================================================

    /// Records that `uid` acknowledged this view with the given payload.
    ///
    /// Ack positions are only accounted on the *next* view (`is_next`): the
    /// old view's members keep their counters frozen during a change.
    pub fn prepare(&mut self, uid: &NodeUid, spec: &ViewSpec, is_next: bool) {
        let Some(index) = self.index_of(uid) else {
            return;
        };
        self.members[index].acked = true;
        if spec.confirm {
            self.members[index].confirmed = true;
        }
        if is_next {
            if let Some(ackno) = spec.ackno {
                self.account_ack_at(index, ackno);
            }
        }
    }

    /// Monotonically raises a member's acknowledged position and recomputes
    /// every member's `ackno_count`.
    ///
    /// Returns true if the member's position actually advanced.
    pub fn account_ack(&mut self, uid: &NodeUid, ackno: LogNumber) -> bool {
        match self.index_of(uid) {
            Some(index) => self.account_ack_at(index, ackno),
            None => false,
        }
    }

    /// As [`account_ack`](View::account_ack), by member index.
    pub fn account_ack_at(&mut self, index: usize, ackno: LogNumber) -> bool {
        let member = &mut self.members[index];
        let raised = match member.ackno {
            Some(current) => {
                if ackno > current {
                    member.ackno = Some(ackno);
                    true
                } else {
                    false
                }
            }
            None => {
                member.ackno = Some(ackno);
                true
            }
        };

        if raised {
            self.recount_acks();
        }
        raised
    }

    /// Recomputes `ackno_count` for every member.
    pub(crate) fn recount_acks(&mut self) {
        let acks: Vec<Option<LogNumber>> = self.members.iter().map(|m| m.ackno).collect();
        for member in &mut self.members {
            member.ackno_count = match member.ackno {
                Some(mine) => acks
                    .iter()
                    .filter(|a| matches!(a, Some(theirs) if *theirs >= mine))
                    .count(),
                None => 0,
            };
        }
    }

    /// Number of members that acked this view.
    pub fn acked_count(&self) -> usize {
        self.members.iter().filter(|m| m.acked).count()
    }

    /// Number of members that confirmed this view.
    pub fn confirmed_count(&self) -> usize {
        self.members.iter().filter(|m| m.confirmed).count()
    }

    /// Clears all per-member negotiation state.
    pub fn clear_preparation(&mut self) {
        for member in &mut self.members {
            member.reset();
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Advances to the next view number (skipping zero on wrap), recomputes
    /// the primary, and clears all acks.
    pub fn advance(&mut self) {
        self.view_number = self.view_number.advanced();
        self.primary_index = (self.view_number.as_u64() % self.members.len() as u64) as usize;
        self.clear_preparation();
    }

    /// Adds a member and advances the view, reshuffling the primary.
    ///
    /// No-op if the uid is already a member.
    pub fn add_member(&mut self, uid: NodeUid, addr: Option<String>) {
        if self.index_of(&uid).is_some() {
            return;
        }
        self.members.push(Member::new(uid, addr));
        if let Some(my) = self.my_index {
            // Indices below the append point are unaffected.
            debug_assert!(my < self.members.len());
        }
        self.advance();
    }
}
