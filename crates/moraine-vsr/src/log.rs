//! The replicated log.
//!
//! [`Log`] maps absolute [`LogNumber`]s to [`LogItem`]s over a contiguous
//! half-open range `[first, last)`. It is a deque under the hood: `first`
//! advances only when the decide pointer passes an item (`pop_front`), and
//! the back may only be truncated, never extended by resizing.
//!
//! A *placeholder* item reserves a log position during transfer without
//! carrying a request yet; it is recognizable by its empty client uid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Display;

use moraine_types::{LogNumber, NodeUid, ViewNumber};

// ============================================================================
// Log Item
// ============================================================================

/// One slot of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    /// View in which this item was first accepted.
    pub view_number: ViewNumber,

    /// Originating client, or empty for a placeholder.
    pub client_uid: NodeUid,

    /// Originating client's sequence number.
    pub client_seqno: u64,

    /// Opaque request payload.
    pub payload: Bytes,
}

impl LogItem {
    /// Creates a real item.
    pub fn new(
        view_number: ViewNumber,
        client_uid: NodeUid,
        client_seqno: u64,
        payload: Bytes,
    ) -> Self {
        debug_assert!(!client_uid.is_empty(), "real items need a client uid");
        Self {
            view_number,
            client_uid,
            client_seqno,
            payload,
        }
    }

    /// Creates a placeholder reserving a slot in the given view.
    pub fn placeholder(view_number: ViewNumber) -> Self {
        Self {
            view_number,
            client_uid: NodeUid::placeholder(),
            client_seqno: 0,
            payload: Bytes::new(),
        }
    }

    /// Returns true if this item carries a real client request.
    pub fn is_real(&self) -> bool {
        !self.client_uid.is_empty()
    }

    /// Decides what happens when `incoming` wants the slot `self` occupies.
    pub fn admit(&self, incoming: &LogItem) -> Overwrite {
        if !self.is_real() {
            // Placeholders yield to anything real and to newer placeholders.
            return if incoming.is_real() {
                Overwrite::Replace
            } else {
                Overwrite::Skip
            };
        }
        if !incoming.is_real() {
            return Overwrite::Skip;
        }
        match incoming.view_number.cmp(&self.view_number) {
            std::cmp::Ordering::Greater => Overwrite::Replace,
            std::cmp::Ordering::Less => Overwrite::Skip,
            std::cmp::Ordering::Equal => {
                if incoming.client_uid == self.client_uid
                    && incoming.client_seqno == self.client_seqno
                {
                    Overwrite::Equal
                } else {
                    Overwrite::Conflict
                }
            }
        }
    }
}

impl Display for LogItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_real() {
            write!(
                f,
                "{}:{}@{}",
                self.client_uid, self.client_seqno, self.view_number
            )
        } else {
            write!(f, "~empty~@{}", self.view_number)
        }
    }
}

/// Outcome of offering an item for a slot that is already occupied.
///
/// A real item may only be displaced by an item from a strictly later view;
/// two real items from the same view at the same position must be the same
/// request, anything else is a broken invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// The incoming item takes the slot.
    Replace,

    /// The existing item is kept (it is newer or equally placeholder-ish).
    Skip,

    /// Incoming and existing are the same request.
    Equal,

    /// Same view, same position, different request. Fatal.
    Conflict,
}

// ============================================================================
// Log
// ============================================================================

/// Absolute-indexed log over `[first, last)`.
#[derive(Debug, Clone, Default)]
pub struct Log {
    first: LogNumber,
    items: VecDeque<LogItem>,
}

impl Log {
    /// Creates an empty log starting at position zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty log starting at `first`.
    pub fn starting_at(first: LogNumber) -> Self {
        Self {
            first,
            items: VecDeque::new(),
        }
    }

    /// First retained position.
    pub fn first(&self) -> LogNumber {
        self.first
    }

    /// One past the highest stored position.
    pub fn last(&self) -> LogNumber {
        self.first + self.items.len() as u64
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no items are retained.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true if `logno` is within `[first, last)`.
    pub fn contains(&self, logno: LogNumber) -> bool {
        self.offset(logno).is_some()
    }

    /// Deque offset of an absolute position, if retained.
    fn offset(&self, logno: LogNumber) -> Option<usize> {
        let delta = logno.delta(self.first);
        if delta >= 0 && (delta as usize) < self.items.len() {
            Some(delta as usize)
        } else {
            None
        }
    }

    /// Item at an absolute position.
    pub fn get(&self, logno: LogNumber) -> Option<&LogItem> {
        self.offset(logno).map(|i| &self.items[i])
    }

    /// Mutable item at an absolute position.
    pub fn get_mut(&mut self, logno: LogNumber) -> Option<&mut LogItem> {
        self.offset(logno).map(move |i| &mut self.items[i])
    }

    /// Appends an item at `last`.
    pub fn push_back(&mut self, item: LogItem) {
        self.items.push_back(item);
    }

    /// Drops the front item, advancing `first`.
    pub fn pop_front(&mut self) -> Option<LogItem> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.first += 1;
        }
        item
    }

    /// Truncates the back of the log so that `last == new_last`.
    ///
    /// Resizing may only shrink; a `new_last` at or past the current `last`
    /// is a no-op.
    pub fn truncate_to(&mut self, new_last: LogNumber) {
        let keep = new_last.delta(self.first);
        if keep < 0 {
            self.items.clear();
            return;
        }
        if (keep as usize) < self.items.len() {
            self.items.truncate(keep as usize);
        }
    }

    /// Re-bases an empty log at a new first position.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the log is not empty.
    pub fn set_first(&mut self, first: LogNumber) {
        debug_assert!(self.items.is_empty(), "set_first requires an empty log");
        self.first = first;
    }

    /// Iterates `(logno, item)` pairs from `from` (clamped to `first`) to the
    /// end of the log.
    pub fn iter_from(&self, from: LogNumber) -> impl Iterator<Item = (LogNumber, &LogItem)> {
        let start = if from.delta(self.first) > 0 {
            from
        } else {
            self.first
        };
        let skip = start.delta(self.first).max(0) as usize;
        self.items
            .iter()
            .skip(skip)
            .enumerate()
            .map(move |(i, item)| (start + i as u64, item))
    }
}
