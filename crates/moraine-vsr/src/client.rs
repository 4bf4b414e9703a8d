//! The client protocol: primary discovery and request retransmission.
//!
//! A [`Client`] assigns monotonically increasing sequence numbers to opaque
//! payloads and keeps resending them until a response settles each one. It
//! follows the group through view changes: any view message updates its idea
//! of the membership, and a primary change redirects traffic (the driver
//! closes and reopens channels; this machine only picks targets).
//!
//! A request never fails from the caller's perspective; it retries forever.
//! Callers wanting a deadline wrap the completion externally.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use moraine_types::{NodeUid, ViewNumber};
use moraine_wire::{Message, Request, Seq, ViewSpec};

use crate::config::ProtocolConfig;
use crate::replica::Envelope;

/// After this many consecutive connect failures the client tries a random
/// member instead of the suspected primary.
const FALLBACK_EVERY: u32 = 8;

// ============================================================================
// Client Output
// ============================================================================

/// Everything a client step asks the driver to do.
#[derive(Debug, Default)]
pub struct ClientOutput {
    /// Messages to send, in order.
    pub sends: Vec<Envelope>,

    /// Requests settled by this step: `(seqno, response payload)`.
    pub completions: Vec<(u64, Bytes)>,
}

impl ClientOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing happened.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.completions.is_empty()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client-side protocol state.
#[derive(Debug)]
pub struct Client {
    /// This client's identity.
    uid: NodeUid,

    /// Most recently observed view, if any.
    current_view: Option<ViewSpec>,

    /// Where requests are currently directed.
    target: Option<NodeUid>,

    /// Unanswered requests by seqno.
    pending: BTreeMap<u64, Bytes>,

    /// Last assigned seqno.
    seqno: u64,

    /// Outgoing send sequence counter.
    seq: Seq,

    /// Consecutive connect failures against the current target.
    connect_failures: u32,

    /// Jitter and fallback-member selection.
    rng: SmallRng,
}

impl Client {
    /// Creates a client with no known view.
    pub fn new(uid: NodeUid, config: &ProtocolConfig) -> Self {
        Self {
            uid,
            current_view: None,
            target: None,
            pending: BTreeMap::new(),
            seqno: 0,
            seq: 0,
            connect_failures: 0,
            rng: SmallRng::seed_from_u64(config.rng_seed),
        }
    }

    /// This client's uid.
    pub fn uid(&self) -> &NodeUid {
        &self.uid
    }

    /// The uid requests are currently directed to.
    pub fn target(&self) -> Option<&NodeUid> {
        self.target.as_ref()
    }

    /// Number of unanswered requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Points the client at a known replica before any view is learned.
    pub fn bootstrap(&mut self, peer: NodeUid) {
        if self.target.is_none() {
            self.target = Some(peer);
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Submits a payload: assigns the next seqno, records it as pending, and
    /// sends it to the suspected primary.
    ///
    /// Returns the assigned seqno; the matching completion arrives in a
    /// later [`ClientOutput`].
    pub fn request(&mut self, payload: Bytes) -> (u64, ClientOutput) {
        self.seqno += 1;
        let seqno = self.seqno;
        self.pending.insert(seqno, payload.clone());

        let mut out = ClientOutput::empty();
        if let Some(target) = self.target.clone() {
            let seq = self.next_seq();
            out.sends.push(Envelope {
                to: target,
                message: Message::Request(Request::single(seq, seqno, payload)),
            });
        }
        (seqno, out)
    }

    /// Resends every pending request, batching contiguous seqno runs.
    ///
    /// The driver calls this each `client_message_timeout` while requests
    /// are outstanding.
    pub fn retransmit(&mut self) -> ClientOutput {
        let mut out = ClientOutput::empty();
        let Some(target) = self.target.clone() else {
            return out;
        };

        let mut run_start: Option<u64> = None;
        let mut run: Vec<Bytes> = Vec::new();
        let pending: Vec<(u64, Bytes)> =
            self.pending.iter().map(|(s, p)| (*s, p.clone())).collect();

        for (seqno, payload) in pending {
            match run_start {
                Some(start) if start + run.len() as u64 == seqno => run.push(payload),
                Some(start) => {
                    let seq = self.next_seq();
                    out.sends.push(Envelope {
                        to: target.clone(),
                        message: Message::Request(Request {
                            seq,
                            start_seqno: start,
                            payloads: std::mem::take(&mut run),
                        }),
                    });
                    run_start = Some(seqno);
                    run.push(payload);
                }
                None => {
                    run_start = Some(seqno);
                    run.push(payload);
                }
            }
        }
        if let (Some(start), false) = (run_start, run.is_empty()) {
            let seq = self.next_seq();
            out.sends.push(Envelope {
                to: target,
                message: Message::Request(Request {
                    seq,
                    start_seqno: start,
                    payloads: run,
                }),
            });
        }

        if !out.sends.is_empty() {
            trace!(client = %self.uid, pending = self.pending.len(), "retransmitting");
        }
        out
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Handles a message from any replica.
    pub fn on_message(&mut self, from: &NodeUid, message: Message) -> ClientOutput {
        match message {
            Message::Response(response) => {
                let mut out = ClientOutput::empty();
                for (seqno, payload) in response.replies {
                    if self.pending.remove(&seqno).is_some() {
                        out.completions.push((seqno, payload));
                    }
                }
                out
            }
            Message::View(vm) => {
                self.on_view(vm.spec);
                ClientOutput::empty()
            }
            other => {
                debug!(client = %self.uid, from = %from, msg = other.name(), "ignoring");
                ClientOutput::empty()
            }
        }
    }

    /// Adopts a (non-older) view and redirects to its primary.
    fn on_view(&mut self, spec: ViewSpec) {
        if spec.members.is_empty() || spec.primary_index >= spec.members.len() {
            return;
        }
        if let Some(current) = &self.current_view {
            if spec.view_number.delta(current.view_number) < 0 {
                return;
            }
        }

        let primary = spec.members[spec.primary_index].uid.clone();
        if self.target.as_ref() != Some(&primary) {
            debug!(client = %self.uid, primary = %primary, view = %spec.view_number, "redirecting to primary");
            self.target = Some(primary);
            self.connect_failures = 0;
        }
        self.current_view = Some(spec);
    }

    /// The view number most recently observed.
    pub fn view_number(&self) -> Option<ViewNumber> {
        self.current_view.as_ref().map(|v| v.view_number)
    }

    // ========================================================================
    // Connection feedback
    // ========================================================================

    /// Records a failed connect to the current target.
    ///
    /// Every [`FALLBACK_EVERY`]th consecutive failure picks a random view
    /// member instead of the suspected primary, in case our view is stale.
    /// Returns the uid to dial next.
    pub fn connect_failed(&mut self) -> Option<NodeUid> {
        self.connect_failures += 1;

        if self.connect_failures % FALLBACK_EVERY == 0 {
            if let Some(view) = &self.current_view {
                let index = self.rng.gen_range(0..view.members.len());
                let fallback = view.members[index].uid.clone();
                debug!(client = %self.uid, fallback = %fallback, "trying a random member");
                self.target = Some(fallback);
            }
        }
        self.target.clone()
    }

    /// Records a successful connect.
    pub fn connect_succeeded(&mut self) {
        self.connect_failures = 0;
    }

    fn next_seq(&mut self) -> Seq {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}
