//! Protocol timing configuration.
//!
//! Every timeout the protocol uses lives here, threaded through constructors
//! as a per-instance record. There is no global constants table; two replicas
//! in one process can run with different timings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol Configuration
// ============================================================================

/// Timing parameters for replicas and clients.
///
/// All durations are configurable; the presets below cover the common
/// deployments. Timer jitter is derived from `rng_seed`, so a fixed seed
/// makes a run reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Generic per-message wait: handshake retry spacing, deferred-connect
    /// polling.
    pub message_timeout: Duration,

    /// Total budget for completing a channel handshake before the channel
    /// is discarded.
    pub handshake_timeout: Duration,

    /// Backup-side liveness window: a backup that hears no commit for this
    /// long starts a view change. The primary resends commits on a quarter
    /// of this interval.
    pub primary_keepalive_timeout: Duration,

    /// How long a view change may run before it is retried with a higher
    /// view number.
    pub view_change_timeout: Duration,

    /// Spacing of selective-retransmission resends for reported log gaps.
    pub retransmit_log_timeout: Duration,

    /// Client-side retransmission interval for unanswered requests.
    pub client_message_timeout: Duration,

    /// Upper bound of the random delay inserted before every outbound
    /// connect, to thin out simultaneous-connect races.
    pub connect_jitter: Duration,

    /// Seed for the instance's jitter generator.
    pub rng_seed: u64,
}

impl ProtocolConfig {
    /// Design-default timings for production deployments.
    pub fn production() -> Self {
        Self {
            message_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            primary_keepalive_timeout: Duration::from_secs(1),
            view_change_timeout: Duration::from_millis(500),
            retransmit_log_timeout: Duration::from_secs(1),
            client_message_timeout: Duration::from_secs(1),
            connect_jitter: Duration::from_millis(10),
            rng_seed: 0,
        }
    }

    /// Shortened timings for local development clusters.
    pub fn development() -> Self {
        Self {
            message_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(500),
            primary_keepalive_timeout: Duration::from_millis(250),
            view_change_timeout: Duration::from_millis(125),
            retransmit_log_timeout: Duration::from_millis(100),
            client_message_timeout: Duration::from_millis(100),
            connect_jitter: Duration::from_millis(2),
            rng_seed: 0,
        }
    }

    /// Short timings for deterministic simulation tests.
    ///
    /// The view change budget is kept well above the simulated message
    /// delays so dueling proposals settle instead of perpetually preempting
    /// each other.
    pub fn simulation() -> Self {
        Self {
            message_timeout: Duration::from_millis(10),
            handshake_timeout: Duration::from_millis(50),
            primary_keepalive_timeout: Duration::from_millis(40),
            view_change_timeout: Duration::from_millis(40),
            retransmit_log_timeout: Duration::from_millis(10),
            client_message_timeout: Duration::from_millis(20),
            connect_jitter: Duration::from_millis(1),
            rng_seed: 0,
        }
    }

    /// Sets the jitter seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    /// Sets the keepalive window.
    pub fn with_primary_keepalive(mut self, timeout: Duration) -> Self {
        self.primary_keepalive_timeout = timeout;
        self
    }

    /// Sets the view change budget.
    pub fn with_view_change_timeout(mut self, timeout: Duration) -> Self {
        self.view_change_timeout = timeout;
        self
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::production()
    }
}
