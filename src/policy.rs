//! Per-phase pacing, retry, and recovery policy.
//!
//! The firmware tolerates a very different command cadence depending on
//! where it is in its lifecycle, and the correct reaction to a stall or a
//! failed status changes with it. All of that is data, not code: one row
//! per phase, consulted by the orchestrator before and after every
//! exchange.

use std::time::Duration;

use crate::lifecycle::Phase;

/// One row of the pacing table.
#[derive(Debug, Clone)]
pub struct PhasePolicy {
    /// Sleep before submitting the CBW.
    pub pre_delay: Duration,
    /// Sleep after a completed exchange.
    pub post_delay: Duration,
    /// Retries per stage, and whole-operation retries on a rejected tag.
    pub max_retries: u32,
    /// First backoff step; doubles per retry.
    pub backoff_start: Duration,
    /// Clear both bulk halts before retrying a stalled transfer.
    pub clear_halt_on_stall: bool,
    /// Escalate a repeated stall to a device reset (clears the lifecycle
    /// back to Unknown and rebases the tag counter to 1).
    pub reset_on_repeat_stall: bool,
    /// Whether a CSW status != 0 is returned to the caller as data rather
    /// than as a `ScsiFailure` error. Expected while the animation runs.
    pub accept_scsi_failure: bool,
}

/// The full table. Unknown shares the Animation row: nothing has been
/// observed yet, so the transport paces as if the animation were running.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    pub animation: PhasePolicy,
    pub connecting: PhasePolicy,
    pub connected: PhasePolicy,
    pub disconnected: PhasePolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        PolicyTable {
            animation: PhasePolicy {
                pre_delay: Duration::from_millis(200),
                post_delay: Duration::ZERO,
                max_retries: 5,
                backoff_start: Duration::from_millis(100),
                clear_halt_on_stall: true,
                reset_on_repeat_stall: false,
                accept_scsi_failure: true,
            },
            connecting: PhasePolicy {
                pre_delay: Duration::from_millis(50),
                post_delay: Duration::from_millis(50),
                max_retries: 3,
                backoff_start: Duration::from_millis(100),
                clear_halt_on_stall: true,
                reset_on_repeat_stall: false,
                accept_scsi_failure: true,
            },
            connected: PhasePolicy {
                pre_delay: Duration::from_millis(20),
                post_delay: Duration::from_millis(50),
                max_retries: 3,
                backoff_start: Duration::from_millis(100),
                clear_halt_on_stall: true,
                reset_on_repeat_stall: true,
                accept_scsi_failure: false,
            },
            disconnected: PhasePolicy {
                pre_delay: Duration::ZERO,
                post_delay: Duration::ZERO,
                max_retries: 0,
                backoff_start: Duration::from_millis(100),
                clear_halt_on_stall: false,
                reset_on_repeat_stall: false,
                accept_scsi_failure: false,
            },
        }
    }
}

impl PolicyTable {
    pub fn for_phase(&self, phase: Phase) -> &PhasePolicy {
        match phase {
            Phase::Animation | Phase::Unknown => &self.animation,
            Phase::Connecting => &self.connecting,
            Phase::Connected => &self.connected,
            Phase::Disconnected => &self.disconnected,
        }
    }
}

impl PhasePolicy {
    /// Backoff for retry attempt `n` (1-based): doubles from the start
    /// value, `100ms, 200ms, 400ms, ...`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_start * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

/// Per-stage transfer timeouts.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    /// Submitting the 31-byte CBW.
    pub cbw_out: Duration,
    /// Reading the 13-byte CSW. Generous: the firmware can sit on the
    /// status for most of a second during its animation.
    pub csw_in: Duration,
    /// Base allowance for the data phase.
    pub data_base: Duration,
    /// Extra data-phase allowance per KiB transferred.
    pub data_per_kib: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        StageTimeouts {
            cbw_out: Duration::from_secs(1),
            csw_in: Duration::from_secs(1),
            data_base: Duration::from_secs(5),
            data_per_kib: Duration::from_millis(10),
        }
    }
}

impl StageTimeouts {
    /// Timeout for a data phase of `len` bytes.
    pub fn data(&self, len: usize) -> Duration {
        self.data_base + self.data_per_kib * (len / 1024) as u32
    }
}
