//! Inferred device lifecycle.
//!
//! The panel gives no in-band signal for where its firmware is in the
//! boot-animation / settling / live cycle, so the host tracks a phase
//! inferred from elapsed time, CSW outcomes, and error signals. The
//! machine here is purely observational: it never performs I/O, it is fed
//! by the orchestrator after every exchange, by the keep-alive probe, and
//! by a wall-clock check at the start of every operation.
//!
//! The transition triggers are best-effort proxies reconstructed from
//! packet captures of the firmware's behavior, which is why every
//! threshold lives in [`LifecycleConfig`] rather than in the code.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

use crate::protocol::{CSW_STATUS_PASSED, CSW_STATUS_PHASE_ERROR};

/// The inferred device phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No transport operation has run since `open`.
    Unknown,
    /// Firmware is running its boot animation; commands are tolerated but
    /// tags and statuses are unreliable.
    Animation,
    /// Animation is over, the firmware is settling; tags drift slightly.
    Connecting,
    /// Live. Tags echo exactly and statuses are meaningful.
    Connected,
    /// The firmware dropped into its "connection lost" screen.
    Disconnected,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Unknown,
        Phase::Animation,
        Phase::Connecting,
        Phase::Connected,
        Phase::Disconnected,
    ];

    fn index(self) -> usize {
        match self {
            Phase::Unknown => 0,
            Phase::Animation => 1,
            Phase::Connecting => 2,
            Phase::Connected => 3,
            Phase::Disconnected => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unknown => "Unknown",
            Phase::Animation => "Animation",
            Phase::Connecting => "Connecting",
            Phase::Connected => "Connected",
            Phase::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Fixed-size per-phase storage, indexable by [`Phase`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PerPhase<T>([T; 5]);

impl<T> Index<Phase> for PerPhase<T> {
    type Output = T;
    fn index(&self, phase: Phase) -> &T {
        &self.0[phase.index()]
    }
}

impl<T> IndexMut<Phase> for PerPhase<T> {
    fn index_mut(&mut self, phase: Phase) -> &mut T {
        &mut self.0[phase.index()]
    }
}

/// Transition thresholds. Defaults match the observed firmware timing.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Minimum time in Animation before Connecting can be considered.
    pub animation_min_elapsed: Duration,
    /// Rolling tag-mismatch rate must fall below this to leave Animation.
    pub mismatch_rate_ceiling: f32,
    /// Consecutive good CSWs required to promote Connecting to Connected.
    pub connected_after_ok: u32,
    /// CSW silence in Connected after which the firmware shows its
    /// "connection lost" screen.
    pub silence_timeout: Duration,
    /// The firmware's own countdown from Disconnected back to Animation.
    pub disconnected_restart: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            animation_min_elapsed: Duration::from_secs(55),
            mismatch_rate_ceiling: 0.5,
            connected_after_ok: 3,
            silence_timeout: Duration::from_secs(5),
            disconnected_restart: Duration::from_secs(10),
        }
    }
}

/// Counters kept per phase, both since phase entry and cumulatively.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseCounters {
    /// Commands issued.
    pub commands: u64,
    /// CSWs with status 0.
    pub successes: u64,
    /// CSWs whose tag did not echo exactly.
    pub tag_mismatches: u64,
    /// Endpoint stalls observed.
    pub pipe_errors: u64,
    /// Transfer-stage timeouts observed.
    pub timeouts: u64,
    /// CSWs with the undocumented status 2. Tracked separately so the
    /// "Condition Met" pattern seen during Animation stays visible.
    pub phase_errors: u64,
}

/// What the orchestrator or keep-alive observed in one exchange.
#[derive(Debug, Clone, Copy)]
pub enum Observation {
    /// A CSW was decoded. `accepted` is the tag verdict under the current
    /// policy; `exact` is raw equality, which feeds the mismatch counters.
    Csw { status: u8, accepted: bool, exact: bool },
    PipeError,
    Timeout,
    DeviceGone,
    /// The device re-enumerated after being gone.
    Reenumerated,
}

/// The phase block: current phase, entry bookkeeping, and counters.
#[derive(Debug)]
pub struct Lifecycle {
    config: LifecycleConfig,
    phase: Phase,
    entered_at: Instant,
    since_entry: PhaseCounters,
    totals: PerPhase<PhaseCounters>,
    last_csw_at: Option<Instant>,
    consecutive_ok: u32,
    transitions: u64,
}

impl Lifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Lifecycle {
            config,
            phase: Phase::Unknown,
            entered_at: Instant::now(),
            since_entry: PhaseCounters::default(),
            totals: PerPhase::default(),
            last_csw_at: None,
            consecutive_ok: 0,
            transitions: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed_in_phase(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn time_since_last_csw(&self) -> Option<Duration> {
        self.last_csw_at.map(|t| t.elapsed())
    }

    /// Counters for the current phase since it was entered.
    pub fn since_entry(&self) -> &PhaseCounters {
        &self.since_entry
    }

    /// Cumulative counters across all visits to each phase.
    pub fn totals(&self) -> &PerPhase<PhaseCounters> {
        &self.totals
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Called at the start of every transport operation. The first one
    /// after `open` moves Unknown to Animation.
    pub fn on_operation_start(&mut self) {
        if self.phase == Phase::Unknown {
            self.transition(Phase::Animation);
        }
    }

    /// Counts a command actually put on the wire.
    pub fn count_command(&mut self) {
        self.count(|c| c.commands += 1);
    }

    /// Wall-clock transitions. `mismatch_rate` is the tag monitor's rolling
    /// window, consulted for the Animation exit.
    pub fn tick(&mut self, mismatch_rate: f32) {
        match self.phase {
            Phase::Animation => {
                if self.entered_at.elapsed() >= self.config.animation_min_elapsed
                    && mismatch_rate < self.config.mismatch_rate_ceiling
                {
                    self.transition(Phase::Connecting);
                }
            }
            Phase::Connected => {
                let silent = self
                    .last_csw_at
                    .unwrap_or(self.entered_at)
                    .elapsed();
                if silent >= self.config.silence_timeout {
                    self.transition(Phase::Disconnected);
                }
            }
            Phase::Disconnected => {
                // The firmware restarts its animation on its own after the
                // countdown, whether or not the host noticed.
                if self.entered_at.elapsed() >= self.config.disconnected_restart {
                    self.transition(Phase::Animation);
                }
            }
            Phase::Unknown | Phase::Connecting => {}
        }
    }

    /// Event-driven transitions and counter updates.
    pub fn observe(&mut self, obs: Observation) {
        match obs {
            Observation::Csw { status, accepted, exact } => {
                self.last_csw_at = Some(Instant::now());
                if status == CSW_STATUS_PASSED {
                    self.count(|c| c.successes += 1);
                }
                if status == CSW_STATUS_PHASE_ERROR {
                    self.count(|c| c.phase_errors += 1);
                }
                if !exact {
                    self.count(|c| c.tag_mismatches += 1);
                }
                if status == CSW_STATUS_PASSED && accepted {
                    self.consecutive_ok += 1;
                    if self.phase == Phase::Connecting
                        && self.consecutive_ok >= self.config.connected_after_ok
                    {
                        self.transition(Phase::Connected);
                    }
                } else {
                    self.consecutive_ok = 0;
                }
            }
            Observation::PipeError => self.count(|c| c.pipe_errors += 1),
            Observation::Timeout => self.count(|c| c.timeouts += 1),
            Observation::DeviceGone => {
                if self.phase != Phase::Disconnected {
                    self.transition(Phase::Disconnected);
                }
            }
            Observation::Reenumerated => {
                if self.phase == Phase::Disconnected {
                    self.transition(Phase::Animation);
                }
            }
        }
    }

    /// Forced return to Unknown: `close`, re-`open`, or a device reset.
    pub fn force_unknown(&mut self) {
        self.transition(Phase::Unknown);
        self.last_csw_at = None;
    }

    fn transition(&mut self, to: Phase) {
        if to == self.phase {
            return;
        }
        log::info!(
            "lifecycle: {} -> {} after {:?} ({} commands, {} ok, {} tag mismatches)",
            self.phase,
            to,
            self.entered_at.elapsed(),
            self.since_entry.commands,
            self.since_entry.successes,
            self.since_entry.tag_mismatches,
        );
        self.phase = to;
        self.entered_at = Instant::now();
        self.since_entry = PhaseCounters::default();
        self.consecutive_ok = 0;
        self.transitions += 1;
    }

    fn count(&mut self, f: impl Fn(&mut PhaseCounters)) {
        f(&mut self.since_entry);
        f(&mut self.totals[self.phase]);
    }
}
