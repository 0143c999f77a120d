//! Command tag allocation and validation.
//!
//! The device echoes the CBW tag in each CSW, except when it doesn't: the
//! firmware resets its own counter at unpredictable points and answers with
//! stale or restarted tags while its boot animation runs. The monitor owns
//! the host-side counter, keeps a short history for diagnosis, and applies
//! a validation policy that loosens or tightens with the lifecycle phase.

use std::collections::VecDeque;

use crate::lifecycle::Phase;

/// Bounded history depth; tags are never reused within this horizon.
pub const TAG_HISTORY_LEN: usize = 50;

/// Rolling window used for the mismatch-rate transition trigger.
const MISMATCH_WINDOW: usize = 20;

/// `actual < 5` while `expected > 100` is the known device-reset pattern.
const RESET_ACTUAL_CEILING: u32 = 5;
const RESET_EXPECTED_FLOOR: u32 = 100;

/// Tolerated tag drift while the device settles out of its animation.
const CONNECTING_TAG_WINDOW: u32 = 10;

/// Verdict for one echoed tag under the current phase policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagValidation {
    /// Exact match, or a mismatch the phase policy tolerates.
    Accept,
    /// A mismatch the phase policy rejects.
    Mismatch,
    /// Low echoed tag against a high counter: the device restarted its
    /// counter. The caller should rebase and treat the exchange as good.
    SuspectedReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    /// Allocated, CSW not yet observed.
    Pending,
    Matched,
    Mismatched,
    Reset,
}

/// One allocation in the history ring.
#[derive(Debug, Clone, Copy)]
pub struct TagRecord {
    pub tag: u32,
    pub echoed: Option<u32>,
    pub phase: Phase,
    pub outcome: TagOutcome,
}

/// Snapshot of monitor state for `Transport::statistics`.
#[derive(Debug, Clone)]
pub struct TagSummary {
    pub next_tag: u32,
    pub validated: u64,
    pub mismatches: u64,
    pub rebases: u64,
    pub recent_mismatch_rate: f32,
    pub history_depth: usize,
}

/// Owns the "next tag to assign" counter and the mismatch bookkeeping.
#[derive(Debug)]
pub struct TagMonitor {
    next_tag: u32,
    history: VecDeque<TagRecord>,
    /// true = mismatch, most recent at the back.
    recent: VecDeque<bool>,
    validated: u64,
    mismatches: u64,
    rebases: u64,
}

impl Default for TagMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TagMonitor {
    pub fn new() -> Self {
        TagMonitor {
            next_tag: 1,
            history: VecDeque::with_capacity(TAG_HISTORY_LEN),
            recent: VecDeque::with_capacity(MISMATCH_WINDOW),
            validated: 0,
            mismatches: 0,
            rebases: 0,
        }
    }

    /// Returns the next tag and records it as pending in the ring.
    pub fn next(&mut self, phase: Phase) -> u32 {
        let tag = self.next_tag;
        self.next_tag = match self.next_tag.wrapping_add(1) {
            // Tag 0 is avoided: several firmwares treat it as "no tag".
            0 => 1,
            t => t,
        };
        if self.history.len() == TAG_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(TagRecord {
            tag,
            echoed: None,
            phase,
            outcome: TagOutcome::Pending,
        });
        tag
    }

    /// Judges an echoed tag under the policy for `phase`.
    ///
    /// The reset heuristic runs first regardless of phase; a
    /// [`TagValidation::SuspectedReset`] must be answered with
    /// [`TagMonitor::rebase`] by the caller.
    pub fn validate(&mut self, expected: u32, actual: u32, phase: Phase) -> TagValidation {
        self.validated += 1;
        let exact = expected == actual;
        if self.recent.len() == MISMATCH_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(!exact);

        if exact {
            self.resolve(expected, actual, TagOutcome::Matched);
            return TagValidation::Accept;
        }

        self.mismatches += 1;
        if actual < RESET_ACTUAL_CEILING && expected > RESET_EXPECTED_FLOOR {
            self.resolve(expected, actual, TagOutcome::Reset);
            return TagValidation::SuspectedReset;
        }

        let verdict = match phase {
            // While the animation runs the device answers with whatever its
            // own counter holds; recorded, never rejected.
            Phase::Animation | Phase::Disconnected | Phase::Unknown => TagValidation::Accept,
            Phase::Connecting => {
                if expected.abs_diff(actual) < CONNECTING_TAG_WINDOW {
                    TagValidation::Accept
                } else {
                    TagValidation::Mismatch
                }
            }
            Phase::Connected => TagValidation::Mismatch,
        };
        self.resolve(expected, actual, TagOutcome::Mismatched);
        verdict
    }

    /// Rebase after a detected device-side counter reset: continue from
    /// `actual + 1` and flush the ring, since prior entries no longer
    /// correspond to anything the device remembers.
    pub fn rebase(&mut self, actual: u32) {
        log::info!(
            "device tag counter reset detected (host at {}, device answered {}); rebasing",
            self.next_tag,
            actual
        );
        self.next_tag = match actual.wrapping_add(1) {
            0 => 1,
            t => t,
        };
        self.history.clear();
        self.rebases += 1;
    }

    /// Back to the power-on state. Used on `close` and after a device reset.
    pub fn reset(&mut self) {
        self.next_tag = 1;
        self.history.clear();
        self.recent.clear();
    }

    /// Mismatch rate over the last [`MISMATCH_WINDOW`] CSWs; 0.0 when no
    /// CSW has been observed yet.
    pub fn recent_mismatch_rate(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let mismatched = self.recent.iter().filter(|&&m| m).count();
        mismatched as f32 / self.recent.len() as f32
    }

    pub fn summary(&self) -> TagSummary {
        TagSummary {
            next_tag: self.next_tag,
            validated: self.validated,
            mismatches: self.mismatches,
            rebases: self.rebases,
            recent_mismatch_rate: self.recent_mismatch_rate(),
            history_depth: self.history.len(),
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &TagRecord> {
        self.history.iter()
    }

    fn resolve(&mut self, expected: u32, actual: u32, outcome: TagOutcome) {
        if let Some(rec) = self.history.iter_mut().rev().find(|r| r.tag == expected) {
            rec.echoed = Some(actual);
            rec.outcome = outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_start_at_one_and_increase() {
        let mut mon = TagMonitor::new();
        let tags: Vec<u32> = (0..10).map(|_| mon.next(Phase::Animation)).collect();
        assert_eq!(tags, (1..=10).collect::<Vec<u32>>());
    }

    #[test]
    fn counter_skips_zero_on_wrap() {
        let mut mon = TagMonitor::new();
        mon.next_tag = u32::MAX;
        assert_eq!(mon.next(Phase::Connected), u32::MAX);
        assert_eq!(mon.next(Phase::Connected), 1);
    }

    #[test]
    fn animation_accepts_any_tag() {
        let mut mon = TagMonitor::new();
        let tag = mon.next(Phase::Animation);
        assert_eq!(
            mon.validate(tag, tag.wrapping_add(9999), Phase::Animation),
            TagValidation::Accept
        );
        assert_eq!(mon.summary().mismatches, 1);
    }

    #[test]
    fn connecting_tolerates_small_drift() {
        let mut mon = TagMonitor::new();
        for _ in 0..30 {
            mon.next(Phase::Connecting);
        }
        assert_eq!(mon.validate(30, 25, Phase::Connecting), TagValidation::Accept);
        assert_eq!(mon.validate(30, 39, Phase::Connecting), TagValidation::Accept);
        assert_eq!(mon.validate(30, 40, Phase::Connecting), TagValidation::Mismatch);
        assert_eq!(mon.validate(30, 20, Phase::Connecting), TagValidation::Mismatch);
    }

    #[test]
    fn connected_requires_exact_match() {
        let mut mon = TagMonitor::new();
        let tag = mon.next(Phase::Connected);
        assert_eq!(mon.validate(tag, tag, Phase::Connected), TagValidation::Accept);
        let tag = mon.next(Phase::Connected);
        assert_eq!(
            mon.validate(tag, tag + 1, Phase::Connected),
            TagValidation::Mismatch
        );
    }

    #[test]
    fn reset_heuristic_fires_and_rebases() {
        let mut mon = TagMonitor::new();
        mon.next_tag = 150;
        let tag = mon.next(Phase::Connected);
        assert_eq!(tag, 150);
        assert_eq!(mon.validate(tag, 3, Phase::Connected), TagValidation::SuspectedReset);
        mon.rebase(3);
        assert_eq!(mon.next(Phase::Connected), 4);
        assert_eq!(mon.history().count(), 1, "ring flushed on rebase");
        assert_eq!(mon.summary().rebases, 1);
    }

    #[test]
    fn reset_heuristic_needs_high_expected() {
        let mut mon = TagMonitor::new();
        // Low counter + low echo is an ordinary Animation-phase mismatch.
        let tag = mon.next(Phase::Animation);
        assert_eq!(mon.validate(tag, 2, Phase::Animation), TagValidation::Accept);
        assert_eq!(mon.summary().rebases, 0);
    }

    #[test]
    fn mismatch_rate_rolls_over_window() {
        let mut mon = TagMonitor::new();
        for i in 0..MISMATCH_WINDOW as u32 {
            let tag = mon.next(Phase::Animation);
            // First half mismatches, second half matches.
            let echo = if i < 10 { tag + 100 } else { tag };
            mon.validate(tag, echo, Phase::Animation);
        }
        assert!((mon.recent_mismatch_rate() - 0.5).abs() < f32::EPSILON);
        // Ten more matches push the mismatches out of the window.
        for _ in 0..10 {
            let tag = mon.next(Phase::Animation);
            mon.validate(tag, tag, Phase::Animation);
        }
        assert_eq!(mon.recent_mismatch_rate(), 0.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut mon = TagMonitor::new();
        for _ in 0..(TAG_HISTORY_LEN + 20) {
            mon.next(Phase::Connected);
        }
        assert_eq!(mon.history().count(), TAG_HISTORY_LEN);
    }
}
