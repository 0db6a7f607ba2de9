//! Per-sample anomaly detection for the telemetry stream.
//!
//! Two failure modes observed in real recordings are tracked independently:
//! distance stagnation (the cumulative distance field freezes during FIT
//! playback or GPS signal loss) and pace volatility (sample-to-sample pace
//! ratios outside `[0.5, 2.0]` from GPS position jumps). Either axis can
//! suppress predictions; both thresholds count *consecutive* occurrences and
//! reset the instant the pattern breaks.

use serde::{Deserialize, Serialize};

use crate::{pace_is_sane, MAX_REASONABLE_PACE, MIN_REASONABLE_PACE};

/// Distance deltas below this are treated as "unchanged".
pub const DISTANCE_EPSILON_M: f64 = 0.001;
/// Consecutive unchanged-distance samples before suppression.
pub const STAGNATION_THRESHOLD: u32 = 5;
/// Consecutive out-of-ratio pace samples before suppression.
pub const PACE_SPIKE_THRESHOLD: u32 = 3;
/// Inclusive pace ratio band considered ordinary variation.
pub const PACE_RATIO_MIN: f64 = 0.5;
pub const PACE_RATIO_MAX: f64 = 2.0;

/// Outcome of one detection step: whether a prediction may be shown, plus an
/// ordered diagnostic trail. The trail is advisory only and never drives
/// control flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub show: bool,
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn trail(&self) -> String {
        self.reasons.join(" -> ")
    }
}

/// Mutable detector state, one instance per activity stream.
///
/// Created zeroed at activity start, mutated exactly once per processed
/// sample by [`DetectorState::evaluate`], and rezeroed by
/// [`DetectorState::reset`] on activity restart. Never share an instance
/// across concurrent activities.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectorState {
    last_valid_distance: f64,
    distance_stagnation_count: u32,
    last_valid_pace: f64,
    pace_anomaly_count: u32,
}

impl DetectorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all counters and last-valid values; called on activity
    /// (re)start, manual reset, or recording resume after a stop.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn last_valid_distance(&self) -> f64 {
        self.last_valid_distance
    }

    pub fn stagnation_count(&self) -> u32 {
        self.distance_stagnation_count
    }

    pub fn last_valid_pace(&self) -> f64 {
        self.last_valid_pace
    }

    pub fn spike_count(&self) -> u32 {
        self.pace_anomaly_count
    }

    /// Evaluate one sample and decide whether predictions may be shown.
    ///
    /// The stages run in a fixed order and the first suppressing stage
    /// short-circuits the rest: pace sanity bounds, then distance
    /// stagnation, then pace volatility. When a stage suppresses, its
    /// last-valid value is deliberately left frozen so the counter keeps
    /// incrementing on every subsequent identical sample instead of
    /// resetting.
    pub fn evaluate(&mut self, distance_m: f64, pace_s_per_m: f64) -> Verdict {
        let mut reasons = Vec::new();

        // Sanity-check pace before any stateful reasoning; a single insane
        // sample must not corrupt the counters.
        if !pace_is_sane(pace_s_per_m) {
            reasons.push(format!(
                "pace {:.3} s/m out of physiological bounds ({}-{})",
                pace_s_per_m, MIN_REASONABLE_PACE, MAX_REASONABLE_PACE
            ));
            return Verdict {
                show: false,
                reasons,
            };
        }

        // Axis 1: distance stagnation.
        if (distance_m - self.last_valid_distance).abs() < DISTANCE_EPSILON_M {
            self.distance_stagnation_count += 1;
            reasons.push(format!(
                "distance stagnation {}/{}",
                self.distance_stagnation_count, STAGNATION_THRESHOLD
            ));
            if self.distance_stagnation_count >= STAGNATION_THRESHOLD {
                reasons.push("distance frozen".to_string());
                return Verdict {
                    show: false,
                    reasons,
                };
            }
        } else {
            // Any meaningful change resets the run, including a distance
            // decrease: the lower value becomes the new baseline. Known gap,
            // kept for compatibility with the original logic.
            self.distance_stagnation_count = 0;
            self.last_valid_distance = distance_m;
        }

        // Axis 2: pace volatility. The very first accepted sample passes
        // trivially since no prior pace exists.
        if self.last_valid_pace > 0.0 {
            let ratio = pace_s_per_m / self.last_valid_pace;
            if ratio > PACE_RATIO_MAX || ratio < PACE_RATIO_MIN {
                self.pace_anomaly_count += 1;
                reasons.push(format!(
                    "pace spike ratio {:.2} ({}/{})",
                    ratio, self.pace_anomaly_count, PACE_SPIKE_THRESHOLD
                ));
                if self.pace_anomaly_count >= PACE_SPIKE_THRESHOLD {
                    reasons.push("repeated pace spikes".to_string());
                    return Verdict {
                        show: false,
                        reasons,
                    };
                }
            } else {
                self.pace_anomaly_count = 0;
            }
        }

        self.last_valid_pace = pace_s_per_m;
        reasons.push("normal".to_string());
        Verdict {
            show: true,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insane_pace_rejected_without_mutation() {
        let mut state = DetectorState::new();
        state.evaluate(500.0, 0.1);
        assert_eq!(state.last_valid_distance(), 500.0);
        assert_eq!(state.last_valid_pace(), 0.1);

        for pace in [0.03, 25.0, 0.0, -0.5, f64::NAN] {
            let verdict = state.evaluate(600.0, pace);
            assert!(!verdict.show, "pace {} must suppress", pace);
            assert_eq!(state.last_valid_distance(), 500.0);
            assert_eq!(state.last_valid_pace(), 0.1);
            assert_eq!(state.stagnation_count(), 0);
            assert_eq!(state.spike_count(), 0);
        }
    }

    #[test]
    fn test_normal_run_never_suppresses() {
        let mut state = DetectorState::new();
        let samples = [
            (103.20, 0.097),
            (207.21, 0.096),
            (311.32, 0.096),
            (415.53, 0.096),
            (519.74, 0.096),
            (623.95, 0.096),
        ];
        for (dist, pace) in samples {
            let verdict = state.evaluate(dist, pace);
            assert!(verdict.show, "suppressed at {} m: {}", dist, verdict.trail());
        }
        assert_eq!(state.stagnation_count(), 0);
        assert_eq!(state.spike_count(), 0);
    }

    #[test]
    fn test_distance_freeze_suppresses_on_fifth_repeat() {
        let mut state = DetectorState::new();
        // First sample establishes the baseline; stagnation counting starts
        // on the repeat.
        assert!(state.evaluate(1539.78, 0.385).show);
        let paces = [0.392, 0.400, 0.408, 0.417, 0.426, 0.435];
        for (i, pace) in paces.iter().enumerate() {
            let verdict = state.evaluate(1539.78, *pace);
            let count = i as u32 + 1;
            assert_eq!(state.stagnation_count(), count);
            if count < STAGNATION_THRESHOLD {
                assert!(verdict.show, "sample {} should still show", count);
            } else {
                assert!(!verdict.show, "sample {} should suppress", count);
                assert!(verdict.trail().contains("distance frozen"));
            }
        }
        // Still frozen on the next identical sample.
        assert!(!state.evaluate(1539.78, 0.444).show);
        assert_eq!(state.stagnation_count(), 7);
    }

    #[test]
    fn test_freeze_recovery_resets_stagnation() {
        let mut state = DetectorState::new();
        state.evaluate(600.0, 0.1);
        for _ in 0..5 {
            state.evaluate(600.0, 0.1);
        }
        assert_eq!(state.stagnation_count(), 5);
        assert_eq!(state.last_valid_distance(), 600.0);

        // Distance jumps after signal recovery: counter resets, sample shows.
        let verdict = state.evaluate(650.0, 0.1);
        assert!(verdict.show);
        assert_eq!(state.stagnation_count(), 0);
        assert_eq!(state.last_valid_distance(), 650.0);
    }

    #[test]
    fn test_frozen_last_valid_distance_keeps_counting() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.1);
        for expected in 1..=8u32 {
            state.evaluate(1000.0, 0.1);
            assert_eq!(state.stagnation_count(), expected);
        }
        assert_eq!(state.last_valid_distance(), 1000.0);
    }

    #[test]
    fn test_three_consecutive_spikes_suppress() {
        let mut state = DetectorState::new();
        assert!(state.evaluate(1000.0, 0.100).show);
        // Sub-threshold spikes still show and still advance the baseline
        // pace, exactly like the original logic.
        let v1 = state.evaluate(1050.0, 0.250);
        assert!(v1.show);
        assert_eq!(state.spike_count(), 1);
        assert_eq!(state.last_valid_pace(), 0.250);

        let v2 = state.evaluate(1100.0, 0.090);
        assert!(v2.show);
        assert_eq!(state.spike_count(), 2);

        let v3 = state.evaluate(1150.0, 0.200);
        assert!(!v3.show);
        assert!(v3.trail().contains("repeated pace spikes"));
        assert_eq!(state.spike_count(), 3);
        // Suppression freezes the baseline pace.
        assert_eq!(state.last_valid_pace(), 0.090);
    }

    #[test]
    fn test_in_band_ratio_resets_spike_counter() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        state.evaluate(1050.0, 0.250);
        state.evaluate(1100.0, 0.090);
        assert_eq!(state.spike_count(), 2);

        // Ratio back inside [0.5, 2.0] resets the run before it trips.
        let verdict = state.evaluate(1150.0, 0.100);
        assert!(verdict.show);
        assert_eq!(state.spike_count(), 0);
        assert_eq!(state.last_valid_pace(), 0.100);

        // A later excursion starts over from 1, not from where it left off.
        state.evaluate(1200.0, 0.300);
        assert_eq!(state.spike_count(), 1);
    }

    #[test]
    fn test_spike_recovery_after_suppression() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        state.evaluate(1050.0, 0.250);
        state.evaluate(1100.0, 0.090);
        assert!(!state.evaluate(1150.0, 0.200).show);

        // Baseline stayed at 0.090, so a matching pace is in-band again.
        let verdict = state.evaluate(1200.0, 0.095);
        assert!(verdict.show);
        assert_eq!(state.spike_count(), 0);
    }

    #[test]
    fn test_ratio_bounds_are_inclusive() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        // Exactly half / double the baseline is ordinary variation.
        assert!(state.evaluate(1050.0, 0.050).show);
        assert_eq!(state.spike_count(), 0);
        assert!(state.evaluate(1100.0, 0.100).show);
        assert_eq!(state.spike_count(), 0);
    }

    #[test]
    fn test_distance_suppression_leaves_pace_axis_alone() {
        let mut state = DetectorState::new();
        state.evaluate(600.0, 0.100);
        for _ in 0..4 {
            state.evaluate(600.0, 0.100);
        }
        assert_eq!(state.stagnation_count(), 4);

        // The fifth repeat suppresses on the distance axis before the pace
        // check runs; a wild (but sane) pace on that sample must not be
        // counted or adopted as the new baseline.
        let verdict = state.evaluate(600.0, 1.5);
        assert!(!verdict.show);
        assert_eq!(state.stagnation_count(), 5);
        assert_eq!(state.spike_count(), 0);
        assert_eq!(state.last_valid_pace(), 0.100);
    }

    #[test]
    fn test_sporadic_single_sample_stalls_show() {
        let mut state = DetectorState::new();
        let samples = [
            (100.00, 0.100),
            (100.50, 0.101),
            (100.50, 0.102),
            (101.00, 0.103),
            (101.00, 0.104),
            (101.50, 0.105),
        ];
        for (dist, pace) in samples {
            assert!(state.evaluate(dist, pace).show);
        }
        assert_eq!(state.stagnation_count(), 0);
    }

    #[test]
    fn test_distance_decrease_accepted_as_new_baseline() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        state.evaluate(1000.0, 0.100);
        assert_eq!(state.stagnation_count(), 1);

        // Odometer rollback: treated as an ordinary change.
        let verdict = state.evaluate(900.0, 0.100);
        assert!(verdict.show);
        assert_eq!(state.stagnation_count(), 0);
        assert_eq!(state.last_valid_distance(), 900.0);
    }

    #[test]
    fn test_reset_rezeroes_state() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        state.evaluate(1000.0, 0.250);
        state.reset();
        assert_eq!(state.last_valid_distance(), 0.0);
        assert_eq!(state.stagnation_count(), 0);
        assert_eq!(state.last_valid_pace(), 0.0);
        assert_eq!(state.spike_count(), 0);

        // First sample after reset passes the pace axis trivially again.
        let verdict = state.evaluate(50.0, 0.400);
        assert!(verdict.show);
    }

    #[test]
    fn test_verdict_trail_ordering() {
        let mut state = DetectorState::new();
        state.evaluate(1000.0, 0.100);
        let verdict = state.evaluate(1000.0, 0.100);
        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.reasons[0].starts_with("distance stagnation"));
        assert_eq!(verdict.reasons[1], "normal");
    }
}
