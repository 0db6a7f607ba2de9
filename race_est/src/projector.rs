//! Finish-time projection from a sane `(elapsed_time, distance)` pair.
//!
//! Pure and stateless: safe to call on every sample the anomaly detector
//! allows, never to be called (nor trusted) while predictions are
//! suppressed.

use serde::{Deserialize, Serialize};

use crate::{pace_is_sane, MIN_PREDICTION_DISTANCE_M};

/// Why no estimate is available for the current sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unavailable {
    /// Cumulative distance below the warmup threshold (or no elapsed time).
    BelowWarmupDistance,
    /// Cumulative average pace outside physiological bounds.
    PaceOutOfBounds,
}

/// Outcome of one projection step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Projected seconds to cover the remaining distance to the target.
    Estimate(f64),
    /// The target distance has already been covered.
    AlreadyReached,
    /// No estimate can be shown; the caller displays a placeholder.
    NotAvailable(Unavailable),
}

impl Projection {
    /// The estimate in seconds, `0.0` once the target is reached, `None`
    /// when no estimate is available.
    pub fn seconds(&self) -> Option<f64> {
        match self {
            Projection::Estimate(s) => Some(*s),
            Projection::AlreadyReached => Some(0.0),
            Projection::NotAvailable(_) => None,
        }
    }
}

/// A named target distance for display.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Milestone {
    pub label: &'static str,
    pub target_m: f64,
}

/// Targets reported by the analyzer summary.
pub fn standard_milestones() -> [Milestone; 3] {
    [
        Milestone {
            label: "5K",
            target_m: 5000.0,
        },
        Milestone {
            label: "5 mi",
            target_m: 8046.72,
        },
        Milestone {
            label: "10K",
            target_m: 10_000.0,
        },
    ]
}

/// Project the finish time for `target_m` from cumulative elapsed seconds
/// and cumulative meters.
///
/// Guards mirror the on-device display logic: below the warmup distance or
/// with an insane cumulative pace the projection is withheld rather than
/// shown as a nonsense number. The estimate is never negative.
pub fn project(elapsed_s: f64, distance_m: f64, target_m: f64) -> Projection {
    if distance_m < MIN_PREDICTION_DISTANCE_M || elapsed_s <= 0.0 {
        return Projection::NotAvailable(Unavailable::BelowWarmupDistance);
    }
    let pace = elapsed_s / distance_m;
    if !pace_is_sane(pace) {
        return Projection::NotAvailable(Unavailable::PaceOutOfBounds);
    }
    let remaining = target_m - distance_m;
    if remaining > 0.0 {
        Projection::Estimate(remaining * pace)
    } else {
        Projection::AlreadyReached
    }
}
