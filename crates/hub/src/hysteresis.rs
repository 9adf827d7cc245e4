//! Threshold-hysteresis inference of a relay's on/off state from power
//! samples.
//!
//! Two thresholds keep the relay from chattering around a single boundary:
//! an "off" relay turns on once power reaches `on_threshold`, an "on" relay
//! turns off once power drops to `off_threshold`.
//!
//! ```text
//!            [first sample >= on_threshold]
//!   Off ───────────────────────────────────────▶ On
//!    ▲                                            │
//!    └──────[first sample <= off_threshold]───────┘
//! ```
//!
//! The batch is scanned oldest first for the *first* crossing so that the
//! transition is timestamped when it happened, not when it was polled.

use chrono::{DateTime, Utc};

use crate::source::Sample;

/// Last known (or newly derived) state of the relay behind a power sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayState {
    pub is_on: bool,
    pub effective_at: DateTime<Utc>,
}

/// Result of one inference: the relay state to publish and the power reading
/// to publish alongside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inference {
    pub relay: RelayState,
    pub latest_power: Sample,
}

impl Inference {
    /// True when the derived state differs from a known previous state.
    pub fn is_transition(&self, previous: Option<RelayState>) -> bool {
        previous.is_some_and(|p| p.is_on != self.relay.is_on)
    }
}

/// Derive the next relay state from `samples` (oldest first).
///
/// Returns `None` for an empty batch; callers skip publishing entirely in
/// that case. Every non-empty batch yields a result, including when the
/// state is unchanged, so the relay series keeps a steady heartbeat.
pub fn infer(
    previous: Option<RelayState>,
    samples: &[Sample],
    on_threshold: f64,
    off_threshold: f64,
) -> Option<Inference> {
    let latest = *samples.last()?;

    let relay = match previous.map(|p| p.is_on) {
        // First evaluation for this sensor: no history to apply hysteresis to.
        None => RelayState {
            is_on: samples.iter().any(|s| s.value >= on_threshold),
            effective_at: latest.timestamp,
        },
        Some(true) => first_crossing(samples, |v| v <= off_threshold)
            .map(|at| RelayState {
                is_on: false,
                effective_at: at,
            })
            .unwrap_or(RelayState {
                is_on: true,
                effective_at: latest.timestamp,
            }),
        Some(false) => first_crossing(samples, |v| v >= on_threshold)
            .map(|at| RelayState {
                is_on: true,
                effective_at: at,
            })
            .unwrap_or(RelayState {
                is_on: false,
                effective_at: latest.timestamp,
            }),
    };

    Some(Inference {
        relay,
        latest_power: latest,
    })
}

fn first_crossing(samples: &[Sample], crossed: impl Fn(f64) -> bool) -> Option<DateTime<Utc>> {
    samples
        .iter()
        .find(|s| crossed(s.value))
        .map(|s| s.timestamp)
}

// ===========================================================================
// Tests
// ===========================================================================
