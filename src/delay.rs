//! Rolling per-tier delivery latency and the congestion advisory built on it.
//!
//! Each priority tier keeps only its most recent [`WINDOW`] samples.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Samples retained per tier.
pub const WINDOW: usize = 20;

#[derive(Debug, Default)]
pub struct DelayTracker {
    tiers: Mutex<BTreeMap<u32, VecDeque<f64>>>,
}

impl DelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, VecDeque<f64>>> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capture(&self, tier: u32, latency_secs: f64) {
        let mut tiers = self.lock();
        let samples = tiers.entry(tier).or_default();
        if samples.len() >= WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency_secs);
        debug!(tier, latency_secs, samples = samples.len(), "Captured delay");
    }

    /// Mean of the retained samples for `tier`, 0 when there are none.
    pub fn average(&self, tier: u32) -> f64 {
        let mut tiers = self.lock();
        let samples = tiers.entry(tier).or_default();
        mean(samples)
    }

    pub fn reset(&self) {
        self.lock().clear();
        debug!("Delay samples reset");
    }

    /// Tiers with a non-zero average, ascending.
    pub fn active_tiers(&self) -> Vec<(u32, f64)> {
        self.lock()
            .iter()
            .map(|(tier, samples)| (*tier, mean(samples)))
            .filter(|(_, avg)| *avg != 0.0)
            .collect()
    }

    pub fn samples(&self, tier: u32) -> Vec<f64> {
        self.lock()
            .get(&tier)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvisoryThresholds {
    /// Average (seconds) above which a tier counts as congested.
    pub congested_secs: f64,
    /// The advisory is suppressed when the next tier averages more than this.
    pub next_tier_ceiling_secs: f64,
}

impl Default for AdvisoryThresholds {
    fn default() -> Self {
        AdvisoryThresholds {
            congested_secs: 300.0,
            next_tier_ceiling_secs: 150.0,
        }
    }
}

/// Suggestion to upgrade priority, produced when a tier is congested and the
/// next tier up is not.
#[derive(Debug, Clone, PartialEq)]
pub struct Advisory {
    pub tier: u32,
    pub average_secs: f64,
    pub queued: usize,
}

pub fn congestion_advisory(
    tracker: &DelayTracker,
    thresholds: &AdvisoryThresholds,
    tier: u32,
    queued: usize,
) -> Option<Advisory> {
    let average_secs = tracker.average(tier);
    if average_secs <= thresholds.congested_secs {
        return None;
    }
    let next = tracker.average(tier.saturating_add(1));
    if next > thresholds.next_tier_ceiling_secs {
        debug!(tier, average_secs, next, "Next tier congested too, no advisory");
        return None;
    }
    Some(Advisory {
        tier,
        average_secs,
        queued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(tracker: &DelayTracker, tier: u32, value: f64) {
        for _ in 0..WINDOW {
            tracker.capture(tier, value);
        }
    }

    #[test]
    fn average_of_empty_tier_is_zero() {
        let tracker = DelayTracker::new();
        assert_eq!(tracker.average(7), 0.0);
        assert_eq!(tracker.average(7), 0.0);
        assert!(tracker.active_tiers().is_empty());
    }

    #[test]
    fn average_is_mean_of_samples() {
        let tracker = DelayTracker::new();
        for d in [10.0, 20.0, 30.0] {
            tracker.capture(1, d);
        }
        assert_eq!(tracker.average(1), 20.0);
        assert_eq!(tracker.average(0), 0.0);
    }

    #[test]
    fn window_keeps_most_recent_twenty() {
        let tracker = DelayTracker::new();
        for d in 0..25 {
            tracker.capture(0, d as f64);
        }
        let samples = tracker.samples(0);
        assert_eq!(samples.len(), WINDOW);
        assert_eq!(samples.first(), Some(&5.0));
        assert_eq!(samples.last(), Some(&24.0));
        assert_eq!(tracker.average(0), (5..25).sum::<i32>() as f64 / 20.0);
    }

    #[test]
    fn reset_clears_every_tier() {
        let tracker = DelayTracker::new();
        tracker.capture(0, 5.0);
        tracker.capture(3, 9.0);
        assert_eq!(tracker.active_tiers(), vec![(0, 5.0), (3, 9.0)]);
        tracker.reset();
        assert_eq!(tracker.average(0), 0.0);
        assert_eq!(tracker.average(3), 0.0);
    }

    #[test]
    fn advisory_when_next_tier_is_fast() {
        let tracker = DelayTracker::new();
        fill(&tracker, 0, 400.0);
        fill(&tracker, 1, 100.0);
        let advisory = congestion_advisory(&tracker, &AdvisoryThresholds::default(), 0, 42);
        assert_eq!(
            advisory,
            Some(Advisory {
                tier: 0,
                average_secs: 400.0,
                queued: 42
            })
        );
    }

    #[test]
    fn advisory_suppressed_when_next_tier_is_slow() {
        let tracker = DelayTracker::new();
        fill(&tracker, 0, 400.0);
        fill(&tracker, 1, 200.0);
        assert_eq!(
            congestion_advisory(&tracker, &AdvisoryThresholds::default(), 0, 42),
            None
        );
    }

    #[test]
    fn no_advisory_at_threshold() {
        let tracker = DelayTracker::new();
        fill(&tracker, 2, 300.0);
        assert_eq!(
            congestion_advisory(&tracker, &AdvisoryThresholds::default(), 2, 1),
            None
        );
    }
}
