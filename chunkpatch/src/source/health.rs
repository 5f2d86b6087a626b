//! Download health classification.
//!
//! Health is derived from the success rate of the most recent chunk
//! requests, except that a source which has requests in flight but has seen no
//! activity for the disconnected delay is reported as disconnected.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::HealthThresholds;

/// Number of recent request outcomes the success rate is computed over.
pub const HEALTH_SAMPLE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DownloadHealth {
    Disconnected,
    Poor,
    Ok,
    Good,
    #[default]
    Excellent,
}

impl DownloadHealth {
    pub const COUNT: usize = 5;

    pub const ALL: [DownloadHealth; Self::COUNT] = [
        Self::Disconnected,
        Self::Poor,
        Self::Ok,
        Self::Good,
        Self::Excellent,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Poor => "Poor",
            Self::Ok => "OK",
            Self::Good => "Good",
            Self::Excellent => "Excellent",
        }
    }
}

#[derive(Debug)]
pub struct DownloadHealthTracker {
    thresholds: HealthThresholds,
    disconnected_delay: Duration,
    outcomes: VecDeque<bool>,
    last_activity: Option<Instant>,
    current: DownloadHealth,
    since: Option<Instant>,
    times: [Duration; DownloadHealth::COUNT],
}

impl DownloadHealthTracker {
    pub fn new(thresholds: HealthThresholds, disconnected_delay: Duration) -> Self {
        Self {
            thresholds,
            disconnected_delay,
            outcomes: VecDeque::with_capacity(HEALTH_SAMPLE_SIZE),
            last_activity: None,
            current: DownloadHealth::Excellent,
            since: None,
            times: [Duration::ZERO; DownloadHealth::COUNT],
        }
    }

    pub fn record_outcome(&mut self, success: bool) {
        if self.outcomes.len() == HEALTH_SAMPLE_SIZE {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Note that requests were issued or data arrived.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Success rate over the recent outcomes, 1.0 with no samples.
    pub fn success_rate(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        successes as f32 / self.outcomes.len() as f32
    }

    pub fn classify(&self, now: Instant, downloading: bool) -> DownloadHealth {
        let stalled = self
            .last_activity
            .is_some_and(|t| now.saturating_duration_since(t) >= self.disconnected_delay);
        if downloading && stalled {
            return DownloadHealth::Disconnected;
        }

        let rate = self.success_rate();
        if rate >= self.thresholds.excellent {
            DownloadHealth::Excellent
        } else if rate >= self.thresholds.good {
            DownloadHealth::Good
        } else if rate >= self.thresholds.ok {
            DownloadHealth::Ok
        } else {
            DownloadHealth::Poor
        }
    }

    /// Reclassify at `now`, charging the elapsed time to the previous state.
    pub fn update(&mut self, now: Instant, downloading: bool) -> DownloadHealth {
        if let Some(since) = self.since {
            self.times[self.current.index()] += now.saturating_duration_since(since);
        }
        self.since = Some(now);

        let health = self.classify(now, downloading);
        if health != self.current {
            tracing::info!(
                from = self.current.name(),
                to = health.name(),
                success_rate = self.success_rate(),
                "Download health changed"
            );
            self.current = health;
        }
        health
    }

    pub fn current(&self) -> DownloadHealth {
        self.current
    }

    /// Time spent in each state, indexed by [`DownloadHealth::index`].
    pub fn times(&self) -> [Duration; DownloadHealth::COUNT] {
        self.times
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> DownloadHealthTracker {
        DownloadHealthTracker::new(HealthThresholds::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_no_samples_is_excellent() {
        let tracker = tracker();
        assert_eq!(tracker.classify(Instant::now(), false), DownloadHealth::Excellent);
    }

    #[test]
    fn test_success_rate_thresholds() {
        let mut tracker = tracker();
        let now = Instant::now();

        for _ in 0..96 {
            tracker.record_outcome(true);
        }
        for _ in 0..4 {
            tracker.record_outcome(false);
        }
        assert_eq!(tracker.classify(now, false), DownloadHealth::Good);

        for _ in 0..20 {
            tracker.record_outcome(false);
        }
        // 76 of the last 100 succeeded
        assert_eq!(tracker.classify(now, false), DownloadHealth::Ok);

        for _ in 0..10 {
            tracker.record_outcome(false);
        }
        assert_eq!(tracker.classify(now, false), DownloadHealth::Poor);
    }

    #[test]
    fn test_disconnected_only_while_downloading() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        tracker.record_activity(t0);

        let later = t0 + Duration::from_secs(5);
        assert_eq!(tracker.classify(later, true), DownloadHealth::Disconnected);
        assert_eq!(tracker.classify(later, false), DownloadHealth::Excellent);
        assert_eq!(
            tracker.classify(t0 + Duration::from_secs(4), true),
            DownloadHealth::Excellent
        );
    }

    #[test]
    fn test_time_in_state_accounting() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        tracker.record_activity(t0);

        tracker.update(t0, true);
        tracker.update(t0 + Duration::from_secs(2), true);
        assert_eq!(
            tracker.update(t0 + Duration::from_secs(6), true),
            DownloadHealth::Disconnected
        );
        tracker.update(t0 + Duration::from_secs(9), true);

        let times = tracker.times();
        assert_eq!(times[DownloadHealth::Excellent.index()], Duration::from_secs(6));
        assert_eq!(times[DownloadHealth::Disconnected.index()], Duration::from_secs(3));
    }
}
