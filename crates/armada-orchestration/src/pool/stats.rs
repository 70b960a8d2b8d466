//! Pool statistics and the adaptive sizing rule.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use armada_core::config::PoolSizing;

/// Snapshot returned by [`WorkerPool::statistics`](super::WorkerPool::statistics).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatistics {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// `hits / total_requests`, 0 before the first request.
    pub hit_rate: f64,
    /// Mean over the most recent allocation latencies.
    pub average_allocation_time: Duration,
    /// Idle instances across all types.
    pub current_size: usize,
    pub per_type: BTreeMap<String, TypeStatistics>,
}

/// Per worker type view.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeStatistics {
    pub size: usize,
    pub target_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sizing: PoolSizing,
}

/// Global request counters and the rolling latency window.
#[derive(Debug)]
pub(crate) struct AllocationStats {
    total_requests: u64,
    hits: u64,
    misses: u64,
    samples: VecDeque<Duration>,
    window: usize,
}

impl AllocationStats {
    pub(crate) fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            total_requests: 0,
            hits: 0,
            misses: 0,
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Count one request. `latency` is `None` for failed cold starts.
    pub(crate) fn record(&mut self, hit: bool, latency: Option<Duration>) {
        self.total_requests += 1;
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        if let Some(latency) = latency {
            if self.samples.len() == self.window {
                self.samples.pop_front();
            }
            self.samples.push_back(latency);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.window);
    }

    pub(crate) fn snapshot(&self) -> PoolStatistics {
        PoolStatistics {
            total_requests: self.total_requests,
            hits: self.hits,
            misses: self.misses,
            hit_rate: hit_rate(self.hits, self.misses).unwrap_or(0.0),
            average_allocation_time: self.average(),
            current_size: 0,
            per_type: BTreeMap::new(),
        }
    }
}

/// `hits / (hits + misses)`, or `None` before any request.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn hit_rate(hits: u64, misses: u64) -> Option<f64> {
    let total = hits + misses;
    (total > 0).then(|| hits as f64 / total as f64)
}

/// Idle instances a type should hold given its recent hit rate.
///
/// Above 0.9 the pool grows by one over `base_size`, below 0.5 it shrinks by
/// one, bounded by `max_size` and `min_size`. There is no hysteresis, so a
/// hit rate hovering at a threshold can flip the target between calls.
/// Types with no requests yet target `base_size`.
pub fn target_size(sizing: PoolSizing, hit_rate: Option<f64>) -> usize {
    match hit_rate {
        Some(rate) if rate > 0.9 => (sizing.base_size + 1).min(sizing.max_size),
        Some(rate) if rate < 0.5 => sizing.base_size.saturating_sub(1).max(sizing.min_size),
        _ => sizing.base_size,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const SIZING: PoolSizing = PoolSizing {
        base_size: 2,
        min_size: 1,
        max_size: 3,
    };

    #[test]
    fn hit_rate_is_exact_ratio() {
        let mut stats = AllocationStats::new(100);
        for _ in 0..7 {
            stats.record(true, Some(Duration::from_millis(1)));
        }
        for _ in 0..3 {
            stats.record(false, Some(Duration::from_millis(1)));
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 10);
        assert_eq!(snap.hit_rate, 7.0 / 10.0);
    }

    #[test]
    fn rolling_average_keeps_only_window() {
        let mut stats = AllocationStats::new(2);
        stats.record(false, Some(Duration::from_millis(100)));
        stats.record(true, Some(Duration::from_millis(10)));
        stats.record(true, Some(Duration::from_millis(20)));
        assert_eq!(stats.average(), Duration::from_millis(15));
    }

    #[test]
    fn failed_requests_count_without_latency() {
        let mut stats = AllocationStats::new(10);
        stats.record(false, None);
        let snap = stats.snapshot();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.average_allocation_time, Duration::ZERO);
    }

    #[test]
    fn reset_clears_counters() {
        let mut stats = AllocationStats::new(10);
        stats.record(true, Some(Duration::from_millis(5)));
        stats.reset();
        assert_eq!(stats.snapshot(), PoolStatistics::default());
    }

    #[test]
    fn target_grows_above_ninety_percent() {
        assert_eq!(target_size(SIZING, Some(0.95)), 3);
        let capped = PoolSizing {
            max_size: 2,
            ..SIZING
        };
        assert_eq!(target_size(capped, Some(1.0)), 2);
    }

    #[test]
    fn target_shrinks_below_half() {
        assert_eq!(target_size(SIZING, Some(0.2)), 1);
        let floor = PoolSizing {
            min_size: 2,
            ..SIZING
        };
        assert_eq!(target_size(floor, Some(0.0)), 2);
    }

    #[test]
    fn target_stays_at_base_between_thresholds() {
        assert_eq!(target_size(SIZING, Some(0.5)), 2);
        assert_eq!(target_size(SIZING, Some(0.9)), 2);
        assert_eq!(target_size(SIZING, None), 2);
    }
}
