//! Sliding-window throughput figures per pool.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fc_core::PoolThroughput;

const WINDOW: Duration = Duration::from_secs(300);
const MAX_SAMPLES: usize = 10_000;

struct Sample {
    at: Instant,
    duration_ms: u64,
    success: bool,
}

#[derive(Default)]
pub struct PoolMetricsRecorder {
    total_success: AtomicU64,
    total_failure: AtomicU64,
    total_rate_parked: AtomicU64,
    samples: RwLock<VecDeque<Sample>>,
}

impl PoolMetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.total_success.fetch_add(1, Ordering::Relaxed);
        self.push(duration_ms, true);
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.total_failure.fetch_add(1, Ordering::Relaxed);
        self.push(duration_ms, false);
    }

    pub fn record_rate_parked(&self) {
        self.total_rate_parked.fetch_add(1, Ordering::Relaxed);
    }

    fn push(&self, duration_ms: u64, success: bool) {
        let mut samples = self.samples.write();
        let cutoff = Instant::now() - WINDOW;
        while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: Instant::now(),
            duration_ms,
            success,
        });
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> PoolThroughput {
        let total_success = self.total_success.load(Ordering::Relaxed);
        let total_failure = self.total_failure.load(Ordering::Relaxed);
        let total = total_success + total_failure;

        let samples = self.samples.read();
        let mut durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable();

        let avg_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        PoolThroughput {
            total_success,
            total_failure,
            total_rate_parked: self.total_rate_parked.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                total_success as f64 / total as f64
            } else {
                1.0
            },
            avg_ms,
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            sample_count: durations.len() as u64,
        }
    }

    /// Rolling success rate over the sample window; `None` with no samples.
    pub fn window_success_rate(&self) -> Option<f64> {
        let samples = self.samples.read();
        if samples.is_empty() {
            return None;
        }
        let ok = samples.iter().filter(|s| s.success).count();
        Some(ok as f64 / samples.len() as f64)
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recorder_reports_full_success() {
        let recorder = PoolMetricsRecorder::new();
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.sample_count, 0);
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn snapshot_mixes_success_and_failure() {
        let recorder = PoolMetricsRecorder::new();
        recorder.record_success(100);
        recorder.record_success(300);
        recorder.record_failure(500);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_success, 2);
        assert_eq!(snapshot.total_failure, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.avg_ms - 300.0).abs() < 1e-9);
        assert_eq!(snapshot.p99_ms, 500);
    }

    #[test]
    fn percentile_bounds() {
        let sorted = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(percentile(&sorted, 0.0), 1);
        assert_eq!(percentile(&sorted, 100.0), 10);
        assert_eq!(percentile(&sorted, 50.0), 6);
    }
}
