//! Aggregate request metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};

/// How many recent latency samples feed the percentile estimates.
const SAMPLE_WINDOW: usize = 2048;

/// Request counters and a bounded latency reservoir.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests:  AtomicU64,
    errors:    AtomicU64,
    latencies: Mutex<Vec<u64>>,
}

impl GatewayMetrics {
    /// Create empty metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn record(&self, latency_ms: u64, had_errors: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if had_errors {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies.lock();
        if latencies.len() >= SAMPLE_WINDOW {
            // Drop the oldest half rather than shifting on every push.
            latencies.drain(..SAMPLE_WINDOW / 2);
        }
        latencies.push(latency_ms);
    }

    /// Snapshot as the `/metrics` payload.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let latencies = {
            let mut snapshot = self.latencies.lock().clone();
            snapshot.sort_unstable();
            snapshot
        };

        let average = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };

        json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "latencyMs": {
                "average": average,
                "p95": percentile(&latencies, 0.95),
                "p99": percentile(&latencies, 0.99),
            },
        })
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_percentiles() {
        let metrics = GatewayMetrics::new();
        for ms in 1..=100 {
            metrics.record(ms, ms % 10 == 0);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["requests"], json!(100));
        assert_eq!(snapshot["errors"], json!(10));
        assert_eq!(snapshot["latencyMs"]["p95"], json!(95));
        assert_eq!(snapshot["latencyMs"]["p99"], json!(99));
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = GatewayMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["latencyMs"]["p95"], json!(0));
        assert_eq!(snapshot["latencyMs"]["average"], json!(0.0));
    }
}
