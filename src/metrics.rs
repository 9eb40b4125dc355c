//! Process-wide counters exposed at `/metrics` in Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds (ms) of the upstream latency histogram buckets.
const LATENCY_BUCKETS_MS: [u64; 11] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

pub struct Metrics {
    pub ask_requests_total: AtomicU64,
    pub answers_total: AtomicU64,
    pub fallbacks_total: AtomicU64,
    pub validation_failures_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub history_write_errors_total: AtomicU64,
    latency_counts: Vec<AtomicU64>,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

/// Gauges sampled at render time.
pub struct Snapshot {
    pub tracked_clients: usize,
    pub history_len: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            ask_requests_total: AtomicU64::new(0),
            answers_total: AtomicU64::new(0),
            fallbacks_total: AtomicU64::new(0),
            validation_failures_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            history_write_errors_total: AtomicU64::new(0),
            latency_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_upstream(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.latency_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn render(&self, snapshot: &Snapshot) -> String {
        let mut buf = String::new();
        let counters: [(&str, &str, &AtomicU64); 6] = [
            (
                "ouija_ask_requests_total",
                "Questions received on /ask",
                &self.ask_requests_total,
            ),
            (
                "ouija_answers_total",
                "Answers produced by the model",
                &self.answers_total,
            ),
            (
                "ouija_fallbacks_total",
                "Fallback answers returned after upstream failures",
                &self.fallbacks_total,
            ),
            (
                "ouija_validation_failures_total",
                "Questions rejected by validation",
                &self.validation_failures_total,
            ),
            (
                "ouija_rate_limited_total",
                "Requests rejected by the rate limiter",
                &self.rate_limited_total,
            ),
            (
                "ouija_history_write_errors_total",
                "Failed history writes",
                &self.history_write_errors_total,
            ),
        ];
        for (name, help, value) in counters {
            writeln!(&mut buf, "# HELP {} {}", name, help).ok();
            writeln!(&mut buf, "# TYPE {} counter", name).ok();
            writeln!(&mut buf, "{} {}", name, value.load(Ordering::Relaxed)).ok();
        }

        writeln!(
            &mut buf,
            "# HELP ouija_tracked_clients Identities with a live rate-limit bucket\n# TYPE ouija_tracked_clients gauge"
        )
        .ok();
        writeln!(&mut buf, "ouija_tracked_clients {}", snapshot.tracked_clients).ok();
        writeln!(
            &mut buf,
            "# HELP ouija_history_len Retained question/answer pairs\n# TYPE ouija_history_len gauge"
        )
        .ok();
        writeln!(&mut buf, "ouija_history_len {}", snapshot.history_len).ok();

        writeln!(
            &mut buf,
            "# HELP ouija_upstream_latency_ms Generate call latency histogram milliseconds\n# TYPE ouija_upstream_latency_ms histogram"
        )
        .ok();
        let mut cumulative: u64 = 0;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.latency_counts[i].load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "ouija_upstream_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        let count = self.latency_count.load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "ouija_upstream_latency_ms_bucket{{le=\"+Inf\"}} {}",
            count
        )
        .ok();
        writeln!(
            &mut buf,
            "ouija_upstream_latency_ms_sum {}",
            self.latency_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "ouija_upstream_latency_ms_count {}", count).ok();

        writeln!(
            &mut buf,
            "# HELP ouija_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE ouija_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "ouija_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP ouija_process_uptime_seconds Process uptime seconds\n# TYPE ouija_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "ouija_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_is_cumulative() {
        let metrics = Metrics::new();
        metrics.observe_upstream(Duration::from_millis(5));
        metrics.observe_upstream(Duration::from_millis(40));
        metrics.observe_upstream(Duration::from_secs(60));
        let text = metrics.render(&Snapshot {
            tracked_clients: 2,
            history_len: 7,
        });
        assert!(text.contains("ouija_upstream_latency_ms_bucket{le=\"10\"} 1"));
        assert!(text.contains("ouija_upstream_latency_ms_bucket{le=\"50\"} 2"));
        assert!(text.contains("ouija_upstream_latency_ms_bucket{le=\"30000\"} 2"));
        assert!(text.contains("ouija_upstream_latency_ms_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("ouija_tracked_clients 2"));
        assert!(text.contains("ouija_history_len 7"));
    }

    #[test]
    fn counters_render_with_help_once() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.fallbacks_total);
        Metrics::incr(&metrics.fallbacks_total);
        let text = metrics.render(&Snapshot {
            tracked_clients: 0,
            history_len: 0,
        });
        assert!(text.contains("ouija_fallbacks_total 2"));
        assert_eq!(text.matches("# HELP ouija_fallbacks_total").count(), 1);
    }
}
