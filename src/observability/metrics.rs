// Attempt metrics
//
// Lock-free counters, gauges and a latency histogram for the submission
// pipeline, rendered in Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::attempt::AttemptOutcome;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // saturates at zero
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Increments a gauge for as long as it lives
pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl<'a> GaugeGuard<'a> {
    pub fn new(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for compile + run latency (seconds)
    pub fn new_attempt_latency() -> Self {
        let buckets = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum.fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub attempts_total: Counter,
    pub attempts_solved: Counter,
    pub attempts_failed: Counter,
    pub attempts_timed_out: Counter,
    pub attempts_crashed: Counter,
    pub attempts_cancelled: Counter,
    pub attempts_compilation_failed: Counter,

    pub attempts_persisted: Counter,
    pub busy_rejections: Counter,
    pub inconsistent_results: Counter,

    pub in_flight: Gauge,

    pub attempt_latency: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            attempts_total: Counter::new(),
            attempts_solved: Counter::new(),
            attempts_failed: Counter::new(),
            attempts_timed_out: Counter::new(),
            attempts_crashed: Counter::new(),
            attempts_cancelled: Counter::new(),
            attempts_compilation_failed: Counter::new(),
            attempts_persisted: Counter::new(),
            busy_rejections: Counter::new(),
            inconsistent_results: Counter::new(),
            in_flight: Gauge::new(),
            attempt_latency: Histogram::new_attempt_latency(),
        }
    }

    pub fn record_outcome(&self, outcome: AttemptOutcome, latency: Duration) {
        self.attempts_total.inc();
        self.attempt_latency.observe(latency);
        match outcome {
            AttemptOutcome::Completed { success: true } => self.attempts_solved.inc(),
            AttemptOutcome::Completed { success: false } => self.attempts_failed.inc(),
            AttemptOutcome::TimedOut => self.attempts_timed_out.inc(),
            AttemptOutcome::Crashed => self.attempts_crashed.inc(),
            AttemptOutcome::Cancelled => self.attempts_cancelled.inc(),
            AttemptOutcome::CompilationFailed => self.attempts_compilation_failed.inc(),
        }
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP mazebox_attempts_total Total number of evaluated attempts\n");
        out.push_str("# TYPE mazebox_attempts_total counter\n");
        let _ = writeln!(out, "mazebox_attempts_total {}", self.attempts_total.get());

        out.push_str("# HELP mazebox_attempts_by_outcome Attempts by outcome\n");
        out.push_str("# TYPE mazebox_attempts_by_outcome counter\n");
        for (label, counter) in [
            ("solved", &self.attempts_solved),
            ("failed", &self.attempts_failed),
            ("timed_out", &self.attempts_timed_out),
            ("crashed", &self.attempts_crashed),
            ("cancelled", &self.attempts_cancelled),
            ("compilation_failed", &self.attempts_compilation_failed),
        ] {
            let _ = writeln!(
                out,
                "mazebox_attempts_by_outcome{{outcome=\"{}\"}} {}",
                label,
                counter.get()
            );
        }

        for (name, help, counter) in [
            ("mazebox_attempts_persisted_total", "Attempts written to the store", &self.attempts_persisted),
            ("mazebox_busy_rejections_total", "Submissions refused for lack of a slot", &self.busy_rejections),
            ("mazebox_inconsistent_results_total", "Harness claims that failed replay", &self.inconsistent_results),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        out.push_str("# HELP mazebox_in_flight Submissions currently compiling or running\n");
        out.push_str("# TYPE mazebox_in_flight gauge\n");
        let _ = writeln!(out, "mazebox_in_flight {}", self.in_flight.get());

        out.push_str("# HELP mazebox_attempt_latency_seconds End-to-end attempt latency\n");
        out.push_str("# TYPE mazebox_attempt_latency_seconds histogram\n");
        for bucket in &self.attempt_latency.buckets {
            let _ = writeln!(
                out,
                "mazebox_attempt_latency_seconds_bucket{{le=\"{}\"}} {}",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            out,
            "mazebox_attempt_latency_seconds_bucket{{le=\"+Inf\"}} {}",
            self.attempt_latency.get_count()
        );
        let _ = writeln!(
            out,
            "mazebox_attempt_latency_seconds_sum {}",
            self.attempt_latency.get_sum_micros() as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "mazebox_attempt_latency_seconds_count {}",
            self.attempt_latency.get_count()
        );

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_guard() {
        let gauge = Gauge::new();
        {
            let _a = GaugeGuard::new(&gauge);
            let _b = GaugeGuard::new(&gauge);
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_attempt_latency();
        histogram.observe(Duration::from_millis(80));
        histogram.observe(Duration::from_millis(700));
        histogram.observe(Duration::from_secs(12));

        assert_eq!(histogram.get_count(), 3);
        assert_eq!(histogram.get_bucket_count(0.1), 1);
        assert_eq!(histogram.get_bucket_count(1.0), 2);
        assert_eq!(histogram.get_bucket_count(30.0), 3);
    }

    #[test]
    fn test_record_outcome_and_export() {
        let metrics = MetricsRegistry::new();
        metrics.record_outcome(AttemptOutcome::Completed { success: true }, Duration::from_millis(300));
        metrics.record_outcome(AttemptOutcome::TimedOut, Duration::from_secs(11));
        metrics.busy_rejections.inc();

        let text = metrics.export_prometheus();
        assert!(text.contains("mazebox_attempts_total 2"));
        assert!(text.contains("mazebox_attempts_by_outcome{outcome=\"solved\"} 1"));
        assert!(text.contains("mazebox_attempts_by_outcome{outcome=\"timed_out\"} 1"));
        assert!(text.contains("mazebox_busy_rejections_total 1"));
        assert!(text.contains("mazebox_attempt_latency_seconds_count 2"));
    }

    #[test]
    fn test_global_metrics_is_shared() {
        assert!(Arc::ptr_eq(&get_metrics(), &get_metrics()));
    }
}
