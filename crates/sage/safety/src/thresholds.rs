//! Static metric thresholds
//!
//! Breach checks are pure functions over a sample or a trailing window so
//! the monitor can run them inside the store transaction that records the
//! sample.

use sage_types::{BreachRecord, BreachSeverity, MetricKind, MetricSample};
use serde::{Deserialize, Serialize};

/// Acceptable bounds for trial metrics.
///
/// Success and error rates are critical: sustained breaches roll the change
/// back. Latency and cost breaches are recorded for review only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThresholds {
    /// Success rates below this breach critically.
    pub min_success_rate: f64,

    /// Error rates above this breach critically.
    pub max_error_rate: f64,

    /// P95 latencies above this many milliseconds breach at high severity.
    pub max_latency_p95_ms: f64,

    /// Per-operation costs above this many cents breach at medium severity.
    pub max_cost_cents: f64,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.90,
            max_error_rate: 0.10,
            max_latency_p95_ms: 3000.0,
            max_cost_cents: 10.0,
        }
    }
}

impl MetricThresholds {
    /// Every threshold the sample crosses, as breach records.
    pub fn violations(&self, sample: &MetricSample) -> Vec<BreachRecord> {
        let mut breaches = Vec::new();
        if sample.success_rate < self.min_success_rate {
            breaches.push(self.record(
                MetricKind::SuccessRate,
                BreachSeverity::Critical,
                self.min_success_rate,
                sample,
            ));
        }
        if sample.error_rate > self.max_error_rate {
            breaches.push(self.record(
                MetricKind::ErrorRate,
                BreachSeverity::Critical,
                self.max_error_rate,
                sample,
            ));
        }
        if sample.latency_p95_ms > self.max_latency_p95_ms {
            breaches.push(self.record(
                MetricKind::LatencyP95,
                BreachSeverity::High,
                self.max_latency_p95_ms,
                sample,
            ));
        }
        if sample.cost_cents > self.max_cost_cents {
            breaches.push(self.record(
                MetricKind::CostCents,
                BreachSeverity::Medium,
                self.max_cost_cents,
                sample,
            ));
        }
        breaches
    }

    /// A critical metric breached by each of the trailing `min_samples`
    /// window entries, if one exists. The returned record describes the
    /// newest sample. Success rate is checked before error rate.
    pub fn sustained_critical(
        &self,
        window: &[MetricSample],
        min_samples: usize,
    ) -> Option<BreachRecord> {
        if min_samples == 0 || window.len() < min_samples {
            return None;
        }
        let tail = &window[window.len() - min_samples..];
        let newest = tail.last()?;

        if tail.iter().all(|s| s.success_rate < self.min_success_rate) {
            return Some(self.record(
                MetricKind::SuccessRate,
                BreachSeverity::Critical,
                self.min_success_rate,
                newest,
            ));
        }
        if tail.iter().all(|s| s.error_rate > self.max_error_rate) {
            return Some(self.record(
                MetricKind::ErrorRate,
                BreachSeverity::Critical,
                self.max_error_rate,
                newest,
            ));
        }
        None
    }

    fn record(
        &self,
        metric: MetricKind,
        severity: BreachSeverity,
        threshold: f64,
        sample: &MetricSample,
    ) -> BreachRecord {
        BreachRecord {
            change_id: sample.change_id.clone(),
            metric,
            severity,
            threshold,
            observed_value: metric.value_of(sample),
            timestamp: sample.timestamp,
        }
    }
}
