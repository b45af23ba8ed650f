//! Metric samples, threshold breaches, and rollback records

use crate::error::GovernanceError;
use crate::ids::{ChangeId, InstanceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The metrics a fleet instance reports for a change under trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    /// When the instance observed these values.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Fraction of operations that succeeded (0.0 to 1.0).
    pub success_rate: f64,
    /// Fraction of operations that errored (0.0 to 1.0).
    pub error_rate: f64,
    /// 95th percentile latency in milliseconds.
    pub latency_p95_ms: f64,
    /// Cost per operation in cents.
    pub cost_cents: f64,
    /// Completed operations per minute.
    pub throughput_per_min: f64,
}

impl MetricReading {
    /// Checks that every value is representable.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        for (name, value) in [
            ("success_rate", self.success_rate),
            ("error_rate", self.error_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GovernanceError::Validation(format!(
                    "{name} must be within [0.0, 1.0], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("latency_p95_ms", self.latency_p95_ms),
            ("cost_cents", self.cost_cents),
            ("throughput_per_min", self.throughput_per_min),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(GovernanceError::Validation(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Attaches the identifiers a persisted sample carries.
    pub fn into_sample(self, change_id: ChangeId, reported_by: InstanceId) -> MetricSample {
        MetricSample {
            change_id,
            reported_by,
            timestamp: self.timestamp,
            success_rate: self.success_rate,
            error_rate: self.error_rate,
            latency_p95_ms: self.latency_p95_ms,
            cost_cents: self.cost_cents,
            throughput_per_min: self.throughput_per_min,
        }
    }
}

/// A persisted metric observation for one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Change the sample belongs to.
    pub change_id: ChangeId,
    /// Instance that reported the sample.
    pub reported_by: InstanceId,
    /// Observation time; non-decreasing per change.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Fraction of operations that succeeded (0.0 to 1.0).
    pub success_rate: f64,
    /// Fraction of operations that errored (0.0 to 1.0).
    pub error_rate: f64,
    /// 95th percentile latency in milliseconds.
    pub latency_p95_ms: f64,
    /// Cost per operation in cents.
    pub cost_cents: f64,
    /// Completed operations per minute.
    pub throughput_per_min: f64,
}

/// The metrics SAGE evaluates against thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    SuccessRate,
    ErrorRate,
    LatencyP95,
    CostCents,
    Throughput,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::SuccessRate => "success_rate",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::LatencyP95 => "latency_p95_ms",
            MetricKind::CostCents => "cost_cents",
            MetricKind::Throughput => "throughput_per_min",
        }
    }

    /// Reads this metric's value out of a sample.
    pub fn value_of(&self, sample: &MetricSample) -> f64 {
        match self {
            MetricKind::SuccessRate => sample.success_rate,
            MetricKind::ErrorRate => sample.error_rate,
            MetricKind::LatencyP95 => sample.latency_p95_ms,
            MetricKind::CostCents => sample.cost_cents,
            MetricKind::Throughput => sample.throughput_per_min,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a threshold breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreachSeverity {
    /// Sustained breach triggers automatic rollback.
    Critical,
    /// Recorded for review, no automatic action.
    High,
    /// Recorded for review, no automatic action.
    Medium,
}

/// A recorded threshold breach for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachRecord {
    /// Change whose metrics breached.
    pub change_id: ChangeId,
    /// Metric that crossed its threshold.
    pub metric: MetricKind,
    /// Breach severity.
    pub severity: BreachSeverity,
    /// Configured threshold value.
    pub threshold: f64,
    /// Observed metric value.
    pub observed_value: f64,
    /// Timestamp of the breaching sample.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The record written when a change is rolled back.
///
/// Exactly one exists per rolled-back change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// Change that was rolled back.
    pub change_id: ChangeId,
    /// Metric whose sustained breach caused the rollback.
    pub metric: MetricKind,
    /// Configured threshold value.
    pub threshold: f64,
    /// Observed value of the final breaching sample.
    pub observed_value: f64,
    /// When the rollback was executed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
