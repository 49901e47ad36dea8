//! Derived telemetry insights.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TenantId;

/// Metric keys every insight carries.
pub mod keys {
    /// Relative improvement available if the finding is fixed (percent).
    pub const PERFORMANCE_GAIN_PCT: &str = "performance_gain_pct";
    /// Share of requests affected (0–100).
    pub const AFFECTED_REQUEST_RATE: &str = "affected_request_rate";
    /// Detections of the same signature inside the recurrence window.
    pub const RECURRENCE_FREQUENCY: &str = "recurrence_frequency";
    /// Mean of the baseline sub-window.
    pub const BASELINE_MEAN: &str = "baseline_mean";
    /// Mean of the recent sub-window.
    pub const RECENT_MEAN: &str = "recent_mean";
    /// Population standard deviation of the baseline sub-window.
    pub const BASELINE_STD: &str = "baseline_std";
    /// Z-score of the latest point.
    pub const Z_SCORE: &str = "z_score";
    /// Occurrences of an error signature.
    pub const OCCURRENCES: &str = "occurrences";
    /// Fraction (0–1) of requests hitting an error signature.
    pub const FRACTION_AFFECTED: &str = "fraction_affected";
}

/// Kind of finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    /// Recent mean significantly worse than the baseline.
    Degradation,
    /// Latest point far outside the trailing distribution.
    Anomaly,
    /// Recurring error signature.
    ErrorPattern,
}

impl InsightType {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Degradation => "degradation",
            InsightType::Anomaly => "anomaly",
            InsightType::ErrorPattern => "error_pattern",
        }
    }
}

/// Severity classification.
///
/// Ordered from least to most severe so that `Ord` comparisons are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Worth acting on.
    Warning,
    /// Urgent.
    Critical,
}

/// A read-only finding derived from telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryInsight {
    /// Unique id.
    pub id: Uuid,
    /// Kind of finding.
    pub insight_type: InsightType,
    /// Severity.
    pub severity: Severity,
    /// Component the finding concerns.
    pub affected_component: String,
    /// Tenants whose telemetry contributed.
    pub affected_tenants: BTreeSet<TenantId>,
    /// Metric the finding is about, for degradations and anomalies.
    pub metric_name: Option<String>,
    /// Stable signature (`type:component:metric-or-error-signature`).
    pub signature: String,
    /// Numeric evidence, see [`keys`].
    pub metrics: BTreeMap<String, f64>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TelemetryInsight {
    /// Build an insight with a fresh id. `confidence` is clamped into `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        insight_type: InsightType,
        severity: Severity,
        component: &str,
        affected_tenants: BTreeSet<TenantId>,
        metric_name: Option<String>,
        detail: &str,
        metrics: BTreeMap<String, f64>,
        confidence: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            insight_type,
            severity,
            affected_component: component.to_string(),
            affected_tenants,
            metric_name,
            signature: format!("{}:{}:{}", insight_type.as_str(), component, detail),
            metrics,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            created_at,
        }
    }

    /// Value of metric `key`, `0.0` when absent.
    pub fn metric(&self, key: &str) -> f64 {
        self.metrics.get(key).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_combines_type_component_detail() {
        let i = TelemetryInsight::new(
            InsightType::Degradation,
            Severity::Warning,
            "api",
            BTreeSet::new(),
            Some("latency_ms".into()),
            "latency_ms",
            BTreeMap::new(),
            0.8,
            Utc::now(),
        );
        assert_eq!(i.signature, "degradation:api:latency_ms");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let i = TelemetryInsight::new(
            InsightType::Anomaly,
            Severity::Info,
            "api",
            BTreeSet::new(),
            None,
            "x",
            BTreeMap::new(),
            f64::NAN,
            Utc::now(),
        );
        assert_eq!(i.confidence, 0.0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_missing_metric_reads_zero() {
        let i = TelemetryInsight::new(
            InsightType::ErrorPattern,
            Severity::Info,
            "api",
            BTreeSet::new(),
            None,
            "sig",
            BTreeMap::from([(keys::OCCURRENCES.to_string(), 7.0)]),
            0.5,
            Utc::now(),
        );
        assert_eq!(i.metric(keys::OCCURRENCES), 7.0);
        assert_eq!(i.metric(keys::Z_SCORE), 0.0);
    }
}
