//! # Stage: Orchestrator Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML document that tunes every component of the
//! improvement cycle: breakers, telemetry buffer, analyzer thresholds,
//! prioritizer floor, generation timeout, validation gates, deployment
//! monitoring and cycle limits.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Complete defaults: an empty document is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from config (that belongs to `orchestrator`)
//! - Persisting runtime state (that belongs to `persistence`)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default telemetry breaker: 30 s call timeout.
fn default_telemetry_breaker() -> BreakerConfig {
    BreakerConfig::default()
}

/// Default generation breaker: 60 s call timeout.
fn default_generation_breaker() -> BreakerConfig {
    BreakerConfig {
        call_timeout_ms: 60_000,
        ..BreakerConfig::default()
    }
}

/// Security deny-list applied to generated changes when none is configured.
pub fn default_deny_patterns() -> Vec<String> {
    [
        r"\bunsafe\s*\{",
        r"std::process::Command",
        r"\beval\s*\(",
        r"\bexec\s*\(",
        r"os\.system\s*\(",
        r"subprocess\.",
        r"child_process",
        r"rm\s+-rf",
        r"(?i)(api[_-]?key|secret|password)\s*[:=]\s*['\x22][^'\x22]{8,}",
        r"\btransmute\s*[:<(]",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// # Example
///
/// ```toml
/// [analyzer]
/// degradation_std_threshold = 2.5
///
/// [deployment]
/// monitoring_duration_secs = 1800
/// sampling_interval_secs = 30
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Breaker protecting calls to the telemetry platform.
    #[serde(default = "default_telemetry_breaker")]
    pub telemetry_breaker: BreakerConfig,
    /// Breaker protecting calls to the generation service.
    #[serde(default = "default_generation_breaker")]
    pub generation_breaker: BreakerConfig,
    /// Per-tenant telemetry ring buffer.
    pub buffer: BufferConfig,
    /// Insight cache retention.
    pub insight_cache: InsightCacheConfig,
    /// Trend, anomaly and error-pattern thresholds.
    pub analyzer: AnalyzerConfig,
    /// Opportunity scoring.
    pub prioritizer: PrioritizerConfig,
    /// Generation requests.
    pub generation: GenerationConfig,
    /// Static validation gates.
    pub validation: ValidationConfig,
    /// Baseline, monitoring and rollback.
    pub deployment: DeploymentConfig,
    /// Cycle limits and approval gating.
    pub cycle: CycleConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            telemetry_breaker: default_telemetry_breaker(),
            generation_breaker: default_generation_breaker(),
            buffer: BufferConfig::default(),
            insight_cache: InsightCacheConfig::default(),
            analyzer: AnalyzerConfig::default(),
            prioritizer: PrioritizerConfig::default(),
            generation: GenerationConfig::default(),
            validation: ValidationConfig::default(),
            deployment: DeploymentConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

// ── Resilience ───────────────────────────────────────────────────────────

/// Circuit breaker tuning for one protected collaborator.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds to stay open before allowing a single trial call.
    pub recovery_timeout_secs: u64,
    /// Factor applied to the recovery timeout after a failed trial.
    pub backoff_multiplier: f64,
    /// Cap on recovery growth, as a multiple of `recovery_timeout_secs`.
    pub max_recovery_multiplier: f64,
    /// Hard timeout (ms) applied to every protected call. A partially
    /// specified section falls back to 30 000 for this field.
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            backoff_multiplier: 2.0,
            max_recovery_multiplier: 10.0,
            call_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Base recovery timeout.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Upper bound for the recovery timeout after repeated failed trials.
    pub fn max_recovery_timeout(&self) -> Duration {
        self.recovery_timeout()
            .mul_f64(self.max_recovery_multiplier.max(1.0))
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

// ── Telemetry ────────────────────────────────────────────────────────────

/// Telemetry ring buffer sizing and background pull cadence.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum events retained per tenant. Oldest are evicted first.
    pub capacity_per_tenant: usize,
    /// Interval (s) between background pulls from the telemetry platform.
    pub ingest_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_per_tenant: 10_000,
            ingest_interval_secs: 60,
        }
    }
}

/// Insight cache retention.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct InsightCacheConfig {
    /// Seconds an insight stays queryable after creation.
    pub ttl_secs: u64,
}

impl Default for InsightCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

/// Thresholds for trend, anomaly and error-pattern detection.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Standard deviations the recent mean must exceed the baseline mean by.
    pub degradation_std_threshold: f64,
    /// Minimum absolute percentage change for a degradation to count.
    pub min_change_pct: f64,
    /// Z-score magnitude above which the latest point is anomalous.
    pub anomaly_z_threshold: f64,
    /// Occurrences a normalised error signature must exceed within the window.
    pub error_frequency_threshold: usize,
    /// Share of the analysis window treated as the recent sub-window.
    pub recent_fraction: f64,
    /// Minimum samples required in each sub-window.
    pub min_samples: usize,
    /// Window (s) over which repeated detections count as recurrences.
    pub recurrence_window_secs: u64,
    /// Metric namespace requested from the telemetry platform.
    pub metric_namespace: String,
    /// Metric names to pull. Empty means every metric in the namespace.
    pub metric_names: Vec<String>,
    /// Log pattern used when pulling error logs.
    pub error_log_pattern: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            degradation_std_threshold: 2.0,
            min_change_pct: 15.0,
            anomaly_z_threshold: 3.0,
            error_frequency_threshold: 5,
            recent_fraction: 0.25,
            min_samples: 3,
            recurrence_window_secs: 24 * 3600,
            metric_namespace: "fleet".to_string(),
            metric_names: Vec::new(),
            error_log_pattern: "error".to_string(),
        }
    }
}

/// Opportunity scoring.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PrioritizerConfig {
    /// Opportunities scoring below this are discarded.
    pub min_impact_score: f64,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            min_impact_score: 10.0,
        }
    }
}

// ── Generation ───────────────────────────────────────────────────────────

/// Generation request settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Hard timeout (s) on a single generation call.
    pub timeout_secs: u64,
    /// Prior change summaries retained per component.
    pub max_patterns_per_component: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_patterns_per_component: 16,
        }
    }
}

/// Static validation gates for generated changes.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Minimum quality score (0.0–1.0) for a change to be deployable.
    pub quality_threshold: f64,
    /// Lines longer than this count against the style score.
    pub max_line_length: usize,
    /// Average decision points per function at which complexity scores zero.
    pub max_avg_decisions: f64,
    /// Regular expressions that must not match any generated file.
    pub deny_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.7,
            max_line_length: 120,
            max_avg_decisions: 10.0,
            deny_patterns: default_deny_patterns(),
        }
    }
}

// ── Deployment ───────────────────────────────────────────────────────────

/// Baseline capture, monitoring and rollback settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Window (s) over which the pre-change baseline is sampled.
    pub baseline_window_secs: u64,
    /// Length (s) of the post-deployment monitoring window.
    pub monitoring_duration_secs: u64,
    /// Interval (s) between monitoring samples.
    pub sampling_interval_secs: u64,
    /// Worst-metric degradation ratio above which the change is reverted.
    pub rollback_degradation_threshold: f64,
    /// Consecutive failed samples that force a rollback.
    pub max_consecutive_sample_failures: u32,
    /// Timeout (s) on a single deployer or sampler call.
    pub call_timeout_secs: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            baseline_window_secs: 300,
            monitoring_duration_secs: 3600,
            sampling_interval_secs: 60,
            rollback_degradation_threshold: 0.10,
            max_consecutive_sample_failures: 3,
            call_timeout_secs: 30,
        }
    }
}

impl DeploymentConfig {
    /// Baseline sampling window.
    pub fn baseline_window(&self) -> Duration {
        Duration::from_secs(self.baseline_window_secs)
    }

    /// Monitoring window.
    pub fn monitoring_duration(&self) -> Duration {
        Duration::from_secs(self.monitoring_duration_secs)
    }

    /// Sampling cadence.
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    /// Deployer and sampler call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// ── Cycle ────────────────────────────────────────────────────────────────

/// Cycle limits and approval gating.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CycleConfig {
    /// Opportunities processed per cycle when the request does not say.
    pub max_improvements: usize,
    /// Opportunities processed concurrently within one scope.
    pub max_concurrent_per_scope: usize,
    /// Seconds an opportunity may wait for approval before it is discarded.
    pub approval_timeout_secs: u64,
    /// Analysis window (h) used when the request does not say.
    pub default_analysis_window_hours: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_improvements: 3,
            max_concurrent_per_scope: 2,
            approval_timeout_secs: 3600,
            default_analysis_window_hours: 1,
        }
    }
}

/// Export the JSON Schema for [`OrchestratorConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn json_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: OrchestratorConfig = toml::from_str("").expect("test: empty TOML parses");
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_breaker_defaults_match_documented_values() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.telemetry_breaker.failure_threshold, 5);
        assert_eq!(c.telemetry_breaker.recovery_timeout_secs, 60);
        assert_eq!(c.telemetry_breaker.call_timeout_ms, 30_000);
        assert_eq!(c.generation_breaker.call_timeout_ms, 60_000);
    }

    #[test]
    fn test_max_recovery_timeout_is_ten_times_base() {
        let b = BreakerConfig::default();
        assert_eq!(b.max_recovery_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_deployment_defaults() {
        let d = DeploymentConfig::default();
        assert_eq!(d.baseline_window(), Duration::from_secs(300));
        assert_eq!(d.monitoring_duration(), Duration::from_secs(3600));
        assert_eq!(d.sampling_interval(), Duration::from_secs(60));
        assert!((d.rollback_degradation_threshold - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[analyzer]
degradation_std_threshold = 3.0

[cycle]
max_improvements = 5
"#;
        let config: OrchestratorConfig = toml::from_str(toml_str).expect("test: partial TOML");
        assert!((config.analyzer.degradation_std_threshold - 3.0).abs() < f64::EPSILON);
        assert!((config.analyzer.min_change_pct - 15.0).abs() < f64::EPSILON);
        assert_eq!(config.cycle.max_improvements, 5);
        assert_eq!(config.cycle.max_concurrent_per_scope, 2);
        assert_eq!(config.generation_breaker.call_timeout_ms, 60_000);
    }

    #[test]
    fn test_default_deny_patterns_compile() {
        for p in default_deny_patterns() {
            assert!(regex::Regex::new(&p).is_ok(), "pattern {p} must compile");
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = OrchestratorConfig::default();
        config.deployment.sampling_interval_secs = 15;
        config.analyzer.metric_names = vec!["latency_ms".into()];
        let s = toml::to_string_pretty(&config).expect("test: serialize");
        let back: OrchestratorConfig = toml::from_str(&s).expect("test: deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn test_json_schema_produces_valid_json() {
        let schema = json_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
