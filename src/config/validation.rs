//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (ranges, cross-field
//! invariants, compilable deny-list patterns).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{BreakerConfig, OrchestratorConfig};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "deployment.sampling_interval_secs").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_breaker(section: &str, b: &BreakerConfig, errors: &mut Vec<ConfigError>) {
    if b.failure_threshold == 0 {
        errors.push(invalid(
            &format!("{section}.failure_threshold"),
            0,
            "must be at least 1",
        ));
    }
    if b.recovery_timeout_secs == 0 {
        errors.push(invalid(
            &format!("{section}.recovery_timeout_secs"),
            0,
            "must be at least 1 second",
        ));
    }
    if !b.backoff_multiplier.is_finite() || b.backoff_multiplier < 1.0 {
        errors.push(invalid(
            &format!("{section}.backoff_multiplier"),
            b.backoff_multiplier,
            "must be a finite value \u{2265} 1.0",
        ));
    }
    if !b.max_recovery_multiplier.is_finite() || b.max_recovery_multiplier < 1.0 {
        errors.push(invalid(
            &format!("{section}.max_recovery_multiplier"),
            b.max_recovery_multiplier,
            "must be a finite value \u{2265} 1.0",
        ));
    }
    if b.call_timeout_ms == 0 {
        errors.push(invalid(
            &format!("{section}.call_timeout_ms"),
            0,
            "must be at least 1ms",
        ));
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Breakers ─────────────────────────────────────────────────────
    validate_breaker("telemetry_breaker", &config.telemetry_breaker, &mut errors);
    validate_breaker("generation_breaker", &config.generation_breaker, &mut errors);

    // ── Telemetry ────────────────────────────────────────────────────
    if config.buffer.capacity_per_tenant == 0 {
        errors.push(invalid(
            "buffer.capacity_per_tenant",
            0,
            "must be at least 1",
        ));
    }
    if config.buffer.ingest_interval_secs == 0 {
        errors.push(invalid(
            "buffer.ingest_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if config.insight_cache.ttl_secs == 0 {
        errors.push(invalid("insight_cache.ttl_secs", 0, "must be at least 1 second"));
    }

    // ── Analyzer ─────────────────────────────────────────────────────
    let a = &config.analyzer;
    if !(a.degradation_std_threshold.is_finite() && a.degradation_std_threshold > 0.0) {
        errors.push(invalid(
            "analyzer.degradation_std_threshold",
            a.degradation_std_threshold,
            "must be a positive number",
        ));
    }
    if !(a.min_change_pct.is_finite() && a.min_change_pct >= 0.0) {
        errors.push(invalid(
            "analyzer.min_change_pct",
            a.min_change_pct,
            "must be a non-negative number",
        ));
    }
    if !(a.anomaly_z_threshold.is_finite() && a.anomaly_z_threshold > 0.0) {
        errors.push(invalid(
            "analyzer.anomaly_z_threshold",
            a.anomaly_z_threshold,
            "must be a positive number",
        ));
    }
    if !(a.recent_fraction > 0.0 && a.recent_fraction < 1.0) {
        errors.push(invalid(
            "analyzer.recent_fraction",
            a.recent_fraction,
            "must be strictly between 0.0 and 1.0",
        ));
    }
    if a.min_samples < 2 {
        errors.push(invalid(
            "analyzer.min_samples",
            a.min_samples,
            "at least 2 samples are needed for a standard deviation",
        ));
    }
    if a.recurrence_window_secs == 0 {
        errors.push(invalid(
            "analyzer.recurrence_window_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if a.metric_namespace.trim().is_empty() {
        errors.push(invalid(
            "analyzer.metric_namespace",
            "",
            "namespace must not be empty",
        ));
    }

    // ── Prioritizer ──────────────────────────────────────────────────
    if !(0.0..=100.0).contains(&config.prioritizer.min_impact_score) {
        errors.push(invalid(
            "prioritizer.min_impact_score",
            config.prioritizer.min_impact_score,
            "must be between 0.0 and 100.0",
        ));
    }

    // ── Generation ───────────────────────────────────────────────────
    if config.generation.timeout_secs == 0 {
        errors.push(invalid(
            "generation.timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Validation gates ─────────────────────────────────────────────
    let v = &config.validation;
    if !(0.0..=1.0).contains(&v.quality_threshold) {
        errors.push(invalid(
            "validation.quality_threshold",
            v.quality_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    if v.max_line_length == 0 {
        errors.push(invalid("validation.max_line_length", 0, "must be at least 1"));
    }
    if !(v.max_avg_decisions.is_finite() && v.max_avg_decisions > 0.0) {
        errors.push(invalid(
            "validation.max_avg_decisions",
            v.max_avg_decisions,
            "must be a positive number",
        ));
    }
    for (i, pattern) in v.deny_patterns.iter().enumerate() {
        if let Err(e) = regex::Regex::new(pattern) {
            errors.push(invalid(
                &format!("validation.deny_patterns[{i}]"),
                pattern,
                &format!("not a valid regular expression: {e}"),
            ));
        }
    }

    // ── Deployment ───────────────────────────────────────────────────
    let d = &config.deployment;
    if d.baseline_window_secs == 0 {
        errors.push(invalid(
            "deployment.baseline_window_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if d.sampling_interval_secs == 0 {
        errors.push(invalid(
            "deployment.sampling_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if d.monitoring_duration_secs < d.sampling_interval_secs {
        errors.push(invalid(
            "deployment.monitoring_duration_secs",
            d.monitoring_duration_secs,
            "must be \u{2265} sampling_interval_secs",
        ));
    }
    if !(d.rollback_degradation_threshold.is_finite() && d.rollback_degradation_threshold > 0.0)
    {
        errors.push(invalid(
            "deployment.rollback_degradation_threshold",
            d.rollback_degradation_threshold,
            "must be a positive number",
        ));
    }
    if d.max_consecutive_sample_failures == 0 {
        errors.push(invalid(
            "deployment.max_consecutive_sample_failures",
            0,
            "must be at least 1",
        ));
    }
    if d.call_timeout_secs == 0 {
        errors.push(invalid(
            "deployment.call_timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Cycle ────────────────────────────────────────────────────────
    if config.cycle.max_improvements == 0 {
        errors.push(invalid("cycle.max_improvements", 0, "must be at least 1"));
    }
    if config.cycle.max_concurrent_per_scope == 0 {
        errors.push(invalid(
            "cycle.max_concurrent_per_scope",
            0,
            "must be at least 1",
        ));
    }
    if config.cycle.approval_timeout_secs == 0 {
        errors.push(invalid(
            "cycle.approval_timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if config.cycle.default_analysis_window_hours == 0 {
        errors.push(invalid(
            "cycle.default_analysis_window_hours",
            0,
            "must be at least 1 hour",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: &ConfigError) -> &str {
        match err {
            ConfigError::InvalidField { field, .. } => field,
            _ => "",
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&OrchestratorConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let mut c = OrchestratorConfig::default();
        c.telemetry_breaker.failure_threshold = 0;
        let errs = validate(&c).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(field_of(&errs[0]), "telemetry_breaker.failure_threshold");
    }

    #[test]
    fn test_backoff_multiplier_below_one_rejected() {
        let mut c = OrchestratorConfig::default();
        c.generation_breaker.backoff_multiplier = 0.5;
        let errs = validate(&c).unwrap_err();
        assert_eq!(field_of(&errs[0]), "generation_breaker.backoff_multiplier");
    }

    #[test]
    fn test_recent_fraction_bounds() {
        let mut c = OrchestratorConfig::default();
        c.analyzer.recent_fraction = 1.0;
        assert!(validate(&c).is_err());
        c.analyzer.recent_fraction = 0.0;
        assert!(validate(&c).is_err());
        c.analyzer.recent_fraction = 0.5;
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn test_bad_deny_pattern_rejected() {
        let mut c = OrchestratorConfig::default();
        c.validation.deny_patterns.push("(unclosed".into());
        let errs = validate(&c).unwrap_err();
        assert!(field_of(&errs[0]).starts_with("validation.deny_patterns["));
    }

    #[test]
    fn test_sampling_longer_than_monitoring_rejected() {
        let mut c = OrchestratorConfig::default();
        c.deployment.sampling_interval_secs = 7200;
        let errs = validate(&c).unwrap_err();
        assert_eq!(field_of(&errs[0]), "deployment.monitoring_duration_secs");
    }

    #[test]
    fn test_quality_threshold_out_of_range_rejected() {
        let mut c = OrchestratorConfig::default();
        c.validation.quality_threshold = 1.5;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut c = OrchestratorConfig::default();
        c.buffer.capacity_per_tenant = 0;
        c.cycle.max_improvements = 0;
        c.cycle.max_concurrent_per_scope = 0;
        c.prioritizer.min_impact_score = -1.0;
        let errs = validate(&c).unwrap_err();
        assert_eq!(errs.len(), 4, "got: {errs:?}");
    }

    #[test]
    fn test_invalid_field_display_includes_path_and_value() {
        let err = invalid("cycle.max_improvements", 0, "must be at least 1");
        let msg = err.to_string();
        assert!(msg.contains("cycle.max_improvements"));
        assert!(msg.contains('0'));
    }
}
