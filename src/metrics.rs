//! Prometheus metrics for the improvement cycle.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The recording helpers
//! (`inc_cycle`, `inc_breaker_transition`, …) are no-ops if `init_metrics`
//! was never called, so every component is safe to run without a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `autoimprove_cycles_total` | Counter | `outcome` |
//! | `autoimprove_opportunities_total` | Counter | `status` |
//! | `autoimprove_breaker_transitions_total` | Counter | `breaker`, `to` |
//! | `autoimprove_telemetry_dropped_total` | Counter | |
//! | `autoimprove_validation_rejections_total` | Counter | `reason` |
//! | `autoimprove_active_cycles` | Gauge | |

use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::OrchestratorError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics, bundled so they can be stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Private registry that owns all metric descriptors.
    pub registry: Registry,
    /// Finished cycles by outcome (`complete`, `partial`, `cancelled`).
    pub cycles_total: IntCounterVec,
    /// Opportunities reaching a terminal status.
    pub opportunities_total: IntCounterVec,
    /// Breaker state changes.
    pub breaker_transitions: IntCounterVec,
    /// Telemetry events evicted from a full buffer.
    pub telemetry_dropped: IntCounter,
    /// Rejected generated changes by reason.
    pub validation_rejections: IntCounterVec,
    /// Cycles currently in progress.
    pub active_cycles: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> OrchestratorError {
    OrchestratorError::Other(format!("metrics init failed: {e}"))
}

fn build(registry: Registry) -> Result<Metrics, prometheus::Error> {
    let cycles_total = IntCounterVec::new(
        Opts::new("autoimprove_cycles_total", "Improvement cycles finished"),
        &["outcome"],
    )?;
    registry.register(Box::new(cycles_total.clone()))?;

    let opportunities_total = IntCounterVec::new(
        Opts::new(
            "autoimprove_opportunities_total",
            "Opportunities reaching a terminal status",
        ),
        &["status"],
    )?;
    registry.register(Box::new(opportunities_total.clone()))?;

    let breaker_transitions = IntCounterVec::new(
        Opts::new(
            "autoimprove_breaker_transitions_total",
            "Circuit breaker state transitions",
        ),
        &["breaker", "to"],
    )?;
    registry.register(Box::new(breaker_transitions.clone()))?;

    let telemetry_dropped = IntCounter::new(
        "autoimprove_telemetry_dropped_total",
        "Telemetry events evicted because a tenant buffer was full",
    )?;
    registry.register(Box::new(telemetry_dropped.clone()))?;

    let validation_rejections = IntCounterVec::new(
        Opts::new(
            "autoimprove_validation_rejections_total",
            "Generated changes rejected by validation",
        ),
        &["reason"],
    )?;
    registry.register(Box::new(validation_rejections.clone()))?;

    let active_cycles = IntGauge::new("autoimprove_active_cycles", "Cycles in progress")?;
    registry.register(Box::new(active_cycles.clone()))?;

    Ok(Metrics {
        registry,
        cycles_total,
        opportunities_total,
        breaker_transitions,
        telemetry_dropped,
        validation_rejections,
        active_cycles,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build(Registry::new()).map_err(init_err)?;
    // A racing initialiser produces identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a finished cycle. No-op if metrics have not been initialised.
pub fn inc_cycle(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cycles_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count an opportunity reaching `status`. No-op if not initialised.
pub fn inc_opportunity(status: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.opportunities_total.get_metric_with_label_values(&[status]) {
            c.inc();
        }
    }
}

/// Count a breaker transition. No-op if not initialised.
pub fn inc_breaker_transition(breaker: &str, to: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .breaker_transitions
            .get_metric_with_label_values(&[breaker, to])
        {
            c.inc();
        }
    }
}

/// Count evicted telemetry events. No-op if not initialised.
pub fn add_telemetry_dropped(n: u64) {
    if let Some(m) = metrics() {
        m.telemetry_dropped.inc_by(n);
    }
}

/// Count a validation rejection. No-op if not initialised.
pub fn inc_validation_rejection(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.validation_rejections.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Adjust the in-progress cycle gauge by `delta`. No-op if not initialised.
pub fn add_active_cycles(delta: i64) {
    if let Some(m) = metrics() {
        m.active_cycles.add(delta);
    }
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// We cannot reset the global `METRICS` OnceLock between tests, so tests
    /// that need exact values build an isolated bundle.
    fn make_test_metrics() -> Metrics {
        build(Registry::new()).expect("test: build metrics")
    }

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        inc_cycle("complete");
        inc_opportunity("completed");
        inc_breaker_transition("telemetry", "open");
        add_telemetry_dropped(3);
        inc_validation_rejection("syntax");
        add_active_cycles(1);
        add_active_cycles(-1);
    }

    #[test]
    fn test_breaker_transition_counter_labels() {
        let m = make_test_metrics();
        m.breaker_transitions
            .with_label_values(&["generation", "open"])
            .inc();
        let v = m
            .breaker_transitions
            .with_label_values(&["generation", "open"])
            .get();
        assert_eq!(v, 1);
        assert_eq!(
            m.breaker_transitions
                .with_label_values(&["telemetry", "open"])
                .get(),
            0
        );
    }

    #[test]
    fn test_active_cycles_gauge_tracks_delta() {
        let m = make_test_metrics();
        m.active_cycles.add(2);
        m.active_cycles.add(-1);
        assert_eq!(m.active_cycles.get(), 1);
    }

    #[test]
    fn test_gather_contains_series_after_observation() {
        init_metrics().expect("test: init");
        inc_cycle("partial");
        let text = gather();
        assert!(text.contains("autoimprove_cycles_total"));
    }
}
