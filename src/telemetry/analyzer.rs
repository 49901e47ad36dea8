//! # Telemetry Analyzer
//!
//! ## Responsibility
//! Turn raw telemetry into [`TelemetryInsight`]s: performance degradations
//! (recent vs. baseline sub-window), point anomalies (Z-score of the latest
//! sample) and recurring error signatures.
//!
//! ## Guarantees
//! - Degradation requires both a `k·σ` shift and a minimum percentage change
//! - Platform failures never fail an analysis: the report is marked
//!   `partial` and buffered events are used instead
//! - Every produced insight carries `performance_gain_pct`,
//!   `affected_request_rate` and `recurrence_frequency`
//! - Detection runs in O(n log n) over the events in the window
//!
//! ## NOT Responsible For
//! - Ranking insights (see `prioritizer`)
//! - Scheduling periodic pulls (see `ingest`)

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::buffer::{IngestOutcome, TelemetryBuffer};
use super::cache::InsightCache;
use super::event::TelemetryEvent;
use super::insight::{keys, InsightType, Severity, TelemetryInsight};
use super::platform::{MetricPoint, TelemetryPlatform, TimeWindow};
use crate::config::AnalyzerConfig;
use crate::resilience::CircuitBreaker;
use crate::{Scope, TenantId};

/// Metric summed to estimate request volume per component.
pub const REQUEST_COUNT_METRIC: &str = "request_count";

const NEAR_ZERO: f64 = 1e-9;

// ─── Report types ───────────────────────────────────────────────────────────

/// Outcome of one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Scope analysed.
    pub scope: Scope,
    /// Window analysed.
    pub window: TimeWindow,
    /// Insights produced, also inserted into the cache.
    pub insights: Vec<TelemetryInsight>,
    /// `true` when the platform could not be reached and only buffered
    /// events were analysed.
    pub partial: bool,
    /// The platform failure, when `partial`.
    pub platform_error: Option<String>,
    /// Events analysed after merging and de-duplication.
    pub events_considered: usize,
}

/// Outcome of one background pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Events pulled and buffered.
    pub ingested: usize,
    /// Events evicted from full buffers while ingesting.
    pub evicted: usize,
    /// `true` when the platform could not be reached.
    pub partial: bool,
    /// Error-pattern insights produced from the pulled window.
    pub error_insights: usize,
}

#[derive(Debug, Clone, Copy)]
struct Detectors {
    trends: bool,
    errors: bool,
}

// ─── Pure statistics ────────────────────────────────────────────────────────

/// Mean and population standard deviation. `(0, 0)` for an empty slice.
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, variance.sqrt())
}

/// Percentage change from `baseline` to `current`.
///
/// A near-zero baseline yields 100 % when `current` is positive and 0 %
/// otherwise.
pub fn pct_change(baseline: f64, current: f64) -> f64 {
    if baseline.abs() < NEAR_ZERO {
        if current > 0.0 {
            100.0
        } else {
            0.0
        }
    } else {
        (current - baseline) / baseline.abs() * 100.0
    }
}

fn signature_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                "<uuid>",
            ),
            (r"(?i)\b0x[0-9a-f]+\b", "<hex>"),
            (r"(?i)\b[0-9a-f]*[0-9][0-9a-f]*[a-f][0-9a-f]*\b", "<hex>"),
            (r#""[^"]*""#, "<str>"),
            (r"'[^']*'", "<str>"),
            (r"\b\d+(\.\d+)?\b", "<n>"),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    })
}

/// Normalise an error message into a grouping signature.
///
/// UUIDs, hex ids, quoted strings and numbers are replaced by placeholders
/// and whitespace is collapsed.
pub fn normalize_signature(message: &str) -> String {
    let mut out = message.trim().to_string();
    for (re, replacement) in signature_rules() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out.trim().to_string()
}

// ─── Pure detectors ─────────────────────────────────────────────────────────

struct SeriesPoint {
    at: DateTime<Utc>,
    value: f64,
    tenant: TenantId,
}

fn recent_split(window: &TimeWindow, recent_fraction: f64) -> DateTime<Utc> {
    let recent = window.length().mul_f64(recent_fraction.clamp(0.0, 1.0));
    window.end - chrono::Duration::from_std(recent).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Detect degradations and anomalies for every `(component, metric)` pair.
///
/// Events outside `window`, without a component, or without a finite value
/// are ignored. Insights are returned in `(component, metric)` order with
/// `recurrence_frequency` set to 1.
pub fn detect_trends(
    events: &[TelemetryEvent],
    window: &TimeWindow,
    config: &AnalyzerConfig,
) -> Vec<TelemetryInsight> {
    let mut series: BTreeMap<(String, String), Vec<SeriesPoint>> = BTreeMap::new();
    for e in events {
        if !window.contains(e.timestamp) {
            continue;
        }
        let (Some(value), Some(component)) = (e.value(), e.component()) else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        series
            .entry((component.to_string(), e.name.clone()))
            .or_default()
            .push(SeriesPoint {
                at: e.timestamp,
                value,
                tenant: e.tenant_id.clone(),
            });
    }

    let split = recent_split(window, config.recent_fraction);
    let mut out = Vec::new();
    for ((component, metric), mut points) in series {
        points.sort_by_key(|p| p.at);
        let tenants: BTreeSet<TenantId> = points.iter().map(|p| p.tenant.clone()).collect();
        let baseline: Vec<f64> = points.iter().filter(|p| p.at < split).map(|p| p.value).collect();
        let recent: Vec<f64> = points.iter().filter(|p| p.at >= split).map(|p| p.value).collect();
        let all: Vec<f64> = points.iter().map(|p| p.value).collect();

        if let Some(i) = degradation(&component, &metric, &baseline, &recent, &tenants, config, window.end) {
            out.push(i);
        }
        if let Some(i) = anomaly(&component, &metric, &all, &tenants, config, window.end) {
            out.push(i);
        }
    }
    out
}

fn degradation(
    component: &str,
    metric: &str,
    baseline: &[f64],
    recent: &[f64],
    tenants: &BTreeSet<TenantId>,
    config: &AnalyzerConfig,
    at: DateTime<Utc>,
) -> Option<TelemetryInsight> {
    let min = config.min_samples.max(1);
    if baseline.len() < min || recent.len() < min {
        return None;
    }
    let k = config.degradation_std_threshold;
    let (base_mean, base_std) = mean_stddev(baseline);
    let (recent_mean, _) = mean_stddev(recent);
    let diff = recent_mean - base_mean;
    let pct = pct_change(base_mean, recent_mean);
    if !(diff > k * base_std && pct.abs() > config.min_change_pct) {
        return None;
    }

    let bound = base_mean + k * base_std;
    let above = recent.iter().filter(|v| **v > bound).count();
    let rate = above as f64 / recent.len() as f64 * 100.0;

    let effect = if base_std > NEAR_ZERO && k > 0.0 {
        (diff / base_std) / k
    } else {
        f64::INFINITY
    };
    let sample_factor = (baseline.len().min(recent.len()) as f64 / (2.0 * min as f64)).min(1.0);
    let confidence = (1.0 - 0.5 / effect) * (0.5 + 0.5 * sample_factor);

    let severity = if pct.abs() >= 50.0 {
        Severity::Critical
    } else if pct.abs() >= 25.0 {
        Severity::Warning
    } else {
        Severity::Info
    };

    let metrics = BTreeMap::from([
        (keys::PERFORMANCE_GAIN_PCT.to_string(), pct.abs()),
        (keys::AFFECTED_REQUEST_RATE.to_string(), rate),
        (keys::RECURRENCE_FREQUENCY.to_string(), 1.0),
        (keys::BASELINE_MEAN.to_string(), base_mean),
        (keys::RECENT_MEAN.to_string(), recent_mean),
        (keys::BASELINE_STD.to_string(), base_std),
    ]);
    Some(TelemetryInsight::new(
        InsightType::Degradation,
        severity,
        component,
        tenants.clone(),
        Some(metric.to_string()),
        metric,
        metrics,
        confidence,
        at,
    ))
}

fn anomaly(
    component: &str,
    metric: &str,
    values: &[f64],
    tenants: &BTreeSet<TenantId>,
    config: &AnalyzerConfig,
    at: DateTime<Utc>,
) -> Option<TelemetryInsight> {
    let n = values.len();
    if n < config.min_samples.max(2) + 1 {
        return None;
    }
    let (last, trailing) = values.split_last()?;
    let (mean, std) = mean_stddev(trailing);
    // A flat trailing series has no distribution to score against.
    if std < NEAR_ZERO {
        return None;
    }
    let z = (last - mean) / std;
    let threshold = config.anomaly_z_threshold;
    if z.abs() <= threshold {
        return None;
    }

    let severity = if z.abs() > 2.0 * threshold {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let metrics = BTreeMap::from([
        (keys::PERFORMANCE_GAIN_PCT.to_string(), pct_change(mean, *last).abs()),
        (keys::AFFECTED_REQUEST_RATE.to_string(), 100.0 / n as f64),
        (keys::RECURRENCE_FREQUENCY.to_string(), 1.0),
        (keys::BASELINE_MEAN.to_string(), mean),
        (keys::RECENT_MEAN.to_string(), *last),
        (keys::BASELINE_STD.to_string(), std),
        (keys::Z_SCORE.to_string(), z),
    ]);
    Some(TelemetryInsight::new(
        InsightType::Anomaly,
        severity,
        component,
        tenants.clone(),
        Some(metric.to_string()),
        metric,
        metrics,
        1.0 - 0.5 * threshold / z.abs(),
        at,
    ))
}

/// Group error-level logs by `(component, normalised signature)` and flag
/// clusters whose count exceeds `error_frequency_threshold`.
///
/// The affected fraction is occurrences over the component's summed
/// `request_count` metric, falling back to the component's log volume.
pub fn detect_error_patterns(
    events: &[TelemetryEvent],
    window: &TimeWindow,
    config: &AnalyzerConfig,
) -> Vec<TelemetryInsight> {
    let mut requests: HashMap<&str, f64> = HashMap::new();
    let mut log_volume: HashMap<&str, usize> = HashMap::new();
    let mut clusters: BTreeMap<(String, String), (usize, BTreeSet<TenantId>)> = BTreeMap::new();

    for e in events {
        if !window.contains(e.timestamp) {
            continue;
        }
        let Some(component) = e.component() else {
            continue;
        };
        if e.name == REQUEST_COUNT_METRIC {
            if let Some(v) = e.value().filter(|v| v.is_finite() && *v > 0.0) {
                *requests.entry(component).or_default() += v;
            }
        }
        if e.is_log() {
            *log_volume.entry(component).or_default() += 1;
        }
        if let Some(message) = e.error_message() {
            let cluster = clusters
                .entry((component.to_string(), normalize_signature(message)))
                .or_default();
            cluster.0 += 1;
            cluster.1.insert(e.tenant_id.clone());
        }
    }

    let threshold = config.error_frequency_threshold;
    let mut out = Vec::new();
    for ((component, signature), (count, tenants)) in clusters {
        if count <= threshold {
            continue;
        }
        let denominator = requests
            .get(component.as_str())
            .copied()
            .filter(|r| *r > 0.0)
            .unwrap_or_else(|| log_volume.get(component.as_str()).copied().unwrap_or(count) as f64)
            .max(count as f64 * f64::EPSILON);
        let fraction = (count as f64 / denominator).min(1.0);

        let severity = if count >= 4 * threshold.max(1) || fraction >= 0.25 {
            Severity::Critical
        } else if count >= 2 * threshold.max(1) || fraction >= 0.05 {
            Severity::Warning
        } else {
            Severity::Info
        };
        let confidence = (count as f64 / (2.0 * threshold.max(1) as f64)).min(1.0);

        let metrics = BTreeMap::from([
            (keys::PERFORMANCE_GAIN_PCT.to_string(), fraction * 100.0),
            (keys::AFFECTED_REQUEST_RATE.to_string(), fraction * 100.0),
            (keys::RECURRENCE_FREQUENCY.to_string(), 1.0),
            (keys::OCCURRENCES.to_string(), count as f64),
            (keys::FRACTION_AFFECTED.to_string(), fraction),
        ]);
        out.push(TelemetryInsight::new(
            InsightType::ErrorPattern,
            severity,
            &component,
            tenants,
            None,
            &signature,
            metrics,
            confidence,
            window.end,
        ));
    }
    out
}

// ─── TelemetryAnalyzer ──────────────────────────────────────────────────────

/// Stateful analyzer: merges platform and buffered telemetry, runs the
/// detectors, tracks recurrences and fills the insight cache.
pub struct TelemetryAnalyzer {
    config: AnalyzerConfig,
    buffer: Arc<TelemetryBuffer>,
    platform: Arc<dyn TelemetryPlatform>,
    breaker: CircuitBreaker,
    cache: Arc<InsightCache>,
    recurrences: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    last_poll_end: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for TelemetryAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryAnalyzer")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl TelemetryAnalyzer {
    /// Create an analyzer. `breaker` protects every platform call.
    pub fn new(
        config: AnalyzerConfig,
        buffer: Arc<TelemetryBuffer>,
        platform: Arc<dyn TelemetryPlatform>,
        breaker: CircuitBreaker,
        cache: Arc<InsightCache>,
    ) -> Self {
        Self {
            config,
            buffer,
            platform,
            breaker,
            cache,
            recurrences: Mutex::new(HashMap::new()),
            last_poll_end: Mutex::new(None),
        }
    }

    /// Underlying buffer.
    pub fn buffer(&self) -> &Arc<TelemetryBuffer> {
        &self.buffer
    }

    /// Insight cache.
    pub fn cache(&self) -> &Arc<InsightCache> {
        &self.cache
    }

    /// Telemetry breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Platform handle, for live subscriptions.
    pub fn platform(&self) -> &Arc<dyn TelemetryPlatform> {
        &self.platform
    }

    /// Analyzer settings.
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Buffer one event. Never blocks.
    pub fn ingest(&self, event: TelemetryEvent) -> IngestOutcome {
        self.buffer.ingest(event)
    }

    /// Run every detector over the last `window` of telemetry in `scope`.
    pub async fn analyze(&self, scope: &Scope, window: Duration) -> AnalysisReport {
        self.run(
            scope,
            window,
            Detectors {
                trends: true,
                errors: true,
            },
        )
        .await
    }

    /// Degradation and anomaly detection only.
    pub async fn analyze_performance_trends(&self, scope: &Scope, window: Duration) -> AnalysisReport {
        self.run(
            scope,
            window,
            Detectors {
                trends: true,
                errors: false,
            },
        )
        .await
    }

    /// Error-pattern detection only.
    pub async fn analyze_error_patterns(&self, scope: &Scope, window: Duration) -> AnalysisReport {
        self.run(
            scope,
            window,
            Detectors {
                trends: false,
                errors: true,
            },
        )
        .await
    }

    async fn run(&self, scope: &Scope, window: Duration, detectors: Detectors) -> AnalysisReport {
        let tw = TimeWindow::ending_now(window);
        let (pulled, platform_error) = self.pull(scope, &tw).await;
        if let Some(err) = &platform_error {
            warn!(scope = %scope, error = %err, "telemetry platform unavailable; analysing buffered data only");
        }

        let mut seen = HashSet::new();
        let events: Vec<TelemetryEvent> = self
            .buffer
            .events_in(scope, &tw)
            .into_iter()
            .chain(pulled)
            .filter(|e| seen.insert(e.dedup_key()))
            .collect();

        let mut insights = Vec::new();
        if detectors.trends {
            insights.extend(detect_trends(&events, &tw, &self.config));
        }
        if detectors.errors {
            insights.extend(detect_error_patterns(&events, &tw, &self.config));
        }
        let insights = self.finalize(insights);

        info!(
            scope = %scope,
            events = events.len(),
            insights = insights.len(),
            partial = platform_error.is_some(),
            "telemetry analysis complete"
        );
        AnalysisReport {
            scope: scope.clone(),
            window: tw,
            insights,
            partial: platform_error.is_some(),
            platform_error,
            events_considered: events.len(),
        }
    }

    /// Pull the window since the previous poll from the platform into the
    /// buffer, then scan the pulled window for error patterns so monitoring
    /// deployments see new error insights.
    ///
    /// `fallback` bounds the first window and is used when no previous poll
    /// succeeded.
    pub async fn poll_platform(&self, fallback: Duration) -> PollOutcome {
        let end = Utc::now();
        let start = (*self.last_poll_end.lock())
            .unwrap_or_else(|| TimeWindow::ending_at(end, fallback).start);
        let tw = TimeWindow { start, end };

        let (events, platform_error) = self.pull(&Scope::System, &tw).await;
        if platform_error.is_none() {
            *self.last_poll_end.lock() = Some(end);
        }

        let ingested = events.len();
        let evicted = events
            .into_iter()
            .map(|e| self.buffer.ingest(e))
            .filter(|o| *o == IngestOutcome::StoredWithEviction)
            .count();

        let buffered = self.buffer.events_in(&Scope::System, &tw);
        let found = self.finalize(detect_error_patterns(&buffered, &tw, &self.config));

        debug!(
            ingested,
            evicted,
            error_insights = found.len(),
            partial = platform_error.is_some(),
            "telemetry poll complete"
        );
        PollOutcome {
            ingested,
            evicted,
            partial: platform_error.is_some(),
            error_insights: found.len(),
        }
    }

    async fn pull(&self, scope: &Scope, window: &TimeWindow) -> (Vec<TelemetryEvent>, Option<String>) {
        let mut events = Vec::new();
        let mut first_error: Option<String> = None;

        let metrics = self
            .breaker
            .call(|| {
                self.platform.fetch_metrics(
                    &self.config.metric_namespace,
                    &self.config.metric_names,
                    window,
                )
            })
            .await;
        match metrics {
            Ok(points) => events.extend(points.into_iter().filter_map(MetricPoint::into_event)),
            Err(e) => first_error = Some(e.to_string()),
        }

        let logs = self
            .breaker
            .call(|| self.platform.fetch_logs(&self.config.error_log_pattern, window))
            .await;
        match logs {
            Ok(found) => events.extend(found),
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        events.retain(|e| scope.contains(&e.tenant_id) && window.contains(e.timestamp));
        (events, first_error)
    }

    /// Record recurrences, set `recurrence_frequency` and cache the insights.
    fn finalize(&self, mut insights: Vec<TelemetryInsight>) -> Vec<TelemetryInsight> {
        let horizon = chrono::Duration::seconds(self.config.recurrence_window_secs as i64);
        {
            let mut rec = self.recurrences.lock();
            for insight in &mut insights {
                let seen = rec.entry(insight.signature.clone()).or_default();
                let cutoff = insight.created_at - horizon;
                while seen.front().is_some_and(|t| *t < cutoff) {
                    seen.pop_front();
                }
                seen.push_back(insight.created_at);
                insight
                    .metrics
                    .insert(keys::RECURRENCE_FREQUENCY.to_string(), seen.len() as f64);
            }
            let cutoff = Utc::now() - horizon;
            rec.retain(|_, seen| seen.back().is_some_and(|t| *t >= cutoff));
        }
        for insight in &insights {
            self.cache.insert(insight.clone());
        }
        insights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::simulation::SimulatedTelemetryPlatform;
    use crate::telemetry::event::LogLevel;

    fn cfg() -> AnalyzerConfig {
        AnalyzerConfig::default()
    }

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes_ago)
    }

    fn metric(component: &str, value: f64, minutes_ago: i64) -> TelemetryEvent {
        TelemetryEvent::metric(TenantId::new("acme"), component, "latency_ms", value, at(minutes_ago))
    }

    /// Baseline around 100 for the first 45 minutes, `recent` afterwards.
    fn series(recent: f64) -> Vec<TelemetryEvent> {
        let mut out = Vec::new();
        for (i, m) in (20..60).step_by(5).enumerate() {
            out.push(metric("api", if i % 2 == 0 { 98.0 } else { 102.0 }, m));
        }
        for m in [12, 9, 6, 3] {
            out.push(metric("api", recent, m));
        }
        out
    }

    fn hour() -> TimeWindow {
        TimeWindow::ending_now(Duration::from_secs(3600))
    }

    // ── Statistics ──

    #[test]
    fn test_mean_stddev_population() {
        let (m, s) = mean_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.0).abs() < 1e-12);
        assert_eq!(mean_stddev(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_pct_change_near_zero_baseline() {
        assert_eq!(pct_change(0.0, 5.0), 100.0);
        assert_eq!(pct_change(0.0, 0.0), 0.0);
        assert!((pct_change(100.0, 115.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_signature_strips_variable_parts() {
        let a = normalize_signature("timeout after 3000 ms for id 0x1f3a user \"bob\"");
        let b = normalize_signature("timeout  after 12 ms for id 0xdead user \"alice\"");
        assert_eq!(a, b);
        let u = normalize_signature("missing 550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(u, "missing <uuid>");
    }

    // ── Trends ──

    #[test]
    fn test_degradation_flagged_on_large_shift() {
        let insights = detect_trends(&series(130.0), &hour(), &cfg());
        let d = insights
            .iter()
            .find(|i| i.insight_type == InsightType::Degradation)
            .expect("test: degradation");
        assert_eq!(d.affected_component, "api");
        assert_eq!(d.metric_name.as_deref(), Some("latency_ms"));
        assert!((d.metric(keys::PERFORMANCE_GAIN_PCT) - 30.0).abs() < 1e-9);
        assert_eq!(d.metric(keys::AFFECTED_REQUEST_RATE), 100.0);
        assert_eq!(d.severity, Severity::Warning);
        assert!(d.confidence > 0.0 && d.confidence <= 1.0);
    }

    #[test]
    fn test_small_shift_below_floor_not_flagged() {
        // 110 vs 100 clears 2σ (σ = 2) but not the 15 % floor.
        let insights = detect_trends(&series(110.0), &hour(), &cfg());
        assert!(insights.iter().all(|i| i.insight_type != InsightType::Degradation));
    }

    #[test]
    fn test_improvement_is_not_a_degradation() {
        let insights = detect_trends(&series(50.0), &hour(), &cfg());
        assert!(insights.iter().all(|i| i.insight_type != InsightType::Degradation));
    }

    #[test]
    fn test_too_few_samples_not_flagged() {
        let events = vec![metric("api", 100.0, 50), metric("api", 100.0, 40), metric("api", 200.0, 5)];
        assert!(detect_trends(&events, &hour(), &cfg()).is_empty());
    }

    #[test]
    fn test_anomaly_on_latest_point() {
        let mut events: Vec<TelemetryEvent> = (10..50)
            .step_by(2)
            .enumerate()
            .map(|(i, m)| metric("db", if i % 2 == 0 { 9.0 } else { 11.0 }, m))
            .collect();
        events.push(metric("db", 40.0, 1));
        let insights = detect_trends(&events, &hour(), &cfg());
        let a = insights
            .iter()
            .find(|i| i.insight_type == InsightType::Anomaly)
            .expect("test: anomaly");
        assert!(a.metric(keys::Z_SCORE) > 3.0);
        assert_eq!(a.severity, Severity::Critical);
    }

    // ── Error patterns ──

    fn error(component: &str, msg: &str, minutes_ago: i64) -> TelemetryEvent {
        TelemetryEvent::log(TenantId::new("acme"), component, LogLevel::Error, msg, at(minutes_ago))
    }

    #[test]
    fn test_error_cluster_needs_to_exceed_threshold() {
        let five: Vec<_> = (0..5).map(|i| error("api", &format!("db timeout after {i} ms"), 5)).collect();
        assert!(detect_error_patterns(&five, &hour(), &cfg()).is_empty());

        let six: Vec<_> = (0..6).map(|i| error("api", &format!("db timeout after {i} ms"), 5)).collect();
        let found = detect_error_patterns(&six, &hour(), &cfg());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric(keys::OCCURRENCES), 6.0);
    }

    #[test]
    fn test_error_fraction_uses_request_count() {
        let mut events: Vec<_> = (0..10).map(|_| error("api", "connection reset", 5)).collect();
        events.push(TelemetryEvent::metric(TenantId::new("acme"), "api", REQUEST_COUNT_METRIC, 1000.0, at(5)));
        let found = detect_error_patterns(&events, &hour(), &cfg());
        assert!((found[0].metric(keys::FRACTION_AFFECTED) - 0.01).abs() < 1e-12);
        assert!((found[0].metric(keys::AFFECTED_REQUEST_RATE) - 1.0).abs() < 1e-9);
        assert_eq!(found[0].severity, Severity::Warning);
    }

    // ── Analyzer ──

    fn analyzer(platform: Arc<SimulatedTelemetryPlatform>) -> TelemetryAnalyzer {
        TelemetryAnalyzer::new(
            cfg(),
            Arc::new(TelemetryBuffer::new(1000)),
            platform,
            CircuitBreaker::new("telemetry", BreakerConfig::default()),
            Arc::new(InsightCache::new(Duration::from_secs(900))),
        )
    }

    #[tokio::test]
    async fn test_unreachable_platform_yields_partial_report_from_buffer() {
        let platform = Arc::new(SimulatedTelemetryPlatform::new());
        platform.set_available(false);
        let a = analyzer(Arc::clone(&platform));
        for e in series(130.0) {
            a.ingest(e);
        }
        let report = a.analyze(&Scope::System, Duration::from_secs(3600)).await;
        assert!(report.partial);
        assert!(report.platform_error.is_some());
        assert!(report.insights.iter().any(|i| i.insight_type == InsightType::Degradation));
    }

    #[tokio::test]
    async fn test_platform_and_buffer_events_are_merged_without_duplicates() {
        let platform = Arc::new(SimulatedTelemetryPlatform::new());
        let a = analyzer(Arc::clone(&platform));
        for e in series(130.0) {
            platform.push(e.clone());
            a.ingest(e);
        }
        let report = a.analyze(&Scope::System, Duration::from_secs(3600)).await;
        assert!(!report.partial);
        assert_eq!(report.events_considered, series(130.0).len());
    }

    #[tokio::test]
    async fn test_recurrence_counts_repeated_detections() {
        let platform = Arc::new(SimulatedTelemetryPlatform::new());
        let a = analyzer(platform);
        for e in series(130.0) {
            a.ingest(e);
        }
        let first = a.analyze_performance_trends(&Scope::System, Duration::from_secs(3600)).await;
        let second = a.analyze_performance_trends(&Scope::System, Duration::from_secs(3600)).await;
        let rec = |r: &AnalysisReport| {
            r.insights
                .iter()
                .find(|i| i.insight_type == InsightType::Degradation)
                .map(|i| i.metric(keys::RECURRENCE_FREQUENCY))
        };
        assert_eq!(rec(&first), Some(1.0));
        assert_eq!(rec(&second), Some(2.0));
        assert!(a.cache().len() >= 2);
    }

    #[tokio::test]
    async fn test_tenant_scope_excludes_other_tenants() {
        let platform = Arc::new(SimulatedTelemetryPlatform::new());
        let a = analyzer(platform);
        for e in series(130.0) {
            a.ingest(e);
        }
        let report = a
            .analyze(&Scope::Tenant(TenantId::new("other")), Duration::from_secs(3600))
            .await;
        assert!(report.insights.is_empty());
        assert_eq!(report.events_considered, 0);
    }

    #[tokio::test]
    async fn test_poll_moves_platform_events_into_buffer() {
        let platform = Arc::new(SimulatedTelemetryPlatform::new());
        for i in 0..7 {
            platform.push(error("api", &format!("pool exhausted ({i})"), 1));
        }
        let a = analyzer(Arc::clone(&platform));
        let outcome = a.poll_platform(Duration::from_secs(600)).await;
        assert_eq!(outcome.ingested, 7);
        assert!(!outcome.partial);
        assert_eq!(outcome.error_insights, 1);
        assert_eq!(a.buffer().len(&TenantId::new("acme")), 7);
        assert!(a.cache().has_error_insight_for("api", Utc::now() - chrono::Duration::minutes(1)));
    }
}
