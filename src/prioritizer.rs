//! # Opportunity Prioritizer
//!
//! ## Responsibility
//! Convert telemetry insights into scored, ranked improvement opportunities.
//!
//! ## Guarantees
//! - `impact_score = gain × rate × recurrence / 100`, clamped to `[0, 100]`
//! - One opportunity per affected component
//! - Ranking: score desc, then confidence desc, then earliest insight first
//! - Opportunities scoring below `min_impact_score` are discarded
//! - System-wide opportunities always require approval
//!
//! ## NOT Responsible For
//! - Per-component exclusivity or concurrency (see `orchestrator`)

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::config::PrioritizerConfig;
use crate::opportunity::{ImprovementOpportunity, OpportunityStatus};
use crate::telemetry::insight::keys;
use crate::telemetry::{InsightType, TelemetryInsight};
use crate::Scope;

/// Impact score of a finding.
///
/// Non-finite products score 0.
///
/// # Panics
/// This function never panics.
pub fn impact_score(performance_gain_pct: f64, affected_request_rate: f64, recurrence_frequency: f64) -> f64 {
    let raw = performance_gain_pct * affected_request_rate * recurrence_frequency / 100.0;
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 100.0)
    }
}

/// Score of a single insight from its metric keys.
pub fn insight_score(insight: &TelemetryInsight) -> f64 {
    impact_score(
        insight.metric(keys::PERFORMANCE_GAIN_PCT),
        insight.metric(keys::AFFECTED_REQUEST_RATE),
        insight.metric(keys::RECURRENCE_FREQUENCY),
    )
}

/// Ranks insights into opportunities.
#[derive(Debug, Clone, Default)]
pub struct OpportunityPrioritizer {
    config: PrioritizerConfig,
}

impl OpportunityPrioritizer {
    /// Create a prioritizer.
    pub fn new(config: PrioritizerConfig) -> Self {
        Self { config }
    }

    /// Group `insights` by component, score and rank them.
    ///
    /// The result is sorted best-first and contains only opportunities at or
    /// above `min_impact_score`, each in status `identified`.
    pub fn identify_improvement_opportunities(
        &self,
        insights: &[TelemetryInsight],
        scope: &Scope,
    ) -> Vec<ImprovementOpportunity> {
        let mut groups: BTreeMap<&str, Vec<&TelemetryInsight>> = BTreeMap::new();
        for i in insights {
            groups.entry(i.affected_component.as_str()).or_default().push(i);
        }

        let mut out: Vec<ImprovementOpportunity> = groups
            .into_iter()
            .filter_map(|(component, members)| self.build(component, &members, scope))
            .collect();

        let before = out.len();
        out.retain(|o| o.impact_score >= self.config.min_impact_score);
        out.sort_by(rank);
        debug!(
            insights = insights.len(),
            candidates = before,
            kept = out.len(),
            "opportunities identified"
        );
        out
    }

    fn build(
        &self,
        component: &str,
        members: &[&TelemetryInsight],
        scope: &Scope,
    ) -> Option<ImprovementOpportunity> {
        let lead = members
            .iter()
            .copied()
            .max_by(|a, b| insight_score(a).total_cmp(&insight_score(b)))?;
        let impact = insight_score(lead);
        let confidence = members.iter().map(|i| i.confidence).fold(0.0, f64::max);
        let severity = members.iter().map(|i| i.severity).max()?;
        let first_seen = members.iter().map(|i| i.created_at).min()?;

        let mut target_metrics = BTreeMap::new();
        for i in members {
            if let Some(m) = &i.metric_name {
                if let Some(base) = i.metrics.get(keys::BASELINE_MEAN) {
                    target_metrics.entry(m.clone()).or_insert(*base);
                }
            }
        }

        let description = members
            .iter()
            .map(|i| {
                format!(
                    "{} (gain {:.1}%, rate {:.1}%, seen {}x)",
                    i.signature,
                    i.metric(keys::PERFORMANCE_GAIN_PCT),
                    i.metric(keys::AFFECTED_REQUEST_RATE),
                    i.metric(keys::RECURRENCE_FREQUENCY),
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        let now = Utc::now();
        Some(ImprovementOpportunity {
            id: Uuid::new_v4(),
            title: title_for(lead, component),
            description,
            source_insight_ids: members.iter().map(|i| i.id).collect(),
            impact_score: impact,
            confidence,
            severity,
            affected_components: vec![component.to_string()],
            target_metrics,
            tenant_id: scope.tenant().cloned(),
            requires_approval: matches!(scope, Scope::System),
            status: OpportunityStatus::Identified,
            cycle_id: None,
            first_seen,
            updated_at: now,
            reason: None,
        })
    }
}

fn title_for(lead: &TelemetryInsight, component: &str) -> String {
    let metric = lead.metric_name.as_deref().unwrap_or("behaviour");
    match lead.insight_type {
        InsightType::Degradation => format!("Reverse {metric} degradation in {component}"),
        InsightType::Anomaly => format!("Stabilise {metric} in {component}"),
        InsightType::ErrorPattern => format!("Eliminate recurring errors in {component}"),
    }
}

fn rank(a: &ImprovementOpportunity, b: &ImprovementOpportunity) -> Ordering {
    b.impact_score
        .total_cmp(&a.impact_score)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.first_seen.cmp(&b.first_seen))
        .then_with(|| a.affected_components.cmp(&b.affected_components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Severity;
    use crate::TenantId;
    use chrono::{DateTime, Duration};
    use std::collections::BTreeSet;

    fn insight(
        component: &str,
        gain: f64,
        rate: f64,
        recurrence: f64,
        confidence: f64,
        created_at: DateTime<Utc>,
    ) -> TelemetryInsight {
        TelemetryInsight::new(
            InsightType::Degradation,
            Severity::Warning,
            component,
            BTreeSet::from([TenantId::new("acme")]),
            Some("latency_ms".into()),
            "latency_ms",
            BTreeMap::from([
                (keys::PERFORMANCE_GAIN_PCT.to_string(), gain),
                (keys::AFFECTED_REQUEST_RATE.to_string(), rate),
                (keys::RECURRENCE_FREQUENCY.to_string(), recurrence),
                (keys::BASELINE_MEAN.to_string(), 100.0),
            ]),
            confidence,
            created_at,
        )
    }

    fn tenant() -> Scope {
        Scope::Tenant(TenantId::new("acme"))
    }

    // ── Score ──

    #[test]
    fn test_impact_score_reference_value() {
        assert!((impact_score(20.0, 50.0, 3.0) - 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_impact_score_clamps() {
        assert_eq!(impact_score(90.0, 100.0, 5.0), 100.0);
        assert_eq!(impact_score(-10.0, 50.0, 1.0), 0.0);
        assert_eq!(impact_score(f64::NAN, 50.0, 1.0), 0.0);
        assert_eq!(impact_score(f64::INFINITY, 50.0, 1.0), 100.0);
    }

    // ── Ranking ──

    #[test]
    fn test_ranked_by_score() {
        let now = Utc::now();
        let insights = vec![
            insight("a", 20.0, 50.0, 3.0, 0.5, now),
            insight("b", 40.0, 50.0, 3.0, 0.5, now),
        ];
        let out = OpportunityPrioritizer::default().identify_improvement_opportunities(&insights, &tenant());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].affected_components, vec!["b".to_string()]);
        assert!((out[0].impact_score - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_broken_by_confidence_then_age() {
        let now = Utc::now();
        let insights = vec![
            insight("young", 20.0, 50.0, 3.0, 0.9, now),
            insight("old", 20.0, 50.0, 3.0, 0.9, now - Duration::minutes(10)),
            insight("sure", 20.0, 50.0, 3.0, 0.99, now),
        ];
        let out = OpportunityPrioritizer::default().identify_improvement_opportunities(&insights, &tenant());
        let order: Vec<&str> = out.iter().map(|o| o.affected_components[0].as_str()).collect();
        assert_eq!(order, vec!["sure", "old", "young"]);
    }

    #[test]
    fn test_below_minimum_discarded() {
        let insights = vec![insight("a", 10.0, 10.0, 1.0, 0.9, Utc::now())];
        let out = OpportunityPrioritizer::default().identify_improvement_opportunities(&insights, &tenant());
        assert!(out.is_empty());
    }

    #[test]
    fn test_insights_grouped_per_component() {
        let now = Utc::now();
        let insights = vec![
            insight("api", 20.0, 50.0, 3.0, 0.6, now),
            insight("api", 30.0, 50.0, 3.0, 0.4, now - Duration::minutes(5)),
        ];
        let out = OpportunityPrioritizer::default().identify_improvement_opportunities(&insights, &tenant());
        assert_eq!(out.len(), 1);
        let o = &out[0];
        assert!((o.impact_score - 45.0).abs() < 1e-9);
        assert_eq!(o.confidence, 0.6);
        assert_eq!(o.first_seen, now - Duration::minutes(5));
        assert_eq!(o.source_insight_ids.len(), 2);
        assert_eq!(o.target_metrics.get("latency_ms"), Some(&100.0));
        assert_eq!(o.tenant_id, Some(TenantId::new("acme")));
        assert!(!o.requires_approval);
    }

    #[test]
    fn test_system_scope_requires_approval() {
        let insights = vec![insight("api", 20.0, 50.0, 3.0, 0.6, Utc::now())];
        let out = OpportunityPrioritizer::default().identify_improvement_opportunities(&insights, &Scope::System);
        assert!(out[0].requires_approval);
        assert_eq!(out[0].tenant_id, None);
        assert_eq!(out[0].status, OpportunityStatus::Identified);
    }
}
