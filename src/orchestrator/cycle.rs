//! One improvement cycle, end to end.
//!
//! Analysis and prioritisation run once; each selected opportunity then
//! runs on its own task, bounded by the scope's worker pool, and reports
//! back only through the opportunity book. The summary is rebuilt from the
//! book after every task has finished, so completion order does not matter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::Inner;
use crate::audit::{AuditEvent, AuditSeverity, SubjectKind};
use crate::deployment::{cancelled, DeploymentOutcome, DeploymentPhase, DeploymentRecord, DeploymentResult};
use crate::generation::{PatternOutcome, PriorPattern};
use crate::metrics;
use crate::opportunity::{ImprovementOpportunity, OpportunityStatus};
use crate::{Scope, TenantId};

/// Final state of one opportunity within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityOutcome {
    /// Opportunity id.
    pub opportunity_id: Uuid,
    /// Title.
    pub title: String,
    /// Components it targeted.
    pub components: Vec<String>,
    /// Owning tenant.
    pub tenant_id: Option<TenantId>,
    /// Impact score.
    pub impact_score: f64,
    /// Status when the cycle ended.
    pub status: OpportunityStatus,
    /// Why it ended there.
    pub reason: Option<String>,
    /// Deployment, if one was started.
    pub deployment_id: Option<Uuid>,
}

/// Aggregated result of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Scope the cycle ran under.
    pub scope: Scope,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Total elapsed time in milliseconds.
    pub elapsed_ms: u64,
    /// `true` when analysis ran on buffered data only.
    pub partial: bool,
    /// Platform error behind a partial analysis.
    pub platform_error: Option<String>,
    /// `true` when the cycle was cancelled.
    pub cancelled: bool,
    /// Insights produced by the analysis.
    pub insights: usize,
    /// Opportunities above the minimum score.
    pub opportunities_identified: usize,
    /// Opportunities per final status.
    pub counts: BTreeMap<OpportunityStatus, usize>,
    /// Per-opportunity outcomes, ordered by opportunity id.
    pub outcomes: Vec<OpportunityOutcome>,
}

impl CycleSummary {
    /// Opportunities that ended in `status`.
    pub fn count(&self, status: OpportunityStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

// ─── Cycle ──────────────────────────────────────────────────────────────────

pub(super) async fn run_cycle(
    inner: Arc<Inner>,
    cycle_id: Uuid,
    scope: Scope,
    window: Duration,
    max_improvements: usize,
    cancel: watch::Receiver<bool>,
) -> CycleSummary {
    let started_at = Utc::now();
    let clock = Instant::now();
    metrics::add_active_cycles(1);
    inner.audit.record(
        AuditEvent::new(SubjectKind::Cycle, cycle_id, "in_progress", "trigger_cycle").tenant(scope.tenant().cloned()),
    );

    let report = inner.analyzer.analyze(&scope, window).await;
    let identified = inner
        .prioritizer
        .identify_improvement_opportunities(&report.insights, &scope);
    let opportunities_identified = identified.len();

    let selected: Vec<ImprovementOpportunity> = {
        let mut book = inner.book.lock();
        identified
            .into_iter()
            .take(max_improvements)
            .map(|mut opp| {
                opp.cycle_id = Some(cycle_id);
                book.insert(opp.clone());
                opp
            })
            .collect()
    };
    info!(
        cycle_id = %cycle_id,
        insights = report.insights.len(),
        identified = opportunities_identified,
        selected = selected.len(),
        partial = report.partial,
        "analysis complete"
    );

    // Spawned in rank order; the scope pool hands out slots first come
    // first served.
    let mut tasks = JoinSet::new();
    for opp in selected {
        tasks.spawn(process_opportunity(Arc::clone(&inner), opp, cancel.clone()));
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(cycle_id = %cycle_id, error = %e, "opportunity task failed");
        }
    }

    let outcomes = collect_outcomes(&inner, &cycle_id);
    let mut counts = BTreeMap::new();
    for o in &outcomes {
        *counts.entry(o.status).or_insert(0) += 1;
    }
    let was_cancelled = *cancel.borrow();
    let summary = CycleSummary {
        cycle_id,
        scope: scope.clone(),
        started_at,
        finished_at: Utc::now(),
        elapsed_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        partial: report.partial,
        platform_error: report.platform_error,
        cancelled: was_cancelled,
        insights: report.insights.len(),
        opportunities_identified,
        counts,
        outcomes,
    };

    let label = if was_cancelled {
        "cancelled"
    } else if summary.partial {
        "partial"
    } else {
        "complete"
    };
    metrics::inc_cycle(label);
    metrics::add_active_cycles(-1);
    let counts_metric = summary
        .counts
        .iter()
        .map(|(s, n)| (s.as_str().to_string(), *n as f64))
        .collect();
    inner.audit.record(
        AuditEvent::new(SubjectKind::Cycle, cycle_id, label, "cycle_finished")
            .from_state("in_progress")
            .tenant(scope.tenant().cloned())
            .metrics(counts_metric),
    );
    info!(
        cycle_id = %cycle_id,
        scope = %scope,
        outcome = label,
        elapsed_ms = summary.elapsed_ms,
        counts = ?summary.counts,
        "cycle finished"
    );
    summary
}

fn collect_outcomes(inner: &Inner, cycle_id: &Uuid) -> Vec<OpportunityOutcome> {
    let opportunities = inner.book.lock().for_cycle(cycle_id);
    let records = inner.records.lock();
    let mut outcomes: Vec<OpportunityOutcome> = opportunities
        .into_iter()
        .map(|o| OpportunityOutcome {
            deployment_id: records
                .values()
                .find(|r| r.opportunity_id == Some(o.id))
                .map(|r| r.id),
            opportunity_id: o.id,
            title: o.title,
            components: o.affected_components,
            tenant_id: o.tenant_id,
            impact_score: o.impact_score,
            status: o.status,
            reason: o.reason,
        })
        .collect();
    outcomes.sort_by_key(|o| o.opportunity_id);
    outcomes
}

// ─── Opportunity ────────────────────────────────────────────────────────────

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

async fn await_approval(inner: &Inner, id: Uuid, cancel: &mut watch::Receiver<bool>) -> Result<(), &'static str> {
    let (tx, rx) = oneshot::channel();
    inner.approvals.lock().insert(id, tx);
    let limit = Duration::from_secs(inner.config.cycle.approval_timeout_secs);
    let decision = tokio::select! {
        answer = tokio::time::timeout(limit, rx) => match answer {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("approval rejected"),
            Ok(Err(_)) => Err("approval channel closed"),
            Err(_) => Err("approval expired"),
        },
        _ = cancelled(cancel) => Err("cycle cancelled"),
    };
    inner.approvals.lock().remove(&id);
    decision
}

async fn process_opportunity(inner: Arc<Inner>, opp: ImprovementOpportunity, mut cancel: watch::Receiver<bool>) {
    let id = opp.id;
    let discard = |reason: &str| {
        inner.transition(id, OpportunityStatus::Discarded, Some(reason.to_string()));
    };

    if opp.requires_approval {
        if !inner.transition(id, OpportunityStatus::PendingApproval, Some("system-wide change".into())) {
            return;
        }
        if let Err(reason) = await_approval(&inner, id, &mut cancel).await {
            discard(reason);
            return;
        }
    }
    if is_cancelled(&cancel) {
        discard("cycle cancelled");
        return;
    }
    if !inner.transition(id, OpportunityStatus::Selected, None) {
        return;
    }

    let scope = opp.scope();
    let _permit = tokio::select! {
        permit = inner.limiter.acquire(&scope) => match permit {
            Ok(p) => p,
            Err(e) => {
                discard(&e.to_string());
                return;
            }
        },
        _ = cancelled(&mut cancel) => {
            discard("cycle cancelled");
            return;
        }
    };

    let _lease = match inner.locks.try_acquire_all(&opp.affected_components, id) {
        Ok(lease) => lease,
        Err(conflict) => {
            inner.transition(id, OpportunityStatus::Skipped, Some(conflict.to_string()));
            return;
        }
    };

    if !inner.transition(id, OpportunityStatus::Generating, None) {
        return;
    }
    let generated = tokio::select! {
        result = inner.pipeline.generate(&opp) => result,
        _ = cancelled(&mut cancel) => {
            discard("cycle cancelled");
            return;
        }
    };
    let change = match generated {
        Ok(change) => change,
        Err(failure) => {
            inner.transition(id, OpportunityStatus::Failed, Some(failure.to_string()));
            return;
        }
    };

    if !inner.transition(id, OpportunityStatus::Validating, None) {
        return;
    }
    let files: Vec<String> = change.files.keys().cloned().collect();
    let validated = match inner.pipeline.validate(change) {
        Ok(v) => v,
        Err(rejection) => {
            remember(&inner, &opp.affected_components, &opp.title, files, PatternOutcome::Rejected);
            inner.transition(id, OpportunityStatus::Failed, Some(rejection.to_string()));
            return;
        }
    };
    if is_cancelled(&cancel) {
        discard("cycle cancelled");
        return;
    }

    if !inner.transition(id, OpportunityStatus::Deploying, Some(format!("change {}", validated.id()))) {
        return;
    }
    let observer = |record: &DeploymentRecord| observe(&inner, id, record);
    let outcome = inner
        .deployments
        .deploy(
            &validated,
            &opp.affected_components,
            opp.tenant_id.clone(),
            cancel.clone(),
            &observer,
        )
        .await;
    settle(&inner, id, &opp.affected_components, &opp.title, files, &outcome);
}

// ─── Deployment bookkeeping ─────────────────────────────────────────────────

fn observe(inner: &Inner, opportunity_id: Uuid, record: &DeploymentRecord) {
    inner.store_record(record);
    if record.phase == DeploymentPhase::Monitoring
        && inner.status_of(&opportunity_id) == Some(OpportunityStatus::Deploying)
    {
        inner.transition(
            opportunity_id,
            OpportunityStatus::Monitoring,
            Some(format!("deployment {}", record.id)),
        );
    }
}

fn remember(inner: &Inner, components: &[String], summary: &str, files: Vec<String>, outcome: PatternOutcome) {
    for component in components {
        inner.pipeline.patterns().record(
            component,
            PriorPattern {
                summary: summary.to_string(),
                outcome,
                files: files.clone(),
                recorded_at: Utc::now(),
            },
        );
    }
}

fn settle(
    inner: &Inner,
    opportunity_id: Uuid,
    components: &[String],
    summary: &str,
    files: Vec<String>,
    outcome: &DeploymentOutcome,
) {
    inner.store_record(&outcome.record);
    match &outcome.result {
        DeploymentResult::Completed => {
            remember(inner, components, summary, files, PatternOutcome::Completed);
            inner.transition(opportunity_id, OpportunityStatus::Completed, None);
        }
        DeploymentResult::RolledBack { cause } => {
            remember(inner, components, summary, files, PatternOutcome::RolledBack);
            inner.transition(opportunity_id, OpportunityStatus::RolledBack, Some(cause.to_string()));
        }
        DeploymentResult::RollbackFailed { cause, error } => {
            let reason = format!("rollback after {cause} failed: {error}");
            for component in components {
                inner.locks.mark_unavailable(component, reason.clone());
                inner.audit.record(
                    AuditEvent::new(SubjectKind::Component, component, "unavailable", "rollback_failed")
                        .tenant(outcome.record.tenant_id.clone())
                        .metrics(outcome.record.current_metrics.clone())
                        .severity(AuditSeverity::Critical),
                );
            }
            error!(
                opportunity_id = %opportunity_id,
                deployment_id = %outcome.record.id,
                components = ?components,
                error = %error,
                "ROLLBACK FAILED: components marked unavailable until cleared"
            );
            remember(inner, components, summary, files, PatternOutcome::RolledBack);
            inner.transition(opportunity_id, OpportunityStatus::RollbackFailed, Some(reason));
        }
        DeploymentResult::Aborted { cause } => {
            let to = if cause.is_cancellation() {
                OpportunityStatus::Discarded
            } else {
                OpportunityStatus::Failed
            };
            inner.transition(opportunity_id, to, Some(cause.to_string()));
        }
    }
}

pub(super) async fn resume_deployment(inner: Arc<Inner>, record: DeploymentRecord) -> Option<DeploymentOutcome> {
    let holder = record.opportunity_id.unwrap_or(record.id);
    let deployment_id = record.id;
    let components = record.components.clone();
    let _lease = match inner.locks.try_acquire_all(&components, holder) {
        Ok(lease) => lease,
        Err(conflict) => {
            warn!(deployment_id = %deployment_id, error = %conflict, "cannot resume deployment");
            return None;
        }
    };
    let summary = inner
        .book
        .lock()
        .get(&holder)
        .map(|o| o.title.clone())
        .unwrap_or_else(|| format!("deployment {deployment_id}"));

    // Resumed deployments are not tied to a cycle and cannot be cancelled.
    let (_keep, cancel) = watch::channel(false);
    let observer = |r: &DeploymentRecord| observe(&inner, holder, r);
    let outcome = match inner.deployments.resume(record, cancel, &observer).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(deployment_id = %deployment_id, error = %e, "deployment not resumable");
            return None;
        }
    };
    settle(&inner, holder, &components, &summary, Vec::new(), &outcome);
    Some(outcome)
}
