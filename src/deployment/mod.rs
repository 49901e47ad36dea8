//! # Deployment & Rollback Controller
//!
//! ## Responsibility
//! Apply a validated change to its components, watch the affected metrics
//! for a fixed window and revert automatically when they degrade.
//!
//! ## Guarantees
//! - Phases only move `pending → baseline_captured → deployed → monitoring →
//!   {completed | rolled_back | rollback_failed}`, or end `aborted` before
//!   anything was activated
//! - The baseline is captured before any activation and never changes
//! - Previous versions of every component are captured before the first
//!   activation, so rollback is possible for the whole monitoring window
//! - Monitoring waits are scheduled wake-ups; every collaborator call has a
//!   timeout
//! - A failed reactivation ends in `rollback_failed` and is never retried
//! - Every phase change is written to the audit trail
//!
//! ## NOT Responsible For
//! - Opportunity status (the orchestrator mirrors phases via the observer)
//! - Component exclusivity (see `resilience::component_lock`)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSeverity, AuditTrail, SubjectKind};
use crate::config::DeploymentConfig;
use crate::generation::ValidatedChange;
use crate::telemetry::InsightCache;
use crate::TenantId;

// ─── Collaborators ──────────────────────────────────────────────────────────

/// Opaque reference to a deployed component version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionRef(pub String);

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by a [`ComponentDeployer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployerError {
    /// The deployment target could not be reached.
    #[error("deployer unavailable: {0}")]
    Unavailable(String),
    /// The target refused the operation.
    #[error("deployer rejected operation: {0}")]
    Rejected(String),
}

/// Errors reported by a [`MetricsSampler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplerError {
    /// Metrics could not be read.
    #[error("metrics unavailable: {0}")]
    Unavailable(String),
}

/// Activates versions at the component boundary.
#[async_trait]
pub trait ComponentDeployer: Send + Sync {
    /// Version currently serving `component`.
    async fn current_version(&self, component: &str) -> Result<VersionRef, DeployerError>;

    /// Swap `change` in for `component`, returning the new version.
    async fn activate(&self, component: &str, change: &ValidatedChange) -> Result<VersionRef, DeployerError>;

    /// Put `version` back in service for `component`.
    async fn reactivate(&self, component: &str, version: &VersionRef) -> Result<(), DeployerError>;
}

/// Reads aggregated metrics for components.
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    /// Mean of every tracked metric over the trailing `window`, keyed
    /// `component/metric`.
    async fn sample(&self, components: &[String], window: Duration) -> Result<BTreeMap<String, f64>, SamplerError>;
}

// ─── Phases ─────────────────────────────────────────────────────────────────

/// Deployment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// Created, nothing captured yet.
    Pending,
    /// Baseline metrics captured.
    BaselineCaptured,
    /// Change active on every component.
    Deployed,
    /// Inside the monitoring window.
    Monitoring,
    /// Window elapsed without a breach.
    Completed,
    /// Previous versions reactivated.
    RolledBack,
    /// Reactivation failed; manual intervention required.
    RollbackFailed,
    /// Stopped before anything was activated.
    Aborted,
}

impl DeploymentPhase {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BaselineCaptured => "baseline_captured",
            Self::Deployed => "deployed",
            Self::Monitoring => "monitoring",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Aborted => "aborted",
        }
    }

    /// Phases reachable in one step.
    pub fn next(&self) -> &'static [DeploymentPhase] {
        use DeploymentPhase::*;
        match self {
            Pending => &[BaselineCaptured, Aborted],
            // A partially applied activation is reverted straight from here.
            BaselineCaptured => &[Deployed, RolledBack, RollbackFailed, Aborted],
            Deployed => &[Monitoring, RolledBack, RollbackFailed],
            Monitoring => &[Completed, RolledBack, RollbackFailed],
            Completed | RolledBack | RollbackFailed | Aborted => &[],
        }
    }

    /// Return `true` for final phases.
    pub fn is_terminal(&self) -> bool {
        self.next().is_empty()
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    /// Previous phase.
    pub from: DeploymentPhase,
    /// New phase.
    pub to: DeploymentPhase,
    /// When.
    pub at: DateTime<Utc>,
    /// Cause.
    pub trigger: String,
}

/// Errors raised by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeploymentError {
    /// A phase change outside the phase table was attempted.
    #[error("illegal phase change for deployment {id}: {from} -> {to}")]
    IllegalPhase {
        /// Deployment.
        id: Uuid,
        /// Current phase.
        from: DeploymentPhase,
        /// Requested phase.
        to: DeploymentPhase,
    },
    /// The record is already final and cannot be resumed.
    #[error("deployment {0} already finished")]
    AlreadyTerminal(Uuid),
}

// ─── Record ─────────────────────────────────────────────────────────────────

/// State of one deployment. Written only by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Deployment id.
    pub id: Uuid,
    /// Opportunity being deployed.
    pub opportunity_id: Option<Uuid>,
    /// Validated change being deployed.
    pub change_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Option<TenantId>,
    /// Components changed together.
    pub components: Vec<String>,
    /// Current phase.
    pub phase: DeploymentPhase,
    /// Metrics captured before activation, keyed `component/metric`.
    pub baseline_metrics: BTreeMap<String, f64>,
    /// Latest monitoring sample.
    pub current_metrics: BTreeMap<String, f64>,
    /// Worst relative degradation of the latest sample (0.10 = 10 %).
    pub degradation_pct: f64,
    /// Metric that produced `degradation_pct`.
    pub worst_metric: Option<String>,
    /// Version serving each component before activation.
    pub previous_versions: BTreeMap<String, VersionRef>,
    /// Version activated for each component.
    pub deployed_versions: BTreeMap<String, VersionRef>,
    /// Activation time.
    pub deployed_at: Option<DateTime<Utc>>,
    /// End of the monitoring window (wall clock).
    pub monitor_until: Option<DateTime<Utc>>,
    /// Successful monitoring samples.
    pub samples_taken: u32,
    /// Failed samples in a row.
    pub consecutive_sample_failures: u32,
    /// Every phase change, oldest first.
    pub history: Vec<PhaseChange>,
    /// Why the deployment ended where it did.
    pub reason: Option<String>,
}

impl DeploymentRecord {
    fn new(change: &ValidatedChange, components: &[String], tenant_id: Option<TenantId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            opportunity_id: change.opportunity_id(),
            change_id: change.id(),
            tenant_id,
            components: components.to_vec(),
            phase: DeploymentPhase::Pending,
            baseline_metrics: BTreeMap::new(),
            current_metrics: BTreeMap::new(),
            degradation_pct: 0.0,
            worst_metric: None,
            previous_versions: BTreeMap::new(),
            deployed_versions: BTreeMap::new(),
            deployed_at: None,
            monitor_until: None,
            samples_taken: 0,
            consecutive_sample_failures: 0,
            history: Vec::new(),
            reason: None,
        }
    }

    /// Phases visited so far, starting at `pending`.
    pub fn phases(&self) -> Vec<DeploymentPhase> {
        std::iter::once(DeploymentPhase::Pending)
            .chain(self.history.iter().map(|c| c.to))
            .collect()
    }

    fn advance(&mut self, to: DeploymentPhase, trigger: &str) -> Result<DeploymentPhase, DeploymentError> {
        let from = self.phase;
        if !from.next().contains(&to) {
            return Err(DeploymentError::IllegalPhase { id: self.id, from, to });
        }
        self.phase = to;
        self.history.push(PhaseChange {
            from,
            to,
            at: Utc::now(),
            trigger: trigger.to_string(),
        });
        Ok(from)
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// Why a deployment was reverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RollbackCause {
    /// A metric degraded beyond the threshold.
    Degradation {
        /// Worst metric.
        metric: String,
        /// Its degradation (0.15 = 15 %).
        degradation_pct: f64,
    },
    /// A new error-pattern insight named a deployed component.
    ErrorInsight {
        /// The component.
        component: String,
    },
    /// Metrics could not be sampled several times in a row.
    SamplingFailures {
        /// Failures in a row.
        consecutive: u32,
    },
    /// Activation failed part-way.
    ActivationFailed {
        /// Component whose activation failed.
        component: String,
        /// Deployer error.
        error: String,
    },
    /// The cycle was cancelled.
    Cancelled,
    /// The process stopped part-way through activation.
    Interrupted,
}

impl std::fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Degradation { metric, degradation_pct } => {
                write!(f, "degradation of {metric} by {:.1}%", degradation_pct * 100.0)
            }
            Self::ErrorInsight { component } => write!(f, "new error pattern on {component}"),
            Self::SamplingFailures { consecutive } => write!(f, "{consecutive} consecutive sampling failures"),
            Self::ActivationFailed { component, error } => write!(f, "activation of {component} failed: {error}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Interrupted => f.write_str("interrupted during activation"),
        }
    }
}

/// Tagged result of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeploymentResult {
    /// Window elapsed without a breach.
    Completed,
    /// Reverted.
    RolledBack {
        /// Why.
        cause: RollbackCause,
    },
    /// Reverting failed.
    RollbackFailed {
        /// Why the rollback was attempted.
        cause: RollbackCause,
        /// What failed while reverting.
        error: String,
    },
    /// Nothing was activated.
    Aborted {
        /// Why.
        cause: AbortCause,
    },
}

/// Why a deployment stopped before anything was activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortCause {
    /// The cycle was cancelled.
    Cancelled,
    /// The baseline could not be sampled.
    BaselineUnavailable {
        /// Sampler error or timeout.
        error: String,
    },
    /// The serving version of a component could not be read.
    VersionUnreadable {
        /// The component.
        component: String,
        /// Deployer error or timeout.
        error: String,
    },
    /// The first activation failed.
    ActivationFailed {
        /// The component.
        component: String,
        /// Deployer error or timeout.
        error: String,
    },
    /// The process stopped before any activation.
    Interrupted,
}

impl AbortCause {
    /// Return `true` when the abort came from a cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled before activation"),
            Self::BaselineUnavailable { error } => write!(f, "baseline capture failed: {error}"),
            Self::VersionUnreadable { component, error } => {
                write!(f, "cannot read current version of {component}: {error}")
            }
            Self::ActivationFailed { component, error } => write!(f, "activation of {component} failed: {error}"),
            Self::Interrupted => f.write_str("interrupted before activation"),
        }
    }
}

/// Final record plus tagged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    /// Final record.
    pub record: DeploymentRecord,
    /// Result.
    pub result: DeploymentResult,
}

/// Worst relative degradation of `current` against `baseline`.
///
/// Per metric: `max(0, (current - baseline) / |baseline|)`. Baselines of
/// zero, non-finite values and metrics missing from `current` are skipped.
/// Returns `None` when no metric is comparable.
pub fn compute_degradation(
    baseline: &BTreeMap<String, f64>,
    current: &BTreeMap<String, f64>,
) -> Option<(String, f64)> {
    baseline
        .iter()
        .filter(|(_, b)| b.is_finite() && **b != 0.0)
        .filter_map(|(k, b)| {
            let c = current.get(k).filter(|c| c.is_finite())?;
            Some((k.clone(), ((c - b) / b.abs()).max(0.0)))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn remaining_window(record: &DeploymentRecord) -> Duration {
    record
        .monitor_until
        .and_then(|t| (t - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Callback invoked with the record after every phase change and sample.
pub type PhaseObserver<'a> = &'a (dyn Fn(&DeploymentRecord) + Send + Sync);

/// Resolves once `rx` reads `true`. A closed channel never resolves.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Drives deployments through their phases.
pub struct DeploymentController {
    config: DeploymentConfig,
    deployer: Arc<dyn ComponentDeployer>,
    sampler: Arc<dyn MetricsSampler>,
    insights: Arc<InsightCache>,
    audit: Arc<AuditTrail>,
}

impl std::fmt::Debug for DeploymentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentController")
            .field("config", &self.config)
            .finish()
    }
}

impl DeploymentController {
    /// Create a controller.
    pub fn new(
        config: DeploymentConfig,
        deployer: Arc<dyn ComponentDeployer>,
        sampler: Arc<dyn MetricsSampler>,
        insights: Arc<InsightCache>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            config,
            deployer,
            sampler,
            insights,
            audit,
        }
    }

    /// Deploy `change` to `components` and monitor it to a final phase.
    ///
    /// Setting `cancel` to `true` aborts before activation or rolls back
    /// after it.
    ///
    /// # Panics
    /// This function never panics.
    pub async fn deploy(
        &self,
        change: &ValidatedChange,
        components: &[String],
        tenant_id: Option<TenantId>,
        mut cancel: watch::Receiver<bool>,
        observe: PhaseObserver<'_>,
    ) -> DeploymentOutcome {
        let mut record = DeploymentRecord::new(change, components, tenant_id);
        observe(&record);
        info!(
            deployment_id = %record.id,
            change_id = %record.change_id,
            components = ?record.components,
            "deployment started"
        );

        if *cancel.borrow() {
            return self.abort(record, AbortCause::Cancelled, observe);
        }

        // Baseline first; it is never retaken.
        let baseline = tokio::time::timeout(
            self.config.call_timeout(),
            self.sampler.sample(&record.components, self.config.baseline_window()),
        )
        .await;
        match baseline {
            Ok(Ok(metrics)) => record.baseline_metrics = metrics,
            Ok(Err(e)) => {
                let cause = AbortCause::BaselineUnavailable { error: e.to_string() };
                return self.abort(record, cause, observe);
            }
            Err(_) => {
                let cause = AbortCause::BaselineUnavailable {
                    error: "timed out".to_string(),
                };
                return self.abort(record, cause, observe);
            }
        }
        self.enter(&mut record, DeploymentPhase::BaselineCaptured, "baseline_sampled", observe);

        for component in components {
            match tokio::time::timeout(self.config.call_timeout(), self.deployer.current_version(component)).await {
                Ok(Ok(v)) => {
                    record.previous_versions.insert(component.clone(), v);
                }
                Ok(Err(e)) => {
                    let cause = AbortCause::VersionUnreadable {
                        component: component.clone(),
                        error: e.to_string(),
                    };
                    return self.abort(record, cause, observe);
                }
                Err(_) => {
                    let cause = AbortCause::VersionUnreadable {
                        component: component.clone(),
                        error: "timed out".to_string(),
                    };
                    return self.abort(record, cause, observe);
                }
            }
        }

        let mut activated: Vec<String> = Vec::new();
        for component in components {
            if *cancel.borrow() {
                if activated.is_empty() {
                    return self.abort(record, AbortCause::Cancelled, observe);
                }
                return self.roll_back(record, activated, RollbackCause::Cancelled, observe).await;
            }
            let result = tokio::time::timeout(self.config.call_timeout(), self.deployer.activate(component, change)).await;
            let error = match result {
                Ok(Ok(version)) => {
                    record.deployed_versions.insert(component.clone(), version);
                    activated.push(component.clone());
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "activation timed out".to_string(),
            };
            warn!(deployment_id = %record.id, component = %component, error = %error, "activation failed");
            if activated.is_empty() {
                let cause = AbortCause::ActivationFailed {
                    component: component.clone(),
                    error,
                };
                return self.abort(record, cause, observe);
            }
            let cause = RollbackCause::ActivationFailed {
                component: component.clone(),
                error,
            };
            return self.roll_back(record, activated, cause, observe).await;
        }

        let now = Utc::now();
        record.deployed_at = Some(now);
        record.monitor_until = Some(
            now + chrono::Duration::from_std(self.config.monitoring_duration())
                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
        );
        self.enter(&mut record, DeploymentPhase::Deployed, "activated", observe);
        self.enter(&mut record, DeploymentPhase::Monitoring, "monitoring_started", observe);
        let window = self.config.monitoring_duration();
        self.monitor(record, window, &mut cancel, observe).await
    }

    /// Continue a deployment loaded from persisted state.
    ///
    /// Monitoring resumes until the wall-clock `monitor_until`. A record
    /// interrupted during activation is rolled back; one interrupted before
    /// any version was captured is aborted.
    ///
    /// # Errors
    /// Returns [`DeploymentError::AlreadyTerminal`] for a finished record.
    pub async fn resume(
        &self,
        mut record: DeploymentRecord,
        mut cancel: watch::Receiver<bool>,
        observe: PhaseObserver<'_>,
    ) -> Result<DeploymentOutcome, DeploymentError> {
        if record.phase.is_terminal() {
            return Err(DeploymentError::AlreadyTerminal(record.id));
        }
        info!(deployment_id = %record.id, phase = %record.phase, "resuming deployment");
        let outcome = match record.phase {
            DeploymentPhase::Pending => self.abort(record, AbortCause::Interrupted, observe),
            DeploymentPhase::BaselineCaptured if record.previous_versions.is_empty() => {
                self.abort(record, AbortCause::Interrupted, observe)
            }
            DeploymentPhase::BaselineCaptured => {
                let all = record.previous_versions.keys().cloned().collect();
                self.roll_back(record, all, RollbackCause::Interrupted, observe).await
            }
            DeploymentPhase::Deployed => {
                if record.monitor_until.is_none() {
                    record.monitor_until = Some(
                        Utc::now()
                            + chrono::Duration::from_std(self.config.monitoring_duration())
                                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
                    );
                }
                self.enter(&mut record, DeploymentPhase::Monitoring, "monitoring_resumed", observe);
                let remaining = remaining_window(&record);
                self.monitor(record, remaining, &mut cancel, observe).await
            }
            _ => {
                let remaining = remaining_window(&record);
                self.monitor(record, remaining, &mut cancel, observe).await
            }
        };
        Ok(outcome)
    }

    async fn monitor(
        &self,
        mut record: DeploymentRecord,
        remaining: Duration,
        cancel: &mut watch::Receiver<bool>,
        observe: PhaseObserver<'_>,
    ) -> DeploymentOutcome {
        let interval = self.config.sampling_interval().max(Duration::from_millis(1));
        let deadline = Instant::now() + remaining;
        let since = record.deployed_at.unwrap_or_else(Utc::now);
        let mut next = Instant::now() + interval;

        loop {
            let wake = next.min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancelled(cancel) => {
                    let all = record.components.clone();
                    return self.roll_back(record, all, RollbackCause::Cancelled, observe).await;
                }
            }

            if let Some(component) = self.error_insight_for(&record.components, since) {
                let all = record.components.clone();
                return self.roll_back(record, all, RollbackCause::ErrorInsight { component }, observe).await;
            }

            if next > deadline {
                self.enter(&mut record, DeploymentPhase::Completed, "monitoring_window_elapsed", observe);
                info!(
                    deployment_id = %record.id,
                    samples = record.samples_taken,
                    worst = record.degradation_pct,
                    "deployment completed"
                );
                return DeploymentOutcome {
                    record,
                    result: DeploymentResult::Completed,
                };
            }

            let sample = tokio::time::timeout(
                self.config.call_timeout(),
                self.sampler.sample(&record.components, interval),
            )
            .await;
            match sample {
                Ok(Ok(current)) => {
                    record.consecutive_sample_failures = 0;
                    record.samples_taken += 1;
                    let worst = compute_degradation(&record.baseline_metrics, &current);
                    record.current_metrics = current;
                    if let Some((metric, degradation)) = worst {
                        record.degradation_pct = degradation;
                        record.worst_metric = Some(metric.clone());
                        debug!(
                            deployment_id = %record.id,
                            metric = %metric,
                            degradation,
                            "monitoring sample"
                        );
                        if degradation > self.config.rollback_degradation_threshold {
                            let all = record.components.clone();
                            let cause = RollbackCause::Degradation {
                                metric,
                                degradation_pct: degradation,
                            };
                            return self.roll_back(record, all, cause, observe).await;
                        }
                    }
                    observe(&record);
                }
                failed => {
                    record.consecutive_sample_failures += 1;
                    let error = match failed {
                        Ok(Err(e)) => e.to_string(),
                        _ => "sampling timed out".to_string(),
                    };
                    warn!(
                        deployment_id = %record.id,
                        consecutive = record.consecutive_sample_failures,
                        error = %error,
                        "monitoring sample failed"
                    );
                    if record.consecutive_sample_failures >= self.config.max_consecutive_sample_failures {
                        let all = record.components.clone();
                        let cause = RollbackCause::SamplingFailures {
                            consecutive: record.consecutive_sample_failures,
                        };
                        return self.roll_back(record, all, cause, observe).await;
                    }
                    observe(&record);
                }
            }
            next += interval;
        }
    }

    fn error_insight_for(&self, components: &[String], since: DateTime<Utc>) -> Option<String> {
        components
            .iter()
            .find(|c| self.insights.has_error_insight_for(c, since))
            .cloned()
    }

    async fn roll_back(
        &self,
        mut record: DeploymentRecord,
        components: Vec<String>,
        cause: RollbackCause,
        observe: PhaseObserver<'_>,
    ) -> DeploymentOutcome {
        warn!(deployment_id = %record.id, cause = %cause, "rolling back");
        let mut failures = Vec::new();
        for component in components.iter().rev() {
            let Some(previous) = record.previous_versions.get(component) else {
                failures.push(format!("{component}: no previous version recorded"));
                continue;
            };
            match tokio::time::timeout(self.config.call_timeout(), self.deployer.reactivate(component, previous)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("{component}: {e}")),
                Err(_) => failures.push(format!("{component}: reactivation timed out")),
            }
        }

        let trigger = cause.to_string();
        if failures.is_empty() {
            record.reason = Some(trigger.clone());
            self.enter(&mut record, DeploymentPhase::RolledBack, &trigger, observe);
            return DeploymentOutcome {
                record,
                result: DeploymentResult::RolledBack { cause },
            };
        }

        let error = failures.join("; ");
        record.reason = Some(format!("{trigger}; rollback failed: {error}"));
        self.enter(&mut record, DeploymentPhase::RollbackFailed, &trigger, observe);
        error!(
            deployment_id = %record.id,
            components = ?record.components,
            error = %error,
            "rollback failed; manual intervention required"
        );
        DeploymentOutcome {
            record,
            result: DeploymentResult::RollbackFailed { cause, error },
        }
    }

    fn abort(&self, mut record: DeploymentRecord, cause: AbortCause, observe: PhaseObserver<'_>) -> DeploymentOutcome {
        let reason = cause.to_string();
        record.reason = Some(reason.clone());
        self.enter(&mut record, DeploymentPhase::Aborted, &reason, observe);
        DeploymentOutcome {
            record,
            result: DeploymentResult::Aborted { cause },
        }
    }

    fn enter(&self, record: &mut DeploymentRecord, to: DeploymentPhase, trigger: &str, observe: PhaseObserver<'_>) {
        let from = match record.advance(to, trigger) {
            Ok(from) => from,
            Err(e) => {
                error!(error = %e, "deployment phase change refused");
                return;
            }
        };
        let severity = match to {
            DeploymentPhase::RollbackFailed => AuditSeverity::Critical,
            DeploymentPhase::RolledBack | DeploymentPhase::Aborted => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        let metrics = if record.current_metrics.is_empty() {
            record.baseline_metrics.clone()
        } else {
            record.current_metrics.clone()
        };
        self.audit.record(
            AuditEvent::new(SubjectKind::Deployment, record.id, to.as_str(), trigger)
                .from_state(from.as_str())
                .tenant(record.tenant_id.clone())
                .metrics(metrics)
                .severity(severity),
        );
        observe(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::generation::{ChangeValidator, CodebaseGraph, GeneratedChange};
    use crate::simulation::{InMemoryDeployer, ScriptedSampler};
    use crate::telemetry::{InsightType, Severity, TelemetryInsight};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    fn validated() -> ValidatedChange {
        let change = GeneratedChange {
            id: Uuid::new_v4(),
            opportunity_id: Some(Uuid::new_v4()),
            files: BTreeMap::from([(
                "src/api.rs".to_string(),
                "pub fn handler() -> u32 {\n    1\n}\n".to_string(),
            )]),
            model_used: "test".into(),
            token_count: 1,
            created_at: Utc::now(),
        };
        ChangeValidator::new(ValidationConfig::default(), CodebaseGraph::new())
            .expect("test: validator")
            .validate(change)
            .expect("test: valid")
    }

    fn metrics(v: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("api/latency_ms".to_string(), v)])
    }

    struct Rig {
        controller: DeploymentController,
        deployer: Arc<InMemoryDeployer>,
        sampler: Arc<ScriptedSampler>,
        insights: Arc<InsightCache>,
        audit: Arc<AuditTrail>,
    }

    fn rig() -> Rig {
        let deployer = Arc::new(InMemoryDeployer::new());
        deployer.set_version("api", "v1");
        deployer.set_version("db", "v7");
        let sampler = Arc::new(ScriptedSampler::new());
        let insights = Arc::new(InsightCache::new(Duration::from_secs(7200)));
        let audit = Arc::new(AuditTrail::new());
        let controller = DeploymentController::new(
            DeploymentConfig::default(),
            Arc::clone(&deployer) as Arc<dyn ComponentDeployer>,
            Arc::clone(&sampler) as Arc<dyn MetricsSampler>,
            Arc::clone(&insights),
            Arc::clone(&audit),
        );
        Rig {
            controller,
            deployer,
            sampler,
            insights,
            audit,
        }
    }

    fn components(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        rx
    }

    // ── Degradation ──

    #[test]
    fn test_degradation_takes_worst_metric() {
        let base = BTreeMap::from([("a".to_string(), 100.0), ("b".to_string(), 50.0)]);
        let cur = BTreeMap::from([("a".to_string(), 105.0), ("b".to_string(), 60.0)]);
        let (metric, d) = compute_degradation(&base, &cur).expect("test: comparable");
        assert_eq!(metric, "b");
        assert!((d - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_improvement_is_zero_and_zero_baseline_skipped() {
        let base = BTreeMap::from([("a".to_string(), 100.0), ("z".to_string(), 0.0)]);
        let cur = BTreeMap::from([("a".to_string(), 80.0), ("z".to_string(), 50.0)]);
        assert_eq!(compute_degradation(&base, &cur), Some(("a".to_string(), 0.0)));
        assert_eq!(compute_degradation(&BTreeMap::new(), &cur), None);
    }

    #[test]
    fn test_phase_table_is_forward_only() {
        use DeploymentPhase::*;
        assert!(Pending.next().contains(&BaselineCaptured));
        assert!(!Pending.next().contains(&Deployed));
        assert!(!Deployed.next().contains(&Completed));
        assert!(Monitoring.next().contains(&RolledBack));
        for p in [Completed, RolledBack, RollbackFailed, Aborted] {
            assert!(p.is_terminal());
        }
    }

    // ── Controller ──

    #[tokio::test(start_paused = true)]
    async fn test_clean_deployment_completes_in_phase_order() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        r.sampler.push_metrics(metrics(105.0));
        let seen = Mutex::new(Vec::new());
        let observe = |rec: &DeploymentRecord| seen.lock().push(rec.phase);

        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &observe)
            .await;

        assert_eq!(out.result, DeploymentResult::Completed);
        use DeploymentPhase::*;
        assert_eq!(out.record.phases(), vec![Pending, BaselineCaptured, Deployed, Monitoring, Completed]);
        assert_eq!(out.record.samples_taken, 60);
        assert_eq!(out.record.previous_versions.get("api"), Some(&VersionRef("v1".into())));
        assert_ne!(r.deployer.active_version("api"), Some(VersionRef("v1".into())));
        assert!(seen.lock().contains(&Monitoring));
        assert_eq!(r.audit.for_subject(&out.record.id.to_string()).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degradation_rolls_back_to_previous_version() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        r.sampler.push_metrics(metrics(115.0));
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &|_| {})
            .await;
        assert!(matches!(
            out.result,
            DeploymentResult::RolledBack {
                cause: RollbackCause::Degradation { .. }
            }
        ));
        assert_eq!(r.deployer.active_version("api"), Some(VersionRef("v1".into())));
        assert_eq!(out.record.samples_taken, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_insight_triggers_rollback() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        r.insights.insert(TelemetryInsight::new(
            InsightType::ErrorPattern,
            Severity::Warning,
            "api",
            BTreeSet::new(),
            None,
            "boom",
            BTreeMap::new(),
            0.9,
            Utc::now() + chrono::Duration::seconds(1),
        ));
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &|_| {})
            .await;
        assert_eq!(
            out.result,
            DeploymentResult::RolledBack {
                cause: RollbackCause::ErrorInsight {
                    component: "api".into()
                }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_sampling_failures_roll_back() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        for _ in 0..3 {
            r.sampler.push_failure("metrics backend down");
        }
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &|_| {})
            .await;
        assert_eq!(
            out.result,
            DeploymentResult::RolledBack {
                cause: RollbackCause::SamplingFailures { consecutive: 3 }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_failure_aborts_without_activation() {
        let r = rig();
        r.sampler.push_failure("down");
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &|_| {})
            .await;
        match &out.result {
            DeploymentResult::Aborted { cause } => {
                assert!(matches!(cause, AbortCause::BaselineUnavailable { .. }));
                assert!(!cause.is_cancellation());
            }
            other => panic!("test: expected abort, got {other:?}"),
        }
        assert_eq!(r.deployer.activations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_baseline_aborts_with_cancelled_cause() {
        let r = rig();
        let (_tx, rx) = watch::channel(true);
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, rx, &|_| {})
            .await;
        assert_eq!(
            out.result,
            DeploymentResult::Aborted {
                cause: AbortCause::Cancelled
            }
        );
        assert_eq!(out.record.reason.as_deref(), Some("cancelled before activation"));
        assert_eq!(r.sampler.calls(), 0);
        assert_eq!(r.deployer.activations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_activation_reverts_activated_components() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        r.deployer.fail_activation("db");
        let out = r
            .controller
            .deploy(&validated(), &components(&["api", "db"]), None, never_cancelled(), &|_| {})
            .await;
        assert!(matches!(
            out.result,
            DeploymentResult::RolledBack {
                cause: RollbackCause::ActivationFailed { .. }
            }
        ));
        assert_eq!(r.deployer.active_version("api"), Some(VersionRef("v1".into())));
        assert_eq!(r.deployer.active_version("db"), Some(VersionRef("v7".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reactivation_is_rollback_failed() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        r.sampler.push_metrics(metrics(150.0));
        r.deployer.fail_reactivation("api");
        let out = r
            .controller
            .deploy(&validated(), &components(&["api"]), None, never_cancelled(), &|_| {})
            .await;
        assert!(matches!(out.result, DeploymentResult::RollbackFailed { .. }));
        assert_eq!(out.record.phase, DeploymentPhase::RollbackFailed);
        let last = r.audit.entries().pop().expect("test: audit entry");
        assert_eq!(last.severity, AuditSeverity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_monitoring_rolls_back() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        let (tx, rx) = watch::channel(false);
        let change = validated();
        let comps = components(&["api"]);
        let deploy = r.controller.deploy(&change, &comps, None, rx, &|_| {});
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            tx.send(true).expect("test: cancel");
        };
        let (out, ()) = tokio::join!(deploy, cancel);
        assert_eq!(
            out.result,
            DeploymentResult::RolledBack {
                cause: RollbackCause::Cancelled
            }
        );
        assert_eq!(r.deployer.active_version("api"), Some(VersionRef("v1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_monitoring_completes() {
        let r = rig();
        r.sampler.push_metrics(metrics(100.0));
        let mut record = DeploymentRecord::new(&validated(), &components(&["api"]), None);
        record.advance(DeploymentPhase::BaselineCaptured, "t").expect("test: phase");
        record.advance(DeploymentPhase::Deployed, "t").expect("test: phase");
        record.advance(DeploymentPhase::Monitoring, "t").expect("test: phase");
        record.baseline_metrics = metrics(100.0);
        record.previous_versions.insert("api".into(), VersionRef("v1".into()));
        record.deployed_at = Some(Utc::now() - chrono::Duration::minutes(50));
        record.monitor_until = Some(Utc::now() + chrono::Duration::seconds(630));

        let out = r
            .controller
            .resume(record, never_cancelled(), &|_| {})
            .await
            .expect("test: resumable");
        assert_eq!(out.result, DeploymentResult::Completed);
        assert_eq!(out.record.samples_taken, 10);
    }

    #[tokio::test]
    async fn test_resume_rejects_finished_record() {
        let r = rig();
        let mut record = DeploymentRecord::new(&validated(), &components(&["api"]), None);
        record.advance(DeploymentPhase::Aborted, "t").expect("test: phase");
        assert!(matches!(
            r.controller.resume(record, never_cancelled(), &|_| {}).await,
            Err(DeploymentError::AlreadyTerminal(_))
        ));
    }
}
