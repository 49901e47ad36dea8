//! # Cycle Orchestrator
//!
//! ## Responsibility
//! Own the improvement loop: accept cycle requests, run analysis and
//! prioritisation, drive every selected opportunity through generation,
//! validation and deployment, and aggregate the outcomes. Also the control
//! surface exposed to the transport layer.
//!
//! ## Guarantees
//! - Single writer: opportunity status changes only here, through the
//!   [`OpportunityBook`] lifecycle table
//! - At most one cycle in progress per overlapping scope; a second request is
//!   rejected synchronously with [`CycleError::Conflict`]
//! - At most one active opportunity per component; conflicts are skipped
//!   and reported, never queued
//! - Bounded concurrency per scope
//! - Cancellation never leaves a deployed, unmonitored change in place
//! - Retried requests carrying the same idempotency key return the original
//!   cycle
//!
//! ## NOT Responsible For
//! - Transport, authentication, UI
//! - Coordination across several orchestrator processes

mod cycle;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSeverity, AuditTrail, SubjectKind};
use crate::config::{validation, OrchestratorConfig};
use crate::deployment::{
    ComponentDeployer, DeploymentController, DeploymentOutcome, DeploymentRecord, MetricsSampler,
};
use crate::generation::{
    ChangeValidator, CodebaseGraph, ComponentRequirements, GenerationFailure, GenerationPipeline,
    GenerationService, PatternMemory, ValidatedChange, ValidationRejection,
};
use crate::opportunity::{ImprovementOpportunity, OpportunityBook, OpportunityStatus};
use crate::persistence::PersistedState;
use crate::prioritizer::OpportunityPrioritizer;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerState, ComponentLocks, ScopeLimiter, UnavailableComponent,
};
use crate::telemetry::{
    spawn_event_subscription, spawn_ingest, IngestOutcome, InsightCache, InsightQuery, TelemetryAnalyzer,
    TelemetryBuffer, TelemetryEvent, TelemetryInsight, TelemetryPlatform, TenantBufferStats,
};
use crate::{OrchestratorError, Scope, TenantId};

pub use cycle::{CycleSummary, OpportunityOutcome};

/// Finished cycles kept for status and idempotent retries.
const MAX_FINISHED_CYCLES: usize = 256;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors returned by the control surface.
#[derive(Debug, Error)]
pub enum CycleError {
    /// A cycle is already running for an overlapping scope.
    #[error("cycle {running} already in progress for overlapping scope {scope}")]
    Conflict {
        /// Scope of the running cycle.
        scope: Scope,
        /// The running cycle.
        running: Uuid,
    },

    /// The request itself is malformed.
    #[error("invalid cycle request: {0}")]
    InvalidRequest(String),

    /// No cycle with this id.
    #[error("cycle {0} not found")]
    CycleNotFound(Uuid),

    /// The opportunity is not waiting for an approval signal.
    #[error("opportunity {0} is not awaiting approval")]
    NotAwaitingApproval(Uuid),

    /// State cannot be restored while cycles are running.
    #[error("cannot restore state while {0} cycle(s) are running")]
    Busy(usize),

    /// Ad hoc generation failed.
    #[error(transparent)]
    Generation(#[from] GenerationFailure),

    /// Ad hoc generation produced a change that failed validation.
    #[error(transparent)]
    Rejected(#[from] ValidationRejection),
}

// ─── Requests & snapshots ───────────────────────────────────────────────────

/// Input to [`CycleOrchestrator::trigger_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRequest {
    /// Analysis window; the configured default when `None`.
    pub analysis_window_hours: Option<u64>,
    /// Opportunities to process; the configured default when `None`.
    pub max_improvements: Option<usize>,
    /// Tenant scope; `None` runs a system-wide cycle.
    pub tenant_id: Option<TenantId>,
    /// Idempotency key for safe retries.
    pub request_id: Option<String>,
}

impl CycleRequest {
    /// Request for `tenant` with default window and limit.
    pub fn for_tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(TenantId::new(tenant)),
            ..Self::default()
        }
    }

    /// System-wide request with default window and limit.
    pub fn system() -> Self {
        Self::default()
    }
}

/// Cycle as listed in [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInfo {
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Scope.
    pub scope: Scope,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// `true` until the summary is available.
    pub in_progress: bool,
    /// Summary of a finished cycle.
    pub summary: Option<CycleSummary>,
}

/// Cycle and component health, filtered to the caller's scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Scope the snapshot was filtered to.
    pub scope: Scope,
    /// Known cycles, newest first.
    pub cycles: Vec<CycleInfo>,
    /// Opportunity counts per status.
    pub opportunities: BTreeMap<OpportunityStatus, usize>,
    /// Deployments not yet in a final phase.
    pub active_deployments: Vec<DeploymentRecord>,
    /// Breaker states.
    pub breakers: Vec<CircuitBreakerState>,
    /// Components excluded from automated changes.
    pub unavailable_components: Vec<UnavailableComponent>,
    /// Components currently locked, with the holding opportunity.
    pub locked_components: Vec<(String, Uuid)>,
    /// Telemetry buffer bookkeeping.
    pub buffers: Vec<TenantBufferStats>,
    /// Opportunities waiting for approval.
    pub awaiting_approval: Vec<Uuid>,
}

/// External collaborators and configuration.
pub struct OrchestratorDeps {
    /// Configuration; validated by [`CycleOrchestrator::new`].
    pub config: OrchestratorConfig,
    /// Metrics and log source.
    pub platform: Arc<dyn TelemetryPlatform>,
    /// Code-authoring backend.
    pub generator: Arc<dyn GenerationService>,
    /// Version activation at the component boundary.
    pub deployer: Arc<dyn ComponentDeployer>,
    /// Metrics reads for baselines and monitoring.
    pub sampler: Arc<dyn MetricsSampler>,
    /// Known modules and allowed external roots for import resolution.
    pub codebase: CodebaseGraph,
}

// ─── Shared state ───────────────────────────────────────────────────────────

struct CycleHandle {
    scope: Scope,
    started_at: DateTime<Utc>,
    request_id: Option<String>,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<Option<CycleSummary>>,
}

impl CycleHandle {
    fn in_progress(&self) -> bool {
        self.done.borrow().is_none()
    }
}

pub(crate) struct Inner {
    config: OrchestratorConfig,
    analyzer: Arc<TelemetryAnalyzer>,
    prioritizer: OpportunityPrioritizer,
    pipeline: GenerationPipeline,
    deployments: DeploymentController,
    book: Mutex<OpportunityBook>,
    records: Mutex<HashMap<Uuid, DeploymentRecord>>,
    locks: ComponentLocks,
    limiter: ScopeLimiter,
    audit: Arc<AuditTrail>,
    cycles: Mutex<HashMap<Uuid, CycleHandle>>,
    idempotency: Mutex<HashMap<String, Uuid>>,
    approvals: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
}

impl Inner {
    /// Move an opportunity and audit the change. Returns `false` when the
    /// lifecycle table refused it.
    pub(crate) fn transition(&self, id: Uuid, to: OpportunityStatus, reason: Option<String>) -> bool {
        let result = {
            let mut book = self.book.lock();
            book.transition(&id, to, reason.clone())
                .map(|from| (from, book.get(&id).and_then(|o| o.tenant_id.clone())))
        };
        let (from, tenant) = match result {
            Ok(v) => v,
            Err(e) => {
                error!(opportunity_id = %id, error = %e, "opportunity transition refused");
                return false;
            }
        };
        let severity = match to {
            OpportunityStatus::RollbackFailed => AuditSeverity::Critical,
            OpportunityStatus::RolledBack
            | OpportunityStatus::Failed
            | OpportunityStatus::Skipped
            | OpportunityStatus::Discarded => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        self.audit.record(
            AuditEvent::new(SubjectKind::Opportunity, id, to.as_str(), reason.unwrap_or_else(|| "orchestrator".into()))
                .from_state(from.as_str())
                .tenant(tenant)
                .severity(severity),
        );
        true
    }

    pub(crate) fn status_of(&self, id: &Uuid) -> Option<OpportunityStatus> {
        self.book.lock().get(id).map(|o| o.status)
    }

    pub(crate) fn store_record(&self, record: &DeploymentRecord) {
        self.records.lock().insert(record.id, record.clone());
    }

    fn prune_finished(&self) {
        let mut cycles = self.cycles.lock();
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = cycles
            .iter()
            .filter(|(_, h)| !h.in_progress())
            .map(|(id, h)| (h.started_at, *id))
            .collect();
        if finished.len() <= MAX_FINISHED_CYCLES {
            return;
        }
        finished.sort();
        let excess = finished.len() - MAX_FINISHED_CYCLES;
        let mut idempotency = self.idempotency.lock();
        for (_, id) in finished.into_iter().take(excess) {
            if let Some(h) = cycles.remove(&id) {
                if let Some(key) = h.request_id {
                    idempotency.remove(&key);
                }
            }
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// The closed-loop improvement orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct CycleOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleOrchestrator")
            .field("cycles", &self.inner.cycles.lock().len())
            .field("opportunities", &self.inner.book.lock().len())
            .finish()
    }
}

impl CycleOrchestrator {
    /// Validate the configuration and wire every component.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::ConfigError`] listing every invalid
    /// setting, including malformed security deny patterns.
    pub fn new(deps: OrchestratorDeps) -> Result<Self, OrchestratorError> {
        let config = deps.config;
        validation::validate(&config).map_err(|errors| {
            OrchestratorError::ConfigError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let buffer = Arc::new(TelemetryBuffer::new(config.buffer.capacity_per_tenant));
        let cache = Arc::new(InsightCache::new(Duration::from_secs(config.insight_cache.ttl_secs)));
        let analyzer = Arc::new(TelemetryAnalyzer::new(
            config.analyzer.clone(),
            buffer,
            deps.platform,
            CircuitBreaker::new("telemetry", config.telemetry_breaker.clone()),
            Arc::clone(&cache),
        ));

        let validator = ChangeValidator::new(config.validation.clone(), deps.codebase)
            .map_err(|e| OrchestratorError::ConfigError(e.to_string()))?;
        let pipeline = GenerationPipeline::new(
            deps.generator,
            CircuitBreaker::new("generation", config.generation_breaker.clone()),
            Duration::from_secs(config.generation.timeout_secs),
            Arc::new(PatternMemory::new(config.generation.max_patterns_per_component)),
            validator,
        );

        let audit = Arc::new(AuditTrail::new());
        let deployments = DeploymentController::new(
            config.deployment.clone(),
            deps.deployer,
            deps.sampler,
            cache,
            Arc::clone(&audit),
        );

        info!(
            max_concurrent_per_scope = config.cycle.max_concurrent_per_scope,
            monitoring_secs = config.deployment.monitoring_duration_secs,
            "orchestrator ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                prioritizer: OpportunityPrioritizer::new(config.prioritizer.clone()),
                limiter: ScopeLimiter::new(config.cycle.max_concurrent_per_scope),
                analyzer,
                pipeline,
                deployments,
                book: Mutex::new(OpportunityBook::new()),
                records: Mutex::new(HashMap::new()),
                locks: ComponentLocks::new(),
                audit,
                cycles: Mutex::new(HashMap::new()),
                idempotency: Mutex::new(HashMap::new()),
                approvals: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    /// Start a cycle and return its id.
    ///
    /// Must be called from within a Tokio runtime; the cycle runs on a
    /// spawned task.
    ///
    /// # Errors
    /// - [`CycleError::InvalidRequest`] for a zero window or limit.
    /// - [`CycleError::Conflict`] when a cycle is in progress for an
    ///   overlapping scope.
    pub async fn trigger_cycle(&self, request: CycleRequest) -> Result<Uuid, CycleError> {
        let cfg = &self.inner.config.cycle;
        let window_hours = request.analysis_window_hours.unwrap_or(cfg.default_analysis_window_hours);
        let max_improvements = request.max_improvements.unwrap_or(cfg.max_improvements);
        if window_hours == 0 {
            return Err(CycleError::InvalidRequest("analysis_window_hours must be at least 1".into()));
        }
        if max_improvements == 0 {
            return Err(CycleError::InvalidRequest("max_improvements must be at least 1".into()));
        }
        if request.request_id.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(CycleError::InvalidRequest("request_id must not be blank".into()));
        }
        let scope = Scope::from_tenant(request.tenant_id.clone());

        let cycle_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        {
            let mut cycles = self.inner.cycles.lock();
            if let Some(key) = &request.request_id {
                if let Some(existing) = self.inner.idempotency.lock().get(key) {
                    info!(cycle_id = %existing, request_id = %key, "duplicate cycle request");
                    return Ok(*existing);
                }
            }
            if let Some((running, h)) = cycles.iter().find(|(_, h)| h.in_progress() && h.scope.overlaps(&scope)) {
                warn!(scope = %scope, running = %running, "cycle rejected: overlapping cycle in progress");
                return Err(CycleError::Conflict {
                    scope: h.scope.clone(),
                    running: *running,
                });
            }
            cycles.insert(
                cycle_id,
                CycleHandle {
                    scope: scope.clone(),
                    started_at: Utc::now(),
                    request_id: request.request_id.clone(),
                    cancel: cancel_tx,
                    done: done_rx,
                },
            );
            if let Some(key) = request.request_id {
                self.inner.idempotency.lock().insert(key, cycle_id);
            }
        }

        info!(
            cycle_id = %cycle_id,
            scope = %scope,
            window_hours,
            max_improvements,
            "cycle triggered"
        );
        let inner = Arc::clone(&self.inner);
        let window = Duration::from_secs(window_hours.saturating_mul(3600));
        tokio::spawn(async move {
            let summary = cycle::run_cycle(Arc::clone(&inner), cycle_id, scope, window, max_improvements, cancel_rx).await;
            let _ = done_tx.send(Some(summary));
            inner.prune_finished();
        });
        Ok(cycle_id)
    }

    /// Answer the approval request for `opportunity_id`.
    ///
    /// # Errors
    /// Returns [`CycleError::NotAwaitingApproval`] when the opportunity is
    /// unknown, already decided or expired.
    pub fn approve(&self, opportunity_id: Uuid, approved: bool) -> Result<(), CycleError> {
        let sender = self.inner.approvals.lock().remove(&opportunity_id);
        let sender = sender.ok_or(CycleError::NotAwaitingApproval(opportunity_id))?;
        sender
            .send(approved)
            .map_err(|_| CycleError::NotAwaitingApproval(opportunity_id))?;
        info!(opportunity_id = %opportunity_id, approved, "approval signal received");
        Ok(())
    }

    /// Ask a running cycle to stop.
    ///
    /// Opportunities not yet deployed are discarded; deployed ones are rolled
    /// back. Cancelling a finished cycle is a no-op.
    ///
    /// # Errors
    /// Returns [`CycleError::CycleNotFound`] for an unknown id.
    pub fn cancel_cycle(&self, cycle_id: Uuid) -> Result<(), CycleError> {
        let cycles = self.inner.cycles.lock();
        let handle = cycles.get(&cycle_id).ok_or(CycleError::CycleNotFound(cycle_id))?;
        if handle.in_progress() {
            handle.cancel.send_replace(true);
            info!(cycle_id = %cycle_id, "cycle cancellation requested");
        }
        Ok(())
    }

    /// Wait until `cycle_id` finishes and return its summary.
    ///
    /// # Errors
    /// Returns [`CycleError::CycleNotFound`] for an unknown id.
    pub async fn wait_for_cycle(&self, cycle_id: Uuid) -> Result<CycleSummary, CycleError> {
        let mut done = {
            let cycles = self.inner.cycles.lock();
            cycles
                .get(&cycle_id)
                .map(|h| h.done.clone())
                .ok_or(CycleError::CycleNotFound(cycle_id))?
        };
        loop {
            if let Some(summary) = done.borrow_and_update().clone() {
                return Ok(summary);
            }
            if done.changed().await.is_err() {
                return done.borrow().clone().ok_or(CycleError::CycleNotFound(cycle_id));
            }
        }
    }

    /// Cycle and component health visible to `tenant` (everything when
    /// `None`).
    pub fn get_status(&self, tenant: Option<&TenantId>) -> StatusSnapshot {
        let scope = Scope::from_tenant(tenant.cloned());
        let visible = |t: Option<&TenantId>| match (&scope, t) {
            (Scope::System, _) => true,
            (Scope::Tenant(s), Some(t)) => s == t,
            (Scope::Tenant(_), None) => false,
        };

        let mut cycles: Vec<CycleInfo> = self
            .inner
            .cycles
            .lock()
            .iter()
            .filter(|(_, h)| visible(h.scope.tenant()))
            .map(|(id, h)| CycleInfo {
                cycle_id: *id,
                scope: h.scope.clone(),
                started_at: h.started_at,
                in_progress: h.in_progress(),
                summary: h.done.borrow().clone(),
            })
            .collect();
        cycles.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let mut opportunities = BTreeMap::new();
        for o in self.inner.book.lock().visible_in(&scope) {
            *opportunities.entry(o.status).or_insert(0) += 1;
        }

        let active_deployments = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| !r.phase.is_terminal() && visible(r.tenant_id.as_ref()))
            .cloned()
            .collect();

        let buffers = self
            .inner
            .analyzer
            .buffer()
            .stats()
            .into_iter()
            .filter(|s| scope.contains(&s.tenant_id))
            .collect();

        let awaiting: Vec<Uuid> = self.inner.approvals.lock().keys().copied().collect();
        let awaiting_approval = {
            let book = self.inner.book.lock();
            awaiting
                .into_iter()
                .filter(|id| book.get(id).is_some_and(|o| visible(o.tenant_id.as_ref())))
                .collect()
        };

        StatusSnapshot {
            generated_at: Utc::now(),
            scope: scope.clone(),
            cycles,
            opportunities,
            active_deployments,
            breakers: vec![
                self.inner.analyzer.breaker().state(),
                self.inner.pipeline.breaker().state(),
            ],
            unavailable_components: self.inner.locks.unavailable(),
            locked_components: self.inner.locks.held(),
            buffers,
            awaiting_approval,
        }
    }

    /// Cached insights matching `query`.
    pub fn query_insights(&self, query: &InsightQuery) -> Vec<TelemetryInsight> {
        self.inner.analyzer.cache().query(query)
    }

    /// Opportunities visible in `scope`, most recently updated first.
    pub fn opportunities(&self, scope: &Scope) -> Vec<ImprovementOpportunity> {
        self.inner.book.lock().visible_in(scope)
    }

    /// Generate and validate a change for ad hoc requirements, outside any
    /// cycle. Nothing is deployed.
    ///
    /// # Errors
    /// - [`CycleError::Generation`] when the requirements are invalid or the
    ///   service is unavailable.
    /// - [`CycleError::Rejected`] when the change fails validation.
    pub async fn request_component_generation(
        &self,
        requirements: &ComponentRequirements,
    ) -> Result<ValidatedChange, CycleError> {
        let change = self.inner.pipeline.generate_for(requirements).await?;
        let validated = self.inner.pipeline.validate(change)?;
        info!(
            change_id = %validated.id(),
            component = %requirements.component,
            tenant = %requirements.tenant_id,
            "ad hoc change generated"
        );
        Ok(validated)
    }

    /// Push one event into the telemetry buffer.
    pub fn ingest(&self, event: TelemetryEvent) -> IngestOutcome {
        self.inner.analyzer.ingest(event)
    }

    /// Start the periodic platform pull and the live event subscription.
    /// Both stop when `shutdown` flips to `true`.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let interval = Duration::from_secs(self.inner.config.buffer.ingest_interval_secs);
        vec![
            spawn_ingest(Arc::clone(&self.inner.analyzer), interval, shutdown.clone()),
            spawn_event_subscription(
                Arc::clone(&self.inner.analyzer),
                self.inner.config.analyzer.error_log_pattern.clone(),
                shutdown,
            ),
        ]
    }

    /// The audit trail.
    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.inner.audit
    }

    /// Clear the unavailable mark on `component` after manual repair.
    /// Returns `false` if it was not marked.
    pub fn clear_unavailable(&self, component: &str, operator: &str) -> bool {
        let cleared = self.inner.locks.clear_unavailable(component);
        if cleared {
            self.inner.audit.record(
                AuditEvent::new(SubjectKind::Component, component, "available", operator)
                    .from_state("unavailable")
                    .severity(AuditSeverity::Info),
            );
        }
        cleared
    }

    /// Snapshot everything needed to continue after a restart.
    pub fn export_state(&self) -> PersistedState {
        let mut state = PersistedState::empty();
        state.opportunities = self.inner.book.lock().all();
        state.deployments = self.inner.records.lock().values().cloned().collect();
        state.breakers = vec![
            self.inner.analyzer.breaker().state(),
            self.inner.pipeline.breaker().state(),
        ];
        state.telemetry_offsets = self.inner.analyzer.buffer().offsets();
        state.unavailable_components = self.inner.locks.unavailable();
        state
    }

    /// Load a snapshot taken by [`CycleOrchestrator::export_state`].
    ///
    /// In-flight deployments are restored as records only; call
    /// [`CycleOrchestrator::resume_deployments`] to continue monitoring them.
    /// Opportunities that were still before deployment are discarded with
    /// reason `interrupted by restart`.
    ///
    /// # Errors
    /// Returns [`CycleError::Busy`] while any cycle is running.
    pub fn restore_state(&self, state: PersistedState) -> Result<(), CycleError> {
        let running = self.inner.cycles.lock().values().filter(|h| h.in_progress()).count();
        if running > 0 {
            return Err(CycleError::Busy(running));
        }
        for b in &state.breakers {
            if b.name == self.inner.analyzer.breaker().name() {
                self.inner.analyzer.breaker().restore(b);
            } else if b.name == self.inner.pipeline.breaker().name() {
                self.inner.pipeline.breaker().restore(b);
            }
        }
        self.inner.analyzer.buffer().restore_offsets(&state.telemetry_offsets);
        self.inner.locks.restore_unavailable(&state.unavailable_components);
        let resumable: HashSet<Uuid> = state
            .deployments
            .iter()
            .filter(|r| !r.phase.is_terminal())
            .filter_map(|r| r.opportunity_id)
            .collect();
        *self.inner.records.lock() = state.deployments.into_iter().map(|r| (r.id, r)).collect();
        let opportunities = state.opportunities.len();
        let interrupted = {
            let mut book = self.inner.book.lock();
            book.restore(state.opportunities);
            book.interrupted(&resumable)
        };
        // Their cycle died with the previous process.
        for id in &interrupted {
            self.inner
                .transition(*id, OpportunityStatus::Discarded, Some("interrupted by restart".to_string()));
        }
        info!(
            opportunities,
            interrupted = interrupted.len(),
            saved_at = %state.saved_at,
            "state restored"
        );
        Ok(())
    }

    /// Continue every restored deployment that had not reached a final
    /// phase. Each runs on its own task and resolves to the final outcome,
    /// or `None` if its components could not be locked.
    pub fn resume_deployments(&self) -> Vec<JoinHandle<Option<DeploymentOutcome>>> {
        let pending: Vec<DeploymentRecord> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| !r.phase.is_terminal())
            .cloned()
            .collect();
        pending
            .into_iter()
            .map(|record| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(cycle::resume_deployment(inner, record))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{InMemoryDeployer, ScriptedGenerationService, ScriptedSampler, SimulatedTelemetryPlatform};

    fn orchestrator(config: OrchestratorConfig) -> CycleOrchestrator {
        CycleOrchestrator::new(OrchestratorDeps {
            config,
            platform: Arc::new(SimulatedTelemetryPlatform::new()),
            generator: Arc::new(ScriptedGenerationService::new()),
            deployer: Arc::new(InMemoryDeployer::new()),
            sampler: Arc::new(ScriptedSampler::new()),
            codebase: CodebaseGraph::new(),
        })
        .expect("test: orchestrator")
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = OrchestratorConfig::default();
        config.buffer.capacity_per_tenant = 0;
        let result = CycleOrchestrator::new(OrchestratorDeps {
            config,
            platform: Arc::new(SimulatedTelemetryPlatform::new()),
            generator: Arc::new(ScriptedGenerationService::new()),
            deployer: Arc::new(InMemoryDeployer::new()),
            sampler: Arc::new(ScriptedSampler::new()),
            codebase: CodebaseGraph::new(),
        });
        assert!(matches!(result, Err(OrchestratorError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_zero_limit_is_invalid_request() {
        let o = orchestrator(OrchestratorConfig::default());
        let req = CycleRequest {
            max_improvements: Some(0),
            ..CycleRequest::for_tenant("acme")
        };
        assert!(matches!(o.trigger_cycle(req).await, Err(CycleError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_empty_cycle_finishes_with_empty_summary() {
        let o = orchestrator(OrchestratorConfig::default());
        let id = o.trigger_cycle(CycleRequest::for_tenant("acme")).await.expect("test: trigger");
        let summary = o.wait_for_cycle(id).await.expect("test: summary");
        assert_eq!(summary.cycle_id, id);
        assert!(summary.outcomes.is_empty());
        assert!(!summary.partial);
        assert!(!o.get_status(None).cycles[0].in_progress);
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_original_cycle() {
        let o = orchestrator(OrchestratorConfig::default());
        let req = CycleRequest {
            request_id: Some("retry-1".into()),
            ..CycleRequest::for_tenant("acme")
        };
        let first = o.trigger_cycle(req.clone()).await.expect("test: first");
        let second = o.trigger_cycle(req).await.expect("test: second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_reported() {
        let o = orchestrator(OrchestratorConfig::default());
        let id = Uuid::new_v4();
        assert!(matches!(o.cancel_cycle(id), Err(CycleError::CycleNotFound(_))));
        assert!(matches!(o.wait_for_cycle(id).await, Err(CycleError::CycleNotFound(_))));
        assert!(matches!(o.approve(id, true), Err(CycleError::NotAwaitingApproval(_))));
    }

    #[tokio::test]
    async fn test_export_restore_carries_offsets_and_unavailable_marks() {
        let o = orchestrator(OrchestratorConfig::default());
        o.ingest(TelemetryEvent::metric(TenantId::new("acme"), "api", "latency_ms", 1.0, Utc::now()));
        o.inner.locks.mark_unavailable("db", "rollback failed");
        let state = o.export_state();

        let fresh = orchestrator(OrchestratorConfig::default());
        fresh.restore_state(state).expect("test: restore");
        let status = fresh.get_status(None);
        assert_eq!(status.unavailable_components.len(), 1);
        assert_eq!(fresh.export_state().telemetry_offsets.get(&TenantId::new("acme")), Some(&1));
        assert!(fresh.clear_unavailable("db", "operator"));
        assert!(fresh.get_status(None).unavailable_components.is_empty());
    }
}
