//! # Generation Pipeline
//!
//! ## Responsibility
//! Build structured generation requests from opportunities or ad hoc
//! requirements, call the external generation service through its circuit
//! breaker with a hard timeout, and hand the result to the validator.
//!
//! ## Guarantees
//! - A timeout or an open breaker yields [`GenerationFailure::Unavailable`],
//!   never a panic and never a cycle abort
//! - Requirements are a closed schema, validated before any service call
//! - Service-side request rejections do not count as breaker failures
//!
//! ## NOT Responsible For
//! - The prompting strategy of the generation model
//! - Deploying anything (see `deployment`)

pub mod patterns;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::opportunity::ImprovementOpportunity;
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use crate::TenantId;

pub use patterns::{PatternMemory, PatternOutcome, PriorPattern};
pub use validation::{
    ChangeValidator, CodebaseGraph, GeneratedChange, RejectionReason, ValidatedChange,
    ValidationError, ValidationRejection, ValidationReport,
};

// ─── Service contract ───────────────────────────────────────────────────────

/// Errors reported by a generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationServiceError {
    /// The service could not produce a result right now.
    #[error("generation service unavailable: {0}")]
    Unavailable(String),
    /// The service refused the request as malformed.
    #[error("generation request rejected by service: {0}")]
    Rejected(String),
}

/// Structured request handed to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Request id, stable across retries of the same request.
    pub request_id: Uuid,
    /// Components the change may touch.
    pub components: Vec<String>,
    /// What the change must achieve.
    pub objective: String,
    /// Evidence and free-form context.
    pub context: String,
    /// Metric name to the value the change should reach.
    pub target_metrics: BTreeMap<String, f64>,
    /// Constraints the change must respect.
    pub constraints: Vec<String>,
    /// Outcomes of earlier changes to the same components, newest first.
    pub prior_patterns: Vec<PriorPattern>,
    /// Tenant the change is for; `None` for system-wide changes.
    pub tenant_id: Option<TenantId>,
}

/// Raw service output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Path to full file content.
    pub files: BTreeMap<String, String>,
    /// Model that produced the change.
    pub model_used: String,
    /// Tokens consumed.
    pub token_count: u64,
}

/// External code-authoring backend.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce a change for `request`.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationServiceError>;
}

// ─── Failures ───────────────────────────────────────────────────────────────

/// Why the service could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The hard timeout elapsed.
    Timeout,
    /// The breaker rejected the call.
    CircuitOpen,
    /// The service reported an error.
    ServiceError(String),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::ServiceError(m) => write!(f, "service error: {m}"),
        }
    }
}

/// Typed failure of a generation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GenerationFailure {
    /// The service could not be used; the opportunity fails, the cycle goes on.
    #[error("generation unavailable: {reason}")]
    Unavailable {
        /// Why.
        reason: UnavailableReason,
    },
    /// The request is malformed.
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
}

// ─── Requirements ───────────────────────────────────────────────────────────

/// Ad hoc generation requirements, as accepted from the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentRequirements {
    /// Requesting tenant.
    pub tenant_id: TenantId,
    /// Component to change.
    pub component: String,
    /// What the change must achieve.
    pub objective: String,
    /// Metric name to target value.
    #[serde(default)]
    pub target_metrics: BTreeMap<String, f64>,
    /// Constraints the change must respect.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Extra context.
    #[serde(default)]
    pub context: Option<String>,
}

impl ComponentRequirements {
    /// Parse and validate JSON requirements.
    ///
    /// # Errors
    /// Returns [`GenerationFailure::InvalidRequest`] for malformed JSON,
    /// unknown fields, or values that fail [`ComponentRequirements::validate`].
    pub fn from_json(json: &str) -> Result<Self, GenerationFailure> {
        let req: Self =
            serde_json::from_str(json).map_err(|e| GenerationFailure::InvalidRequest(e.to_string()))?;
        req.validate()?;
        Ok(req)
    }

    /// Check field values.
    ///
    /// # Errors
    /// Returns [`GenerationFailure::InvalidRequest`] naming the first bad field.
    pub fn validate(&self) -> Result<(), GenerationFailure> {
        let invalid = |m: &str| Err(GenerationFailure::InvalidRequest(m.to_string()));
        if self.tenant_id.as_str().trim().is_empty() {
            return invalid("tenant_id must not be empty");
        }
        if self.component.trim().is_empty() {
            return invalid("component must not be empty");
        }
        if self.objective.trim().is_empty() {
            return invalid("objective must not be empty");
        }
        if let Some((name, _)) = self.target_metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(GenerationFailure::InvalidRequest(format!(
                "target metric '{name}' must be finite"
            )));
        }
        Ok(())
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Generation and validation front-end.
pub struct GenerationPipeline {
    service: Arc<dyn GenerationService>,
    breaker: CircuitBreaker,
    timeout: Duration,
    patterns: Arc<PatternMemory>,
    validator: ChangeValidator,
}

impl std::fmt::Debug for GenerationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationPipeline")
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GenerationPipeline {
    /// Create a pipeline.
    pub fn new(
        service: Arc<dyn GenerationService>,
        breaker: CircuitBreaker,
        timeout: Duration,
        patterns: Arc<PatternMemory>,
        validator: ChangeValidator,
    ) -> Self {
        Self {
            service,
            breaker,
            timeout,
            patterns,
            validator,
        }
    }

    /// Generation breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Prior-pattern store.
    pub fn patterns(&self) -> &Arc<PatternMemory> {
        &self.patterns
    }

    /// Request a change for `opportunity`.
    ///
    /// # Errors
    /// Returns [`GenerationFailure::Unavailable`] on timeout, open breaker or
    /// service error, and [`GenerationFailure::InvalidRequest`] when the
    /// service rejects the request.
    pub async fn generate(&self, opportunity: &ImprovementOpportunity) -> Result<GeneratedChange, GenerationFailure> {
        let request = GenerationRequest {
            request_id: opportunity.id,
            components: opportunity.affected_components.clone(),
            objective: opportunity.title.clone(),
            context: opportunity.description.clone(),
            target_metrics: opportunity.target_metrics.clone(),
            constraints: vec![
                "keep public interfaces unchanged".to_string(),
                "no new external dependencies".to_string(),
            ],
            prior_patterns: self.patterns.for_components(&opportunity.affected_components),
            tenant_id: opportunity.tenant_id.clone(),
        };
        self.invoke(request, Some(opportunity.id)).await
    }

    /// Request a change for ad hoc `requirements`, outside any cycle.
    ///
    /// # Errors
    /// Same as [`GenerationPipeline::generate`], plus
    /// [`GenerationFailure::InvalidRequest`] when `requirements` fail
    /// validation.
    pub async fn generate_for(&self, requirements: &ComponentRequirements) -> Result<GeneratedChange, GenerationFailure> {
        requirements.validate()?;
        let components = vec![requirements.component.clone()];
        let request = GenerationRequest {
            request_id: Uuid::new_v4(),
            prior_patterns: self.patterns.for_components(&components),
            components,
            objective: requirements.objective.clone(),
            context: requirements.context.clone().unwrap_or_default(),
            target_metrics: requirements.target_metrics.clone(),
            constraints: requirements.constraints.clone(),
            tenant_id: Some(requirements.tenant_id.clone()),
        };
        self.invoke(request, None).await
    }

    /// Run static validation on `change`.
    ///
    /// # Errors
    /// Returns the [`ValidationRejection`] produced by the validator.
    pub fn validate(&self, change: GeneratedChange) -> Result<ValidatedChange, ValidationRejection> {
        self.validator.validate(change)
    }

    async fn invoke(
        &self,
        request: GenerationRequest,
        opportunity_id: Option<Uuid>,
    ) -> Result<GeneratedChange, GenerationFailure> {
        let service = Arc::clone(&self.service);
        let result = self
            .breaker
            .call_classified_with_timeout(
                self.timeout,
                || async move { service.generate(&request).await },
                |e| matches!(e, GenerationServiceError::Unavailable(_)),
            )
            .await;

        match result {
            Ok(response) => {
                info!(
                    opportunity_id = ?opportunity_id,
                    model = %response.model_used,
                    tokens = response.token_count,
                    files = response.files.len(),
                    "change generated"
                );
                Ok(GeneratedChange {
                    id: Uuid::new_v4(),
                    opportunity_id,
                    files: response.files,
                    model_used: response.model_used,
                    token_count: response.token_count,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                let failure = match e {
                    CircuitBreakerError::Open { .. } => GenerationFailure::Unavailable {
                        reason: UnavailableReason::CircuitOpen,
                    },
                    CircuitBreakerError::Timeout(_) => GenerationFailure::Unavailable {
                        reason: UnavailableReason::Timeout,
                    },
                    CircuitBreakerError::Failed(GenerationServiceError::Unavailable(m)) => {
                        GenerationFailure::Unavailable {
                            reason: UnavailableReason::ServiceError(m),
                        }
                    }
                    CircuitBreakerError::Failed(GenerationServiceError::Rejected(m)) => {
                        GenerationFailure::InvalidRequest(m)
                    }
                };
                warn!(opportunity_id = ?opportunity_id, error = %failure, "generation failed");
                Err(failure)
            }
        }
    }
}
