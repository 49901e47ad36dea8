//! # fleet-autoimprove
//!
//! A closed-loop improvement cycle for a running service fleet.
//!
//! ## Architecture
//!
//! ```text
//! TelemetryPlatform ─(breaker)─► TelemetryBuffer ──► TelemetryAnalyzer ──► InsightCache
//!                                                          │
//!                                                          ▼
//!                                                 OpportunityPrioritizer
//!                                                          │
//!                              CycleOrchestrator ◄─────────┘
//!                                      │  (bounded per tenant scope)
//!                                      ▼
//!        GenerationService ─(breaker)─► GenerationPipeline ──► ChangeValidator
//!                                                                   │
//!                                                                   ▼
//!                                   DeploymentController (baseline → deploy → monitor → rollback)
//! ```
//!
//! Every phase returns a tagged result consumed explicitly by the
//! [`orchestrator::CycleOrchestrator`], which is the only writer of
//! opportunity status.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod audit;
pub mod config;
pub mod deployment;
pub mod generation;
pub mod metrics;
pub mod opportunity;
pub mod orchestrator;
pub mod persistence;
pub mod prioritizer;
pub mod resilience;
pub mod simulation;
pub mod telemetry;

// Re-exports for convenience
pub use config::OrchestratorConfig;
pub use orchestrator::{CycleOrchestrator, CycleRequest, OrchestratorDeps};
pub use resilience::{CircuitBreaker, CircuitStatus};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` - structured JSON output for log aggregators
/// - anything else (including unset) - human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Process-level errors.
///
/// Component-level failures have their own error types; this enum covers
/// the failures that concern the process as a whole.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Persisted state could not be saved or restored.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Tenant identifier: the isolation boundary for telemetry, opportunities
/// and deployments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(
    /// The raw tenant identifier.
    pub String,
);

impl TenantId {
    /// Create a new [`TenantId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The scope a cycle, analysis or worker pool operates under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every tenant. Opportunities found here require explicit approval.
    System,
    /// A single tenant.
    Tenant(TenantId),
}

impl Scope {
    /// Build a scope from an optional tenant.
    pub fn from_tenant(tenant: Option<TenantId>) -> Self {
        match tenant {
            Some(t) => Scope::Tenant(t),
            None => Scope::System,
        }
    }

    /// Return `true` if two scopes cannot run cycles at the same time.
    ///
    /// The system scope overlaps every scope; tenant scopes overlap only
    /// themselves.
    pub fn overlaps(&self, other: &Scope) -> bool {
        match (self, other) {
            (Scope::System, _) | (_, Scope::System) => true,
            (Scope::Tenant(a), Scope::Tenant(b)) => a == b,
        }
    }

    /// Return `true` if data belonging to `tenant` is visible in this scope.
    pub fn contains(&self, tenant: &TenantId) -> bool {
        match self {
            Scope::System => true,
            Scope::Tenant(t) => t == tenant,
        }
    }

    /// The tenant of a tenant scope, `None` for the system scope.
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Scope::System => None,
            Scope::Tenant(t) => Some(t),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => f.write_str("system"),
            Scope::Tenant(t) => write!(f, "tenant:{t}"),
        }
    }
}
