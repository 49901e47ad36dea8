//! # Persisted State
//!
//! ## Responsibility
//! Snapshot everything a restarted process needs to continue safely:
//! opportunities, deployment records, breaker states, telemetry offsets and
//! components marked unavailable.
//!
//! ## Guarantees
//! - Saves are atomic: the snapshot is written to a sibling temp file and
//!   renamed over the target
//! - A snapshot with an unknown version is refused, never half-applied
//! - Blocking file I/O runs on the blocking pool
//!
//! ## NOT Responsible For
//! - Deciding what to do with restored in-flight deployments (see
//!   `orchestrator::CycleOrchestrator::resume_deployments`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::deployment::DeploymentRecord;
use crate::opportunity::ImprovementOpportunity;
use crate::resilience::{CircuitBreakerState, UnavailableComponent};
use crate::TenantId;

/// Current snapshot format.
pub const STATE_VERSION: u32 = 1;

/// Errors raised while saving or loading state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be encoded or decoded.
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The snapshot was written by an incompatible version.
    #[error("unsupported state version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version in the file.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// The blocking task panicked or was cancelled.
    #[error("state task failed: {0}")]
    Task(String),
}

/// Full orchestrator snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Snapshot format.
    pub version: u32,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Every known opportunity.
    pub opportunities: Vec<ImprovementOpportunity>,
    /// Deployment records, including in-flight ones.
    pub deployments: Vec<DeploymentRecord>,
    /// Breaker states.
    pub breakers: Vec<CircuitBreakerState>,
    /// Per-tenant telemetry ingest offsets.
    pub telemetry_offsets: BTreeMap<TenantId, u64>,
    /// Components excluded from automated changes.
    pub unavailable_components: Vec<UnavailableComponent>,
}

impl PersistedState {
    /// Empty snapshot stamped now.
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            opportunities: Vec::new(),
            deployments: Vec::new(),
            breakers: Vec::new(),
            telemetry_offsets: BTreeMap::new(),
            unavailable_components: Vec::new(),
        }
    }

    /// Deployments not yet in a final phase.
    pub fn in_flight(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.deployments.iter().filter(|d| !d.phase.is_terminal())
    }
}

/// Durable home for [`PersistedState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist `state`, replacing any previous snapshot.
    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;

    /// Latest snapshot, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError>;
}

/// Pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        let tmp = self.temp_path();
        let bytes = body.len();
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&tmp, &body)?;
            std::fs::rename(&tmp, &path)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))??;
        debug!(path = %self.path.display(), bytes, "state saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let path = self.path.clone();
        let content = tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))??;

        let Some(content) = content else {
            return Ok(None);
        };
        let state: PersistedState = serde_json::from_slice(&content)?;
        if state.version != STATE_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        info!(
            path = %self.path.display(),
            opportunities = state.opportunities.len(),
            deployments = state.deployments.len(),
            "state loaded"
        );
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().await.expect("test: load").is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_and_no_temp_left_behind() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = JsonFileStore::new(dir.path().join("nested").join("state.json"));
        let mut state = PersistedState::empty();
        state.telemetry_offsets.insert(TenantId::new("acme"), 42);
        store.save(&state).await.expect("test: save");

        let loaded = store.load().await.expect("test: load").expect("test: present");
        assert_eq!(loaded.telemetry_offsets.get(&TenantId::new("acme")), Some(&42));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_unknown_version_refused() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = JsonFileStore::new(dir.path().join("state.json"));
        let mut state = PersistedState::empty();
        state.version = 99;
        store.save(&state).await.expect("test: save");
        assert!(matches!(
            store.load().await,
            Err(PersistenceError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_encoding_error() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").expect("test: write");
        let store = JsonFileStore::new(path);
        assert!(matches!(store.load().await, Err(PersistenceError::Encoding(_))));
    }
}
