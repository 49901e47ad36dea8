//! # Audit Trail
//!
//! ## Responsibility
//! Record every terminal and error transition (opportunities, deployment
//! phases, cycles, component availability) as an immutable structured entry.
//!
//! ## Guarantees
//! - Append-only: entries are never modified or removed
//! - Sequence numbers are strictly increasing in append order
//! - Export is JSON lines, one entry per line, oldest first
//!
//! ## NOT Responsible For
//! - Shipping entries to external storage

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::TenantId;

/// What kind of thing an entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// An improvement cycle.
    Cycle,
    /// An improvement opportunity.
    Opportunity,
    /// A deployment.
    Deployment,
    /// A component's availability for automated changes.
    Component,
}

/// Entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine transition.
    Info,
    /// Designed safety outcome (rollback, rejection, skip).
    Warning,
    /// Requires manual intervention.
    Critical,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail.
    pub seq: u64,
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// Kind of subject.
    pub kind: SubjectKind,
    /// Subject id.
    pub subject: String,
    /// Tenant the subject belongs to.
    pub tenant_id: Option<TenantId>,
    /// Previous state, when there is one.
    pub from: Option<String>,
    /// New state.
    pub to: String,
    /// Who or what caused the transition.
    pub trigger: String,
    /// Metrics at the time of the transition.
    pub metrics: BTreeMap<String, f64>,
    /// Severity.
    pub severity: AuditSeverity,
}

/// Builder-style input to [`AuditTrail::record`].
#[derive(Debug, Clone)]
pub struct AuditEvent {
    kind: SubjectKind,
    subject: String,
    tenant_id: Option<TenantId>,
    from: Option<String>,
    to: String,
    trigger: String,
    metrics: BTreeMap<String, f64>,
    severity: AuditSeverity,
}

impl AuditEvent {
    /// Transition of `subject` to `to`, caused by `trigger`.
    pub fn new(kind: SubjectKind, subject: impl ToString, to: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.to_string(),
            tenant_id: None,
            from: None,
            to: to.into(),
            trigger: trigger.into(),
            metrics: BTreeMap::new(),
            severity: AuditSeverity::Info,
        }
    }

    /// Previous state.
    pub fn from_state(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Owning tenant.
    pub fn tenant(mut self, tenant: Option<TenantId>) -> Self {
        self.tenant_id = tenant;
        self
    }

    /// Metrics snapshot.
    pub fn metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Severity.
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Default)]
struct TrailInner {
    entries: Vec<AuditEntry>,
    next_seq: u64,
}

/// Append-only audit trail.
#[derive(Debug, Default)]
pub struct AuditTrail {
    inner: Mutex<TrailInner>,
}

impl AuditTrail {
    /// Empty trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number.
    pub fn record(&self, event: AuditEvent) -> u64 {
        let entry = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let entry = AuditEntry {
                seq,
                at: Utc::now(),
                kind: event.kind,
                subject: event.subject,
                tenant_id: event.tenant_id,
                from: event.from,
                to: event.to,
                trigger: event.trigger,
                metrics: event.metrics,
                severity: event.severity,
            };
            inner.entries.push(entry.clone());
            entry
        };

        let from = entry.from.as_deref().unwrap_or("-");
        match entry.severity {
            AuditSeverity::Info => info!(
                seq = entry.seq,
                kind = ?entry.kind,
                subject = %entry.subject,
                from,
                to = %entry.to,
                trigger = %entry.trigger,
                "audit"
            ),
            AuditSeverity::Warning => warn!(
                seq = entry.seq,
                kind = ?entry.kind,
                subject = %entry.subject,
                from,
                to = %entry.to,
                trigger = %entry.trigger,
                "audit"
            ),
            AuditSeverity::Critical => error!(
                seq = entry.seq,
                kind = ?entry.kind,
                subject = %entry.subject,
                from,
                to = %entry.to,
                trigger = %entry.trigger,
                "audit: manual intervention required"
            ),
        }
        entry.seq
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().entries.clone()
    }

    /// Entries with `seq >= from_seq`.
    pub fn since(&self, from_seq: u64) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect()
    }

    /// Entries about `subject`, oldest first.
    pub fn for_subject(&self, subject: &str) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Return `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the trail as JSON lines.
    ///
    /// # Errors
    /// Returns the serialisation error of the first entry that fails.
    pub fn export_jsonl(&self) -> Result<String, serde_json::Error> {
        let entries = self.entries();
        let mut out = String::new();
        for e in &entries {
            out.push_str(&serde_json::to_string(e)?);
            out.push('\n');
        }
        Ok(out)
    }
}
