//! # Improvement Opportunities
//!
//! ## Responsibility
//! Model a scored improvement candidate and its lifecycle, and keep the set
//! of known opportunities in an [`OpportunityBook`] owned by the orchestrator.
//!
//! ## Guarantees
//! - Status only moves along [`allowed_transitions`]; everything else is a
//!   [`TransitionError`]
//! - Terminal statuses have no outgoing transitions
//! - The only backward-looking edge is `monitoring → rolled_back`
//!
//! ## NOT Responsible For
//! - Deciding *when* to transition (see `orchestrator`)
//! - Per-component exclusivity (see `resilience::component_lock`)

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::telemetry::Severity;
use crate::{metrics, Scope, TenantId};

// ─── Status ─────────────────────────────────────────────────────────────────

/// Lifecycle status of an [`ImprovementOpportunity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    /// Produced by the prioritizer.
    Identified,
    /// Waiting for an explicit approval signal.
    PendingApproval,
    /// Picked for processing in the current cycle.
    Selected,
    /// Change requested from the generation service.
    Generating,
    /// Generated change under static validation.
    Validating,
    /// Baseline capture and activation in progress.
    Deploying,
    /// Deployed and inside the monitoring window.
    Monitoring,
    /// Monitoring window elapsed without a breach.
    Completed,
    /// Deployment reverted.
    RolledBack,
    /// Reverting failed; manual intervention required.
    RollbackFailed,
    /// Generation unavailable, validation rejected, or deployment aborted.
    Failed,
    /// Component locked by another opportunity or marked unavailable.
    Skipped,
    /// Approval expired or rejected, or cancelled before deployment.
    Discarded,
}

impl OpportunityStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [OpportunityStatus; 13] = [
        Self::Identified,
        Self::PendingApproval,
        Self::Selected,
        Self::Generating,
        Self::Validating,
        Self::Deploying,
        Self::Monitoring,
        Self::Completed,
        Self::RolledBack,
        Self::RollbackFailed,
        Self::Failed,
        Self::Skipped,
        Self::Discarded,
    ];

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::PendingApproval => "pending_approval",
            Self::Selected => "selected",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Deploying => "deploying",
            Self::Monitoring => "monitoring",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Discarded => "discarded",
        }
    }

    /// Return `true` for statuses with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        allowed_transitions(*self).is_empty()
    }

    /// Return `true` while the opportunity holds its component locks.
    pub fn holds_components(&self) -> bool {
        matches!(
            self,
            Self::Generating | Self::Validating | Self::Deploying | Self::Monitoring
        )
    }
}

impl std::fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statuses reachable from `from` in one step.
pub fn allowed_transitions(from: OpportunityStatus) -> Vec<OpportunityStatus> {
    use OpportunityStatus::*;
    match from {
        Identified => vec![PendingApproval, Selected, Skipped, Discarded],
        PendingApproval => vec![Selected, Discarded],
        Selected => vec![Generating, Skipped, Discarded],
        Generating => vec![Validating, Failed, Discarded],
        Validating => vec![Deploying, Failed, Discarded],
        Deploying => vec![Monitoring, Failed, RolledBack, RollbackFailed, Discarded],
        Monitoring => vec![Completed, RolledBack, RollbackFailed],
        Completed | RolledBack | RollbackFailed | Failed | Skipped | Discarded => vec![],
    }
}

/// Check a single transition.
///
/// # Errors
/// Returns [`TransitionError::Illegal`] when `to` is not reachable from
/// `from` in one step.
pub fn validate_transition(
    id: Uuid,
    from: OpportunityStatus,
    to: OpportunityStatus,
) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { id, from, to })
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors raised by [`OpportunityBook`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// No opportunity with this id.
    #[error("opportunity {0} not found")]
    NotFound(Uuid),
    /// The requested transition is not in the lifecycle table.
    #[error("illegal transition for opportunity {id}: {from} -> {to}")]
    Illegal {
        /// Opportunity id.
        id: Uuid,
        /// Current status.
        from: OpportunityStatus,
        /// Requested status.
        to: OpportunityStatus,
    },
}

// ─── Opportunity ────────────────────────────────────────────────────────────

/// A scored improvement candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementOpportunity {
    /// Unique id.
    pub id: Uuid,
    /// Short human-readable title.
    pub title: String,
    /// Evidence summary handed to the generation service.
    pub description: String,
    /// Insights this opportunity was built from.
    pub source_insight_ids: Vec<Uuid>,
    /// Impact score in `[0, 100]`.
    pub impact_score: f64,
    /// Highest confidence among the source insights.
    pub confidence: f64,
    /// Highest severity among the source insights.
    pub severity: Severity,
    /// Components the change would touch.
    pub affected_components: Vec<String>,
    /// Metric name to the value the change should restore.
    pub target_metrics: BTreeMap<String, f64>,
    /// Owning tenant; `None` for system-wide opportunities.
    pub tenant_id: Option<TenantId>,
    /// Held in `pending_approval` until explicitly approved.
    pub requires_approval: bool,
    /// Lifecycle status.
    pub status: OpportunityStatus,
    /// Cycle that selected this opportunity.
    pub cycle_id: Option<Uuid>,
    /// Earliest creation time of the source insights.
    pub first_seen: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Why the opportunity reached its current status, when not obvious.
    pub reason: Option<String>,
}

impl ImprovementOpportunity {
    /// Scope the opportunity belongs to.
    pub fn scope(&self) -> Scope {
        Scope::from_tenant(self.tenant_id.clone())
    }
}

// ─── OpportunityBook ────────────────────────────────────────────────────────

/// Every opportunity known to the orchestrator, keyed by id.
///
/// The orchestrator is the single writer; every status change goes through
/// [`OpportunityBook::transition`].
#[derive(Debug, Default)]
pub struct OpportunityBook {
    entries: HashMap<Uuid, ImprovementOpportunity>,
}

impl OpportunityBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new opportunity, replacing any entry with the same id.
    pub fn insert(&mut self, opportunity: ImprovementOpportunity) {
        metrics::inc_opportunity(opportunity.status.as_str());
        self.entries.insert(opportunity.id, opportunity);
    }

    /// Look up an opportunity.
    pub fn get(&self, id: &Uuid) -> Option<&ImprovementOpportunity> {
        self.entries.get(id)
    }

    /// Move `id` to `to`, returning the previous status.
    ///
    /// # Errors
    /// - [`TransitionError::NotFound`] for an unknown id.
    /// - [`TransitionError::Illegal`] when the lifecycle table forbids it.
    pub fn transition(
        &mut self,
        id: &Uuid,
        to: OpportunityStatus,
        reason: Option<String>,
    ) -> Result<OpportunityStatus, TransitionError> {
        let opp = self.entries.get_mut(id).ok_or(TransitionError::NotFound(*id))?;
        let from = opp.status;
        validate_transition(*id, from, to)?;
        opp.status = to;
        opp.updated_at = Utc::now();
        if reason.is_some() {
            opp.reason = reason;
        }
        metrics::inc_opportunity(to.as_str());
        info!(
            opportunity_id = %id,
            from = from.as_str(),
            to = to.as_str(),
            reason = opp.reason.as_deref().unwrap_or(""),
            "opportunity transition"
        );
        Ok(from)
    }

    /// Opportunities selected by `cycle_id`, highest impact first.
    pub fn for_cycle(&self, cycle_id: &Uuid) -> Vec<ImprovementOpportunity> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|o| o.cycle_id.as_ref() == Some(cycle_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));
        out
    }

    /// Every opportunity visible in `scope`, most recently updated first.
    pub fn visible_in(&self, scope: &Scope) -> Vec<ImprovementOpportunity> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|o| match (scope, &o.tenant_id) {
                (Scope::System, _) => true,
                (Scope::Tenant(t), Some(owner)) => t == owner,
                (Scope::Tenant(_), None) => false,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Count of opportunities per status.
    pub fn counts(&self) -> BTreeMap<OpportunityStatus, usize> {
        let mut out = BTreeMap::new();
        for o in self.entries.values() {
            *out.entry(o.status).or_default() += 1;
        }
        out
    }

    /// All opportunities, unordered.
    pub fn all(&self) -> Vec<ImprovementOpportunity> {
        self.entries.values().cloned().collect()
    }

    /// Replace the content with persisted opportunities.
    pub fn restore(&mut self, opportunities: Vec<ImprovementOpportunity>) {
        self.entries = opportunities.into_iter().map(|o| (o.id, o)).collect();
    }

    /// Opportunities left mid-lifecycle by a previous process that cannot
    /// be continued: not terminal, not in `resumable` (those with a live
    /// deployment record) and still allowed to move to `discarded`.
    pub fn interrupted(&self, resumable: &HashSet<Uuid>) -> Vec<Uuid> {
        let mut out: Vec<Uuid> = self
            .entries
            .values()
            .filter(|o| !o.status.is_terminal() && !resumable.contains(&o.id))
            .filter(|o| allowed_transitions(o.status).contains(&OpportunityStatus::Discarded))
            .map(|o| o.id)
            .collect();
        out.sort();
        out
    }

    /// Number of opportunities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if the book is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn opp(status: OpportunityStatus) -> ImprovementOpportunity {
        ImprovementOpportunity {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: "d".into(),
            source_insight_ids: vec![],
            impact_score: 30.0,
            confidence: 0.9,
            severity: Severity::Warning,
            affected_components: vec!["api".into()],
            target_metrics: BTreeMap::new(),
            tenant_id: Some(TenantId::new("acme")),
            requires_approval: false,
            status,
            cycle_id: None,
            first_seen: Utc::now(),
            updated_at: Utc::now(),
            reason: None,
        }
    }

    #[test]
    fn test_happy_path_is_allowed() {
        use OpportunityStatus::*;
        let path = [Identified, Selected, Generating, Validating, Deploying, Monitoring, Completed];
        for pair in path.windows(2) {
            assert!(validate_transition(Uuid::nil(), pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        use OpportunityStatus::*;
        assert!(validate_transition(Uuid::nil(), Selected, Deploying).is_err());
        assert!(validate_transition(Uuid::nil(), Generating, Monitoring).is_err());
        assert!(validate_transition(Uuid::nil(), Validating, Completed).is_err());
    }

    #[test]
    fn test_monitoring_can_roll_back() {
        use OpportunityStatus::*;
        assert!(validate_transition(Uuid::nil(), Monitoring, RolledBack).is_ok());
        assert!(validate_transition(Uuid::nil(), Monitoring, Discarded).is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        use OpportunityStatus::*;
        for s in [Completed, RolledBack, RollbackFailed, Failed, Skipped, Discarded] {
            assert!(s.is_terminal(), "{s}");
        }
        assert!(!Monitoring.is_terminal());
    }

    #[test]
    fn test_book_transition_updates_status() {
        let mut book = OpportunityBook::new();
        let o = opp(OpportunityStatus::Identified);
        let id = o.id;
        book.insert(o);
        let from = book
            .transition(&id, OpportunityStatus::Selected, None)
            .expect("test: transition");
        assert_eq!(from, OpportunityStatus::Identified);
        assert_eq!(book.get(&id).map(|o| o.status), Some(OpportunityStatus::Selected));
    }

    #[test]
    fn test_book_rejects_illegal_and_unknown() {
        let mut book = OpportunityBook::new();
        let o = opp(OpportunityStatus::Completed);
        let id = o.id;
        book.insert(o);
        assert!(matches!(
            book.transition(&id, OpportunityStatus::Monitoring, None),
            Err(TransitionError::Illegal { .. })
        ));
        let unknown = Uuid::new_v4();
        assert_eq!(
            book.transition(&unknown, OpportunityStatus::Selected, None),
            Err(TransitionError::NotFound(unknown))
        );
    }

    #[test]
    fn test_visible_in_respects_tenant() {
        let mut book = OpportunityBook::new();
        book.insert(opp(OpportunityStatus::Identified));
        let mut sys = opp(OpportunityStatus::Identified);
        sys.tenant_id = None;
        book.insert(sys);
        assert_eq!(book.visible_in(&Scope::System).len(), 2);
        assert_eq!(book.visible_in(&Scope::Tenant(TenantId::new("acme"))).len(), 1);
        assert_eq!(book.visible_in(&Scope::Tenant(TenantId::new("other"))).len(), 0);
    }

    #[test]
    fn test_interrupted_excludes_resumable_and_terminal() {
        use OpportunityStatus::*;
        let mut book = OpportunityBook::new();
        let mut ids = HashMap::new();
        for s in [PendingApproval, Selected, Generating, Validating, Deploying, Monitoring, Completed, Failed] {
            let o = opp(s);
            ids.insert(s, o.id);
            book.insert(o);
        }
        let mut deploying_elsewhere = opp(Deploying);
        deploying_elsewhere.affected_components = vec!["db".into()];
        let live = deploying_elsewhere.id;
        book.insert(deploying_elsewhere);

        let found: HashSet<Uuid> = book.interrupted(&HashSet::from([live])).into_iter().collect();
        let expected: HashSet<Uuid> = [PendingApproval, Selected, Generating, Validating, Deploying]
            .iter()
            .map(|s| ids[s])
            .collect();
        assert_eq!(found, expected);
    }

    fn any_status() -> impl Strategy<Value = OpportunityStatus> {
        (0..OpportunityStatus::ALL.len()).prop_map(|i| OpportunityStatus::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_validate_matches_allowed_table(from in any_status(), to in any_status()) {
            let ok = validate_transition(Uuid::nil(), from, to).is_ok();
            prop_assert_eq!(ok, allowed_transitions(from).contains(&to));
        }

        #[test]
        fn prop_no_transition_returns_to_identified(from in any_status()) {
            prop_assert!(!allowed_transitions(from).contains(&OpportunityStatus::Identified));
        }
    }
}
