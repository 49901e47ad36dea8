//! # Component Locks
//!
//! ## Responsibility
//! Enforce that at most one opportunity changes a given component at a time,
//! and keep components whose rollback failed out of automated changes until
//! an operator clears them.
//!
//! ## Guarantees
//! - Non-blocking: acquisition either succeeds immediately or reports the
//!   conflicting holder; it never waits.
//! - All-or-nothing: a multi-component acquisition that conflicts on any
//!   component releases everything it took.
//! - Components are acquired in sorted order.
//! - A [`ComponentLease`] releases its components when dropped.
//!
//! ## NOT Responsible For
//! - Deciding which opportunity should win (the orchestrator ranks them)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why a component could not be locked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockConflict {
    /// Another opportunity holds the component.
    #[error("component '{component}' is locked by opportunity {holder}")]
    Held {
        /// The contested component.
        component: String,
        /// The opportunity holding it.
        holder: Uuid,
    },
    /// The component was marked unavailable after a failed rollback.
    #[error("component '{component}' is unavailable: {reason}")]
    Unavailable {
        /// The unavailable component.
        component: String,
        /// Why it was marked.
        reason: String,
    },
}

/// A component excluded from automated changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableComponent {
    /// Component name.
    pub component: String,
    /// Why it was marked.
    pub reason: String,
    /// When it was marked.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LocksInner {
    holders: DashMap<String, Uuid>,
    unavailable: DashMap<String, UnavailableComponent>,
}

/// In-memory lock table keyed by component name. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ComponentLocks {
    inner: Arc<LocksInner>,
}

/// Proof of exclusive access to a set of components.
#[derive(Debug)]
pub struct ComponentLease {
    locks: ComponentLocks,
    components: Vec<String>,
    holder: Uuid,
}

impl ComponentLease {
    /// Components covered by this lease, sorted.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The opportunity holding the lease.
    pub fn holder(&self) -> Uuid {
        self.holder
    }
}

impl Drop for ComponentLease {
    fn drop(&mut self) {
        for c in &self.components {
            self.locks.release_one(c, self.holder);
        }
        debug!(holder = %self.holder, components = ?self.components, "component lease released");
    }
}

impl ComponentLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock every component for `holder`.
    ///
    /// # Errors
    /// Returns the first [`LockConflict`] encountered; nothing stays locked.
    ///
    /// # Panics
    /// This function never panics.
    pub fn try_acquire_all(
        &self,
        components: &[String],
        holder: Uuid,
    ) -> Result<ComponentLease, LockConflict> {
        let mut wanted: Vec<String> = components.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut taken: Vec<String> = Vec::with_capacity(wanted.len());
        for c in &wanted {
            if let Some(mark) = self.inner.unavailable.get(c) {
                let conflict = LockConflict::Unavailable {
                    component: c.clone(),
                    reason: mark.reason.clone(),
                };
                drop(mark);
                self.undo(&taken, holder);
                return Err(conflict);
            }
            match self.inner.holders.entry(c.clone()) {
                Entry::Occupied(e) if *e.get() != holder => {
                    let conflict = LockConflict::Held {
                        component: c.clone(),
                        holder: *e.get(),
                    };
                    drop(e);
                    self.undo(&taken, holder);
                    return Err(conflict);
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(v) => {
                    v.insert(holder);
                    taken.push(c.clone());
                }
            }
        }

        debug!(holder = %holder, components = ?wanted, "component lease acquired");
        Ok(ComponentLease {
            locks: self.clone(),
            components: wanted,
            holder,
        })
    }

    fn undo(&self, taken: &[String], holder: Uuid) {
        for c in taken {
            self.release_one(c, holder);
        }
    }

    fn release_one(&self, component: &str, holder: Uuid) {
        self.inner.holders.remove_if(component, |_, h| *h == holder);
    }

    /// The opportunity currently holding `component`, if any.
    pub fn holder_of(&self, component: &str) -> Option<Uuid> {
        self.inner.holders.get(component).map(|h| *h)
    }

    /// Snapshot of every held component and its holder.
    pub fn held(&self) -> Vec<(String, Uuid)> {
        let mut out: Vec<(String, Uuid)> = self
            .inner
            .holders
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }

    /// Exclude `component` from automated changes until cleared.
    pub fn mark_unavailable(&self, component: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(component, reason = %reason, "component marked unavailable");
        self.inner.unavailable.insert(
            component.to_string(),
            UnavailableComponent {
                component: component.to_string(),
                reason,
                since: Utc::now(),
            },
        );
    }

    /// Re-enable automated changes for `component`. Returns `true` if it was
    /// marked.
    pub fn clear_unavailable(&self, component: &str) -> bool {
        self.inner.unavailable.remove(component).is_some()
    }

    /// Return `true` unless `component` is marked unavailable.
    pub fn is_available(&self, component: &str) -> bool {
        !self.inner.unavailable.contains_key(component)
    }

    /// Every unavailable component, sorted by name.
    pub fn unavailable(&self) -> Vec<UnavailableComponent> {
        let mut out: Vec<UnavailableComponent> = self
            .inner
            .unavailable
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.component.cmp(&b.component));
        out
    }

    /// Re-import unavailable marks from persisted state.
    pub fn restore_unavailable(&self, marks: &[UnavailableComponent]) {
        for m in marks {
            self.inner.unavailable.insert(m.component.clone(), m.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_and_release_on_drop() {
        let locks = ComponentLocks::new();
        let id = Uuid::new_v4();
        let lease = locks
            .try_acquire_all(&comps(&["api", "db"]), id)
            .expect("test: acquire");
        assert_eq!(locks.holder_of("api"), Some(id));
        assert_eq!(lease.components(), &["api".to_string(), "db".to_string()]);
        drop(lease);
        assert_eq!(locks.holder_of("api"), None);
        assert!(locks.held().is_empty());
    }

    #[test]
    fn test_conflict_reports_holder() {
        let locks = ComponentLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _lease = locks.try_acquire_all(&comps(&["api"]), a).expect("test: a");
        let err = locks.try_acquire_all(&comps(&["api"]), b).unwrap_err();
        assert_eq!(
            err,
            LockConflict::Held {
                component: "api".into(),
                holder: a
            }
        );
    }

    #[test]
    fn test_partial_acquisition_is_undone() {
        let locks = ComponentLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _lease = locks.try_acquire_all(&comps(&["cache"]), a).expect("test: a");
        // "api" sorts before "cache", so it is taken first and must be released.
        assert!(locks.try_acquire_all(&comps(&["cache", "api"]), b).is_err());
        assert_eq!(locks.holder_of("api"), None);
        assert_eq!(locks.holder_of("cache"), Some(a));
    }

    #[test]
    fn test_duplicate_components_are_deduplicated() {
        let locks = ComponentLocks::new();
        let lease = locks
            .try_acquire_all(&comps(&["api", "api"]), Uuid::new_v4())
            .expect("test: acquire");
        assert_eq!(lease.components().len(), 1);
    }

    #[test]
    fn test_unavailable_component_is_refused() {
        let locks = ComponentLocks::new();
        locks.mark_unavailable("db", "rollback failed");
        let err = locks
            .try_acquire_all(&comps(&["db"]), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, LockConflict::Unavailable { .. }));
        assert!(!locks.is_available("db"));

        assert!(locks.clear_unavailable("db"));
        assert!(locks
            .try_acquire_all(&comps(&["db"]), Uuid::new_v4())
            .is_ok());
    }

    #[test]
    fn test_stale_lease_does_not_release_new_holder() {
        let locks = ComponentLocks::new();
        let a = Uuid::new_v4();
        let lease = locks.try_acquire_all(&comps(&["api"]), a).expect("test: a");
        drop(lease);
        let b = Uuid::new_v4();
        let _lease_b = locks.try_acquire_all(&comps(&["api"]), b).expect("test: b");
        locks.release_one("api", a);
        assert_eq!(locks.holder_of("api"), Some(b));
    }

    #[test]
    fn test_restore_unavailable_marks() {
        let locks = ComponentLocks::new();
        locks.mark_unavailable("db", "rollback failed");
        let saved = locks.unavailable();

        let fresh = ComponentLocks::new();
        fresh.restore_unavailable(&saved);
        assert!(!fresh.is_available("db"));
    }
}
