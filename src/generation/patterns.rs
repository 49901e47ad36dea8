//! Prior change patterns per component.
//!
//! Outcomes of earlier changes are summarised here and handed to the
//! generation service as "prior patterns" so it can repeat what worked and
//! avoid what was rolled back. Bounded per component; oldest entries go first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How an earlier change ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOutcome {
    /// Survived the monitoring window.
    Completed,
    /// Reverted after a regression.
    RolledBack,
    /// Rejected by static validation.
    Rejected,
}

/// Summary of one earlier change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorPattern {
    /// What the change tried to do.
    pub summary: String,
    /// How it ended.
    pub outcome: PatternOutcome,
    /// Files it touched.
    pub files: Vec<String>,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Bounded per-component pattern store.
#[derive(Debug)]
pub struct PatternMemory {
    max_per_component: usize,
    entries: DashMap<String, VecDeque<PriorPattern>>,
}

impl PatternMemory {
    /// Keep at most `max_per_component` patterns per component (at least one).
    pub fn new(max_per_component: usize) -> Self {
        Self {
            max_per_component: max_per_component.max(1),
            entries: DashMap::new(),
        }
    }

    /// Record an outcome for `component`.
    pub fn record(&self, component: &str, pattern: PriorPattern) {
        let mut q = self.entries.entry(component.to_string()).or_default();
        while q.len() >= self.max_per_component {
            q.pop_front();
        }
        q.push_back(pattern);
    }

    /// Patterns for `component`, newest first.
    pub fn for_component(&self, component: &str) -> Vec<PriorPattern> {
        self.entries
            .get(component)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Patterns for every component in `components`, newest first.
    pub fn for_components(&self, components: &[String]) -> Vec<PriorPattern> {
        let mut out: Vec<PriorPattern> = components
            .iter()
            .flat_map(|c| self.for_component(c))
            .collect();
        out.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(summary: &str, outcome: PatternOutcome) -> PriorPattern {
        PriorPattern {
            summary: summary.into(),
            outcome,
            files: vec!["src/lib.rs".into()],
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_newest_first() {
        let m = PatternMemory::new(4);
        m.record("api", p("first", PatternOutcome::Completed));
        m.record("api", p("second", PatternOutcome::RolledBack));
        let got = m.for_component("api");
        assert_eq!(got[0].summary, "second");
        assert_eq!(got[1].summary, "first");
    }

    #[test]
    fn test_bounded_per_component() {
        let m = PatternMemory::new(2);
        for s in ["a", "b", "c"] {
            m.record("api", p(s, PatternOutcome::Completed));
        }
        m.record("db", p("x", PatternOutcome::Rejected));
        let api: Vec<String> = m.for_component("api").into_iter().map(|p| p.summary).collect();
        assert_eq!(api, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(m.for_component("db").len(), 1);
        assert!(m.for_component("none").is_empty());
    }
}
