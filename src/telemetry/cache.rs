//! Insight cache with time-to-live.
//!
//! Read-mostly and append-only from the point of view of the cycle: the
//! analyzer and the background ingest task insert, everything else queries.
//! Expired entries are skipped on read and purged lazily.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::insight::{InsightType, TelemetryInsight};
use crate::TenantId;

#[derive(Debug, Clone)]
struct CachedInsight {
    insight: TelemetryInsight,
    expires_at: Instant,
}

/// Filter for [`InsightCache::query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightQuery {
    /// Only insights about this metric.
    pub metric_name: Option<String>,
    /// Only insights created within this many hours.
    pub time_range_hours: u64,
    /// Only insights affecting this tenant.
    pub tenant_id: Option<TenantId>,
}

/// TTL cache of insights keyed by id.
#[derive(Debug)]
pub struct InsightCache {
    ttl: Duration,
    entries: DashMap<Uuid, CachedInsight>,
}

impl InsightCache {
    /// Create a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Insert an insight.
    pub fn insert(&self, insight: TelemetryInsight) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(
            insight.id,
            CachedInsight {
                insight,
                expires_at,
            },
        );
    }

    /// Fetch a live insight by id.
    pub fn get(&self, id: &Uuid) -> Option<TelemetryInsight> {
        let now = Instant::now();
        self.entries
            .get(id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.insight.clone())
    }

    /// Live insights matching `query`, newest first.
    pub fn query(&self, query: &InsightQuery) -> Vec<TelemetryInsight> {
        let now = Instant::now();
        let since = query_since(Utc::now(), query.time_range_hours);
        let mut out: Vec<TelemetryInsight> = self
            .entries
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| e.insight.clone())
            .filter(|i| i.created_at >= since)
            .filter(|i| match &query.metric_name {
                Some(m) => i.metric_name.as_deref() == Some(m.as_str()),
                None => true,
            })
            .filter(|i| match &query.tenant_id {
                Some(t) => i.affected_tenants.contains(t),
                None => true,
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Return `true` if a live error-pattern insight created at or after
    /// `since` names `component`.
    pub fn has_error_insight_for(&self, component: &str, since: DateTime<Utc>) -> bool {
        let now = Instant::now();
        self.entries.iter().any(|e| {
            e.expires_at > now
                && e.insight.insight_type == InsightType::ErrorPattern
                && e.insight.affected_component == component
                && e.insight.created_at >= since
        })
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "insight cache purged");
        }
        removed
    }

    /// Entries currently held, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Start of a query range `hours` back from `now`. Ranges that reach past
/// the representable past saturate at the earliest instant.
fn query_since(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|range| now.checked_sub_signed(range))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
