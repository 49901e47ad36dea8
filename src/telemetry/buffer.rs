//! # Telemetry Buffer
//!
//! ## Responsibility
//! Hold recent telemetry per tenant in a bounded ring so analysis can run on
//! buffered data when the telemetry platform is unreachable.
//!
//! ## Guarantees
//! - Bounded: a tenant ring never exceeds `capacity` events
//! - FIFO eviction: on overflow the oldest event is dropped first
//! - Non-blocking: `ingest` is O(1) amortised and never waits for space
//! - Every accepted event advances the tenant's monotonic offset
//!
//! ## NOT Responsible For
//! - Pulling from the platform (see `ingest`)
//! - Analysis (see `analyzer`)

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::event::TelemetryEvent;
use super::platform::TimeWindow;
use crate::{metrics, Scope, TenantId};

/// Result of a single [`TelemetryBuffer::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored without eviction.
    Stored,
    /// Stored; the oldest event of the tenant ring was evicted.
    StoredWithEviction,
}

/// Per-tenant counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantBufferStats {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Events currently held.
    pub len: usize,
    /// Events evicted since start.
    pub dropped: u64,
    /// Events accepted since start (or since the restored offset).
    pub offset: u64,
}

#[derive(Debug)]
struct TenantRing {
    events: VecDeque<TelemetryEvent>,
    dropped: u64,
    offset: u64,
}

impl TenantRing {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            dropped: 0,
            offset: 0,
        }
    }
}

/// Bounded per-tenant ring buffer.
#[derive(Debug)]
pub struct TelemetryBuffer {
    capacity: usize,
    tenants: DashMap<TenantId, TenantRing>,
}

impl TelemetryBuffer {
    /// Create a buffer holding at most `capacity` events per tenant (at
    /// least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tenants: DashMap::new(),
        }
    }

    /// Configured per-tenant capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `event` to its tenant's ring, evicting the oldest on overflow.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn ingest(&self, event: TelemetryEvent) -> IngestOutcome {
        let capacity = self.capacity;
        let mut ring = self
            .tenants
            .entry(event.tenant_id.clone())
            .or_insert_with(|| TenantRing::new(capacity));

        let mut outcome = IngestOutcome::Stored;
        while ring.events.len() >= capacity {
            ring.events.pop_front();
            ring.dropped += 1;
            outcome = IngestOutcome::StoredWithEviction;
        }
        ring.events.push_back(event);
        ring.offset += 1;
        drop(ring);

        if outcome == IngestOutcome::StoredWithEviction {
            metrics::add_telemetry_dropped(1);
        }
        outcome
    }

    /// Events held for `tenant`, oldest first.
    pub fn snapshot(&self, tenant: &TenantId) -> Vec<TelemetryEvent> {
        self.tenants
            .get(tenant)
            .map(|r| r.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events visible in `scope` whose timestamp falls in `window`.
    pub fn events_in(&self, scope: &Scope, window: &TimeWindow) -> Vec<TelemetryEvent> {
        let mut out = Vec::new();
        for entry in self.tenants.iter() {
            if !scope.contains(entry.key()) {
                continue;
            }
            out.extend(
                entry
                    .value()
                    .events
                    .iter()
                    .filter(|e| window.contains(e.timestamp))
                    .cloned(),
            );
        }
        out
    }

    /// Events held for `tenant`.
    pub fn len(&self, tenant: &TenantId) -> usize {
        self.tenants.get(tenant).map(|r| r.events.len()).unwrap_or(0)
    }

    /// Return `true` if nothing is buffered for any tenant.
    pub fn is_empty(&self) -> bool {
        self.tenants.iter().all(|r| r.events.is_empty())
    }

    /// Events evicted for `tenant`.
    pub fn dropped(&self, tenant: &TenantId) -> u64 {
        self.tenants.get(tenant).map(|r| r.dropped).unwrap_or(0)
    }

    /// Last-ingested offset for `tenant`.
    pub fn offset(&self, tenant: &TenantId) -> u64 {
        self.tenants.get(tenant).map(|r| r.offset).unwrap_or(0)
    }

    /// Last-ingested offset for every tenant.
    pub fn offsets(&self) -> BTreeMap<TenantId, u64> {
        self.tenants
            .iter()
            .map(|e| (e.key().clone(), e.value().offset))
            .collect()
    }

    /// Restore offsets from persisted state. Offsets only move forward.
    pub fn restore_offsets(&self, offsets: &BTreeMap<TenantId, u64>) {
        let capacity = self.capacity;
        for (tenant, offset) in offsets {
            let mut ring = self
                .tenants
                .entry(tenant.clone())
                .or_insert_with(|| TenantRing::new(capacity));
            ring.offset = ring.offset.max(*offset);
        }
        debug!(tenants = offsets.len(), "telemetry offsets restored");
    }

    /// Counters for every tenant, sorted by tenant.
    pub fn stats(&self) -> Vec<TenantBufferStats> {
        let mut out: Vec<TenantBufferStats> = self
            .tenants
            .iter()
            .map(|e| TenantBufferStats {
                tenant_id: e.key().clone(),
                len: e.value().events.len(),
                dropped: e.value().dropped,
                offset: e.value().offset,
            })
            .collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }
}
