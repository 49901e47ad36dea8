//! Telemetry platform contract.
//!
//! The core never talks to a concrete metrics or log backend; it consumes
//! this trait, always through a circuit breaker, with bounded timeouts and
//! idempotent reads.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::{EventSource, Payload, TelemetryEvent, TENANT_DIMENSION};
use crate::TenantId;

/// Errors reported by a telemetry platform.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// The platform could not be reached.
    #[error("telemetry platform unavailable: {0}")]
    Unavailable(String),
    /// The platform rejected the query.
    #[error("invalid telemetry query: {0}")]
    InvalidQuery(String),
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window of length `length` ending now. The end is nudged forward by one
    /// millisecond so events stamped "now" are included.
    pub fn ending_now(length: Duration) -> Self {
        let end = Utc::now() + chrono::Duration::milliseconds(1);
        Self::ending_at(end, length)
    }

    /// Window of length `length` ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, length: Duration) -> Self {
        let length = chrono::Duration::from_std(length).unwrap_or_else(|_| chrono::Duration::days(3650));
        Self {
            start: end - length,
            end,
        }
    }

    /// Return `true` if `ts` falls inside the window.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Window length.
    pub fn length(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A metric sample as returned by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Metric name.
    pub name: String,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Sample value.
    pub value: f64,
    /// Dimensions; `tenant` and `component` are expected.
    pub dimensions: BTreeMap<String, String>,
}

impl MetricPoint {
    /// Convert to a [`TelemetryEvent`]. The `tenant` dimension moves into
    /// `tenant_id`; points without one cannot be attributed and yield `None`.
    pub fn into_event(mut self) -> Option<TelemetryEvent> {
        let tenant = self.dimensions.remove(TENANT_DIMENSION)?;
        Some(TelemetryEvent {
            source: EventSource::Metric,
            name: self.name,
            payload: Payload::Value { value: self.value },
            timestamp: self.timestamp,
            tenant_id: TenantId::new(tenant),
            dimensions: self.dimensions,
        })
    }
}

/// External telemetry source.
#[async_trait]
pub trait TelemetryPlatform: Send + Sync {
    /// Metric samples for `names` (every metric when empty) in `namespace`.
    async fn fetch_metrics(
        &self,
        namespace: &str,
        names: &[String],
        window: &TimeWindow,
    ) -> Result<Vec<MetricPoint>, PlatformError>;

    /// Log events whose message matches `pattern`.
    async fn fetch_logs(
        &self,
        pattern: &str,
        window: &TimeWindow,
    ) -> Result<Vec<TelemetryEvent>, PlatformError>;

    /// Live stream of events matching `pattern`.
    async fn subscribe_events(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, TelemetryEvent>, PlatformError>;
}
