//! Typed telemetry events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TenantId;

/// Dimension key naming the component an event belongs to.
pub const COMPONENT_DIMENSION: &str = "component";

/// Dimension key naming the tenant on points returned by the platform.
pub const TENANT_DIMENSION: &str = "tenant";

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// A numeric metric sample.
    Metric,
    /// A log line.
    Log,
    /// A structured application event.
    Event,
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Metric value.
    Value {
        /// The sampled value.
        value: f64,
    },
    /// Log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// Raw message.
        message: String,
    },
    /// Arbitrary structured payload.
    Json {
        /// The payload.
        body: serde_json::Value,
    },
}

/// One immutable telemetry observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Kind of observation.
    pub source: EventSource,
    /// Metric name, logger name or event type.
    pub name: String,
    /// Value or message.
    pub payload: Payload,
    /// When the observation was made.
    pub timestamp: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Free-form dimensions; `component` identifies the emitting component.
    pub dimensions: BTreeMap<String, String>,
}

impl TelemetryEvent {
    /// A metric sample for `component`.
    pub fn metric(
        tenant: TenantId,
        component: &str,
        name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: EventSource::Metric,
            name: name.into(),
            payload: Payload::Value { value },
            timestamp,
            tenant_id: tenant,
            dimensions: BTreeMap::from([(COMPONENT_DIMENSION.to_string(), component.to_string())]),
        }
    }

    /// A log line from `component`.
    pub fn log(
        tenant: TenantId,
        component: &str,
        level: LogLevel,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: EventSource::Log,
            name: "log".to_string(),
            payload: Payload::Log {
                level,
                message: message.into(),
            },
            timestamp,
            tenant_id: tenant,
            dimensions: BTreeMap::from([(COMPONENT_DIMENSION.to_string(), component.to_string())]),
        }
    }

    /// Add a dimension.
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// The emitting component, if the event names one.
    pub fn component(&self) -> Option<&str> {
        self.dimensions.get(COMPONENT_DIMENSION).map(String::as_str)
    }

    /// The numeric value of a metric event.
    pub fn value(&self) -> Option<f64> {
        match (&self.source, &self.payload) {
            (EventSource::Metric, Payload::Value { value }) => Some(*value),
            _ => None,
        }
    }

    /// The message of an error-level log event.
    pub fn error_message(&self) -> Option<&str> {
        match &self.payload {
            Payload::Log {
                level: LogLevel::Error,
                message,
            } => Some(message),
            _ => None,
        }
    }

    /// Return `true` for log events of any level.
    pub fn is_log(&self) -> bool {
        matches!(self.payload, Payload::Log { .. })
    }

    /// Identity used to drop duplicates when merging pulled and buffered
    /// events.
    pub(crate) fn dedup_key(&self) -> String {
        let payload = match &self.payload {
            Payload::Value { value } => value.to_bits().to_string(),
            Payload::Log { level, message } => format!("{level:?}:{message}"),
            Payload::Json { body } => body.to_string(),
        };
        format!(
            "{}|{:?}|{}|{}|{}|{:?}",
            self.tenant_id,
            self.source,
            self.name,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            payload,
            self.dimensions
        )
    }
}
