//! # Telemetry
//!
//! ## Responsibility
//! Ingest raw observations, hold them in bounded per-tenant buffers, derive
//! insights from them and cache those insights for queries and monitoring.
//!
//! ## NOT Responsible For
//! - Talking to a concrete backend: the platform is a trait
//! - Ranking insights (see `prioritizer`)

pub mod analyzer;
pub mod buffer;
pub mod cache;
pub mod event;
pub mod ingest;
pub mod insight;
pub mod platform;

pub use analyzer::{AnalysisReport, PollOutcome, TelemetryAnalyzer};
pub use buffer::{IngestOutcome, TelemetryBuffer, TenantBufferStats};
pub use cache::{InsightCache, InsightQuery};
pub use event::{EventSource, LogLevel, Payload, TelemetryEvent};
pub use ingest::{spawn_event_subscription, spawn_ingest};
pub use insight::{InsightType, Severity, TelemetryInsight};
pub use platform::{MetricPoint, PlatformError, TelemetryPlatform, TimeWindow};
