//! In-process collaborators for demos and tests.
//!
//! Each type implements one of the external contracts
//! ([`TelemetryPlatform`], [`GenerationService`], [`ComponentDeployer`],
//! [`MetricsSampler`]) entirely in memory, with knobs for injecting outages,
//! delays and failures. Useful for running a full cycle without a real
//! fleet behind it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::deployment::{ComponentDeployer, DeployerError, MetricsSampler, SamplerError, VersionRef};
use crate::generation::{
    GenerationRequest, GenerationResponse, GenerationService, GenerationServiceError, ValidatedChange,
};
use crate::telemetry::event::{COMPONENT_DIMENSION, TENANT_DIMENSION};
use crate::telemetry::{
    EventSource, MetricPoint, Payload, PlatformError, TelemetryEvent, TelemetryPlatform, TimeWindow,
};

// ============================================================================
// Telemetry platform
// ============================================================================

/// Telemetry platform backed by a vector of events.
///
/// `push` stores an event for later `fetch_*` calls; `emit` publishes one to
/// live subscribers.
pub struct SimulatedTelemetryPlatform {
    events: Mutex<Vec<TelemetryEvent>>,
    available: AtomicBool,
    live: broadcast::Sender<TelemetryEvent>,
}

impl SimulatedTelemetryPlatform {
    /// Empty, reachable platform.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            events: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            live,
        }
    }

    /// Make every call fail with [`PlatformError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store an event for retrieval.
    pub fn push(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }

    /// Publish an event to live subscribers. Returns how many received it.
    pub fn emit(&self, event: TelemetryEvent) -> usize {
        self.live.send(event).unwrap_or(0)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.live.receiver_count()
    }

    fn check(&self) -> Result<(), PlatformError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PlatformError::Unavailable("simulated outage".into()))
        }
    }
}

impl Default for SimulatedTelemetryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn log_matches(event: &TelemetryEvent, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern = pattern.to_lowercase();
    match &event.payload {
        Payload::Log { level, message } => {
            format!("{level:?}").to_lowercase().contains(&pattern) || message.to_lowercase().contains(&pattern)
        }
        _ => event.name.to_lowercase().contains(&pattern),
    }
}

#[async_trait]
impl TelemetryPlatform for SimulatedTelemetryPlatform {
    async fn fetch_metrics(
        &self,
        _namespace: &str,
        names: &[String],
        window: &TimeWindow,
    ) -> Result<Vec<MetricPoint>, PlatformError> {
        self.check()?;
        let points = self
            .events
            .lock()
            .iter()
            .filter(|e| e.source == EventSource::Metric && window.contains(e.timestamp))
            .filter(|e| names.is_empty() || names.contains(&e.name))
            .filter_map(|e| {
                let value = e.value()?;
                let mut dimensions = e.dimensions.clone();
                dimensions.insert(TENANT_DIMENSION.to_string(), e.tenant_id.to_string());
                Some(MetricPoint {
                    name: e.name.clone(),
                    timestamp: e.timestamp,
                    value,
                    dimensions,
                })
            })
            .collect();
        Ok(points)
    }

    async fn fetch_logs(&self, pattern: &str, window: &TimeWindow) -> Result<Vec<TelemetryEvent>, PlatformError> {
        self.check()?;
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.is_log() && window.contains(e.timestamp) && log_matches(e, pattern))
            .cloned()
            .collect())
    }

    async fn subscribe_events(&self, pattern: &str) -> Result<BoxStream<'static, TelemetryEvent>, PlatformError> {
        self.check()?;
        let rx = self.live.subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |e| futures::future::ready(log_matches(e, &pattern)));
        Ok(stream.boxed())
    }
}

// ============================================================================
// Generation service
// ============================================================================

/// Generation service that replays queued responses.
///
/// When the queue is empty it answers with a small well-formed Rust file.
pub struct ScriptedGenerationService {
    queue: Mutex<VecDeque<Result<GenerationResponse, GenerationServiceError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Duration,
}

impl ScriptedGenerationService {
    /// Service with no delay and an empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Sleep `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the next answer.
    pub fn push(&self, response: Result<GenerationResponse, GenerationServiceError>) {
        self.queue.lock().push_back(response);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    fn default_response(request: &GenerationRequest) -> GenerationResponse {
        let component = request
            .components
            .first()
            .map(|c| c.replace(|ch: char| !ch.is_ascii_alphanumeric(), "_"))
            .unwrap_or_else(|| "component".to_string());
        let body = format!(
            "/// Tuned settings for {component}.\npub fn {component}_pool_size() -> usize {{\n    32\n}}\n"
        );
        GenerationResponse {
            files: BTreeMap::from([(format!("src/{component}_tuning.rs"), body)]),
            model_used: "scripted".to_string(),
            token_count: 42,
        }
    }
}

impl Default for ScriptedGenerationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerationService {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationServiceError> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.queue.lock().pop_front();
        next.unwrap_or_else(|| Ok(Self::default_response(request)))
    }
}

// ============================================================================
// Deployer
// ============================================================================

#[derive(Debug, Default)]
struct DeployerState {
    active: HashMap<String, VersionRef>,
    fail_activation: HashSet<String>,
    fail_reactivation: HashSet<String>,
}

/// Deployer that tracks the active version of each component in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeployer {
    state: Mutex<DeployerState>,
    activations: AtomicU64,
    reactivations: AtomicU64,
}

impl InMemoryDeployer {
    /// Deployer with no components.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the serving version of `component`.
    pub fn set_version(&self, component: &str, version: &str) {
        self.state
            .lock()
            .active
            .insert(component.to_string(), VersionRef(version.to_string()));
    }

    /// Serving version of `component`.
    pub fn active_version(&self, component: &str) -> Option<VersionRef> {
        self.state.lock().active.get(component).cloned()
    }

    /// Make every activation of `component` fail.
    pub fn fail_activation(&self, component: &str) {
        self.state.lock().fail_activation.insert(component.to_string());
    }

    /// Make every reactivation of `component` fail.
    pub fn fail_reactivation(&self, component: &str) {
        self.state.lock().fail_reactivation.insert(component.to_string());
    }

    /// Successful activations so far.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    /// Successful reactivations so far.
    pub fn reactivations(&self) -> u64 {
        self.reactivations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComponentDeployer for InMemoryDeployer {
    async fn current_version(&self, component: &str) -> Result<VersionRef, DeployerError> {
        Ok(self
            .state
            .lock()
            .active
            .entry(component.to_string())
            .or_insert_with(|| VersionRef("initial".to_string()))
            .clone())
    }

    async fn activate(&self, component: &str, change: &ValidatedChange) -> Result<VersionRef, DeployerError> {
        let mut state = self.state.lock();
        if state.fail_activation.contains(component) {
            return Err(DeployerError::Unavailable(format!("{component} refused activation")));
        }
        let version = VersionRef(format!("change-{}", change.id()));
        state.active.insert(component.to_string(), version.clone());
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn reactivate(&self, component: &str, version: &VersionRef) -> Result<(), DeployerError> {
        let mut state = self.state.lock();
        if state.fail_reactivation.contains(component) {
            return Err(DeployerError::Unavailable(format!("{component} refused reactivation")));
        }
        state.active.insert(component.to_string(), version.clone());
        self.reactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Metrics sampler replaying a queue of samples.
///
/// Once the queue is drained the last successful sample repeats.
#[derive(Debug, Default)]
pub struct ScriptedSampler {
    queue: Mutex<VecDeque<Result<BTreeMap<String, f64>, SamplerError>>>,
    last: Mutex<BTreeMap<String, f64>>,
    calls: AtomicU64,
}

impl ScriptedSampler {
    /// Sampler with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful sample, keyed `component/metric`.
    pub fn push_metrics(&self, metrics: BTreeMap<String, f64>) {
        self.queue.lock().push_back(Ok(metrics));
    }

    /// Queue a failed sample.
    pub fn push_failure(&self, message: &str) {
        self.queue
            .lock()
            .push_back(Err(SamplerError::Unavailable(message.to_string())));
    }

    /// Samples requested so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSampler for ScriptedSampler {
    async fn sample(&self, components: &[String], _window: Duration) -> Result<BTreeMap<String, f64>, SamplerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().pop_front();
        let metrics = match next {
            Some(Ok(m)) => {
                *self.last.lock() = m.clone();
                m
            }
            Some(Err(e)) => return Err(e),
            None => self.last.lock().clone(),
        };
        Ok(metrics
            .into_iter()
            .filter(|(k, _)| {
                k.split_once('/')
                    .map_or(true, |(c, _)| components.iter().any(|x| x == c))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogLevel;
    use crate::TenantId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_outage_fails_every_fetch() {
        let p = SimulatedTelemetryPlatform::new();
        p.set_available(false);
        let w = TimeWindow::ending_now(Duration::from_secs(60));
        assert!(p.fetch_metrics("fleet", &[], &w).await.is_err());
        assert!(p.fetch_logs("error", &w).await.is_err());
    }

    #[tokio::test]
    async fn test_metric_points_carry_tenant_dimension() {
        let p = SimulatedTelemetryPlatform::new();
        p.push(TelemetryEvent::metric(TenantId::new("acme"), "api", "latency_ms", 9.0, Utc::now()));
        p.push(TelemetryEvent::log(TenantId::new("acme"), "api", LogLevel::Error, "boom", Utc::now()));
        let w = TimeWindow::ending_now(Duration::from_secs(60));
        let points = p.fetch_metrics("fleet", &[], &w).await.expect("test: metrics");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].dimensions.get(TENANT_DIMENSION).map(String::as_str), Some("acme"));
        assert_eq!(points[0].dimensions.get(COMPONENT_DIMENSION).map(String::as_str), Some("api"));
        let logs = p.fetch_logs("ERROR", &w).await.expect("test: logs");
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_sampler_repeats_last_success_and_filters_components() {
        let s = ScriptedSampler::new();
        s.push_metrics(BTreeMap::from([
            ("api/latency_ms".to_string(), 100.0),
            ("db/latency_ms".to_string(), 5.0),
        ]));
        s.push_failure("down");
        let api = vec!["api".to_string()];
        assert_eq!(s.sample(&api, Duration::ZERO).await.expect("test: first").len(), 1);
        assert!(s.sample(&api, Duration::ZERO).await.is_err());
        let again = s.sample(&api, Duration::ZERO).await.expect("test: repeat");
        assert_eq!(again.get("api/latency_ms"), Some(&100.0));
        assert_eq!(s.calls(), 3);
    }
}
