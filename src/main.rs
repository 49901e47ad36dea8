//! Demo binary for fleet-autoimprove
//!
//! Seeds a latency regression into simulated telemetry, runs one improvement
//! cycle against in-memory collaborators and prints the cycle summary as
//! JSON.
//!
//! ## Environment Variables
//!
//! - `AUTOIMPROVE_CONFIG` - path to a TOML configuration (defaults otherwise,
//!   with a shortened monitoring window)
//! - `LOG_FORMAT=json` - structured JSON output (production)
//! - `RUST_LOG=info` - log level filter

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use fleet_autoimprove::config::loader::load_from_file;
use fleet_autoimprove::generation::CodebaseGraph;
use fleet_autoimprove::simulation::{
    InMemoryDeployer, ScriptedGenerationService, ScriptedSampler, SimulatedTelemetryPlatform,
};
use fleet_autoimprove::telemetry::TelemetryEvent;
use fleet_autoimprove::{
    init_tracing, metrics, CycleOrchestrator, CycleRequest, OrchestratorConfig, OrchestratorDeps, TenantId,
};
use tracing::info;

const TENANT: &str = "acme";
const COMPONENT: &str = "checkout";

fn demo_config() -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("AUTOIMPROVE_CONFIG") {
        info!(path = %path, "loading configuration");
        return Ok(load_from_file(Path::new(&path))?);
    }
    let mut config = OrchestratorConfig::default();
    config.deployment.baseline_window_secs = 1;
    config.deployment.sampling_interval_secs = 1;
    config.deployment.monitoring_duration_secs = 3;
    Ok(config)
}

/// An hour of `latency_ms` for one component: flat around 100 ms, then
/// about 160 ms for the last quarter hour.
fn seed(orchestrator: &CycleOrchestrator) {
    let now = Utc::now();
    for minute in (1..=59i64).rev() {
        let value = if minute <= 14 { 160.0 } else { 100.0 } + (minute % 5) as f64;
        let at = now - ChronoDuration::minutes(minute);
        orchestrator.ingest(TelemetryEvent::metric(TenantId::new(TENANT), COMPONENT, "latency_ms", value, at));
        orchestrator.ingest(TelemetryEvent::metric(TenantId::new(TENANT), COMPONENT, "request_count", 1200.0, at));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = demo_config()?;

    let deployer = Arc::new(InMemoryDeployer::new());
    deployer.set_version(COMPONENT, "v41");
    let sampler = Arc::new(ScriptedSampler::new());
    let key = format!("{COMPONENT}/latency_ms");
    sampler.push_metrics(BTreeMap::from([(key.clone(), 162.0)]));
    sampler.push_metrics(BTreeMap::from([(key, 118.0)]));

    let orchestrator = CycleOrchestrator::new(OrchestratorDeps {
        config,
        platform: Arc::new(SimulatedTelemetryPlatform::new()),
        generator: Arc::new(ScriptedGenerationService::new()),
        deployer: Arc::clone(&deployer) as _,
        sampler,
        codebase: CodebaseGraph::new(),
    })?;

    seed(&orchestrator);
    info!("simulated telemetry seeded");

    let cycle_id = orchestrator.trigger_cycle(CycleRequest::for_tenant(TENANT)).await?;
    let summary = orchestrator.wait_for_cycle(cycle_id).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        active_version = ?deployer.active_version(COMPONENT),
        audit_entries = orchestrator.audit().len(),
        "demo finished"
    );
    Ok(())
}
