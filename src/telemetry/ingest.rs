//! Background telemetry ingestion.
//!
//! Two long-lived tasks feed the buffer: a periodic pull from the platform
//! (which also scans each pulled window for error patterns) and an optional
//! live subscription. Both stop when the shutdown watch flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::analyzer::TelemetryAnalyzer;

/// Spawn the periodic pull loop.
///
/// Each tick pulls the window since the previous successful poll, ingests it
/// and purges expired insights. Missed ticks are skipped rather than
/// bunched. Platform failures are logged and retried on the next tick.
///
/// # Panics
/// This function never panics.
pub fn spawn_ingest(
    analyzer: Arc<TelemetryAnalyzer>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "telemetry ingest started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let outcome = analyzer.poll_platform(interval).await;
            if outcome.partial {
                warn!(ingested = outcome.ingested, "telemetry poll incomplete, will retry next tick");
            }
            let purged = analyzer.cache().purge_expired();
            debug!(
                ingested = outcome.ingested,
                evicted = outcome.evicted,
                error_insights = outcome.error_insights,
                purged,
                "ingest tick"
            );
        }
        info!("telemetry ingest stopped");
    })
}

/// Spawn a task that buffers every event from the platform's live stream
/// matching `pattern`.
///
/// A failed subscription is logged and the task exits; the periodic pull
/// still covers the same data.
///
/// # Panics
/// This function never panics.
pub fn spawn_event_subscription(
    analyzer: Arc<TelemetryAnalyzer>,
    pattern: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = match analyzer.platform().subscribe_events(&pattern).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, pattern = %pattern, "event subscription failed");
                return;
            }
        };
        info!(pattern = %pattern, "event subscription started");

        let mut received: u64 = 0;
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(event) => {
                        analyzer.ingest(event);
                        received += 1;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(pattern = %pattern, received, "event subscription stopped");
    })
}
