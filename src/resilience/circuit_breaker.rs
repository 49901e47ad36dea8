//! # Circuit Breaker
//!
//! ## Responsibility
//! Protect every call to an unreliable external collaborator (telemetry
//! platform, generation service). Stop calling it for a cooldown period once
//! it keeps failing, then let a single trial call test for recovery.
//!
//! ## States
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls fail fast without invoking the operation.
//! - **Half-Open**: exactly one trial call is admitted at a time.
//!
//! ## Guarantees
//! - Closed → Open when `consecutive_failures >= failure_threshold`.
//! - Open → Half-Open only once `recovery_timeout` has elapsed since `opened_at`.
//! - A failed trial re-opens the breaker and multiplies `recovery_timeout`
//!   by the backoff multiplier, capped at `max_recovery_multiplier × base`.
//! - A successful trial closes the breaker and restores the base timeout.
//! - Every protected call carries a timeout; a timeout counts as a failure.
//! - State is mutated only by the breaker; every transition is broadcast as a
//!   [`CircuitTransition`], logged and counted.
//!
//! ## NOT Responsible For
//! - Retrying failed calls (callers decide)
//! - Persisting state (see [`CircuitBreaker::state`] / [`CircuitBreaker::restore`])
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_autoimprove::config::BreakerConfig;
//! use fleet_autoimprove::resilience::{CircuitBreaker, CircuitBreakerError};
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("telemetry", BreakerConfig::default());
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(v) => println!("{v}"),
//!     Err(CircuitBreakerError::Open { retry_in, .. }) => println!("retry in {retry_in:?}"),
//!     Err(e) => eprintln!("{e}"),
//! }
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::metrics;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

// ─── Public types ───────────────────────────────────────────────────────────

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without invoking the operation.
    Open,
    /// One trial call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// Errors returned by a protected call.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without invoking the operation.
    #[error("circuit '{name}' is open; retry in {retry_in:?}")]
    Open {
        /// Breaker name.
        name: String,
        /// Remaining time before a trial call may be admitted.
        retry_in: Duration,
    },
    /// The operation did not complete within the call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The operation returned an error.
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> CircuitBreakerError<E> {
    /// Return `true` if the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }
}

/// A state change, broadcast to every [`CircuitBreaker::subscribe`]r.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    /// Breaker name.
    pub breaker: String,
    /// State before the change.
    pub from: CircuitStatus,
    /// State after the change.
    pub to: CircuitStatus,
    /// Consecutive failures at the time of the change.
    pub consecutive_failures: u32,
    /// Recovery timeout in force after the change.
    pub recovery_timeout_ms: u64,
    /// Wall-clock time of the change.
    pub at: DateTime<Utc>,
}

/// Exportable breaker state, used to survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Breaker name.
    pub name: String,
    /// Current status.
    pub status: CircuitStatus,
    /// Consecutive failures counted so far.
    pub consecutive_failures: u32,
    /// Wall-clock time the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Current recovery timeout, including backoff growth.
    pub recovery_timeout_ms: u64,
}

/// Counters describing breaker activity since creation.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub status: CircuitStatus,
    /// Consecutive failures counted so far.
    pub consecutive_failures: u32,
    /// Calls admitted to the operation.
    pub total_calls: u64,
    /// Admitted calls that counted as failures.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub rejected: u64,
    /// Current recovery timeout.
    pub recovery_timeout: Duration,
    /// Time spent in the current state.
    pub time_in_current_state: Duration,
}

// ─── Internals ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BreakerInner {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    recovery_timeout: Duration,
    trial_in_flight: bool,
    last_state_change: Instant,
    total_calls: u64,
    total_failures: u64,
    rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// An error the classifier does not count.
    Neutral,
}

/// Releases the half-open trial slot if the protected future is dropped
/// before it completes.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    finished: bool,
}

impl<'a> CallGuard<'a> {
    fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.breaker.record(self.admission, outcome);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished && self.admission == Admission::Trial {
            let mut inner = self.breaker.inner.lock();
            inner.trial_in_flight = false;
            debug!(breaker = %self.breaker.name, "circuit breaker: trial call dropped");
        }
    }
}

// ─── CircuitBreaker ─────────────────────────────────────────────────────────

/// Circuit breaker guarding one external collaborator.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    events: broadcast::Sender<CircuitTransition>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// # Arguments
    /// * `name` - Identifies the protected collaborator in logs and metrics
    /// * `config` - Thresholds, recovery timing and call timeout
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name: String = name.into();
        let (events, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let inner = BreakerInner {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_wall: None,
            recovery_timeout: config.recovery_timeout(),
            trial_in_flight: false,
            last_state_change: Instant::now(),
            total_calls: 0,
            total_failures: 0,
            rejected: 0,
        };
        Self {
            name: Arc::from(name),
            config,
            inner: Arc::new(Mutex::new(inner)),
            events,
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    /// Execute `op` through the breaker using the configured call timeout.
    ///
    /// Every `Err` counts as a failure.
    ///
    /// # Errors
    /// - [`CircuitBreakerError::Open`] if the breaker rejected the call.
    /// - [`CircuitBreakerError::Timeout`] if `op` exceeded the call timeout.
    /// - [`CircuitBreakerError::Failed`] if `op` returned an error.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(self.config.call_timeout(), op, |_| true).await
    }

    /// Execute `op` with an explicit timeout instead of the configured one.
    ///
    /// # Errors
    /// Same as [`CircuitBreaker::call`].
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        limit: Duration,
        op: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(limit, op, |_| true).await
    }

    /// Execute `op`, counting only the errors `is_failure` accepts.
    ///
    /// Unclassified errors are returned as [`CircuitBreakerError::Failed`]
    /// without touching breaker state; a half-open trial that ends this way
    /// frees the trial slot and leaves the breaker half-open.
    ///
    /// # Errors
    /// Same as [`CircuitBreaker::call`].
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        op: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.execute(self.config.call_timeout(), op, is_failure)
            .await
    }

    /// [`CircuitBreaker::call_classified`] with an explicit timeout.
    ///
    /// # Errors
    /// Same as [`CircuitBreaker::call`].
    pub async fn call_classified_with_timeout<F, Fut, T, E, C>(
        &self,
        limit: Duration,
        op: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.execute(limit, op, is_failure).await
    }

    async fn execute<F, Fut, T, E, C>(
        &self,
        limit: Duration,
        op: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let admission = self.admit().map_err(|retry_in| CircuitBreakerError::Open {
            name: self.name.to_string(),
            retry_in,
        })?;
        let guard = CallGuard {
            breaker: self,
            admission,
            finished: false,
        };

        match tokio::time::timeout(limit, op()).await {
            Err(_) => {
                guard.finish(Outcome::Failure);
                Err(CircuitBreakerError::Timeout(limit))
            }
            Ok(Ok(value)) => {
                guard.finish(Outcome::Success);
                Ok(value)
            }
            Ok(Err(e)) => {
                let outcome = if is_failure(&e) {
                    Outcome::Failure
                } else {
                    Outcome::Neutral
                };
                guard.finish(outcome);
                Err(CircuitBreakerError::Failed(e))
            }
        }
    }

    /// Decide whether a call may proceed. `Err` carries the time until a
    /// trial may be admitted.
    fn admit(&self) -> Result<Admission, Duration> {
        let mut inner = self.inner.lock();
        match inner.status {
            CircuitStatus::Closed => {
                inner.total_calls += 1;
                Ok(Admission::Normal)
            }
            CircuitStatus::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(inner.recovery_timeout);
                if elapsed >= inner.recovery_timeout {
                    self.transition(&mut inner, CircuitStatus::HalfOpen);
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    Ok(Admission::Trial)
                } else {
                    inner.rejected += 1;
                    debug!(breaker = %self.name, "circuit breaker: request rejected (open)");
                    Err(inner.recovery_timeout - elapsed)
                }
            }
            CircuitStatus::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    debug!(breaker = %self.name, "circuit breaker: request rejected (trial in flight)");
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn record(&self, admission: Admission, outcome: Outcome) {
        let mut inner = self.inner.lock();
        if outcome == Outcome::Failure {
            inner.total_failures += 1;
        }

        match (admission, inner.status) {
            (Admission::Normal, CircuitStatus::Closed) => match outcome {
                Outcome::Success => inner.consecutive_failures = 0,
                Outcome::Neutral => {}
                Outcome::Failure => {
                    inner.consecutive_failures += 1;
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: failure recorded"
                    );
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.open(&mut inner);
                    }
                }
            },
            (Admission::Trial, CircuitStatus::HalfOpen) => {
                inner.trial_in_flight = false;
                match outcome {
                    Outcome::Success => {
                        inner.consecutive_failures = 0;
                        inner.recovery_timeout = self.config.recovery_timeout();
                        inner.opened_at = None;
                        inner.opened_at_wall = None;
                        self.transition(&mut inner, CircuitStatus::Closed);
                    }
                    Outcome::Neutral => {}
                    Outcome::Failure => {
                        inner.consecutive_failures += 1;
                        let grown = inner
                            .recovery_timeout
                            .mul_f64(self.config.backoff_multiplier.max(1.0));
                        inner.recovery_timeout = grown.min(self.config.max_recovery_timeout());
                        self.open(&mut inner);
                    }
                }
            }
            // The breaker changed state while this call was in flight
            // (manual reset/trip, or a concurrent call tripped it).
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        self.transition(inner, CircuitStatus::Open);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitStatus) {
        let from = inner.status;
        if from == to {
            return;
        }
        inner.status = to;
        inner.last_state_change = Instant::now();

        match to {
            CircuitStatus::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = inner.consecutive_failures,
                recovery_ms = inner.recovery_timeout.as_millis() as u64,
                "circuit breaker: opening"
            ),
            _ => info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker: state change"
            ),
        }
        metrics::inc_breaker_transition(&self.name, to.as_str());

        // No subscribers is fine.
        let _ = self.events.send(CircuitTransition {
            breaker: self.name.to_string(),
            from,
            to,
            consecutive_failures: inner.consecutive_failures,
            recovery_timeout_ms: inner.recovery_timeout.as_millis() as u64,
            at: Utc::now(),
        });
    }

    /// Current status. Does not advance Open → Half-Open; that happens when
    /// the next call is admitted.
    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().status
    }

    /// Activity counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            recovery_timeout: inner.recovery_timeout,
            time_in_current_state: inner.last_state_change.elapsed(),
        }
    }

    /// Export state for persistence.
    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            name: self.name.to_string(),
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
            recovery_timeout_ms: inner.recovery_timeout.as_millis() as u64,
        }
    }

    /// Re-import persisted state.
    ///
    /// An open breaker stays open for whatever remains of its recovery
    /// timeout, measured against the persisted wall-clock `opened_at`.
    /// A breaker persisted half-open comes back half-open with no trial in
    /// flight. Does not emit a transition event.
    pub fn restore(&self, state: &CircuitBreakerState) {
        let mut inner = self.inner.lock();
        let cap = self.config.max_recovery_timeout();
        inner.status = state.status;
        inner.consecutive_failures = state.consecutive_failures;
        inner.recovery_timeout = Duration::from_millis(state.recovery_timeout_ms)
            .max(self.config.recovery_timeout())
            .min(cap);
        inner.trial_in_flight = false;
        inner.opened_at_wall = state.opened_at;
        inner.opened_at = state.opened_at.map(|wall| {
            let elapsed = (Utc::now() - wall).to_std().unwrap_or(Duration::ZERO);
            let now = Instant::now();
            now.checked_sub(elapsed).unwrap_or(now)
        });
        if inner.status == CircuitStatus::Open && inner.opened_at.is_none() {
            inner.opened_at = Some(Instant::now());
            inner.opened_at_wall = Some(Utc::now());
        }
        inner.last_state_change = Instant::now();
        info!(
            breaker = %self.name,
            status = inner.status.as_str(),
            failures = inner.consecutive_failures,
            "circuit breaker: state restored"
        );
    }

    /// Manually reset to closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.recovery_timeout = self.config.recovery_timeout();
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitStatus::Closed);
    }

    /// Force the breaker open (maintenance).
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        self.open(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(threshold: u32, recovery_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            backoff_multiplier: 2.0,
            max_recovery_multiplier: 10.0,
            call_timeout_ms: 1_000,
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        b.call(|| async { Err("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        b.call(|| async { Ok(()) }).await
    }

    // ── Closed → Open ──

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let b = CircuitBreaker::new("t", config(3, 60));
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.status(), CircuitStatus::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let b = CircuitBreaker::new("t", config(3, 60));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking_operation() {
        let b = CircuitBreaker::new("t", config(1, 60));
        let _ = fail(&b).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), CircuitBreakerError<&str>> = b
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.as_ref().is_err_and(|e| e.is_open()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let b = CircuitBreaker::new("t", config(1, 60));
        let result: Result<(), CircuitBreakerError<&str>> = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    // ── Half-open ──

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes_and_resets_timeout() {
        let b = CircuitBreaker::new("t", config(1, 60));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.stats().recovery_timeout, Duration::from_secs(60));
        assert_eq!(b.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_doubles_recovery_up_to_cap() {
        let b = CircuitBreaker::new("t", config(1, 60));
        let _ = fail(&b).await;
        let mut expected = 60;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(expected)).await;
            let _ = fail(&b).await;
            expected = (expected * 2).min(600);
            assert_eq!(b.status(), CircuitStatus::Open);
            assert_eq!(b.stats().recovery_timeout, Duration::from_secs(expected));
        }
        assert_eq!(b.stats().recovery_timeout, Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_frees_trial_slot() {
        let b = CircuitBreaker::new("t", config(1, 10));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let r: Result<(), CircuitBreakerError<&str>> = b
            .call_classified(|| async { Err("not found") }, |e| *e != "not found")
            .await;
        assert!(matches!(r, Err(CircuitBreakerError::Failed("not found"))));
        assert_eq!(b.status(), CircuitStatus::HalfOpen);

        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let b = CircuitBreaker::new("t", config(1, 10));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        {
            let fut = b.call(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, &str>(())
            });
            // Poll once so the trial is admitted, then drop it.
            let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        }
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_broadcast() {
        let b = CircuitBreaker::new("gen", config(1, 5));
        let mut rx = b.subscribe();
        let _ = fail(&b).await;
        let t = rx.recv().await.expect("test: transition");
        assert_eq!(t.breaker, "gen");
        assert_eq!((t.from, t.to), (CircuitStatus::Closed, CircuitStatus::Open));
    }

    // ── Persistence ──

    #[tokio::test(start_paused = true)]
    async fn test_restore_keeps_open_breaker_open() {
        let b = CircuitBreaker::new("t", config(1, 60));
        let _ = fail(&b).await;
        let saved = b.state();
        assert_eq!(saved.status, CircuitStatus::Open);
        assert!(saved.opened_at.is_some());

        let fresh = CircuitBreaker::new("t", config(1, 60));
        fresh.restore(&saved);
        assert_eq!(fresh.status(), CircuitStatus::Open);
        assert!(succeed(&fresh).await.is_err_and(|e| e.is_open()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset_and_trip() {
        let b = CircuitBreaker::new("t", config(5, 60));
        b.trip();
        assert_eq!(b.status(), CircuitStatus::Open);
        b.reset();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert!(succeed(&b).await.is_ok());
    }
}
