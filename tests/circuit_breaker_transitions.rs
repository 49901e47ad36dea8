//! # Circuit Breaker Behavior Under 50 Paced Requests
//!
//! Sends 50 requests, 150 ms apart, through a breaker guarding a
//! collaborator that is down for requests 8..28. Documents exactly where the
//! circuit opens, how long it rejects, how a failed trial backs off and when
//! it closes again (Closed → Open → HalfOpen → Open → HalfOpen → Closed).

use std::time::Duration;

use fleet_autoimprove::config::BreakerConfig;
use fleet_autoimprove::resilience::{CircuitBreaker, CircuitBreakerError, CircuitStatus};

/// Collaborator that fails while the request index is inside its outage.
struct SimulatedCollaborator {
    outage: std::ops::Range<usize>,
}

impl SimulatedCollaborator {
    async fn fetch(&self, index: usize) -> Result<String, String> {
        if self.outage.contains(&index) {
            Err(format!("simulated outage at request {index}"))
        } else {
            Ok(format!("response {index}"))
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    successes: usize,
    failures: usize,
    rejected: usize,
}

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        "telemetry",
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 1,
            backoff_multiplier: 2.0,
            max_recovery_multiplier: 10.0,
            call_timeout_ms: 500,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_50_paced_requests_circuit_breaker_behavior() {
    let breaker = breaker();
    let mut transitions = breaker.subscribe();
    let collaborator = SimulatedCollaborator { outage: 8..28 };

    let mut tally = Tally::default();
    let mut open_detected_at: Option<usize> = None;
    let mut statuses = Vec::with_capacity(50);

    for i in 0..50 {
        match breaker.call(|| collaborator.fetch(i)).await {
            Ok(_) => tally.successes += 1,
            Err(CircuitBreakerError::Failed(_)) => tally.failures += 1,
            Err(CircuitBreakerError::Open { .. }) => tally.rejected += 1,
            Err(CircuitBreakerError::Timeout(d)) => panic!("test: unexpected timeout after {d:?}"),
        }
        let status = breaker.status();
        if status == CircuitStatus::Open && open_detected_at.is_none() {
            open_detected_at = Some(i);
        }
        statuses.push(status);
        if (i + 1) % 10 == 0 {
            println!("after {:>2} requests: {:?} {:?}", i + 1, status, tally);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    // Requests 8..=12 are the five failures that trip the breaker.
    assert_eq!(open_detected_at, Some(12));
    // First trial at request 19 (1.05 s after opening) fails and doubles the
    // recovery timeout; the second trial at request 33 succeeds.
    assert_eq!(statuses[19], CircuitStatus::Open);
    assert_eq!(statuses[33], CircuitStatus::Closed);
    assert_eq!(tally.failures, 6);
    assert_eq!(tally.rejected, 19);
    assert_eq!(tally.successes, 25);
    assert_eq!(breaker.status(), CircuitStatus::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.rejected, 19);
    assert_eq!(stats.total_calls, 31);
    assert_eq!(stats.recovery_timeout, Duration::from_secs(1));

    let mut seen = Vec::new();
    while let Ok(t) = transitions.try_recv() {
        seen.push((t.from, t.to));
    }
    assert_eq!(
        seen,
        vec![
            (CircuitStatus::Closed, CircuitStatus::Open),
            (CircuitStatus::Open, CircuitStatus::HalfOpen),
            (CircuitStatus::HalfOpen, CircuitStatus::Open),
            (CircuitStatus::Open, CircuitStatus::HalfOpen),
            (CircuitStatus::HalfOpen, CircuitStatus::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_collaborator_trips_breaker_through_timeouts() {
    let breaker = breaker();
    for _ in 0..5 {
        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
    }
    assert_eq!(breaker.status(), CircuitStatus::Open);

    let rejected = breaker.call(|| async { Ok::<_, String>(()) }).await;
    match rejected {
        Err(CircuitBreakerError::Open { name, retry_in }) => {
            assert_eq!(name, "telemetry");
            assert!(retry_in <= Duration::from_secs(1));
        }
        other => panic!("test: expected open rejection, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_persisted_open_state_survives_restart() {
    let first = breaker();
    first.trip();
    let saved = first.state();
    assert_eq!(saved.status, CircuitStatus::Open);

    let restarted = breaker();
    restarted.restore(&saved);
    assert_eq!(restarted.status(), CircuitStatus::Open);
    assert!(restarted
        .call(|| async { Ok::<_, String>(()) })
        .await
        .is_err_and(|e| e.is_open()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    restarted
        .call(|| async { Ok::<_, String>(()) })
        .await
        .expect("test: trial after recovery");
    assert_eq!(restarted.status(), CircuitStatus::Closed);
}
