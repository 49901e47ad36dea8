//! Resilience primitives: circuit breakers for external collaborators,
//! per-component exclusivity locks and per-scope worker pools.

pub mod circuit_breaker;
pub mod component_lock;
pub mod scope_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerState, CircuitBreakerStats, CircuitStatus,
    CircuitTransition,
};
pub use component_lock::{ComponentLease, ComponentLocks, LockConflict, UnavailableComponent};
pub use scope_limiter::{ScopeLimiter, ScopeLimiterError};
