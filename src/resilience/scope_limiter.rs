//! Bounded worker pool per scope.
//!
//! Each scope gets its own semaphore with `permits_per_scope` permits, so a
//! busy tenant cannot starve another tenant's cycle.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::Scope;

/// Errors produced by [`ScopeLimiter`].
#[derive(Debug, Error)]
pub enum ScopeLimiterError {
    /// The scope's semaphore was closed.
    #[error("worker pool for scope {0} is closed")]
    Closed(String),
}

/// Per-scope concurrency limiter. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ScopeLimiter {
    permits_per_scope: usize,
    pools: Arc<DashMap<Scope, Arc<Semaphore>>>,
}

impl ScopeLimiter {
    /// Create a limiter allowing `permits_per_scope` concurrent workers per
    /// scope (at least one).
    pub fn new(permits_per_scope: usize) -> Self {
        Self {
            permits_per_scope: permits_per_scope.max(1),
            pools: Arc::new(DashMap::new()),
        }
    }

    fn pool(&self, scope: &Scope) -> Arc<Semaphore> {
        self.pools
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_scope)))
            .clone()
    }

    /// Wait for a worker slot in `scope`.
    ///
    /// # Errors
    /// Returns [`ScopeLimiterError::Closed`] if the pool was closed.
    pub async fn acquire(&self, scope: &Scope) -> Result<OwnedSemaphorePermit, ScopeLimiterError> {
        self.pool(scope)
            .acquire_owned()
            .await
            .map_err(|_| ScopeLimiterError::Closed(scope.to_string()))
    }

    /// Free slots in `scope`.
    pub fn available(&self, scope: &Scope) -> usize {
        self.pool(scope).available_permits()
    }

    /// Configured slots per scope.
    pub fn capacity(&self) -> usize {
        self.permits_per_scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TenantId;
    use std::time::Duration;

    #[tokio::test]
    async fn test_scopes_have_independent_pools() {
        let limiter = ScopeLimiter::new(1);
        let a = Scope::Tenant(TenantId::new("a"));
        let b = Scope::Tenant(TenantId::new("b"));
        let _pa = limiter.acquire(&a).await.expect("test: a");
        let _pb = limiter.acquire(&b).await.expect("test: b");
        assert_eq!(limiter.available(&a), 0);
        assert_eq!(limiter.available(&b), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let limiter = ScopeLimiter::new(1);
        let s = Scope::System;
        let permit = limiter.acquire(&s).await.expect("test: first");
        let waiter = {
            let limiter = limiter.clone();
            let s = s.clone();
            tokio::spawn(async move { limiter.acquire(&s).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(permit);
        assert!(waiter.await.expect("test: join"));
    }

    #[test]
    fn test_zero_permits_is_raised_to_one() {
        assert_eq!(ScopeLimiter::new(0).capacity(), 1);
    }
}
