//! Failed-attempt accounting and lockout.
//!
//! Counters live in an external [`AttemptCache`] so several engine instances
//! can share them. Each increment refreshes the counter's expiry; a counter
//! that has sat idle for the lockout window disappears.

use crate::config::LockoutConfig;
use crate::store::StoreError;
use crate::types::Identity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared counter storage. `increment` must be atomic per identity.
pub trait AttemptCache: Send + Sync {
    /// Current failed-attempt count; 0 when absent or expired.
    fn count(&self, identity: &Identity) -> Result<u32, StoreError>;

    /// Add one failure and (re)arm the expiry. Returns the new count.
    fn increment(&self, identity: &Identity, ttl: Duration) -> Result<u32, StoreError>;

    fn reset(&self, identity: &Identity) -> Result<(), StoreError>;

    fn record_success(&self, identity: &Identity, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn last_success(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    expires_at: Instant,
}

/// Process-local cache for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryAttemptCache {
    counters: Mutex<HashMap<Identity, Counter>>,
    successes: Mutex<HashMap<Identity, DateTime<Utc>>>,
}

impl MemoryAttemptCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptCache for MemoryAttemptCache {
    fn count(&self, identity: &Identity) -> Result<u32, StoreError> {
        let mut counters = self.counters.lock();
        match counters.get(identity) {
            Some(c) if c.expires_at > Instant::now() => Ok(c.count),
            Some(_) => {
                counters.remove(identity);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    fn increment(&self, identity: &Identity, ttl: Duration) -> Result<u32, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, c| c.expires_at > now);
        let counter = counters.entry(identity.clone()).or_insert(Counter { count: 0, expires_at: now });
        counter.count = counter.count.saturating_add(1);
        counter.expires_at = now + ttl;
        Ok(counter.count)
    }

    fn reset(&self, identity: &Identity) -> Result<(), StoreError> {
        self.counters.lock().remove(identity);
        Ok(())
    }

    fn record_success(&self, identity: &Identity, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.successes.lock().insert(identity.clone(), at);
        Ok(())
    }

    fn last_success(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.successes.lock().get(identity).copied())
    }
}

/// Lockout policy applied over an [`AttemptCache`].
#[derive(Clone)]
pub struct AttemptTracker {
    cache: Arc<dyn AttemptCache>,
    config: LockoutConfig,
}

impl AttemptTracker {
    pub fn new(cache: Arc<dyn AttemptCache>, config: LockoutConfig) -> Self {
        Self { cache, config }
    }

    /// Default lockout rules.
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn attempts(&self, identity: &Identity) -> Result<u32, StoreError> {
        self.cache.count(identity)
    }

    /// Locked once the count has reached the maximum.
    pub fn is_locked(&self, identity: &Identity) -> Result<bool, StoreError> {
        self.is_locked_under(identity, &self.config)
    }

    /// Like [`is_locked`](Self::is_locked) with per-identity rules.
    pub fn is_locked_under(&self, identity: &Identity, lockout: &LockoutConfig) -> Result<bool, StoreError> {
        Ok(self.cache.count(identity)? >= lockout.max_attempts)
    }

    pub fn record_failure(&self, identity: &Identity) -> Result<u32, StoreError> {
        self.record_failure_under(identity, &self.config)
    }

    pub fn record_failure_under(&self, identity: &Identity, lockout: &LockoutConfig) -> Result<u32, StoreError> {
        let count = self.cache.increment(identity, lockout.window())?;
        if count >= lockout.max_attempts {
            tracing::warn!(identity = %identity, count, "identity locked out");
        }
        Ok(count)
    }

    pub fn record_success(&self, identity: &Identity) -> Result<(), StoreError> {
        self.cache.reset(identity)?;
        self.cache.record_success(identity, Utc::now())
    }

    pub fn reset(&self, identity: &Identity) -> Result<(), StoreError> {
        self.cache.reset(identity)
    }

    pub fn last_success(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.cache.last_success(identity)
    }
}
