//! Lazily-populated map of circuit breakers keyed by `classification:resource`

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitState, CircuitStatus};

/// Resource id used when a failure cannot be tied to a job or cluster
pub const GLOBAL_RESOURCE: &str = "global";

/// Build the breaker key for a classification and resource
#[must_use]
pub fn circuit_key(classification: &str, resource_id: &str) -> String {
    format!("{classification}:{resource_id}")
}

/// Thread-safe registry of circuit breakers.
///
/// Insertion goes through `DashMap::entry` so concurrent first access to the
/// same key creates exactly one breaker. Each key also owns an advisory async
/// lock the orchestrator can hold for the duration of one attempt.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry with default thresholds
    #[must_use]
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Registry-wide default thresholds
    #[must_use]
    pub fn defaults(&self) -> BreakerSettings {
        self.defaults
    }

    /// Return the breaker for `key`, creating it on first use.
    ///
    /// Thresholds given here only apply when the breaker is created; later
    /// calls with different values get the existing breaker unchanged.
    pub fn get_or_create(
        &self,
        key: &str,
        failure_threshold: Option<u32>,
        open_timeout: Option<Duration>,
        success_threshold: Option<u32>,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            let settings = BreakerSettings {
                failure_threshold: failure_threshold
                    .filter(|t| *t > 0)
                    .unwrap_or(self.defaults.failure_threshold),
                open_timeout: open_timeout.unwrap_or(self.defaults.open_timeout),
                success_threshold: success_threshold
                    .filter(|t| *t > 0)
                    .unwrap_or(self.defaults.success_threshold),
            };
            info!(
                key,
                failure_threshold = settings.failure_threshold,
                success_threshold = settings.success_threshold,
                open_timeout_secs = settings.open_timeout.as_secs(),
                "Created circuit breaker"
            );
            Arc::new(CircuitBreaker::new(key, settings))
        });
        Arc::clone(entry.value())
    }

    /// Existing breaker for `key`, if any
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Reset the breaker for `key`. Returns `false` when no breaker exists.
    pub fn reset(&self, key: &str) -> bool {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Status of one breaker
    #[must_use]
    pub fn status(&self, key: &str) -> Option<CircuitStatus> {
        self.get(key).map(|b| b.status())
    }

    /// Status of every breaker, sorted by key
    #[must_use]
    pub fn all_statuses(&self) -> Vec<CircuitStatus> {
        let mut statuses: Vec<CircuitStatus> =
            self.breakers.iter().map(|b| b.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Keys of breakers currently open
    #[must_use]
    pub fn list_open(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.value().state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Number of tracked breakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breakers exist yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Remove closed breakers idle for longer than `max_age`.
    ///
    /// Open and half-open breakers are never evicted. Returns the number removed.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let before = self.breakers.len();
        self.breakers.retain(|key, breaker| {
            let keep = breaker.state() != CircuitState::Closed || breaker.idle_for() < max_age;
            if !keep {
                debug!(key = %key, "Evicted idle circuit breaker");
            }
            keep
        });
        // Drop advisory locks nobody holds and whose breaker is gone.
        self.in_flight.retain(|key, lock| {
            self.breakers.contains_key(key) || Arc::strong_count(lock) > 1
        });

        let removed = before.saturating_sub(self.breakers.len());
        if removed > 0 {
            info!(removed, remaining = self.breakers.len(), "Circuit breaker sweep");
        }
        removed
    }

    /// Acquire the advisory in-flight lock for `key`, waiting if another
    /// attempt for the same key is running.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }
}
