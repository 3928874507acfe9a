//! Circuit breaker guarding one `classification:resource` key
//!
//! ```text
//! CLOSED --failures >= threshold--> OPEN --open_timeout elapsed--> HALF_OPEN
//! HALF_OPEN --successes >= success_threshold--> CLOSED
//! HALF_OPEN --any failure--> OPEN
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Recovery attempts allowed
    Closed,
    /// Recovery attempts blocked until the open timeout elapses
    Open,
    /// Trial attempts allowed to test whether the resource recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Thresholds fixed when a breaker is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// How long an open breaker blocks before allowing a trial
    pub open_timeout: Duration,
    /// Consecutive half-open successes that close the breaker
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            open_timeout: config.open_timeout,
            success_threshold: config.success_threshold,
        }
    }
}

/// Answer to "may a recovery attempt run now?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether the attempt may proceed
    pub allowed: bool,
    /// Human-readable explanation
    pub reason: String,
    /// Remaining cool-down when blocked
    pub retry_after: Option<Duration>,
}

/// Point-in-time view of a breaker, safe to serialize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    /// Breaker key (`classification:resource`)
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Failures needed to open
    pub failure_threshold: u32,
    /// Consecutive successes
    pub success_count: u32,
    /// Half-open successes needed to close
    pub success_threshold: u32,
    /// Lifetime failures
    pub total_failures: u64,
    /// Lifetime successes
    pub total_successes: u64,
    /// Seconds since the last state transition
    pub time_in_state_secs: u64,
    /// Configured open duration in seconds
    pub open_timeout_secs: u64,
    /// Remaining cool-down while open
    pub retry_in_secs: Option<u64>,
    /// When the last failure was recorded
    pub last_failure: Option<DateTime<Utc>>,
    /// When the breaker last changed state
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<DateTime<Utc>>,
    state_changed: Instant,
    state_changed_at: DateTime<Utc>,
    last_activity: Instant,
}

impl BreakerInner {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure: None,
            state_changed: now,
            state_changed_at: Utc::now(),
            last_activity: now,
        }
    }

    fn mark_transition(&mut self, state: CircuitState) {
        self.state = state;
        self.state_changed = Instant::now();
        self.state_changed_at = Utc::now();
        self.last_activity = self.state_changed;
    }

    fn open(&mut self, name: &str, settings: &BreakerSettings) {
        self.mark_transition(CircuitState::Open);
        warn!(
            key = %name,
            failures = self.failure_count,
            open_timeout_secs = settings.open_timeout.as_secs(),
            "Circuit breaker opened"
        );
    }

    fn half_open(&mut self, name: &str) {
        self.mark_transition(CircuitState::HalfOpen);
        self.failure_count = 0;
        self.success_count = 0;
        info!(key = %name, "Circuit breaker half-open, testing recovery");
    }

    fn close(&mut self, name: &str) {
        self.mark_transition(CircuitState::Closed);
        self.failure_count = 0;
        self.success_count = 0;
        info!(key = %name, "Circuit breaker closed");
    }

    fn remaining_open(&self, settings: &BreakerSettings) -> Option<Duration> {
        (self.state == CircuitState::Open)
            .then(|| settings.open_timeout.saturating_sub(self.state_changed.elapsed()))
    }
}

/// Per-key failure/success counter and state machine.
///
/// All reads and mutations go through one mutex so concurrent `record_*`
/// calls on the same key are serialized.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Breaker key
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thresholds this breaker was created with
    #[must_use]
    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Check whether a recovery attempt may run.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open as a side
    /// effect and admits the caller as a trial.
    #[tracing::instrument(skip(self), fields(key = %self.name))]
    pub fn can_execute(&self) -> Admission {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();

        let state = inner.state;
        match state {
            CircuitState::Closed => Admission {
                allowed: true,
                reason: "Circuit is closed, operation allowed".to_string(),
                retry_after: None,
            },
            CircuitState::Open => {
                let elapsed = inner.state_changed.elapsed();
                if elapsed >= self.settings.open_timeout {
                    inner.half_open(&self.name);
                    Admission {
                        allowed: true,
                        reason: "Circuit entering half-open state, test operation allowed"
                            .to_string(),
                        retry_after: None,
                    }
                } else {
                    let remaining = self.settings.open_timeout - elapsed;
                    debug!(remaining_ms = remaining.as_millis() as u64, "Circuit open, rejecting");
                    Admission {
                        allowed: false,
                        reason: format!(
                            "Circuit is open, retry in {} seconds",
                            ceil_secs(remaining)
                        ),
                        retry_after: Some(remaining),
                    }
                }
            }
            CircuitState::HalfOpen => Admission {
                allowed: true,
                reason: "Circuit is half-open, test operation allowed".to_string(),
                retry_after: None,
            },
        }
    }

    /// Record a successful recovery
    #[tracing::instrument(skip(self), fields(key = %self.name))]
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        inner.total_successes += 1;
        inner.failure_count = 0;
        inner.last_activity = Instant::now();

        debug!(
            successes = inner.success_count,
            threshold = self.settings.success_threshold,
            state = %inner.state,
            "Success recorded"
        );

        if inner.state == CircuitState::HalfOpen
            && inner.success_count >= self.settings.success_threshold
        {
            inner.close(&self.name);
        }
    }

    /// Record a failed recovery
    #[tracing::instrument(skip(self), fields(key = %self.name))]
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.total_failures += 1;
        inner.success_count = 0;
        inner.last_failure = Some(Utc::now());
        inner.last_activity = Instant::now();

        warn!(
            failures = inner.failure_count,
            threshold = self.settings.failure_threshold,
            state = %inner.state,
            "Failure recorded"
        );

        let state = inner.state;
        match state {
            CircuitState::Closed if inner.failure_count >= self.settings.failure_threshold => {
                inner.open(&self.name, &self.settings);
            }
            CircuitState::HalfOpen => inner.open(&self.name, &self.settings),
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Force the breaker closed with consecutive counters zeroed.
    /// Lifetime totals are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.close(&self.name);
        info!(key = %self.name, "Circuit breaker manually reset");
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time since the breaker last changed state or recorded an outcome
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Serializable snapshot of the breaker
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.settings.failure_threshold,
            success_count: inner.success_count,
            success_threshold: self.settings.success_threshold,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            time_in_state_secs: inner.state_changed.elapsed().as_secs(),
            open_timeout_secs: self.settings.open_timeout.as_secs(),
            retry_in_secs: inner.remaining_open(&self.settings).map(ceil_secs),
            last_failure: inner.last_failure,
            last_state_change: inner.state_changed_at,
        }
    }

    /// One-line operator message
    #[must_use]
    pub fn status_message(&self) -> String {
        let status = self.status();
        match status.state {
            CircuitState::Closed => format!("Recovery for '{}' is allowed (circuit closed)", self.name),
            CircuitState::Open => format!(
                "Recovery for '{}' is blocked: circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                status.failure_count,
                status.retry_in_secs.unwrap_or(0)
            ),
            CircuitState::HalfOpen => format!(
                "Recovery for '{}' is half-open: testing recovery ({}/{} successes)",
                self.name, status.success_count, status.success_threshold
            ),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
