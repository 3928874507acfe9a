//! Recovery playbooks: per-classification remediation strategy.
//!
//! ```text
//! classification ──lookup──▶ Playbook
//!                              │ action ──────────▶ executor
//!                              │ fallback ────────▶ action id or classification
//!                              │ chain ───────────▶ classification (run after success)
//!                              └ circuit_breaker ─▶ registry thresholds
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::config::humantime_serde;
use crate::failsafe::{BackoffPolicy, BackoffStrategy};

// ============================================================================
// Actions
// ============================================================================

/// Closed set of recovery actions the executor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Trigger a new run of the failed job
    RetryJob,
    /// Restart the compute resource
    #[serde(alias = "restart_cluster")]
    RestartResource,
    /// Add workers to the compute resource
    #[serde(alias = "scale_cluster")]
    ScaleResource,
    /// Reinstall a dependency with known-good versions
    #[serde(alias = "library_fallback")]
    ReinstallDependency,
    /// Re-apply a previously captured configuration snapshot
    #[serde(alias = "rollback_config")]
    RollbackConfiguration,
    /// Automatic recovery explicitly disabled
    #[serde(rename = "none")]
    NoAction,
}

impl RecoveryAction {
    /// Every implemented action
    pub const ALL: [Self; 6] = [
        Self::RetryJob,
        Self::RestartResource,
        Self::ScaleResource,
        Self::ReinstallDependency,
        Self::RollbackConfiguration,
        Self::NoAction,
    ];

    /// Canonical identifier
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryJob => "retry_job",
            Self::RestartResource => "restart_resource",
            Self::ScaleResource => "scale_resource",
            Self::ReinstallDependency => "reinstall_dependency",
            Self::RollbackConfiguration => "rollback_configuration",
            Self::NoAction => "none",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "retry_job" => Ok(Self::RetryJob),
            "restart_resource" | "restart_cluster" => Ok(Self::RestartResource),
            "scale_resource" | "scale_cluster" => Ok(Self::ScaleResource),
            "reinstall_dependency" | "library_fallback" => Ok(Self::ReinstallDependency),
            "rollback_configuration" | "rollback_config" => Ok(Self::RollbackConfiguration),
            "none" => Ok(Self::NoAction),
            other => Err(Error::UnsupportedAction(other.to_string())),
        }
    }
}

// ============================================================================
// Playbook definition (deserialized from YAML)
// ============================================================================

/// Circuit breaker settings carried by a playbook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookBreaker {
    /// Guard this classification with a breaker
    pub enabled: bool,
    /// Failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
}

impl Default for PlaybookBreaker {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            open_timeout: Duration::from_secs(300),
        }
    }
}

/// How to recover from one failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playbook {
    /// Classification this playbook answers for
    pub classification: String,

    /// Platform label (`databricks`, `adf`, ...)
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Primary action
    pub action: RecoveryAction,

    /// Attempts for `retry_job`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Delay growth between attempts
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Delay before the second attempt
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff ceiling
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Linear backoff increment
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub backoff_increment: Duration,

    /// Action id or classification tried when the primary fails
    #[serde(default)]
    pub fallback: Option<String>,

    /// Classification orchestrated after this one succeeds
    #[serde(default, alias = "chain_on_failure")]
    pub chain: Option<String>,

    /// Verify resource health after the action
    #[serde(default = "default_true")]
    pub verify_health: bool,

    /// Bound on health verification
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: PlaybookBreaker,

    /// Allow snapshot-based rollback for this classification
    #[serde(default = "default_true")]
    pub rollback_enabled: bool,

    /// Capture a configuration snapshot before acting
    #[serde(default = "default_true")]
    pub snapshot_before_action: bool,

    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

fn default_platform() -> String {
    "generic".to_string()
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

const fn default_health_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_true() -> bool {
    true
}

impl Playbook {
    /// Playbook with default policy for `action`
    #[must_use]
    pub fn new(classification: impl Into<String>, action: RecoveryAction) -> Self {
        Self {
            classification: classification.into(),
            platform: default_platform(),
            action,
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            backoff: BackoffStrategy::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_increment: default_base_delay(),
            fallback: None,
            chain: None,
            verify_health: true,
            health_check_timeout: default_health_timeout(),
            circuit_breaker: PlaybookBreaker::default(),
            rollback_enabled: true,
            snapshot_before_action: true,
            description: String::new(),
        }
    }

    /// Set the platform label
    #[must_use]
    pub fn on_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    /// Set retry count and backoff strategy
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: BackoffStrategy) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    /// Set backoff delays
    #[must_use]
    pub fn with_backoff_delays(mut self, base: Duration, max: Duration, increment: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self.backoff_increment = increment;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the fallback target (action id or classification)
    #[must_use]
    pub fn with_fallback(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }

    /// Set the chained classification
    #[must_use]
    pub fn with_chain(mut self, classification: impl Into<String>) -> Self {
        self.chain = Some(classification.into());
        self
    }

    /// Skip post-action health verification
    #[must_use]
    pub fn without_health_check(mut self) -> Self {
        self.verify_health = false;
        self
    }

    /// Set the health verification timeout
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set breaker thresholds
    #[must_use]
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, open_timeout: Duration) -> Self {
        self.circuit_breaker = PlaybookBreaker {
            enabled: true,
            failure_threshold,
            open_timeout,
        };
        self
    }

    /// Disable breaker protection
    #[must_use]
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker.enabled = false;
        self
    }

    /// Disable snapshot capture and rollback
    #[must_use]
    pub fn without_rollback(mut self) -> Self {
        self.rollback_enabled = false;
        self
    }

    /// Set the description
    #[must_use]
    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Backoff policy for repeated attempts
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.backoff,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            increment: self.backoff_increment,
        }
    }

    /// Whether a snapshot is taken before the primary action
    #[must_use]
    pub fn captures_snapshot(&self) -> bool {
        self.rollback_enabled && self.snapshot_before_action
    }
}

/// What a playbook's `fallback` field points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTarget<'a> {
    /// Another classification: run its action with its policy
    Playbook(&'a Playbook),
    /// A raw action run with the current playbook's policy
    Action(RecoveryAction),
    /// Neither a classification nor an implemented action
    Unsupported(&'a str),
}

pub mod registry;
pub use registry::PlaybookRegistry;
