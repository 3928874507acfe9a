//! Resource Control API: the narrow capability interface recovery actions
//! and health checks run against.
//!
//! Implementations talk to a vendor platform; the recovery engine only sees
//! the [`ResourceControl`] trait and the normalized types below.

pub mod adf;
pub mod databricks;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::failsafe::GLOBAL_RESOURCE;

pub use adf::AdfClient;
pub use databricks::DatabricksClient;

/// Operations the recovery engine needs from a pipeline platform.
///
/// Every method is a network call; errors are returned as-is and normalized
/// by the executor.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    /// Trigger a new run of `job_id`, returning the new run id
    async fn retry_job(&self, job_id: &str) -> Result<String>;

    /// Start or restart the compute resource
    async fn restart_resource(&self, resource_id: &str) -> Result<()>;

    /// Resize the resource to `target_workers`
    async fn scale_resource(&self, resource_id: &str, target_workers: u32) -> Result<()>;

    /// Current configuration of the resource
    async fn get_resource_config(&self, resource_id: &str) -> Result<ResourceConfig>;

    /// Replace the resource configuration
    async fn apply_resource_config(&self, resource_id: &str, config: &ResourceConfig)
    -> Result<()>;

    /// Install `name==version` on the resource
    async fn install_dependency(&self, resource_id: &str, name: &str, version: &str)
    -> Result<()>;

    /// Lifecycle and capacity of the resource
    async fn get_resource_state(&self, resource_id: &str) -> Result<ResourceState>;

    /// Lifecycle and result of a job run
    async fn get_run_state(&self, run_id: &str) -> Result<RunState>;
}

// ── Failure input ──────────────────────────────────────────────────────

/// Normalized identifiers of the failed pipeline, produced upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Job (or pipeline) identifier
    #[serde(default, deserialize_with = "opt_id", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Compute resource (cluster) identifier
    #[serde(
        default,
        alias = "cluster_id",
        deserialize_with = "opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_id: Option<String>,
    /// Failed run identifier
    #[serde(default, deserialize_with = "opt_id", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Library spec that failed to install (`pandas==2.1.0`)
    #[serde(default, alias = "library_name", skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    /// Raw error text from the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Anything else the upstream classifier attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceMetadata {
    /// Metadata for a job
    #[must_use]
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    /// Metadata for a compute resource
    #[must_use]
    pub fn for_resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            ..Self::default()
        }
    }

    /// Attach a resource id
    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attach a run id
    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Resource component of the circuit breaker key:
    /// job id, else resource id, else [`GLOBAL_RESOURCE`].
    #[must_use]
    pub fn breaker_resource(&self) -> &str {
        self.job_id
            .as_deref()
            .or(self.resource_id.as_deref())
            .unwrap_or(GLOBAL_RESOURCE)
    }
}

/// Accept ids as JSON strings or numbers
fn opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ── Resource state ─────────────────────────────────────────────────────

/// Compute resource lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceLifecycle {
    /// Being provisioned
    Pending,
    /// Up and accepting work
    Running,
    /// Restart in progress
    Restarting,
    /// Worker count changing
    Resizing,
    /// Shutting down
    Terminating,
    /// Stopped
    Terminated,
    /// Failed
    Error,
    /// Anything the platform reports that is not modelled
    #[serde(other)]
    Unknown,
}

impl ResourceLifecycle {
    /// A start or restart is already under way
    #[must_use]
    pub fn is_starting(self) -> bool {
        matches!(self, Self::Pending | Self::Restarting)
    }
}

/// Observed state of a compute resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Lifecycle state
    pub lifecycle: ResourceLifecycle,
    /// Platform state message
    #[serde(default)]
    pub message: String,
    /// Why the resource terminated or errored, if it did. The verifier
    /// ignores it while the resource is `Running`.
    #[serde(default)]
    pub termination_reason: Option<String>,
    /// Configured worker count (autoscale minimum when autoscaling)
    #[serde(default)]
    pub configured_workers: Option<u32>,
    /// Workers currently alive
    #[serde(default)]
    pub live_workers: Option<u32>,
}

impl ResourceState {
    /// State with only a lifecycle set
    #[must_use]
    pub fn new(lifecycle: ResourceLifecycle) -> Self {
        Self {
            lifecycle,
            message: String::new(),
            termination_reason: None,
            configured_workers: None,
            live_workers: None,
        }
    }

    /// Set configured and live worker counts
    #[must_use]
    pub fn with_workers(mut self, configured: u32, live: u32) -> Self {
        self.configured_workers = Some(configured);
        self.live_workers = Some(live);
        self
    }
}

/// Job run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunLifecycle {
    /// Queued or waiting for resources
    #[serde(alias = "QUEUED", alias = "BLOCKED", alias = "WAITING_FOR_RETRY")]
    Pending,
    /// Executing
    Running,
    /// Finishing up
    Terminating,
    /// Finished (see the result)
    Terminated,
    /// Not run
    Skipped,
    /// Platform failure
    InternalError,
    /// Anything the platform reports that is not modelled
    #[serde(other)]
    Unknown,
}

impl RunLifecycle {
    /// The run will not change state again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Skipped | Self::InternalError)
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    /// Completed successfully
    Success,
    /// Task failure
    Failed,
    /// Exceeded its own timeout
    #[serde(alias = "TIMED_OUT")]
    Timedout,
    /// Cancelled by a user or the platform
    #[serde(alias = "CANCELLED")]
    Canceled,
    /// Any other result state
    #[serde(other)]
    Other,
}

/// Observed state of a job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Lifecycle state
    pub lifecycle: RunLifecycle,
    /// Result once terminal
    #[serde(default)]
    pub result: Option<RunResult>,
    /// Platform state message
    #[serde(default)]
    pub message: String,
}

impl RunState {
    /// Run still in flight
    #[must_use]
    pub fn in_flight(lifecycle: RunLifecycle) -> Self {
        Self {
            lifecycle,
            result: None,
            message: String::new(),
        }
    }

    /// Terminated run with `result`
    #[must_use]
    pub fn finished(result: RunResult) -> Self {
        Self {
            lifecycle: RunLifecycle::Terminated,
            result: Some(result),
            message: String::new(),
        }
    }

    /// Terminal with a successful result
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.lifecycle == RunLifecycle::Terminated && self.result == Some(RunResult::Success)
    }
}

// ── Resource configuration ─────────────────────────────────────────────

/// Autoscaling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autoscale {
    /// Lower bound
    pub min_workers: u32,
    /// Upper bound
    pub max_workers: u32,
}

/// Resource configuration fields recovery reads, snapshots, and re-applies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Fixed worker count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<u32>,
    /// Autoscaling bounds (takes precedence over `num_workers`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<Autoscale>,
    /// Worker node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type_id: Option<String>,
    /// Driver node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_node_type_id: Option<String>,
    /// Runtime version
    #[serde(
        default,
        rename = "spark_version",
        alias = "runtime_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_version: Option<String>,
    /// Engine configuration
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub spark_conf: HashMap<String, String>,
}

impl ResourceConfig {
    /// Fixed config with `n` workers
    #[must_use]
    pub fn fixed(num_workers: u32) -> Self {
        Self {
            num_workers: Some(num_workers),
            ..Self::default()
        }
    }

    /// Autoscaling config
    #[must_use]
    pub fn autoscaling(min_workers: u32, max_workers: u32) -> Self {
        Self {
            autoscale: Some(Autoscale {
                min_workers,
                max_workers,
            }),
            ..Self::default()
        }
    }

    /// Worker count scaling starts from: autoscale minimum or fixed count
    #[must_use]
    pub fn current_workers(&self) -> u32 {
        self.autoscale
            .map(|a| a.min_workers)
            .or(self.num_workers)
            .unwrap_or(0)
    }
}
