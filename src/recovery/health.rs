//! Post-action health verification against the Resource Control API

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::playbook::RecoveryAction;
use crate::resource::{ResourceControl, ResourceLifecycle, ResourceMetadata, RunState};

/// What to check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Compute resource lifecycle and workers
    Resource,
    /// Job run lifecycle and result
    JobRun,
    /// Whatever ids the metadata carries
    Auto,
}

impl CheckKind {
    /// Check that confirms `action` worked
    #[must_use]
    pub fn for_action(action: RecoveryAction) -> Self {
        match action {
            RecoveryAction::RetryJob => Self::JobRun,
            RecoveryAction::RestartResource
            | RecoveryAction::ScaleResource
            | RecoveryAction::ReinstallDependency
            | RecoveryAction::RollbackConfiguration => Self::Resource,
            RecoveryAction::NoAction => Self::Auto,
        }
    }
}

/// Health verdict. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Resource is working
    Healthy,
    /// Not settled yet; keep polling
    Pending,
    /// Resource is not working
    Unhealthy,
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Verdict
    pub status: HealthStatus,
    /// Human-readable explanation
    pub message: String,
    /// Observed values behind the verdict
    pub metrics: Map<String, Value>,
}

impl HealthReport {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            metrics: Map::new(),
        }
    }

    fn metric(mut self, key: &str, value: Value) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Verdict is healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Verdict is not settled
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == HealthStatus::Pending
    }

    /// Combine two reports; the worse status wins and messages are joined
    #[must_use]
    fn combine(self, other: Self) -> Self {
        let status = self.status.max(other.status);
        let mut metrics = self.metrics;
        metrics.extend(other.metrics);
        Self {
            status,
            message: format!("{}; {}", self.message, other.message),
            metrics,
        }
    }
}

/// Polls resources and runs to decide whether recovery took effect.
#[derive(Clone)]
pub struct HealthVerifier {
    control: Arc<dyn ResourceControl>,
    poll_interval: Duration,
}

impl std::fmt::Debug for HealthVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthVerifier")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl HealthVerifier {
    /// Create a verifier polling at `poll_interval`
    #[must_use]
    pub fn new(control: Arc<dyn ResourceControl>, poll_interval: Duration) -> Self {
        Self {
            control,
            poll_interval,
        }
    }

    /// Interval between polls
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One-shot health check
    pub async fn verify(&self, metadata: &ResourceMetadata, kind: CheckKind) -> HealthReport {
        let resource = metadata.resource_id.as_deref();
        let run = metadata.run_id.as_deref();

        match (kind, resource, run) {
            (CheckKind::Resource, Some(id), _) => self.check_resource(id).await,
            (CheckKind::JobRun, _, Some(id)) => self.check_run(id).await,
            (CheckKind::Resource, None, _) => {
                HealthReport::new(HealthStatus::Unhealthy, "No resource_id to verify")
            }
            (CheckKind::JobRun, _, None) => {
                HealthReport::new(HealthStatus::Unhealthy, "No run_id to verify")
            }
            (CheckKind::Auto, Some(r), Some(j)) => {
                let resource = self.check_resource(r).await;
                resource.combine(self.check_run(j).await)
            }
            (CheckKind::Auto, Some(r), None) => self.check_resource(r).await,
            (CheckKind::Auto, None, Some(j)) => self.check_run(j).await,
            (CheckKind::Auto, None, None) => {
                HealthReport::new(HealthStatus::Healthy, "No resource or run to verify")
                    .metric("checked", json!(0))
            }
        }
    }

    /// Running with all configured workers live. Termination reasons only
    /// count while the resource is not running.
    pub async fn check_resource(&self, resource_id: &str) -> HealthReport {
        let state = match self.control.get_resource_state(resource_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(resource_id, error = %e, "Resource health check failed");
                return HealthReport::new(
                    HealthStatus::Unhealthy,
                    format!("Health check for {resource_id} failed: {e}"),
                );
            }
        };

        let report = match state.lifecycle {
            // A reason left over from an earlier termination is not outstanding.
            ResourceLifecycle::Running => match (state.configured_workers, state.live_workers) {
                (Some(configured), Some(live)) if live < configured => HealthReport::new(
                    HealthStatus::Pending,
                    format!("Resource {resource_id} has {live}/{configured} workers live"),
                ),
                _ => HealthReport::new(
                    HealthStatus::Healthy,
                    format!("Resource {resource_id} is running"),
                ),
            },
            ResourceLifecycle::Pending
            | ResourceLifecycle::Restarting
            | ResourceLifecycle::Resizing => HealthReport::new(
                HealthStatus::Pending,
                format!("Resource {resource_id} is {:?}", state.lifecycle),
            ),
            ResourceLifecycle::Terminating
            | ResourceLifecycle::Terminated
            | ResourceLifecycle::Error
            | ResourceLifecycle::Unknown => {
                let reason = state
                    .termination_reason
                    .as_deref()
                    .map_or(String::new(), |r| format!(" ({r})"));
                HealthReport::new(
                    HealthStatus::Unhealthy,
                    format!("Resource {resource_id} is {:?}{reason}", state.lifecycle),
                )
            }
        };

        report
            .metric("resource_lifecycle", json!(state.lifecycle))
            .metric("configured_workers", json!(state.configured_workers))
            .metric("live_workers", json!(state.live_workers))
    }

    /// Terminal with a successful result. In-flight runs are `Pending`.
    pub async fn check_run(&self, run_id: &str) -> HealthReport {
        match self.control.get_run_state(run_id).await {
            Ok(state) => run_report(run_id, &state),
            Err(e) => {
                warn!(run_id, error = %e, "Run health check failed");
                HealthReport::new(
                    HealthStatus::Unhealthy,
                    format!("Health check for run {run_id} failed: {e}"),
                )
            }
        }
    }

    /// Re-check while `Pending` until the verdict settles or `timeout` passes.
    /// A timeout is reported as `Unhealthy`.
    pub async fn verify_until_settled(
        &self,
        metadata: &ResourceMetadata,
        kind: CheckKind,
        timeout: Duration,
    ) -> HealthReport {
        self.poll_until(timeout, || self.verify(metadata, kind))
            .await
    }

    /// Poll `run_id` until it reaches a terminal state or `timeout` passes.
    pub async fn wait_until_terminal(&self, run_id: &str, timeout: Duration) -> HealthReport {
        self.poll_until(timeout, || self.check_run(run_id)).await
    }

    /// Poll a resource that is starting until it is running.
    ///
    /// A `Terminated` resource counts as not yet picked up; `Error` and
    /// `Terminating` fail immediately.
    pub async fn wait_for_resource(&self, resource_id: &str, timeout: Duration) -> HealthReport {
        self.poll_until(timeout, || async move {
            let report = self.check_resource(resource_id).await;
            let lifecycle = report.metrics.get("resource_lifecycle").cloned();
            if lifecycle == Some(json!(ResourceLifecycle::Terminated)) {
                HealthReport {
                    status: HealthStatus::Pending,
                    ..report
                }
            } else {
                report
            }
        })
        .await
    }

    async fn poll_until<F, Fut>(&self, timeout: Duration, mut check: F) -> HealthReport
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = HealthReport>,
    {
        let mut last: Option<String> = None;
        let polled = tokio::time::timeout(timeout, async {
            loop {
                let report = check().await;
                if !report.is_pending() {
                    return report;
                }
                debug!(message = %report.message, "Not settled yet, polling again");
                last = Some(report.message);
                tokio::time::sleep(self.poll_interval).await;
            }
        })
        .await;

        polled.unwrap_or_else(|_| {
            HealthReport::new(
                HealthStatus::Unhealthy,
                format!(
                    "Timed out after {}s waiting for a settled state (last: {})",
                    timeout.as_secs_f64(),
                    last.as_deref().unwrap_or("no response")
                ),
            )
            .metric("timed_out", json!(true))
        })
    }
}

fn run_report(run_id: &str, state: &RunState) -> HealthReport {
    let report = if !state.lifecycle.is_terminal() {
        HealthReport::new(
            HealthStatus::Pending,
            format!("Run {run_id} is {:?}", state.lifecycle),
        )
    } else if state.succeeded() {
        HealthReport::new(
            HealthStatus::Healthy,
            format!("Run {run_id} completed successfully"),
        )
    } else {
        let result = state
            .result
            .map_or_else(|| format!("{:?}", state.lifecycle), |r| format!("{r:?}"));
        let detail = if state.message.is_empty() {
            String::new()
        } else {
            format!(": {}", state.message)
        };
        HealthReport::new(
            HealthStatus::Unhealthy,
            format!("Run {run_id} finished with {result}{detail}"),
        )
    };
    report
        .metric("run_lifecycle", json!(state.lifecycle))
        .metric("run_result", json!(state.result))
}
