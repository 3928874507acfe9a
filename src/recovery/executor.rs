//! Runs one recovery action against the Resource Control API.
//!
//! The executor never returns an error: every remote failure, timeout, or
//! missing identifier becomes a failed [`ActionOutcome`] with a reason.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::health::{HealthReport, HealthVerifier};
use super::snapshot::RecoverySnapshot;
use crate::config::{DependencyConfig, ScalingConfig};
use crate::playbook::{Playbook, RecoveryAction};
use crate::resource::{ResourceControl, ResourceMetadata};
use crate::Result;

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"requirement\s+([a-zA-Z0-9_-]+[>=<~!]*[0-9.]*)").expect("static regex")
});

/// Version operators recognised in a library spec, longest first
const VERSION_OPERATORS: [&str; 7] = ["==", ">=", "<=", "~=", "!=", ">", "<"];

/// `(success, message, metadata)` of one action
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Action call succeeded
    pub success: bool,
    /// Explanation
    pub message: String,
    /// Identifiers the action produced
    pub metadata: Map<String, Value>,
}

impl ActionOutcome {
    /// Successful outcome
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Failed outcome with empty metadata
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Inputs for one action
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    /// Failed pipeline identifiers
    pub metadata: &'a ResourceMetadata,
    /// Policy (timeout, retries, backoff) the action runs under
    pub playbook: &'a Playbook,
    /// Snapshot `rollback_configuration` re-applies
    pub rollback_to: Option<&'a RecoverySnapshot>,
}

/// Executes [`RecoveryAction`]s.
#[derive(Clone)]
pub struct ActionExecutor {
    control: Arc<dyn ResourceControl>,
    health: HealthVerifier,
    scaling: ScalingConfig,
    fallback_versions: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("scaling", &self.scaling)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(
        control: Arc<dyn ResourceControl>,
        poll_interval: Duration,
        scaling: ScalingConfig,
        dependencies: &DependencyConfig,
    ) -> Self {
        let fallback_versions = dependencies
            .fallback_versions
            .iter()
            .map(|(name, versions)| (name.to_lowercase(), versions.clone()))
            .collect();
        Self {
            health: HealthVerifier::new(Arc::clone(&control), poll_interval),
            control,
            scaling,
            fallback_versions,
        }
    }

    /// Same policy against another backend
    #[must_use]
    pub fn with_control(&self, control: Arc<dyn ResourceControl>) -> Self {
        Self {
            health: HealthVerifier::new(Arc::clone(&control), self.health.poll_interval()),
            control,
            scaling: self.scaling.clone(),
            fallback_versions: self.fallback_versions.clone(),
        }
    }

    /// Verifier polling this executor's backend
    #[must_use]
    pub fn health(&self) -> &HealthVerifier {
        &self.health
    }

    /// Run `action` under the playbook's timeout.
    #[tracing::instrument(skip(self, ctx), fields(classification = %ctx.playbook.classification))]
    pub async fn execute(&self, action: RecoveryAction, ctx: &ActionContext<'_>) -> ActionOutcome {
        let started = Instant::now();
        let timeout = ctx.playbook.timeout;

        let outcome = match action {
            // Timeout applies per attempt inside the retry loop.
            RecoveryAction::RetryJob => self.retry_job(ctx).await,
            _ => match tokio::time::timeout(timeout, self.dispatch(action, ctx)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(action = %action, remote = e.is_remote(), error = %e, "Action call failed");
                    ActionOutcome::failed(format!("{action} failed: {e}"))
                }
                Err(_) => ActionOutcome::failed(format!(
                    "{action} timed out after {}s",
                    timeout.as_secs_f64()
                )),
            },
        };

        info!(
            action = %action,
            success = outcome.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            message = %outcome.message,
            "Action finished"
        );
        outcome
    }

    async fn dispatch(&self, action: RecoveryAction, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        match action {
            RecoveryAction::RetryJob => Ok(self.retry_job(ctx).await),
            RecoveryAction::RestartResource => self.restart_resource(ctx).await,
            RecoveryAction::ScaleResource => self.scale_resource(ctx).await,
            RecoveryAction::ReinstallDependency => self.reinstall_dependency(ctx).await,
            RecoveryAction::RollbackConfiguration => self.rollback_configuration(ctx).await,
            RecoveryAction::NoAction => Ok(ActionOutcome::failed(
                "No automatic recovery action configured; manual intervention required",
            )),
        }
    }

    // ── retry_job ──────────────────────────────────────────────────────

    async fn retry_job(&self, ctx: &ActionContext<'_>) -> ActionOutcome {
        let Some(job_id) = ctx.metadata.job_id.as_deref() else {
            return ActionOutcome::failed("No job_id available for retry");
        };

        let pb = ctx.playbook;
        let attempts = pb.max_retries.max(1);
        let policy = pb.backoff_policy();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                info!(job_id, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(pb.timeout, self.run_job_once(job_id, pb.timeout)).await {
                Ok(Ok((run_id, report))) if report.is_healthy() => {
                    return ActionOutcome::succeeded(format!(
                        "Job {job_id} re-run {run_id} succeeded on attempt {attempt}/{attempts}"
                    ))
                    .with("new_run_id", json!(run_id))
                    .with("attempts", json!(attempt));
                }
                Ok(Ok((_, report))) => last_error = report.message,
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("attempt timed out after {}s", pb.timeout.as_secs_f64());
                }
            }
            warn!(job_id, attempt, attempts, error = %last_error, "Job retry attempt failed");
        }

        ActionOutcome::failed(format!(
            "Job {job_id} failed after {attempts} attempt(s): {last_error}"
        ))
        .with("attempts", json!(attempts))
    }

    /// Trigger a run and wait for it to reach a terminal state
    async fn run_job_once(&self, job_id: &str, timeout: Duration) -> Result<(String, HealthReport)> {
        let run_id = self.control.retry_job(job_id).await?;
        let report = self.health.wait_until_terminal(&run_id, timeout).await;
        Ok((run_id, report))
    }

    // ── restart_resource ───────────────────────────────────────────────

    async fn restart_resource(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(resource_id) = ctx.metadata.resource_id.as_deref() else {
            return Ok(ActionOutcome::failed("No resource_id available for restart"));
        };

        let before = self.control.get_resource_state(resource_id).await?;
        let already_starting = before.lifecycle.is_starting();
        if already_starting {
            info!(resource_id, state = ?before.lifecycle, "Resource already starting, waiting");
        } else {
            self.control.restart_resource(resource_id).await?;
        }

        let report = self
            .health
            .wait_for_resource(resource_id, ctx.playbook.timeout)
            .await;
        let outcome = if report.is_healthy() {
            ActionOutcome::succeeded(format!("Resource {resource_id} restarted and running"))
        } else {
            ActionOutcome::failed(format!(
                "Resource {resource_id} did not come back: {}",
                report.message
            ))
        };
        Ok(outcome
            .with("resource_id", json!(resource_id))
            .with("previous_state", json!(before.lifecycle))
            .with("waited_only", json!(already_starting)))
    }

    // ── scale_resource ─────────────────────────────────────────────────

    async fn scale_resource(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(resource_id) = ctx.metadata.resource_id.as_deref() else {
            return Ok(ActionOutcome::failed("No resource_id available for scaling"));
        };

        let config = self.control.get_resource_config(resource_id).await?;
        let current = config.current_workers();
        let ceiling = config
            .autoscale
            .map_or(self.scaling.max_workers, |a| a.max_workers);
        let target = scale_target(current, self.scaling.scale_up_percent, ceiling);

        if target <= current {
            return Ok(ActionOutcome::failed(format!(
                "Resource {resource_id} already at max capacity ({current} workers)"
            )));
        }

        self.control.scale_resource(resource_id, target).await?;
        Ok(ActionOutcome::succeeded(format!(
            "Scaled resource {resource_id} from {current} to {target} workers"
        ))
        .with("resource_id", json!(resource_id))
        .with("previous_workers", json!(current))
        .with("target_workers", json!(target)))
    }

    // ── reinstall_dependency ───────────────────────────────────────────

    async fn reinstall_dependency(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(resource_id) = ctx.metadata.resource_id.as_deref() else {
            return Ok(ActionOutcome::failed(
                "No resource_id available for dependency install",
            ));
        };
        let Some(spec) = library_spec(ctx.metadata) else {
            return Ok(ActionOutcome::failed(
                "No library specification found in metadata or error message",
            ));
        };

        let (name, failed_version) = parse_library_spec(&spec);
        let Some(candidates) = self.fallback_versions.get(&name.to_lowercase()) else {
            return Ok(ActionOutcome::failed(format!(
                "No fallback versions configured for {name}"
            )));
        };

        let mut errors = Vec::new();
        for version in candidates {
            if failed_version.as_deref() == Some(version.as_str()) {
                info!(library = %name, version = %version, "Skipping version that just failed");
                continue;
            }
            match self
                .control
                .install_dependency(resource_id, &name, version)
                .await
            {
                Ok(()) => {
                    return Ok(ActionOutcome::succeeded(format!(
                        "Installed {name}=={version} on {resource_id}"
                    ))
                    .with("library_name", json!(name))
                    .with("installed_version", json!(version)));
                }
                Err(e) => {
                    warn!(library = %name, version = %version, error = %e, "Fallback version failed");
                    errors.push(format!("{version}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            return Ok(ActionOutcome::failed(format!(
                "No alternative versions of {name} to try"
            )));
        }
        Ok(ActionOutcome::failed(format!(
            "All fallback versions failed for {name} ({})",
            errors.join("; ")
        ))
        .with("library_name", json!(name)))
    }

    // ── rollback_configuration ─────────────────────────────────────────

    async fn rollback_configuration(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(resource_id) = ctx.metadata.resource_id.as_deref() else {
            return Ok(ActionOutcome::failed("No resource_id available for rollback"));
        };
        let Some(snapshot) = ctx.rollback_to else {
            return Ok(ActionOutcome::failed(format!(
                "No configuration snapshot stored for {resource_id}"
            )));
        };

        self.control
            .apply_resource_config(resource_id, &snapshot.config)
            .await?;
        Ok(ActionOutcome::succeeded(format!(
            "Rolled back {resource_id} to configuration captured at {}",
            snapshot.captured_at.to_rfc3339()
        ))
        .with("resource_id", json!(resource_id))
        .with("snapshot_id", json!(snapshot.snapshot_id)))
    }
}

/// Worker count after scaling up `current` by `percent`, at least one more
/// worker, capped at `ceiling`.
#[must_use]
pub fn scale_target(current: u32, percent: u32, ceiling: u32) -> u32 {
    let grown = u64::from(current) * u64::from(100 + percent) / 100;
    let grown = u32::try_from(grown).unwrap_or(u32::MAX);
    grown.max(current.saturating_add(1)).min(ceiling)
}

/// Library spec from explicit metadata or the platform error message
fn library_spec(metadata: &ResourceMetadata) -> Option<String> {
    if let Some(lib) = metadata.library.as_deref().filter(|l| !l.trim().is_empty()) {
        return Some(lib.trim().to_string());
    }
    let message = metadata.error_message.as_deref()?;
    REQUIREMENT_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Split `pandas==2.1.0` into name and version. Specs without an operator
/// have no version.
#[must_use]
pub fn parse_library_spec(spec: &str) -> (String, Option<String>) {
    for op in VERSION_OPERATORS {
        if let Some((name, version)) = spec.split_once(op) {
            let version = version.trim();
            return (
                name.trim().to_string(),
                (!version.is_empty()).then(|| version.to_string()),
            );
        }
    }
    (spec.trim().to_string(), None)
}
