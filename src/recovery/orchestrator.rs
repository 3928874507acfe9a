//! Per-request recovery state machine.
//!
//! ```text
//! lookup ─▶ circuit check ─▶ snapshot ─▶ primary ─▶ health ─┬▶ success ─▶ chain?
//!   │            │                                           └▶ fallback ─▶ health
//!   └ none       └ blocked                          record outcome on the breaker
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::executor::{ActionContext, ActionExecutor, ActionOutcome};
use super::health::CheckKind;
use super::result::{ActionAttempt, ActionStage, ExecutionResult, RecoveryOutcome};
use super::snapshot::{RecoverySnapshot, SnapshotStore};
use crate::audit::{AuditEvent, AuditKind, AuditSink, TracingAuditSink};
use crate::config::{Config, OrchestratorConfig};
use crate::failsafe::{
    BreakerSettings, CircuitBreaker, CircuitBreakerRegistry, CircuitStatus, circuit_key,
};
use crate::playbook::{FallbackTarget, Playbook, PlaybookRegistry, RecoveryAction};
use crate::resource::{ResourceControl, ResourceMetadata};

/// Normalized failure record handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// Failure classification
    pub classification: String,
    /// Identifiers of the failed pipeline
    #[serde(default)]
    pub metadata: ResourceMetadata,
}

impl RecoveryRequest {
    /// Request for `classification` with `metadata`
    #[must_use]
    pub fn new(classification: impl Into<String>, metadata: ResourceMetadata) -> Self {
        Self {
            classification: classification.into(),
            metadata,
        }
    }
}

/// Why an in-flight call stopped early
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    DeadlineExceeded(Duration),
}

impl Interrupt {
    fn message(self) -> String {
        match self {
            Self::Cancelled => "Recovery cancelled by caller".to_string(),
            Self::DeadlineExceeded(limit) => {
                format!("Recovery exceeded the {}s request deadline", limit.as_secs())
            }
        }
    }
}

/// Records the attempt's outcome on the breaker exactly once. Dropped
/// without [`AttemptGuard::complete`] means the attempt was aborted, which
/// counts as a failure.
struct AttemptGuard {
    breaker: Option<Arc<CircuitBreaker>>,
    armed: bool,
}

impl AttemptGuard {
    fn new(breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    /// `action_failed` covers attempts whose reported outcome does not count
    /// on its own but where a remote action still ran and failed.
    fn complete(mut self, outcome: RecoveryOutcome, action_failed: bool) {
        self.armed = false;
        let Some(breaker) = &self.breaker else {
            return;
        };
        if outcome == RecoveryOutcome::Recovered {
            breaker.record_success();
        } else if outcome.counts_as_failure() || action_failed {
            breaker.record_failure();
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(breaker) = &self.breaker {
                warn!(key = breaker.name(), "Recovery attempt aborted, counting as failure");
                breaker.record_failure();
            }
        }
    }
}

/// What one primary (+ fallback) attempt produced
struct AttemptReport {
    outcome: RecoveryOutcome,
    message: String,
    actions: Vec<ActionAttempt>,
    health_check_passed: bool,
    fallback_used: bool,
    action_failed: bool,
    snapshot: Option<RecoverySnapshot>,
    metadata: serde_json::Map<String, Value>,
}

/// Result of running one action and, if required, verifying it
struct StageResult {
    attempt: ActionAttempt,
    outcome: ActionOutcome,
    verified: bool,
}

/// A Resource Control backend and the executor bound to it
struct Backend {
    control: Arc<dyn ResourceControl>,
    executor: ActionExecutor,
}

/// Sequences circuit check, actions, verification, fallback, and chaining.
pub struct Orchestrator {
    playbooks: Arc<PlaybookRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    backend: Backend,
    platforms: HashMap<String, Backend>,
    snapshots: SnapshotStore,
    audit: Arc<dyn AuditSink>,
    settings: OrchestratorConfig,
    idle_eviction: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("playbooks", &self.playbooks.len())
            .field("breakers", &self.breakers.len())
            .field("platforms", &self.platforms.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the engine from configuration, a loaded playbook registry, and the
    /// default Resource Control backend. Platforms registered with
    /// [`Orchestrator::with_platform`] override it for their playbooks.
    #[must_use]
    pub fn new(
        config: &Config,
        playbooks: PlaybookRegistry,
        control: Arc<dyn ResourceControl>,
    ) -> Self {
        let executor = ActionExecutor::new(
            Arc::clone(&control),
            config.health.poll_interval,
            config.scaling.clone(),
            &config.dependencies,
        );
        Self {
            playbooks: Arc::new(playbooks),
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerSettings::from(
                &config.circuit_breaker,
            ))),
            backend: Backend { control, executor },
            platforms: HashMap::new(),
            snapshots: SnapshotStore::new(),
            audit: Arc::new(TracingAuditSink),
            settings: config.orchestrator.clone(),
            idle_eviction: config.circuit_breaker.idle_eviction,
        }
    }

    /// Route playbooks whose `platform` matches (case-insensitive) to
    /// `control` instead of the default backend.
    #[must_use]
    pub fn with_platform(mut self, platform: &str, control: Arc<dyn ResourceControl>) -> Self {
        let executor = self.backend.executor.with_control(Arc::clone(&control));
        self.platforms
            .insert(platform.to_lowercase(), Backend { control, executor });
        self
    }

    /// Replace the audit sink
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Playbook registry
    #[must_use]
    pub fn playbooks(&self) -> &PlaybookRegistry {
        &self.playbooks
    }

    /// Circuit breaker registry
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Stored configuration snapshots
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Orchestrate recovery for one failure.
    pub async fn recover(&self, request: &RecoveryRequest) -> ExecutionResult {
        self.recover_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Orchestrate recovery, aborting when `cancel` fires or the configured
    /// request deadline passes. An aborted attempt still counts as a breaker
    /// failure.
    pub async fn recover_with_cancel(
        &self,
        request: &RecoveryRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let deadline = Instant::now() + self.settings.request_timeout;
        self.orchestrate(
            &request.classification,
            &request.metadata,
            self.settings.max_chain_depth,
            &cancel,
            deadline,
        )
        .await
    }

    fn orchestrate<'a>(
        &'a self,
        classification: &'a str,
        metadata: &'a ResourceMetadata,
        depth_remaining: u32,
        cancel: &'a CancellationToken,
        deadline: Instant,
    ) -> BoxFuture<'a, ExecutionResult> {
        let mut result = ExecutionResult::new(classification);
        let span = info_span!(
            "recover",
            classification,
            execution_id = %result.execution_id,
            resource = metadata.breaker_resource()
        );

        Box::pin(
            async move {
                let started = Instant::now();

                // 1. Playbook lookup. Absence is a clean no-op.
                let Some(playbook) = self.playbooks.lookup(classification) else {
                    info!("No playbook configured");
                    return result.finish(
                        RecoveryOutcome::NoPlaybook,
                        format!("No remediation configured for classification '{classification}'"),
                    );
                };

                let key = circuit_key(classification, metadata.breaker_resource());

                // 2. Optional per-key serialization, held for this attempt only.
                let lock = if self.settings.serialize_per_key {
                    let acquired = tokio::select! {
                        biased;
                        reason = interrupted(cancel, deadline, self.settings.request_timeout) => Err(reason),
                        guard = self.breakers.lock_key(&key) => Ok(guard),
                    };
                    match acquired {
                        Ok(guard) => Some(guard),
                        Err(reason) => return cancelled(result, reason, None, started),
                    }
                } else {
                    None
                };

                // 3. Circuit check. Blocking never runs an action or records an outcome.
                let breaker = playbook.circuit_breaker.enabled.then(|| {
                    self.breakers.get_or_create(
                        &key,
                        Some(playbook.circuit_breaker.failure_threshold),
                        Some(playbook.circuit_breaker.open_timeout),
                        None,
                    )
                });
                if let Some(breaker) = &breaker {
                    let admission = breaker.can_execute();
                    if !admission.allowed {
                        info!(key = %key, reason = %admission.reason, "Recovery blocked by circuit breaker");
                        self.emit(
                            &result,
                            AuditKind::CircuitBlocked {
                                circuit_key: key.clone(),
                                reason: admission.reason.clone(),
                                retry_after_secs: admission.retry_after.map(|d| d.as_secs()),
                            },
                        );
                        result.circuit_breaker = Some(breaker.status());
                        result.elapsed_ms = elapsed_ms(started);
                        return result.finish(
                            RecoveryOutcome::CircuitOpen,
                            format!("Recovery blocked for '{key}': {}", admission.reason),
                        );
                    }
                    debug!(key = %key, reason = %admission.reason, "Circuit admitted attempt");
                }

                // 4. Snapshot, actions, verification, fallback.
                let guard = AttemptGuard::new(breaker.clone());
                let finished = tokio::select! {
                    biased;
                    reason = interrupted(cancel, deadline, self.settings.request_timeout) => Err(reason),
                    report = self.attempt(&result, playbook, metadata) => Ok(report),
                };
                let report = match finished {
                    Ok(report) => report,
                    Err(reason) => {
                        drop(guard);
                        drop(lock);
                        return cancelled(result, reason, breaker.map(|b| b.status()), started);
                    }
                };

                // 5. Record the final outcome, then release the key for others.
                guard.complete(report.outcome, report.action_failed);
                drop(lock);

                result.actions = report.actions;
                result.health_check_passed = report.health_check_passed;
                result.fallback_used = report.fallback_used;
                result.snapshot = report.snapshot;
                result.metadata = report.metadata;
                result.circuit_breaker = breaker.as_ref().map(|b| b.status());
                let mut result = result.finish(report.outcome, report.message);

                // 6. Chain after success.
                if result.success {
                    if let Some(next) = playbook.chain.as_deref() {
                        result = self
                            .run_chain(result, next, metadata, depth_remaining, cancel, deadline)
                            .await;
                    }
                }

                result.elapsed_ms = elapsed_ms(started);
                info!(
                    success = result.success,
                    outcome = ?result.outcome,
                    elapsed_ms = result.elapsed_ms,
                    "Recovery finished"
                );
                result
            }
            .instrument(span),
        )
    }

    async fn run_chain(
        &self,
        mut result: ExecutionResult,
        next: &str,
        metadata: &ResourceMetadata,
        depth_remaining: u32,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> ExecutionResult {
        if depth_remaining == 0 {
            warn!(chained = next, "Chain depth exhausted, not running chained recovery");
            result.success = false;
            result
                .metadata
                .insert("chain_depth_exhausted".to_string(), json!(true));
            result.message = format!(
                "{}; chained recovery '{next}' not run: chain depth exhausted",
                result.message
            );
            return result;
        }

        self.emit(
            &result,
            AuditKind::ChainTriggered {
                chained: next.to_string(),
                depth_remaining: depth_remaining - 1,
            },
        );
        info!(chained = next, "Triggering chained recovery");

        let chained = self
            .orchestrate(next, metadata, depth_remaining - 1, cancel, deadline)
            .await;
        result.chain_triggered = true;
        if !chained.success {
            result.success = false;
            result.message = format!(
                "{}; chained recovery '{next}' failed: {}",
                result.message, chained.message
            );
        } else {
            result.message = format!("{}; chained recovery '{next}' succeeded", result.message);
        }
        result.chain = Some(Box::new(chained));
        result
    }

    async fn attempt(
        &self,
        result: &ExecutionResult,
        playbook: &Playbook,
        metadata: &ResourceMetadata,
    ) -> AttemptReport {
        let resource_id = metadata.resource_id.as_deref();

        // Rollback reads what earlier calls captured, so look it up first.
        let rollback_to = match (playbook.action, resource_id) {
            (RecoveryAction::RollbackConfiguration, Some(id)) => self.snapshots.latest(id),
            _ => None,
        };

        let snapshot = match resource_id {
            Some(id)
                if playbook.captures_snapshot()
                    && playbook.action != RecoveryAction::RollbackConfiguration =>
            {
                self.capture_snapshot(playbook, id).await
            }
            _ => None,
        };

        let mut report = AttemptReport {
            outcome: RecoveryOutcome::ActionFailed,
            message: String::new(),
            actions: Vec::new(),
            health_check_passed: false,
            fallback_used: false,
            action_failed: false,
            snapshot,
            metadata: serde_json::Map::new(),
        };

        let ctx = ActionContext {
            metadata,
            playbook,
            rollback_to: rollback_to.as_ref(),
        };
        let primary = self
            .run_stage(result, ActionStage::Primary, playbook.action, &ctx)
            .await;
        report.absorb(&primary);
        if primary.succeeded() {
            report.outcome = RecoveryOutcome::Recovered;
            report.message = primary.outcome.message;
            return report;
        }

        let primary_failure = primary.failure_message();
        let Some(target) = self.playbooks.resolve_fallback(playbook) else {
            report.outcome = primary.failure_outcome();
            report.message = primary_failure;
            return report;
        };

        let configured = playbook.fallback.clone().unwrap_or_default();
        let (action, fallback_playbook) = match target {
            FallbackTarget::Playbook(pb) => (pb.action, pb),
            FallbackTarget::Action(action) => (action, playbook),
            FallbackTarget::Unsupported(name) => {
                warn!(fallback = name, "Fallback is not an implemented action or classification");
                report.outcome = RecoveryOutcome::UnsupportedAction;
                // The primary still ran against the platform and failed.
                report.action_failed = true;
                report.message = format!(
                    "{primary_failure}; fallback '{name}' is not a supported action or configured classification"
                );
                return report;
            }
        };

        self.emit(result, AuditKind::FallbackUsed { target: configured });
        report.fallback_used = true;

        let fb_ctx = ActionContext {
            metadata,
            playbook: fallback_playbook,
            rollback_to: rollback_to.as_ref(),
        };
        let fallback = self
            .run_stage(result, ActionStage::Fallback, action, &fb_ctx)
            .await;
        report.absorb(&fallback);
        if fallback.succeeded() {
            report.outcome = RecoveryOutcome::Recovered;
            report.message = format!(
                "Recovered by fallback {action} after primary failed ({primary_failure}): {}",
                fallback.outcome.message
            );
        } else {
            report.outcome = fallback.failure_outcome();
            report.message = format!(
                "{primary_failure}; fallback {action} also failed: {}",
                fallback.failure_message()
            );
        }
        report
    }

    /// Run one action and verify it when the policy asks for it
    async fn run_stage(
        &self,
        result: &ExecutionResult,
        stage: ActionStage,
        action: RecoveryAction,
        ctx: &ActionContext<'_>,
    ) -> StageResult {
        let started = Instant::now();
        self.emit(result, AuditKind::ActionAttempted { stage, action });

        let backend = self.backend_for(ctx.playbook);
        let outcome = backend.executor.execute(action, ctx).await;

        let (verified, healthy, message) = if !outcome.success {
            (false, None, outcome.message.clone())
        } else if ctx.playbook.verify_health {
            let target = verification_target(ctx.metadata, &outcome);
            let health = backend
                .executor
                .health()
                .verify_until_settled(
                    &target,
                    CheckKind::for_action(action),
                    ctx.playbook.health_check_timeout,
                )
                .await;
            let healthy = health.is_healthy();
            let message = if healthy {
                outcome.message.clone()
            } else {
                format!("{} but health check failed: {}", outcome.message, health.message)
            };
            (healthy, Some(healthy), message)
        } else {
            (true, None, outcome.message.clone())
        };

        let attempt = ActionAttempt {
            stage,
            action,
            success: outcome.success,
            healthy,
            message: message.clone(),
            duration_ms: elapsed_ms(started),
        };

        let kind = if outcome.success && verified {
            AuditKind::ActionSucceeded {
                stage,
                action,
                message,
                duration_ms: attempt.duration_ms,
            }
        } else {
            AuditKind::ActionFailed {
                stage,
                action,
                message,
                duration_ms: attempt.duration_ms,
            }
        };
        self.emit(result, kind);

        StageResult {
            attempt,
            outcome,
            verified,
        }
    }

    fn backend_for(&self, playbook: &Playbook) -> &Backend {
        self.platforms
            .get(&playbook.platform.to_lowercase())
            .unwrap_or(&self.backend)
    }

    async fn capture_snapshot(&self, playbook: &Playbook, resource_id: &str) -> Option<RecoverySnapshot> {
        let control = self.backend_for(playbook).control.as_ref();
        match RecoverySnapshot::capture(control, resource_id, &playbook.classification).await {
            Ok(snapshot) => {
                debug!(resource_id, snapshot_id = %snapshot.snapshot_id, "Captured configuration snapshot");
                self.snapshots.insert(snapshot.clone());
                Some(snapshot)
            }
            Err(e) => {
                warn!(resource_id, error = %e, "Snapshot capture failed, continuing without it");
                None
            }
        }
    }

    fn emit(&self, result: &ExecutionResult, kind: AuditKind) {
        self.audit.emit(AuditEvent::now(
            result.execution_id,
            &result.classification,
            kind,
        ));
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Force the breaker for `classification` + `resource_id` closed.
    /// Returns `false` when no such breaker exists.
    pub fn reset_circuit(&self, classification: &str, resource_id: &str) -> bool {
        let key = circuit_key(classification, resource_id);
        let reset = self.breakers.reset(&key);
        if reset {
            info!(key = %key, "Circuit breaker reset by operator");
        }
        reset
    }

    /// Status of the breaker for `classification` + `resource_id`
    #[must_use]
    pub fn circuit_status(&self, classification: &str, resource_id: &str) -> Option<CircuitStatus> {
        self.breakers
            .status(&circuit_key(classification, resource_id))
    }

    /// Operator-facing summary of one breaker
    #[must_use]
    pub fn circuit_message(&self, classification: &str, resource_id: &str) -> String {
        self.breakers
            .get(&circuit_key(classification, resource_id))
            .map_or_else(
                || format!("Recovery for '{classification}:{resource_id}' has no circuit history"),
                |b| b.status_message(),
            )
    }

    /// Keys of open breakers
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        self.breakers.list_open()
    }

    /// Status of every breaker
    #[must_use]
    pub fn all_circuits(&self) -> Vec<CircuitStatus> {
        self.breakers.all_statuses()
    }

    /// Drop closed breakers idle past the configured horizon
    pub fn evict_idle_circuits(&self) -> usize {
        self.breakers.evict_idle(self.idle_eviction)
    }
}

impl AttemptReport {
    fn absorb(&mut self, stage: &StageResult) {
        self.actions.push(stage.attempt.clone());
        self.health_check_passed = stage.verified && stage.attempt.healthy.is_some();
        for (k, v) in &stage.outcome.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }
}

impl StageResult {
    fn succeeded(&self) -> bool {
        self.outcome.success && self.verified
    }

    fn failure_outcome(&self) -> RecoveryOutcome {
        if self.outcome.success {
            RecoveryOutcome::VerificationFailed
        } else {
            RecoveryOutcome::ActionFailed
        }
    }

    fn failure_message(&self) -> String {
        let kind = if self.outcome.success {
            "verification failed"
        } else {
            "action failed"
        };
        format!(
            "{} {kind}: {}",
            self.attempt.action, self.attempt.message
        )
    }
}

/// Metadata the health check should look at: a run produced by the action
/// replaces the failed one.
fn verification_target(metadata: &ResourceMetadata, outcome: &ActionOutcome) -> ResourceMetadata {
    let mut target = metadata.clone();
    if let Some(run_id) = outcome.metadata.get("new_run_id") {
        target.run_id = Some(match run_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    target
}

async fn interrupted(cancel: &CancellationToken, deadline: Instant, limit: Duration) -> Interrupt {
    tokio::select! {
        () = cancel.cancelled() => Interrupt::Cancelled,
        () = tokio::time::sleep_until(deadline) => Interrupt::DeadlineExceeded(limit),
    }
}

fn cancelled(
    mut result: ExecutionResult,
    reason: Interrupt,
    status: Option<CircuitStatus>,
    started: Instant,
) -> ExecutionResult {
    warn!(reason = %reason.message(), "Recovery interrupted");
    result.circuit_breaker = status;
    result.elapsed_ms = elapsed_ms(started);
    result.finish(RecoveryOutcome::Cancelled, reason.message())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
