//! End-to-end orchestration against a scripted platform

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{FakePlatform, fast, fast_config};
use pipeline_recovery::audit::MemoryAuditSink;
use pipeline_recovery::config::Config;
use pipeline_recovery::failsafe::{BackoffStrategy, CircuitState};
use pipeline_recovery::playbook::{Playbook, PlaybookRegistry, RecoveryAction};
use pipeline_recovery::recovery::{ActionStage, Orchestrator, RecoveryOutcome, RecoveryRequest};
use pipeline_recovery::resource::{ResourceConfig, ResourceMetadata, RunResult};

fn engine(
    config: &Config,
    playbooks: Vec<Playbook>,
    platform: &Arc<FakePlatform>,
) -> (Orchestrator, Arc<MemoryAuditSink>) {
    let mut registry = PlaybookRegistry::new();
    for pb in playbooks {
        registry.register(pb);
    }
    let audit = Arc::new(MemoryAuditSink::new());
    let orchestrator =
        Orchestrator::new(config, registry, platform.clone()).with_audit_sink(audit.clone());
    (orchestrator, audit)
}

fn job(job_id: &str) -> ResourceMetadata {
    ResourceMetadata::for_job(job_id)
}

fn retry(classification: &str, attempts: u32) -> Playbook {
    fast(Playbook::new(classification, RecoveryAction::RetryJob))
        .with_retries(attempts, BackoffStrategy::Exponential)
}

// ── Lookup ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_classification_is_a_no_op() {
    let platform = FakePlatform::new();
    let (orchestrator, audit) = engine(&fast_config(), vec![], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("SomethingNew", job("1")))
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::NoPlaybook);
    assert_eq!(
        result.message,
        "No remediation configured for classification 'SomethingNew'"
    );
    assert!(platform.calls().is_empty());
    assert!(orchestrator.breakers().is_empty());
    assert!(audit.events().is_empty());
}

// ── Primary action ─────────────────────────────────────────────────────

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let platform = FakePlatform::new();
    platform.script_runs([RunResult::Failed, RunResult::Success]);
    let (orchestrator, audit) = engine(&fast_config(), vec![retry("JobFailed", 3)], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("JobFailed", job("42")))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.outcome, RecoveryOutcome::Recovered);
    assert!(result.health_check_passed);
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.metadata.get("attempts"), Some(&json!(2)));
    assert_eq!(platform.count("retry_job"), 2);
    assert_eq!(audit.names(), vec!["action_attempted", "action_succeeded"]);

    let status = orchestrator.circuit_status("JobFailed", "42").unwrap();
    assert_eq!(status.total_successes, 1);
    assert_eq!(status.total_failures, 0);
}

#[tokio::test]
async fn failed_verification_is_reported_separately() {
    let platform = FakePlatform::new();
    // The re-run itself succeeds; the follow-up health check sees a failure.
    platform.script_runs([RunResult::Success, RunResult::Failed]);
    let (orchestrator, _) = engine(&fast_config(), vec![retry("JobFailed", 1)], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("JobFailed", job("42")))
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::VerificationFailed);
    assert!(!result.health_check_passed);
    assert!(result.actions[0].success);
    assert_eq!(result.actions[0].healthy, Some(false));
    assert!(result.message.contains("health check failed"));

    let status = orchestrator.circuit_status("JobFailed", "42").unwrap();
    assert_eq!(status.failure_count, 1);
}

#[tokio::test]
async fn scale_grows_workers_and_captures_snapshot() {
    let platform = FakePlatform::new();
    let scale = fast(Playbook::new("OutOfMemory", RecoveryAction::ScaleResource));
    let (orchestrator, _) = engine(&fast_config(), vec![scale], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "OutOfMemory",
            ResourceMetadata::for_resource("c-1"),
        ))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(platform.mutations(), vec!["scale_resource:c-1:6"]);
    assert_eq!(result.metadata.get("target_workers"), Some(&json!(6)));
    let snapshot = result.snapshot.expect("snapshot captured");
    assert_eq!(snapshot.config.num_workers, Some(4));
    assert_eq!(orchestrator.snapshots().history("c-1").len(), 1);
}

#[tokio::test]
async fn manual_playbook_never_touches_the_platform() {
    let platform = FakePlatform::new();
    let mut config = fast_config();
    config.playbooks.directories.clear();
    let registry = PlaybookRegistry::from_config(&config.playbooks).unwrap();
    let orchestrator = Orchestrator::new(&config, registry, platform.clone());

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "DatabricksPermissionDenied",
            job("7").with_resource("c-1"),
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::ActionFailed);
    assert!(result.message.contains("manual intervention required"));
    assert!(platform.mutations().is_empty());
    assert!(orchestrator.breakers().is_empty());
}

// ── Circuit breaker ────────────────────────────────────────────────────

#[tokio::test]
async fn open_circuit_blocks_without_calling_the_platform() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("Flaky", 1).with_circuit_breaker(2, Duration::from_secs(60));
    let (orchestrator, audit) = engine(&fast_config(), vec![pb], &platform);
    let request = RecoveryRequest::new("Flaky", job("job-1"));

    for _ in 0..2 {
        let result = orchestrator.recover(&request).await;
        assert_eq!(result.outcome, RecoveryOutcome::ActionFailed);
    }
    assert_eq!(platform.count("retry_job"), 2);
    assert_eq!(orchestrator.open_circuits(), vec!["Flaky:job-1".to_string()]);

    let blocked = orchestrator.recover(&request).await;
    assert!(!blocked.success);
    assert_eq!(blocked.outcome, RecoveryOutcome::CircuitOpen);
    assert!(blocked.actions.is_empty());
    assert!(
        blocked
            .message
            .starts_with("Recovery blocked for 'Flaky:job-1': Circuit is open, retry in"),
        "{}",
        blocked.message
    );
    assert_eq!(
        blocked.circuit_breaker.as_ref().map(|s| s.state),
        Some(CircuitState::Open)
    );
    assert_eq!(platform.count("retry_job"), 2);
    assert_eq!(audit.names().last(), Some(&"circuit_blocked"));
}

#[tokio::test]
async fn half_open_trials_close_the_circuit() {
    let platform = FakePlatform::new();
    platform.script_runs([RunResult::Failed]);
    let pb = retry("Flaky", 1).with_circuit_breaker(1, Duration::from_millis(50));
    let (orchestrator, _) = engine(&fast_config(), vec![pb], &platform);
    let request = RecoveryRequest::new("Flaky", job("job-1"));

    let failed = orchestrator.recover(&request).await;
    assert_eq!(failed.outcome, RecoveryOutcome::ActionFailed);
    assert_eq!(
        orchestrator.circuit_status("Flaky", "job-1").unwrap().state,
        CircuitState::Open
    );

    tokio::time::sleep(Duration::from_millis(80)).await;

    let trial = orchestrator.recover(&request).await;
    assert!(trial.success, "{}", trial.message);
    assert_eq!(
        orchestrator.circuit_status("Flaky", "job-1").unwrap().state,
        CircuitState::HalfOpen
    );

    let second = orchestrator.recover(&request).await;
    assert!(second.success);
    assert_eq!(
        orchestrator.circuit_status("Flaky", "job-1").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn breakers_are_keyed_per_resource() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("Flaky", 1).with_circuit_breaker(1, Duration::from_secs(60));
    let (orchestrator, _) = engine(&fast_config(), vec![pb], &platform);

    orchestrator
        .recover(&RecoveryRequest::new("Flaky", job("a")))
        .await;
    let other = orchestrator
        .recover(&RecoveryRequest::new("Flaky", job("b")))
        .await;

    assert_eq!(other.outcome, RecoveryOutcome::ActionFailed);
    assert_eq!(platform.count("retry_job"), 2);
    assert_eq!(orchestrator.breakers().len(), 2);
}

#[tokio::test]
async fn operator_reset_reopens_recovery() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("Flaky", 1).with_circuit_breaker(1, Duration::from_secs(60));
    let (orchestrator, _) = engine(&fast_config(), vec![pb], &platform);
    let request = RecoveryRequest::new("Flaky", job("job-1"));

    orchestrator.recover(&request).await;
    assert_eq!(
        orchestrator.recover(&request).await.outcome,
        RecoveryOutcome::CircuitOpen
    );

    assert!(orchestrator.reset_circuit("Flaky", "job-1"));
    assert!(!orchestrator.reset_circuit("Flaky", "job-2"));
    assert_eq!(
        orchestrator.recover(&request).await.outcome,
        RecoveryOutcome::ActionFailed
    );
    assert_eq!(platform.count("retry_job"), 2);
}

// ── Fallback ───────────────────────────────────────────────────────────

#[tokio::test]
async fn fallback_action_recovers_after_primary_fails() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("ClusterLost", 1).with_fallback("restart_cluster");
    let (orchestrator, audit) = engine(&fast_config(), vec![pb], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "ClusterLost",
            job("9").with_resource("c-1"),
        ))
        .await;

    assert!(result.success, "{}", result.message);
    assert!(result.fallback_used);
    assert_eq!(result.actions.len(), 2);
    assert_eq!(result.actions_in(ActionStage::Fallback).count(), 1);
    assert_eq!(result.actions[1].action, RecoveryAction::RestartResource);
    assert_eq!(platform.count("restart_resource"), 1);
    assert_eq!(
        audit.names(),
        vec![
            "action_attempted",
            "action_failed",
            "fallback_used",
            "action_attempted",
            "action_succeeded"
        ]
    );
}

#[tokio::test]
async fn fallback_runs_when_primary_fails_verification() {
    let platform = FakePlatform::new();
    // The re-run finishes, then the follow-up check sees it failed.
    platform.script_runs([RunResult::Success, RunResult::Failed]);
    let pb = retry("JobFailed", 1).with_fallback("restart_cluster");
    let (orchestrator, audit) = engine(&fast_config(), vec![pb], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "JobFailed",
            job("42").with_resource("c-1"),
        ))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.outcome, RecoveryOutcome::Recovered);
    assert!(result.fallback_used);
    assert!(result.health_check_passed);
    assert_eq!(result.actions.len(), 2);
    assert!(result.actions[0].success);
    assert_eq!(result.actions[0].healthy, Some(false));
    assert_eq!(result.actions[1].action, RecoveryAction::RestartResource);
    assert_eq!(result.actions[1].healthy, Some(true));
    assert_eq!(
        audit.names(),
        vec![
            "action_attempted",
            "action_failed",
            "fallback_used",
            "action_attempted",
            "action_succeeded"
        ]
    );
    assert_eq!(platform.mutations(), vec!["retry_job:42", "restart_resource:c-1"]);
}

#[tokio::test]
async fn fallback_classification_runs_its_own_action() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let primary = retry("Slow", 1).with_fallback("OutOfMemory");
    let scale = fast(Playbook::new("OutOfMemory", RecoveryAction::ScaleResource));
    let (orchestrator, _) = engine(&fast_config(), vec![primary, scale], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("Slow", job("9").with_resource("c-1")))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.actions[1].action, RecoveryAction::ScaleResource);
    assert_eq!(platform.count("scale_resource:c-1:6"), 1);
}

#[tokio::test]
async fn unsupported_fallback_still_counts_primary_failure() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("ClusterLost", 1).with_fallback("recreate_cluster");
    let (orchestrator, audit) = engine(&fast_config(), vec![pb], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("ClusterLost", job("9")))
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::UnsupportedAction);
    assert!(!result.fallback_used);
    assert!(result.message.contains("recreate_cluster"));
    assert!(!audit.names().contains(&"fallback_used"));

    let status = orchestrator.circuit_status("ClusterLost", "9").unwrap();
    assert_eq!(status.failure_count, 1);
    assert_eq!(status.total_failures, 1);
}

#[tokio::test]
async fn repeated_primary_failures_open_breaker_despite_unsupported_fallback() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let pb = retry("ClusterLost", 1)
        .with_fallback("recreate_cluster")
        .with_circuit_breaker(3, Duration::from_secs(600));
    let (orchestrator, _) = engine(&fast_config(), vec![pb], &platform);
    let request = RecoveryRequest::new("ClusterLost", job("9"));

    for _ in 0..10 {
        orchestrator.recover(&request).await;
    }

    let status = orchestrator.circuit_status("ClusterLost", "9").unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.total_failures, 3);
    assert_eq!(platform.count("retry_job"), 3);
    assert_eq!(
        orchestrator.recover(&request).await.outcome,
        RecoveryOutcome::CircuitOpen
    );
}

// ── Chaining ───────────────────────────────────────────────────────────

fn chained_pair() -> Vec<Playbook> {
    vec![
        fast(Playbook::new("OutOfMemory", RecoveryAction::ScaleResource)).with_chain("JobFailed"),
        retry("JobFailed", 1),
    ]
}

#[tokio::test]
async fn successful_recovery_triggers_chain() {
    let platform = FakePlatform::new();
    let (orchestrator, audit) = engine(&fast_config(), chained_pair(), &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "OutOfMemory",
            job("5").with_resource("c-1"),
        ))
        .await;

    assert!(result.success, "{}", result.message);
    assert!(result.chain_triggered);
    let chained = result.chain.as_ref().unwrap();
    assert_eq!(chained.classification, "JobFailed");
    assert!(chained.success);
    assert_eq!(platform.mutations(), vec!["scale_resource:c-1:6", "retry_job:5"]);
    assert!(audit.names().contains(&"chain_triggered"));
}

#[tokio::test]
async fn failed_chain_fails_the_whole_recovery() {
    let platform = FakePlatform::new();
    platform.script_runs([RunResult::Failed]);
    let (orchestrator, _) = engine(&fast_config(), chained_pair(), &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "OutOfMemory",
            job("5").with_resource("c-1"),
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::Recovered);
    assert!(result.chain_triggered);
    assert!(!result.chain.as_ref().unwrap().success);
    assert!(result.message.contains("chained recovery 'JobFailed' failed"));
}

#[tokio::test]
async fn exhausted_chain_depth_fails_closed() {
    let platform = FakePlatform::new();
    let mut config = fast_config();
    config.orchestrator.max_chain_depth = 0;
    let (orchestrator, _) = engine(&config, chained_pair(), &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "OutOfMemory",
            job("5").with_resource("c-1"),
        ))
        .await;

    assert!(!result.success);
    assert!(!result.chain_triggered);
    assert_eq!(result.metadata.get("chain_depth_exhausted"), Some(&json!(true)));
    assert_eq!(platform.count("retry_job"), 0);
}

#[tokio::test]
async fn chain_is_skipped_when_recovery_fails() {
    let platform = FakePlatform::new();
    platform.set_config(ResourceConfig::autoscaling(2, 2));
    let (orchestrator, audit) = engine(&fast_config(), chained_pair(), &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new(
            "OutOfMemory",
            job("5").with_resource("c-1"),
        ))
        .await;

    assert!(!result.success);
    assert!(result.message.contains("already at max capacity"));
    assert!(!result.chain_triggered);
    assert!(!audit.names().contains(&"chain_triggered"));
}

// ── Rollback and dependencies ──────────────────────────────────────────

#[tokio::test]
async fn rollback_applies_the_latest_snapshot() {
    let platform = FakePlatform::new();
    let playbooks = vec![
        fast(Playbook::new("OutOfMemory", RecoveryAction::ScaleResource)),
        fast(Playbook::new("BadConfig", RecoveryAction::RollbackConfiguration)),
    ];
    let (orchestrator, _) = engine(&fast_config(), playbooks, &platform);
    let meta = ResourceMetadata::for_resource("c-1");

    let missing = orchestrator
        .recover(&RecoveryRequest::new("BadConfig", meta.clone()))
        .await;
    assert_eq!(missing.outcome, RecoveryOutcome::ActionFailed);
    assert!(missing.message.contains("No configuration snapshot stored"));

    orchestrator
        .recover(&RecoveryRequest::new("OutOfMemory", meta.clone()))
        .await;
    let rolled_back = orchestrator
        .recover(&RecoveryRequest::new("BadConfig", meta))
        .await;

    assert!(rolled_back.success, "{}", rolled_back.message);
    let applied = platform.applied_configs();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].num_workers, Some(4));
}

#[tokio::test]
async fn reinstall_skips_failed_and_broken_versions() {
    let platform = FakePlatform::new();
    platform.break_version("2.0.3");
    let pb = fast(Playbook::new("LibraryInstallFailed", RecoveryAction::ReinstallDependency));
    let (orchestrator, _) = engine(&fast_config(), vec![pb], &platform);
    let meta = ResourceMetadata {
        resource_id: Some("c-1".into()),
        error_message: Some("Could not find a version that satisfies the requirement pandas==2.1.0".into()),
        ..ResourceMetadata::default()
    };

    let result = orchestrator
        .recover(&RecoveryRequest::new("LibraryInstallFailed", meta))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(
        platform.mutations(),
        vec![
            "install_dependency:c-1:pandas==2.0.3",
            "install_dependency:c-1:pandas==1.5.3"
        ]
    );
    assert_eq!(result.metadata.get("installed_version"), Some(&json!("1.5.3")));
}

// ── Interruption ───────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_counts_as_failure() {
    let platform = FakePlatform::new();
    platform.slow_triggers(Duration::from_millis(500));
    let (orchestrator, _) = engine(&fast_config(), vec![retry("JobFailed", 1)], &platform);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = orchestrator
        .recover_with_cancel(&RecoveryRequest::new("JobFailed", job("1")), token)
        .await;

    assert!(!result.success);
    assert_eq!(result.outcome, RecoveryOutcome::Cancelled);
    let status = orchestrator.circuit_status("JobFailed", "1").unwrap();
    assert_eq!(status.failure_count, 1);
}

#[tokio::test]
async fn request_deadline_interrupts_recovery() {
    let platform = FakePlatform::new();
    platform.slow_triggers(Duration::from_millis(500));
    let mut config = fast_config();
    config.orchestrator.request_timeout = Duration::from_millis(50);
    let (orchestrator, _) = engine(&config, vec![retry("JobFailed", 1)], &platform);

    let result = orchestrator
        .recover(&RecoveryRequest::new("JobFailed", job("1")))
        .await;

    assert_eq!(result.outcome, RecoveryOutcome::Cancelled);
    assert!(result.message.contains("deadline"));
}

#[tokio::test]
async fn concurrent_attempts_on_one_key_are_serialized() {
    let platform = FakePlatform::new();
    platform.slow_triggers(Duration::from_millis(30));
    let (orchestrator, _) = engine(&fast_config(), vec![retry("JobFailed", 1)], &platform);
    let orchestrator = Arc::new(orchestrator);
    let request = RecoveryRequest::new("JobFailed", job("1"));

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(orchestrator.recover(&request), orchestrator.recover(&request));

    assert!(a.success && b.success);
    assert!(started.elapsed() >= Duration::from_millis(60));
    let status = orchestrator.circuit_status("JobFailed", "1").unwrap();
    assert_eq!(status.total_successes, 2);
}

// ── Platforms ──────────────────────────────────────────────────────────

#[tokio::test]
async fn playbooks_run_against_their_platform_backend() {
    let databricks = FakePlatform::new();
    let adf = FakePlatform::new();
    let pipeline = fast(Playbook::new("GatewayTimeout", RecoveryAction::RetryJob)).on_platform("ADF");
    let (orchestrator, _) = engine(&fast_config(), vec![pipeline, retry("JobFailed", 1)], &databricks);
    let orchestrator = orchestrator.with_platform("adf", adf.clone());

    let result = orchestrator
        .recover(&RecoveryRequest::new("GatewayTimeout", job("copy_sales")))
        .await;
    assert!(result.success, "{}", result.message);
    assert_eq!(adf.mutations(), vec!["retry_job:copy_sales"]);
    assert!(databricks.calls().is_empty());

    let result = orchestrator
        .recover(&RecoveryRequest::new("JobFailed", job("7")))
        .await;
    assert!(result.success, "{}", result.message);
    assert_eq!(databricks.mutations(), vec!["retry_job:7"]);
    assert_eq!(adf.count("retry_job"), 1);
}
