//! HTTP admin and ingest routes

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use common::{FakePlatform, fast, fast_config};
use pipeline_recovery::failsafe::BackoffStrategy;
use pipeline_recovery::playbook::{Playbook, PlaybookRegistry, RecoveryAction};
use pipeline_recovery::recovery::Orchestrator;
use pipeline_recovery::server::{AppState, create_router};

async fn spawn_server(platform: &Arc<FakePlatform>) -> String {
    let mut registry = PlaybookRegistry::new();
    registry.register(
        fast(Playbook::new("JobFailed", RecoveryAction::RetryJob))
            .on_platform("databricks")
            .with_retries(1, BackoffStrategy::Fixed)
            .with_circuit_breaker(1, Duration::from_secs(60)),
    );
    registry.register(
        fast(Playbook::new("GatewayTimeout", RecoveryAction::RetryJob)).on_platform("adf"),
    );
    let orchestrator = Orchestrator::new(&fast_config(), registry, platform.clone());
    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        shutdown: CancellationToken::new(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_reports_playbooks_and_circuits() {
    let base = spawn_server(&FakePlatform::new()).await;

    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["playbooks"], 2);
    assert_eq!(body["circuits"], 0);
}

#[tokio::test]
async fn recover_runs_the_playbook() {
    let platform = FakePlatform::new();
    let base = spawn_server(&platform).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/recover"))
        .json(&json!({
            "classification": "JobFailed",
            "metadata": { "job_id": 77 }
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["outcome"], "recovered");
    assert_eq!(platform.count("retry_job:77"), 1);
}

#[tokio::test]
async fn recover_rejects_empty_classification() {
    let base = spawn_server(&FakePlatform::new()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/recover"))
        .json(&json!({ "classification": "  " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn playbooks_filter_by_platform() {
    let base = spawn_server(&FakePlatform::new()).await;

    let body: Value = reqwest::get(format!("{base}/playbooks?platform=adf"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["count"], 1);
    assert_eq!(body["playbooks"][0]["classification"], "GatewayTimeout");
}

#[tokio::test]
async fn circuits_can_be_inspected_and_reset() {
    let platform = FakePlatform::new();
    platform.fail_triggers();
    let base = spawn_server(&platform).await;
    let client = reqwest::Client::new();

    let missing = client
        .get(format!("{base}/circuits/JobFailed/5"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    client
        .post(format!("{base}/recover"))
        .json(&json!({ "classification": "JobFailed", "metadata": { "job_id": "5" } }))
        .send()
        .await
        .unwrap();

    let open: Vec<String> = client
        .get(format!("{base}/circuits/open"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(open, vec!["JobFailed:5".to_string()]);

    let one: Value = client
        .get(format!("{base}/circuits/JobFailed/5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["status"]["state"], "open");

    let reset: Value = client
        .post(format!("{base}/circuits/JobFailed/5/reset"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["reset"], true);
    assert_eq!(reset["status"]["state"], "closed");

    let all: Value = client
        .get(format!("{base}/circuits"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().map(Vec::len), Some(1));
}
