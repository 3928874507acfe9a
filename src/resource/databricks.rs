//! Databricks REST implementation of [`ResourceControl`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    ResourceConfig, ResourceControl, ResourceLifecycle, ResourceState, RunLifecycle, RunResult,
    RunState,
};
use crate::config::ResourceApiConfig;
use crate::{Error, Result};

/// Databricks workspace client (Jobs 2.1, Clusters 2.0, Libraries 2.0).
#[derive(Debug, Clone)]
pub struct DatabricksClient {
    http: Client,
    host: String,
    token: String,
}

impl DatabricksClient {
    /// Create a client from resource API configuration
    pub fn new(config: &ResourceApiConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(Error::Config(
                "resource_api.host and resource_api.token must be set".to_string(),
            ));
        }
        Self::with_timeout(&config.host, &config.token, config.request_timeout)
    }

    /// Create a client for `host` with an explicit per-request timeout
    pub fn with_timeout(host: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.host)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| transport_error(what, &e))?;
        Self::decode(response, what).await
    }

    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Resource {
                status: status.as_u16(),
                message: format!("{what} failed: {body}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| transport_error(what, &e))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let what = format!("GET {path}");
        self.send(self.http.get(self.url(path)).query(query), &what)
            .await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let what = format!("POST {path}");
        self.send(self.http.post(self.url(path)).json(body), &what)
            .await
    }

    async fn cluster(&self, cluster_id: &str) -> Result<ClusterInfo> {
        self.get("/api/2.0/clusters/get", &[("cluster_id", cluster_id)])
            .await
    }
}

fn transport_error(what: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ResourceTimeout(format!("{what}: {e}"))
    } else {
        Error::Transport(format!("{what}: {e}"))
    }
}

/// Job ids are integers on the wire; pass anything else through unchanged
fn job_id_value(job_id: &str) -> Value {
    job_id
        .trim()
        .parse::<i64>()
        .map_or_else(|_| json!(job_id), |n| json!(n))
}

// ── Wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunNowResponse {
    run_id: Value,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    state: RunStateWire,
}

#[derive(Debug, Deserialize)]
struct RunStateWire {
    life_cycle_state: RunLifecycle,
    #[serde(default)]
    result_state: Option<RunResult>,
    #[serde(default)]
    state_message: String,
}

#[derive(Debug, Deserialize)]
struct TerminationReason {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    state: ResourceLifecycle,
    #[serde(default)]
    state_message: String,
    #[serde(default)]
    termination_reason: Option<TerminationReason>,
    #[serde(default)]
    executors: Vec<Value>,
    #[serde(flatten)]
    config: ResourceConfig,
}

impl ClusterInfo {
    fn into_state(self) -> ResourceState {
        let outstanding = !matches!(
            self.state,
            ResourceLifecycle::Running | ResourceLifecycle::Resizing
        );
        ResourceState {
            lifecycle: self.state,
            message: self.state_message,
            termination_reason: self
                .termination_reason
                .filter(|_| outstanding)
                .map(|r| r.code.unwrap_or_else(|| "UNKNOWN".to_string())),
            configured_workers: Some(self.config.current_workers()),
            live_workers: u32::try_from(self.executors.len()).ok(),
        }
    }
}

#[async_trait]
impl ResourceControl for DatabricksClient {
    #[tracing::instrument(skip(self))]
    async fn retry_job(&self, job_id: &str) -> Result<String> {
        let response: Value = self
            .post("/api/2.1/jobs/run-now", &json!({ "job_id": job_id_value(job_id) }))
            .await?;
        let parsed: RunNowResponse = serde_json::from_value(response)?;
        let run_id = match parsed.run_id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        info!(job_id, run_id = %run_id, "Triggered job run");
        Ok(run_id)
    }

    #[tracing::instrument(skip(self))]
    async fn restart_resource(&self, resource_id: &str) -> Result<()> {
        let info = self.cluster(resource_id).await?;
        let path = match info.state {
            ResourceLifecycle::Terminated | ResourceLifecycle::Error => "/api/2.0/clusters/start",
            _ => "/api/2.0/clusters/restart",
        };
        debug!(state = ?info.state, path, "Restarting cluster");
        self.post(path, &json!({ "cluster_id": resource_id }))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn scale_resource(&self, resource_id: &str, target_workers: u32) -> Result<()> {
        let info = self.cluster(resource_id).await?;
        let body = match info.config.autoscale {
            Some(bounds) => json!({
                "cluster_id": resource_id,
                "autoscale": {
                    "min_workers": target_workers.min(bounds.max_workers),
                    "max_workers": bounds.max_workers.max(target_workers),
                }
            }),
            None => json!({ "cluster_id": resource_id, "num_workers": target_workers }),
        };
        self.post("/api/2.0/clusters/resize", &body).await?;
        Ok(())
    }

    async fn get_resource_config(&self, resource_id: &str) -> Result<ResourceConfig> {
        Ok(self.cluster(resource_id).await?.config)
    }

    #[tracing::instrument(skip(self, config))]
    async fn apply_resource_config(
        &self,
        resource_id: &str,
        config: &ResourceConfig,
    ) -> Result<()> {
        let mut body = serde_json::to_value(config)?;
        if let Value::Object(map) = &mut body {
            map.insert("cluster_id".to_string(), json!(resource_id));
        }
        self.post("/api/2.0/clusters/edit", &body).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn install_dependency(&self, resource_id: &str, name: &str, version: &str) -> Result<()> {
        let package = if version.is_empty() {
            name.to_string()
        } else {
            format!("{name}=={version}")
        };
        self.post(
            "/api/2.0/libraries/install",
            &json!({
                "cluster_id": resource_id,
                "libraries": [{ "pypi": { "package": package } }],
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_resource_state(&self, resource_id: &str) -> Result<ResourceState> {
        Ok(self.cluster(resource_id).await?.into_state())
    }

    async fn get_run_state(&self, run_id: &str) -> Result<RunState> {
        let info: RunInfo = self
            .get("/api/2.1/jobs/runs/get", &[("run_id", run_id)])
            .await?;
        Ok(RunState {
            lifecycle: info.state.life_cycle_state,
            result: info.state.result_state,
            message: info.state.state_message,
        })
    }
}
