//! Azure Data Factory implementation of [`ResourceControl`]
//!
//! ADF only has pipelines and pipeline runs. `job_id` is the pipeline name;
//! compute operations are reported as unsupported.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use super::{ResourceConfig, ResourceControl, ResourceState, RunLifecycle, RunResult, RunState};
use crate::config::AdfConfig;
use crate::{Error, Result};

const API_VERSION: &str = "2018-06-01";

/// Data factory client (ARM REST API, optional Logic App retry webhook).
#[derive(Debug, Clone)]
pub struct AdfClient {
    http: Client,
    webhook: Option<Url>,
    factory: Url,
    token: String,
}

impl AdfClient {
    /// Create a client from ADF configuration
    pub fn new(config: &AdfConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(Error::Config(
                "adf.subscription_id, adf.resource_group, adf.factory_name and adf.token must be set"
                    .to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        let webhook = match config.webhook_url.trim() {
            "" => None,
            url => Some(parse_url(url)?),
        };
        let mut factory = parse_url(&config.management_url)?;
        factory
            .path_segments_mut()
            .map_err(|()| Error::Config(format!("Invalid adf.management_url: {}", config.management_url)))?
            .pop_if_empty()
            .extend([
                "subscriptions",
                config.subscription_id.trim(),
                "resourceGroups",
                config.resource_group.trim(),
                "providers",
                "Microsoft.DataFactory",
                "factories",
                config.factory_name.trim(),
            ]);

        Ok(Self {
            http,
            webhook,
            factory,
            token: config.token.clone(),
        })
    }

    /// `<factory>/<segments...>?api-version=...`
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.factory.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        url
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await.map_err(|e| transport_error(what, &e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Resource {
                status: status.as_u16(),
                message: format!("{what} failed: {body}"),
            });
        }
        response.json().await.map_err(|e| transport_error(what, &e))
    }

    fn unsupported(operation: &str) -> Error {
        Error::UnsupportedAction(format!("{operation} is not available for Data Factory pipelines"))
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url.trim()).map_err(|e| Error::Config(format!("Invalid URL '{url}': {e}")))
}

fn transport_error(what: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ResourceTimeout(format!("{what}: {e}"))
    } else {
        Error::Transport(format!("{what}: {e}"))
    }
}

// ── Wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    #[serde(alias = "run_id")]
    #[serde(rename = "runId")]
    run_id: Value,
}

#[derive(Debug, Deserialize)]
struct PipelineRun {
    status: String,
    #[serde(default)]
    message: String,
}

impl PipelineRun {
    fn into_state(self) -> RunState {
        let (lifecycle, result) = match self.status.as_str() {
            "Queued" => (RunLifecycle::Pending, None),
            "InProgress" => (RunLifecycle::Running, None),
            "Canceling" => (RunLifecycle::Terminating, None),
            "Succeeded" => (RunLifecycle::Terminated, Some(RunResult::Success)),
            "Failed" => (RunLifecycle::Terminated, Some(RunResult::Failed)),
            "Cancelled" => (RunLifecycle::Terminated, Some(RunResult::Canceled)),
            _ => (RunLifecycle::Unknown, None),
        };
        RunState {
            lifecycle,
            result,
            message: self.message,
        }
    }
}

fn run_id_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl ResourceControl for AdfClient {
    #[tracing::instrument(skip(self))]
    async fn retry_job(&self, job_id: &str) -> Result<String> {
        let parsed: CreateRunResponse = match &self.webhook {
            Some(hook) => {
                self.send(
                    self.http.post(hook.clone()).json(&json!({ "pipeline_name": job_id })),
                    "POST retry webhook",
                )
                .await?
            }
            None => {
                let url = self.url(&["pipelines", job_id, "createRun"]);
                self.send(
                    self.http.post(url).bearer_auth(&self.token).json(&json!({})),
                    "POST createRun",
                )
                .await?
            }
        };
        let run_id = run_id_string(parsed.run_id);
        info!(pipeline = job_id, run_id = %run_id, "Triggered pipeline run");
        Ok(run_id)
    }

    async fn restart_resource(&self, _resource_id: &str) -> Result<()> {
        Err(Self::unsupported("restart_resource"))
    }

    async fn scale_resource(&self, _resource_id: &str, _target_workers: u32) -> Result<()> {
        Err(Self::unsupported("scale_resource"))
    }

    async fn get_resource_config(&self, _resource_id: &str) -> Result<ResourceConfig> {
        Err(Self::unsupported("get_resource_config"))
    }

    async fn apply_resource_config(&self, _resource_id: &str, _config: &ResourceConfig) -> Result<()> {
        Err(Self::unsupported("apply_resource_config"))
    }

    async fn install_dependency(&self, _resource_id: &str, _name: &str, _version: &str) -> Result<()> {
        Err(Self::unsupported("install_dependency"))
    }

    async fn get_resource_state(&self, _resource_id: &str) -> Result<ResourceState> {
        Err(Self::unsupported("get_resource_state"))
    }

    async fn get_run_state(&self, run_id: &str) -> Result<RunState> {
        let url = self.url(&["pipelineruns", run_id]);
        let run: PipelineRun = self
            .send(self.http.get(url).bearer_auth(&self.token), "GET pipelineruns")
            .await?;
        Ok(run.into_state())
    }
}
