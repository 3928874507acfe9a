//! Shared fixtures: a scripted in-memory platform and fast playbook settings

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pipeline_recovery::config::Config;
use pipeline_recovery::playbook::Playbook;
use pipeline_recovery::resource::{
    ResourceConfig, ResourceControl, ResourceLifecycle, ResourceState, RunResult, RunState,
};
use pipeline_recovery::{Error, Result};

/// Scripted platform. Every call is logged by name; run outcomes are replayed
/// in order, falling back to success once the script runs out.
#[derive(Debug)]
pub struct FakePlatform {
    calls: Mutex<Vec<String>>,
    run_results: Mutex<VecDeque<RunResult>>,
    trigger_fails: Mutex<bool>,
    trigger_delay: Mutex<Option<Duration>>,
    resource_states: Mutex<VecDeque<ResourceState>>,
    steady_state: Mutex<ResourceState>,
    config: Mutex<ResourceConfig>,
    applied: Mutex<Vec<ResourceConfig>>,
    broken_versions: Mutex<HashSet<String>>,
    next_run: Mutex<u64>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            run_results: Mutex::new(VecDeque::new()),
            trigger_fails: Mutex::new(false),
            trigger_delay: Mutex::new(None),
            resource_states: Mutex::new(VecDeque::new()),
            steady_state: Mutex::new(ResourceState::new(ResourceLifecycle::Running)),
            config: Mutex::new(ResourceConfig::fixed(4)),
            applied: Mutex::new(Vec::new()),
            broken_versions: Mutex::new(HashSet::new()),
            next_run: Mutex::new(1000),
        }
    }
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Results of the next job runs, in order
    pub fn script_runs(&self, results: impl IntoIterator<Item = RunResult>) {
        self.run_results.lock().extend(results);
    }

    /// Make `retry_job` itself return an API error
    pub fn fail_triggers(&self) {
        *self.trigger_fails.lock() = true;
    }

    /// Make `retry_job` sleep before answering
    pub fn slow_triggers(&self, delay: Duration) {
        *self.trigger_delay.lock() = Some(delay);
    }

    /// States returned by the next resource polls, then the steady state
    pub fn script_resource(&self, states: impl IntoIterator<Item = ResourceState>) {
        self.resource_states.lock().extend(states);
    }

    /// State returned once the script is exhausted
    pub fn set_steady_state(&self, state: ResourceState) {
        *self.steady_state.lock() = state;
    }

    pub fn set_config(&self, config: ResourceConfig) {
        *self.config.lock() = config;
    }

    pub fn break_version(&self, version: &str) {
        self.broken_versions.lock().insert(version.to_string());
    }

    pub fn applied_configs(&self) -> Vec<ResourceConfig> {
        self.applied.lock().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls that change something on the platform
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("get_"))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(name)).count()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ResourceControl for FakePlatform {
    async fn retry_job(&self, job_id: &str) -> Result<String> {
        self.log(format!("retry_job:{job_id}"));
        let delay = *self.trigger_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.trigger_fails.lock() {
            return Err(Error::Resource {
                status: 500,
                message: "run-now rejected".to_string(),
            });
        }
        let mut next = self.next_run.lock();
        *next += 1;
        Ok(next.to_string())
    }

    async fn restart_resource(&self, resource_id: &str) -> Result<()> {
        self.log(format!("restart_resource:{resource_id}"));
        Ok(())
    }

    async fn scale_resource(&self, resource_id: &str, target_workers: u32) -> Result<()> {
        self.log(format!("scale_resource:{resource_id}:{target_workers}"));
        self.config.lock().num_workers = Some(target_workers);
        Ok(())
    }

    async fn get_resource_config(&self, resource_id: &str) -> Result<ResourceConfig> {
        self.log(format!("get_resource_config:{resource_id}"));
        Ok(self.config.lock().clone())
    }

    async fn apply_resource_config(&self, resource_id: &str, config: &ResourceConfig) -> Result<()> {
        self.log(format!("apply_resource_config:{resource_id}"));
        self.applied.lock().push(config.clone());
        *self.config.lock() = config.clone();
        Ok(())
    }

    async fn install_dependency(&self, resource_id: &str, name: &str, version: &str) -> Result<()> {
        self.log(format!("install_dependency:{resource_id}:{name}=={version}"));
        if self.broken_versions.lock().contains(version) {
            return Err(Error::Resource {
                status: 400,
                message: format!("{name}=={version} failed to install"),
            });
        }
        Ok(())
    }

    async fn get_resource_state(&self, resource_id: &str) -> Result<ResourceState> {
        self.log(format!("get_resource_state:{resource_id}"));
        let scripted = self.resource_states.lock().pop_front();
        Ok(scripted.unwrap_or_else(|| self.steady_state.lock().clone()))
    }

    async fn get_run_state(&self, run_id: &str) -> Result<RunState> {
        self.log(format!("get_run_state:{run_id}"));
        let result = self
            .run_results
            .lock()
            .pop_front()
            .unwrap_or(RunResult::Success);
        Ok(RunState::finished(result))
    }
}

/// Config with millisecond polling and short deadlines
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.health.poll_interval = Duration::from_millis(5);
    config.orchestrator.request_timeout = Duration::from_secs(10);
    config.playbooks.directories.clear();
    config
}

/// Millisecond-scale retry policy so tests do not sleep for real minutes
pub fn fast(playbook: Playbook) -> Playbook {
    playbook
        .with_backoff_delays(
            Duration::from_millis(1),
            Duration::from_millis(4),
            Duration::from_millis(1),
        )
        .with_timeout(Duration::from_secs(2))
        .with_health_timeout(Duration::from_millis(500))
}
