//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Admin/ingest HTTP server
    pub server: ServerConfig,
    /// Resource control API (job orchestrator / compute clusters)
    pub resource_api: ResourceApiConfig,
    /// Azure Data Factory backend for `adf` playbooks
    pub adf: AdfConfig,
    /// Registry-wide circuit breaker defaults
    pub circuit_breaker: CircuitBreakerConfig,
    /// Orchestrator behaviour
    pub orchestrator: OrchestratorConfig,
    /// Health verification
    pub health: HealthConfig,
    /// Scale-up policy for `scale_resource`
    pub scaling: ScalingConfig,
    /// Dependency reinstall policy
    pub dependencies: DependencyConfig,
    /// Playbook sources
    pub playbooks: PlaybooksConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("PIPELINE_RECOVERY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in the resource API settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.resource_api.host = expand_string(&re, &self.resource_api.host);
        self.resource_api.token = expand_string(&re, &self.resource_api.token);
        for value in [
            &mut self.adf.webhook_url,
            &mut self.adf.management_url,
            &mut self.adf.subscription_id,
            &mut self.adf.resource_group,
            &mut self.adf.factory_name,
            &mut self.adf.token,
        ] {
            *value = expand_string(&re, value);
        }
        for dir in &mut self.playbooks.directories {
            *dir = expand_string(&re, dir);
        }
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Resource control API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceApiConfig {
    /// Workspace base URL, e.g. `https://adb-123.azuredatabricks.net`
    pub host: String,
    /// Bearer token (supports `${VAR}` expansion)
    pub token: String,
    /// Timeout for a single HTTP call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ResourceApiConfig {
    fn default() -> Self {
        Self {
            host: "${DATABRICKS_HOST}".to_string(),
            token: "${DATABRICKS_TOKEN}".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ResourceApiConfig {
    /// Whether both host and token are set
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Azure Data Factory configuration. Runs are re-triggered through the
/// Logic App webhook when one is set, otherwise through `createRun`; run
/// status always comes from the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdfConfig {
    /// Logic App webhook that re-runs a pipeline (optional)
    pub webhook_url: String,
    /// Azure Resource Manager endpoint
    pub management_url: String,
    /// Subscription holding the factory
    pub subscription_id: String,
    /// Resource group holding the factory
    pub resource_group: String,
    /// Data factory name
    pub factory_name: String,
    /// ARM bearer token
    pub token: String,
    /// Timeout for a single HTTP call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for AdfConfig {
    fn default() -> Self {
        Self {
            webhook_url: "${ADF_RETRY_LOGIC_APP_WEBHOOK}".to_string(),
            management_url: "https://management.azure.com".to_string(),
            subscription_id: "${AZURE_SUBSCRIPTION_ID}".to_string(),
            resource_group: "${ADF_RESOURCE_GROUP}".to_string(),
            factory_name: "${ADF_FACTORY_NAME}".to_string(),
            token: "${AZURE_MANAGEMENT_TOKEN}".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl AdfConfig {
    /// Whether the factory coordinates and token are all set
    #[must_use]
    pub fn is_configured(&self) -> bool {
        [
            &self.management_url,
            &self.subscription_id,
            &self.resource_group,
            &self.factory_name,
            &self.token,
        ]
        .iter()
        .all(|v| !v.trim().is_empty())
    }
}

/// Registry-wide circuit breaker defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// How long the breaker stays open before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Closed breakers idle for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub idle_eviction: Duration,
    /// How often the eviction sweep runs in server mode
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(300),
            idle_eviction: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of chained playbooks below the first one
    pub max_chain_depth: u32,
    /// Allow at most one in-flight attempt per breaker key
    pub serialize_per_key: bool,
    /// Upper bound on one orchestration call (including chains)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 3,
            serialize_per_key: true,
            request_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Health verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between state polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Scale-up policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Worker ceiling for clusters without autoscale bounds
    pub max_workers: u32,
    /// Percentage added to the current worker count
    pub scale_up_percent: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            scale_up_percent: 50,
        }
    }
}

/// Dependency reinstall policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Known-good versions per package, tried in order
    pub fallback_versions: HashMap<String, Vec<String>>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        let table: [(&str, [&str; 3]); 6] = [
            ("pandas", ["2.1.0", "2.0.3", "1.5.3"]),
            ("numpy", ["1.24.3", "1.23.5", "1.22.4"]),
            ("scikit-learn", ["1.3.0", "1.2.2", "1.1.3"]),
            ("matplotlib", ["3.7.2", "3.6.3", "3.5.3"]),
            ("requests", ["2.31.0", "2.28.2", "2.27.1"]),
            ("pyspark", ["3.4.0", "3.3.2", "3.3.1"]),
        ];
        Self {
            fallback_versions: table
                .into_iter()
                .map(|(name, versions)| {
                    (
                        name.to_string(),
                        versions.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Playbook sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybooksConfig {
    /// Start from the builtin playbook set
    pub builtin: bool,
    /// Directories with `*.yaml` playbook files (override builtins by classification)
    pub directories: Vec<String>,
}

impl Default for PlaybooksConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            directories: vec!["playbooks".to_string()],
        }
    }
}

/// Human-readable duration serde (`"30s"`, `"5m"`, `"100ms"`, `"24h"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as `"<n>ms"` when sub-second precision matters, else `"<n>s"`
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"2h"` or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a valid duration.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let invalid = |_| format!("invalid duration: {s:?}");

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis).map_err(invalid)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(invalid)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(invalid)
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        }
    }
}
