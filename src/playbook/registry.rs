//! Classification → playbook lookup, builtin playbook set, and graph validation

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{FallbackTarget, Playbook, RecoveryAction};
use crate::config::PlaybooksConfig;
use crate::failsafe::BackoffStrategy;
use crate::{Error, Result};

/// A YAML file holds either one playbook or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum PlaybookFile {
    Many { playbooks: Vec<Playbook> },
    One(Playbook),
}

/// Registry of playbooks keyed by classification.
#[derive(Debug, Clone, Default)]
pub struct PlaybookRegistry {
    playbooks: HashMap<String, Playbook>,
}

impl PlaybookRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration: builtins (if enabled), then every configured
    /// directory, then graph validation.
    pub fn from_config(config: &PlaybooksConfig) -> Result<Self> {
        let mut registry = if config.builtin {
            Self::builtin()
        } else {
            Self::new()
        };

        for dir in &config.directories {
            let loaded = registry.load_from_directory(Path::new(dir))?;
            if loaded > 0 {
                info!(directory = %dir, loaded, "Loaded playbooks");
            }
        }

        registry.validate()?;
        for (classification, target) in registry.unresolved_fallbacks() {
            warn!(
                classification = %classification,
                fallback = %target,
                "Fallback resolves to neither a playbook nor an action"
            );
        }
        Ok(registry)
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`. Later definitions replace
    /// earlier ones with the same classification. A missing directory loads
    /// nothing; an unparseable file is an error.
    pub fn load_from_directory(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            debug!(directory = %dir.display(), "Playbook directory not found, skipping");
            return Ok(0);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| {
                Error::Config(format!(
                    "Failed to read playbooks directory '{}': {e}",
                    dir.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let mut count = 0;
        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let parsed: PlaybookFile = serde_yaml::from_str(&content).map_err(|e| {
                Error::Playbook(format!("Invalid playbook file '{}': {e}", path.display()))
            })?;
            let defs = match parsed {
                PlaybookFile::Many { playbooks } => playbooks,
                PlaybookFile::One(pb) => vec![pb],
            };
            for pb in defs {
                debug!(classification = %pb.classification, path = %path.display(), "Loaded playbook");
                self.register(pb);
                count += 1;
            }
        }

        Ok(count)
    }

    /// Register a playbook, replacing any existing one for the classification
    pub fn register(&mut self, playbook: Playbook) {
        self.playbooks
            .insert(playbook.classification.clone(), playbook);
    }

    /// Playbook for `classification`
    #[must_use]
    pub fn lookup(&self, classification: &str) -> Option<&Playbook> {
        self.playbooks.get(classification)
    }

    /// Configured classifications, sorted
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.playbooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Playbooks whose platform label matches, sorted by classification
    #[must_use]
    pub fn by_platform(&self, platform: &str) -> Vec<&Playbook> {
        let mut matching: Vec<&Playbook> = self
            .playbooks
            .values()
            .filter(|pb| pb.platform.eq_ignore_ascii_case(platform))
            .collect();
        matching.sort_by(|a, b| a.classification.cmp(&b.classification));
        matching
    }

    /// Drop every playbook for `platform`, returning how many were removed
    pub fn remove_platform(&mut self, platform: &str) -> usize {
        let before = self.playbooks.len();
        self.playbooks
            .retain(|_, pb| !pb.platform.eq_ignore_ascii_case(platform));
        before - self.playbooks.len()
    }

    /// All playbooks, sorted by classification
    #[must_use]
    pub fn all(&self) -> Vec<&Playbook> {
        let mut all: Vec<&Playbook> = self.playbooks.values().collect();
        all.sort_by(|a, b| a.classification.cmp(&b.classification));
        all
    }

    /// Number of playbooks
    #[must_use]
    pub fn len(&self) -> usize {
        self.playbooks.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }

    /// Resolve a playbook's fallback. A configured classification wins over
    /// an action id of the same name.
    #[must_use]
    pub fn resolve_fallback<'a>(&'a self, playbook: &'a Playbook) -> Option<FallbackTarget<'a>> {
        let target = playbook.fallback.as_deref()?;
        if let Some(pb) = self.lookup(target) {
            return Some(FallbackTarget::Playbook(pb));
        }
        Some(match target.parse::<RecoveryAction>() {
            Ok(action) => FallbackTarget::Action(action),
            Err(_) => FallbackTarget::Unsupported(target),
        })
    }

    /// `(classification, fallback)` pairs whose fallback cannot be executed
    #[must_use]
    pub fn unresolved_fallbacks(&self) -> Vec<(String, String)> {
        let mut unresolved: Vec<(String, String)> = self
            .playbooks
            .values()
            .filter_map(|pb| match self.resolve_fallback(pb) {
                Some(FallbackTarget::Unsupported(target)) => {
                    Some((pb.classification.clone(), target.to_string()))
                }
                _ => None,
            })
            .collect();
        unresolved.sort();
        unresolved
    }

    /// Reject chain targets that are not configured and chain cycles.
    pub fn validate(&self) -> Result<()> {
        for pb in self.playbooks.values() {
            if let Some(target) = &pb.chain {
                if !self.playbooks.contains_key(target) {
                    return Err(Error::Playbook(format!(
                        "'{}' chains to unknown classification '{target}'",
                        pb.classification
                    )));
                }
            }
        }

        // Each playbook has at most one chain edge, so walking the edge list
        // from every start node finds any cycle.
        let mut acyclic: HashSet<&str> = HashSet::new();
        for start in self.list() {
            let mut path: Vec<&str> = Vec::new();
            let mut current = Some(start);
            while let Some(name) = current {
                if acyclic.contains(name) {
                    break;
                }
                if path.contains(&name) {
                    path.push(name);
                    return Err(Error::Playbook(format!(
                        "Chain cycle detected: {}",
                        path.join(" -> ")
                    )));
                }
                path.push(name);
                current = self.playbooks.get(name).and_then(|pb| pb.chain.as_deref());
            }
            acyclic.extend(path);
        }
        Ok(())
    }

    // ========================================================================
    // Builtin playbooks
    // ========================================================================

    /// Registry preloaded with the builtin Databricks and Azure Data Factory
    /// playbooks.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for pb in databricks_playbooks().into_iter().chain(adf_playbooks()) {
            registry.register(pb);
        }
        registry
    }
}

const fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn databricks_playbooks() -> Vec<Playbook> {
    use BackoffStrategy::{Exponential, Linear};
    use RecoveryAction::{
        NoAction, ReinstallDependency, RestartResource, RetryJob, RollbackConfiguration,
        ScaleResource,
    };

    let pb = |classification: &str, action| {
        Playbook::new(classification, action).on_platform("databricks")
    };

    vec![
        pb("DatabricksJobExecutionError", RetryJob)
            .with_retries(3, Exponential)
            .with_timeout(secs(600))
            .with_fallback("scale_resource")
            .without_rollback()
            .describe("Retry the failed job with exponential backoff"),
        pb("DatabricksClusterStartFailure", RestartResource)
            .with_retries(2, Linear)
            .with_timeout(secs(600))
            .with_backoff_delays(secs(60), secs(300), secs(60))
            .with_circuit_breaker(3, secs(600))
            .describe("Restart a cluster that failed to start"),
        pb("DatabricksClusterTerminated", RestartResource)
            .with_retries(1, Exponential)
            .with_timeout(secs(600))
            .without_rollback()
            .describe("Restart an unexpectedly terminated cluster"),
        pb("DatabricksResourceExhausted", ScaleResource)
            .with_retries(2, Exponential)
            .with_health_timeout(secs(120))
            .describe("Add workers when the cluster runs out of resources"),
        pb("DatabricksOutOfMemoryError", ScaleResource)
            .with_retries(1, Exponential)
            .with_chain("DatabricksJobExecutionError")
            .describe("Scale the cluster, then re-run the job"),
        pb("DatabricksDriverNotResponding", RestartResource)
            .with_retries(2, Exponential)
            .with_timeout(secs(600))
            .with_fallback("scale_resource")
            .describe("Restart a cluster whose driver stopped responding"),
        pb("DatabricksLibraryInstallationError", ReinstallDependency)
            .with_retries(3, Linear)
            .with_fallback("restart_resource")
            .describe("Install a known-good version of the failing library"),
        pb("DatabricksConfigurationError", RollbackConfiguration)
            .with_retries(1, Exponential)
            .with_timeout(secs(180))
            .describe("Roll back to the last captured cluster configuration"),
        pb("DatabricksTimeoutError", RetryJob)
            .with_retries(2, Exponential)
            .with_timeout(secs(900))
            .with_fallback("scale_resource")
            .without_rollback()
            .describe("Retry a timed-out job, scaling up if it times out again"),
        pb("DatabricksPermissionDenied", NoAction)
            .with_retries(0, Exponential)
            .without_health_check()
            .without_circuit_breaker()
            .without_rollback()
            .describe("Permission problems require manual intervention"),
        pb("DatabricksNetworkError", RetryJob)
            .with_retries(3, Exponential)
            .without_rollback()
            .describe("Retry after a transient network failure"),
    ]
}

fn adf_playbooks() -> Vec<Playbook> {
    use BackoffStrategy::{Exponential, Linear};

    let pb = |classification: &str| {
        Playbook::new(classification, RecoveryAction::RetryJob)
            .on_platform("adf")
            .without_rollback()
    };

    vec![
        pb("GatewayTimeout")
            .with_retries(3, Exponential)
            .describe("Re-run the pipeline after a gateway timeout"),
        pb("HttpConnectionFailed")
            .with_retries(3, Exponential)
            .describe("Re-run the pipeline after a connection failure"),
        pb("InternalServerError")
            .with_retries(2, Linear)
            .with_timeout(secs(600))
            .with_backoff_delays(secs(60), secs(300), secs(60))
            .describe("Re-run the pipeline after a service-side error"),
        pb("ActivityThrottlingError")
            .with_retries(3, Exponential)
            .with_timeout(secs(900))
            .with_backoff_delays(secs(60), secs(600), secs(60))
            .describe("Re-run a throttled pipeline with longer backoff"),
    ]
}
