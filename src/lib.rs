//! Pipeline Recovery Library
//!
//! Automated recovery engine for failed data-pipeline runs: given a failure
//! classification and the identifiers of the failed job, it picks a playbook,
//! runs a remediation action against the compute platform, verifies health,
//! and keeps per-resource circuit breakers so a failing recovery cannot
//! hammer the platform.
//!
//! # Features
//!
//! - **Playbooks**: built-in and YAML-defined remediation policies
//! - **Failsafes**: per classification + resource circuit breakers, backoff
//! - **Fallbacks and chains**: secondary actions and chained classifications
//! - **Health verification**: polls the resource or the new run until settled
//! - **Rollback**: configuration snapshots captured before mutating actions
//! - **Audit**: structured events for every decision

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod playbook;
pub mod recovery;
pub mod resource;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
