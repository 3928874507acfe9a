//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Automated recovery engine for failed data-pipeline runs
#[derive(Parser, Debug)]
#[command(name = "pipeline-recovery")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PIPELINE_RECOVERY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PIPELINE_RECOVERY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "PIPELINE_RECOVERY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "PIPELINE_RECOVERY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PIPELINE_RECOVERY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the recovery server (default)
    Serve,

    /// Run one recovery and print the result as JSON
    Recover {
        /// Failure classification
        #[arg(required = true)]
        classification: String,

        /// Failed job id
        #[arg(long)]
        job_id: Option<String>,

        /// Compute resource (cluster) id
        #[arg(long)]
        resource_id: Option<String>,

        /// Failed run id
        #[arg(long)]
        run_id: Option<String>,

        /// Library spec that failed to install
        #[arg(long)]
        library: Option<String>,

        /// Raw platform error message
        #[arg(long)]
        error_message: Option<String>,
    },

    /// Playbook commands
    #[command(subcommand)]
    Playbooks(PlaybookCommand),

    /// Inspect or reset circuit breakers of a running server
    Circuits {
        /// Server base URL (defaults to the configured host and port)
        #[arg(long, env = "PIPELINE_RECOVERY_URL")]
        server: Option<String>,

        /// Circuit action
        #[command(subcommand)]
        action: CircuitCommand,
    },
}

/// Circuit breaker subcommands
#[derive(Subcommand, Debug)]
pub enum CircuitCommand {
    /// List breakers
    List {
        /// Only open breakers
        #[arg(long)]
        open: bool,
    },

    /// Show one breaker
    Show {
        /// Classification
        classification: String,
        /// Resource id (job or cluster), or `global`
        resource_id: String,
    },

    /// Force a breaker closed
    Reset {
        /// Classification
        classification: String,
        /// Resource id (job or cluster), or `global`
        resource_id: String,
    },
}

/// Playbook subcommands
#[derive(Subcommand, Debug)]
pub enum PlaybookCommand {
    /// List configured playbooks
    List {
        /// Only playbooks for this platform (databricks, adf, ...)
        #[arg(long)]
        platform: Option<String>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Load and validate playbooks (chain graph, fallback targets)
    Validate {
        /// Extra playbook directory to validate alongside the configured ones
        directory: Option<PathBuf>,
    },

    /// Show one playbook
    Show {
        /// Classification
        #[arg(required = true)]
        classification: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recover_command() {
        let cli = Cli::parse_from([
            "pipeline-recovery",
            "recover",
            "DatabricksOutOfMemoryError",
            "--job-id",
            "42",
            "--resource-id",
            "0101-abc",
        ]);
        match cli.command {
            Some(Command::Recover {
                classification,
                job_id,
                resource_id,
                ..
            }) => {
                assert_eq!(classification, "DatabricksOutOfMemoryError");
                assert_eq!(job_id.as_deref(), Some("42"));
                assert_eq!(resource_id.as_deref(), Some("0101-abc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_circuit_reset() {
        let cli = Cli::parse_from([
            "pipeline-recovery",
            "circuits",
            "--server",
            "http://localhost:39500",
            "reset",
            "DatabricksNetworkError",
            "global",
        ]);
        match cli.command {
            Some(Command::Circuits {
                server,
                action: CircuitCommand::Reset { classification, resource_id },
            }) => {
                assert_eq!(server.as_deref(), Some("http://localhost:39500"));
                assert_eq!(classification, "DatabricksNetworkError");
                assert_eq!(resource_id, "global");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["pipeline-recovery", "--port", "8080"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_playbook_list_with_global_config() {
        let cli = Cli::parse_from([
            "pipeline-recovery",
            "playbooks",
            "list",
            "--platform",
            "adf",
            "--config",
            "recovery.yaml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("recovery.yaml")));
        assert!(matches!(
            cli.command,
            Some(Command::Playbooks(PlaybookCommand::List { platform: Some(ref p), .. })) if p == "adf"
        ));
    }
}
