//! Pipeline Recovery - automated remediation for failed data-pipeline runs
//!
//! Serves the recovery API by default; `recover`, `playbooks`, and `circuits`
//! subcommands cover one-shot and operator use.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

use pipeline_recovery::{
    audit::MemoryAuditSink,
    cli::{CircuitCommand, Cli, Command, PlaybookCommand},
    config::Config,
    playbook::{Playbook, PlaybookRegistry},
    recovery::{Orchestrator, RecoveryRequest},
    resource::{AdfClient, DatabricksClient, ResourceMetadata},
    server::RecoveryServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Recover {
            classification,
            job_id,
            resource_id,
            run_id,
            library,
            error_message,
        }) => {
            let metadata = ResourceMetadata {
                job_id,
                resource_id,
                run_id,
                library,
                error_message,
                ..ResourceMetadata::default()
            };
            run_recover(&config, RecoveryRequest::new(classification, metadata)).await
        }
        Some(Command::Playbooks(cmd)) => run_playbook_command(&config, cmd),
        Some(Command::Circuits { server, action }) => {
            run_circuit_command(&config, server, action).await
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Build the engine shared by `serve` and `recover`
fn build_orchestrator(config: &Config) -> Result<Orchestrator, String> {
    let mut playbooks = PlaybookRegistry::from_config(&config.playbooks)
        .map_err(|e| format!("Failed to load playbooks: {e}"))?;
    let client = DatabricksClient::new(&config.resource_api)
        .map_err(|e| format!("Failed to create resource client: {e}"))?;

    // ADF playbooks only run against a Data Factory backend.
    let adf = if config.adf.is_configured() {
        Some(AdfClient::new(&config.adf).map_err(|e| format!("Failed to create ADF client: {e}"))?)
    } else {
        let dropped = playbooks.remove_platform("adf");
        if dropped > 0 {
            warn!(dropped, "Data Factory backend not configured, ADF playbooks disabled");
        }
        None
    };

    let mut orchestrator = Orchestrator::new(config, playbooks, Arc::new(client));
    if let Some(adf) = adf {
        orchestrator = orchestrator.with_platform("adf", Arc::new(adf));
    }
    Ok(orchestrator)
}

/// Run one recovery and print the result
async fn run_recover(config: &Config, request: RecoveryRequest) -> ExitCode {
    let orchestrator = match build_orchestrator(config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let audit = Arc::new(MemoryAuditSink::new());
    let orchestrator = orchestrator.with_audit_sink(audit.clone());

    let result = orchestrator.recover(&request).await;
    let output = json!({
        "result": result,
        "audit": audit.events(),
    });
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("❌ Failed to serialize result: {e}");
            return ExitCode::FAILURE;
        }
    }

    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run playbook management commands
fn run_playbook_command(config: &Config, cmd: PlaybookCommand) -> ExitCode {
    match cmd {
        PlaybookCommand::List { platform, format } => {
            let registry = match PlaybookRegistry::from_config(&config.playbooks) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("❌ Failed to load playbooks: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let playbooks = match platform.as_deref() {
                Some(p) => registry.by_platform(p),
                None => registry.all(),
            };

            if format == "json" {
                match serde_json::to_string_pretty(&playbooks) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize to JSON: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else if playbooks.is_empty() {
                println!("No playbooks configured.");
            } else {
                println!("{} playbook(s):\n", playbooks.len());
                for pb in playbooks {
                    print_playbook_row(pb);
                }
            }
            ExitCode::SUCCESS
        }

        PlaybookCommand::Validate { directory } => {
            let mut registry = match PlaybookRegistry::from_config(&config.playbooks) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(dir) = directory {
                if let Err(e) = load_extra(&mut registry, &dir) {
                    eprintln!("❌ Validation failed: {e}");
                    return ExitCode::FAILURE;
                }
            }

            let unresolved = registry.unresolved_fallbacks();
            for (classification, target) in &unresolved {
                println!("⚠️  {classification}: fallback '{target}' is neither an action nor a playbook");
            }
            println!("✅ {} playbook(s) valid", registry.len());
            ExitCode::SUCCESS
        }

        PlaybookCommand::Show { classification } => {
            let registry = match PlaybookRegistry::from_config(&config.playbooks) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("❌ Failed to load playbooks: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let Some(pb) = registry.lookup(&classification) else {
                eprintln!("❌ No playbook for '{classification}'");
                return ExitCode::FAILURE;
            };
            match serde_yaml::to_string(pb) {
                Ok(yaml) => {
                    print!("{yaml}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to render playbook: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn load_extra(registry: &mut PlaybookRegistry, dir: &Path) -> pipeline_recovery::Result<()> {
    if !dir.is_dir() {
        return Err(pipeline_recovery::Error::Config(format!(
            "Playbook directory not found: {}",
            dir.display()
        )));
    }
    let loaded = registry.load_from_directory(dir)?;
    println!("Loaded {loaded} playbook(s) from {}", dir.display());
    registry.validate()
}

fn print_playbook_row(pb: &Playbook) {
    let mut extras = Vec::new();
    if let Some(ref fallback) = pb.fallback {
        extras.push(format!("fallback={fallback}"));
    }
    if let Some(ref chain) = pb.chain {
        extras.push(format!("chain={chain}"));
    }
    if !pb.circuit_breaker.enabled {
        extras.push("no-breaker".to_string());
    }
    println!(
        "  {:<40} {:<11} {:<22} {}",
        pb.classification,
        pb.platform,
        pb.action.as_str(),
        extras.join(" ")
    );
}

/// Query a running server's circuit breakers
async fn run_circuit_command(
    config: &Config,
    server: Option<String>,
    action: CircuitCommand,
) -> ExitCode {
    let base = server.unwrap_or_else(|| {
        let host = match config.server.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", config.server.port)
    });
    let base = base.trim_end_matches('/');

    let client = reqwest::Client::new();
    let request = match &action {
        CircuitCommand::List { open: false } => client.get(format!("{base}/circuits")),
        CircuitCommand::List { open: true } => client.get(format!("{base}/circuits/open")),
        CircuitCommand::Show {
            classification,
            resource_id,
        } => client.get(format!("{base}/circuits/{classification}/{resource_id}")),
        CircuitCommand::Reset {
            classification,
            resource_id,
        } => client.post(format!("{base}/circuits/{classification}/{resource_id}/reset")),
    };

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("❌ Failed to reach {base}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let status = response.status();
    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("❌ Invalid response from {base}: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&body).unwrap_or_default()
    );
    if status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run the recovery server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting pipeline recovery"
    );

    let orchestrator = match build_orchestrator(&config) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = RecoveryServer::new(config, orchestrator).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
