// src/main.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod error;
mod pipeline;
mod sys;

use crate::config::{ConfigurationSnapshot, DEFAULT_ENV_FILE, DEFAULT_SNAPSHOT_PATH};
use crate::error::BootstrapError;
use crate::pipeline::{BootstrapContext, HostBindings, Pipeline, PipelineReport};
use crate::sys::backend::{BackendEnvironment, NodeRuntime};
use crate::sys::fips::LinuxFipsHost;
use crate::sys::health::{HealthProbe, LinuxHostObserver};
use crate::sys::proxy::NginxBinary;
use crate::sys::supervisor::{Supervisor, listen_for_signals};

/// Container init for NGINX + WebSSH2
#[derive(Parser, Debug)]
#[command(name = "webssh2-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Optional KEY=VALUE file layered under the process environment
    #[arg(long, env = "GATEWAY_ENV_FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Where the resolved configuration snapshot is written
    #[arg(long, env = "GATEWAY_SNAPSHOT", default_value = DEFAULT_SNAPSHOT_PATH)]
    snapshot: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap, then supervise nginx and the WebSSH2 backend
    Run,

    /// Bootstrap only
    Init,

    /// Run one bootstrap stage (earlier stages are re-derived)
    Stage {
        #[arg(value_parser = ["fips", "tls", "proxy", "backend"])]
        name: String,
    },

    /// Composite health probe (exit 0 OK, 1 WARNING, 2 CRITICAL)
    Healthcheck {
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved configuration (secrets redacted)
    Env {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to `healthcheck` and `env`; logs go to stderr.
    let (text, json) = match format {
        LogFormat::Text => (
            Some(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };
    tracing_subscriber::registry().with(filter).with(text).with(json).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(exit_code = e.exit_code(), "FATAL: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn execute(cli: &Cli) -> Result<i32, BootstrapError> {
    match &cli.command {
        Commands::Run => {
            let snapshot = resolve_and_persist(cli)?;
            run(cli, &snapshot).await
        }
        Commands::Init => {
            let snapshot = resolve_and_persist(cli)?;
            bootstrap(cli, &snapshot, Pipeline::full()).await.map(|_| 0)
        }
        Commands::Stage { name } => {
            let snapshot = if cli.snapshot.exists() {
                ConfigurationSnapshot::load_serialized(&cli.snapshot)?
            } else {
                resolve_and_persist(cli)?
            };
            let stages = pipeline::stages_until(name)?;
            bootstrap(cli, &snapshot, Pipeline::new(stages)).await.map(|_| 0)
        }
        Commands::Healthcheck { json } => {
            let snapshot = current_snapshot(cli)?;
            let observer = LinuxHostObserver::new();
            let report = HealthProbe::new(&snapshot, &observer).run().await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(report.exit_code())
        }
        Commands::Env { json } => {
            let snapshot = current_snapshot(cli)?;
            let values = snapshot.redacted();
            if *json {
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else {
                for (key, value) in values {
                    println!("{}={}", key, value);
                }
            }
            Ok(0)
        }
    }
}

// ==============================================================================
// 1. Configuration
// ==============================================================================

fn env_file(cli: &Cli) -> Option<&Path> {
    Some(cli.env_file.as_path()).filter(|p| !p.as_os_str().is_empty())
}

fn resolve_and_persist(cli: &Cli) -> Result<ConfigurationSnapshot, BootstrapError> {
    let snapshot = ConfigurationSnapshot::from_process(env_file(cli));
    snapshot.persist(&cli.snapshot)?;
    info!(path = %cli.snapshot.display(), "Configuration snapshot persisted");
    Ok(snapshot)
}

/// A previously persisted snapshot wins; otherwise resolve without writing.
fn current_snapshot(cli: &Cli) -> Result<ConfigurationSnapshot, BootstrapError> {
    if cli.snapshot.exists() {
        ConfigurationSnapshot::load_serialized(&cli.snapshot)
    } else {
        Ok(ConfigurationSnapshot::from_process(env_file(cli)))
    }
}

// ==============================================================================
// 2. Bootstrap & Supervision
// ==============================================================================

async fn bootstrap(
    cli: &Cli,
    snapshot: &ConfigurationSnapshot,
    pipeline: Pipeline,
) -> Result<(PipelineReport, Option<BackendEnvironment>), BootstrapError> {
    let fips_host = LinuxFipsHost::new();
    let nginx = NginxBinary::new(snapshot.get("NGINX_BIN"));
    let node = NodeRuntime::new(snapshot.get("WEBSSH2_NODE_BIN"));

    let mut ctx = BootstrapContext::new(
        snapshot,
        cli.snapshot.clone(),
        HostBindings {
            fips_host: &fips_host,
            proxy: &nginx,
            runtime: &node,
        },
    );
    let report = pipeline.run(&mut ctx).await?;
    info!(stages = ?report.completed, warnings = report.warnings.len(), "⚙️ Bootstrap complete");
    Ok((report, ctx.backend.take()))
}

async fn run(cli: &Cli, snapshot: &ConfigurationSnapshot) -> Result<i32, BootstrapError> {
    let (_, backend) = bootstrap(cli, snapshot, Pipeline::full()).await?;
    let backend = backend
        .ok_or_else(|| BootstrapError::Invariant("bootstrap finished without a backend environment".into()))?;

    let supervisor = Supervisor::from_bootstrap(snapshot, &backend)?;
    let shutdown = Arc::new(watch::channel(false).0);
    let signals = listen_for_signals(shutdown.clone());

    info!("🚀 Starting nginx and webssh2");
    let handles = supervisor.run(shutdown).await?;
    signals.abort();

    for handle in &handles {
        info!(service = %handle.name, restarts = handle.restart_count, "Service stopped");
    }
    Ok(0)
}
