// src/pipeline.rs
//
// Ordered bootstrap stages. Each one either succeeds, succeeds with a warning,
// or fails fatally and stops everything after it.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::backend::{self, AlgorithmPreset, BackendEnvironment, BackendRenderer};
use crate::sys::fips::{self, FipsDecision, FipsState};
use crate::sys::proxy::{NginxRenderer, RenderedConfigSet};
use crate::sys::ssl::{CertificateMaterial, TlsProvisioner};
use crate::sys::traits::{BackendRuntime, FipsHost, ProxyBinary};

pub const STAGE_NAMES: &[&str] = &["fips", "tls", "proxy", "backend"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Warning(Vec<String>),
}

/// The external things stages talk to. Real binaries in production, fakes in tests.
pub struct HostBindings<'a> {
    pub fips_host: &'a dyn FipsHost,
    pub proxy: &'a dyn ProxyBinary,
    pub runtime: &'a dyn BackendRuntime,
}

pub struct BootstrapContext<'a> {
    pub snapshot: &'a ConfigurationSnapshot,
    /// Where the snapshot was persisted; the backend export lands beside it.
    pub snapshot_path: PathBuf,
    hosts: HostBindings<'a>,
    pub fips: Option<FipsDecision>,
    pub material: Option<CertificateMaterial>,
    pub rendered: Option<RenderedConfigSet>,
    pub backend: Option<BackendEnvironment>,
}

impl<'a> BootstrapContext<'a> {
    pub fn new(snapshot: &'a ConfigurationSnapshot, snapshot_path: PathBuf, hosts: HostBindings<'a>) -> Self {
        Self {
            snapshot,
            snapshot_path,
            hosts,
            fips: None,
            material: None,
            rendered: None,
            backend: None,
        }
    }

    fn require_fips(&self) -> Result<&FipsDecision, BootstrapError> {
        self.fips
            .as_ref()
            .ok_or_else(|| BootstrapError::Invariant("FIPS decision missing; fips stage did not run".into()))
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<StageOutcome, BootstrapError>;
}

// ==============================================================================
// 1. Stages
// ==============================================================================

struct FipsStage;

#[async_trait]
impl Stage for FipsStage {
    fn name(&self) -> &'static str {
        "fips"
    }

    async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<StageOutcome, BootstrapError> {
        let decision = fips::validate(ctx.snapshot, ctx.hosts.fips_host).await?;
        let outcome = if decision.state == FipsState::EnabledDegraded {
            StageOutcome::Warning(
                decision
                    .warnings()
                    .map(|c| format!("FIPS check {} did not pass: {}", c.name, c.detail))
                    .collect(),
            )
        } else {
            StageOutcome::Success
        };
        ctx.fips = Some(decision);
        Ok(outcome)
    }
}

struct TlsStage;

#[async_trait]
impl Stage for TlsStage {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<StageOutcome, BootstrapError> {
        let material = TlsProvisioner::new(ctx.snapshot, ctx.require_fips()?).provision().await?;
        ctx.material = Some(material);
        if ctx.snapshot.get("TLS_MODE").trim().eq_ignore_ascii_case("letsencrypt") {
            return Ok(StageOutcome::Warning(vec![
                "TLS_MODE=letsencrypt is not implemented; serving a self-signed certificate".into(),
            ]));
        }
        Ok(StageOutcome::Success)
    }
}

struct ProxyStage;

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<StageOutcome, BootstrapError> {
        let material = ctx
            .material
            .as_ref()
            .ok_or_else(|| BootstrapError::Invariant("certificate material missing; tls stage did not run".into()))?;
        let rendered = NginxRenderer::new(ctx.snapshot, ctx.require_fips()?, material, ctx.hosts.proxy)
            .render()
            .await?;
        ctx.rendered = Some(rendered);
        Ok(StageOutcome::Success)
    }
}

struct BackendStage;

#[async_trait]
impl Stage for BackendStage {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<StageOutcome, BootstrapError> {
        let fips = ctx.require_fips()?;
        let env = BackendRenderer::new(ctx.snapshot, fips, ctx.hosts.runtime).render().await?;
        let env_file = backend::env_file_path(&ctx.snapshot_path);
        env.write_env_file(&env_file)?;
        debug!(
            path = %env_file.display(),
            keys = ?env.public_exports().keys().collect::<Vec<_>>(),
            "Backend environment written"
        );

        let mut warnings = Vec::new();
        if env.secret_generated {
            warnings.push("WEBSSH2_SESSION_SECRET was generated and is ephemeral; pin it in production".to_string());
        }
        let requested = AlgorithmPreset::parse(ctx.snapshot.get("WEBSSH2_SSH_ALGORITHMS_PRESET"))?;
        if requested != env.preset {
            warnings.push(format!(
                "SSH algorithm preset '{}' replaced by '{}' for FIPS",
                requested.as_str(),
                env.preset.as_str()
            ));
        }

        ctx.backend = Some(env);
        Ok(if warnings.is_empty() {
            StageOutcome::Success
        } else {
            StageOutcome::Warning(warnings)
        })
    }
}

pub fn all_stages() -> Vec<Box<dyn Stage>> {
    vec![Box::new(FipsStage), Box::new(TlsStage), Box::new(ProxyStage), Box::new(BackendStage)]
}

/// Stages up to and including `name`. Earlier stages are idempotent, so a
/// standalone `stage` invocation re-derives its prerequisites this way.
pub fn stages_until(name: &str) -> Result<Vec<Box<dyn Stage>>, BootstrapError> {
    let position = STAGE_NAMES.iter().position(|s| *s == name).ok_or_else(|| {
        BootstrapError::Config(format!("unknown stage '{}' (expected one of {})", name, STAGE_NAMES.join(", ")))
    })?;
    let mut stages = all_stages();
    stages.truncate(position + 1);
    Ok(stages)
}

// ==============================================================================
// 2. Runner
// ==============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub completed: Vec<&'static str>,
    pub warnings: Vec<(&'static str, String)>,
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn full() -> Self {
        Self::new(all_stages())
    }

    /// Runs stages in order; the first fatal error aborts the rest.
    pub async fn run(&self, ctx: &mut BootstrapContext<'_>) -> Result<PipelineReport, BootstrapError> {
        let mut report = PipelineReport::default();

        for stage in &self.stages {
            let name = stage.name();
            info!(stage = name, "▶️ Stage starting");
            match stage.run(ctx).await {
                Ok(StageOutcome::Success) => info!(stage = name, "✅ Stage complete"),
                Ok(StageOutcome::Warning(messages)) => {
                    for message in messages {
                        warn!(stage = name, "[{}] WARNING: {}", name, message);
                        report.warnings.push((name, message));
                    }
                    info!(stage = name, "✅ Stage complete with warnings");
                }
                Err(e) => {
                    error!(stage = name, exit_code = e.exit_code(), "[{}] FATAL: {}", name, e);
                    return Err(e);
                }
            }
            report.completed.push(name);
        }

        if !report.warnings.is_empty() {
            warn!(count = report.warnings.len(), "Bootstrap finished with warnings");
        }
        Ok(report)
    }
}
