// src/sys/fips.rs
//
// 🛡️ FIPS Validator: decides DISABLED / ENABLED_VERIFIED / ENABLED_DEGRADED.

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::traits::FipsHost;

pub const KERNEL_FIPS_FLAG: &str = "/proc/sys/crypto/fips_enabled";
pub const CRYPTO_POLICY_FILE: &str = "/etc/crypto-policies/config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FipsState {
    Disabled,
    EnabledVerified,
    EnabledDegraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Pass,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FipsCheck {
    pub name: &'static str,
    pub outcome: CheckOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FipsDecision {
    pub state: FipsState,
    pub trail: Vec<FipsCheck>,
}

impl FipsDecision {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, FipsState::Disabled)
    }

    pub fn disabled() -> Self {
        Self {
            state: FipsState::Disabled,
            trail: Vec::new(),
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &FipsCheck> {
        self.trail.iter().filter(|c| c.outcome == CheckOutcome::Warn)
    }
}

// ==============================================================================
// 1. Concrete Host (Linux + OpenSSL 3)
// ==============================================================================

pub struct LinuxFipsHost {
    openssl_bin: String,
}

impl LinuxFipsHost {
    pub fn new() -> Self {
        Self {
            openssl_bin: "openssl".to_string(),
        }
    }
}

pub async fn read_kernel_fips_flag() -> Option<bool> {
    let raw = fs::read_to_string(KERNEL_FIPS_FLAG).await.ok()?;
    Some(raw.trim() == "1")
}

#[async_trait]
impl FipsHost for LinuxFipsHost {
    async fn kernel_fips_enabled(&self) -> Option<bool> {
        read_kernel_fips_flag().await
    }

    async fn crypto_providers(&self) -> Result<String, String> {
        let output = Command::new(&self.openssl_bin)
            .args(["list", "-providers"])
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.openssl_bin, e))?;

        if !output.status.success() {
            return Err(format!(
                "{} list -providers failed: {}",
                self.openssl_bin,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn crypto_policy(&self) -> Option<String> {
        let raw = fs::read_to_string(CRYPTO_POLICY_FILE).await.ok()?;
        raw.lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
    }
}

// ==============================================================================
// 2. Policy
// ==============================================================================

fn provider_listing_has_fips(listing: &str) -> bool {
    // Provider sections look like "  fips" followed by indented name/version lines.
    listing
        .lines()
        .map(str::trim)
        .any(|l| l.eq_ignore_ascii_case("fips") || l.to_ascii_lowercase().starts_with("name: openssl fips"))
}

async fn run_checks(host: &dyn FipsHost) -> Vec<FipsCheck> {
    let mut trail = Vec::with_capacity(3);

    trail.push(match host.kernel_fips_enabled().await {
        Some(true) => FipsCheck {
            name: "kernel_fips_flag",
            outcome: CheckOutcome::Pass,
            detail: format!("{} = 1", KERNEL_FIPS_FLAG),
        },
        Some(false) => FipsCheck {
            name: "kernel_fips_flag",
            outcome: CheckOutcome::Warn,
            detail: format!("{} = 0", KERNEL_FIPS_FLAG),
        },
        None => FipsCheck {
            name: "kernel_fips_flag",
            outcome: CheckOutcome::Warn,
            detail: format!("{} not present", KERNEL_FIPS_FLAG),
        },
    });

    trail.push(match host.crypto_providers().await {
        Ok(listing) if provider_listing_has_fips(&listing) => FipsCheck {
            name: "crypto_fips_provider",
            outcome: CheckOutcome::Pass,
            detail: "FIPS provider loaded".to_string(),
        },
        Ok(_) => FipsCheck {
            name: "crypto_fips_provider",
            outcome: CheckOutcome::Warn,
            detail: "FIPS provider not listed".to_string(),
        },
        Err(e) => FipsCheck {
            name: "crypto_fips_provider",
            outcome: CheckOutcome::Warn,
            detail: e,
        },
    });

    trail.push(match host.crypto_policy().await {
        Some(policy) if policy.to_ascii_uppercase().starts_with("FIPS") => FipsCheck {
            name: "crypto_policy",
            outcome: CheckOutcome::Pass,
            detail: format!("policy {}", policy),
        },
        Some(policy) => FipsCheck {
            name: "crypto_policy",
            outcome: CheckOutcome::Warn,
            detail: format!("policy {} is not FIPS", policy),
        },
        None => FipsCheck {
            name: "crypto_policy",
            outcome: CheckOutcome::Warn,
            detail: "no system crypto policy configured".to_string(),
        },
    });

    trail
}

/// Evaluates `FIPS_MODE` / `FIPS_CHECK` against the host.
pub async fn validate(snapshot: &ConfigurationSnapshot, host: &dyn FipsHost) -> Result<FipsDecision, BootstrapError> {
    let mode = snapshot.get("FIPS_MODE").trim().to_ascii_lowercase();

    let strict = match mode.as_str() {
        "disabled" => {
            info!(fips_mode = "disabled", "FIPS mode disabled, skipping checks");
            return Ok(FipsDecision::disabled());
        }
        "enabled" => snapshot.flag("FIPS_CHECK")?,
        other => {
            return Err(BootstrapError::Config(format!(
                "invalid FIPS_MODE '{}' (expected enabled or disabled)",
                other
            )));
        }
    };

    let trail = run_checks(host).await;
    for check in &trail {
        match check.outcome {
            CheckOutcome::Pass => info!(check = check.name, result = "PASS", detail = %check.detail, "FIPS check"),
            CheckOutcome::Warn => warn!(check = check.name, result = "WARN", detail = %check.detail, "FIPS check"),
        }
    }

    let failed: Vec<&str> = trail
        .iter()
        .filter(|c| c.outcome == CheckOutcome::Warn)
        .map(|c| c.name)
        .collect();

    if failed.is_empty() {
        info!("🛡️ FIPS mode verified");
        return Ok(FipsDecision {
            state: FipsState::EnabledVerified,
            trail,
        });
    }

    if strict {
        return Err(BootstrapError::Fips(format!(
            "strict FIPS_CHECK enabled and checks did not pass: {}",
            failed.join(", ")
        )));
    }

    warn!(failed = %failed.join(", "), "FIPS requested but host is not fully compliant; continuing degraded");
    Ok(FipsDecision {
        state: FipsState::EnabledDegraded,
        trail,
    })
}
