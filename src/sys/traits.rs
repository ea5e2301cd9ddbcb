use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ==============================================================================
// 1. FIPS Host Inspection
// ==============================================================================

#[async_trait]
pub trait FipsHost: Send + Sync {
    /// Kernel FIPS flag. `None` when the flag file does not exist.
    async fn kernel_fips_enabled(&self) -> Option<bool>;

    /// Raw provider listing from the crypto library.
    async fn crypto_providers(&self) -> Result<String, String>;

    /// System-wide crypto policy name, if the host has one configured.
    async fn crypto_policy(&self) -> Option<String>;
}

// ==============================================================================
// 2. Reverse Proxy Binary
// ==============================================================================

#[async_trait]
pub trait ProxyBinary: Send + Sync {
    /// Runs the proxy's own syntax checker against `config_path`.
    /// Err carries the checker's diagnostics.
    async fn check_config(&self, config_path: &Path) -> Result<(), String>;
}

// ==============================================================================
// 3. Backend Runtime
// ==============================================================================

#[async_trait]
pub trait BackendRuntime: Send + Sync {
    /// Version string as reported by the runtime, e.g. `v20.11.1`.
    async fn runtime_version(&self) -> Result<String, String>;
}

// ==============================================================================
// 4. Health Observation (externally visible state only)
// ==============================================================================

#[async_trait]
pub trait HostObserver: Send + Sync {
    async fn process_running(&self, name: &str) -> bool;

    /// HTTP status of a GET, or Err on connect failure / timeout.
    async fn https_status(&self, url: &str, timeout: Duration) -> Result<u16, String>;

    async fn tcp_connectable(&self, addr: SocketAddr, timeout: Duration) -> bool;

    /// Used space as a percentage of the filesystem holding `path`.
    async fn disk_usage_percent(&self, path: &Path) -> Result<f64, String>;

    async fn memory_usage_percent(&self) -> Result<f64, String>;

    async fn kernel_fips_enabled(&self) -> Option<bool>;
}
