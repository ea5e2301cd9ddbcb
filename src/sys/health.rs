// src/sys/health.rs
//
// Stateless composite health probe. Only looks at what is visible from outside:
// processes, ports, files, the kernel.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ConfigurationSnapshot;
use crate::sys::backend::normalize_listen_ip;
use crate::sys::fips::read_kernel_fips_flag;
use crate::sys::ssl::{self, MIN_REMAINING_VALIDITY_HOURS};
use crate::sys::traits::HostObserver;

pub const HTTPS_TIMEOUT: Duration = Duration::from_secs(5);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(3);
pub const USAGE_WARNING_PERCENT: f64 = 90.0;
pub const USAGE_CRITICAL_PERCENT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    /// <90 OK, <95 WARNING, otherwise CRITICAL.
    pub fn for_usage(percent: f64) -> Self {
        if percent < USAGE_WARNING_PERCENT {
            Severity::Ok
        } else if percent < USAGE_CRITICAL_PERCENT {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl HealthCheckResult {
    fn new(name: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheckResult>,
    pub overall: Severity,
}

impl HealthReport {
    pub fn from_checks(checks: Vec<HealthCheckResult>) -> Self {
        let overall = checks.iter().map(|c| c.severity).max().unwrap_or(Severity::Ok);
        Self { checks, overall }
    }

    pub fn exit_code(&self) -> i32 {
        self.overall.exit_code()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            out.push_str(&format!("[{}] {}: {}\n", check.severity, check.name, check.message));
        }
        out.push_str(&format!("Overall status: {}\n", self.overall));
        out
    }
}

// ==============================================================================
// 1. Linux Observer
// ==============================================================================

pub struct LinuxHostObserver {
    proc_root: PathBuf,
}

impl LinuxHostObserver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

#[async_trait]
impl HostObserver for LinuxHostObserver {
    async fn process_running(&self, name: &str) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.proc_root).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_pid = entry.file_name().to_str().is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
                if comm.trim() == name {
                    return true;
                }
            }
        }
        false
    }

    async fn https_status(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        // Self-signed material is the default, so the probe does not verify the chain.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        let response = client.get(url).send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }

    async fn tcp_connectable(&self, addr: SocketAddr, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }

    async fn disk_usage_percent(&self, path: &Path) -> Result<f64, String> {
        let stats = nix::sys::statvfs::statvfs(path).map_err(|e| format!("statvfs {}: {}", path.display(), e))?;
        disk_usage_from_blocks(stats.blocks() as u64, stats.blocks_free() as u64, stats.blocks_available() as u64)
            .ok_or_else(|| format!("{} reports zero usable blocks", path.display()))
    }

    async fn memory_usage_percent(&self) -> Result<f64, String> {
        let meminfo = tokio::fs::read_to_string(self.proc_root.join("meminfo"))
            .await
            .map_err(|e| format!("meminfo: {}", e))?;
        memory_usage_from_meminfo(&meminfo)
    }

    async fn kernel_fips_enabled(&self) -> Option<bool> {
        read_kernel_fips_flag().await
    }
}

fn meminfo_field(meminfo: &str, field: &str) -> Option<f64> {
    meminfo
        .lines()
        .find_map(|l| l.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Same figure `df` prints: reserved blocks count as neither used nor available.
pub fn disk_usage_from_blocks(total: u64, free: u64, available: u64) -> Option<f64> {
    let used = total.saturating_sub(free);
    let usable = used + available;
    (usable > 0).then(|| used as f64 / usable as f64 * 100.0)
}

pub fn memory_usage_from_meminfo(meminfo: &str) -> Result<f64, String> {
    let total = meminfo_field(meminfo, "MemTotal").ok_or("MemTotal missing")?;
    let available = meminfo_field(meminfo, "MemAvailable").ok_or("MemAvailable missing")?;
    if total <= 0.0 {
        return Err("MemTotal is zero".into());
    }
    Ok((total - available) / total * 100.0)
}

// ==============================================================================
// 2. Probe
// ==============================================================================

pub struct HealthProbe<'a> {
    snapshot: &'a ConfigurationSnapshot,
    observer: &'a dyn HostObserver,
    root_fs: PathBuf,
}

impl<'a> HealthProbe<'a> {
    pub fn new(snapshot: &'a ConfigurationSnapshot, observer: &'a dyn HostObserver) -> Self {
        Self {
            snapshot,
            observer,
            root_fs: PathBuf::from("/"),
        }
    }

    fn proxy_url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.snapshot.get("NGINX_LISTEN_PORT").trim(), path)
    }

    async fn process_check(&self, name: &'static str, process: &str) -> HealthCheckResult {
        if self.observer.process_running(process).await {
            HealthCheckResult::new(name, Severity::Ok, format!("{} is running", process))
        } else {
            HealthCheckResult::new(name, Severity::Critical, format!("{} process not found", process))
        }
    }

    async fn proxy_health_check(&self) -> HealthCheckResult {
        let url = self.proxy_url("/health");
        match self.observer.https_status(&url, HTTPS_TIMEOUT).await {
            Ok(status) if (200..300).contains(&status) => {
                HealthCheckResult::new("nginx_health_endpoint", Severity::Ok, format!("{} returned {}", url, status))
            }
            Ok(status) => HealthCheckResult::new(
                "nginx_health_endpoint",
                Severity::Critical,
                format!("{} returned {}", url, status),
            ),
            Err(e) => HealthCheckResult::new("nginx_health_endpoint", Severity::Critical, format!("{}: {}", url, e)),
        }
    }

    /// WARNING only: the backend may still be starting when the proxy is already up.
    async fn backend_via_proxy_check(&self) -> HealthCheckResult {
        let url = self.proxy_url("/ssh");
        match self.observer.https_status(&url, HTTPS_TIMEOUT).await {
            Ok(status) if status < 500 => {
                HealthCheckResult::new("webssh2_via_proxy", Severity::Ok, format!("{} returned {}", url, status))
            }
            Ok(status) => {
                HealthCheckResult::new("webssh2_via_proxy", Severity::Warning, format!("{} returned {}", url, status))
            }
            Err(e) => HealthCheckResult::new("webssh2_via_proxy", Severity::Warning, format!("{}: {}", url, e)),
        }
    }

    async fn backend_port_check(&self) -> HealthCheckResult {
        let ip = normalize_listen_ip(self.snapshot.get("WEBSSH2_LISTEN_IP"));
        let ip = if ip == "0.0.0.0" { "127.0.0.1".to_string() } else { ip };
        let port = self.snapshot.get("WEBSSH2_LISTEN_PORT").trim();

        let addr = match (ip.parse::<IpAddr>(), port.parse::<u16>()) {
            (Ok(ip), Ok(port)) => SocketAddr::new(ip, port),
            _ => {
                return HealthCheckResult::new(
                    "webssh2_port",
                    Severity::Critical,
                    format!("invalid backend address {}:{}", ip, port),
                );
            }
        };

        if self.observer.tcp_connectable(addr, TCP_TIMEOUT).await {
            HealthCheckResult::new("webssh2_port", Severity::Ok, format!("{} accepting connections", addr))
        } else {
            HealthCheckResult::new("webssh2_port", Severity::Critical, format!("{} not connectable", addr))
        }
    }

    fn certificate_check(&self) -> HealthCheckResult {
        let path = Path::new(self.snapshot.get("TLS_CERT_PATH"));
        match ssl::read_certificate(path) {
            Ok(info) => {
                let remaining = info.remaining();
                if remaining <= chrono::Duration::zero() {
                    HealthCheckResult::new("tls_certificate", Severity::Critical, format!("expired at {}", info.not_after))
                } else if remaining < chrono::Duration::hours(MIN_REMAINING_VALIDITY_HOURS) {
                    HealthCheckResult::new(
                        "tls_certificate",
                        Severity::Warning,
                        format!("expires soon ({})", info.not_after),
                    )
                } else {
                    HealthCheckResult::new(
                        "tls_certificate",
                        Severity::Ok,
                        format!("valid until {} ({} days)", info.not_after, remaining.num_days()),
                    )
                }
            }
            Err(e) => HealthCheckResult::new("tls_certificate", Severity::Critical, e),
        }
    }

    async fn disk_check(&self) -> HealthCheckResult {
        match self.observer.disk_usage_percent(&self.root_fs).await {
            Ok(pct) => HealthCheckResult::new("disk_usage", Severity::for_usage(pct), format!("{:.1}% used", pct)),
            Err(e) => HealthCheckResult::new("disk_usage", Severity::Warning, e),
        }
    }

    async fn memory_check(&self) -> HealthCheckResult {
        match self.observer.memory_usage_percent().await {
            Ok(pct) => HealthCheckResult::new("memory_usage", Severity::for_usage(pct), format!("{:.1}% used", pct)),
            Err(e) => HealthCheckResult::new("memory_usage", Severity::Warning, e),
        }
    }

    async fn fips_check(&self) -> HealthCheckResult {
        if !self.snapshot.get("FIPS_MODE").trim().eq_ignore_ascii_case("enabled") {
            return HealthCheckResult::new("fips_mode", Severity::Ok, "FIPS not requested");
        }
        match self.observer.kernel_fips_enabled().await {
            Some(true) => HealthCheckResult::new("fips_mode", Severity::Ok, "kernel FIPS flag set"),
            Some(false) => HealthCheckResult::new("fips_mode", Severity::Warning, "FIPS requested but kernel flag is 0"),
            None => HealthCheckResult::new("fips_mode", Severity::Warning, "FIPS requested but kernel flag is absent"),
        }
    }

    /// Runs the nine checks in their fixed order.
    pub async fn run(&self) -> HealthReport {
        let checks = vec![
            self.process_check("nginx_process", "nginx").await,
            self.process_check("webssh2_process", "node").await,
            self.proxy_health_check().await,
            self.backend_via_proxy_check().await,
            self.backend_port_check().await,
            self.certificate_check(),
            self.disk_check().await,
            self.memory_check().await,
            self.fips_check().await,
        ];

        for check in &checks {
            match check.severity {
                Severity::Ok => debug!(check = check.name, severity = %check.severity, message = %check.message, "Health check"),
                _ => warn!(check = check.name, severity = %check.severity, message = %check.message, "Health check"),
            }
        }

        let report = HealthReport::from_checks(checks);
        info!(overall = %report.overall, "Health probe finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fips::FipsDecision;
    use crate::sys::ssl::tests::tls_snapshot;
    use crate::sys::ssl::TlsProvisioner;
    use tempfile::TempDir;

    struct FakeObserver {
        processes: Vec<&'static str>,
        health_status: Result<u16, String>,
        ssh_status: Result<u16, String>,
        port_open: bool,
        disk: f64,
        memory: f64,
        kernel_fips: Option<bool>,
    }

    impl FakeObserver {
        fn healthy() -> Self {
            Self {
                processes: vec!["nginx", "node"],
                health_status: Ok(200),
                ssh_status: Ok(200),
                port_open: true,
                disk: 40.0,
                memory: 50.0,
                kernel_fips: Some(true),
            }
        }
    }

    #[async_trait]
    impl HostObserver for FakeObserver {
        async fn process_running(&self, name: &str) -> bool {
            self.processes.contains(&name)
        }
        async fn https_status(&self, url: &str, _timeout: Duration) -> Result<u16, String> {
            if url.ends_with("/health") {
                self.health_status.clone()
            } else {
                self.ssh_status.clone()
            }
        }
        async fn tcp_connectable(&self, _addr: SocketAddr, _timeout: Duration) -> bool {
            self.port_open
        }
        async fn disk_usage_percent(&self, _path: &Path) -> Result<f64, String> {
            Ok(self.disk)
        }
        async fn memory_usage_percent(&self) -> Result<f64, String> {
            Ok(self.memory)
        }
        async fn kernel_fips_enabled(&self) -> Option<bool> {
            self.kernel_fips
        }
    }

    async fn provisioned_snapshot(dir: &Path, extra: &[(&str, &str)]) -> ConfigurationSnapshot {
        let snapshot = tls_snapshot(dir, extra);
        TlsProvisioner::new(&snapshot, &FipsDecision::disabled())
            .provision()
            .await
            .unwrap();
        snapshot
    }

    #[test]
    fn usage_thresholds() {
        assert_eq!(Severity::for_usage(89.9), Severity::Ok);
        assert_eq!(Severity::for_usage(90.0), Severity::Warning);
        assert_eq!(Severity::for_usage(94.9), Severity::Warning);
        assert_eq!(Severity::for_usage(95.0), Severity::Critical);
    }

    #[test]
    fn overall_is_the_maximum_severity() {
        let combos = [
            (vec![Severity::Ok, Severity::Ok], Severity::Ok),
            (vec![Severity::Ok, Severity::Warning, Severity::Ok], Severity::Warning),
            (vec![Severity::Warning, Severity::Critical, Severity::Ok], Severity::Critical),
            (vec![], Severity::Ok),
        ];
        for (severities, expected) in combos {
            let checks = severities
                .into_iter()
                .map(|s| HealthCheckResult::new("c", s, ""))
                .collect();
            let report = HealthReport::from_checks(checks);
            assert_eq!(report.overall, expected);
            assert_eq!(report.exit_code(), expected.exit_code());
        }
    }

    #[test]
    fn meminfo_parsing() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(memory_usage_from_meminfo(meminfo).unwrap(), 75.0);
        assert!(memory_usage_from_meminfo("MemTotal: 10 kB\n").is_err());
    }

    #[test]
    fn disk_usage_excludes_reserved_blocks() {
        // 1000 blocks, 60 free of which 50 are reserved for root.
        let pct = disk_usage_from_blocks(1000, 60, 10).unwrap();
        assert!((pct - 940.0 / 950.0 * 100.0).abs() < 1e-9);
        assert_eq!(Severity::for_usage(pct), Severity::Critical);
        assert_eq!(disk_usage_from_blocks(0, 0, 0), None);
    }

    /// Writes a certificate whose notAfter is midnight UTC `days` from today.
    fn write_certificate_expiring(path: &Path, days: i64) {
        use chrono::Datelike;
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let start = chrono::Utc::now() - chrono::Duration::days(30);
        let end = chrono::Utc::now() + chrono::Duration::days(days);
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
        let cert = params.self_signed(&key).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, cert.pem()).unwrap();
    }

    #[tokio::test]
    async fn certificate_expiring_within_a_day_warns() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        write_certificate_expiring(Path::new(snapshot.get("TLS_CERT_PATH")), 1);

        let report = HealthProbe::new(&snapshot, &FakeObserver::healthy()).run().await;
        let cert = report.checks.iter().find(|c| c.name == "tls_certificate").unwrap();
        assert_eq!(cert.severity, Severity::Warning, "{}", cert.message);
        assert_eq!(report.overall, Severity::Warning);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn expired_certificate_is_critical() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        write_certificate_expiring(Path::new(snapshot.get("TLS_CERT_PATH")), -1);

        let report = HealthProbe::new(&snapshot, &FakeObserver::healthy()).run().await;
        let cert = report.checks.iter().find(|c| c.name == "tls_certificate").unwrap();
        assert_eq!(cert.severity, Severity::Critical);
        assert!(cert.message.contains("expired"));
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn healthy_host_reports_ok_in_order() {
        let dir = TempDir::new().unwrap();
        let snapshot = provisioned_snapshot(dir.path(), &[]).await;
        let observer = FakeObserver::healthy();

        let report = HealthProbe::new(&snapshot, &observer).run().await;

        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "nginx_process",
                "webssh2_process",
                "nginx_health_endpoint",
                "webssh2_via_proxy",
                "webssh2_port",
                "tls_certificate",
                "disk_usage",
                "memory_usage",
                "fips_mode",
            ]
        );
        assert_eq!(report.overall, Severity::Ok, "{}", report.render_text());
        assert_eq!(report.exit_code(), 0);
        assert!(report.render_text().ends_with("Overall status: OK\n"));
    }

    #[tokio::test]
    async fn full_disk_is_critical() {
        let dir = TempDir::new().unwrap();
        let snapshot = provisioned_snapshot(dir.path(), &[]).await;
        let observer = FakeObserver {
            disk: 96.0,
            ..FakeObserver::healthy()
        };

        let report = HealthProbe::new(&snapshot, &observer).run().await;

        let disk = report.checks.iter().find(|c| c.name == "disk_usage").unwrap();
        assert_eq!(disk.severity, Severity::Critical);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn slow_backend_behind_proxy_is_only_a_warning() {
        let dir = TempDir::new().unwrap();
        let snapshot = provisioned_snapshot(dir.path(), &[]).await;
        let observer = FakeObserver {
            ssh_status: Ok(502),
            ..FakeObserver::healthy()
        };

        let report = HealthProbe::new(&snapshot, &observer).run().await;
        assert_eq!(report.overall, Severity::Warning);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn missing_processes_and_certificate_are_critical() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        let observer = FakeObserver {
            processes: vec![],
            health_status: Err("connection refused".into()),
            port_open: false,
            ..FakeObserver::healthy()
        };

        let report = HealthProbe::new(&snapshot, &observer).run().await;

        let critical: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| c.severity == Severity::Critical)
            .map(|c| c.name)
            .collect();
        assert_eq!(
            critical,
            vec!["nginx_process", "webssh2_process", "nginx_health_endpoint", "webssh2_port", "tls_certificate"]
        );
    }

    #[tokio::test]
    async fn fips_requested_without_kernel_flag_warns() {
        let dir = TempDir::new().unwrap();
        let snapshot = provisioned_snapshot(dir.path(), &[("FIPS_MODE", "enabled")]).await;
        let observer = FakeObserver {
            kernel_fips: None,
            ..FakeObserver::healthy()
        };

        let report = HealthProbe::new(&snapshot, &observer).run().await;
        let fips = report.checks.last().unwrap();
        assert_eq!(fips.name, "fips_mode");
        assert_eq!(fips.severity, Severity::Warning);
    }

    #[test]
    fn report_serializes_with_uppercase_severity() {
        let report = HealthReport::from_checks(vec![HealthCheckResult::new("disk_usage", Severity::Warning, "91.0% used")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall"], "WARNING");
        assert_eq!(json["checks"][0]["name"], "disk_usage");
    }
}
