// src/sys/backend.rs
//
// WebSSH2 backend environment: export, FIPS preset enforcement, sanity checks.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::fips::FipsDecision;
use crate::sys::secrets::SecretValue;
use crate::sys::traits::BackendRuntime;

pub const MIN_NODE_MAJOR: u32 = 18;
pub const BACKEND_ENV_FILE: &str = "webssh2.env";
pub const SESSION_SECRET_KEY: &str = "WEBSSH2_SESSION_SECRET";

/// Keys handed to the backend verbatim (empty values are dropped).
const EXPORTED_KEYS: &[&str] = &[
    "WEBSSH2_LISTEN_IP",
    "WEBSSH2_LISTEN_PORT",
    "WEBSSH2_SSH_HOST",
    "WEBSSH2_SSH_PORT",
    "WEBSSH2_SSH_TERM",
    "WEBSSH2_SSH_READY_TIMEOUT",
    "WEBSSH2_SSH_KEEPALIVE_INTERVAL",
    "WEBSSH2_SSH_KEEPALIVE_COUNT_MAX",
    "WEBSSH2_SSH_ALGORITHMS_PRESET",
    "WEBSSH2_SESSION_NAME",
    "WEBSSH2_HEADER_TEXT",
    "WEBSSH2_HEADER_BACKGROUND",
    "WEBSSH2_OPTIONS_ALLOW_REAUTH",
    "WEBSSH2_OPTIONS_ALLOW_RECONNECT",
    "WEBSSH2_OPTIONS_ALLOW_REPLAY",
    "WEBSSH2_HTTP_ORIGINS",
    "WEBSSH2_LOG_LEVEL",
];

/// 🛡️ FIPS 140-approved SSH algorithm lists, exported alongside the forced preset.
pub const FIPS_SSH_ALGORITHMS: &[(&str, &str)] = &[
    (
        "WEBSSH2_SSH_ALGORITHMS_KEX",
        "ecdh-sha2-nistp256,ecdh-sha2-nistp384,ecdh-sha2-nistp521,diffie-hellman-group14-sha256,diffie-hellman-group16-sha512",
    ),
    (
        "WEBSSH2_SSH_ALGORITHMS_CIPHER",
        "aes128-gcm@openssh.com,aes256-gcm@openssh.com,aes128-ctr,aes192-ctr,aes256-ctr",
    ),
    ("WEBSSH2_SSH_ALGORITHMS_HMAC", "hmac-sha2-256,hmac-sha2-512"),
    ("WEBSSH2_SSH_ALGORITHMS_COMPRESS", "none"),
    (
        "WEBSSH2_SSH_ALGORITHMS_SERVERHOSTKEY",
        "ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,ecdsa-sha2-nistp521,rsa-sha2-256,rsa-sha2-512",
    ),
];

// ==============================================================================
// 1. Algorithm Presets
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmPreset {
    Modern,
    Legacy,
    Strict,
    Fips,
}

impl AlgorithmPreset {
    pub fn parse(raw: &str) -> Result<Self, BootstrapError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "modern" => Ok(Self::Modern),
            "legacy" => Ok(Self::Legacy),
            "strict" => Ok(Self::Strict),
            "fips" => Ok(Self::Fips),
            other => Err(BootstrapError::Config(format!(
                "invalid WEBSSH2_SSH_ALGORITHMS_PRESET '{}' (expected modern, legacy, strict or fips)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modern => "modern",
            Self::Legacy => "legacy",
            Self::Strict => "strict",
            Self::Fips => "fips",
        }
    }

    pub fn is_fips_safe(&self) -> bool {
        matches!(self, Self::Strict | Self::Fips)
    }
}

// ==============================================================================
// 2. Environment
// ==============================================================================

pub struct BackendEnvironment {
    exports: BTreeMap<String, String>,
    session_secret: SecretValue,
    pub secret_generated: bool,
    pub preset: AlgorithmPreset,
}

impl BackendEnvironment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.exports.get(key).map(String::as_str)
    }

    /// Non-secret exports, for logging and `env`-style display.
    pub fn public_exports(&self) -> &BTreeMap<String, String> {
        &self.exports
    }

    /// Full variable set for the child process, secret included.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self.exports.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.session_secret
            .use_secret(|secret| vars.push((SESSION_SECRET_KEY.to_string(), secret.to_string())));
        vars
    }

    fn render_env_file(&self) -> SecretValue {
        let mut out = String::from("# Generated by webssh2-gateway. Do not edit.\n");
        for (key, value) in self.process_env() {
            out.push_str(&format!("export {}='{}'\n", key, value.replace('\'', r"'\''")));
        }
        SecretValue::new(out)
    }

    /// Atomic write with mode 0600; the file carries the session secret.
    pub fn write_env_file(&self, path: &Path) -> Result<(), BootstrapError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        self.render_env_file()
            .use_secret(|contents| tmp.write_all(contents.as_bytes()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| BootstrapError::Backend(format!("failed to persist {}: {}", path.display(), e.error)))?;
        Ok(())
    }
}

/// `localhost` becomes the loopback literal; other values pass through trimmed.
pub fn normalize_listen_ip(raw: &str) -> String {
    let ip = raw.trim();
    if ip.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        ip.to_string()
    }
}

fn validate_listen_ip(ip: &str) -> Result<(), BootstrapError> {
    let dotted = Regex::new(r"^(25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])(\.(25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])){3}$")
        .map_err(|e| BootstrapError::Invariant(e.to_string()))?;
    if dotted.is_match(ip) {
        Ok(())
    } else {
        Err(BootstrapError::Config(format!(
            "WEBSSH2_LISTEN_IP '{}' is not an IPv4 address, 0.0.0.0 or 127.0.0.1",
            ip
        )))
    }
}

/// `v20.11.1` → 20
pub fn parse_major_version(raw: &str) -> Option<u32> {
    raw.trim().trim_start_matches('v').split('.').next()?.parse().ok()
}

// ==============================================================================
// 3. Runtime (node)
// ==============================================================================

pub struct NodeRuntime {
    binary: String,
}

impl NodeRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl BackendRuntime for NodeRuntime {
    async fn runtime_version(&self) -> Result<String, String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| format!("{} not runnable: {}", self.binary, e))?;
        if !output.status.success() {
            return Err(format!("{} --version exited with {}", self.binary, output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ==============================================================================
// 4. Renderer
// ==============================================================================

pub struct BackendRenderer<'a> {
    snapshot: &'a ConfigurationSnapshot,
    fips: &'a FipsDecision,
    runtime: &'a dyn BackendRuntime,
}

impl<'a> BackendRenderer<'a> {
    pub fn new(snapshot: &'a ConfigurationSnapshot, fips: &'a FipsDecision, runtime: &'a dyn BackendRuntime) -> Self {
        Self {
            snapshot,
            fips,
            runtime,
        }
    }

    fn default_origins(&self) -> Result<String, BootstrapError> {
        let port = self.snapshot.port("NGINX_LISTEN_PORT")?;
        let server_name = self.snapshot.get("NGINX_SERVER_NAME").trim();
        let mut origins = vec![format!("https://{}:{}", server_name, port)];
        if !server_name.eq_ignore_ascii_case("localhost") {
            origins.push(format!("https://localhost:{}", port));
        }
        Ok(origins.join(","))
    }

    fn resolve_preset(&self) -> Result<AlgorithmPreset, BootstrapError> {
        let requested = AlgorithmPreset::parse(self.snapshot.get("WEBSSH2_SSH_ALGORITHMS_PRESET"))?;
        if self.fips.is_enabled() && !requested.is_fips_safe() {
            warn!(
                requested = requested.as_str(),
                forced = AlgorithmPreset::Fips.as_str(),
                "🛡️ FIPS enabled: SSH algorithm preset is not FIPS-safe, forcing 'fips'"
            );
            return Ok(AlgorithmPreset::Fips);
        }
        Ok(requested)
    }

    async fn validate_app(&self) -> Result<(), BootstrapError> {
        let app_dir = Path::new(self.snapshot.get("WEBSSH2_APP_DIR"));
        for required in ["package.json", "node_modules"] {
            if !app_dir.join(required).exists() {
                return Err(BootstrapError::Backend(format!(
                    "{} missing from backend app dir {}",
                    required,
                    app_dir.display()
                )));
            }
        }

        let version = self.runtime.runtime_version().await.map_err(BootstrapError::Backend)?;
        match parse_major_version(&version) {
            Some(major) if major >= MIN_NODE_MAJOR => {
                debug!(%version, "Backend runtime version OK");
                Ok(())
            }
            Some(_) => Err(BootstrapError::Backend(format!(
                "node {} is too old (need >= {})",
                version, MIN_NODE_MAJOR
            ))),
            None => Err(BootstrapError::Backend(format!("unrecognized node version '{}'", version))),
        }
    }

    pub async fn render(&self) -> Result<BackendEnvironment, BootstrapError> {
        let listen_port = self.snapshot.port("WEBSSH2_LISTEN_PORT")?;
        self.snapshot.port("WEBSSH2_SSH_PORT")?;
        let listen_ip = normalize_listen_ip(self.snapshot.get("WEBSSH2_LISTEN_IP"));
        validate_listen_ip(&listen_ip)?;
        for flag in [
            "WEBSSH2_OPTIONS_ALLOW_REAUTH",
            "WEBSSH2_OPTIONS_ALLOW_RECONNECT",
            "WEBSSH2_OPTIONS_ALLOW_REPLAY",
        ] {
            self.snapshot.flag(flag)?;
        }
        let preset = self.resolve_preset()?;
        self.validate_app().await?;

        let mut exports: BTreeMap<String, String> = EXPORTED_KEYS
            .iter()
            .map(|k| (k.to_string(), self.snapshot.get(k).trim().to_string()))
            .collect();
        exports.insert("WEBSSH2_LISTEN_IP".into(), listen_ip.clone());
        exports.insert("WEBSSH2_SSH_ALGORITHMS_PRESET".into(), preset.as_str().into());
        if self.snapshot.is_empty_value("WEBSSH2_HTTP_ORIGINS") {
            exports.insert("WEBSSH2_HTTP_ORIGINS".into(), self.default_origins()?);
        }
        if self.fips.is_enabled() {
            for (key, list) in FIPS_SSH_ALGORITHMS {
                exports.insert(key.to_string(), list.to_string());
            }
        }
        exports.retain(|_, v| !v.is_empty());
        exports.insert("PORT".into(), listen_port.to_string());

        let (session_secret, secret_generated) = if self.snapshot.is_empty_value(SESSION_SECRET_KEY) {
            warn!(
                "WEBSSH2_SESSION_SECRET not set: generated an ephemeral secret. Sessions will not survive a restart; pin it in production"
            );
            (SecretValue::generate_session_secret(), true)
        } else {
            (SecretValue::new(self.snapshot.get(SESSION_SECRET_KEY).to_string()), false)
        };

        info!(
            listen = %format!("{}:{}", listen_ip, listen_port),
            preset = preset.as_str(),
            exported = exports.len() + 1,
            "Backend environment rendered"
        );

        Ok(BackendEnvironment {
            exports,
            session_secret,
            secret_generated,
            preset,
        })
    }
}

/// Backend export lives next to the configuration snapshot.
pub fn env_file_path(snapshot_path: &Path) -> PathBuf {
    snapshot_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BACKEND_ENV_FILE)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::sys::fips::FipsState;
    use tempfile::TempDir;

    pub struct FakeRuntime(pub Result<String, String>);

    #[async_trait]
    impl BackendRuntime for FakeRuntime {
        async fn runtime_version(&self) -> Result<String, String> {
            self.0.clone()
        }
    }

    pub fn node20() -> FakeRuntime {
        FakeRuntime(Ok("v20.11.1".into()))
    }

    pub fn app_dir(root: &Path) -> PathBuf {
        let app = root.join("webssh2");
        std::fs::create_dir_all(app.join("node_modules")).unwrap();
        std::fs::write(app.join("package.json"), "{}").unwrap();
        app
    }

    fn snapshot_with_app(root: &Path, extra: &[(&str, &str)]) -> ConfigurationSnapshot {
        let app = app_dir(root).display().to_string();
        let mut pairs: Vec<(&str, &str)> = vec![("WEBSSH2_APP_DIR", app.as_str())];
        pairs.extend_from_slice(extra);
        ConfigurationSnapshot::with_overrides(&pairs)
    }

    fn fips_on() -> FipsDecision {
        FipsDecision {
            state: FipsState::EnabledDegraded,
            trail: Vec::new(),
        }
    }

    #[tokio::test]
    async fn empty_values_are_omitted_and_port_mirrored() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_SESSION_SECRET", "pinned")]);
        let env = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .unwrap();

        assert!(env.get("WEBSSH2_SSH_HOST").is_none());
        assert!(env.get("WEBSSH2_HEADER_TEXT").is_none());
        assert_eq!(env.get("PORT"), Some("2222"));
        assert_eq!(env.get("WEBSSH2_HTTP_ORIGINS"), Some("https://localhost:443"));
        assert!(env.get("WEBSSH2_SSH_ALGORITHMS_KEX").is_none());
        assert!(!env.secret_generated);
        assert!(!env.public_exports().contains_key(SESSION_SECRET_KEY));
        assert!(env.process_env().contains(&(SESSION_SECRET_KEY.to_string(), "pinned".to_string())));
    }

    #[tokio::test]
    async fn named_server_adds_localhost_origin() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("NGINX_SERVER_NAME", "ssh.example.com")]);
        let env = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .unwrap();
        assert_eq!(
            env.get("WEBSSH2_HTTP_ORIGINS"),
            Some("https://ssh.example.com:443,https://localhost:443")
        );
    }

    #[tokio::test]
    async fn fips_forces_safe_preset_and_exports_algorithm_lists() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_SSH_ALGORITHMS_PRESET", "modern")]);
        let env = BackendRenderer::new(&snapshot, &fips_on(), &node20()).render().await.unwrap();

        assert_eq!(env.preset, AlgorithmPreset::Fips);
        assert_eq!(env.get("WEBSSH2_SSH_ALGORITHMS_PRESET"), Some("fips"));
        assert_eq!(env.get("WEBSSH2_SSH_ALGORITHMS_COMPRESS"), Some("none"));
        assert!(!env.get("WEBSSH2_SSH_ALGORITHMS_CIPHER").unwrap().contains("chacha20"));
    }

    #[tokio::test]
    async fn strict_preset_is_kept_under_fips() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_SSH_ALGORITHMS_PRESET", "strict")]);
        let env = BackendRenderer::new(&snapshot, &fips_on(), &node20()).render().await.unwrap();
        assert_eq!(env.preset, AlgorithmPreset::Strict);
    }

    #[tokio::test]
    async fn unknown_preset_is_fatal() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_SSH_ALGORITHMS_PRESET", "fast")]);
        let err = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::Config(_)));
    }

    #[tokio::test]
    async fn missing_secret_is_generated() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[]);
        let env = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .unwrap();
        assert!(env.secret_generated);
        let secret = env
            .process_env()
            .into_iter()
            .find(|(k, _)| k == SESSION_SECRET_KEY)
            .map(|(_, v)| v)
            .unwrap();
        assert_eq!(secret.len(), 64);
    }

    #[tokio::test]
    async fn localhost_listen_ip_is_normalized() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_LISTEN_IP", "localhost")]);
        let env = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .unwrap();
        assert_eq!(env.get("WEBSSH2_LISTEN_IP"), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn validation_failures_are_fatal() {
        let dir = TempDir::new().unwrap();
        let cases: Vec<(Vec<(&str, &str)>, FakeRuntime)> = vec![
            (vec![("WEBSSH2_LISTEN_IP", "10.0.0.256")], node20()),
            (vec![("WEBSSH2_LISTEN_IP", "::1")], node20()),
            (vec![("WEBSSH2_SSH_PORT", "0")], node20()),
            (vec![("WEBSSH2_LISTEN_PORT", "65536")], node20()),
            (vec![], FakeRuntime(Ok("v16.20.2".into()))),
            (vec![], FakeRuntime(Err("node: not found".into()))),
        ];
        for (extra, runtime) in cases {
            let snapshot = snapshot_with_app(dir.path(), &extra);
            let result = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &runtime)
                .render()
                .await;
            assert!(result.is_err(), "expected failure for {:?}", extra);
        }
    }

    #[tokio::test]
    async fn missing_app_dependencies_are_fatal() {
        let dir = TempDir::new().unwrap();
        let snapshot = ConfigurationSnapshot::with_overrides(&[("WEBSSH2_APP_DIR", dir.path().to_str().unwrap())]);
        let err = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::Backend(_)));
        assert!(err.to_string().contains("package.json"));
    }

    #[tokio::test]
    async fn env_file_is_private_and_sourceable() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with_app(dir.path(), &[("WEBSSH2_HEADER_TEXT", "Ops' box")]);
        let env = BackendRenderer::new(&snapshot, &FipsDecision::disabled(), &node20())
            .render()
            .await
            .unwrap();

        let path = env_file_path(&dir.path().join("run/environment"));
        env.write_env_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let parsed = crate::config::parse_env_file(&std::fs::read_to_string(&path).unwrap());
        assert!(parsed.contains(&("WEBSSH2_HEADER_TEXT".to_string(), "Ops' box".to_string())));
        assert!(parsed.iter().any(|(k, _)| k == SESSION_SECRET_KEY));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_major_version("v18.0.0"), Some(18));
        assert_eq!(parse_major_version("20.1"), Some(20));
        assert_eq!(parse_major_version("node"), None);
    }
}
