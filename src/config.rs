// src/config.rs

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::BootstrapError;

// ==============================================================================
// 1. Recognized Keys & Documented Defaults
// ==============================================================================

pub const DEFAULT_SSL_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:\
ECDHE-RSA-CHACHA20-POLY1305:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384";

pub const DEFAULT_CSP_POLICY: &str = "default-src 'self'; script-src 'self' 'unsafe-inline'; \
style-src 'self' 'unsafe-inline'; img-src 'self' data:; font-src 'self' data:; \
connect-src 'self' wss: ws:; frame-ancestors 'self'";

/// Every key the gateway understands, with the value used when the operator
/// leaves it unset. An empty default means "optional".
pub const DEFAULTS: &[(&str, &str)] = &[
    // --- TLS ---
    ("TLS_MODE", "self-signed"),
    ("TLS_CERT_PATH", "/etc/nginx/certs/cert.pem"),
    ("TLS_KEY_PATH", "/etc/nginx/certs/key.pem"),
    ("TLS_CHAIN_PATH", ""),
    ("TLS_CERT_CONTENT", ""),
    ("TLS_KEY_CONTENT", ""),
    ("TLS_CHAIN_CONTENT", ""),
    ("TLS_KEY_SIZE", "2048"),
    ("TLS_VALIDITY_DAYS", "365"),
    ("TLS_CN", "localhost"),
    ("TLS_COUNTRY", "US"),
    ("TLS_STATE", "State"),
    ("TLS_LOCALITY", "City"),
    ("TLS_ORGANIZATION", "WebSSH2"),
    ("TLS_ORGANIZATIONAL_UNIT", "IT"),
    ("TLS_SAN_EXTRA", ""),
    ("TLS_DHPARAM_PATH", "/etc/nginx/certs/dhparam.pem"),
    ("TLS_DHPARAM_SIZE", "2048"),
    // --- mTLS ---
    ("MTLS_ENABLED", "false"),
    ("MTLS_CA_CERT", "/etc/nginx/certs/ca.pem"),
    ("MTLS_VERIFY_DEPTH", "2"),
    ("MTLS_OPTIONAL", "false"),
    // --- FIPS ---
    ("FIPS_MODE", "disabled"),
    ("FIPS_CHECK", "true"),
    // --- NGINX ---
    ("NGINX_BIN", "nginx"),
    ("NGINX_USER", "nginx"),
    ("NGINX_CONF_DIR", "/etc/nginx"),
    ("NGINX_TEMPLATE_DIR", "/etc/nginx/templates"),
    ("NGINX_LOG_DIR", "/var/log/nginx"),
    ("NGINX_RUN_DIR", "/var/run/nginx"),
    ("NGINX_LISTEN_PORT", "443"),
    ("NGINX_HTTP_PORT", "80"),
    ("NGINX_SERVER_NAME", "localhost"),
    ("NGINX_WORKER_PROCESSES", "auto"),
    ("NGINX_WORKER_CONNECTIONS", "1024"),
    ("NGINX_CLIENT_MAX_BODY_SIZE", "1m"),
    ("NGINX_KEEPALIVE_TIMEOUT", "65"),
    ("NGINX_PROXY_CONNECT_TIMEOUT", "60s"),
    ("NGINX_PROXY_READ_TIMEOUT", "3600s"),
    ("NGINX_PROXY_SEND_TIMEOUT", "3600s"),
    ("NGINX_ACCESS_LOG", "true"),
    ("NGINX_ERROR_LOG_LEVEL", "warn"),
    ("NGINX_SSL_PROTOCOLS", "TLSv1.2 TLSv1.3"),
    ("NGINX_SSL_CIPHERS", DEFAULT_SSL_CIPHERS),
    ("NGINX_SSL_SESSION_TIMEOUT", "1d"),
    ("NGINX_SSL_SESSION_CACHE", "shared:SSL:10m"),
    // --- WebSSH2 backend ---
    ("WEBSSH2_NODE_BIN", "node"),
    ("WEBSSH2_APP_DIR", "/usr/src/webssh2"),
    ("WEBSSH2_LOG_DIR", "/var/log/webssh2"),
    ("WEBSSH2_LISTEN_IP", "127.0.0.1"),
    ("WEBSSH2_LISTEN_PORT", "2222"),
    ("WEBSSH2_SSH_HOST", ""),
    ("WEBSSH2_SSH_PORT", "22"),
    ("WEBSSH2_SSH_TERM", "xterm-color"),
    ("WEBSSH2_SSH_READY_TIMEOUT", "20000"),
    ("WEBSSH2_SSH_KEEPALIVE_INTERVAL", "120000"),
    ("WEBSSH2_SSH_KEEPALIVE_COUNT_MAX", "10"),
    ("WEBSSH2_SSH_ALGORITHMS_PRESET", "modern"),
    ("WEBSSH2_SESSION_NAME", "webssh2.sid"),
    ("WEBSSH2_SESSION_SECRET", ""),
    ("WEBSSH2_HEADER_TEXT", ""),
    ("WEBSSH2_HEADER_BACKGROUND", "green"),
    ("WEBSSH2_OPTIONS_ALLOW_REAUTH", "true"),
    ("WEBSSH2_OPTIONS_ALLOW_RECONNECT", "true"),
    ("WEBSSH2_OPTIONS_ALLOW_REPLAY", "false"),
    ("WEBSSH2_HTTP_ORIGINS", ""),
    ("WEBSSH2_LOG_LEVEL", "info"),
    // --- Security headers ---
    ("SECURITY_HEADERS", "true"),
    ("SECURITY_FRAME_OPTIONS", "SAMEORIGIN"),
    ("SECURITY_REFERRER_POLICY", "strict-origin-when-cross-origin"),
    ("HSTS_ENABLED", "true"),
    ("HSTS_MAX_AGE", "31536000"),
    ("HSTS_INCLUDE_SUBDOMAINS", "true"),
    ("HSTS_PRELOAD", "false"),
    ("CSP_ENABLED", "true"),
    ("CSP_POLICY", DEFAULT_CSP_POLICY),
    // --- Supervisor ---
    ("SUPERVISOR_RESTART_DELAY_SECS", "3"),
];

/// Keys whose values never appear in logs or `env` output.
pub const SENSITIVE_KEYS: &[&str] = &["WEBSSH2_SESSION_SECRET", "TLS_KEY_CONTENT"];

pub const DEFAULT_ENV_FILE: &str = "/etc/webssh2-gateway/gateway.env";
pub const DEFAULT_SNAPSHOT_PATH: &str = "/run/webssh2-gateway/environment";

pub fn is_recognized(key: &str) -> bool {
    DEFAULTS.iter().any(|(k, _)| *k == key)
}

// ==============================================================================
// 2. ConfigurationSnapshot
// ==============================================================================

/// Immutable, fully-defaulted view of the gateway configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    values: BTreeMap<String, String>,
}

impl ConfigurationSnapshot {
    /// Layers defaults, then the env-file (if any), then the process environment.
    pub fn resolve<I>(process_env: I, env_file: Option<&Path>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut values: BTreeMap<String, String> = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if let Some(path) = env_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    for (key, value) in parse_env_file(&contents) {
                        if is_recognized(&key) {
                            values.insert(key, value);
                        } else {
                            debug!(key = %key, "Ignoring unrecognized key in env file");
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No env file mounted");
                }
                Err(e) => warn!(path = %path.display(), "Env file unreadable, skipping: {}", e),
            }
        }

        for (key, value) in process_env {
            if is_recognized(&key) {
                values.insert(key, value);
            }
        }

        Self { values }
    }

    pub fn from_process(env_file: Option<&Path>) -> Self {
        Self::resolve(std::env::vars(), env_file)
    }

    /// Defaults plus explicit overrides, without touching the real environment.
    #[cfg(test)]
    pub fn with_overrides(pairs: &[(&str, &str)]) -> Self {
        Self::resolve(
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())),
            None,
        )
    }

    /// Value for a recognized key. Unrecognized keys read as empty.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn is_empty_value(&self, key: &str) -> bool {
        self.get(key).trim().is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Strict boolean parse. Anything outside the accepted spellings is a config error.
    pub fn flag(&self, key: &str) -> Result<bool, BootstrapError> {
        parse_flag(self.get(key))
            .ok_or_else(|| BootstrapError::Config(format!("{} must be true or false, got '{}'", key, self.get(key))))
    }

    /// TCP port in 1..=65535.
    pub fn port(&self, key: &str) -> Result<u16, BootstrapError> {
        let raw = self.get(key).trim();
        match raw.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
            _ => Err(BootstrapError::Config(format!(
                "{} must be a port between 1 and 65535, got '{}'",
                key, raw
            ))),
        }
    }

    pub fn number<T: FromStr>(&self, key: &str) -> Result<T, BootstrapError> {
        self.get(key)
            .trim()
            .parse::<T>()
            .map_err(|_| BootstrapError::Config(format!("{} must be numeric, got '{}'", key, self.get(key))))
    }

    /// Copy of the values with sensitive entries masked.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if SENSITIVE_KEYS.contains(&k.as_str()) && !v.is_empty() {
                    "[REDACTED]".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }

    // ==========================================================================
    // 3. Serialization (sourceable by shells and by standalone stages)
    // ==========================================================================

    pub fn to_env_file(&self) -> String {
        let mut out = String::from("# Generated by webssh2-gateway. Do not edit.\n");
        for (key, value) in &self.values {
            out.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
        out
    }

    /// Writes the snapshot atomically with mode 0600 (it may hold secrets).
    pub fn persist(&self, path: &Path) -> Result<(), BootstrapError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_env_file().as_bytes())?;
        tmp.as_file().sync_all()?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        tmp.persist(path)
            .map_err(|e| BootstrapError::Io(format!("failed to persist snapshot: {}", e.error)))?;

        debug!(path = %path.display(), keys = self.len(), "Configuration snapshot written");
        Ok(())
    }

    /// Reads a previously persisted snapshot; keys missing from the file take defaults.
    pub fn load_serialized(path: &Path) -> Result<Self, BootstrapError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BootstrapError::Io(format!("cannot read snapshot {}: {}", path.display(), e)))?;
        Ok(Self::resolve(parse_env_file(&contents), None))
    }
}

impl fmt::Debug for ConfigurationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationSnapshot")
            .field("values", &self.redacted())
            .finish()
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ==============================================================================
// 4. Env-file Grammar
// ==============================================================================

/// Parses `KEY=VALUE` lines. Supports `export`, comments and shell-style quoting.
/// A quoted value may span several lines.
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut lines = contents.lines().enumerate();
    while let Some((lineno, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let body = line.trim_start();
        let body = body.strip_prefix("export ").unwrap_or(body).trim_start();
        let Some((key, raw_value)) = body.split_once('=') else {
            warn!(line = lineno + 1, "Skipping malformed env-file line");
            continue;
        };
        let key = key.trim();
        let valid_key = !key.is_empty()
            && !key.starts_with(|c: char| c.is_ascii_digit())
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_key {
            warn!(line = lineno + 1, "Skipping env-file line with invalid key");
            continue;
        }

        let mut raw = raw_value.trim_start().to_string();
        let value = loop {
            if let Some(value) = unquote(raw.trim_end()) {
                break Some(value);
            }
            match lines.next() {
                Some((_, next)) => {
                    raw.push('\n');
                    raw.push_str(next);
                }
                None => break None,
            }
        };
        match value {
            Some(value) => pairs.push((key.to_string(), value)),
            None => warn!(line = lineno + 1, key = %key, "Skipping env-file line with unterminated quote"),
        }
    }
    pairs
}

fn unquote(raw: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next()? {
                    '\'' => break,
                    other => out.push(other),
                }
            },
            '"' => loop {
                match chars.next()? {
                    '"' => break,
                    '\\' => match chars.next()? {
                        esc @ ('"' | '\\' | '$' | '`') => out.push(esc),
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    },
                    other => out.push(other),
                }
            },
            '\\' => out.push(chars.next()?),
            other => out.push(other),
        }
    }
    Some(out)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
