// src/sys/proxy.rs
//
// Ingress: renders the NGINX config tree and gates it on `nginx -t`.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::fips::FipsDecision;
use crate::sys::fsperm;
use crate::sys::ssl::{self, CertificateMaterial};
use crate::sys::traits::ProxyBinary;

pub const FIPS_SSL_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384";
pub const FIPS_SSL_PROTOCOLS: &str = "TLSv1.2 TLSv1.3";

/// Prefixes whose snapshot keys may be substituted into templates.
const TEMPLATE_PREFIXES: &[&str] = &["NGINX_", "TLS_", "MTLS_", "WEBSSH2_", "SECURITY_", "HSTS_", "CSP_"];

/// 🛡️ Zero-Trust: server names are spliced into config, so only hostname characters pass.
fn validate_domain_format(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }
    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(format!("Zero-Trust: Path traversal detected in domain: '{}'", domain));
    }
    if !domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '*') {
        return Err(format!("Zero-Trust: Invalid characters in domain name: '{}'", domain));
    }
    Ok(())
}

// ==============================================================================
// 1. Nginx Binary
// ==============================================================================

pub struct NginxBinary {
    binary: String,
}

impl NginxBinary {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl ProxyBinary for NginxBinary {
    async fn check_config(&self, config_path: &Path) -> Result<(), String> {
        let check = Command::new(&self.binary)
            .arg("-t")
            .arg("-c")
            .arg(config_path)
            .output()
            .await
            .map_err(|e| format!("Nginx check failed to start: {}", e))?;

        if !check.status.success() {
            return Err(format!("Nginx config error: {}", String::from_utf8_lossy(&check.stderr).trim()));
        }
        Ok(())
    }
}

// ==============================================================================
// 2. Template Set
// ==============================================================================

pub struct TemplateSpec {
    pub template: &'static str,
    /// Relative to `NGINX_CONF_DIR`.
    pub output: &'static str,
    pub builtin: &'static str,
    pub primary: bool,
}

pub const TEMPLATES: &[TemplateSpec] = &[
    TemplateSpec {
        template: "nginx.conf.template",
        output: "nginx.conf",
        builtin: include_str!("../../templates/nginx.conf.template"),
        primary: true,
    },
    TemplateSpec {
        template: "default.conf.template",
        output: "conf.d/default.conf",
        builtin: include_str!("../../templates/default.conf.template"),
        primary: false,
    },
    TemplateSpec {
        template: "ssl-params.conf.template",
        output: "snippets/ssl-params.conf",
        builtin: include_str!("../../templates/ssl-params.conf.template"),
        primary: false,
    },
    TemplateSpec {
        template: "security-headers.conf.template",
        output: "snippets/security-headers.conf",
        builtin: include_str!("../../templates/security-headers.conf.template"),
        primary: false,
    },
];

const SSL_PARAMS_OUTPUT: &str = "snippets/ssl-params.conf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedConfigSet {
    pub files: Vec<RenderedFile>,
}

impl RenderedConfigSet {
    pub fn primary(&self) -> Option<&Path> {
        self.files.iter().find(|f| f.primary).map(|f| f.path.as_path())
    }
}

// ==============================================================================
// 3. Allow-listed Substitution
// ==============================================================================

fn compile(pattern: &str) -> Result<Regex, BootstrapError> {
    Regex::new(pattern).map_err(|e| BootstrapError::Invariant(format!("bad pattern {}: {}", pattern, e)))
}

/// Replaces `${NAME}` / `$NAME` only when NAME is in `vars`. NGINX's own
/// `$variables` share the syntax and pass through untouched.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> Result<String, BootstrapError> {
    let pattern = compile(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")?;
    Ok(pattern
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned())
}

fn header_directive(enabled: bool, name: &str, value: &str) -> String {
    if enabled && !value.trim().is_empty() {
        format!("add_header {} \"{}\" always;", name, value.replace('"', "\\\""))
    } else {
        format!("# {} disabled", name)
    }
}

/// Snapshot keys under the template prefixes plus derived directives.
pub fn template_variables(
    snapshot: &ConfigurationSnapshot,
    fips: &FipsDecision,
    material: &CertificateMaterial,
) -> Result<BTreeMap<String, String>, BootstrapError> {
    let mut vars: BTreeMap<String, String> = snapshot
        .iter()
        .filter(|(k, _)| TEMPLATE_PREFIXES.iter().any(|p| k.starts_with(p)))
        .filter(|(k, _)| !crate::config::SENSITIVE_KEYS.contains(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    vars.insert("SSL_CERTIFICATE".into(), material.cert_path.display().to_string());
    vars.insert("SSL_CERTIFICATE_KEY".into(), material.key_path.display().to_string());
    vars.insert(
        "TRUSTED_CHAIN_DIRECTIVE".into(),
        match &material.chain_path {
            Some(chain) => format!("ssl_trusted_certificate {};", chain.display()),
            None => "# no certificate chain configured".into(),
        },
    );

    let dhparam = PathBuf::from(snapshot.get("TLS_DHPARAM_PATH"));
    vars.insert(
        "DHPARAM_DIRECTIVE".into(),
        if !fips.is_enabled() && !snapshot.is_empty_value("TLS_DHPARAM_PATH") && dhparam.exists() {
            format!("ssl_dhparam {};", dhparam.display())
        } else {
            "# ssl_dhparam not available".into()
        },
    );

    let listen_ip = crate::sys::backend::normalize_listen_ip(snapshot.get("WEBSSH2_LISTEN_IP"));
    let upstream_host = if listen_ip == "0.0.0.0" { "127.0.0.1".to_string() } else { listen_ip };
    vars.insert(
        "BACKEND_UPSTREAM".into(),
        format!("{}:{}", upstream_host, snapshot.port("WEBSSH2_LISTEN_PORT")?),
    );

    let headers_on = snapshot.flag("SECURITY_HEADERS")?;
    let mut hsts = format!("max-age={}", snapshot.number::<u64>("HSTS_MAX_AGE")?);
    if snapshot.flag("HSTS_INCLUDE_SUBDOMAINS")? {
        hsts.push_str("; includeSubDomains");
    }
    if snapshot.flag("HSTS_PRELOAD")? {
        hsts.push_str("; preload");
    }
    vars.insert(
        "HSTS_HEADER".into(),
        header_directive(headers_on && snapshot.flag("HSTS_ENABLED")?, "Strict-Transport-Security", &hsts),
    );
    vars.insert(
        "CSP_HEADER".into(),
        header_directive(
            headers_on && snapshot.flag("CSP_ENABLED")?,
            "Content-Security-Policy",
            snapshot.get("CSP_POLICY"),
        ),
    );
    vars.insert(
        "FRAME_OPTIONS_HEADER".into(),
        header_directive(headers_on, "X-Frame-Options", snapshot.get("SECURITY_FRAME_OPTIONS")),
    );
    vars.insert(
        "CONTENT_TYPE_OPTIONS_HEADER".into(),
        header_directive(headers_on, "X-Content-Type-Options", "nosniff"),
    );
    vars.insert(
        "REFERRER_POLICY_HEADER".into(),
        header_directive(headers_on, "Referrer-Policy", snapshot.get("SECURITY_REFERRER_POLICY")),
    );

    Ok(vars)
}

// ==============================================================================
// 4. Post-render Rewrites
// ==============================================================================

fn replace_directive(config: &str, directive: &str, value: &str) -> Result<String, BootstrapError> {
    let pattern = compile(&format!(r"(?m)^(\s*){}\s+[^;]*;", regex::escape(directive)))?;
    Ok(pattern
        .replace_all(config, |caps: &regex::Captures<'_>| format!("{}{} {};", &caps[1], directive, value))
        .into_owned())
}

pub fn apply_fips_overrides(ssl_params: &str) -> Result<String, BootstrapError> {
    let with_ciphers = replace_directive(ssl_params, "ssl_ciphers", FIPS_SSL_CIPHERS)?;
    replace_directive(&with_ciphers, "ssl_protocols", FIPS_SSL_PROTOCOLS)
}

/// `access_log off;` everywhere in the main config; `error_log` is left alone.
pub fn disable_access_log(main_config: &str) -> Result<String, BootstrapError> {
    replace_directive(main_config, "access_log", "off")
}

// ==============================================================================
// 5. Renderer
// ==============================================================================

pub struct NginxRenderer<'a> {
    snapshot: &'a ConfigurationSnapshot,
    fips: &'a FipsDecision,
    material: &'a CertificateMaterial,
    binary: &'a dyn ProxyBinary,
}

impl<'a> NginxRenderer<'a> {
    pub fn new(
        snapshot: &'a ConfigurationSnapshot,
        fips: &'a FipsDecision,
        material: &'a CertificateMaterial,
        binary: &'a dyn ProxyBinary,
    ) -> Self {
        Self {
            snapshot,
            fips,
            material,
            binary,
        }
    }

    fn conf_dir(&self) -> PathBuf {
        PathBuf::from(self.snapshot.get("NGINX_CONF_DIR"))
    }

    async fn load_template(&self, spec: &TemplateSpec) -> Result<String, BootstrapError> {
        let path = Path::new(self.snapshot.get("NGINX_TEMPLATE_DIR")).join(spec.template);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(template = spec.template, "Template not mounted, using built-in copy");
                Ok(spec.builtin.to_string())
            }
            Err(e) => Err(BootstrapError::Proxy(format!("cannot read template {}: {}", path.display(), e))),
        }
    }

    async fn write_rendered(&self, path: &Path, contents: &str) -> Result<(), BootstrapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, contents)
            .await
            .map_err(|e| BootstrapError::Proxy(format!("failed to write {}: {}", path.display(), e)))
    }

    pub async fn render(&self) -> Result<RenderedConfigSet, BootstrapError> {
        validate_domain_format(self.snapshot.get("NGINX_SERVER_NAME").trim()).map_err(BootstrapError::Config)?;
        self.snapshot.port("NGINX_LISTEN_PORT")?;
        self.snapshot.port("NGINX_HTTP_PORT")?;
        let access_log = self.snapshot.flag("NGINX_ACCESS_LOG")?;

        let vars = template_variables(self.snapshot, self.fips, self.material)?;
        let conf_dir = self.conf_dir();
        let mut files = Vec::with_capacity(TEMPLATES.len() + 1);

        for spec in TEMPLATES {
            let template = self.load_template(spec).await?;
            let mut rendered = substitute(&template, &vars)?;

            if spec.primary && !access_log {
                rendered = disable_access_log(&rendered)?;
                info!("Access logging disabled");
            }
            if spec.output == SSL_PARAMS_OUTPUT && self.fips.is_enabled() {
                rendered = apply_fips_overrides(&rendered)?;
                info!(protocols = FIPS_SSL_PROTOCOLS, "🛡️ FIPS cipher suite applied");
            }

            let path = conf_dir.join(spec.output);
            self.write_rendered(&path, &rendered).await?;
            debug!(path = %path.display(), "Rendered template");
            files.push(RenderedFile {
                path,
                primary: spec.primary,
            });
        }

        let mtls = ssl::mtls_fragment_path(self.snapshot);
        if !mtls.exists() {
            self.write_rendered(&mtls, "# mutual TLS disabled (MTLS_ENABLED=false)\n").await?;
        }
        files.push(RenderedFile {
            path: mtls,
            primary: false,
        });

        let set = RenderedConfigSet { files };
        let primary = set
            .primary()
            .ok_or_else(|| BootstrapError::Invariant("template set has no primary file".into()))?;
        self.binary
            .check_config(primary)
            .await
            .map_err(|e| BootstrapError::Proxy(format!("syntax check of {} failed: {}", primary.display(), e)))?;
        info!(path = %primary.display(), "Nginx configuration syntax OK");

        self.secure_layout()?;
        Ok(set)
    }

    /// Config tree 0755/0644 owned by the nginx user, key back to 0600, runtime dirs present.
    fn secure_layout(&self) -> Result<(), BootstrapError> {
        let owner = if fsperm::running_as_root() {
            Some(fsperm::lookup_user(self.snapshot.get("NGINX_USER")).map_err(BootstrapError::Config)?)
        } else {
            None
        };

        let touched =
            fsperm::secure_tree(&self.conf_dir(), 0o755, 0o644, owner).map_err(BootstrapError::Proxy)?;
        debug!(entries = touched, "Secured nginx config tree");

        self.material.apply_modes().map_err(BootstrapError::Proxy)?;
        if let Some((uid, gid)) = owner {
            fsperm::chown_if_root(&self.material.key_path, uid, gid).map_err(BootstrapError::Proxy)?;
            for public in self.material.public_files() {
                fsperm::chown_if_root(public, uid, gid).map_err(BootstrapError::Proxy)?;
            }
        }

        for key in ["NGINX_LOG_DIR", "NGINX_RUN_DIR", "WEBSSH2_LOG_DIR"] {
            if self.snapshot.is_empty_value(key) {
                warn!(key, "Runtime directory not configured");
                continue;
            }
            fsperm::ensure_dir(Path::new(self.snapshot.get(key)), 0o755, owner).map_err(BootstrapError::Proxy)?;
        }
        Ok(())
    }
}
