use std::fs as std_fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::Serialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::fips::FipsDecision;
use crate::sys::fsperm;
use crate::sys::secrets::SecretValue;

pub const CERT_MODE: u32 = 0o644;
pub const KEY_MODE: u32 = 0o600;
pub const MIN_REMAINING_VALIDITY_HOURS: i64 = 24;
pub const MAX_VALIDITY_DAYS: u32 = 36_500;
pub const SUPPORTED_RSA_BITS: &[u32] = &[2048, 3072, 4096];

// ==============================================================================
// 1. Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CertificateSource {
    SelfSigned,
    Provided,
    /// ACME was requested; a self-signed certificate stands in for it.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: Option<PathBuf>,
    pub source: CertificateSource,
}

impl CertificateMaterial {
    /// Key owner read/write only; certificate and chain world-readable.
    pub fn apply_modes(&self) -> Result<(), String> {
        fsperm::set_mode(&self.key_path, KEY_MODE)?;
        for public in self.public_files() {
            fsperm::set_mode(public, CERT_MODE)?;
        }
        Ok(())
    }

    pub fn public_files(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.cert_path).chain(self.chain_path.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    SelfSigned,
    Provided,
    LetsEncrypt,
}

impl TlsMode {
    pub fn parse(raw: &str) -> Result<Self, BootstrapError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "self-signed" => Ok(TlsMode::SelfSigned),
            "provided" => Ok(TlsMode::Provided),
            "letsencrypt" => Ok(TlsMode::LetsEncrypt),
            other => Err(BootstrapError::Config(format!(
                "invalid TLS_MODE '{}' (expected self-signed, provided or letsencrypt)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa(u32),
    EcdsaP256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

/// What the gateway needs to know about a parsed certificate.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub not_after: DateTime<Utc>,
    pub common_names: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Full SubjectPublicKeyInfo DER.
    pub spki_der: Vec<u8>,
    /// Contents of the SPKI bit string (the raw public key).
    pub public_key: Vec<u8>,
}

impl CertificateInfo {
    pub fn remaining(&self) -> Duration {
        self.not_after - Utc::now()
    }
}

// ==============================================================================
// 2. Parsing & Validation
// ==============================================================================

/// Parses the first certificate of a PEM bundle.
pub fn parse_certificate_pem(pem_bytes: &[u8]) -> Result<CertificateInfo, String> {
    let (_, pem) = parse_x509_pem(pem_bytes).map_err(|e| format!("PEM decode: {}", e))?;
    if pem.label != "CERTIFICATE" {
        return Err(format!("expected a CERTIFICATE block, found {}", pem.label));
    }
    let cert = pem.parse_x509().map_err(|e| format!("X.509 parse: {}", e))?;

    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| "certificate notAfter out of range".to_string())?;

    let common_names = cert
        .subject()
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .map(str::to_string)
        .collect();

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    let spki = cert.public_key();
    Ok(CertificateInfo {
        not_after,
        common_names,
        dns_names,
        ip_addresses,
        spki_der: spki.raw.to_vec(),
        public_key: spki.subject_public_key.data.to_vec(),
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

pub fn read_certificate(path: &Path) -> Result<CertificateInfo, String> {
    let bytes = std_fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    parse_certificate_pem(&bytes).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Confirms the private key at `key_path` belongs to `cert`.
async fn key_matches_certificate(cert: &CertificateInfo, key_path: &Path) -> Result<(), String> {
    let key_pem = SecretValue::new(
        std_fs::read_to_string(key_path).map_err(|e| format!("cannot read {}: {}", key_path.display(), e))?,
    );

    // PKCS#8 keys are handled in-process.
    let parsed = key_pem.use_secret(|pem| KeyPair::from_pem(pem).map(|kp| kp.public_key_raw().to_vec()));
    match parsed {
        Ok(public_key) if public_key == cert.public_key => return Ok(()),
        Ok(_) => return Err("private key does not match certificate public key".to_string()),
        Err(e) => debug!("in-process key parse failed ({}), asking openssl", e),
    }

    // Legacy PKCS#1 / SEC1 encodings: derive the SPKI with openssl.
    let output = Command::new("openssl")
        .arg("pkey")
        .arg("-in")
        .arg(key_path)
        .args(["-pubout", "-outform", "DER"])
        .output()
        .await
        .map_err(|e| format!("failed to run openssl pkey: {}", e))?;
    if !output.status.success() {
        return Err(format!(
            "private key is not parseable: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    if output.stdout == cert.spki_der {
        Ok(())
    } else {
        Err("private key does not match certificate public key".to_string())
    }
}

/// Parse, key match and remaining validity ≥ 24h.
pub async fn validate_pair(cert_path: &Path, key_path: &Path) -> Result<CertificateInfo, String> {
    let info = read_certificate(cert_path)?;
    key_matches_certificate(&info, key_path).await?;

    let remaining = info.remaining();
    if remaining < Duration::hours(MIN_REMAINING_VALIDITY_HOURS) {
        return Err(format!(
            "certificate expires at {} (less than {}h remaining)",
            info.not_after.to_rfc3339(),
            MIN_REMAINING_VALIDITY_HOURS
        ));
    }
    Ok(info)
}

// ==============================================================================
// 3. Self-Signed Generation
// ==============================================================================

pub struct SelfSignedRequest {
    pub common_name: String,
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub subject_alt_names: Vec<SanEntry>,
    pub validity_days: u32,
    pub algorithm: KeyAlgorithm,
}

impl SelfSignedRequest {
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot, fips: &FipsDecision) -> Result<Self, BootstrapError> {
        let algorithm = if fips.is_enabled() {
            let bits: u32 = snapshot.number("TLS_KEY_SIZE")?;
            if !SUPPORTED_RSA_BITS.contains(&bits) {
                return Err(BootstrapError::Config(format!(
                    "TLS_KEY_SIZE must be one of {:?}, got {}",
                    SUPPORTED_RSA_BITS, bits
                )));
            }
            KeyAlgorithm::Rsa(bits)
        } else {
            KeyAlgorithm::EcdsaP256
        };

        let validity_days: u32 = snapshot.number("TLS_VALIDITY_DAYS")?;
        if !(2..=MAX_VALIDITY_DAYS).contains(&validity_days) {
            return Err(BootstrapError::Config(format!(
                "TLS_VALIDITY_DAYS must be between 2 and {}, got {}",
                MAX_VALIDITY_DAYS, validity_days
            )));
        }

        Ok(Self {
            common_name: snapshot.get("TLS_CN").trim().to_string(),
            country: snapshot.get("TLS_COUNTRY").trim().to_string(),
            state: snapshot.get("TLS_STATE").trim().to_string(),
            locality: snapshot.get("TLS_LOCALITY").trim().to_string(),
            organization: snapshot.get("TLS_ORGANIZATION").trim().to_string(),
            organizational_unit: snapshot.get("TLS_ORGANIZATIONAL_UNIT").trim().to_string(),
            subject_alt_names: build_san_list(snapshot),
            validity_days,
            algorithm,
        })
    }
}

pub fn classify_san(raw: &str) -> SanEntry {
    let trimmed = raw.trim().trim_start_matches("DNS:").trim_start_matches("IP:");
    match trimmed.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(ip) => SanEntry::Ip(ip),
        Err(_) => SanEntry::Dns(trimmed.to_ascii_lowercase()),
    }
}

/// Default names plus `TLS_SAN_EXTRA`, de-duplicated in order.
pub fn build_san_list(snapshot: &ConfigurationSnapshot) -> Vec<SanEntry> {
    let mut names: Vec<SanEntry> = Vec::new();
    let candidates = ["localhost", snapshot.get("TLS_CN"), snapshot.get("NGINX_SERVER_NAME"), "127.0.0.1", "::1"]
        .into_iter()
        .map(str::to_string)
        .chain(snapshot.get("TLS_SAN_EXTRA").split(',').map(str::to_string));

    for candidate in candidates {
        if candidate.trim().is_empty() {
            continue;
        }
        let entry = classify_san(&candidate);
        if !names.contains(&entry) {
            names.push(entry);
        }
    }
    names
}

fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair, rcgen::Error> {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
        KeyAlgorithm::Rsa(bits) => {
            let size = match bits {
                4096 => rcgen::RsaKeySize::_4096,
                3072 => rcgen::RsaKeySize::_3072,
                _ => rcgen::RsaKeySize::_2048,
            };
            KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, size)
        }
    }
}

/// Returns (certificate PEM, private key PEM).
pub fn generate_self_signed(request: &SelfSignedRequest) -> Result<(String, SecretValue), String> {
    let key_pair = generate_key_pair(request.algorithm).map_err(|e| format!("key generation failed: {}", e))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    for (kind, value) in [
        (DnType::CountryName, &request.country),
        (DnType::StateOrProvinceName, &request.state),
        (DnType::LocalityName, &request.locality),
        (DnType::OrganizationName, &request.organization),
        (DnType::OrganizationalUnitName, &request.organizational_unit),
        (DnType::CommonName, &request.common_name),
    ] {
        if !value.is_empty() {
            dn.push(kind, value.clone());
        }
    }
    params.distinguished_name = dn;

    for entry in &request.subject_alt_names {
        match entry {
            SanEntry::Ip(ip) => params.subject_alt_names.push(SanType::IpAddress(*ip)),
            SanEntry::Dns(name) => {
                let ia5 = name
                    .as_str()
                    .try_into()
                    .map_err(|e| format!("invalid DNS SAN '{}': {}", name, e))?;
                params.subject_alt_names.push(SanType::DnsName(ia5));
            }
        }
    }

    let now = Utc::now();
    let start = now - Duration::days(1);
    // X.509 GeneralizedTime stops at year 9999.
    let end = now
        .checked_add_signed(Duration::days(i64::from(request.validity_days)))
        .filter(|end| end.year() <= 9999)
        .ok_or_else(|| format!("validity of {} days is out of range", request.validity_days))?;
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| format!("certificate signing failed: {}", e))?;

    Ok((cert.pem(), SecretValue::new(key_pair.serialize_pem())))
}

// ==============================================================================
// 4. Writing Material to Disk
// ==============================================================================

fn ensure_parent(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std_fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }
    }
    Ok(())
}

fn write_public_pem(path: &Path, contents: &str) -> Result<(), String> {
    ensure_parent(path)?;
    let mut file = std_fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CERT_MODE)
        .open(path)
        .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    fsperm::set_mode(path, CERT_MODE)
}

/// 🛡️ Key bytes only leave the secret wrapper inside this closure.
fn write_private_pem(path: &Path, key: &SecretValue) -> Result<(), String> {
    ensure_parent(path)?;
    let result = key.use_secret(|pem| {
        let mut file = std_fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(KEY_MODE)
            .open(path)
            .map_err(|e| format!("failed to open private key {}: {}", path.display(), e))?;
        file.write_all(pem.as_bytes())
            .map_err(|e| format!("failed to write private key: {}", e))?;
        file.sync_all()
            .map_err(|e| format!("failed to sync private key: {}", e))
    });

    if let Err(e) = result {
        let _ = std_fs::remove_file(path);
        return Err(e);
    }
    fsperm::set_mode(path, KEY_MODE)
}

/// Inline PEM passed through env vars often carries literal `\n`.
fn normalize_inline_pem(raw: &str) -> String {
    let mut pem = if !raw.contains('\n') && raw.contains("\\n") {
        raw.replace("\\n", "\n")
    } else {
        raw.to_string()
    };
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    pem
}

// ==============================================================================
// 5. Provisioner
// ==============================================================================

pub struct TlsProvisioner<'a> {
    snapshot: &'a ConfigurationSnapshot,
    fips: &'a FipsDecision,
}

impl<'a> TlsProvisioner<'a> {
    pub fn new(snapshot: &'a ConfigurationSnapshot, fips: &'a FipsDecision) -> Self {
        Self { snapshot, fips }
    }

    fn cert_path(&self) -> PathBuf {
        PathBuf::from(self.snapshot.get("TLS_CERT_PATH"))
    }

    fn key_path(&self) -> PathBuf {
        PathBuf::from(self.snapshot.get("TLS_KEY_PATH"))
    }

    pub async fn provision(&self) -> Result<CertificateMaterial, BootstrapError> {
        let mode = TlsMode::parse(self.snapshot.get("TLS_MODE"))?;
        if self.snapshot.is_empty_value("TLS_CERT_PATH") || self.snapshot.is_empty_value("TLS_KEY_PATH") {
            return Err(BootstrapError::Config("TLS_CERT_PATH and TLS_KEY_PATH must be set".to_string()));
        }

        let material = match mode {
            TlsMode::SelfSigned => self.ensure_self_signed(CertificateSource::SelfSigned).await?,
            TlsMode::LetsEncrypt => {
                warn!("ACME issuance is not implemented yet; using a self-signed certificate instead");
                self.ensure_self_signed(CertificateSource::Fallback).await?
            }
            TlsMode::Provided => self.install_provided().await?,
        };

        self.apply_permissions(&material)?;
        self.configure_mtls()?;

        if !self.fips.is_enabled() {
            let _ = spawn_dhparam_generation(self.snapshot);
        }

        info!(
            cert = %material.cert_path.display(),
            source = ?material.source,
            "🔐 TLS material ready"
        );
        Ok(material)
    }

    /// Phase 1 validates what is on disk; phase 2 regenerates once and re-validates.
    async fn ensure_self_signed(&self, source: CertificateSource) -> Result<CertificateMaterial, BootstrapError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        let material = CertificateMaterial {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            chain_path: None,
            source,
        };

        if cert_path.exists() && key_path.exists() {
            match validate_pair(&cert_path, &key_path).await {
                Ok(_) => {
                    info!("Existing self-signed certificate is valid, keeping it");
                    return Ok(material);
                }
                Err(reason) => warn!(%reason, "Existing certificate rejected, regenerating"),
            }
        }

        let request = SelfSignedRequest::from_snapshot(self.snapshot, self.fips)?;
        info!(algorithm = ?request.algorithm, cn = %request.common_name, "Generating self-signed certificate");
        let (cert_pem, key_pem) = generate_self_signed(&request).map_err(BootstrapError::Tls)?;
        write_private_pem(&key_path, &key_pem).map_err(BootstrapError::Tls)?;
        write_public_pem(&cert_path, &cert_pem).map_err(BootstrapError::Tls)?;

        let info = validate_pair(&cert_path, &key_path)
            .await
            .map_err(|e| BootstrapError::Invariant(format!("freshly generated certificate failed validation: {}", e)))?;

        if !info.common_names.iter().any(|cn| cn == &request.common_name) {
            return Err(BootstrapError::Tls(format!(
                "generated certificate does not carry CN '{}'",
                request.common_name
            )));
        }
        Ok(material)
    }

    async fn install_provided(&self) -> Result<CertificateMaterial, BootstrapError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        let cert_inline = self.snapshot.get("TLS_CERT_CONTENT").trim();
        let key_inline = SecretValue::new(self.snapshot.get("TLS_KEY_CONTENT").trim().to_string());

        if !cert_inline.is_empty() || !key_inline.is_empty() {
            if cert_inline.is_empty() || key_inline.is_empty() {
                return Err(BootstrapError::Tls(
                    "TLS_CERT_CONTENT and TLS_KEY_CONTENT must be provided together".to_string(),
                ));
            }
            let key_pem = key_inline.use_secret(|k| SecretValue::new(normalize_inline_pem(k)));
            write_private_pem(&key_path, &key_pem).map_err(BootstrapError::Tls)?;
            write_public_pem(&cert_path, &normalize_inline_pem(cert_inline)).map_err(BootstrapError::Tls)?;
            info!("Installed certificate from inline content");
        } else if cert_path.exists() && key_path.exists() {
            info!(cert = %cert_path.display(), "Using mounted certificate files");
        } else {
            return Err(BootstrapError::Tls(format!(
                "no certificates provided: set TLS_CERT_CONTENT/TLS_KEY_CONTENT or mount {} and {}",
                cert_path.display(),
                key_path.display()
            )));
        }

        validate_pair(&cert_path, &key_path)
            .await
            .map_err(|e| BootstrapError::Tls(format!("provided certificate rejected: {}", e)))?;

        let chain_path = self.install_chain(&cert_path)?;
        Ok(CertificateMaterial {
            cert_path,
            key_path,
            chain_path,
            source: CertificateSource::Provided,
        })
    }

    fn install_chain(&self, cert_path: &Path) -> Result<Option<PathBuf>, BootstrapError> {
        let chain_inline = self.snapshot.get("TLS_CHAIN_CONTENT").trim();
        let configured = self.snapshot.get("TLS_CHAIN_PATH").trim();

        let chain_path = match (configured.is_empty(), chain_inline.is_empty()) {
            (true, true) => return Ok(None),
            (false, _) => PathBuf::from(configured),
            (true, false) => cert_path.with_file_name("chain.pem"),
        };

        if !chain_inline.is_empty() {
            write_public_pem(&chain_path, &normalize_inline_pem(chain_inline)).map_err(BootstrapError::Tls)?;
        }
        read_certificate(&chain_path).map_err(|e| BootstrapError::Tls(format!("certificate chain rejected: {}", e)))?;
        Ok(Some(chain_path))
    }

    fn apply_permissions(&self, material: &CertificateMaterial) -> Result<(), BootstrapError> {
        material.apply_modes().map_err(BootstrapError::Tls)
    }

    // ==========================================================================
    // 6. Mutual TLS
    // ==========================================================================

    fn configure_mtls(&self) -> Result<(), BootstrapError> {
        let fragment_path = mtls_fragment_path(self.snapshot);
        let enabled = self.snapshot.flag("MTLS_ENABLED")?;

        let fragment = if enabled {
            let ca_path = PathBuf::from(self.snapshot.get("MTLS_CA_CERT"));
            if !ca_path.exists() {
                return Err(BootstrapError::Tls(format!(
                    "MTLS_ENABLED=true but CA bundle {} does not exist",
                    ca_path.display()
                )));
            }
            read_certificate(&ca_path).map_err(|e| BootstrapError::Tls(format!("invalid mTLS CA bundle: {}", e)))?;

            let depth: u32 = self.snapshot.number("MTLS_VERIFY_DEPTH")?;
            if !(1..=10).contains(&depth) {
                return Err(BootstrapError::Config(format!(
                    "MTLS_VERIFY_DEPTH must be between 1 and 10, got {}",
                    depth
                )));
            }
            let verify = if self.snapshot.flag("MTLS_OPTIONAL")? { "optional" } else { "on" };
            info!(ca = %ca_path.display(), verify, depth, "mTLS client verification enabled");
            render_mtls_fragment(&ca_path, verify, depth)
        } else {
            "# mutual TLS disabled (MTLS_ENABLED=false)\n".to_string()
        };

        write_public_pem(&fragment_path, &fragment).map_err(BootstrapError::Tls)
    }
}

pub fn mtls_fragment_path(snapshot: &ConfigurationSnapshot) -> PathBuf {
    Path::new(snapshot.get("NGINX_CONF_DIR")).join("snippets").join("mtls.conf")
}

fn render_mtls_fragment(ca_path: &Path, verify: &str, depth: u32) -> String {
    format!(
        "# mutual TLS client verification\n\
         ssl_client_certificate {ca};\n\
         ssl_verify_client {verify};\n\
         ssl_verify_depth {depth};\n",
        ca = ca_path.display(),
        verify = verify,
        depth = depth
    )
}

// ==============================================================================
// 7. Diffie-Hellman Parameters (fire-and-forget)
// ==============================================================================

/// `openssl dhparam` into a scratch file, moved into place by the same shell so the
/// target only ever appears complete, even when this process exits first (`init`).
fn dhparam_command(tmp: &Path, target: &Path, bits: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(r#"openssl dhparam -out "$1" "$3" && chmod 644 "$1" && mv -f "$1" "$2""#)
        .arg("dhparam")
        .arg(tmp)
        .arg(target)
        .arg(bits)
        .kill_on_drop(false);
    cmd
}

/// Starts DH parameter generation in the background when the output is missing.
/// Nothing awaits the handle; the file is optional and picked up once present.
pub fn spawn_dhparam_generation(snapshot: &ConfigurationSnapshot) -> Option<JoinHandle<()>> {
    let target = PathBuf::from(snapshot.get("TLS_DHPARAM_PATH"));
    if snapshot.is_empty_value("TLS_DHPARAM_PATH") || target.exists() {
        return None;
    }
    let bits = snapshot.get("TLS_DHPARAM_SIZE").trim().to_string();

    Some(tokio::spawn(async move {
        let tmp = target.with_extension("pem.tmp");
        info!(path = %target.display(), %bits, "Generating DH parameters in the background");
        let result = dhparam_command(&tmp, &target, &bits).output().await;

        match result {
            Ok(out) if out.status.success() => info!(path = %target.display(), "DH parameters ready"),
            Ok(out) => warn!(
                "DH parameter generation failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("DH parameter generation could not start: {}", e),
        }
    }))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::sys::fips::FipsState;
    use tempfile::TempDir;

    pub fn tls_snapshot(dir: &Path, extra: &[(&str, &str)]) -> ConfigurationSnapshot {
        let cert = dir.join("certs/cert.pem");
        let key = dir.join("certs/key.pem");
        let conf = dir.join("nginx");
        let mut pairs: Vec<(&str, String)> = vec![
            ("TLS_CERT_PATH", cert.display().to_string()),
            ("TLS_KEY_PATH", key.display().to_string()),
            ("NGINX_CONF_DIR", conf.display().to_string()),
            // Empty path keeps the background dhparam job out of tests.
            ("TLS_DHPARAM_PATH", String::new()),
        ];
        for (k, v) in extra {
            pairs.push((*k, v.to_string()));
        }
        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        ConfigurationSnapshot::with_overrides(&borrowed)
    }

    fn fips_enabled() -> FipsDecision {
        FipsDecision {
            state: FipsState::EnabledVerified,
            trail: Vec::new(),
        }
    }

    fn ec_request(cn: &str, days: u32) -> SelfSignedRequest {
        SelfSignedRequest {
            common_name: cn.to_string(),
            country: "US".into(),
            state: "State".into(),
            locality: "City".into(),
            organization: "WebSSH2".into(),
            organizational_unit: "IT".into(),
            subject_alt_names: vec![SanEntry::Dns(cn.to_string()), SanEntry::Ip("127.0.0.1".parse().unwrap())],
            validity_days: days,
            algorithm: KeyAlgorithm::EcdsaP256,
        }
    }

    #[test]
    fn tls_mode_parsing_is_strict() {
        assert_eq!(TlsMode::parse("self-signed").unwrap(), TlsMode::SelfSigned);
        assert_eq!(TlsMode::parse("Provided").unwrap(), TlsMode::Provided);
        assert_eq!(TlsMode::parse("letsencrypt").unwrap(), TlsMode::LetsEncrypt);
        let err = TlsMode::parse("magic").unwrap_err();
        assert!(err.to_string().contains("invalid TLS_MODE"));
    }

    #[test]
    fn san_classification() {
        assert_eq!(classify_san("10.0.0.5"), SanEntry::Ip("10.0.0.5".parse().unwrap()));
        assert_eq!(classify_san("fe80::1"), SanEntry::Ip("fe80::1".parse().unwrap()));
        assert_eq!(classify_san("[::1]"), SanEntry::Ip("::1".parse().unwrap()));
        assert_eq!(classify_san("Gateway.Example.com"), SanEntry::Dns("gateway.example.com".into()));
    }

    #[test]
    fn san_list_includes_defaults_and_extras_without_duplicates() {
        let snapshot = ConfigurationSnapshot::with_overrides(&[
            ("TLS_CN", "ssh.example.com"),
            ("NGINX_SERVER_NAME", "ssh.example.com"),
            ("TLS_SAN_EXTRA", "10.1.2.3, alt.example.com,localhost,"),
        ]);
        let sans = build_san_list(&snapshot);
        assert_eq!(
            sans,
            vec![
                SanEntry::Dns("localhost".into()),
                SanEntry::Dns("ssh.example.com".into()),
                SanEntry::Ip("127.0.0.1".parse().unwrap()),
                SanEntry::Ip("::1".parse().unwrap()),
                SanEntry::Ip("10.1.2.3".parse().unwrap()),
                SanEntry::Dns("alt.example.com".into()),
            ]
        );
    }

    #[tokio::test]
    async fn generated_certificate_matches_its_key() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, key_pem) = generate_self_signed(&ec_request("gw.test", 30)).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        write_public_pem(&cert_path, &cert_pem).unwrap();
        write_private_pem(&key_path, &key_pem).unwrap();

        let info = validate_pair(&cert_path, &key_path).await.unwrap();
        assert!(info.common_names.contains(&"gw.test".to_string()));
        assert!(info.dns_names.contains(&"gw.test".to_string()));
        assert!(info.ip_addresses.contains(&"127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn mismatched_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, _) = generate_self_signed(&ec_request("a.test", 30)).unwrap();
        let (_, other_key) = generate_self_signed(&ec_request("b.test", 30)).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        write_public_pem(&cert_path, &cert_pem).unwrap();
        write_private_pem(&key_path, &other_key).unwrap();

        let err = validate_pair(&cert_path, &key_path).await.unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[tokio::test]
    async fn self_signed_provisioning_is_a_fixpoint() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        let fips = FipsDecision::disabled();

        let first = TlsProvisioner::new(&snapshot, &fips).provision().await.unwrap();
        let cert_before = std_fs::read(&first.cert_path).unwrap();

        let second = TlsProvisioner::new(&snapshot, &fips).provision().await.unwrap();
        let cert_after = std_fs::read(&second.cert_path).unwrap();

        assert_eq!(first, second);
        assert_eq!(cert_before, cert_after, "valid certificate must not be regenerated");
        assert_eq!(first.source, CertificateSource::SelfSigned);
        assert_eq!(fsperm::mode_of(&first.key_path).unwrap(), KEY_MODE);
        assert_eq!(fsperm::mode_of(&first.cert_path).unwrap(), CERT_MODE);
    }

    #[tokio::test]
    async fn corrupt_self_signed_material_is_regenerated() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        let fips = FipsDecision::disabled();
        std_fs::create_dir_all(dir.path().join("certs")).unwrap();
        std_fs::write(dir.path().join("certs/cert.pem"), "garbage").unwrap();
        std_fs::write(dir.path().join("certs/key.pem"), "garbage").unwrap();

        let material = TlsProvisioner::new(&snapshot, &fips).provision().await.unwrap();
        assert!(validate_pair(&material.cert_path, &material.key_path).await.is_ok());
    }

    #[tokio::test]
    async fn fips_mode_generates_rsa() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[]);
        let material = TlsProvisioner::new(&snapshot, &fips_enabled()).provision().await.unwrap();
        let key = std_fs::read_to_string(&material.key_path).unwrap();
        let kp = KeyPair::from_pem(&key).unwrap();
        assert!(kp.is_compatible(&rcgen::PKCS_RSA_SHA256));
    }

    #[tokio::test]
    async fn out_of_range_validity_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        for days in ["1", "36501", "3000000"] {
            let snapshot = tls_snapshot(dir.path(), &[("TLS_VALIDITY_DAYS", days)]);
            let err = TlsProvisioner::new(&snapshot, &FipsDecision::disabled())
                .provision()
                .await
                .unwrap_err();
            assert!(matches!(err, BootstrapError::Config(_)), "{} days: {}", days, err);
            assert_eq!(err.exit_code(), 10);
        }

        let snapshot = tls_snapshot(dir.path(), &[("TLS_VALIDITY_DAYS", "36500")]);
        TlsProvisioner::new(&snapshot, &FipsDecision::disabled()).provision().await.unwrap();
    }

    #[test]
    fn validity_past_year_9999_is_refused_by_the_generator() {
        let err = generate_self_signed(&ec_request("far.test", u32::MAX)).unwrap_err();
        assert!(err.contains("out of range"));
        assert!(generate_self_signed(&ec_request("far.test", 3_000_000)).is_err());
    }

    #[test]
    fn dhparam_output_is_moved_into_place_by_the_child() {
        let cmd = dhparam_command(Path::new("/certs/dh.pem.tmp"), Path::new("/certs/dh.pem"), "2048");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "sh");
        assert_eq!(args[0], "-c");
        assert!(args[1].starts_with(r#"openssl dhparam -out "$1" "$3""#));
        assert!(args[1].ends_with(r#"mv -f "$1" "$2""#));
        assert_eq!(&args[2..], ["dhparam", "/certs/dh.pem.tmp", "/certs/dh.pem", "2048"]);
    }

    #[tokio::test]
    async fn letsencrypt_falls_back_to_self_signed() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[("TLS_MODE", "letsencrypt")]);
        let material = TlsProvisioner::new(&snapshot, &FipsDecision::disabled()).provision().await.unwrap();
        assert_eq!(material.source, CertificateSource::Fallback);
    }

    #[tokio::test]
    async fn provided_mode_without_material_is_fatal() {
        let dir = TempDir::new().unwrap();
        let snapshot = tls_snapshot(dir.path(), &[("TLS_MODE", "provided")]);
        let err = TlsProvisioner::new(&snapshot, &FipsDecision::disabled())
            .provision()
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Tls(_)));
        assert!(err.to_string().contains("no certificates provided"));
    }

    #[tokio::test]
    async fn provided_inline_content_is_installed() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, key_pem) = generate_self_signed(&ec_request("inline.test", 30)).unwrap();
        let key_text = key_pem.use_secret(|k| k.replace('\n', "\\n"));
        let snapshot = tls_snapshot(
            dir.path(),
            &[
                ("TLS_MODE", "provided"),
                ("TLS_CERT_CONTENT", cert_pem.as_str()),
                ("TLS_KEY_CONTENT", key_text.as_str()),
            ],
        );
        let material = TlsProvisioner::new(&snapshot, &FipsDecision::disabled()).provision().await.unwrap();
        assert_eq!(material.source, CertificateSource::Provided);
        assert!(read_certificate(&material.cert_path).unwrap().common_names.contains(&"inline.test".to_string()));
    }

    #[tokio::test]
    async fn provided_certificate_near_expiry_is_fatal() {
        let dir = TempDir::new().unwrap();
        // Zero validity days puts notAfter at today's midnight, already behind us.
        let (cert_pem, key_pem) = generate_self_signed(&ec_request("short.test", 0)).unwrap();
        let cert_path = dir.path().join("certs/cert.pem");
        let key_path = dir.path().join("certs/key.pem");
        write_public_pem(&cert_path, &cert_pem).unwrap();
        write_private_pem(&key_path, &key_pem).unwrap();

        let snapshot = tls_snapshot(dir.path(), &[("TLS_MODE", "provided")]);
        let err = TlsProvisioner::new(&snapshot, &FipsDecision::disabled())
            .provision()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expires"));
    }

    #[tokio::test]
    async fn mtls_requires_valid_ca_only_when_enabled() {
        let dir = TempDir::new().unwrap();
        let missing_ca = dir.path().join("ca.pem");
        let snapshot = tls_snapshot(
            dir.path(),
            &[("MTLS_ENABLED", "true"), ("MTLS_CA_CERT", missing_ca.to_str().unwrap())],
        );
        let err = TlsProvisioner::new(&snapshot, &FipsDecision::disabled())
            .provision()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CA bundle"));

        let (ca_pem, _) = generate_self_signed(&ec_request("client-ca", 30)).unwrap();
        write_public_pem(&missing_ca, &ca_pem).unwrap();
        TlsProvisioner::new(&snapshot, &FipsDecision::disabled()).provision().await.unwrap();

        let fragment = std_fs::read_to_string(mtls_fragment_path(&snapshot)).unwrap();
        assert!(fragment.contains("ssl_verify_client on;"));
        assert!(fragment.contains("ssl_verify_depth 2;"));
    }
}
