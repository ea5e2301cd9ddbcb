// src/error.rs

//! Error types for the bootstrap pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("FIPS compliance check failed: {0}")]
    Fips(String),

    #[error("TLS material error: {0}")]
    Tls(String),

    #[error("NGINX configuration error: {0}")]
    Proxy(String),

    #[error("backend configuration error: {0}")]
    Backend(String),

    /// A post-condition that generation itself should guarantee did not hold.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),
}

impl BootstrapError {
    /// Process exit code for this failure class. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Config(_) => 10,
            BootstrapError::Fips(_) => 11,
            BootstrapError::Tls(_) => 12,
            BootstrapError::Proxy(_) => 13,
            BootstrapError::Backend(_) => 14,
            BootstrapError::Invariant(_) => 15,
            BootstrapError::Io(_) => 16,
            BootstrapError::Supervisor(_) => 17,
        }
    }
}

impl From<std::io::Error> for BootstrapError {
    fn from(e: std::io::Error) -> Self {
        BootstrapError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BootstrapError {
    fn from(e: serde_json::Error) -> Self {
        BootstrapError::Io(format!("serialization: {}", e))
    }
}
