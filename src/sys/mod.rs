// src/sys/mod.rs
// 🛡️ Zero-Trust Architecture: host access goes through the traits; concrete managers stay here.

pub mod traits;     // Host seams (FIPS host, nginx, node, health observer)
pub mod secrets;    // Memory hygiene (SecretValue)
pub mod fsperm;     // Ownership & modes
pub mod fips;       // FIPS validator
pub mod ssl;        // Certificate management
pub mod proxy;      // Ingress (Nginx)
pub mod backend;    // WebSSH2 environment
pub mod supervisor; // Process supervision
pub mod health;     // Composite health probe
