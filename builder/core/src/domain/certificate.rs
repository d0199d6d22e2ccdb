// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Certificate Domain Types
//!
//! Value types for the mutual-TLS identity that protects the builder agent:
//! a self-signed certificate authority plus client and server leaves signed
//! by it. Key material travels as PEM text; the parsed view
//! ([`CertificateSummary`]) is what callers inspect.
//!
//! Generation and parsing live behind [`CertificateIssuer`] so the
//! provisioning service never touches a concrete crypto library.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;

/// Secret data key holding the PEM certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret data key holding the PEM private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Fixed validity of issued leaves.
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Default common names used by the installer.
pub const DEFAULT_CLIENT_COMMON_NAME: &str = "kube-image-client";
pub const DEFAULT_SERVER_COMMON_NAME: &str = "kube-image-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRole {
    /// `clientAuth` extended key usage
    Client,
    /// `serverAuth` extended key usage, with DNS/IP subject alternative names
    Server,
}

impl fmt::Display for LeafRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafRole::Client => write!(f, "client"),
            LeafRole::Server => write!(f, "server"),
        }
    }
}

/// PEM encoded certificate and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl KeyMaterial {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("cert_pem", &format!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Request for a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRequest {
    pub role: LeafRole,
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl LeafRequest {
    /// Client leaf. A common name of the form `name,o=org1,o=org2` is split
    /// into the common name and its organizations.
    pub fn client(common_name: &str) -> Self {
        let mut parts = common_name.split(",o=");
        let cn = parts.next().unwrap_or_default().to_string();
        let organizations = parts
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            role: LeafRole::Client,
            common_name: cn,
            organizations,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
        }
    }

    pub fn server(
        common_name: &str,
        organizations: Vec<String>,
        dns_names: Vec<String>,
        ip_addresses: Vec<IpAddr>,
    ) -> Self {
        Self {
            role: LeafRole::Server,
            common_name: common_name.to_string(),
            organizations,
            dns_names,
            ip_addresses,
        }
    }
}

/// Parsed, library-independent view of an X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub serial: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub signature: Vec<u8>,
    pub is_ca: bool,
}

/// A certificate and the signer that owns it, as loaded from persistence.
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    pub material: KeyMaterial,
    pub summary: CertificateSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("failed to generate key material: {0}")]
    Generate(String),

    #[error("malformed PEM in {context}: {reason}")]
    MalformedPem { context: String, reason: String },

    #[error("invalid subject name `{0}`")]
    InvalidName(String),

    #[error("private key does not match certificate {0}")]
    KeyMismatch(String),
}

/// Certificate generation and parsing seam.
pub trait CertificateIssuer: Send + Sync {
    /// Create a self-signed authority whose common name and sole
    /// organization are `common_name`.
    fn generate_authority(&self, common_name: &str) -> Result<KeyMaterial, PkiError>;

    /// Issue a leaf signed by `authority`.
    fn issue_leaf(
        &self,
        authority: &KeyMaterial,
        request: &LeafRequest,
    ) -> Result<KeyMaterial, PkiError>;

    /// Parse persisted material, verifying the key belongs to the certificate.
    fn inspect(&self, material: &KeyMaterial) -> Result<CertificateSummary, PkiError>;
}
