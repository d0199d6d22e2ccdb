// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! X.509 issuing and parsing backed by `rcgen` and `x509-parser`.
//!
//! Keys are ECDSA P-256. Serial numbers are 128 random bits with the top bit
//! cleared so the DER integer is always positive and never zero.

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::domain::certificate::{
    CertificateIssuer, CertificateSummary, KeyMaterial, LeafRequest, LeafRole, PkiError,
    LEAF_VALIDITY_DAYS,
};

const CA_VALIDITY_DAYS: u64 = 3650;

/// [`CertificateIssuer`] built on rcgen.
#[derive(Debug, Default, Clone)]
pub struct RcgenIssuer;

impl RcgenIssuer {
    pub fn new() -> Self {
        Self
    }
}

fn generate_err(e: rcgen::Error) -> PkiError {
    PkiError::Generate(e.to_string())
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    if bytes.iter().all(|b| *b == 0) {
        bytes[15] = 1;
    }
    SerialNumber::from_slice(&bytes)
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}

impl CertificateIssuer for RcgenIssuer {
    fn generate_authority(&self, common_name: &str) -> Result<KeyMaterial, PkiError> {
        if common_name.is_empty() {
            return Err(PkiError::InvalidName(common_name.to_string()));
        }
        let key = KeyPair::generate().map_err(generate_err)?;

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generate_err)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, common_name);
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + days(CA_VALIDITY_DAYS)).into();

        let cert = params.self_signed(&key).map_err(generate_err)?;
        Ok(KeyMaterial::new(cert.pem(), key.serialize_pem()))
    }

    fn issue_leaf(
        &self,
        authority: &KeyMaterial,
        request: &LeafRequest,
    ) -> Result<KeyMaterial, PkiError> {
        if request.common_name.is_empty() {
            return Err(PkiError::InvalidName(request.common_name.clone()));
        }
        let authority_summary = self.inspect(authority)?;
        let issuer_key = KeyPair::from_pem(&authority.key_pem).map_err(|e| PkiError::MalformedPem {
            context: "authority key".to_string(),
            reason: e.to_string(),
        })?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&authority.cert_pem).map_err(|e| {
            PkiError::MalformedPem {
                context: "authority certificate".to_string(),
                reason: e.to_string(),
            }
        })?;
        let issuer = issuer_params.self_signed(&issuer_key).map_err(generate_err)?;

        let key = KeyPair::generate().map_err(generate_err)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generate_err)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.common_name.as_str());
        for org in &request.organizations {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = SystemTime::from(authority_summary.not_before).into();
        params.not_after = (SystemTime::now() + days(LEAF_VALIDITY_DAYS as u64)).into();

        match request.role {
            LeafRole::Client => {
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            }
            LeafRole::Server => {
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
                let mut sans = Vec::with_capacity(request.dns_names.len() + request.ip_addresses.len());
                for name in &request.dns_names {
                    let dns: Ia5String = name
                        .clone()
                        .try_into()
                        .map_err(|_| PkiError::InvalidName(name.clone()))?;
                    sans.push(SanType::DnsName(dns));
                }
                sans.extend(request.ip_addresses.iter().copied().map(SanType::IpAddress));
                params.subject_alt_names = sans;
            }
        }

        let cert = params
            .signed_by(&key, &issuer, &issuer_key)
            .map_err(generate_err)?;
        Ok(KeyMaterial::new(cert.pem(), key.serialize_pem()))
    }

    fn inspect(&self, material: &KeyMaterial) -> Result<CertificateSummary, PkiError> {
        let key = KeyPair::from_pem(&material.key_pem).map_err(|e| PkiError::MalformedPem {
            context: "private key".to_string(),
            reason: e.to_string(),
        })?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(material.cert_pem.as_bytes()).map_err(|e| {
            PkiError::MalformedPem {
                context: "certificate".to_string(),
                reason: e.to_string(),
            }
        })?;
        let cert = pem.parse_x509().map_err(|e| PkiError::MalformedPem {
            context: "certificate".to_string(),
            reason: e.to_string(),
        })?;

        let summary = summarize(&cert)?;
        if &*cert.public_key().subject_public_key.data != key.public_key_raw() {
            return Err(PkiError::KeyMismatch(summary.subject));
        }
        Ok(summary)
    }
}

/// Verify that `leaf` was signed by `authority`.
pub fn verify_issued_by(leaf_pem: &str, authority_pem: &str) -> Result<(), PkiError> {
    let malformed = |context: &str, reason: String| PkiError::MalformedPem {
        context: context.to_string(),
        reason,
    };
    let (_, leaf_pem) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes())
        .map_err(|e| malformed("leaf", e.to_string()))?;
    let (_, ca_pem) = x509_parser::pem::parse_x509_pem(authority_pem.as_bytes())
        .map_err(|e| malformed("authority", e.to_string()))?;
    let leaf = leaf_pem
        .parse_x509()
        .map_err(|e| malformed("leaf", e.to_string()))?;
    let ca = ca_pem
        .parse_x509()
        .map_err(|e| malformed("authority", e.to_string()))?;
    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| malformed("leaf signature", e.to_string()))
}

fn summarize(cert: &X509Certificate<'_>) -> Result<CertificateSummary, PkiError> {
    let subject = cert.subject();
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect();

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::MalformedPem {
            context: "subject alternative names".to_string(),
            reason: e.to_string(),
        })?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_bytes(raw) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateSummary {
        serial: cert.raw_serial().to_vec(),
        subject: subject.to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        organizations,
        dns_names,
        ip_addresses,
        not_before: timestamp(cert.validity().not_before.timestamp()),
        not_after: timestamp(cert.validity().not_after.timestamp()),
        signature: cert.signature_value.data.to_vec(),
        is_ca: cert.is_ca(),
    })
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_authority_roundtrip_preserves_identity() {
        let issuer = RcgenIssuer::new();
        let ca = issuer.generate_authority("kiln-tls-ca").unwrap();

        let first = issuer.inspect(&ca).unwrap();
        let reloaded = KeyMaterial::new(ca.cert_pem.clone(), ca.key_pem.clone());
        let second = issuer.inspect(&reloaded).unwrap();

        assert_eq!(first.serial, second.serial);
        assert_eq!(first.subject, second.subject);
        assert_eq!(first.signature, second.signature);
        assert!(first.is_ca);
        assert_eq!(first.common_name, "kiln-tls-ca");
        assert_eq!(first.organizations, vec!["kiln-tls-ca"]);
        assert_eq!(first.subject, first.issuer);
        assert!(first.serial[0] & 0x80 == 0);
    }

    #[test]
    fn test_reloaded_authority_signs_verifiable_leaves() {
        let issuer = RcgenIssuer::new();
        let ca = issuer.generate_authority("kiln-tls-ca").unwrap();
        let reloaded = KeyMaterial::new(ca.cert_pem.clone(), ca.key_pem.clone());

        let leaf = issuer
            .issue_leaf(&reloaded, &LeafRequest::client("kube-image-client"))
            .unwrap();
        verify_issued_by(&leaf.cert_pem, &ca.cert_pem).unwrap();

        let summary = issuer.inspect(&leaf).unwrap();
        let ca_summary = issuer.inspect(&ca).unwrap();
        assert_eq!(summary.issuer, ca_summary.subject);
        assert_eq!(summary.not_before, ca_summary.not_before);
        assert!(!summary.is_ca);
    }

    #[test]
    fn test_server_leaf_carries_sans() {
        let issuer = RcgenIssuer::new();
        let ca = issuer.generate_authority("kiln-tls-ca").unwrap();
        let request = LeafRequest::server(
            "kube-image-server",
            vec![],
            vec!["builder.kube-image.svc".into(), "node-1".into()],
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))],
        );
        let leaf = issuer.issue_leaf(&ca, &request).unwrap();
        let summary = issuer.inspect(&leaf).unwrap();

        assert_eq!(summary.common_name, "kube-image-server");
        assert_eq!(summary.dns_names, vec!["builder.kube-image.svc", "node-1"]);
        assert_eq!(summary.ip_addresses, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        let validity = summary.not_after - Utc::now();
        assert!(validity.num_days() >= 364 && validity.num_days() <= 365);
    }

    #[test]
    fn test_malformed_pem_is_rejected() {
        let issuer = RcgenIssuer::new();
        let ca = issuer.generate_authority("kiln-tls-ca").unwrap();

        let broken = KeyMaterial::new("-----BEGIN CERTIFICATE-----\nnope\n", ca.key_pem.clone());
        assert!(matches!(
            issuer.inspect(&broken),
            Err(PkiError::MalformedPem { .. })
        ));

        let other = issuer.generate_authority("other").unwrap();
        let mismatched = KeyMaterial::new(ca.cert_pem.clone(), other.key_pem);
        assert!(matches!(
            issuer.inspect(&mismatched),
            Err(PkiError::KeyMismatch(_))
        ));
    }
}
