// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identity Provisioning Application Service
//!
//! Load-or-generate for the certificate authority and its leaves, persisted
//! as TLS secrets in the builder namespace. An existing secret is always
//! parsed and returned as-is; malformed material is a configuration error
//! and is never silently regenerated, since replacing a leaf or the CA under
//! a running builder would break the trust chain.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::builder::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::domain::certificate::{
    CertificateIssuer, IssuedIdentity, KeyMaterial, LeafRequest, PkiError, TLS_CERT_KEY,
    TLS_PRIVATE_KEY_KEY,
};
use crate::domain::cluster::{ClusterError, ClusterStore, ObjectMeta, SecretRecord, SecretType};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("invalid certificate in secret `{secret}`: {source}")]
    Pki {
        secret: String,
        #[source]
        source: PkiError,
    },

    #[error("secret `{secret}` is missing key `{key}`")]
    MissingKey { secret: String, key: &'static str },
}

pub struct IdentityProvisioner {
    store: Arc<dyn ClusterStore>,
    issuer: Arc<dyn CertificateIssuer>,
}

impl IdentityProvisioner {
    pub fn new(store: Arc<dyn ClusterStore>, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self { store, issuer }
    }

    /// CA named after its secret.
    pub async fn load_or_generate_ca(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<IssuedIdentity, IdentityError> {
        self.load_or_generate(namespace, name, || self.issuer.generate_authority(name))
            .await
    }

    pub async fn load_or_generate_leaf(
        &self,
        namespace: &str,
        name: &str,
        authority: &KeyMaterial,
        request: &LeafRequest,
    ) -> Result<IssuedIdentity, IdentityError> {
        self.load_or_generate(namespace, name, || self.issuer.issue_leaf(authority, request))
            .await
    }

    /// Read a persisted identity without generating one.
    pub async fn load(&self, namespace: &str, name: &str) -> Result<IssuedIdentity, IdentityError> {
        let secret = self.store.get_secret(namespace, name).await?;
        self.decode(&secret)
    }

    async fn load_or_generate<G>(
        &self,
        namespace: &str,
        name: &str,
        generate: G,
    ) -> Result<IssuedIdentity, IdentityError>
    where
        G: FnOnce() -> Result<KeyMaterial, PkiError>,
    {
        match self.store.get_secret(namespace, name).await {
            Ok(secret) => {
                debug!(secret = %name, "Loaded existing TLS secret");
                return self.decode(&secret);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let material = generate().map_err(|source| IdentityError::Pki {
            secret: name.to_string(),
            source,
        })?;
        let secret = tls_secret(namespace, name, &material);
        match self.store.create_secret(&secret).await {
            Ok(created) => {
                info!(secret = %name, namespace = %namespace, "Created TLS secret");
                self.decode(&created)
            }
            // Lost a race with another installer; theirs wins
            Err(e) if e.is_already_exists() => {
                let existing = self.store.get_secret(namespace, name).await?;
                self.decode(&existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn decode(&self, secret: &SecretRecord) -> Result<IssuedIdentity, IdentityError> {
        let name = &secret.meta.name;
        let cert_pem = data_text(secret, TLS_CERT_KEY)?;
        let key_pem = data_text(secret, TLS_PRIVATE_KEY_KEY)?;
        let material = KeyMaterial::new(cert_pem, key_pem);
        let summary = self
            .issuer
            .inspect(&material)
            .map_err(|source| IdentityError::Pki {
                secret: name.clone(),
                source,
            })?;
        Ok(IssuedIdentity { material, summary })
    }
}

fn data_text(secret: &SecretRecord, key: &'static str) -> Result<String, IdentityError> {
    let missing = || IdentityError::MissingKey {
        secret: secret.meta.name.clone(),
        key,
    };
    let bytes = secret.data.get(key).ok_or_else(missing)?;
    String::from_utf8(bytes.clone()).map_err(|_| missing())
}

/// TLS secret carrying `material` and the management label.
pub fn tls_secret(namespace: &str, name: &str, material: &KeyMaterial) -> SecretRecord {
    let mut data = BTreeMap::new();
    data.insert(TLS_CERT_KEY.to_string(), material.cert_pem.as_bytes().to_vec());
    data.insert(TLS_PRIVATE_KEY_KEY.to_string(), material.key_pem.as_bytes().to_vec());
    SecretRecord {
        meta: ObjectMeta::namespaced(namespace, name).with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE),
        secret_type: SecretType::Tls,
        data,
    }
}
