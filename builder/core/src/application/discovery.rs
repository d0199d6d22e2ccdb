// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Client-side discovery of the builder: endpoint address by port name and
//! the client identity used to reach it over mutual TLS.

use std::sync::Arc;
use tracing::debug;

use crate::application::identity::{IdentityError, IdentityProvisioner};
use crate::domain::builder::{BUILDER_NAME, CA_SECRET, CLIENT_SECRET, ENDPOINT_OVERRIDE_ANNOTATION};
use crate::domain::certificate::CertificateIssuer;
use crate::domain::cluster::{ClusterError, ClusterStore};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unknown service port")]
    UnknownPort(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// PEM material and expected server name for a builder connection.
#[derive(Clone)]
pub struct ClientIdentity {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub domain: String,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

pub struct BuilderDiscovery {
    store: Arc<dyn ClusterStore>,
    identity: IdentityProvisioner,
    namespace: String,
}

impl BuilderDiscovery {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        issuer: Arc<dyn CertificateIssuer>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            identity: IdentityProvisioner::new(store.clone(), issuer),
            store,
            namespace: namespace.into(),
        }
    }

    /// `host:port` of the first ready address exposing `port_name`.
    pub async fn service_address(&self, port_name: &str) -> Result<String, DiscoveryError> {
        let service = self.store.get_service(&self.namespace, BUILDER_NAME).await?;
        let endpoints = self.store.get_endpoints(&self.namespace, BUILDER_NAME).await?;
        let host_override = service
            .meta
            .annotations
            .get(ENDPOINT_OVERRIDE_ANNOTATION)
            .filter(|h| !h.is_empty());

        for subset in &endpoints.subsets {
            let Some(address) = subset.addresses.first() else {
                continue;
            };
            if let Some(port) = subset.ports.iter().find(|p| p.name == port_name) {
                let host = host_override.unwrap_or(address);
                let address = join_host_port(host, port.port);
                debug!(port = %port_name, address = %address, "Resolved builder endpoint");
                return Ok(address);
            }
        }
        Err(DiscoveryError::UnknownPort(port_name.to_string()))
    }

    pub async fn client_identity(&self) -> Result<ClientIdentity, DiscoveryError> {
        let ca = self.identity.load(&self.namespace, CA_SECRET).await?;
        let client = self.identity.load(&self.namespace, CLIENT_SECRET).await?;
        Ok(ClientIdentity {
            ca_pem: ca.material.cert_pem,
            cert_pem: client.material.cert_pem,
            key_pem: client.material.key_pem,
            domain: format!("{}.{}.svc", BUILDER_NAME, self.namespace),
        })
    }
}

fn join_host_port(host: &str, port: i32) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
