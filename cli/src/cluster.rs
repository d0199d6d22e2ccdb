// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster session setup shared by the builder and image commands.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info};

use kiln_core::application::discovery::BuilderDiscovery;
use kiln_core::application::install::Installer;
use kiln_core::application::login::RegistryLogin;
use kiln_core::domain::builder::{BuilderDesiredState, AGENT_PORT_NAME};
use kiln_core::domain::cluster::ClusterStore;
use kiln_core::domain::transfer::{AuthConfig, ImageReference};
use kiln_core::infrastructure::cluster::{KubeClusterStore, KubeConnection};
use kiln_core::infrastructure::pki::RcgenIssuer;
use kiln_core::presentation::grpc::client;
use kiln_core::presentation::grpc::images_v1;
use kiln_core::presentation::grpc::images_v1::images_client::ImagesClient;

/// Global flags selecting the cluster and builder namespace.
#[derive(Debug, Clone)]
pub struct ClusterArgs {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

impl ClusterArgs {
    pub async fn connect(&self) -> Result<Arc<dyn ClusterStore>> {
        let connection = KubeConnection {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
        };
        let store = KubeClusterStore::connect(&connection)
            .await
            .context("Failed to connect to the cluster")?;
        Ok(Arc::new(store))
    }
}

/// Connected builder: cluster access plus an Images client.
pub struct BuilderSession {
    pub store: Arc<dyn ClusterStore>,
    pub namespace: String,
    pub client: ImagesClient<Channel>,
}

impl BuilderSession {
    /// Make sure the builder runs, then dial its agent over mutual TLS.
    pub async fn open(args: &ClusterArgs) -> Result<Self> {
        let store = args.connect().await?;
        let issuer = Arc::new(RcgenIssuer::new());

        let desired = BuilderDesiredState {
            namespace: args.namespace.clone(),
            ..Default::default()
        };
        let cancel = cancel_on_ctrl_c();
        if let Some(outcome) = Installer::new(store.clone(), issuer.clone())
            .ensure_installed(&desired, &cancel)
            .await
            .context("Failed to install the builder")?
        {
            info!(node = ?outcome.node, skipped = ?outcome.skipped, "Builder installed");
        }

        let discovery = BuilderDiscovery::new(store.clone(), issuer, args.namespace.clone());
        let address = discovery
            .service_address(AGENT_PORT_NAME)
            .await
            .context("Failed to locate the builder agent")?;
        let identity = discovery
            .client_identity()
            .await
            .context("Failed to load the builder client identity")?;
        let client = client::connect(&address, Some(&identity))
            .await
            .with_context(|| format!("Failed to connect to the builder at {}", address))?;
        debug!(address = %address, "Connected to builder agent");

        Ok(Self {
            store,
            namespace: args.namespace.clone(),
            client,
        })
    }

    /// Stored registry credentials for the registry `reference` points at.
    pub async fn registry_auth(&self, reference: &str) -> Result<Option<images_v1::AuthConfig>> {
        let registry = ImageReference::parse(reference)
            .with_context(|| format!("Invalid image reference `{}`", reference))?
            .registry;
        let auth = RegistryLogin::new(self.store.clone())
            .credentials(&self.namespace, &registry)
            .await
            .context("Failed to read registry credentials")?;
        Ok(auth.map(auth_to_proto))
    }
}

pub fn auth_to_proto(auth: AuthConfig) -> images_v1::AuthConfig {
    images_v1::AuthConfig {
        username: auth.username,
        password: auth.password,
        auth: auth.auth,
        server_address: auth.server_address,
        identity_token: auth.identity_token,
        registry_token: auth.registry_token,
    }
}

/// Token cancelled on the first Ctrl+C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C signal");
            token.cancel();
        }
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_to_proto_keeps_every_field() {
        let auth = AuthConfig {
            identity_token: "id".into(),
            registry_token: "reg".into(),
            server_address: "https://index.docker.io/v1/".into(),
            ..AuthConfig::basic("bob", "hunter2")
        };
        let proto = auth_to_proto(auth.clone());
        assert_eq!(proto.username, "bob");
        assert_eq!(proto.password, "hunter2");
        assert_eq!(proto.auth, auth.auth);
        assert_eq!(proto.server_address, "https://index.docker.io/v1/");
        assert_eq!(proto.identity_token, "id");
        assert_eq!(proto.registry_token, "reg");
    }
}
