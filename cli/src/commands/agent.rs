// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `kiln agent`: the in-cluster side of the builder.
//!
//! Opens the build executor's namespace and the servable namespace on the
//! node's containerd (or an on-disk store), mirrors images from the former
//! into the latter, and serves the Images API until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Args;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kiln_core::application::images::ImagesService;
use kiln_core::application::jobs::{JobTracker, ProgressSettings};
use kiln_core::application::sync::{ContentSyncEngine, SyncSettings};
use kiln_core::domain::agent_config::{AgentConfigManifest, StoreBackend};
use kiln_core::domain::events::EventPublisher;
use kiln_core::infrastructure::containerd::{self, ContainerdEventFeed};
use kiln_core::infrastructure::content::{open_namespace, ContentBackend};
use kiln_core::infrastructure::event_bus::EventBus;
use kiln_core::infrastructure::registry::RegistryTransfer;
use kiln_core::presentation::grpc::server::{start_grpc_server, ServerTls};

#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Path to the agent configuration file (overrides discovery)
    #[arg(short, long, env = "KILN_CONFIG_PATH", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port the Images service listens on
    #[arg(long)]
    pub agent_port: Option<u16>,

    /// Where images live: `containerd` or `local`
    #[arg(long, value_name = "BACKEND")]
    pub content_backend: Option<StoreBackend>,

    #[arg(long)]
    pub containerd_socket: Option<String>,

    /// CA that client certificates must chain to
    #[arg(long, value_name = "FILE")]
    pub tlscacert: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub tlscert: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub tlskey: Option<PathBuf>,
}

impl AgentArgs {
    /// Flags win over file and environment values.
    pub fn apply(&self, config: &mut AgentConfigManifest) {
        let spec = &mut config.spec;
        if let Some(port) = self.agent_port {
            spec.agent_port = port;
        }
        if let Some(backend) = self.content_backend {
            spec.content.backend = backend;
        }
        if let Some(socket) = &self.containerd_socket {
            spec.content.containerd_socket = socket.clone();
        }
        if self.tlscacert.is_some() {
            spec.tls.ca_cert = self.tlscacert.clone();
        }
        if self.tlscert.is_some() {
            spec.tls.cert = self.tlscert.clone();
        }
        if self.tlskey.is_some() {
            spec.tls.key = self.tlskey.clone();
        }
    }
}

pub async fn run(args: AgentArgs) -> Result<()> {
    let mut config =
        AgentConfigManifest::load_or_default(args.config.clone()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Configuration validation failed")?;
    let spec = &config.spec;

    info!(
        name = %config.metadata.name,
        agent_port = spec.agent_port,
        buildkit_namespace = %spec.buildkit.namespace,
        servable_namespace = %spec.content.servable_namespace,
        backend = ?spec.content.backend,
        "Starting kiln agent"
    );

    let bus = EventBus::with_default_capacity();
    let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
    let shutdown = CancellationToken::new();

    let backend = match spec.content.backend {
        StoreBackend::Containerd => {
            info!(socket = %spec.content.containerd_socket, "Using containerd content store");
            let channel = containerd::connect(&spec.content.containerd_socket);
            tokio::spawn(ContainerdEventFeed::new(channel.clone()).forward(
                spec.buildkit.namespace.clone(),
                publisher.clone(),
                shutdown.child_token(),
            ));
            ContentBackend::Containerd { channel }
        }
        StoreBackend::Local => {
            info!(root = %spec.content.root.display(), "Using on-disk content store");
            ContentBackend::Local {
                root: spec.content.root.clone(),
            }
        }
    };
    let buildkit = open_namespace(&backend, &spec.buildkit.namespace, Some(publisher.clone()))
        .with_context(|| format!("Failed to open namespace {}", spec.buildkit.namespace))?;
    let servable = open_namespace(&backend, &spec.content.servable_namespace, Some(publisher))
        .with_context(|| format!("Failed to open namespace {}", spec.content.servable_namespace))?;

    let engine = Arc::new(ContentSyncEngine::new(
        buildkit.clone(),
        servable.clone(),
        SyncSettings::from(&spec.sync),
    ));
    let sync = engine.spawn(&bus, shutdown.child_token());

    let transfer = RegistryTransfer::new().context("Failed to build registry client")?;
    let jobs = JobTracker::new(ProgressSettings::from(&spec.progress));
    let images = Arc::new(ImagesService::new(servable, buildkit, Arc::new(transfer), jobs));

    let tls = ServerTls::from_files(
        spec.tls.ca_cert.as_deref(),
        spec.tls.cert.as_deref(),
        spec.tls.key.as_deref(),
    )
    .context("Failed to read TLS material")?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), spec.agent_port);

    let signals = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signals.cancel();
    });

    let served = start_grpc_server(addr, images, tls, shutdown.clone()).await;
    shutdown.cancel();

    match sync.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Sync engine stopped with error"),
        Err(e) => warn!(error = %e, "Sync engine task failed"),
    }

    if let Err(e) = served {
        error!(error = %e, "gRPC server failed");
        anyhow::bail!("gRPC server failed: {}", e);
    }
    info!("kiln agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = AgentConfigManifest::default();
        let args = AgentArgs {
            agent_port: Some(9000),
            containerd_socket: Some("/run/containerd/containerd.sock".into()),
            tlscert: Some(PathBuf::from("/certs/server/tls.crt")),
            ..Default::default()
        };
        args.apply(&mut config);
        assert_eq!(config.spec.agent_port, 9000);
        assert_eq!(config.spec.content.containerd_socket, "/run/containerd/containerd.sock");
        assert_eq!(config.spec.tls.cert, Some(PathBuf::from("/certs/server/tls.crt")));
        assert!(config.spec.tls.ca_cert.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln-config.yaml");
        std::fs::write(
            &path,
            "apiVersion: kiln.dev/v1\nkind: AgentConfig\nmetadata:\n  name: node-a\nspec:\n  agent_port: 7000\n  sync:\n    wait_timeout_seconds: 30\n",
        )
        .unwrap();
        let mut config = AgentConfigManifest::from_yaml_file(&path).unwrap();
        AgentArgs {
            content_backend: Some(StoreBackend::Local),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.spec.agent_port, 7000);
        assert_eq!(config.spec.content.backend, StoreBackend::Local);
        assert_eq!(config.spec.sync.wait_timeout_seconds, 30);
    }

    #[derive(clap::Parser)]
    struct Agent {
        #[command(flatten)]
        args: AgentArgs,
    }

    #[test]
    fn test_workload_flags_parse() {
        use clap::Parser;
        let agent = Agent::try_parse_from([
            "agent",
            "--agent-port=8011",
            "--containerd-socket=/run/k3s/containerd/containerd.sock",
            "--content-backend=containerd",
            "--tlscacert=/certs/ca/tls.crt",
            "--tlscert=/certs/server/tls.crt",
            "--tlskey=/certs/server/tls.key",
        ])
        .unwrap();
        assert_eq!(agent.args.agent_port, Some(8011));
        assert_eq!(agent.args.content_backend, Some(StoreBackend::Containerd));
        assert!(Agent::try_parse_from(["agent", "--buildkit-port=1234"]).is_err());
        assert!(Agent::try_parse_from(["agent", "--content-backend=overlay"]).is_err());
    }
}
