// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builder Install Application Service
//!
//! Converges the cluster on a [`BuilderDesiredState`] in six ordered steps:
//!
//! 1. **node-role** - label the single node matched by the selector and
//!    infer content-store paths from its container runtime
//! 2. **namespace** - ensure the namespace exists and is managed
//! 3. **secrets** - CA, server leaf, client leaf
//! 4. **service** - two-port NodePort service
//! 5. **workload** - node-pinned DaemonSet
//! 6. **wait-ready** - poll until one replica reports ready
//!
//! Every step is idempotent, so a repeated install with `force = false`
//! issues no updates. With `no_fail` a failing step is logged and the
//! sequence carries on; otherwise the first failure aborts with an
//! [`InstallError`] naming the step.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::identity::{IdentityError, IdentityProvisioner};
use crate::application::retry::{poll_until, retry_on_conflict, Backoff, ConflictRetry, PollError};
use crate::application::workload::{render_service, render_workload, service_up_to_date, workload_matches};
use crate::domain::builder::{
    BuilderDesiredState, ContentStorePaths, RuntimeFamily, UnsupportedRuntime, BUILDER_NAME,
    BUILDER_ROLE_LABEL, CA_SECRET, CLIENT_SECRET, HOSTNAME_LABEL, K3S_HOSTNAME_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, SERVER_SECRET,
};
use crate::domain::certificate::{
    CertificateIssuer, LeafRequest, DEFAULT_CLIENT_COMMON_NAME, DEFAULT_SERVER_COMMON_NAME,
};
use crate::domain::cluster::{
    ClusterError, ClusterStore, LabelSelector, NamespaceRecord, NodeAddressKind, ObjectMeta,
    WorkloadStatus,
};

/// Outer limit around the readiness wait.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    NodeRole,
    Namespace,
    Secrets,
    Service,
    Workload,
    WaitReady,
}

impl InstallStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStep::NodeRole => "node-role",
            InstallStep::Namespace => "namespace",
            InstallStep::Secrets => "secrets",
            InstallStep::Service => "service",
            InstallStep::Workload => "workload",
            InstallStep::WaitReady => "wait-ready",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to select any nodes")]
    NoMatchingNodes,

    #[error("Too many nodes, please specify a selector, e.g. {label}={node}")]
    AmbiguousSelector { label: &'static str, node: String },

    #[error(transparent)]
    Runtime(#[from] UnsupportedRuntime),

    #[error("content store paths unknown: no node was selected and none were given")]
    UnresolvedContentStore,

    #[error("builder already installed")]
    AlreadyInstalled,

    #[error("timeout waiting for builder to become available")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, thiserror::Error)]
#[error("install step `{step}` failed: {source}")]
pub struct InstallError {
    pub step: InstallStep,
    #[source]
    pub source: StepError,
}

impl InstallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self.source, StepError::Timeout)
    }
}

/// What a completed install resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    pub node: Option<String>,
    pub content_store: Option<ContentStorePaths>,
    pub status: Option<WorkloadStatus>,
    /// Steps that failed but were tolerated under `no_fail`
    pub skipped: Vec<InstallStep>,
}

struct SelectedNode {
    name: String,
    paths: ContentStorePaths,
}

pub struct Installer {
    store: Arc<dyn ClusterStore>,
    identity: IdentityProvisioner,
    retry: ConflictRetry,
    readiness: Backoff,
    timeout: Duration,
}

impl Installer {
    pub fn new(store: Arc<dyn ClusterStore>, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            identity: IdentityProvisioner::new(store.clone(), issuer),
            store,
            retry: ConflictRetry::default(),
            readiness: Backoff::readiness(),
            timeout: INSTALL_TIMEOUT,
        }
    }

    pub fn with_readiness(mut self, readiness: Backoff, timeout: Duration) -> Self {
        self.readiness = readiness;
        self.timeout = timeout;
        self
    }

    pub async fn install(
        &self,
        desired: &BuilderDesiredState,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallError> {
        let mut outcome = InstallOutcome::default();
        info!(
            namespace = %desired.namespace,
            selector = %desired.node_selector,
            force = desired.force,
            "Installing builder"
        );

        let selected = self.node_role(desired).await;
        if let Some(selected) = self.checked(InstallStep::NodeRole, desired, &mut outcome, selected)? {
            outcome.node = Some(selected.name);
            outcome.content_store = Some(selected.paths);
        }
        let paths = outcome
            .content_store
            .clone()
            .or_else(|| explicit_paths(desired));

        let result = self.namespace(&desired.namespace).await;
        self.checked(InstallStep::Namespace, desired, &mut outcome, result)?;

        let result = self.secrets(desired).await;
        self.checked(InstallStep::Secrets, desired, &mut outcome, result)?;

        let result = self.service(desired).await;
        self.checked(InstallStep::Service, desired, &mut outcome, result)?;

        let result = match &paths {
            Some(paths) => self.workload(desired, paths).await,
            None => Err(StepError::UnresolvedContentStore),
        };
        self.checked(InstallStep::Workload, desired, &mut outcome, result)?;

        if desired.no_wait {
            return Ok(outcome);
        }

        let result = self.wait_ready(&desired.namespace, cancel).await;
        let status = self.checked(InstallStep::WaitReady, desired, &mut outcome, result)?;
        outcome.status = status;
        Ok(outcome)
    }

    /// Install with `no_fail` unless the builder already reports an
    /// available replica.
    pub async fn ensure_installed(
        &self,
        desired: &BuilderDesiredState,
        cancel: &CancellationToken,
    ) -> Result<Option<InstallOutcome>, InstallError> {
        match self.store.get_workload(&desired.namespace, BUILDER_NAME).await {
            Ok(workload) if workload.status.number_available > 0 => {
                debug!(namespace = %desired.namespace, "Builder already available");
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(InstallError {
                    step: InstallStep::WaitReady,
                    source: e.into(),
                })
            }
        }
        let desired = BuilderDesiredState {
            no_wait: false,
            no_fail: true,
            ..desired.clone()
        };
        self.install(&desired, cancel).await.map(Some)
    }

    fn checked<T>(
        &self,
        step: InstallStep,
        desired: &BuilderDesiredState,
        outcome: &mut InstallOutcome,
        result: Result<T, StepError>,
    ) -> Result<Option<T>, InstallError> {
        match result {
            Ok(value) => {
                metrics::counter!("kiln_install_steps_total", "step" => step.as_str(), "outcome" => "ok")
                    .increment(1);
                Ok(Some(value))
            }
            Err(source) if desired.no_fail => {
                metrics::counter!("kiln_install_steps_total", "step" => step.as_str(), "outcome" => "ignored")
                    .increment(1);
                warn!(step = %step, error = %source, "Install step failed, continuing");
                outcome.skipped.push(step);
                Ok(None)
            }
            Err(source) => {
                metrics::counter!("kiln_install_steps_total", "step" => step.as_str(), "outcome" => "failed")
                    .increment(1);
                Err(InstallError { step, source })
            }
        }
    }

    async fn node_role(&self, desired: &BuilderDesiredState) -> Result<SelectedNode, StepError> {
        let selector = LabelSelector::parse(&desired.node_selector)?;
        let nodes = self.store.list_nodes(&selector).await?;
        let node = match nodes.as_slice() {
            [] => return Err(StepError::NoMatchingNodes),
            [node] => node,
            [first, ..] => {
                let label = if first.meta.labels.contains_key(K3S_HOSTNAME_LABEL) {
                    K3S_HOSTNAME_LABEL
                } else {
                    HOSTNAME_LABEL
                };
                return Err(StepError::AmbiguousSelector {
                    label,
                    node: first.meta.name.clone(),
                });
            }
        };

        let family = RuntimeFamily::detect(&node.container_runtime_version)?;
        let paths = ContentStorePaths {
            socket: non_empty(&desired.content_store_socket_path)
                .unwrap_or_else(|| family.default_socket().to_string()),
            volume: non_empty(&desired.content_store_volume_path)
                .unwrap_or_else(|| family.default_volume().to_string()),
        };

        let store = &self.store;
        let name = node.meta.name.as_str();
        retry_on_conflict(self.retry, move || async move {
            let mut node = store.get_node(name).await?;
            if node.meta.labels.get(BUILDER_ROLE_LABEL).map(String::as_str) == Some("true") {
                debug!(node = %name, "Node already carries builder role");
                return Ok(());
            }
            info!(node = %name, "Applying node-role `builder`");
            node.meta
                .labels
                .insert(BUILDER_ROLE_LABEL.to_string(), "true".to_string());
            store.update_node(&node).await.map(|_| ())
        })
        .await?;

        debug!(node = %name, paths = %paths, "Resolved content store");
        Ok(SelectedNode {
            name: name.to_string(),
            paths,
        })
    }

    async fn namespace(&self, namespace: &str) -> Result<(), StepError> {
        info!(namespace = %namespace, "Asserting namespace");
        let store = &self.store;
        retry_on_conflict(self.retry, move || async move {
            match store.get_namespace(namespace).await {
                Ok(mut record) => {
                    if record.meta.labels.contains_key(MANAGED_BY_LABEL) {
                        return Ok(());
                    }
                    record
                        .meta
                        .labels
                        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
                    store.update_namespace(&record).await.map(|_| ())
                }
                Err(e) if e.is_not_found() => {
                    let record = NamespaceRecord {
                        meta: ObjectMeta::named(namespace).with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE),
                    };
                    store.create_namespace(&record).await.map(|_| ())
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }

    async fn secrets(&self, desired: &BuilderDesiredState) -> Result<(), StepError> {
        info!("Asserting TLS secrets");
        let namespace = desired.namespace.as_str();
        if desired.force {
            for name in [CLIENT_SECRET, SERVER_SECRET, CA_SECRET] {
                ignore_not_found(self.store.delete_secret(namespace, name).await)?;
            }
        }

        let ca = self.identity.load_or_generate_ca(namespace, CA_SECRET).await?;

        let builders = self
            .store
            .list_nodes(&LabelSelector::parse(&format!("{}=true", BUILDER_ROLE_LABEL))?)
            .await?;
        let mut dns_names = vec![format!("{}.{}.svc", BUILDER_NAME, namespace)];
        let mut ip_addresses: Vec<IpAddr> = Vec::new();
        for node in &builders {
            for address in &node.addresses {
                match address.kind {
                    NodeAddressKind::Hostname => dns_names.push(address.address.clone()),
                    NodeAddressKind::InternalIp => match address.address.parse() {
                        Ok(ip) => ip_addresses.push(ip),
                        Err(_) => warn!(node = %node.meta.name, address = %address.address, "Skipping unparsable node address"),
                    },
                    _ => {}
                }
            }
        }

        let server = LeafRequest::server(DEFAULT_SERVER_COMMON_NAME, Vec::new(), dns_names, ip_addresses);
        self.identity
            .load_or_generate_leaf(namespace, SERVER_SECRET, &ca.material, &server)
            .await?;

        let client = LeafRequest::client(DEFAULT_CLIENT_COMMON_NAME);
        self.identity
            .load_or_generate_leaf(namespace, CLIENT_SECRET, &ca.material, &client)
            .await?;
        Ok(())
    }

    async fn service(&self, desired: &BuilderDesiredState) -> Result<(), StepError> {
        info!("Asserting service/endpoints");
        let namespace = desired.namespace.as_str();
        if desired.force {
            ignore_not_found(self.store.delete_service(namespace, BUILDER_NAME).await)?;
        }
        let wanted = render_service(namespace, desired);
        let store = &self.store;
        let wanted = &wanted;
        retry_on_conflict(self.retry, move || async move {
            match store.get_service(namespace, BUILDER_NAME).await {
                Ok(live) if service_up_to_date(&live, wanted) => {
                    debug!("Service up to date");
                    Ok(())
                }
                Ok(mut live) => {
                    live.spec = wanted.spec.clone();
                    live.meta.labels.extend(wanted.meta.labels.clone());
                    store.update_service(&live).await.map(|_| ())
                }
                Err(e) if e.is_not_found() => store.create_service(wanted).await.map(|_| ()),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }

    async fn workload(
        &self,
        desired: &BuilderDesiredState,
        paths: &ContentStorePaths,
    ) -> Result<(), StepError> {
        info!("Installing builder daemon");
        let namespace = desired.namespace.as_str();
        if desired.force {
            ignore_not_found(self.store.delete_workload(namespace, BUILDER_NAME).await)?;
        }
        let wanted = render_workload(namespace, desired, paths);
        match self.store.get_workload(namespace, BUILDER_NAME).await {
            Ok(live) if workload_matches(&live, &wanted) => {
                debug!("Builder daemon already matches desired state");
                return Ok(());
            }
            Ok(_) => return Err(StepError::AlreadyInstalled),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.create_workload(&wanted).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Err(StepError::AlreadyInstalled),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_ready(
        &self,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkloadStatus, StepError> {
        let store = &self.store;
        let poll = poll_until(self.readiness, cancel, move || async move {
            let workload = store.get_workload(namespace, BUILDER_NAME).await?;
            if workload.status.number_ready > 0 {
                Ok(Some(workload.status))
            } else {
                info!("Waiting on builder daemon availability...");
                Ok::<_, ClusterError>(None)
            }
        });
        match tokio::time::timeout(self.timeout, poll).await {
            Ok(Ok(status)) => {
                info!(ready = status.number_ready, "Builder is available");
                Ok(status)
            }
            Ok(Err(PollError::Failed(e))) => Err(e.into()),
            Ok(Err(PollError::Cancelled)) => Err(StepError::Cancelled),
            Ok(Err(PollError::Exhausted(_))) | Err(_) => Err(StepError::Timeout),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

fn explicit_paths(desired: &BuilderDesiredState) -> Option<ContentStorePaths> {
    Some(ContentStorePaths {
        socket: non_empty(&desired.content_store_socket_path)?,
        volume: non_empty(&desired.content_store_volume_path)?,
    })
}

fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
