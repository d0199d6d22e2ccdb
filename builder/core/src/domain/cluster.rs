// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Cluster Resource Store
//!
//! Typed view of the handful of cluster objects the reconciler manages, and
//! the [`ClusterStore`] contract it drives them through. Every record carries
//! an opaque `resource_version`; updates with a stale version fail with
//! [`ClusterError::Conflict`], which is the signal for read-modify-write
//! retry (see `application::retry`).
//!
//! | Record | Cluster object |
//! |--------|----------------|
//! | [`NodeRecord`] | `Node` |
//! | [`NamespaceRecord`] | `Namespace` |
//! | [`SecretRecord`] | `Secret` |
//! | [`ServiceRecord`] | `Service` |
//! | [`WorkloadRecord`] | `DaemonSet` |
//! | [`EndpointsRecord`] | `Endpoints` |
//!
//! Implementations: `MemoryClusterStore` (tests) and `KubeClusterStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Labels = BTreeMap<String, String>;

/// Metadata shared by every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressKind {
    Hostname,
    InternalIp,
    ExternalIp,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub kind: NodeAddressKind,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub meta: ObjectMeta,
    /// Runtime identifier as reported by the node, e.g. `containerd://1.4.3-k3s1`
    pub container_runtime_version: String,
    pub addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub meta: ObjectMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    #[default]
    Opaque,
    Tls,
    DockerConfigJson,
}

impl SecretType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretType::Opaque => "Opaque",
            SecretType::Tls => "kubernetes.io/tls",
            SecretType::DockerConfigJson => "kubernetes.io/dockerconfigjson",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "kubernetes.io/tls" => SecretType::Tls,
            "kubernetes.io/dockerconfigjson" => SecretType::DockerConfigJson,
            _ => SecretType::Opaque,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub meta: ObjectMeta,
    pub secret_type: SecretType,
    pub data: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_type: String,
    pub selector: Labels,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub meta: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    /// `Bidirectional` for mounts shared back to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_propagation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecProbe {
    pub command: Vec<String>,
    pub initial_delay_seconds: i32,
    pub period_seconds: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ExecProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ExecProbe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    HostPath { path: String, kind: String },
    Secret { secret_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

/// Pod template of the node-pinned builder workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub selector: Labels,
    pub template_labels: Labels,
    pub node_selector: Labels,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
    pub dns_policy: String,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired_number_scheduled: i32,
    pub number_ready: i32,
    pub number_available: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub meta: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    pub addresses: Vec<String>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointsRecord {
    pub meta: ObjectMeta,
    pub subsets: Vec<EndpointSubset>,
}

/// Equality-based label selector: `k=v`, `k==v`, `k!=v` and bare `k`
/// (existence) terms joined by commas. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: Vec<SelectorTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorTerm {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, ClusterError> {
        let mut terms = Vec::new();
        for raw in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let term = if let Some((k, v)) = raw.split_once("!=") {
                SelectorTerm::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = raw.split_once("==") {
                SelectorTerm::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = raw.split_once('=') {
                SelectorTerm::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                SelectorTerm::Exists(raw.to_string())
            };
            let key = match &term {
                SelectorTerm::Equals(k, _) | SelectorTerm::NotEquals(k, _) | SelectorTerm::Exists(k) => k,
            };
            if key.is_empty() {
                return Err(ClusterError::InvalidSelector(selector.to_string()));
            }
            terms.push(term);
        }
        Ok(Self { terms })
    }

    pub fn exists(key: &str) -> Self {
        Self {
            terms: vec![SelectorTerm::Exists(key.to_string())],
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.terms.iter().all(|term| match term {
            SelectorTerm::Equals(k, v) => labels.get(k) == Some(v),
            SelectorTerm::NotEquals(k, v) => labels.get(k) != Some(v),
            SelectorTerm::Exists(k) => labels.contains_key(k),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .terms
            .iter()
            .map(|term| match term {
                SelectorTerm::Equals(k, v) => format!("{}={}", k, v),
                SelectorTerm::NotEquals(k, v) => format!("{}!={}", k, v),
                SelectorTerm::Exists(k) => k.clone(),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict updating {kind} `{name}`: object has been modified")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid label selector `{0}`")]
    InvalidSelector(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Typed access to the cluster resource store.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<NodeRecord>, ClusterError>;
    async fn get_node(&self, name: &str) -> Result<NodeRecord, ClusterError>;
    async fn update_node(&self, node: &NodeRecord) -> Result<NodeRecord, ClusterError>;

    async fn get_namespace(&self, name: &str) -> Result<NamespaceRecord, ClusterError>;
    async fn create_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError>;
    async fn update_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError>;
    /// Delete with foreground propagation; returns once the request is accepted.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
    /// Resolves when a deletion event for the namespace is observed.
    async fn wait_namespace_deleted(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, ClusterError>;
    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError>;
    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError>;
    async fn create_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError>;
    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<WorkloadRecord, ClusterError>;
    async fn create_workload(&self, workload: &WorkloadRecord) -> Result<WorkloadRecord, ClusterError>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<EndpointsRecord, ClusterError>;
}
