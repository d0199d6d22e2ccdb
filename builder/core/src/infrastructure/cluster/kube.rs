// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes-backed [`ClusterStore`].
//!
//! Records map onto `Node`, `Namespace`, `Secret`, `Service`, `DaemonSet` and
//! `Endpoints`. Updates are full replaces carrying the record's resource
//! version, so a stale read surfaces as [`ClusterError::Conflict`].

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort as K8sContainerPort, EnvVar as K8sEnvVar, ExecAction,
    HostPathVolumeSource, Namespace, Node, PodSpec, PodTemplateSpec, Probe, Secret,
    SecretVolumeSource, SecurityContext, Service, ServicePort as K8sServicePort,
    ServiceSpec as K8sServiceSpec, Volume as K8sVolume, VolumeMount as K8sVolumeMount,
};
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as K8sLabelSelector, ObjectMeta as K8sMeta};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::cluster::{
    ClusterError, ClusterStore, ContainerPort, ContainerSpec, EndpointPort, EndpointSubset,
    EndpointsRecord, EnvVar, ExecProbe, LabelSelector, NamespaceRecord, NodeAddress,
    NodeAddressKind, NodeRecord, ObjectMeta, SecretRecord, SecretType, ServicePort,
    ServiceRecord, ServiceSpec, Volume, VolumeMount, VolumeSource, WorkloadRecord, WorkloadSpec,
    WorkloadStatus,
};

/// Where to find cluster credentials.
#[derive(Debug, Clone, Default)]
pub struct KubeConnection {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig/context, falling back to
    /// the usual inference (env, `~/.kube/config`, in-cluster).
    pub async fn connect(connection: &KubeConnection) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: connection.context.clone(),
            ..Default::default()
        };
        let config = match (&connection.kubeconfig, &connection.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Api(format!("reading {}: {}", path.display(), e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Api(e.to_string()))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Api(e.to_string()))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| ClusterError::Api(e.to_string()))?,
        };
        let client = Client::try_from(config).map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_sets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_error(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::not_found(kind, name),
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            ClusterError::already_exists(kind, name)
        }
        kube::Error::Api(response) if response.code == 409 => ClusterError::conflict(kind, name),
        kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
        other => ClusterError::Api(other.to_string()),
    }
}

fn namespace_of(meta: &ObjectMeta) -> Result<&str, ClusterError> {
    meta.namespace
        .as_deref()
        .ok_or_else(|| ClusterError::Api(format!("`{}` has no namespace", meta.name)))
}

fn to_k8s_meta(meta: &ObjectMeta) -> K8sMeta {
    K8sMeta {
        name: Some(meta.name.clone()),
        namespace: meta.namespace.clone(),
        labels: non_empty(&meta.labels),
        annotations: non_empty(&meta.annotations),
        resource_version: meta.resource_version.clone(),
        ..Default::default()
    }
}

fn from_k8s_meta(meta: &K8sMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
    }
}

/// Overlay the record's labels, annotations and version onto a live object.
fn merge_meta(live: &mut K8sMeta, desired: &ObjectMeta) {
    live.labels = non_empty(&desired.labels);
    live.annotations = non_empty(&desired.annotations);
    if desired.resource_version.is_some() {
        live.resource_version = desired.resource_version.clone();
    }
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn node_record(node: &Node) -> NodeRecord {
    let status = node.status.as_ref();
    let addresses = status
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .map(|a| NodeAddress {
                    kind: match a.type_.as_str() {
                        "Hostname" => NodeAddressKind::Hostname,
                        "InternalIP" => NodeAddressKind::InternalIp,
                        "ExternalIP" => NodeAddressKind::ExternalIp,
                        _ => NodeAddressKind::Other,
                    },
                    address: a.address.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    NodeRecord {
        meta: from_k8s_meta(&node.metadata),
        container_runtime_version: status
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.container_runtime_version.clone())
            .unwrap_or_default(),
        addresses,
    }
}

fn secret_record(secret: &Secret) -> SecretRecord {
    SecretRecord {
        meta: from_k8s_meta(&secret.metadata),
        secret_type: SecretType::parse(secret.type_.as_deref().unwrap_or("Opaque")),
        data: secret
            .data
            .as_ref()
            .map(|data| data.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default(),
    }
}

fn to_secret(record: &SecretRecord) -> Secret {
    Secret {
        metadata: to_k8s_meta(&record.meta),
        type_: Some(record.secret_type.as_str().to_string()),
        data: Some(
            record
                .data
                .iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn service_record(service: &Service) -> ServiceRecord {
    let spec = service.spec.clone().unwrap_or_default();
    ServiceRecord {
        meta: from_k8s_meta(&service.metadata),
        spec: ServiceSpec {
            service_type: spec.type_.unwrap_or_default(),
            selector: spec.selector.unwrap_or_default(),
            ports: spec
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| ServicePort {
                    name: p.name.unwrap_or_default(),
                    port: p.port,
                    protocol: p.protocol.unwrap_or_else(|| "TCP".into()),
                })
                .collect(),
        },
    }
}

/// Desired service ports, keeping node ports already allocated by name.
fn service_ports(spec: &ServiceSpec, live: Option<&K8sServiceSpec>) -> Vec<K8sServicePort> {
    spec.ports
        .iter()
        .map(|p| K8sServicePort {
            name: Some(p.name.clone()),
            port: p.port,
            protocol: Some(p.protocol.clone()),
            node_port: live
                .and_then(|l| l.ports.as_ref())
                .and_then(|ports| ports.iter().find(|lp| lp.name.as_deref() == Some(&p.name)))
                .and_then(|lp| lp.node_port),
            ..Default::default()
        })
        .collect()
}

fn to_container(spec: &ContainerSpec) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!spec.env.is_empty()).then(|| {
            spec.env
                .iter()
                .map(|e| K8sEnvVar {
                    name: e.name.clone(),
                    value: Some(e.value.clone()),
                    ..Default::default()
                })
                .collect()
        }),
        ports: (!spec.ports.is_empty()).then(|| {
            spec.ports
                .iter()
                .map(|p| K8sContainerPort {
                    name: Some(p.name.clone()),
                    container_port: p.container_port,
                    protocol: Some(p.protocol.clone()),
                    ..Default::default()
                })
                .collect()
        }),
        security_context: spec.privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: (!spec.volume_mounts.is_empty()).then(|| {
            spec.volume_mounts
                .iter()
                .map(|m| K8sVolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    read_only: m.read_only.then_some(true),
                    mount_propagation: m.mount_propagation.clone(),
                    ..Default::default()
                })
                .collect()
        }),
        readiness_probe: spec.readiness_probe.as_ref().map(to_probe),
        liveness_probe: spec.liveness_probe.as_ref().map(to_probe),
        ..Default::default()
    }
}

fn to_probe(probe: &ExecProbe) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(probe.command.clone()),
        }),
        initial_delay_seconds: Some(probe.initial_delay_seconds),
        period_seconds: Some(probe.period_seconds),
        ..Default::default()
    }
}

fn from_probe(probe: &Probe) -> Option<ExecProbe> {
    let command = probe.exec.as_ref()?.command.clone().unwrap_or_default();
    Some(ExecProbe {
        command,
        initial_delay_seconds: probe.initial_delay_seconds.unwrap_or_default(),
        period_seconds: probe.period_seconds.unwrap_or_default(),
    })
}

fn from_container(c: &Container) -> ContainerSpec {
    ContainerSpec {
        name: c.name.clone(),
        image: c.image.clone().unwrap_or_default(),
        command: c.command.clone().unwrap_or_default(),
        args: c.args.clone().unwrap_or_default(),
        env: c
            .env
            .iter()
            .flatten()
            .map(|e| EnvVar {
                name: e.name.clone(),
                value: e.value.clone().unwrap_or_default(),
            })
            .collect(),
        ports: c
            .ports
            .iter()
            .flatten()
            .map(|p| ContainerPort {
                name: p.name.clone().unwrap_or_default(),
                container_port: p.container_port,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".into()),
            })
            .collect(),
        privileged: c
            .security_context
            .as_ref()
            .and_then(|s| s.privileged)
            .unwrap_or(false),
        volume_mounts: c
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| VolumeMount {
                name: m.name.clone(),
                mount_path: m.mount_path.clone(),
                read_only: m.read_only.unwrap_or(false),
                mount_propagation: m.mount_propagation.clone(),
            })
            .collect(),
        readiness_probe: c.readiness_probe.as_ref().and_then(from_probe),
        liveness_probe: c.liveness_probe.as_ref().and_then(from_probe),
    }
}

fn to_volume(volume: &Volume) -> K8sVolume {
    match &volume.source {
        VolumeSource::HostPath { path, kind } => K8sVolume {
            name: volume.name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: path.clone(),
                type_: Some(kind.clone()),
            }),
            ..Default::default()
        },
        VolumeSource::Secret { secret_name } => K8sVolume {
            name: volume.name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn from_volume(volume: &K8sVolume) -> Option<Volume> {
    let source = if let Some(host_path) = &volume.host_path {
        VolumeSource::HostPath {
            path: host_path.path.clone(),
            kind: host_path.type_.clone().unwrap_or_default(),
        }
    } else if let Some(secret) = &volume.secret {
        VolumeSource::Secret {
            secret_name: secret.secret_name.clone().unwrap_or_default(),
        }
    } else {
        return None;
    };
    Some(Volume {
        name: volume.name.clone(),
        source,
    })
}

fn to_daemon_set(record: &WorkloadRecord) -> DaemonSet {
    let spec = &record.spec;
    DaemonSet {
        metadata: to_k8s_meta(&record.meta),
        spec: Some(DaemonSetSpec {
            selector: K8sLabelSelector {
                match_labels: non_empty(&spec.selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(K8sMeta {
                    labels: non_empty(&spec.template_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: non_empty(&spec.node_selector),
                    host_network: Some(spec.host_network),
                    host_pid: Some(spec.host_pid),
                    host_ipc: Some(spec.host_ipc),
                    dns_policy: (!spec.dns_policy.is_empty()).then(|| spec.dns_policy.clone()),
                    init_containers: Some(spec.init_containers.iter().map(to_container).collect()),
                    containers: spec.containers.iter().map(to_container).collect(),
                    volumes: Some(spec.volumes.iter().map(to_volume).collect()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workload_record(ds: &DaemonSet) -> WorkloadRecord {
    let spec = ds.spec.clone().unwrap_or_default();
    let template_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let pod = spec.template.spec.unwrap_or_default();
    let status = ds.status.as_ref();
    WorkloadRecord {
        meta: from_k8s_meta(&ds.metadata),
        spec: WorkloadSpec {
            selector: spec.selector.match_labels.unwrap_or_default(),
            template_labels,
            node_selector: pod.node_selector.unwrap_or_default(),
            host_network: pod.host_network.unwrap_or(false),
            host_pid: pod.host_pid.unwrap_or(false),
            host_ipc: pod.host_ipc.unwrap_or(false),
            dns_policy: pod.dns_policy.unwrap_or_default(),
            init_containers: pod.init_containers.iter().flatten().map(from_container).collect(),
            containers: pod.containers.iter().map(from_container).collect(),
            volumes: pod.volumes.iter().flatten().filter_map(from_volume).collect(),
        },
        status: WorkloadStatus {
            desired_number_scheduled: status.map(|s| s.desired_number_scheduled).unwrap_or(0),
            number_ready: status.map(|s| s.number_ready).unwrap_or(0),
            number_available: status.and_then(|s| s.number_available).unwrap_or(0),
        },
    }
}

fn endpoints_record(endpoints: &Endpoints) -> EndpointsRecord {
    EndpointsRecord {
        meta: from_k8s_meta(&endpoints.metadata),
        subsets: endpoints
            .subsets
            .iter()
            .flatten()
            .map(|subset| EndpointSubset {
                addresses: subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|a| a.ip.clone())
                    .collect(),
                ports: subset
                    .ports
                    .iter()
                    .flatten()
                    .map(|p| EndpointPort {
                        name: p.name.clone().unwrap_or_default(),
                        port: p.port,
                    })
                    .collect(),
            })
            .collect(),
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<NodeRecord>, ClusterError> {
        let params = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&selector.to_string())
        };
        let nodes = self
            .nodes()
            .list(&params)
            .await
            .map_err(|e| map_error("node", &selector.to_string(), e))?;
        Ok(nodes.items.iter().map(node_record).collect())
    }

    async fn get_node(&self, name: &str) -> Result<NodeRecord, ClusterError> {
        let node = self.nodes().get(name).await.map_err(|e| map_error("node", name, e))?;
        Ok(node_record(&node))
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<NodeRecord, ClusterError> {
        let name = &node.meta.name;
        let api = self.nodes();
        let mut live = api.get(name).await.map_err(|e| map_error("node", name, e))?;
        merge_meta(&mut live.metadata, &node.meta);
        let updated = api
            .replace(name, &PostParams::default(), &live)
            .await
            .map_err(|e| map_error("node", name, e))?;
        Ok(node_record(&updated))
    }

    async fn get_namespace(&self, name: &str) -> Result<NamespaceRecord, ClusterError> {
        let ns = self
            .namespaces()
            .get(name)
            .await
            .map_err(|e| map_error("namespace", name, e))?;
        Ok(NamespaceRecord {
            meta: from_k8s_meta(&ns.metadata),
        })
    }

    async fn create_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError> {
        let object = Namespace {
            metadata: to_k8s_meta(&ns.meta),
            ..Default::default()
        };
        let created = self
            .namespaces()
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error("namespace", &ns.meta.name, e))?;
        Ok(NamespaceRecord {
            meta: from_k8s_meta(&created.metadata),
        })
    }

    async fn update_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError> {
        let name = &ns.meta.name;
        let api = self.namespaces();
        let mut live = api.get(name).await.map_err(|e| map_error("namespace", name, e))?;
        merge_meta(&mut live.metadata, &ns.meta);
        let updated = api
            .replace(name, &PostParams::default(), &live)
            .await
            .map_err(|e| map_error("namespace", name, e))?;
        Ok(NamespaceRecord {
            meta: from_k8s_meta(&updated.metadata),
        })
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.namespaces()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_error("namespace", name, e))?;
        Ok(())
    }

    async fn wait_namespace_deleted(&self, name: &str) -> Result<(), ClusterError> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let mut stream = watcher(self.namespaces(), config).boxed();
        let mut seen = false;
        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ClusterError::Api(format!("watching namespace {}: {}", name, e)))?
        {
            match event {
                watcher::Event::Delete(_) => return Ok(()),
                watcher::Event::Apply(_) | watcher::Event::InitApply(_) => seen = true,
                watcher::Event::InitDone if !seen => return Ok(()),
                _ => {}
            }
        }
        debug!(namespace = %name, "Namespace watch ended");
        Err(ClusterError::Api(format!("watch for namespace {} ended", name)))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, ClusterError> {
        let secret = self
            .secrets(namespace)
            .get(name)
            .await
            .map_err(|e| map_error("secret", name, e))?;
        Ok(secret_record(&secret))
    }

    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError> {
        let namespace = namespace_of(&secret.meta)?;
        let created = self
            .secrets(namespace)
            .create(&PostParams::default(), &to_secret(secret))
            .await
            .map_err(|e| map_error("secret", &secret.meta.name, e))?;
        Ok(secret_record(&created))
    }

    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError> {
        let namespace = namespace_of(&secret.meta)?;
        let name = &secret.meta.name;
        let updated = self
            .secrets(namespace)
            .replace(name, &PostParams::default(), &to_secret(secret))
            .await
            .map_err(|e| map_error("secret", name, e))?;
        Ok(secret_record(&updated))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error("secret", name, e))?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError> {
        let service = self
            .services(namespace)
            .get(name)
            .await
            .map_err(|e| map_error("service", name, e))?;
        Ok(service_record(&service))
    }

    async fn create_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError> {
        let namespace = namespace_of(&service.meta)?;
        let object = Service {
            metadata: to_k8s_meta(&service.meta),
            spec: Some(K8sServiceSpec {
                type_: Some(service.spec.service_type.clone()),
                selector: non_empty(&service.spec.selector),
                ports: Some(service_ports(&service.spec, None)),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .services(namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error("service", &service.meta.name, e))?;
        Ok(service_record(&created))
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError> {
        let namespace = namespace_of(&service.meta)?;
        let name = &service.meta.name;
        let api = self.services(namespace);
        let mut live = api.get(name).await.map_err(|e| map_error("service", name, e))?;
        merge_meta(&mut live.metadata, &service.meta);
        let mut spec = live.spec.take().unwrap_or_default();
        spec.ports = Some(service_ports(&service.spec, Some(&spec)));
        spec.type_ = Some(service.spec.service_type.clone());
        spec.selector = non_empty(&service.spec.selector);
        live.spec = Some(spec);
        let updated = api
            .replace(name, &PostParams::default(), &live)
            .await
            .map_err(|e| map_error("service", name, e))?;
        Ok(service_record(&updated))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error("service", name, e))?;
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<WorkloadRecord, ClusterError> {
        let ds = self
            .daemon_sets(namespace)
            .get(name)
            .await
            .map_err(|e| map_error("workload", name, e))?;
        Ok(workload_record(&ds))
    }

    async fn create_workload(&self, workload: &WorkloadRecord) -> Result<WorkloadRecord, ClusterError> {
        let namespace = namespace_of(&workload.meta)?;
        let created = self
            .daemon_sets(namespace)
            .create(&PostParams::default(), &to_daemon_set(workload))
            .await
            .map_err(|e| map_error("workload", &workload.meta.name, e))?;
        Ok(workload_record(&created))
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.daemon_sets(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_error("workload", name, e))?;
        Ok(())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<EndpointsRecord, ClusterError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let endpoints = api.get(name).await.map_err(|e| map_error("endpoints", name, e))?;
        Ok(endpoints_record(&endpoints))
    }
}
