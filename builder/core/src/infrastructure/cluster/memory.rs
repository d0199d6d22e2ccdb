// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory cluster store.
//!
//! Behaves like the API server for the handful of calls the reconciler
//! makes: resource versions are bumped on every write, stale updates
//! conflict, and namespace deletion cascades to namespaced objects.
//! Every mutating call is recorded so tests can assert on churn.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::cluster::{
    ClusterError, ClusterStore, EndpointsRecord, LabelSelector, NamespaceRecord, NodeRecord,
    ObjectMeta, SecretRecord, ServiceRecord, WorkloadRecord, WorkloadStatus,
};

type Key = (String, String);

trait Stored: Clone {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_stored {
    ($($ty:ty),*) => {
        $(impl Stored for $ty {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        })*
    };
}

impl_stored!(NodeRecord, NamespaceRecord, SecretRecord, ServiceRecord, WorkloadRecord, EndpointsRecord);

#[derive(Default)]
struct State {
    version: u64,
    nodes: BTreeMap<Key, NodeRecord>,
    namespaces: BTreeMap<Key, NamespaceRecord>,
    secrets: BTreeMap<Key, SecretRecord>,
    services: BTreeMap<Key, ServiceRecord>,
    workloads: BTreeMap<Key, WorkloadRecord>,
    endpoints: BTreeMap<Key, EndpointsRecord>,
    calls: Vec<String>,
    /// `kind/name` -> conflicts still to return
    conflicts: HashMap<String, usize>,
    /// Workload reads before status flips to ready; `None` never flips
    ready_after_reads: Option<usize>,
    workload_reads: HashMap<Key, usize>,
}

type Pick<T> = fn(&mut State) -> &mut BTreeMap<Key, T>;

impl State {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.version += 1;
        meta.resource_version = Some(self.version.to_string());
    }

    fn record(&mut self, verb: &str, kind: &str, key: &Key) {
        self.calls.push(format!("{} {} {}", verb, kind, display_key(key)));
    }

    fn take_conflict(&mut self, kind: &str, name: &str) -> bool {
        match self.conflicts.get_mut(&format!("{}/{}", kind, name)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn get<T: Stored>(&mut self, pick: Pick<T>, kind: &'static str, key: Key) -> Result<T, ClusterError> {
        pick(self)
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(kind, display_key(&key)))
    }

    fn create<T: Stored>(&mut self, pick: Pick<T>, kind: &'static str, record: &T) -> Result<T, ClusterError> {
        let mut record = record.clone();
        let key = key_of(record.meta());
        if !key.0.is_empty() && !self.namespaces.contains_key(&(String::new(), key.0.clone())) {
            return Err(ClusterError::not_found("namespace", key.0));
        }
        if pick(self).contains_key(&key) {
            return Err(ClusterError::already_exists(kind, display_key(&key)));
        }
        self.stamp(record.meta_mut());
        self.record("create", kind, &key);
        pick(self).insert(key, record.clone());
        Ok(record)
    }

    fn update<T: Stored>(&mut self, pick: Pick<T>, kind: &'static str, record: &T) -> Result<T, ClusterError> {
        let mut record = record.clone();
        let key = key_of(record.meta());
        let stored_version = pick(self)
            .get(&key)
            .ok_or_else(|| ClusterError::not_found(kind, display_key(&key)))?
            .meta()
            .resource_version
            .clone();
        if let Some(incoming) = &record.meta().resource_version {
            if Some(incoming) != stored_version.as_ref() {
                return Err(ClusterError::conflict(kind, display_key(&key)));
            }
        }
        if self.take_conflict(kind, &key.1) {
            return Err(ClusterError::conflict(kind, display_key(&key)));
        }
        self.stamp(record.meta_mut());
        self.record("update", kind, &key);
        pick(self).insert(key, record.clone());
        Ok(record)
    }

    fn delete<T: Stored>(&mut self, pick: Pick<T>, kind: &'static str, key: Key) -> Result<(), ClusterError> {
        if pick(self).remove(&key).is_none() {
            return Err(ClusterError::not_found(kind, display_key(&key)));
        }
        self.record("delete", kind, &key);
        Ok(())
    }

    fn remove_namespace(&mut self, name: &str) {
        self.namespaces.remove(&(String::new(), name.to_string()));
        self.secrets.retain(|(ns, _), _| ns != name);
        self.services.retain(|(ns, _), _| ns != name);
        self.workloads.retain(|(ns, _), _| ns != name);
        self.endpoints.retain(|(ns, _), _| ns != name);
    }

    fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(&(String::new(), name.to_string()))
    }
}

fn key_of(meta: &ObjectMeta) -> Key {
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone())
}

fn cluster_key(name: &str) -> Key {
    (String::new(), name.to_string())
}

fn ns_key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn display_key(key: &Key) -> String {
    if key.0.is_empty() {
        key.1.clone()
    } else {
        format!("{}/{}", key.0, key.1)
    }
}

#[derive(Clone)]
pub struct MemoryClusterStore {
    state: Arc<Mutex<State>>,
    deletions: broadcast::Sender<String>,
    deletion_delay: Option<Duration>,
}

impl Default for MemoryClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        let (deletions, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            deletions,
            deletion_delay: None,
        }
    }

    /// Namespace deletion completes `delay` after the request is accepted.
    pub fn with_deletion_delay(mut self, delay: Duration) -> Self {
        self.deletion_delay = Some(delay);
        self
    }

    /// Workloads report one ready replica from their `reads`-th status read.
    pub fn with_workload_ready_after(self, reads: usize) -> Self {
        self.state.lock().ready_after_reads = Some(reads);
        self
    }

    pub fn add_node(&self, mut node: NodeRecord) {
        let mut state = self.state.lock();
        state.stamp(&mut node.meta);
        state.nodes.insert(key_of(&node.meta), node);
    }

    pub fn add_endpoints(&self, mut endpoints: EndpointsRecord) {
        let mut state = self.state.lock();
        state.stamp(&mut endpoints.meta);
        state.endpoints.insert(key_of(&endpoints.meta), endpoints);
    }

    pub fn set_workload_status(&self, namespace: &str, name: &str, status: WorkloadStatus) {
        if let Some(workload) = self.state.lock().workloads.get_mut(&ns_key(namespace, name)) {
            workload.status = status;
        }
    }

    /// Make the next `count` updates of `kind/name` fail with a conflict.
    pub fn inject_conflicts(&self, kind: &str, name: &str, count: usize) {
        self.state
            .lock()
            .conflicts
            .insert(format!("{}/{}", kind, name), count);
    }

    /// Mutating calls in order, e.g. `create secret kube-image/kiln-tls-ca`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<NodeRecord>, ClusterError> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| selector.matches(&n.meta.labels))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<NodeRecord, ClusterError> {
        self.state.lock().get(|s| &mut s.nodes, "node", cluster_key(name))
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<NodeRecord, ClusterError> {
        self.state.lock().update(|s| &mut s.nodes, "node", node)
    }

    async fn get_namespace(&self, name: &str) -> Result<NamespaceRecord, ClusterError> {
        self.state
            .lock()
            .get(|s| &mut s.namespaces, "namespace", cluster_key(name))
    }

    async fn create_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError> {
        self.state.lock().create(|s| &mut s.namespaces, "namespace", ns)
    }

    async fn update_namespace(&self, ns: &NamespaceRecord) -> Result<NamespaceRecord, ClusterError> {
        self.state.lock().update(|s| &mut s.namespaces, "namespace", ns)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        {
            let mut state = self.state.lock();
            if !state.has_namespace(name) {
                return Err(ClusterError::not_found("namespace", name));
            }
            state.record("delete", "namespace", &cluster_key(name));
            if self.deletion_delay.is_none() {
                state.remove_namespace(name);
            }
        }
        match self.deletion_delay {
            None => {
                let _ = self.deletions.send(name.to_string());
            }
            Some(delay) => {
                let state = self.state.clone();
                let deletions = self.deletions.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.lock().remove_namespace(&name);
                    let _ = deletions.send(name);
                });
            }
        }
        Ok(())
    }

    async fn wait_namespace_deleted(&self, name: &str) -> Result<(), ClusterError> {
        let mut deletions = self.deletions.subscribe();
        if !self.state.lock().has_namespace(name) {
            return Ok(());
        }
        loop {
            match deletions.recv().await {
                Ok(deleted) if deleted == name => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !self.state.lock().has_namespace(name) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClusterError::Api("namespace watch closed".into()))
                }
            }
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, ClusterError> {
        self.state
            .lock()
            .get(|s| &mut s.secrets, "secret", ns_key(namespace, name))
    }

    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError> {
        self.state.lock().create(|s| &mut s.secrets, "secret", secret)
    }

    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord, ClusterError> {
        self.state.lock().update(|s| &mut s.secrets, "secret", secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.state
            .lock()
            .delete(|s| &mut s.secrets, "secret", ns_key(namespace, name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError> {
        self.state
            .lock()
            .get(|s| &mut s.services, "service", ns_key(namespace, name))
    }

    async fn create_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError> {
        self.state.lock().create(|s| &mut s.services, "service", service)
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord, ClusterError> {
        self.state.lock().update(|s| &mut s.services, "service", service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.state
            .lock()
            .delete(|s| &mut s.services, "service", ns_key(namespace, name))
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<WorkloadRecord, ClusterError> {
        let key = ns_key(namespace, name);
        let mut state = self.state.lock();
        let threshold = state.ready_after_reads;
        let reads = {
            let counter = state.workload_reads.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let workload = state
            .workloads
            .get_mut(&key)
            .ok_or_else(|| ClusterError::not_found("workload", display_key(&key)))?;
        if matches!(threshold, Some(t) if reads >= t) && workload.status.number_ready == 0 {
            workload.status = WorkloadStatus {
                desired_number_scheduled: 1,
                number_ready: 1,
                number_available: 1,
            };
        }
        Ok(workload.clone())
    }

    async fn create_workload(&self, workload: &WorkloadRecord) -> Result<WorkloadRecord, ClusterError> {
        let mut state = self.state.lock();
        let created = state.create(|s| &mut s.workloads, "workload", workload)?;
        state.workload_reads.remove(&key_of(&created.meta));
        Ok(created)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.state
            .lock()
            .delete(|s| &mut s.workloads, "workload", ns_key(namespace, name))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<EndpointsRecord, ClusterError> {
        self.state
            .lock()
            .get(|s| &mut s.endpoints, "endpoints", ns_key(namespace, name))
    }
}
