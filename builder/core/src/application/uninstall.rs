// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builder Uninstall Application Service
//!
//! Two independent, idempotent actions: delete the managed namespace and
//! wait until the deletion is observed, and strip the builder role from
//! every node carrying it.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::retry::{retry_on_conflict, ConflictRetry};
use crate::domain::builder::{BUILDER_ROLE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::domain::cluster::{ClusterError, ClusterStore, LabelSelector};

/// Interval of the `NotFound` poll that backs up the deletion watch.
pub const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum UninstallError {
    #[error("namespace `{0}` not managed by kiln")]
    NotManaged(String),

    #[error("cancelled waiting for namespace `{0}` to be deleted")]
    Cancelled(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub namespace_deleted: bool,
    pub nodes_cleared: Vec<String>,
    pub nodes_failed: Vec<String>,
}

pub struct Uninstaller {
    store: Arc<dyn ClusterStore>,
    retry: ConflictRetry,
    poll_interval: Duration,
}

impl Uninstaller {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            retry: ConflictRetry::default(),
            poll_interval: NAMESPACE_POLL_INTERVAL,
        }
    }

    pub async fn uninstall(
        &self,
        namespace: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<UninstallOutcome, UninstallError> {
        let namespace_deleted = self.namespace(namespace, force, cancel).await?;
        let (nodes_cleared, nodes_failed) = self.node_role().await?;
        Ok(UninstallOutcome {
            namespace_deleted,
            nodes_cleared,
            nodes_failed,
        })
    }

    /// Delete `namespace` with foreground propagation and block until it is
    /// gone. Returns `false` when there was nothing to delete.
    pub async fn namespace(
        &self,
        namespace: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, UninstallError> {
        let record = match self.store.get_namespace(namespace).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, "Namespace already absent");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let managed = record.meta.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE);
        if !force && !managed {
            return Err(UninstallError::NotManaged(namespace.to_string()));
        }

        info!(namespace = %namespace, "Deleting namespace");
        match self.store.delete_namespace(namespace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let store = &self.store;
        let watch = async {
            if let Err(e) = store.wait_namespace_deleted(namespace).await {
                warn!(namespace = %namespace, error = %e, "Namespace watch failed, polling instead");
                std::future::pending::<()>().await;
            }
        };
        let poll = async {
            loop {
                tokio::time::sleep(self.poll_interval).await;
                match store.get_namespace(namespace).await {
                    Err(e) if e.is_not_found() => return,
                    Err(e) => debug!(namespace = %namespace, error = %e, "Namespace poll failed"),
                    Ok(_) => debug!(namespace = %namespace, "Namespace still terminating"),
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(UninstallError::Cancelled(namespace.to_string())),
            _ = watch => Ok(true),
            _ = poll => Ok(true),
        }
    }

    /// Remove the builder role label from every node that has it. Failures
    /// are per node and never abort the batch.
    pub async fn node_role(&self) -> Result<(Vec<String>, Vec<String>), UninstallError> {
        let nodes = self
            .store
            .list_nodes(&LabelSelector::exists(BUILDER_ROLE_LABEL))
            .await?;
        let mut cleared = Vec::new();
        let mut failed = Vec::new();
        for node in nodes {
            let store = &self.store;
            let name = node.meta.name.as_str();
            let result = retry_on_conflict(self.retry, move || async move {
                let mut node = store.get_node(name).await?;
                if node.meta.labels.remove(BUILDER_ROLE_LABEL).is_none() {
                    return Ok(());
                }
                store.update_node(&node).await.map(|_| ())
            })
            .await;
            match result {
                Ok(()) => {
                    info!(node = %name, "Removed builder role");
                    cleared.push(name.to_string());
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to remove builder label");
                    failed.push(name.to_string());
                }
            }
        }
        Ok((cleared, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{NamespaceRecord, NodeRecord, ObjectMeta};
    use crate::infrastructure::cluster::MemoryClusterStore;

    fn role_node(name: &str) -> NodeRecord {
        NodeRecord {
            meta: ObjectMeta::named(name).with_label(BUILDER_ROLE_LABEL, "true"),
            container_runtime_version: "containerd://1.6.8".into(),
            addresses: Vec::new(),
        }
    }

    async fn managed_namespace(store: &MemoryClusterStore, name: &str) {
        store
            .create_namespace(&NamespaceRecord {
                meta: ObjectMeta::named(name).with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refuses_unmanaged_namespace() {
        let store = MemoryClusterStore::new();
        store
            .create_namespace(&NamespaceRecord {
                meta: ObjectMeta::named("kube-image"),
            })
            .await
            .unwrap();
        let uninstaller = Uninstaller::new(Arc::new(store.clone()));

        let err = uninstaller
            .namespace("kube-image", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UninstallError::NotManaged(_)));

        assert!(uninstaller
            .namespace("kube-image", true, &CancellationToken::new())
            .await
            .unwrap());
        assert!(store.get_namespace("kube-image").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_delayed_deletion() {
        let store = MemoryClusterStore::new().with_deletion_delay(Duration::from_secs(12));
        managed_namespace(&store, "kube-image").await;
        let uninstaller = Uninstaller::new(Arc::new(store.clone()));

        let started = tokio::time::Instant::now();
        let deleted = uninstaller
            .namespace("kube-image", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(deleted);
        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(store.get_namespace("kube-image").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let store = MemoryClusterStore::new().with_deletion_delay(Duration::from_secs(600));
        managed_namespace(&store, "kube-image").await;
        let uninstaller = Uninstaller::new(Arc::new(store));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let err = uninstaller
            .namespace("kube-image", false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UninstallError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_node_role_is_best_effort() {
        let store = MemoryClusterStore::new();
        store.add_node(role_node("a"));
        store.add_node(role_node("b"));
        store.inject_conflicts("node", "b", 10);

        let outcome = Uninstaller::new(Arc::new(store.clone()))
            .uninstall("kube-image", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.namespace_deleted);
        assert_eq!(outcome.nodes_cleared, vec!["a".to_string()]);
        assert_eq!(outcome.nodes_failed, vec!["b".to_string()]);

        let a = store.get_node("a").await.unwrap();
        assert!(!a.meta.labels.contains_key(BUILDER_ROLE_LABEL));
    }
}
