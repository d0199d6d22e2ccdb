// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end reconciliation against the in-memory cluster store.
//!
//! Covers a fresh install through readiness, a rerun that must not touch
//! any resource, node-role selection edge cases, and uninstall.

use kiln_core::application::install::{InstallStep, Installer, StepError};
use kiln_core::application::uninstall::Uninstaller;
use kiln_core::domain::builder::{
    BuilderDesiredState, BUILDER_NAME, BUILDER_ROLE_LABEL, CA_SECRET, CLIENT_SECRET, SERVER_SECRET,
};
use kiln_core::domain::certificate::CertificateIssuer;
use kiln_core::domain::cluster::{ClusterStore, NodeAddress, NodeAddressKind, NodeRecord, ObjectMeta};
use kiln_core::infrastructure::cluster::MemoryClusterStore;
use kiln_core::infrastructure::pki::{verify_issued_by, RcgenIssuer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn builder_node(name: &str, labels: &[(&str, &str)]) -> NodeRecord {
    let mut meta = ObjectMeta::named(name);
    for (k, v) in labels {
        meta.labels.insert(k.to_string(), v.to_string());
    }
    NodeRecord {
        meta,
        container_runtime_version: "containerd://1.4.3-k3s1".to_string(),
        addresses: vec![
            NodeAddress {
                kind: NodeAddressKind::Hostname,
                address: name.to_string(),
            },
            NodeAddress {
                kind: NodeAddressKind::InternalIp,
                address: "192.168.1.20".to_string(),
            },
        ],
    }
}

fn installer(store: &MemoryClusterStore) -> Installer {
    Installer::new(Arc::new(store.clone()), Arc::new(RcgenIssuer::new()))
}

fn desired() -> BuilderDesiredState {
    BuilderDesiredState {
        node_selector: "role=builder".to_string(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_install_fresh_cluster_blocks_until_ready() {
    let store = MemoryClusterStore::new().with_workload_ready_after(3);
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    store.add_node(builder_node("worker-2", &[]));

    let outcome = installer(&store)
        .install(&desired(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.node.as_deref(), Some("worker-1"));
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.status.unwrap().number_ready, 1);

    let calls = store.calls();
    assert_eq!(
        calls,
        vec![
            "update node worker-1",
            "create namespace kube-image",
            "create secret kube-image/kiln-tls-ca",
            "create secret kube-image/kiln-tls-server",
            "create secret kube-image/kiln-tls-client",
            "create service kube-image/builder",
            "create workload kube-image/builder",
        ]
    );

    let service = store.get_service("kube-image", BUILDER_NAME).await.unwrap();
    assert_eq!(service.spec.ports.len(), 2);
    let workload = store.get_workload("kube-image", BUILDER_NAME).await.unwrap();
    assert_eq!(workload.spec.containers.len(), 2);

    let untouched = store.get_node("worker-2").await.unwrap();
    assert!(!untouched.meta.labels.contains_key(BUILDER_ROLE_LABEL));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_without_force_makes_no_changes() {
    let store = MemoryClusterStore::new().with_workload_ready_after(1);
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    let installer = installer(&store);

    installer.install(&desired(), &CancellationToken::new()).await.unwrap();
    store.clear_calls();
    installer.install(&desired(), &CancellationToken::new()).await.unwrap();

    assert!(store.calls().is_empty(), "unexpected churn: {:?}", store.calls());
}

#[tokio::test]
async fn test_issued_leaves_chain_to_persisted_authority() {
    let store = MemoryClusterStore::new();
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    let wanted = BuilderDesiredState {
        no_wait: true,
        ..desired()
    };
    installer(&store)
        .install(&wanted, &CancellationToken::new())
        .await
        .unwrap();

    let pem = |secret: kiln_core::domain::cluster::SecretRecord| {
        String::from_utf8(secret.data["tls.crt"].clone()).unwrap()
    };
    let ca = pem(store.get_secret("kube-image", CA_SECRET).await.unwrap());
    let server = pem(store.get_secret("kube-image", SERVER_SECRET).await.unwrap());
    let client = pem(store.get_secret("kube-image", CLIENT_SECRET).await.unwrap());
    verify_issued_by(&server, &ca).unwrap();
    verify_issued_by(&client, &ca).unwrap();

    let key = String::from_utf8(
        store.get_secret("kube-image", SERVER_SECRET).await.unwrap().data["tls.key"].clone(),
    )
    .unwrap();
    let summary = RcgenIssuer::new()
        .inspect(&kiln_core::domain::certificate::KeyMaterial::new(server, key))
        .unwrap();
    assert!(summary.dns_names.contains(&"builder.kube-image.svc".to_string()));
    assert!(summary.dns_names.contains(&"worker-1".to_string()));
    assert_eq!(summary.ip_addresses[0].to_string(), "192.168.1.20");
}

#[tokio::test]
async fn test_node_role_selection() {
    // No match: fatal, nothing mutated.
    let store = MemoryClusterStore::new();
    store.add_node(builder_node("worker-1", &[]));
    let err = installer(&store)
        .install(&desired(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.step, InstallStep::NodeRole);
    assert!(matches!(err.source, StepError::NoMatchingNodes));
    assert!(store.calls().is_empty());

    // Two matches without a narrowing selector: fatal, with a suggestion.
    let store = MemoryClusterStore::new();
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    store.add_node(builder_node("worker-2", &[("role", "builder")]));
    let err = installer(&store)
        .install(&desired(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.source, StepError::AmbiguousSelector { .. }));
    assert!(err.to_string().contains("kubernetes.io/hostname="));
    assert!(store.calls().is_empty());

    // One match: exactly that node gains the role.
    let store = MemoryClusterStore::new();
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    store.add_node(builder_node("worker-2", &[]));
    let wanted = BuilderDesiredState {
        no_wait: true,
        ..desired()
    };
    installer(&store)
        .install(&wanted, &CancellationToken::new())
        .await
        .unwrap();
    let labelled: Vec<String> = store
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("update node"))
        .collect();
    assert_eq!(labelled, vec!["update node worker-1".to_string()]);
}

#[tokio::test]
async fn test_uninstall_reverses_install() {
    let store = MemoryClusterStore::new();
    store.add_node(builder_node("worker-1", &[("role", "builder")]));
    let wanted = BuilderDesiredState {
        no_wait: true,
        ..desired()
    };
    installer(&store)
        .install(&wanted, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = Uninstaller::new(Arc::new(store.clone()))
        .uninstall("kube-image", false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.namespace_deleted);
    assert_eq!(outcome.nodes_cleared, vec!["worker-1".to_string()]);
    assert!(store.get_namespace("kube-image").await.unwrap_err().is_not_found());
    let node = store.get_node("worker-1").await.unwrap();
    assert!(!node.meta.labels.contains_key(BUILDER_ROLE_LABEL));
}
