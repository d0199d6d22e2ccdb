// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster Store Infrastructure Module
//!
//! Concrete [`ClusterStore`](crate::domain::cluster::ClusterStore)
//! implementations: the Kubernetes API and an in-memory stand-in.

pub mod kube;
pub mod memory;

pub use self::kube::{KubeClusterStore, KubeConnection};
pub use self::memory::MemoryClusterStore;
