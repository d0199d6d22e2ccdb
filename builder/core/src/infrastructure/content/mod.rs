// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content Store Infrastructure Module
//!
//! Concrete [`ContentStore`](crate::domain::content::ContentStore) and
//! [`ImageStore`](crate::domain::content::ImageStore) implementations. The
//! containerd-backed pair lives in [`crate::infrastructure::containerd`].

pub mod local;
pub mod memory;

pub use local::{LocalContentStore, LocalImageStore};
pub use memory::{MemoryContentStore, MemoryImageStore};

use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Channel;

use crate::domain::content::{ContentError, ContentNamespace};
use crate::domain::events::EventPublisher;
use crate::infrastructure::containerd::{ContainerdContentStore, ContainerdImageStore};

/// Content store backend configuration
#[derive(Debug, Clone)]
pub enum ContentBackend {
    /// The node's containerd daemon (agent default)
    Containerd { channel: Channel },

    /// Filesystem store rooted at `root` (agent)
    Local { root: PathBuf },

    /// Process-local store (tests and dry runs)
    Memory,
}

/// Open namespace `name` on `backend`; image changes are announced through
/// `publisher`. containerd announces its own, so the publisher goes unused
/// there.
pub fn open_namespace(
    backend: &ContentBackend,
    name: &str,
    publisher: Option<Arc<dyn EventPublisher>>,
) -> Result<ContentNamespace, ContentError> {
    match backend {
        ContentBackend::Containerd { channel } => Ok(ContentNamespace::new(
            name,
            Arc::new(ContainerdContentStore::new(channel.clone(), name)),
            Arc::new(ContainerdImageStore::new(channel.clone(), name)),
        )),
        ContentBackend::Local { root } => Ok(ContentNamespace::new(
            name,
            Arc::new(LocalContentStore::open(root, name)?),
            Arc::new(LocalImageStore::open(root, name, publisher)?),
        )),
        ContentBackend::Memory => Ok(ContentNamespace::new(
            name,
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryImageStore::new(name, publisher)),
        )),
    }
}
