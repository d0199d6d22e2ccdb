// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory content and image stores.
//!
//! Used by tests and dry runs. Both stores are safe to share between tasks;
//! the content store counts committed writes so callers can assert that a
//! repeated copy did not rewrite anything.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::domain::content::{
    BlobReader, ContentError, ContentInfo, ContentStatus, ContentStore, ImageFilter,
    ImageRecord, ImageStore, IngestRequest,
};
use crate::domain::events::{EventEnvelope, EventPublisher, ImageEvent};

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<String, (Bytes, ContentInfo)>>,
    statuses: RwLock<HashMap<String, ContentStatus>>,
    writes: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs committed since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blobs.read().contains_key(digest)
    }

    fn set_status(&self, reference: &str, offset: i64, total: i64) {
        let now = Utc::now();
        let mut statuses = self.statuses.write();
        let entry = statuses
            .entry(reference.to_string())
            .or_insert_with(|| ContentStatus {
                reference: reference.to_string(),
                offset: 0,
                total,
                started_at: now,
                updated_at: now,
            });
        entry.offset = offset;
        entry.updated_at = now;
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn info(&self, digest: &str) -> Result<ContentInfo, ContentError> {
        self.blobs
            .read()
            .get(digest)
            .map(|(_, info)| info.clone())
            .ok_or_else(|| ContentError::NotFound(digest.to_string()))
    }

    async fn reader(&self, digest: &str) -> Result<BlobReader, ContentError> {
        let data = self
            .blobs
            .read()
            .get(digest)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| ContentError::NotFound(digest.to_string()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn ingest(
        &self,
        request: IngestRequest,
        mut reader: BlobReader,
    ) -> Result<ContentInfo, ContentError> {
        if self.contains(&request.digest) {
            return Err(ContentError::AlreadyExists(request.digest));
        }

        let total = request.expected.as_ref().map(|d| d.size).unwrap_or(0);
        self.set_status(&request.reference, 0, total);

        let result: Result<Vec<u8>, ContentError> = async {
            let mut hasher = Sha256::new();
            let mut data = Vec::with_capacity(total.max(0) as usize);
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&chunk[..n]);
                data.extend_from_slice(&chunk[..n]);
                self.set_status(&request.reference, data.len() as i64, total);
            }
            let actual_size = data.len() as i64;
            if let Some(expected) = &request.expected {
                if expected.size != actual_size {
                    return Err(ContentError::SizeMismatch {
                        digest: request.digest.clone(),
                        expected: expected.size,
                        actual: actual_size,
                    });
                }
            }
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != request.digest {
                return Err(ContentError::DigestMismatch {
                    expected: request.digest.clone(),
                    actual,
                });
            }
            Ok(data)
        }
        .await;
        self.statuses.write().remove(&request.reference);
        let data = result?;

        let now = Utc::now();
        let info = ContentInfo {
            digest: request.digest.clone(),
            size: data.len() as i64,
            labels: request.labels,
            created_at: now,
            updated_at: now,
        };
        {
            let mut blobs = self.blobs.write();
            if blobs.contains_key(&request.digest) {
                return Err(ContentError::AlreadyExists(request.digest));
            }
            blobs.insert(request.digest.clone(), (Bytes::from(data), info.clone()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(digest = %info.digest, size = info.size, "Committed blob");
        Ok(info)
    }

    async fn list_statuses(&self) -> Result<Vec<ContentStatus>, ContentError> {
        let mut statuses: Vec<_> = self.statuses.read().values().cloned().collect();
        statuses.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(statuses)
    }

    async fn delete(&self, digest: &str) -> Result<(), ContentError> {
        self.blobs
            .write()
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| ContentError::NotFound(digest.to_string()))
    }
}

/// Image records for one namespace, announcing every change on the feed.
pub struct MemoryImageStore {
    namespace: String,
    images: RwLock<BTreeMap<String, ImageRecord>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl MemoryImageStore {
    pub fn new(namespace: impl Into<String>, publisher: Option<Arc<dyn EventPublisher>>) -> Self {
        Self {
            namespace: namespace.into(),
            images: RwLock::new(BTreeMap::new()),
            publisher,
        }
    }

    fn publish(&self, event: ImageEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(EventEnvelope::new(self.namespace.clone(), event));
        }
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn get(&self, name: &str) -> Result<ImageRecord, ContentError> {
        self.images
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(name.to_string()))
    }

    async fn list(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, ContentError> {
        Ok(self
            .images
            .read()
            .values()
            .filter(|image| filter.matches(image))
            .cloned()
            .collect())
    }

    async fn create(&self, image: ImageRecord) -> Result<ImageRecord, ContentError> {
        {
            let mut images = self.images.write();
            if images.contains_key(&image.name) {
                return Err(ContentError::AlreadyExists(image.name));
            }
            images.insert(image.name.clone(), image.clone());
        }
        self.publish(ImageEvent::ImageCreated {
            name: image.name.clone(),
            created_at: image.created_at,
        });
        Ok(image)
    }

    async fn update(&self, mut image: ImageRecord) -> Result<ImageRecord, ContentError> {
        {
            let mut images = self.images.write();
            let existing = images
                .get(&image.name)
                .ok_or_else(|| ContentError::NotFound(image.name.clone()))?;
            image.created_at = existing.created_at;
            image.updated_at = Utc::now();
            images.insert(image.name.clone(), image.clone());
        }
        self.publish(ImageEvent::ImageUpdated {
            name: image.name.clone(),
            updated_at: image.updated_at,
        });
        Ok(image)
    }

    async fn delete(&self, name: &str) -> Result<(), ContentError> {
        if self.images.write().remove(name).is_none() {
            return Err(ContentError::NotFound(name.to_string()));
        }
        self.publish(ImageEvent::ImageDeleted {
            name: name.to_string(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }
}
