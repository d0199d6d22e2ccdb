// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Content Store
//!
//! Filesystem-backed implementation of [`ContentStore`] and [`ImageStore`]
//! used by the agent. Each namespace lives in its own directory:
//!
//! ```text
//! <root>/<namespace>/blobs/sha256/<hex>    committed blob bytes
//! <root>/<namespace>/info/<hex>.json       blob metadata and labels
//! <root>/<namespace>/ingest/<ref>.<id>     in-flight ingestion
//! <root>/<namespace>/images.json           image records
//! ```
//!
//! A blob counts as committed once its info file exists; the bytes are
//! renamed into place first.
//!
//! **Limitations:**
//! - In-flight statuses are tracked per process
//! - No garbage collection of unreferenced blobs

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::content::{
    BlobReader, ContentError, ContentInfo, ContentStatus, ContentStore, ImageFilter,
    ImageRecord, ImageStore, IngestRequest,
};
use crate::domain::events::{EventEnvelope, EventPublisher, ImageEvent};

const CHUNK_SIZE: usize = 64 * 1024;

/// Blob storage for one namespace on the local filesystem.
pub struct LocalContentStore {
    /// `<root>/<namespace>`
    base_path: PathBuf,
    statuses: RwLock<HashMap<String, ContentStatus>>,
}

impl LocalContentStore {
    /// Open (creating if needed) the namespace directory under `root`.
    pub fn open(root: impl AsRef<Path>, namespace: &str) -> Result<Self, ContentError> {
        let base_path = root.as_ref().join(namespace);
        for dir in ["blobs/sha256", "info", "ingest"] {
            let path = base_path.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                ContentError::Io(format!("Failed to create {}: {}", path.display(), e))
            })?;
        }
        Ok(Self {
            base_path,
            statuses: RwLock::new(HashMap::new()),
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, ContentError> {
        Ok(self.base_path.join("blobs/sha256").join(digest_hex(digest)?))
    }

    fn info_path(&self, digest: &str) -> Result<PathBuf, ContentError> {
        Ok(self
            .base_path
            .join("info")
            .join(format!("{}.json", digest_hex(digest)?)))
    }

    /// Every ingest writes its own file so overlapping writers of one
    /// digest never share bytes.
    fn ingest_path(&self, reference: &str) -> PathBuf {
        let safe: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.base_path
            .join("ingest")
            .join(format!("{}.{}", safe, Uuid::new_v4().simple()))
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

    /// Stream `reader` into `path`, returning the written size and digest.
    async fn write_ingest(
        &self,
        request: &IngestRequest,
        path: &Path,
        reader: &mut BlobReader,
        total: i64,
    ) -> Result<(i64, String), ContentError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| {
                ContentError::Io(format!("Failed to create ingest {}: {}", path.display(), e))
            })?;
        let mut hasher = Sha256::new();
        let mut written: i64 = 0;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            file.write_all(&chunk[..n]).await?;
            written += n as i64;
            self.set_status(&request.reference, written, total);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((written, format!("sha256:{}", hex::encode(hasher.finalize()))))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn info(&self, digest: &str) -> Result<ContentInfo, ContentError> {
        let path = self.info_path(digest)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(digest.to_string()))
            }
            Err(e) => {
                return Err(ContentError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&raw).map_err(|e| {
            ContentError::Io(format!("Corrupt content info {}: {}", path.display(), e))
        })
    }

    async fn reader(&self, digest: &str) -> Result<BlobReader, ContentError> {
        // Presence of info marks the commit point.
        self.info(digest).await?;
        let path = self.blob_path(digest)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ContentError::NotFound(digest.to_string()),
            _ => ContentError::Io(format!("Failed to open {}: {}", path.display(), e)),
        })?;
        Ok(Box::pin(file))
    }

    async fn ingest(
        &self,
        request: IngestRequest,
        mut reader: BlobReader,
    ) -> Result<ContentInfo, ContentError> {
        let info_path = self.info_path(&request.digest)?;
        let blob_path = self.blob_path(&request.digest)?;
        if tokio::fs::try_exists(&info_path).await? {
            return Err(ContentError::AlreadyExists(request.digest));
        }

        let total = request.expected.as_ref().map(|d| d.size).unwrap_or(0);
        self.set_status(&request.reference, 0, total);
        let ingest_path = self.ingest_path(&request.reference);

        let written = self
            .write_ingest(&request, &ingest_path, &mut reader, total)
            .await;
        self.statuses.write().remove(&request.reference);

        let verified = written.and_then(|(size, actual)| {
            if let Some(expected) = &request.expected {
                if expected.size != size {
                    return Err(ContentError::SizeMismatch {
                        digest: request.digest.clone(),
                        expected: expected.size,
                        actual: size,
                    });
                }
            }
            if actual != request.digest {
                return Err(ContentError::DigestMismatch {
                    expected: request.digest.clone(),
                    actual,
                });
            }
            Ok(size)
        });
        let size = match verified {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&ingest_path).await {
                    debug!(path = %ingest_path.display(), error = %cleanup, "Ingest cleanup skipped");
                }
                return Err(e);
            }
        };

        if tokio::fs::try_exists(&info_path).await? {
            let _ = tokio::fs::remove_file(&ingest_path).await;
            return Err(ContentError::AlreadyExists(request.digest));
        }
        tokio::fs::rename(&ingest_path, &blob_path).await.map_err(|e| {
            ContentError::Io(format!("Failed to commit {}: {}", request.digest, e))
        })?;

        let now = Utc::now();
        let info = ContentInfo {
            digest: request.digest.clone(),
            size,
            labels: request.labels,
            created_at: now,
            updated_at: now,
        };
        write_json_atomic(&info_path, &info).await?;
        debug!(digest = %info.digest, size, "Committed blob");
        Ok(info)
    }

    async fn list_statuses(&self) -> Result<Vec<ContentStatus>, ContentError> {
        let mut statuses: Vec<_> = self.statuses.read().values().cloned().collect();
        statuses.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(statuses)
    }

    async fn delete(&self, digest: &str) -> Result<(), ContentError> {
        let info_path = self.info_path(digest)?;
        match tokio::fs::remove_file(&info_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(digest.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_file(self.blob_path(digest)?).await {
            warn!(digest = %digest, error = %e, "Blob bytes missing on delete");
        }
        Ok(())
    }
}

/// Image records for one namespace, persisted as a single JSON document.
pub struct LocalImageStore {
    namespace: String,
    path: PathBuf,
    images: Mutex<BTreeMap<String, ImageRecord>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl LocalImageStore {
    pub fn open(
        root: impl AsRef<Path>,
        namespace: &str,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self, ContentError> {
        let dir = root.as_ref().join(namespace);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ContentError::Io(format!("Failed to create {}: {}", dir.display(), e)))?;
        let path = dir.join("images.json");
        let images = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                ContentError::Io(format!("Corrupt image index {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ContentError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            namespace: namespace.to_string(),
            path,
            images: Mutex::new(images),
            publisher,
        })
    }

    fn publish(&self, event: ImageEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(EventEnvelope::new(self.namespace.clone(), event));
        }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn get(&self, name: &str) -> Result<ImageRecord, ContentError> {
        self.images
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(name.to_string()))
    }

    async fn list(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, ContentError> {
        Ok(self
            .images
            .lock()
            .await
            .values()
            .filter(|image| filter.matches(image))
            .cloned()
            .collect())
    }

    async fn create(&self, image: ImageRecord) -> Result<ImageRecord, ContentError> {
        {
            let mut images = self.images.lock().await;
            if images.contains_key(&image.name) {
                return Err(ContentError::AlreadyExists(image.name));
            }
            images.insert(image.name.clone(), image.clone());
            write_json_atomic(&self.path, &*images).await?;
        }
        self.publish(ImageEvent::ImageCreated {
            name: image.name.clone(),
            created_at: image.created_at,
        });
        Ok(image)
    }

    async fn update(&self, mut image: ImageRecord) -> Result<ImageRecord, ContentError> {
        {
            let mut images = self.images.lock().await;
            let created_at = images
                .get(&image.name)
                .map(|existing| existing.created_at)
                .ok_or_else(|| ContentError::NotFound(image.name.clone()))?;
            image.created_at = created_at;
            image.updated_at = Utc::now();
            images.insert(image.name.clone(), image.clone());
            write_json_atomic(&self.path, &*images).await?;
        }
        self.publish(ImageEvent::ImageUpdated {
            name: image.name.clone(),
            updated_at: image.updated_at,
        });
        Ok(image)
    }

    async fn delete(&self, name: &str) -> Result<(), ContentError> {
        {
            let mut images = self.images.lock().await;
            if images.remove(name).is_none() {
                return Err(ContentError::NotFound(name.to_string()));
            }
            write_json_atomic(&self.path, &*images).await?;
        }
        self.publish(ImageEvent::ImageDeleted {
            name: name.to_string(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }
}

fn digest_hex(digest: &str) -> Result<&str, ContentError> {
    let hex_part = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| ContentError::NotFound(digest.to_string()))?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ContentError::NotFound(digest.to_string()));
    }
    Ok(hex_part)
}

async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), ContentError> {
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| ContentError::Io(format!("Failed to encode {}: {}", path.display(), e)))?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{sha256_digest, Descriptor, MEDIA_TYPE_OCI_CONFIG};
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn reader(data: &'static [u8]) -> BlobReader {
        Box::pin(Cursor::new(data))
    }

    /// Feeds `data` through a pipe in small chunks with a pause between each.
    fn slow_reader(data: Vec<u8>, pause: Duration) -> BlobReader {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            for chunk in data.chunks(4096) {
                if tx.write_all(chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(pause).await;
            }
        });
        Box::pin(rx)
    }

    #[tokio::test]
    async fn test_ingest_commit_and_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalContentStore::open(temp_dir.path(), "k8s.io").unwrap();
        let digest = sha256_digest(b"{}");
        let desc = Descriptor::new(MEDIA_TYPE_OCI_CONFIG, digest.clone(), 2);

        let info = store
            .ingest(
                IngestRequest::new(desc.ref_key(), digest.clone()).with_descriptor(desc),
                reader(b"{}"),
            )
            .await
            .unwrap();
        assert_eq!(info.size, 2);

        let hex = digest.trim_start_matches("sha256:");
        assert!(temp_dir.path().join("k8s.io/blobs/sha256").join(hex).exists());
        assert!(temp_dir.path().join("k8s.io/info").join(format!("{}.json", hex)).exists());
        assert_eq!(&store.read_all(&digest).await.unwrap()[..], b"{}");

        let again = store
            .ingest(IngestRequest::new("config", digest.clone()), reader(b"{}"))
            .await;
        assert!(matches!(again, Err(ContentError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_overlapping_ingests_of_one_digest_commit_intact_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalContentStore::open(temp_dir.path(), "k8s.io").unwrap());
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let digest = sha256_digest(&data);
        let desc = Descriptor::new(MEDIA_TYPE_OCI_CONFIG, digest.clone(), data.len() as i64);

        let first = {
            let store = store.clone();
            let request = IngestRequest::new(desc.ref_key(), digest.clone()).with_descriptor(desc.clone());
            let body = slow_reader(data.clone(), Duration::from_millis(1));
            tokio::spawn(async move { store.ingest(request, body).await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;
        let second = {
            let store = store.clone();
            let request = IngestRequest::new(desc.ref_key(), digest.clone()).with_descriptor(desc.clone());
            let body = slow_reader(data.clone(), Duration::from_millis(2));
            tokio::spawn(async move { store.ingest(request, body).await })
        };

        let first = first.await.unwrap();
        assert!(first.is_ok(), "first ingest failed: {:?}", first.err());
        assert_eq!(sha256_digest(&store.read_all(&digest).await.unwrap()), digest);

        match second.await.unwrap() {
            Ok(_) | Err(ContentError::AlreadyExists(_)) => {}
            Err(e) => panic!("second ingest failed: {}", e),
        }
        assert_eq!(&store.read_all(&digest).await.unwrap()[..], &data[..]);
        let leftovers = std::fs::read_dir(temp_dir.path().join("k8s.io/ingest")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_nothing_committed() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalContentStore::open(temp_dir.path(), "buildkit").unwrap();
        let digest = sha256_digest(b"expected");

        let result = store
            .ingest(IngestRequest::new("layer-x", digest.clone()), reader(b"other"))
            .await;
        assert!(matches!(result, Err(ContentError::DigestMismatch { .. })));
        assert!(store.info(&digest).await.unwrap_err().is_not_found());
        assert!(store.list_statuses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let target = Descriptor::new(MEDIA_TYPE_OCI_CONFIG, sha256_digest(b"m"), 1);
        {
            let images = LocalImageStore::open(temp_dir.path(), "k8s.io", None).unwrap();
            images.create(ImageRecord::new("app:v1", target.clone())).await.unwrap();
            images.create(ImageRecord::new("app:v2", target.clone())).await.unwrap();
            images.delete("app:v2").await.unwrap();
        }
        let images = LocalImageStore::open(temp_dir.path(), "k8s.io", None).unwrap();
        let all = images.list(&ImageFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].target, target);
        assert!(images.update(ImageRecord::new("missing", target)).await.unwrap_err().is_not_found());
    }
}
