// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content Synchronization Engine
//!
//! Mirrors images from the build executor's namespace into the servable
//! namespace. The engine listens for image create/update events on the
//! source namespace. For each one it spawns a task that:
//!
//! 1. resolves the image record in the source namespace
//! 2. walks the descriptor graph parent-first, waiting for each blob to be
//!    fully committed in the source (executors may announce an image before
//!    its layers finish unpacking)
//! 3. streams every blob into the destination, absorbing `AlreadyExists`
//! 4. upserts the image record in the destination
//!
//! Each task runs under a fixed ceiling independent of any RPC caller.
//! Failures are logged and counted; they never reach a client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::agent_config::SyncConfig;
use crate::domain::content::{
    children, ContentError, ContentInfo, ContentNamespace, Descriptor, ImageRecord, IngestRequest,
};
use crate::domain::events::ImageEvent;
use crate::infrastructure::event_bus::{EventBus, EventBusError, FilteredEventReceiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Ceiling for one image, covering every blob wait and copy
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            wait_timeout: config.wait_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to resolve image `{name}`: {source}")]
    Image {
        name: String,
        #[source]
        source: ContentError,
    },

    #[error("failed to copy {digest}: {source}")]
    Content {
        digest: String,
        #[source]
        source: ContentError,
    },

    #[error("image `{name}` not available after {timeout:?}")]
    Deadline { name: String, timeout: Duration },

    #[error("event feed closed")]
    FeedClosed,
}

/// Blob counts for one synchronized image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub image: String,
    pub copied: usize,
    pub already_present: usize,
}

pub struct ContentSyncEngine {
    source: ContentNamespace,
    destination: ContentNamespace,
    settings: SyncSettings,
}

impl ContentSyncEngine {
    pub fn new(source: ContentNamespace, destination: ContentNamespace, settings: SyncSettings) -> Self {
        Self {
            source,
            destination,
            settings,
        }
    }

    /// Subscribe to the source namespace's image events and run until
    /// `cancel` fires or the feed closes.
    pub fn spawn(self: Arc<Self>, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<Result<(), SyncError>> {
        let events = bus.subscribe_filtered(self.source.name.clone(), "/images/");
        tokio::spawn(self.run(events, cancel))
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: FilteredEventReceiver,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        info!(
            source = %self.source.name,
            destination = %self.destination.name,
            "Content sync engine started"
        );
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Content sync engine stopping");
                    return Ok(());
                }
                received = events.recv() => received,
            };
            let envelope = match envelope {
                Ok(envelope) => envelope,
                Err(EventBusError::Lagged(n)) => {
                    warn!(skipped = n, "Content sync fell behind the event feed");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Content sync event feed ended");
                    return Err(SyncError::FeedClosed);
                }
            };

            metrics::counter!("kiln_sync_events_total", "kind" => envelope.event.kind()).increment(1);
            let name = match &envelope.event {
                ImageEvent::ImageCreated { name, .. } | ImageEvent::ImageUpdated { name, .. } => name.clone(),
                ImageEvent::ImageDeleted { .. } => continue,
            };
            debug!(image = %name, topic = %envelope.topic, "Image event");

            let engine = self.clone();
            let task_cancel = cancel.child_token();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    result = engine.sync_image(&name) => result,
                };
                match result {
                    Ok(report) => info!(
                        image = %report.image,
                        copied = report.copied,
                        present = report.already_present,
                        "Synchronized image content"
                    ),
                    Err(e) => {
                        metrics::counter!("kiln_sync_failures_total").increment(1);
                        error!(image = %name, error = %e, "Content sync failed");
                    }
                }
            });
        }
    }

    /// Copy one image and its reachable content, bounded by the configured
    /// ceiling.
    pub async fn sync_image(&self, name: &str) -> Result<SyncReport, SyncError> {
        match tokio::time::timeout(self.settings.wait_timeout, self.copy_image(name)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Deadline {
                name: name.to_string(),
                timeout: self.settings.wait_timeout,
            }),
        }
    }

    async fn copy_image(&self, name: &str) -> Result<SyncReport, SyncError> {
        let image = self
            .source
            .images
            .get(name)
            .await
            .map_err(|source| SyncError::Image {
                name: name.to_string(),
                source,
            })?;

        let mut report = SyncReport {
            image: name.to_string(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut pending = vec![image.target.clone()];
        while let Some(descriptor) = pending.pop() {
            if !seen.insert(descriptor.digest.clone()) {
                continue;
            }
            let info = self.wait_available(&descriptor).await?;
            if self.copy_blob(&descriptor, &info).await? {
                report.copied += 1;
            } else {
                report.already_present += 1;
            }
            let kids = self.children_of(&descriptor).await?;
            // Reverse so the first child is visited first
            pending.extend(kids.into_iter().rev());
        }

        self.upsert(image).await?;
        Ok(report)
    }

    async fn wait_available(&self, descriptor: &Descriptor) -> Result<ContentInfo, SyncError> {
        let mut logged = false;
        loop {
            match self.source.content.info(&descriptor.digest).await {
                Ok(info) if descriptor.size <= 0 || info.size == descriptor.size => return Ok(info),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(SyncError::Content {
                        digest: descriptor.digest.clone(),
                        source,
                    })
                }
            }
            if !logged {
                debug!(digest = %descriptor.digest, media_type = %descriptor.media_type, "Waiting for content");
                logged = true;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Returns `true` when bytes were written to the destination.
    async fn copy_blob(&self, descriptor: &Descriptor, info: &ContentInfo) -> Result<bool, SyncError> {
        let content_err = |source| SyncError::Content {
            digest: descriptor.digest.clone(),
            source,
        };

        let mut request = IngestRequest::new(descriptor.ref_key(), descriptor.digest.clone())
            .with_labels(info.labels.clone());
        match self.destination.content.info(&descriptor.digest).await {
            Err(e) if e.is_not_found() => request = request.with_descriptor(descriptor.clone()),
            Err(e) => return Err(content_err(e)),
            Ok(_) => {}
        }

        let reader = self
            .source
            .content
            .reader(&descriptor.digest)
            .await
            .map_err(content_err)?;
        match self.destination.content.ingest(request, reader).await {
            Ok(_) => {
                metrics::counter!("kiln_sync_blobs_copied_total").increment(1);
                debug!(digest = %descriptor.digest, size = descriptor.size, "Copied content");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(content_err(e)),
        }
    }

    async fn children_of(&self, descriptor: &Descriptor) -> Result<Vec<Descriptor>, SyncError> {
        if !descriptor.is_manifest() && !descriptor.is_index() {
            return Ok(Vec::new());
        }
        let content_err = |source| SyncError::Content {
            digest: descriptor.digest.clone(),
            source,
        };
        let data = self
            .source
            .content
            .read_all(&descriptor.digest)
            .await
            .map_err(content_err)?;
        children(descriptor, &data).map_err(content_err)
    }

    async fn upsert(&self, image: ImageRecord) -> Result<(), SyncError> {
        let name = image.name.clone();
        let image_err = |source| SyncError::Image {
            name: name.clone(),
            source,
        };
        match self.destination.images.create(image.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                self.destination.images.update(image).await.map_err(image_err)?;
                Ok(())
            }
            Err(e) => Err(image_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{
        sha256_digest, ContentStore, ImageStore, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP,
        MEDIA_TYPE_OCI_MANIFEST,
    };
    use crate::domain::events::EventPublisher;
    use crate::infrastructure::content::{MemoryContentStore, MemoryImageStore};
    use std::io::Cursor;

    struct Fixture {
        bus: EventBus,
        source_content: Arc<MemoryContentStore>,
        dest_content: Arc<MemoryContentStore>,
        source: ContentNamespace,
        destination: ContentNamespace,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::with_default_capacity();
        let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
        let source_content = Arc::new(MemoryContentStore::new());
        let dest_content = Arc::new(MemoryContentStore::new());
        let source = ContentNamespace::new(
            "buildkit",
            source_content.clone(),
            Arc::new(MemoryImageStore::new("buildkit", Some(publisher.clone()))),
        );
        let destination = ContentNamespace::new(
            "k8s.io",
            dest_content.clone(),
            Arc::new(MemoryImageStore::new("k8s.io", Some(publisher))),
        );
        Fixture {
            bus,
            source_content,
            dest_content,
            source,
            destination,
        }
    }

    async fn put(store: &MemoryContentStore, media_type: &str, data: &[u8]) -> Descriptor {
        let desc = Descriptor::for_bytes(media_type, data);
        store
            .ingest(
                IngestRequest::new(desc.ref_key(), desc.digest.clone()).with_descriptor(desc.clone()),
                Box::pin(Cursor::new(data.to_vec())),
            )
            .await
            .unwrap();
        desc
    }

    fn manifest_bytes(config: &Descriptor, layers: &[&Descriptor]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": config,
            "layers": layers,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_sync_copies_graph_and_upserts() {
        let f = fixture();
        let config = put(&f.source_content, MEDIA_TYPE_OCI_CONFIG, b"{\"os\":\"linux\"}").await;
        let layer = put(&f.source_content, MEDIA_TYPE_OCI_LAYER_GZIP, b"layer-one").await;
        let manifest = put(&f.source_content, MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes(&config, &[&layer])).await;
        f.source
            .images
            .create(ImageRecord::new("docker.io/library/app:v1", manifest.clone()))
            .await
            .unwrap();

        let engine = ContentSyncEngine::new(f.source.clone(), f.destination.clone(), SyncSettings::default());
        let report = engine.sync_image("docker.io/library/app:v1").await.unwrap();
        assert_eq!(report.copied, 3);
        assert!(f.dest_content.contains(&layer.digest));
        let mirrored = f.destination.images.get("docker.io/library/app:v1").await.unwrap();
        assert_eq!(mirrored.target, manifest);

        let again = engine.sync_image("docker.io/library/app:v1").await.unwrap();
        assert_eq!(again.copied, 0);
        assert_eq!(again.already_present, 3);
        assert_eq!(f.dest_content.write_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_blob_hits_deadline() {
        let f = fixture();
        let config = put(&f.source_content, MEDIA_TYPE_OCI_CONFIG, b"{}").await;
        let absent = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, b"never-arrives");
        let manifest = put(&f.source_content, MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes(&config, &[&absent])).await;
        f.source
            .images
            .create(ImageRecord::new("app:v1", manifest))
            .await
            .unwrap();

        let settings = SyncSettings {
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        };
        let engine = ContentSyncEngine::new(f.source.clone(), f.destination.clone(), settings);
        let err = engine.sync_image("app:v1").await.unwrap_err();
        assert!(matches!(err, SyncError::Deadline { .. }));
        assert!(f.destination.images.get("app:v1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_engine_follows_event_feed() {
        let f = fixture();
        let layer = put(&f.source_content, MEDIA_TYPE_OCI_LAYER_GZIP, b"solo").await;
        let engine = Arc::new(ContentSyncEngine::new(
            f.source.clone(),
            f.destination.clone(),
            SyncSettings::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = engine.spawn(&f.bus, cancel.clone());

        f.source
            .images
            .create(ImageRecord::new("blob:only", layer.clone()))
            .await
            .unwrap();

        let mirrored = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(image) = f.destination.images.get("blob:only").await {
                    return image;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(mirrored.target.digest, sha256_digest(b"solo"));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
