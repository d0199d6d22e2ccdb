// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Images Application Service
//!
//! Image control plane served by the agent. Every operation works against
//! the servable namespace; delegated pulls land in the build executor's
//! namespace and reach the servable one through the sync engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::jobs::{JobError, JobTracker};
use crate::domain::content::{
    is_image_id, ContentError, ContentNamespace, ImageFilter, ImageRecord, Platform,
};
use crate::domain::progress::ProgressEvent;
use crate::domain::transfer::{
    AuthConfig, ImageReference, ImageTransfer, PullBackend, TransferError, PULL_PLATFORM_ANNOTATION,
};

#[derive(Debug, thiserror::Error)]
pub enum ImagesError {
    #[error("image `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("transfer task aborted: {0}")]
    Aborted(String),
}

pub struct ImagesService {
    servable: ContentNamespace,
    buildkit: ContentNamespace,
    transfer: Arc<dyn ImageTransfer>,
    jobs: JobTracker,
}

impl ImagesService {
    pub fn new(
        servable: ContentNamespace,
        buildkit: ContentNamespace,
        transfer: Arc<dyn ImageTransfer>,
        jobs: JobTracker,
    ) -> Self {
        Self {
            servable,
            buildkit,
            transfer,
            jobs,
        }
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub async fn list(&self, filter: &str) -> Result<Vec<ImageRecord>, ImagesError> {
        let filter = ImageFilter::parse(filter)?;
        Ok(self.servable.images.list(&filter).await?)
    }

    /// Fetch `reference` through the backend its annotations select and
    /// return the normalized image name.
    pub async fn pull(
        &self,
        reference: &str,
        annotations: &BTreeMap<String, String>,
        auth: Option<AuthConfig>,
    ) -> Result<String, ImagesError> {
        let name = ImageReference::parse(reference)?.to_string();
        let platform = annotations
            .get(PULL_PLATFORM_ANNOTATION)
            .and_then(|p| Platform::parse(p))
            .unwrap_or_else(Platform::host);
        let backend = PullBackend::from_annotations(annotations);
        let target = match backend {
            PullBackend::Direct => &self.servable,
            PullBackend::Delegated => &self.buildkit,
        };
        debug!(image = %name, ?backend, platform = %platform, "Image pull");

        let auth = auth.filter(|a| !a.is_empty());
        let image = self
            .transfer
            .pull(&name, &platform, auth.as_ref(), target)
            .await?;
        Ok(image.name)
    }

    /// Stream content statuses of the servable namespace into `sink` until
    /// `reference` resolves there. Returns early if the receiver goes away.
    pub async fn pull_progress(
        &self,
        reference: &str,
        sink: mpsc::Sender<Vec<ProgressEvent>>,
    ) -> Result<(), ImagesError> {
        let poll = self.jobs.settings().poll_interval;
        loop {
            tokio::select! {
                _ = sink.closed() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }
            if let Some(image) = self.status(reference).await? {
                debug!(image = %image.name, "Pull progress done");
                return Ok(());
            }
            let statuses = self.servable.content.list_statuses().await?;
            let batch = statuses.iter().map(ProgressEvent::from_ingest).collect();
            if sink.send(batch).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Upload `reference` from the servable namespace. Progress is
    /// observable through [`push_progress`](Self::push_progress) for the
    /// duration of the transfer.
    pub async fn push(
        &self,
        reference: &str,
        auth: Option<AuthConfig>,
    ) -> Result<String, ImagesError> {
        let image = self
            .resolve(reference)
            .await?
            .ok_or_else(|| ImagesError::NotFound(reference.to_string()))?;
        let handle = self.jobs.register(&image.name)?;

        let transfer = self.transfer.clone();
        let source = self.servable.clone();
        let auth = auth.filter(|a| !a.is_empty());
        let name = image.name.clone();
        // Detached so a dropped caller does not abort the upload midway
        let task = tokio::spawn(async move {
            let result = transfer.push(&image, &source, auth.as_ref(), &handle).await;
            handle.finish();
            result
        });
        match task.await {
            Ok(Ok(())) => {
                info!(image = %name, "Pushed image");
                Ok(name)
            }
            Ok(Err(e)) => {
                warn!(image = %name, error = %e, "Push failed");
                Err(e.into())
            }
            Err(e) => Err(ImagesError::Aborted(e.to_string())),
        }
    }

    /// Relay the push job for `reference` into `sink` until the transfer
    /// finishes. Returns without error when no job appears within the grace
    /// period.
    pub async fn push_progress(
        &self,
        reference: &str,
        sink: mpsc::Sender<Vec<ProgressEvent>>,
    ) -> Result<(), ImagesError> {
        let feed = tokio::select! {
            _ = sink.closed() => return Ok(()),
            feed = self.jobs.attach(reference) => feed,
        };
        let Some(mut feed) = feed else {
            debug!(image = %reference, "Push progress: not tracking");
            return Ok(());
        };
        while let Some(batch) = feed.next_batch().await {
            if sink.send(batch).await.is_err() {
                debug!(image = %reference, "Push progress observer left");
                return Ok(());
            }
        }
        debug!(image = %reference, "Push progress done");
        Ok(())
    }

    /// Point every tag at the target of `reference`, replacing existing
    /// records. Returns the source image.
    pub async fn tag(&self, reference: &str, tags: &[String]) -> Result<ImageRecord, ImagesError> {
        let source = self
            .resolve(reference)
            .await?
            .ok_or_else(|| ImagesError::NotFound(reference.to_string()))?;
        for tag in tags {
            let name = ImageReference::parse(tag)?.to_string();
            let mut record = source.clone();
            record.name = name.clone();
            match self.servable.images.create(record.clone()).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    self.servable.images.delete(&name).await?;
                    self.servable.images.create(record).await?;
                }
                Err(e) => return Err(e.into()),
            }
            debug!(image = %source.name, tag = %name, "Tagged image");
        }
        Ok(source)
    }

    /// Remove by name, or every record sharing the target when `reference`
    /// is an image id.
    pub async fn remove(&self, reference: &str) -> Result<(), ImagesError> {
        let mut doomed = Vec::new();
        if is_image_id(reference) {
            let digest = image_id_digest(reference);
            for image in self.servable.images.list(&ImageFilter::default()).await? {
                if image.target.digest == digest {
                    doomed.push(image.name);
                }
            }
            if doomed.is_empty() {
                return Err(ImagesError::NotFound(reference.to_string()));
            }
        } else {
            let image = self
                .resolve(reference)
                .await?
                .ok_or_else(|| ImagesError::NotFound(reference.to_string()))?;
            let siblings: Vec<String> = self
                .servable
                .images
                .list(&ImageFilter::default())
                .await?
                .into_iter()
                .filter(|other| other.name != image.name && other.target.digest == image.target.digest)
                .map(|other| other.name)
                .collect();
            doomed.push(image.name);
            // A lone sibling is the digest-pinned alias of the same tag
            if let [alias] = siblings.as_slice() {
                doomed.push(alias.clone());
            }
        }

        for name in doomed {
            match self.servable.images.delete(&name).await {
                Ok(()) => debug!(image = %name, "Removed image"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn status(&self, reference: &str) -> Result<Option<ImageRecord>, ImagesError> {
        self.resolve(reference).await
    }

    /// Look `reference` up as given, then normalized, then as an image id.
    async fn resolve(&self, reference: &str) -> Result<Option<ImageRecord>, ImagesError> {
        let images = &self.servable.images;
        match images.get(reference).await {
            Ok(image) => return Ok(Some(image)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if is_image_id(reference) {
            let digest = image_id_digest(reference);
            let found = images
                .list(&ImageFilter::default())
                .await?
                .into_iter()
                .find(|image| image.target.digest == digest);
            return Ok(found);
        }
        let Ok(normalized) = ImageReference::parse(reference) else {
            return Ok(None);
        };
        match images.get(&normalized.to_string()).await {
            Ok(image) => Ok(Some(image)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn image_id_digest(reference: &str) -> String {
    if reference.starts_with("sha256:") {
        reference.to_string()
    } else {
        format!("sha256:{}", reference)
    }
}
