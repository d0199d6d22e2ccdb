// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use tonic::transport::Channel;

use super::api::containerd::services::images::v1::{
    images_client::ImagesClient, CreateImageRequest, DeleteImageRequest, GetImageRequest, Image,
    ListImagesRequest, UpdateImageRequest,
};
use super::api::containerd::types;
use super::{from_timestamp, namespaced, status_error, to_timestamp};
use crate::domain::content::{ContentError, Descriptor, ImageFilter, ImageRecord, ImageStore};

/// Image records for one containerd namespace. containerd publishes the
/// lifecycle events itself; see [`ContainerdEventFeed`](super::ContainerdEventFeed).
#[derive(Clone)]
pub struct ContainerdImageStore {
    client: ImagesClient<Channel>,
    namespace: String,
}

impl ContainerdImageStore {
    pub fn new(channel: Channel, namespace: impl Into<String>) -> Self {
        Self {
            client: ImagesClient::new(channel),
            namespace: namespace.into(),
        }
    }
}

fn to_image(record: ImageRecord) -> Image {
    let target = record.target;
    Image {
        name: record.name,
        labels: record.labels.into_iter().collect(),
        target: Some(types::Descriptor {
            media_type: target.media_type,
            digest: target.digest,
            size: target.size,
            annotations: target.annotations.unwrap_or_default().into_iter().collect(),
        }),
        created_at: Some(to_timestamp(record.created_at)),
        updated_at: Some(to_timestamp(record.updated_at)),
    }
}

fn to_record(image: Image) -> Result<ImageRecord, ContentError> {
    let target = image.target.ok_or_else(|| ContentError::InvalidManifest {
        digest: image.name.clone(),
        reason: "image has no target".to_string(),
    })?;
    let mut descriptor = Descriptor::new(target.media_type, target.digest, target.size);
    if !target.annotations.is_empty() {
        descriptor.annotations = Some(target.annotations.into_iter().collect());
    }
    Ok(ImageRecord {
        name: image.name,
        target: descriptor,
        labels: image.labels.into_iter().collect(),
        created_at: from_timestamp(image.created_at),
        updated_at: from_timestamp(image.updated_at),
    })
}

fn returned(image: Option<Image>, name: &str) -> Result<ImageRecord, ContentError> {
    to_record(image.ok_or_else(|| ContentError::NotFound(name.to_string()))?)
}

#[async_trait]
impl ImageStore for ContainerdImageStore {
    async fn get(&self, name: &str) -> Result<ImageRecord, ContentError> {
        let request = namespaced(
            &self.namespace,
            GetImageRequest {
                name: name.to_string(),
            },
        )?;
        let response = self
            .client
            .clone()
            .get(request)
            .await
            .map_err(|status| status_error(status, name))?
            .into_inner();
        returned(response.image, name)
    }

    async fn list(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, ContentError> {
        let request = namespaced(&self.namespace, ListImagesRequest { filters: vec![] })?;
        let response = self
            .client
            .clone()
            .list(request)
            .await
            .map_err(|status| status_error(status, "images"))?
            .into_inner();
        let mut images = Vec::with_capacity(response.images.len());
        for image in response.images {
            let record = to_record(image)?;
            if filter.matches(&record) {
                images.push(record);
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    async fn create(&self, image: ImageRecord) -> Result<ImageRecord, ContentError> {
        let name = image.name.clone();
        let request = namespaced(
            &self.namespace,
            CreateImageRequest {
                image: Some(to_image(image)),
            },
        )?;
        let response = self
            .client
            .clone()
            .create(request)
            .await
            .map_err(|status| status_error(status, &name))?
            .into_inner();
        returned(response.image, &name)
    }

    async fn update(&self, image: ImageRecord) -> Result<ImageRecord, ContentError> {
        let name = image.name.clone();
        // An empty mask replaces target and labels.
        let request = namespaced(
            &self.namespace,
            UpdateImageRequest {
                image: Some(to_image(image)),
                update_mask: None,
            },
        )?;
        let response = self
            .client
            .clone()
            .update(request)
            .await
            .map_err(|status| status_error(status, &name))?
            .into_inner();
        returned(response.image, &name)
    }

    async fn delete(&self, name: &str) -> Result<(), ContentError> {
        let request = namespaced(
            &self.namespace,
            DeleteImageRequest {
                name: name.to_string(),
                sync: false,
            },
        )?;
        self.client
            .clone()
            .delete(request)
            .await
            .map_err(|status| status_error(status, name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{sha256_digest, MEDIA_TYPE_OCI_MANIFEST};
    use crate::infrastructure::containerd::testing::FakeContainerd;

    fn target() -> Descriptor {
        Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, sha256_digest(b"manifest"), 8)
    }

    #[test]
    fn test_record_conversion_keeps_annotations() {
        let mut record = ImageRecord::new("docker.io/library/app:v1", target());
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert("org.opencontainers.image.ref.name".to_string(), "v1".to_string());
        record.target.annotations = Some(annotations);
        record.labels.insert("io.cri-containerd.image".into(), "managed".into());

        let back = to_record(to_image(record.clone())).unwrap();
        assert_eq!(back.target, record.target);
        assert_eq!(back.labels, record.labels);
        assert_eq!(back.created_at.timestamp(), record.created_at.timestamp());
    }

    #[tokio::test]
    async fn test_image_lifecycle_is_namespaced() {
        let fake = FakeContainerd::start().await;
        let servable = ContainerdImageStore::new(fake.channel(), "k8s.io");
        let builds = ContainerdImageStore::new(fake.channel(), "buildkit");

        servable.create(ImageRecord::new("app:v1", target())).await.unwrap();
        assert!(servable
            .create(ImageRecord::new("app:v1", target()))
            .await
            .unwrap_err()
            .is_already_exists());
        assert!(builds.get("app:v1").await.unwrap_err().is_not_found());

        let mut relabeled = ImageRecord::new("app:v1", target());
        relabeled.labels.insert("images.kiln.dev/client".into(), "kiln".into());
        servable.update(relabeled).await.unwrap();
        let listed = servable
            .list(&ImageFilter::parse("labels.images.kiln.dev/client==kiln").unwrap())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        assert!(builds
            .update(ImageRecord::new("missing", target()))
            .await
            .unwrap_err()
            .is_not_found());
        servable.delete("app:v1").await.unwrap();
        assert!(servable.delete("app:v1").await.unwrap_err().is_not_found());
    }
}
