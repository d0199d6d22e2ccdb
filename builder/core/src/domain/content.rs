// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Content-Addressable Image Storage
//!
//! Descriptors, image records and the two per-namespace store contracts:
//!
//! - [`ContentStore`] holds blobs by digest, with status-tracked ingestion
//! - [`ImageStore`] holds named pointers ([`ImageRecord`]) into the blob graph
//!
//! A [`ContentNamespace`] bundles one of each. The agent owns two: the build
//! executor's working namespace and the servable namespace.
//!
//! [`children`] decodes manifest and index documents so callers can walk the
//! descriptor graph reachable from an image target.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Label recording which client pulled an image.
pub const CLIENT_LABEL: &str = "images.kiln.dev/client";

pub type ContentLabels = BTreeMap<String, String>;

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// `os/arch[/variant]`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('/');
        let os = parts.next().filter(|s| !s.is_empty())?.to_string();
        let architecture = parts.next().filter(|s| !s.is_empty())?.to_string();
        let variant = parts.next().map(str::to_string);
        Some(Self {
            architecture,
            os,
            variant,
        })
    }

    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "arm" => "arm",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || self.variant == other.variant)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Identifies a blob: media type, digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
            annotations: None,
        }
    }

    /// Descriptor for `data` with its sha256 digest.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(data), data.len() as i64)
    }

    pub fn is_manifest(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_MANIFEST || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST
    }

    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_INDEX || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
    }

    /// Reference key used for ingest status, e.g. `layer-sha256:abcd`.
    pub fn ref_key(&self) -> String {
        let prefix = if self.is_manifest() {
            "manifest"
        } else if self.is_index() {
            "index"
        } else if self.media_type.contains("config") {
            "config"
        } else if self.media_type.contains("layer") || self.media_type.contains("rootfs") {
            "layer"
        } else {
            "unknown"
        };
        format!("{}-{}", prefix, self.digest)
    }
}

/// A named pointer into the descriptor graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
    #[serde(default)]
    pub labels: ContentLabels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            target,
            labels: ContentLabels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Committed blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub digest: String,
    pub size: i64,
    #[serde(default)]
    pub labels: ContentLabels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-progress ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStatus {
    pub reference: String,
    pub offset: i64,
    /// Zero when the expected size is unknown
    pub total: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for [`ContentStore::ingest`].
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Status key while the ingestion is in flight
    pub reference: String,
    pub digest: String,
    /// Known descriptor; enables size verification and status totals
    pub expected: Option<Descriptor>,
    pub labels: ContentLabels,
}

impl IngestRequest {
    pub fn new(reference: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            digest: digest.into(),
            expected: None,
            labels: ContentLabels::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.expected = Some(descriptor);
        self
    }

    pub fn with_labels(mut self, labels: ContentLabels) -> Self {
        self.labels = labels;
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContentError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("content already exists: {0}")]
    AlreadyExists(String),

    #[error("size mismatch for {digest}: expected {expected}, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: i64,
        actual: i64,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid manifest {digest}: {reason}")]
    InvalidManifest { digest: String, reason: String },

    #[error("invalid filter `{0}`")]
    InvalidFilter(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ContentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ContentError::AlreadyExists(_))
    }
}

impl From<std::io::Error> for ContentError {
    fn from(err: std::io::Error) -> Self {
        ContentError::Io(err.to_string())
    }
}

/// Blob storage for one namespace.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Metadata of a committed blob; `NotFound` while still in flight.
    async fn info(&self, digest: &str) -> Result<ContentInfo, ContentError>;

    async fn reader(&self, digest: &str) -> Result<BlobReader, ContentError>;

    /// Stream `reader` into the store and commit it under `request.digest`.
    ///
    /// Returns `AlreadyExists` without consuming the reader when the digest
    /// is already committed.
    async fn ingest(&self, request: IngestRequest, reader: BlobReader) -> Result<ContentInfo, ContentError>;

    async fn list_statuses(&self) -> Result<Vec<ContentStatus>, ContentError>;

    async fn delete(&self, digest: &str) -> Result<(), ContentError>;

    async fn read_all(&self, digest: &str) -> Result<Bytes, ContentError> {
        let mut reader = self.reader(digest).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Image record storage for one namespace.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<ImageRecord, ContentError>;
    async fn list(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, ContentError>;
    /// `AlreadyExists` when the name is taken.
    async fn create(&self, image: ImageRecord) -> Result<ImageRecord, ContentError>;
    /// `NotFound` when the name is absent.
    async fn update(&self, image: ImageRecord) -> Result<ImageRecord, ContentError>;
    async fn delete(&self, name: &str) -> Result<(), ContentError>;
}

/// One isolated partition of the content-addressable store.
#[derive(Clone)]
pub struct ContentNamespace {
    pub name: String,
    pub content: Arc<dyn ContentStore>,
    pub images: Arc<dyn ImageStore>,
}

impl ContentNamespace {
    pub fn new(
        name: impl Into<String>,
        content: Arc<dyn ContentStore>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            name: name.into(),
            content,
            images,
        }
    }
}

impl fmt::Debug for ContentNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentNamespace")
            .field("name", &self.name)
            .finish()
    }
}

/// Image list filter: comma separated terms, all of which must match.
///
/// `name==x`, `name~=substr`, `labels.<key>==value`. Empty matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter {
    terms: Vec<FilterTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterTerm {
    NameEquals(String),
    NameContains(String),
    LabelEquals(String, String),
}

impl ImageFilter {
    pub fn parse(filter: &str) -> Result<Self, ContentError> {
        let mut terms = Vec::new();
        for raw in filter.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let term = if let Some((field, value)) = raw.split_once("~=") {
                match field.trim() {
                    "name" => FilterTerm::NameContains(unquote(value)),
                    _ => return Err(ContentError::InvalidFilter(raw.to_string())),
                }
            } else if let Some((field, value)) =
                raw.split_once("==").or_else(|| raw.split_once('='))
            {
                let field = field.trim();
                if field == "name" {
                    FilterTerm::NameEquals(unquote(value))
                } else if let Some(key) = field.strip_prefix("labels.") {
                    FilterTerm::LabelEquals(unquote(key), unquote(value))
                } else {
                    return Err(ContentError::InvalidFilter(raw.to_string()));
                }
            } else {
                return Err(ContentError::InvalidFilter(raw.to_string()));
            };
            terms.push(term);
        }
        Ok(Self { terms })
    }

    pub fn name(name: &str) -> Self {
        Self {
            terms: vec![FilterTerm::NameEquals(name.to_string())],
        }
    }

    pub fn matches(&self, image: &ImageRecord) -> bool {
        self.terms.iter().all(|term| match term {
            FilterTerm::NameEquals(n) => &image.name == n,
            FilterTerm::NameContains(n) => image.name.contains(n.as_str()),
            FilterTerm::LabelEquals(k, v) => image.labels.get(k) == Some(v),
        })
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Whether `reference` names an image by id rather than by name.
pub fn is_image_id(reference: &str) -> bool {
    let hex_part = reference.strip_prefix("sha256:").unwrap_or(reference);
    hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// Children of `descriptor` given its raw content.
///
/// Manifests yield their config and layers, indexes yield their manifests,
/// everything else is a leaf.
pub fn children(descriptor: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>, ContentError> {
    if !descriptor.is_manifest() && !descriptor.is_index() {
        return Ok(Vec::new());
    }
    let doc: ManifestDocument =
        serde_json::from_slice(data).map_err(|e| ContentError::InvalidManifest {
            digest: descriptor.digest.clone(),
            reason: e.to_string(),
        })?;
    if descriptor.is_index() {
        return Ok(doc.manifests);
    }
    let mut out = Vec::with_capacity(doc.layers.len() + 1);
    out.extend(doc.config);
    out.extend(doc.layers);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_children() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {"mediaType": MEDIA_TYPE_OCI_CONFIG, "digest": "sha256:c", "size": 2},
            "layers": [
                {"mediaType": MEDIA_TYPE_OCI_LAYER_GZIP, "digest": "sha256:l1", "size": 10},
                {"mediaType": MEDIA_TYPE_OCI_LAYER_GZIP, "digest": "sha256:l2", "size": 20}
            ]
        });
        let data = serde_json::to_vec(&manifest).unwrap();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &data);

        let kids = children(&desc, &data).unwrap();
        let digests: Vec<_> = kids.iter().map(|d| d.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:c", "sha256:l1", "sha256:l2"]);
    }

    #[test]
    fn test_index_children_and_leaf() {
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "digest": "sha256:m",
                "size": 300,
                "platform": {"architecture": "amd64", "os": "linux"}
            }]
        });
        let data = serde_json::to_vec(&index).unwrap();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_INDEX, &data);
        let kids = children(&desc, &data).unwrap();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].platform.as_ref().unwrap().architecture, "amd64");

        let layer = Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, "sha256:l", 1);
        assert!(children(&layer, b"not json").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_manifest_is_error() {
        let desc = Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:bad", 3);
        assert!(matches!(
            children(&desc, b"{{{"),
            Err(ContentError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_image_filter() {
        let mut image = ImageRecord::new(
            "docker.io/library/alpine:3.14",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:a", 1),
        );
        image.labels.insert("team".into(), "infra".into());

        assert!(ImageFilter::parse("").unwrap().matches(&image));
        assert!(ImageFilter::parse("name~=alpine").unwrap().matches(&image));
        assert!(ImageFilter::parse("name==docker.io/library/alpine:3.14,labels.team==infra")
            .unwrap()
            .matches(&image));
        assert!(!ImageFilter::parse("labels.team==web").unwrap().matches(&image));
        assert!(ImageFilter::parse("size>3").is_err());
    }

    #[test]
    fn test_image_id_detection() {
        let hex = "a".repeat(64);
        assert!(is_image_id(&hex));
        assert!(is_image_id(&format!("sha256:{}", hex)));
        assert!(!is_image_id("alpine:latest"));
    }

    #[test]
    fn test_platform_parse_and_match() {
        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.to_string(), "linux/arm64/v8");
        let wanted = Platform::parse("linux/arm64").unwrap();
        assert!(wanted.matches(&p));
        assert!(Platform::parse("linux").is_none());
    }
}
