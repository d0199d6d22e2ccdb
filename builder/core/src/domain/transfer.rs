// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Registry Transfer Contracts
//!
//! Push and pull between a [`ContentNamespace`] and a remote registry go
//! through [`ImageTransfer`]. Pulls pick a [`PullBackend`] once per call from
//! the request annotations; transfers report blob-level progress through a
//! [`ProgressReporter`].

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::content::{ContentError, ContentNamespace, ImageRecord, Platform};
use crate::domain::progress::ProgressEvent;

pub const PULL_BACKEND_ANNOTATION: &str = "images.kiln.dev/pull-backend";
pub const PULL_PLATFORM_ANNOTATION: &str = "images.kiln.dev/pull-platform";

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Registry credentials, mirroring the CRI auth config shape.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// base64 `user:password`
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub identity_token: String,
    #[serde(default)]
    pub registry_token: String,
}

impl AuthConfig {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Username and password, decoding `auth` when the plain fields are empty.
    pub fn credentials(&self) -> Option<(String, String)> {
        if !self.username.is_empty() {
            return Some((self.username.clone(), self.password.clone()));
        }
        if self.auth.is_empty() {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(self.auth.trim())
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, pass) = text.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.credentials().is_none() && self.identity_token.is_empty() && self.registry_token.is_empty()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("server_address", &self.server_address)
            .finish_non_exhaustive()
    }
}

/// Where a pull is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullBackend {
    /// The agent fetches straight into the servable namespace
    Direct,
    /// The underlying image service fetches; content reaches the servable
    /// namespace through synchronization
    Delegated,
}

impl PullBackend {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        match annotations.get(PULL_BACKEND_ANNOTATION).map(String::as_str) {
            Some("service") | Some("cri") => PullBackend::Delegated,
            _ => PullBackend::Direct,
        }
    }
}

/// Registry, repository and tag/digest of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Split `reference`, defaulting the registry to `docker.io` and a
    /// missing tag to `latest`.
    pub fn parse(reference: &str) -> Result<Self, TransferError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(TransferError::InvalidReference(reference.to_string()));
        }
        let (name, digest) = match reference.split_once('@') {
            Some((n, d)) => (n, Some(d.to_string())),
            None => (reference, None),
        };
        let (name, tag) = match name.rfind(':') {
            Some(idx) if !name[idx..].contains('/') => {
                (&name[..idx], Some(name[idx + 1..].to_string()))
            }
            _ => (name, None),
        };
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(TransferError::InvalidReference(reference.to_string()));
        }
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or digest used when addressing the manifest.
    pub fn object(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Host serving the distribution API.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid image reference `{0}`")]
    InvalidReference(String),

    #[error("registry request failed: {0}")]
    Http(String),

    #[error("registry returned {status} for {url}: {body}")]
    Registry { status: u16, url: String, body: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no manifest for platform {0}")]
    NoMatchingPlatform(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Content(#[from] ContentError),
}

/// Receives blob-level progress while a transfer runs.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Reporter that drops every event.
pub struct DiscardProgress;

impl ProgressReporter for DiscardProgress {
    fn report(&self, _event: ProgressEvent) {}
}

#[async_trait]
pub trait ImageTransfer: Send + Sync {
    /// Fetch `reference` into `target`, creating or updating its image record.
    async fn pull(
        &self,
        reference: &str,
        platform: &Platform,
        auth: Option<&AuthConfig>,
        target: &ContentNamespace,
    ) -> Result<ImageRecord, TransferError>;

    /// Upload `image` and everything reachable from its target.
    async fn push(
        &self,
        image: &ImageRecord,
        source: &ContentNamespace,
        auth: Option<&AuthConfig>,
        progress: &dyn ProgressReporter,
    ) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.api_host(), "registry-1.docker.io");
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn test_parse_registry_with_port_and_digest() {
        let r = ImageReference::parse("localhost:5000/team/app@sha256:abc").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.object(), "sha256:abc");

        let tagged = ImageReference::parse("registry.example/app:v1").unwrap();
        assert_eq!(tagged.registry, "registry.example");
        assert_eq!(tagged.repository, "app");
        assert_eq!(tagged.object(), "v1");
    }

    #[test]
    fn test_auth_credentials_from_encoded_auth() {
        let auth = AuthConfig {
            auth: base64::engine::general_purpose::STANDARD.encode("bob:hunter2"),
            ..Default::default()
        };
        assert_eq!(
            auth.credentials(),
            Some(("bob".to_string(), "hunter2".to_string()))
        );
        assert!(AuthConfig::default().is_empty());
    }

    #[test]
    fn test_backend_selection() {
        let mut annotations = BTreeMap::new();
        assert_eq!(PullBackend::from_annotations(&annotations), PullBackend::Direct);
        annotations.insert(PULL_BACKEND_ANNOTATION.to_string(), "cri".to_string());
        assert_eq!(PullBackend::from_annotations(&annotations), PullBackend::Delegated);
    }
}
