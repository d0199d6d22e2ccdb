// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry Transfer Implementation
//!
//! [`ImageTransfer`] over the OCI distribution API.
//!
//! # API Endpoints
//!
//! - `GET  /v2/<name>/manifests/<reference>` - Resolve a manifest or index
//! - `GET  /v2/<name>/blobs/<digest>` - Fetch a blob
//! - `HEAD /v2/<name>/blobs/<digest>` - Check whether a blob exists
//! - `POST /v2/<name>/blobs/uploads/` - Start an upload
//! - `PUT  <location>?digest=<digest>` - Complete a monolithic upload
//! - `PUT  /v2/<name>/manifests/<reference>` - Publish a manifest
//!
//! Basic credentials and bearer-token challenges are both honoured; tokens
//! are cached per repository scope.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};
use url::Url;

use crate::domain::content::{
    children, ContentNamespace, ContentStore, Descriptor, ImageRecord,
    IngestRequest, Platform, CLIENT_LABEL, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::domain::progress::{ProgressEvent, TransferState};
use crate::domain::transfer::{
    AuthConfig, ImageReference, ImageTransfer, ProgressReporter, TransferError,
};

const MANIFEST_ACCEPT: &[&str] = &[
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

/// Registry client implementing pull and push.
pub struct RegistryTransfer {
    client: Client,
    /// Base URL used for every registry instead of `https://<host>`
    endpoint: Option<String>,
    /// Value for the client label on pulled images
    client_label: String,
    tokens: DashMap<String, String>,
}

impl RegistryTransfer {
    pub fn new() -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(http_error)?;
        Ok(Self {
            client,
            endpoint: None,
            client_label: format!("kiln/{}", env!("CARGO_PKG_VERSION")),
            tokens: DashMap::new(),
        })
    }

    /// Route every request to `endpoint` (e.g. a local mirror).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        let host = reference.api_host();
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{}", host)
        } else {
            format!("https://{}", host)
        }
    }

    fn repo_url(&self, reference: &ImageReference, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url(reference), reference.repository, path)
    }

    /// Send a request, answering one authentication challenge if needed.
    async fn send<F>(
        &self,
        reference: &ImageReference,
        auth: Option<&AuthConfig>,
        build: F,
    ) -> Result<Response, TransferError>
    where
        F: Fn() -> RequestBuilder,
    {
        let cache_key = format!("{}/{}", reference.api_host(), reference.repository);
        let cached = self.tokens.get(&cache_key).map(|t| t.value().clone());
        let first = match (&cached, auth) {
            (Some(token), _) => build().bearer_auth(token),
            (None, Some(a)) if !a.registry_token.is_empty() => build().bearer_auth(&a.registry_token),
            (None, _) => build(),
        };
        let response = first.send().await.map_err(http_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(Challenge::parse)
            .ok_or_else(|| TransferError::Unauthorized(reference.to_string()))?;
        let retry = match challenge {
            Challenge::Basic => {
                let (user, pass) = auth
                    .and_then(AuthConfig::credentials)
                    .ok_or_else(|| TransferError::Unauthorized(reference.to_string()))?;
                build().basic_auth(user, Some(pass))
            }
            Challenge::Bearer { realm, service, scope } => {
                let token = self.fetch_token(&realm, service, scope, auth).await?;
                self.tokens.insert(cache_key, token.clone());
                build().bearer_auth(token)
            }
        };
        let response = retry.send().await.map_err(http_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized(reference.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<String>,
        scope: Option<String>,
        auth: Option<&AuthConfig>,
    ) -> Result<String, TransferError> {
        let mut query = Vec::new();
        if let Some(service) = service {
            query.push(("service", service));
        }
        if let Some(scope) = scope {
            query.push(("scope", scope));
        }
        let mut request = self.client.get(realm).query(&query);
        if let Some((user, pass)) = auth.and_then(AuthConfig::credentials) {
            request = request.basic_auth(user, Some(pass));
        } else if let Some(token) = auth.map(|a| a.identity_token.as_str()).filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(http_error)?;
        let response = check(response).await?;
        let body: TokenResponse = response.json().await.map_err(http_error)?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| TransferError::Unauthorized(format!("no token from {}", realm)))
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        object: &str,
        auth: Option<&AuthConfig>,
    ) -> Result<(Descriptor, Bytes), TransferError> {
        let url = self.repo_url(reference, &format!("manifests/{}", object));
        let response = self
            .send(reference, auth, || {
                self.client.get(&url).header(ACCEPT, MANIFEST_ACCEPT.join(", "))
            })
            .await?;
        let response = check(response).await?;
        let media_type = media_type_of(response.headers());
        let body = response.bytes().await.map_err(http_error)?;
        let media_type = match media_type {
            Some(mt) => mt,
            None => sniff_media_type(&body),
        };
        Ok((Descriptor::for_bytes(media_type, &body), body))
    }

    /// Copy one blob into `target` unless it is already there.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        desc: &Descriptor,
        auth: Option<&AuthConfig>,
        target: &ContentNamespace,
    ) -> Result<(), TransferError> {
        if target.content.info(&desc.digest).await.is_ok() {
            debug!(digest = %desc.digest, "Blob already present");
            return Ok(());
        }
        let url = self.repo_url(reference, &format!("blobs/{}", desc.digest));
        let response = self.send(reference, auth, || self.client.get(&url)).await?;
        let response = check(response).await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        let request = IngestRequest::new(desc.ref_key(), desc.digest.clone()).with_descriptor(desc.clone());
        match target
            .content
            .ingest(request, Box::pin(StreamReader::new(stream)))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_bytes(
        target: &ContentNamespace,
        desc: &Descriptor,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let request = IngestRequest::new(desc.ref_key(), desc.digest.clone()).with_descriptor(desc.clone());
        match target.content.ingest(request, Box::pin(Cursor::new(data))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_blob(
        &self,
        reference: &ImageReference,
        desc: &Descriptor,
        source: &ContentNamespace,
        auth: Option<&AuthConfig>,
        progress: &dyn ProgressReporter,
    ) -> Result<(), TransferError> {
        let started_at = Utc::now();
        let report = |state: TransferState, offset: i64| {
            progress.report(ProgressEvent {
                reference: desc.ref_key(),
                state,
                offset,
                total: desc.size,
                started_at,
                updated_at: Utc::now(),
            })
        };
        report(TransferState::Waiting, 0);

        let head_url = self.repo_url(reference, &format!("blobs/{}", desc.digest));
        let head = self
            .send(reference, auth, || self.client.head(&head_url))
            .await?;
        if head.status().is_success() {
            debug!(digest = %desc.digest, "Blob already in registry");
            report(TransferState::Done, desc.size);
            return Ok(());
        }

        source.content.info(&desc.digest).await?;
        let start_url = self.repo_url(reference, "blobs/uploads/");
        let started = self
            .send(reference, auth, || self.client.post(&start_url))
            .await?;
        let started = check(started).await?;
        let location = started
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransferError::Http("upload started without a location".into()))?;
        let upload_url = self.absolute(reference, location)?;
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", upload_url, separator, desc.digest);

        report(TransferState::Uploading, 0);
        let response = self
            .send(reference, auth, || {
                self.client
                    .put(&put_url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, desc.size)
                    .body(blob_body(source.content.clone(), desc.digest.clone()))
            })
            .await?;
        check(response).await?;
        report(TransferState::Uploading, desc.size);
        report(TransferState::Done, desc.size);
        Ok(())
    }

    async fn upload_manifest(
        &self,
        reference: &ImageReference,
        desc: &Descriptor,
        object: &str,
        source: &ContentNamespace,
        auth: Option<&AuthConfig>,
        progress: &dyn ProgressReporter,
    ) -> Result<(), TransferError> {
        let started_at = Utc::now();
        let data = source.content.read_all(&desc.digest).await?;
        let url = self.repo_url(reference, &format!("manifests/{}", object));
        progress.report(ProgressEvent {
            reference: desc.ref_key(),
            state: TransferState::Uploading,
            offset: 0,
            total: desc.size,
            started_at,
            updated_at: Utc::now(),
        });
        let response = self
            .send(reference, auth, || {
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, desc.media_type.as_str())
                    .body(data.clone())
            })
            .await?;
        check(response).await?;
        progress.report(ProgressEvent {
            reference: desc.ref_key(),
            state: TransferState::Done,
            offset: desc.size,
            total: desc.size,
            started_at,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    /// Resolve an upload `Location`, which may be relative to the registry.
    fn absolute(&self, reference: &ImageReference, location: &str) -> Result<String, TransferError> {
        let base = Url::parse(&self.base_url(reference))
            .map_err(|e| TransferError::Http(format!("invalid registry url: {}", e)))?;
        base.join(location)
            .map(String::from)
            .map_err(|e| TransferError::Http(format!("invalid upload location `{}`: {}", location, e)))
    }
}

#[async_trait]
impl ImageTransfer for RegistryTransfer {
    async fn pull(
        &self,
        reference: &str,
        platform: &Platform,
        auth: Option<&AuthConfig>,
        target: &ContentNamespace,
    ) -> Result<ImageRecord, TransferError> {
        let parsed = ImageReference::parse(reference)?;
        info!(image = %parsed, namespace = %target.name, "Pulling image");

        let (mut desc, mut body) = self.fetch_manifest(&parsed, parsed.object(), auth).await?;
        if desc.is_index() {
            let selected = children(&desc, &body)?
                .into_iter()
                .find(|m| m.platform.as_ref().is_some_and(|p| platform.matches(p)))
                .ok_or_else(|| TransferError::NoMatchingPlatform(platform.to_string()))?;
            debug!(digest = %selected.digest, platform = %platform, "Selected platform manifest");
            let (resolved, resolved_body) = self.fetch_manifest(&parsed, &selected.digest, auth).await?;
            desc = Descriptor {
                platform: selected.platform,
                ..resolved
            };
            body = resolved_body;
        }
        if !desc.is_manifest() {
            return Err(TransferError::Unsupported(format!(
                "manifest media type {}",
                desc.media_type
            )));
        }

        for child in children(&desc, &body)? {
            self.fetch_blob(&parsed, &child, auth, target).await?;
        }
        // The manifest goes last so its presence implies a complete graph.
        Self::store_bytes(target, &desc, body).await?;

        let mut image = ImageRecord::new(parsed.to_string(), desc);
        image.labels.insert(CLIENT_LABEL.to_string(), self.client_label.clone());
        let stored = match target.images.create(image.clone()).await {
            Ok(stored) => stored,
            Err(e) if e.is_already_exists() => target.images.update(image).await?,
            Err(e) => return Err(e.into()),
        };
        info!(image = %stored.name, digest = %stored.target.digest, "Pulled image");
        Ok(stored)
    }

    async fn push(
        &self,
        image: &ImageRecord,
        source: &ContentNamespace,
        auth: Option<&AuthConfig>,
        progress: &dyn ProgressReporter,
    ) -> Result<(), TransferError> {
        let parsed = ImageReference::parse(&image.name)?;
        info!(image = %parsed, "Pushing image");

        // Post-order: children before the manifests that reference them.
        let mut ordered = Vec::new();
        let mut stack = vec![(image.target.clone(), false)];
        while let Some((desc, expanded)) = stack.pop() {
            if expanded || (!desc.is_manifest() && !desc.is_index()) {
                if !ordered.iter().any(|d: &Descriptor| d.digest == desc.digest) {
                    ordered.push(desc);
                }
                continue;
            }
            let data = source.content.read_all(&desc.digest).await?;
            let kids = children(&desc, &data)?;
            stack.push((desc, true));
            for kid in kids.into_iter().rev() {
                stack.push((kid, false));
            }
        }

        for desc in &ordered {
            if desc.digest == image.target.digest {
                self.upload_manifest(&parsed, desc, parsed.object(), source, auth, progress)
                    .await?;
            } else if desc.is_manifest() || desc.is_index() {
                self.upload_manifest(&parsed, desc, &desc.digest, source, auth, progress)
                    .await?;
            } else {
                self.upload_blob(&parsed, desc, source, auth, progress).await?;
            }
        }
        info!(image = %parsed, blobs = ordered.len(), "Pushed image");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Self {
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Challenge::Basic;
        }
        let mut realm = String::new();
        let mut service = None;
        let mut scope = None;
        for (key, value) in auth_params(params) {
            match key.as_str() {
                "realm" => realm = value,
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Challenge::Bearer { realm, service, scope }
    }
}

/// `k="v",k2="v,2"` pairs; commas inside quotes stay in the value.
fn auth_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quoted = false;
    for c in params.chars() {
        match c {
            '"' if in_value => quoted = !quoted,
            '=' if !in_value => in_value = true,
            ',' if !quoted => {
                out.push((key.trim().to_string(), std::mem::take(&mut value)));
                key.clear();
                in_value = false;
            }
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        out.push((key.trim().to_string(), value));
    }
    out
}

fn media_type_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| MANIFEST_ACCEPT.contains(&v.as_str()))
}

fn sniff_media_type(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default, rename = "mediaType")]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(body) {
        Ok(Probe { media_type: Some(mt), .. }) => mt,
        Ok(Probe { manifests: Some(_), .. }) => MEDIA_TYPE_OCI_INDEX.to_string(),
        _ => MEDIA_TYPE_OCI_MANIFEST.to_string(),
    }
}

/// Request body that streams a committed blob; the reader opens on first poll.
fn blob_body(content: Arc<dyn ContentStore>, digest: String) -> Body {
    let stream = futures::stream::once(async move {
        content.reader(&digest).await.map_err(std::io::Error::other)
    })
    .map_ok(ReaderStream::new)
    .try_flatten();
    Body::wrap_stream(stream)
}

async fn check(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(TransferError::Registry {
        status: status.as_u16(),
        url,
        body,
    })
}

fn http_error(err: reqwest::Error) -> TransferError {
    TransferError::Http(err.to_string())
}
