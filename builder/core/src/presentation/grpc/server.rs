// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! gRPC Server Implementation for the kiln agent
//! Exposes List, Pull, PullProgress, Push, PushProgress, Tag, Remove, Status

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::application::images::{ImagesError, ImagesService};
use crate::domain::content::{ContentError, ImageRecord};
use crate::domain::progress::ProgressEvent;
use crate::domain::transfer::{AuthConfig, TransferError};

use super::images_v1::images_server::{Images, ImagesServer};
use super::images_v1::*;

type ProgressStream = ReceiverStream<Result<ImageProgressResponse, Status>>;

/// Implementation of the Images gRPC service
pub struct ImagesGrpcService {
    images: Arc<ImagesService>,
}

impl ImagesGrpcService {
    pub fn new(images: Arc<ImagesService>) -> Self {
        Self { images }
    }

    /// Create a gRPC server instance
    pub fn into_server(self) -> ImagesServer<Self> {
        ImagesServer::new(self)
    }
}

#[tonic::async_trait]
impl Images for ImagesGrpcService {
    type PullProgressStream = ProgressStream;
    type PushProgressStream = ProgressStream;

    async fn list(
        &self,
        request: Request<ImageListRequest>,
    ) -> Result<Response<ImageListResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(filter = %req.filter, "image-list");
        let images = self.images.list(&req.filter).await?;
        Ok(Response::new(ImageListResponse {
            images: images.iter().map(image_to_proto).collect(),
        }))
    }

    async fn pull(
        &self,
        request: Request<ImagePullRequest>,
    ) -> Result<Response<ImagePullResponse>, Status> {
        let req = request.into_inner();
        let spec = required_spec(req.image)?;
        let annotations: BTreeMap<String, String> = spec.annotations.into_iter().collect();
        let image = self
            .images
            .pull(&spec.image, &annotations, req.auth.map(auth_from_proto))
            .await?;
        Ok(Response::new(ImagePullResponse { image }))
    }

    /// Streams blob statuses until the image is resolvable
    async fn pull_progress(
        &self,
        request: Request<ImageProgressRequest>,
    ) -> Result<Response<Self::PullProgressStream>, Status> {
        let image = request.into_inner().image;
        let images = self.images.clone();
        Ok(Response::new(stream_progress(move |sink| async move {
            images.pull_progress(&image, sink).await
        })))
    }

    async fn push(
        &self,
        request: Request<ImagePushRequest>,
    ) -> Result<Response<ImagePushResponse>, Status> {
        let req = request.into_inner();
        let spec = required_spec(req.image)?;
        let image = self
            .images
            .push(&spec.image, req.auth.map(auth_from_proto))
            .await?;
        Ok(Response::new(ImagePushResponse { image }))
    }

    /// Streams the push job's statuses until the transfer finishes
    async fn push_progress(
        &self,
        request: Request<ImageProgressRequest>,
    ) -> Result<Response<Self::PushProgressStream>, Status> {
        let image = request.into_inner().image;
        let images = self.images.clone();
        Ok(Response::new(stream_progress(move |sink| async move {
            images.push_progress(&image, sink).await
        })))
    }

    async fn tag(
        &self,
        request: Request<ImageTagRequest>,
    ) -> Result<Response<ImageTagResponse>, Status> {
        let req = request.into_inner();
        let image = self.images.tag(&req.image, &req.tags).await?;
        Ok(Response::new(ImageTagResponse {
            image: Some(image_to_proto(&image)),
        }))
    }

    async fn remove(
        &self,
        request: Request<ImageRemoveRequest>,
    ) -> Result<Response<ImageRemoveResponse>, Status> {
        if let Some(spec) = request.into_inner().image {
            self.images.remove(&spec.image).await?;
        }
        Ok(Response::new(ImageRemoveResponse {}))
    }

    async fn status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let spec = required_spec(request.into_inner().image)?;
        let image = self.images.status(&spec.image).await?;
        Ok(Response::new(ImageStatusResponse {
            image: image.as_ref().map(image_to_proto),
        }))
    }
}

/// Run `produce` in a task, relaying each batch it emits as one response.
/// A producer error ends the stream with that status.
fn stream_progress<F, Fut>(produce: F) -> ProgressStream
where
    F: FnOnce(mpsc::Sender<Vec<ProgressEvent>>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ImagesError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let (events_tx, mut events_rx) = mpsc::channel::<Vec<ProgressEvent>>(16);

    tokio::spawn(async move {
        let out = tx.clone();
        let forward = async move {
            while let Some(batch) = events_rx.recv().await {
                let response = ImageProgressResponse {
                    status: batch.iter().map(status_to_proto).collect(),
                };
                if out.send(Ok(response)).await.is_err() {
                    break; // Client disconnected
                }
            }
        };
        let (result, ()) = tokio::join!(produce(events_tx), forward);
        if let Err(e) = result {
            tracing::debug!(error = %e, "progress stream failed");
            let _ = tx.send(Err(e.into())).await;
        }
    });

    ReceiverStream::new(rx)
}

fn required_spec(spec: Option<ImageSpec>) -> Result<ImageSpec, Status> {
    spec.ok_or_else(|| Status::invalid_argument("image is required"))
}

fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn image_to_proto(image: &ImageRecord) -> Image {
    Image {
        name: image.name.clone(),
        target: Some(Descriptor {
            media_type: image.target.media_type.clone(),
            digest: image.target.digest.clone(),
            size: image.target.size,
        }),
        labels: image.labels.clone().into_iter().collect(),
        created_at: Some(timestamp(image.created_at)),
        updated_at: Some(timestamp(image.updated_at)),
    }
}

fn status_to_proto(event: &ProgressEvent) -> ImageStatus {
    ImageStatus {
        r#ref: event.reference.clone(),
        status: event.state.as_str().to_string(),
        offset: event.offset,
        total: event.total,
        started_at: Some(timestamp(event.started_at)),
        updated_at: Some(timestamp(event.updated_at)),
    }
}

fn auth_from_proto(auth: super::images_v1::AuthConfig) -> AuthConfig {
    AuthConfig {
        username: auth.username,
        password: auth.password,
        auth: auth.auth,
        server_address: auth.server_address,
        identity_token: auth.identity_token,
        registry_token: auth.registry_token,
    }
}

impl From<ImagesError> for Status {
    fn from(err: ImagesError) -> Self {
        let message = err.to_string();
        match err {
            ImagesError::NotFound(_) => Status::not_found(message),
            ImagesError::Job(_) => Status::failed_precondition(message),
            ImagesError::Aborted(_) => Status::internal(message),
            ImagesError::Content(e) => match e {
                ContentError::NotFound(_) => Status::not_found(message),
                ContentError::AlreadyExists(_) => Status::already_exists(message),
                ContentError::InvalidFilter(_) => Status::invalid_argument(message),
                _ => Status::internal(message),
            },
            ImagesError::Transfer(e) => match e {
                TransferError::InvalidReference(_) => Status::invalid_argument(message),
                TransferError::Unauthorized(_) => Status::unauthenticated(message),
                TransferError::NoMatchingPlatform(_) => Status::not_found(message),
                TransferError::Unsupported(_) => Status::unimplemented(message),
                TransferError::Content(ContentError::NotFound(_)) => Status::not_found(message),
                TransferError::Http(_) | TransferError::Registry { .. } => Status::unavailable(message),
                TransferError::Content(_) => Status::internal(message),
            },
        }
    }
}

/// Transport security for the agent listener.
#[derive(Clone, Default)]
pub enum ServerTls {
    /// Server certificate, client certificates verified against `ca_pem`
    Mutual {
        ca_pem: Vec<u8>,
        cert_pem: Vec<u8>,
        key_pem: Vec<u8>,
    },
    /// Server certificate only
    Server { cert_pem: Vec<u8>, key_pem: Vec<u8> },
    #[default]
    Plaintext,
}

impl ServerTls {
    /// Read PEM files: all three give mutual TLS, cert and key give plain
    /// TLS, anything else is plaintext.
    pub fn from_files(
        ca: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> std::io::Result<Self> {
        Ok(match (ca, cert, key) {
            (Some(ca), Some(cert), Some(key)) => ServerTls::Mutual {
                ca_pem: std::fs::read(ca)?,
                cert_pem: std::fs::read(cert)?,
                key_pem: std::fs::read(key)?,
            },
            (None, Some(cert), Some(key)) => ServerTls::Server {
                cert_pem: std::fs::read(cert)?,
                key_pem: std::fs::read(key)?,
            },
            _ => ServerTls::Plaintext,
        })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            ServerTls::Mutual { .. } => "mtls",
            ServerTls::Server { .. } => "tls",
            ServerTls::Plaintext => "plaintext",
        }
    }

    fn config(&self) -> Option<ServerTlsConfig> {
        match self {
            ServerTls::Mutual {
                ca_pem,
                cert_pem,
                key_pem,
            } => Some(
                ServerTlsConfig::new()
                    .identity(Identity::from_pem(cert_pem, key_pem))
                    .client_ca_root(Certificate::from_pem(ca_pem)),
            ),
            ServerTls::Server { cert_pem, key_pem } => {
                Some(ServerTlsConfig::new().identity(Identity::from_pem(cert_pem, key_pem)))
            }
            ServerTls::Plaintext => None,
        }
    }
}

/// Start the gRPC server; returns once `shutdown` is cancelled.
pub async fn start_grpc_server(
    addr: SocketAddr,
    images: Arc<ImagesService>,
    tls: ServerTls,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server = ImagesGrpcService::new(images).into_server();

    tracing::info!(address = %addr, tls = tls.mode(), "Starting kiln gRPC server");

    let mut builder = tonic::transport::Server::builder();
    if let Some(config) = tls.config() {
        builder = builder.tls_config(config)?;
    }
    builder
        .add_service(server)
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("kiln gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::jobs::JobError;
    use crate::domain::progress::TransferState;

    #[test]
    fn test_status_mapping() {
        let busy: Status = ImagesError::Job(JobError::InProgress("app".into())).into();
        assert_eq!(busy.code(), tonic::Code::FailedPrecondition);
        assert_eq!(busy.message(), "transfer already in progress");

        let missing: Status = ImagesError::NotFound("app".into()).into();
        assert_eq!(missing.code(), tonic::Code::NotFound);

        let filter: Status = ImagesError::Content(ContentError::InvalidFilter("x".into())).into();
        assert_eq!(filter.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_status_to_proto() {
        let now = Utc::now();
        let status = status_to_proto(&ProgressEvent {
            reference: "layer-sha256:abc".into(),
            state: TransferState::Downloading,
            offset: 3,
            total: 9,
            started_at: now,
            updated_at: now,
        });
        assert_eq!(status.r#ref, "layer-sha256:abc");
        assert_eq!(status.status, "downloading");
        assert_eq!(status.started_at.unwrap().seconds, now.timestamp());
    }

    #[tokio::test]
    async fn test_stream_progress_ends_with_error_status() {
        use futures::StreamExt;
        let mut stream = stream_progress(|sink| async move {
            let _ = sink.send(Vec::new()).await;
            Err(ImagesError::NotFound("app".into()))
        });
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
        assert!(stream.next().await.is_none());
    }
}
