// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process containerd serving the content, images and events APIs over a
//! unix socket in a temporary directory.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

use super::api::containerd::services::content::v1::{
    content_server::{Content, ContentServer},
    AbortRequest, DeleteContentRequest, Info, InfoRequest, InfoResponse, ListStatusesRequest,
    ListStatusesResponse, ReadContentRequest, ReadContentResponse, Status as IngestStatus,
    WriteAction, WriteContentRequest, WriteContentResponse,
};
use super::api::containerd::services::events::v1::{
    events_server::{Events, EventsServer},
    SubscribeRequest,
};
use super::api::containerd::services::images::v1::{
    images_server::{Images, ImagesServer},
    CreateImageRequest, CreateImageResponse, DeleteImageRequest, GetImageRequest,
    GetImageResponse, Image, ListImagesRequest, ListImagesResponse, UpdateImageRequest,
    UpdateImageResponse,
};
use super::api::containerd::types::Envelope;
use super::NAMESPACE_HEADER;

const READ_CHUNK: usize = 64 * 1024;

struct Blob {
    data: Vec<u8>,
    labels: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<(String, String), Blob>,
    ingests: HashMap<(String, String), Vec<u8>>,
    writes: HashMap<String, usize>,
    images: HashMap<(String, String), Image>,
    subscribers: Vec<(Vec<String>, mpsc::Sender<Result<Envelope, Status>>)>,
}

#[derive(Clone, Default)]
struct Daemon {
    state: Arc<Mutex<State>>,
}

fn namespace<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .metadata()
        .get(NAMESPACE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Status::failed_precondition("namespace is required"))
}

pub struct FakeContainerd {
    state: Arc<Mutex<State>>,
    channel: Channel,
    server: JoinHandle<()>,
    _dir: TempDir,
}

impl FakeContainerd {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("containerd.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let daemon = Daemon::default();
        let state = daemon.state.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(ContentServer::new(daemon.clone()))
                .add_service(ImagesServer::new(daemon.clone()))
                .add_service(EventsServer::new(daemon))
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .unwrap();
        });
        Self {
            state,
            channel: super::connect(&socket),
            server,
            _dir: dir,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Data-carrying write messages received for `namespace`.
    pub fn writes(&self, namespace: &str) -> usize {
        self.state.lock().writes.get(namespace).copied().unwrap_or(0)
    }

    /// Ingests neither committed nor aborted.
    pub fn open_ingests(&self) -> usize {
        self.state.lock().ingests.len()
    }

    pub async fn wait_for_subscriber(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.lock().subscribers.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no event subscriber arrived");
    }

    pub fn subscriber_filters(&self) -> Vec<String> {
        self.state
            .lock()
            .subscribers
            .first()
            .map(|(filters, _)| filters.clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, envelope: Envelope) {
        for (_, tx) in &self.state.lock().subscribers {
            let _ = tx.try_send(Ok(envelope.clone()));
        }
    }
}

impl Drop for FakeContainerd {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl Daemon {
    fn apply_write(
        &self,
        namespace: &str,
        message: WriteContentRequest,
    ) -> Result<WriteContentResponse, Status> {
        let mut state = self.state.lock();
        let key = (namespace.to_string(), message.r#ref.clone());
        let action = WriteAction::try_from(message.action).unwrap_or(WriteAction::Stat);
        match action {
            WriteAction::Stat => {}
            WriteAction::Write => {
                let ingest = state.ingests.entry(key.clone()).or_default();
                if message.offset != ingest.len() as i64 {
                    return Err(Status::invalid_argument(format!(
                        "write at {} but ingest holds {} bytes",
                        message.offset,
                        ingest.len()
                    )));
                }
                ingest.extend_from_slice(&message.data);
                if !message.data.is_empty() {
                    *state.writes.entry(namespace.to_string()).or_default() += 1;
                }
            }
            WriteAction::Commit => {
                let data = state.ingests.remove(&key).unwrap_or_default();
                let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
                if message.total > 0 && message.total != data.len() as i64 {
                    return Err(Status::failed_precondition("unexpected commit size"));
                }
                if !message.expected.is_empty() && message.expected != digest {
                    return Err(Status::failed_precondition("unexpected commit digest"));
                }
                let blob = (namespace.to_string(), digest.clone());
                if state.blobs.contains_key(&blob) {
                    return Err(Status::already_exists(digest));
                }
                let size = data.len() as i64;
                state.blobs.insert(
                    blob,
                    Blob {
                        data,
                        labels: message.labels,
                    },
                );
                return Ok(WriteContentResponse {
                    action: message.action,
                    offset: size,
                    total: size,
                    digest,
                    ..Default::default()
                });
            }
        }
        let offset = state.ingests.get(&key).map(|d| d.len() as i64).unwrap_or(0);
        Ok(WriteContentResponse {
            action: message.action,
            offset,
            total: message.total,
            ..Default::default()
        })
    }
}

#[tonic::async_trait]
impl Content for Daemon {
    type ReadStream = BoxStream<'static, Result<ReadContentResponse, Status>>;
    type WriteStream = BoxStream<'static, Result<WriteContentResponse, Status>>;

    async fn info(&self, request: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
        let ns = namespace(&request)?;
        let digest = request.into_inner().digest;
        let state = self.state.lock();
        let blob = state
            .blobs
            .get(&(ns, digest.clone()))
            .ok_or_else(|| Status::not_found(digest.clone()))?;
        Ok(Response::new(InfoResponse {
            info: Some(Info {
                digest,
                size: blob.data.len() as i64,
                created_at: None,
                updated_at: None,
                labels: blob.labels.clone(),
            }),
        }))
    }

    async fn delete(&self, request: Request<DeleteContentRequest>) -> Result<Response<()>, Status> {
        let ns = namespace(&request)?;
        let digest = request.into_inner().digest;
        match self.state.lock().blobs.remove(&(ns, digest.clone())) {
            Some(_) => Ok(Response::new(())),
            None => Err(Status::not_found(digest)),
        }
    }

    async fn read(
        &self,
        request: Request<ReadContentRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let ns = namespace(&request)?;
        let digest = request.into_inner().digest;
        let data = self
            .state
            .lock()
            .blobs
            .get(&(ns, digest.clone()))
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Status::not_found(digest))?;
        let chunks: Vec<_> = data
            .chunks(READ_CHUNK)
            .enumerate()
            .map(|(i, chunk)| {
                Ok(ReadContentResponse {
                    offset: (i * READ_CHUNK) as i64,
                    data: chunk.to_vec(),
                })
            })
            .collect();
        Ok(Response::new(stream::iter(chunks).boxed()))
    }

    async fn list_statuses(
        &self,
        request: Request<ListStatusesRequest>,
    ) -> Result<Response<ListStatusesResponse>, Status> {
        let ns = namespace(&request)?;
        let statuses = self
            .state
            .lock()
            .ingests
            .iter()
            .filter(|((owner, _), _)| *owner == ns)
            .map(|((_, reference), data)| IngestStatus {
                r#ref: reference.clone(),
                offset: data.len() as i64,
                ..Default::default()
            })
            .collect();
        Ok(Response::new(ListStatusesResponse { statuses }))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteContentRequest>>,
    ) -> Result<Response<Self::WriteStream>, Status> {
        let ns = namespace(&request)?;
        let mut messages = request.into_inner();
        let mut responses = Vec::new();
        while let Some(message) = messages.message().await? {
            responses.push(Ok(self.apply_write(&ns, message)?));
        }
        Ok(Response::new(stream::iter(responses).boxed()))
    }

    async fn abort(&self, request: Request<AbortRequest>) -> Result<Response<()>, Status> {
        let ns = namespace(&request)?;
        let reference = request.into_inner().r#ref;
        match self.state.lock().ingests.remove(&(ns, reference.clone())) {
            Some(_) => Ok(Response::new(())),
            None => Err(Status::not_found(reference)),
        }
    }
}

#[tonic::async_trait]
impl Images for Daemon {
    async fn get(
        &self,
        request: Request<GetImageRequest>,
    ) -> Result<Response<GetImageResponse>, Status> {
        let ns = namespace(&request)?;
        let name = request.into_inner().name;
        let image = self
            .state
            .lock()
            .images
            .get(&(ns, name.clone()))
            .cloned()
            .ok_or_else(|| Status::not_found(name))?;
        Ok(Response::new(GetImageResponse { image: Some(image) }))
    }

    async fn list(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let ns = namespace(&request)?;
        let images = self
            .state
            .lock()
            .images
            .iter()
            .filter(|((owner, _), _)| *owner == ns)
            .map(|(_, image)| image.clone())
            .collect();
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn create(
        &self,
        request: Request<CreateImageRequest>,
    ) -> Result<Response<CreateImageResponse>, Status> {
        let ns = namespace(&request)?;
        let image = request
            .into_inner()
            .image
            .ok_or_else(|| Status::invalid_argument("image is required"))?;
        let mut state = self.state.lock();
        let key = (ns, image.name.clone());
        if state.images.contains_key(&key) {
            return Err(Status::already_exists(image.name));
        }
        state.images.insert(key, image.clone());
        Ok(Response::new(CreateImageResponse { image: Some(image) }))
    }

    async fn update(
        &self,
        request: Request<UpdateImageRequest>,
    ) -> Result<Response<UpdateImageResponse>, Status> {
        let ns = namespace(&request)?;
        let image = request
            .into_inner()
            .image
            .ok_or_else(|| Status::invalid_argument("image is required"))?;
        let mut state = self.state.lock();
        let stored = state
            .images
            .get_mut(&(ns, image.name.clone()))
            .ok_or_else(|| Status::not_found(image.name.clone()))?;
        stored.target = image.target;
        stored.labels = image.labels;
        stored.updated_at = image.updated_at;
        Ok(Response::new(UpdateImageResponse {
            image: Some(stored.clone()),
        }))
    }

    async fn delete(&self, request: Request<DeleteImageRequest>) -> Result<Response<()>, Status> {
        let ns = namespace(&request)?;
        let name = request.into_inner().name;
        match self.state.lock().images.remove(&(ns, name.clone())) {
            Some(_) => Ok(Response::new(())),
            None => Err(Status::not_found(name)),
        }
    }
}

#[tonic::async_trait]
impl Events for Daemon {
    type SubscribeStream = ReceiverStream<Result<Envelope, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .lock()
            .subscribers
            .push((request.into_inner().filters, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
