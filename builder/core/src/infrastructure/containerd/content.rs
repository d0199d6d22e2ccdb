// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use futures::TryStreamExt;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tonic::transport::Channel;
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::containerd::services::content::v1::{
    content_client::ContentClient, AbortRequest, DeleteContentRequest, InfoRequest,
    ListStatusesRequest, ReadContentRequest, WriteAction, WriteContentRequest,
};
use super::{from_timestamp, namespaced, status_error};
use crate::domain::content::{
    BlobReader, ContentError, ContentInfo, ContentStatus, ContentStore, IngestRequest,
};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Separates the caller's status key from the per-ingest suffix in write refs.
const REF_SUFFIX_SEPARATOR: char = '#';

/// Blob storage for one containerd namespace.
#[derive(Clone)]
pub struct ContainerdContentStore {
    client: ContentClient<Channel>,
    namespace: String,
}

impl ContainerdContentStore {
    pub fn new(channel: Channel, namespace: impl Into<String>) -> Self {
        Self {
            client: ContentClient::new(channel),
            namespace: namespace.into(),
        }
    }

    async fn abort(&self, write_ref: &str) {
        let request = match namespaced(
            &self.namespace,
            AbortRequest {
                r#ref: write_ref.to_string(),
            },
        ) {
            Ok(request) => request,
            Err(_) => return,
        };
        if let Err(status) = self.client.clone().abort(request).await {
            debug!(reference = %write_ref, error = %status.message(), "Ingest abort skipped");
        }
    }
}

/// Each ingest writes under its own ref so concurrent writers of one digest
/// never contend for containerd's per-ref lock; the loser's commit reports
/// `AlreadyExists`.
fn write_ref(reference: &str) -> String {
    format!("{}{}{}", reference, REF_SUFFIX_SEPARATOR, Uuid::new_v4().simple())
}

fn status_reference(write_ref: &str) -> &str {
    write_ref
        .split_once(REF_SUFFIX_SEPARATOR)
        .map(|(reference, _)| reference)
        .unwrap_or(write_ref)
}

/// Stream `reader` as write messages, then commit when size and digest
/// check out. Returns the number of bytes sent.
async fn feed_write(
    write_ref: String,
    request: IngestRequest,
    mut reader: BlobReader,
    tx: mpsc::Sender<WriteContentRequest>,
) -> Result<i64, ContentError> {
    let total = request.expected.as_ref().map(|d| d.size).unwrap_or(0);
    let closed = || ContentError::Io(format!("containerd closed the write for {}", request.digest));
    let mut hasher = Sha256::new();
    let mut offset: i64 = 0;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        tx.send(WriteContentRequest {
            action: WriteAction::Write as i32,
            r#ref: write_ref.clone(),
            total,
            expected: request.digest.clone(),
            offset,
            data: chunk[..n].to_vec(),
            ..Default::default()
        })
        .await
        .map_err(|_| closed())?;
        offset += n as i64;
    }

    if let Some(expected) = &request.expected {
        if expected.size != offset {
            return Err(ContentError::SizeMismatch {
                digest: request.digest.clone(),
                expected: expected.size,
                actual: offset,
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

    tx.send(WriteContentRequest {
        action: WriteAction::Commit as i32,
        r#ref: write_ref,
        total: offset,
        expected: request.digest.clone(),
        offset,
        labels: request.labels.into_iter().collect(),
        ..Default::default()
    })
    .await
    .map_err(|_| closed())?;
    Ok(offset)
}

#[async_trait]
impl ContentStore for ContainerdContentStore {
    async fn info(&self, digest: &str) -> Result<ContentInfo, ContentError> {
        let request = namespaced(
            &self.namespace,
            InfoRequest {
                digest: digest.to_string(),
            },
        )?;
        let response = self
            .client
            .clone()
            .info(request)
            .await
            .map_err(|status| status_error(status, digest))?
            .into_inner();
        let info = response
            .info
            .ok_or_else(|| ContentError::NotFound(digest.to_string()))?;
        Ok(ContentInfo {
            digest: info.digest,
            size: info.size,
            labels: info.labels.into_iter().collect(),
            created_at: from_timestamp(info.created_at),
            updated_at: from_timestamp(info.updated_at),
        })
    }

    async fn reader(&self, digest: &str) -> Result<BlobReader, ContentError> {
        // Surface NotFound before handing out a stream.
        self.info(digest).await?;
        let request = namespaced(
            &self.namespace,
            ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
            },
        )?;
        let stream = self
            .client
            .clone()
            .read(request)
            .await
            .map_err(|status| status_error(status, digest))?
            .into_inner()
            .map_ok(|chunk| bytes::Bytes::from(chunk.data))
            .map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn ingest(
        &self,
        request: IngestRequest,
        reader: BlobReader,
    ) -> Result<ContentInfo, ContentError> {
        match self.info(&request.digest).await {
            Ok(_) => return Err(ContentError::AlreadyExists(request.digest)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let digest = request.digest.clone();
        let write_ref = write_ref(&request.reference);
        let (tx, rx) = mpsc::channel(4);
        let feeder = tokio::spawn(feed_write(write_ref.clone(), request, reader, tx));

        let call = namespaced(&self.namespace, ReceiverStream::new(rx))?;
        let outcome = async {
            let mut responses = self
                .client
                .clone()
                .write(call)
                .await
                .map_err(|status| status_error(status, &digest))?
                .into_inner();
            while responses
                .message()
                .await
                .map_err(|status| status_error(status, &digest))?
                .is_some()
            {}
            Ok::<_, ContentError>(())
        }
        .await;

        if let Err(e) = outcome {
            feeder.abort();
            self.abort(&write_ref).await;
            return Err(e);
        }
        let fed = feeder
            .await
            .map_err(|e| ContentError::Io(format!("Ingest writer for {} failed: {}", digest, e)))?;
        if let Err(e) = fed {
            warn!(digest = %digest, error = %e, "Ingest rejected");
            self.abort(&write_ref).await;
            return Err(e);
        }
        debug!(namespace = %self.namespace, digest = %digest, "Committed blob");
        self.info(&digest).await
    }

    async fn list_statuses(&self) -> Result<Vec<ContentStatus>, ContentError> {
        let request = namespaced(&self.namespace, ListStatusesRequest { filters: vec![] })?;
        let response = self
            .client
            .clone()
            .list_statuses(request)
            .await
            .map_err(|status| status_error(status, "statuses"))?
            .into_inner();
        let mut statuses: Vec<ContentStatus> = response
            .statuses
            .into_iter()
            .map(|status| ContentStatus {
                reference: status_reference(&status.r#ref).to_string(),
                offset: status.offset,
                total: status.total,
                started_at: from_timestamp(status.started_at),
                updated_at: from_timestamp(status.updated_at),
            })
            .collect();
        statuses.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(statuses)
    }

    async fn delete(&self, digest: &str) -> Result<(), ContentError> {
        let request = namespaced(
            &self.namespace,
            DeleteContentRequest {
                digest: digest.to_string(),
            },
        )?;
        self.client
            .clone()
            .delete(request)
            .await
            .map_err(|status| status_error(status, digest))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{sha256_digest, Descriptor, MEDIA_TYPE_OCI_LAYER_GZIP};
    use crate::infrastructure::containerd::testing::FakeContainerd;
    use std::io::Cursor;
    use std::sync::Arc;

    fn reader(data: Vec<u8>) -> BlobReader {
        Box::pin(Cursor::new(data))
    }

    #[test]
    fn test_status_reference_strips_ingest_suffix() {
        let reference = write_ref("layer-sha256:abc");
        assert_ne!(reference, "layer-sha256:abc");
        assert_eq!(status_reference(&reference), "layer-sha256:abc");
        assert_eq!(status_reference("buildkit-ref"), "buildkit-ref");
    }

    #[tokio::test]
    async fn test_ingest_streams_chunks_then_commits() {
        let fake = FakeContainerd::start().await;
        let store = ContainerdContentStore::new(fake.channel(), "k8s.io");
        let data: Vec<u8> = (0..(CHUNK_SIZE as u32 * 2 + 17)).map(|i| (i % 241) as u8).collect();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, &data);
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("containerd.io/uncompressed".to_string(), "sha256:feed".to_string());

        let info = store
            .ingest(
                IngestRequest::new(desc.ref_key(), desc.digest.clone())
                    .with_descriptor(desc.clone())
                    .with_labels(labels.clone()),
                reader(data.clone()),
            )
            .await
            .unwrap();
        assert_eq!(info.size, data.len() as i64);
        assert_eq!(info.labels, labels);
        assert_eq!(fake.writes("k8s.io"), 3);

        assert_eq!(&store.read_all(&desc.digest).await.unwrap()[..], &data[..]);
        assert!(store.list_statuses().await.unwrap().is_empty());

        let again = store
            .ingest(IngestRequest::new(desc.ref_key(), desc.digest.clone()), reader(data))
            .await;
        assert!(matches!(again, Err(ContentError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rejected_ingest_is_aborted() {
        let fake = FakeContainerd::start().await;
        let store = ContainerdContentStore::new(fake.channel(), "buildkit");
        let digest = sha256_digest(b"expected");

        let result = store
            .ingest(IngestRequest::new("layer-x", digest.clone()), reader(b"other".to_vec()))
            .await;
        assert!(matches!(result, Err(ContentError::DigestMismatch { .. })));
        assert!(store.info(&digest).await.unwrap_err().is_not_found());
        assert!(store.reader(&digest).await.is_err());
        assert_eq!(fake.open_ingests(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ingests_of_one_digest() {
        let fake = FakeContainerd::start().await;
        let store = Arc::new(ContainerdContentStore::new(fake.channel(), "k8s.io"));
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 239) as u8).collect();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, &data);

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let desc = desc.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .ingest(
                        IngestRequest::new(desc.ref_key(), desc.digest.clone()).with_descriptor(desc),
                        reader(data),
                    )
                    .await
            }));
        }
        let mut committed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => committed += 1,
                Err(ContentError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected ingest error: {}", e),
            }
        }
        assert!(committed >= 1);
        assert_eq!(sha256_digest(&store.read_all(&desc.digest).await.unwrap()), desc.digest);
        assert_eq!(fake.open_ingests(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_blob_is_not_found() {
        let fake = FakeContainerd::start().await;
        let store = ContainerdContentStore::new(fake.channel(), "k8s.io");
        assert!(store.delete("sha256:absent").await.unwrap_err().is_not_found());
    }
}
