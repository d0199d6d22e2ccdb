// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! containerd Content Backend
//!
//! [`ContentStore`](crate::domain::content::ContentStore) and
//! [`ImageStore`](crate::domain::content::ImageStore) over the node's
//! containerd daemon, plus [`ContainerdEventFeed`], which relays containerd's
//! image events onto the agent's event bus. The build executor and the
//! kubelet share this daemon, so images built in one namespace become
//! servable once synchronized into another.
//!
//! Every call carries the `containerd-namespace` header of the store that
//! issued it.

mod content;
mod events;
mod images;
#[cfg(test)]
mod testing;

pub use content::ContainerdContentStore;
pub use events::ContainerdEventFeed;
pub use images::ContainerdImageStore;

use chrono::{DateTime, Utc};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Request, Status};
use tower::service_fn;

use crate::domain::content::ContentError;

/// Generated containerd API stubs.
pub(crate) mod api {
    pub mod containerd {
        pub mod types {
            tonic::include_proto!("containerd.types");
        }
        pub mod events {
            tonic::include_proto!("containerd.events");
        }
        pub mod services {
            pub mod content {
                pub mod v1 {
                    tonic::include_proto!("containerd.services.content.v1");
                }
            }
            pub mod images {
                pub mod v1 {
                    tonic::include_proto!("containerd.services.images.v1");
                }
            }
            pub mod events {
                pub mod v1 {
                    tonic::include_proto!("containerd.services.events.v1");
                }
            }
        }
    }
}

const NAMESPACE_HEADER: &str = "containerd-namespace";

/// Channel to the containerd socket at `socket`. Connects on first use and
/// reconnects after failures.
pub fn connect(socket: impl AsRef<Path>) -> Channel {
    let path: PathBuf = socket.as_ref().to_path_buf();
    // The URI is a placeholder; every connection dials the socket.
    Endpoint::from_static("http://containerd.sock").connect_with_connector_lazy(service_fn(
        move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        },
    ))
}

/// Wrap `message` for `namespace`.
fn namespaced<T>(namespace: &str, message: T) -> Result<Request<T>, ContentError> {
    let value = MetadataValue::try_from(namespace)
        .map_err(|_| ContentError::Io(format!("Invalid containerd namespace '{}'", namespace)))?;
    let mut request = Request::new(message);
    request.metadata_mut().insert(NAMESPACE_HEADER, value);
    Ok(request)
}

fn status_error(status: Status, subject: &str) -> ContentError {
    match status.code() {
        Code::NotFound => ContentError::NotFound(subject.to_string()),
        Code::AlreadyExists => ContentError::AlreadyExists(subject.to_string()),
        _ => ContentError::Io(format!(
            "containerd {:?} for {}: {}",
            status.code(),
            subject,
            status.message()
        )),
    }
}

fn from_timestamp(ts: Option<prost_types::Timestamp>) -> DateTime<Utc> {
    ts.and_then(|t| DateTime::from_timestamp(t.seconds, u32::try_from(t.nanos).unwrap_or(0)))
        .unwrap_or_default()
}

fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: i32::try_from(time.timestamp_subsec_nanos()).unwrap_or(0),
    }
}
