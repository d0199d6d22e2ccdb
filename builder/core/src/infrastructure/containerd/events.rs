// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, info, warn};

use super::api::containerd::events::{ImageCreate, ImageDelete, ImageUpdate};
use super::api::containerd::services::events::v1::{events_client::EventsClient, SubscribeRequest};
use super::api::containerd::types::Envelope;
use super::from_timestamp;
use crate::domain::events::{EventEnvelope, EventPublisher, ImageEvent};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Relays containerd's image events for one namespace onto an
/// [`EventPublisher`], resubscribing whenever the stream drops.
pub struct ContainerdEventFeed {
    client: EventsClient<Channel>,
}

impl ContainerdEventFeed {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: EventsClient::new(channel),
        }
    }

    /// Run until `shutdown` fires.
    pub async fn forward(
        self,
        namespace: String,
        publisher: Arc<dyn EventPublisher>,
        shutdown: CancellationToken,
    ) {
        let filter = format!(r#"namespace=="{}",topic~="^/images/""#, namespace);
        info!(namespace = %namespace, "Relaying containerd image events");
        loop {
            let relayed = tokio::select! {
                _ = shutdown.cancelled() => return,
                relayed = self.relay(&filter, publisher.as_ref()) => relayed,
            };
            match relayed {
                Ok(()) => debug!(namespace = %namespace, "containerd event stream ended"),
                Err(status) => warn!(
                    namespace = %namespace,
                    error = %status.message(),
                    "containerd event subscription failed"
                ),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    async fn relay(&self, filter: &str, publisher: &dyn EventPublisher) -> Result<(), tonic::Status> {
        let mut events = self
            .client
            .clone()
            .subscribe(Request::new(SubscribeRequest {
                filters: vec![filter.to_string()],
            }))
            .await?
            .into_inner();
        while let Some(envelope) = events.message().await? {
            if let Some(envelope) = image_event(envelope) {
                publisher.publish(envelope);
            }
        }
        Ok(())
    }
}

/// Decode an image event; anything else yields `None`.
fn image_event(envelope: Envelope) -> Option<EventEnvelope> {
    let at = from_timestamp(envelope.timestamp);
    let payload = envelope.event?.value;
    let event = match envelope.topic.as_str() {
        "/images/create" => ImageEvent::ImageCreated {
            name: ImageCreate::decode(payload.as_slice()).ok()?.name,
            created_at: at,
        },
        "/images/update" => ImageEvent::ImageUpdated {
            name: ImageUpdate::decode(payload.as_slice()).ok()?.name,
            updated_at: at,
        },
        "/images/delete" => ImageEvent::ImageDeleted {
            name: ImageDelete::decode(payload.as_slice()).ok()?.name,
            deleted_at: at,
        },
        _ => return None,
    };
    Some(EventEnvelope::new(envelope.namespace, event))
}
