// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for image lifecycle events
//
// In-memory event feed on tokio broadcast channels. Image stores publish
// envelopes tagged with their namespace; the content synchronization engine
// subscribes with a namespace and topic filter.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{EventEnvelope, EventPublisher, ImageEvent};

/// Event bus for publishing and subscribing to image events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EventEnvelope>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Slow subscribers lose the oldest events once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an image event on behalf of `namespace`
    pub fn publish_image_event(&self, namespace: &str, event: ImageEvent) {
        self.publish_envelope(EventEnvelope::new(namespace, event));
    }

    fn publish_envelope(&self, envelope: EventEnvelope) {
        debug!(
            namespace = %envelope.namespace,
            topic = %envelope.topic,
            image = %envelope.event.name(),
            "Publishing event"
        );

        let receiver_count = self.sender.send(envelope).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to events from `namespace` whose topic contains `topic_fragment`
    pub fn subscribe_filtered(
        &self,
        namespace: impl Into<String>,
        topic_fragment: impl Into<String>,
    ) -> FilteredEventReceiver {
        FilteredEventReceiver {
            receiver: self.sender.subscribe(),
            namespace: namespace.into(),
            topic_fragment: topic_fragment.into(),
        }
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, envelope: EventEnvelope) {
        self.publish_envelope(envelope);
    }
}

/// Receiver scoped to one namespace and topic family
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<EventEnvelope>,
    namespace: String,
    topic_fragment: String,
}

impl FilteredEventReceiver {
    /// Receive the next matching event, skipping everything else
    pub async fn recv(&mut self) -> Result<EventEnvelope, EventBusError> {
        loop {
            let envelope = self.receiver.recv().await.map_err(map_recv_error)?;
            if envelope.namespace == self.namespace && envelope.topic.contains(&self.topic_fragment) {
                return Ok(envelope);
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn created(name: &str) -> ImageEvent {
        ImageEvent::ImageCreated {
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_filtered("buildkit", "/images/");

        event_bus.publish_image_event("buildkit", created("app:v1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.namespace, "buildkit");
        assert_eq!(received.topic, "/images/create");
        assert_eq!(received.event.name(), "app:v1");
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_other_namespaces() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_filtered("buildkit", "/images/");

        event_bus.publish_image_event("k8s.io", created("ignored"));
        event_bus.publish_image_event(
            "buildkit",
            ImageEvent::ImageUpdated {
                name: "wanted".into(),
                updated_at: Utc::now(),
            },
        );

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event.name(), "wanted");
        assert_eq!(received.topic, "/images/update");
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_drop_count() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe_filtered("buildkit", "/images/");

        for i in 0..5 {
            event_bus.publish_image_event("buildkit", created(&format!("img-{}", i)));
        }

        match receiver.recv().await {
            Err(EventBusError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
