// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Image lifecycle events emitted by an image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageEvent {
    ImageCreated {
        name: String,
        created_at: DateTime<Utc>,
    },
    ImageUpdated {
        name: String,
        updated_at: DateTime<Utc>,
    },
    ImageDeleted {
        name: String,
        deleted_at: DateTime<Utc>,
    },
}

impl ImageEvent {
    pub fn name(&self) -> &str {
        match self {
            ImageEvent::ImageCreated { name, .. }
            | ImageEvent::ImageUpdated { name, .. }
            | ImageEvent::ImageDeleted { name, .. } => name,
        }
    }

    /// Feed topic, e.g. `/images/create`.
    pub fn topic(&self) -> &'static str {
        match self {
            ImageEvent::ImageCreated { .. } => "/images/create",
            ImageEvent::ImageUpdated { .. } => "/images/update",
            ImageEvent::ImageDeleted { .. } => "/images/delete",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageEvent::ImageCreated { .. } => "create",
            ImageEvent::ImageUpdated { .. } => "update",
            ImageEvent::ImageDeleted { .. } => "delete",
        }
    }
}

/// An event as seen on the feed: tagged with the namespace that emitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub namespace: String,
    pub topic: String,
    pub event: ImageEvent,
    pub published_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(namespace: impl Into<String>, event: ImageEvent) -> Self {
        Self {
            namespace: namespace.into(),
            topic: event.topic().to_string(),
            event,
            published_at: Utc::now(),
        }
    }
}

/// Publishing side of the event feed, handed to image stores.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, envelope: EventEnvelope);
}
