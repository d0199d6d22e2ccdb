// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Progress events for long-running pushes and pulls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::content::ContentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Waiting,
    Downloading,
    Unpacking,
    Uploading,
    Done,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Waiting => "waiting",
            TransferState::Downloading => "downloading",
            TransferState::Unpacking => "unpacking",
            TransferState::Uploading => "uploading",
            TransferState::Done => "done",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blob-level status of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub reference: String,
    pub state: TransferState,
    pub offset: i64,
    pub total: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Pull-side view of an in-flight ingestion.
    pub fn from_ingest(status: &ContentStatus) -> Self {
        let state = if status.offset == status.total {
            TransferState::Unpacking
        } else if status.offset > 0 {
            TransferState::Downloading
        } else {
            TransferState::Waiting
        };
        Self {
            reference: status.reference.clone(),
            state,
            offset: status.offset,
            total: status.total,
            started_at: status.started_at,
            updated_at: status.updated_at,
        }
    }
}
