// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`kiln-core`)
//!
//! Types and store contracts with no I/O of their own.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Certificates, cluster records, content graph, events,
//!   progress and transfer contracts

pub mod agent_config;
pub mod builder;
pub mod certificate;
pub mod cluster;
pub mod content;
pub mod events;
pub mod progress;
pub mod transfer;
