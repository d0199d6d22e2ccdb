// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Kiln core
//!
//! Control plane of the kiln remote image builder.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Identity provisioning, cluster reconciliation, content
//!   synchronization and progress streaming

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
