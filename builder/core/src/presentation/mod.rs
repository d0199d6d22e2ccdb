// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`kiln-core`)
//!
//! gRPC surface that translates external requests into application service
//! calls. No business logic lives here; real work is delegated to
//! `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`grpc`] | gRPC (Tonic) | Images service and its client, over mutual TLS |

pub mod grpc;
