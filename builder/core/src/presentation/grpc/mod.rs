// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Images gRPC service: generated stubs, server and client.

pub mod client;
pub mod server;

// Generated protobuf code
pub mod images_v1 {
    tonic::include_proto!("kiln.images.v1alpha1");
}
