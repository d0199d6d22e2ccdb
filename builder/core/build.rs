// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Script for kiln-core
//!
//! Compiles the Images service protocol definition into tonic client and
//! server stubs, and the containerd API subset the agent speaks. Generated
//! code lands in `OUT_DIR` and is pulled in with `tonic::include_proto!` from
//! `src/presentation/grpc/mod.rs` and `src/infrastructure/containerd/mod.rs`.
//!
//! # Dependencies
//!
//! - **protoc**: Protocol buffer compiler (vendored via `protoc-bin-vendored`)
//! - **tonic-prost-build**: Code generator for Rust gRPC stubs

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost at the vendored protoc so builds do not need a system install
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);
    let well_known = protoc_bin_vendored::include_path()?;
    let includes = [std::path::PathBuf::from("../../proto"), well_known];

    let images = ["../../proto/kiln/images/v1alpha1/images.proto"];
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&images.map(std::path::PathBuf::from), &includes)?;

    // The agent only dials containerd; server stubs back the in-process
    // fake used by the tests
    let containerd = [
        "../../proto/containerd/types/descriptor.proto",
        "../../proto/containerd/types/event.proto",
        "../../proto/containerd/events/image.proto",
        "../../proto/containerd/services/content/v1/content.proto",
        "../../proto/containerd/services/images/v1/images.proto",
        "../../proto/containerd/services/events/v1/events.proto",
    ];
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&containerd.map(std::path::PathBuf::from), &includes)?;

    for proto in images.iter().chain(containerd.iter()) {
        println!("cargo:rerun-if-changed={}", proto);
    }

    Ok(())
}
