// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Image commands against the builder agent
//!
//! Commands: ls, pull, push, tag, rm

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use std::collections::HashMap;

use kiln_core::domain::transfer::{PULL_BACKEND_ANNOTATION, PULL_PLATFORM_ANNOTATION};
use kiln_core::presentation::grpc::images_v1::{
    Image, ImageListRequest, ImageProgressRequest, ImagePullRequest, ImagePushRequest,
    ImageRemoveRequest, ImageSpec, ImageTagRequest,
};

use crate::cluster::{BuilderSession, ClusterArgs};
use crate::progress::ProgressBoard;

#[derive(Subcommand)]
pub enum ImageCommand {
    /// List images served by the builder
    #[command(alias = "list")]
    Ls {
        /// e.g. `name~=app` or `labels.team==infra`
        #[arg(value_name = "FILTER", default_value = "")]
        filter: String,
    },

    /// Pull an image into the builder
    Pull {
        #[arg(value_name = "IMAGE")]
        reference: String,

        /// Target platform, e.g. linux/arm64
        #[arg(long)]
        platform: Option<String>,

        /// Pull backend: `direct`, or `service` to go through the build executor
        #[arg(long)]
        backend: Option<String>,
    },

    /// Push an image from the builder to its registry
    Push {
        #[arg(value_name = "IMAGE")]
        reference: String,
    },

    /// Create tags pointing at an image
    Tag {
        #[arg(value_name = "IMAGE")]
        reference: String,

        #[arg(value_name = "TAG", required = true)]
        tags: Vec<String>,
    },

    /// Remove images
    #[command(alias = "remove")]
    Rm {
        #[arg(value_name = "IMAGE", required = true)]
        references: Vec<String>,
    },
}

pub async fn handle_command(command: ImageCommand, cluster: &ClusterArgs) -> Result<()> {
    let session = BuilderSession::open(cluster).await?;
    match command {
        ImageCommand::Ls { filter } => list(session, filter).await,
        ImageCommand::Pull {
            reference,
            platform,
            backend,
        } => pull(session, reference, platform, backend).await,
        ImageCommand::Push { reference } => push(session, reference).await,
        ImageCommand::Tag { reference, tags } => tag(session, reference, tags).await,
        ImageCommand::Rm { references } => remove(session, references).await,
    }
}

async fn list(mut session: BuilderSession, filter: String) -> Result<()> {
    let images = session
        .client
        .list(ImageListRequest { filter })
        .await
        .context("Failed to list images")?
        .into_inner()
        .images;

    if images.is_empty() {
        println!("{}", "No images found".yellow());
        return Ok(());
    }

    println!("{:<60} {:<20} {:>10} {}", "NAME", "DIGEST", "SIZE", "CREATED");
    for image in &images {
        let (digest, size) = image
            .target
            .as_ref()
            .map(|t| (short_digest(&t.digest), human_size(t.size)))
            .unwrap_or_default();
        println!(
            "{:<60} {:<20} {:>10} {}",
            image.name.bold(),
            digest,
            size,
            created(image)
        );
    }
    Ok(())
}

async fn pull(
    session: BuilderSession,
    reference: String,
    platform: Option<String>,
    backend: Option<String>,
) -> Result<()> {
    let auth = session.registry_auth(&reference).await?;
    let request = ImagePullRequest {
        image: Some(ImageSpec {
            image: reference.clone(),
            annotations: pull_annotations(platform, backend),
        }),
        auth,
    };

    let mut client = session.client.clone();
    let transfer = tokio::spawn(async move { client.pull(request).await });

    let mut progress_client = session.client.clone();
    let stream = progress_client
        .pull_progress(ImageProgressRequest {
            image: reference.clone(),
        })
        .await
        .context("Failed to follow pull progress")?
        .into_inner();
    let mut board = ProgressBoard::new();
    board.follow(stream).await?;

    let image = transfer
        .await
        .context("Pull task aborted")?
        .with_context(|| format!("Failed to pull {}", reference))?
        .into_inner()
        .image;
    board.finish();
    println!("{}", format!("✓ Pulled {}", image).green());
    Ok(())
}

async fn push(session: BuilderSession, reference: String) -> Result<()> {
    let auth = session.registry_auth(&reference).await?;
    let request = ImagePushRequest {
        image: Some(ImageSpec {
            image: reference.clone(),
            annotations: HashMap::new(),
        }),
        auth,
    };

    let mut client = session.client.clone();
    let transfer = tokio::spawn(async move { client.push(request).await });

    let mut progress_client = session.client.clone();
    let stream = progress_client
        .push_progress(ImageProgressRequest {
            image: reference.clone(),
        })
        .await
        .context("Failed to follow push progress")?
        .into_inner();
    let mut board = ProgressBoard::new();
    board.follow(stream).await?;

    let image = transfer
        .await
        .context("Push task aborted")?
        .with_context(|| format!("Failed to push {}", reference))?
        .into_inner()
        .image;
    board.finish();
    println!("{}", format!("✓ Pushed {}", image).green());
    Ok(())
}

async fn tag(mut session: BuilderSession, reference: String, tags: Vec<String>) -> Result<()> {
    let source = session
        .client
        .tag(ImageTagRequest {
            image: reference.clone(),
            tags: tags.clone(),
        })
        .await
        .with_context(|| format!("Failed to tag {}", reference))?
        .into_inner()
        .image;
    let source = source.map(|i| i.name).unwrap_or(reference);
    for tag in tags {
        println!("{}", format!("✓ Tagged {} as {}", source, tag).green());
    }
    Ok(())
}

async fn remove(mut session: BuilderSession, references: Vec<String>) -> Result<()> {
    for reference in references {
        session
            .client
            .remove(ImageRemoveRequest {
                image: Some(ImageSpec {
                    image: reference.clone(),
                    annotations: HashMap::new(),
                }),
            })
            .await
            .with_context(|| format!("Failed to remove {}", reference))?;
        println!("{}", format!("✓ Removed {}", reference).green());
    }
    Ok(())
}

fn pull_annotations(platform: Option<String>, backend: Option<String>) -> HashMap<String, String> {
    let mut annotations = HashMap::new();
    if let Some(platform) = platform.filter(|p| !p.is_empty()) {
        annotations.insert(PULL_PLATFORM_ANNOTATION.to_string(), platform);
    }
    if let Some(backend) = backend.filter(|b| !b.is_empty()) {
        annotations.insert(PULL_BACKEND_ANNOTATION.to_string(), backend);
    }
    annotations
}

fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes.max(0), UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn created(image: &Image) -> String {
    image
        .created_at
        .as_ref()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.seconds, u32::try_from(ts.nanos).unwrap_or(0)))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
