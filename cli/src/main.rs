// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # kiln
//!
//! Operator CLI for the kiln remote image builder, and the entry point of
//! the agent that runs beside buildkitd on the builder node.
//!
//! ## Commands
//!
//! - `kiln builder install|uninstall|login` - Reconcile the builder on a cluster
//! - `kiln image ls|pull|push|tag|rm` - Image operations against the builder
//! - `kiln agent` - Serve the Images API (runs inside the builder pod)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kiln::cluster::ClusterArgs;
use kiln::commands::{self, AgentArgs, BuilderCommand, ImageCommand};
use kiln_core::domain::builder::DEFAULT_NAMESPACE;

/// kiln - build and serve container images inside a Kubernetes cluster
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Namespace the builder lives in
    #[arg(
        short,
        long,
        global = true,
        env = "KILN_NAMESPACE",
        default_value = DEFAULT_NAMESPACE
    )]
    namespace: String,

    /// Path to the kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG", value_name = "FILE")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true, env = "KILN_CONTEXT")]
    context: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "KILN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the builder installation
    #[command(name = "builder")]
    Builder {
        #[command(subcommand)]
        command: BuilderCommand,
    },

    /// Image operations against the builder
    #[command(name = "image")]
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },

    /// Run the builder agent
    #[command(name = "agent")]
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let cluster = ClusterArgs {
        namespace: cli.namespace,
        kubeconfig: cli.kubeconfig,
        context: cli.context,
    };

    match cli.command {
        Commands::Builder { command } => commands::builder::handle_command(command, &cluster).await,
        Commands::Image { command } => commands::image::handle_command(command, &cluster).await,
        Commands::Agent(args) => commands::agent::run(args).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}
