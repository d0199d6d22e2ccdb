// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builder lifecycle commands
//!
//! Commands: install, uninstall, login

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::io::BufRead;
use std::sync::Arc;
use tracing::info;

use kiln_core::application::install::Installer;
use kiln_core::application::login::RegistryLogin;
use kiln_core::application::uninstall::Uninstaller;
use kiln_core::domain::builder::{
    BuilderDesiredState, DEFAULT_AGENT_PORT, DEFAULT_BUILDKIT_PORT, DEFAULT_BUILDKIT_SOCKET,
};
use kiln_core::infrastructure::pki::RcgenIssuer;

use crate::cluster::{cancel_on_ctrl_c, ClusterArgs};

#[derive(Subcommand)]
pub enum BuilderCommand {
    /// Install the builder onto a node
    Install(InstallArgs),

    /// Remove the builder and its namespace
    Uninstall {
        /// Delete the namespace even if kiln does not manage it
        #[arg(short, long)]
        force: bool,
    },

    /// Store registry credentials for push and pull
    Login {
        /// Registry server, e.g. docker.io
        #[arg(value_name = "SERVER")]
        server: String,

        #[arg(short, long)]
        username: String,

        #[arg(short, long, conflicts_with = "password_stdin")]
        password: Option<String>,

        /// Read the password from stdin
        #[arg(long)]
        password_stdin: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Label selector picking the builder node
    #[arg(short, long, default_value = "")]
    selector: String,

    /// Replace existing resources
    #[arg(short, long)]
    force: bool,

    /// Return without waiting for the builder to become ready
    #[arg(long)]
    no_wait: bool,

    /// Log failing steps and keep going
    #[arg(long)]
    no_fail: bool,

    #[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    #[arg(long, default_value_t = DEFAULT_BUILDKIT_PORT)]
    build_port: u16,

    #[arg(long, default_value = DEFAULT_BUILDKIT_SOCKET)]
    buildkit_socket: String,

    /// Inferred from the node's container runtime when unset
    #[arg(long)]
    containerd_socket: Option<String>,

    /// Inferred from the node's container runtime when unset
    #[arg(long)]
    containerd_volume: Option<String>,

    #[arg(long, env = "KILN_AGENT_IMAGE")]
    agent_image: Option<String>,

    #[arg(long, env = "KILN_BUILDKIT_IMAGE")]
    buildkit_image: Option<String>,
}

impl InstallArgs {
    pub fn desired_state(&self, namespace: &str) -> BuilderDesiredState {
        BuilderDesiredState {
            namespace: namespace.to_string(),
            node_selector: self.selector.clone(),
            force: self.force,
            no_wait: self.no_wait,
            no_fail: self.no_fail,
            agent_port: self.agent_port,
            build_port: self.build_port,
            build_socket_path: self.buildkit_socket.clone(),
            content_store_socket_path: self.containerd_socket.clone(),
            content_store_volume_path: self.containerd_volume.clone(),
            agent_image: self.agent_image.clone(),
            buildkit_image: self.buildkit_image.clone(),
        }
    }
}

pub async fn handle_command(command: BuilderCommand, cluster: &ClusterArgs) -> Result<()> {
    match command {
        BuilderCommand::Install(args) => install(args, cluster).await,
        BuilderCommand::Uninstall { force } => uninstall(force, cluster).await,
        BuilderCommand::Login {
            server,
            username,
            password,
            password_stdin,
        } => login(server, username, password, password_stdin, cluster).await,
    }
}

async fn install(args: InstallArgs, cluster: &ClusterArgs) -> Result<()> {
    let store = cluster.connect().await?;
    let desired = args.desired_state(&cluster.namespace);
    let cancel = cancel_on_ctrl_c();

    let outcome = Installer::new(store, Arc::new(RcgenIssuer::new()))
        .install(&desired, &cancel)
        .await
        .context("Builder install failed")?;

    if let Some(node) = &outcome.node {
        println!("{}", format!("✓ Builder role assigned to node {}", node).green());
    }
    for step in &outcome.skipped {
        println!("{}", format!("⚠ Step `{}` failed and was skipped", step).yellow());
    }
    match &outcome.status {
        Some(status) => println!(
            "{}",
            format!("✓ Builder ready ({} ready, {} available)", status.number_ready, status.number_available)
                .green()
        ),
        None if desired.no_wait => println!("Builder installed; not waiting for readiness."),
        None => {}
    }
    Ok(())
}

async fn uninstall(force: bool, cluster: &ClusterArgs) -> Result<()> {
    let store = cluster.connect().await?;
    let cancel = cancel_on_ctrl_c();

    let outcome = Uninstaller::new(store)
        .uninstall(&cluster.namespace, force, &cancel)
        .await
        .context("Builder uninstall failed")?;

    if outcome.namespace_deleted {
        println!("{}", format!("✓ Namespace {} deleted", cluster.namespace).green());
    } else {
        println!("Namespace {} was not present", cluster.namespace);
    }
    for node in &outcome.nodes_cleared {
        println!("{}", format!("✓ Builder role removed from node {}", node).green());
    }
    for node in &outcome.nodes_failed {
        println!("{}", format!("✗ Could not remove builder role from node {}", node).red());
    }
    if !outcome.nodes_failed.is_empty() {
        bail!("{} node(s) still carry the builder role", outcome.nodes_failed.len());
    }
    Ok(())
}

async fn login(
    server: String,
    username: String,
    password: Option<String>,
    password_stdin: bool,
    cluster: &ClusterArgs,
) -> Result<()> {
    let password = match (password, password_stdin) {
        (Some(password), _) => password,
        (None, true) => read_password(std::io::stdin().lock())?,
        (None, false) => dialoguer::Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    let store = cluster.connect().await?;
    RegistryLogin::new(store)
        .login(&cluster.namespace, &server, &username, &password)
        .await
        .context("Failed to store registry credentials")?;
    info!(server = %server, "Login stored");
    println!("{}", format!("✓ Login succeeded for {}", server).green());
    Ok(())
}

/// First line of `input`, without the trailing newline.
fn read_password(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: BuilderCommand,
    }

    #[test]
    fn test_install_flags_map_onto_desired_state() {
        let harness = Harness::parse_from([
            "kiln",
            "install",
            "--selector",
            "k3s.io/hostname=worker-1",
            "--no-wait",
            "--containerd-socket",
            "/run/containerd/containerd.sock",
        ]);
        let BuilderCommand::Install(args) = harness.command else {
            panic!("expected install");
        };
        let desired = args.desired_state("kube-image");
        assert_eq!(desired.node_selector, "k3s.io/hostname=worker-1");
        assert!(desired.no_wait);
        assert!(!desired.force);
        assert_eq!(desired.agent_port, 1233);
        assert_eq!(desired.build_port, 1234);
        assert_eq!(
            desired.content_store_socket_path.as_deref(),
            Some("/run/containerd/containerd.sock")
        );
        assert!(desired.content_store_volume_path.is_none());
    }

    #[test]
    fn test_password_and_stdin_conflict() {
        let parsed = Harness::try_parse_from([
            "kiln",
            "login",
            "docker.io",
            "-u",
            "bob",
            "-p",
            "x",
            "--password-stdin",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_read_password_strips_newline() {
        let password = read_password(std::io::Cursor::new("hunter2\r\nignored\n")).unwrap();
        assert_eq!(password, "hunter2");
    }
}
