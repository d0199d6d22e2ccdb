// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builder desired state, well-known names and container-runtime detection.

use std::fmt;

pub const DEFAULT_NAMESPACE: &str = "kube-image";
pub const BUILDER_NAME: &str = "builder";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kiln";
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const APP_NAME: &str = "kiln";
pub const BUILDER_ROLE_LABEL: &str = "node-role.kubernetes.io/builder";

pub const K3S_HOSTNAME_LABEL: &str = "k3s.io/hostname";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub const CA_SECRET: &str = "kiln-tls-ca";
pub const SERVER_SECRET: &str = "kiln-tls-server";
pub const CLIENT_SECRET: &str = "kiln-tls-client";
pub const DOCKER_CONFIG_SECRET: &str = "kiln-docker-config";

pub const BUILDKIT_PORT_NAME: &str = "buildkit";
pub const AGENT_PORT_NAME: &str = "kiln";

pub const DEFAULT_AGENT_PORT: u16 = 1233;
pub const DEFAULT_BUILDKIT_PORT: u16 = 1234;
pub const DEFAULT_AGENT_IMAGE: &str = "docker.io/kiln/kiln";
pub const DEFAULT_BUILDKIT_IMAGE: &str = "docker.io/moby/buildkit:v0.8.1";
pub const DEFAULT_BUILDKIT_SOCKET: &str = "unix:///run/buildkit/buildkitd.sock";
pub const DEFAULT_BUILDKIT_NAMESPACE: &str = "buildkit";
pub const SERVABLE_NAMESPACE: &str = "k8s.io";

pub const K3S_CONTAINERD_SOCKET: &str = "/run/k3s/containerd/containerd.sock";
pub const K3S_CONTAINERD_VOLUME: &str = "/var/lib/rancher/k3s/agent/containerd";
pub const STOCK_CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const STOCK_CONTAINERD_VOLUME: &str = "/var/lib/containerd";

/// Annotation on the builder service that replaces the endpoint host.
pub const ENDPOINT_OVERRIDE_ANNOTATION: &str = "images.kiln.dev/endpoint-override";

/// What the operator asked `install` to converge on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDesiredState {
    pub namespace: String,
    pub node_selector: String,
    pub force: bool,
    pub no_wait: bool,
    pub no_fail: bool,
    pub agent_port: u16,
    pub build_port: u16,
    pub build_socket_path: String,
    /// Inferred from the node's runtime when unset
    pub content_store_socket_path: Option<String>,
    /// Inferred from the node's runtime when unset
    pub content_store_volume_path: Option<String>,
    pub agent_image: Option<String>,
    pub buildkit_image: Option<String>,
}

impl Default for BuilderDesiredState {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            node_selector: String::new(),
            force: false,
            no_wait: false,
            no_fail: false,
            agent_port: DEFAULT_AGENT_PORT,
            build_port: DEFAULT_BUILDKIT_PORT,
            build_socket_path: DEFAULT_BUILDKIT_SOCKET.to_string(),
            content_store_socket_path: None,
            content_store_volume_path: None,
            agent_image: None,
            buildkit_image: None,
        }
    }
}

impl BuilderDesiredState {
    /// Agent image, tagged with this crate's version when no override is set.
    pub fn agent_image(&self) -> String {
        match &self.agent_image {
            Some(image) if !image.is_empty() => image.clone(),
            _ => format!(
                "{}:v{}",
                DEFAULT_AGENT_IMAGE,
                env!("CARGO_PKG_VERSION").replace('+', "-")
            ),
        }
    }

    pub fn buildkit_image(&self) -> String {
        match &self.buildkit_image {
            Some(image) if !image.is_empty() => image.clone(),
            _ => DEFAULT_BUILDKIT_IMAGE.to_string(),
        }
    }
}

/// Container runtime families the builder can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    /// containerd embedded in k3s
    EmbeddedContainerd,
    /// stand-alone containerd
    StockContainerd,
}

impl RuntimeFamily {
    /// Detect from a node's `scheme://version` runtime string.
    pub fn detect(container_runtime_version: &str) -> Result<Self, UnsupportedRuntime> {
        let (scheme, version) = container_runtime_version
            .split_once("://")
            .unwrap_or((container_runtime_version, ""));
        match scheme {
            "containerd" if version.contains("-k3s") => Ok(RuntimeFamily::EmbeddedContainerd),
            "containerd" => Ok(RuntimeFamily::StockContainerd),
            other => Err(UnsupportedRuntime(other.to_string())),
        }
    }

    pub fn default_socket(&self) -> &'static str {
        match self {
            RuntimeFamily::EmbeddedContainerd => K3S_CONTAINERD_SOCKET,
            RuntimeFamily::StockContainerd => STOCK_CONTAINERD_SOCKET,
        }
    }

    pub fn default_volume(&self) -> &'static str {
        match self {
            RuntimeFamily::EmbeddedContainerd => K3S_CONTAINERD_VOLUME,
            RuntimeFamily::StockContainerd => STOCK_CONTAINERD_VOLUME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("container runtime `{0}` not supported")]
pub struct UnsupportedRuntime(pub String);

/// Content-store paths resolved for the selected node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentStorePaths {
    pub socket: String,
    pub volume: String,
}

impl fmt::Display for ContentStorePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket={} volume={}", self.socket, self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_runtime_families() {
        assert_eq!(
            RuntimeFamily::detect("containerd://1.4.3-k3s1").unwrap(),
            RuntimeFamily::EmbeddedContainerd
        );
        assert_eq!(
            RuntimeFamily::detect("containerd://1.6.8").unwrap(),
            RuntimeFamily::StockContainerd
        );
        let err = RuntimeFamily::detect("docker://20.10.7").unwrap_err();
        assert_eq!(err.to_string(), "container runtime `docker` not supported");
    }

    #[test]
    fn test_default_images() {
        let state = BuilderDesiredState::default();
        assert!(state.agent_image().starts_with("docker.io/kiln/kiln:v"));
        assert_eq!(state.buildkit_image(), DEFAULT_BUILDKIT_IMAGE);

        let custom = BuilderDesiredState {
            agent_image: Some("registry.local/kiln:dev".into()),
            ..Default::default()
        };
        assert_eq!(custom.agent_image(), "registry.local/kiln:dev");
    }
}
