// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agent Configuration Types
//
// Defines the configuration schema for the builder agent, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Listener and TLS material locations
// - Content store backend and the build executor's namespace
// - Content synchronization and progress tracking timings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::builder::{
    DEFAULT_AGENT_PORT, DEFAULT_BUILDKIT_NAMESPACE, K3S_CONTAINERD_SOCKET, SERVABLE_NAMESPACE,
};

pub const API_VERSION: &str = "kiln.dev/v1";
pub const KIND: &str = "AgentConfig";

/// Top-level Kubernetes-style agent configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigManifest {
    /// API version (must be "kiln.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "AgentConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: AgentConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigSpec {
    /// Port the Images service listens on
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    #[serde(default)]
    pub buildkit: BuildkitConfig,

    #[serde(default)]
    pub content: ContentConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildkitConfig {
    /// Content namespace the build executor writes into
    #[serde(default = "default_buildkit_namespace")]
    pub namespace: String,
}

/// Where the agent's content namespaces live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// The node's containerd, shared with the build executor and the kubelet
    #[default]
    Containerd,
    /// Private directories under `content.root`; nothing else on the node
    /// sees them
    Local,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "containerd" => Ok(StoreBackend::Containerd),
            "local" => Ok(StoreBackend::Local),
            other => Err(format!("unknown content backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_containerd_socket")]
    pub containerd_socket: String,

    /// Namespace images are served from
    #[serde(default = "default_servable_namespace")]
    pub servable_namespace: String,

    /// Root of the on-disk store when `backend` is `local`
    #[serde(default = "default_content_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ceiling for one image's content to become available
    #[serde(default = "default_sync_wait_seconds")]
    pub wait_timeout_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// How long a progress stream waits for its job to appear
    #[serde(default = "default_grace_seconds")]
    pub grace_period_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

impl SyncConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ProgressConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_buildkit_namespace() -> String {
    DEFAULT_BUILDKIT_NAMESPACE.to_string()
}

fn default_containerd_socket() -> String {
    K3S_CONTAINERD_SOCKET.to_string()
}

fn default_servable_namespace() -> String {
    SERVABLE_NAMESPACE.to_string()
}

fn default_content_root() -> PathBuf {
    PathBuf::from("/var/lib/kiln/content")
}

fn default_sync_wait_seconds() -> u64 {
    180
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_grace_seconds() -> u64 {
    15
}

impl Default for BuildkitConfig {
    fn default() -> Self {
        Self {
            namespace: default_buildkit_namespace(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            containerd_socket: default_containerd_socket(),
            servable_namespace: default_servable_namespace(),
            root: default_content_root(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_timeout_seconds: default_sync_wait_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for AgentConfigSpec {
    fn default() -> Self {
        Self {
            agent_port: default_agent_port(),
            buildkit: BuildkitConfig::default(),
            content: ContentConfig::default(),
            sync: SyncConfig::default(),
            progress: ProgressConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for AgentConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname_or_default(),
                labels: None,
            },
            spec: AgentConfigSpec::default(),
        }
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "kiln-agent".to_string())
}

impl AgentConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Discover configuration file location
    /// Priority: KILN_CONFIG_PATH > ./kiln-config.yaml > ~/.kiln/config.yaml > /etc/kiln/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("KILN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./kiln-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".kiln").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/kiln/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("KILN_AGENT_PORT") {
            tracing::info!("Environment override: KILN_AGENT_PORT={}", port);
            self.spec.agent_port = port;
        }
        if let Some(backend) = env_parse::<StoreBackend>("KILN_CONTENT_BACKEND") {
            tracing::info!("Environment override: KILN_CONTENT_BACKEND={:?}", backend);
            self.spec.content.backend = backend;
        }
        if let Ok(socket) = std::env::var("KILN_CONTAINERD_SOCKET") {
            if !socket.is_empty() {
                self.spec.content.containerd_socket = socket;
            }
        }
        if let Some(secs) = env_parse::<u64>("KILN_SYNC_WAIT_SECONDS") {
            tracing::info!("Environment override: KILN_SYNC_WAIT_SECONDS={}", secs);
            self.spec.sync.wait_timeout_seconds = secs;
        }
        if let Some(secs) = env_parse::<u64>("KILN_PROGRESS_GRACE_SECONDS") {
            tracing::info!("Environment override: KILN_PROGRESS_GRACE_SECONDS={}", secs);
            self.spec.progress.grace_period_seconds = secs;
        }
        if let Ok(root) = std::env::var("KILN_CONTENT_ROOT") {
            if !root.is_empty() {
                self.spec.content.root = PathBuf::from(root);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.agent_port == 0 {
            anyhow::bail!("spec.agent_port must be non-zero");
        }

        if self.spec.content.backend == StoreBackend::Containerd
            && self.spec.content.containerd_socket.is_empty()
        {
            anyhow::bail!("spec.content.containerd_socket is required for the containerd backend");
        }

        if self.spec.buildkit.namespace == self.spec.content.servable_namespace {
            anyhow::bail!(
                "spec.buildkit.namespace must differ from spec.content.servable_namespace (both '{}')",
                self.spec.buildkit.namespace
            );
        }

        if self.spec.sync.wait_timeout_seconds == 0 {
            anyhow::bail!("spec.sync.wait_timeout_seconds must be positive");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Invalid value for {}: '{}'. Ignoring.", key, raw);
            None
        }
    }
}
