// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry credentials stored as a `kubernetes.io/dockerconfigjson` secret
//! in the builder namespace.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::retry::{retry_on_conflict, ConflictRetry};
use crate::domain::builder::{DOCKER_CONFIG_SECRET, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::domain::cluster::{ClusterError, ClusterStore, ObjectMeta, SecretRecord, SecretType};
use crate::domain::transfer::{AuthConfig, DEFAULT_REGISTRY};

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Key under which Docker Hub credentials are filed.
pub const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfigJson {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfigEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
}

impl DockerConfigEntry {
    pub fn new(username: &str, password: &str) -> Self {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        Self {
            username: username.to_string(),
            password: password.to_string(),
            auth,
        }
    }
}

impl DockerConfigJson {
    fn decode(secret: &SecretRecord) -> Result<Self, ClusterError> {
        match secret.data.get(DOCKER_CONFIG_JSON_KEY) {
            Some(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| ClusterError::Serialization(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        serde_json::to_vec(self).map_err(|e| ClusterError::Serialization(e.to_string()))
    }

    /// Entry for `registry`, trying the bare host and its URL forms.
    pub fn lookup(&self, registry: &str) -> Option<&DockerConfigEntry> {
        if registry == DEFAULT_REGISTRY || registry == "index.docker.io" {
            if let Some(entry) = self.auths.get(DOCKER_HUB_INDEX) {
                return Some(entry);
            }
        }
        self.auths.get(registry).or_else(|| {
            self.auths.iter().find_map(|(server, entry)| {
                let host = server
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .split('/')
                    .next()
                    .unwrap_or_default();
                (host == registry).then_some(entry)
            })
        })
    }
}

/// Normalize a login server argument: Docker Hub aliases map to its index URL.
pub fn login_server(server: &str) -> String {
    match server.trim_end_matches('/') {
        "" | "docker.io" | "index.docker.io" | "registry-1.docker.io" | "https://index.docker.io/v1" => {
            DOCKER_HUB_INDEX.to_string()
        }
        other => other.to_string(),
    }
}

pub struct RegistryLogin {
    store: Arc<dyn ClusterStore>,
    retry: ConflictRetry,
}

impl RegistryLogin {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            retry: ConflictRetry::default(),
        }
    }

    /// Upsert the credentials for `server`, keeping entries for other servers.
    pub async fn login(
        &self,
        namespace: &str,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClusterError> {
        let server = login_server(server);
        let entry = DockerConfigEntry::new(username, password);
        let store = &self.store;
        let (server, entry) = (&server, &entry);
        retry_on_conflict(self.retry, move || async move {
            match store.get_secret(namespace, DOCKER_CONFIG_SECRET).await {
                Ok(mut secret) => {
                    let mut config = DockerConfigJson::decode(&secret)?;
                    config.auths.insert(server.clone(), entry.clone());
                    secret.secret_type = SecretType::DockerConfigJson;
                    secret.data.insert(DOCKER_CONFIG_JSON_KEY.to_string(), config.encode()?);
                    store.update_secret(&secret).await.map(|_| ())
                }
                Err(e) if e.is_not_found() => {
                    let mut config = DockerConfigJson::default();
                    config.auths.insert(server.clone(), entry.clone());
                    let mut data = BTreeMap::new();
                    data.insert(DOCKER_CONFIG_JSON_KEY.to_string(), config.encode()?);
                    let secret = SecretRecord {
                        meta: ObjectMeta::namespaced(namespace, DOCKER_CONFIG_SECRET)
                            .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE),
                        secret_type: SecretType::DockerConfigJson,
                        data,
                    };
                    store.create_secret(&secret).await.map(|_| ())
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        info!(server = %server, "Stored registry credentials");
        Ok(())
    }

    /// Credentials for `registry`, or `None` when nothing is stored.
    pub async fn credentials(
        &self,
        namespace: &str,
        registry: &str,
    ) -> Result<Option<AuthConfig>, ClusterError> {
        let secret = match self.store.get_secret(namespace, DOCKER_CONFIG_SECRET).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                debug!("No registry credentials stored");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let config = DockerConfigJson::decode(&secret)?;
        Ok(config.lookup(registry).map(|entry| AuthConfig {
            username: entry.username.clone(),
            password: entry.password.clone(),
            auth: entry.auth.clone(),
            server_address: registry.to_string(),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::NamespaceRecord;
    use crate::infrastructure::cluster::MemoryClusterStore;

    async fn setup() -> (MemoryClusterStore, RegistryLogin) {
        let store = MemoryClusterStore::new();
        store
            .create_namespace(&NamespaceRecord {
                meta: ObjectMeta::named("kube-image"),
            })
            .await
            .unwrap();
        let login = RegistryLogin::new(Arc::new(store.clone()));
        (store, login)
    }

    #[tokio::test]
    async fn test_login_creates_then_merges() {
        let (store, login) = setup().await;
        login.login("kube-image", "docker.io", "bob", "hunter2").await.unwrap();
        login
            .login("kube-image", "registry.example", "alice", "s3cret")
            .await
            .unwrap();

        let secret = store.get_secret("kube-image", DOCKER_CONFIG_SECRET).await.unwrap();
        assert_eq!(secret.secret_type, SecretType::DockerConfigJson);
        let config = DockerConfigJson::decode(&secret).unwrap();
        assert_eq!(config.auths.len(), 2);
        assert_eq!(config.auths[DOCKER_HUB_INDEX].username, "bob");
        assert_eq!(
            config.auths["registry.example"].auth,
            base64::engine::general_purpose::STANDARD.encode("alice:s3cret")
        );
    }

    #[tokio::test]
    async fn test_credentials_by_registry_host() {
        let (_store, login) = setup().await;
        assert!(login.credentials("kube-image", "docker.io").await.unwrap().is_none());

        login.login("kube-image", "docker.io", "bob", "hunter2").await.unwrap();
        login
            .login("kube-image", "https://registry.example/v2/", "alice", "s3cret")
            .await
            .unwrap();

        let hub = login.credentials("kube-image", "docker.io").await.unwrap().unwrap();
        assert_eq!(hub.credentials(), Some(("bob".into(), "hunter2".into())));

        let private = login
            .credentials("kube-image", "registry.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(private.username, "alice");
        assert!(login.credentials("kube-image", "quay.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_retries_conflicts() {
        let (store, login) = setup().await;
        login.login("kube-image", "docker.io", "bob", "one").await.unwrap();
        store.inject_conflicts("secret", DOCKER_CONFIG_SECRET, 2);
        login.login("kube-image", "docker.io", "bob", "two").await.unwrap();

        let auth = login.credentials("kube-image", "docker.io").await.unwrap().unwrap();
        assert_eq!(auth.password, "two");
    }
}
