//! In-memory model of the kubeconfig credential store.
//!
//! The store is a snapshot of four sections (clusters, users, contexts and the
//! current context). Mutating operations never touch `self`; they return a new
//! snapshot, so the only side effect is [`CredentialStore::save`], which
//! replaces the whole file.
//!
//! Fields this crate does not model are kept in `extra` maps and written back
//! untouched, so entries that belong to other installations survive a round
//! trip.

pub mod naming;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::Result;

const API_VERSION: &str = "v1";
const KIND: &str = "Config";

/// Name of the auth provider used for OIDC sessions.
pub const OIDC_AUTH_PROVIDER: &str = "oidc";

/// Keys of the OIDC auth provider config map.
pub mod oidc_keys {
    pub const CLIENT_ID: &str = "client-id";
    pub const CLIENT_SECRET: &str = "client-secret";
    pub const ID_TOKEN: &str = "id-token";
    pub const ISSUER: &str = "idp-issuer-url";
    pub const REFRESH_TOKEN: &str = "refresh-token";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// Base64 encoded PEM bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthProviderConfig {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl AuthProviderConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<AuthProviderConfig>,
    /// Base64 encoded PEM certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// Base64 encoded PEM key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// How a context authenticates against its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    AuthProvider,
    Token,
    ClientCertificate,
    Unknown,
}

/// A context together with the cluster and user it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntries {
    pub context_name: String,
    pub cluster_name: String,
    pub user_name: String,
    pub cluster: ClusterEntry,
    pub user: UserEntry,
}

/// Result of [`CredentialStore::upsert`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub store: CredentialStore,
    /// Whether the context was already present before the upsert.
    pub existed: bool,
}

/// Broken references inside a store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    #[error("context '{context}' does not exist")]
    MissingContext { context: String },

    #[error("context '{context}' references missing cluster '{cluster}'")]
    MissingCluster { context: String, cluster: String },

    #[error("context '{context}' references missing user '{user}'")]
    MissingUser { context: String, user: String },

    #[error("current context '{context}' does not exist")]
    MissingCurrentContext { context: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoreFile", into = "StoreFile")]
pub struct CredentialStore {
    pub clusters: BTreeMap<String, ClusterEntry>,
    pub users: BTreeMap<String, UserEntry>,
    pub contexts: BTreeMap<String, ContextEntry>,
    pub current_context: Option<String>,
    extra: BTreeMap<String, Value>,
}

impl CredentialStore {
    /// Load the store at `path`. A missing or empty file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "kubeconfig does not exist yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Replace the file at `path` with this snapshot.
    ///
    /// The content goes to a temporary file in the same directory which is
    /// then renamed over the destination.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(yaml.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), "kubeconfig written");
        Ok(())
    }

    pub fn context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts.get(name)
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref().filter(|c| !c.is_empty())
    }

    pub fn cluster_for_context(&self, name: &str) -> Option<&ClusterEntry> {
        self.context(name)
            .and_then(|context| self.clusters.get(&context.cluster))
    }

    pub fn user_for_context(&self, name: &str) -> Option<&UserEntry> {
        self.context(name).and_then(|context| self.users.get(&context.user))
    }

    pub fn auth_provider(&self, context: &str) -> Option<&AuthProviderConfig> {
        self.user_for_context(context)
            .and_then(|user| user.auth_provider.as_ref())
    }

    pub fn auth_type(&self, context: &str) -> AuthType {
        match self.user_for_context(context) {
            Some(user) if user.auth_provider.is_some() => AuthType::AuthProvider,
            Some(user) if user.token.as_deref().is_some_and(|t| !t.is_empty()) => AuthType::Token,
            Some(user) if user.client_certificate_data.is_some() => AuthType::ClientCertificate,
            _ => AuthType::Unknown,
        }
    }

    /// Insert or overwrite the cluster, user and context named in `entries`.
    ///
    /// Modeled fields of existing entries are replaced, unmodeled fields are
    /// kept. Names never accumulate: re-running with the same entries yields
    /// the same store.
    pub fn upsert(&self, entries: &StoreEntries, select: bool) -> Upserted {
        let mut store = self.clone();

        let cluster = match store.clusters.remove(&entries.cluster_name) {
            Some(existing) => ClusterEntry {
                extra: merged(existing.extra, &entries.cluster.extra),
                ..entries.cluster.clone()
            },
            None => entries.cluster.clone(),
        };
        store.clusters.insert(entries.cluster_name.clone(), cluster);

        let user = match store.users.remove(&entries.user_name) {
            Some(existing) => UserEntry {
                extra: merged(existing.extra, &entries.user.extra),
                ..entries.user.clone()
            },
            None => entries.user.clone(),
        };
        store.users.insert(entries.user_name.clone(), user);

        let existing = store.contexts.remove(&entries.context_name);
        let existed = existing.is_some();
        let context = match existing {
            Some(existing) => ContextEntry {
                cluster: entries.cluster_name.clone(),
                user: entries.user_name.clone(),
                namespace: existing.namespace,
                extra: existing.extra,
            },
            None => ContextEntry {
                cluster: entries.cluster_name.clone(),
                user: entries.user_name.clone(),
                ..ContextEntry::default()
            },
        };
        store.contexts.insert(entries.context_name.clone(), context);

        if select {
            store.current_context = Some(entries.context_name.clone());
        }

        Upserted { store, existed }
    }

    /// A store holding only `entries`, with the context selected.
    pub fn standalone(entries: &StoreEntries) -> Self {
        Self::default().upsert(entries, true).store
    }

    pub fn with_current_context(&self, name: &str) -> Self {
        let mut store = self.clone();
        store.current_context = Some(name.to_string());
        store
    }

    pub fn with_user(&self, name: &str, user: UserEntry) -> Self {
        let mut store = self.clone();
        store.users.insert(name.to_string(), user);
        store
    }

    /// Check that `context` exists and references existing entries.
    pub fn validate_context(&self, context: &str) -> std::result::Result<(), Inconsistency> {
        let Some(entry) = self.context(context) else {
            return Err(Inconsistency::MissingContext {
                context: context.to_string(),
            });
        };
        if !self.clusters.contains_key(&entry.cluster) {
            return Err(Inconsistency::MissingCluster {
                context: context.to_string(),
                cluster: entry.cluster.clone(),
            });
        }
        if !self.users.contains_key(&entry.user) {
            return Err(Inconsistency::MissingUser {
                context: context.to_string(),
                user: entry.user.clone(),
            });
        }
        Ok(())
    }

    /// Every broken reference in the store.
    pub fn validate(&self) -> Vec<Inconsistency> {
        let mut problems: Vec<Inconsistency> = self
            .contexts
            .keys()
            .filter_map(|name| self.validate_context(name).err())
            .collect();

        if let Some(current) = self.current_context() {
            if !self.has_context(current) {
                problems.push(Inconsistency::MissingCurrentContext {
                    context: current.to_string(),
                });
            }
        }
        problems
    }
}

fn merged(mut base: BTreeMap<String, Value>, overrides: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    base.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    base
}

// On-disk layout, with named lists instead of maps.

#[derive(Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    #[serde(default)]
    cluster: ClusterEntry,
}

#[derive(Serialize, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Serialize, Deserialize)]
struct NamedContext {
    name: String,
    #[serde(default)]
    context: ContextEntry,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    api_version: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    clusters: Option<Vec<NamedCluster>>,
    #[serde(default)]
    users: Option<Vec<NamedUser>>,
    #[serde(default)]
    contexts: Option<Vec<NamedContext>>,
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

impl From<StoreFile> for CredentialStore {
    fn from(file: StoreFile) -> Self {
        Self {
            clusters: file
                .clusters
                .unwrap_or_default()
                .into_iter()
                .map(|c| (c.name, c.cluster))
                .collect(),
            users: file
                .users
                .unwrap_or_default()
                .into_iter()
                .map(|u| (u.name, u.user))
                .collect(),
            contexts: file
                .contexts
                .unwrap_or_default()
                .into_iter()
                .map(|c| (c.name, c.context))
                .collect(),
            current_context: file.current_context.filter(|c| !c.is_empty()),
            extra: file.extra,
        }
    }
}

impl From<CredentialStore> for StoreFile {
    fn from(store: CredentialStore) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            clusters: Some(
                store
                    .clusters
                    .into_iter()
                    .map(|(name, cluster)| NamedCluster { name, cluster })
                    .collect(),
            ),
            users: Some(
                store
                    .users
                    .into_iter()
                    .map(|(name, user)| NamedUser { name, user })
                    .collect(),
            ),
            contexts: Some(
                store
                    .contexts
                    .into_iter()
                    .map(|(name, context)| NamedContext { name, context })
                    .collect(),
            ),
            current_context: Some(store.current_context.unwrap_or_default()),
            extra: store.extra,
        }
    }
}
