//! Persisting credentials into kubeconfig files.
//!
//! Entries are either merged into the shared store or exported to a fresh
//! self-contained file. The shared store is rewritten as a whole, once per
//! persist, and only after everything it references is on disk.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use crate::installation::{workload_cluster_server, AuthSession, Installation, SessionCredential};
use crate::issuer::IssuedCredential;
use crate::kubeconfig::naming;
use crate::kubeconfig::{
    oidc_keys, AuthProviderConfig, ClusterEntry, CredentialStore, StoreEntries, UserEntry,
    OIDC_AUTH_PROVIDER,
};
use crate::{Error, Result};

const CA_FILE_EXTENSION: &str = "crt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistMode {
    /// Upsert into the shared store, selecting the context if `select`.
    Merge { select: bool },
    /// Write a new store at `path` holding only these entries.
    SelfContained { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub context: String,
    /// Whether the context was already present in the destination.
    pub existed: bool,
}

/// How a cluster entry refers to its certificate authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaSource {
    File(PathBuf),
    Embedded(Vec<u8>),
}

pub struct StoreWriter {
    store_path: PathBuf,
    cert_dir: PathBuf,
}

impl StoreWriter {
    pub fn new(store_path: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            cert_dir: cert_dir.into(),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn load(&self) -> Result<CredentialStore> {
        CredentialStore::load(&self.store_path)
    }

    pub fn save(&self, store: &CredentialStore) -> Result<()> {
        store.save(&self.store_path)
    }

    /// Make `context` the current context of the shared store.
    pub fn select(&self, context: &str) -> Result<()> {
        let store = self.load()?;
        if store.current_context() == Some(context) {
            return Ok(());
        }
        store
            .validate_context(context)
            .map_err(|_| Error::ContextDoesNotExist {
                name: context.to_string(),
            })?;
        self.save(&store.with_current_context(context))
    }

    /// `<cert dir>/<cluster>.crt`
    pub fn ca_path(&self, cluster_name: &str) -> PathBuf {
        self.cert_dir
            .join(format!("{cluster_name}.{CA_FILE_EXTENSION}"))
    }

    fn write_ca(&self, cluster_name: &str, pem: &str) -> Result<PathBuf> {
        let path = self.ca_path(cluster_name);
        std::fs::create_dir_all(&self.cert_dir)?;
        std::fs::write(&path, pem)?;
        debug!(path = %path.display(), "wrote certificate authority");
        Ok(path)
    }

    pub fn persist(&self, entries: &StoreEntries, mode: &PersistMode) -> Result<Persisted> {
        match mode {
            PersistMode::Merge { select } => {
                let upserted = self.load()?.upsert(entries, *select);
                self.save(&upserted.store)?;
                info!(
                    context = %entries.context_name,
                    path = %self.store_path.display(),
                    existed = upserted.existed,
                    "merged credentials into kubeconfig"
                );
                Ok(Persisted {
                    context: entries.context_name.clone(),
                    existed: upserted.existed,
                })
            }
            PersistMode::SelfContained { path } => {
                if path.try_exists()? {
                    return Err(Error::FileExists { path: path.clone() });
                }
                CredentialStore::standalone(entries).save(path)?;
                info!(
                    context = %entries.context_name,
                    path = %path.display(),
                    "wrote self-contained kubeconfig"
                );
                Ok(Persisted {
                    context: entries.context_name.clone(),
                    existed: false,
                })
            }
        }
    }

    /// Persist the management cluster entries of a network login.
    ///
    /// Merged entries reference the CA by file, which is written first.
    /// Self-contained exports embed it.
    pub fn persist_management(
        &self,
        installation: &Installation,
        session: &AuthSession,
        internal_api: bool,
        mode: &PersistMode,
    ) -> Result<Persisted> {
        let cluster_name = naming::management_cluster_name(&installation.codename);
        let ca = match mode {
            PersistMode::Merge { .. } => {
                CaSource::File(self.write_ca(&cluster_name, &installation.ca_cert)?)
            }
            PersistMode::SelfContained { path } => {
                if path.try_exists()? {
                    return Err(Error::FileExists { path: path.clone() });
                }
                CaSource::Embedded(installation.ca_cert.as_bytes().to_vec())
            }
        };

        let entries = management_entries(installation, session, internal_api, ca);
        self.persist(&entries, mode)
    }
}

/// Entries for a management cluster login.
pub fn management_entries(
    installation: &Installation,
    session: &AuthSession,
    internal_api: bool,
    ca: CaSource,
) -> StoreEntries {
    let codename = &installation.codename;

    let mut cluster = ClusterEntry {
        server: Some(installation.server(internal_api).to_string()),
        ..ClusterEntry::default()
    };
    match ca {
        CaSource::File(path) => {
            cluster.certificate_authority = Some(path.to_string_lossy().into_owned())
        }
        CaSource::Embedded(pem) => cluster.certificate_authority_data = Some(BASE64.encode(pem)),
    }

    let user = match &session.credential {
        SessionCredential::Token(token) => UserEntry {
            token: Some(token.clone()),
            ..UserEntry::default()
        },
        SessionCredential::Oidc {
            client_id,
            id_token,
            refresh_token,
        } => UserEntry {
            auth_provider: Some(AuthProviderConfig {
                name: OIDC_AUTH_PROVIDER.to_string(),
                config: [
                    (oidc_keys::CLIENT_ID, client_id.as_str()),
                    (oidc_keys::ID_TOKEN, id_token.as_str()),
                    (oidc_keys::ISSUER, installation.auth_url.as_str()),
                    (oidc_keys::REFRESH_TOKEN, refresh_token.as_str()),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            }),
            ..UserEntry::default()
        },
    };

    StoreEntries {
        context_name: naming::management_context_name(codename),
        cluster_name: naming::management_cluster_name(codename),
        user_name: naming::management_user_name(&session.principal, codename),
        cluster,
        user,
    }
}

/// Entries for a workload cluster client certificate.
pub fn client_cert_entries(
    management_context: &str,
    cluster: &str,
    base_domain: &str,
    issued: &IssuedCredential,
) -> StoreEntries {
    let context_name = naming::client_cert_context_name(management_context, cluster);
    StoreEntries {
        cluster_name: context_name.clone(),
        user_name: naming::client_cert_user_name(&context_name),
        cluster: ClusterEntry {
            server: Some(workload_cluster_server(cluster, base_domain)),
            certificate_authority_data: Some(BASE64.encode(&issued.ca)),
            ..ClusterEntry::default()
        },
        user: UserEntry {
            client_certificate_data: Some(BASE64.encode(&issued.certificate)),
            client_key_data: Some(BASE64.encode(&issued.key)),
            ..UserEntry::default()
        },
        context_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fakes::credential;
    use crate::kubeconfig::AuthType;

    const EXISTING: &str = indoc::indoc! {r#"
        apiVersion: v1
        kind: Config
        clusters:
        - name: kind-dev
          cluster:
            server: https://127.0.0.1:6443
        users:
        - name: kind-dev
          user:
            token: abc
        contexts:
        - name: kind-dev
          context:
            cluster: kind-dev
            user: kind-dev
        current-context: kind-dev
    "#};

    fn installation() -> Installation {
        Installation {
            codename: "demo".to_string(),
            api_url: "https://g8s.demo.example.io".to_string(),
            internal_api_url: "https://internal-g8s.demo.example.io".to_string(),
            ca_cert: "-----BEGIN CERTIFICATE-----\nmc\n-----END CERTIFICATE-----\n".to_string(),
            auth_url: "https://dex.g8s.demo.example.io".to_string(),
            provider: "aws".to_string(),
        }
    }

    fn session() -> AuthSession {
        AuthSession {
            principal: "jane".to_string(),
            email: None,
            credential: SessionCredential::Token("t0ken".to_string()),
        }
    }

    fn writer(dir: &Path) -> StoreWriter {
        let store_path = dir.join("config");
        std::fs::write(&store_path, EXISTING).unwrap();
        StoreWriter::new(store_path, dir.join("certs"))
    }

    #[test]
    fn merge_twice_keeps_one_triple() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let entries = client_cert_entries("gs-demo", "w1cluster", "demo.example.io", &credential());

        let first = writer
            .persist(&entries, &PersistMode::Merge { select: true })
            .unwrap();
        let second = writer
            .persist(&entries, &PersistMode::Merge { select: true })
            .unwrap();
        assert!(!first.existed);
        assert!(second.existed);
        assert_eq!(first.context, "gs-demo-w1cluster-clientcert");

        let store = writer.load().unwrap();
        assert_eq!(store.contexts.len(), 2);
        assert_eq!(store.clusters.len(), 2);
        assert_eq!(store.users.len(), 2);
        assert_eq!(store.current_context(), Some("gs-demo-w1cluster-clientcert"));
        assert!(store.has_context("kind-dev"));
        assert!(store.validate().is_empty());
    }

    #[test]
    fn merge_without_select_keeps_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let entries = client_cert_entries("gs-demo", "w1cluster", "demo.example.io", &credential());

        writer
            .persist(&entries, &PersistMode::Merge { select: false })
            .unwrap();
        assert_eq!(writer.load().unwrap().current_context(), Some("kind-dev"));

        writer.select("gs-demo-w1cluster-clientcert").unwrap();
        assert_eq!(
            writer.load().unwrap().current_context(),
            Some("gs-demo-w1cluster-clientcert")
        );
        assert!(matches!(
            writer.select("gs-missing"),
            Err(Error::ContextDoesNotExist { .. })
        ));
    }

    #[test]
    fn self_contained_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let destination = dir.path().join("exported");
        std::fs::write(&destination, "do not touch").unwrap();
        let before = std::fs::read(writer.store_path()).unwrap();

        let entries = client_cert_entries("gs-demo", "w1cluster", "demo.example.io", &credential());
        let err = writer
            .persist(
                &entries,
                &PersistMode::SelfContained {
                    path: destination.clone(),
                },
            )
            .unwrap_err();

        assert!(matches!(err, Error::FileExists { .. }));
        assert_eq!(std::fs::read(&destination).unwrap(), b"do not touch");
        assert_eq!(std::fs::read(writer.store_path()).unwrap(), before);
    }

    #[test]
    fn self_contained_leaves_shared_store_alone() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let destination = dir.path().join("exported");
        let before = std::fs::read(writer.store_path()).unwrap();

        let entries = client_cert_entries("gs-demo", "w1cluster", "demo.example.io", &credential());
        writer
            .persist(
                &entries,
                &PersistMode::SelfContained {
                    path: destination.clone(),
                },
            )
            .unwrap();

        assert_eq!(std::fs::read(writer.store_path()).unwrap(), before);
        let exported = CredentialStore::load(&destination).unwrap();
        assert_eq!(exported.contexts.len(), 1);
        assert_eq!(exported.current_context(), Some("gs-demo-w1cluster-clientcert"));
        assert!(exported.validate().is_empty());
    }

    #[test]
    fn management_login_writes_ca_file_first() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let persisted = writer
            .persist_management(
                &installation(),
                &session(),
                false,
                &PersistMode::Merge { select: true },
            )
            .unwrap();
        assert_eq!(persisted.context, "gs-demo");

        let ca_path = dir.path().join("certs").join("gs-demo.crt");
        assert_eq!(
            std::fs::read_to_string(&ca_path).unwrap(),
            installation().ca_cert
        );

        let store = writer.load().unwrap();
        let cluster = store.cluster_for_context("gs-demo").unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://g8s.demo.example.io"));
        assert_eq!(
            cluster.certificate_authority.as_deref(),
            Some(ca_path.to_str().unwrap())
        );
        assert_eq!(store.context("gs-demo").unwrap().user, "gs-jane-demo");
        assert_eq!(store.auth_type("gs-demo"), AuthType::Token);
    }

    #[test]
    fn unwritable_ca_aborts_before_store_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("config");
        std::fs::write(&store_path, EXISTING).unwrap();
        let blocker = dir.path().join("certs");
        std::fs::write(&blocker, "not a directory").unwrap();
        let writer = StoreWriter::new(&store_path, &blocker);

        let result = writer.persist_management(
            &installation(),
            &session(),
            true,
            &PersistMode::Merge { select: true },
        );

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(std::fs::read_to_string(&store_path).unwrap(), EXISTING);
    }

    #[test]
    fn self_contained_management_login_embeds_ca() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let destination = dir.path().join("demo.yaml");

        writer
            .persist_management(
                &installation(),
                &session(),
                true,
                &PersistMode::SelfContained {
                    path: destination.clone(),
                },
            )
            .unwrap();

        assert!(!dir.path().join("certs").exists());
        let exported = CredentialStore::load(&destination).unwrap();
        let cluster = exported.cluster_for_context("gs-demo").unwrap();
        assert_eq!(
            cluster.server.as_deref(),
            Some("https://internal-g8s.demo.example.io")
        );
        assert_eq!(
            BASE64
                .decode(cluster.certificate_authority_data.as_deref().unwrap())
                .unwrap(),
            installation().ca_cert.as_bytes()
        );
        assert_eq!(writer.load().unwrap().current_context(), Some("kind-dev"));
    }

    #[test]
    fn oidc_sessions_become_auth_providers() {
        let session = AuthSession {
            principal: "jane".to_string(),
            email: Some("jane@example.io".to_string()),
            credential: SessionCredential::Oidc {
                client_id: "client".to_string(),
                id_token: "id".to_string(),
                refresh_token: "refresh".to_string(),
            },
        };
        let entries = management_entries(
            &installation(),
            &session,
            false,
            CaSource::File(PathBuf::from("/tmp/gs-demo.crt")),
        );

        let provider = entries.user.auth_provider.unwrap();
        assert_eq!(provider.name, "oidc");
        assert_eq!(provider.get(oidc_keys::ISSUER), Some("https://dex.g8s.demo.example.io"));
        assert_eq!(provider.get(oidc_keys::REFRESH_TOKEN), Some("refresh"));
        assert_eq!(entries.user.token, None);
    }

    #[test]
    fn client_cert_entries_are_encoded() {
        let issued = credential();
        let entries = client_cert_entries("gs-demo", "w1cluster", "demo.example.io", &issued);

        assert_eq!(entries.cluster_name, "gs-demo-w1cluster-clientcert");
        assert_eq!(entries.user_name, "gs-demo-w1cluster-clientcert-user");
        assert_eq!(
            entries.cluster.server.as_deref(),
            Some("https://api.w1cluster.k8s.demo.example.io")
        );
        let decode = |v: &Option<String>| BASE64.decode(v.as_deref().unwrap()).unwrap();
        assert_eq!(decode(&entries.user.client_certificate_data), issued.certificate);
        assert_eq!(decode(&entries.user.client_key_data), issued.key);
        assert_eq!(decode(&entries.cluster.certificate_authority_data), issued.ca);
    }
}
