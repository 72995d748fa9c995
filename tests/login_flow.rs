use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fleet_login::api::{CertificateApi, ClusterApi, Connector, ManagementApis};
use fleet_login::config::LoginConfig;
use fleet_login::installation::{Installation, InstallationSource, TokenAuthenticator};
use fleet_login::issuer::{CertificateRequest, IssuedCredential, IssuerConfig};
use fleet_login::kubeconfig::{AuthType, CredentialStore};
use fleet_login::login::{Collaborators, LoginEvent, LoginFlags, LoginRunner};
use fleet_login::oidc::{OidcConfig, RenewedTokens, TokenRenewer};
use fleet_login::resolver::ClusterRef;
use fleet_login::{Error, Result};

const CA: &str = "-----BEGIN CERTIFICATE-----\nmc\n-----END CERTIFICATE-----\n";

struct DemoInstallation;

#[async_trait]
impl InstallationSource for DemoInstallation {
    async fn resolve(&self, url: &str) -> Result<Installation> {
        if !url.contains("demo.example.io") {
            return Err(Error::UnknownUrl {
                url: url.to_string(),
            });
        }
        Ok(Installation {
            codename: "demo".to_string(),
            api_url: "https://g8s.demo.example.io".to_string(),
            internal_api_url: "https://internal-g8s.demo.example.io".to_string(),
            ca_cert: CA.to_string(),
            auth_url: "https://dex.g8s.demo.example.io".to_string(),
            provider: "aws".to_string(),
        })
    }
}

struct NoRenewal;

#[async_trait]
impl TokenRenewer for NoRenewal {
    async fn renew(&self, _config: &OidcConfig, _refresh_token: &str) -> Result<RenewedTokens> {
        Err(Error::TokenRenewalFailed {
            reason: "not expected in this scenario".to_string(),
        })
    }
}

/// A management cluster with one organization and one workload cluster, whose
/// signer answers on the second poll.
#[derive(Default)]
struct DemoManagementCluster {
    requests: Mutex<BTreeMap<String, CertificateRequest>>,
    deleted: Mutex<Vec<String>>,
    polls: Mutex<u32>,
}

#[async_trait]
impl ClusterApi for DemoManagementCluster {
    async fn get_cluster(&self, namespace: &str, name: &str, provider: &str) -> Result<ClusterRef> {
        if namespace != "org-acme" || name != "w1cluster" {
            return Err(Error::ClusterNotFound {
                name: name.to_string(),
            });
        }
        Ok(ClusterRef {
            name: name.to_string(),
            namespace: namespace.to_string(),
            organization: Some("acme".to_string()),
            release_version: Some("19.1.0".to_string()),
            provider: provider.to_string(),
        })
    }

    async fn organization_namespace(&self, organization: &str) -> Result<String> {
        match organization {
            "acme" => Ok("org-acme".to_string()),
            _ => Err(Error::OrganizationNotFound {
                name: organization.to_string(),
            }),
        }
    }

    async fn organization_namespaces(&self) -> Result<Vec<String>> {
        Ok(vec!["org-acme".to_string()])
    }

    async fn signer_version(&self, release_version: &str) -> Result<String> {
        assert_eq!(release_version, "19.1.0");
        Ok("3.4.0".to_string())
    }
}

#[async_trait]
impl CertificateApi for DemoManagementCluster {
    async fn create_request(&self, request: &CertificateRequest) -> Result<()> {
        self.requests
            .lock()
            .unwrap()
            .insert(request.name.clone(), request.clone());
        Ok(())
    }

    async fn get_credential(&self, namespace: &str, name: &str) -> Result<Option<IssuedCredential>> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        let requests = self.requests.lock().unwrap();
        let ready = *polls >= 2
            && requests
                .get(name)
                .is_some_and(|request| request.namespace == namespace);
        Ok(ready.then(|| IssuedCredential {
            certificate: b"wc-cert".to_vec(),
            key: b"wc-key".to_vec(),
            ca: b"wc-ca".to_vec(),
        }))
    }

    async fn delete_request(&self, request: &CertificateRequest) -> Result<()> {
        self.deleted.lock().unwrap().push(request.name.clone());
        self.requests.lock().unwrap().remove(&request.name);
        Ok(())
    }
}

struct DemoConnector {
    management: Arc<DemoManagementCluster>,
    contexts: Mutex<Vec<String>>,
}

#[async_trait]
impl Connector for DemoConnector {
    async fn connect(&self, store: &CredentialStore, context: &str) -> Result<ManagementApis> {
        assert!(store.has_context(context));
        self.contexts.lock().unwrap().push(context.to_string());
        Ok(ManagementApis {
            clusters: self.management.clone(),
            certificates: self.management.clone(),
        })
    }
}

fn runner(store_path: &Path, flags: LoginFlags, connector: Arc<DemoConnector>) -> LoginRunner {
    let config = LoginConfig::new(
        store_path.to_str(),
        flags,
        IssuerConfig {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
            ..IssuerConfig::default()
        },
    )
    .unwrap();

    LoginRunner::new(
        config,
        Collaborators {
            connector,
            installations: Arc::new(DemoInstallation),
            authenticator: Arc::new(TokenAuthenticator::new(Some("opaque".to_string()))),
            renewer: Arc::new(NoRenewal),
        },
    )
}

fn demo_connector() -> Arc<DemoConnector> {
    Arc::new(DemoConnector {
        management: Arc::new(DemoManagementCluster::default()),
        contexts: Mutex::new(Vec::new()),
    })
}

fn seed_foreign_context(path: &Path) {
    std::fs::write(
        path,
        indoc::indoc! {r#"
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
        "#},
    )
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn url_login_with_workload_cluster_ends_on_client_cert_context() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("config");
    seed_foreign_context(&store_path);

    let connector = demo_connector();
    let flags = LoginFlags {
        cluster: Some("w1cluster".to_string()),
        certificate_groups: vec!["system:masters".to_string()],
        ..LoginFlags::default()
    };
    let outcome = runner(&store_path, flags, connector.clone())
        .run(&["https://happa.g8s.demo.example.io".to_string()])
        .await
        .unwrap();

    let store = CredentialStore::load(&store_path).unwrap();
    assert_eq!(store.current_context(), Some("gs-demo-w1cluster-clientcert"));
    assert!(store.validate().is_empty());
    assert!(store.has_context("kind-dev"));

    assert_eq!(store.auth_type("gs-demo"), AuthType::Token);
    assert_eq!(store.context("gs-demo").unwrap().user, "gs-token-demo");
    let ca_file = dir.path().join("gs-demo.crt");
    assert_eq!(std::fs::read_to_string(&ca_file).unwrap(), CA);
    assert_eq!(
        store.clusters["gs-demo"].certificate_authority.as_deref(),
        ca_file.to_str()
    );

    assert_eq!(
        store.auth_type("gs-demo-w1cluster-clientcert"),
        AuthType::ClientCertificate
    );
    assert_eq!(
        store.clusters["gs-demo-w1cluster-clientcert"].server.as_deref(),
        Some("https://api.w1cluster.k8s.demo.example.io")
    );

    assert_eq!(*connector.contexts.lock().unwrap(), vec!["gs-demo".to_string()]);
    assert!(connector.management.deleted.lock().unwrap().is_empty());
    assert!(matches!(outcome.events[0], LoginEvent::LoggedIn { existed: false, .. }));
    assert!(matches!(
        outcome.events[1],
        LoginEvent::ClientCertCreated { existed: false, selected: true, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn repeated_login_reuses_entries_and_keeps_context() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("config");
    seed_foreign_context(&store_path);

    let first = LoginFlags {
        cluster: Some("w1cluster".to_string()),
        ..LoginFlags::default()
    };
    runner(&store_path, first, demo_connector())
        .run(&["g8s.demo.example.io".to_string()])
        .await
        .unwrap();
    let after_first = CredentialStore::load(&store_path).unwrap();

    // Back on the foreign context, log in again by codename without moving.
    let store = after_first.with_current_context("kind-dev");
    store.save(&store_path).unwrap();

    let again = LoginFlags {
        cluster: Some("w1cluster".to_string()),
        organization: Some("acme".to_string()),
        keep_context: true,
        ..LoginFlags::default()
    };
    let outcome = runner(&store_path, again, demo_connector())
        .run(&["demo".to_string()])
        .await
        .unwrap();

    let store = CredentialStore::load(&store_path).unwrap();
    assert_eq!(store.current_context(), Some("kind-dev"));
    assert_eq!(store.contexts.len(), after_first.contexts.len());
    assert_eq!(store.users.len(), after_first.users.len());
    assert_eq!(store.clusters.len(), after_first.clusters.len());
    assert!(outcome.events.iter().any(|event| matches!(
        event,
        LoginEvent::ClientCertCreated { existed: true, selected: false, .. }
    )));
    assert_eq!(
        outcome.events.last(),
        Some(&LoginEvent::OriginRestored {
            context: "kind-dev".to_string()
        })
    );
}

#[tokio::test]
async fn unknown_installation_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("config");
    seed_foreign_context(&store_path);
    let before = std::fs::read(&store_path).unwrap();

    let err = runner(&store_path, LoginFlags::default(), demo_connector())
        .run(&["https://happa.other.example.io".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownUrl { .. }));
    assert_eq!(std::fs::read(&store_path).unwrap(), before);
}
