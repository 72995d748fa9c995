//! Client certificate issuance.
//!
//! A certificate request object is created on the management cluster, then the
//! signer's credential secret is polled until it shows up or the time budget is
//! spent. Once the request exists, any later failure deletes it again.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::CertificateApi;
use crate::resolver::{ClusterRef, DEFAULT_NAMESPACE};
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5 * 60);

/// Minimum release per provider that supports client certificates.
const MINIMUM_RELEASE: &[(&str, (u64, u64, u64))] = &[("aws", (13, 0, 0))];

/// Where the signer writes the credential secret of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialNamespace {
    SameAsRequest,
    Fixed(String),
}

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Credential secret location per provider. Providers missing here do not
    /// support client certificates.
    pub credential_namespaces: BTreeMap<String, CredentialNamespace>,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            credential_namespaces: BTreeMap::from([
                ("aws".to_string(), CredentialNamespace::SameAsRequest),
                (
                    "azure".to_string(),
                    CredentialNamespace::Fixed(DEFAULT_NAMESPACE.to_string()),
                ),
            ]),
        }
    }
}

impl IssuerConfig {
    pub fn validate_provider(&self, provider: &str) -> Result<()> {
        if self.credential_namespaces.contains_key(provider) {
            Ok(())
        } else {
            Err(Error::UnsupportedProvider {
                provider: provider.to_string(),
            })
        }
    }

    /// Namespace holding the credential secret for `request`.
    pub fn credential_namespace(&self, request: &CertificateRequest) -> Result<String> {
        match self.credential_namespaces.get(&request.provider) {
            Some(CredentialNamespace::SameAsRequest) => Ok(request.namespace.clone()),
            Some(CredentialNamespace::Fixed(namespace)) => Ok(namespace.clone()),
            None => Err(Error::UnsupportedProvider {
                provider: request.provider.clone(),
            }),
        }
    }
}

/// Signed client certificate material.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Vec<u8>,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("key", &"<redacted>")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .finish()
    }
}

/// A client certificate signing request for one workload cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub organization: String,
    pub provider: String,
    pub common_name: String,
    pub ttl: String,
    pub groups: Vec<String>,
    pub signer_version: String,
}

impl CertificateRequest {
    /// A request with a freshly generated ID.
    pub fn new(
        cluster: &ClusterRef,
        base_domain: &str,
        ttl: &str,
        groups: &[String],
        signer_version: &str,
    ) -> Self {
        let id = generate_request_id();
        Self {
            name: format!("{}-{}", cluster.name, id),
            common_name: format!("{}.{}.k8s.{}", id, cluster.name, base_domain),
            namespace: cluster.namespace.clone(),
            cluster: cluster.name.clone(),
            organization: cluster.organization.clone().unwrap_or_default(),
            provider: cluster.provider.clone(),
            ttl: ttl.to_string(),
            groups: groups.to_vec(),
            signer_version: signer_version.to_string(),
            id,
        }
    }
}

/// 16 hex characters, unique per call.
pub fn generate_request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Release version of a cluster, if it allows client certificates.
pub fn validate_release_version(cluster: &ClusterRef) -> Result<String> {
    let invalid = || Error::InvalidReleaseVersion {
        cluster: cluster.name.clone(),
    };
    let version = cluster
        .release_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(invalid)?;
    let parsed = parse_version(version).ok_or_else(invalid)?;

    let minimum = MINIMUM_RELEASE
        .iter()
        .find(|(provider, _)| *provider == cluster.provider);
    if let Some((provider, minimum)) = minimum {
        if parsed < *minimum {
            return Err(Error::UnsupportedReleaseVersion {
                provider: provider.to_string(),
                minimum: format!("{}.{}.{}", minimum.0, minimum.1, minimum.2),
            });
        }
    }

    Ok(version.trim_start_matches('v').to_string())
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    Some((major, minor, patch))
}

pub struct Issuer {
    api: Arc<dyn CertificateApi>,
    config: IssuerConfig,
}

impl Issuer {
    pub fn new(api: Arc<dyn CertificateApi>, config: IssuerConfig) -> Self {
        Self { api, config }
    }

    /// Create `request` and wait for the signed credential.
    pub async fn issue(&self, request: &CertificateRequest) -> Result<IssuedCredential> {
        self.issue_with(request, |credential| async move { Ok(credential) })
            .await
    }

    /// Create `request`, wait for the credential and hand it to `then`.
    ///
    /// If polling or `then` fails, the request is deleted before the error is
    /// returned. A failed deletion is only logged.
    pub async fn issue_with<T, F, Fut>(&self, request: &CertificateRequest, then: F) -> Result<T>
    where
        F: FnOnce(IssuedCredential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential_namespace = self.config.credential_namespace(request)?;

        self.api.create_request(request).await?;
        info!(
            request = %request.name,
            namespace = %request.namespace,
            ttl = %request.ttl,
            "created client certificate request"
        );

        let outcome = match self.await_credential(&credential_namespace, request).await {
            Ok(credential) => then(credential).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            self.compensate(request, e).await;
        }
        outcome
    }

    async fn await_credential(
        &self,
        namespace: &str,
        request: &CertificateRequest,
    ) -> Result<IssuedCredential> {
        let deadline = Instant::now() + self.config.max_wait;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(credential) = self.api.get_credential(namespace, &request.name).await? {
                debug!(request = %request.name, attempt, "client certificate credential ready");
                return Ok(credential);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::CredentialTimeout {
                    name: request.name.clone(),
                });
            }

            debug!(request = %request.name, attempt, "credential not ready yet");
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn compensate(&self, request: &CertificateRequest, cause: &Error) {
        match self.api.delete_request(request).await {
            Ok(()) => debug!(
                request = %request.name,
                cause = %cause,
                "deleted client certificate request after failure"
            ),
            Err(e) => warn!(
                request = %request.name,
                error = %e,
                "failed to clean up client certificate request"
            ),
        }
    }
}
