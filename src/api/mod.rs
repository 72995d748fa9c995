//! Seams between the login flow and the management cluster API.
//!
//! The flow only talks to these traits. [`kubernetes`] holds the
//! implementations backed by a kube [`Client`](kube::Client); tests use
//! in-memory fakes.

#[cfg(test)]
pub(crate) mod fakes;
pub mod kubernetes;

use std::sync::Arc;

use async_trait::async_trait;

use crate::issuer::{CertificateRequest, IssuedCredential};
use crate::kubeconfig::CredentialStore;
use crate::resolver::ClusterRef;
use crate::Result;

/// Read access to workload clusters and the organizations that own them.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a workload cluster.
    ///
    /// Fails with [`Error::ClusterNotFound`](crate::Error::ClusterNotFound) or
    /// [`Error::InsufficientPermissions`](crate::Error::InsufficientPermissions)
    /// so callers can tell absence from other failures.
    async fn get_cluster(&self, namespace: &str, name: &str, provider: &str) -> Result<ClusterRef>;

    /// Namespace owned by a single organization.
    async fn organization_namespace(&self, organization: &str) -> Result<String>;

    /// Namespaces of every organization visible to the caller.
    async fn organization_namespaces(&self) -> Result<Vec<String>>;

    /// Version of the certificate signer shipped with a release.
    async fn signer_version(&self, release_version: &str) -> Result<String>;
}

/// Create, read and delete client certificate requests.
#[async_trait]
pub trait CertificateApi: Send + Sync {
    async fn create_request(&self, request: &CertificateRequest) -> Result<()>;

    /// `Ok(None)` while the signer has not produced the credential yet.
    async fn get_credential(&self, namespace: &str, name: &str) -> Result<Option<IssuedCredential>>;

    async fn delete_request(&self, request: &CertificateRequest) -> Result<()>;
}

/// API handles for one management cluster.
#[derive(Clone)]
pub struct ManagementApis {
    pub clusters: Arc<dyn ClusterApi>,
    pub certificates: Arc<dyn CertificateApi>,
}

/// Opens [`ManagementApis`] for a context of a credential store.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, store: &CredentialStore, context: &str) -> Result<ManagementApis>;
}
