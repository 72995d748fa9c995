//! Management cluster resources read and written during login.

use kube::core::{ApiResource, GroupVersionKind};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const ORGANIZATION_LABEL: &str = "giantswarm.io/organization";
pub const CLUSTER_LABEL: &str = "giantswarm.io/cluster";
pub const CERTIFICATE_LABEL: &str = "giantswarm.io/certificate";
pub const RELEASE_VERSION_LABEL: &str = "release.giantswarm.io/version";
pub const CERT_OPERATOR_VERSION_LABEL: &str = "cert-operator.giantswarm.io/version";

/// Release component that signs client certificates.
pub const SIGNER_COMPONENT: &str = "cert-operator";

/// Workload clusters are Cluster API `Cluster` objects. Only metadata is read,
/// so they are fetched as dynamic objects.
pub fn cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "cluster.x-k8s.io",
        "v1beta1",
        "Cluster",
    ))
}

/// Client certificate signing request picked up by the cert-operator.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "core.giantswarm.io",
    version = "v1alpha1",
    kind = "CertConfig",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertConfigSpec {
    pub cert: CertConfigSpecCert,
    pub version_bundle: CertConfigSpecVersionBundle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertConfigSpecCert {
    pub allow_bare_domains: bool,
    pub cluster_component: String,
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub common_name: String,
    pub disable_regeneration: bool,
    #[serde(default)]
    pub organizations: Vec<String>,
    pub ttl: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertConfigSpecVersionBundle {
    pub version: String,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "security.giantswarm.io",
    version = "v1alpha1",
    kind = "Organization",
    status = "OrganizationStatus",
    schema = "disabled"
)]
pub struct OrganizationSpec {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizationStatus {
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "release.giantswarm.io",
    version = "v1alpha1",
    kind = "Release",
    schema = "disabled"
)]
pub struct ReleaseSpec {
    #[serde(default)]
    pub components: Vec<ReleaseComponent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseComponent {
    pub name: String,
    pub version: String,
}

impl Release {
    pub fn component_version(&self, component: &str) -> Option<&str> {
        self.spec
            .components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.version.as_str())
    }
}
