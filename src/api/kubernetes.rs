//! Management API backed by a kube [`Client`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, ObjectMeta},
    Api, Client, Config, ResourceExt as _,
};
use tracing::{debug, info};

use super::{CertificateApi, ClusterApi, Connector, ManagementApis};
use crate::crd::{
    cluster_resource, CertConfig, CertConfigSpec, CertConfigSpecCert,
    CertConfigSpecVersionBundle, Organization, Release, CERTIFICATE_LABEL,
    CERT_OPERATOR_VERSION_LABEL, CLUSTER_LABEL, ORGANIZATION_LABEL, RELEASE_VERSION_LABEL,
    SIGNER_COMPONENT,
};
use crate::issuer::{CertificateRequest, IssuedCredential};
use crate::kubeconfig::CredentialStore;
use crate::resolver::ClusterRef;
use crate::{Error, Result};

const SECRET_KEY_CERTIFICATE: &str = "crt";
const SECRET_KEY_KEY: &str = "key";
const SECRET_KEY_CA: &str = "ca";

pub struct KubeManagementApi {
    client: Client,
}

impl KubeManagementApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeManagementApi {
    async fn get_cluster(&self, namespace: &str, name: &str, provider: &str) -> Result<ClusterRef> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            namespace,
            &cluster_resource(),
        );

        match api.get(name).await {
            Ok(cluster) => Ok(cluster_ref(&cluster, provider)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::ClusterNotFound {
                name: name.to_string(),
            }),
            Err(kube::Error::Api(ae)) if ae.code == 403 => Err(Error::InsufficientPermissions {
                namespace: namespace.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn organization_namespace(&self, organization: &str) -> Result<String> {
        let org = match Api::<Organization>::all(self.client.clone())
            .get(organization)
            .await
        {
            Ok(org) => org,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::OrganizationNotFound {
                    name: organization.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        organization_status_namespace(&org).ok_or_else(|| Error::UnknownOrganizationNamespace {
            name: organization.to_string(),
        })
    }

    async fn organization_namespaces(&self) -> Result<Vec<String>> {
        let orgs = Api::<Organization>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items;
        if orgs.is_empty() {
            return Err(Error::NoOrganizations);
        }

        Ok(orgs.iter().filter_map(organization_status_namespace).collect())
    }

    async fn signer_version(&self, release_version: &str) -> Result<String> {
        let release = match Api::<Release>::all(self.client.clone())
            .get(&format!("v{release_version}"))
            .await
        {
            Ok(release) => release,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::ReleaseNotFound {
                    version: release_version.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        release
            .component_version(SIGNER_COMPONENT)
            .map(str::to_string)
            .ok_or_else(|| Error::MissingSignerComponent {
                version: release_version.to_string(),
                component: SIGNER_COMPONENT.to_string(),
            })
    }
}

#[async_trait]
impl CertificateApi for KubeManagementApi {
    async fn create_request(&self, request: &CertificateRequest) -> Result<()> {
        Api::<CertConfig>::namespaced(self.client.clone(), &request.namespace)
            .create(&PostParams::default(), &cert_config(request))
            .await?;
        Ok(())
    }

    async fn get_credential(&self, namespace: &str, name: &str) -> Result<Option<IssuedCredential>> {
        match Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
        {
            Ok(secret) => Ok(issued_credential(&secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_request(&self, request: &CertificateRequest) -> Result<()> {
        match Api::<CertConfig>::namespaced(self.client.clone(), &request.namespace)
            .delete(&request.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds kube clients from the credential store being edited.
pub struct KubeConnector;

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, store: &CredentialStore, context: &str) -> Result<ManagementApis> {
        let kubeconfig = Kubeconfig::from_yaml(&store.to_yaml()?)?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        info!(context = %context, server = %config.cluster_url, "connecting to management cluster");

        let api = Arc::new(KubeManagementApi::new(Client::try_from(config)?));
        Ok(ManagementApis {
            clusters: api.clone(),
            certificates: api,
        })
    }
}

fn cluster_ref(cluster: &DynamicObject, provider: &str) -> ClusterRef {
    let labels = cluster.labels();
    ClusterRef {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        organization: labels.get(ORGANIZATION_LABEL).cloned(),
        release_version: labels.get(RELEASE_VERSION_LABEL).cloned(),
        provider: provider.to_string(),
    }
}

fn organization_status_namespace(org: &Organization) -> Option<String> {
    org.status
        .as_ref()
        .and_then(|status| status.namespace.clone())
        .filter(|namespace| !namespace.is_empty())
}

fn cert_config(request: &CertificateRequest) -> CertConfig {
    let mut cert_config = CertConfig::new(
        &request.name,
        CertConfigSpec {
            cert: CertConfigSpecCert {
                allow_bare_domains: true,
                cluster_component: request.id.clone(),
                cluster_id: request.cluster.clone(),
                common_name: request.common_name.clone(),
                disable_regeneration: true,
                organizations: request.groups.clone(),
                ttl: request.ttl.clone(),
            },
            version_bundle: CertConfigSpecVersionBundle {
                version: request.signer_version.clone(),
            },
        },
    );

    cert_config.metadata = ObjectMeta {
        name: Some(request.name.clone()),
        namespace: Some(request.namespace.clone()),
        labels: Some(BTreeMap::from([
            (
                CERT_OPERATOR_VERSION_LABEL.to_string(),
                request.signer_version.clone(),
            ),
            (CERTIFICATE_LABEL.to_string(), request.id.clone()),
            (CLUSTER_LABEL.to_string(), request.cluster.clone()),
            (ORGANIZATION_LABEL.to_string(), request.organization.clone()),
        ])),
        ..ObjectMeta::default()
    };
    cert_config
}

/// Credential material of a signer secret; `None` while it is incomplete.
fn issued_credential(secret: &Secret) -> Option<IssuedCredential> {
    let data = secret.data.as_ref()?;
    let field = |key: &str| data.get(key).map(|value| value.0.clone());

    match (
        field(SECRET_KEY_CERTIFICATE),
        field(SECRET_KEY_KEY),
        field(SECRET_KEY_CA),
    ) {
        (Some(certificate), Some(key), Some(ca)) => Some(IssuedCredential {
            certificate,
            key,
            ca,
        }),
        _ => {
            debug!(secret = %secret.name_any(), "credential secret is incomplete");
            None
        }
    }
}
