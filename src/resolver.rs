//! Find the workload cluster a name refers to.
//!
//! A cluster name is only unique within a namespace, and an operator usually
//! does not know which organization namespace holds it. Lookups therefore fan
//! out over every candidate namespace concurrently and the results are judged
//! once all of them have finished.

use futures::future::join_all;
use tracing::debug;

use crate::api::ClusterApi;
use crate::{Error, Result};

/// Namespace that holds clusters not owned by any organization.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A workload cluster candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    pub organization: Option<String>,
    pub release_version: Option<String>,
    pub provider: String,
}

impl ClusterRef {
    /// Organization label, `n/a` when missing.
    pub fn organization_or_na(&self) -> &str {
        self.organization
            .as_deref()
            .filter(|org| !org.is_empty())
            .unwrap_or("n/a")
    }
}

/// Namespaces to search for a workload cluster.
///
/// An explicit organization narrows the search to its namespace. Otherwise all
/// organization namespaces are searched, plus `default` when
/// `insecure_namespace` is set.
pub async fn candidate_namespaces(
    api: &dyn ClusterApi,
    organization: Option<&str>,
    insecure_namespace: bool,
) -> Result<Vec<String>> {
    if let Some(organization) = organization {
        return Ok(vec![api.organization_namespace(organization).await?]);
    }

    let mut namespaces = api.organization_namespaces().await?;
    if insecure_namespace && !namespaces.iter().any(|ns| ns == DEFAULT_NAMESPACE) {
        namespaces.push(DEFAULT_NAMESPACE.to_string());
    }
    if namespaces.is_empty() {
        return Err(Error::NoOrganizations);
    }
    Ok(namespaces)
}

/// Resolve `name` to exactly one cluster across `namespaces`.
///
/// With a single namespace the lookup error is returned as is. With several,
/// not-found and forbidden answers count as absence, any other error is fatal
/// and is returned in preference to matches. Ambiguous matches are an error
/// listing every owning organization in namespace order.
pub async fn resolve_cluster(
    api: &dyn ClusterApi,
    name: &str,
    provider: &str,
    namespaces: &[String],
) -> Result<ClusterRef> {
    let namespace = match namespaces {
        [] => return Err(Error::NoOrganizations),
        [namespace] => namespace,
        _ => return search_namespaces(api, name, provider, namespaces).await,
    };

    debug!(cluster = %name, namespace = %namespace, "looking up workload cluster");
    api.get_cluster(namespace, name, provider).await
}

async fn search_namespaces(
    api: &dyn ClusterApi,
    name: &str,
    provider: &str,
    namespaces: &[String],
) -> Result<ClusterRef> {
    debug!(
        cluster = %name,
        namespaces = namespaces.len(),
        "searching workload cluster in all candidate namespaces"
    );

    let lookups = namespaces
        .iter()
        .map(|namespace| async move { (namespace, api.get_cluster(namespace, name, provider).await) });
    let results = join_all(lookups).await;

    let mut matches = Vec::new();
    for (namespace, result) in results {
        match result {
            Ok(cluster) => matches.push(cluster),
            Err(e) if e.is_absence() => {
                debug!(namespace = %namespace, reason = %e, "no match in namespace");
            }
            Err(e) => return Err(e),
        }
    }

    match matches.len() {
        0 => Err(Error::ClusterNotVisible {
            name: name.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousCluster {
            name: name.to_string(),
            organizations: matches
                .iter()
                .map(|c| c.organization_or_na().to_string())
                .collect(),
        }),
    }
}
