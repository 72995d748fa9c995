//! Error types for the login flow

use std::path::PathBuf;

/// Flag users pass to pick a workload cluster from a specific organization.
pub const ORGANIZATION_FLAG: &str = "cluster-organization";

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Ambiguous,
    Forbidden,
    Timeout,
    Conflict,
    CorruptedAuthConfig,
    Fatal,
}

/// Login errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "The workload cluster {name} could not be found.\n\
         This may be a permissions issue. Make sure you have access to the cluster."
    )]
    ClusterNotFound { name: String },

    #[error(
        "The workload cluster {name} could not be found.\n\
         Make sure you have access to the cluster's organization namespace."
    )]
    ClusterNotVisible { name: String },

    #[error("{}", ambiguous_message(.name, .organizations))]
    AmbiguousCluster {
        name: String,
        organizations: Vec<String>,
    },

    #[error("You don't have the required permissions to get clusters in the {namespace} namespace.")]
    InsufficientPermissions { namespace: String },

    #[error("The organization {name} could not be found.")]
    OrganizationNotFound { name: String },

    #[error("Could not find the namespace for organization {name}.")]
    UnknownOrganizationNamespace { name: String },

    #[error("Could not find any organizations.")]
    NoOrganizations,

    #[error(
        "There is no context named '{name}'. Please make sure you spelled the installation handle correctly.\n\
         If not sure, pass the Management API URL or the web UI URL of the installation as an argument."
    )]
    ContextDoesNotExist { name: String },

    #[error(
        "The current context does not seem to belong to a managed installation.\n\
         Please run 'fleet-login --help' to find out how to log in to a particular cluster."
    )]
    SelectedContextNonCompatible,

    #[error("There is no authentication configuration for the '{context}' context.")]
    MissingAuthConfig { context: String },

    #[error(
        "The authentication configuration of the '{context}' context is corrupted, \
         please log in again using a URL."
    )]
    CorruptedAuthConfig { context: String },

    #[error("The authentication session has expired, a new login is required.")]
    NewLoginRequired,

    #[error("Renewing the authentication token failed, you must log in again: {reason}")]
    TokenRenewalFailed { reason: String },

    #[error(
        "Interactive OIDC login is not available, pass a bearer token with --token \
         to log in to {codename}."
    )]
    InteractiveLoginUnavailable { codename: String },

    #[error("failed to get the client certificate credential {name} on time")]
    CredentialTimeout { name: String },

    #[error("The destination file {} already exists. Please specify a different destination.", .path.display())]
    FileExists { path: PathBuf },

    #[error("Creating a client certificate for a workload cluster is not supported on provider '{provider}'.")]
    UnsupportedProvider { provider: String },

    #[error("The workload cluster {cluster} does not have a valid release version label.")]
    InvalidReleaseVersion { cluster: String },

    #[error("On {provider}, the workload cluster must use release v{minimum} or newer in order to allow client certificate creation.")]
    UnsupportedReleaseVersion { provider: String, minimum: String },

    #[error("Release v{version} could not be found.")]
    ReleaseNotFound { version: String },

    #[error("The release v{version} does not include the required '{component}' component.")]
    MissingSignerComponent { version: String, component: String },

    #[error("'{url}' is not a valid installation URL.")]
    UnknownUrl { url: String },

    #[error("installation metadata lookup failed: {0}")]
    Installation(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ClusterNotFound { .. }
            | Error::ClusterNotVisible { .. }
            | Error::OrganizationNotFound { .. }
            | Error::UnknownOrganizationNamespace { .. }
            | Error::NoOrganizations
            | Error::ContextDoesNotExist { .. }
            | Error::ReleaseNotFound { .. } => ErrorKind::NotFound,
            Error::AmbiguousCluster { .. } => ErrorKind::Ambiguous,
            Error::InsufficientPermissions { .. } => ErrorKind::Forbidden,
            Error::CredentialTimeout { .. } => ErrorKind::Timeout,
            Error::FileExists { .. } => ErrorKind::Conflict,
            Error::CorruptedAuthConfig { .. } | Error::MissingAuthConfig { .. } => {
                ErrorKind::CorruptedAuthConfig
            }
            _ => ErrorKind::Fatal,
        }
    }

    /// Lookup misses that a multi-namespace search treats as plain absence.
    pub fn is_absence(&self) -> bool {
        matches!(
            self,
            Error::ClusterNotFound { .. } | Error::InsufficientPermissions { .. }
        )
    }

    /// Errors after which the operator has to go through a network login again.
    pub fn requires_new_login(&self) -> bool {
        matches!(
            self,
            Error::NewLoginRequired | Error::TokenRenewalFailed { .. }
        )
    }

    pub fn installation(message: impl Into<String>) -> Self {
        Error::Installation(message.into())
    }
}

fn ambiguous_message(name: &str, organizations: &[String]) -> String {
    let mut message = format!("There are multiple workload clusters with the name {name}:\n");
    for (i, org) in organizations.iter().enumerate() {
        message.push_str(&format!("{}. {name} in organization {org}\n", i + 1));
    }
    message.push_str(&format!(
        "\nUse the --{ORGANIZATION_FLAG} flag to select one from a specific organization."
    ));
    message
}
