//! Installation metadata and authentication.
//!
//! An installation is addressed by the URL of its management API or of its
//! web UI. Both lead to the same base path, from which the metadata service
//! (`athena`) is reached.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const API_PREFIX: &str = "api";
const K8S_API_PREFIX: &str = "g8s";
const WEB_UI_PREFIX: &str = "happa";
const AUTH_PREFIX: &str = "dex";
const METADATA_PREFIX: &str = "athena";
const INTERNAL_PREFIX: &str = "internal";

/// Principal used for bearer tokens that carry no identity.
pub const TOKEN_PRINCIPAL: &str = "token";

const INSTALLATION_QUERY: &str = "query GetInstallationInfo { \
     identity { provider codename } \
     kubernetes { apiUrl authUrl caCert } \
     }";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlType {
    K8sApi,
    WebUi,
    Invalid,
}

/// Classify a host name.
pub fn url_type(host: &str) -> UrlType {
    if host.contains(&format!("{WEB_UI_PREFIX}.")) {
        UrlType::WebUi
    } else if host
        .split('.')
        .next()
        .is_some_and(|label| label.ends_with(K8S_API_PREFIX))
        && host.contains('.')
    {
        UrlType::K8sApi
    } else {
        UrlType::Invalid
    }
}

/// Parse `raw`, adding `https://` when it carries no scheme.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let unknown = || Error::UnknownUrl {
        url: raw.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unknown());
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&with_scheme).map_err(|_| unknown())
}

/// Base path and internal API host of an installation or workload cluster URL.
///
/// ```text
/// https://g8s.demo.example.io            -> g8s.demo.example.io
/// happa.g8s.demo.example.io              -> g8s.demo.example.io
/// https://api.g8s.demo.example.io        -> g8s.demo.example.io
/// https://api.demo.example.io:6443       -> demo.example.io
/// https://api.w1.k8s.demo.example.io     -> w1.k8s.demo.example.io
/// https://dex.g8s.demo.example.io        -> g8s.demo.example.io
/// ```
pub fn base_and_internal_path(raw: &str) -> Result<(String, String)> {
    let unknown = || Error::UnknownUrl {
        url: raw.to_string(),
    };
    let url = normalize_url(raw)?;
    let host = url.host_str().ok_or_else(unknown)?.to_ascii_lowercase();
    let host = host
        .strip_prefix(&format!("{INTERNAL_PREFIX}-"))
        .unwrap_or(&host);

    let base = [WEB_UI_PREFIX, API_PREFIX, AUTH_PREFIX]
        .iter()
        .find_map(|prefix| host.strip_prefix(&format!("{prefix}.")))
        .map(str::to_string);
    let base = match base {
        Some(base) => base,
        None if url_type(host) == UrlType::K8sApi => host.to_string(),
        None => return Err(unknown()),
    };

    if base.split('.').filter(|label| !label.is_empty()).count() < 2 {
        return Err(unknown());
    }

    let internal = if base.contains(".k8s.") {
        format!("{INTERNAL_PREFIX}-{API_PREFIX}.{base}")
    } else {
        format!("{INTERNAL_PREFIX}-{base}")
    };
    Ok((base, internal))
}

/// Domain workload cluster API hosts live under, derived from the management
/// cluster's API server URL.
pub fn cluster_base_domain(server: &str) -> Result<String> {
    let url = normalize_url(server)?;
    let host = url.host_str().ok_or_else(|| Error::UnknownUrl {
        url: server.to_string(),
    })?;

    let base = [
        format!("{INTERNAL_PREFIX}-{K8S_API_PREFIX}."),
        format!("{K8S_API_PREFIX}."),
        format!("{API_PREFIX}."),
    ]
    .iter()
    .find_map(|prefix| host.strip_prefix(prefix.as_str()))
    .unwrap_or(host);
    Ok(base.to_string())
}

/// `https://api.<cluster>.k8s.<base domain>`
pub fn workload_cluster_server(cluster: &str, base_domain: &str) -> String {
    format!("https://{API_PREFIX}.{cluster}.k8s.{base_domain}")
}

fn metadata_url(base_path: &str) -> String {
    format!("https://{METADATA_PREFIX}.{base_path}/graphql")
}

/// `https://internal-g8s.<api host without its first label>`
fn internal_api_url(api_url: &str) -> Result<String> {
    let url = normalize_url(api_url)?;
    let host = url.host_str().ok_or_else(|| Error::UnknownUrl {
        url: api_url.to_string(),
    })?;
    let (_, rest) = host.split_once('.').ok_or_else(|| Error::UnknownUrl {
        url: api_url.to_string(),
    })?;

    let mut internal = format!("https://{INTERNAL_PREFIX}-{K8S_API_PREFIX}.{rest}");
    if let Some(port) = url.port() {
        internal.push_str(&format!(":{port}"));
    }
    Ok(internal)
}

/// Metadata of a management cluster installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub codename: String,
    pub api_url: String,
    pub internal_api_url: String,
    /// PEM bundle of the API server CA.
    pub ca_cert: String,
    /// Identity provider issuer URL.
    pub auth_url: String,
    pub provider: String,
}

impl Installation {
    pub fn server(&self, internal_api: bool) -> &str {
        if internal_api {
            &self.internal_api_url
        } else {
            &self.api_url
        }
    }
}

/// Looks up installation metadata from any URL that identifies it.
#[async_trait]
pub trait InstallationSource: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Installation>;
}

/// [`InstallationSource`] backed by the installation's GraphQL metadata API.
pub struct AthenaClient {
    http: reqwest::Client,
}

impl AthenaClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl InstallationSource for AthenaClient {
    async fn resolve(&self, url: &str) -> Result<Installation> {
        let (base_path, _) = base_and_internal_path(url)?;
        let endpoint = metadata_url(&base_path);
        debug!(endpoint = %endpoint, "querying installation metadata");

        let response: GraphqlResponse = self
            .http
            .post(&endpoint)
            .json(&GraphqlRequest {
                query: INSTALLATION_QUERY,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let installation = response.into_installation()?;
        info!(
            codename = %installation.codename,
            provider = %installation.provider,
            "resolved installation"
        );
        Ok(installation)
    }
}

#[derive(Serialize)]
struct GraphqlRequest {
    query: &'static str,
}

#[derive(Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<InstallationInfo>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct InstallationInfo {
    identity: IdentityInfo,
    kubernetes: KubernetesInfo,
}

#[derive(Deserialize)]
struct IdentityInfo {
    provider: String,
    codename: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubernetesInfo {
    api_url: String,
    auth_url: String,
    ca_cert: String,
}

impl GraphqlResponse {
    fn into_installation(self) -> Result<Installation> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(Error::installation(messages.join("; ")));
        }
        let info = self
            .data
            .ok_or_else(|| Error::installation("the response contained no data"))?;

        Ok(Installation {
            internal_api_url: internal_api_url(&info.kubernetes.api_url)?,
            codename: info.identity.codename,
            api_url: info.kubernetes.api_url,
            ca_cert: info.kubernetes.ca_cert,
            auth_url: info.kubernetes.auth_url,
            provider: info.identity.provider,
        })
    }
}

/// Credential material of an authenticated session.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionCredential {
    Token(String),
    Oidc {
        client_id: String,
        id_token: String,
        refresh_token: String,
    },
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCredential::Token(_) => f.write_str("Token(<redacted>)"),
            SessionCredential::Oidc { client_id, .. } => f
                .debug_struct("Oidc")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// The identity an operator is logged in with on one installation.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub principal: String,
    pub email: Option<String>,
    pub credential: SessionCredential,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("principal", &self.principal)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Obtains an [`AuthSession`] for an installation.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, installation: &Installation) -> Result<AuthSession>;
}

/// Authenticates with a pre-issued bearer token.
///
/// When the token is a JWT, the principal is taken from its `email` claim.
pub struct TokenAuthenticator {
    token: Option<String>,
}

impl TokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, installation: &Installation) -> Result<AuthSession> {
        let token = self
            .token
            .clone()
            .ok_or_else(|| Error::InteractiveLoginUnavailable {
                codename: installation.codename.clone(),
            })?;

        let email = token_email(&token);
        let principal = email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or(TOKEN_PRINCIPAL)
            .to_string();
        debug!(principal = %principal, codename = %installation.codename, "authenticating with bearer token");

        Ok(AuthSession {
            principal,
            email,
            credential: SessionCredential::Token(token),
        })
    }
}

#[derive(Deserialize)]
struct TokenClaims {
    #[serde(default)]
    email: Option<String>,
}

fn token_email(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: TokenClaims = serde_json::from_slice(&decoded).ok()?;
    claims.email.filter(|e| !e.is_empty())
}
