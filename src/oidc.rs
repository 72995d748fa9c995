//! OIDC session renewal for contexts that authenticate through the `oidc`
//! auth provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::kubeconfig::{oidc_keys, AuthProviderConfig, CredentialStore, UserEntry};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Issuer and client a stored session was obtained from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RenewedTokens {
    pub id_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for RenewedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RenewedTokens { .. }")
    }
}

/// Exchanges a refresh token for a fresh ID token.
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    async fn renew(&self, config: &OidcConfig, refresh_token: &str) -> Result<RenewedTokens>;
}

/// Check a stored auth provider config and extract what renewal needs.
///
/// A missing refresh token means the session cannot be renewed and the
/// operator has to log in again. Any other missing key means the entry is
/// corrupted.
pub fn validate_oidc_provider(
    provider: &AuthProviderConfig,
    context: &str,
) -> Result<(OidcConfig, String)> {
    let corrupted = || Error::CorruptedAuthConfig {
        context: context.to_string(),
    };

    let client_id = provider.get(oidc_keys::CLIENT_ID).ok_or_else(corrupted)?;
    let issuer = provider.get(oidc_keys::ISSUER).ok_or_else(corrupted)?;
    let refresh_token = provider
        .get(oidc_keys::REFRESH_TOKEN)
        .ok_or(Error::NewLoginRequired)?;

    Ok((
        OidcConfig {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret: provider.get(oidc_keys::CLIENT_SECRET).map(str::to_string),
        },
        refresh_token.to_string(),
    ))
}

/// Renew a session once. Every failure means a new login is required.
pub async fn refresh_session(
    renewer: &dyn TokenRenewer,
    refresh_token: &str,
    config: &OidcConfig,
) -> Result<RenewedTokens> {
    debug!(issuer = %config.issuer, client_id = %config.client_id, "renewing OIDC session");
    match renewer.renew(config, refresh_token).await {
        Ok(tokens) => {
            info!(issuer = %config.issuer, "renewed OIDC session");
            Ok(tokens)
        }
        Err(e @ Error::TokenRenewalFailed { .. }) => Err(e),
        Err(e) => Err(Error::TokenRenewalFailed {
            reason: e.to_string(),
        }),
    }
}

/// Snapshot with the renewed tokens written into the user of `context`.
pub fn apply_renewed_tokens(
    store: &CredentialStore,
    context: &str,
    tokens: &RenewedTokens,
) -> Result<CredentialStore> {
    let missing = || Error::MissingAuthConfig {
        context: context.to_string(),
    };
    let user_name = store.context(context).map(|c| c.user.clone()).ok_or_else(missing)?;
    let mut user: UserEntry = store.users.get(&user_name).cloned().ok_or_else(missing)?;
    let provider = user.auth_provider.as_mut().ok_or_else(missing)?;

    provider
        .config
        .insert(oidc_keys::ID_TOKEN.to_string(), tokens.id_token.clone());
    provider.config.insert(
        oidc_keys::REFRESH_TOKEN.to_string(),
        tokens.refresh_token.clone(),
    );
    Ok(store.with_user(&user_name, user))
}

/// [`TokenRenewer`] talking to the issuer over HTTP.
pub struct OidcClient {
    http: reqwest::Client,
}

impl OidcClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    async fn token_endpoint(&self, issuer: &str) -> Result<String> {
        let metadata: ProviderMetadata = self
            .http
            .get(discovery_url(issuer))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(metadata.token_endpoint)
    }
}

#[async_trait]
impl TokenRenewer for OidcClient {
    async fn renew(&self, config: &OidcConfig, refresh_token: &str) -> Result<RenewedTokens> {
        let endpoint = self.token_endpoint(&config.issuer).await?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response: TokenResponse = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_tokens(refresh_token)
    }
}

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    /// Providers that do not rotate refresh tokens omit it; the previous one
    /// stays valid then.
    fn into_tokens(self, previous_refresh_token: &str) -> Result<RenewedTokens> {
        let id_token = self
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::TokenRenewalFailed {
                reason: "the token response did not contain an id_token".to_string(),
            })?;
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| previous_refresh_token.to_string());
        Ok(RenewedTokens {
            id_token,
            refresh_token,
        })
    }
}

fn discovery_url(issuer: &str) -> String {
    format!("{}/{DISCOVERY_PATH}", issuer.trim_end_matches('/'))
}
