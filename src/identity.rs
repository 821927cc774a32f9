//! Microsoft identity platform (OAuth2 v2.0) endpoints
//!
//! [`IdentityProvider`] is the seam between the credential broker and the
//! provider's HTTP protocol. [`MicrosoftIdentityProvider`] implements it for
//! `login.microsoftonline.com`:
//! - device authorization (`/oauth2/v2.0/devicecode`) and polling
//! - refresh-token redemption
//! - client-credential grant for service-to-service access

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default Microsoft identity platform host
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Delegated scopes needed to read mail and the signed-in profile
pub const DEFAULT_SCOPES: &[&str] = &["Mail.Read", "User.Read"];

/// Scope for the client-credential grant (application permissions)
pub const CLIENT_CREDENTIAL_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Added to delegated requests so the provider issues refresh and ID tokens
const RESERVED_SCOPES: &[&str] = &["offline_access", "openid", "profile"];

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the polling interval on `slow_down`
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Pending device code authorization.
///
/// The caller shows `verification_uri` and `user_code` to the user, then
/// hands the challenge back to the broker to wait for completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFlowChallenge {
    pub verification_uri: String,
    pub user_code: String,
    pub device_code: String,
    /// Seconds until the device code expires
    pub expires_in: u64,
    /// Minimum seconds between polls
    pub interval: u64,
    /// Human readable instructions from the provider
    pub message: Option<String>,
}

/// Raw device authorization response; every field is optional so a missing
/// user code can be reported instead of failing to parse
#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    user_code: Option<String>,
    device_code: Option<String>,
    verification_uri: Option<String>,
    expires_in: Option<u64>,
    interval: Option<u64>,
    message: Option<String>,
}

/// Successful token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

/// `{error, error_description}` body returned on failure
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Failure talking to the identity provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered with an OAuth error code
    #[error("{error}: {description}")]
    Rejected { error: String, description: String },

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn rejected(error: impl Into<String>, description: impl Into<String>) -> Self {
        ProviderError::Rejected {
            error: error.into(),
            description: description.into(),
        }
    }

    /// OAuth error code, when the provider sent one
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        ProviderError::Transport(error.to_string())
    }
}

/// OAuth2 operations the credential broker relies on
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start a device code flow for the delegated `scopes`
    async fn initiate_device_flow(
        &self,
        scopes: &[String],
    ) -> std::result::Result<DeviceFlowChallenge, ProviderError>;

    /// Wait for the user to finish the device code flow
    async fn acquire_token_by_device_flow(
        &self,
        challenge: &DeviceFlowChallenge,
    ) -> std::result::Result<TokenGrant, ProviderError>;

    /// Redeem a refresh token without user interaction
    async fn acquire_token_by_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ProviderError>;

    /// Client-credential grant using an application secret
    async fn acquire_token_for_client(
        &self,
        client_secret: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ProviderError>;
}

/// Identity provider for Microsoft Entra ID tenants
#[derive(Debug, Clone)]
pub struct MicrosoftIdentityProvider {
    http: Client,
    authority: String,
    client_id: String,
}

impl MicrosoftIdentityProvider {
    /// Provider for `https://login.microsoftonline.com/<tenant_id>`
    pub fn new(tenant_id: &str, client_id: impl Into<String>) -> Self {
        Self::with_authority_host(DEFAULT_AUTHORITY_HOST, tenant_id, client_id)
    }

    /// Provider with a custom authority host (sovereign clouds, tests)
    pub fn with_authority_host(
        authority_host: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            authority: format!("{}/{}", authority_host.trim_end_matches('/'), tenant_id),
            client_id: client_id.into(),
        }
    }

    /// Replace the HTTP client (timeouts, proxies)
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority)
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    /// Delegated scopes plus the reserved ones, space separated, no duplicates
    fn delegated_scope(scopes: &[String]) -> String {
        let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
        for reserved in RESERVED_SCOPES {
            if !all.iter().any(|s| s.eq_ignore_ascii_case(reserved)) {
                all.push(reserved);
            }
        }
        all.join(" ")
    }

    async fn post_token(
        &self,
        params: &[(&str, &str)],
    ) -> std::result::Result<TokenGrant, ProviderError> {
        let response = self.http.post(self.token_url()).form(params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                ProviderError::InvalidResponse(format!("token response: {}", e))
            });
        }

        Err(parse_error_body(status.as_u16(), &body))
    }
}

fn parse_error_body(status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => ProviderError::Rejected {
            error: err.error,
            description: err.error_description,
        },
        Err(_) => ProviderError::InvalidResponse(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl IdentityProvider for MicrosoftIdentityProvider {
    async fn initiate_device_flow(
        &self,
        scopes: &[String],
    ) -> std::result::Result<DeviceFlowChallenge, ProviderError> {
        let scope = Self::delegated_scope(scopes);
        debug!("Requesting device code from {}", self.device_code_url());

        let response = self
            .http
            .post(self.device_code_url())
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(parse_error_body(status.as_u16(), &body));
        }

        let raw: DeviceCodeResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("device code response: {}", e)))?;

        let user_code = raw.user_code.filter(|c| !c.is_empty()).ok_or_else(|| {
            ProviderError::InvalidResponse("device code response has no user_code".to_string())
        })?;
        let device_code = raw.device_code.ok_or_else(|| {
            ProviderError::InvalidResponse("device code response has no device_code".to_string())
        })?;
        let verification_uri = raw.verification_uri.ok_or_else(|| {
            ProviderError::InvalidResponse(
                "device code response has no verification_uri".to_string(),
            )
        })?;

        Ok(DeviceFlowChallenge {
            verification_uri,
            user_code,
            device_code,
            expires_in: raw.expires_in.unwrap_or(900),
            interval: raw.interval.unwrap_or(5),
            message: raw.message,
        })
    }

    async fn acquire_token_by_device_flow(
        &self,
        challenge: &DeviceFlowChallenge,
    ) -> std::result::Result<TokenGrant, ProviderError> {
        // An unrepresentable deadline means the code never expires locally
        let deadline =
            tokio::time::Instant::now().checked_add(Duration::from_secs(challenge.expires_in));
        let mut interval = Duration::from_secs(challenge.interval);

        loop {
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                return Err(ProviderError::rejected(
                    "expired_token",
                    "The device code expired before authorization completed",
                ));
            }

            tokio::time::sleep(interval).await;

            let result = self
                .post_token(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", challenge.device_code.as_str()),
                ])
                .await;

            match result {
                Ok(grant) => return Ok(grant),
                Err(e) if e.code() == Some("authorization_pending") => {
                    debug!("Device code authorization pending");
                }
                Err(e) if e.code() == Some("slow_down") => {
                    interval += Duration::from_secs(SLOW_DOWN_STEP_SECS);
                    debug!("Provider asked to slow down, polling every {:?}", interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire_token_by_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ProviderError> {
        let scope = Self::delegated_scope(scopes);
        self.post_token(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ])
        .await
    }

    async fn acquire_token_for_client(
        &self,
        client_secret: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ProviderError> {
        let scope = scopes.join(" ");
        self.post_token(&[
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret),
            ("scope", scope.as_str()),
        ])
        .await
    }
}
