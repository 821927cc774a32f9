//! Credential lifecycle for Microsoft Graph
//!
//! [`CredentialBroker`] owns the access token, the cached accounts used for
//! silent renewal, and the pending device code challenge. Everything else in
//! the crate asks it for a token through [`CredentialBroker::get_valid_token`]
//! and never reads credential fields directly.
//!
//! State transitions:
//! - `NoCredential` → `AwaitingInteractive` via [`CredentialBroker::begin_interactive_auth`]
//! - `AwaitingInteractive` → `Valid` via [`CredentialBroker::complete_interactive_auth`]
//! - `Valid` → `Expiring` once less than the safety margin remains
//! - `Expiring`/`Expired` → `Valid` via silent acquisition (refresh token)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MailError, Result};
use crate::identity::{
    DeviceFlowChallenge, IdentityProvider, TokenGrant, CLIENT_CREDENTIAL_SCOPE, DEFAULT_SCOPES,
};
use crate::token_cache::{TokenCacheBlob, TokenCacheStore};

/// Tokens with less than this lifetime left are renewed before use
pub const DEFAULT_EXPIRY_MARGIN_SECS: i64 = 300;

const CACHE_FORMAT_VERSION: u32 = 1;

/// Broker shared between the request client and whoever drives interactive auth
pub type SharedBroker = Arc<Mutex<CredentialBroker>>;

/// Lifecycle state of the broker's credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    NoCredential,
    Valid,
    Expiring,
    Expired,
    AwaitingInteractive,
}

/// Seconds as a chrono duration, saturating instead of overflowing
pub(crate) fn duration_from_secs(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// An access token and when it stops being usable
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credential {
    fn from_grant(grant: &TokenGrant, now: DateTime<Utc>) -> Self {
        let lifetime = duration_from_secs(grant.expires_in);
        Self {
            access_token: grant.access_token.clone(),
            expires_at: now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
            refresh_token: grant.refresh_token.clone(),
        }
    }

    /// Time left before expiry (negative once expired)
    pub fn remaining(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    pub fn state(&self, margin: Duration) -> CredentialState {
        let remaining = self.remaining();
        if remaining <= Duration::zero() {
            CredentialState::Expired
        } else if remaining < margin {
            CredentialState::Expiring
        } else {
            CredentialState::Valid
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Account material kept for silent renewal
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    /// `<oid>.<tid>` from the ID token, else the username, else "default"
    pub home_account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub last_refreshed: DateTime<Utc>,
}

impl CachedAccount {
    /// Username when known, account id otherwise
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.home_account_id)
    }
}

impl fmt::Debug for CachedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAccount")
            .field("home_account_id", &self.home_account_id)
            .field("username", &self.username)
            .field("refresh_token", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("last_refreshed", &self.last_refreshed)
            .finish()
    }
}

/// On-disk layout of the token cache blob
#[derive(Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    accounts: Vec<CachedAccount>,
    #[serde(default)]
    access_token: Option<Credential>,
}

/// Subset of ID token claims used to identify the account
#[derive(Debug, Default, Deserialize)]
struct IdTokenClaims {
    oid: Option<String>,
    tid: Option<String>,
    preferred_username: Option<String>,
}

/// Read the claims of an ID token without verifying its signature.
/// The token came straight from the token endpoint over TLS.
fn decode_id_token_claims(id_token: &str) -> Option<IdTokenClaims> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn account_from_grant(
    grant: &TokenGrant,
    scopes: &[String],
    now: DateTime<Utc>,
) -> Option<CachedAccount> {
    let refresh_token = grant.refresh_token.clone()?;
    let claims = grant
        .id_token
        .as_deref()
        .and_then(decode_id_token_claims)
        .unwrap_or_default();

    let home_account_id = match (&claims.oid, &claims.tid) {
        (Some(oid), Some(tid)) => format!("{}.{}", oid, tid),
        _ => claims
            .preferred_username
            .clone()
            .unwrap_or_else(|| "default".to_string()),
    };

    Some(CachedAccount {
        home_account_id,
        username: claims.preferred_username,
        refresh_token,
        scopes: scopes.to_vec(),
        last_refreshed: now,
    })
}

/// Broker policy
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Delegated scopes for device code and refresh grants
    pub scopes: Vec<String>,
    /// Renew tokens with less than this lifetime left
    pub expiry_margin: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            expiry_margin: Duration::seconds(DEFAULT_EXPIRY_MARGIN_SECS),
        }
    }
}

/// Produces a currently valid access token for every outbound call
pub struct CredentialBroker {
    provider: Arc<dyn IdentityProvider>,
    cache_store: Option<Arc<dyn TokenCacheStore>>,
    settings: BrokerSettings,
    credential: Option<Credential>,
    accounts: Vec<CachedAccount>,
    pending_flow: Option<DeviceFlowChallenge>,
    /// Set once a client-credential grant succeeded; renewals repeat that grant
    client_secret: Option<String>,
}

impl fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("state", &self.state())
            .field("accounts", &self.accounts.len())
            .field("has_cache_store", &self.cache_store.is_some())
            .field("client_credentials", &self.client_secret.is_some())
            .finish()
    }
}

impl CredentialBroker {
    /// Broker without persistence
    pub fn new(provider: Arc<dyn IdentityProvider>, settings: BrokerSettings) -> Self {
        Self {
            provider,
            cache_store: None,
            settings,
            credential: None,
            accounts: Vec::new(),
            pending_flow: None,
            client_secret: None,
        }
    }

    /// Broker backed by a token cache.
    ///
    /// The stored blob is loaded before any acquisition. An unreadable or
    /// corrupt cache is logged and ignored, leaving the broker in
    /// `NoCredential`.
    pub async fn with_token_cache(
        provider: Arc<dyn IdentityProvider>,
        settings: BrokerSettings,
        store: Arc<dyn TokenCacheStore>,
    ) -> Self {
        let mut broker = Self::new(provider, settings);

        match store.load().await {
            Ok(Some(blob)) => match broker.deserialize_cache(&blob) {
                Ok(()) => info!(
                    "Loaded token cache with {} account(s)",
                    broker.accounts.len()
                ),
                Err(e) => warn!("Ignoring unreadable token cache: {}", e),
            },
            Ok(None) => debug!("Token cache is empty"),
            Err(e) => warn!("Failed to load token cache: {}", e),
        }

        broker.cache_store = Some(store);
        broker
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn state(&self) -> CredentialState {
        if self.pending_flow.is_some() {
            return CredentialState::AwaitingInteractive;
        }
        match &self.credential {
            None => CredentialState::NoCredential,
            Some(credential) => credential.state(self.settings.expiry_margin),
        }
    }

    pub fn accounts(&self) -> &[CachedAccount] {
        &self.accounts
    }

    pub fn has_cached_account(&self) -> bool {
        !self.accounts.is_empty()
    }

    /// Expiry of the current access token, if any
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.credential.as_ref().map(|c| c.expires_at)
    }

    pub fn pending_challenge(&self) -> Option<&DeviceFlowChallenge> {
        self.pending_flow.as_ref()
    }

    /// Return a token that is valid for at least the safety margin.
    ///
    /// Renews (exactly one attempt) when the token is expiring or expired:
    /// an application session repeats the client-credential grant, a user
    /// session redeems its refresh token. Fails with `InteractiveAuthRequired`
    /// when no silent path is left; this method never waits on the user.
    pub async fn get_valid_token(&mut self) -> Result<String> {
        if let Some(credential) = &self.credential {
            match credential.state(self.settings.expiry_margin) {
                CredentialState::Valid => return Ok(credential.access_token.clone()),
                state => debug!("Access token is {:?}, renewing", state),
            }
        }

        if self.client_secret.is_some() {
            return self.renew_client_token().await;
        }

        if self.accounts.is_empty() {
            return Err(MailError::InteractiveAuthRequired(
                "no valid access token and no cached account".to_string(),
            ));
        }

        self.acquire_token_silent().await
    }

    /// Redeem the most recently used account's refresh token
    pub async fn acquire_token_silent(&mut self) -> Result<String> {
        let Some(account) = self.accounts.first().cloned() else {
            return Err(MailError::InteractiveAuthRequired(
                "no cached account available for silent renewal".to_string(),
            ));
        };

        let scopes = if account.scopes.is_empty() {
            self.settings.scopes.clone()
        } else {
            account.scopes.clone()
        };

        debug!(
            "Attempting silent token acquisition for {}",
            account.display_name()
        );

        match self
            .provider
            .acquire_token_by_refresh_token(&account.refresh_token, &scopes)
            .await
        {
            Ok(grant) => {
                let token = self.record_grant(grant, Some(&account));
                self.persist().await;
                info!("Silently renewed access token for {}", account.display_name());
                Ok(token)
            }
            Err(e) => {
                warn!("Silent token acquisition failed: {}", e);
                Err(MailError::InteractiveAuthRequired(format!(
                    "silent renewal failed: {}",
                    e
                )))
            }
        }
    }

    /// Drop the current access token after the service rejected it, then
    /// try exactly one renewal
    pub async fn refresh_after_unauthorized(&mut self) -> Result<String> {
        self.invalidate_access_token();
        if self.client_secret.is_some() {
            return self.renew_client_token().await;
        }
        self.acquire_token_silent().await
    }

    /// Forget the current access token; cached accounts are kept
    pub fn invalidate_access_token(&mut self) {
        if self.credential.take().is_some() {
            debug!("Discarded current access token");
        }
    }

    /// Start the device code flow. The caller must show the verification
    /// URI and user code, then call [`Self::complete_interactive_auth`].
    pub async fn begin_interactive_auth(&mut self) -> Result<DeviceFlowChallenge> {
        info!("Starting device code flow");

        let challenge = self
            .provider
            .initiate_device_flow(&self.settings.scopes)
            .await
            .map_err(|e| MailError::AuthStartError(e.to_string()))?;

        if challenge.user_code.is_empty() {
            return Err(MailError::AuthStartError(
                "identity provider did not return a user code".to_string(),
            ));
        }

        self.pending_flow = Some(challenge.clone());
        Ok(challenge)
    }

    /// Wait for the user to finish the pending device code flow.
    ///
    /// The pending challenge is consumed whether or not this succeeds.
    pub async fn complete_interactive_auth(&mut self) -> Result<()> {
        let challenge = self
            .pending_flow
            .take()
            .ok_or(MailError::NoPendingDeviceFlow)?;

        let grant = self
            .provider
            .acquire_token_by_device_flow(&challenge)
            .await
            .map_err(|e| {
                warn!("Device code flow failed: {}", e);
                MailError::AuthError(e.to_string())
            })?;

        self.client_secret = None;
        self.record_grant(grant, None);
        self.persist().await;
        info!("Interactive authentication completed");
        Ok(())
    }

    /// Client-credential grant for service-to-service access.
    /// Does not touch the device code state. Later renewals repeat the grant
    /// with the same secret.
    pub async fn acquire_token_for_client(&mut self, client_secret: &str) -> Result<()> {
        self.grant_client_token(client_secret).await?;
        self.client_secret = Some(client_secret.to_string());
        info!("Acquired application token with client credentials");
        Ok(())
    }

    /// Switch to application mode without a network call; the next
    /// [`Self::get_valid_token`] grants a token if none is usable
    pub fn use_client_credentials(&mut self, client_secret: impl Into<String>) {
        self.client_secret = Some(client_secret.into());
    }

    /// True when renewals go through the client-credential grant
    pub fn uses_client_credentials(&self) -> bool {
        self.client_secret.is_some()
    }

    async fn renew_client_token(&mut self) -> Result<String> {
        let Some(secret) = self.client_secret.clone() else {
            return Err(MailError::InteractiveAuthRequired(
                "no client credentials to renew with".to_string(),
            ));
        };
        debug!("Renewing application token with client credentials");
        let token = self.grant_client_token(&secret).await?;
        info!("Renewed application token");
        Ok(token)
    }

    async fn grant_client_token(&mut self, client_secret: &str) -> Result<String> {
        let scopes = vec![CLIENT_CREDENTIAL_SCOPE.to_string()];

        let grant = self
            .provider
            .acquire_token_for_client(client_secret, &scopes)
            .await
            .map_err(|e| {
                warn!("Client credential grant failed: {}", e);
                MailError::AuthError(e.to_string())
            })?;

        let credential = Credential::from_grant(&grant, Utc::now());
        let token = credential.access_token.clone();
        self.credential = Some(credential);
        self.persist().await;
        Ok(token)
    }

    /// Use an externally obtained token until `now + ttl`
    pub fn set_access_token(&mut self, token: impl Into<String>, ttl: std::time::Duration) {
        let lifetime = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        self.client_secret = None;
        self.credential = Some(Credential {
            access_token: token.into(),
            expires_at: Utc::now()
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            refresh_token: None,
        });
        debug!("Access token set directly, expires at {:?}", self.token_expiry());
    }

    /// Serialize accounts and the current access token
    pub fn serialize_cache(&self) -> Result<TokenCacheBlob> {
        let document = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            accounts: self.accounts.clone(),
            access_token: self.credential.clone(),
        };
        Ok(TokenCacheBlob::new(serde_json::to_string(&document)?))
    }

    /// Replace accounts and access token with the blob's content.
    /// On error the broker is left untouched.
    pub fn deserialize_cache(&mut self, blob: &TokenCacheBlob) -> Result<()> {
        let document: CacheDocument = serde_json::from_str(blob.as_str())
            .map_err(|e| MailError::TokenCacheError(format!("corrupt token cache: {}", e)))?;

        if document.version != CACHE_FORMAT_VERSION {
            return Err(MailError::TokenCacheError(format!(
                "unsupported token cache version {}",
                document.version
            )));
        }

        self.accounts = document.accounts;
        self.credential = document.access_token;
        Ok(())
    }

    /// Store a successful grant; returns the new access token
    fn record_grant(&mut self, grant: TokenGrant, previous: Option<&CachedAccount>) -> String {
        let now = Utc::now();
        let mut credential = Credential::from_grant(&grant, now);

        let account = match previous {
            Some(prev) => Some(CachedAccount {
                refresh_token: grant
                    .refresh_token
                    .clone()
                    .unwrap_or_else(|| prev.refresh_token.clone()),
                last_refreshed: now,
                ..prev.clone()
            }),
            None => account_from_grant(&grant, &self.settings.scopes, now),
        };

        if let Some(account) = account {
            if credential.refresh_token.is_none() {
                credential.refresh_token = Some(account.refresh_token.clone());
            }
            self.upsert_account(account);
        }

        let token = credential.access_token.clone();
        self.credential = Some(credential);
        token
    }

    /// Most recently refreshed account goes first
    fn upsert_account(&mut self, account: CachedAccount) {
        self.accounts
            .retain(|a| a.home_account_id != account.home_account_id);
        self.accounts.insert(0, account);
    }

    async fn persist(&self) {
        let Some(store) = &self.cache_store else {
            return;
        };

        let blob = match self.serialize_cache() {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Failed to serialize token cache: {}", e);
                return;
            }
        };

        if let Err(e) = store.save(&blob).await {
            warn!("Failed to save token cache: {}", e);
        }
    }
}
