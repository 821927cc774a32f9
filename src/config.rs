use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{duration_from_secs, BrokerSettings, DEFAULT_EXPIRY_MARGIN_SECS};
use crate::client::GRAPH_BASE_URL;
use crate::error::{MailError, Result};
use crate::filter::KeywordOptions;
use crate::identity::{DEFAULT_AUTHORITY_HOST, DEFAULT_SCOPES};
use crate::reader::{SearchQuery, MAX_PAGE_SIZE};

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

const MIN_CLIENT_ID_LEN: usize = 10;
const MAX_RETRIES_LIMIT: u32 = 10;
/// Access tokens rarely live longer than this, so a larger margin renews on every call
const MAX_EXPIRY_MARGIN_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Enables the client-credential grant instead of the device code flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Pre-acquired token; skips every acquisition strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_access_token_ttl_secs")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            access_token_ttl_secs: default_access_token_ttl_secs(),
            token_cache_path: default_token_cache_path(),
            authority_host: default_authority_host(),
            scopes: default_scopes(),
            expiry_margin_secs: default_expiry_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default = "default_keyword")]
    pub keyword: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: u32,
    #[serde(default = "default_true")]
    pub search_in_subject: bool,
    #[serde(default = "default_true")]
    pub search_in_body: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub use_regex: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            sender: None,
            keyword: default_keyword(),
            max_items: default_max_items(),
            search_in_subject: true,
            search_in_body: true,
            case_sensitive: false,
            use_regex: false,
        }
    }
}

impl SearchConfig {
    pub fn keyword_options(&self) -> KeywordOptions {
        KeywordOptions {
            search_in_subject: self.search_in_subject,
            search_in_body: self.search_in_body,
            case_sensitive: self.case_sensitive,
            use_regex: self.use_regex,
        }
    }

    /// Search query for the configured sender, if one is set
    pub fn to_query(&self) -> Option<SearchQuery> {
        let sender = self.sender.as_deref()?;
        let mut query = SearchQuery::new(sender)
            .max_items(self.max_items)
            .options(self.keyword_options());
        if let Some(keyword) = &self.keyword {
            query = query.keyword(keyword.clone());
        }
        Some(query)
    }
}

fn default_access_token_ttl_secs() -> u64 {
    3600
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".outlook_token_cache.json")
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_expiry_margin_secs() -> i64 {
    DEFAULT_EXPIRY_MARGIN_SECS
}

fn default_base_url() -> String {
    GRAPH_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_keyword() -> Option<String> {
    Some("failed".to_string())
}

fn default_max_items() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        MailError::ConfigError(format!("Invalid value for {}: '{}' is not a number", key, value))
    })
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(MailError::ConfigError(format!(
            "Invalid value for {}: '{}' is not a boolean",
            key, value
        ))),
    }
}

/// Empty strings count as unset
fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Load variables from a `.env` file into the process environment.
///
/// Without an explicit path the usual `.env` lookup applies and a missing
/// file is fine. An explicit path that cannot be read is an error.
pub fn load_dotenv(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| {
                MailError::ConfigError(format!("Failed to load env file {:?}: {}", path, e))
            })?;
            tracing::debug!("Loaded environment from {:?}", path);
        }
        None => match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {:?}", path),
            Err(e) if e.not_found() => tracing::debug!("No .env file found"),
            Err(e) => {
                return Err(MailError::ConfigError(format!(
                    "Failed to load .env file: {}",
                    e
                )))
            }
        },
    }
    Ok(())
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // Missing file means defaults; credentials usually come from the environment
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MailError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MailError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate_settings()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    MailError::ConfigError(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| MailError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| MailError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; unset keys leave values alone
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        if let Some(v) = get("TENANT_ID") {
            self.auth.tenant_id = Some(v);
        }
        if let Some(v) = get("CLIENT_ID") {
            self.auth.client_id = Some(v);
        }
        if let Some(v) = get("CLIENT_SECRET") {
            self.auth.client_secret = Some(v);
        }
        if let Some(v) = get("ACCESS_TOKEN") {
            self.auth.access_token = Some(v);
        }
        if let Some(v) = get("TOKEN_CACHE_PATH") {
            self.auth.token_cache_path = PathBuf::from(v);
        }
        if let Some(v) = get("AUTHORITY_HOST") {
            self.auth.authority_host = v;
        }
        if let Some(v) = get("GRAPH_BASE_URL") {
            self.graph.base_url = v;
        }
        if let Some(v) = get("CONNECTION_RETRIES") {
            self.graph.max_retries = parse_env_number("CONNECTION_RETRIES", &v)?;
        }
        if let Some(v) = get("CONNECTION_RETRY_DELAY") {
            self.graph.retry_delay_secs = parse_env_number("CONNECTION_RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("SENDER_FILTER") {
            self.search.sender = Some(v);
        }
        if let Some(v) = get("KEYWORD") {
            self.search.keyword = Some(v);
        }
        if let Some(v) = get("MAX_ITEMS") {
            self.search.max_items = parse_env_number("MAX_ITEMS", &v)?;
        }
        if let Some(v) = get("SEARCH_IN_SUBJECT") {
            self.search.search_in_subject = parse_env_bool("SEARCH_IN_SUBJECT", &v)?;
        }
        if let Some(v) = get("SEARCH_IN_BODY") {
            self.search.search_in_body = parse_env_bool("SEARCH_IN_BODY", &v)?;
        }

        Ok(())
    }

    /// Full validation, including credentials
    pub fn validate(&self) -> Result<()> {
        self.validate_credentials()?;
        self.validate_settings()
    }

    /// Either an access token, or a tenant id plus a plausible client id
    pub fn validate_credentials(&self) -> Result<()> {
        if self.auth.access_token.is_some() {
            return Ok(());
        }

        match self.auth.tenant_id.as_deref() {
            Some(tenant) if !tenant.trim().is_empty() => {}
            _ => {
                return Err(MailError::ConfigError(
                    "Missing credentials: set auth.tenant_id and auth.client_id (TENANT_ID/CLIENT_ID) or provide an access token (ACCESS_TOKEN)"
                        .to_string(),
                ))
            }
        }

        match self.auth.client_id.as_deref() {
            Some(client) if client.trim().len() >= MIN_CLIENT_ID_LEN => Ok(()),
            Some(_) => Err(MailError::ConfigError(format!(
                "auth.client_id looks invalid (must be at least {} characters)",
                MIN_CLIENT_ID_LEN
            ))),
            None => Err(MailError::ConfigError(
                "Missing credentials: auth.client_id (CLIENT_ID) is required for authentication"
                    .to_string(),
            )),
        }
    }

    /// Everything except credentials, which may still come from the environment
    pub fn validate_settings(&self) -> Result<()> {
        if self.search.max_items == 0 || self.search.max_items > MAX_PAGE_SIZE {
            return Err(MailError::ConfigError(format!(
                "search.max_items must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        if !self.search.search_in_subject && !self.search.search_in_body {
            return Err(MailError::ConfigError(
                "At least one of search.search_in_subject or search.search_in_body must be enabled"
                    .to_string(),
            ));
        }

        if let Some(sender) = &self.search.sender {
            if !EMAIL_PATTERN.is_match(sender) {
                return Err(MailError::ConfigError(format!(
                    "search.sender '{}' is not a valid email address",
                    sender
                )));
            }
        }

        if self.graph.max_retries > MAX_RETRIES_LIMIT {
            return Err(MailError::ConfigError(format!(
                "graph.max_retries cannot exceed {}",
                MAX_RETRIES_LIMIT
            )));
        }

        if self.graph.timeout_secs == 0 {
            return Err(MailError::ConfigError(
                "graph.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !self.graph.base_url.starts_with("http://") && !self.graph.base_url.starts_with("https://")
        {
            return Err(MailError::ConfigError(format!(
                "graph.base_url must be an http(s) URL, got '{}'",
                self.graph.base_url
            )));
        }

        if self.auth.scopes.is_empty() {
            return Err(MailError::ConfigError(
                "auth.scopes cannot be empty".to_string(),
            ));
        }

        if !(0..=MAX_EXPIRY_MARGIN_SECS).contains(&self.auth.expiry_margin_secs) {
            return Err(MailError::ConfigError(format!(
                "auth.expiry_margin_secs must be between 0 and {}",
                MAX_EXPIRY_MARGIN_SECS
            )));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            scopes: self.auth.scopes.clone(),
            expiry_margin: duration_from_secs(
                u64::try_from(self.auth.expiry_margin_secs).unwrap_or_default(),
            ),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.graph.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.graph.timeout_secs)
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self::default();
        config.auth.tenant_id = Some("your-tenant-id".to_string());
        config.auth.client_id = Some("your-client-id".to_string());
        config.search.sender = Some("alerts@example.com".to_string());
        config.save(path).await
    }
}
