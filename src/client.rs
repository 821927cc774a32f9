//! Microsoft Graph client with reauthorization and retry logic

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::SharedBroker;
use crate::error::{MailError, Result};

/// Graph v1.0 endpoint
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Extra attempts after the first transient failure
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Constant pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Per-request HTTP timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single authorized GET against the mail service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// Path relative to the base URL, e.g. `me/messages`
    pub endpoint: String,
    /// Query pairs, sent in this order
    pub query: Vec<(String, String)>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RequestSpec {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Trait for the authorized request surface, so mail operations can be
/// tested without a network
#[async_trait]
pub trait MailApi: Send + Sync {
    /// Perform the request and return the decoded JSON body
    async fn request(&self, spec: RequestSpec) -> Result<Value>;
}

/// Outcome of a single attempt that did not produce a body.
/// Only the retry loop sees these; callers get a [`MailError`].
#[derive(Debug)]
enum AttemptFailure {
    Unauthorized {
        message: String,
        body: Option<Value>,
    },
    Transient {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },
    Rejected {
        status: u16,
        message: String,
        body: Option<Value>,
    },
}

/// Graph client sharing a [`CredentialBroker`](crate::auth::CredentialBroker)
///
/// Every request:
/// - obtains a token from the broker (never prompts)
/// - on HTTP 401 refreshes silently once and retries once
/// - retries transient failures (network, 408, 429, 5xx, malformed JSON)
///   `max_retries` times with a constant delay
/// - fails immediately on any other 4xx
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    broker: SharedBroker,
}

impl GraphClient {
    /// Client for the public Graph endpoint
    pub fn new(broker: SharedBroker) -> Result<Self> {
        Self::with_options(broker, GRAPH_BASE_URL, DEFAULT_TIMEOUT)
    }

    pub fn with_options(
        broker: SharedBroker,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_http_client(broker, http, base_url))
    }

    pub fn with_http_client(
        broker: SharedBroker,
        http: reqwest::Client,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            broker,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn current_token(&self) -> Result<String> {
        self.broker.lock().await.get_valid_token().await
    }

    async fn attempt(&self, spec: &RequestSpec, token: &str) -> std::result::Result<Value, AttemptFailure> {
        let response = self
            .http
            .get(self.url_for(&spec.endpoint))
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .query(&spec.query)
            .send()
            .await
            .map_err(|e| AttemptFailure::Transient {
                status: None,
                message: MailError::from(e).to_string(),
                body: None,
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AttemptFailure::Transient {
            status: Some(status.as_u16()),
            message: MailError::from(e).to_string(),
            body: None,
        })?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| AttemptFailure::Transient {
                status: Some(status.as_u16()),
                message: format!("Malformed JSON body: {}", e),
                body: None,
            });
        }

        let body = serde_json::from_str::<Value>(&text).ok();
        let message = service_error_message(body.as_ref()).unwrap_or_else(|| {
            format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string()
        });

        Err(classify_status(status, message, body))
    }
}

fn classify_status(status: StatusCode, message: String, body: Option<Value>) -> AttemptFailure {
    match status {
        StatusCode::UNAUTHORIZED => AttemptFailure::Unauthorized { message, body },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => AttemptFailure::Transient {
            status: Some(status.as_u16()),
            message,
            body,
        },
        s if s.is_server_error() => AttemptFailure::Transient {
            status: Some(s.as_u16()),
            message,
            body,
        },
        s => AttemptFailure::Rejected {
            status: s.as_u16(),
            message,
            body,
        },
    }
}

/// `error.code: error.message` from a Graph error body
fn service_error_message(body: Option<&Value>) -> Option<String> {
    let error = body?.get("error")?;
    let message = error.get("message").and_then(Value::as_str);
    let code = error.get("code").and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
        (None, Some(message)) => Some(message.to_string()),
        (Some(code), None) => Some(code.to_string()),
        (None, None) => None,
    }
}

#[async_trait]
impl MailApi for GraphClient {
    async fn request(&self, spec: RequestSpec) -> Result<Value> {
        let mut token = self.current_token().await?;
        let mut attempts: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut reauthorized = false;

        loop {
            attempts += 1;
            debug!("GET {} (attempt {})", spec.endpoint, attempts);

            match self.attempt(&spec, &token).await {
                Ok(body) => return Ok(body),
                Err(AttemptFailure::Unauthorized { message, body }) => {
                    if reauthorized {
                        warn!("{} still unauthorized after token refresh", spec.endpoint);
                        return Err(MailError::RequestExhausted {
                            endpoint: spec.endpoint.clone(),
                            attempts,
                            status: Some(401),
                            message,
                            service_error: body,
                        });
                    }
                    reauthorized = true;
                    info!("{} returned 401, refreshing access token", spec.endpoint);
                    token = self.broker.lock().await.refresh_after_unauthorized().await?;
                }
                Err(AttemptFailure::Transient {
                    status,
                    message,
                    body,
                }) => {
                    if transient_failures >= spec.max_retries {
                        warn!(
                            "{} failed after {} attempt(s): {}",
                            spec.endpoint, attempts, message
                        );
                        return Err(MailError::RequestExhausted {
                            endpoint: spec.endpoint.clone(),
                            attempts,
                            status,
                            message,
                            service_error: body,
                        });
                    }
                    transient_failures += 1;
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        spec.endpoint,
                        transient_failures,
                        spec.max_retries + 1,
                        message,
                        spec.retry_delay
                    );
                    tokio::time::sleep(spec.retry_delay).await;
                    token = self.current_token().await?;
                }
                Err(AttemptFailure::Rejected {
                    status,
                    message,
                    body,
                }) => {
                    debug!("{} rejected with HTTP {}", spec.endpoint, status);
                    return Err(MailError::Rejected {
                        endpoint: spec.endpoint.clone(),
                        status,
                        message,
                        service_error: body,
                    });
                }
            }
        }
    }
}
