use thiserror::Error;

/// Type alias for Result with MailError
pub type Result<T> = std::result::Result<T, MailError>;

/// Error types for the Outlook mail reader
#[derive(Error, Debug)]
pub enum MailError {
    /// The identity provider refused to start a device code flow
    #[error("Failed to start interactive authentication: {0}")]
    AuthStartError(String),

    /// Interactive or client-credential exchange rejected by the provider
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Silent acquisition is exhausted; the caller must run the device code flow
    #[error("Interactive authentication required: {0}")]
    InteractiveAuthRequired(String),

    /// `complete_interactive_auth` was called without a pending challenge
    #[error("No device code flow in progress, call begin_interactive_auth first")]
    NoPendingDeviceFlow,

    /// Transport/HTTP failure after all retries were used
    #[error("Request to '{endpoint}' failed after {attempts} attempt(s): {message}")]
    RequestExhausted {
        endpoint: String,
        attempts: u32,
        status: Option<u16>,
        message: String,
        service_error: Option<serde_json::Value>,
    },

    /// Definitive rejection by the mail service (4xx other than 401/408/429)
    #[error("Request to '{endpoint}' rejected (HTTP {status}): {message}")]
    Rejected {
        endpoint: String,
        status: u16,
        message: String,
        service_error: Option<serde_json::Value>,
    },

    /// Keyword filter configured without any search scope
    #[error("Invalid filter configuration: {0}")]
    InvalidFilterSpec(String),

    /// Keyword pattern is not a valid regular expression
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Token cache could not be read, parsed or written
    #[error("Token cache error: {0}")]
    TokenCacheError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl MailError {
    /// True when the caller has to drive the device code flow before retrying
    pub fn requires_interactive_auth(&self) -> bool {
        matches!(
            self,
            MailError::InteractiveAuthRequired(_) | MailError::NoPendingDeviceFlow
        )
    }

    /// Structured error body returned by the service, if any
    pub fn service_error(&self) -> Option<&serde_json::Value> {
        match self {
            MailError::RequestExhausted { service_error, .. }
            | MailError::Rejected { service_error, .. } => service_error.as_ref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MailError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return MailError::InvalidResponse(error.to_string());
        }
        if error.is_timeout() {
            return MailError::NetworkError(format!("Request timed out: {}", error));
        }
        if error.is_connect() {
            return MailError::NetworkError(format!("Connection error: {}", error));
        }
        MailError::NetworkError(error.to_string())
    }
}
