//! Outlook Mail Reader
//!
//! Reads and filters mail from Microsoft 365 / Outlook through Microsoft
//! Graph, keeping the session authenticated with as few prompts as possible.
//!
//! # Overview
//!
//! - **Authentication**: device code flow, silent renewal from cached
//!   refresh tokens, client credentials, or a pre-acquired token
//! - **Token caching**: pluggable load/save hooks, atomic file cache
//! - **Requests**: reauthorize once on 401, bounded retry on transient failures
//! - **Filtering**: sender, keyword (literal or regex) and custom predicates
//! - **Formatting**: flat message projection with Outlook web deep links
//!
//! # Example Usage
//!
//! ```no_run
//! use outlook_mail_reader::{
//!     BrokerSettings, CredentialBroker, FileTokenCache, GraphClient, MailReader,
//!     MicrosoftIdentityProvider, SearchQuery,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = MicrosoftIdentityProvider::new("your-tenant-id", "your-client-id");
//!     let mut broker = CredentialBroker::with_token_cache(
//!         Arc::new(provider),
//!         BrokerSettings::default(),
//!         Arc::new(FileTokenCache::new(".outlook_token_cache.json")),
//!     )
//!     .await;
//!
//!     if broker.get_valid_token().await.is_err() {
//!         let challenge = broker.begin_interactive_auth().await?;
//!         println!("Open {} and enter {}", challenge.verification_uri, challenge.user_code);
//!         broker.complete_interactive_auth().await?;
//!     }
//!
//!     let client = GraphClient::new(broker.into_shared())?;
//!     let reader = MailReader::new(Arc::new(client));
//!
//!     let query = SearchQuery::new("alerts@example.com").keyword("failed");
//!     for message in reader.search_emails(&query).await? {
//!         let formatted = message.format();
//!         println!("{} {} {}", formatted.timestamp, formatted.subject, formatted.outlook_link);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - Credential broker and token lifecycle
//! - [`identity`] - Identity provider protocol (device code, refresh, client credentials)
//! - [`token_cache`] - Token cache persistence hooks
//! - [`client`] - Graph request client with reauthorization and retry
//! - [`reader`] - Mailbox operations
//! - [`filter`] - Message filtering
//! - [`models`] - Message records and formatting
//! - [`config`] - Configuration management
//! - [`cli`] - Command-line interface
//! - [`error`] - Error types and result aliases

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod models;
pub mod reader;
pub mod token_cache;

// Re-export commonly used types for convenience
pub use error::{MailError, Result};

// Credential lifecycle
pub use auth::{
    BrokerSettings, CachedAccount, Credential, CredentialBroker, CredentialState, SharedBroker,
};
pub use identity::{
    DeviceFlowChallenge, IdentityProvider, MicrosoftIdentityProvider, ProviderError, TokenGrant,
};
pub use token_cache::{FileTokenCache, MemoryTokenCache, TokenCacheBlob, TokenCacheStore};

// Requests and mailbox operations
pub use client::{GraphClient, MailApi, RequestSpec};
pub use reader::{ConnectionStatus, MailReader, SearchQuery};

// Filtering and models
pub use filter::{
    contains_keyword, filter_messages, is_from_sender, KeywordFilter, KeywordOptions,
    MessageFilter, MessagePredicate,
};
pub use models::{outlook_link, FormattedMessage, MessageRecord};

// Config types
pub use config::{AuthConfig, Config, GraphConfig, SearchConfig};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter};
