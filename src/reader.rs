//! Mailbox operations on top of [`MailApi`]

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{MailApi, RequestSpec, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::error::{MailError, Result};
use crate::filter::{KeywordOptions, MessageFilter};
use crate::models::{MessageRecord, MESSAGE_SELECT_FIELDS};

/// Largest page Graph returns for `me/messages`
pub const MAX_PAGE_SIZE: u32 = 999;

pub const DEFAULT_MAX_ITEMS: u32 = 25;

/// Parameters for [`MailReader::search_emails`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub sender: String,
    /// `None` or empty keeps every message from the sender
    pub keyword: Option<String>,
    pub max_items: u32,
    pub options: KeywordOptions,
}

impl SearchQuery {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            keyword: None,
            max_items: DEFAULT_MAX_ITEMS,
            options: KeywordOptions::default(),
        }
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn max_items(mut self, max_items: u32) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn options(mut self, options: KeywordOptions) -> Self {
        self.options = options;
        self
    }
}

/// Result of [`MailReader::test_connection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected { user_principal_name: String },
    Failed { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }
}

/// OData string literal: wrapped in single quotes, embedded quotes doubled
pub fn odata_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Filter expression selecting messages from one sender address
pub fn sender_filter_query(sender: &str) -> String {
    format!("from/emailAddress/address eq {}", odata_string_literal(sender))
}

pub struct MailReader {
    api: Arc<dyn MailApi>,
    max_retries: u32,
    retry_delay: Duration,
}

impl MailReader {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self {
            api,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    fn spec(&self, endpoint: &str) -> RequestSpec {
        RequestSpec::get(endpoint)
            .max_retries(self.max_retries)
            .retry_delay(self.retry_delay)
    }

    /// Most recent messages first, at most `max_items` (clamped to 1..=999).
    /// `filter_query` is passed through as `$filter` untouched.
    pub async fn get_messages(
        &self,
        max_items: u32,
        filter_query: Option<&str>,
    ) -> Result<Vec<MessageRecord>> {
        let top = max_items.clamp(1, MAX_PAGE_SIZE);
        let mut spec = self
            .spec("me/messages")
            .query("$select", MESSAGE_SELECT_FIELDS)
            .query("$orderby", "receivedDateTime DESC")
            .query("$top", top.to_string());
        if let Some(filter) = filter_query {
            spec = spec.query("$filter", filter);
        }

        let body = self.api.request(spec).await?;
        let messages = parse_message_page(body)?;
        debug!("Retrieved {} message(s)", messages.len());
        Ok(messages)
    }

    pub async fn get_messages_from_sender(
        &self,
        sender: &str,
        max_items: u32,
    ) -> Result<Vec<MessageRecord>> {
        self.get_messages(max_items, Some(&sender_filter_query(sender)))
            .await
    }

    /// Messages from the query's sender, narrowed by keyword when one is given
    pub async fn search_emails(&self, query: &SearchQuery) -> Result<Vec<MessageRecord>> {
        let filter = match query.keyword.as_deref() {
            Some(keyword) if !keyword.is_empty() => {
                MessageFilter::new().keyword(keyword, query.options)?
            }
            _ => MessageFilter::new(),
        };

        let messages = self
            .get_messages_from_sender(&query.sender, query.max_items)
            .await?;
        if messages.is_empty() {
            info!("No messages found from sender: {}", query.sender);
            return Ok(messages);
        }

        Ok(filter.apply(messages))
    }

    /// Fetch the signed-in user; never fails
    pub async fn test_connection(&self) -> ConnectionStatus {
        match self.api.request(self.spec("me")).await {
            Ok(profile) => {
                let user_principal_name = profile
                    .get("userPrincipalName")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string();
                info!("Connected as {}", user_principal_name);
                ConnectionStatus::Connected {
                    user_principal_name,
                }
            }
            Err(e) => {
                warn!("Connection test failed: {}", e);
                ConnectionStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Check each scope the reader needs with a minimal request
    pub async fn check_permissions(&self) -> BTreeMap<String, bool> {
        let checks = [
            ("User.Read", self.spec("me")),
            ("Mail.Read", self.spec("me/messages").query("$top", "1")),
        ];

        let mut results = BTreeMap::new();
        for (scope, spec) in checks {
            let granted = match self.api.request(spec).await {
                Ok(_) => true,
                Err(e) => {
                    debug!("Permission check for {} failed: {}", scope, e);
                    false
                }
            };
            results.insert(scope.to_string(), granted);
        }
        results
    }
}

fn parse_message_page(body: Value) -> Result<Vec<MessageRecord>> {
    match body {
        Value::Object(mut map) => match map.remove("value") {
            Some(value @ Value::Array(_)) => serde_json::from_value(value)
                .map_err(|e| MailError::InvalidResponse(format!("Unexpected message shape: {}", e))),
            _ => Ok(Vec::new()),
        },
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sender_filter_query() {
        assert_eq!(
            sender_filter_query("FASTRAPP@paypal.com"),
            "from/emailAddress/address eq 'FASTRAPP@paypal.com'"
        );
        assert_eq!(
            sender_filter_query("o'brien@example.com"),
            "from/emailAddress/address eq 'o''brien@example.com'"
        );
    }

    #[test]
    fn test_parse_message_page() {
        let messages =
            parse_message_page(json!({"value": [{"id": "a"}, {"id": "b", "subject": "Hi"}]}))
                .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].subject(), "Hi");

        assert!(parse_message_page(json!({})).unwrap().is_empty());
        assert!(parse_message_page(json!({"value": null})).unwrap().is_empty());
        assert!(parse_message_page(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_message_page_bad_shape() {
        let err = parse_message_page(json!({"value": [{"id": 42}]})).unwrap_err();
        assert!(matches!(err, MailError::InvalidResponse(_)));
    }

    #[test]
    fn test_search_query_builder() {
        let query = SearchQuery::new("alerts@example.com")
            .keyword("failed")
            .max_items(50);
        assert_eq!(query.sender, "alerts@example.com");
        assert_eq!(query.keyword.as_deref(), Some("failed"));
        assert_eq!(query.max_items, 50);
        assert_eq!(query.options, KeywordOptions::default());
    }

    #[test]
    fn test_connection_status() {
        assert!(ConnectionStatus::Connected {
            user_principal_name: "me@contoso.com".to_string()
        }
        .is_connected());
        assert!(!ConnectionStatus::Failed {
            reason: "nope".to_string()
        }
        .is_connected());
    }
}
