//! Common test utilities and fixtures
#![allow(dead_code)]

use mockall::mock;
use outlook_mail_reader::auth::{BrokerSettings, CredentialBroker, SharedBroker};
use outlook_mail_reader::client::{GraphClient, MailApi, RequestSpec};
use outlook_mail_reader::error::Result;
use outlook_mail_reader::identity::MicrosoftIdentityProvider;
use outlook_mail_reader::models::MessageRecord;
use outlook_mail_reader::token_cache::TokenCacheBlob;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

pub const TENANT: &str = "test-tenant";
pub const CLIENT_ID: &str = "test-client-id-12345";

/// Path of the token endpoint on the mock identity server
pub fn token_path() -> String {
    format!("/{}/oauth2/v2.0/token", TENANT)
}

pub fn device_code_path() -> String {
    format!("/{}/oauth2/v2.0/devicecode", TENANT)
}

/// Graph base URL on the mock server
pub fn graph_base(server: &MockServer) -> String {
    format!("{}/v1.0", server.uri())
}

pub fn identity_provider(server: &MockServer) -> MicrosoftIdentityProvider {
    MicrosoftIdentityProvider::with_authority_host(&server.uri(), TENANT, CLIENT_ID)
}

/// Graph message JSON as returned by `me/messages`
pub fn graph_message(id: &str, sender: &str, subject: &str, preview: &str) -> Value {
    json!({
        "id": id,
        "subject": subject,
        "bodyPreview": preview,
        "body": {"contentType": "text", "content": format!("{} {}", subject, preview)},
        "from": {"emailAddress": {"address": sender, "name": "Test Sender"}},
        "receivedDateTime": "2023-09-18T10:30:00Z"
    })
}

pub fn create_test_message(id: &str, sender: &str, subject: &str) -> MessageRecord {
    serde_json::from_value(graph_message(id, sender, subject, "Preview text")).unwrap()
}

/// The PayPal failure notification used across filter tests
pub fn paypal_failure_message() -> MessageRecord {
    serde_json::from_value(graph_message(
        "test-message-id",
        "FASTRAPP@paypal.com",
        "Test Subject with Failed Notification",
        "This is a test message that contains the word failed",
    ))
    .unwrap()
}

pub fn graph_page(messages: Vec<Value>) -> Value {
    json!({ "value": messages })
}

pub fn token_response(access_token: &str, refresh_token: Option<&str>) -> Value {
    let mut body = json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "expires_in": 3600,
        "scope": "Mail.Read User.Read"
    });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = json!(refresh);
    }
    body
}

pub fn oauth_error(error: &str) -> Value {
    json!({"error": error, "error_description": format!("{} (test)", error)})
}

/// Cache blob with one account and a still-valid access token
pub fn cached_session_blob(access_token: &str, refresh_token: &str) -> TokenCacheBlob {
    TokenCacheBlob::new(
        json!({
            "version": 1,
            "accounts": [{
                "home_account_id": "oid-1.tid-1",
                "username": "user@contoso.com",
                "refresh_token": refresh_token,
                "scopes": ["Mail.Read", "User.Read"],
                "last_refreshed": "2024-01-01T00:00:00Z"
            }],
            "access_token": {
                "access_token": access_token,
                "expires_at": "2099-01-01T00:00:00Z"
            }
        })
        .to_string(),
    )
}

/// Broker holding a directly injected token; no cached account
pub fn static_token_broker(server: &MockServer, token: &str) -> SharedBroker {
    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(server)), BrokerSettings::default());
    broker.set_access_token(token, Duration::from_secs(3600));
    broker.into_shared()
}

/// Broker restored from a cache with an account that can be silently refreshed
pub fn cached_account_broker(server: &MockServer, token: &str, refresh: &str) -> SharedBroker {
    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(server)), BrokerSettings::default());
    broker
        .deserialize_cache(&cached_session_blob(token, refresh))
        .unwrap();
    broker.into_shared()
}

pub fn graph_client(server: &MockServer, broker: SharedBroker) -> GraphClient {
    GraphClient::with_options(broker, graph_base(server), Duration::from_secs(5)).unwrap()
}

/// Request spec with a short retry delay
pub fn fast_spec(endpoint: &str, max_retries: u32) -> RequestSpec {
    RequestSpec::get(endpoint)
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(10))
}

mock! {
    pub MailApi {}

    #[async_trait::async_trait]
    impl MailApi for MailApi {
        async fn request(&self, spec: RequestSpec) -> Result<Value>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_message() {
        let msg = create_test_message("msg1", "test@example.com", "Test Subject");
        assert_eq!(msg.id, "msg1");
        assert_eq!(msg.sender_address(), Some("test@example.com"));
        assert_eq!(msg.subject(), "Test Subject");
    }

    #[test]
    fn test_token_response() {
        let body = token_response("abc", Some("refresh"));
        assert_eq!(body["access_token"], "abc");
        assert_eq!(body["refresh_token"], "refresh");
        assert!(token_response("abc", None).get("refresh_token").is_none());
    }

    #[test]
    fn test_graph_page() {
        let page = graph_page(vec![graph_message("a", "x@y.com", "s", "p")]);
        assert_eq!(page["value"].as_array().unwrap().len(), 1);
    }
}
