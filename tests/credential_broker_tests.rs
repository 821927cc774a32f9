//! Credential broker against the Microsoft identity platform protocol
//!
//! Uses wiremock as the identity provider and real token cache stores.

mod common;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::*;
use outlook_mail_reader::auth::{BrokerSettings, CredentialBroker, CredentialState};
use outlook_mail_reader::error::MailError;
use outlook_mail_reader::token_cache::{FileTokenCache, MemoryTokenCache, TokenCacheStore};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn id_token(username: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        json!({"oid": "user-oid", "tid": "tenant-tid", "preferred_username": username})
            .to_string(),
    );
    format!("{}.{}.signature", header, claims)
}

async fn mount_device_code(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(device_code_path()))
        .and(body_string_contains("client_id=test-client-id-12345"))
        .and(body_string_contains("offline_access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

fn device_code_body() -> serde_json::Value {
    json!({
        "user_code": "ABCD-1234",
        "device_code": "dev-code",
        "verification_uri": "https://microsoft.com/devicelogin",
        "expires_in": 60,
        "interval": 0,
        "message": "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code ABCD-1234"
    })
}

/// Device flow that reports `authorization_pending` once, then succeeds
async fn mount_successful_device_flow(server: &MockServer) {
    mount_device_code(server, device_code_body()).await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("device_code=dev-code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(oauth_error("authorization_pending")))
        .up_to_n_times(1)
        .expect(1)
        .mount(server)
        .await;

    let mut grant = token_response("device-token", Some("device-refresh"));
    grant["id_token"] = json!(id_token("user@contoso.com"));
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("device_code=dev-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_device_flow_happy_path() {
    let server = MockServer::start().await;
    mount_successful_device_flow(&server).await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    assert_eq!(broker.state(), CredentialState::NoCredential);

    let challenge = broker.begin_interactive_auth().await.unwrap();
    assert_eq!(challenge.user_code, "ABCD-1234");
    assert_eq!(challenge.verification_uri, "https://microsoft.com/devicelogin");
    assert!(challenge.message.unwrap().contains("ABCD-1234"));
    assert_eq!(broker.state(), CredentialState::AwaitingInteractive);

    broker.complete_interactive_auth().await.unwrap();
    assert_eq!(broker.state(), CredentialState::Valid);
    assert_eq!(broker.get_valid_token().await.unwrap(), "device-token");

    let account = &broker.accounts()[0];
    assert_eq!(account.home_account_id, "user-oid.tenant-tid");
    assert_eq!(account.username.as_deref(), Some("user@contoso.com"));
}

#[tokio::test]
async fn test_device_flow_missing_user_code() {
    let server = MockServer::start().await;
    mount_device_code(
        &server,
        json!({
            "device_code": "dev-code",
            "verification_uri": "https://microsoft.com/devicelogin",
            "expires_in": 60,
            "interval": 0
        }),
    )
    .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    let err = broker.begin_interactive_auth().await.unwrap_err();
    assert!(matches!(err, MailError::AuthStartError(_)));
    assert_eq!(broker.state(), CredentialState::NoCredential);
}

#[tokio::test]
async fn test_device_flow_rejected_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(device_code_path()))
        .respond_with(ResponseTemplate::new(400).set_body_json(oauth_error("invalid_client")))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    let err = broker.begin_interactive_auth().await.unwrap_err();
    assert!(matches!(err, MailError::AuthStartError(_)));
    assert!(err.to_string().contains("invalid_client"));
}

#[tokio::test]
async fn test_device_flow_expired_code() {
    let server = MockServer::start().await;
    mount_device_code(&server, device_code_body()).await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(400).set_body_json(oauth_error("expired_token")))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    broker.begin_interactive_auth().await.unwrap();

    let err = broker.complete_interactive_auth().await.unwrap_err();
    assert!(matches!(err, MailError::AuthError(_)));
    assert!(err.to_string().contains("expired_token"));

    // The challenge was consumed; no automatic retry
    let err = broker.complete_interactive_auth().await.unwrap_err();
    assert!(matches!(err, MailError::NoPendingDeviceFlow));
}

#[tokio::test]
async fn test_complete_out_of_order() {
    let server = MockServer::start().await;
    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());

    let err = broker.complete_interactive_auth().await.unwrap_err();
    assert!(matches!(err, MailError::NoPendingDeviceFlow));
}

#[tokio::test]
async fn test_client_credentials_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_secret=app-secret"))
        .and(body_string_contains("graph.microsoft.com%2F.default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("app-token", None)))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    broker.acquire_token_for_client("app-secret").await.unwrap();

    assert_eq!(broker.get_valid_token().await.unwrap(), "app-token");
    assert!(broker.pending_challenge().is_none());
    assert!(!broker.has_cached_account());
}

#[tokio::test]
async fn test_client_credentials_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(oauth_error("invalid_client")))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    let err = broker.acquire_token_for_client("wrong").await.unwrap_err();
    assert!(matches!(err, MailError::AuthError(_)));
}

#[tokio::test]
async fn test_expiring_client_token_repeats_client_grant() {
    let server = MockServer::start().await;

    let mut short_lived = token_response("app-token-1", None);
    short_lived["expires_in"] = json!(60);
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(short_lived))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_secret=app-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("app-token-2", None)))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    broker.acquire_token_for_client("app-secret").await.unwrap();
    assert_eq!(broker.state(), CredentialState::Expiring);

    // No device code request is mounted; falling back to sign-in would fail here
    assert_eq!(broker.get_valid_token().await.unwrap(), "app-token-2");
    assert_eq!(broker.state(), CredentialState::Valid);
    assert!(broker.pending_challenge().is_none());
}

#[tokio::test]
async fn test_rejected_client_renewal_is_auth_error() {
    let server = MockServer::start().await;

    let mut short_lived = token_response("app-token-1", None);
    short_lived["expires_in"] = json!(60);
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(short_lived))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(oauth_error("invalid_client")))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    broker.acquire_token_for_client("app-secret").await.unwrap();

    let err = broker.get_valid_token().await.unwrap_err();
    assert!(matches!(err, MailError::AuthError(_)));
    assert!(!err.requires_interactive_auth());
}

#[tokio::test]
async fn test_device_code_with_huge_lifetime() {
    let server = MockServer::start().await;
    let mut body = device_code_body();
    body["expires_in"] = json!(u64::MAX);
    mount_device_code(&server, body).await;

    let mut grant = token_response("device-token", Some("device-refresh"));
    grant["expires_in"] = json!(u64::MAX);
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("device_code=dev-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker =
        CredentialBroker::new(Arc::new(identity_provider(&server)), BrokerSettings::default());
    broker.begin_interactive_auth().await.unwrap();
    broker.complete_interactive_auth().await.unwrap();

    assert_eq!(broker.state(), CredentialState::Valid);
    assert_eq!(broker.get_valid_token().await.unwrap(), "device-token");
}

#[tokio::test]
async fn test_cache_round_trip_enables_silent_acquisition() {
    let server = MockServer::start().await;
    mount_successful_device_flow(&server).await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=device-refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_response("silent-token", Some("next-refresh"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("token_cache.json");

    let mut first = CredentialBroker::with_token_cache(
        Arc::new(identity_provider(&server)),
        BrokerSettings::default(),
        Arc::new(FileTokenCache::new(&cache_path)),
    )
    .await;
    first.begin_interactive_auth().await.unwrap();
    first.complete_interactive_auth().await.unwrap();
    assert!(cache_path.exists());

    let mut second = CredentialBroker::with_token_cache(
        Arc::new(identity_provider(&server)),
        BrokerSettings::default(),
        Arc::new(FileTokenCache::new(&cache_path)),
    )
    .await;
    assert!(second.has_cached_account());
    assert_eq!(second.acquire_token_silent().await.unwrap(), "silent-token");
    assert_eq!(second.accounts()[0].refresh_token, "next-refresh");
}

#[tokio::test]
async fn test_serialized_blob_restores_account() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("renewed", None)))
        .expect(1)
        .mount(&server)
        .await;

    let source = cached_account_broker(&server, "cached-token", "refresh-1");
    let blob = source.lock().await.serialize_cache().unwrap();

    let store = Arc::new(MemoryTokenCache::with_blob(blob));
    let mut restored = CredentialBroker::with_token_cache(
        Arc::new(identity_provider(&server)),
        BrokerSettings::default(),
        store.clone(),
    )
    .await;

    assert_eq!(restored.get_valid_token().await.unwrap(), "cached-token");
    assert_eq!(restored.acquire_token_silent().await.unwrap(), "renewed");
    assert_eq!(store.save_count().await, 1);
}

#[tokio::test]
async fn test_corrupt_cache_file_is_ignored() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("token_cache.json");
    std::fs::write(&cache_path, "this is not a token cache").unwrap();

    let mut broker = CredentialBroker::with_token_cache(
        Arc::new(identity_provider(&server)),
        BrokerSettings::default(),
        Arc::new(FileTokenCache::new(&cache_path)),
    )
    .await;

    assert_eq!(broker.state(), CredentialState::NoCredential);
    let err = broker.get_valid_token().await.unwrap_err();
    assert!(err.requires_interactive_auth());
}

#[tokio::test]
async fn test_failed_save_does_not_fail_acquisition() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("app-token", None)))
        .expect(1)
        .mount(&server)
        .await;

    // The cache path is a directory, so every save fails
    let dir = tempdir().unwrap();
    let store = FileTokenCache::new(dir.path());
    assert!(store.load().await.is_err());

    let mut broker = CredentialBroker::with_token_cache(
        Arc::new(identity_provider(&server)),
        BrokerSettings::default(),
        Arc::new(store),
    )
    .await;

    broker.acquire_token_for_client("app-secret").await.unwrap();
    assert_eq!(broker.get_valid_token().await.unwrap(), "app-token");
}
