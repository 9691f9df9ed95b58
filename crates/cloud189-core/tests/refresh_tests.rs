//! Session refresh tests for the signed API invoker.
//!
//! A wiremock server plays the API host. Requests are matched on the
//! `sessionkey` header so a stale session gets `InvalidSessionKey` and the
//! renewed one gets data.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};

async fn mount_space(server: &MockServer, session_key: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .and(header("sessionkey", session_key))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_token_exchange(server: &MockServer, response: ResponseTemplate, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/getSessionForPC.action"))
        .and(body_string_contains("accessToken=T1"))
        .and(body_string_contains("appId=9317140619"))
        .respond_with(response)
        .expect(expected)
        .mount(server)
        .await;
}

fn fresh_session_body() -> serde_json::Value {
    serde_json::json!({
        "res_code": 0,
        "sessionKey": "K2",
        "sessionSecret": "S2",
        "loginName": "alice@189.cn",
    })
}

#[tokio::test]
async fn test_valid_session_needs_no_refresh() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(&harness.mock_server, ResponseTemplate::new(500), 0).await;

    let space = harness.drive.space().await.expect("space");

    assert_eq!(space.used(), 1_000_000_000);
    assert_eq!(harness.drive.client().refresh_generation(), 0);
    assert_eq!(harness.request_count().await, 1);
}

#[tokio::test]
async fn test_expired_session_is_exchanged_and_retried() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_json(fresh_session_body()),
        1,
    )
    .await;

    let space = harness.drive.space().await.expect("space after refresh");
    assert_eq!(space.capacity, 2_199_023_255_552);

    // Merge keeps the access token the exchange did not return
    let stored = harness.store.session();
    assert_eq!(stored.key, "K2");
    assert_eq!(stored.secret, "S2");
    assert_eq!(stored.access_token, "T1");
    assert_eq!(stored.login_name, "alice@189.cn");
    assert_eq!(harness.login.calls(), 0);
    assert_eq!(harness.drive.client().refresh_generation(), 1);
}

#[tokio::test]
async fn test_unauthorized_status_triggers_refresh() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(&harness.mock_server, "K1", ResponseTemplate::new(401)).await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_json(fresh_session_body()),
        1,
    )
    .await;

    assert!(harness.drive.space().await.is_ok());
}

#[tokio::test]
async fn test_failed_refresh_surfaces_refresh_error() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .respond_with(ResponseTemplate::new(400).set_body_string(INVALID_SESSION))
        .expect(1)
        .mount(&harness.mock_server)
        .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(503).set_body_string("maintenance"),
        1,
    )
    .await;

    let err = harness.drive.space().await.unwrap_err();

    match err {
        ApiError::RefreshFailed(cause) => {
            assert!(matches!(cause.as_ref(), ApiError::ServerError(_)));
        }
        other => panic!("expected RefreshFailed, got {:?}", other),
    }
    // No retry after a failed refresh
    assert_eq!(harness.store.session().key, "K1");
}

#[tokio::test]
async fn test_retry_still_rejected_is_not_refreshed_again() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .respond_with(ResponseTemplate::new(400).set_body_string(INVALID_SESSION))
        .expect(2)
        .mount(&harness.mock_server)
        .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_json(fresh_session_body()),
        1,
    )
    .await;

    let err = harness.drive.space().await.unwrap_err();

    assert!(matches!(err, ApiError::AuthExpired(ref code) if code == "InvalidSessionKey"));
    assert_eq!(harness.drive.client().refresh_generation(), 1);
}

#[tokio::test]
async fn test_other_failures_do_not_refresh() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"res_code":"FileNotFound","res_message":"gone"}"#),
        )
        .expect(1)
        .mount(&harness.mock_server)
        .await;
    mount_token_exchange(&harness.mock_server, ResponseTemplate::new(500), 0).await;

    let err = harness.drive.space().await.unwrap_err();

    assert!(matches!(err, ApiError::Service { ref code, .. } if code == "FileNotFound"));
    assert_eq!(harness.drive.client().refresh_generation(), 0);
}

#[tokio::test]
async fn test_concurrent_expiry_shares_one_refresh() {
    const CALLERS: usize = 8;

    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200)
            .set_body_json(fresh_session_body())
            .set_delay(Duration::from_millis(100)),
        1,
    )
    .await;

    let calls = (0..CALLERS).map(|_| harness.drive.space());
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
    assert_eq!(harness.drive.client().refresh_generation(), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_refresh_failure() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(500)
            .set_body_string("down")
            .set_delay(Duration::from_millis(100)),
        1,
    )
    .await;

    let results =
        futures::future::join_all((0..4).map(|_| harness.drive.space())).await;

    for result in results {
        assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
    }
}

#[tokio::test]
async fn test_password_login_without_credential_needs_login() {
    let harness = TestHarness::new(Config::default(), MockLogin::rejecting()).await;

    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.mock_server)
        .await;

    let err = harness.drive.space().await.unwrap_err();

    assert!(matches!(err, ApiError::LoginRequired(_)));
    assert!(err.requires_login());
    assert_eq!(harness.login.calls(), 0);
    // Only the original request reached the network
    assert_eq!(harness.request_count().await, 1);
}

#[tokio::test]
async fn test_password_login_refresh_persists_session() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.json");
    let store = Arc::new(ConfigStore::open(&config_path));
    store
        .update(|c| *c = config_with(session("K1", "S1", "")))
        .unwrap();

    let harness =
        TestHarness::with_store(store, MockLogin::granting(session("K2", "S2", "T2"))).await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;

    harness.drive.space().await.expect("space after re-login");

    assert_eq!(harness.login.calls(), 1);
    let reopened = ConfigStore::open(&config_path).snapshot();
    assert_eq!(reopened.session.key, "K2");
    assert_eq!(reopened.session.access_token, "T2");
    assert_eq!(reopened.sson, "sson-fresh");
    assert_eq!(reopened.user.name, "alice");
    assert!(!harness.store.is_dirty());
}

#[tokio::test]
async fn test_rejected_password_login_is_refresh_failure() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;

    let err = harness.drive.space().await.unwrap_err();

    assert_eq!(harness.login.calls(), 1);
    match err {
        ApiError::RefreshFailed(cause) => {
            assert!(matches!(cause.as_ref(), ApiError::Service { code, .. } if code == "InvalidPassword"));
        }
        other => panic!("expected RefreshFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsaved_refresh_still_retries_and_marks_dirty() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "file").unwrap();

    // The config directory is a regular file, so every save fails
    let store = Arc::new(ConfigStore::open(blocker.join("config.json")));
    assert!(store
        .update(|c| *c = config_with(session("K1", "S1", "T1")))
        .is_err());

    let harness = TestHarness::with_store(store, MockLogin::rejecting()).await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_json(fresh_session_body()),
        1,
    )
    .await;

    harness.drive.space().await.expect("retry uses in-memory session");

    assert_eq!(harness.store.session().key, "K2");
    assert!(harness.drive.is_dirty());
    assert!(matches!(harness.drive.flush(), Err(ApiError::Persistence(_))));

    // Once the directory can be created the pending session is written
    fs::remove_file(&blocker).unwrap();
    harness.drive.flush().expect("flush after the blocker is gone");

    assert!(!harness.drive.is_dirty());
    let reopened = ConfigStore::open(blocker.join("config.json")).snapshot();
    assert_eq!(reopened.session.key, "K2");
    assert_eq!(reopened.session.secret, "S2");
}

#[tokio::test]
async fn test_empty_token_exchange_is_rejected() {
    let harness = TestHarness::new(
        config_with(session("K1", "S1", "T1")),
        MockLogin::rejecting(),
    )
    .await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_string(r#"{"res_code":0}"#),
        1,
    )
    .await;

    let err = harness.drive.space().await.unwrap_err();

    assert!(matches!(err, ApiError::RefreshFailed(_)));
    assert_eq!(harness.store.session().key, "K1");
}

#[tokio::test]
async fn test_exchange_without_secret_keeps_stored_pair() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.json");
    let store = Arc::new(ConfigStore::open(&config_path));
    store
        .update(|c| *c = config_with(session("K1", "S1", "T1")))
        .unwrap();

    let harness = TestHarness::with_store(store, MockLogin::rejecting()).await;

    mount_space(
        &harness.mock_server,
        "K1",
        ResponseTemplate::new(400).set_body_string(INVALID_SESSION),
    )
    .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;
    mount_token_exchange(
        &harness.mock_server,
        ResponseTemplate::new(200).set_body_string(r#"{"res_code":0,"sessionKey":"K2"}"#),
        1,
    )
    .await;

    let err = harness.drive.space().await.unwrap_err();

    match err {
        ApiError::RefreshFailed(cause) => {
            assert!(matches!(cause.as_ref(), ApiError::InvalidResponse(_)));
        }
        other => panic!("expected RefreshFailed, got {:?}", other),
    }
    let current = harness.store.session();
    assert_eq!((current.key.as_str(), current.secret.as_str()), ("K1", "S1"));
    let reopened = ConfigStore::open(&config_path).snapshot();
    assert_eq!(reopened.session.key, "K1");
    assert_eq!(reopened.session.secret, "S1");
    assert!(!harness.drive.is_dirty());
}

#[tokio::test]
async fn test_concurrent_expiry_shares_one_password_login() {
    const CALLERS: usize = 8;

    let harness = TestHarness::new(
        config_with(session("K1", "S1", "")),
        MockLogin::granting(session("K2", "S2", "T2")),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/getUserInfo.action"))
        .and(header("sessionkey", "K1"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(INVALID_SESSION)
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&harness.mock_server)
        .await;
    mount_space(
        &harness.mock_server,
        "K2",
        ResponseTemplate::new(200).set_body_json(space_body()),
    )
    .await;

    let calls = (0..CALLERS).map(|_| harness.drive.space());
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
    assert_eq!(harness.login.calls(), 1);
    assert_eq!(harness.drive.client().refresh_generation(), 1);
    assert_eq!(harness.store.session().key, "K2");
}
