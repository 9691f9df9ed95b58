//! Shared fixtures for the cloud189-core integration tests.
//!
//! Each test gets its own wiremock servers standing in for the API and upload
//! hosts and a `Cloud189` wired to them with a scripted password login.

// Not every test file uses every helper
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

pub use cloud189_core::auth::{LoginGrant, PasswordLogin};
pub use cloud189_core::{
    ApiClient, ApiError, Cloud189, Config, ConfigStore, Credential, Drive, Session,
};
pub use wiremock::{Mock, MockServer, ResponseTemplate};

/// Payload the service sends for a stale session.
pub const INVALID_SESSION: &str =
    r#"{"errorCode":"InvalidSessionKey","errorMsg":"session not found"}"#;

/// Password login that answers from a script and counts its calls.
pub struct MockLogin {
    calls: AtomicUsize,
    grant: Option<LoginGrant>,
}

impl MockLogin {
    pub fn granting(session: Session) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            grant: Some(LoginGrant {
                session,
                sson: Some("sson-fresh".to_string()),
            }),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            grant: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PasswordLogin for MockLogin {
    async fn login(
        &self,
        _client: &ApiClient,
        credential: &Credential,
    ) -> Result<LoginGrant, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if credential.is_empty() {
            return Err(ApiError::LoginRequired("no credential".into()));
        }
        self.grant.clone().ok_or_else(|| ApiError::Service {
            code: "InvalidPassword".into(),
            message: "wrong password".into(),
        })
    }
}

pub fn session(key: &str, secret: &str, access_token: &str) -> Session {
    Session {
        key: key.into(),
        secret: secret.into(),
        access_token: access_token.into(),
        ..Default::default()
    }
}

/// Config holding a stored credential and the given session.
pub fn config_with(session: Session) -> Config {
    Config {
        user: Credential::new("alice", "hunter2"),
        session,
        ..Default::default()
    }
}

pub struct TestHarness {
    pub mock_server: MockServer,
    pub upload_server: MockServer,
    pub store: Arc<ConfigStore>,
    pub login: Arc<MockLogin>,
    pub drive: Cloud189,
}

impl TestHarness {
    /// Harness over an in-memory store.
    pub async fn new(config: Config, login: MockLogin) -> Self {
        Self::with_store(Arc::new(ConfigStore::in_memory(config)), login).await
    }

    pub async fn with_store(store: Arc<ConfigStore>, login: MockLogin) -> Self {
        let mock_server = MockServer::start().await;
        let upload_server = MockServer::start().await;
        let login = Arc::new(login);
        let drive = Cloud189::with_urls(
            Arc::clone(&store),
            &mock_server.uri(),
            &upload_server.uri(),
            Arc::clone(&login) as Arc<dyn PasswordLogin>,
        )
        .expect("client builds");

        Self {
            mock_server,
            upload_server,
            store,
            login,
            drive,
        }
    }

    pub async fn request_count(&self) -> usize {
        self.mock_server
            .received_requests()
            .await
            .map(|r| r.len())
            .unwrap_or_default()
    }
}

pub fn space_body() -> serde_json::Value {
    serde_json::json!({
        "res_code": 0,
        "capacity": 2_199_023_255_552u64,
        "available": 2_198_023_255_552u64,
    })
}
