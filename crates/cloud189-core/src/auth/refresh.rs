use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::login::{PasswordLogin, SESSION_PATH};
use super::Session;
use crate::api::{ApiClient, ApiError, ApiRequest, Refresh};
use crate::config::{Config, ConfigStore};

/// Application id presented when exchanging an access token.
const TOKEN_EXCHANGE_APP_ID: &str = "9317140619";

/// Renews the session held by a [`ConfigStore`].
///
/// With an access token the session is exchanged for a new one; otherwise
/// the stored credential is used for a full password login. The branch is
/// picked from the session state at call time.
pub struct SessionRefresher {
    store: Arc<ConfigStore>,
    login: Arc<dyn PasswordLogin>,
}

impl SessionRefresher {
    pub fn new(store: Arc<ConfigStore>, login: Arc<dyn PasswordLogin>) -> Self {
        Self { store, login }
    }

    async fn exchange_token(&self, client: &ApiClient, access_token: &str) -> Result<(), ApiError> {
        debug!("Exchanging access token for a new session");
        let request = ApiRequest::post(SESSION_PATH)
            .param("appId", TOKEN_EXCHANGE_APP_ID)
            .param("accessToken", access_token);
        let fresh: Session = client.execute(&request).await?;
        // Key and secret only work as a pair; never merge one without the other
        if fresh.is_empty() {
            return Err(ApiError::InvalidResponse(
                "token exchange returned an incomplete session".to_string(),
            ));
        }

        self.commit(|config| config.session.merge(&fresh));
        Ok(())
    }

    async fn password_login(&self, client: &ApiClient) -> Result<(), ApiError> {
        let credential = self.store.credential();
        if credential.is_empty() {
            return Err(ApiError::LoginRequired(
                "no stored credential, log in interactively".to_string(),
            ));
        }

        let grant = self.login.login(client, &credential).await?;

        self.commit(|config| {
            config.session = grant.session;
            if let Some(sson) = grant.sson {
                config.sson = sson;
            }
        });
        Ok(())
    }

    /// Apply `mutate` and persist. A failed write keeps the new session in
    /// memory for the pending retry and leaves the store dirty.
    fn commit<F: FnOnce(&mut Config)>(&self, mutate: F) {
        if let Err(e) = self.store.update(mutate) {
            error!(error = %e, "Refreshed session could not be persisted");
        }
    }
}

#[async_trait]
impl Refresh for SessionRefresher {
    async fn refresh(&self, client: &ApiClient) -> Result<(), ApiError> {
        let session = self.store.session();
        if session.is_login() {
            self.exchange_token(client, &session.access_token).await?;
        } else {
            self.password_login(client).await?;
        }
        info!("Session renewed");
        Ok(())
    }
}
