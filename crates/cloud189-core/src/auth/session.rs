use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Renewable credential bundle used to sign and authorize API calls.
///
/// Field names follow the `getSessionForPC.action` payload so the same type
/// decodes refresh responses and round-trips through the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionKey", default)]
    pub key: String,
    #[serde(rename = "sessionSecret", default)]
    pub secret: String,
    #[serde(rename = "accessToken", default)]
    pub access_token: String,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(rename = "familySessionKey", default, skip_serializing_if = "String::is_empty")]
    pub family_session_key: String,
    #[serde(rename = "familySessionSecret", default, skip_serializing_if = "String::is_empty")]
    pub family_session_secret: String,
    #[serde(rename = "loginName", default, skip_serializing_if = "String::is_empty")]
    pub login_name: String,
    #[serde(rename = "issuedAt", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
}

impl Session {
    /// No signing material yet. Requests go out unsigned.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() || self.secret.is_empty()
    }

    /// An access token is held, so the session can be renewed by token
    /// exchange instead of a password login.
    pub fn is_login(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Fold the fields of a refresh response into this session.
    ///
    /// Fields the response leaves blank keep their current value.
    pub fn merge(&mut self, fresh: &Session) {
        fn take(current: &mut String, incoming: &str) -> bool {
            if incoming.is_empty() || current == incoming {
                return false;
            }
            *current = incoming.to_string();
            true
        }

        let mut changed = false;
        changed |= take(&mut self.key, &fresh.key);
        changed |= take(&mut self.secret, &fresh.secret);
        changed |= take(&mut self.access_token, &fresh.access_token);
        changed |= take(&mut self.refresh_token, &fresh.refresh_token);
        changed |= take(&mut self.family_session_key, &fresh.family_session_key);
        changed |= take(&mut self.family_session_secret, &fresh.family_session_secret);
        changed |= take(&mut self.login_name, &fresh.login_name);

        if changed {
            self.issued_at = Some(fresh.issued_at.unwrap_or_else(Utc::now));
        }
    }

    /// Stamp a freshly negotiated session with its issue time.
    pub fn issued_now(mut self) -> Self {
        self.issued_at = Some(Utc::now());
        self
    }
}

/// Long-lived user name and password, only used when no session or access
/// token can be exchanged.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

impl Credential {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}
