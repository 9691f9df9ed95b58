//! Password login against the cloud.189.cn PC login portal.
//!
//! 1. Load the unified login page and scrape its form tokens
//! 2. Fetch the RSA public key used to encrypt the user name and password
//! 3. Submit the encrypted credential and receive a redirect URL
//! 4. Trade the redirect URL for a session via `getSessionForPC.action`

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use rsa::pkcs8::DecodePublicKey;
use rsa::rand_core::OsRng;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Credential, Session};
use crate::api::{ApiClient, ApiError, ApiRequest};

/// Web portal hosting the login page
const WEB_URL: &str = "https://cloud.189.cn";

/// Account service handling key exchange and credential submission
const AUTH_URL: &str = "https://open.e.189.cn";

/// Session endpoint shared by password login and token exchange
pub const SESSION_PATH: &str = "/getSessionForPC.action";

const APP_KEY: &str = "8025431004";
const ACCOUNT_TYPE: &str = "02";
const LOGIN_CLIENT_TYPE: &str = "10020";
const RETURN_URL: &str = "https://m.cloud.189.cn/zhuanti/2020/loginErrorPc/index.html";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

static CAPTCHA_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'captchaToken' value='(.+?)'"#).unwrap());
static LT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"lt = "(.+?)""#).unwrap());
static REQ_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"reqId = "(.+?)""#).unwrap());
static PARAM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"paramId = "(.+?)""#).unwrap());

/// What a successful password login yields.
#[derive(Debug, Clone, Default)]
pub struct LoginGrant {
    pub session: Session,
    /// `SSON` cookie set by the account service, if any.
    pub sson: Option<String>,
}

/// Performs a full password login.
#[async_trait]
pub trait PasswordLogin: Send + Sync {
    async fn login(&self, client: &ApiClient, credential: &Credential)
        -> Result<LoginGrant, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoginForm {
    captcha_token: String,
    lt: String,
    req_id: String,
    param_id: String,
}

#[derive(Debug, Deserialize)]
struct EncryptConfResponse {
    result: i64,
    data: Option<EncryptConf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptConf {
    pub_key: String,
    #[serde(default)]
    pre: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginSubmitResponse {
    result: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    to_url: String,
}

/// [`PasswordLogin`] through the PC login portal.
#[derive(Debug, Clone)]
pub struct PortalLogin {
    http: Client,
    web_url: String,
    auth_url: String,
}

impl PortalLogin {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_urls(WEB_URL, AUTH_URL)
    }

    pub fn with_urls(web_url: &str, auth_url: &str) -> Result<Self, ApiError> {
        // The portal ties the form tokens to its cookies
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            web_url: web_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_login_form(&self) -> Result<LoginForm, ApiError> {
        let url = format!("{}/api/portal/unifyLoginForPC.action", self.web_url);
        let timestamp = Utc::now().timestamp_millis().to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("appId", APP_KEY),
                ("clientType", LOGIN_CLIENT_TYPE),
                ("returnURL", RETURN_URL),
                ("timeStamp", timestamp.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }
        parse_login_form(&body)
    }

    async fn fetch_encrypt_conf(&self) -> Result<EncryptConf, ApiError> {
        let url = format!("{}/api/logbox/config/encryptConf.do", self.auth_url);
        let response = self
            .http
            .post(&url)
            .form(&[("appId", "cloud")])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }

        let parsed: EncryptConfResponse = serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse encryption config: {}", e))
        })?;
        match parsed.data {
            Some(conf) if parsed.result == 0 => Ok(conf),
            _ => Err(ApiError::Service {
                code: parsed.result.to_string(),
                message: "encryption config unavailable".to_string(),
            }),
        }
    }

    async fn submit(
        &self,
        form: &LoginForm,
        conf: &EncryptConf,
        credential: &Credential,
    ) -> Result<(String, Option<String>), ApiError> {
        let user_name = format!("{}{}", conf.pre, rsa_encrypt(&conf.pub_key, &credential.name)?);
        let password = format!(
            "{}{}",
            conf.pre,
            rsa_encrypt(&conf.pub_key, &credential.password)?
        );

        let url = format!("{}/api/logbox/oauth2/loginSubmit.do", self.auth_url);
        let response = self
            .http
            .post(&url)
            .header("REQID", &form.req_id)
            .header("lt", &form.lt)
            .form(&[
                ("appKey", APP_KEY),
                ("accountType", ACCOUNT_TYPE),
                ("userName", user_name.as_str()),
                ("password", password.as_str()),
                ("validateCode", ""),
                ("captchaToken", form.captcha_token.as_str()),
                ("returnUrl", RETURN_URL),
                ("dynamicCheck", "FALSE"),
                ("clientType", LOGIN_CLIENT_TYPE),
                ("cb_SaveName", "1"),
                ("isOauth2", "false"),
                ("state", ""),
                ("paramId", form.param_id.as_str()),
            ])
            .send()
            .await?;

        let sson = response
            .cookies()
            .find(|c| c.name() == "SSON")
            .map(|c| c.value().to_string());

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }

        let parsed: LoginSubmitResponse = serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse login response: {}", e))
        })?;
        if parsed.result != 0 || parsed.to_url.is_empty() {
            return Err(ApiError::Service {
                code: parsed.result.to_string(),
                message: parsed.msg,
            });
        }
        Ok((parsed.to_url, sson))
    }
}

#[async_trait]
impl PasswordLogin for PortalLogin {
    async fn login(
        &self,
        client: &ApiClient,
        credential: &Credential,
    ) -> Result<LoginGrant, ApiError> {
        if credential.is_empty() {
            return Err(ApiError::LoginRequired("user name and password are required".into()));
        }

        debug!(user = %credential.name, "Starting password login");
        let form = self.fetch_login_form().await?;
        let conf = self.fetch_encrypt_conf().await?;
        let (redirect_url, sson) = self.submit(&form, &conf, credential).await?;

        let request = ApiRequest::post(SESSION_PATH).param("redirectURL", redirect_url);
        let session: Session = client.execute(&request).await?;
        if session.is_empty() {
            return Err(ApiError::InvalidResponse(
                "login succeeded but no session was issued".to_string(),
            ));
        }

        info!(user = %credential.name, "Password login succeeded");
        Ok(LoginGrant {
            session: session.issued_now(),
            sson,
        })
    }
}

fn parse_login_form(html: &str) -> Result<LoginForm, ApiError> {
    let capture = |regex: &Regex, name: &str| {
        regex
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ApiError::InvalidResponse(format!("login page is missing {}", name)))
    };

    Ok(LoginForm {
        captcha_token: capture(&CAPTCHA_TOKEN_REGEX, "captchaToken")?,
        lt: capture(&LT_REGEX, "lt")?,
        req_id: capture(&REQ_ID_REGEX, "reqId")?,
        param_id: capture(&PARAM_ID_REGEX, "paramId")?,
    })
}

/// RSA-PKCS#1 v1.5 encrypt `data` with a base64 DER public key; upper hex.
fn rsa_encrypt(public_key: &str, data: &str) -> Result<String, ApiError> {
    let der = base64::engine::general_purpose::STANDARD
        .decode(public_key.trim())
        .map_err(|e| ApiError::InvalidResponse(format!("Invalid public key encoding: {}", e)))?;
    let key = RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| ApiError::InvalidResponse(format!("Invalid public key: {}", e)))?;
    let encrypted = key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data.as_bytes())
        .map_err(|e| ApiError::InvalidResponse(format!("Encryption failed: {}", e)))?;
    Ok(hex::encode_upper(encrypted))
}
