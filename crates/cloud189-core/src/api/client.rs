//! Authenticated request invoker.
//!
//! `ApiClient::invoke` signs a request, sends it, classifies the reply and,
//! when the service reports an invalid session, runs the refresh hook once
//! and resends a freshly signed copy once. Concurrent callers that hit an
//! expired session together share a single refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ApiError;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Service error codes that mean the session must be renewed.
const AUTH_EXPIRED_CODES: &[&str] = &[
    "InvalidSessionKey",
    "InvalidAccessToken",
    "InvalidSignature",
    "UserInvalidOpenToken",
];

/// Mutates a request right before it is sent. This is where signing happens.
pub trait Prepare: Send + Sync {
    fn prepare(&self, request: &mut Request);
}

/// Leaves requests untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPrepare;

impl Prepare for NoopPrepare {
    fn prepare(&self, _request: &mut Request) {}
}

/// Renews the session after the service rejected it.
///
/// Implementations talk to the service through [`ApiClient::execute`], which
/// never refreshes, so a failing refresh cannot recurse.
#[async_trait]
pub trait Refresh: Send + Sync {
    async fn refresh(&self, client: &ApiClient) -> Result<(), ApiError>;
}

/// A call to the service, rebuilt and re-signed for every attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: String,
    params: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Tagged result of one attempt.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success(Value),
    AuthExpired(String),
    Failure(ApiError),
}

#[derive(Debug, Default)]
struct RefreshState {
    generation: u64,
    last_error: Option<Arc<ApiError>>,
}

/// API client for cloud.189.cn.
pub struct ApiClient {
    client: Client,
    base_url: String,
    prepare: Arc<dyn Prepare>,
    refresher: Arc<dyn Refresh>,
    refresh_state: Mutex<RefreshState>,
    generation: AtomicU64,
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `https://api.cloud.189.cn`).
    pub fn new(
        base_url: impl Into<String>,
        prepare: Arc<dyn Prepare>,
        refresher: Arc<dyn Refresh>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            prepare,
            refresher,
            refresh_state: Mutex::new(RefreshState::default()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of refresh attempts completed so far.
    pub fn refresh_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Send `request`, renewing the session once if the service rejects it.
    pub async fn invoke<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let observed = self.generation.load(Ordering::Acquire);

        let reason = match self.attempt(request).await {
            Outcome::Success(value) => return decode(request, value),
            Outcome::Failure(e) => return Err(e),
            Outcome::AuthExpired(reason) => reason,
        };

        debug!(url = %request.url, reason = %reason, "Session rejected, refreshing");
        self.refresh_once(observed).await?;

        match self.attempt(request).await {
            Outcome::Success(value) => decode(request, value),
            Outcome::Failure(e) => Err(e),
            Outcome::AuthExpired(reason) => {
                warn!(url = %request.url, "Session still rejected after refresh");
                Err(ApiError::AuthExpired(reason))
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        self.invoke(&with_params(ApiRequest::get(path), params)).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        self.invoke(&with_params(ApiRequest::post(path), params)).await
    }

    /// One signed attempt with no refresh. A rejected session surfaces as
    /// [`ApiError::AuthExpired`].
    pub async fn execute<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        match self.attempt(request).await {
            Outcome::Success(value) => decode(request, value),
            Outcome::AuthExpired(reason) => Err(ApiError::AuthExpired(reason)),
            Outcome::Failure(e) => Err(e),
        }
    }

    /// PUT `body` to a pre-signed storage URL handed out by the upload
    /// service. The URL carries its own authorization, so nothing is signed
    /// and nothing is refreshed.
    pub async fn put_part(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        let mut builder = self.client.put(url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        Ok(())
    }

    /// Run the refresh hook unless another caller already refreshed since
    /// `observed`, in which case its outcome is reused.
    async fn refresh_once(&self, observed: u64) -> Result<(), ApiError> {
        let mut state = self.refresh_state.lock().await;

        if state.generation != observed {
            debug!(generation = state.generation, "Reusing concurrent refresh outcome");
            return match &state.last_error {
                None => Ok(()),
                Some(e) => Err(ApiError::from_refresh(e)),
            };
        }

        let result = self.refresher.refresh(self).await;

        state.generation += 1;
        self.generation.store(state.generation, Ordering::Release);

        match result {
            Ok(()) => {
                info!(generation = state.generation, "Session refreshed");
                state.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                let shared = Arc::new(e);
                let err = ApiError::from_refresh(&shared);
                state.last_error = Some(shared);
                Err(err)
            }
        }
    }

    async fn attempt(&self, request: &ApiRequest) -> Outcome {
        let mut http_request = match self.build(request) {
            Ok(r) => r,
            Err(e) => return Outcome::Failure(e),
        };
        self.prepare.prepare(&mut http_request);

        let response = match self.client.execute(http_request).await {
            Ok(r) => r,
            Err(e) => return Outcome::Failure(ApiError::NetworkError(e)),
        };

        let status = response.status();
        match response.text().await {
            Ok(body) => classify(status, &body),
            Err(e) => Outcome::Failure(ApiError::NetworkError(e)),
        }
    }

    fn build(&self, request: &ApiRequest) -> Result<Request, ApiError> {
        let url = if request.url.starts_with("http://") || request.url.starts_with("https://") {
            request.url.clone()
        } else {
            format!("{}{}", self.base_url, request.url)
        };

        let builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json;charset=UTF-8");

        let builder = if request.method == Method::GET {
            builder.query(&request.params)
        } else {
            builder.form(&request.params)
        };

        Ok(builder.build()?)
    }
}

fn with_params(mut request: ApiRequest, params: &[(&str, &str)]) -> ApiRequest {
    for (k, v) in params {
        request = request.param(*k, *v);
    }
    request
}

fn decode<T: DeserializeOwned>(request: &ApiRequest, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| {
        ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", request.url, e))
    })
}

/// Sort a reply into success, expired session, or failure.
pub(crate) fn classify(status: reqwest::StatusCode, body: &str) -> Outcome {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Outcome::AuthExpired(ApiError::truncate_body(body));
    }

    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if let Some((code, message)) = parsed.as_ref().and_then(service_error) {
        if AUTH_EXPIRED_CODES.contains(&code.as_str()) {
            return Outcome::AuthExpired(code);
        }
        return Outcome::Failure(ApiError::Service { code, message });
    }

    if !status.is_success() {
        return Outcome::Failure(ApiError::from_status(status, body));
    }

    match parsed {
        Some(value) => Outcome::Success(value),
        None if body.trim().is_empty() => Outcome::Success(Value::Null),
        None => Outcome::Failure(ApiError::InvalidResponse(format!(
            "Expected JSON body: {}",
            ApiError::truncate_body(body)
        ))),
    }
}

/// Extract `(code, message)` from an error payload.
///
/// The service reports errors either as `{"errorCode": .., "errorMsg": ..}`
/// or as `{"res_code": <non-zero>, "res_message": ..}`.
fn service_error(value: &Value) -> Option<(String, String)> {
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

    if let Some(code) = text("errorCode").or_else(|| text("code")) {
        if !code.is_empty() && code != "SUCCESS" {
            let message = text("errorMsg").or_else(|| text("msg")).unwrap_or_default();
            return Some((code, message));
        }
    }

    let res_code = value.get("res_code")?;
    let failed = match res_code {
        Value::Number(n) => n.as_i64() != Some(0),
        Value::String(s) => s != "0",
        _ => false,
    };
    if !failed {
        return None;
    }
    let code = match res_code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some((code, text("res_message").unwrap_or_default()))
}
