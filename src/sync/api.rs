//! Preferences API Client - HTTP communication with the backend
//!
//! Handles the REST calls the sync engine consumes:
//! - Preferences read (`GET /api/get-user-preferences`)
//! - Preferences write (`POST /api/save-user-preferences`)
//! - Anti-forgery token (`GET /api/csrf-token`), fetched lazily and cached
//!
//! Writes carry an idempotency key chosen by the caller, shared by every
//! retry of the same logical save. A 403 invalidates the cached token; the
//! client re-acquires it and repeats the write once before reporting failure.

use super::retry::{RetryPolicy, Retryable};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const LOAD_PATH: &str = "/api/get-user-preferences";
pub const SAVE_PATH: &str = "/api/save-user-preferences";
pub const CSRF_PATH: &str = "/api/csrf-token";

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const CSRF_HEADER: &str = "X-CSRF-Token";

// ============================================================================
// Transport Seam
// ============================================================================

/// Result of a write the server accepted
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResponse {
    /// 200; `document` is the server's merged copy when it sent one
    Saved { document: Option<Value> },
    /// 204; the server already holds this payload
    Unchanged,
}

/// The two backend operations the engine needs.
#[async_trait]
pub trait PreferenceTransport: Send + Sync {
    /// Fetch the stored document. `Ok(None)` means the server has none yet.
    async fn load(&self) -> Result<Option<Value>, SyncApiError>;

    /// Send one write attempt group tagged with `idempotency_key`.
    async fn save(&self, payload: &Value, idempotency_key: &str) -> Result<SaveResponse, SyncApiError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

/// Cached anti-forgery token, wiped from memory when replaced or dropped
#[derive(Zeroize, ZeroizeOnDrop)]
struct CsrfToken(String);

/// API client for the preferences backend
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    /// Anti-forgery token (cached in memory)
    csrf_token: Arc<RwLock<Option<CsrfToken>>>,
    token_refreshes: AtomicU32,
}

impl SyncApiClient {
    /// Create new API client for `base_url` (scheme and host, optional path prefix)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncApiError> {
        url::Url::parse(base_url).map_err(|e| SyncApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            csrf_token: Arc::new(RwLock::new(None)),
            token_refreshes: AtomicU32::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Get current token, if one is cached
    pub async fn get_token(&self) -> Option<String> {
        self.csrf_token.read().await.as_ref().map(|t| t.0.clone())
    }

    /// Set token (tests, or a token handed over by the page)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.csrf_token.write().await;
        *guard = Some(CsrfToken(token));
    }

    /// Clear token
    pub async fn clear_token(&self) {
        let mut guard = self.csrf_token.write().await;
        *guard = None;
    }

    /// Times a rejected token was re-acquired
    pub fn token_refreshes(&self) -> u32 {
        self.token_refreshes.load(Ordering::Relaxed)
    }

    /// Fetch a fresh anti-forgery token and cache it
    async fn fetch_token(&self) -> Result<String, SyncApiError> {
        let response = self
            .client
            .get(self.endpoint(CSRF_PATH))
            .send()
            .await
            .map_err(|e| SyncApiError::Token(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncApiError::Token(format!("token endpoint returned {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncApiError::Token(format!("unreadable token response: {}", e)))?;

        self.set_token(body.token.clone()).await;
        Ok(body.token)
    }

    /// Cached token, acquired on first use. Acquisition failures are logged
    /// and the write goes out without a token.
    async fn token_for_write(&self) -> Option<String> {
        if let Some(token) = self.get_token().await {
            return Some(token);
        }
        match self.fetch_token().await {
            Ok(token) => Some(token),
            Err(e) => {
                log::warn!("Could not acquire anti-forgery token: {}", e);
                None
            }
        }
    }

    /// Drop the rejected token and acquire a new one
    async fn refresh_token(&self) -> Result<String, SyncApiError> {
        self.clear_token().await;
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
        log::info!("Anti-forgery token rejected, acquiring a new one");
        self.fetch_token().await
    }

    async fn save_once(&self, payload: &Value, idempotency_key: &str, token: Option<String>) -> Result<SaveResponse, SyncApiError> {
        let mut request = self
            .client
            .post(self.endpoint(SAVE_PATH))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(payload);

        if let Some(token) = token {
            request = request.header(CSRF_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(SaveResponse::Unchanged);
        }

        if !status.is_success() {
            return Err(handle_error(response).await);
        }

        let text = response.text().await?;
        match serde_json::from_str::<PreferencesEnvelope>(&text) {
            Ok(body) if body.success => {
                let document = match body.preferences {
                    Some(doc) if doc.is_object() => Some(doc),
                    Some(Value::Null) | None => None,
                    Some(_) => {
                        log::warn!("Save response preferences is not an object, keeping local copy");
                        None
                    }
                };
                Ok(SaveResponse::Saved { document })
            }
            Ok(_) => Err(SyncApiError::Server {
                status: status.as_u16(),
                message: "server reported success=false".to_string(),
            }),
            Err(e) => {
                log::warn!("Save response body is not a preferences envelope ({}), keeping local copy", e);
                Ok(SaveResponse::Saved { document: None })
            }
        }
    }
}

#[async_trait]
impl PreferenceTransport for SyncApiClient {
    async fn load(&self) -> Result<Option<Value>, SyncApiError> {
        let response = self.client.get(self.endpoint(LOAD_PATH)).send().await?;
        let body: PreferencesEnvelope = handle_response(response).await?;

        if !body.success {
            return Err(SyncApiError::InvalidResponse("server reported success=false".to_string()));
        }

        Ok(body.preferences.filter(|doc| !doc.is_null()))
    }

    async fn save(&self, payload: &Value, idempotency_key: &str) -> Result<SaveResponse, SyncApiError> {
        let this = self;
        RetryPolicy::immediate(2)
            .execute_when(
                "Preferences write",
                |attempt| async move {
                    let token = if attempt == 0 {
                        this.token_for_write().await
                    } else {
                        Some(this.refresh_token().await?)
                    };
                    this.save_once(payload, idempotency_key, token).await
                },
                |e| matches!(e, SyncApiError::Forbidden),
            )
            .await
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct PreferencesEnvelope {
    success: bool,
    #[serde(default)]
    preferences: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<u64>,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Anti-forgery token rejected")]
    Forbidden,

    #[error("Could not obtain anti-forgery token: {0}")]
    Token(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),
}

impl Retryable for SyncApiError {
    fn is_retryable(&self) -> bool {
        !matches!(self, SyncApiError::RateLimited { .. } | SyncApiError::InvalidUrl(_))
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| SyncApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::FORBIDDEN => SyncApiError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => {
            let header_hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let retry_after = match header_hint {
                Some(secs) => Some(secs),
                None => response
                    .text()
                    .await
                    .ok()
                    .and_then(|body| serde_json::from_str::<RateLimitBody>(&body).ok())
                    .and_then(|body| body.retry_after),
            };
            log::warn!("Preferences API rate limited (retry after: {:?}s)", retry_after);
            SyncApiError::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            }
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::Server {
                status: status.as_u16(),
                message: msg,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncApiClient {
        SyncApiClient::new("http://localhost:3000/", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = client();
        assert!(client.get_token().await.is_none());
        assert_eq!(client.token_refreshes(), 0);
        assert_eq!(client.endpoint(SAVE_PATH), "http://localhost:3000/api/save-user-preferences");
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = client();

        client.set_token("test_token".to_string()).await;
        assert_eq!(client.get_token().await, Some("test_token".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }

    #[test]
    fn test_invalid_base_url() {
        let result = SyncApiClient::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(SyncApiError::InvalidUrl(_))));
    }

    #[test]
    fn test_retry_classification() {
        assert!(SyncApiError::Forbidden.is_retryable());
        assert!(SyncApiError::Server { status: 502, message: String::new() }.is_retryable());
        assert!(!SyncApiError::RateLimited { retry_after: None }.is_retryable());
    }
}
