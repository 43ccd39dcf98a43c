//! Authenticated fetch with coordinated token refresh.
//!
//! `ApiClient::fetch` performs one logical request: attach bearer
//! credentials, issue the request, and on a 401 run a single-flight
//! token refresh followed by exactly one retry. All failures - transport,
//! authentication, server, parse - resolve to a `FetchResult` value so
//! call sites branch on shape instead of catching errors.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::TokenStore;
use crate::config::Config;

use super::error::ApiError;
use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// Refresh endpoint, relative to the base URL
const REFRESH_PATH: &str = "/auth/refresh";

// ============================================================================
// Result and request shapes
// ============================================================================

/// Outcome of one logical fetch.
///
/// The backend's `{ success, data, error }` envelope passes through as
/// `Json` untouched; `Error` is produced by this layer itself when no
/// usable response body exists (transport failure, refresh failure,
/// unparseable body).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Json(Value),
    Text(String),
    Error {
        error: String,
        message: Option<String>,
    },
}

impl FetchResult {
    /// Error-shaped value produced by this layer
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        FetchResult::Error {
            error: kind.into(),
            message: Some(message.into()),
        }
    }

    /// Whether this is an error-shaped value (not a server envelope)
    pub fn is_error(&self) -> bool {
        matches!(self, FetchResult::Error { .. })
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            FetchResult::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Whether this is a `{ "success": true, ... }` backend envelope
    pub fn envelope_success(&self) -> bool {
        self.as_json()
            .and_then(|v| v.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Options for one logical request. `Default` is a GET with no body.
///
/// Cloneable on purpose: the retry after a refresh rebuilds the request
/// from these options so no header state crosses the refresh boundary.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// Shared handle for the at-most-one in-flight refresh
type PendingRefresh = Shared<BoxFuture<'static, bool>>;

/// Authenticated API client for the Wishstash backend.
/// Clone is cheap - transport, tokens, and the refresh slot are all shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    tokens: TokenStore,
    refresh_in_flight: Arc<Mutex<Option<PendingRefresh>>>,
}

impl ApiClient {
    /// Create a client over the production reqwest transport
    pub fn new(config: &Config, tokens: TokenStore) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new()?;
        Ok(Self::with_transport(
            Arc::new(transport),
            config.base_url(),
            tokens,
        ))
    }

    /// Create a client over an explicit transport (tests, instrumentation)
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        tokens: TokenStore,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            tokens,
            refresh_in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Perform one logical request against a relative path.
    ///
    /// With `use_auth`, a 401 triggers the refresh coordinator and at
    /// most one retry; whatever the retry yields is returned as-is.
    /// This never returns an `Err` shape to the caller - all failures
    /// resolve to a `FetchResult` value.
    pub async fn fetch(&self, path: &str, options: RequestOptions, use_auth: bool) -> FetchResult {
        let request = self.build_request(path, &options, use_auth);
        let mut outcome = self.transport.execute(request).await;

        if use_auth {
            let unauthorized = matches!(
                outcome,
                Ok(ref response) if response.status == StatusCode::UNAUTHORIZED
            );
            if unauthorized {
                debug!(path, "Received 401, coordinating token refresh");
                if self.refresh_auth_token().await {
                    // Headers are rebuilt so the retry carries the new token
                    let retry = self.build_request(path, &options, use_auth);
                    outcome = self.transport.execute(retry).await;
                } else {
                    warn!(path, "Token refresh failed, request is unauthenticated");
                    return FetchResult::failure(
                        "unauthorized",
                        "Session expired and token refresh failed",
                    );
                }
            }
        }

        Self::parse_outcome(outcome)
    }

    /// Refresh the access token, deduplicating concurrent attempts.
    ///
    /// If a refresh is already pending, its outcome is awaited and shared;
    /// otherwise a new refresh is started and published as the pending
    /// handle. The shared future clears the slot itself as its final step,
    /// so the handle is gone once the refresh settles no matter which
    /// awaiter drove it there or whether the starter is still alive.
    pub async fn refresh_auth_token(&self) -> bool {
        let pending = {
            let mut slot = self.refresh_in_flight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let transport = Arc::clone(&self.transport);
                    let base_url = self.base_url.clone();
                    let tokens = self.tokens.clone();
                    let slot_handle = Arc::clone(&self.refresh_in_flight);
                    let fut = async move {
                        let refreshed = Self::run_refresh(transport, base_url, tokens).await;
                        slot_handle.lock().await.take();
                        refreshed
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        pending.await
    }

    /// The actual refresh network call. Every failure path returns
    /// `false`; nothing here can leave the pending handle stuck.
    async fn run_refresh(
        transport: Arc<dyn Transport>,
        base_url: String,
        tokens: TokenStore,
    ) -> bool {
        let Some(refresh_token) = tokens.refresh_token() else {
            debug!("No refresh token stored, cannot refresh");
            return false;
        };

        let request = HttpRequest {
            method: Method::POST,
            url: format!("{}{}", base_url, REFRESH_PATH),
            headers: Vec::new(),
            body: Some(json!({ "refreshToken": refresh_token })),
        };

        let response = match transport.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token refresh request failed");
                return false;
            }
        };

        if !response.status.is_success() {
            warn!(status = %response.status, "Token refresh rejected");
            return false;
        }

        let body: Value = match serde_json::from_str(&response.body) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Token refresh response was not valid JSON");
                return false;
            }
        };

        // The backend has shipped the token both nested and flat
        let new_token = body
            .pointer("/data/jwtToken")
            .or_else(|| body.get("jwtToken"))
            .and_then(Value::as_str);

        match new_token {
            Some(token) => match tokens.set_access_token(token) {
                Ok(()) => {
                    debug!("Access token refreshed");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to persist refreshed access token");
                    false
                }
            },
            None => {
                warn!("Token refresh response carried no jwtToken");
                false
            }
        }
    }

    /// Assemble a request, reading the current access token at call time
    fn build_request(&self, path: &str, options: &RequestOptions, use_auth: bool) -> HttpRequest {
        let mut headers = options.headers.clone();
        if use_auth {
            if let Some(token) = self.tokens.access_token() {
                headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
            }
        }
        HttpRequest {
            method: options.method.clone(),
            url: format!("{}{}", self.base_url, path),
            headers,
            body: options.body.clone(),
        }
    }

    /// Normalize a transport outcome into a `FetchResult`.
    ///
    /// Transport failures take the same path as real responses: they
    /// become values, never escape as errors.
    fn parse_outcome(outcome: Result<HttpResponse, ApiError>) -> FetchResult {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed before producing a response");
                return FetchResult::failure(e.kind(), e.to_string());
            }
        };

        if !response.status.is_success() {
            // Failure bodies pass through untouched so callers can read
            // server-provided messages
            if let Ok(value) = serde_json::from_str::<Value>(&response.body) {
                return FetchResult::Json(value);
            }
            if !response.body.is_empty() {
                return FetchResult::Text(response.body);
            }
            let err = ApiError::from_status(response.status, &response.body);
            return FetchResult::failure(err.kind(), err.to_string());
        }

        if response.is_json() {
            match serde_json::from_str::<Value>(&response.body) {
                Ok(value) => FetchResult::Json(value),
                Err(e) => {
                    warn!(error = %e, "Failed to parse JSON body of a successful response");
                    FetchResult::failure("parse_error", e.to_string())
                }
            }
        } else {
            FetchResult::Text(response.body)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
