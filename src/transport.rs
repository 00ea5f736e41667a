//! HTTP/JSON transport: the client side of the REST API.
//!
//! Carries the bearer token, enforces timeouts, retries transient faults
//! (connection errors and 5xx) with a fixed delay, and unwraps the
//! `{status, error, …payload}` envelope into typed responses.

use crate::config::{ClientConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::protocol::*;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Overall per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed REST client.
#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, sync_config: &SyncConfig) -> Result<Self> {
        if config.enable_tls && !config.server_address.starts_with("https://") {
            return Err(Error::Unreachable(format!(
                "ENABLE_TLS is set but SERVER_ADDRESS is not https: {}",
                config.server_address
            )));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(ref ca_path) = config.ca_cert_path {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Storage(format!("bad CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Unreachable(format!("http client init: {e}")))?;

        Ok(Self {
            http,
            base_url: config.server_address.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            max_retries: sync_config.max_retries,
            retry_delay: Duration::from_secs(sync_config.retry_delay),
        })
    }

    /// Bare client with a short retry budget, for tests.
    #[cfg(test)]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    // ── Health / auth ───────────────────────────────────────────────

    pub async fn health(&self) -> Result<()> {
        let _: serde_json::Value = self.get("/api/v1/health", false).await?;
        Ok(())
    }

    pub async fn register(&self, login: &str, password: &str) -> Result<RegisterResponse> {
        let body = RegisterRequest {
            login: login.to_string(),
            password: password.to_string(),
        };
        self.post("/api/v1/auth/register", &body, false).await
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<LoginResponse> {
        let body = LoginRequest {
            login: login.to_string(),
            password: password.to_string(),
        };
        let resp: Result<LoginResponse> = self.post("/api/v1/auth/login", &body, false).await;
        match resp {
            // A 401 here is a credential failure, not a missing token.
            Err(Error::Unauthenticated) => Err(Error::BadCredentials),
            other => other,
        }
    }

    pub async fn change_password(&self, old: &str, new: &str) -> Result<()> {
        let body = ChangePasswordRequest {
            old_password: old.to_string(),
            new_password: new.to_string(),
        };
        let _: serde_json::Value = self.post("/api/v1/auth/change-password", &body, true).await?;
        Ok(())
    }

    // ── Sync ────────────────────────────────────────────────────────

    pub async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangesResponse> {
        self.post("/api/sync/changes", req, true).await
    }

    pub async fn process_batch(&self, req: &BatchRequest) -> Result<BatchResponse> {
        self.post("/api/sync/batch", req, true).await
    }

    pub async fn get_status(&self) -> Result<StatusResponse> {
        self.get("/api/sync/status", true).await
    }

    pub async fn get_conflicts(&self) -> Result<ConflictListResponse> {
        self.get("/api/sync/conflicts", true).await
    }

    pub async fn resolve_conflict(&self, id: i64, req: &ResolveRequest) -> Result<ResolveResponse> {
        self.post(&format!("/api/sync/conflicts/{id}/resolve"), req, true)
            .await
    }

    pub async fn list_devices(&self) -> Result<DeviceListResponse> {
        self.get("/api/sync/devices", true).await
    }

    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request::<(), _>(
                reqwest::Method::DELETE,
                &format!("/api/sync/devices/{id}"),
                None,
                true,
            )
            .await?;
        Ok(())
    }

    // ── Plumbing ────────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str, authed: bool) -> Result<T> {
        self.request::<(), T>(reqwest::Method::GET, path, None, authed)
            .await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        authed: bool,
    ) -> Result<T> {
        self.request(reqwest::Method::POST, path, Some(body), authed)
            .await
    }

    /// Send with the retry budget, then unwrap the envelope.
    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        authed: bool,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let mut attempt = 0u32;
        loop {
            let mut req = self.http.request(method.clone(), &url);
            if authed {
                match self.token.read().as_deref() {
                    Some(token) => req = req.bearer_auth(token),
                    None => return Err(Error::Unauthenticated),
                }
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            let outcome = self.try_once::<T>(req).await;
            match outcome {
                Err(ref e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(url = %url, attempt, "transient transport failure, retrying: {e}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn try_once<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Unreachable(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::BadResponse(e.to_string()))?;
        let value: serde_json::Value = if text.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&text)
                .map_err(|e| Error::BadResponse(format!("invalid JSON: {e}")))?
        };
        map_response(status, value)
    }
}

/// Map an HTTP status + envelope body onto the error taxonomy, or pull the
/// typed payload out of a successful envelope.
fn map_response<T: DeserializeOwned>(status: StatusCode, value: serde_json::Value) -> Result<T> {
    let error_text = || {
        value
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unspecified server error")
            .to_string()
    };

    if status.is_success() {
        match value.get("status").and_then(|s| s.as_str()) {
            Some(STATUS_OK) => serde_json::from_value(value.clone())
                .map_err(|e| Error::BadResponse(format!("payload decode: {e}"))),
            Some(STATUS_ERROR) => Err(Error::BadResponse(error_text())),
            _ => Err(Error::BadResponse("missing status field".into())),
        }
    } else if status == StatusCode::UNAUTHORIZED {
        Err(Error::Unauthenticated)
    } else if status == StatusCode::NOT_FOUND {
        Err(Error::NotFound)
    } else if status == StatusCode::CONFLICT {
        Err(Error::VersionMismatch {
            expected: value.get("expected").and_then(|v| v.as_i64()).unwrap_or(0),
            stored: value.get("stored").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    } else if status == StatusCode::UNPROCESSABLE_ENTITY {
        if value.get("code").and_then(|c| c.as_str()) == Some("quota_exceeded") {
            Err(Error::QuotaExceeded)
        } else {
            Err(Error::Unprocessable(error_text()))
        }
    } else if status.is_server_error() {
        Err(Error::ServerFault(format!("{status}: {}", error_text())))
    } else {
        Err(Error::BadResponse(format!("{status}: {}", error_text())))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
