//! HTTP client for WebDriverAgent (WDA) running on an iOS device.
//!
//! WDA exposes a W3C WebDriver-flavoured JSON API. Every response is an
//! envelope of the form `{"value": ..., "sessionId": ...}`; errors carry
//! `{"value": {"error": ..., "message": ...}}` with a non-2xx status.
//!
//! Coordinates sent to WDA are in points, not screenshot pixels. The iOS
//! driver performs that conversion.
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::wda::{AppState, WdaClient};
//!
//! # async fn example() -> Result<(), mobitest_core::wda::WdaError> {
//! let client = WdaClient::new("http://127.0.0.1:8100");
//! client.status().await?;
//! if client.app_state("com.apple.Preferences").await? != AppState::RunningForeground {
//!     client.app_launch("com.apple.Preferences", true).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors returned by [`WdaClient`].
#[derive(Error, Debug)]
pub enum WdaError {
    /// The HTTP request failed (connection refused, timeout, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WDA answered with an error payload.
    #[error("WDA error: {0}")]
    Api(String),

    /// The response did not have the expected shape.
    #[error("Unexpected WDA response: {0}")]
    UnexpectedResponse(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Application state as reported by `wda/apps/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    NotRunning,
    /// Unknown or suspended.
    Unknown,
    RunningBackgroundSuspended,
    RunningBackground,
    RunningForeground,
}

impl AppState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => AppState::NotRunning,
            2 => AppState::RunningBackgroundSuspended,
            3 => AppState::RunningBackground,
            4 => AppState::RunningForeground,
            _ => AppState::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AppState::NotRunning => 0,
            AppState::Unknown => 1,
            AppState::RunningBackgroundSuspended => 2,
            AppState::RunningBackground => 3,
            AppState::RunningForeground => 4,
        }
    }
}

/// Logical window size in points.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct WindowSize {
    pub width: f64,
    pub height: f64,
}

/// Client for one WDA server.
///
/// Session-scoped calls lazily create a WDA session on first use and reuse
/// it afterwards.
pub struct WdaClient {
    client: Client,
    base_url: String,
    session_id: Mutex<Option<String>>,
}

impl WdaClient {
    /// Creates a client with a 60 s request timeout.
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, WdaError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "wda request");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let envelope: Value = resp.json().await?;

        if let Some(message) = error_message(&envelope) {
            return Err(WdaError::Api(message));
        }
        if !status.is_success() {
            return Err(WdaError::Api(format!("HTTP {status}")));
        }
        Ok(envelope)
    }

    async fn get(&self, path: &str) -> Result<Value, WdaError> {
        self.call(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, WdaError> {
        self.call(Method::POST, path, Some(body)).await
    }

    async fn session_path(&self, suffix: &str) -> Result<String, WdaError> {
        let sid = self.session().await?;
        Ok(format!("/session/{sid}{suffix}"))
    }

    async fn session_post(&self, suffix: &str, body: Value) -> Result<Value, WdaError> {
        let path = self.session_path(suffix).await?;
        self.post(&path, body).await
    }

    // -----------------------------------------------------------------------
    // Server and session
    // -----------------------------------------------------------------------

    /// `GET /status`. Succeeds when WDA is up.
    pub async fn status(&self) -> Result<Value, WdaError> {
        let envelope = self.get("/status").await?;
        Ok(envelope.get("value").cloned().unwrap_or(Value::Null))
    }

    /// Opens a new session and makes it current.
    pub async fn create_session(&self) -> Result<String, WdaError> {
        let envelope = self
            .post("/session", json!({ "capabilities": { "alwaysMatch": {} } }))
            .await?;
        let sid = envelope
            .get("sessionId")
            .and_then(Value::as_str)
            .or_else(|| envelope.pointer("/value/sessionId").and_then(Value::as_str))
            .ok_or_else(|| WdaError::UnexpectedResponse("missing sessionId".to_string()))?
            .to_string();
        *self.session_id.lock().await = Some(sid.clone());
        Ok(sid)
    }

    /// Returns the current session id, creating a session if needed.
    pub async fn session(&self) -> Result<String, WdaError> {
        if let Some(sid) = self.session_id.lock().await.clone() {
            return Ok(sid);
        }
        self.create_session().await
    }

    /// Forgets the cached session so the next call opens a fresh one.
    pub async fn reset_session(&self) {
        *self.session_id.lock().await = None;
    }

    // -----------------------------------------------------------------------
    // Apps
    // -----------------------------------------------------------------------

    pub async fn app_state(&self, bundle_id: &str) -> Result<AppState, WdaError> {
        let envelope = self
            .session_post("/wda/apps/state", json!({ "bundleId": bundle_id }))
            .await?;
        let code = envelope
            .get("value")
            .and_then(Value::as_i64)
            .ok_or_else(|| WdaError::UnexpectedResponse(envelope.to_string()))?;
        Ok(AppState::from_code(code))
    }

    pub async fn app_launch(&self, bundle_id: &str, wait_for_quiescence: bool) -> Result<(), WdaError> {
        self.session_post(
            "/wda/apps/launch",
            json!({ "bundleId": bundle_id, "shouldWaitForQuiescence": wait_for_quiescence }),
        )
        .await
        .map(|_| ())
    }

    pub async fn app_terminate(&self, bundle_id: &str) -> Result<(), WdaError> {
        self.session_post("/wda/apps/terminate", json!({ "bundleId": bundle_id }))
            .await
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Gestures and input (points)
    // -----------------------------------------------------------------------

    pub async fn tap(&self, x: f64, y: f64) -> Result<(), WdaError> {
        self.session_post("/wda/tap/0", json!({ "x": x, "y": y })).await.map(|_| ())
    }

    pub async fn double_tap(&self, x: f64, y: f64) -> Result<(), WdaError> {
        self.session_post("/wda/doubleTap", json!({ "x": x, "y": y })).await.map(|_| ())
    }

    pub async fn touch_and_hold(&self, x: f64, y: f64, duration: Duration) -> Result<(), WdaError> {
        self.session_post(
            "/wda/touchAndHold",
            json!({ "x": x, "y": y, "duration": duration.as_secs_f64() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn drag(
        &self,
        from: (f64, f64),
        to: (f64, f64),
        duration: Duration,
    ) -> Result<(), WdaError> {
        self.session_post(
            "/wda/dragfromtoforduration",
            json!({
                "fromX": from.0,
                "fromY": from.1,
                "toX": to.0,
                "toY": to.1,
                "duration": duration.as_secs_f64(),
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_keys(&self, text: &str) -> Result<(), WdaError> {
        let chars: Vec<String> = text.chars().map(String::from).collect();
        self.session_post("/wda/keys", json!({ "value": chars })).await.map(|_| ())
    }

    /// Presses a hardware button (`home`, `volumeUp`, `volumeDown`).
    pub async fn press_button(&self, name: &str) -> Result<(), WdaError> {
        self.session_post("/wda/pressButton", json!({ "name": name })).await.map(|_| ())
    }

    pub async fn home(&self) -> Result<(), WdaError> {
        self.post("/wda/homescreen", json!({})).await.map(|_| ())
    }

    pub async fn unlock(&self) -> Result<(), WdaError> {
        self.post("/wda/unlock", json!({})).await.map(|_| ())
    }

    pub async fn lock(&self) -> Result<(), WdaError> {
        self.post("/wda/lock", json!({})).await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Screen and pasteboard
    // -----------------------------------------------------------------------

    /// Captures the screen as PNG bytes (in pixels).
    pub async fn screenshot(&self) -> Result<Vec<u8>, WdaError> {
        let envelope = self.get("/screenshot").await?;
        let encoded = envelope
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| WdaError::UnexpectedResponse("missing screenshot data".to_string()))?;
        // WDA may wrap base64 output at 76 columns.
        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(base64::engine::general_purpose::STANDARD.decode(cleaned)?)
    }

    pub async fn window_size(&self) -> Result<WindowSize, WdaError> {
        let path = self.session_path("/window/size").await?;
        let envelope = self.get(&path).await?;
        let value = envelope.get("value").cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| WdaError::UnexpectedResponse(e.to_string()))
    }

    pub async fn get_pasteboard(&self) -> Result<String, WdaError> {
        let envelope = self
            .session_post("/wda/getPasteboard", json!({ "contentType": "plaintext" }))
            .await?;
        let encoded = envelope.get("value").and_then(Value::as_str).unwrap_or_default();
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub async fn set_pasteboard(&self, text: &str) -> Result<(), WdaError> {
        let content = base64::engine::general_purpose::STANDARD.encode(text);
        self.session_post(
            "/wda/setPasteboard",
            json!({ "content": content, "contentType": "plaintext" }),
        )
        .await
        .map(|_| ())
    }
}

/// Extracts the error message from a WDA envelope, if it carries one.
fn error_message(envelope: &Value) -> Option<String> {
    let value = envelope.get("value")?;
    let error = value.get("error")?.as_str()?;
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    Some(if message.is_empty() {
        error.to_string()
    } else {
        format!("{error}: {message}")
    })
}
