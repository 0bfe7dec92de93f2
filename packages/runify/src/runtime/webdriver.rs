// packages/runify/src/runtime/webdriver.rs
//! Minimal W3C WebDriver client
//!
//! Only the commands the browser supervisor needs: new session, navigate,
//! execute sync script, set timeouts and delete session. The driver is a
//! transport here, not an automation API.

use crate::utils::errors::{HarnessError, Result};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Browser products reachable through a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserProduct {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

impl BrowserProduct {
    /// `browserName` capability value
    pub fn browser_name(&self) -> &'static str {
        match self {
            BrowserProduct::Chrome => "chrome",
            BrowserProduct::Firefox => "firefox",
            BrowserProduct::Safari => "safari",
            BrowserProduct::Edge => "MicrosoftEdge",
        }
    }

    /// Vendor options key that carries the browser binary
    fn options_key(&self) -> Option<&'static str> {
        match self {
            BrowserProduct::Chrome => Some("goog:chromeOptions"),
            BrowserProduct::Firefox => Some("moz:firefoxOptions"),
            BrowserProduct::Edge => Some("ms:edgeOptions"),
            BrowserProduct::Safari => None,
        }
    }

    /// Default capabilities, with `host_path` as the browser binary when given
    pub fn default_capabilities(&self, host_path: Option<&Path>) -> Value {
        let mut caps = json!({ "browserName": self.browser_name() });

        if let Some(path) = host_path {
            match self.options_key() {
                Some(key) => {
                    caps[key] = json!({ "binary": path.to_string_lossy() });
                }
                None => warn!("hostPath is ignored for {}", self.browser_name()),
            }
        }

        caps
    }
}

impl FromStr for BrowserProduct {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chrome" => Ok(BrowserProduct::Chrome),
            "firefox" => Ok(BrowserProduct::Firefox),
            "safari" => Ok(BrowserProduct::Safari),
            "edge" => Ok(BrowserProduct::Edge),
            other => Err(HarnessError::ConfigurationError(format!(
                "unknown browser product {:?}",
                other
            ))),
        }
    }
}

/// Merge `overrides` into `base`; nested objects merge, everything else replaces
pub fn merge_capabilities(base: &mut Value, overrides: &Map<String, Value>) {
    let Some(target) = base.as_object_mut() else {
        *base = Value::Object(overrides.clone());
        return;
    };

    for (key, value) in overrides {
        match (target.get_mut(key), value) {
            (Some(existing), Value::Object(nested)) if existing.is_object() => {
                merge_capabilities(existing, nested);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Connection to a WebDriver server
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base: Url,
}

impl WebDriverClient {
    pub fn new(server: &str) -> Result<Self> {
        let mut base = Url::parse(server).map_err(|e| {
            HarnessError::ConfigurationError(format!("invalid webdriverServer {:?}: {}", server, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { http, base })
    }

    /// Open a session with `{"capabilities": {"alwaysMatch": caps}}`
    pub async fn new_session(&self, capabilities: Value) -> Result<WebDriverSession> {
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let raw = self.raw_command(Method::POST, "session", Some(body)).await?;

        // W3C puts the id under `value`; older drivers at the top level
        let id = raw
            .pointer("/value/sessionId")
            .or_else(|| raw.get("sessionId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HarnessError::WebDriver(format!("new session response without sessionId: {}", raw))
            })?
            .to_string();

        debug!("WebDriver session {} opened", id);
        Ok(WebDriverSession {
            client: self.clone(),
            id: Arc::from(id),
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let raw = self.raw_command(method, path, body).await?;
        Ok(raw.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn raw_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self
            .base
            .join(path)
            .map_err(|e| HarnessError::WebDriver(format!("bad command path {}: {}", path, e)))?;

        let mut request = self.http.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(&body);
        } else if method == Method::POST {
            request = request.json(&json!({}));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let raw: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                HarnessError::WebDriver(format!("{} {}: unreadable response: {}", method, path, e))
            })?
        };

        if let Some(error) = driver_error(status, &raw) {
            return Err(HarnessError::WebDriver(format!("{} {}: {}", method, path, error)));
        }

        Ok(raw)
    }
}

fn driver_error(status: StatusCode, raw: &Value) -> Option<String> {
    let value = raw.get("value");
    let error = value.and_then(|v| v.get("error")).and_then(Value::as_str);

    match error {
        Some(error) => {
            let message = value
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("");
            Some(format!("{} ({})", error, message))
        }
        None if !status.is_success() => Some(format!("HTTP {}", status)),
        None => None,
    }
}

/// An open browser session
#[derive(Debug, Clone)]
pub struct WebDriverSession {
    client: WebDriverClient,
    id: Arc<str>,
}

impl WebDriverSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn path(&self, command: &str) -> String {
        if command.is_empty() {
            format!("session/{}", self.id)
        } else {
            format!("session/{}/{}", self.id, command)
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.client
            .command(Method::POST, &self.path("url"), Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    pub async fn set_script_timeout(&self, timeout: Duration) -> Result<()> {
        self.client
            .command(
                Method::POST,
                &self.path("timeouts"),
                Some(json!({ "script": timeout.as_millis() as u64 })),
            )
            .await?;
        Ok(())
    }

    /// Run a synchronous script and return its value
    pub async fn execute_sync(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.client
            .command(
                Method::POST,
                &self.path("execute/sync"),
                Some(json!({ "script": script, "args": args })),
            )
            .await
    }

    pub async fn delete(&self) -> Result<()> {
        self.client
            .command(Method::DELETE, &self.path(""), None)
            .await?;
        debug!("WebDriver session {} deleted", self.id);
        Ok(())
    }
}
