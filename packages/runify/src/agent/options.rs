// packages/runify/src/agent/options.rs
//! Backend kinds and agent options

use crate::bootstrap::validate_short_name;
use crate::runtime::process_manager::ProcessType;
use crate::runtime::webdriver::BrowserProduct;
use crate::utils::config::SupervisorConfig;
use crate::utils::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Every backend an agent can be created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Node,
    D8,
    Jsc,
    JsShell,
    Chrome,
    Firefox,
    Safari,
    Edge,
    Remote,
    QuickJs,
}

/// How a backend kind is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    Process(ProcessType),

    /// `None` for `remote`, whose product comes from `remoteType`
    Browser(Option<BrowserProduct>),

    InProcess,
}

impl BackendKind {
    pub const ALL: [BackendKind; 10] = [
        BackendKind::Node,
        BackendKind::D8,
        BackendKind::Jsc,
        BackendKind::JsShell,
        BackendKind::Chrome,
        BackendKind::Firefox,
        BackendKind::Safari,
        BackendKind::Edge,
        BackendKind::Remote,
        BackendKind::QuickJs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Node => "node",
            BackendKind::D8 => "d8",
            BackendKind::Jsc => "jsc",
            BackendKind::JsShell => "jsshell",
            BackendKind::Chrome => "chrome",
            BackendKind::Firefox => "firefox",
            BackendKind::Safari => "safari",
            BackendKind::Edge => "edge",
            BackendKind::Remote => "remote",
            BackendKind::QuickJs => "quickjs",
        }
    }

    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::Node => BackendFamily::Process(ProcessType::Node),
            BackendKind::D8 => BackendFamily::Process(ProcessType::D8),
            BackendKind::Jsc => BackendFamily::Process(ProcessType::Jsc),
            BackendKind::JsShell => BackendFamily::Process(ProcessType::JsShell),
            BackendKind::Chrome => BackendFamily::Browser(Some(BrowserProduct::Chrome)),
            BackendKind::Firefox => BackendFamily::Browser(Some(BrowserProduct::Firefox)),
            BackendKind::Safari => BackendFamily::Browser(Some(BrowserProduct::Safari)),
            BackendKind::Edge => BackendFamily::Browser(Some(BrowserProduct::Edge)),
            BackendKind::Remote => BackendFamily::Browser(None),
            BackendKind::QuickJs => BackendFamily::InProcess,
        }
    }

    pub fn is_browser(&self) -> bool {
        matches!(self.family(), BackendFamily::Browser(_))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(kind) = BackendKind::ALL.iter().find(|k| k.as_str() == s) {
            return Ok(*kind);
        }
        match s {
            "ch" | "chakra" => Err(HarnessError::ConfigurationError(
                "ch has no way to read requests from stdin and is not supported".into(),
            )),
            other => Err(HarnessError::ConfigurationError(format!(
                "unknown backend kind {:?}",
                other
            ))),
        }
    }
}

/// Options accepted by `Agent::create`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Engine binary, or browser binary for local browsers
    pub host_path: Option<PathBuf>,

    /// WebDriver server URL (browser kinds)
    pub webdriver_server: Option<String>,

    /// Browser product behind a `remote` driver
    pub remote_type: Option<String>,

    /// Merged over the product's default capabilities
    pub capabilities: Map<String, Value>,

    /// Host name the browser uses to reach the Transport Channel
    pub web_host: Option<String>,

    /// Name of the script-visible host API (`$` when unset)
    pub short_name: Option<String>,

    /// Bindings installed in the root realm after start
    pub globals: Map<String, Value>,

    pub supervisor: SupervisorConfig,
}

impl AgentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_path = Some(path.into());
        self
    }

    pub fn with_webdriver_server(mut self, server: impl Into<String>) -> Self {
        self.webdriver_server = Some(server.into());
        self
    }

    pub fn with_remote_type(mut self, product: impl Into<String>) -> Self {
        self.remote_type = Some(product.into());
        self
    }

    pub fn with_short_name(mut self, name: impl Into<String>) -> Self {
        self.short_name = Some(name.into());
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Check the options against the backend kind before anything starts
    pub fn validate(&self, kind: BackendKind) -> Result<()> {
        if let Some(name) = &self.short_name {
            validate_short_name(name)?;
        }

        if let BackendFamily::Browser(product) = kind.family() {
            let server = self.webdriver_server.as_deref().ok_or_else(|| {
                HarnessError::ConfigurationError(format!("webdriverServer is required for {}", kind))
            })?;
            url::Url::parse(server).map_err(|e| {
                HarnessError::ConfigurationError(format!(
                    "invalid webdriverServer {:?}: {}",
                    server, e
                ))
            })?;

            if product.is_none() {
                if self.host_path.is_some() {
                    return Err(HarnessError::ConfigurationError(
                        "hostPath cannot be used with a remote browser".into(),
                    ));
                }
                self.remote_product()?;
            }

            if let Some(host) = &self.web_host {
                if host.is_empty() || host.contains('/') {
                    return Err(HarnessError::ConfigurationError(format!(
                        "webHost {:?} must be a bare host name",
                        host
                    )));
                }
            }
        }

        Ok(())
    }

    /// Product behind a `remote` driver
    pub fn remote_product(&self) -> Result<BrowserProduct> {
        self.remote_type
            .as_deref()
            .ok_or_else(|| {
                HarnessError::ConfigurationError("remoteType is required for remote".into())
            })?
            .parse()
    }
}

/// Per-call evaluation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalOptions {
    /// Finalize only when the script calls the root realm's `destroy()`
    pub is_async: bool,
}

impl EvalOptions {
    pub fn asynchronous() -> Self {
        Self { is_async: true }
    }
}
