// packages/runify/src/bootstrap/mod.rs
//! Injected Runtime payloads
//!
//! Every payload is the shared core (`js/core.js`) preceded by the hooks of
//! one host family, wrapped in a function that receives a JSON config
//! object. The core never needs its own source again: child realms are
//! driven by functions living in the parent, acting on the child's global.
//!
//! ```text
//! (function (config) {
//!     <family hooks>   defines `host`
//!     <core>           realm records, print, dispatch, ready handshake
//! })({ "protocol": 1, "shortName": "$", ... });
//! ```

use crate::completion::BOOTSTRAP_MARKER;
use crate::protocol::{FRAME_PREFIX, PROTOCOL_VERSION};
use crate::utils::errors::{HarnessError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::debug;

const CORE_JS: &str = include_str!("js/core.js");
const NODE_JS: &str = include_str!("js/node.js");
const D8_JS: &str = include_str!("js/d8.js");
const JSC_JS: &str = include_str!("js/jsc.js");
const JSSHELL_JS: &str = include_str!("js/jsshell.js");
const BROWSER_JS: &str = include_str!("js/browser.js");

/// Default name of the script-visible host API object
pub const DEFAULT_SHORT_NAME: &str = "$";

/// File name user code is attributed to in stack traces
pub const SCRIPT_NAME: &str = "eval.js";

static SHORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("valid identifier pattern"));

/// Engine family a payload is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFamily {
    Node,
    D8,
    Jsc,
    JsShell,
    Browser,
}

impl HostFamily {
    fn hooks(&self) -> &'static str {
        match self {
            HostFamily::Node => NODE_JS,
            HostFamily::D8 => D8_JS,
            HostFamily::Jsc => JSC_JS,
            HostFamily::JsShell => JSSHELL_JS,
            HostFamily::Browser => BROWSER_JS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostFamily::Node => "node",
            HostFamily::D8 => "d8",
            HostFamily::Jsc => "jsc",
            HostFamily::JsShell => "jsshell",
            HostFamily::Browser => "browser",
        }
    }
}

/// Parameters embedded into a payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub protocol: u32,
    pub short_name: String,
    pub frame_prefix: String,
    pub script_name: String,
    pub marker: String,

    /// Where the browser runtime posts its events
    pub event_url: Option<String>,
}

/// Reject names that are not plain JavaScript identifiers
pub fn validate_short_name(name: &str) -> Result<()> {
    if SHORT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(HarnessError::ConfigurationError(format!(
            "shortName {:?} is not a valid identifier",
            name
        )))
    }
}

/// A payload ready to be rendered for one session
#[derive(Debug, Clone)]
pub struct Bootstrap {
    family: HostFamily,
    config: BootstrapConfig,
}

impl Bootstrap {
    pub fn new(family: HostFamily, short_name: Option<&str>) -> Result<Self> {
        let short_name = short_name.unwrap_or(DEFAULT_SHORT_NAME);
        validate_short_name(short_name)?;

        Ok(Self {
            family,
            config: BootstrapConfig {
                protocol: PROTOCOL_VERSION,
                short_name: short_name.to_string(),
                frame_prefix: FRAME_PREFIX.to_string(),
                script_name: SCRIPT_NAME.to_string(),
                marker: BOOTSTRAP_MARKER.to_string(),
                event_url: None,
            },
        })
    }

    pub fn with_event_url(mut self, url: impl Into<String>) -> Self {
        self.config.event_url = Some(url.into());
        self
    }

    pub fn family(&self) -> HostFamily {
        self.family
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Render the complete payload source
    pub fn render(&self) -> Result<String> {
        let config = serde_json::to_string(&self.config)?;

        let mut source = String::with_capacity(
            CORE_JS.len() + self.family.hooks().len() + config.len() + 64,
        );
        source.push_str(";(function (config) {\n");
        source.push_str(self.family.hooks());
        source.push('\n');
        source.push_str(CORE_JS);
        source.push_str("\n})(");
        source.push_str(&config);
        source.push_str(");\n");

        Ok(source)
    }

    /// HTML page that installs the browser payload on load
    pub fn host_page(&self) -> Result<String> {
        if self.family != HostFamily::Browser {
            return Err(HarnessError::ConfigurationError(format!(
                "host page requested for {} payload",
                self.family.name()
            )));
        }
        if self.config.event_url.is_none() {
            return Err(HarnessError::ConfigurationError(
                "browser payload needs an event URL".to_string(),
            ));
        }

        // Keep the inline script from being closed early by its own content
        let payload = self.render()?.replace("</", "<\\/");

        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>runify</title></head>\n<body>\n<script>\n{}</script>\n</body>\n</html>\n",
            payload
        ))
    }

    /// Write the payload to a temp file whose name carries the bootstrap marker
    pub fn write_temp(&self) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(BOOTSTRAP_MARKER)
            .suffix(".js")
            .tempfile()?;

        file.write_all(self.render()?.as_bytes())?;
        file.flush()?;

        debug!(
            "Wrote {} bootstrap to {}",
            self.family.name(),
            file.path().display()
        );
        Ok(file)
    }
}
