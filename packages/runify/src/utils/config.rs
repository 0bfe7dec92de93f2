// packages/runify/src/utils/config.rs
//! Configuration loading
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. `runify.toml` in the working directory (optional)
//! 3. `RUNIFY__*` environment variables (`RUNIFY__SUPERVISOR__STARTUP_TIMEOUT_MS=5000`)

use crate::agent::AgentOptions;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and binding knobs shared by every supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long `create_agent` waits for the runtime handshake
    pub startup_timeout_ms: u64,

    /// How long `stop`/`destroy` wait for the OS or driver to acknowledge
    pub kill_timeout_ms: u64,

    /// WebDriver script timeout; must exceed any evaluation a caller runs
    pub script_timeout_ms: u64,

    /// Local address the Transport Channel binds (port 0 picks a free one)
    pub transport_bind: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 20_000,
            kill_timeout_ms: 5_000,
            script_timeout_ms: 3_600_000,
            transport_bind: "127.0.0.1:0".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Logging settings consumed by [`crate::observability::init_tracing`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunifyConfig {
    /// Backend kind used by the binary (`node`, `chrome`, `quickjs`, ...)
    pub backend: String,

    /// Options handed to `Agent::create`
    pub agent: AgentOptions,

    pub logging: LoggingConfig,
}

impl Default for RunifyConfig {
    fn default() -> Self {
        Self {
            backend: "quickjs".to_string(),
            agent: AgentOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RunifyConfig {
    /// Load configuration from `runify.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("runify")
    }

    /// Load configuration from a named file (extension optional) and the environment
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("RUNIFY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
