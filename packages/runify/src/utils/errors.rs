// packages/runify/src/utils/errors.rs
//! Harness error taxonomy
//!
//! Everything here is a fault of the harness or of its configuration. An
//! error thrown by the evaluated script is never a `HarnessError`: it is
//! captured as data in [`Completion::error`](crate::completion::Completion).

use crate::agent::AgentState;
use crate::realm::RealmId;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors surfaced by agents, realms and supervisors
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad or missing agent options, unknown backend kind, endpoint clash
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The backend could not allocate an isolated context
    #[error("realm creation failed: {0}")]
    RealmCreationError(String),

    /// Operation on a realm that has already been destroyed
    #[error("realm {0} has been destroyed")]
    RealmDestroyedError(RealmId),

    /// Operation addressed to a realm this agent never created
    #[error("unknown realm {0}")]
    UnknownRealm(RealmId),

    /// A second operation was issued while one is still in flight
    #[error("agent is busy with an in-flight evaluation")]
    AgentBusyError,

    /// The agent was stopped or destroyed
    #[error("agent is {0:?} and cannot accept operations")]
    AgentUnavailable(AgentState),

    /// The backend process or transport died during an operation
    #[error("backend crashed: {0}")]
    BackendCrashedError(String),

    /// The runtime did not complete its handshake in time
    #[error("backend did not become ready within {0} ms")]
    StartupTimeout(u64),

    /// Malformed frame or protocol version mismatch
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A WebDriver command failed
    #[error("webdriver error: {0}")]
    WebDriver(String),

    /// Transport Channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Engine binary could not be started
    #[error("failed to spawn backend process: {0}")]
    ProcessSpawnFailed(String),

    /// Runtime-side failure that is not a script error
    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    /// Whether this error means the backend is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::BackendCrashedError(_) | HarnessError::AgentUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(e: reqwest::Error) -> Self {
        HarnessError::WebDriver(e.to_string())
    }
}

impl From<config::ConfigError> for HarnessError {
    fn from(e: config::ConfigError) -> Self {
        HarnessError::ConfigurationError(e.to_string())
    }
}
