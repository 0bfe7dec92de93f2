// packages/runify/src/utils/mod.rs
//! Shared utilities: error taxonomy and configuration loading

pub mod config;
pub mod errors;

pub use config::{LoggingConfig, RunifyConfig, SupervisorConfig};
pub use errors::{HarnessError, Result};
