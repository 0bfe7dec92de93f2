// packages/runify/src/lib.rs
//! Runify
//!
//! One programmatic interface for running scripts in many JavaScript
//! engines: engine binaries, browsers driven over WebDriver, and an
//! embedded QuickJS. Every backend reports the same [`Completion`] shape
//! and offers the same realm operations.
//!
//! # Architecture
//!
//! - **agent**: the caller-facing façade, lifecycle and stop semantics
//! - **bootstrap**: the Injected Runtime each engine runs before user code
//! - **completion**: stdout and error normalization
//! - **protocol**: host/runtime request and event frames
//! - **realm**: host-side realm tree and teardown cascade
//! - **runtime**: process, browser and in-process supervisors
//! - **transport**: event queue and the browser Transport Channel
//! - **observability**: tracing setup and metric names
//! - **utils**: errors and configuration
//!
//! ```no_run
//! # async fn demo() -> runify::Result<()> {
//! use runify::{Agent, AgentOptions, BackendKind, EvalOptions};
//!
//! let agent = Agent::create(BackendKind::QuickJs, AgentOptions::new()).await?;
//! let completion = agent.eval_script("print(1 + 1)", EvalOptions::default()).await?;
//! assert_eq!(completion.stdout, "2\n");
//! agent.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bootstrap;
pub mod completion;
pub mod observability;
pub mod protocol;
pub mod realm;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use agent::{Agent, AgentOptions, AgentState, BackendKind, EvalOptions, Realm};
pub use completion::{Completion, CompletionKind, ErrorDescriptor, StackFrame};
pub use realm::{RealmId, RealmOptions};
pub use utils::config::RunifyConfig;
pub use utils::errors::{HarnessError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
