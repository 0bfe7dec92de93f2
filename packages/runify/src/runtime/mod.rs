// packages/runify/src/runtime/mod.rs
//! Backend supervisors
//!
//! One supervisor per backend family, each owning the lifecycle of whatever
//! hosts the Injected Runtime:
//!
//! - **Process Manager / Process Supervisor**: engine binaries (node, d8,
//!   jsc, js) fed request frames on stdin
//! - **WebDriver / Browser Supervisor**: browsers loading the bootstrap
//!   page from the session's Transport Channel
//! - **QuickJS**: an embedded engine on a dedicated thread
//!
//! # Architecture
//!
//! ```text
//!                    Agent
//!                      │ deliver(Request)
//!      ┌───────────────┼────────────────┐
//!      ▼               ▼                ▼
//!  stdin frame   execute/sync      crossbeam cmd
//!      │               │                │
//!  engine proc      browser        quickjs thread
//!      │               │                │
//!  stdout reader   Transport Ch.   direct push
//!      └───────────────┼────────────────┘
//!                      ▼
//!                 EventQueue ──▶ Agent
//! ```

pub mod browser_supervisor;
pub mod process_manager;
pub mod process_supervisor;
pub mod quickjs;
pub mod webdriver;

// Re-export commonly used types
pub use browser_supervisor::{BrowserLaunch, BrowserSupervisor};
pub use process_manager::{ProcessManager, ProcessType, SpawnConfig};
pub use process_supervisor::{ProcessSupervisor, RuntimeHandle};
pub use quickjs::QuickJsHost;
pub use webdriver::{BrowserProduct, WebDriverClient, WebDriverSession};
