// packages/runify/src/transport/mod.rs
//! Out-of-band transport
//!
//! - **Event Queue**: concurrent queue of runtime events, one per agent session
//! - **Channel**: HTTP/1 server used by browser-resident runtimes to report
//!   `print` and `destroy` events the WebDriver call path cannot return
//!
//! # Architecture
//!
//! ```text
//! Browser page ── POST /<token>/event ──► TransportChannel ──► EventQueue ──► Agent
//! Engine stdout ── "#!runify {...}" ──► stdout reader ───────────┘
//! QuickJS thread ─────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod event_queue;

pub use channel::{TransportChannel, TransportConfig};
pub use event_queue::{EventQueue, QueueStats};
