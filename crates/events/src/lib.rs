//! Attestor run event bus.
//!
//! Events are published fire-and-forget for external monitoring; nothing in
//! the engine waits on a subscriber.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`RunEvent`]: the event envelope (`run.started`, `tool.call.error`, ...).
//! - [`EventLogger`]: background subscriber that mirrors events into
//!   `tracing`.

pub mod bus;
pub mod logger;

pub use bus::{EventBus, EventKind, RunEvent};
pub use logger::EventLogger;
