//! Tool Orchestrator: the single gateway from rule evaluation to external
//! systems.
//!
//! Every call flows through the same fixed pipeline regardless of tool kind:
//! response cache, circuit breaker, bounded dispatch, retry with backoff,
//! and finally redaction of the copy that will be persisted as evidence.

pub mod breaker;
pub mod cache;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod file;
pub mod http;
pub mod orchestrator;
pub mod redact;
pub mod retry;
pub mod tool;

pub use breaker::{BreakerConfig, BreakerState};
pub use driver::{DriverRegistry, ToolDriver};
pub use error::{ToolError, TransportError};
pub use orchestrator::{
    CacheScope, CallSite, OrchestratorSettings, ToolMetricsSnapshot, ToolOrchestrator, ToolResponse,
    ToolStateRegistry,
};
pub use redact::{PassThrough, RedactionPolicy, Redactor};
pub use retry::RetryPolicy;
pub use tool::{ToolConfig, ToolKind};
