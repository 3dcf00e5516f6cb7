//! Policy engine: compiles a rule set against a schema into an execution
//! plan and drives a run over a batch of records.
//!
//! The entry points are [`compile`](compile::compile) and
//! [`Engine::run`](engine::Engine::run), or [`Engine::execute`](engine::Engine::execute)
//! for a full [`ValidationRequest`](request::ValidationRequest).

mod checks;
pub mod compile;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod evidence;
pub mod judgment;
pub mod plan;
pub mod report;
pub mod request;

pub use compile::compile;
pub use config::{EvidenceMode, OutputPrefs, RuntimeConfig};
pub use engine::{Engine, RunOptions};
pub use error::{CompilationError, EngineError, RunError};
pub use evidence::{Evidence, EvidenceError, EvidenceStore};
pub use judgment::{HttpJudgmentService, Judgment, JudgmentError, JudgmentService};
pub use plan::Plan;
pub use report::{Artifacts, Metrics, RecordResult, RunResult};
pub use request::ValidationRequest;
