//! Data model and pure evaluation logic for the attestor validation engine.
//!
//! Nothing in this crate performs I/O or suspends: schemas, rules, records,
//! check outcomes, the operator library, path selection, request templates
//! and the outcome aggregator all live here so they can be shared by the tool
//! orchestrator, the engine and any tooling built on top.

pub mod aggregate;
pub mod error;
pub mod hashing;
pub mod operators;
pub mod outcome;
pub mod path;
pub mod record;
pub mod rule;
pub mod schema;
pub mod template;
pub mod types;
