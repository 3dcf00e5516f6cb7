//! Run-time knobs and output preferences.
//!
//! Both structs deserialize from the `runtime` and `output_prefs` sections of
//! a request, with every field optional. [`RuntimeConfig::apply_env`] layers
//! environment overrides on top.

use std::str::FromStr;
use std::time::Duration;

use attestor_tools::{BreakerConfig, CacheScope, OrchestratorSettings, RetryPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {var}: '{value}'")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bound on one rule evaluation, including retries and fallback.
    pub rule_timeout_ms: u64,
    /// Bound on a single tool call attempt.
    pub tool_timeout_ms: u64,
    pub retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Inflight tool calls allowed per run.
    pub max_inflight: usize,
    pub queue_depth: usize,
    /// `0` disables response caching.
    pub cache_ttl_ms: u64,
    /// `run` (default) isolates cached responses per run; `shared` keeps
    /// them in the engine's tool state for later runs.
    pub cache_scope: CacheScope,
    pub breaker: BreakerConfig,
    /// Minimum judgment confidence for a categorical answer to stand.
    pub judgment_threshold: f64,
    /// Time in-flight tasks get to finish after cancellation.
    pub cancel_grace_ms: u64,
    /// Synthesize `schema.<field>.<check>` rules from field constraints.
    pub derive_schema_rules: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rule_timeout_ms: 30_000,
            tool_timeout_ms: 10_000,
            retries: 2,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
            max_inflight: 8,
            queue_depth: 256,
            cache_ttl_ms: 300_000,
            cache_scope: CacheScope::Run,
            breaker: BreakerConfig::default(),
            judgment_threshold: 0.7,
            cancel_grace_ms: 2_000,
            derive_schema_rules: false,
        }
    }
}

impl RuntimeConfig {
    /// Override fields from environment variables.
    ///
    /// | Env Var                    | Field             |
    /// |----------------------------|-------------------|
    /// | `ATTESTOR_RULE_TIMEOUT_MS` | `rule_timeout_ms` |
    /// | `ATTESTOR_TOOL_TIMEOUT_MS` | `tool_timeout_ms` |
    /// | `ATTESTOR_RETRIES`         | `retries`         |
    /// | `ATTESTOR_MAX_INFLIGHT`    | `max_inflight`    |
    /// | `ATTESTOR_QUEUE_DEPTH`     | `queue_depth`     |
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with an explicit lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "ATTESTOR_RULE_TIMEOUT_MS", &mut self.rule_timeout_ms)?;
        override_from(&lookup, "ATTESTOR_TOOL_TIMEOUT_MS", &mut self.tool_timeout_ms)?;
        override_from(&lookup, "ATTESTOR_RETRIES", &mut self.retries)?;
        override_from(&lookup, "ATTESTOR_MAX_INFLIGHT", &mut self.max_inflight)?;
        override_from(&lookup, "ATTESTOR_QUEUE_DEPTH", &mut self.queue_depth)?;
        Ok(())
    }

    pub fn rule_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Orchestrator defaults derived from this config.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            tool_timeout: Duration::from_millis(self.tool_timeout_ms),
            retry: RetryPolicy {
                max_retries: self.retries,
                initial_delay_ms: self.backoff_initial_ms,
                max_delay_ms: self.backoff_max_ms,
                ..RetryPolicy::default()
            },
            max_inflight: self.max_inflight,
            queue_depth: self.queue_depth,
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            cache_scope: self.cache_scope,
        }
    }
}

fn override_from<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError { var, value: raw.clone() })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OutputPrefs
// ---------------------------------------------------------------------------

/// Which outcomes capture evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceMode {
    All,
    #[default]
    NonPass,
    Off,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPrefs {
    pub evidence: EvidenceMode,
}
