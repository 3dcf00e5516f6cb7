//! The per-run tool gateway.
//!
//! [`ToolOrchestrator::invoke`] runs every call through a fixed pipeline:
//!
//! 1. response cache (single-flight per key, successful responses only)
//! 2. circuit breaker, re-checked before each attempt
//! 3. bounded dispatch (per-run semaphore, optional per-tool semaphore)
//! 4. driver call under the per-attempt timeout, retried with jittered
//!    backoff on transient failures
//! 5. redaction of the copy handed back for persistence
//!
//! Breaker state lives in a [`ToolStateRegistry`] passed in at
//! construction, so several runs can share or isolate it. The response
//! cache is owned by the orchestrator itself unless [`CacheScope::Shared`]
//! moves it into the registry.
//!
//! A call future may be dropped at any await point (rule timeout, run
//! abort). Breaker trial slots and dispatch queue slots are held by guards
//! that hand them back on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use attestor_events::{EventBus, EventKind, RunEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
use crate::cache::{cache_key, CachedResponse, ResponseCache};
use crate::dispatch::{DispatchPermit, Dispatcher, QueueFull};
use crate::driver::{DriverRegistry, ToolDriver};
use crate::error::{ToolError, TransportError};
use crate::redact::{PassThrough, RedactionPolicy, Redactor};
use crate::retry::RetryPolicy;
use crate::tool::ToolConfig;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Cache and breaker for one tool name.
///
/// The breaker lock is synchronous and never held across an await.
#[derive(Debug)]
struct ToolState {
    breaker: Mutex<CircuitBreaker>,
    cache: ResponseCache,
}

impl ToolState {
    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An admitted HALF_OPEN trial call. Unless disarmed once its outcome is
/// recorded, dropping it hands the trial slot back to the breaker.
struct TrialGuard<'a> {
    state: &'a ToolState,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(state: &'a ToolState, admission: Admission) -> Self {
        Self {
            state,
            armed: admission == Admission::Probe,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.breaker().release_probe();
            tracing::debug!("Half-open trial call abandoned before its outcome was recorded");
        }
    }
}

/// Process-wide per-tool state, keyed by tool name.
///
/// Designed to be wrapped in `Arc` and handed to every orchestrator that
/// should share breaker and cache state.
#[derive(Debug)]
pub struct ToolStateRegistry {
    breaker_config: BreakerConfig,
    tools: RwLock<HashMap<String, Arc<ToolState>>>,
}

impl ToolStateRegistry {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            breaker_config,
            tools: RwLock::new(HashMap::new()),
        }
    }

    async fn state(&self, tool: &str) -> Arc<ToolState> {
        if let Some(state) = self.tools.read().await.get(tool) {
            return state.clone();
        }
        let mut tools = self.tools.write().await;
        tools
            .entry(tool.to_string())
            .or_insert_with(|| {
                Arc::new(ToolState {
                    breaker: Mutex::new(CircuitBreaker::new(self.breaker_config.clone())),
                    cache: ResponseCache::new(),
                })
            })
            .clone()
    }

    /// Current breaker state for diagnostics; `None` if the tool was never
    /// called.
    pub async fn breaker_state(&self, tool: &str) -> Option<BreakerState> {
        let state = self.tools.read().await.get(tool).cloned()?;
        let current = state.breaker().state();
        Some(current)
    }

    /// Drop expired entries from every shared cache. Returns how many were
    /// removed.
    pub async fn purge_expired(&self) -> usize {
        let states: Vec<Arc<ToolState>> = self.tools.read().await.values().cloned().collect();
        let mut purged = 0;
        for state in states {
            purged += state.cache.purge_expired().await;
        }
        purged
    }

    /// Entries currently held in the shared cache of `tool`.
    pub async fn cached_entries(&self, tool: &str) -> usize {
        let Some(state) = self.tools.read().await.get(tool).cloned() else {
            return 0;
        };
        state.cache.len().await
    }
}

impl Default for ToolStateRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Settings, responses and metrics
// ---------------------------------------------------------------------------

/// Lifetime of cached tool responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Owned by one orchestrator and dropped with it.
    #[default]
    Run,
    /// Kept in the [`ToolStateRegistry`] and visible to every run sharing it.
    Shared,
}

/// Run-wide defaults; per-tool [`ToolConfig`] fields override them.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tool_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_inflight: usize,
    pub queue_depth: usize,
    /// `Duration::ZERO` disables caching.
    pub cache_ttl: Duration,
    pub cache_scope: CacheScope,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_inflight: 8,
            queue_depth: 256,
            cache_ttl: Duration::from_secs(300),
            cache_scope: CacheScope::Run,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolResponse {
    /// Unredacted response, for assertion evaluation only.
    pub value: Arc<Value>,
    /// Copy that may be persisted as evidence.
    pub redacted: Arc<Value>,
    pub cached: bool,
    /// Underlying attempts made for this call (`0` on a cache hit).
    pub attempts: u32,
}

/// Where a call originates, for event attribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSite<'a> {
    pub rule_id: Option<&'a str>,
    pub record_id: Option<&'a str>,
}

#[derive(Debug, Default)]
struct ToolMetrics {
    calls: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    breaker_rejections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ToolMetricsSnapshot {
    /// Underlying driver attempts.
    pub tool_calls: u64,
    pub tool_retries: u64,
    pub cache_hits: u64,
    pub breaker_rejections: u64,
}

// ---------------------------------------------------------------------------
// ToolOrchestrator
// ---------------------------------------------------------------------------

pub struct ToolOrchestrator {
    run_id: String,
    tools: HashMap<String, ToolConfig>,
    drivers: DriverRegistry,
    state: Arc<ToolStateRegistry>,
    settings: OrchestratorSettings,
    run_dispatch: Dispatcher,
    tool_dispatch: HashMap<String, Dispatcher>,
    /// Used under [`CacheScope::Run`]; keys already include the tool name.
    run_cache: ResponseCache,
    redactor: Arc<dyn Redactor>,
    events: Option<Arc<EventBus>>,
    metrics: ToolMetrics,
}

impl ToolOrchestrator {
    pub fn new(
        run_id: impl Into<String>,
        tools: Vec<ToolConfig>,
        drivers: DriverRegistry,
        state: Arc<ToolStateRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        let tool_dispatch = tools
            .iter()
            .filter_map(|t| {
                t.max_inflight.map(|n| {
                    let depth = t.queue_depth.unwrap_or(settings.queue_depth);
                    (t.name.clone(), Dispatcher::new(n, depth))
                })
            })
            .collect();
        Self {
            run_id: run_id.into(),
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            drivers,
            state,
            run_dispatch: Dispatcher::new(settings.max_inflight, settings.queue_depth),
            settings,
            tool_dispatch,
            run_cache: ResponseCache::new(),
            redactor: Arc::new(PassThrough),
            events: None,
            metrics: ToolMetrics::default(),
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn metrics(&self) -> ToolMetricsSnapshot {
        ToolMetricsSnapshot {
            tool_calls: self.metrics.calls.load(Ordering::Relaxed),
            tool_retries: self.metrics.retries.load(Ordering::Relaxed),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            breaker_rejections: self.metrics.breaker_rejections.load(Ordering::Relaxed),
        }
    }

    /// Call `tool` with `request`.
    pub async fn invoke(
        &self,
        tool: &str,
        request: &Value,
        site: CallSite<'_>,
    ) -> Result<ToolResponse, ToolError> {
        let config = self
            .tools
            .get(tool)
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;
        let driver = self.drivers.resolve(config).ok_or_else(|| ToolError::Unavailable {
            tool: tool.to_string(),
            message: format!("No driver registered for kind '{}'", config.kind),
        })?;
        let state = self.state.state(tool).await;

        let ttl = config.cache_ttl().unwrap_or(self.settings.cache_ttl);
        let cache = match self.settings.cache_scope {
            CacheScope::Run => &self.run_cache,
            CacheScope::Shared => &state.cache,
        };
        let mut slot = if ttl.is_zero() {
            None
        } else {
            Some(cache.slot(&cache_key(tool, request)).await)
        };

        if let Some(hit) = slot
            .as_deref()
            .and_then(Option::as_ref)
            .filter(|c| c.is_fresh(Instant::now()))
        {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(run_id = %self.run_id, tool, "Tool cache hit");
            return Ok(ToolResponse {
                value: hit.value.clone(),
                redacted: hit.redacted.clone(),
                cached: true,
                attempts: 0,
            });
        }

        self.emit(RunEvent::new(EventKind::ToolCallStarted, &self.run_id), tool, site);
        let started = Instant::now();
        let result = self.call_with_retry(config, driver.as_ref(), &state, request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((value, attempts)) => {
                let policy = RedactionPolicy {
                    tool: tool.to_string(),
                    paths: config.redact.clone(),
                };
                let redacted = if policy.is_empty() {
                    None
                } else {
                    Some(Arc::new(self.redactor.redact(&value, &policy)))
                };
                let value = Arc::new(value);
                let redacted = redacted.unwrap_or_else(|| value.clone());

                if let Some(slot) = slot.as_mut() {
                    **slot = Some(CachedResponse::new(
                        value.clone(),
                        redacted.clone(),
                        ttl,
                        Instant::now(),
                    ));
                }

                self.emit(
                    RunEvent::new(EventKind::ToolCallCompleted, &self.run_id)
                        .with_latency_ms(latency_ms),
                    tool,
                    site,
                );
                Ok(ToolResponse {
                    value,
                    redacted,
                    cached: false,
                    attempts,
                })
            }
            Err(err) => {
                self.emit(
                    RunEvent::new(EventKind::ToolCallError, &self.run_id)
                        .with_latency_ms(latency_ms)
                        .with_error_code(err.code()),
                    tool,
                    site,
                );
                Err(err)
            }
        }
    }

    /// Breaker, dispatch and driver call, retried per the tool's policy.
    /// Returns the response and the number of attempts made.
    async fn call_with_retry(
        &self,
        config: &ToolConfig,
        driver: &dyn ToolDriver,
        state: &ToolState,
        request: &Value,
    ) -> Result<(Value, u32), ToolError> {
        let tool = config.name.as_str();
        let retries = config.retries.unwrap_or(self.settings.retry.max_retries);
        let timeout = config.timeout().unwrap_or(self.settings.tool_timeout);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let admission = state.breaker().try_acquire(Instant::now());
            if admission == Admission::Rejected {
                self.metrics.breaker_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(run_id = %self.run_id, tool, "Circuit open, call rejected");
                return Err(ToolError::Unavailable {
                    tool: tool.to_string(),
                    message: "Circuit breaker is open".to_string(),
                });
            }
            let mut trial = TrialGuard::new(state, admission);

            let permits = self.acquire_permits(tool).await?;

            self.metrics.calls.fetch_add(1, Ordering::Relaxed);
            let outcome = match tokio::time::timeout(timeout, driver.call(config, request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            drop(permits);

            let healthy = match &outcome {
                Ok(_) => true,
                Err(e) => !e.counts_against_breaker(),
            };
            trial.disarm();
            let transition = state.breaker().record(healthy, Instant::now());
            if let Some(next) = transition {
                tracing::info!(run_id = %self.run_id, tool, state = %next, "Circuit breaker transition");
            }

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() && attempt <= retries => {
                    let delay = self.settings.retry.delay(attempt);
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        run_id = %self.run_id,
                        tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Tool call failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        tool,
                        attempt,
                        error = %err,
                        "Tool call failed",
                    );
                    return Err(ToolError::from_transport(tool, err, attempt));
                }
            }
        }
    }

    /// The per-tool permit is taken first, so a call waiting on a saturated
    /// tool never holds one of the run's slots.
    async fn acquire_permits(
        &self,
        tool: &str,
    ) -> Result<(Option<DispatchPermit>, DispatchPermit), ToolError> {
        let saturated = |e: QueueFull| ToolError::RateLimited {
            tool: tool.to_string(),
            message: e.to_string(),
        };
        let per_tool = match self.tool_dispatch.get(tool) {
            Some(dispatcher) => Some(dispatcher.acquire().await.map_err(saturated)?),
            None => None,
        };
        let run = self.run_dispatch.acquire().await.map_err(saturated)?;
        Ok((per_tool, run))
    }

    fn emit(&self, event: RunEvent, tool: &str, site: CallSite<'_>) {
        let Some(bus) = &self.events else {
            return;
        };
        let mut event = event.with_tool(tool).with_record(site.record_id);
        if let Some(rule_id) = site.rule_id {
            event = event.with_rule(rule_id);
        }
        bus.publish(event);
    }
}
