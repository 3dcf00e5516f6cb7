//! Write-once evidence store for a single run.
//!
//! Each entry is addressed by
//! `urn:attestor:evidence:<run_id>:<rule_id>:<scope>` and can be recorded
//! exactly once. There is no update or delete; entries live as long as the
//! run's store.

use std::collections::BTreeMap;
use std::sync::Arc;

use attestor_core::outcome::Scope;
use attestor_core::types::{RuleId, RunId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvidenceError {
    #[error("Evidence '{0}' is already recorded")]
    AlreadyRecorded(String),

    #[error("Evidence '{0}' not found")]
    NotFound(String),
}

/// Immutable record of what a check saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub urn: String,
    pub run_id: RunId,
    pub rule_id: RuleId,
    pub scope: Scope,
    /// Values read from the record or batch.
    pub inputs: Value,
    /// Redacted tool response or judgment, when one was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,
    pub recorded_at: Timestamp,
}

/// Evidence fields supplied by the evaluator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceDraft {
    pub inputs: Value,
    pub response: Option<Value>,
    pub diff: Option<Value>,
}

pub fn evidence_urn(run_id: &str, rule_id: &str, scope: &Scope) -> String {
    format!("urn:attestor:evidence:{run_id}:{rule_id}:{scope}")
}

#[derive(Debug)]
pub struct EvidenceStore {
    run_id: RunId,
    entries: RwLock<BTreeMap<String, Arc<Evidence>>>,
}

impl EvidenceStore {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Persist evidence for `(rule_id, scope)` and return its urn.
    pub async fn record(
        &self,
        rule_id: &str,
        scope: &Scope,
        draft: EvidenceDraft,
    ) -> Result<String, EvidenceError> {
        let urn = evidence_urn(&self.run_id, rule_id, scope);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&urn) {
            return Err(EvidenceError::AlreadyRecorded(urn));
        }
        let evidence = Evidence {
            urn: urn.clone(),
            run_id: self.run_id.clone(),
            rule_id: rule_id.to_string(),
            scope: scope.clone(),
            inputs: draft.inputs,
            response: draft.response,
            diff: draft.diff,
            recorded_at: Utc::now(),
        };
        entries.insert(urn.clone(), Arc::new(evidence));
        Ok(urn)
    }

    pub async fn get(&self, urn: &str) -> Result<Arc<Evidence>, EvidenceError> {
        self.entries
            .read()
            .await
            .get(urn)
            .cloned()
            .ok_or_else(|| EvidenceError::NotFound(urn.to_string()))
    }

    /// Every recorded urn, sorted.
    pub async fn refs(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
