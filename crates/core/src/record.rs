//! Records and batches.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::types::RecordId;

/// One input record: an identifier plus an arbitrary structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    pub fn new(record_id: impl Into<RecordId>, payload: Value) -> Self {
        Self {
            record_id: record_id.into(),
            payload,
        }
    }
}

/// Reject empty or repeated record ids.
pub fn ensure_unique_ids(records: &[Record]) -> Result<(), CoreError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if record.record_id.is_empty() {
            return Err(CoreError::Validation(
                "record_id must not be empty".to_string(),
            ));
        }
        if !seen.insert(record.record_id.as_str()) {
            return Err(CoreError::Validation(format!(
                "record_id '{}' appears more than once in the batch",
                record.record_id
            )));
        }
    }
    Ok(())
}

/// The binding seen by batch-level rules: `{"records": [payload...], "count": n}`.
pub fn batch_view(records: &[Record]) -> Value {
    let payloads: Vec<&Value> = records.iter().map(|r| &r.payload).collect();
    json!({
        "records": payloads,
        "count": records.len(),
    })
}
