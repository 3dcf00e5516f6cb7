/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a single run (one batch under one rule-set version).
pub type RunId = String;

/// Identifier of a rule, unique within a run.
pub type RuleId = String;

/// Identifier of a record, unique within a batch.
pub type RecordId = String;
