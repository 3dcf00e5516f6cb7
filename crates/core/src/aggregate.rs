//! Outcome aggregation and severity rollup.
//!
//! [`aggregate`] is a pure fold over the full outcome set. Every step is a
//! commutative max or count, so the result is identical for any permutation
//! of the input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::{CheckOutcome, CheckStatus, Scope};
use crate::rule::Severity;
use crate::types::RecordId;

/// Per-status tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
    pub incomplete: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: CheckStatus) {
        match status {
            CheckStatus::Pass => self.pass += 1,
            CheckStatus::Warn => self.warn += 1,
            CheckStatus::Fail => self.fail += 1,
            CheckStatus::Incomplete => self.incomplete += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.warn + self.fail + self.incomplete
    }
}

/// Batch-level summary emitted in the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub status: CheckStatus,
    pub total_checks: usize,
    /// Raw outcome statuses, before severity weighting.
    pub checks: StatusCounts,
    /// Rolled-up record statuses.
    pub records: StatusCounts,
    /// Rolled-up status of batch-scoped checks alone.
    pub batch_checks_status: CheckStatus,
}

/// Result of folding an outcome set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub summary: Summary,
    pub record_status: BTreeMap<RecordId, CheckStatus>,
}

/// Status a single outcome contributes to the rollup.
///
/// ERROR rules keep FAIL, WARN rules turn FAIL into WARN, and INFO rules
/// never raise a record above PASS. INCOMPLETE always stays INCOMPLETE.
pub fn contribution(status: CheckStatus, severity: Severity) -> CheckStatus {
    match (status, severity) {
        (CheckStatus::Incomplete, _) => CheckStatus::Incomplete,
        (CheckStatus::Pass, _) => CheckStatus::Pass,
        (_, Severity::Info) => CheckStatus::Pass,
        (CheckStatus::Fail, Severity::Warn) => CheckStatus::Warn,
        (status, _) => status,
    }
}

/// Fold outcomes into record and batch statuses.
///
/// `record_ids` lists every record in the batch so records without any
/// applicable check still appear (as PASS).
pub fn aggregate<'a, I>(record_ids: &[RecordId], outcomes: I) -> Aggregate
where
    I: IntoIterator<Item = &'a CheckOutcome>,
{
    let mut record_status: BTreeMap<RecordId, CheckStatus> = record_ids
        .iter()
        .map(|id| (id.clone(), CheckStatus::Pass))
        .collect();
    let mut checks = StatusCounts::default();
    let mut batch_checks_status = CheckStatus::Pass;

    for outcome in outcomes {
        checks.add(outcome.status);
        let weighted = contribution(outcome.status, outcome.severity);
        match &outcome.scope {
            Scope::Record(id) => {
                let entry = record_status.entry(id.clone()).or_insert(CheckStatus::Pass);
                *entry = entry.max(weighted);
            }
            Scope::Batch => batch_checks_status = batch_checks_status.max(weighted),
        }
    }

    let mut records = StatusCounts::default();
    let mut status = batch_checks_status;
    for record in record_status.values() {
        records.add(*record);
        status = status.max(*record);
    }

    Aggregate {
        summary: Summary {
            status,
            total_checks: checks.total(),
            checks,
            records,
            batch_checks_status,
        },
        record_status,
    }
}
