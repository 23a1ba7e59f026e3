// Quarantine: branches excluded from auto-sync and pushes until an operator
// reconciles them by hand. Entered on rollback inconsistency or when a
// queued forward can no longer be delivered.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use gitmirror_common::protocol::api::QuarantineEntry;
use gitmirror_common::types::{CommitHash, RepositoryId};
use tracing::{error, info};

use crate::lock::BranchKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineRecord {
    pub key: BranchKey,
    pub reason: String,
    /// Local tip when the branch was quarantined.
    pub local: Option<CommitHash>,
    /// Value the engine expected to find.
    pub expected: Option<CommitHash>,
    pub since: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn to_entry(&self) -> QuarantineEntry {
        QuarantineEntry {
            branch: self.key.branch.clone(),
            reason: self.reason.clone(),
            local: self.local.clone(),
            expected: self.expected.clone(),
            since: self.since,
        }
    }
}

#[derive(Clone, Default)]
pub struct Quarantine {
    records: Arc<Mutex<BTreeMap<BranchKey, QuarantineRecord>>>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<BranchKey, QuarantineRecord>> {
        match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Quarantine `key`. An existing record keeps its original reason.
    pub fn quarantine(
        &self,
        key: &BranchKey,
        reason: impl Into<String>,
        local: Option<CommitHash>,
        expected: Option<CommitHash>,
    ) -> QuarantineRecord {
        let reason = reason.into();
        let mut records = self.records();
        let record = records.entry(key.clone()).or_insert_with(|| {
            error!(
                repository_id = %key.repository_id,
                branch = %key.branch,
                reason = %reason,
                local = ?local.as_ref().map(CommitHash::short),
                expected = ?expected.as_ref().map(CommitHash::short),
                "branch quarantined; manual reconciliation required"
            );
            QuarantineRecord { key: key.clone(), reason, local, expected, since: Utc::now() }
        });
        record.clone()
    }

    pub fn is_quarantined(&self, key: &BranchKey) -> bool {
        self.records().contains_key(key)
    }

    pub fn get(&self, key: &BranchKey) -> Option<QuarantineRecord> {
        self.records().get(key).cloned()
    }

    pub fn list(&self, repository_id: &RepositoryId) -> Vec<QuarantineRecord> {
        self.records()
            .values()
            .filter(|record| &record.key.repository_id == repository_id)
            .cloned()
            .collect()
    }

    /// Operator release. Refs are left exactly as they are.
    pub fn release(&self, key: &BranchKey) -> Option<QuarantineRecord> {
        let released = self.records().remove(key);
        if released.is_some() {
            info!(repository_id = %key.repository_id, branch = %key.branch, "quarantine released");
        }
        released
    }
}
