use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::atomic_io::append_jsonl_line;

/// One append-only record per state-mutating action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub kind: String,
    pub reason: String,
    pub ts: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_after: Option<u64>,
}

impl AuditRecord {
    /// Builds a record for a revisioned document write.
    pub fn for_write(
        kind: impl Into<String>,
        reason: impl Into<String>,
        ts: impl Into<String>,
        run_id: impl Into<String>,
        revision_before: u64,
        revision_after: u64,
    ) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
            ts: ts.into(),
            run_id: run_id.into(),
            revision_before: Some(revision_before),
            revision_after: Some(revision_after),
        }
    }

    /// Builds a record for an action without a document revision.
    pub fn for_action(
        kind: impl Into<String>,
        reason: impl Into<String>,
        ts: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
            ts: ts.into(),
            run_id: run_id.into(),
            revision_before: None,
            revision_after: None,
        }
    }
}

/// Returns the audit ledger path under a run (or artifacts) root.
pub fn audit_log_path(root: &Path) -> PathBuf {
    root.join("logs").join("audit.jsonl")
}

/// Appends one audit record under `root/logs/audit.jsonl`.
///
/// Callers that pair this with a document write revert the write when the
/// append fails; the append itself never partially commits because each
/// record is a single flushed line.
pub fn append_audit_record(root: &Path, record: &AuditRecord) -> Result<()> {
    let line = serde_json::to_string(record).context("failed to encode audit record")?;
    append_jsonl_line(&audit_log_path(root), &line)
}
