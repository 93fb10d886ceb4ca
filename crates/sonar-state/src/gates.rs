use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sonar_core::{
    append_audit_record, parse_iso, write_json_document, write_text_atomic, AuditRecord,
    EngineError, EngineResult, ErrorCode,
};

/// Schema tag carried by every gates document.
pub const GATES_SCHEMA_VERSION: &str = "gates.v1";
/// Gates file name inside a run root.
pub const GATES_FILE: &str = "gates.json";

fn gates_schema_version() -> String {
    GATES_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
/// The six named quality gates.
pub enum GateId {
    A,
    B,
    C,
    D,
    E,
    F,
}

/// All gates in evaluation order.
pub const ALL_GATES: [GateId; 6] = [
    GateId::A,
    GateId::B,
    GateId::C,
    GateId::D,
    GateId::E,
    GateId::F,
];

impl GateId {
    /// Returns the wire form of the gate id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }

    /// Hard gates may never carry `warn`.
    pub fn is_hard(self) -> bool {
        !matches!(self, Self::F)
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `GateStatus` values.
pub enum GateStatus {
    Pending,
    Pass,
    Fail,
    Warn,
}

impl GateStatus {
    /// Returns the wire form of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One gate's recorded state.
pub struct GateRecord {
    pub status: GateStatus,
    pub hard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl GateRecord {
    fn pending(gate: GateId) -> Self {
        Self {
            status: GateStatus::Pending,
            hard: gate.is_hard(),
            checked_at: None,
            metrics: Value::Null,
            artifacts: Vec::new(),
            warnings: Vec::new(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// The gates document; owns every gate status for one run.
pub struct GatesDocument {
    #[serde(default = "gates_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub revision: u64,
    #[serde(default)]
    pub inputs_digest: String,
    pub gates: BTreeMap<GateId, GateRecord>,
}

impl GatesDocument {
    /// Builds the revision-1 document with every gate pending.
    pub fn initial(run_id: impl Into<String>) -> Self {
        Self {
            schema_version: gates_schema_version(),
            run_id: run_id.into(),
            revision: 1,
            inputs_digest: String::new(),
            gates: ALL_GATES
                .into_iter()
                .map(|gate| (gate, GateRecord::pending(gate)))
                .collect(),
        }
    }

    /// Returns one gate's status, treating absent records as pending.
    pub fn status_of(&self, gate: GateId) -> GateStatus {
        self.gates
            .get(&gate)
            .map(|record| record.status)
            .unwrap_or(GateStatus::Pending)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Partial update for one gate; absent fields keep their recorded value.
pub struct GateUpdate {
    pub status: GateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Default for GateStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Loads and validates the gates document.
pub fn load_gates(gates_path: &Path) -> EngineResult<GatesDocument> {
    let document: GatesDocument = sonar_core::read_json_document(gates_path)?;
    if document.schema_version != GATES_SCHEMA_VERSION {
        return Err(EngineError::new(
            ErrorCode::SchemaValidationFailed,
            format!(
                "unsupported gates schema version '{}'",
                document.schema_version
            ),
        )
        .with_details(json!({ "json_path": "$.schema_version" })));
    }
    Ok(document)
}

/// Seeds a fresh gates document on disk and appends the initial audit
/// record next to it.
pub fn write_initial_gates(
    gates_path: &Path,
    document: &GatesDocument,
    now_iso: &str,
) -> EngineResult<()> {
    write_json_document(gates_path, document)?;
    let root = gates_root(gates_path);
    let record = AuditRecord::for_write(
        "gates_write",
        "run_init",
        now_iso,
        document.run_id.clone(),
        0,
        document.revision,
    );
    append_audit_record(&root, &record).map_err(EngineError::from)
}

/// Applies a partial gate update under the lifecycle rules.
///
/// Hard gates reject `warn`; `pass`/`fail` require a parseable
/// `checked_at`. On success the revision increments, the inputs digest is
/// persisted, and the audit append is part of the commit.
pub fn gates_write(
    gates_path: &Path,
    updates: &BTreeMap<GateId, GateUpdate>,
    expected_revision: Option<u64>,
    inputs_digest: &str,
    reason: &str,
    now_iso: &str,
) -> EngineResult<GatesDocument> {
    let current = load_gates(gates_path)?;
    if let Some(expected) = expected_revision {
        if expected != current.revision {
            return Err(EngineError::new(
                ErrorCode::RevisionMismatch,
                format!(
                    "expected gates revision {expected}, found {}",
                    current.revision
                ),
            )
            .with_details(json!({ "expected": expected, "actual": current.revision })));
        }
    }

    for (gate, update) in updates {
        if gate.is_hard() && update.status == GateStatus::Warn {
            return Err(lifecycle_violation(
                *gate,
                format!("hard gate {gate} cannot be set to warn"),
            ));
        }
        if matches!(update.status, GateStatus::Pass | GateStatus::Fail) {
            let Some(checked_at) = update.checked_at.as_deref() else {
                return Err(lifecycle_violation(
                    *gate,
                    format!("gate {gate} requires checked_at for {}", update.status.as_str()),
                ));
            };
            if parse_iso(checked_at).is_err() {
                return Err(lifecycle_violation(
                    *gate,
                    format!("gate {gate} checked_at is not ISO-8601"),
                ));
            }
        }
    }

    let mut next = current.clone();
    for (gate, update) in updates {
        let record = next
            .gates
            .entry(*gate)
            .or_insert_with(|| GateRecord::pending(*gate));
        record.status = update.status;
        if update.checked_at.is_some() {
            record.checked_at = update.checked_at.clone();
        }
        if let Some(metrics) = &update.metrics {
            record.metrics = metrics.clone();
        }
        if let Some(artifacts) = &update.artifacts {
            record.artifacts = artifacts.clone();
        }
        if let Some(warnings) = &update.warnings {
            record.warnings = warnings.clone();
        }
        if let Some(notes) = &update.notes {
            record.notes = notes.clone();
        }
    }
    next.revision = current.revision + 1;
    next.inputs_digest = inputs_digest.to_string();

    let previous_text = sonar_core::json_store::canonical_document_text(
        &serde_json::to_value(&current).map_err(|error| {
            EngineError::new(ErrorCode::Internal, format!("failed to encode gates: {error}"))
        })?,
    );
    write_json_document(gates_path, &next)?;
    let record = AuditRecord::for_write(
        "gates_write",
        reason,
        now_iso,
        next.run_id.clone(),
        current.revision,
        next.revision,
    );
    if let Err(error) = append_audit_record(&gates_root(gates_path), &record) {
        write_text_atomic(gates_path, &previous_text).map_err(EngineError::from)?;
        return Err(EngineError::new(
            ErrorCode::Internal,
            format!("audit append failed, gates write reverted: {error:#}"),
        ));
    }
    Ok(next)
}

fn gates_root(gates_path: &Path) -> std::path::PathBuf {
    gates_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}

fn lifecycle_violation(gate: GateId, message: String) -> EngineError {
    EngineError::new(ErrorCode::LifecycleRuleViolation, message)
        .with_details(json!({ "gate": gate.as_str() }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use sonar_core::ErrorCode;

    use super::{
        gates_write, load_gates, write_initial_gates, GateId, GateStatus, GateUpdate,
        GatesDocument,
    };

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn seeded_gates(root: &std::path::Path) -> std::path::PathBuf {
        let path = root.join("gates.json");
        write_initial_gates(&path, &GatesDocument::initial("run-001"), NOW)
            .expect("seed gates");
        path
    }

    fn update(status: GateStatus, checked_at: Option<&str>) -> GateUpdate {
        GateUpdate {
            status,
            checked_at: checked_at.map(str::to_string),
            ..GateUpdate::default()
        }
    }

    #[test]
    fn functional_gates_write_applies_partial_updates() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = seeded_gates(tempdir.path());

        let mut updates = BTreeMap::new();
        updates.insert(
            GateId::B,
            GateUpdate {
                status: GateStatus::Pass,
                checked_at: Some(NOW.to_string()),
                metrics: Some(json!({ "validated": 3, "failed": 0 })),
                ..GateUpdate::default()
            },
        );
        let next = gates_write(&path, &updates, Some(1), "sha256:feed", "wave review", NOW)
            .expect("update should apply");
        assert_eq!(next.revision, 2);
        assert_eq!(next.status_of(GateId::B), GateStatus::Pass);
        assert_eq!(next.status_of(GateId::C), GateStatus::Pending);
        assert_eq!(next.inputs_digest, "sha256:feed");

        let reloaded = load_gates(&path).expect("reload");
        assert_eq!(reloaded, next);
    }

    #[test]
    fn regression_hard_gate_rejects_warn() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = seeded_gates(tempdir.path());
        let mut updates = BTreeMap::new();
        updates.insert(GateId::C, update(GateStatus::Warn, None));
        let error = gates_write(&path, &updates, None, "", "warn hard gate", NOW)
            .expect_err("hard warn should fail");
        assert_eq!(error.code, ErrorCode::LifecycleRuleViolation);
        assert_eq!(load_gates(&path).expect("reload").revision, 1);
    }

    #[test]
    fn functional_soft_gate_accepts_warn() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = seeded_gates(tempdir.path());
        let mut updates = BTreeMap::new();
        updates.insert(GateId::F, update(GateStatus::Warn, None));
        let next = gates_write(&path, &updates, None, "", "advisories", NOW)
            .expect("soft warn should apply");
        assert_eq!(next.status_of(GateId::F), GateStatus::Warn);
    }

    #[test]
    fn regression_pass_requires_checked_at() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = seeded_gates(tempdir.path());
        let mut updates = BTreeMap::new();
        updates.insert(GateId::D, update(GateStatus::Pass, None));
        let missing = gates_write(&path, &updates, None, "", "no checked_at", NOW)
            .expect_err("missing checked_at should fail");
        assert_eq!(missing.code, ErrorCode::LifecycleRuleViolation);

        updates.insert(GateId::D, update(GateStatus::Pass, Some("yesterday")));
        let malformed = gates_write(&path, &updates, None, "", "bad checked_at", NOW)
            .expect_err("malformed checked_at should fail");
        assert_eq!(malformed.code, ErrorCode::LifecycleRuleViolation);
    }

    #[test]
    fn regression_gates_write_rejects_stale_revision() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = seeded_gates(tempdir.path());
        let mut updates = BTreeMap::new();
        updates.insert(GateId::A, update(GateStatus::Pass, Some(NOW)));
        let error = gates_write(&path, &updates, Some(9), "", "stale", NOW)
            .expect_err("stale revision should fail");
        assert_eq!(error.code, ErrorCode::RevisionMismatch);
    }
}
