use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sonar_core::{
    append_audit_record, parse_iso, read_json_value, resolve_inside_root, write_json_document,
    write_text_atomic, AuditRecord, EngineError, EngineResult, ErrorCode,
};

use crate::stage::StageId;

/// Schema tag carried by every manifest document.
pub const MANIFEST_SCHEMA_VERSION: &str = "manifest.v1";
/// Manifest file name inside a run root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Fields a `manifest_write` patch may never touch.
const IMMUTABLE_FIELDS: [&str; 4] = ["run_id", "schema_version", "revision", "created_at"];

fn manifest_schema_version() -> String {
    MANIFEST_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RunStatus` values.
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns true when no further mutations are accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the wire form of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `QueryMode` values.
pub enum QueryMode {
    Quick,
    Standard,
    Deep,
}

impl QueryMode {
    /// Returns the wire form of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `Sensitivity` values.
pub enum Sensitivity {
    Normal,
    Restricted,
    NoWeb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Research query settings carried by the manifest.
pub struct QuerySpec {
    pub mode: QueryMode,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub constraints: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
/// Fan-out, size, and loop budgets for one run.
pub struct RunLimits {
    pub max_wave1_agents: u32,
    pub max_wave2_agents: u32,
    pub max_summary_kb: u64,
    pub max_total_summary_kb: u64,
    pub max_review_iterations: u32,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_wave1_agents: 6,
            max_wave2_agents: 4,
            max_summary_kb: 64,
            max_total_summary_kb: 256,
            max_review_iterations: 2,
        }
    }
}

impl RunLimits {
    /// Clamps every budget into its legal range; applied on every write.
    pub fn clamped(self) -> Self {
        Self {
            max_wave1_agents: self.max_wave1_agents.clamp(1, 50),
            max_wave2_agents: self.max_wave2_agents.clamp(1, 50),
            max_summary_kb: self.max_summary_kb.clamp(1, 100_000),
            max_total_summary_kb: self.max_total_summary_kb.clamp(1, 100_000),
            max_review_iterations: self.max_review_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One stage transition as recorded in `stage.history`.
pub struct StageHistoryEntry {
    pub from: StageId,
    pub to: StageId,
    pub ts: String,
    pub reason: String,
    pub inputs_digest: String,
    pub gates_revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Current stage pointer plus the transition history.
pub struct StageState {
    pub current: StageId,
    pub started_at: String,
    pub last_progress_at: String,
    #[serde(default)]
    pub history: Vec<StageHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One recorded retry attempt against a gate budget.
pub struct RetryHistoryEntry {
    pub gate_id: String,
    pub attempt: u32,
    pub change_note: String,
    pub reason: String,
    pub ts: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Retry ledger owned exclusively by the manifest.
pub struct ManifestMetrics {
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub retry_history: Vec<RetryHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Artifact addressing: an owning root plus named relative paths.
pub struct ArtifactIndex {
    pub root: String,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One append-only failure record.
pub struct FailureRecord {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
    pub retryable: bool,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// The single authoritative run state document.
pub struct RunManifest {
    #[serde(default = "manifest_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub revision: u64,
    pub status: RunStatus,
    pub created_at: String,
    pub stage: StageState,
    pub query: QuerySpec,
    pub limits: RunLimits,
    #[serde(default)]
    pub metrics: ManifestMetrics,
    pub artifacts: ArtifactIndex,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
}

impl RunManifest {
    /// Builds the revision-1 manifest for a freshly initialized run.
    pub fn initial(
        run_id: impl Into<String>,
        run_root: &Path,
        query: QuerySpec,
        limits: RunLimits,
        now_iso: &str,
    ) -> Self {
        Self {
            schema_version: manifest_schema_version(),
            run_id: run_id.into(),
            revision: 1,
            status: RunStatus::Running,
            created_at: now_iso.to_string(),
            stage: StageState {
                current: StageId::Init,
                started_at: now_iso.to_string(),
                last_progress_at: now_iso.to_string(),
                history: Vec::new(),
            },
            query,
            limits: limits.clamped(),
            metrics: ManifestMetrics::default(),
            artifacts: ArtifactIndex {
                root: run_root.display().to_string(),
                paths: default_artifact_paths(),
            },
            failures: Vec::new(),
        }
    }

    /// Returns the resolved artifacts root.
    pub fn artifacts_root(&self) -> PathBuf {
        PathBuf::from(&self.artifacts.root)
    }

    /// Returns a named relative artifact path, falling back to the
    /// conventional default when the manifest does not override it.
    pub fn artifact_rel(&self, key: &str, default: &str) -> String {
        self.artifacts
            .paths
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Returns true when the manifest-level kill switch is off.
    pub fn orchestration_disabled(&self) -> bool {
        self.query
            .constraints
            .pointer("/option_c/enabled")
            .and_then(Value::as_bool)
            .map(|enabled| !enabled)
            .unwrap_or(false)
    }

    /// Counts completed review loop iterations (`review -> synthesis`).
    pub fn review_iterations(&self) -> u32 {
        let count = self
            .stage
            .history
            .iter()
            .filter(|entry| entry.from == StageId::Review && entry.to == StageId::Synthesis)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

fn default_artifact_paths() -> BTreeMap<String, String> {
    let defaults = [
        ("perspectives_file", "perspectives.json"),
        ("wave1_dir", "wave-1"),
        ("wave2_dir", "wave-2"),
        ("wave_review_report_file", "wave-1/wave-review.json"),
        ("wave2_review_report_file", "wave-2/wave-review.json"),
        ("pivot_file", "pivot.json"),
        ("citations_file", "citations/citations.jsonl"),
        ("summary_pack_file", "summaries/summary-pack.json"),
        ("synthesis_file", "synthesis/final-synthesis.md"),
        ("review_bundle_file", "review/review-bundle.json"),
        ("retry_directives_file", "retry/retry-directives.json"),
    ];
    defaults
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Validates a decoded manifest, returning the failing JSONPath on error.
pub fn validate_manifest(manifest: &RunManifest) -> EngineResult<()> {
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(schema_failure(
            "$.schema_version",
            format!(
                "unsupported manifest schema version '{}'",
                manifest.schema_version
            ),
        ));
    }
    if manifest.run_id.trim().is_empty() {
        return Err(schema_failure("$.run_id", "run_id cannot be empty"));
    }
    if manifest.revision == 0 {
        return Err(schema_failure("$.revision", "revision must be positive"));
    }
    if parse_iso(&manifest.created_at).is_err() {
        return Err(schema_failure("$.created_at", "created_at is not ISO-8601"));
    }
    if parse_iso(&manifest.stage.last_progress_at).is_err() {
        return Err(schema_failure(
            "$.stage.last_progress_at",
            "last_progress_at is not ISO-8601",
        ));
    }
    let root = manifest.artifacts_root();
    if !root.is_absolute() {
        return Err(schema_failure(
            "$.artifacts.root",
            "artifacts.root must be an absolute path",
        ));
    }
    for (key, relative) in &manifest.artifacts.paths {
        if root.exists() {
            // Surfaces PATH_TRAVERSAL / symlink-escape codes as-is.
            resolve_inside_root(&root, relative)?;
        } else {
            sonar_core::ensure_relative_artifact(relative)?;
        }
        if key.trim().is_empty() {
            return Err(schema_failure(
                "$.artifacts.paths",
                "artifact path keys cannot be empty",
            ));
        }
    }
    Ok(())
}

fn schema_failure(json_path: &str, message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorCode::SchemaValidationFailed, message.into())
        .with_details(json!({ "json_path": json_path }))
}

/// Loads and validates the manifest document.
pub fn load_manifest(manifest_path: &Path) -> EngineResult<RunManifest> {
    let manifest: RunManifest = sonar_core::read_json_document(manifest_path)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Seeds a fresh manifest on disk and appends the initial audit record.
pub fn write_initial_manifest(manifest_path: &Path, manifest: &RunManifest) -> EngineResult<()> {
    validate_manifest(manifest)?;
    write_json_document(manifest_path, manifest)?;
    let record = AuditRecord::for_write(
        "manifest_write",
        "run_init",
        manifest.created_at.clone(),
        manifest.run_id.clone(),
        0,
        manifest.revision,
    );
    append_audit_record(&manifest.artifacts_root(), &record).map_err(EngineError::from)
}

/// RFC 7386 merge-patch: objects merge recursively, null removes a key,
/// everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let Some(target_map) = target.as_object_mut() else {
                return;
            };
            for (key, patch_value) in fields {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                    merge_patch(slot, patch_value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Applies an optimistic merge-patch write to the manifest.
///
/// Immutable fields are rejected, the merged document is re-validated in
/// full, limits are re-clamped, and the audit append is part of the
/// commit: when it fails the previous document is restored.
pub fn manifest_write(
    manifest_path: &Path,
    patch: &Value,
    expected_revision: Option<u64>,
    reason: &str,
    now_iso: &str,
) -> EngineResult<RunManifest> {
    let current_value = read_json_value(manifest_path)?;
    let current: RunManifest = serde_json::from_value(current_value.clone())
        .map_err(|error| schema_failure("$", format!("manifest on disk is invalid: {error}")))?;

    if let Some(expected) = expected_revision {
        if expected != current.revision {
            return Err(EngineError::new(
                ErrorCode::RevisionMismatch,
                format!(
                    "expected manifest revision {expected}, found {}",
                    current.revision
                ),
            )
            .with_details(json!({ "expected": expected, "actual": current.revision })));
        }
    }
    if current.status.is_terminal() {
        return Err(EngineError::new(
            ErrorCode::AlreadyTerminated,
            format!("run is {} and accepts no further writes", current.status.as_str()),
        )
        .with_details(json!({ "status": current.status.as_str() })));
    }

    if let Some(fields) = patch.as_object() {
        for field in IMMUTABLE_FIELDS {
            if let Some(patched) = fields.get(field) {
                if current_value.get(field) != Some(patched) {
                    return Err(EngineError::new(
                        ErrorCode::ImmutableField,
                        format!("field '{field}' is immutable"),
                    )
                    .with_details(json!({ "field": field })));
                }
            }
        }
        if let Some(artifacts) = fields.get("artifacts").and_then(Value::as_object) {
            if let Some(patched_root) = artifacts.get("root") {
                if current_value.pointer("/artifacts/root") != Some(patched_root) {
                    return Err(EngineError::new(
                        ErrorCode::ImmutableField,
                        "field 'artifacts.root' is immutable",
                    )
                    .with_details(json!({ "field": "artifacts.root" })));
                }
            }
        }
    } else {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            "manifest patch must be a JSON object",
        ));
    }

    let mut merged = current_value.clone();
    merge_patch(&mut merged, patch);
    merged["revision"] = json!(current.revision + 1);

    if let Some(raw_status) = merged.get("status") {
        if serde_json::from_value::<RunStatus>(raw_status.clone()).is_err() {
            return Err(schema_failure(
                "$.status",
                format!("invalid status {raw_status}"),
            ));
        }
    }
    let mut next: RunManifest = serde_json::from_value(merged)
        .map_err(|error| schema_failure("$", format!("patched manifest is invalid: {error}")))?;
    next.limits = next.limits.clamped();
    validate_manifest(&next)?;

    commit_manifest(manifest_path, &current, &next, reason, now_iso)?;
    Ok(next)
}

/// Appends a failure record; failures are append-only.
pub fn record_failure(
    manifest_path: &Path,
    failure: FailureRecord,
    reason: &str,
) -> EngineResult<RunManifest> {
    let current = load_manifest(manifest_path)?;
    let mut next = current.clone();
    let ts = failure.ts.clone();
    next.failures.push(failure);
    next.revision += 1;
    commit_manifest(manifest_path, &current, &next, reason, &ts)?;
    Ok(next)
}

/// Marks the run failed with an accompanying failure record. Used by the
/// watchdog; bypasses the terminal-status write guard only in the sense
/// that failing an already-terminal run is a no-op.
pub fn mark_run_failed(
    manifest_path: &Path,
    failure: FailureRecord,
    reason: &str,
) -> EngineResult<RunManifest> {
    let current = load_manifest(manifest_path)?;
    if current.status.is_terminal() {
        return Ok(current);
    }
    let mut next = current.clone();
    let ts = failure.ts.clone();
    next.status = RunStatus::Failed;
    next.failures.push(failure);
    next.revision += 1;
    commit_manifest(manifest_path, &current, &next, reason, &ts)?;
    Ok(next)
}

/// Outcome of a successful `retry_record` call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RetryRecordOutcome {
    pub gate_id: String,
    pub retry_count: u32,
}

/// Records one retry attempt against a gate budget.
///
/// The attempt is rejected with `RETRY_EXHAUSTED` once the recorded count
/// has reached `max_retries`; the manifest is untouched in that case.
pub fn retry_record(
    manifest_path: &Path,
    gate_id: &str,
    change_note: &str,
    reason: &str,
    max_retries: u32,
    now_iso: &str,
) -> EngineResult<RetryRecordOutcome> {
    let current = load_manifest(manifest_path)?;
    let recorded = current
        .metrics
        .retry_counts
        .get(gate_id)
        .copied()
        .unwrap_or(0);
    if recorded >= max_retries {
        return Err(EngineError::new(
            ErrorCode::RetryExhausted,
            format!("retry budget for gate {gate_id} is exhausted"),
        )
        .with_details(json!({ "retry_count": recorded, "max_retries": max_retries })));
    }

    let attempt = recorded + 1;
    let mut next = current.clone();
    next.metrics
        .retry_counts
        .insert(gate_id.to_string(), attempt);
    next.metrics.retry_history.push(RetryHistoryEntry {
        gate_id: gate_id.to_string(),
        attempt,
        change_note: change_note.to_string(),
        reason: reason.to_string(),
        ts: now_iso.to_string(),
    });
    next.revision += 1;

    let audit_reason = format!("retry_record({gate_id}#{attempt}): {reason}");
    commit_with_kind(
        manifest_path,
        &current,
        &next,
        "retry_record",
        &audit_reason,
        now_iso,
    )?;
    Ok(RetryRecordOutcome {
        gate_id: gate_id.to_string(),
        retry_count: attempt,
    })
}

pub(crate) fn commit_manifest(
    manifest_path: &Path,
    previous: &RunManifest,
    next: &RunManifest,
    reason: &str,
    now_iso: &str,
) -> EngineResult<()> {
    commit_with_kind(manifest_path, previous, next, "manifest_write", reason, now_iso)
}

fn commit_with_kind(
    manifest_path: &Path,
    previous: &RunManifest,
    next: &RunManifest,
    kind: &str,
    reason: &str,
    now_iso: &str,
) -> EngineResult<()> {
    let previous_text = sonar_core::json_store::canonical_document_text(
        &serde_json::to_value(previous).map_err(|error| {
            EngineError::new(ErrorCode::Internal, format!("failed to encode manifest: {error}"))
        })?,
    );
    write_json_document(manifest_path, next)?;

    let record = AuditRecord::for_write(
        kind,
        reason,
        now_iso,
        next.run_id.clone(),
        previous.revision,
        next.revision,
    );
    // Audit destination follows the resolved artifacts.root, never the
    // directory that happens to contain manifest.json.
    if let Err(error) = append_audit_record(&next.artifacts_root(), &record) {
        let restore = write_text_atomic(manifest_path, &previous_text);
        if let Err(restore_error) = restore {
            return Err(EngineError::new(
                ErrorCode::Internal,
                format!(
                    "audit append failed ({error:#}) and manifest restore failed ({restore_error:#})"
                ),
            ));
        }
        return Err(EngineError::new(
            ErrorCode::Internal,
            format!("audit append failed, manifest write reverted: {error:#}"),
        ));
    }
    Ok(())
}
