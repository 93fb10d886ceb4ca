use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{EngineError, EngineResult, ErrorCode};
use sonar_state::{
    write_initial_gates, write_initial_manifest, GatesDocument, QuerySpec, RunLimits, RunManifest,
};

/// Operator scope document inside a run root.
pub const SCOPE_FILE: &str = "operator/scope.json";
/// Schema tag carried by the scope document.
pub const SCOPE_SCHEMA_VERSION: &str = "scope.v1";

/// Subdirectories created by `run_init`.
const RUN_SKELETON: [&str; 12] = [
    "wave-1",
    "wave-2",
    "citations",
    "summaries",
    "synthesis",
    "review",
    "reports",
    "retry",
    "logs",
    "metrics",
    "operator",
    "operator/halt",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Operator-authored research scope; consumed once by `run_init`.
pub struct ScopeDocument {
    pub schema_version: String,
    pub scope_label: String,
    pub query: QuerySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<RunLimits>,
}

/// Loads and validates `operator/scope.json`.
pub fn load_scope(run_root: &Path) -> EngineResult<Option<ScopeDocument>> {
    let path = run_root.join(SCOPE_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let scope: ScopeDocument = sonar_core::read_json_document(&path)?;
    if scope.schema_version != SCOPE_SCHEMA_VERSION {
        return Err(EngineError::new(
            ErrorCode::SchemaValidationFailed,
            format!("unsupported scope schema version '{}'", scope.schema_version),
        )
        .with_details(json!({ "json_path": "$.schema_version" })));
    }
    if scope.scope_label.trim().is_empty() {
        return Err(EngineError::new(
            ErrorCode::SchemaValidationFailed,
            "scope_label cannot be empty",
        )
        .with_details(json!({ "json_path": "$.scope_label" })));
    }
    Ok(Some(scope))
}

/// Inputs for one run bootstrap.
#[derive(Debug, Clone)]
pub struct RunInitRequest<'a> {
    pub run_root: &'a Path,
    pub run_id: &'a str,
    pub query: QuerySpec,
    pub limits: RunLimits,
    pub now_iso: &'a str,
}

/// Creates the run skeleton and seeds `manifest.json` (revision 1,
/// stage `init`, status `running`) plus `gates.json` (all pending).
///
/// Re-initializing a run root that already holds run state fails with
/// `INVALID_ARGS`; a pre-seeded `operator/` directory is tolerated.
pub fn run_init(request: &RunInitRequest<'_>) -> EngineResult<RunManifest> {
    if request.run_root.exists() {
        let occupied = std::fs::read_dir(request.run_root)
            .map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to list {}: {error}", request.run_root.display()),
                )
            })?
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name() != "operator");
        if occupied {
            return Err(EngineError::new(
                ErrorCode::InvalidArgs,
                format!("run root {} is not empty", request.run_root.display()),
            )
            .with_details(json!({ "run_root": request.run_root.display().to_string() })));
        }
    }
    for subdir in RUN_SKELETON {
        std::fs::create_dir_all(request.run_root.join(subdir)).map_err(|error| {
            EngineError::new(
                ErrorCode::Internal,
                format!("failed to create {subdir}: {error}"),
            )
        })?;
    }

    let run_root = request.run_root.canonicalize().map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to canonicalize run root: {error}"),
        )
    })?;
    let manifest = RunManifest::initial(
        request.run_id,
        &run_root,
        request.query.clone(),
        request.limits,
        request.now_iso,
    );
    write_initial_manifest(&run_root.join(sonar_state::MANIFEST_FILE), &manifest)?;
    write_initial_gates(
        &run_root.join(sonar_state::GATES_FILE),
        &GatesDocument::initial(request.run_id),
        request.now_iso,
    )?;
    tracing::info!(run_id = %request.run_id, root = %run_root.display(), "run initialized");
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sonar_core::ErrorCode;
    use sonar_state::{QueryMode, QuerySpec, RunLimits, RunStatus, Sensitivity, StageId};

    use super::{load_scope, run_init, RunInitRequest};

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn request<'a>(run_root: &'a std::path::Path) -> RunInitRequest<'a> {
        RunInitRequest {
            run_root,
            run_id: "run-001",
            query: QuerySpec {
                mode: QueryMode::Standard,
                sensitivity: Sensitivity::NoWeb,
                constraints: json!({}),
            },
            limits: RunLimits::default(),
            now_iso: NOW,
        }
    }

    #[test]
    fn functional_run_init_seeds_manifest_gates_and_skeleton() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let run_root = tempdir.path().join("run-001");
        let manifest = run_init(&request(&run_root)).expect("init should succeed");
        assert_eq!(manifest.revision, 1);
        assert_eq!(manifest.status, RunStatus::Running);
        assert_eq!(manifest.stage.current, StageId::Init);
        for rel in ["manifest.json", "gates.json", "wave-1", "logs", "operator/halt"] {
            assert!(run_root.join(rel).exists(), "missing {rel}");
        }
        let audit = std::fs::read_to_string(run_root.join("logs/audit.jsonl")).expect("audit");
        assert_eq!(audit.lines().count(), 2);
    }

    #[test]
    fn regression_run_init_refuses_an_occupied_root() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let run_root = tempdir.path().join("run-001");
        run_init(&request(&run_root)).expect("first init");
        let error = run_init(&request(&run_root)).expect_err("re-init should fail");
        assert_eq!(error.code, ErrorCode::InvalidArgs);
    }

    #[test]
    fn functional_run_init_tolerates_a_preseeded_operator_dir() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let run_root = tempdir.path().join("run-001");
        std::fs::create_dir_all(run_root.join("operator")).expect("operator dir");
        sonar_core::write_json_document(
            &run_root.join("operator/scope.json"),
            &json!({
                "schema_version": "scope.v1",
                "scope_label": "solar storage economics",
                "query": { "mode": "deep", "sensitivity": "no_web", "constraints": {} },
            }),
        )
        .expect("scope");

        run_init(&request(&run_root)).expect("init should succeed");
        let scope = load_scope(&run_root)
            .expect("scope should load")
            .expect("scope present");
        assert_eq!(scope.scope_label, "solar storage economics");
    }
}
