use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};

/// Halt directory inside a run root.
pub const HALT_DIR: &str = "operator/halt";
/// Pointer to the newest halt document.
pub const HALT_LATEST_FILE: &str = "operator/halt/latest.json";
/// Schema tag carried by halt documents.
pub const HALT_SCHEMA_VERSION: &str = "halt.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One perspective the external agent still has to produce.
pub struct MissingPerspective {
    pub perspective_id: String,
    pub prompt_path: String,
    pub prompt_digest: String,
}

/// Writes `operator/halt/latest.json` plus the monotonic
/// `tick-%04d.json` sibling and returns the halt error the tick surfaces.
pub fn write_halt_files(
    run_root: &Path,
    tick_index: u64,
    stage: &str,
    missing: &[MissingPerspective],
) -> EngineResult<EngineError> {
    let halt_index = next_halt_index(run_root)?;
    let next_commands: Vec<String> = missing
        .iter()
        .map(|perspective| {
            format!(
                "sonar agent-result --run-root . --perspective {} --output-file <markdown>",
                perspective.perspective_id
            )
        })
        .collect();
    let document = json!({
        "schema_version": HALT_SCHEMA_VERSION,
        "tick_index": tick_index,
        "error": {
            "code": "RUN_AGENT_REQUIRED",
            "details": {
                "stage": stage,
                "missing_perspectives": missing,
            },
        },
        "next_commands": next_commands,
    });
    write_json_document(
        &resolve_inside_root(run_root, &format!("{HALT_DIR}/tick-{halt_index:04}.json"))?,
        &document,
    )?;
    write_json_document(&resolve_inside_root(run_root, HALT_LATEST_FILE)?, &document)?;

    Ok(EngineError::new(
        ErrorCode::RunAgentRequired,
        format!("{} perspectives await an external agent", missing.len()),
    )
    .with_details(json!({
        "stage": stage,
        "missing_perspectives": missing,
    })))
}

fn next_halt_index(run_root: &Path) -> EngineResult<u64> {
    let dir = resolve_inside_root(run_root, HALT_DIR)?;
    if !dir.is_dir() {
        return Ok(1);
    }
    let entries = std::fs::read_dir(&dir).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to list {HALT_DIR}: {error}"),
        )
    })?;
    let mut highest = 0;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(index) = name
            .strip_prefix("tick-")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        highest = highest.max(index);
    }
    Ok(highest + 1)
}
