use std::path::Path;

use serde::Serialize;
use serde_json::json;
use sonar_core::{elapsed_seconds, write_text_atomic, EngineError, EngineResult};

use crate::manifest::{load_manifest, mark_run_failed, FailureRecord, RunStatus};
use crate::stage::StageId;
use crate::telemetry::{append_telemetry_event, TelemetryEvent};

/// Checkpoint file written when a stage times out.
pub const TIMEOUT_CHECKPOINT_FILE: &str = "logs/timeout-checkpoint.md";

/// Inputs for one watchdog pass.
#[derive(Debug, Clone)]
pub struct WatchdogRequest<'a> {
    pub manifest_path: &'a Path,
    pub stage: Option<StageId>,
    pub now_iso: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Watchdog verdict for one pass.
pub struct WatchdogReport {
    pub timed_out: bool,
    pub paused: bool,
    pub stage: StageId,
    pub elapsed_s: i64,
    pub timeout_s: i64,
}

/// Checks the current stage against its timeout budget.
///
/// Paused runs are never mutated. A timed-out run gets a checkpoint
/// markdown, `status=failed`, and a non-retryable failure record.
pub fn watchdog_check(request: &WatchdogRequest<'_>) -> EngineResult<WatchdogReport> {
    let manifest = load_manifest(request.manifest_path)?;
    let stage = request.stage.unwrap_or(manifest.stage.current);
    let timeout_s = stage.timeout_seconds();

    if manifest.status == RunStatus::Paused {
        return Ok(WatchdogReport {
            timed_out: false,
            paused: true,
            stage,
            elapsed_s: 0,
            timeout_s,
        });
    }
    if manifest.status.is_terminal() {
        return Ok(WatchdogReport {
            timed_out: false,
            paused: false,
            stage,
            elapsed_s: 0,
            timeout_s,
        });
    }

    let elapsed_s = elapsed_seconds(&manifest.stage.last_progress_at, request.now_iso)
        .map_err(EngineError::from)?;
    if elapsed_s <= timeout_s {
        return Ok(WatchdogReport {
            timed_out: false,
            paused: false,
            stage,
            elapsed_s,
            timeout_s,
        });
    }

    let root = manifest.artifacts_root();
    let checkpoint = format!(
        "# Timeout checkpoint\n\n\
         - stage: {stage}\n\
         - elapsed_seconds: {elapsed_s}\n\
         - timeout_seconds: {timeout_s}\n\
         - last_known_subtask: {subtask}\n\
         - next_steps: inspect logs/audit.jsonl and logs/ticks.jsonl, clear the fault, then resume with a fresh tick\n",
        subtask = stage_subtask_label(stage),
    );
    write_text_atomic(&root.join(TIMEOUT_CHECKPOINT_FILE), &checkpoint)
        .map_err(EngineError::from)?;

    mark_run_failed(
        request.manifest_path,
        FailureRecord {
            kind: "timeout".to_string(),
            stage: Some(stage.as_str().to_string()),
            message: format!("timeout after {elapsed_s}s"),
            retryable: false,
            ts: request.now_iso.to_string(),
        },
        request.reason,
    )?;
    append_telemetry_event(
        &root,
        &TelemetryEvent {
            ts: request.now_iso.to_string(),
            event: "watchdog_timeout".to_string(),
            stage: Some(stage.as_str().to_string()),
            details: json!({ "elapsed_s": elapsed_s, "timeout_s": timeout_s }),
        },
    )?;
    tracing::warn!(
        run_id = %manifest.run_id,
        stage = %stage,
        elapsed_s,
        timeout_s,
        "watchdog timed the run out"
    );

    Ok(WatchdogReport {
        timed_out: true,
        paused: false,
        stage,
        elapsed_s,
        timeout_s,
    })
}

fn stage_subtask_label(stage: StageId) -> &'static str {
    match stage {
        StageId::Init => "run bootstrap",
        StageId::Perspectives => "perspective planning",
        StageId::Wave1 => "wave-1 agent outputs",
        StageId::Pivot => "pivot decision",
        StageId::Wave2 => "wave-2 agent outputs",
        StageId::Citations => "citation validation",
        StageId::Summaries => "summary pack build",
        StageId::Synthesis => "synthesis draft",
        StageId::Review => "review bundle",
        StageId::Finalize => "finalize bookkeeping",
        StageId::Complete => "completed run",
    }
}
