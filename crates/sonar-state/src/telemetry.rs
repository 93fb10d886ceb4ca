use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sonar_core::{append_jsonl_line, elapsed_seconds, write_json_document, EngineError, EngineResult};

use crate::manifest::RunManifest;

/// Tick ledger location inside a run root.
pub const TICKS_LEDGER_FILE: &str = "logs/ticks.jsonl";
/// Telemetry ledger location inside a run root.
pub const TELEMETRY_LEDGER_FILE: &str = "logs/telemetry.jsonl";
/// Derived metrics document location inside a run root.
pub const RUN_METRICS_FILE: &str = "metrics/run-metrics.json";
/// Schema tag carried by the derived metrics document.
pub const RUN_METRICS_SCHEMA_VERSION: &str = "run_metrics.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One row of the append-only tick ledger.
pub struct TickLedgerEntry {
    pub ts: String,
    pub tick_index: u64,
    pub stage: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One telemetry event row.
pub struct TelemetryEvent {
    pub ts: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub details: Value,
}

/// Appends one row to `logs/ticks.jsonl`.
pub fn append_tick_entry(run_root: &Path, entry: &TickLedgerEntry) -> EngineResult<()> {
    let line = serde_json::to_string(entry)
        .map_err(|error| EngineError::from(anyhow::anyhow!("failed to encode tick entry: {error}")))?;
    append_jsonl_line(&run_root.join(TICKS_LEDGER_FILE), &line).map_err(EngineError::from)
}

/// Appends one row to `logs/telemetry.jsonl`.
pub fn append_telemetry_event(run_root: &Path, event: &TelemetryEvent) -> EngineResult<()> {
    let line = serde_json::to_string(event).map_err(|error| {
        EngineError::from(anyhow::anyhow!("failed to encode telemetry event: {error}"))
    })?;
    append_jsonl_line(&run_root.join(TELEMETRY_LEDGER_FILE), &line).map_err(EngineError::from)
}

/// Returns the next tick index by scanning the ledger; numbering is
/// monotonic across restarts.
pub fn next_tick_index(run_root: &Path) -> EngineResult<u64> {
    let path = run_root.join(TICKS_LEDGER_FILE);
    if !path.exists() {
        return Ok(1);
    }
    let raw = std::fs::read_to_string(&path).map_err(|error| {
        EngineError::from(anyhow::anyhow!("failed to read {}: {error}", path.display()))
    })?;
    let mut highest = 0;
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        if let Ok(entry) = serde_json::from_str::<TickLedgerEntry>(line) {
            highest = highest.max(entry.tick_index);
        }
    }
    Ok(highest + 1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Duration of one completed stage visit.
pub struct StageDuration {
    pub from: String,
    pub to: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Derived, read-only roll-up of one run's ledgers and manifest.
pub struct RunMetricsDocument {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub status: String,
    pub stage: String,
    pub tick_count: u64,
    pub ticks_by_stage: BTreeMap<String, u64>,
    pub retry_totals: BTreeMap<String, u32>,
    pub failure_count: usize,
    pub transition_count: usize,
    pub stage_durations: Vec<StageDuration>,
}

/// Builds the derived metrics document from the manifest and the tick
/// ledger. Derivation is read-only and lock-free.
pub fn run_metrics_build(
    run_root: &Path,
    manifest: &RunManifest,
    now_iso: &str,
) -> EngineResult<RunMetricsDocument> {
    let mut tick_count = 0;
    let mut ticks_by_stage: BTreeMap<String, u64> = BTreeMap::new();
    let ledger_path = run_root.join(TICKS_LEDGER_FILE);
    if ledger_path.exists() {
        let raw = std::fs::read_to_string(&ledger_path).map_err(|error| {
            EngineError::from(anyhow::anyhow!(
                "failed to read {}: {error}",
                ledger_path.display()
            ))
        })?;
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let Ok(entry) = serde_json::from_str::<TickLedgerEntry>(line) else {
                continue;
            };
            if entry.phase == "start" {
                tick_count += 1;
                *ticks_by_stage.entry(entry.stage).or_insert(0) += 1;
            }
        }
    }

    let mut stage_durations = Vec::new();
    let mut previous_ts = manifest.created_at.as_str();
    for entry in &manifest.stage.history {
        if let Ok(seconds) = elapsed_seconds(previous_ts, &entry.ts) {
            stage_durations.push(StageDuration {
                from: entry.from.as_str().to_string(),
                to: entry.to.as_str().to_string(),
                seconds,
            });
        }
        previous_ts = entry.ts.as_str();
    }

    Ok(RunMetricsDocument {
        schema_version: RUN_METRICS_SCHEMA_VERSION.to_string(),
        run_id: manifest.run_id.clone(),
        generated_at: now_iso.to_string(),
        status: manifest.status.as_str().to_string(),
        stage: manifest.stage.current.as_str().to_string(),
        tick_count,
        ticks_by_stage,
        retry_totals: manifest.metrics.retry_counts.clone(),
        failure_count: manifest.failures.len(),
        transition_count: manifest.stage.history.len(),
        stage_durations,
    })
}

/// Builds and persists `metrics/run-metrics.json`.
pub fn run_metrics_write(
    run_root: &Path,
    manifest: &RunManifest,
    now_iso: &str,
) -> EngineResult<RunMetricsDocument> {
    let document = run_metrics_build(run_root, manifest, now_iso)?;
    write_json_document(&run_root.join(RUN_METRICS_FILE), &document)?;
    Ok(document)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        append_tick_entry, next_tick_index, run_metrics_build, TickLedgerEntry,
    };
    use crate::manifest::{QueryMode, QuerySpec, RunLimits, RunManifest, Sensitivity};

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn manifest(root: &std::path::Path) -> RunManifest {
        RunManifest::initial(
            "run-001",
            root,
            QuerySpec {
                mode: QueryMode::Quick,
                sensitivity: Sensitivity::Normal,
                constraints: json!({}),
            },
            RunLimits::default(),
            NOW,
        )
    }

    fn entry(tick_index: u64, stage: &str, phase: &str) -> TickLedgerEntry {
        TickLedgerEntry {
            ts: NOW.to_string(),
            tick_index,
            stage: stage.to_string(),
            phase: phase.to_string(),
            outcome: None,
            error_code: None,
        }
    }

    #[test]
    fn functional_tick_indices_stay_monotonic_across_scans() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        assert_eq!(next_tick_index(tempdir.path()).expect("empty ledger"), 1);
        append_tick_entry(tempdir.path(), &entry(1, "init", "start")).expect("append");
        append_tick_entry(tempdir.path(), &entry(1, "init", "finish")).expect("append");
        append_tick_entry(tempdir.path(), &entry(2, "wave1", "start")).expect("append");
        assert_eq!(next_tick_index(tempdir.path()).expect("scan"), 3);
    }

    #[test]
    fn functional_run_metrics_counts_started_ticks_per_stage() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        append_tick_entry(tempdir.path(), &entry(1, "init", "start")).expect("append");
        append_tick_entry(tempdir.path(), &entry(1, "init", "finish")).expect("append");
        append_tick_entry(tempdir.path(), &entry(2, "wave1", "start")).expect("append");

        let metrics = run_metrics_build(tempdir.path(), &manifest(tempdir.path()), NOW)
            .expect("metrics should build");
        assert_eq!(metrics.tick_count, 2);
        assert_eq!(metrics.ticks_by_stage.get("init"), Some(&1));
        assert_eq!(metrics.ticks_by_stage.get("wave1"), Some(&1));
        assert_eq!(metrics.transition_count, 0);
    }
}
