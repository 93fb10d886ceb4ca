use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sonar_core::{
    digest_of_value, ensure_wave_dir, resolve_inside_root, sha256_hex, EngineError, EngineResult,
    ErrorCode,
};

use crate::gates::{load_gates, GateId, GateStatus, GatesDocument};
use crate::manifest::{commit_manifest, load_manifest, RunManifest, RunStatus, StageHistoryEntry};
use crate::stage::StageId;

/// Caller inputs for one transition attempt.
#[derive(Debug, Clone)]
pub struct StageAdvanceRequest<'a> {
    pub manifest_path: &'a Path,
    pub gates_path: &'a Path,
    pub requested_next: Option<StageId>,
    pub expected_manifest_revision: Option<u64>,
    pub reason: &'a str,
    pub now_iso: &'a str,
}

/// Result of a successful transition.
#[derive(Debug, Clone)]
pub struct StageAdvanceOutcome {
    pub from: StageId,
    pub to: StageId,
    pub inputs_digest: String,
    pub manifest: RunManifest,
}

/// Evaluation context accumulated while probing preconditions.
///
/// Every consulted file lands in `probes` so the decision digest is a
/// deterministic function of (from, to, relevant contents, gates
/// revision). Identical filesystem state yields a byte-identical digest
/// on every call, including blocked ones.
struct DecisionProbe {
    from: StageId,
    to: StageId,
    gates_revision: u64,
    probes: BTreeMap<String, String>,
}

impl DecisionProbe {
    fn new(from: StageId, to: StageId, gates_revision: u64) -> Self {
        Self {
            from,
            to,
            gates_revision,
            probes: BTreeMap::new(),
        }
    }

    fn record_file(&mut self, rel: &str, resolved: &Path) {
        let observation = match std::fs::read(resolved) {
            Ok(bytes) => format!("sha256:{}", sha256_hex(&bytes)),
            Err(_) => "absent".to_string(),
        };
        self.probes.insert(rel.to_string(), observation);
    }

    fn record_listing(&mut self, rel: &str, names: &[String]) {
        self.probes
            .insert(format!("{rel}/"), names.join(","));
    }

    fn digest(&self) -> EngineResult<String> {
        digest_of_value(&json!({
            "from": self.from.as_str(),
            "to": self.to.as_str(),
            "probes": self.probes,
            "gates_revision": self.gates_revision,
        }))
    }

    fn block(
        &self,
        code: ErrorCode,
        message: String,
        mut details: Value,
    ) -> EngineResult<EngineError> {
        let digest = self.digest()?;
        if let Some(fields) = details.as_object_mut() {
            fields.insert("decision".to_string(), json!({ "inputs_digest": digest }));
        }
        Ok(EngineError::new(code, message).with_details(details))
    }
}

/// The deterministic transition authority over the stage graph.
///
/// Reads the manifest and gates, validates the requested or default
/// transition against its preconditions, and either commits a new
/// manifest revision with a history entry or returns a typed block.
pub fn stage_advance(request: &StageAdvanceRequest<'_>) -> EngineResult<StageAdvanceOutcome> {
    let manifest_path = canonical_pointer(request.manifest_path)?;
    let gates_path = canonical_pointer(request.gates_path)?;

    let manifest = load_manifest(&manifest_path)?;
    let gates = load_gates(&gates_path)?;

    if let Some(expected) = request.expected_manifest_revision {
        if expected != manifest.revision {
            return Err(EngineError::new(
                ErrorCode::RevisionMismatch,
                format!(
                    "expected manifest revision {expected}, found {}",
                    manifest.revision
                ),
            )
            .with_details(json!({ "expected": expected, "actual": manifest.revision })));
        }
    }
    if manifest.status.is_terminal() {
        return Err(EngineError::new(
            ErrorCode::AlreadyTerminated,
            format!("run is {}", manifest.status.as_str()),
        ));
    }
    if manifest.orchestration_disabled() {
        return Err(EngineError::new(
            ErrorCode::Disabled,
            "run orchestration is disabled by query.constraints.option_c",
        ));
    }

    let from = manifest.stage.current;
    if from.is_terminal() {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            format!("stage {from} has no outgoing transitions"),
        ));
    }

    let run_root = manifest.artifacts_root();
    let to = choose_target(&manifest, &run_root, request.requested_next)?;
    let mut probe = DecisionProbe::new(from, to, gates.revision);
    evaluate_preconditions(&manifest, &gates, &run_root, &mut probe)?;

    let inputs_digest = probe.digest()?;
    let mut next = manifest.clone();
    next.stage.history.push(StageHistoryEntry {
        from,
        to,
        ts: request.now_iso.to_string(),
        reason: request.reason.to_string(),
        inputs_digest: inputs_digest.clone(),
        gates_revision: gates.revision,
    });
    next.stage.current = to;
    next.stage.started_at = request.now_iso.to_string();
    next.stage.last_progress_at = request.now_iso.to_string();
    if to == StageId::Complete {
        next.status = RunStatus::Completed;
    }
    next.revision += 1;
    commit_manifest(&manifest_path, &manifest, &next, request.reason, request.now_iso)?;

    tracing::info!(
        run_id = %next.run_id,
        from = %from,
        to = %to,
        revision = next.revision,
        "stage advanced"
    );
    Ok(StageAdvanceOutcome {
        from,
        to,
        inputs_digest,
        manifest: next,
    })
}

fn canonical_pointer(path: &Path) -> EngineResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|error| {
        EngineError::new(
            ErrorCode::PathTraversal,
            format!("failed to canonicalize {}: {error}", path.display()),
        )
        .with_details(json!({ "path": path.display().to_string() }))
    })
}

/// Picks the transition target: the caller's legal request, else the
/// stage's default (data-driven for `pivot` and `review`).
fn choose_target(
    manifest: &RunManifest,
    run_root: &Path,
    requested: Option<StageId>,
) -> EngineResult<StageId> {
    let from = manifest.stage.current;
    let candidates = from.candidates();
    if let Some(next) = requested {
        if !candidates.contains(&next) {
            return Err(EngineError::new(
                ErrorCode::InvalidArgs,
                format!("transition {from} -> {next} is not in the stage graph"),
            )
            .with_details(json!({ "from": from.as_str(), "requested": next.as_str() })));
        }
        // Data-driven stages only accept a request that matches the
        // recorded decision.
        if from == StageId::Pivot {
            let decided = pivot_target(manifest, run_root)?;
            if next != decided {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgs,
                    format!("pivot decision requires {decided}, not {next}"),
                )
                .with_details(json!({ "decided": decided.as_str(), "requested": next.as_str() })));
            }
        }
        if from == StageId::Review {
            let decided = review_target(manifest, run_root)?;
            if next != decided {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgs,
                    format!("review decision requires {decided}, not {next}"),
                )
                .with_details(json!({ "decided": decided.as_str(), "requested": next.as_str() })));
            }
        }
        return Ok(next);
    }
    match from {
        StageId::Pivot => pivot_target(manifest, run_root),
        StageId::Review => review_target(manifest, run_root),
        other => Ok(other.candidates()[0]),
    }
}

fn pivot_target(manifest: &RunManifest, run_root: &Path) -> EngineResult<StageId> {
    let rel = manifest.artifact_rel("pivot_file", "pivot.json");
    let resolved = resolve_inside_root(run_root, &rel)?;
    if !resolved.exists() {
        // The precondition pass re-reports this with the decision digest.
        return Ok(StageId::Citations);
    }
    let value: Value = sonar_core::read_json_value(&resolved)?;
    let required = value
        .pointer("/decision/wave2_required")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(if required {
        StageId::Wave2
    } else {
        StageId::Citations
    })
}

fn review_target(manifest: &RunManifest, run_root: &Path) -> EngineResult<StageId> {
    let rel = manifest.artifact_rel("review_bundle_file", "review/review-bundle.json");
    let resolved = resolve_inside_root(run_root, &rel)?;
    if !resolved.exists() {
        return Ok(StageId::Finalize);
    }
    let value: Value = sonar_core::read_json_value(&resolved)?;
    match value.get("decision").and_then(Value::as_str) {
        Some("PASS") => Ok(StageId::Finalize),
        Some("CHANGES_REQUIRED") => Ok(StageId::Synthesis),
        other => Err(EngineError::new(
            ErrorCode::InvalidReviewBundle,
            format!("review bundle decision {other:?} is not PASS or CHANGES_REQUIRED"),
        )
        .with_details(json!({ "file": rel }))),
    }
}

fn evaluate_preconditions(
    manifest: &RunManifest,
    gates: &GatesDocument,
    run_root: &Path,
    probe: &mut DecisionProbe,
) -> EngineResult<()> {
    match (probe.from, probe.to) {
        (StageId::Init, StageId::Wave1) | (StageId::Perspectives, StageId::Wave1) => {
            let rel = manifest.artifact_rel("perspectives_file", "perspectives.json");
            require_file(manifest, run_root, probe, &rel)?;
            let resolved = resolve_inside_root(run_root, &rel)?;
            let value: Value = sonar_core::read_json_value(&resolved)?;
            let count = value
                .get("perspectives")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            if count == 0 {
                return Err(EngineError::new(
                    ErrorCode::SchemaValidationFailed,
                    "perspectives.json lists no perspectives",
                )
                .with_details(json!({ "json_path": "$.perspectives" })));
            }
        }
        (StageId::Init, StageId::Perspectives) => {}
        (StageId::Wave1, StageId::Pivot) => {
            let retry_rel = manifest.artifact_rel("retry_directives_file", "retry/retry-directives.json");
            if let Some(resolved) = optional_file(manifest, run_root, probe, &retry_rel)? {
                let value: Value = sonar_core::read_json_value(&resolved)?;
                if value.get("consumed_at").map(Value::is_null).unwrap_or(false) {
                    return Err(probe.block(
                        ErrorCode::RetryRequired,
                        "unconsumed wave retry directives are pending".to_string(),
                        json!({ "file": retry_rel }),
                    )?);
                }
            }
            let review_rel =
                manifest.artifact_rel("wave_review_report_file", "wave-1/wave-review.json");
            require_file(manifest, run_root, probe, &review_rel)?;
            require_gate(gates, probe, GateId::B)?;
            check_wave_cap(
                manifest,
                run_root,
                probe,
                &manifest.artifact_rel("wave1_dir", "wave-1"),
                manifest.limits.max_wave1_agents,
                StageId::Wave1,
            )?;
        }
        (StageId::Pivot, StageId::Wave2) | (StageId::Pivot, StageId::Citations) => {
            let rel = manifest.artifact_rel("pivot_file", "pivot.json");
            require_file(manifest, run_root, probe, &rel)?;
        }
        (StageId::Wave2, StageId::Citations) => {
            let dir_rel = manifest.artifact_rel("wave2_dir", "wave-2");
            let outputs = check_wave_cap(
                manifest,
                run_root,
                probe,
                &dir_rel,
                manifest.limits.max_wave2_agents,
                StageId::Wave2,
            )?;
            if outputs.is_empty() {
                return Err(probe.block(
                    ErrorCode::MissingArtifact,
                    "wave-2 produced no outputs".to_string(),
                    json!({
                        "from": probe.from.as_str(),
                        "to": probe.to.as_str(),
                        "file": format!("{dir_rel}/*.md"),
                    }),
                )?);
            }
            let plan_rel = format!("{dir_rel}/wave2-plan.json");
            require_file(manifest, run_root, probe, &plan_rel)?;
            let plan_path = resolve_inside_root(run_root, &plan_rel)?;
            let plan: Value = sonar_core::read_json_value(&plan_path)?;
            for entry in plan
                .get("entries")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(output_rel) = entry.get("output_md").and_then(Value::as_str) {
                    require_file(manifest, run_root, probe, output_rel)?;
                }
            }
        }
        (StageId::Citations, StageId::Summaries) => {
            let rel = manifest.artifact_rel("citations_file", "citations/citations.jsonl");
            require_file(manifest, run_root, probe, &rel)?;
            require_gate(gates, probe, GateId::C)?;
        }
        (StageId::Summaries, StageId::Synthesis) => {
            let rel = manifest.artifact_rel("summary_pack_file", "summaries/summary-pack.json");
            require_file(manifest, run_root, probe, &rel)?;
            require_gate(gates, probe, GateId::D)?;
        }
        (StageId::Synthesis, StageId::Review) => {
            let rel = manifest.artifact_rel("synthesis_file", "synthesis/final-synthesis.md");
            require_file(manifest, run_root, probe, &rel)?;
        }
        (StageId::Review, StageId::Finalize) => {
            let rel = manifest.artifact_rel("review_bundle_file", "review/review-bundle.json");
            require_file(manifest, run_root, probe, &rel)?;
            require_gate(gates, probe, GateId::E)?;
        }
        (StageId::Review, StageId::Synthesis) => {
            let rel = manifest.artifact_rel("review_bundle_file", "review/review-bundle.json");
            require_file(manifest, run_root, probe, &rel)?;
            let cap = manifest.limits.max_review_iterations;
            let count = manifest.review_iterations();
            if count >= cap {
                return Err(probe.block(
                    ErrorCode::ReviewCapExceeded,
                    format!("review loop cap {cap} reached"),
                    json!({ "cap": cap, "count": count }),
                )?);
            }
        }
        (StageId::Finalize, StageId::Complete) => {}
        (from, to) => {
            return Err(EngineError::new(
                ErrorCode::InvalidArgs,
                format!("transition {from} -> {to} is not in the stage graph"),
            ));
        }
    }
    Ok(())
}

fn require_file(
    manifest: &RunManifest,
    run_root: &Path,
    probe: &mut DecisionProbe,
    rel: &str,
) -> EngineResult<PathBuf> {
    match optional_file(manifest, run_root, probe, rel)? {
        Some(resolved) => Ok(resolved),
        None => Err(probe.block(
            ErrorCode::MissingArtifact,
            format!("required artifact {rel} is missing"),
            json!({
                "from": probe.from.as_str(),
                "to": probe.to.as_str(),
                "file": rel,
            }),
        )?),
    }
}

fn optional_file(
    _manifest: &RunManifest,
    run_root: &Path,
    probe: &mut DecisionProbe,
    rel: &str,
) -> EngineResult<Option<PathBuf>> {
    let resolved = resolve_inside_root(run_root, rel)?;
    probe.record_file(rel, &resolved);
    if resolved.is_file() {
        Ok(Some(resolved))
    } else {
        Ok(None)
    }
}

fn require_gate(
    gates: &GatesDocument,
    probe: &mut DecisionProbe,
    gate: GateId,
) -> EngineResult<()> {
    let status = gates.status_of(gate);
    probe
        .probes
        .insert(format!("gate:{gate}"), status.as_str().to_string());
    if status != GateStatus::Pass {
        return Err(probe.block(
            ErrorCode::GateBlocked,
            format!("gate {gate} is {} (pass required)", status.as_str()),
            json!({
                "from": probe.from.as_str(),
                "to": probe.to.as_str(),
                "gate": gate.as_str(),
            }),
        )?);
    }
    Ok(())
}

/// Lists wave outputs (deterministically sorted) and enforces the wave's
/// fan-out cap.
fn check_wave_cap(
    _manifest: &RunManifest,
    run_root: &Path,
    probe: &mut DecisionProbe,
    dir_rel: &str,
    cap: u32,
    stage: StageId,
) -> EngineResult<Vec<String>> {
    let dir = ensure_wave_dir(run_root, dir_rel)?;
    let mut outputs: Vec<String> = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to list {}: {error}", dir.display()),
        )
    })?;
    for entry in entries {
        let entry = entry.map_err(|error| {
            EngineError::new(
                ErrorCode::Internal,
                format!("failed to list {}: {error}", dir.display()),
            )
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".md") && !name.ends_with(".prompt.md") {
            outputs.push(name);
        }
    }
    outputs.sort();
    probe.record_listing(dir_rel, &outputs);

    let count = outputs.len();
    if count > cap as usize {
        return Err(probe.block(
            ErrorCode::WaveCapExceeded,
            format!("{stage} fan-out {count} exceeds cap {cap}"),
            json!({ "cap": cap, "count": count, "stage": stage.as_str() }),
        )?);
    }
    Ok(outputs)
}
