use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sonar_citations::{
    citations_extract, citations_normalize, citations_render, citations_validate,
    gate_c_evaluate, load_citations, load_url_map, resolve_citation_mode,
    CitationValidateRequest, CITATIONS_FILE,
};
use sonar_core::{
    digest_of_value, resolve_inside_root, write_text_atomic, EngineError, EngineResult, ErrorCode,
};
use sonar_report::{
    gate_e_evaluate, gate_e_reports, load_review_bundle, load_summary_pack, load_synthesis,
    review_bundle_ingest, review_factory_auto, revision_control, summary_pack_build,
    synthesis_build_from_pack, synthesis_write, write_revision_directives, RevisionAction,
    FINAL_SYNTHESIS_FILE, SUMMARY_PACK_FILE,
};
use sonar_state::{
    acquire_run_lock, append_telemetry_event, append_tick_entry, gates_write, load_gates,
    load_manifest, next_tick_index, retry_record, run_metrics_write, GateId, GateStatus,
    GateUpdate, RunLockRequest, RunManifest, RunStatus, StageAdvanceRequest, StageId,
    TelemetryEvent, TickLedgerEntry, GATES_FILE, MANIFEST_FILE,
};
use sonar_wave::{
    consume_retry_directives, load_perspectives, load_pivot, load_wave_plan, load_wave_review,
    pending_retry_directives, pivot_build, plan_entry_prompt_digest, wave1_plan_build,
    wave2_plan_build, wave_output_ingest, wave_review_run, write_retry_directives, AgentResult,
    PerspectivesDocument, WaveIngestRequest, WavePlanDocument, PERSPECTIVES_FILE,
};

use crate::bootstrap::load_scope;
use crate::driver::{AgentRequest, DriverConfig, FixtureDriver};
use crate::halt::{write_halt_files, MissingPerspective};

/// Fallback summary location inside a run root.
pub const FALLBACK_SUMMARY_FILE: &str = "logs/fallback-summary.md";
/// Optional operator-supplied review bundle consumed by the review stage.
pub const OPERATOR_REVIEW_BUNDLE_FILE: &str = "operator/outputs/review-bundle.json";
/// Optional effective run configuration consumed by the citations stage.
pub const RUN_CONFIG_FILE: &str = "operator/run-config.json";
/// Default offline citation fixtures location.
pub const CITATION_FIXTURES_FILE: &str = "operator/citation-fixtures.json";
/// Wave review retry budget (gate B).
pub const DEFAULT_WAVE_RETRIES: u32 = 2;

/// Inputs for one orchestrator tick.
#[derive(Debug, Clone)]
pub struct TickRequest<'a> {
    pub run_root: &'a Path,
    pub driver: &'a DriverConfig,
    pub holder_id: &'a str,
    pub lease_seconds: u64,
    pub citation_fixtures: Option<&'a Path>,
    pub now_iso: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What one tick did.
pub struct TickOutcome {
    pub tick_index: u64,
    pub stage_before: StageId,
    pub stage_after: StageId,
    pub advanced: bool,
}

/// Runs exactly one idempotent orchestrator step: acquire the lock,
/// check run status, produce the current stage's artifacts, compute its
/// gates, and delegate the transition to `stage_advance`. Typed blocks
/// surface unchanged.
pub async fn orchestrator_tick(request: &TickRequest<'_>) -> EngineResult<TickOutcome> {
    let manifest_path = request.run_root.join(MANIFEST_FILE);
    let peek = load_manifest(&manifest_path)?;
    let lock = acquire_run_lock(&RunLockRequest {
        run_root: request.run_root,
        run_id: &peek.run_id,
        lease_seconds: request.lease_seconds,
        reason: "orchestrator tick",
        holder_id: request.holder_id,
        now_iso: request.now_iso,
    })?;
    let result = tick_under_lock(request, &manifest_path).await;
    let _ = lock.release();
    result
}

async fn tick_under_lock(
    request: &TickRequest<'_>,
    manifest_path: &Path,
) -> EngineResult<TickOutcome> {
    let gates_path = request.run_root.join(GATES_FILE);
    let manifest = load_manifest(manifest_path)?;
    check_run_status(&manifest)?;
    if manifest.orchestration_disabled() {
        return Err(EngineError::new(
            ErrorCode::Disabled,
            "run orchestration is disabled by query.constraints.option_c",
        ));
    }

    let tick_index = next_tick_index(request.run_root)?;
    let stage_before = manifest.stage.current;
    append_telemetry_event(
        request.run_root,
        &TelemetryEvent {
            ts: request.now_iso.to_string(),
            event: "stage_started".to_string(),
            stage: Some(stage_before.as_str().to_string()),
            details: json!({ "tick_index": tick_index }),
        },
    )?;
    append_tick_entry(
        request.run_root,
        &TickLedgerEntry {
            ts: request.now_iso.to_string(),
            tick_index,
            stage: stage_before.as_str().to_string(),
            phase: "start".to_string(),
            outcome: None,
            error_code: None,
        },
    )?;

    let ctx = TickCtx {
        run_root: request.run_root,
        manifest_path: manifest_path.to_path_buf(),
        gates_path,
        manifest: &manifest,
        driver: request.driver,
        citation_fixtures: request.citation_fixtures,
        now_iso: request.now_iso,
        tick_index,
    };
    let worked = stage_work(&ctx).await;
    let advanced = match worked {
        Ok(()) => stage_advance_step(&ctx),
        Err(error) => Err(error),
    };

    match advanced {
        Ok(stage_after) => {
            finish_tick(request, tick_index, stage_before, "advanced", None)?;
            Ok(TickOutcome {
                tick_index,
                stage_before,
                stage_after,
                advanced: true,
            })
        }
        Err(error) => {
            finish_tick(
                request,
                tick_index,
                stage_before,
                "blocked",
                Some(error.code.as_str()),
            )?;
            Err(error)
        }
    }
}

fn check_run_status(manifest: &RunManifest) -> EngineResult<()> {
    match manifest.status {
        RunStatus::Paused => Err(EngineError::new(ErrorCode::Paused, "run is paused")),
        RunStatus::Cancelled => Err(EngineError::new(ErrorCode::Cancelled, "run is cancelled")),
        RunStatus::Completed | RunStatus::Failed => Err(EngineError::new(
            ErrorCode::AlreadyTerminated,
            format!("run is {}", manifest.status.as_str()),
        )),
        RunStatus::Pending | RunStatus::Running => Ok(()),
    }
}

fn finish_tick(
    request: &TickRequest<'_>,
    tick_index: u64,
    stage: StageId,
    outcome: &str,
    error_code: Option<&str>,
) -> EngineResult<()> {
    append_tick_entry(
        request.run_root,
        &TickLedgerEntry {
            ts: request.now_iso.to_string(),
            tick_index,
            stage: stage.as_str().to_string(),
            phase: "finish".to_string(),
            outcome: Some(outcome.to_string()),
            error_code: error_code.map(str::to_string),
        },
    )?;
    append_telemetry_event(
        request.run_root,
        &TelemetryEvent {
            ts: request.now_iso.to_string(),
            event: "stage_finished".to_string(),
            stage: Some(stage.as_str().to_string()),
            details: json!({ "tick_index": tick_index, "outcome": outcome }),
        },
    )
}

struct TickCtx<'a> {
    run_root: &'a Path,
    manifest_path: PathBuf,
    gates_path: PathBuf,
    manifest: &'a RunManifest,
    driver: &'a DriverConfig,
    citation_fixtures: Option<&'a Path>,
    now_iso: &'a str,
    tick_index: u64,
}

impl TickCtx<'_> {
    fn scope_label(&self) -> String {
        load_scope(self.run_root)
            .ok()
            .flatten()
            .map(|scope| scope.scope_label)
            .unwrap_or_else(|| self.manifest.run_id.clone())
    }

    fn gate_update(&self, status: GateStatus, metrics: Value) -> GateUpdate {
        GateUpdate {
            status,
            checked_at: Some(self.now_iso.to_string()),
            metrics: Some(metrics),
            artifacts: None,
            warnings: None,
            notes: None,
        }
    }

    fn write_gate(
        &self,
        gate: GateId,
        update: GateUpdate,
        inputs_digest: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let gates = load_gates(&self.gates_path)?;
        let mut updates = BTreeMap::new();
        updates.insert(gate, update);
        gates_write(
            &self.gates_path,
            &updates,
            Some(gates.revision),
            inputs_digest,
            reason,
            self.now_iso,
        )?;
        Ok(())
    }
}

async fn stage_work(ctx: &TickCtx<'_>) -> EngineResult<()> {
    match ctx.manifest.stage.current {
        StageId::Init => Ok(()),
        StageId::Perspectives => run_perspectives_stage(ctx),
        StageId::Wave1 => run_wave_stage(ctx, 1).await,
        StageId::Pivot => run_pivot_stage(ctx),
        StageId::Wave2 => run_wave_stage(ctx, 2).await,
        StageId::Citations => run_citations_stage(ctx),
        StageId::Summaries => run_summaries_stage(ctx),
        StageId::Synthesis => run_synthesis_stage(ctx),
        StageId::Review => run_review_stage(ctx),
        StageId::Finalize => run_finalize_stage(ctx),
        StageId::Complete => Err(EngineError::new(
            ErrorCode::AlreadyTerminated,
            "run is complete",
        )),
    }
}

fn stage_advance_step(ctx: &TickCtx<'_>) -> EngineResult<StageId> {
    let outcome = sonar_state::stage_advance(&StageAdvanceRequest {
        manifest_path: &ctx.manifest_path,
        gates_path: &ctx.gates_path,
        requested_next: None,
        expected_manifest_revision: Some(ctx.manifest.revision),
        reason: &format!("tick {:04}", ctx.tick_index),
        now_iso: ctx.now_iso,
    })?;
    Ok(outcome.to)
}

fn run_perspectives_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    let perspectives = load_perspectives(&ctx.run_root.join(PERSPECTIVES_FILE))?;
    let digest = digest_of_value(&perspectives)?;
    ctx.write_gate(
        GateId::A,
        ctx.gate_update(
            GateStatus::Pass,
            json!({ "perspectives": perspectives.perspectives.len() }),
        ),
        &digest,
        "perspectives validated",
    )
}

async fn run_wave_stage(ctx: &TickCtx<'_>, wave: u32) -> EngineResult<()> {
    let perspectives = load_perspectives(&ctx.run_root.join(PERSPECTIVES_FILE))?;
    let plan = ensure_wave_plan(ctx, wave, &perspectives)?;

    // Idempotence: a finished, passing wave skips the driver entirely.
    if let Ok(review) = load_wave_review(ctx.run_root, wave) {
        let gates = load_gates(&ctx.gates_path)?;
        if review.pass && gates.status_of(GateId::B) == GateStatus::Pass {
            return Ok(());
        }
    }

    let retry_count = ctx
        .manifest
        .metrics
        .retry_counts
        .get("B")
        .copied()
        .unwrap_or(0);
    if wave == 1 {
        if let Some(pending) = pending_retry_directives(ctx.run_root)? {
            let keys: BTreeSet<String> = pending
                .directives
                .iter()
                .map(|directive| directive.perspective_id.clone())
                .collect();
            drive_and_ingest(ctx, wave, &plan, &perspectives, Some(&keys), retry_count).await?;
            consume_retry_directives(ctx.run_root, ctx.now_iso)?;
        }
    }
    drive_and_ingest(ctx, wave, &plan, &perspectives, None, retry_count).await?;

    let review = wave_review_run(
        ctx.run_root,
        &ctx.manifest.run_id,
        wave,
        &plan,
        &perspectives,
        sonar_wave::DEFAULT_MAX_FAILURES,
        ctx.now_iso,
    )?;
    let status = if review.pass {
        GateStatus::Pass
    } else {
        GateStatus::Fail
    };
    ctx.write_gate(
        GateId::B,
        ctx.gate_update(
            status,
            json!({ "wave": wave, "validated": review.validated, "failed": review.failed }),
        ),
        &plan.inputs_digest,
        &format!("wave-{wave} review"),
    )?;

    if review.pass {
        return Ok(());
    }
    if wave == 1 {
        write_retry_directives(
            ctx.run_root,
            &ctx.manifest.run_id,
            review.retry_directives.clone(),
            ctx.now_iso,
        )?;
        match retry_record(
            &ctx.manifest_path,
            "B",
            "replay failed wave-1 perspectives",
            &format!("wave-1 review failed ({} outputs)", review.failed),
            DEFAULT_WAVE_RETRIES,
            ctx.now_iso,
        ) {
            Ok(outcome) => Err(EngineError::new(
                ErrorCode::RetryRequired,
                "wave-1 review failed; retry directives are pending",
            )
            .with_details(json!({
                "file": sonar_wave::RETRY_DIRECTIVES_FILE,
                "retry_count": outcome.retry_count,
                "failed": review.failed,
            }))),
            Err(error) if error.code == ErrorCode::RetryExhausted => {
                write_fallback_summary(
                    ctx.run_root,
                    StageId::Wave1,
                    "RETRY_CAP_EXCEEDED",
                    "wave-1 review kept failing after every retry",
                    ctx.now_iso,
                )?;
                Err(EngineError::new(
                    ErrorCode::RetryCapExceeded,
                    "wave-1 retry budget is exhausted",
                )
                .with_details(error.details))
            }
            Err(error) => Err(error),
        }
    } else {
        Err(EngineError::new(
            ErrorCode::GateBlocked,
            "wave-2 review failed",
        )
        .with_details(json!({
            "from": "wave2",
            "to": "citations",
            "gate": "B",
        })))
    }
}

fn ensure_wave_plan(
    ctx: &TickCtx<'_>,
    wave: u32,
    perspectives: &PerspectivesDocument,
) -> EngineResult<WavePlanDocument> {
    if let Ok(plan) = load_wave_plan(ctx.run_root, wave) {
        return Ok(plan);
    }
    let scope_label = ctx.scope_label();
    if wave == 1 {
        wave1_plan_build(
            ctx.run_root,
            &ctx.manifest.run_id,
            perspectives,
            &ctx.manifest.limits,
            &scope_label,
            ctx.now_iso,
        )
    } else {
        let pivot = load_pivot(ctx.run_root)?;
        wave2_plan_build(
            ctx.run_root,
            &ctx.manifest.run_id,
            &pivot,
            perspectives,
            &ctx.manifest.limits,
            &scope_label,
            ctx.now_iso,
        )
    }
}

async fn drive_and_ingest(
    ctx: &TickCtx<'_>,
    wave: u32,
    plan: &WavePlanDocument,
    perspectives: &PerspectivesDocument,
    only_keys: Option<&BTreeSet<String>>,
    retry_count: u32,
) -> EngineResult<bool> {
    let mut targets = Vec::new();
    for entry in &plan.entries {
        let replay = only_keys
            .map(|keys| keys.contains(entry.key()))
            .unwrap_or(false);
        let missing = !resolve_inside_root(ctx.run_root, &entry.output_md)?.is_file();
        if replay || missing {
            targets.push(entry);
        }
    }
    if targets.is_empty() {
        return Ok(false);
    }

    let stage = ctx.manifest.stage.current;
    let driver: std::sync::Arc<dyn crate::driver::AgentDriver> = match ctx.driver {
        DriverConfig::Task => {
            let missing: Vec<MissingPerspective> = targets
                .iter()
                .map(|entry| {
                    Ok(MissingPerspective {
                        perspective_id: entry.key().to_string(),
                        prompt_path: entry.prompt_md.clone(),
                        prompt_digest: plan_entry_prompt_digest(ctx.run_root, entry)?,
                    })
                })
                .collect::<EngineResult<_>>()?;
            return Err(write_halt_files(
                ctx.run_root,
                ctx.tick_index,
                stage.as_str(),
                &missing,
            )?);
        }
        DriverConfig::Fixture(dir) => std::sync::Arc::new(FixtureDriver::new(dir.clone())),
        DriverConfig::Live(driver) => driver.clone(),
    };

    let mut results = Vec::with_capacity(targets.len());
    for entry in targets {
        let prompt_path = resolve_inside_root(ctx.run_root, &entry.prompt_md)?;
        let prompt_md = std::fs::read_to_string(&prompt_path).map_err(|error| {
            EngineError::new(
                ErrorCode::MissingArtifact,
                format!("prompt {} is unreadable: {error}", entry.prompt_md),
            )
            .with_details(json!({ "file": entry.prompt_md }))
        })?;
        let prompt_digest = plan_entry_prompt_digest(ctx.run_root, entry)?;
        let agent_request = AgentRequest {
            run_id: ctx.manifest.run_id.clone(),
            stage: stage.as_str().to_string(),
            perspective_id: entry.key().to_string(),
            agent_type: entry.agent_type.clone(),
            output_md: entry.output_md.clone(),
            prompt_md,
            prompt_digest: prompt_digest.clone(),
        };
        let reply = driver.run_agent(&agent_request).await.map_err(|error| {
            EngineError::new(
                ErrorCode::DriverError,
                format!("agent driver failed for '{}'", entry.key()),
            )
            .with_details(json!({
                "perspective_id": entry.key(),
                "message": error.to_string(),
                "cause": format!("{error:#}"),
            }))
        })?;
        results.push(AgentResult {
            perspective_id: entry.perspective_id.clone(),
            gap_id: entry.gap_id.clone(),
            markdown: reply.markdown,
            agent_run_id: format!(
                "{}-t{:04}-{}",
                ctx.manifest.run_id,
                ctx.tick_index,
                entry.key()
            ),
            prompt_digest: Some(prompt_digest),
            source_input_path: None,
        });
    }

    wave_output_ingest(&WaveIngestRequest {
        run_root: ctx.run_root,
        plan,
        perspectives,
        results: &results,
        retry_count,
        now_iso: ctx.now_iso,
    })?;
    tracing::info!(
        run_id = %ctx.manifest.run_id,
        wave,
        outputs = results.len(),
        "wave outputs ingested"
    );
    Ok(true)
}

fn run_pivot_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    if load_pivot(ctx.run_root).is_ok() {
        return Ok(());
    }
    let plan = load_wave_plan(ctx.run_root, 1)?;
    let review = load_wave_review(ctx.run_root, 1)?;
    pivot_build(
        ctx.run_root,
        &ctx.manifest.run_id,
        &plan,
        &review,
        &ctx.manifest.limits,
        ctx.now_iso,
    )?;
    Ok(())
}

fn run_citations_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    let include_wave2 = load_pivot(ctx.run_root)
        .map(|pivot| pivot.decision.wave2_required)
        .unwrap_or(false);

    let pool_exists = resolve_inside_root(ctx.run_root, CITATIONS_FILE)?.is_file();
    if pool_exists {
        let gates = load_gates(&ctx.gates_path)?;
        if gates.status_of(GateId::C) == GateStatus::Pass {
            return Ok(());
        }
    }

    let extract = citations_extract(ctx.run_root, include_wave2)?;
    let url_map = citations_normalize(ctx.run_root, &extract.urls)?;
    let run_config: Option<Value> = {
        let path = ctx.run_root.join(RUN_CONFIG_FILE);
        if path.is_file() {
            Some(sonar_core::read_json_value(&path)?)
        } else {
            None
        }
    };
    let mode = resolve_citation_mode(
        &ctx.manifest.query.constraints,
        run_config.as_ref(),
        ctx.manifest.query.sensitivity,
    );

    let default_fixtures = ctx.run_root.join(CITATION_FIXTURES_FILE);
    let fixtures_path = ctx
        .citation_fixtures
        .or_else(|| default_fixtures.is_file().then_some(default_fixtures.as_path()));
    let records = citations_validate(&CitationValidateRequest {
        run_root: ctx.run_root,
        mode,
        url_map: &url_map,
        fixtures_path,
        now_iso: ctx.now_iso,
    })?;
    citations_render(ctx.run_root, &records)?;

    let evaluation = gate_c_evaluate(&records, &url_map.cids());
    let digest = digest_of_value(&url_map)?;
    ctx.write_gate(
        GateId::C,
        ctx.gate_update(evaluation.status, evaluation.metrics),
        &digest,
        "citation validation",
    )
}

fn run_summaries_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    let pack_exists = resolve_inside_root(ctx.run_root, SUMMARY_PACK_FILE)?.is_file();
    if pack_exists {
        let gates = load_gates(&ctx.gates_path)?;
        if gates.status_of(GateId::D) == GateStatus::Pass {
            return Ok(());
        }
    }

    let include_wave2 = load_pivot(ctx.run_root)
        .map(|pivot| pivot.decision.wave2_required)
        .unwrap_or(false);
    let url_map = load_url_map(ctx.run_root)?;
    let pack = summary_pack_build(
        ctx.run_root,
        &ctx.manifest.run_id,
        ctx.manifest.query.mode.as_str(),
        &url_map,
        &ctx.manifest.limits,
        include_wave2,
        ctx.now_iso,
    )?;
    let digest = digest_of_value(&pack)?;
    ctx.write_gate(
        GateId::D,
        ctx.gate_update(
            GateStatus::Pass,
            json!({
                "summaries": pack.summaries.len(),
                "total_estimated_tokens": pack.total_estimated_tokens,
            }),
        ),
        &digest,
        "summary pack",
    )
}

fn run_synthesis_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    if resolve_inside_root(ctx.run_root, FINAL_SYNTHESIS_FILE)?.is_file() {
        return Ok(());
    }
    let pack = load_summary_pack(ctx.run_root)?;
    let citations = load_citations(ctx.run_root)?;
    let sections = synthesis_build_from_pack(&pack, &citations);
    synthesis_write(ctx.run_root, false, &sections, &citations)?;
    synthesis_write(ctx.run_root, true, &sections, &citations)?;
    Ok(())
}

fn run_review_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    let synthesis = load_synthesis(ctx.run_root, true)?;
    let citations = load_citations(ctx.run_root)?;
    let evaluation = gate_e_evaluate(&synthesis, &citations)?;
    gate_e_reports(ctx.run_root, &evaluation, ctx.now_iso)?;

    let gates = load_gates(&ctx.gates_path)?;
    let mut updates = BTreeMap::new();
    updates.insert(
        GateId::E,
        GateUpdate {
            status: evaluation.status,
            checked_at: Some(ctx.now_iso.to_string()),
            metrics: Some(serde_json::to_value(&evaluation.metrics).map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to encode gate E metrics: {error}"),
                )
            })?),
            artifacts: Some(vec![
                sonar_report::GATE_E_STATUS_FILE.to_string(),
                sonar_report::GATE_E_NUMERIC_CLAIMS_FILE.to_string(),
                sonar_report::GATE_E_SECTIONS_FILE.to_string(),
                sonar_report::GATE_E_UTILIZATION_FILE.to_string(),
            ]),
            warnings: None,
            notes: None,
        },
    );
    updates.insert(
        GateId::F,
        GateUpdate {
            status: if evaluation.warnings.is_empty() {
                GateStatus::Pass
            } else {
                GateStatus::Warn
            },
            checked_at: Some(ctx.now_iso.to_string()),
            metrics: None,
            artifacts: None,
            warnings: Some(evaluation.warnings.clone()),
            notes: None,
        },
    );
    let synthesis_digest = sonar_core::digest_of_str(&synthesis);
    gates_write(
        &ctx.gates_path,
        &updates,
        Some(gates.revision),
        &synthesis_digest,
        "report gate",
        ctx.now_iso,
    )?;

    let operator_bundle = ctx.run_root.join(OPERATOR_REVIEW_BUNDLE_FILE);
    let bundle = if operator_bundle.is_file() {
        let raw = sonar_core::read_json_value(&operator_bundle)?;
        review_bundle_ingest(ctx.run_root, &ctx.manifest.run_id, &raw, ctx.now_iso)?
    } else {
        review_factory_auto(ctx.run_root, &ctx.manifest.run_id, &evaluation, ctx.now_iso)?
    };

    let decision = revision_control(
        bundle.decision,
        evaluation.status,
        ctx.manifest.review_iterations(),
        ctx.manifest.limits.max_review_iterations,
    );
    match decision.action {
        RevisionAction::Advance => Ok(()),
        RevisionAction::Revise => {
            write_revision_directives(ctx.run_root, &bundle, ctx.now_iso)?;
            // The revise path re-enters synthesis with a fresh document.
            let final_path = resolve_inside_root(ctx.run_root, FINAL_SYNTHESIS_FILE)?;
            if final_path.is_file() {
                std::fs::remove_file(&final_path).map_err(|error| {
                    EngineError::new(
                        ErrorCode::Internal,
                        format!("failed to clear the final synthesis: {error}"),
                    )
                })?;
            }
            Ok(())
        }
        RevisionAction::Escalate => {
            write_fallback_summary(
                ctx.run_root,
                StageId::Review,
                "REVIEW_CAP_EXCEEDED",
                "the review loop exhausted its iteration budget",
                ctx.now_iso,
            )?;
            Ok(())
        }
    }
}

fn run_finalize_stage(ctx: &TickCtx<'_>) -> EngineResult<()> {
    run_metrics_write(ctx.run_root, ctx.manifest, ctx.now_iso)?;
    // Confirm the bundle still reads PASS before the terminal hop.
    let bundle = load_review_bundle(ctx.run_root)?;
    if bundle.decision != sonar_report::ReviewDecision::Pass {
        return Err(EngineError::new(
            ErrorCode::InvalidReviewBundle,
            "finalize reached without a passing review bundle",
        ));
    }
    Ok(())
}

/// Writes the operator-facing fallback summary for cap escalations.
pub fn write_fallback_summary(
    run_root: &Path,
    stage: StageId,
    code: &str,
    detail: &str,
    now_iso: &str,
) -> EngineResult<()> {
    let text = format!(
        "# Fallback summary\n\n\
         - stage: {stage}\n\
         - blocked_by: {code}\n\
         - detail: {detail}\n\
         - generated_at: {now_iso}\n\n\
         Artifacts already safe to read:\n\
         - wave-1/ outputs and wave-1/wave-review.json\n\
         - citations/citations-rendered.md\n\
         - summaries/summary-pack.json\n\
         - synthesis/draft-synthesis.md\n",
    );
    write_text_atomic(&run_root.join(FALLBACK_SUMMARY_FILE), &text).map_err(EngineError::from)
}
