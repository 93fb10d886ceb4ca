use std::path::Path;
use std::sync::Arc;

use sonar_core::EngineResult;
use sonar_state::StageId;

use crate::driver::{AgentDriver, DriverConfig};
use crate::tick::{orchestrator_tick, TickOutcome, TickRequest};

/// Default lock lease for orchestrated ticks.
pub const DEFAULT_LEASE_SECONDS: u64 = 120;

/// Inputs for a bounded multi-tick run.
#[derive(Debug, Clone)]
pub struct RunLoopRequest<'a> {
    pub run_root: &'a Path,
    pub driver: &'a DriverConfig,
    pub holder_id: &'a str,
    pub max_ticks: u32,
    pub target_stage: Option<StageId>,
    pub citation_fixtures: Option<&'a Path>,
    pub now_iso: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a bounded run loop achieved.
pub struct RunLoopOutcome {
    pub ticks: Vec<TickOutcome>,
    pub final_stage: StageId,
    pub reached_target: bool,
}

/// Repeats ticks up to `max_ticks`, stopping at the target stage or the
/// terminal stage. Typed blocks propagate unchanged from the failing
/// tick.
pub async fn orchestrator_run(request: &RunLoopRequest<'_>) -> EngineResult<RunLoopOutcome> {
    let mut ticks = Vec::new();
    let mut final_stage = sonar_state::load_manifest(
        &request.run_root.join(sonar_state::MANIFEST_FILE),
    )?
    .stage
    .current;

    for _ in 0..request.max_ticks {
        let outcome = orchestrator_tick(&TickRequest {
            run_root: request.run_root,
            driver: request.driver,
            holder_id: request.holder_id,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            citation_fixtures: request.citation_fixtures,
            now_iso: request.now_iso,
        })
        .await?;
        final_stage = outcome.stage_after;
        ticks.push(outcome);

        let reached = request
            .target_stage
            .map(|target| final_stage == target)
            .unwrap_or(false);
        if reached || final_stage.is_terminal() {
            return Ok(RunLoopOutcome {
                ticks,
                final_stage,
                reached_target: reached || request.target_stage.is_none(),
            });
        }
    }
    let reached = request
        .target_stage
        .map(|target| final_stage == target)
        .unwrap_or(final_stage.is_terminal());
    Ok(RunLoopOutcome {
        ticks,
        final_stage,
        reached_target: reached,
    })
}

/// One tick against pre-made wave outputs on disk.
pub async fn orchestrator_tick_fixture(
    run_root: &Path,
    fixtures_dir: &Path,
    holder_id: &str,
    now_iso: &str,
) -> EngineResult<TickOutcome> {
    let driver = DriverConfig::Fixture(fixtures_dir.to_path_buf());
    orchestrator_tick(&TickRequest {
        run_root,
        driver: &driver,
        holder_id,
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso,
    })
    .await
}

/// One tick against a live `runAgent` driver callback.
pub async fn orchestrator_tick_live(
    run_root: &Path,
    driver: Arc<dyn AgentDriver>,
    holder_id: &str,
    now_iso: &str,
) -> EngineResult<TickOutcome> {
    let driver = DriverConfig::Live(driver);
    orchestrator_tick(&TickRequest {
        run_root,
        driver: &driver,
        holder_id,
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso,
    })
    .await
}

/// One post-pivot tick (citations and later stages need no agent
/// driver).
pub async fn orchestrator_tick_post_pivot(
    run_root: &Path,
    citation_fixtures: Option<&Path>,
    holder_id: &str,
    now_iso: &str,
) -> EngineResult<TickOutcome> {
    orchestrator_tick(&TickRequest {
        run_root,
        driver: &DriverConfig::Task,
        holder_id,
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures,
        now_iso,
    })
    .await
}

/// One post-summaries tick (synthesis, review, finalize).
pub async fn orchestrator_tick_post_summaries(
    run_root: &Path,
    holder_id: &str,
    now_iso: &str,
) -> EngineResult<TickOutcome> {
    orchestrator_tick(&TickRequest {
        run_root,
        driver: &DriverConfig::Task,
        holder_id,
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso,
    })
    .await
}
