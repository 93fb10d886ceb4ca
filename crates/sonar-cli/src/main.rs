//! Thin operator CLI over the Sonar run orchestrator.
//!
//! Every command prints one JSON envelope on stdout:
//! `{ "ok": true, ... }` or `{ "ok": false, "error": { code, message,
//! details } }`. All state logic lives in the library crates.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sonar_core::{envelope_err, envelope_ok, now_iso, EngineError, EngineResult, ErrorCode};
use sonar_orchestrator::{
    load_scope, orchestrator_run, run_init, DriverConfig, RunInitRequest, RunLoopRequest,
    TickRequest, DEFAULT_LEASE_SECONDS,
};
use sonar_state::{
    load_gates, load_manifest, manifest_write, retry_record, run_metrics_write, stage_advance,
    watchdog_check, QueryMode, QuerySpec, RunLimits, Sensitivity, StageAdvanceRequest, StageId,
    WatchdogRequest, GATES_FILE, MANIFEST_FILE,
};

#[derive(Parser)]
#[command(name = "sonar", version, about = "Deep-research run orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a run root from operator/scope.json (or defaults).
    Init {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Print the run's manifest and gate summary (lock-free).
    Status {
        #[arg(long)]
        run_root: PathBuf,
    },
    /// Execute one orchestrator tick.
    Tick {
        #[arg(long)]
        run_root: PathBuf,
        /// Directory of pre-made agent outputs; omitted means the task
        /// driver (halt on missing outputs).
        #[arg(long)]
        fixtures_dir: Option<PathBuf>,
        #[arg(long)]
        citation_fixtures: Option<PathBuf>,
    },
    /// Execute ticks until a target stage, a block, or the tick budget.
    Run {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long, default_value_t = 24)]
        max_ticks: u32,
        #[arg(long)]
        target_stage: Option<String>,
        #[arg(long)]
        fixtures_dir: Option<PathBuf>,
        #[arg(long)]
        citation_fixtures: Option<PathBuf>,
    },
    /// Ask the transition authority for one explicit stage transition.
    Advance {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        next: Option<String>,
        #[arg(long)]
        expected_revision: Option<u64>,
        #[arg(long, default_value = "operator advance")]
        reason: String,
    },
    /// Run one watchdog pass over the current stage.
    Watchdog {
        #[arg(long)]
        run_root: PathBuf,
    },
    /// Derive and persist metrics/run-metrics.json.
    Metrics {
        #[arg(long)]
        run_root: PathBuf,
    },
    /// Record a retry attempt against a gate budget.
    Retry {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        gate: String,
        #[arg(long)]
        change_note: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value_t = 2)]
        max_retries: u32,
    },
    /// Ingest an externally produced agent output for one perspective.
    AgentResult {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        perspective: String,
        #[arg(long)]
        output_file: PathBuf,
    },
    /// Pause, resume, or cancel a run.
    SetStatus {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "operator status change")]
        reason: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli.command).await {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&envelope_ok(payload)).unwrap_or_default());
        }
        Err(error) => {
            println!("{}", serde_json::to_string_pretty(&envelope_err(&error)).unwrap_or_default());
            std::process::exit(1);
        }
    }
}

async fn dispatch(command: Command) -> EngineResult<Value> {
    let now = now_iso();
    let holder_id = format!("sonar-cli-{}", std::process::id());
    match command {
        Command::Init { run_root, run_id } => {
            let scope = load_scope(&run_root)?;
            let (query, limits) = match scope {
                Some(scope) => (scope.query, scope.limits.unwrap_or_default()),
                None => (
                    QuerySpec {
                        mode: QueryMode::Standard,
                        sensitivity: Sensitivity::Normal,
                        constraints: json!({}),
                    },
                    RunLimits::default(),
                ),
            };
            let manifest = run_init(&RunInitRequest {
                run_root: &run_root,
                run_id: &run_id,
                query,
                limits,
                now_iso: &now,
            })?;
            Ok(json!({
                "run_id": manifest.run_id,
                "revision": manifest.revision,
                "stage": manifest.stage.current.as_str(),
            }))
        }
        Command::Status { run_root } => {
            let manifest = load_manifest(&run_root.join(MANIFEST_FILE))?;
            let gates = load_gates(&run_root.join(GATES_FILE))?;
            let gate_summary: Value = gates
                .gates
                .iter()
                .map(|(gate, record)| (gate.as_str().to_string(), json!(record.status.as_str())))
                .collect::<serde_json::Map<String, Value>>()
                .into();
            Ok(json!({
                "run_id": manifest.run_id,
                "status": manifest.status.as_str(),
                "stage": manifest.stage.current.as_str(),
                "revision": manifest.revision,
                "gates_revision": gates.revision,
                "gates": gate_summary,
                "failures": manifest.failures.len(),
            }))
        }
        Command::Tick {
            run_root,
            fixtures_dir,
            citation_fixtures,
        } => {
            let driver = driver_config(fixtures_dir);
            let outcome = sonar_orchestrator::orchestrator_tick(&TickRequest {
                run_root: &run_root,
                driver: &driver,
                holder_id: &holder_id,
                lease_seconds: DEFAULT_LEASE_SECONDS,
                citation_fixtures: citation_fixtures.as_deref(),
                now_iso: &now,
            })
            .await?;
            Ok(json!({
                "tick_index": outcome.tick_index,
                "stage_before": outcome.stage_before.as_str(),
                "stage_after": outcome.stage_after.as_str(),
                "advanced": outcome.advanced,
            }))
        }
        Command::Run {
            run_root,
            max_ticks,
            target_stage,
            fixtures_dir,
            citation_fixtures,
        } => {
            let driver = driver_config(fixtures_dir);
            let target = parse_stage(target_stage.as_deref())?;
            let outcome = orchestrator_run(&RunLoopRequest {
                run_root: &run_root,
                driver: &driver,
                holder_id: &holder_id,
                max_ticks,
                target_stage: target,
                citation_fixtures: citation_fixtures.as_deref(),
                now_iso: &now,
            })
            .await?;
            Ok(json!({
                "ticks": outcome.ticks.len(),
                "final_stage": outcome.final_stage.as_str(),
                "reached_target": outcome.reached_target,
            }))
        }
        Command::Advance {
            run_root,
            next,
            expected_revision,
            reason,
        } => {
            let outcome = stage_advance(&StageAdvanceRequest {
                manifest_path: &run_root.join(MANIFEST_FILE),
                gates_path: &run_root.join(GATES_FILE),
                requested_next: parse_stage(next.as_deref())?,
                expected_manifest_revision: expected_revision,
                reason: &reason,
                now_iso: &now,
            })?;
            Ok(json!({
                "from": outcome.from.as_str(),
                "to": outcome.to.as_str(),
                "revision": outcome.manifest.revision,
                "inputs_digest": outcome.inputs_digest,
            }))
        }
        Command::Watchdog { run_root } => {
            let report = watchdog_check(&WatchdogRequest {
                manifest_path: &run_root.join(MANIFEST_FILE),
                stage: None,
                now_iso: &now,
                reason: "watchdog pass",
            })?;
            Ok(json!({
                "timed_out": report.timed_out,
                "paused": report.paused,
                "stage": report.stage.as_str(),
                "elapsed_s": report.elapsed_s,
                "timeout_s": report.timeout_s,
            }))
        }
        Command::Metrics { run_root } => {
            let manifest = load_manifest(&run_root.join(MANIFEST_FILE))?;
            let metrics = run_metrics_write(&run_root, &manifest, &now)?;
            serde_json::to_value(&metrics).map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to encode metrics: {error}"),
                )
            })
        }
        Command::Retry {
            run_root,
            gate,
            change_note,
            reason,
            max_retries,
        } => {
            let outcome = retry_record(
                &run_root.join(MANIFEST_FILE),
                &gate,
                &change_note,
                &reason,
                max_retries,
                &now,
            )?;
            Ok(json!({ "gate_id": outcome.gate_id, "retry_count": outcome.retry_count }))
        }
        Command::AgentResult {
            run_root,
            perspective,
            output_file,
        } => {
            let manifest = load_manifest(&run_root.join(MANIFEST_FILE))?;
            let wave = match manifest.stage.current {
                StageId::Wave1 => 1,
                StageId::Wave2 => 2,
                other => {
                    return Err(EngineError::new(
                        ErrorCode::InvalidArgs,
                        format!("stage {other} accepts no agent results"),
                    ));
                }
            };
            let plan = sonar_wave::load_wave_plan(&run_root, wave)?;
            let entry = plan
                .entries
                .iter()
                .find(|entry| entry.key() == perspective)
                .ok_or_else(|| {
                    EngineError::new(
                        ErrorCode::PerspectiveNotFound,
                        format!("'{perspective}' has no plan entry"),
                    )
                })?;
            let markdown = std::fs::read_to_string(&output_file).map_err(|error| {
                EngineError::new(
                    ErrorCode::InvalidArgs,
                    format!("output file {} is unreadable: {error}", output_file.display()),
                )
            })?;
            let perspectives = sonar_wave::load_perspectives(
                &run_root.join(sonar_wave::PERSPECTIVES_FILE),
            )?;
            let retry_count = manifest
                .metrics
                .retry_counts
                .get("B")
                .copied()
                .unwrap_or(0);
            let result = sonar_wave::AgentResult {
                perspective_id: entry.perspective_id.clone(),
                gap_id: entry.gap_id.clone(),
                markdown,
                agent_run_id: format!("operator-{holder_id}"),
                prompt_digest: None,
                source_input_path: Some(output_file.display().to_string()),
            };
            let outcome = sonar_wave::wave_output_ingest(&sonar_wave::WaveIngestRequest {
                run_root: &run_root,
                plan: &plan,
                perspectives: &perspectives,
                results: &[result],
                retry_count,
                now_iso: &now,
            })?;
            Ok(json!({ "written": outcome.written }))
        }
        Command::SetStatus {
            run_root,
            status,
            reason,
        } => {
            let manifest = manifest_write(
                &run_root.join(MANIFEST_FILE),
                &json!({ "status": status }),
                None,
                &reason,
                &now,
            )?;
            Ok(json!({ "status": manifest.status.as_str(), "revision": manifest.revision }))
        }
    }
}

fn driver_config(fixtures_dir: Option<PathBuf>) -> DriverConfig {
    match fixtures_dir {
        Some(dir) => DriverConfig::Fixture(dir),
        None => DriverConfig::Task,
    }
}

fn parse_stage(raw: Option<&str>) -> EngineResult<Option<StageId>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    StageId::parse(raw)
        .map(Some)
        .ok_or_else(|| EngineError::new(ErrorCode::InvalidArgs, format!("unknown stage '{raw}'")))
}
