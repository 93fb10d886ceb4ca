//! End-to-end lifecycle flows over temp run roots with fixture drivers.

use std::path::{Path, PathBuf};

use serde_json::json;
use sonar_core::{write_json_document, write_text_atomic, ErrorCode};
use sonar_orchestrator::{
    orchestrator_run, orchestrator_tick, run_init, DriverConfig, RunInitRequest, RunLoopRequest,
    TickRequest, DEFAULT_LEASE_SECONDS,
};
use sonar_state::{
    load_gates, load_manifest, manifest_write, GateId, GateStatus, RunLimits, RunStatus, StageId,
};

const NOW: &str = "2026-03-01T10:00:00Z";

struct Harness {
    _tempdir: tempfile::TempDir,
    run_root: PathBuf,
    fixtures_dir: PathBuf,
}

fn compliant_output(findings: &str, sources: &[&str], gaps: &str) -> String {
    let mut bullets = String::new();
    for source in sources {
        bullets.push_str("- ");
        bullets.push_str(source);
        bullets.push('\n');
    }
    format!("## Findings\n{findings}\n\n## Sources\n{bullets}\n## Gaps\n{gaps}")
}

fn seed_perspectives(run_root: &Path) {
    let contract = json!({
        "max_words": 400,
        "max_sources": 5,
        "tool_budget": 10,
        "must_include_sections": ["Findings", "Sources", "Gaps"],
    });
    write_json_document(
        &run_root.join("perspectives.json"),
        &json!({
            "schema_version": "perspectives.v1",
            "perspectives": [
                {
                    "id": "p1",
                    "title": "Market landscape",
                    "track": "standard",
                    "agent_type": "researcher",
                    "prompt_contract": contract,
                },
                {
                    "id": "p2",
                    "title": "Regulatory posture",
                    "track": "independent",
                    "agent_type": "analyst",
                    "prompt_contract": contract,
                },
            ],
        }),
    )
    .expect("perspectives should seed");
}

fn seed_citation_fixtures(run_root: &Path, urls: &[&str]) {
    let statuses: serde_json::Map<String, serde_json::Value> = urls
        .iter()
        .map(|url| {
            let normalized = sonar_citations::normalize_url(url).expect("normalize");
            (normalized, json!({ "status": "valid", "title": "Fixture" }))
        })
        .collect();
    write_json_document(
        &run_root.join("operator/citation-fixtures.json"),
        &json!({ "statuses": statuses }),
    )
    .expect("citation fixtures should seed");
}

fn harness() -> Harness {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let run_root = tempdir.path().join("run-001");
    let fixtures_dir = tempdir.path().join("fixtures");

    run_init(&RunInitRequest {
        run_root: &run_root,
        run_id: "run-001",
        query: sonar_state::QuerySpec {
            mode: sonar_state::QueryMode::Deep,
            sensitivity: sonar_state::Sensitivity::NoWeb,
            constraints: json!({}),
        },
        limits: RunLimits::default(),
        now_iso: NOW,
    })
    .expect("run should initialize");
    seed_perspectives(&run_root);

    std::fs::create_dir_all(fixtures_dir.join("wave1")).expect("wave1 fixtures dir");
    std::fs::create_dir_all(fixtures_dir.join("wave2")).expect("wave2 fixtures dir");
    write_text_atomic(
        &fixtures_dir.join("wave1/p1.md"),
        &compliant_output(
            "Deployments doubled across the target region.",
            &["https://example.com/doc?id=a"],
            "- (P0) No regional deployment numbers\n",
        ),
    )
    .expect("p1 fixture");
    write_text_atomic(
        &fixtures_dir.join("wave1/p2.md"),
        &compliant_output(
            "Subsidies lapse without a renewal bill.",
            &["https://example.com/policy"],
            "",
        ),
    )
    .expect("p2 fixture");
    write_text_atomic(
        &fixtures_dir.join("wave2/gap_p1_1.md"),
        &compliant_output(
            "Regional figures exist in the annual review.",
            &["https://example.net/regional"],
            "",
        ),
    )
    .expect("gap fixture");

    seed_citation_fixtures(
        &run_root,
        &[
            "https://example.com/doc?id=a",
            "https://example.com/policy",
            "https://example.net/regional",
        ],
    );

    Harness {
        _tempdir: tempdir,
        run_root,
        fixtures_dir,
    }
}

#[tokio::test]
async fn integration_full_lifecycle_reaches_complete_via_wave2() {
    let harness = harness();
    let driver = DriverConfig::Fixture(harness.fixtures_dir.clone());

    let outcome = orchestrator_run(&RunLoopRequest {
        run_root: &harness.run_root,
        driver: &driver,
        holder_id: "itest",
        max_ticks: 24,
        target_stage: None,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect("run should complete");

    assert_eq!(outcome.final_stage, StageId::Complete);
    assert_eq!(outcome.ticks.len(), 9);

    let manifest = load_manifest(&harness.run_root.join("manifest.json")).expect("manifest");
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.stage.history.len(), 9);
    assert_eq!(manifest.stage.history[0].from, StageId::Init);
    assert_eq!(manifest.stage.history[2].to, StageId::Wave2);

    let gates = load_gates(&harness.run_root.join("gates.json")).expect("gates");
    for gate in [GateId::B, GateId::C, GateId::D, GateId::E] {
        assert_eq!(gates.status_of(gate), GateStatus::Pass, "gate {gate}");
    }
    assert!(matches!(
        gates.status_of(GateId::F),
        GateStatus::Pass | GateStatus::Warn
    ));

    for rel in [
        "wave-1/p1.md",
        "wave-1/p1.meta.json",
        "wave-2/gap_p1_1.md",
        "pivot.json",
        "citations/citations.jsonl",
        "citations/citations-rendered.md",
        "summaries/summary-pack.json",
        "synthesis/final-synthesis.md",
        "review/review-bundle.json",
        "reports/gate-e-status.json",
        "metrics/run-metrics.json",
        "logs/ticks.jsonl",
        "logs/telemetry.jsonl",
        "logs/audit.jsonl",
    ] {
        assert!(harness.run_root.join(rel).exists(), "missing {rel}");
    }
    assert!(!harness.run_root.join("logs/run.lock").exists());

    let pivot: serde_json::Value =
        sonar_core::read_json_document(&harness.run_root.join("pivot.json")).expect("pivot");
    assert_eq!(pivot["decision"]["wave2_required"], json!(true));
    assert_eq!(pivot["decision"]["rule_hit"], json!("Wave2Required.P0"));

    let review = sonar_wave::load_wave_review(&harness.run_root, 1).expect("wave-1 review");
    assert!(review.pass);
    assert_eq!(review.validated, 2);

    let bundle = sonar_report::load_review_bundle(&harness.run_root).expect("review bundle");
    assert_eq!(bundle.decision, sonar_report::ReviewDecision::Pass);

    let pack = sonar_report::load_summary_pack(&harness.run_root).expect("summary pack");
    assert_eq!(pack.summaries.len(), 3);
    assert!(pack
        .summaries
        .iter()
        .all(|summary| summary.body.contains("[@cid_")));
}

#[tokio::test]
async fn integration_failed_wave_review_retries_then_recovers() {
    let harness = harness();
    let driver = DriverConfig::Fixture(harness.fixtures_dir.clone());
    let tick = |driver: DriverConfig| {
        let run_root = harness.run_root.clone();
        async move {
            orchestrator_tick(&TickRequest {
                run_root: &run_root,
                driver: &driver,
                holder_id: "itest",
                lease_seconds: DEFAULT_LEASE_SECONDS,
                citation_fixtures: None,
                now_iso: NOW,
            })
            .await
        }
    };

    tick(driver.clone()).await.expect("enter wave1");

    // An external process drops a non-compliant p2 straight into the
    // wave directory; p1 is fine.
    std::fs::create_dir_all(harness.run_root.join("wave-1")).expect("wave dir");
    write_text_atomic(
        &harness.run_root.join("wave-1/p1.md"),
        &compliant_output(
            "Deployments doubled across the target region.",
            &["https://example.com/doc?id=a"],
            "- (P0) No regional deployment numbers\n",
        ),
    )
    .expect("good p1");
    write_text_atomic(
        &harness.run_root.join("wave-1/p2.md"),
        "## Findings\nno sources or gaps sections here\n",
    )
    .expect("bad p2");

    let blocked = tick(driver.clone()).await.expect_err("review should fail");
    assert_eq!(blocked.code, ErrorCode::RetryRequired);
    let manifest = load_manifest(&harness.run_root.join("manifest.json")).expect("manifest");
    assert_eq!(manifest.metrics.retry_counts.get("B"), Some(&1));
    let directives: serde_json::Value = sonar_core::read_json_document(
        &harness.run_root.join("retry/retry-directives.json"),
    )
    .expect("directives");
    assert_eq!(directives["consumed_at"], json!(null));
    assert_eq!(directives["directives"][0]["perspective_id"], json!("p2"));

    // The next tick replays only p2 from the (compliant) fixture and
    // the wave recovers.
    let outcome = tick(driver.clone()).await.expect("replay tick should advance");
    assert_eq!(outcome.stage_after, StageId::Pivot);
    let directives: serde_json::Value = sonar_core::read_json_document(
        &harness.run_root.join("retry/retry-directives.json"),
    )
    .expect("directives");
    assert_eq!(directives["consumed_at"], json!(NOW));
    let gates = load_gates(&harness.run_root.join("gates.json")).expect("gates");
    assert_eq!(gates.status_of(GateId::B), GateStatus::Pass);
}

#[tokio::test]
async fn integration_paused_and_cancelled_runs_halt_ticks() {
    let harness = harness();
    let driver = DriverConfig::Fixture(harness.fixtures_dir.clone());

    manifest_write(
        &harness.run_root.join("manifest.json"),
        &json!({ "status": "paused" }),
        None,
        "operator pause",
        NOW,
    )
    .expect("pause");
    let paused = orchestrator_tick(&TickRequest {
        run_root: &harness.run_root,
        driver: &driver,
        holder_id: "itest",
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect_err("paused run should not tick");
    assert_eq!(paused.code, ErrorCode::Paused);

    manifest_write(
        &harness.run_root.join("manifest.json"),
        &json!({ "status": "cancelled" }),
        None,
        "operator cancel",
        NOW,
    )
    .expect("cancel");
    let cancelled = orchestrator_tick(&TickRequest {
        run_root: &harness.run_root,
        driver: &driver,
        holder_id: "itest",
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect_err("cancelled run should not tick");
    assert_eq!(cancelled.code, ErrorCode::Cancelled);
}

#[tokio::test]
async fn integration_task_driver_halts_with_operator_commands() {
    let harness = harness();
    let fixture = DriverConfig::Fixture(harness.fixtures_dir.clone());
    orchestrator_tick(&TickRequest {
        run_root: &harness.run_root,
        driver: &fixture,
        holder_id: "itest",
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect("enter wave1");

    let halted = orchestrator_tick(&TickRequest {
        run_root: &harness.run_root,
        driver: &DriverConfig::Task,
        holder_id: "itest",
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect_err("task driver should halt");
    assert_eq!(halted.code, ErrorCode::RunAgentRequired);

    let latest: serde_json::Value = sonar_core::read_json_document(
        &harness.run_root.join("operator/halt/latest.json"),
    )
    .expect("halt file");
    assert_eq!(latest["error"]["code"], json!("RUN_AGENT_REQUIRED"));
    assert_eq!(
        latest["error"]["details"]["missing_perspectives"]
            .as_array()
            .expect("missing perspectives")
            .len(),
        2
    );
    assert!(harness.run_root.join("operator/halt/tick-0001.json").exists());
}

#[tokio::test]
async fn integration_kill_switch_blocks_the_run_but_keeps_artifacts() {
    let harness = harness();
    manifest_write(
        &harness.run_root.join("manifest.json"),
        &json!({ "query": { "constraints": { "option_c": { "enabled": false } } } }),
        None,
        "disable option_c",
        NOW,
    )
    .expect("disable");

    let driver = DriverConfig::Fixture(harness.fixtures_dir.clone());
    let disabled = orchestrator_tick(&TickRequest {
        run_root: &harness.run_root,
        driver: &driver,
        holder_id: "itest",
        lease_seconds: DEFAULT_LEASE_SECONDS,
        citation_fixtures: None,
        now_iso: NOW,
    })
    .await
    .expect_err("disabled run should not tick");
    assert_eq!(disabled.code, ErrorCode::Disabled);
    assert!(harness.run_root.join("perspectives.json").exists());
}
