use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};

use crate::output::wave_output_validate;
use crate::perspectives::PerspectivesDocument;
use crate::plan::WavePlanDocument;

/// Schema tag carried by the wave review report.
pub const WAVE_REVIEW_SCHEMA_VERSION: &str = "wave_review.v1";
/// Retry directives are bounded to this many failures.
pub const DEFAULT_MAX_FAILURES: usize = 100;

fn wave_review_schema_version() -> String {
    WAVE_REVIEW_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Review verdict for one planned output.
pub struct WaveReviewResult {
    pub perspective_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One replay instruction for a failed output.
pub struct RetryDirective {
    pub perspective_id: String,
    pub action: String,
    pub change_note: String,
    pub blocking_error_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Deterministic review over one wave's planned outputs.
pub struct WaveReviewReport {
    #[serde(default = "wave_review_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub wave: u32,
    pub generated_at: String,
    pub ok: bool,
    pub pass: bool,
    pub validated: usize,
    pub failed: usize,
    pub results: Vec<WaveReviewResult>,
    pub retry_directives: Vec<RetryDirective>,
    pub report: String,
}

/// Returns the review report location for a wave.
pub fn wave_review_rel(wave: u32) -> String {
    format!("wave-{wave}/wave-review.json")
}

/// Reviews every planned output in stable key order and persists the
/// report. Failures become bounded retry directives.
pub fn wave_review_run(
    run_root: &Path,
    run_id: &str,
    wave: u32,
    plan: &WavePlanDocument,
    perspectives: &PerspectivesDocument,
    max_failures: usize,
    now_iso: &str,
) -> EngineResult<WaveReviewReport> {
    let mut entries: Vec<_> = plan.entries.iter().collect();
    entries.sort_by(|a, b| a.key().cmp(b.key()));

    let mut results = Vec::with_capacity(entries.len());
    let mut retry_directives = Vec::new();
    let mut validated = 0;
    let mut failed = 0;

    for entry in entries {
        let verdict = review_entry(run_root, perspectives, entry);
        match verdict {
            Ok(()) => {
                validated += 1;
                results.push(WaveReviewResult {
                    perspective_id: entry.perspective_id.clone(),
                    gap_id: entry.gap_id.clone(),
                    ok: true,
                    error_code: None,
                    message: None,
                });
            }
            Err(error) => {
                failed += 1;
                if retry_directives.len() < max_failures {
                    retry_directives.push(RetryDirective {
                        perspective_id: entry.key().to_string(),
                        action: "retry".to_string(),
                        change_note: format!(
                            "regenerate '{}' and fix {}",
                            entry.key(),
                            error.code.as_str()
                        ),
                        blocking_error_code: error.code.as_str().to_string(),
                    });
                }
                results.push(WaveReviewResult {
                    perspective_id: entry.perspective_id.clone(),
                    gap_id: entry.gap_id.clone(),
                    ok: false,
                    error_code: Some(error.code.as_str().to_string()),
                    message: Some(error.message),
                });
            }
        }
    }

    let report = WaveReviewReport {
        schema_version: wave_review_schema_version(),
        run_id: run_id.to_string(),
        wave,
        generated_at: now_iso.to_string(),
        ok: true,
        pass: failed == 0,
        validated,
        failed,
        results,
        retry_directives,
        report: wave_review_rel(wave),
    };
    let report_path = resolve_inside_root(run_root, &wave_review_rel(wave))?;
    write_json_document(&report_path, &report)?;
    Ok(report)
}

fn review_entry(
    run_root: &Path,
    perspectives: &PerspectivesDocument,
    entry: &crate::plan::WavePlanEntry,
) -> EngineResult<()> {
    let perspective = perspectives.find(&entry.perspective_id).ok_or_else(|| {
        EngineError::new(
            ErrorCode::PerspectiveNotFound,
            format!("perspective '{}' is not in the roster", entry.perspective_id),
        )
        .with_details(json!({ "perspective_id": entry.perspective_id }))
    })?;
    let output_path = resolve_inside_root(run_root, &entry.output_md)?;
    if !output_path.is_file() {
        return Err(EngineError::new(
            ErrorCode::MissingArtifact,
            format!("planned output {} is missing", entry.output_md),
        )
        .with_details(json!({ "file": entry.output_md })));
    }
    let markdown = std::fs::read_to_string(&output_path).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to read {}: {error}", entry.output_md),
        )
    })?;
    wave_output_validate(perspective, &markdown).map(|_| ())
}

/// Loads a previously written review report.
pub fn load_wave_review(run_root: &Path, wave: u32) -> EngineResult<WaveReviewReport> {
    let path = resolve_inside_root(run_root, &wave_review_rel(wave))?;
    sonar_core::read_json_document(&path)
}

#[cfg(test)]
mod tests {
    use sonar_core::write_text_atomic;
    use sonar_state::RunLimits;

    use super::{load_wave_review, wave_review_run};
    use crate::output::compliant_markdown;
    use crate::perspectives::sample_roster;
    use crate::plan::wave1_plan_build;

    const NOW: &str = "2026-03-01T10:00:00Z";

    #[test]
    fn functional_review_passes_when_all_outputs_comply() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let roster = sample_roster();
        let plan = wave1_plan_build(
            tempdir.path(),
            "run-001",
            &roster,
            &RunLimits::default(),
            "scope",
            NOW,
        )
        .expect("plan");
        for id in ["p1", "p2"] {
            write_text_atomic(
                &tempdir.path().join(format!("wave-1/{id}.md")),
                &compliant_markdown(&["https://example.com/a"]),
            )
            .expect("seed output");
        }

        let report = wave_review_run(tempdir.path(), "run-001", 1, &plan, &roster, 100, NOW)
            .expect("review should run");
        assert!(report.pass);
        assert_eq!(report.validated, 2);
        assert_eq!(report.failed, 0);
        assert!(report.retry_directives.is_empty());
        assert_eq!(load_wave_review(tempdir.path(), 1).expect("reload"), report);
    }

    #[test]
    fn functional_review_is_deterministic_and_bounds_directives() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let roster = sample_roster();
        let plan = wave1_plan_build(
            tempdir.path(),
            "run-001",
            &roster,
            &RunLimits::default(),
            "scope",
            NOW,
        )
        .expect("plan");
        write_text_atomic(
            &tempdir.path().join("wave-1/p1.md"),
            &compliant_markdown(&["https://example.com/a"]),
        )
        .expect("seed p1");
        // p2 stays missing.

        let first = wave_review_run(tempdir.path(), "run-001", 1, &plan, &roster, 100, NOW)
            .expect("review should run");
        assert!(!first.pass);
        assert_eq!(first.validated, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.results[0].perspective_id, "p1");
        assert_eq!(first.results[1].perspective_id, "p2");
        assert_eq!(first.retry_directives.len(), 1);
        let directive = &first.retry_directives[0];
        assert_eq!(directive.perspective_id, "p2");
        assert_eq!(directive.action, "retry");
        assert_eq!(directive.blocking_error_code, "MISSING_ARTIFACT");

        let second = wave_review_run(tempdir.path(), "run-001", 1, &plan, &roster, 100, NOW)
            .expect("re-review should run");
        assert_eq!(first, second);

        let bounded = wave_review_run(tempdir.path(), "run-001", 1, &plan, &roster, 0, NOW)
            .expect("bounded review should run");
        assert!(bounded.retry_directives.is_empty());
        assert_eq!(bounded.failed, 1);
    }
}
