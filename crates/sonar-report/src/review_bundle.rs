use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sonar_core::{resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};
use sonar_state::{GateStatus, StageId};

use crate::gate_e::GateEEvaluation;

/// Review bundle location inside a run root.
pub const REVIEW_BUNDLE_FILE: &str = "review/review-bundle.json";
/// Revision directives location inside a run root.
pub const REVISION_DIRECTIVES_FILE: &str = "review/revision-directives.json";
/// Schema tag carried by the review bundle.
pub const REVIEW_BUNDLE_SCHEMA_VERSION: &str = "review_bundle.v1";
/// Findings and directives are truncated to this many entries on ingest.
pub const REVIEW_LIST_CAP: usize = 100;

fn review_bundle_schema_version() -> String {
    REVIEW_BUNDLE_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Enumerates supported `ReviewDecision` values.
pub enum ReviewDecision {
    Pass,
    ChangesRequired,
}

impl ReviewDecision {
    /// Returns the wire form of the decision.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::ChangesRequired => "CHANGES_REQUIRED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One reviewer finding.
pub struct ReviewFinding {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One revision instruction for the next synthesis pass.
pub struct ReviewDirective {
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The reviewer's verdict over the final synthesis.
pub struct ReviewBundleDocument {
    #[serde(default = "review_bundle_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub directives: Vec<ReviewDirective>,
}

/// Ingests an externally produced review bundle: the decision must be
/// `PASS` or `CHANGES_REQUIRED`, and both lists are truncated to 100.
pub fn review_bundle_ingest(
    run_root: &Path,
    run_id: &str,
    raw: &Value,
    now_iso: &str,
) -> EngineResult<ReviewBundleDocument> {
    let decision = match raw.get("decision").and_then(Value::as_str) {
        Some("PASS") => ReviewDecision::Pass,
        Some("CHANGES_REQUIRED") => ReviewDecision::ChangesRequired,
        other => {
            return Err(EngineError::new(
                ErrorCode::InvalidReviewBundle,
                format!("review decision {other:?} is not PASS or CHANGES_REQUIRED"),
            )
            .with_details(json!({ "decision": raw.get("decision").cloned() })));
        }
    };
    let findings = decode_list::<ReviewFinding>(raw.get("findings"))?;
    let directives = decode_list::<ReviewDirective>(raw.get("directives"))?;

    let document = ReviewBundleDocument {
        schema_version: review_bundle_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        decision,
        findings: findings.into_iter().take(REVIEW_LIST_CAP).collect(),
        directives: directives.into_iter().take(REVIEW_LIST_CAP).collect(),
    };
    write_json_document(&resolve_inside_root(run_root, REVIEW_BUNDLE_FILE)?, &document)?;
    Ok(document)
}

fn decode_list<T: serde::de::DeserializeOwned>(raw: Option<&Value>) -> EngineResult<Vec<T>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw.clone()).map_err(|error| {
        EngineError::new(
            ErrorCode::InvalidReviewBundle,
            format!("review bundle list is malformed: {error}"),
        )
    })
}

/// Derives a review bundle from Gate E when no external reviewer is
/// configured.
pub fn review_factory_auto(
    run_root: &Path,
    run_id: &str,
    evaluation: &GateEEvaluation,
    now_iso: &str,
) -> EngineResult<ReviewBundleDocument> {
    let mut findings = Vec::new();
    let mut directives = Vec::new();
    if evaluation.metrics.uncited_numeric_claims > 0 {
        findings.push(ReviewFinding {
            code: "UNCITED_NUMERIC_CLAIMS".to_string(),
            message: format!(
                "{} numeric claims lack an inline citation",
                evaluation.metrics.uncited_numeric_claims
            ),
            section: None,
        });
        directives.push(ReviewDirective {
            action: "revise".to_string(),
            detail: "attach a [@cid_...] mention to every numeric claim".to_string(),
        });
    }
    for section in &evaluation.missing_sections {
        findings.push(ReviewFinding {
            code: "MISSING_SECTION".to_string(),
            message: format!("required section {section} is absent"),
            section: Some(section.clone()),
        });
        directives.push(ReviewDirective {
            action: "revise".to_string(),
            detail: format!("add the {section} section"),
        });
    }
    for warning in &evaluation.warnings {
        findings.push(ReviewFinding {
            code: warning.clone(),
            message: "soft citation-quality warning".to_string(),
            section: None,
        });
    }

    let decision = if evaluation.status == GateStatus::Pass {
        ReviewDecision::Pass
    } else {
        ReviewDecision::ChangesRequired
    };
    let document = ReviewBundleDocument {
        schema_version: review_bundle_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        decision,
        findings: findings.into_iter().take(REVIEW_LIST_CAP).collect(),
        directives: directives.into_iter().take(REVIEW_LIST_CAP).collect(),
    };
    write_json_document(&resolve_inside_root(run_root, REVIEW_BUNDLE_FILE)?, &document)?;
    Ok(document)
}

/// Loads a previously written review bundle.
pub fn load_review_bundle(run_root: &Path) -> EngineResult<ReviewBundleDocument> {
    let path = resolve_inside_root(run_root, REVIEW_BUNDLE_FILE)?;
    sonar_core::read_json_document(&path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RevisionAction` values.
pub enum RevisionAction {
    Advance,
    Revise,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// What the run should do after a review pass.
pub struct RevisionDecision {
    pub action: RevisionAction,
    pub next: StageId,
}

/// The bounded review loop controller.
pub fn revision_control(
    decision: ReviewDecision,
    gate_e_status: GateStatus,
    iteration: u32,
    max_review_iterations: u32,
) -> RevisionDecision {
    if decision == ReviewDecision::Pass && gate_e_status == GateStatus::Pass {
        return RevisionDecision {
            action: RevisionAction::Advance,
            next: StageId::Finalize,
        };
    }
    if iteration >= max_review_iterations {
        return RevisionDecision {
            action: RevisionAction::Escalate,
            next: StageId::Review,
        };
    }
    RevisionDecision {
        action: RevisionAction::Revise,
        next: StageId::Synthesis,
    }
}

/// Persists the revision directives the next synthesis pass consumes.
pub fn write_revision_directives(
    run_root: &Path,
    bundle: &ReviewBundleDocument,
    now_iso: &str,
) -> EngineResult<()> {
    write_json_document(
        &resolve_inside_root(run_root, REVISION_DIRECTIVES_FILE)?,
        &json!({
            "generated_at": now_iso,
            "decision": bundle.decision.as_str(),
            "directives": bundle.directives,
        }),
    )
}
