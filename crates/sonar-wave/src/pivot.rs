use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};
use sonar_state::RunLimits;

use crate::output::split_sections;
use crate::plan::WavePlanDocument;
use crate::review::WaveReviewReport;

/// Schema tag carried by the pivot decision document.
pub const PIVOT_SCHEMA_VERSION: &str = "pivot_decision.v1";
/// Pivot decision location inside a run root.
pub const PIVOT_FILE: &str = "pivot.json";

/// Rule label recorded when a P0 gap forces wave-2.
pub const RULE_WAVE2_REQUIRED_P0: &str = "Wave2Required.P0";
/// Rule label recorded when no P0 gap exists.
pub const RULE_WAVE2_NOT_REQUIRED: &str = "Wave2NotRequired.NoP0";

fn pivot_schema_version() -> String {
    PIVOT_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
/// Gap priorities; `P0` outranks `P1` outranks `P2`.
pub enum GapPriority {
    P0,
    P1,
    P2,
}

impl GapPriority {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One gap parsed from a wave-1 output's `## Gaps` section.
pub struct PivotGap {
    pub gap_id: String,
    pub perspective_id: String,
    pub ordinal: u32,
    pub priority: GapPriority,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One wave-1 output as indexed by the pivot.
pub struct PivotWaveOutput {
    pub perspective_id: String,
    pub output_md: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The wave-2 decision.
pub struct PivotDecision {
    pub wave2_required: bool,
    pub wave2_gap_ids: Vec<String>,
    pub rule_hit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Wave-1 index slice of the pivot document.
pub struct PivotWave1 {
    pub outputs: Vec<PivotWaveOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The post-wave-1 decision point document.
pub struct PivotDocument {
    #[serde(default = "pivot_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub wave1: PivotWave1,
    pub gaps: Vec<PivotGap>,
    pub decision: PivotDecision,
}

/// Builds the pivot decision from compliant wave-1 outputs.
///
/// Gaps sort by `(priority, perspective_id, ordinal)`; wave-2 is
/// required exactly when a P0 gap exists and the wave-1 contract is met.
pub fn pivot_build(
    run_root: &Path,
    run_id: &str,
    plan: &WavePlanDocument,
    review: &WaveReviewReport,
    limits: &RunLimits,
    now_iso: &str,
) -> EngineResult<PivotDocument> {
    if !review.pass {
        return Err(EngineError::new(
            ErrorCode::Wave1ContractNotMet,
            format!("wave-1 review failed for {} outputs", review.failed),
        )
        .with_details(json!({ "validated": review.validated, "failed": review.failed })));
    }

    let gap_line = Regex::new(r"^- \((P[0-9])\)\s+(.+)$").map_err(|error| {
        EngineError::new(ErrorCode::Internal, format!("invalid gaps regex: {error}"))
    })?;

    let mut outputs = Vec::new();
    let mut gaps: Vec<PivotGap> = Vec::new();
    let mut entries: Vec<_> = plan.entries.iter().collect();
    entries.sort_by(|a, b| a.perspective_id.cmp(&b.perspective_id));

    for entry in entries {
        let output_path = resolve_inside_root(run_root, &entry.output_md)?;
        if !output_path.is_file() {
            return Err(EngineError::new(
                ErrorCode::Wave1ContractNotMet,
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
        outputs.push(PivotWaveOutput {
            perspective_id: entry.perspective_id.clone(),
            output_md: entry.output_md.clone(),
        });

        let sections = split_sections(&markdown);
        let gaps_section = sections.get("Gaps").map(String::as_str).unwrap_or("");
        let mut ordinal = 0;
        for line in gaps_section.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            let captures = gap_line.captures(line).ok_or_else(|| {
                EngineError::new(
                    ErrorCode::GapsParseFailed,
                    format!(
                        "gap bullet in '{}' lacks a (Pn) priority marker: '{line}'",
                        entry.perspective_id
                    ),
                )
                .with_details(json!({
                    "perspective_id": entry.perspective_id,
                    "line": line,
                }))
            })?;
            let priority = GapPriority::parse(&captures[1]).ok_or_else(|| {
                EngineError::new(
                    ErrorCode::GapsParseFailed,
                    format!("unknown gap priority '{}'", &captures[1]),
                )
                .with_details(json!({
                    "perspective_id": entry.perspective_id,
                    "line": line,
                }))
            })?;
            ordinal += 1;
            gaps.push(PivotGap {
                gap_id: format!("gap_{}_{}", entry.perspective_id, ordinal),
                perspective_id: entry.perspective_id.clone(),
                ordinal,
                priority,
                description: captures[2].trim().to_string(),
            });
        }
    }

    gaps.sort_by(|a, b| {
        (a.priority, &a.perspective_id, a.ordinal).cmp(&(b.priority, &b.perspective_id, b.ordinal))
    });

    let wave2_required = gaps.iter().any(|gap| gap.priority == GapPriority::P0);
    let wave2_gap_ids: Vec<String> = if wave2_required {
        gaps.iter()
            .take(limits.max_wave2_agents as usize)
            .map(|gap| gap.gap_id.clone())
            .collect()
    } else {
        Vec::new()
    };

    let document = PivotDocument {
        schema_version: pivot_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        wave1: PivotWave1 { outputs },
        gaps,
        decision: PivotDecision {
            wave2_required,
            wave2_gap_ids,
            rule_hit: if wave2_required {
                RULE_WAVE2_REQUIRED_P0.to_string()
            } else {
                RULE_WAVE2_NOT_REQUIRED.to_string()
            },
        },
    };
    let pivot_path = resolve_inside_root(run_root, PIVOT_FILE)?;
    write_json_document(&pivot_path, &document)?;
    Ok(document)
}

/// Loads a previously written pivot document.
pub fn load_pivot(run_root: &Path) -> EngineResult<PivotDocument> {
    let path = resolve_inside_root(run_root, PIVOT_FILE)?;
    sonar_core::read_json_document(&path)
}
