use std::collections::BTreeSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_citations::{CitationRecord, CitationStatus};
use sonar_core::{resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};
use sonar_state::GateStatus;

use crate::synthesis::REQUIRED_SYNTHESIS_SECTIONS;

/// Gate E report locations inside a run root.
pub const GATE_E_STATUS_FILE: &str = "reports/gate-e-status.json";
pub const GATE_E_NUMERIC_CLAIMS_FILE: &str = "reports/gate-e-numeric-claims.json";
pub const GATE_E_SECTIONS_FILE: &str = "reports/gate-e-sections-present.json";
pub const GATE_E_UTILIZATION_FILE: &str = "reports/gate-e-citation-utilization.json";

/// Soft warning labels.
pub const WARN_HIGH_DUPLICATE_CITATION_RATE: &str = "HIGH_DUPLICATE_CITATION_RATE";
pub const WARN_LOW_CITATION_UTILIZATION: &str = "LOW_CITATION_UTILIZATION";

/// Soft thresholds.
pub const MAX_DUPLICATE_CITATION_RATE: f64 = 0.2;
pub const MIN_CITATION_UTILIZATION_RATE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Gate E metrics; `gate_e_evaluate` and `gate_e_reports` always emit
/// identical values for every key here.
pub struct GateEMetrics {
    pub uncited_numeric_claims: usize,
    pub total_numeric_claims: usize,
    /// Percent (0..100) of required report sections present.
    pub report_sections_present: u32,
    pub duplicate_citation_rate: f64,
    pub citation_utilization_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
/// One numeric claim as surfaced in the claims report.
pub struct NumericClaim {
    pub sentence: String,
    pub cited: bool,
}

#[derive(Debug, Clone, PartialEq)]
/// Gate E verdict: hard metrics decide status, soft metrics only warn.
pub struct GateEEvaluation {
    pub status: GateStatus,
    pub metrics: GateEMetrics,
    pub warnings: Vec<String>,
    pub missing_sections: Vec<String>,
    pub claims: Vec<NumericClaim>,
}

/// Evaluates Gate E from the final synthesis and the validated pool.
///
/// Hard: every numeric claim is cited in its own sentence and all
/// required sections are present. Soft: duplicate-mention and
/// utilization rates only produce warnings.
pub fn gate_e_evaluate(
    synthesis_markdown: &str,
    citations: &[CitationRecord],
) -> EngineResult<GateEEvaluation> {
    let mention = Regex::new(r"\[@(cid_[0-9a-f]+)\]").map_err(internal_regex)?;
    let numeric = Regex::new(r"(\d+(\.\d+)?%?)|([$€£]\s?\d)").map_err(internal_regex)?;

    let mut missing_sections = Vec::new();
    for section in REQUIRED_SYNTHESIS_SECTIONS {
        let heading = format!("## {section}");
        if !synthesis_markdown.contains(&heading) {
            missing_sections.push(section.to_string());
        }
    }
    let present = REQUIRED_SYNTHESIS_SECTIONS.len() - missing_sections.len();
    let report_sections_present =
        (present * 100 / REQUIRED_SYNTHESIS_SECTIONS.len()) as u32;

    let mut claims = Vec::new();
    let mut uncited_numeric_claims = 0;
    for sentence in split_sentences(synthesis_markdown) {
        let cited = mention.is_match(&sentence);
        // Mentions are stripped first: cid hex digits are not numeric
        // claims.
        let stripped = mention.replace_all(&sentence, "");
        if numeric.is_match(&stripped) {
            if !cited {
                uncited_numeric_claims += 1;
            }
            claims.push(NumericClaim {
                sentence: sentence.trim().to_string(),
                cited,
            });
        }
    }

    let mentions: Vec<String> = mention
        .captures_iter(synthesis_markdown)
        .map(|captures| captures[1].to_string())
        .collect();
    let unique_mentions: BTreeSet<&str> = mentions.iter().map(String::as_str).collect();
    let duplicate_citation_rate = if mentions.is_empty() {
        0.0
    } else {
        (mentions.len() - unique_mentions.len()) as f64 / mentions.len() as f64
    };

    // Paywalled counts as validated for utilization purposes.
    let validated: BTreeSet<&str> = citations
        .iter()
        .filter(|record| {
            matches!(
                record.status,
                CitationStatus::Valid | CitationStatus::Paywalled
            )
        })
        .map(|record| record.cid.as_str())
        .collect();
    let used_validated = unique_mentions
        .iter()
        .filter(|cid| validated.contains(**cid))
        .count();
    let citation_utilization_rate = if validated.is_empty() {
        1.0
    } else {
        used_validated as f64 / validated.len() as f64
    };

    let mut warnings = Vec::new();
    if duplicate_citation_rate > MAX_DUPLICATE_CITATION_RATE {
        warnings.push(WARN_HIGH_DUPLICATE_CITATION_RATE.to_string());
    }
    if citation_utilization_rate < MIN_CITATION_UTILIZATION_RATE {
        warnings.push(WARN_LOW_CITATION_UTILIZATION.to_string());
    }

    let pass = uncited_numeric_claims == 0 && report_sections_present == 100;
    Ok(GateEEvaluation {
        status: if pass { GateStatus::Pass } else { GateStatus::Fail },
        metrics: GateEMetrics {
            uncited_numeric_claims,
            total_numeric_claims: claims.len(),
            report_sections_present,
            duplicate_citation_rate,
            citation_utilization_rate,
        },
        warnings,
        missing_sections,
        claims,
    })
}

/// Persists the four Gate E report documents. Metric values are the
/// evaluation's values, verbatim.
pub fn gate_e_reports(
    run_root: &Path,
    evaluation: &GateEEvaluation,
    now_iso: &str,
) -> EngineResult<()> {
    write_json_document(
        &resolve_inside_root(run_root, GATE_E_STATUS_FILE)?,
        &json!({
            "generated_at": now_iso,
            "status": status_str(evaluation.status),
            "metrics_summary": evaluation.metrics,
            "warnings": evaluation.warnings,
        }),
    )?;
    write_json_document(
        &resolve_inside_root(run_root, GATE_E_NUMERIC_CLAIMS_FILE)?,
        &json!({
            "generated_at": now_iso,
            "uncited_numeric_claims": evaluation.metrics.uncited_numeric_claims,
            "total_numeric_claims": evaluation.metrics.total_numeric_claims,
            "claims": evaluation.claims,
        }),
    )?;
    write_json_document(
        &resolve_inside_root(run_root, GATE_E_SECTIONS_FILE)?,
        &json!({
            "generated_at": now_iso,
            "report_sections_present": evaluation.metrics.report_sections_present,
            "missing_sections": evaluation.missing_sections,
        }),
    )?;
    write_json_document(
        &resolve_inside_root(run_root, GATE_E_UTILIZATION_FILE)?,
        &json!({
            "generated_at": now_iso,
            "citation_utilization_rate": evaluation.metrics.citation_utilization_rate,
            "duplicate_citation_rate": evaluation.metrics.duplicate_citation_rate,
            "warnings": evaluation.warnings,
        }),
    )?;
    Ok(())
}

fn status_str(status: GateStatus) -> &'static str {
    status.as_str()
}

/// Splits body text into sentences; headings and blank lines are
/// boundaries too.
fn split_sentences(markdown: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in markdown.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut current = String::new();
        for chunk in line.split_inclusive(['.', '!', '?']) {
            current.push_str(chunk);
            if current.ends_with(['.', '!', '?']) {
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current = String::new();
            }
        }
        let leftover = current.trim();
        if !leftover.is_empty() {
            sentences.push(leftover.to_string());
        }
    }
    sentences
}

fn internal_regex(error: regex::Error) -> EngineError {
    EngineError::new(ErrorCode::Internal, format!("invalid regex: {error}"))
}

#[cfg(test)]
mod tests {
    use sonar_citations::{CitationRecord, CitationStatus};
    use sonar_state::GateStatus;

    use super::{gate_e_evaluate, gate_e_reports};

    fn pool(cids: &[(&str, CitationStatus)]) -> Vec<CitationRecord> {
        cids.iter()
            .map(|(cid, status)| CitationRecord {
                cid: cid.to_string(),
                normalized_url: format!("https://example.com/{cid}"),
                status: *status,
                title: None,
                publisher: None,
                notes: String::new(),
            })
            .collect()
    }

    fn full_synthesis(body: &str) -> String {
        format!(
            "# Synthesis\n\n## Summary\n{body}\n\n## Key Findings\n- point [@cid_aa]\n\n\
             ## Evidence\n- [@cid_aa] (valid)\n\n## Caveats\n- none\n"
        )
    }

    #[test]
    fn regression_uncited_numeric_claim_fails_the_gate() {
        let evaluation = gate_e_evaluate(
            &full_synthesis("Revenue grew 20%. The market is stable."),
            &pool(&[("cid_aa", CitationStatus::Valid)]),
        )
        .expect("evaluation should run");
        assert_eq!(evaluation.status, GateStatus::Fail);
        assert!(evaluation.metrics.uncited_numeric_claims >= 1);
        let claim = evaluation
            .claims
            .iter()
            .find(|claim| claim.sentence.contains("20%"))
            .expect("claim surfaced");
        assert!(!claim.cited);
    }

    #[test]
    fn functional_cited_numeric_claims_pass() {
        let evaluation = gate_e_evaluate(
            &full_synthesis("Revenue grew 20% [@cid_aa]."),
            &pool(&[("cid_aa", CitationStatus::Valid)]),
        )
        .expect("evaluation should run");
        assert_eq!(evaluation.status, GateStatus::Pass);
        assert_eq!(evaluation.metrics.uncited_numeric_claims, 0);
        assert_eq!(evaluation.metrics.report_sections_present, 100);
    }

    #[test]
    fn regression_missing_section_drops_the_presence_percent() {
        let markdown = "# Synthesis\n\n## Summary\nFine text.\n\n## Key Findings\n- a [@cid_aa]\n\n## Evidence\n- [@cid_aa]\n";
        let evaluation = gate_e_evaluate(markdown, &pool(&[("cid_aa", CitationStatus::Valid)]))
            .expect("evaluation should run");
        assert_eq!(evaluation.status, GateStatus::Fail);
        assert_eq!(evaluation.metrics.report_sections_present, 75);
        assert_eq!(evaluation.missing_sections, vec!["Caveats".to_string()]);
    }

    #[test]
    fn functional_soft_warnings_do_not_flip_a_passing_status() {
        // One of two validated cids used => utilization 0.5 is not yet a
        // warning; duplicates of the same mention are.
        let markdown = "# Synthesis\n\n## Summary\nStable [@cid_aa] [@cid_aa] [@cid_aa].\n\n\
                        ## Key Findings\n- a [@cid_aa]\n\n## Evidence\n- [@cid_aa]\n\n## Caveats\n- none\n";
        let evaluation = gate_e_evaluate(
            markdown,
            &pool(&[
                ("cid_aa", CitationStatus::Valid),
                ("cid_bb", CitationStatus::Paywalled),
            ]),
        )
        .expect("evaluation should run");
        assert_eq!(evaluation.status, GateStatus::Pass);
        assert!(evaluation
            .warnings
            .contains(&"HIGH_DUPLICATE_CITATION_RATE".to_string()));
        assert_eq!(evaluation.metrics.citation_utilization_rate, 0.5);
        assert!(!evaluation
            .warnings
            .contains(&"LOW_CITATION_UTILIZATION".to_string()));
    }

    #[test]
    fn functional_reports_carry_identical_metric_values() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let evaluation = gate_e_evaluate(
            &full_synthesis("Revenue grew 20% [@cid_aa]."),
            &pool(&[("cid_aa", CitationStatus::Valid)]),
        )
        .expect("evaluation should run");
        gate_e_reports(tempdir.path(), &evaluation, "2026-03-01T10:00:00Z")
            .expect("reports should write");

        let status: serde_json::Value =
            sonar_core::read_json_document(&tempdir.path().join("reports/gate-e-status.json"))
                .expect("status report");
        let claims: serde_json::Value = sonar_core::read_json_document(
            &tempdir.path().join("reports/gate-e-numeric-claims.json"),
        )
        .expect("claims report");
        let sections: serde_json::Value = sonar_core::read_json_document(
            &tempdir.path().join("reports/gate-e-sections-present.json"),
        )
        .expect("sections report");
        let utilization: serde_json::Value = sonar_core::read_json_document(
            &tempdir.path().join("reports/gate-e-citation-utilization.json"),
        )
        .expect("utilization report");

        let summary = &status["metrics_summary"];
        assert_eq!(
            summary["uncited_numeric_claims"],
            claims["uncited_numeric_claims"]
        );
        assert_eq!(
            summary["total_numeric_claims"],
            claims["total_numeric_claims"]
        );
        assert_eq!(
            summary["report_sections_present"],
            sections["report_sections_present"]
        );
        assert_eq!(
            summary["citation_utilization_rate"],
            utilization["citation_utilization_rate"]
        );
        assert_eq!(
            summary["duplicate_citation_rate"],
            utilization["duplicate_citation_rate"]
        );
    }
}
