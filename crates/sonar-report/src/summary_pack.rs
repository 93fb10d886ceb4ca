use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_citations::{normalize_url, UrlMapDocument};
use sonar_core::{
    cid_for_url, resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode,
};
use sonar_state::RunLimits;
use sonar_wave::split_sections;

/// Summary pack location inside a run root.
pub const SUMMARY_PACK_FILE: &str = "summaries/summary-pack.json";
/// Schema tag carried by the summary pack.
pub const SUMMARY_PACK_SCHEMA_VERSION: &str = "summary_pack.v1";

fn summary_pack_schema_version() -> String {
    SUMMARY_PACK_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One bounded, citation-keyed summary.
pub struct SummaryEntry {
    pub perspective_id: String,
    pub title: String,
    pub body: String,
    pub citations: Vec<String>,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Budgets recorded with the pack.
pub struct SummaryPackLimits {
    pub max_summary_kb: u64,
    pub max_total_summary_kb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The bounded summary pack consumed by synthesis.
pub struct SummaryPackDocument {
    #[serde(default = "summary_pack_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub mode: String,
    pub generated_at: String,
    pub summaries: Vec<SummaryEntry>,
    pub total_estimated_tokens: usize,
    pub limits: SummaryPackLimits,
}

/// Builds the summary pack from compliant wave outputs.
///
/// Bodies come from each output's `Findings` section, truncated to the
/// per-summary budget; every summary carries its sources as `[@cid_…]`
/// mentions derived through the URL map.
pub fn summary_pack_build(
    run_root: &Path,
    run_id: &str,
    mode: &str,
    url_map: &UrlMapDocument,
    limits: &RunLimits,
    include_wave2: bool,
    now_iso: &str,
) -> EngineResult<SummaryPackDocument> {
    let mut cid_by_normalized: BTreeMap<&str, &str> = BTreeMap::new();
    for item in &url_map.items {
        cid_by_normalized.insert(item.normalized_url.as_str(), item.cid.as_str());
    }

    let mut dirs = vec!["wave-1"];
    if include_wave2 {
        dirs.push("wave-2");
    }

    let per_summary_budget = (limits.max_summary_kb * 1024) as usize;
    let mut summaries = Vec::new();
    for dir_rel in dirs {
        let dir = resolve_inside_root(run_root, dir_rel)?;
        if !dir.is_dir() {
            continue;
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to list {dir_rel}: {error}"),
                )
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".md"))
            .collect();
        names.sort();

        for name in names {
            let perspective_id = name.trim_end_matches(".md").to_string();
            let markdown = std::fs::read_to_string(dir.join(&name)).map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to read {dir_rel}/{name}: {error}"),
                )
            })?;
            let sections = split_sections(&markdown);
            let findings = sections.get("Findings").map(String::as_str).unwrap_or("");
            let sources = sections.get("Sources").map(String::as_str).unwrap_or("");

            let mut cids: Vec<String> = Vec::new();
            for line in sources.lines() {
                let Some(raw_url) = line.trim().strip_prefix("- ") else {
                    continue;
                };
                let Ok(normalized) = normalize_url(raw_url) else {
                    continue;
                };
                let cid = cid_by_normalized
                    .get(normalized.as_str())
                    .map(|cid| (*cid).to_string())
                    .unwrap_or_else(|| cid_for_url(&normalized));
                if !cids.contains(&cid) {
                    cids.push(cid);
                }
            }

            let mentions = cids
                .iter()
                .map(|cid| format!("[@{cid}]"))
                .collect::<Vec<_>>()
                .join(" ");
            // Findings text yields to the citation tail when the budget
            // is tight; the mentions must survive truncation.
            let tail = if mentions.is_empty() {
                String::new()
            } else {
                format!("\n\nEvidence: {mentions}")
            };
            let findings_budget = per_summary_budget.saturating_sub(tail.len());
            let body = format!(
                "{}{tail}",
                truncate_to_budget(findings.trim(), findings_budget)
            );

            let estimated_tokens = estimate_tokens(&body);
            summaries.push(SummaryEntry {
                perspective_id: perspective_id.clone(),
                title: perspective_id,
                body,
                citations: cids,
                estimated_tokens,
            });
        }
    }

    let document = SummaryPackDocument {
        schema_version: summary_pack_schema_version(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        generated_at: now_iso.to_string(),
        total_estimated_tokens: summaries.iter().map(|entry| entry.estimated_tokens).sum(),
        summaries,
        limits: SummaryPackLimits {
            max_summary_kb: limits.max_summary_kb,
            max_total_summary_kb: limits.max_total_summary_kb,
        },
    };
    validate_summary_pack(&document)?;
    write_json_document(&resolve_inside_root(run_root, SUMMARY_PACK_FILE)?, &document)?;
    Ok(document)
}

/// Validates pack invariants: every summary carries at least one
/// `[@cid_…]` mention, no raw URL survives in a body, and both size
/// budgets hold.
pub fn validate_summary_pack(document: &SummaryPackDocument) -> EngineResult<()> {
    let mention = Regex::new(r"\[@cid_[0-9a-f]+\]").map_err(internal_regex)?;
    let raw_url = Regex::new(r"https?://").map_err(internal_regex)?;
    let per_summary_budget = (document.limits.max_summary_kb * 1024) as usize;
    let total_budget = (document.limits.max_total_summary_kb * 1024) as usize;

    let mut total_bytes = 0;
    for entry in &document.summaries {
        if !mention.is_match(&entry.body) {
            return Err(EngineError::new(
                ErrorCode::InvalidArgs,
                format!(
                    "summary '{}' carries no [@cid_...] citation mention",
                    entry.perspective_id
                ),
            )
            .with_details(json!({ "perspective_id": entry.perspective_id })));
        }
        if raw_url.is_match(&entry.body) {
            return Err(EngineError::new(
                ErrorCode::RawUrlNotAllowed,
                format!("summary '{}' embeds a raw URL", entry.perspective_id),
            )
            .with_details(json!({ "perspective_id": entry.perspective_id })));
        }
        if entry.body.len() > per_summary_budget {
            return Err(EngineError::new(
                ErrorCode::InvalidArgs,
                format!(
                    "summary '{}' exceeds the {}KB budget",
                    entry.perspective_id, document.limits.max_summary_kb
                ),
            )
            .with_details(json!({
                "perspective_id": entry.perspective_id,
                "bytes": entry.body.len(),
            })));
        }
        total_bytes += entry.body.len();
    }
    if total_bytes > total_budget {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            format!(
                "summary pack exceeds the {}KB total budget",
                document.limits.max_total_summary_kb
            ),
        )
        .with_details(json!({ "bytes": total_bytes })));
    }
    Ok(())
}

/// Loads a previously written summary pack.
pub fn load_summary_pack(run_root: &Path) -> EngineResult<SummaryPackDocument> {
    let path = resolve_inside_root(run_root, SUMMARY_PACK_FILE)?;
    sonar_core::read_json_document(&path)
}

fn truncate_to_budget(body: &str, budget_bytes: usize) -> String {
    if body.len() <= budget_bytes {
        return body.to_string();
    }
    let mut cut = budget_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body[..cut].to_string()
}

fn estimate_tokens(body: &str) -> usize {
    body.len().div_ceil(4)
}

fn internal_regex(error: regex::Error) -> EngineError {
    EngineError::new(ErrorCode::Internal, format!("invalid regex: {error}"))
}

#[cfg(test)]
mod tests {
    use sonar_core::{write_text_atomic, ErrorCode};
    use sonar_state::RunLimits;

    use super::{load_summary_pack, summary_pack_build, validate_summary_pack};

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn seed_output(root: &std::path::Path, rel: &str, findings: &str, sources: &[&str]) {
        let mut bullets = String::new();
        for source in sources {
            bullets.push_str("- ");
            bullets.push_str(source);
            bullets.push('\n');
        }
        let markdown = format!("## Findings\n{findings}\n\n## Sources\n{bullets}\n## Gaps\n");
        write_text_atomic(&root.join(rel), &markdown).expect("seed output");
    }

    fn url_map(root: &std::path::Path, urls: &[&str]) -> sonar_citations::UrlMapDocument {
        let urls: Vec<String> = urls.iter().map(|url| url.to_string()).collect();
        sonar_citations::citations_normalize(root, &urls).expect("url map")
    }

    #[test]
    fn functional_pack_builds_with_cid_mentions_and_budgets() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        seed_output(
            tempdir.path(),
            "wave-1/p1.md",
            "Deployments doubled since 2024.",
            &["https://example.com/a"],
        );
        seed_output(
            tempdir.path(),
            "wave-1/p2.md",
            "Subsidies lapse next year.",
            &["https://example.com/b"],
        );
        let map = url_map(
            tempdir.path(),
            &["https://example.com/a", "https://example.com/b"],
        );

        let pack = summary_pack_build(
            tempdir.path(),
            "run-001",
            "standard",
            &map,
            &RunLimits::default(),
            false,
            NOW,
        )
        .expect("pack should build");
        assert_eq!(pack.summaries.len(), 2);
        assert_eq!(pack.summaries[0].perspective_id, "p1");
        assert!(pack.summaries[0].body.contains("[@cid_"));
        assert_eq!(pack.summaries[0].citations.len(), 1);
        assert!(pack.total_estimated_tokens > 0);
        assert_eq!(load_summary_pack(tempdir.path()).expect("reload"), pack);
    }

    #[test]
    fn regression_raw_url_in_summary_body_is_rejected() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        seed_output(
            tempdir.path(),
            "wave-1/p1.md",
            "See https://example.com/a for details.",
            &["https://example.com/a"],
        );
        let map = url_map(tempdir.path(), &["https://example.com/a"]);
        let error = summary_pack_build(
            tempdir.path(),
            "run-001",
            "standard",
            &map,
            &RunLimits::default(),
            false,
            NOW,
        )
        .expect_err("raw url should fail");
        assert_eq!(error.code, ErrorCode::RawUrlNotAllowed);
    }

    #[test]
    fn regression_summary_without_mentions_fails_validation() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        seed_output(tempdir.path(), "wave-1/p1.md", "No sources cited.", &[]);
        let map = url_map(tempdir.path(), &[]);
        let error = summary_pack_build(
            tempdir.path(),
            "run-001",
            "standard",
            &map,
            &RunLimits::default(),
            false,
            NOW,
        )
        .expect_err("mention-free summary should fail");
        assert!(error.message.contains("citation mention"));
    }

    #[test]
    fn functional_bodies_are_truncated_to_the_per_summary_budget() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let long_findings = "evidence ".repeat(400);
        seed_output(
            tempdir.path(),
            "wave-1/p1.md",
            &long_findings,
            &["https://example.com/a"],
        );
        let map = url_map(tempdir.path(), &["https://example.com/a"]);
        let limits = RunLimits {
            max_summary_kb: 1,
            ..RunLimits::default()
        };
        let pack = summary_pack_build(
            tempdir.path(),
            "run-001",
            "deep",
            &map,
            &limits,
            false,
            NOW,
        )
        .expect("pack should build");
        assert!(pack.summaries[0].body.len() <= 1024);
        validate_summary_pack(&pack).expect("pack should validate");
    }
}
