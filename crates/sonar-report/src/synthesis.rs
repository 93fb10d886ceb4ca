use std::collections::BTreeSet;
use std::path::Path;

use regex::Regex;
use serde_json::json;
use sonar_citations::{CitationRecord, CitationStatus};
use sonar_core::{resolve_inside_root, write_text_atomic, EngineError, EngineResult, ErrorCode};

use crate::summary_pack::SummaryPackDocument;

/// Draft synthesis location inside a run root.
pub const DRAFT_SYNTHESIS_FILE: &str = "synthesis/draft-synthesis.md";
/// Final synthesis location inside a run root.
pub const FINAL_SYNTHESIS_FILE: &str = "synthesis/final-synthesis.md";

/// Sections every synthesis document carries, in order.
pub const REQUIRED_SYNTHESIS_SECTIONS: [&str; 4] = ["Summary", "Key Findings", "Evidence", "Caveats"];

#[derive(Debug, Clone, PartialEq, Eq)]
/// Section bodies for one synthesis document.
pub struct SynthesisSections {
    pub summary: String,
    pub key_findings: String,
    pub evidence: String,
    pub caveats: String,
}

/// Composes the synthesis document and persists it after checking every
/// `[@cid_…]` reference against the validated pool.
pub fn synthesis_write(
    run_root: &Path,
    final_doc: bool,
    sections: &SynthesisSections,
    citations: &[CitationRecord],
) -> EngineResult<String> {
    let markdown = format!(
        "# Synthesis\n\n\
         ## Summary\n{summary}\n\n\
         ## Key Findings\n{key_findings}\n\n\
         ## Evidence\n{evidence}\n\n\
         ## Caveats\n{caveats}\n",
        summary = sections.summary.trim(),
        key_findings = sections.key_findings.trim(),
        evidence = sections.evidence.trim(),
        caveats = sections.caveats.trim(),
    );
    ensure_known_cids(&markdown, citations)?;

    let rel = if final_doc {
        FINAL_SYNTHESIS_FILE
    } else {
        DRAFT_SYNTHESIS_FILE
    };
    write_text_atomic(&resolve_inside_root(run_root, rel)?, &markdown)
        .map_err(EngineError::from)?;
    Ok(markdown)
}

/// Fails with `UNKNOWN_CID` when the document references a cid missing
/// from the pool.
pub fn ensure_known_cids(markdown: &str, citations: &[CitationRecord]) -> EngineResult<()> {
    let mention = Regex::new(r"\[@(cid_[0-9a-f]+)\]").map_err(|error| {
        EngineError::new(ErrorCode::Internal, format!("invalid mention regex: {error}"))
    })?;
    let known: BTreeSet<&str> = citations.iter().map(|record| record.cid.as_str()).collect();
    for captures in mention.captures_iter(markdown) {
        let cid = &captures[1];
        if !known.contains(cid) {
            return Err(EngineError::new(
                ErrorCode::UnknownCid,
                format!("reference {cid} is not in the validated citation pool"),
            )
            .with_details(json!({ "cid": cid })));
        }
    }
    Ok(())
}

/// Derives deterministic synthesis sections from the summary pack.
pub fn synthesis_build_from_pack(
    pack: &SummaryPackDocument,
    citations: &[CitationRecord],
) -> SynthesisSections {
    let mut summary_lines = Vec::new();
    let mut finding_lines = Vec::new();
    let mut used_cids: Vec<&str> = Vec::new();
    for entry in &pack.summaries {
        let first_line = entry
            .body
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim();
        let mentions = entry
            .citations
            .iter()
            .map(|cid| format!("[@{cid}]"))
            .collect::<Vec<_>>()
            .join(" ");
        // Citations go inside the sentence, before its final period, so
        // the report gate's numeric-claim check sees them as cited.
        let stem = first_line.trim_end_matches(['.', '!', '?']).trim_end();
        if mentions.is_empty() {
            summary_lines.push(format!("- {}: {stem}.", entry.perspective_id));
            finding_lines.push(format!("- {stem}."));
        } else {
            summary_lines.push(format!("- {}: {stem} {mentions}.", entry.perspective_id));
            finding_lines.push(format!("- {stem} {mentions}."));
        }
        for cid in &entry.citations {
            if !used_cids.contains(&cid.as_str()) {
                used_cids.push(cid);
            }
        }
    }

    let mut evidence_lines = Vec::new();
    for cid in &used_cids {
        let status = citations
            .iter()
            .find(|record| record.cid == **cid)
            .map(|record| record.status.as_str())
            .unwrap_or("unvalidated");
        evidence_lines.push(format!("- [@{cid}] ({status})"));
    }

    let paywalled = citations
        .iter()
        .filter(|record| record.status == CitationStatus::Paywalled)
        .count();
    let mut caveat_lines =
        vec!["- Findings reflect sources available at validation time.".to_string()];
    if paywalled > 0 {
        caveat_lines.push(
            "- Some sources are paywalled and were validated by metadata only.".to_string(),
        );
    }

    SynthesisSections {
        summary: summary_lines.join("\n"),
        key_findings: finding_lines.join("\n"),
        evidence: evidence_lines.join("\n"),
        caveats: caveat_lines.join("\n"),
    }
}

/// Reads a synthesis document from the run root.
pub fn load_synthesis(run_root: &Path, final_doc: bool) -> EngineResult<String> {
    let rel = if final_doc {
        FINAL_SYNTHESIS_FILE
    } else {
        DRAFT_SYNTHESIS_FILE
    };
    let path = resolve_inside_root(run_root, rel)?;
    std::fs::read_to_string(&path).map_err(|error| {
        EngineError::new(
            ErrorCode::MissingArtifact,
            format!("synthesis document {rel} is unreadable: {error}"),
        )
        .with_details(json!({ "file": rel }))
    })
}

#[cfg(test)]
mod tests {
    use sonar_citations::{CitationRecord, CitationStatus};
    use sonar_core::ErrorCode;

    use super::{synthesis_write, SynthesisSections};

    fn pool(cids: &[&str]) -> Vec<CitationRecord> {
        cids.iter()
            .map(|cid| CitationRecord {
                cid: cid.to_string(),
                normalized_url: format!("https://example.com/{cid}"),
                status: CitationStatus::Valid,
                title: None,
                publisher: None,
                notes: String::new(),
            })
            .collect()
    }

    fn sections(evidence: &str) -> SynthesisSections {
        SynthesisSections {
            summary: "One line overview.".to_string(),
            key_findings: "- Deployments doubled [@cid_aa]".to_string(),
            evidence: evidence.to_string(),
            caveats: "- Sources are recent.".to_string(),
        }
    }

    #[test]
    fn functional_synthesis_writes_sections_in_order() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let markdown = synthesis_write(
            tempdir.path(),
            true,
            &sections("- [@cid_aa] (valid)"),
            &pool(&["cid_aa"]),
        )
        .expect("synthesis should write");

        let summary_at = markdown.find("## Summary").expect("summary");
        let findings_at = markdown.find("## Key Findings").expect("key findings");
        let evidence_at = markdown.find("## Evidence").expect("evidence");
        let caveats_at = markdown.find("## Caveats").expect("caveats");
        assert!(summary_at < findings_at && findings_at < evidence_at && evidence_at < caveats_at);
        assert!(tempdir.path().join("synthesis/final-synthesis.md").exists());
    }

    #[test]
    fn regression_unknown_cid_reference_is_rejected() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = synthesis_write(
            tempdir.path(),
            false,
            &sections("- [@cid_beef] (valid)"),
            &pool(&["cid_aa"]),
        )
        .expect_err("unknown cid should fail");
        assert_eq!(error.code, ErrorCode::UnknownCid);
        assert_eq!(error.details["cid"], serde_json::json!("cid_beef"));
        assert!(!tempdir.path().join("synthesis/draft-synthesis.md").exists());
    }
}
