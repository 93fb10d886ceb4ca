use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{
    resolve_inside_root, write_json_document, write_text_atomic, EngineError, EngineResult,
    ErrorCode,
};

use crate::perspectives::{Perspective, PerspectivesDocument};
use crate::plan::{plan_entry_prompt_digest, WavePlanDocument, WavePlanEntry};

/// Schema tag carried by every wave output sidecar.
pub const WAVE_OUTPUT_META_SCHEMA_VERSION: &str = "wave-output-meta.v1";

/// Sections every wave output must carry, in order of appearance.
pub const REQUIRED_OUTPUT_SECTIONS: [&str; 3] = ["Findings", "Sources", "Gaps"];

fn wave_output_meta_schema_version() -> String {
    WAVE_OUTPUT_META_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Sidecar metadata written next to each ingested wave output.
pub struct WaveOutputMeta {
    #[serde(default = "wave_output_meta_schema_version")]
    pub schema_version: String,
    pub perspective_id: String,
    pub agent_type: String,
    pub output_md: String,
    pub prompt_digest: String,
    pub agent_run_id: String,
    pub created_at: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_input_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One driver-produced markdown result awaiting ingest.
pub struct AgentResult {
    pub perspective_id: String,
    pub markdown: String,
    pub agent_run_id: String,
    /// Set for wave-2 results; matches the plan entry's gap id.
    pub gap_id: Option<String>,
    /// Digest the driver claims it was prompted with; a mismatch with
    /// the plan's prompt is a safety fault.
    pub prompt_digest: Option<String>,
    pub source_input_path: Option<String>,
}

impl AgentResult {
    fn key(&self) -> &str {
        self.gap_id.as_deref().unwrap_or(&self.perspective_id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Contract statistics for one validated output.
pub struct WaveOutputStats {
    pub words: usize,
    pub sources_count: usize,
}

/// Validates one markdown output against its perspective's contract.
pub fn wave_output_validate(
    perspective: &Perspective,
    markdown: &str,
) -> EngineResult<WaveOutputStats> {
    let sections = split_sections(markdown);
    for required in REQUIRED_OUTPUT_SECTIONS {
        if !sections.contains_key(required) {
            return Err(EngineError::new(
                ErrorCode::MissingRequiredSection,
                format!(
                    "output for '{}' is missing the {required} section",
                    perspective.id
                ),
            )
            .with_details(json!({
                "perspective_id": perspective.id,
                "section": required,
            })));
        }
    }

    let source_line = Regex::new(r"^- https?://\S+$").map_err(|error| {
        EngineError::new(ErrorCode::Internal, format!("invalid sources regex: {error}"))
    })?;
    let sources_section = sections.get("Sources").map(String::as_str).unwrap_or("");
    let mut sources_count = 0;
    for line in sources_section.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if !source_line.is_match(line) {
            return Err(EngineError::new(
                ErrorCode::MalformedSources,
                format!("source line is not a '- https://...' bullet: '{line}'"),
            )
            .with_details(json!({
                "perspective_id": perspective.id,
                "line": line,
            })));
        }
        sources_count += 1;
    }
    let max_sources = perspective.prompt_contract.max_sources;
    if sources_count > max_sources {
        return Err(EngineError::new(
            ErrorCode::TooManySources,
            format!("output lists {sources_count} sources, contract allows {max_sources}"),
        )
        .with_details(json!({
            "perspective_id": perspective.id,
            "count": sources_count,
            "max": max_sources,
        })));
    }

    let words = markdown.split_whitespace().count();
    let max_words = perspective.prompt_contract.max_words;
    if words > max_words {
        return Err(EngineError::new(
            ErrorCode::TooManyWords,
            format!("output has {words} words, contract allows {max_words}"),
        )
        .with_details(json!({
            "perspective_id": perspective.id,
            "count": words,
            "max": max_words,
        })));
    }

    Ok(WaveOutputStats {
        words,
        sources_count,
    })
}

/// Splits a markdown document into `## <name>` sections.
pub fn split_sections(markdown: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in markdown.lines() {
        if let Some(name) = line.strip_prefix("## ") {
            if let Some((name, body)) = current.take() {
                sections.insert(name, body.join("\n"));
            }
            current = Some((name.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current.take() {
        sections.insert(name, body.join("\n"));
    }
    sections
}

/// Inputs for one transactional ingest batch.
#[derive(Debug, Clone)]
pub struct WaveIngestRequest<'a> {
    pub run_root: &'a Path,
    pub plan: &'a WavePlanDocument,
    pub perspectives: &'a PerspectivesDocument,
    pub results: &'a [AgentResult],
    pub retry_count: u32,
    pub now_iso: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Files written by a successful ingest.
pub struct WaveIngestOutcome {
    pub written: Vec<String>,
}

/// Ingests a batch of wave outputs transactionally: every result is
/// validated against its plan entry and perspective contract before any
/// file is written, so a failing batch leaves the wave directory
/// untouched.
pub fn wave_output_ingest(request: &WaveIngestRequest<'_>) -> EngineResult<WaveIngestOutcome> {
    struct Staged<'a> {
        entry: &'a WavePlanEntry,
        result: &'a AgentResult,
        prompt_digest: String,
    }

    let mut staged: Vec<Staged<'_>> = Vec::with_capacity(request.results.len());
    for result in request.results {
        let entry = request
            .plan
            .entries
            .iter()
            .find(|entry| entry.key() == result.key())
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::PerspectiveNotFound,
                    format!("result '{}' has no plan entry", result.key()),
                )
                .with_details(json!({ "perspective_id": result.perspective_id }))
            })?;
        let perspective = request
            .perspectives
            .find(&entry.perspective_id)
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::PerspectiveNotFound,
                    format!("perspective '{}' is not in the roster", entry.perspective_id),
                )
                .with_details(json!({ "perspective_id": entry.perspective_id }))
            })?;

        let prompt_digest = plan_entry_prompt_digest(request.run_root, entry)?;
        if let Some(claimed) = result.prompt_digest.as_deref() {
            if claimed != prompt_digest {
                return Err(EngineError::new(
                    ErrorCode::AgentResultPromptDigestConflict,
                    format!(
                        "result '{}' was produced for a different prompt",
                        result.key()
                    ),
                )
                .with_details(json!({
                    "perspective_id": entry.perspective_id,
                    "expected": prompt_digest,
                    "claimed": claimed,
                })));
            }
        }

        wave_output_validate(perspective, &result.markdown)?;
        staged.push(Staged {
            entry,
            result,
            prompt_digest,
        });
    }

    // Validation passed for the whole batch; now commit every file.
    let mut written = Vec::with_capacity(staged.len() * 2);
    for item in &staged {
        let output_rel = item.entry.output_md.as_str();
        let output_path = resolve_inside_root(request.run_root, output_rel)?;
        write_text_atomic(&output_path, &item.result.markdown).map_err(EngineError::from)?;
        written.push(output_rel.to_string());

        let meta_rel = format!("{}.meta.json", output_rel.trim_end_matches(".md"));
        let meta_path = resolve_inside_root(request.run_root, &meta_rel)?;
        let meta = WaveOutputMeta {
            schema_version: wave_output_meta_schema_version(),
            perspective_id: item.entry.perspective_id.clone(),
            agent_type: item.entry.agent_type.clone(),
            output_md: output_rel.to_string(),
            prompt_digest: item.prompt_digest.clone(),
            agent_run_id: item.result.agent_run_id.clone(),
            created_at: request.now_iso.to_string(),
            retry_count: request.retry_count,
            source_input_path: item.result.source_input_path.clone(),
        };
        write_json_document(&meta_path, &meta)?;
        written.push(meta_rel);
    }

    tracing::info!(
        run_id = %request.plan.run_id,
        outputs = staged.len(),
        "wave batch ingested"
    );
    Ok(WaveIngestOutcome { written })
}

#[cfg(test)]
pub(crate) fn compliant_markdown(sources: &[&str]) -> String {
    let mut bullets = String::new();
    for source in sources {
        bullets.push_str("- ");
        bullets.push_str(source);
        bullets.push('\n');
    }
    format!(
        "## Findings\nSolar deployments doubled in the target region.\n\n\
         ## Sources\n{bullets}\n\
         ## Gaps\n- (P1) Pricing data is a year old\n"
    )
}

#[cfg(test)]
mod tests {
    use sonar_core::ErrorCode;
    use sonar_state::RunLimits;

    use super::{compliant_markdown, wave_output_ingest, wave_output_validate, AgentResult, WaveIngestRequest};
    use crate::perspectives::sample_roster;
    use crate::plan::wave1_plan_build;

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn result(key: &str, markdown: String) -> AgentResult {
        AgentResult {
            perspective_id: key.to_string(),
            markdown,
            agent_run_id: format!("agent-{key}"),
            gap_id: None,
            prompt_digest: None,
            source_input_path: None,
        }
    }

    #[test]
    fn functional_wave_output_validate_accepts_compliant_output() {
        let roster = sample_roster();
        let stats =
            wave_output_validate(&roster.perspectives[0], &compliant_markdown(&["https://example.com/a"]))
                .expect("compliant output should validate");
        assert_eq!(stats.sources_count, 1);
        assert!(stats.words > 0);
    }

    #[test]
    fn regression_contract_violations_carry_typed_codes() {
        let roster = sample_roster();
        let perspective = &roster.perspectives[0];

        let missing = wave_output_validate(perspective, "## Findings\nonly findings\n")
            .expect_err("missing sections should fail");
        assert_eq!(missing.code, ErrorCode::MissingRequiredSection);
        assert_eq!(missing.details["section"], serde_json::json!("Sources"));

        let malformed = wave_output_validate(
            perspective,
            "## Findings\nx\n\n## Sources\n- ftp://example.com/a\n\n## Gaps\n",
        )
        .expect_err("non-http source should fail");
        assert_eq!(malformed.code, ErrorCode::MalformedSources);

        let too_many = wave_output_validate(
            perspective,
            &compliant_markdown(&[
                "https://a.example/1",
                "https://a.example/2",
                "https://a.example/3",
                "https://a.example/4",
                "https://a.example/5",
                "https://a.example/6",
            ]),
        )
        .expect_err("six sources should exceed the contract");
        assert_eq!(too_many.code, ErrorCode::TooManySources);

        let mut wordy = compliant_markdown(&["https://a.example/1"]);
        wordy.push_str(&"filler ".repeat(500));
        let too_wordy =
            wave_output_validate(perspective, &wordy).expect_err("500 fillers should exceed");
        assert_eq!(too_wordy.code, ErrorCode::TooManyWords);
    }

    #[test]
    fn functional_ingest_writes_outputs_and_sidecars() {
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

        let results = vec![
            result("p1", compliant_markdown(&["https://example.com/a"])),
            result("p2", compliant_markdown(&["https://example.com/b"])),
        ];
        let outcome = wave_output_ingest(&WaveIngestRequest {
            run_root: tempdir.path(),
            plan: &plan,
            perspectives: &roster,
            results: &results,
            retry_count: 0,
            now_iso: NOW,
        })
        .expect("ingest should succeed");
        assert_eq!(outcome.written.len(), 4);
        assert!(tempdir.path().join("wave-1/p1.md").exists());

        let meta: super::WaveOutputMeta =
            sonar_core::read_json_document(&tempdir.path().join("wave-1/p1.meta.json"))
                .expect("meta");
        assert_eq!(meta.perspective_id, "p1");
        assert!(meta.prompt_digest.starts_with("sha256:"));
        assert_eq!(meta.retry_count, 0);
    }

    #[test]
    fn regression_failing_batch_writes_nothing() {
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

        let results = vec![
            result("p1", compliant_markdown(&["https://example.com/a"])),
            result("p2", "## Findings\nno sources section\n".to_string()),
        ];
        let error = wave_output_ingest(&WaveIngestRequest {
            run_root: tempdir.path(),
            plan: &plan,
            perspectives: &roster,
            results: &results,
            retry_count: 0,
            now_iso: NOW,
        })
        .expect_err("batch should fail");
        assert_eq!(error.code, ErrorCode::MissingRequiredSection);
        assert!(!tempdir.path().join("wave-1/p1.md").exists());
        assert!(!tempdir.path().join("wave-1/p2.md").exists());
    }

    #[test]
    fn regression_prompt_digest_conflict_blocks_the_batch() {
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

        let mut tampered = result("p1", compliant_markdown(&["https://example.com/a"]));
        tampered.prompt_digest = Some("sha256:0000".to_string());
        let error = wave_output_ingest(&WaveIngestRequest {
            run_root: tempdir.path(),
            plan: &plan,
            perspectives: &roster,
            results: &[tampered],
            retry_count: 0,
            now_iso: NOW,
        })
        .expect_err("digest conflict should fail");
        assert_eq!(error.code, ErrorCode::AgentResultPromptDigestConflict);

        let unknown = result("p9", compliant_markdown(&["https://example.com/a"]));
        let missing = wave_output_ingest(&WaveIngestRequest {
            run_root: tempdir.path(),
            plan: &plan,
            perspectives: &roster,
            results: &[unknown],
            retry_count: 0,
            now_iso: NOW,
        })
        .expect_err("unknown perspective should fail");
        assert_eq!(missing.code, ErrorCode::PerspectiveNotFound);
    }
}
