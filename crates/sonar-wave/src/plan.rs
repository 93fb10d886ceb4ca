use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{
    digest_of_str, digest_of_value, resolve_inside_root, write_json_document, write_text_atomic,
    EngineError, EngineResult, ErrorCode,
};
use sonar_state::RunLimits;

use crate::perspectives::{Perspective, PerspectivesDocument};
use crate::pivot::PivotDocument;

/// Schema tag carried by both wave plan documents.
pub const WAVE_PLAN_SCHEMA_VERSION: &str = "wave_plan.v1";

fn wave_plan_schema_version() -> String {
    WAVE_PLAN_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One planned agent invocation.
pub struct WavePlanEntry {
    pub perspective_id: String,
    pub agent_type: String,
    pub output_md: String,
    pub prompt_md: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_id: Option<String>,
}

impl WavePlanEntry {
    /// The key results are matched against: the gap id for wave-2
    /// entries, the perspective id otherwise.
    pub fn key(&self) -> &str {
        self.gap_id.as_deref().unwrap_or(&self.perspective_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// A byte-deterministic wave plan.
pub struct WavePlanDocument {
    #[serde(default = "wave_plan_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub inputs_digest: String,
    pub entries: Vec<WavePlanEntry>,
}

/// Returns the plan file location for a wave.
pub fn wave_plan_rel(wave: u32) -> String {
    format!("wave-{wave}/wave{wave}-plan.json")
}

/// Plans wave-1: one entry per perspective in lexicographic id order,
/// with the rendered prompt pinned on disk.
pub fn wave1_plan_build(
    run_root: &Path,
    run_id: &str,
    perspectives: &PerspectivesDocument,
    limits: &RunLimits,
    scope_label: &str,
    now_iso: &str,
) -> EngineResult<WavePlanDocument> {
    let sorted = perspectives.sorted_by_id();
    let count = sorted.len();
    let cap = limits.max_wave1_agents as usize;
    if count > cap {
        return Err(EngineError::new(
            ErrorCode::WaveCapExceeded,
            format!("wave-1 fan-out {count} exceeds cap {cap}"),
        )
        .with_details(json!({ "cap": cap, "count": count, "stage": "wave1" })));
    }

    let inputs_digest = digest_of_value(&json!({
        "perspectives": perspectives,
        "limits": limits,
        "scope": scope_label,
    }))?;

    let mut entries = Vec::with_capacity(count);
    for perspective in sorted {
        let prompt_rel = format!("operator/prompts/wave-1/{}.prompt.md", perspective.id);
        let prompt = render_prompt(perspective, scope_label, None);
        let prompt_path = resolve_inside_root(run_root, &prompt_rel)?;
        write_text_atomic(&prompt_path, &prompt).map_err(EngineError::from)?;
        entries.push(WavePlanEntry {
            perspective_id: perspective.id.clone(),
            agent_type: perspective.agent_type.clone(),
            output_md: format!("wave-1/{}.md", perspective.id),
            prompt_md: prompt_rel,
            gap_id: None,
        });
    }

    let document = WavePlanDocument {
        schema_version: wave_plan_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        inputs_digest,
        entries,
    };
    let plan_path = resolve_inside_root(run_root, &wave_plan_rel(1))?;
    write_json_document(&plan_path, &document)?;
    Ok(document)
}

/// Plans wave-2 from the pivot decision: one entry per selected gap,
/// ordered ascending by gap id.
pub fn wave2_plan_build(
    run_root: &Path,
    run_id: &str,
    pivot: &PivotDocument,
    perspectives: &PerspectivesDocument,
    limits: &RunLimits,
    scope_label: &str,
    now_iso: &str,
) -> EngineResult<WavePlanDocument> {
    let mut gap_ids = pivot.decision.wave2_gap_ids.clone();
    gap_ids.sort();
    let count = gap_ids.len();
    let cap = limits.max_wave2_agents as usize;
    if count > cap {
        return Err(EngineError::new(
            ErrorCode::WaveCapExceeded,
            format!("wave-2 fan-out {count} exceeds cap {cap}"),
        )
        .with_details(json!({ "cap": cap, "count": count, "stage": "wave2" })));
    }

    let inputs_digest = digest_of_value(&json!({
        "pivot": pivot,
        "limits": limits,
        "scope": scope_label,
    }))?;

    let mut entries = Vec::with_capacity(count);
    for gap_id in gap_ids {
        let gap = pivot
            .gaps
            .iter()
            .find(|gap| gap.gap_id == gap_id)
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::GapsParseFailed,
                    format!("pivot decision names unknown gap '{gap_id}'"),
                )
                .with_details(json!({ "gap_id": gap_id }))
            })?;
        let perspective = perspectives.find(&gap.perspective_id).ok_or_else(|| {
            EngineError::new(
                ErrorCode::PerspectiveNotFound,
                format!("gap '{gap_id}' names unknown perspective '{}'", gap.perspective_id),
            )
            .with_details(json!({ "perspective_id": gap.perspective_id }))
        })?;

        let prompt_rel = format!("operator/prompts/wave-2/{gap_id}.prompt.md");
        let prompt = render_prompt(perspective, scope_label, Some(&gap.description));
        let prompt_path = resolve_inside_root(run_root, &prompt_rel)?;
        write_text_atomic(&prompt_path, &prompt).map_err(EngineError::from)?;
        entries.push(WavePlanEntry {
            perspective_id: perspective.id.clone(),
            agent_type: perspective.agent_type.clone(),
            output_md: format!("wave-2/{gap_id}.md"),
            prompt_md: prompt_rel,
            gap_id: Some(gap.gap_id.clone()),
        });
    }

    let document = WavePlanDocument {
        schema_version: wave_plan_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        inputs_digest,
        entries,
    };
    let plan_path = resolve_inside_root(run_root, &wave_plan_rel(2))?;
    write_json_document(&plan_path, &document)?;
    Ok(document)
}

/// Loads a previously written wave plan.
pub fn load_wave_plan(run_root: &Path, wave: u32) -> EngineResult<WavePlanDocument> {
    let path = resolve_inside_root(run_root, &wave_plan_rel(wave))?;
    sonar_core::read_json_document(&path)
}

/// Computes the digest the sidecar meta pins for one plan entry's prompt.
pub fn plan_entry_prompt_digest(run_root: &Path, entry: &WavePlanEntry) -> EngineResult<String> {
    let prompt_path = resolve_inside_root(run_root, &entry.prompt_md)?;
    let prompt = std::fs::read_to_string(&prompt_path).map_err(|error| {
        EngineError::new(
            ErrorCode::MissingArtifact,
            format!("prompt {} is unreadable: {error}", entry.prompt_md),
        )
        .with_details(json!({ "file": entry.prompt_md }))
    })?;
    Ok(digest_of_str(&prompt))
}

/// Renders one agent prompt with the fixed section order every wave
/// prompt carries.
fn render_prompt(perspective: &Perspective, scope_label: &str, gap_focus: Option<&str>) -> String {
    let contract = &perspective.prompt_contract;
    let sections = if contract.must_include_sections.is_empty() {
        "Findings, Sources, Gaps".to_string()
    } else {
        contract.must_include_sections.join(", ")
    };
    let questions = match gap_focus {
        Some(gap) => format!("- Close this identified gap: {gap}\n"),
        None => format!("- What does the evidence say about: {scope_label}?\n"),
    };
    format!(
        "# Research brief: {title}\n\
         \n\
         ## Scope Contract\n\
         - Scope: {scope}\n\
         - Perspective: {title} ({track})\n\
         - Required sections, in order: {sections}\n\
         \n\
         ## Platform Requirements\n\
         - Output is a single markdown document.\n\
         - Every source appears as a `- https://...` bullet under Sources.\n\
         - Stay under {max_words} words and {max_sources} sources.\n\
         \n\
         ## Tool Policy\n\
         \n\
         ### Primary\n\
         - web search and fetch, within a budget of {tool_budget} calls\n\
         \n\
         ### Secondary\n\
         - local notes from earlier waves of this run\n\
         \n\
         ### Forbidden\n\
         - direct access to the run directory\n\
         - fabricated or unverifiable citations\n\
         \n\
         ## Questions\n\
         {questions}\
         \n\
         ## Non-goals\n\
         - Polished prose; findings density wins over style.\n\
         - Work outside the scope contract above.\n\
         \n\
         ## Deliverable\n\
         - Time-budget: one focused session\n\
         - Depth: {track} track\n\
         - Citation-posture: every factual claim carries a source bullet\n",
        title = perspective.title,
        scope = scope_label,
        track = match perspective.track {
            crate::perspectives::PerspectiveTrack::Standard => "standard",
            crate::perspectives::PerspectiveTrack::Independent => "independent",
        },
        sections = sections,
        max_words = contract.max_words,
        max_sources = contract.max_sources,
        tool_budget = contract.tool_budget,
        questions = questions,
    )
}
