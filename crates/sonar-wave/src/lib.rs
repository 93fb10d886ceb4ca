//! Wave planning, output contracts, review, retries, and the pivot.
//!
//! Everything here is deterministic for fixed inputs: plans walk
//! perspectives in lexicographic id order, reviews report in stable key
//! order, and gaps sort by (priority, perspective, ordinal).

pub mod output;
pub mod perspectives;
pub mod pivot;
pub mod plan;
pub mod retry;
pub mod review;

pub use output::{
    split_sections, wave_output_ingest, wave_output_validate, AgentResult, WaveIngestOutcome,
    WaveIngestRequest, WaveOutputMeta, WaveOutputStats, REQUIRED_OUTPUT_SECTIONS,
    WAVE_OUTPUT_META_SCHEMA_VERSION,
};
pub use perspectives::{
    load_perspectives, validate_perspectives, Perspective, PerspectiveTrack,
    PerspectivesDocument, PromptContract, PERSPECTIVES_FILE, PERSPECTIVES_SCHEMA_VERSION,
};
pub use pivot::{
    load_pivot, pivot_build, GapPriority, PivotDecision, PivotDocument, PivotGap, PivotWave1,
    PivotWaveOutput, PIVOT_FILE, PIVOT_SCHEMA_VERSION, RULE_WAVE2_NOT_REQUIRED,
    RULE_WAVE2_REQUIRED_P0,
};
pub use plan::{
    load_wave_plan, plan_entry_prompt_digest, wave1_plan_build, wave2_plan_build, wave_plan_rel,
    WavePlanDocument, WavePlanEntry, WAVE_PLAN_SCHEMA_VERSION,
};
pub use retry::{
    consume_retry_directives, load_retry_directives, pending_retry_directives,
    write_retry_directives, RetryDirectivesDocument, RETRY_DIRECTIVES_FILE,
    RETRY_DIRECTIVES_SCHEMA_VERSION,
};
pub use review::{
    load_wave_review, wave_review_rel, wave_review_run, RetryDirective, WaveReviewReport,
    WaveReviewResult, DEFAULT_MAX_FAILURES, WAVE_REVIEW_SCHEMA_VERSION,
};
