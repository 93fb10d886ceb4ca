//! Summary pack, synthesis, review loop, and Gate E for Sonar runs.

pub mod gate_e;
pub mod review_bundle;
pub mod summary_pack;
pub mod synthesis;

pub use gate_e::{
    gate_e_evaluate, gate_e_reports, GateEEvaluation, GateEMetrics, NumericClaim,
    GATE_E_NUMERIC_CLAIMS_FILE, GATE_E_SECTIONS_FILE, GATE_E_STATUS_FILE,
    GATE_E_UTILIZATION_FILE, MAX_DUPLICATE_CITATION_RATE, MIN_CITATION_UTILIZATION_RATE,
    WARN_HIGH_DUPLICATE_CITATION_RATE, WARN_LOW_CITATION_UTILIZATION,
};
pub use review_bundle::{
    load_review_bundle, review_bundle_ingest, review_factory_auto, revision_control,
    write_revision_directives, ReviewBundleDocument, ReviewDecision, ReviewDirective,
    ReviewFinding, RevisionAction, RevisionDecision, REVIEW_BUNDLE_FILE,
    REVIEW_BUNDLE_SCHEMA_VERSION, REVIEW_LIST_CAP, REVISION_DIRECTIVES_FILE,
};
pub use summary_pack::{
    load_summary_pack, summary_pack_build, validate_summary_pack, SummaryEntry,
    SummaryPackDocument, SummaryPackLimits, SUMMARY_PACK_FILE, SUMMARY_PACK_SCHEMA_VERSION,
};
pub use synthesis::{
    ensure_known_cids, load_synthesis, synthesis_build_from_pack, synthesis_write,
    SynthesisSections, DRAFT_SYNTHESIS_FILE, FINAL_SYNTHESIS_FILE, REQUIRED_SYNTHESIS_SECTIONS,
};
