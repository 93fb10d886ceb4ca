//! The citations pipeline: extract, normalize, validate, gate, render.
//!
//! Validation is deterministic in every mode: offline uses operator
//! fixtures, online dry-run marks the whole ladder skipped, and online
//! replay reconstitutes a captured result set byte-for-byte with zero
//! network.

pub mod collate;
pub mod extract;
pub mod gate_c;
pub mod normalize;
pub mod render;
pub mod ssrf;
pub mod validate;

pub use collate::{sort_urls, url_collate};
pub use extract::{
    citations_extract, ExtractOutcome, FoundByDocument, FoundByRecord, EXTRACTED_URLS_FILE,
    FOUND_BY_FILE, FOUND_BY_SCHEMA_VERSION,
};
pub use gate_c::{gate_c_evaluate, GateCEvaluation, GATE_C_MAX_INVALID_RATE, GATE_C_MIN_VALIDATED_RATE};
pub use normalize::{
    citations_normalize, load_url_map, normalize_url, UrlMapDocument, UrlMapItem, URL_MAP_FILE,
    URL_MAP_SCHEMA_VERSION,
};
pub use render::{citations_render, CITATIONS_RENDERED_FILE};
pub use ssrf::{is_private_or_local_target, SSRF_BLOCKED_NOTE};
pub use validate::{
    citations_validate, load_citations, load_citations_at, resolve_citation_mode,
    write_online_fixtures, CitationMode, CitationRecord, CitationStatus,
    CitationValidateRequest, OfflineFixtures, OnlineFixtures, OnlineFixturesPointer,
    BLOCKED_QUEUE_FILE, BLOCKED_URLS_FILE, CITATIONS_FILE, ONLINE_FIXTURES_LATEST_FILE,
    ONLINE_LADDER_STEPS,
};
