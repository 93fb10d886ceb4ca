//! Foundational low-level utilities shared across Sonar crates.
//!
//! Provides atomic file writes, canonical JSON hashing, path containment,
//! the typed error envelope, the JSON document store, and the audit log
//! used by every state-mutating component.

pub mod atomic_io;
pub mod audit;
pub mod canonical;
pub mod error;
pub mod json_store;
pub mod path_guard;
pub mod time_utils;

pub use atomic_io::{append_jsonl_line, write_text_atomic};
pub use audit::{append_audit_record, AuditRecord};
pub use canonical::{canonical_json_bytes, cid_for_url, digest_of_str, digest_of_value, sha256_hex};
pub use error::{envelope_err, envelope_ok, EngineError, EngineResult, ErrorCode};
pub use json_store::{read_json_document, read_json_value, write_json_document, write_json_value};
pub use path_guard::{ensure_relative_artifact, ensure_wave_dir, resolve_inside_root};
pub use time_utils::{current_unix_timestamp_ms, elapsed_seconds, format_iso, now_iso, parse_iso};
