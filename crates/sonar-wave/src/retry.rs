use std::path::Path;

use serde::{Deserialize, Serialize};
use sonar_core::{resolve_inside_root, write_json_document, EngineResult};

use crate::review::RetryDirective;

/// Schema tag carried by the retry directives document.
pub const RETRY_DIRECTIVES_SCHEMA_VERSION: &str = "wave1.retry_directives.v1";
/// Retry directives location inside a run root.
pub const RETRY_DIRECTIVES_FILE: &str = "retry/retry-directives.json";

fn retry_directives_schema_version() -> String {
    RETRY_DIRECTIVES_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Replay instructions for the perspectives that failed review.
///
/// `consumed_at` stays `null` until the replay tick picks the document
/// up; it is always serialized so readers can distinguish "pending" from
/// "absent".
pub struct RetryDirectivesDocument {
    #[serde(default = "retry_directives_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub consumed_at: Option<String>,
    pub directives: Vec<RetryDirective>,
}

/// Writes an unconsumed retry directives document.
pub fn write_retry_directives(
    run_root: &Path,
    run_id: &str,
    directives: Vec<RetryDirective>,
    now_iso: &str,
) -> EngineResult<RetryDirectivesDocument> {
    let document = RetryDirectivesDocument {
        schema_version: retry_directives_schema_version(),
        run_id: run_id.to_string(),
        generated_at: now_iso.to_string(),
        consumed_at: None,
        directives,
    };
    let path = resolve_inside_root(run_root, RETRY_DIRECTIVES_FILE)?;
    write_json_document(&path, &document)?;
    Ok(document)
}

/// Loads the retry directives document when present.
pub fn load_retry_directives(run_root: &Path) -> EngineResult<Option<RetryDirectivesDocument>> {
    let path = resolve_inside_root(run_root, RETRY_DIRECTIVES_FILE)?;
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(sonar_core::read_json_document(&path)?))
}

/// Returns the pending (unconsumed) directives, when any.
pub fn pending_retry_directives(
    run_root: &Path,
) -> EngineResult<Option<RetryDirectivesDocument>> {
    Ok(load_retry_directives(run_root)?.filter(|document| document.consumed_at.is_none()))
}

/// Marks the directives consumed; the replay tick calls this after it
/// has re-driven every listed perspective.
pub fn consume_retry_directives(
    run_root: &Path,
    now_iso: &str,
) -> EngineResult<Option<RetryDirectivesDocument>> {
    let Some(mut document) = load_retry_directives(run_root)? else {
        return Ok(None);
    };
    if document.consumed_at.is_some() {
        return Ok(Some(document));
    }
    document.consumed_at = Some(now_iso.to_string());
    let path = resolve_inside_root(run_root, RETRY_DIRECTIVES_FILE)?;
    write_json_document(&path, &document)?;
    Ok(Some(document))
}

#[cfg(test)]
mod tests {
    use super::{
        consume_retry_directives, pending_retry_directives, write_retry_directives,
    };
    use crate::review::RetryDirective;

    const NOW: &str = "2026-03-01T10:00:00Z";
    const LATER: &str = "2026-03-01T10:05:00Z";

    fn directive(id: &str) -> RetryDirective {
        RetryDirective {
            perspective_id: id.to_string(),
            action: "retry".to_string(),
            change_note: format!("regenerate '{id}'"),
            blocking_error_code: "MISSING_ARTIFACT".to_string(),
        }
    }

    #[test]
    fn functional_retry_directives_round_trip_and_consume() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        assert!(pending_retry_directives(tempdir.path())
            .expect("probe")
            .is_none());

        write_retry_directives(tempdir.path(), "run-001", vec![directive("p2")], NOW)
            .expect("write directives");
        let raw = std::fs::read_to_string(tempdir.path().join("retry/retry-directives.json"))
            .expect("raw directives");
        assert!(raw.contains("\"consumed_at\": null"));

        let pending = pending_retry_directives(tempdir.path())
            .expect("probe")
            .expect("pending directives");
        assert_eq!(pending.directives.len(), 1);

        let consumed = consume_retry_directives(tempdir.path(), LATER)
            .expect("consume")
            .expect("document");
        assert_eq!(consumed.consumed_at.as_deref(), Some(LATER));
        assert!(pending_retry_directives(tempdir.path())
            .expect("probe")
            .is_none());

        // Consuming again is idempotent and keeps the first timestamp.
        let again = consume_retry_directives(tempdir.path(), "2026-03-01T11:00:00Z")
            .expect("consume again")
            .expect("document");
        assert_eq!(again.consumed_at.as_deref(), Some(LATER));
    }
}
