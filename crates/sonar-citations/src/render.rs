use std::path::Path;

use sonar_core::{resolve_inside_root, write_text_atomic, EngineResult};

use crate::validate::{CitationRecord, CitationStatus};

/// Rendered citations markdown inside a run root.
pub const CITATIONS_RENDERED_FILE: &str = "citations/citations-rendered.md";

/// Group order in the rendered document.
const STATUS_ORDER: [CitationStatus; 5] = [
    CitationStatus::Valid,
    CitationStatus::Paywalled,
    CitationStatus::Invalid,
    CitationStatus::Blocked,
    CitationStatus::Mismatch,
];

/// Renders the citation pool grouped by status, entries sorted by cid,
/// and persists `citations-rendered.md`.
pub fn citations_render(run_root: &Path, records: &[CitationRecord]) -> EngineResult<String> {
    let mut rendered = String::from("# Citations\n");
    for status in STATUS_ORDER {
        let mut group: Vec<&CitationRecord> = records
            .iter()
            .filter(|record| record.status == status)
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| a.cid.cmp(&b.cid));

        rendered.push_str("\n# ");
        rendered.push_str(status.as_str());
        rendered.push('\n');
        for record in group {
            rendered.push_str("\n## ");
            rendered.push_str(&record.cid);
            rendered.push('\n');
            rendered.push_str(&format!("- normalized_url: {}\n", record.normalized_url));
            if let Some(title) = &record.title {
                rendered.push_str(&format!("- title: {title}\n"));
            }
            if let Some(publisher) = &record.publisher {
                rendered.push_str(&format!("- publisher: {publisher}\n"));
            }
            if !record.notes.is_empty() {
                rendered.push_str(&format!("- notes: {}\n", record.notes));
            }
        }
    }

    write_text_atomic(
        &resolve_inside_root(run_root, CITATIONS_RENDERED_FILE)?,
        &rendered,
    )
    .map_err(sonar_core::EngineError::from)?;
    Ok(rendered)
}
