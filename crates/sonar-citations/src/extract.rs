use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sonar_core::{resolve_inside_root, write_json_document, write_text_atomic, EngineError, EngineResult, ErrorCode};
use sonar_wave::split_sections;
use url::Url;

/// Sorted unique URL listing inside a run root.
pub const EXTRACTED_URLS_FILE: &str = "citations/extracted-urls.txt";
/// Reverse index from raw URL to the outputs that cited it.
pub const FOUND_BY_FILE: &str = "citations/found-by.json";
/// Schema tag carried by the found-by index.
pub const FOUND_BY_SCHEMA_VERSION: &str = "found_by.v1";

fn found_by_schema_version() -> String {
    FOUND_BY_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One citation site: which wave output cited a URL, and where.
pub struct FoundByRecord {
    pub wave: u32,
    pub perspective_id: String,
    pub ordinal: u32,
    pub source_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Reverse index from each extracted URL to its citation sites.
pub struct FoundByDocument {
    #[serde(default = "found_by_schema_version")]
    pub schema_version: String,
    pub items: BTreeMap<String, Vec<FoundByRecord>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Counters and the sorted unique URL list one extract pass produced.
pub struct ExtractOutcome {
    pub total_found: usize,
    pub unique_found: usize,
    pub urls: Vec<String>,
}

/// Scans the `Sources` section of every wave output and persists the
/// sorted unique URL list plus the found-by index.
///
/// Wave-2 outputs participate only when `include_wave2` is set. Scheme
/// and host are lowercased at extraction; path and query stay verbatim
/// so the normalizer decides equivalence.
pub fn citations_extract(run_root: &Path, include_wave2: bool) -> EngineResult<ExtractOutcome> {
    let mut waves: Vec<(u32, &str)> = vec![(1, "wave-1")];
    if include_wave2 {
        waves.push((2, "wave-2"));
    }

    let mut total_found = 0;
    let mut found_by: BTreeMap<String, Vec<FoundByRecord>> = BTreeMap::new();
    for (wave, dir_rel) in waves {
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
            let sources = sections.get("Sources").map(String::as_str).unwrap_or("");
            let mut ordinal = 0;
            for line in sources.lines() {
                let trimmed = line.trim();
                let Some(raw_url) = trimmed.strip_prefix("- ") else {
                    continue;
                };
                if !raw_url.starts_with("http://") && !raw_url.starts_with("https://") {
                    continue;
                }
                ordinal += 1;
                total_found += 1;
                let url = lower_scheme_and_host(raw_url);
                found_by.entry(url).or_default().push(FoundByRecord {
                    wave,
                    perspective_id: perspective_id.clone(),
                    ordinal,
                    source_line: trimmed.to_string(),
                });
            }
        }
    }

    let mut urls: Vec<String> = found_by.keys().cloned().collect();
    crate::collate::sort_urls(&mut urls);
    let mut listing = urls.join("\n");
    if !listing.is_empty() {
        listing.push('\n');
    }
    write_text_atomic(
        &resolve_inside_root(run_root, EXTRACTED_URLS_FILE)?,
        &listing,
    )
    .map_err(EngineError::from)?;
    write_json_document(
        &resolve_inside_root(run_root, FOUND_BY_FILE)?,
        &FoundByDocument {
            schema_version: found_by_schema_version(),
            items: found_by,
        },
    )?;

    Ok(ExtractOutcome {
        total_found,
        unique_found: urls.len(),
        urls,
    })
}

/// Lowercases scheme and host, leaving path, query, and fragment intact.
fn lower_scheme_and_host(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };
    let scheme_end = match raw.find("://") {
        Some(at) => at + 3,
        None => return raw.to_string(),
    };
    let host_len = parsed.host_str().map(str::len).unwrap_or(0);
    if raw.len() < scheme_end + host_len {
        return raw.to_string();
    }
    let mut lowered = String::with_capacity(raw.len());
    lowered.push_str(&raw[..scheme_end + host_len].to_ascii_lowercase());
    lowered.push_str(&raw[scheme_end + host_len..]);
    lowered
}
