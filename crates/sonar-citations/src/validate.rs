use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sonar_core::{
    cid_for_url, resolve_inside_root, write_json_document, write_text_atomic, EngineError,
    EngineResult, ErrorCode,
};
use sonar_state::Sensitivity;
use url::Url;

use crate::collate::url_collate;
use crate::normalize::UrlMapDocument;
use crate::ssrf::{is_private_or_local_target, SSRF_BLOCKED_NOTE};

/// Validated citation pool inside a run root.
pub const CITATIONS_FILE: &str = "citations/citations.jsonl";
/// Blocked-URL queue (structured) inside a run root.
pub const BLOCKED_URLS_FILE: &str = "citations/blocked-urls.json";
/// Blocked-URL queue (operator-ordered markdown) inside a run root.
pub const BLOCKED_QUEUE_FILE: &str = "citations/blocked-urls.queue.md";
/// Pointer to the newest captured online fixture set.
pub const ONLINE_FIXTURES_LATEST_FILE: &str = "citations/online-fixtures.latest.json";
/// Schema tag carried by the blocked-URL queue.
pub const BLOCKED_URLS_SCHEMA_VERSION: &str = "blocked_urls.v1";

/// The three-step online ladder, in attempt order.
pub const ONLINE_LADDER_STEPS: [&str; 3] = ["direct_fetch", "bright_data", "apify"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CitationStatus` values.
pub enum CitationStatus {
    Valid,
    Paywalled,
    Invalid,
    Blocked,
    Mismatch,
}

impl CitationStatus {
    /// Returns the wire form of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Paywalled => "paywalled",
            Self::Invalid => "invalid",
            Self::Blocked => "blocked",
            Self::Mismatch => "mismatch",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One validated citation, keyed by cid.
pub struct CitationRecord {
    pub cid: String,
    pub normalized_url: String,
    pub status: CitationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CitationMode` values.
pub enum CitationMode {
    Offline,
    OnlineDryRun,
    OnlineReplay,
}

/// Resolves the effective validation mode.
///
/// Precedence: `query.constraints.deep_research_flags.citations.mode`,
/// then `run-config.effective.citations.mode`, then the sensitivity
/// default (`no_web` forces offline; everything else stays offline until
/// an operator opts into an online mode).
pub fn resolve_citation_mode(
    constraints: &Value,
    run_config: Option<&Value>,
    sensitivity: Sensitivity,
) -> CitationMode {
    if sensitivity == Sensitivity::NoWeb {
        return CitationMode::Offline;
    }
    let from_constraints = constraints
        .pointer("/deep_research_flags/citations/mode")
        .and_then(Value::as_str)
        .and_then(parse_mode);
    if let Some(mode) = from_constraints {
        return mode;
    }
    let from_run_config = run_config
        .and_then(|config| config.pointer("/effective/citations/mode"))
        .and_then(Value::as_str)
        .and_then(parse_mode);
    if let Some(mode) = from_run_config {
        return mode;
    }
    CitationMode::Offline
}

fn parse_mode(raw: &str) -> Option<CitationMode> {
    match raw {
        "offline" => Some(CitationMode::Offline),
        "online_dry_run" => Some(CitationMode::OnlineDryRun),
        "online_replay" => Some(CitationMode::OnlineReplay),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
/// One fixture entry describing the expected verdict for a URL.
pub struct FixtureEntry {
    pub status: CitationStatus,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
/// Offline fixture document: expected status per normalized URL.
pub struct OfflineFixtures {
    #[serde(default)]
    pub statuses: BTreeMap<String, FixtureEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Pointer document naming the captured fixture file to replay.
pub struct OnlineFixturesPointer {
    pub fixture_file: String,
}

#[derive(Debug, Clone, Deserialize)]
/// Captured online results keyed by normalized URL.
pub struct OnlineFixtures {
    #[serde(default)]
    pub results: BTreeMap<String, FixtureEntry>,
}

/// Inputs for one validation pass.
#[derive(Debug, Clone)]
pub struct CitationValidateRequest<'a> {
    pub run_root: &'a Path,
    pub mode: CitationMode,
    pub url_map: &'a UrlMapDocument,
    /// Offline mode only: the operator-supplied fixtures file.
    pub fixtures_path: Option<&'a Path>,
    pub now_iso: &'a str,
}

/// Validates the citation pool in the requested mode and persists
/// `citations.jsonl` (plus the blocked queue in dry-run).
pub fn citations_validate(
    request: &CitationValidateRequest<'_>,
) -> EngineResult<Vec<CitationRecord>> {
    let mut targets: Vec<(String, String)> = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for item in &request.url_map.items {
        if seen.insert(item.cid.clone()) {
            targets.push((item.normalized_url.clone(), item.cid.clone()));
        }
    }
    targets.sort_by(|a, b| url_collate(&a.0, &b.0));

    let records = match request.mode {
        CitationMode::Offline => validate_offline(request, &targets)?,
        CitationMode::OnlineDryRun => validate_dry_run(request, &targets)?,
        CitationMode::OnlineReplay => validate_replay(request, &targets)?,
    };

    let mut pool = String::new();
    for record in &records {
        let line = serde_json::to_string(record).map_err(|error| {
            EngineError::new(
                ErrorCode::Internal,
                format!("failed to encode citation record: {error}"),
            )
        })?;
        pool.push_str(&line);
        pool.push('\n');
    }
    write_text_atomic(&resolve_inside_root(request.run_root, CITATIONS_FILE)?, &pool)
        .map_err(EngineError::from)?;
    tracing::info!(
        records = records.len(),
        mode = ?request.mode,
        "citation pool validated"
    );
    Ok(records)
}

fn validate_offline(
    request: &CitationValidateRequest<'_>,
    targets: &[(String, String)],
) -> EngineResult<Vec<CitationRecord>> {
    let fixtures_path = request.fixtures_path.ok_or_else(|| {
        EngineError::new(
            ErrorCode::InvalidArgs,
            "offline citation validation requires a fixtures file",
        )
    })?;
    if !fixtures_path.is_file() {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            format!("fixtures file {} does not exist", fixtures_path.display()),
        )
        .with_details(json!({ "file": fixtures_path.display().to_string() })));
    }
    let fixtures: OfflineFixtures = sonar_core::read_json_document(fixtures_path)?;

    let mut records = Vec::with_capacity(targets.len());
    for (normalized_url, cid) in targets {
        let record = match fixtures.statuses.get(normalized_url) {
            Some(entry) => CitationRecord {
                cid: cid.clone(),
                normalized_url: normalized_url.clone(),
                status: entry.status,
                title: entry.title.clone(),
                publisher: entry.publisher.clone(),
                notes: entry.notes.clone().unwrap_or_default(),
            },
            None => CitationRecord {
                cid: cid.clone(),
                normalized_url: normalized_url.clone(),
                status: CitationStatus::Invalid,
                title: None,
                publisher: None,
                notes: format!("no fixture entry for {normalized_url}"),
            },
        };
        records.push(record);
    }
    Ok(records)
}

fn validate_dry_run(
    request: &CitationValidateRequest<'_>,
    targets: &[(String, String)],
) -> EngineResult<Vec<CitationRecord>> {
    let ladder_notes = ONLINE_LADDER_STEPS
        .iter()
        .map(|step| format!("{step}: skipped(dry-run)"))
        .collect::<Vec<_>>()
        .join("; ");

    let mut records = Vec::with_capacity(targets.len());
    let mut blocked = Vec::new();
    for (normalized_url, cid) in targets {
        if let Some(record) = ssrf_verdict(normalized_url, cid)? {
            records.push(record);
            continue;
        }
        blocked.push((normalized_url.clone(), cid.clone()));
        records.push(CitationRecord {
            cid: cid.clone(),
            normalized_url: normalized_url.clone(),
            status: CitationStatus::Blocked,
            title: None,
            publisher: None,
            notes: ladder_notes.clone(),
        });
    }

    write_blocked_queue(request.run_root, &blocked, request.now_iso)?;
    Ok(records)
}

fn validate_replay(
    request: &CitationValidateRequest<'_>,
    targets: &[(String, String)],
) -> EngineResult<Vec<CitationRecord>> {
    let pointer_path = resolve_inside_root(request.run_root, ONLINE_FIXTURES_LATEST_FILE)?;
    if !pointer_path.is_file() {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            "online replay requires citations/online-fixtures.latest.json",
        )
        .with_details(json!({ "file": ONLINE_FIXTURES_LATEST_FILE })));
    }
    let pointer: OnlineFixturesPointer = sonar_core::read_json_document(&pointer_path)?;
    let fixture_rel = format!("citations/{}", pointer.fixture_file);
    let fixture_path = resolve_inside_root(request.run_root, &fixture_rel)?;
    if !fixture_path.is_file() {
        return Err(EngineError::new(
            ErrorCode::InvalidArgs,
            format!("captured fixture {} is missing", fixture_rel),
        )
        .with_details(json!({ "file": fixture_rel })));
    }
    let fixtures: OnlineFixtures = sonar_core::read_json_document(&fixture_path)?;

    let mut records = Vec::with_capacity(targets.len());
    for (normalized_url, cid) in targets {
        if let Some(record) = ssrf_verdict(normalized_url, cid)? {
            records.push(record);
            continue;
        }
        let record = match fixtures.results.get(normalized_url) {
            Some(entry) => CitationRecord {
                cid: cid.clone(),
                normalized_url: normalized_url.clone(),
                status: entry.status,
                title: entry.title.clone(),
                publisher: entry.publisher.clone(),
                notes: entry.notes.clone().unwrap_or_default(),
            },
            None => CitationRecord {
                cid: cid.clone(),
                normalized_url: normalized_url.clone(),
                status: CitationStatus::Invalid,
                title: None,
                publisher: None,
                notes: format!("no replay entry for {normalized_url}"),
            },
        };
        records.push(record);
    }
    Ok(records)
}

fn ssrf_verdict(normalized_url: &str, cid: &str) -> EngineResult<Option<CitationRecord>> {
    let parsed = Url::parse(normalized_url).map_err(|error| {
        EngineError::new(
            ErrorCode::InvalidArgs,
            format!("unparseable normalized URL '{normalized_url}': {error}"),
        )
    })?;
    if is_private_or_local_target(&parsed) {
        return Ok(Some(CitationRecord {
            cid: cid.to_string(),
            normalized_url: normalized_url.to_string(),
            status: CitationStatus::Invalid,
            title: None,
            publisher: None,
            notes: SSRF_BLOCKED_NOTE.to_string(),
        }));
    }
    Ok(None)
}

fn write_blocked_queue(
    run_root: &Path,
    blocked: &[(String, String)],
    now_iso: &str,
) -> EngineResult<()> {
    let items: Vec<Value> = blocked
        .iter()
        .map(|(normalized_url, cid)| {
            json!({
                "cid": cid,
                "normalized_url": normalized_url,
                "reason": "dry-run",
            })
        })
        .collect();
    write_json_document(
        &resolve_inside_root(run_root, BLOCKED_URLS_FILE)?,
        &json!({
            "schema_version": BLOCKED_URLS_SCHEMA_VERSION,
            "generated_at": now_iso,
            "items": items,
        }),
    )?;

    let mut queue = String::from("# Blocked URLs queue\n\n");
    for (position, (normalized_url, _)) in blocked.iter().enumerate() {
        queue.push_str(&format!("{}. {}\n", position + 1, normalized_url));
    }
    write_text_atomic(&resolve_inside_root(run_root, BLOCKED_QUEUE_FILE)?, &queue)
        .map_err(EngineError::from)
}

/// Loads the validated pool from `citations.jsonl`.
pub fn load_citations(run_root: &Path) -> EngineResult<Vec<CitationRecord>> {
    let path = resolve_inside_root(run_root, CITATIONS_FILE)?;
    load_citations_at(&path)
}

/// Loads a citation pool from an explicit path.
pub fn load_citations_at(path: &Path) -> EngineResult<Vec<CitationRecord>> {
    let raw = std::fs::read_to_string(path).map_err(|error| {
        EngineError::new(
            ErrorCode::MissingArtifact,
            format!("citation pool {} is unreadable: {error}", path.display()),
        )
        .with_details(json!({ "file": path.display().to_string() }))
    })?;
    let mut records = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: CitationRecord = serde_json::from_str(line).map_err(|error| {
            EngineError::new(
                ErrorCode::SchemaValidationFailed,
                format!("invalid citation record on line {}: {error}", index + 1),
            )
            .with_details(json!({ "json_path": format!("$[{index}]") }))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Captures a fixture set for later replay and repoints `latest`.
pub fn write_online_fixtures(
    run_root: &Path,
    results: &BTreeMap<String, Value>,
    timestamp_label: &str,
) -> EngineResult<String> {
    let fixture_name = format!("online-fixtures.{timestamp_label}.json");
    let fixture_rel = format!("citations/{fixture_name}");
    write_json_document(
        &resolve_inside_root(run_root, &fixture_rel)?,
        &json!({ "results": results }),
    )?;
    write_json_document(
        &resolve_inside_root(run_root, ONLINE_FIXTURES_LATEST_FILE)?,
        &OnlineFixturesPointer {
            fixture_file: fixture_name.clone(),
        },
    )?;
    Ok(fixture_rel)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sonar_core::{write_json_document, ErrorCode};
    use sonar_state::Sensitivity;

    use super::{
        citations_validate, load_citations, resolve_citation_mode, CitationMode,
        CitationStatus, CitationValidateRequest,
    };
    use crate::normalize::citations_normalize;

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn url_map(tempdir: &std::path::Path, urls: &[&str]) -> crate::normalize::UrlMapDocument {
        let urls: Vec<String> = urls.iter().map(|url| url.to_string()).collect();
        citations_normalize(tempdir, &urls).expect("url map")
    }

    #[test]
    fn unit_mode_resolution_follows_precedence() {
        let constraints = json!({
            "deep_research_flags": { "citations": { "mode": "online_replay" } }
        });
        assert_eq!(
            resolve_citation_mode(&constraints, None, Sensitivity::Normal),
            CitationMode::OnlineReplay
        );
        assert_eq!(
            resolve_citation_mode(&constraints, None, Sensitivity::NoWeb),
            CitationMode::Offline
        );
        let run_config = json!({ "effective": { "citations": { "mode": "online_dry_run" } } });
        assert_eq!(
            resolve_citation_mode(&json!({}), Some(&run_config), Sensitivity::Normal),
            CitationMode::OnlineDryRun
        );
        assert_eq!(
            resolve_citation_mode(&json!({}), None, Sensitivity::Restricted),
            CitationMode::Offline
        );
    }

    #[test]
    fn functional_offline_validation_reads_fixture_statuses() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let map = url_map(
            tempdir.path(),
            &["https://example.com/doc?id=2", "https://example.com/paywall"],
        );
        let fixtures_path = tempdir.path().join("fixtures.json");
        write_json_document(
            &fixtures_path,
            &json!({
                "statuses": {
                    "https://example.com/doc?id=2": { "status": "valid", "title": "Doc" },
                    "https://example.com/paywall": { "status": "paywalled" },
                }
            }),
        )
        .expect("fixtures");

        let records = citations_validate(&CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::Offline,
            url_map: &map,
            fixtures_path: Some(&fixtures_path),
            now_iso: NOW,
        })
        .expect("validation should run");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, CitationStatus::Valid);
        assert_eq!(records[0].title.as_deref(), Some("Doc"));
        assert_eq!(records[1].status, CitationStatus::Paywalled);

        let reloaded = load_citations(tempdir.path()).expect("pool should reload");
        assert_eq!(reloaded, records);
    }

    #[test]
    fn regression_offline_validation_requires_fixtures() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let map = url_map(tempdir.path(), &["https://example.com/a"]);
        let error = citations_validate(&CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::Offline,
            url_map: &map,
            fixtures_path: None,
            now_iso: NOW,
        })
        .expect_err("missing fixtures should fail");
        assert_eq!(error.code, ErrorCode::InvalidArgs);

        let missing = tempdir.path().join("absent.json");
        let error = citations_validate(&CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::Offline,
            url_map: &map,
            fixtures_path: Some(&missing),
            now_iso: NOW,
        })
        .expect_err("absent fixtures file should fail");
        assert_eq!(error.code, ErrorCode::InvalidArgs);
    }

    #[test]
    fn functional_dry_run_marks_everything_blocked_and_queues_urls() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let map = url_map(
            tempdir.path(),
            &["https://example.com/a", "https://example.net/b"],
        );
        let records = citations_validate(&CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::OnlineDryRun,
            url_map: &map,
            fixtures_path: None,
            now_iso: NOW,
        })
        .expect("dry-run should run");
        assert!(records
            .iter()
            .all(|record| record.status == CitationStatus::Blocked));
        assert_eq!(
            records[0].notes,
            "direct_fetch: skipped(dry-run); bright_data: skipped(dry-run); apify: skipped(dry-run)"
        );

        let queue = std::fs::read_to_string(tempdir.path().join("citations/blocked-urls.queue.md"))
            .expect("queue");
        assert!(queue.contains("1. https://example.com/a"));
        assert!(queue.contains("2. https://example.net/b"));
        assert!(tempdir.path().join("citations/blocked-urls.json").exists());
    }

    #[test]
    fn regression_ssrf_policy_invalidates_private_targets_in_online_modes() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let map = url_map(
            tempdir.path(),
            &["https://10.0.0.8/internal", "https://example.com/a"],
        );
        let records = citations_validate(&CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::OnlineDryRun,
            url_map: &map,
            fixtures_path: None,
            now_iso: NOW,
        })
        .expect("dry-run should run");
        let private = records
            .iter()
            .find(|record| record.normalized_url.contains("10.0.0.8"))
            .expect("private record");
        assert_eq!(private.status, CitationStatus::Invalid);
        assert_eq!(private.notes, "private/local target blocked by SSRF policy");
    }

    #[test]
    fn functional_replay_reconstitutes_identical_pools_without_network() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let map = url_map(tempdir.path(), &["https://example.com/a"]);
        let mut results = std::collections::BTreeMap::new();
        results.insert(
            "https://example.com/a".to_string(),
            json!({ "status": "valid", "title": "A", "notes": "fetched 200" }),
        );
        super::write_online_fixtures(tempdir.path(), &results, "20260301T100000Z")
            .expect("capture fixtures");

        let request = CitationValidateRequest {
            run_root: tempdir.path(),
            mode: CitationMode::OnlineReplay,
            url_map: &map,
            fixtures_path: None,
            now_iso: NOW,
        };
        let first = citations_validate(&request).expect("first replay");
        let first_raw = std::fs::read_to_string(tempdir.path().join("citations/citations.jsonl"))
            .expect("first pool");
        let second = citations_validate(&request).expect("second replay");
        let second_raw = std::fs::read_to_string(tempdir.path().join("citations/citations.jsonl"))
            .expect("second pool");
        assert_eq!(first, second);
        assert_eq!(first_raw, second_raw);
        assert_eq!(first[0].status, CitationStatus::Valid);
        assert_eq!(first[0].notes, "fetched 200");
    }
}
