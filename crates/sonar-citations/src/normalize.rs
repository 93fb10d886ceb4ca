use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{cid_for_url, resolve_inside_root, write_json_document, EngineError, EngineResult, ErrorCode};
use url::Url;

/// URL map location inside a run root.
pub const URL_MAP_FILE: &str = "citations/url-map.json";
/// Schema tag carried by the URL map.
pub const URL_MAP_SCHEMA_VERSION: &str = "url_map.v1";

fn url_map_schema_version() -> String {
    URL_MAP_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One original-to-normalized URL mapping with its stable citation id.
pub struct UrlMapItem {
    pub url_original: String,
    pub normalized_url: String,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The URL map document.
pub struct UrlMapDocument {
    #[serde(default = "url_map_schema_version")]
    pub schema_version: String,
    pub items: Vec<UrlMapItem>,
}

impl UrlMapDocument {
    /// Returns the distinct normalized URLs in sorted order.
    pub fn normalized_urls(&self) -> Vec<String> {
        let unique: BTreeSet<&str> = self
            .items
            .iter()
            .map(|item| item.normalized_url.as_str())
            .collect();
        unique.into_iter().map(str::to_string).collect()
    }

    /// Returns the distinct cids in normalized-URL order.
    pub fn cids(&self) -> Vec<String> {
        let unique: BTreeSet<(&str, &str)> = self
            .items
            .iter()
            .map(|item| (item.normalized_url.as_str(), item.cid.as_str()))
            .collect();
        unique.into_iter().map(|(_, cid)| cid.to_string()).collect()
    }
}

/// Normalizes one URL: lowercase scheme and host, drop the fragment,
/// drop `utm_*` tracking params, coalesce duplicate query keys (first
/// occurrence wins), and strip the trailing slash.
pub fn normalize_url(raw: &str) -> EngineResult<String> {
    let mut url = Url::parse(raw).map_err(|error| {
        EngineError::new(ErrorCode::InvalidArgs, format!("unparseable URL '{raw}': {error}"))
            .with_details(json!({ "url": raw }))
    })?;
    url.set_fragment(None);

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut kept: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key.to_ascii_lowercase().starts_with("utm_") {
            continue;
        }
        if kept.iter().any(|(seen, _)| *seen == key) {
            continue;
        }
        kept.push((key, value));
    }
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut normalized = url.to_string();
    if normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

/// Builds the URL map for a list of extracted URLs (already sorted) and
/// persists it.
pub fn citations_normalize(run_root: &Path, urls: &[String]) -> EngineResult<UrlMapDocument> {
    let mut items = Vec::with_capacity(urls.len());
    for raw in urls {
        let normalized = normalize_url(raw)?;
        let cid = cid_for_url(&normalized);
        items.push(UrlMapItem {
            url_original: raw.clone(),
            normalized_url: normalized,
            cid,
        });
    }
    items.sort_by(|a, b| crate::collate::url_collate(&a.url_original, &b.url_original));

    let document = UrlMapDocument {
        schema_version: url_map_schema_version(),
        items,
    };
    write_json_document(&resolve_inside_root(run_root, URL_MAP_FILE)?, &document)?;
    Ok(document)
}

/// Loads a previously written URL map.
pub fn load_url_map(run_root: &Path) -> EngineResult<UrlMapDocument> {
    let path = resolve_inside_root(run_root, URL_MAP_FILE)?;
    sonar_core::read_json_document(&path)
}

#[cfg(test)]
mod tests {
    use sonar_core::ErrorCode;

    use super::{citations_normalize, normalize_url};

    #[test]
    fn functional_normalize_matches_the_documented_equivalences() {
        assert_eq!(
            normalize_url("https://example.com/doc/?utm_source=news&id=2").expect("normalize"),
            "https://example.com/doc?id=2"
        );
        assert_eq!(
            normalize_url("https://example.com/doc?id=2").expect("normalize"),
            "https://example.com/doc?id=2"
        );
        assert_eq!(
            normalize_url("https://example.net/report/#frag").expect("normalize"),
            "https://example.net/report"
        );
        assert_eq!(
            normalize_url("https://example.com/paywall").expect("normalize"),
            "https://example.com/paywall"
        );
        assert_eq!(
            normalize_url("https://example.com/").expect("normalize"),
            "https://example.com"
        );
    }

    #[test]
    fn unit_normalize_coalesces_duplicate_query_keys_first_wins() {
        assert_eq!(
            normalize_url("https://example.com/doc?id=2&id=9&sort=asc").expect("normalize"),
            "https://example.com/doc?id=2&sort=asc"
        );
    }

    #[test]
    fn regression_normalize_rejects_garbage() {
        let error = normalize_url("not a url").expect_err("garbage should fail");
        assert_eq!(error.code, ErrorCode::InvalidArgs);
    }

    #[test]
    fn functional_url_map_merges_equivalent_urls_into_one_cid() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let urls = vec![
            "https://example.com/doc?id=2".to_string(),
            "https://example.com/doc/?utm_source=news&id=2".to_string(),
            "https://example.com/paywall".to_string(),
            "https://example.net/report/#frag".to_string(),
        ];
        let map = citations_normalize(tempdir.path(), &urls).expect("normalize should run");
        assert_eq!(map.items.len(), 4);
        assert_eq!(map.normalized_urls().len(), 3);
        assert_eq!(map.cids().len(), 3);
        assert_eq!(map.items[0].cid, map.items[1].cid);
        assert!(map.items[0].cid.starts_with("cid_"));
        assert!(tempdir.path().join("citations/url-map.json").exists());
    }
}
