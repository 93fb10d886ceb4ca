use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{EngineError, EngineResult, ErrorCode};

/// Schema tag carried by the perspectives document.
pub const PERSPECTIVES_SCHEMA_VERSION: &str = "perspectives.v1";
/// Perspectives file name inside a run root.
pub const PERSPECTIVES_FILE: &str = "perspectives.json";

fn perspectives_schema_version() -> String {
    PERSPECTIVES_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `PerspectiveTrack` values.
pub enum PerspectiveTrack {
    Standard,
    Independent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Output contract one agent perspective must honor.
pub struct PromptContract {
    pub max_words: usize,
    pub max_sources: usize,
    pub tool_budget: u32,
    #[serde(default)]
    pub must_include_sections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One agent invocation unit.
pub struct Perspective {
    pub id: String,
    pub title: String,
    pub track: PerspectiveTrack,
    pub agent_type: String,
    pub prompt_contract: PromptContract,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The ordered perspective roster for one run.
pub struct PerspectivesDocument {
    #[serde(default = "perspectives_schema_version")]
    pub schema_version: String,
    pub perspectives: Vec<Perspective>,
}

impl PerspectivesDocument {
    /// Returns the roster sorted lexicographically by id; every wave
    /// plan and review walks perspectives in this order.
    pub fn sorted_by_id(&self) -> Vec<&Perspective> {
        let mut sorted: Vec<&Perspective> = self.perspectives.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        sorted
    }

    /// Finds a perspective by id.
    pub fn find(&self, id: &str) -> Option<&Perspective> {
        self.perspectives.iter().find(|perspective| perspective.id == id)
    }
}

/// Loads and validates the perspectives document.
pub fn load_perspectives(path: &Path) -> EngineResult<PerspectivesDocument> {
    let document: PerspectivesDocument = sonar_core::read_json_document(path)?;
    validate_perspectives(&document)?;
    Ok(document)
}

/// Validates roster shape: schema version, non-empty list, id pattern
/// (no path segments), unique ids, sane contract budgets.
pub fn validate_perspectives(document: &PerspectivesDocument) -> EngineResult<()> {
    if document.schema_version != PERSPECTIVES_SCHEMA_VERSION {
        return Err(schema_failure(
            "$.schema_version",
            format!(
                "unsupported perspectives schema version '{}'",
                document.schema_version
            ),
        ));
    }
    if document.perspectives.is_empty() {
        return Err(schema_failure(
            "$.perspectives",
            "perspectives list cannot be empty",
        ));
    }
    let id_shape = Regex::new("^[A-Za-z0-9_-]+$").map_err(|error| {
        EngineError::new(ErrorCode::Internal, format!("invalid id regex: {error}"))
    })?;
    let mut seen: HashSet<&str> = HashSet::new();
    for (index, perspective) in document.perspectives.iter().enumerate() {
        if !id_shape.is_match(&perspective.id) {
            return Err(schema_failure(
                &format!("$.perspectives[{index}].id"),
                format!("perspective id '{}' is not [A-Za-z0-9_-]+", perspective.id),
            ));
        }
        if !seen.insert(perspective.id.as_str()) {
            return Err(schema_failure(
                &format!("$.perspectives[{index}].id"),
                format!("duplicate perspective id '{}'", perspective.id),
            ));
        }
        if perspective.prompt_contract.max_words == 0 {
            return Err(schema_failure(
                &format!("$.perspectives[{index}].prompt_contract.max_words"),
                "max_words must be positive",
            ));
        }
        if perspective.prompt_contract.max_sources == 0 {
            return Err(schema_failure(
                &format!("$.perspectives[{index}].prompt_contract.max_sources"),
                "max_sources must be positive",
            ));
        }
    }
    Ok(())
}

fn schema_failure(json_path: &str, message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorCode::SchemaValidationFailed, message.into())
        .with_details(json!({ "json_path": json_path }))
}

#[cfg(test)]
pub(crate) fn sample_roster() -> PerspectivesDocument {
    PerspectivesDocument {
        schema_version: PERSPECTIVES_SCHEMA_VERSION.to_string(),
        perspectives: vec![
            Perspective {
                id: "p1".to_string(),
                title: "Market landscape".to_string(),
                track: PerspectiveTrack::Standard,
                agent_type: "researcher".to_string(),
                prompt_contract: PromptContract {
                    max_words: 400,
                    max_sources: 5,
                    tool_budget: 10,
                    must_include_sections: vec![
                        "Findings".to_string(),
                        "Sources".to_string(),
                        "Gaps".to_string(),
                    ],
                },
            },
            Perspective {
                id: "p2".to_string(),
                title: "Regulatory posture".to_string(),
                track: PerspectiveTrack::Independent,
                agent_type: "analyst".to_string(),
                prompt_contract: PromptContract {
                    max_words: 400,
                    max_sources: 5,
                    tool_budget: 10,
                    must_include_sections: vec![
                        "Findings".to_string(),
                        "Sources".to_string(),
                        "Gaps".to_string(),
                    ],
                },
            },
        ],
    }
}
