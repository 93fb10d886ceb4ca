use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::atomic_io::write_text_atomic;
use crate::error::{EngineError, EngineResult, ErrorCode};

/// Renders a JSON value in the store's canonical text form: two-space
/// indentation plus a single trailing newline.
pub fn canonical_document_text(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
    text.push('\n');
    text
}

/// Atomically writes a JSON value in canonical text form.
pub fn write_json_value(path: &Path, value: &Value) -> EngineResult<()> {
    write_text_atomic(path, &canonical_document_text(value)).map_err(EngineError::from)
}

/// Atomically writes a serializable document in canonical text form.
pub fn write_json_document<T: Serialize>(path: &Path, document: &T) -> EngineResult<()> {
    let value = serde_json::to_value(document).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to encode {}: {error}", path.display()),
        )
    })?;
    write_json_value(path, &value)
}

/// Reads a JSON value from disk.
pub fn read_json_value(path: &Path) -> EngineResult<Value> {
    let raw = std::fs::read_to_string(path).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to read {}: {error}", path.display()),
        )
    })?;
    serde_json::from_str(&raw).map_err(|error| parse_failure(path, &error))
}

/// Reads and decodes a JSON document from disk.
pub fn read_json_document<T: DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let value = read_json_value(path)?;
    serde_json::from_value(value).map_err(|error| parse_failure(path, &error))
}

fn parse_failure(path: &Path, error: &serde_json::Error) -> EngineError {
    EngineError::new(
        ErrorCode::SchemaValidationFailed,
        format!("invalid document {}: {error}", path.display()),
    )
    .with_details(json!({ "json_path": "$", "file": path.display().to_string() }))
}
