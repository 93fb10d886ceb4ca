use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Stable machine-readable error codes returned by every public entrypoint.
pub enum ErrorCode {
    // Concurrency.
    RevisionMismatch,
    LockHeld,
    // Lifecycle.
    Disabled,
    Paused,
    Cancelled,
    AlreadyTerminated,
    // Gate / stage.
    MissingArtifact,
    GateBlocked,
    WaveCapExceeded,
    ReviewCapExceeded,
    RetryCapExceeded,
    RetryExhausted,
    RetryRequired,
    // Validation.
    SchemaValidationFailed,
    ImmutableField,
    LifecycleRuleViolation,
    InvalidArgs,
    // Wave output contract.
    MissingRequiredSection,
    TooManySources,
    TooManyWords,
    MalformedSources,
    PerspectiveNotFound,
    // Citations / pivot.
    GapsParseFailed,
    Wave1ContractNotMet,
    RawUrlNotAllowed,
    UnknownCid,
    // Safety.
    PathTraversal,
    WaveDirSymlink,
    InvalidWaveDir,
    AgentResultPromptDigestConflict,
    InvalidReviewBundle,
    // Drivers.
    RunAgentRequired,
    DriverError,
    // Non-typed fault propagation (unexpected I/O and similar).
    Internal,
}

impl ErrorCode {
    /// Returns the wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RevisionMismatch => "REVISION_MISMATCH",
            Self::LockHeld => "LOCK_HELD",
            Self::Disabled => "DISABLED",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::AlreadyTerminated => "ALREADY_TERMINATED",
            Self::MissingArtifact => "MISSING_ARTIFACT",
            Self::GateBlocked => "GATE_BLOCKED",
            Self::WaveCapExceeded => "WAVE_CAP_EXCEEDED",
            Self::ReviewCapExceeded => "REVIEW_CAP_EXCEEDED",
            Self::RetryCapExceeded => "RETRY_CAP_EXCEEDED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::RetryRequired => "RETRY_REQUIRED",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::ImmutableField => "IMMUTABLE_FIELD",
            Self::LifecycleRuleViolation => "LIFECYCLE_RULE_VIOLATION",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::MissingRequiredSection => "MISSING_REQUIRED_SECTION",
            Self::TooManySources => "TOO_MANY_SOURCES",
            Self::TooManyWords => "TOO_MANY_WORDS",
            Self::MalformedSources => "MALFORMED_SOURCES",
            Self::PerspectiveNotFound => "PERSPECTIVE_NOT_FOUND",
            Self::GapsParseFailed => "GAPS_PARSE_FAILED",
            Self::Wave1ContractNotMet => "WAVE1_CONTRACT_NOT_MET",
            Self::RawUrlNotAllowed => "RAW_URL_NOT_ALLOWED",
            Self::UnknownCid => "UNKNOWN_CID",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::WaveDirSymlink => "WAVE_DIR_SYMLINK",
            Self::InvalidWaveDir => "INVALID_WAVE_DIR",
            Self::AgentResultPromptDigestConflict => "AGENT_RESULT_PROMPT_DIGEST_CONFLICT",
            Self::InvalidReviewBundle => "INVALID_REVIEW_BUNDLE",
            Self::RunAgentRequired => "RUN_AGENT_REQUIRED",
            Self::DriverError => "DRIVER_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
/// Typed error carried unchanged from the failing component to the caller.
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl EngineError {
    /// Builds a typed error without structured details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attaches structured details to the error.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("{error:#}"))
    }
}

/// Result alias used by every public Sonar entrypoint.
pub type EngineResult<T> = Result<T, EngineError>;

/// Wraps a successful payload in the `{ ok: true, ... }` envelope.
pub fn envelope_ok(payload: Value) -> Value {
    match payload {
        Value::Object(mut fields) => {
            fields.insert("ok".to_string(), Value::Bool(true));
            Value::Object(fields)
        }
        other => json!({ "ok": true, "result": other }),
    }
}

/// Wraps a typed error in the `{ ok: false, error: { ... } }` envelope.
pub fn envelope_err(error: &EngineError) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": error.code.as_str(),
            "message": error.message,
            "details": error.details,
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{envelope_err, envelope_ok, EngineError, ErrorCode};

    #[test]
    fn unit_error_code_serializes_in_wire_form() {
        let encoded = serde_json::to_string(&ErrorCode::RevisionMismatch).expect("encode");
        assert_eq!(encoded, "\"REVISION_MISMATCH\"");
        let decoded: ErrorCode = serde_json::from_str("\"GATE_BLOCKED\"").expect("decode");
        assert_eq!(decoded, ErrorCode::GateBlocked);
    }

    #[test]
    fn unit_engine_error_display_carries_code_and_message() {
        let error = EngineError::new(ErrorCode::LockHeld, "run lock is held");
        assert_eq!(error.to_string(), "LOCK_HELD: run lock is held");
    }

    #[test]
    fn functional_envelopes_round_trip_success_and_failure() {
        let ok = envelope_ok(json!({ "revision": 2 }));
        assert_eq!(ok["ok"], json!(true));
        assert_eq!(ok["revision"], json!(2));

        let error = EngineError::new(ErrorCode::MissingArtifact, "perspectives.json missing")
            .with_details(json!({ "file": "perspectives.json" }));
        let err = envelope_err(&error);
        assert_eq!(err["ok"], json!(false));
        assert_eq!(err["error"]["code"], json!("MISSING_ARTIFACT"));
        assert_eq!(err["error"]["details"]["file"], json!("perspectives.json"));
    }

    #[test]
    fn regression_envelope_ok_wraps_non_object_payloads() {
        let wrapped = envelope_ok(json!(41));
        assert_eq!(wrapped["ok"], json!(true));
        assert_eq!(wrapped["result"], json!(41));
    }
}
