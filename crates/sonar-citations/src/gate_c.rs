use serde_json::{json, Value};
use sonar_state::GateStatus;

use crate::validate::{CitationRecord, CitationStatus};

/// Pass thresholds for Gate C.
pub const GATE_C_MIN_VALIDATED_RATE: f64 = 0.9;
pub const GATE_C_MAX_INVALID_RATE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
/// Gate C verdict plus the metrics persisted with the gate update.
pub struct GateCEvaluation {
    pub status: GateStatus,
    pub metrics: Value,
}

/// Computes Gate C from the validated pool.
///
/// `validated_url_rate = (valid + paywalled) / total`; the gate passes
/// when that rate is at least 0.9, the invalid rate is at most 0.1, and
/// every expected cid is categorized.
pub fn gate_c_evaluate(records: &[CitationRecord], expected_cids: &[String]) -> GateCEvaluation {
    let mut valid = 0usize;
    let mut paywalled = 0usize;
    let mut invalid = 0usize;
    let mut blocked = 0usize;
    let mut mismatch = 0usize;
    for record in records {
        match record.status {
            CitationStatus::Valid => valid += 1,
            CitationStatus::Paywalled => paywalled += 1,
            CitationStatus::Invalid => invalid += 1,
            CitationStatus::Blocked => blocked += 1,
            CitationStatus::Mismatch => mismatch += 1,
        }
    }
    let uncategorized = expected_cids
        .iter()
        .filter(|cid| !records.iter().any(|record| record.cid == **cid))
        .count();

    let total = records.len() + uncategorized;
    let (validated_url_rate, invalid_url_rate, uncategorized_url_rate) = if total == 0 {
        (1.0, 0.0, 0.0)
    } else {
        (
            (valid + paywalled) as f64 / total as f64,
            invalid as f64 / total as f64,
            uncategorized as f64 / total as f64,
        )
    };

    let pass = validated_url_rate >= GATE_C_MIN_VALIDATED_RATE
        && invalid_url_rate <= GATE_C_MAX_INVALID_RATE
        && uncategorized_url_rate == 0.0;

    GateCEvaluation {
        status: if pass { GateStatus::Pass } else { GateStatus::Fail },
        metrics: json!({
            "total": total,
            "valid": valid,
            "paywalled": paywalled,
            "invalid": invalid,
            "blocked": blocked,
            "mismatch": mismatch,
            "uncategorized": uncategorized,
            "validated_url_rate": validated_url_rate,
            "invalid_url_rate": invalid_url_rate,
            "uncategorized_url_rate": uncategorized_url_rate,
        }),
    }
}
