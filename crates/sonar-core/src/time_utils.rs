use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Formats a UTC instant as an ISO-8601 string with second precision.
pub fn format_iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Returns the current UTC wall clock formatted as ISO-8601.
///
/// Mutating operations take the caller's `now` instead of calling this so
/// tests can pin the clock; this helper feeds the outermost adapters.
pub fn now_iso() -> String {
    format_iso(Utc::now())
}

/// Parses an ISO-8601 timestamp into a UTC instant.
pub fn parse_iso(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid ISO-8601 timestamp '{raw}'"))
}

/// Returns whole seconds elapsed from `from_iso` to `to_iso`.
pub fn elapsed_seconds(from_iso: &str, to_iso: &str) -> Result<i64> {
    let from = parse_iso(from_iso)?;
    let to = parse_iso(to_iso)?;
    Ok((to - from).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::{elapsed_seconds, format_iso, parse_iso};

    #[test]
    fn unit_parse_iso_round_trips_formatted_instants() {
        let instant = parse_iso("2026-03-01T10:00:00Z").expect("timestamp should parse");
        assert_eq!(format_iso(instant), "2026-03-01T10:00:00Z");
    }

    #[test]
    fn unit_elapsed_seconds_measures_forward_spans() {
        let elapsed = elapsed_seconds("2026-03-01T10:00:00Z", "2026-03-01T10:10:00Z")
            .expect("span should compute");
        assert_eq!(elapsed, 600);
    }

    #[test]
    fn regression_parse_iso_rejects_garbage() {
        let error = parse_iso("not-a-timestamp").expect_err("garbage should fail");
        assert!(error.to_string().contains("invalid ISO-8601 timestamp"));
    }
}
