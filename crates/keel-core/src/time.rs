//! Timestamp helpers.
//!
//! All persisted timestamps are ISO-8601 UTC strings with microsecond
//! precision and a `Z` suffix. The fixed width keeps lexicographic order
//! equal to chronological order, which the eviction tie-break relies on.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as an ISO-8601 string, e.g. `2026-08-02T12:34:56.123456Z`.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_with_z() {
        assert!(now_iso().ends_with('Z'));
    }

    #[test]
    fn parses_back_as_rfc3339() {
        let ts = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
