use chrono::{DateTime, Utc};

/// `2006-01-02T15:04:05.000000000Z`: UTC with exactly nine fractional digits,
/// so that log lines sort lexically.
pub fn rfc3339_nano(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}
