use chrono::{DateTime, Utc};

/// Current UTC time, truncated to whole seconds.
pub fn utc_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Render a timestamp in ISO 8601 form, e.g. `2025-01-01T00:00:00Z`.
pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
