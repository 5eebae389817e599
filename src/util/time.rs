use chrono::{SecondsFormat, Utc};

pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1_000;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 / ISO-8601 string with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
