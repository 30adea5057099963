use std::time::Duration;

/// Current UTC timestamp, ISO 8601 with millisecond precision.
/// Audit entries written within the same second still sort correctly.
pub fn utc_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Whole seconds of a wait, rounded up so a 500ms timeout reports as 1s.
pub fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}
