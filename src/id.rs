//! Unique id generation and time helpers.
//!
//! Ids are timestamp-based (seconds + microseconds + atomic counter) so they
//! sort by creation time and stay unique when many records are created within
//! one second.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Generate a unique id with sub-second precision.
///
/// Format: seconds + microseconds + counter suffix (e.g. "1737802800123456789").
pub fn generate_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let secs = duration.as_secs();
    let micros = duration.subsec_micros();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{}{:06}{:04}", secs, micros, counter % 10000)
}

/// Current time as seconds since epoch.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Render an epoch-seconds timestamp as ISO-8601 text.
pub fn to_iso8601(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_numeric() {
        let id = generate_id();
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert!(id.len() >= 16);
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let ids: Vec<String> = (0..100).map(|_| generate_id()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "ids should be unique");
    }

    #[test]
    fn test_now_secs_is_positive() {
        assert!(now_secs() > 1_600_000_000);
    }

    #[test]
    fn test_to_iso8601() {
        let iso = to_iso8601(0);
        assert!(iso.starts_with("1970-01-01T00:00:00"));
    }
}
