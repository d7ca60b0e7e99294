//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Raw epoch values above this are treated as milliseconds.
///
/// 10^11 seconds is roughly the year 5138, while 10^11 milliseconds is early 1973,
/// so any realistic capture time lands unambiguously on one side.
pub const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Current wall-clock time as whole seconds since the Unix epoch
pub fn unix_now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Current wall-clock time as milliseconds since the Unix epoch
pub fn unix_now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalise a client-supplied epoch value to seconds.
///
/// Devices report either seconds or milliseconds; anything above
/// [`EPOCH_MILLIS_CUTOFF`] is divided down to seconds.
pub fn normalize_epoch_secs(raw: i64) -> i64 {
    if raw > EPOCH_MILLIS_CUTOFF {
        raw / 1000
    } else {
        raw
    }
}

/// Convert epoch seconds to a UTC datetime (None if out of chrono's range)
pub fn secs_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_millis_matches_secs() {
        let secs = unix_now_secs();
        let millis = unix_now_millis();
        assert!((millis / 1000 - secs).abs() <= 1);
    }

    #[test]
    fn test_normalize_epoch_secs_passes_seconds_through() {
        assert_eq!(normalize_epoch_secs(1_700_000_000), 1_700_000_000);
        assert_eq!(normalize_epoch_secs(0), 0);
    }

    #[test]
    fn test_normalize_epoch_secs_converts_millis() {
        assert_eq!(normalize_epoch_secs(1_700_000_000_123), 1_700_000_000);
    }

    #[test]
    fn test_secs_to_datetime() {
        let dt = secs_to_datetime(1_234_567_890).unwrap();
        assert_eq!(dt.to_rfc3339(), "2009-02-13T23:31:30+00:00");
    }
}
