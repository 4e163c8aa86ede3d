use chrono::{DateTime, Duration, TimeZone, Utc};

/// Convert epoch milliseconds into a UTC instant, `None` when out of range.
pub fn from_timestamp_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Whole seconds until `until`, rounded up. Zero when `until` is not in the future.
pub fn ceil_seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let remaining_ms = (until - now).num_milliseconds();
    if remaining_ms <= 0 {
        return 0;
    }
    ((remaining_ms + 999) / 1000) as u64
}

pub fn duration_from_ms(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
}

/// `at + by`, clamped to the latest representable instant.
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_seconds_until() {
        let now = Utc::now();
        assert_eq!(ceil_seconds_until(now, now + Duration::milliseconds(1)), 1);
        assert_eq!(ceil_seconds_until(now, now + Duration::milliseconds(1000)), 1);
        assert_eq!(ceil_seconds_until(now, now + Duration::milliseconds(1001)), 2);
        assert_eq!(ceil_seconds_until(now, now - Duration::seconds(5)), 0);
    }

    #[test]
    fn test_saturating_add_clamps() {
        let now = Utc::now();
        assert_eq!(saturating_add(now, Duration::seconds(1)), now + Duration::seconds(1));
        assert_eq!(saturating_add(now, duration_from_ms(u64::MAX)), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_from_timestamp_ms() {
        let ts = from_timestamp_ms(1_700_000_000_123).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }
}
