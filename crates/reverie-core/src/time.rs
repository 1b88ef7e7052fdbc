//! Saturating clock arithmetic
//!
//! Observation timestamps come from outside and may sit anywhere in chrono's
//! range. Window bounds computed from them clamp at the ends of that range.

use chrono::{DateTime, Duration, Utc};

/// Longest configurable interval (100 years).
pub const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `secs` as a `Duration`, clamped to `MAX_INTERVAL_SECS`.
pub fn interval(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

pub fn saturating_sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_at_the_ends_of_the_range() {
        let hour = Duration::hours(1);
        assert_eq!(saturating_sub(DateTime::<Utc>::MIN_UTC, hour), DateTime::<Utc>::MIN_UTC);
        assert_eq!(saturating_add(DateTime::<Utc>::MAX_UTC, hour), DateTime::<Utc>::MAX_UTC);
        assert_eq!(interval(u64::MAX), Duration::seconds(MAX_INTERVAL_SECS as i64));
    }
}
