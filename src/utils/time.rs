//! Timestamp utilities for the wire clock and expiry checks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds, as written into packet headers.
///
/// Saturates to 0 if the system clock reads before the epoch rather than
/// failing; header timestamps are advisory.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_is_positive_and_monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(a > 1_500_000_000_000); // later than 2017
        assert!(b >= a);
    }
}
