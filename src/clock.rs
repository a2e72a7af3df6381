//! Event Clock
//!
//! Monotone event-time clock with nanosecond resolution. In simulation mode
//! this is the single source of time for every component; in live mode the
//! gateway stamps events with exchange time and the clock just tracks the
//! latest observed timestamp.

use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Monotone non-decreasing event clock.
///
/// `update()` ignores backward timestamps (out-of-order packets must not
/// rewind logical time); `now()` never consults the system clock.
#[derive(Debug, Clone)]
pub struct EventClock {
    current: Nanos,
}

impl EventClock {
    #[inline]
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: start_time,
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.current
    }

    #[inline]
    pub fn now_millis(&self) -> i64 {
        self.current / NANOS_PER_MILLI
    }

    #[inline]
    pub fn now_secs(&self) -> i64 {
        self.current / NANOS_PER_SEC
    }

    /// Advance to `ts` if it is at or after the current time.
    #[inline]
    pub fn update(&mut self, ts: Nanos) {
        if ts >= self.current {
            self.current = ts;
        }
    }

    /// Nanoseconds elapsed since a past timestamp (clamped at zero).
    #[inline]
    pub fn elapsed_since(&self, past: Nanos) -> Nanos {
        (self.current - past).max(0)
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for EventClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.current / NANOS_PER_SEC;
        let nanos = self.current % NANOS_PER_SEC;
        write!(f, "{}.{:09}s", secs, nanos)
    }
}

/// Convert a chrono timestamp to `Nanos`.
#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Parse an RFC3339 string to `Nanos`.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&chrono::Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotone() {
        let mut clock = EventClock::new(1_000_000_000);
        clock.update(2_000_000_000);
        assert_eq!(clock.now(), 2_000_000_000);

        // Backward timestamps are ignored, not applied.
        clock.update(500_000_000);
        assert_eq!(clock.now(), 2_000_000_000);
    }

    #[test]
    fn test_clock_conversions() {
        let clock = EventClock::new(1_700_000_000 * NANOS_PER_SEC);
        assert_eq!(clock.now_secs(), 1_700_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_timestamp() {
        let ns = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(ns, 1_704_067_200 * NANOS_PER_SEC);
        assert!(parse_timestamp("not a time").is_none());
    }
}
