//! Rate policies applied per author before a run is accepted.

use chrono::{DateTime, Utc};

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePolicy {
    /// At most one response per author every `Duration`.
    FixedCooldown(Duration),
    /// At most `max_count` responses per author in any trailing `window`.
    SlidingWindow { max_count: u32, window: Duration },
}

impl RatePolicy {
    /// The policy as a trailing window and the attempt count that saturates it.
    ///
    /// A cooldown is a window of its own length that one attempt fills.
    pub fn as_window(&self) -> (Duration, u32) {
        match *self {
            RatePolicy::FixedCooldown(cooldown) => (cooldown, 1),
            RatePolicy::SlidingWindow { max_count, window } => (window, max_count),
        }
    }

    /// Oldest attempt time that still counts against the author at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let (window, _) = self.as_window();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `attempts` (any order) put the author over the limit at `now`.
    pub fn is_limited(&self, now: DateTime<Utc>, attempts: &[DateTime<Utc>]) -> bool {
        let (_, max_count) = self.as_window();
        let start = self.window_start(now);
        let in_window = attempts.iter().filter(|at| **at > start).count();
        in_window >= max_count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn cooldown_blocks_until_duration_elapses() {
        let policy = RatePolicy::FixedCooldown(Duration::from_secs(300));
        let attempts = [at(0)];

        assert!(policy.is_limited(at(1), &attempts));
        assert!(policy.is_limited(at(299), &attempts));
        assert!(!policy.is_limited(at(300), &attempts));
        assert!(!policy.is_limited(at(301), &attempts));
    }

    #[test]
    fn cooldown_uses_latest_attempt() {
        let policy = RatePolicy::FixedCooldown(Duration::from_secs(300));
        let attempts = [at(0), at(400)];

        assert!(policy.is_limited(at(500), &attempts));
        assert!(!policy.is_limited(at(700), &attempts));
    }

    #[test]
    fn sliding_window_counts_recent_attempts() {
        let policy = RatePolicy::SlidingWindow {
            max_count: 2,
            window: Duration::from_secs(3600),
        };

        assert!(!policy.is_limited(at(10), &[at(0)]));
        assert!(policy.is_limited(at(10), &[at(0), at(5)]));
        // The first attempt ages out, one slot frees up.
        assert!(!policy.is_limited(at(3600), &[at(0), at(5)]));
        assert!(!policy.is_limited(at(3606), &[at(0), at(5)]));
    }

    #[test]
    fn no_attempts_is_never_limited() {
        let policy = RatePolicy::SlidingWindow {
            max_count: 1,
            window: Duration::from_secs(60),
        };
        assert!(!policy.is_limited(at(0), &[]));
    }
}
