//! # Stage: Deduplicator
//!
//! ## Responsibility
//! Suppresses repeated emission of the same error type within a time window,
//! shared by the log analyzer and health prober outputs. Backed by a bounded
//! ring of `(type, timestamp)` pairs; oldest entries are evicted once the
//! ring exceeds its capacity (default 10).
//!
//! ## Guarantees
//! - Monotonic window: no two events of identical type are accepted within
//!   the configured window
//! - Bounded: ring capacity is fixed; memory does not grow with uptime
//! - No side effects beyond updating the ring on acceptance

use std::collections::VecDeque;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Deduplicator {
    window: Duration,
    cap: usize,
    /// `(type_name, accepted_at_ms)`, oldest first.
    ring: VecDeque<(String, u64)>,
}

impl Deduplicator {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            window,
            cap: cap.max(1),
            ring: VecDeque::with_capacity(cap.max(1)),
        }
    }

    /// `true` iff an event of the same type was accepted within the window.
    /// Pure read — does not update the ring.
    pub fn should_suppress(&self, type_name: &str, now_ms: u64) -> bool {
        let window_ms = self.window.as_millis() as u64;
        self.ring
            .iter()
            .rev()
            .any(|(t, at)| t == type_name && now_ms.saturating_sub(*at) < window_ms)
    }

    /// Record an accepted event, evicting the oldest entry when full.
    pub fn accept(&mut self, type_name: impl Into<String>, now_ms: u64) {
        if self.ring.len() >= self.cap {
            self.ring.pop_front();
        }
        self.ring.push_back((type_name.into(), now_ms));
    }

    /// Combined check-and-record: returns `true` when the event is accepted
    /// (and recorded), `false` when it is suppressed.
    pub fn check_and_accept(&mut self, type_name: &str, now_ms: u64) -> bool {
        if self.should_suppress(type_name, now_ms) {
            return false;
        }
        self.accept(type_name, now_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dedup_60s() -> Deduplicator {
        Deduplicator::new(Duration::from_secs(60), 10)
    }

    // ===== Window semantics =====

    #[test]
    fn test_first_event_always_accepted() {
        let mut d = dedup_60s();
        assert!(d.check_and_accept("db_down", 1_000));
    }

    #[test]
    fn test_repeat_within_window_suppressed() {
        // Two events of type X arrive 5 s apart with a 60 s window.
        let mut d = dedup_60s();
        assert!(d.check_and_accept("x", 0));
        assert!(!d.check_and_accept("x", 5_000));
    }

    #[test]
    fn test_repeat_after_window_accepted() {
        // 65 s after the first: outside the window, accepted again.
        let mut d = dedup_60s();
        assert!(d.check_and_accept("x", 0));
        assert!(d.check_and_accept("x", 65_000));
    }

    #[test]
    fn test_boundary_exactly_window_is_accepted() {
        // now - at == window is not "within" the window.
        let mut d = dedup_60s();
        d.accept("x", 0);
        assert!(!d.should_suppress("x", 60_000));
    }

    #[test]
    fn test_different_types_independent() {
        let mut d = dedup_60s();
        assert!(d.check_and_accept("x", 0));
        assert!(d.check_and_accept("y", 1));
    }

    #[test]
    fn test_should_suppress_is_pure() {
        let mut d = dedup_60s();
        d.accept("x", 0);
        let before = d.len();
        let _ = d.should_suppress("x", 1);
        let _ = d.should_suppress("y", 1);
        assert_eq!(d.len(), before);
    }

    // ===== Ring bounds =====

    #[test]
    fn test_ring_capped() {
        let mut d = Deduplicator::new(Duration::from_secs(60), 3);
        for i in 0..10u64 {
            d.accept(format!("t{i}"), i);
        }
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_eviction_forgets_oldest_type() {
        let mut d = Deduplicator::new(Duration::from_secs(60), 2);
        d.accept("a", 0);
        d.accept("b", 1);
        d.accept("c", 2); // evicts "a"
        assert!(!d.should_suppress("a", 3));
        assert!(d.should_suppress("b", 3));
    }

    #[test]
    fn test_zero_cap_clamped_to_one() {
        let mut d = Deduplicator::new(Duration::from_secs(60), 0);
        assert!(d.check_and_accept("x", 0));
        assert!(!d.check_and_accept("x", 1));
    }

    // ===== Dedup invariant (property) =====

    proptest! {
        #[test]
        fn prop_second_event_within_window_suppressed(
            t1 in 0u64..1_000_000,
            delta in 1u64..60_000,
        ) {
            // For all t1 < t2 with t2 - t1 < window, only t1 is accepted.
            let mut d = dedup_60s();
            prop_assert!(d.check_and_accept("x", t1));
            prop_assert!(!d.check_and_accept("x", t1 + delta));
        }

        #[test]
        fn prop_second_event_outside_window_accepted(
            t1 in 0u64..1_000_000,
            delta in 60_000u64..10_000_000,
        ) {
            let mut d = dedup_60s();
            prop_assert!(d.check_and_accept("x", t1));
            prop_assert!(d.check_and_accept("x", t1 + delta));
        }
    }
}
