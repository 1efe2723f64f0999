//! Daily per-token quota tracking
//!
//! Admission and consumption are separate steps: `try_consume` only checks,
//! `commit` counts. A batch that produced no observed effect never calls
//! `commit` and therefore costs nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;

use super::clock::{Clock, SystemClock};

/// Daily limit applied when none is configured
pub const DEFAULT_DAILY_LIMIT: u32 = 150;

/// Entry count above which stale windows are pruned on insert
const PRUNE_THRESHOLD: usize = 1024;

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { count: u32, limit: u32 },
    Denied { count: u32, limit: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn count(&self) -> u32 {
        match self {
            Admission::Admitted { count, .. } | Admission::Denied { count, .. } => *count,
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Admission::Admitted { limit, .. } | Admission::Denied { limit, .. } => *limit,
        }
    }
}

/// Point-in-time usage of one token's window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl QuotaUsage {
    fn new(used: u32, limit: u32) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
        }
    }

    /// `(remaining/limit)`, as reported to callers
    pub fn remains(&self) -> String {
        format!("({}/{})", self.remaining, self.limit)
    }
}

#[derive(Debug)]
struct QuotaEntry {
    count: u32,
    window_start: NaiveDateTime,
}

impl QuotaEntry {
    fn new(now: NaiveDateTime) -> Self {
        Self {
            count: 0,
            window_start: start_of_day(now),
        }
    }

    /// Reset the window if `now` is on a later calendar day
    fn roll(&mut self, now: NaiveDateTime) {
        if now.date() > self.window_start.date() {
            self.count = 0;
            self.window_start = start_of_day(now);
        }
    }
}

fn start_of_day(now: NaiveDateTime) -> NaiveDateTime {
    now.date().and_time(NaiveTime::MIN)
}

/// Per-token daily counters with midnight reset
///
/// The outer map lock is only held to find or create an entry; the entry's
/// own lock serializes operations on that token. Neither lock is ever held
/// across an await point.
pub struct QuotaTracker {
    limit: u32,
    entries: Mutex<HashMap<String, Arc<Mutex<QuotaEntry>>>>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(limit: u32) -> Self {
        Self::with_clock(limit, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    fn entry(&self, token: &str, now: NaiveDateTime) -> Arc<Mutex<QuotaEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(token) {
            return Arc::clone(entry);
        }

        if entries.len() >= PRUNE_THRESHOLD {
            prune_stale(&mut entries, now);
        }

        let entry = Arc::new(Mutex::new(QuotaEntry::new(now)));
        entries.insert(token.to_string(), Arc::clone(&entry));
        entry
    }

    /// Check whether `token` may send one more batch at `now`
    pub fn try_consume_at(&self, token: &str, now: NaiveDateTime) -> Admission {
        let entry = self.entry(token, now);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.roll(now);

        if entry.count >= self.limit {
            Admission::Denied {
                count: entry.count,
                limit: self.limit,
            }
        } else {
            Admission::Admitted {
                count: entry.count,
                limit: self.limit,
            }
        }
    }

    pub fn try_consume(&self, token: &str) -> Admission {
        self.try_consume_at(token, self.clock.now())
    }

    /// Count one effective batch against `token`
    ///
    /// Concurrent batches admitted at `limit - 1` can both commit; the
    /// counter then stays at `limit` and later admissions are denied.
    pub fn commit_at(&self, token: &str, now: NaiveDateTime) -> QuotaUsage {
        let entry = self.entry(token, now);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.roll(now);

        if entry.count < self.limit {
            entry.count += 1;
        } else {
            tracing::warn!("Commit for a token already at its daily limit of {}", self.limit);
        }

        QuotaUsage::new(entry.count, self.limit)
    }

    pub fn commit(&self, token: &str) -> QuotaUsage {
        self.commit_at(token, self.clock.now())
    }

    /// Usage of `token`'s current window; unseen tokens report zero use
    pub fn usage_at(&self, token: &str, now: NaiveDateTime) -> QuotaUsage {
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get(token).cloned()
        };

        match entry {
            Some(entry) => {
                let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
                entry.roll(now);
                QuotaUsage::new(entry.count, self.limit)
            }
            None => QuotaUsage::new(0, self.limit),
        }
    }

    pub fn usage(&self, token: &str) -> QuotaUsage {
        self.usage_at(token, self.clock.now())
    }

    /// Number of tracked tokens
    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("limit", &self.limit)
            .field("tracked", &self.tracked())
            .finish()
    }
}

/// Drop entries whose window ended before today; they would reset anyway.
/// Entries currently locked are in use and kept.
fn prune_stale(entries: &mut HashMap<String, Arc<Mutex<QuotaEntry>>>, now: NaiveDateTime) {
    let before = entries.len();
    entries.retain(|_, entry| match entry.try_lock() {
        Ok(entry) => entry.window_start.date() >= now.date(),
        Err(_) => true,
    });
    tracing::debug!("Pruned {} stale quota entries", before - entries.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ManualClock;
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::*;

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    #[test]
    fn test_unseen_token_admitted() {
        let tracker = QuotaTracker::new(150);
        let admission = tracker.try_consume_at("tok", at(1, 9, 0));
        assert_eq!(admission, Admission::Admitted { count: 0, limit: 150 });
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn test_try_consume_does_not_count() {
        let tracker = QuotaTracker::new(3);
        for _ in 0..10 {
            assert!(tracker.try_consume_at("tok", at(1, 9, 0)).is_admitted());
        }
        assert_eq!(tracker.usage_at("tok", at(1, 9, 0)).used, 0);
    }

    #[test]
    fn test_denied_at_limit() {
        let tracker = QuotaTracker::new(2);
        let now = at(1, 12, 0);
        tracker.commit_at("tok", now);
        tracker.commit_at("tok", now);

        assert_eq!(
            tracker.try_consume_at("tok", now),
            Admission::Denied { count: 2, limit: 2 }
        );
    }

    #[test]
    fn test_commit_never_exceeds_limit() {
        let tracker = QuotaTracker::new(1);
        let now = at(1, 12, 0);
        assert_eq!(tracker.commit_at("tok", now).used, 1);
        let usage = tracker.commit_at("tok", now);
        assert_eq!(usage.used, 1);
        assert_eq!(usage.remaining, 0);
    }

    #[test]
    fn test_reset_after_midnight() {
        let tracker = QuotaTracker::new(2);
        tracker.commit_at("tok", at(1, 23, 58));
        tracker.commit_at("tok", at(1, 23, 59));
        assert!(!tracker.try_consume_at("tok", at(1, 23, 59)).is_admitted());

        let admission = tracker.try_consume_at("tok", at(2, 0, 0));
        assert_eq!(admission, Admission::Admitted { count: 0, limit: 2 });
    }

    #[test]
    fn test_reset_is_idempotent() {
        let tracker = QuotaTracker::new(5);
        for _ in 0..5 {
            tracker.commit_at("tok", at(1, 10, 0));
        }

        for minute in 0..10 {
            let admission = tracker.try_consume_at("tok", at(2, 8, minute));
            assert_eq!(admission.count(), 0);
        }
    }

    #[test]
    fn test_clock_going_backwards_does_not_reset() {
        let tracker = QuotaTracker::new(5);
        tracker.commit_at("tok", at(2, 10, 0));
        assert_eq!(tracker.try_consume_at("tok", at(1, 23, 0)).count(), 1);
    }

    #[test]
    fn test_tokens_are_independent() {
        let tracker = QuotaTracker::new(1);
        let now = at(1, 12, 0);
        tracker.commit_at("a", now);
        assert!(!tracker.try_consume_at("a", now).is_admitted());
        assert!(tracker.try_consume_at("b", now).is_admitted());
    }

    #[test]
    fn test_usage_and_remains() {
        let tracker = QuotaTracker::new(150);
        let usage = tracker.commit_at("tok", at(1, 12, 0));
        assert_eq!(usage.remaining, 149);
        assert_eq!(usage.remains(), "(149/150)");
        assert_eq!(tracker.usage_at("other", at(1, 12, 0)).remains(), "(150/150)");
    }

    #[test]
    fn test_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(at(1, 22, 0)));
        let tracker = QuotaTracker::with_clock(1, clock.clone());
        tracker.commit("tok");
        assert!(!tracker.try_consume("tok").is_admitted());

        clock.advance(Duration::hours(3));
        assert!(tracker.try_consume("tok").is_admitted());
    }

    #[test]
    fn test_stale_entries_pruned() {
        let tracker = QuotaTracker::new(5);
        for i in 0..PRUNE_THRESHOLD {
            tracker.commit_at(&format!("old-{}", i), at(1, 12, 0));
        }
        assert_eq!(tracker.tracked(), PRUNE_THRESHOLD);

        tracker.try_consume_at("fresh", at(2, 12, 0));
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn test_concurrent_commits_serialized() {
        let tracker = Arc::new(QuotaTracker::new(1000));
        let now = at(1, 12, 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.commit_at("shared", now);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.usage_at("shared", now).used, 800);
    }

    proptest! {
        #[test]
        fn prop_exactly_limit_admissions_per_window(limit in 1u32..200, hour in 0u32..24) {
            let tracker = QuotaTracker::new(limit);
            let now = at(5, hour, 30);

            for _ in 0..limit {
                prop_assert!(tracker.try_consume_at("tok", now).is_admitted());
                tracker.commit_at("tok", now);
            }
            prop_assert_eq!(
                tracker.try_consume_at("tok", now),
                Admission::Denied { count: limit, limit }
            );

            // Next day the full allowance comes back.
            prop_assert!(tracker.try_consume_at("tok", at(6, 0, 0)).is_admitted());
        }

        #[test]
        fn prop_reset_count_is_zero(checks in 1usize..20, used in 0u32..50) {
            let tracker = QuotaTracker::new(50);
            for _ in 0..used {
                tracker.commit_at("tok", at(7, 9, 0));
            }
            for i in 0..checks {
                let moment = at(8, 0, 0) + Duration::minutes(i as i64);
                prop_assert_eq!(tracker.try_consume_at("tok", moment).count(), 0);
            }
        }
    }
}
