//! Eviction and pruning decisions
//!
//! Pure functions over entry snapshots; the manager applies the verdicts.
//! Size-based selection is deliberately largest-first rather than LRU-first:
//! it frees the most space per eviction, at the cost of occasionally
//! discarding a frequently-used large entry before a rarely-used small one.

use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Why an entry was selected for pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    /// Older than the configured TTL
    Expired,
    /// Failed integrity validation
    Invalid,
    /// Removed to bring the total size back under budget
    SizeLimit,
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Invalid => write!(f, "invalid"),
            Self::SizeLimit => write!(f, "size_limit"),
        }
    }
}

/// A prune verdict for one entry
#[derive(Debug, Clone, Serialize)]
pub struct PruneCandidate {
    /// Cache key of the entry
    pub id: String,
    /// First matching reason
    pub reason: PruneReason,
}

/// Decides which entries must go to satisfy TTL, count and size limits
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    max_entries: usize,
    max_size_bytes: u64,
    ttl: Duration,
}

impl PolicyEngine {
    /// Create an engine for the given limits
    #[must_use]
    pub fn new(max_entries: usize, max_size_bytes: u64, ttl: Duration) -> Self {
        Self {
            max_entries,
            max_size_bytes,
            ttl,
        }
    }

    /// Entries to evict so an incoming insert stays under the count limit
    ///
    /// Selects the oldest by last access until the count would drop to
    /// `max_entries - 1`, leaving headroom for the insert.
    #[must_use]
    pub fn evictions_for_count(&self, entries: &[CacheEntry]) -> Vec<String> {
        if entries.len() < self.max_entries {
            return Vec::new();
        }
        let excess = entries.len() + 1 - self.max_entries;

        let mut by_age: Vec<&CacheEntry> = entries.iter().collect();
        by_age.sort_by_key(|e| e.last_accessed_at);
        by_age.iter().take(excess).map(|e| e.id.clone()).collect()
    }

    /// Entries to evict so `total_size` drops under the size budget
    ///
    /// Largest-first, decrementing a running total until under the limit.
    #[must_use]
    pub fn evictions_for_size(&self, entries: &[CacheEntry], total_size: u64) -> Vec<String> {
        let mut victims = Vec::new();
        if total_size < self.max_size_bytes {
            return victims;
        }

        let mut by_size: Vec<&CacheEntry> = entries.iter().collect();
        by_size.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

        let mut running = total_size;
        for entry in by_size {
            if running < self.max_size_bytes {
                break;
            }
            running = running.saturating_sub(entry.size_bytes);
            victims.push(entry.id.clone());
        }
        victims
    }

    /// Entries that a prune pass should remove, with the reason for each
    ///
    /// The three checks are additive; an entry matching more than one is
    /// reported under the first match. `is_valid` is only consulted when
    /// `aggressive` forces re-validation of entries whose stored flag still
    /// claims they are valid.
    #[must_use]
    pub fn prune_candidates(
        &self,
        entries: &[CacheEntry],
        now: DateTime<Utc>,
        aggressive: bool,
        mut is_valid: impl FnMut(&CacheEntry) -> bool,
    ) -> Vec<PruneCandidate> {
        let mut candidates = Vec::new();

        for entry in entries {
            if entry.is_expired(self.ttl, now) {
                candidates.push(PruneCandidate {
                    id: entry.id.clone(),
                    reason: PruneReason::Expired,
                });
                continue;
            }
            if !entry.valid || (aggressive && !is_valid(entry)) {
                candidates.push(PruneCandidate {
                    id: entry.id.clone(),
                    reason: PruneReason::Invalid,
                });
            }
        }

        // Whatever survives the first two checks still has to fit the budget
        let doomed: HashSet<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        let mut survivors: Vec<&CacheEntry> = entries
            .iter()
            .filter(|e| !doomed.contains(e.id.as_str()))
            .collect();
        let mut remaining: u64 = survivors.iter().map(|e| e.size_bytes).sum();

        if remaining >= self.max_size_bytes {
            survivors.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
            for entry in survivors {
                if remaining < self.max_size_bytes {
                    break;
                }
                remaining = remaining.saturating_sub(entry.size_bytes);
                candidates.push(PruneCandidate {
                    id: entry.id.clone(),
                    reason: PruneReason::SizeLimit,
                });
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(template_id: &str, size_bytes: u64) -> CacheEntry {
        CacheEntry::new(
            template_id,
            "1.0.0",
            PathBuf::from(format!("/cache/{template_id}@1.0.0")),
            "checksum",
            size_bytes,
        )
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(3, 1000, Duration::from_secs(60))
    }

    #[test]
    fn test_count_evictions_only_at_limit() {
        let engine = engine();
        let entries = vec![entry("a", 10), entry("b", 10)];
        assert!(engine.evictions_for_count(&entries).is_empty());
    }

    #[test]
    fn test_count_evictions_leave_headroom() {
        let engine = engine();
        let mut a = entry("a", 10);
        let mut b = entry("b", 10);
        let c = entry("c", 10);
        a.last_accessed_at = Utc::now() - chrono::Duration::minutes(10);
        b.last_accessed_at = Utc::now() - chrono::Duration::minutes(5);

        // At the limit of 3, the incoming insert needs one free slot; only
        // the stalest entry goes.
        let victims = engine.evictions_for_count(&[a, b, c]);
        assert_eq!(victims, vec!["a@1.0.0".to_string()]);
    }

    #[test]
    fn test_count_evictions_over_limit_drop_to_headroom() {
        let engine = engine();
        let mut entries: Vec<CacheEntry> = (0..5i64)
            .map(|i| {
                let mut e = entry(&format!("t{i}"), 10);
                e.last_accessed_at = Utc::now() - chrono::Duration::minutes(10 - i);
                e
            })
            .collect();
        entries.rotate_left(2);

        // Five entries against a limit of three: the count must drop to
        // max_entries - 1 = 2, so the three stalest go.
        let victims = engine.evictions_for_count(&entries);
        assert_eq!(
            victims,
            vec![
                "t0@1.0.0".to_string(),
                "t1@1.0.0".to_string(),
                "t2@1.0.0".to_string()
            ]
        );
    }

    #[test]
    fn test_size_evictions_take_largest_first() {
        let engine = engine();
        let entries = vec![entry("small", 100), entry("large", 600), entry("mid", 400)];
        let total: u64 = entries.iter().map(|e| e.size_bytes).sum();

        let victims = engine.evictions_for_size(&entries, total);
        assert_eq!(victims[0], "large@1.0.0");
        // 1100 - 600 = 500 < 1000, one eviction suffices
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn test_size_evictions_below_budget_noop() {
        let engine = engine();
        let entries = vec![entry("a", 100)];
        assert!(engine.evictions_for_size(&entries, 100).is_empty());
    }

    #[test]
    fn test_ttl_boundary() {
        let engine = engine();
        let e = entry("a", 10);
        let created = e.created_at;

        let before = engine.prune_candidates(
            std::slice::from_ref(&e),
            created + chrono::Duration::milliseconds(59_999),
            false,
            |_| true,
        );
        assert!(before.is_empty());

        let after = engine.prune_candidates(
            std::slice::from_ref(&e),
            created + chrono::Duration::milliseconds(60_001),
            false,
            |_| true,
        );
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].reason, PruneReason::Expired);
    }

    #[test]
    fn test_invalid_flag_marks_candidate() {
        let engine = engine();
        let mut e = entry("a", 10);
        e.valid = false;

        let candidates = engine.prune_candidates(&[e], Utc::now(), false, |_| true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reason, PruneReason::Invalid);
    }

    #[test]
    fn test_aggressive_forces_revalidation() {
        let engine = engine();
        let e = entry("a", 10);

        // Stored flag says valid; only an aggressive pass consults the
        // validator and catches the corruption.
        let lazy = engine.prune_candidates(std::slice::from_ref(&e), Utc::now(), false, |_| false);
        assert!(lazy.is_empty());

        let aggressive =
            engine.prune_candidates(std::slice::from_ref(&e), Utc::now(), true, |_| false);
        assert_eq!(aggressive.len(), 1);
        assert_eq!(aggressive[0].reason, PruneReason::Invalid);
    }

    #[test]
    fn test_first_match_wins_for_reporting() {
        let engine = engine();
        let mut e = entry("a", 10);
        e.valid = false;
        e.created_at = Utc::now() - chrono::Duration::hours(2);

        let candidates = engine.prune_candidates(&[e], Utc::now(), false, |_| true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reason, PruneReason::Expired);
    }

    #[test]
    fn test_size_limit_applies_to_survivors() {
        let engine = engine();
        let mut expired = entry("old", 600);
        expired.created_at = Utc::now() - chrono::Duration::hours(1);
        let big = entry("big", 700);
        let small = entry("small", 400);

        let candidates =
            engine.prune_candidates(&[expired, big, small], Utc::now(), false, |_| true);

        // 600 goes as expired; survivors total 1100 >= 1000, so the largest
        // survivor goes as size_limit.
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].reason, PruneReason::Expired);
        assert_eq!(candidates[1].id, "big@1.0.0");
        assert_eq!(candidates[1].reason, PruneReason::SizeLimit);
    }
}
