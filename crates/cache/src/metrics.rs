//! Hit/miss/eviction counters and access-time statistics

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of recent access timings retained for averaging
pub const ACCESS_WINDOW: usize = 100;

/// Counters and timings for cache operations
///
/// All counters are atomics so the read paths can report concurrently with
/// mutations. When disabled, every recording call is a no-op.
#[derive(Debug)]
pub struct MetricsCollector {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    total_size_bytes: AtomicU64,
    access_times: Mutex<VecDeque<Duration>>,
}

impl MetricsCollector {
    /// Create a collector; `enabled = false` turns all recording into no-ops
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_size_bytes: AtomicU64::new(0),
            access_times: Mutex::new(VecDeque::with_capacity(ACCESS_WINDOW)),
        }
    }

    /// Count a cache hit
    pub fn record_hit(&self) {
        if self.enabled {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a cache miss
    pub fn record_miss(&self) {
        if self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an eviction
    pub fn record_eviction(&self) {
        if self.enabled {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an operation error
    pub fn record_error(&self) {
        if self.enabled {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append an access duration to the rolling window
    pub fn record_access(&self, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut times = self
            .access_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if times.len() == ACCESS_WINDOW {
            times.pop_front();
        }
        times.push_back(elapsed);
    }

    /// Update the total-size gauge
    ///
    /// The manager refreshes this after every mutation; between eviction
    /// decisions the gauge may read over budget.
    pub fn set_total_size(&self, bytes: u64) {
        self.total_size_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Hits so far
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Misses so far
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Evictions so far
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Errors so far
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Current total-size gauge in bytes
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes.load(Ordering::Relaxed)
    }

    /// Fraction of lookups that hit, 0.0 before any lookup
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Mean of the retained access timings
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn average_access_time(&self) -> Duration {
        let times = self
            .access_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = times.iter().sum();
        total / times.len() as u32
    }

    /// Size gauge as a fraction of `max_size_bytes`
    ///
    /// May exceed 1.0 while an eviction is pending; callers treat values
    /// above 1.0 as "over budget".
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self, max_size_bytes: u64) -> f64 {
        if max_size_bytes == 0 {
            return 0.0;
        }
        self.total_size_bytes() as f64 / max_size_bytes as f64
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            errors: self.errors(),
            hit_rate: self.hit_rate(),
            average_access_ms: self.average_access_time().as_secs_f64() * 1000.0,
            total_size_bytes: self.total_size_bytes(),
        }
    }
}

/// Serializable snapshot of the collector
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Evictions
    pub evictions: u64,
    /// Operation errors
    pub errors: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Mean recent access time in milliseconds
    pub average_access_ms: f64,
    /// Total-size gauge in bytes
    pub total_size_bytes: u64,
}
