//! Operator-facing cache statistics
//!
//! Aggregated by the manager for the CLI/HTTP cache-management surfaces.

use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Full statistics report for the cache
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entry counts and total footprint
    pub basic: BasicStats,
    /// Counters and timings
    pub performance: PerformanceStats,
    /// Configured limits and current utilization
    pub policies: PolicyStats,
    /// State of the in-memory index
    pub lru: LruStats,
    /// One summary per cached entry
    pub entries: Vec<EntryStats>,
}

/// Entry counts and total footprint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStats {
    /// Number of cached entries
    pub entry_count: usize,
    /// Sum of entry sizes in bytes
    pub total_size_bytes: u64,
    /// Human-readable total size
    pub total_size: String,
}

/// Counters and timings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Evictions
    pub evictions: u64,
    /// Operation errors
    pub errors: u64,
    /// Mean recent access time in milliseconds
    pub average_access_ms: f64,
}

/// Configured limits and current utilization
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStats {
    /// Entry time-to-live in milliseconds
    pub ttl_ms: u64,
    /// Total-size budget in bytes
    pub max_size_bytes: u64,
    /// Entry-count limit
    pub max_entries: usize,
    /// Total size as a fraction of the budget (may exceed 1.0)
    pub utilization: f64,
}

/// State of the in-memory index
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LruStats {
    /// Configured capacity
    pub capacity: usize,
    /// Entries currently held
    pub len: usize,
}

/// Summary of one cached entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    /// Cache key
    pub id: String,
    /// Template identifier
    pub template_id: String,
    /// Template version
    pub version: String,
    /// Entry size in bytes
    pub size_bytes: u64,
    /// Human-readable size
    pub size: String,
    /// Human-readable age
    pub age: String,
    /// Reads so far
    pub access_count: u64,
    /// Last known validation result
    pub valid: bool,
}

impl EntryStats {
    /// Summarize an entry as of `now`
    #[must_use]
    pub fn from_entry(entry: &CacheEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: entry.id.clone(),
            template_id: entry.template_id.clone(),
            version: entry.version.clone(),
            size_bytes: entry.size_bytes,
            size: format_bytes(entry.size_bytes),
            age: format_age(entry.age(now)),
            access_count: entry.access_count,
            valid: entry.valid,
        }
    }
}

/// Render a byte count with binary units
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let bytes_f = bytes as f64;
    if bytes_f >= GIB {
        format!("{:.1} GiB", bytes_f / GIB)
    } else if bytes_f >= MIB {
        format!("{:.1} MiB", bytes_f / MIB)
    } else if bytes_f >= KIB {
        format!("{:.1} KiB", bytes_f / KIB)
    } else {
        format!("{bytes} B")
    }
}

/// Render an age compactly (seconds up to days)
#[must_use]
pub fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 60 * 60 {
        format!("{}m", secs / 60)
    } else if secs < 24 * 60 * 60 {
        format!("{}h", secs / (60 * 60))
    } else {
        format!("{}d", secs / (24 * 60 * 60))
    }
}
