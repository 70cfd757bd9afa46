//! In-memory representation of one cached template version

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Derive the cache key for a template version
///
/// The key doubles as the content directory name and the metadata sidecar
/// stem, so one `templateId@version` pair maps to exactly one on-disk entry.
#[must_use]
pub fn entry_id(template_id: &str, version: &str) -> String {
    format!("{template_id}@{version}")
}

/// Metadata about a cached template version
///
/// Persisted as the `<id>.meta.json` sidecar next to the content tree. Field
/// names are camelCase on disk to stay compatible with the sidecars written
/// by earlier trellis releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Unique key, `templateId@version`
    pub id: String,
    /// Template identifier
    pub template_id: String,
    /// Template version
    pub version: String,
    /// Location of the materialized content tree under the cache root
    pub path: PathBuf,
    /// SHA-256 over the sorted, concatenated byte contents of the tree
    pub checksum: String,
    /// Sum of file sizes under `path` at creation time
    pub size_bytes: u64,
    /// Incremented on every successful read
    pub access_count: u64,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// When the entry was last read
    pub last_accessed_at: DateTime<Utc>,
    /// Last known validation result
    pub valid: bool,
}

impl CacheEntry {
    /// Build a fresh entry for a newly materialized template tree
    #[must_use]
    pub fn new(
        template_id: impl Into<String>,
        version: impl Into<String>,
        path: PathBuf,
        checksum: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let template_id = template_id.into();
        let version = version.into();
        let now = Utc::now();
        Self {
            id: entry_id(&template_id, &version),
            template_id,
            version,
            path,
            checksum: checksum.into(),
            size_bytes,
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
            valid: true,
        }
    }

    /// Record a successful read
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }

    /// Whether the entry has outlived `ttl` as of `now`
    ///
    /// Strictly greater-than: an entry is still live at exactly `created_at
    /// + ttl`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(ttl)
            .is_ok_and(|ttl| now.signed_duration_since(self.created_at) > ttl)
    }

    /// Age of the entry as of `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// Outcome of integrity validation
///
/// A stale or tampered entry is an expected state, not an exception; callers
/// match on the outcome and evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Tree present and checksum matches
    Valid,
    /// Content tree is missing from disk
    MissingTree,
    /// Recomputed checksum differs from the recorded one
    ChecksumMismatch {
        /// Checksum recorded at creation time
        expected: String,
        /// Checksum recomputed from the current tree
        actual: String,
    },
}

impl Validity {
    /// Whether the entry passed validation
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}
