//! Cache orchestration: lookup, storage, eviction, pruning, stats
//!
//! The manager owns every component behind one public API. Lookups consult
//! the memory index first and fall back to the disk store; mutations ask the
//! policy engine to make room before writing, and every operation reports to
//! the metrics collector.
//!
//! Concurrency: reads may run concurrently; mutations targeting the same key
//! are serialized through a per-key async mutex, so two stores of the same
//! `templateId@version` can never interleave their remove-then-write steps.
//! The background prune tick shares a maintenance lock with foreground
//! `prune`/`clear` calls and skips the tick when one is in flight.

use crate::config::CacheConfig;
use crate::disk::DiskStore;
use crate::entry::{CacheEntry, Validity, entry_id};
use crate::index::MemoryIndex;
use crate::metrics::MetricsCollector;
use crate::policy::{PolicyEngine, PruneCandidate};
use crate::stats::{
    BasicStats, CacheStats, EntryStats, LruStats, PerformanceStats, PolicyStats, format_bytes,
};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Options for a prune pass
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    /// Compute candidates without removing anything
    pub dry_run: bool,
    /// Re-validate entries whose stored flag still claims they are valid
    pub aggressive: bool,
}

/// Outcome of a prune pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Entries removed (or, on a dry run, that would be removed)
    pub removed: usize,
    /// Entries surviving the pass
    pub remaining: usize,
    /// Per-entry removal reasons
    pub reasons: Vec<PruneCandidate>,
}

/// Outcome of a clear pass
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    /// Entries removed
    pub cleared: usize,
    /// Entries kept because their template id was preserved
    pub preserved: usize,
}

/// Orchestrates the template cache behind a single public API
///
/// A cheaply cloneable handle; clones share one cache instance. Timers and
/// registries are fields of that instance, never process-wide state.
/// Construct with [`CacheManager::new`], then call
/// [`CacheManager::initialize`] before use. The background prune task stops
/// when the last handle is dropped (or on [`CacheManager::shutdown`]).
#[derive(Debug, Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    config: CacheConfig,
    disk: DiskStore,
    policy: PolicyEngine,
    metrics: MetricsCollector,
    index: Mutex<MemoryIndex>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    maintenance: tokio::sync::Mutex<()>,
    prune_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create a manager for the given configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error if no writable cache directory can be
    /// resolved.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let root = config.resolve_cache_root()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                disk: DiskStore::new(root),
                policy: PolicyEngine::new(config.max_entries, config.max_size_bytes, config.ttl),
                metrics: MetricsCollector::new(config.enable_metrics),
                index: Mutex::new(MemoryIndex::new(config.lru_size)),
                key_locks: Mutex::new(HashMap::new()),
                maintenance: tokio::sync::Mutex::new(()),
                prune_task: Mutex::new(None),
                config,
            }),
        })
    }

    /// Prepare the cache for use
    ///
    /// Creates the cache root, warms the memory index from persisted
    /// metadata (most recently accessed entries win the `lru_size` slots)
    /// and starts the background prune task. Ephemeral mode skips both the
    /// warm-up and the background task.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the cache root cannot be created or scanned.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.track(self.inner.disk.ensure_root())?;

        if self.inner.config.persistent {
            let loaded = self.inner.load_persisted_index()?;
            self.start_background_prune();
            info!(
                root = %self.inner.disk.root().display(),
                entries = loaded,
                "Template cache initialized"
            );
        } else {
            debug!(
                root = %self.inner.disk.root().display(),
                "Template cache initialized in ephemeral mode"
            );
        }

        Ok(())
    }

    /// Stop the background prune task
    ///
    /// Idempotent; also runs when the last handle is dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Look up a cached template version
    ///
    /// A hit touches the entry (access count, last-access time, LRU
    /// position). An entry that fails integrity validation is evicted and
    /// reported as a miss, never as an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the metadata sidecar exists but cannot be
    /// read, or if evicting an invalid entry fails.
    pub async fn get_entry(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<Option<CacheEntry>> {
        self.inner.get_entry(template_id, version).await
    }

    /// Store a template version from a materialized source tree
    ///
    /// Replaces any existing entry for the same key and evicts per policy
    /// (count first, then size) before writing, so the store never commits a
    /// tree it would immediately have to throw away.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or missing `source`, a policy
    /// violation if the source tree alone exceeds the size budget, or an I/O
    /// error if the copy or metadata write fails.
    pub async fn set_entry(
        &self,
        template_id: &str,
        version: &str,
        source: &Path,
    ) -> Result<CacheEntry> {
        self.inner.set_entry(template_id, version, source).await
    }

    /// Remove a cached template version
    ///
    /// Idempotent: returns whether anything was actually removed; a second
    /// call is a `false` no-op, never an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing entry cannot be deleted.
    pub async fn remove_entry(&self, template_id: &str, version: &str) -> Result<bool> {
        let id = entry_id(template_id, version);
        self.inner.remove_by_id(&id).await
    }

    /// Remove every entry whose template id is not in `preserve`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a removal fails partway; entries already
    /// cleared stay cleared.
    pub async fn clear(&self, preserve: &[impl AsRef<str>]) -> Result<ClearReport> {
        let inner = &self.inner;
        let _maintenance = inner.maintenance.lock().await;

        let entries = inner.snapshot_entries();
        let mut cleared = 0;
        let mut preserved = 0;
        for entry in entries {
            if preserve.iter().any(|p| p.as_ref() == entry.template_id) {
                preserved += 1;
                continue;
            }
            if inner.remove_by_id(&entry.id).await? {
                cleared += 1;
            }
        }

        info!(cleared, preserved, "Cleared template cache");
        Ok(ClearReport { cleared, preserved })
    }

    /// Remove expired, invalid and over-budget entries
    ///
    /// `dry_run` computes the candidate set without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a removal fails partway.
    pub async fn prune(&self, options: PruneOptions) -> Result<PruneReport> {
        let _maintenance = self.inner.maintenance.lock().await;
        self.inner.prune_locked(options).await
    }

    /// Fast existence check
    ///
    /// Membership in the memory index (without promoting) or presence of the
    /// content tree on disk. Deliberately skips integrity validation and
    /// records no metrics, so a corrupted entry can report `true` here and
    /// still miss on the subsequent [`CacheManager::get_entry`].
    #[must_use]
    pub fn is_cached(&self, template_id: &str, version: &str) -> bool {
        let id = entry_id(template_id, version);
        if self.inner.lock_index().contains(&id) {
            return true;
        }
        self.inner.disk.content_path(&id).exists()
    }

    /// Aggregate counters, limits and per-entry summaries
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// The active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The metrics collector
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// The resolved cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        self.inner.disk.root()
    }

    fn start_background_prune(&self) {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.prune_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the cache is
            // not pruned at startup.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                match cache.maintenance.try_lock() {
                    Ok(_guard) => {
                        if let Err(e) = cache.prune_locked(PruneOptions::default()).await {
                            warn!(error = %e, "Background prune failed; retrying next tick");
                        }
                    }
                    Err(_) => {
                        debug!("Skipping prune tick; maintenance already in progress");
                    }
                }
            }
        });

        let mut slot = self
            .inner
            .prune_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(handle);
    }
}

impl CacheInner {
    fn shutdown(&self) {
        let handle = self
            .prune_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Stopped background prune task");
        }
    }

    /// Warm the memory index from sidecars; returns how many were loaded
    fn load_persisted_index(&self) -> Result<usize> {
        let mut entries = self.track(self.disk.list_all_metadata())?;
        let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        self.metrics.set_total_size(total);

        // Insert in ascending access order so the most recent end up
        // most-recently-used and survive the capacity cut.
        entries.sort_by_key(|e| e.last_accessed_at);
        let skip = entries.len().saturating_sub(self.config.lru_size);
        let loaded = entries.len() - skip;
        let mut index = self.lock_index();
        for entry in entries.into_iter().skip(skip) {
            index.put(entry);
        }
        Ok(loaded)
    }

    async fn get_entry(&self, template_id: &str, version: &str) -> Result<Option<CacheEntry>> {
        let started = Instant::now();
        let id = entry_id(template_id, version);

        // Front cache: touch in place, which also promotes the slot
        let cached = {
            let mut index = self.lock_index();
            index.get_mut(&id).map(|entry| {
                entry.touch();
                entry.clone()
            })
        };
        if let Some(entry) = cached {
            self.persist_touch(&entry);
            self.metrics.record_hit();
            self.metrics.record_access(started.elapsed());
            return Ok(Some(entry));
        }

        // Disk is authoritative on an index miss
        let Some(mut entry) = self.track(self.disk.read_metadata(&id))? else {
            self.metrics.record_miss();
            self.metrics.record_access(started.elapsed());
            return Ok(None);
        };

        let validity = match self.disk.validate(&entry) {
            Ok(validity) => validity,
            Err(e) => {
                // An unreadable tree is as unusable as a corrupt one
                self.metrics.record_error();
                warn!(key = %id, error = %e, "Failed to validate cache entry; evicting");
                Validity::MissingTree
            }
        };
        if !validity.is_valid() {
            warn!(key = %id, ?validity, "Evicting invalid cache entry");
            self.remove_by_id(&id).await?;
            self.metrics.record_miss();
            self.metrics.record_access(started.elapsed());
            return Ok(None);
        }

        entry.valid = true;
        entry.touch();
        self.persist_touch(&entry);

        let displaced = self.lock_index().put(entry.clone());
        if let Some(displaced) = displaced {
            self.metrics.record_eviction();
            debug!(key = %displaced.id, "Displaced entry from memory index");
        }

        self.metrics.record_hit();
        self.metrics.record_access(started.elapsed());
        Ok(Some(entry))
    }

    async fn set_entry(
        &self,
        template_id: &str,
        version: &str,
        source: &Path,
    ) -> Result<CacheEntry> {
        if source.as_os_str().is_empty() {
            return Err(Error::validation("source path is empty"));
        }
        if !source.exists() {
            return Err(Error::validation(format!(
                "source path does not exist: {}",
                source.display()
            )));
        }

        let id = entry_id(template_id, version);
        let key_lock = self.key_lock(&id);
        let _guard = key_lock.lock().await;

        let incoming = self.track(self.disk.tree_size(source))?;
        if incoming >= self.config.max_size_bytes {
            // No eviction sequence can make this fit
            self.metrics.record_error();
            return Err(Error::policy_violation(
                id,
                incoming,
                self.config.max_size_bytes,
            ));
        }

        // Replace, never merge: the previous version of this key goes first
        let had_index = self.lock_index().remove(&id).is_some();
        let had_disk = self.track(self.disk.remove(&id))?;
        if had_index || had_disk {
            self.metrics.record_eviction();
            debug!(key = %id, "Replacing existing cache entry");
        }

        // Count headroom
        let entries = self.snapshot_entries();
        for victim in self.policy.evictions_for_count(&entries) {
            self.remove_for_eviction(&victim, "count limit").await?;
        }

        // Size headroom, including the incoming tree
        let entries = self.snapshot_entries();
        let current: u64 = entries.iter().map(|e| e.size_bytes).sum();
        for victim in self.policy.evictions_for_size(&entries, current + incoming) {
            self.remove_for_eviction(&victim, "size limit").await?;
        }

        let path = self.track(self.disk.write(&id, source))?;
        let checksum = self.track(self.disk.compute_checksum(&path))?;
        let size_bytes = self.track(self.disk.tree_size(&path))?;

        let entry = CacheEntry::new(template_id, version, path, checksum, size_bytes);
        if self.config.persistent {
            self.track(self.disk.write_metadata(&entry))?;
        }

        let displaced = self.lock_index().put(entry.clone());
        if let Some(displaced) = displaced {
            self.metrics.record_eviction();
            debug!(key = %displaced.id, "Displaced entry from memory index");
        }

        self.refresh_size_gauge();
        info!(key = %id, size = size_bytes, "Cached template");
        Ok(entry)
    }

    fn lock_index(&self) -> MutexGuard<'_, MemoryIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch (or create) the mutation lock for a key
    ///
    /// Locks nobody currently holds are reaped on the way in, so the map
    /// stays bounded by the number of keys with in-flight mutations.
    fn key_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Count an error against the metrics without consuming the result
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    /// Current entry snapshot: sidecars in persistent mode, the index in
    /// ephemeral mode
    fn snapshot_entries(&self) -> Vec<CacheEntry> {
        if self.config.persistent {
            match self.disk.list_all_metadata() {
                Ok(entries) => entries,
                Err(e) => {
                    self.metrics.record_error();
                    warn!(error = %e, "Failed to scan cache metadata");
                    Vec::new()
                }
            }
        } else {
            self.lock_index().entries()
        }
    }

    /// Best-effort persistence of a touch; a read never fails because its
    /// access counter could not be flushed
    fn persist_touch(&self, entry: &CacheEntry) {
        if !self.config.persistent {
            return;
        }
        if let Err(e) = self.disk.write_metadata(entry) {
            self.metrics.record_error();
            warn!(key = %entry.id, error = %e, "Failed to persist access metadata");
        }
    }

    /// Remove an entry under its key lock
    async fn remove_by_id(&self, id: &str) -> Result<bool> {
        let key_lock = self.key_lock(id);
        let _guard = key_lock.lock().await;

        let had_index = self.lock_index().remove(id).is_some();
        let had_disk = self.track(self.disk.remove(id))?;
        let removed = had_index || had_disk;
        if removed {
            self.metrics.record_eviction();
            self.refresh_size_gauge();
        }
        Ok(removed)
    }

    /// Policy-driven removal that skips keys with an in-flight mutation
    ///
    /// A victim being rewritten concurrently is about to change anyway;
    /// waiting on its lock from inside another store risks an ABBA deadlock
    /// between two stores evicting each other's keys.
    async fn remove_for_eviction(&self, id: &str, cause: &str) -> Result<bool> {
        let key_lock = self.key_lock(id);
        let Ok(_guard) = key_lock.try_lock() else {
            debug!(key = %id, cause, "Skipping eviction of busy key");
            return Ok(false);
        };

        let had_index = self.lock_index().remove(id).is_some();
        let had_disk = self.track(self.disk.remove(id))?;
        let removed = had_index || had_disk;
        if removed {
            self.metrics.record_eviction();
            self.refresh_size_gauge();
            debug!(key = %id, cause, "Evicted cache entry");
        }
        Ok(removed)
    }

    async fn prune_locked(&self, options: PruneOptions) -> Result<PruneReport> {
        let now = Utc::now();
        let entries = self.snapshot_entries();
        let candidates = self
            .policy
            .prune_candidates(&entries, now, options.aggressive, |e| {
                matches!(self.disk.validate(e), Ok(Validity::Valid))
            });
        let remaining = entries.len() - candidates.len();

        if options.dry_run {
            debug!(
                candidates = candidates.len(),
                remaining, "Prune dry run computed"
            );
            return Ok(PruneReport {
                removed: candidates.len(),
                remaining,
                reasons: candidates,
            });
        }

        let mut removed = 0;
        for candidate in &candidates {
            if self.remove_by_id(&candidate.id).await? {
                removed += 1;
                debug!(key = %candidate.id, reason = %candidate.reason, "Pruned cache entry");
            }
        }

        info!(removed, remaining, "Pruned template cache");
        Ok(PruneReport {
            removed,
            remaining,
            reasons: candidates,
        })
    }

    fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut entries = self.snapshot_entries();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let total_size_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();

        let (capacity, len) = {
            let index = self.lock_index();
            (index.capacity(), index.len())
        };

        #[allow(clippy::cast_precision_loss)]
        let utilization = if self.config.max_size_bytes == 0 {
            0.0
        } else {
            total_size_bytes as f64 / self.config.max_size_bytes as f64
        };

        #[allow(clippy::cast_possible_truncation)]
        let ttl_ms = self.config.ttl.as_millis() as u64;

        CacheStats {
            basic: BasicStats {
                entry_count: entries.len(),
                total_size_bytes,
                total_size: format_bytes(total_size_bytes),
            },
            performance: PerformanceStats {
                hits: self.metrics.hits(),
                misses: self.metrics.misses(),
                hit_rate: self.metrics.hit_rate(),
                evictions: self.metrics.evictions(),
                errors: self.metrics.errors(),
                average_access_ms: self.metrics.average_access_time().as_secs_f64() * 1000.0,
            },
            policies: PolicyStats {
                ttl_ms,
                max_size_bytes: self.config.max_size_bytes,
                max_entries: self.config.max_entries,
                utilization,
            },
            lru: LruStats { capacity, len },
            entries: entries
                .iter()
                .map(|e| EntryStats::from_entry(e, now))
                .collect(),
        }
    }

    fn refresh_size_gauge(&self) {
        let total: u64 = self
            .snapshot_entries()
            .iter()
            .map(|e| e.size_bytes)
            .sum();
        self.metrics.set_total_size(total);
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
