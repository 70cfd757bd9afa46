//! Cache configuration and cache-root resolution

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use std::path::PathBuf;
use std::time::Duration;

/// Default entry time-to-live (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default total-size budget (100 MiB)
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Default entry-count limit
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default capacity of the in-memory LRU index
pub const DEFAULT_LRU_SIZE: usize = 50;

/// Default background prune period (1 hour)
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Configuration for the template cache
///
/// Every recognized option with its default; collaborators construct this
/// from CLI flags or the trellis config file.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root directory; `None` resolves a writable default
    pub cache_dir: Option<PathBuf>,
    /// Maximum age before an entry becomes a prune candidate
    pub ttl: Duration,
    /// Total-size budget for all cached trees, in bytes
    pub max_size_bytes: u64,
    /// Maximum number of cached entries
    pub max_entries: usize,
    /// Whether metadata sidecars are written to disk at all
    ///
    /// Ephemeral mode (`false`) keeps the cache purely in memory and skips
    /// the background prune task.
    pub persistent: bool,
    /// Capacity of the in-memory LRU index
    pub lru_size: usize,
    /// Whether hit/miss/eviction metrics are recorded
    pub enable_metrics: bool,
    /// Period of the background prune task
    pub prune_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            ttl: DEFAULT_TTL,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            persistent: true,
            lru_size: DEFAULT_LRU_SIZE,
            enable_metrics: true,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Resolve the effective cache root for this configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error if no writable candidate directory exists.
    pub fn resolve_cache_root(&self) -> Result<PathBuf> {
        self.cache_dir
            .clone()
            .map_or_else(default_cache_root, Ok)
    }
}

/// Inputs for determining the default cache root directory
#[derive(Debug, Clone)]
struct CacheRootInputs {
    trellis_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheRootInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) TRELLIS_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/trellis/templates
    // 3) OS cache dir/trellis/templates
    // 4) ~/.trellis/cache/templates (legacy)
    // 5) TMPDIR/trellis/cache/templates (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs
        .trellis_cache_dir
        .filter(|p| !p.as_os_str().is_empty())
    {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("trellis/templates"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("trellis/templates"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".trellis/cache/templates"));
    }
    candidates.push(inputs.temp_dir.join("trellis/cache/templates"));

    for path in candidates {
        // If the path already exists, ensure it is writable; some CI
        // environments provide read-only cache directories under $HOME.
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => {
                    // Not writable, try next candidate
                    continue;
                }
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        // Permission denied or other errors - try next candidate
    }
    Err(Error::validation(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the default cache root from the process environment
///
/// # Errors
///
/// Returns a validation error if no writable candidate directory exists.
pub fn default_cache_root() -> Result<PathBuf> {
    let inputs = CacheRootInputs {
        trellis_cache_dir: std::env::var("TRELLIS_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = CacheConfig::default();
        assert!(config.cache_dir.is_none());
        assert_eq!(config.ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_entries, 100);
        assert!(config.persistent);
        assert_eq!(config.lru_size, 50);
        assert!(config.enable_metrics);
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let config = CacheConfig {
            cache_dir: Some(PathBuf::from("/tmp/trellis-explicit")),
            ..CacheConfig::default()
        };
        let root = config.resolve_cache_root().unwrap();
        assert_eq!(root, PathBuf::from("/tmp/trellis-explicit"));
    }

    #[test]
    fn test_override_env_candidate_wins() {
        let tmp = std::env::temp_dir().join("trellis-test-override");
        let _ = std::fs::remove_dir_all(&tmp);
        let inputs = CacheRootInputs {
            trellis_cache_dir: Some(tmp.clone()),
            xdg_cache_home: None,
            os_cache_dir: None,
            home_dir: None,
            temp_dir: std::env::temp_dir(),
        };
        let root = cache_root_from_inputs(inputs).unwrap();
        assert!(root.starts_with(&tmp));
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_xdg_candidate_gets_app_suffix() {
        let tmp = tempfile::TempDir::new().unwrap();
        let inputs = CacheRootInputs {
            trellis_cache_dir: None,
            xdg_cache_home: Some(tmp.path().to_path_buf()),
            os_cache_dir: None,
            home_dir: None,
            temp_dir: std::env::temp_dir(),
        };
        let root = cache_root_from_inputs(inputs).unwrap();
        assert!(root.ends_with("trellis/templates"));
        assert!(root.starts_with(tmp.path()));
    }

    #[test]
    fn test_empty_override_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let inputs = CacheRootInputs {
            trellis_cache_dir: Some(PathBuf::new()),
            xdg_cache_home: Some(tmp.path().to_path_buf()),
            os_cache_dir: None,
            home_dir: None,
            temp_dir: std::env::temp_dir(),
        };
        let root = cache_root_from_inputs(inputs).unwrap();
        assert!(root.starts_with(tmp.path()));
    }
}
