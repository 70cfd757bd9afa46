//! Persistent storage for template trees and their metadata sidecars
//!
//! Each entry occupies two paths under the cache root: the materialized
//! content tree at `<root>/<id>/` and a JSON sidecar at
//! `<root>/<id>.meta.json`. The sidecar is the authoritative record; the
//! in-memory index is rebuilt from sidecars at startup.

use crate::entry::{CacheEntry, Validity};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Suffix of metadata sidecar files under the cache root
pub const METADATA_SUFFIX: &str = ".meta.json";

/// Disk-backed store for template trees
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))
    }

    /// Path of the content tree for `id`
    #[must_use]
    pub fn content_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Path of the metadata sidecar for `id`
    #[must_use]
    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{METADATA_SUFFIX}"))
    }

    /// Materialize `source` as the content tree for `id`
    ///
    /// Any pre-existing tree for the same id is removed first. The copy
    /// preserves relative structure; symlinks and binary files are copied as
    /// opaque byte blobs.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the existing tree cannot be removed or the
    /// copy fails.
    pub fn write(&self, id: &str, source: &Path) -> Result<PathBuf> {
        self.ensure_root()?;

        let dest = self.content_path(id);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| Error::io(e, &dest, "remove_dir_all"))?;
        }
        fs::create_dir_all(&dest).map_err(|e| Error::io(e, &dest, "create_dir_all"))?;

        for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_dir() {
                continue;
            }
            let rel = p.strip_prefix(source).map_err(|_| {
                Error::validation(format!(
                    "path {} is not under source root {}",
                    p.display(),
                    source.display()
                ))
            })?;
            let dst = dest.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            fs::copy(p, &dst).map_err(|e| Error::io(e, &dst, "copy"))?;
        }

        Ok(dest)
    }

    /// Compute the integrity checksum of a content tree
    ///
    /// Walks the tree with sibling names sorted before descending and folds
    /// file bytes into a single SHA-256, so the result is deterministic
    /// across repeated calls on unchanged content.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the walk or a file read fails.
    pub fn compute_checksum(&self, path: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let bytes =
                fs::read(entry.path()).map_err(|e| Error::io(e, entry.path(), "read"))?;
            hasher.update(&bytes);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Sum of file sizes under a tree
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the walk or a metadata read fails.
    pub fn tree_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0u64;
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| Error::io(e.into(), entry.path(), "metadata"))?;
            total += meta.len();
        }
        Ok(total)
    }

    /// Load the metadata sidecar for `id`, if one exists
    ///
    /// A sidecar that exists but cannot be parsed reads as absent; the entry
    /// surfaces as a miss and is replaced on the next store.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sidecar exists but cannot be read.
    pub fn read_metadata(&self, id: &str) -> Result<Option<CacheEntry>> {
        let path = self.metadata_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::io(e, &path, "read"))?;
        match serde_json::from_str(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key = %id, "Skipping corrupt cache metadata: {e}");
                Ok(None)
            }
        }
    }

    /// Persist the metadata sidecar for an entry
    ///
    /// Written through a temporary file and renamed into place, so readers
    /// never observe a half-written sidecar.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the entry cannot be encoded, or an
    /// I/O error if the write fails.
    pub fn write_metadata(&self, entry: &CacheEntry) -> Result<()> {
        self.ensure_root()?;

        let path = self.metadata_path(&entry.id);
        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| Error::serialization(format!("Failed to serialize metadata: {e}")))?;

        let tmp = self.root.join(format!("{}{METADATA_SUFFIX}.tmp", entry.id));
        fs::write(&tmp, json).map_err(|e| Error::io(e, &tmp, "write"))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(e, &path, "rename"))?;
        Ok(())
    }

    /// Delete the content tree and sidecar for `id`
    ///
    /// Idempotent: reports whether anything was actually removed and never
    /// errors on an already-absent entry.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing tree or sidecar cannot be deleted.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut removed = false;

        let content = self.content_path(id);
        if content.exists() {
            fs::remove_dir_all(&content).map_err(|e| Error::io(e, &content, "remove_dir_all"))?;
            removed = true;
        }

        let sidecar = self.metadata_path(id);
        if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(|e| Error::io(e, &sidecar, "remove_file"))?;
            removed = true;
        }

        Ok(removed)
    }

    /// Load every metadata sidecar under the cache root
    ///
    /// A single corrupt or unreadable sidecar is skipped with a warning and
    /// never aborts the listing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the cache root itself cannot be scanned.
    pub fn list_all_metadata(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }

        for dir_entry in
            fs::read_dir(&self.root).map_err(|e| Error::io(e, &self.root, "read_dir"))?
        {
            let dir_entry =
                dir_entry.map_err(|e| Error::io(e, &self.root, "read_dir_entry"))?;
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || !name.ends_with(METADATA_SUFFIX) {
                continue;
            }

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable cache metadata: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<CacheEntry>(&content) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), "Skipping corrupt cache metadata: {e}");
                }
            }
        }

        Ok(entries)
    }

    /// Validate an entry's content tree against its recorded checksum
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the tree exists but cannot be read; a missing
    /// tree or checksum mismatch is a [`Validity`] outcome, not an error.
    pub fn validate(&self, entry: &CacheEntry) -> Result<Validity> {
        if !entry.path.exists() {
            return Ok(Validity::MissingTree);
        }
        let actual = self.compute_checksum(&entry.path)?;
        if actual == entry.checksum {
            Ok(Validity::Valid)
        } else {
            Ok(Validity::ChecksumMismatch {
                expected: entry.checksum.clone(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, DiskStore) {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cache"));
        (tmp, store)
    }

    fn sample_source(tmp: &TempDir) -> PathBuf {
        let src = tmp.path().join("source");
        fs::create_dir_all(src.join("src/nested")).unwrap();
        fs::write(src.join("package.json"), b"{\"name\":\"demo\"}").unwrap();
        fs::write(src.join("src/index.js"), b"console.log('hi')").unwrap();
        fs::write(src.join("src/nested/util.js"), b"module.exports = {}").unwrap();
        src
    }

    #[test]
    fn test_write_copies_nested_tree() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);

        let dest = store.write("demo@1.0.0", &src).unwrap();

        assert!(dest.join("package.json").exists());
        assert!(dest.join("src/index.js").exists());
        assert!(dest.join("src/nested/util.js").exists());
        assert_eq!(
            fs::read(dest.join("src/index.js")).unwrap(),
            b"console.log('hi')"
        );
    }

    #[test]
    fn test_write_replaces_existing_tree() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        store.write("demo@1.0.0", &src).unwrap();

        let src2 = tmp.path().join("source2");
        fs::create_dir_all(&src2).unwrap();
        fs::write(src2.join("only.txt"), b"fresh").unwrap();

        let dest = store.write("demo@1.0.0", &src2).unwrap();
        assert!(dest.join("only.txt").exists());
        assert!(!dest.join("package.json").exists());
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();

        let a = store.compute_checksum(&dest).unwrap();
        let b = store.compute_checksum(&dest).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_matches_source_tree() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();

        assert_eq!(
            store.compute_checksum(&src).unwrap(),
            store.compute_checksum(&dest).unwrap()
        );
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();

        let before = store.compute_checksum(&dest).unwrap();
        fs::write(dest.join("src/index.js"), b"console.log('changed')").unwrap();
        let after = store.compute_checksum(&dest).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_tree_size_sums_files() {
        let (tmp, store) = store();
        let src = tmp.path().join("sized");
        fs::create_dir_all(src.join("dir")).unwrap();
        fs::write(src.join("a.bin"), vec![0u8; 50]).unwrap();
        fs::write(src.join("dir/b.bin"), vec![0u8; 30]).unwrap();

        assert_eq!(store.tree_size(&src).unwrap(), 80);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();
        let checksum = store.compute_checksum(&dest).unwrap();
        let size = store.tree_size(&dest).unwrap();

        let entry = CacheEntry::new("demo", "1.0.0", dest, checksum, size);
        store.write_metadata(&entry).unwrap();

        let loaded = store.read_metadata("demo@1.0.0").unwrap().unwrap();
        assert_eq!(loaded.id, entry.id);
        assert_eq!(loaded.checksum, entry.checksum);
        assert_eq!(loaded.size_bytes, entry.size_bytes);
    }

    #[test]
    fn test_read_metadata_absent() {
        let (_tmp, store) = store();
        assert!(store.read_metadata("missing@0.0.0").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_sidecar_skipped_in_listing() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();
        let checksum = store.compute_checksum(&dest).unwrap();
        let entry = CacheEntry::new("demo", "1.0.0", dest, checksum, 10);
        store.write_metadata(&entry).unwrap();

        fs::write(store.metadata_path("broken@0.1.0"), b"{not json").unwrap();

        let listed = store.list_all_metadata().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "demo@1.0.0");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();
        let checksum = store.compute_checksum(&dest).unwrap();
        let entry = CacheEntry::new("demo", "1.0.0", dest, checksum, 10);
        store.write_metadata(&entry).unwrap();

        assert!(store.remove("demo@1.0.0").unwrap());
        assert!(!store.remove("demo@1.0.0").unwrap());
        assert!(!store.content_path("demo@1.0.0").exists());
        assert!(!store.metadata_path("demo@1.0.0").exists());
    }

    #[test]
    fn test_validate_detects_tampering() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();
        let checksum = store.compute_checksum(&dest).unwrap();
        let size = store.tree_size(&dest).unwrap();
        let entry = CacheEntry::new("demo", "1.0.0", dest.clone(), checksum, size);

        assert_eq!(store.validate(&entry).unwrap(), Validity::Valid);

        fs::write(dest.join("package.json"), b"{\"name\":\"tampered\"}").unwrap();
        assert!(matches!(
            store.validate(&entry).unwrap(),
            Validity::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn test_validate_detects_missing_tree() {
        let (tmp, store) = store();
        let src = sample_source(&tmp);
        let dest = store.write("demo@1.0.0", &src).unwrap();
        let checksum = store.compute_checksum(&dest).unwrap();
        let entry = CacheEntry::new("demo", "1.0.0", dest.clone(), checksum, 10);

        fs::remove_dir_all(&dest).unwrap();
        assert_eq!(store.validate(&entry).unwrap(), Validity::MissingTree);
    }
}
