//! Error types for the template cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
///
/// Absent keys are not an error: lookups surface them as `Ok(None)` or
/// `false`, and a failed integrity check is an internal eviction, not an
/// `Err` to the caller.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(trellis::cache::io),
        help("Check file permissions and ensure the cache directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "copy")
        operation: String,
    },

    /// Caller handed us an unusable argument (empty or missing source path)
    #[error("Cache validation error: {message}")]
    #[diagnostic(code(trellis::cache::validation))]
    Validation {
        /// Error message describing the invalid input
        message: String,
    },

    /// Metadata sidecar encode/decode failure
    #[error("Serialization error: {message}")]
    #[diagnostic(code(trellis::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A single template is larger than the whole cache budget, so no amount
    /// of eviction can bring utilization under the limit
    #[error("Template {key} is {size_bytes} bytes, which exceeds the cache size limit of {max_size_bytes} bytes")]
    #[diagnostic(
        code(trellis::cache::policy),
        help("Raise maxSize in the cache configuration or shrink the template")
    )]
    PolicyViolation {
        /// Cache key of the offending template
        key: String,
        /// Size of the template tree in bytes
        size_bytes: u64,
        /// Configured cache size limit in bytes
        max_size_bytes: u64,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a policy violation error
    #[must_use]
    pub fn policy_violation(key: impl Into<String>, size_bytes: u64, max_size_bytes: u64) -> Self {
        Self::PolicyViolation {
            key: key.into(),
            size_bytes,
            max_size_bytes,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
