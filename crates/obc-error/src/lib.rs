#![forbid(unsafe_code)]
//! Error types for obcache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace. The backing-store protocol speaks POSIX errnos (with
//! `ENOENT` carrying real semantics: "object absent"), so both
//! directions of the errno mapping are provided.
//!
//! `CacheError` is `Clone`: a single backend failure fans out to every
//! read waiter parked on the affected extents.

use thiserror::Error;

/// Unified error type for cache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The object does not exist on the backing store.
    #[error("object not found")]
    NoEntity,

    /// Backend I/O failure, carrying the transport's errno.
    #[error("backend I/O failure (errno {0})")]
    Backend(i32),

    /// Invalid cache configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The referenced object set is not registered with the cacher.
    #[error("unknown object set")]
    UnknownSet,
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoEntity => libc::ENOENT,
            Self::Backend(e) => *e,
            Self::Config(_) => libc::EINVAL,
            Self::UnknownSet => libc::EBADF,
        }
    }

    /// Build an error from a backend errno. `ENOENT` is lifted to
    /// [`CacheError::NoEntity`] so callers can match on it directly.
    #[must_use]
    pub fn from_errno(errno: libc::c_int) -> Self {
        if errno == libc::ENOENT {
            Self::NoEntity
        } else {
            Self::Backend(errno)
        }
    }

    #[must_use]
    pub fn is_enoent(&self) -> bool {
        matches!(self, Self::NoEntity)
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
