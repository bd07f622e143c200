#![forbid(unsafe_code)]
//! Shared identifier and extent types for the obcache workspace.
//!
//! These are unit-carrying wrappers so that pools, snapshots, transaction
//! ids and byte offsets cannot be mixed up silently at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pool identifier; partitions the top-level object index.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PoolId(pub i64);

/// Snapshot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapId(pub u64);

impl SnapId {
    /// The "head" (no snapshot) sentinel. Writes always target the head.
    pub const NOSNAP: SnapId = SnapId(u64::MAX - 1);

    #[must_use]
    pub fn is_head(self) -> bool {
        self == Self::NOSNAP
    }
}

/// Transaction id assigned by the writeback layer at write submission.
///
/// Strictly increasing per object; used to match commits to writes and to
/// detect superseding writes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

/// Handle for an [`ObjectSet`] registered with the cacher.
///
/// [`ObjectSet`]: https://docs.rs/obc-cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SetId(pub u64);

/// Opaque object name as known to the backing store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub Vec<u8>);

impl ObjectId {
    #[must_use]
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "ObjectId({s:?})"),
            Err(_) => write!(f, "ObjectId({:02x?})", self.0),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// Full identity of a cached object: `(pool, oid, snap)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub pool: PoolId,
    pub oid: ObjectId,
    pub snap: SnapId,
}

impl ObjectKey {
    #[must_use]
    pub fn new(pool: PoolId, oid: ObjectId, snap: SnapId) -> Self {
        Self { pool, oid, snap }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pool.0, self.oid, self.snap.0)
    }
}

/// Snapshot context attached to a write: the most recent snap seq plus the
/// set of existing snapshots, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<u64>,
}

impl SnapContext {
    /// A context is valid when `snaps` is sorted descending and bounded by
    /// `seq`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let mut prev = self.seq;
        for &s in &self.snaps {
            if s > prev {
                return false;
            }
            prev = s;
        }
        true
    }
}

/// One fragment of the caller's I/O buffer mapped onto an object extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferExtent {
    /// Offset within the caller's flat buffer.
    pub buf_offset: u64,
    pub len: u64,
}

/// A contiguous byte range of one object, as produced by the striping
/// layer, together with the caller-buffer fragments it maps to.
///
/// `buffer_extents` lengths must sum to `length`; fragments appear in
/// object-offset order but their buffer offsets need not be contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectExtent {
    pub oid: ObjectId,
    pub pool: PoolId,
    /// Offset within the object.
    pub offset: u64,
    pub length: u64,
    pub buffer_extents: Vec<BufferExtent>,
}

impl ObjectExtent {
    /// Convenience constructor for the common one-fragment case where the
    /// extent maps to `[buf_offset, buf_offset + length)` of the caller
    /// buffer.
    #[must_use]
    pub fn simple(oid: impl Into<ObjectId>, pool: PoolId, offset: u64, length: u64) -> Self {
        Self::with_buffer_offset(oid, pool, offset, length, 0)
    }

    #[must_use]
    pub fn with_buffer_offset(
        oid: impl Into<ObjectId>,
        pool: PoolId,
        offset: u64,
        length: u64,
        buf_offset: u64,
    ) -> Self {
        Self {
            oid: oid.into(),
            pool,
            offset,
            length,
            buffer_extents: vec![BufferExtent {
                buf_offset,
                len: length,
            }],
        }
    }

    /// End offset (exclusive) within the object.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Validate the fragment list against `length`.
    pub fn check(&self) -> Result<(), ExtentError> {
        let total: u64 = self.buffer_extents.iter().map(|f| f.len).sum();
        if total != self.length {
            return Err(ExtentError::FragmentMismatch {
                fragments: total,
                length: self.length,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtentError {
    #[error("buffer fragments cover {fragments} bytes but extent length is {length}")]
    FragmentMismatch { fragments: u64, length: u64 },
}
