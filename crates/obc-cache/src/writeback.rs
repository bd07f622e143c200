//! Writeback transport capability consumed by the cacher.
//!
//! The host supplies an implementation that performs the actual backing
//! store I/O. Both submission calls happen while the cacher's state lock
//! is held, so implementations must queue the work and return immediately;
//! invoking a completion token from inside `read`/`write` would deadlock.
//!
//! Completion tokens re-enter the cacher on whatever thread the transport
//! delivers replies from; the cacher serializes them internally.

use crate::ObjectCacher;
use obc_error::CacheError;
use obc_types::{ObjectId, PoolId, SnapContext, SnapId, TxnId};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Parameters of one backend read.
#[derive(Debug, Clone)]
pub struct BackendRead {
    pub pool: PoolId,
    pub oid: ObjectId,
    pub snap: SnapId,
    pub offset: u64,
    pub length: u64,
    /// Truncate hints from the owning object set, forwarded verbatim.
    pub truncate_size: u64,
    pub truncate_seq: u32,
}

/// Parameters of one backend write.
#[derive(Debug, Clone)]
pub struct BackendWrite {
    pub pool: PoolId,
    pub oid: ObjectId,
    pub snapc: SnapContext,
    pub offset: u64,
    pub length: u64,
    pub data: Vec<u8>,
    pub mtime: SystemTime,
    pub truncate_size: u64,
    pub truncate_seq: u32,
}

/// Narrow capability the cache consumes to talk to the backing store.
pub trait WritebackHandler: Send + Sync {
    /// Submit an asynchronous read. The transport later resolves
    /// `completion` with the bytes read (may be shorter than requested;
    /// the cacher zero-pads) or an error. `CacheError::NoEntity` means
    /// the object is absent.
    fn read(&self, req: BackendRead, completion: ReadCompletion);

    /// Submit an asynchronous write, returning a transaction id that is
    /// strictly increasing per object. The transport later resolves
    /// `completion` with that same tid. Commits for one object must be
    /// delivered in tid order.
    fn write(&self, req: BackendWrite, completion: WriteCompletion) -> TxnId;

    /// Whether a write to the given range might trigger copy-on-write at
    /// the backing store for the given snapshot context.
    fn may_copy_on_write(&self, oid: &ObjectId, offset: u64, length: u64, snap: SnapId) -> bool;
}

/// Token resolving one in-flight backend read.
pub struct ReadCompletion {
    cache: Weak<ObjectCacher>,
    pool: PoolId,
    oid: ObjectId,
    snap: SnapId,
    start: u64,
    length: u64,
}

impl ReadCompletion {
    pub(crate) fn new(
        cache: &Arc<ObjectCacher>,
        pool: PoolId,
        oid: ObjectId,
        snap: SnapId,
        start: u64,
        length: u64,
    ) -> Self {
        Self {
            cache: Arc::downgrade(cache),
            pool,
            oid,
            snap,
            start,
            length,
        }
    }

    /// Deliver the read result to the cacher. Dropped silently when the
    /// cacher has already been torn down.
    pub fn complete(self, result: Result<Vec<u8>, CacheError>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.bh_read_finish(
                self.pool,
                self.oid,
                self.snap,
                self.start,
                self.length,
                result,
            );
        }
    }
}

impl std::fmt::Debug for ReadCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCompletion")
            .field("oid", &self.oid)
            .field("start", &self.start)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Token resolving one in-flight backend write.
pub struct WriteCompletion {
    cache: Weak<ObjectCacher>,
    pool: PoolId,
    oid: ObjectId,
    snap: SnapId,
    start: u64,
    length: u64,
}

impl WriteCompletion {
    pub(crate) fn new(
        cache: &Arc<ObjectCacher>,
        pool: PoolId,
        oid: ObjectId,
        snap: SnapId,
        start: u64,
        length: u64,
    ) -> Self {
        Self {
            cache: Arc::downgrade(cache),
            pool,
            oid,
            snap,
            start,
            length,
        }
    }

    /// Deliver the commit for `tid` to the cacher.
    pub fn complete(self, tid: TxnId, result: Result<(), CacheError>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.bh_write_commit(
                self.pool,
                self.oid,
                self.snap,
                self.start,
                self.length,
                tid,
                result,
            );
        }
    }
}

impl std::fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCompletion")
            .field("oid", &self.oid)
            .field("start", &self.start)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
