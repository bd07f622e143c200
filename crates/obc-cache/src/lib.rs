#![forbid(unsafe_code)]
//! Client-side write-back object cache.
//!
//! Sits between a consumer of an object store (e.g. a file or block
//! client layered on top of striped objects) and the asynchronous
//! writeback transport. Scattered reads and writes are absorbed into
//! per-object extent maps; reads are served from cache where possible,
//! writes are coalesced and deferred until policy flushes them, and
//! asynchronous completions (including out-of-order and failed ones) are
//! reconciled back into extent state.
//!
//! The [`ObjectCacher`] owns all state behind one mutex; public
//! operations, the flusher thread and transport completions all
//! serialize on it. The transport is abstracted as a
//! [`WritebackHandler`] and must never invoke a completion token from
//! inside a submission call.

mod completion;
mod lru;
mod object;
mod writeback;

pub use completion::{CommitCallback, FlushSetCallback, ReadCallback};
pub use object::{BhState, ExtentInfo};
pub use writeback::{
    BackendRead, BackendWrite, ReadCompletion, WriteCompletion, WritebackHandler,
};

use completion::{FinishFn, Gather, GatherId, GatherTarget, PendingRead, ReadId, SyncSignal, Waiter};
use lru::LruList;
use obc_error::CacheError;
use obc_types::{ObjectExtent, ObjectId, ObjectKey, PoolId, SetId, SnapContext, SnapId, TxnId};
use object::{BhLoc, Object, ReadClass};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, trace, warn};

pub(crate) const EXPECT_OB: &str = "object index lost a live entry";
pub(crate) const EXPECT_BH: &str = "extent map lost a live entry";

/// Sizing and flush policy for an [`ObjectCacher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Ceiling on clean + zero bytes; `trim` evicts down to it.
    pub max_bytes: u64,
    /// Ceiling on cached objects; `trim` closes idle ones down to it.
    pub max_objects: usize,
    /// Ceiling on dirty + tx bytes before writers block. Zero selects
    /// write-through: every write flushes and waits for its commit.
    pub max_dirty: u64,
    /// Dirty watermark the flusher drains down to when nudged.
    pub target_dirty: u64,
    /// Age at which the flusher writes back a dirty extent regardless of
    /// watermarks.
    pub max_dirty_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 << 20,
            max_objects: 1024,
            max_dirty: 32 << 20,
            target_dirty: 8 << 20,
            max_dirty_age: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    pub fn validate(self) -> Result<Self, CacheError> {
        if self.max_bytes == 0 {
            return Err(CacheError::Config("max_bytes must be > 0".to_owned()));
        }
        if self.max_objects == 0 {
            return Err(CacheError::Config("max_objects must be > 0".to_owned()));
        }
        if self.max_dirty > 0 && self.target_dirty > self.max_dirty {
            return Err(CacheError::Config(
                "target_dirty must not exceed max_dirty".to_owned(),
            ));
        }
        if self.max_dirty > self.max_bytes {
            return Err(CacheError::Config(
                "max_dirty must not exceed max_bytes".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// A read against one or more object extents of a single snapshot.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub snap: SnapId,
    pub extents: Vec<ObjectExtent>,
}

/// A write carrying one flat data buffer mapped onto object extents.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub snapc: SnapContext,
    pub mtime: SystemTime,
    pub extents: Vec<ObjectExtent>,
    pub data: Vec<u8>,
}

/// Outcome of a [`ObjectCacher::readx`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Every byte was served from cache; the callback was not consumed.
    Done(Vec<u8>),
    /// Some extents are being fetched; the callback fires on completion.
    Pending,
}

/// Per-state byte totals. Invariant: each field equals the summed length
/// of all extents currently in that state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateBytes {
    pub missing: u64,
    pub clean: u64,
    pub zero: u64,
    pub dirty: u64,
    pub tx: u64,
    pub rx: u64,
    pub error: u64,
}

impl StateBytes {
    fn field(&mut self, state: BhState) -> &mut u64 {
        match state {
            BhState::Missing => &mut self.missing,
            BhState::Clean => &mut self.clean,
            BhState::Zero => &mut self.zero,
            BhState::Dirty => &mut self.dirty,
            BhState::Tx => &mut self.tx,
            BhState::Rx => &mut self.rx,
            BhState::Error => &mut self.error,
        }
    }

    pub(crate) fn add(&mut self, state: BhState, len: u64) {
        *self.field(state) += len;
    }

    pub(crate) fn sub(&mut self, state: BhState, len: u64) {
        let f = self.field(state);
        *f = f.checked_sub(len).expect("state byte counter underflow");
    }
}

/// Point-in-time snapshot of the per-state byte counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub missing: u64,
    pub clean: u64,
    pub zero: u64,
    pub dirty: u64,
    pub tx: u64,
    pub rx: u64,
    pub error: u64,
    /// Bytes admission-blocked writers have pledged against the ceiling.
    pub dirty_waiting: u64,
}

/// Monotonic operation counters, snapshot-readable via
/// [`ObjectCacher::perf`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PerfCounters {
    pub cache_ops_hit: u64,
    pub cache_ops_miss: u64,
    pub cache_bytes_hit: u64,
    pub cache_bytes_miss: u64,
    pub data_read: u64,
    pub data_written: u64,
    pub data_flushed: u64,
    /// Bytes written over extents whose previous write was still in
    /// flight.
    pub overwritten_in_flush: u64,
    pub write_ops_blocked: u64,
    pub write_bytes_blocked: u64,
    pub write_time_blocked: Duration,
}

/// Externally visible status of one cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStatus {
    pub exists: bool,
    pub complete: bool,
    pub dirty_or_tx: u64,
    pub last_write_tid: TxnId,
    pub last_commit_tid: TxnId,
}

/// A group of objects belonging to one client workload.
#[derive(Debug)]
pub(crate) struct ObjectSetState {
    pub pool: PoolId,
    pub objects: BTreeSet<ObjectKey>,
    pub dirty_or_tx: u64,
    /// Reads against absent objects return `NoEntity` instead of zeros.
    pub return_enoent: bool,
    pub truncate_size: u64,
    pub truncate_seq: u32,
}

impl ObjectSetState {
    pub(crate) fn new(pool: PoolId) -> Self {
        Self {
            pool,
            objects: BTreeSet::new(),
            dirty_or_tx: 0,
            return_enoent: false,
            truncate_size: 0,
            truncate_seq: 0,
        }
    }
}

/// Everything behind the cacher's lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub objects: BTreeMap<ObjectKey, Object>,
    pub sets: BTreeMap<SetId, ObjectSetState>,
    /// Recency of every non-dirty extent.
    pub lru_rest: LruList<BhLoc>,
    /// Recency of every dirty extent; the flusher expires from its tail.
    pub lru_dirty: LruList<BhLoc>,
    /// Fast existence index; always equal to the contents of `lru_dirty`.
    pub dirty_bh: BTreeSet<BhLoc>,
    pub ob_lru: LruList<ObjectKey>,
    pub stats: StateBytes,
    pub stat_dirty_waiting: u64,
    pub perf: PerfCounters,
    pub pending_reads: BTreeMap<ReadId, PendingRead>,
    pub gathers: BTreeMap<GatherId, Gather>,
    next_read_id: u64,
    next_gather_id: u64,
    next_set_id: u64,
}

impl CacheState {
    pub(crate) fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            sets: BTreeMap::new(),
            lru_rest: LruList::new(),
            lru_dirty: LruList::new(),
            dirty_bh: BTreeSet::new(),
            ob_lru: LruList::new(),
            stats: StateBytes::default(),
            stat_dirty_waiting: 0,
            perf: PerfCounters::default(),
            pending_reads: BTreeMap::new(),
            gathers: BTreeMap::new(),
            next_read_id: 1,
            next_gather_id: 1,
            next_set_id: 1,
        }
    }

    fn alloc_read_id(&mut self) -> ReadId {
        let id = ReadId(self.next_read_id);
        self.next_read_id += 1;
        id
    }

    fn alloc_gather(&mut self, gather: Gather) -> GatherId {
        let id = GatherId(self.next_gather_id);
        self.next_gather_id += 1;
        self.gathers.insert(id, gather);
        id
    }
}

/// The cache core. Construct with [`ObjectCacher::new`], register object
/// sets, then drive reads/writes through [`readx`](Self::readx) /
/// [`writex`](Self::writex) and start the background
/// [`flusher`](Self::start_flusher).
pub struct ObjectCacher {
    writeback: Arc<dyn WritebackHandler>,
    cfg: CacheConfig,
    flush_callback: Option<Arc<dyn Fn(SetId) + Send + Sync>>,
    state: Mutex<CacheState>,
    /// Wakes admission-blocked writers when bytes drain.
    stat_cond: Condvar,
    /// Nudges the flusher out of its interval sleep.
    flusher_cond: Condvar,
}

impl std::fmt::Debug for ObjectCacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCacher")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl ObjectCacher {
    pub fn new(
        cfg: CacheConfig,
        writeback: Arc<dyn WritebackHandler>,
        flush_callback: Option<FlushSetCallback>,
    ) -> Result<Arc<Self>, CacheError> {
        let cfg = cfg.validate()?;
        info!(
            event = "cacher_create",
            max_bytes = cfg.max_bytes,
            max_objects = cfg.max_objects,
            max_dirty = cfg.max_dirty,
            target_dirty = cfg.target_dirty,
            max_dirty_age_ms = cfg.max_dirty_age.as_millis() as u64
        );
        Ok(Arc::new(Self {
            writeback,
            cfg,
            flush_callback: flush_callback.map(Arc::from),
            state: Mutex::new(CacheState::new()),
            stat_cond: Condvar::new(),
            flusher_cond: Condvar::new(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.cfg
    }

    // ── Object sets ─────────────────────────────────────────────────────

    /// Register a new object set (one per client workload, e.g. a file).
    pub fn create_set(&self, pool: PoolId) -> SetId {
        let mut st = self.state.lock();
        let id = SetId(st.next_set_id);
        st.next_set_id += 1;
        st.sets.insert(id, ObjectSetState::new(pool));
        debug!(event = "set_create", set = id.0, pool = pool.0);
        id
    }

    /// Enable or disable `NoEntity` results for reads of absent objects.
    pub fn set_return_enoent(&self, set: SetId, enable: bool) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get_mut(&set).ok_or(CacheError::UnknownSet)?;
        s.return_enoent = enable;
        Ok(())
    }

    /// Record truncate hints forwarded with every backend I/O of the set.
    pub fn set_truncate_hint(&self, set: SetId, size: u64, seq: u32) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get_mut(&set).ok_or(CacheError::UnknownSet)?;
        s.truncate_size = size;
        s.truncate_seq = seq;
        Ok(())
    }

    /// Unregister an emptied set. Fails while objects remain cached;
    /// release or purge first.
    pub fn drop_set(&self, set: SetId) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        if !s.objects.is_empty() {
            return Err(CacheError::Config(
                "object set still has cached objects".to_owned(),
            ));
        }
        st.sets.remove(&set);
        debug!(event = "set_drop", set = set.0);
        Ok(())
    }

    fn get_object(
        &self,
        st: &mut CacheState,
        pool: PoolId,
        oid: &ObjectId,
        snap: SnapId,
        set: SetId,
    ) -> ObjectKey {
        let key = ObjectKey::new(pool, oid.clone(), snap);
        if st.objects.contains_key(&key) {
            st.ob_lru.touch(&key);
            return key;
        }
        st.objects.insert(key.clone(), Object::new(key.clone(), set));
        st.ob_lru.insert_top(key.clone());
        if let Some(s) = st.sets.get_mut(&set) {
            debug_assert_eq!(s.pool, pool, "extent pool diverges from its set");
            s.objects.insert(key.clone());
        }
        trace!(event = "object_open", ob = %key, set = set.0);
        key
    }

    fn close_object(st: &mut CacheState, key: &ObjectKey) {
        debug_assert!(st.ob(key).can_close());
        trace!(event = "object_close", ob = %key);
        st.ob_lru.remove(key);
        let ob = st.objects.remove(key).expect(EXPECT_OB);
        if let Some(s) = st.sets.get_mut(&ob.set) {
            s.objects.remove(key);
        }
    }

    // ── Backend submission ──────────────────────────────────────────────

    fn bh_read(self: &Arc<Self>, st: &mut CacheState, loc: &BhLoc) {
        st.set_bh_state(loc, BhState::Rx);
        let (start, len) = {
            let bh = st.bh(loc);
            (bh.start, bh.len)
        };
        let set = st.ob(&loc.ob).set;
        let (tsize, tseq) = st
            .sets
            .get(&set)
            .map_or((0, 0), |s| (s.truncate_size, s.truncate_seq));
        debug!(event = "bh_read", ob = %loc.ob, start, len);
        let completion = ReadCompletion::new(
            self,
            loc.ob.pool,
            loc.ob.oid.clone(),
            loc.ob.snap,
            start,
            len,
        );
        self.writeback.read(
            BackendRead {
                pool: loc.ob.pool,
                oid: loc.ob.oid.clone(),
                snap: loc.ob.snap,
                offset: start,
                length: len,
                truncate_size: tsize,
                truncate_seq: tseq,
            },
            completion,
        );
    }

    fn bh_write(self: &Arc<Self>, st: &mut CacheState, loc: &BhLoc) {
        let (start, len, data, snapc, mtime) = {
            let bh = st.bh(loc);
            (
                bh.start,
                bh.len,
                bh.data.clone(),
                bh.snapc.clone(),
                bh.mtime,
            )
        };
        let set = st.ob(&loc.ob).set;
        let (tsize, tseq) = st
            .sets
            .get(&set)
            .map_or((0, 0), |s| (s.truncate_size, s.truncate_seq));
        let completion = WriteCompletion::new(
            self,
            loc.ob.pool,
            loc.ob.oid.clone(),
            loc.ob.snap,
            start,
            len,
        );
        let tid = self.writeback.write(
            BackendWrite {
                pool: loc.ob.pool,
                oid: loc.ob.oid.clone(),
                snapc,
                offset: start,
                length: len,
                data,
                mtime,
                truncate_size: tsize,
                truncate_seq: tseq,
            },
            completion,
        );
        debug!(event = "bh_write", ob = %loc.ob, start, len, tid = tid.0);
        st.ob_mut(&loc.ob).last_write_tid = tid;
        st.bh_mut(loc).last_write_tid = tid;
        st.perf.data_flushed += len;
        st.set_bh_state(loc, BhState::Tx);
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Read the request's extents, serving from cache where possible.
    ///
    /// Returns `Done(bytes)` when everything was cached (`on_finish` is
    /// not consumed), `Pending` when backend reads were issued and the
    /// callback will deliver the assembled bytes, or an error such as
    /// `NoEntity` for the configured ENOENT fast path (which requires a
    /// single-extent request).
    pub fn readx(
        self: &Arc<Self>,
        rd: ReadRequest,
        set: SetId,
        on_finish: ReadCallback,
    ) -> Result<ReadOutcome, CacheError> {
        for ex in &rd.extents {
            if ex.length == 0 || ex.check().is_err() {
                return Err(CacheError::Config("malformed read extent".to_owned()));
            }
        }
        let mut st = self.state.lock();
        if !st.sets.contains_key(&set) {
            return Err(CacheError::UnknownSet);
        }
        let pending = PendingRead {
            rd,
            set,
            on_finish,
        };
        let res = self.readx_locked(&mut st, pending, true);
        drop(st);
        match res {
            Some((_cb, Ok(data))) => Ok(ReadOutcome::Done(data)),
            Some((_cb, Err(e))) => Err(e),
            None => Ok(ReadOutcome::Pending),
        }
    }

    /// Core read mapping. Returns the callback and result when the read
    /// finished (hit everywhere, or failed); `None` when it parked
    /// itself to be retried by a completion.
    fn readx_locked(
        self: &Arc<Self>,
        st: &mut CacheState,
        pending: PendingRead,
        external: bool,
    ) -> Option<(ReadCallback, Result<Vec<u8>, CacheError>)> {
        let set = pending.set;
        let snap = pending.rd.snap;
        let read_id = st.alloc_read_id();
        let extents = pending.rd.extents.clone();

        let mut success = true;
        let mut error: Option<CacheError> = None;
        let mut hit_locs: Vec<BhLoc> = Vec::new();
        let mut bytes_in_cache = 0_u64;
        let mut bytes_not_in_cache = 0_u64;
        let mut total_bytes_read = 0_u64;
        let mut stripe_map: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        for ex in &extents {
            total_bytes_read += ex.length;
            let obkey = self.get_object(st, ex.pool, &ex.oid, snap, set);

            // object known absent?
            if st.sets[&set].return_enoent && !st.ob(&obkey).exists {
                // ENOENT is only meaningful for a single-extent request;
                // multi-extent callers get zeroed buffers instead.
                assert_eq!(
                    extents.len(),
                    1,
                    "ENOENT read semantics require a single extent"
                );
                if self
                    .writeback
                    .may_copy_on_write(&ex.oid, ex.offset, ex.length, snap)
                {
                    // dirty data could be cloned underneath us; push it
                    // out and retry once it commits
                    let dirty: Vec<u64> = st
                        .ob(&obkey)
                        .data
                        .iter()
                        .filter(|(_, bh)| bh.state == BhState::Dirty)
                        .map(|(&s, _)| s)
                        .collect();
                    let any_tx = st
                        .ob(&obkey)
                        .data
                        .values()
                        .any(|bh| bh.state == BhState::Tx);
                    let wait = any_tx || !dirty.is_empty();
                    for s in dirty {
                        self.bh_write(st, &BhLoc::new(&obkey, s));
                    }
                    if wait {
                        let tid = st.ob(&obkey).last_write_tid;
                        debug!(event = "readx_wait_cow_flush", ob = %obkey, tid = tid.0);
                        st.ob_mut(&obkey)
                            .waitfor_commit
                            .entry(tid)
                            .or_default()
                            .push(Waiter::RetryRead(read_id));
                        st.pending_reads.insert(read_id, pending);
                        return None;
                    }
                }
                let allzero = st
                    .ob(&obkey)
                    .data
                    .values()
                    .all(|bh| matches!(bh.state, BhState::Zero | BhState::Rx));
                if allzero {
                    debug!(event = "readx_enoent", ob = %obkey);
                    return Some((pending.on_finish, Err(CacheError::NoEntity)));
                }
            }

            let ReadClass {
                mut hits,
                mut missing,
                rx,
                errors,
            } = st.map_read(&obkey, ex.offset, ex.length);
            if external {
                // retry previously failed extents
                missing.extend(errors.iter().copied());
                missing.sort_unstable();
            } else {
                // surface errors instead of looping on retries
                for &(pos, s) in &errors {
                    hits.insert(pos, s);
                }
            }

            if !missing.is_empty() || !rx.is_empty() {
                for &(pos, s) in &missing {
                    let loc = BhLoc::new(&obkey, s);
                    self.bh_read(st, &loc);
                    bytes_not_in_cache += st.bh(&loc).len;
                    if success {
                        trace!(event = "readx_wait_missing", ob = %obkey, offset = pos);
                        st.bh_mut(&loc)
                            .waiters
                            .entry(pos)
                            .or_default()
                            .push(Waiter::RetryRead(read_id));
                    }
                    success = false;
                }
                for &(pos, s) in &rx {
                    let loc = BhLoc::new(&obkey, s);
                    // bump in lru so in-flight data is not trimmed away
                    st.touch_bh(&loc);
                    bytes_not_in_cache += st.bh(&loc).len;
                    if success {
                        trace!(event = "readx_wait_rx", ob = %obkey, offset = pos);
                        st.bh_mut(&loc)
                            .waiters
                            .entry(pos)
                            .or_default()
                            .push(Waiter::RetryRead(read_id));
                    }
                    success = false;
                }
            } else {
                assert!(!hits.is_empty(), "mapped read produced no classification");
                for (_, &s) in &hits {
                    let loc = BhLoc::new(&obkey, s);
                    let bh = st.bh(&loc);
                    if bh.state == BhState::Error {
                        if let Some(e) = &bh.error {
                            error = Some(e.clone());
                        }
                    }
                    bytes_in_cache += bh.len;
                    hit_locs.push(loc);
                }
                Self::assemble_extent(st, &obkey, ex, &hits, &mut stripe_map);
            }
        }

        for loc in &hit_locs {
            st.touch_bh(loc);
        }

        if !success {
            if external {
                st.perf.data_read += total_bytes_read;
                st.perf.cache_bytes_miss += bytes_not_in_cache;
                st.perf.cache_ops_miss += 1;
            }
            debug!(
                event = "readx_defer",
                bytes_missing = bytes_not_in_cache,
                external
            );
            st.pending_reads.insert(read_id, pending);
            return None;
        }
        if external {
            st.perf.data_read += total_bytes_read;
            st.perf.cache_bytes_hit += bytes_in_cache;
            st.perf.cache_ops_hit += 1;
        }

        let result = match error {
            Some(e) => Err(e),
            None => {
                let mut buf = Vec::with_capacity(total_bytes_read as usize);
                let mut pos = 0_u64;
                for (off, frag) in stripe_map {
                    assert_eq!(off, pos, "gap while assembling read result");
                    pos += frag.len() as u64;
                    buf.extend_from_slice(&frag);
                }
                Ok(buf)
            }
        };
        trace!(
            event = "readx_done",
            bytes = total_bytes_read,
            err = result.is_err()
        );
        self.trim_locked(st);
        Some((pending.on_finish, result))
    }

    /// Copy one extent's hit data into the caller-buffer stripe map.
    /// The hit extents are contiguous over the request range; the buffer
    /// fragments need not be.
    fn assemble_extent(
        st: &CacheState,
        obkey: &ObjectKey,
        ex: &ObjectExtent,
        hits: &BTreeMap<u64, u64>,
        stripe_map: &mut BTreeMap<u64, Vec<u8>>,
    ) {
        let ob = st.ob(obkey);
        let mut hit_it = hits.values();
        let Some(&first) = hit_it.next() else { return };
        let mut bh = &ob.data[&first];
        let mut opos = ex.offset;
        assert!(bh.start <= opos, "leading hit does not cover read start");
        let mut bhoff = opos - bh.start;
        let mut frag_it = ex.buffer_extents.iter();
        let Some(mut frag) = frag_it.next() else {
            return;
        };
        let mut foff = 0_u64;
        loop {
            debug_assert_eq!(opos, bh.start + bhoff);
            let len = (frag.len - foff).min(bh.len - bhoff);
            let dst = stripe_map.entry(frag.buf_offset).or_default();
            match bh.state {
                // zero extents have no payload; errored hits only occur
                // on internal retries, whose buffer is discarded
                BhState::Zero | BhState::Error => {
                    dst.resize(dst.len() + len as usize, 0);
                }
                _ => {
                    dst.extend_from_slice(&bh.data[bhoff as usize..(bhoff + len) as usize]);
                }
            }
            opos += len;
            bhoff += len;
            foff += len;
            if opos == bh.end() {
                match hit_it.next() {
                    Some(&s) => {
                        bh = &ob.data[&s];
                        bhoff = 0;
                    }
                    None => break,
                }
            }
            if foff == frag.len {
                match frag_it.next() {
                    Some(f) => {
                        frag = f;
                        foff = 0;
                    }
                    None => break,
                }
            }
        }
        debug_assert_eq!(opos, ex.end(), "assembly did not cover the extent");
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Absorb a write into the cache. May block on admission control, or
    /// until commit in write-through mode (`max_dirty == 0`).
    pub fn writex(self: &Arc<Self>, wr: WriteRequest, set: SetId) -> Result<(), CacheError> {
        for ex in &wr.extents {
            let frag_end_ok = ex
                .buffer_extents
                .iter()
                .all(|f| (f.buf_offset + f.len) as usize <= wr.data.len());
            if ex.length == 0 || ex.check().is_err() || !frag_end_ok {
                return Err(CacheError::Config("malformed write extent".to_owned()));
            }
        }
        let mut st = self.state.lock();
        if !st.sets.contains_key(&set) {
            return Err(CacheError::UnknownSet);
        }
        let now = Instant::now();
        let mut bytes_written = 0_u64;
        let mut bytes_written_in_flush = 0_u64;

        for ex in &wr.extents {
            let obkey = self.get_object(&mut st, ex.pool, &ex.oid, SnapId::NOSNAP, set);
            let floc = st.map_write(&obkey, ex.offset, ex.length);
            {
                let bh = st.bh(&floc);
                bytes_written += bh.len;
                if bh.state == BhState::Tx {
                    bytes_written_in_flush += bh.len;
                }
            }
            // copy caller bytes in, preserving whatever the fragments do
            // not overwrite
            st.bh_mut(&floc).ensure_payload();
            let mut opos = ex.offset;
            for frag in &ex.buffer_extents {
                let bh = st.bh_mut(&floc);
                let dst = (opos - bh.start) as usize;
                let src = frag.buf_offset as usize;
                bh.data[dst..dst + frag.len as usize]
                    .copy_from_slice(&wr.data[src..src + frag.len as usize]);
                opos += frag.len;
            }
            st.set_bh_state(&floc, BhState::Dirty);
            {
                let bh = st.bh_mut(&floc);
                bh.last_write = now;
                bh.mtime = wr.mtime;
                bh.snapc = wr.snapc.clone();
            }
            st.touch_bh(&floc);
            trace!(event = "writex_extent", ob = %obkey, offset = ex.offset, len = ex.length);
            st.try_merge_bh(floc);
        }

        st.perf.data_written += bytes_written;
        if bytes_written_in_flush > 0 {
            st.perf.overwritten_in_flush += bytes_written_in_flush;
        }

        let (mut st, ret) = self.wait_for_write(st, bytes_written, set, &wr.extents);
        self.trim_locked(&mut st);
        drop(st);
        ret
    }

    /// Admission control. With a dirty budget, block while dirty + tx
    /// bytes exceed `max_dirty` plus what other blocked writers have
    /// already pledged (so waiters do not queue behind each other). With
    /// `max_dirty == 0`, flush the just-written extents and wait for
    /// their commits.
    fn wait_for_write<'a>(
        self: &'a Arc<Self>,
        mut st: MutexGuard<'a, CacheState>,
        len: u64,
        set: SetId,
        extents: &[ObjectExtent],
    ) -> (MutexGuard<'a, CacheState>, Result<(), CacheError>) {
        let mut blocked = 0_u32;
        let wait_start = Instant::now();
        let mut ret = Ok(());

        if self.cfg.max_dirty > 0 {
            while st.stats.dirty + st.stats.tx >= self.cfg.max_dirty + st.stat_dirty_waiting {
                debug!(
                    event = "write_blocked",
                    len,
                    dirty_and_tx = st.stats.dirty + st.stats.tx,
                    max_dirty = self.cfg.max_dirty,
                    dirty_waiting = st.stat_dirty_waiting
                );
                self.flusher_cond.notify_one();
                st.stat_dirty_waiting += len;
                self.stat_cond.wait(&mut st);
                st.stat_dirty_waiting -= len;
                blocked += 1;
            }
        } else {
            // write-through: wait for what we just wrote to commit
            let sig = Arc::new(SyncSignal::default());
            let gid = st.alloc_gather(Gather::new(GatherTarget::Sync(Arc::clone(&sig))));
            let flushed = self.flush_extents_locked(&mut st, extents, gid);
            assert!(!flushed, "write-through flush found nothing to submit");
            self.gather_activate(&mut st, gid);
            drop(st);
            debug!(event = "write_through_wait", len, set = set.0);
            ret = sig.wait();
            st = self.state.lock();
        }

        if st.stats.dirty > self.cfg.target_dirty {
            trace!(
                event = "flusher_nudge",
                dirty = st.stats.dirty,
                target_dirty = self.cfg.target_dirty
            );
            self.flusher_cond.notify_one();
        }
        if blocked > 0 {
            st.perf.write_ops_blocked += 1;
            st.perf.write_bytes_blocked += len;
            st.perf.write_time_blocked += wait_start.elapsed();
        }
        (st, ret)
    }

    // ── Completion handlers ─────────────────────────────────────────────

    pub(crate) fn bh_read_finish(
        self: &Arc<Self>,
        pool: PoolId,
        oid: ObjectId,
        snap: SnapId,
        start: u64,
        length: u64,
        result: Result<Vec<u8>, CacheError>,
    ) {
        let mut out: Vec<FinishFn> = Vec::new();
        let mut st = self.state.lock();
        debug!(
            event = "bh_read_finish",
            oid = %oid,
            start,
            length,
            err = result.is_err()
        );
        // zero-pad short reads to the requested length
        let result = result.map(|mut bytes| {
            if (bytes.len() as u64) < length {
                bytes.resize(length as usize, 0);
            }
            bytes
        });
        let key = ObjectKey::new(pool, oid, snap);
        let mut ls: Vec<Waiter> = Vec::new();
        let mut err: Option<CacheError> = None;

        if st.objects.contains_key(&key) {
            if matches!(result, Err(CacheError::NoEntity)) && !st.ob(&key).complete {
                info!(event = "object_now_absent", ob = %key);
                let ob = st.ob_mut(&key);
                ob.complete = true;
                ob.exists = false;
                // wake every read waiter on the object, not just those on
                // this range: once absence is known, a new read returns
                // ENOENT immediately, and firing older identical reads
                // later would reorder them
                for bh in ob.data.values_mut() {
                    for (_, ws) in std::mem::take(&mut bh.waiters) {
                        ls.extend(ws);
                    }
                }
            }

            let mut opos = start;
            loop {
                let Some(s) = st.ob(&key).lower_bound_start(opos) else {
                    break;
                };
                if opos >= start + length {
                    break;
                }
                let loc = BhLoc::new(&key, s);
                {
                    let bh = st.bh_mut(&loc);
                    for (_, ws) in std::mem::take(&mut bh.waiters) {
                        ls.extend(ws);
                    }
                }
                let (bstart, bend, bstate, blen, berr) = {
                    let bh = st.bh(&loc);
                    (bh.start, bh.end(), bh.state, bh.len, bh.error.clone())
                };
                if bstart > opos {
                    warn!(event = "read_reply_gap", ob = %key, at = opos, next = bstart);
                    opos = bstart;
                    continue;
                }
                if bstate != BhState::Rx {
                    trace!(event = "read_finish_skip", state = bstate.name(), start = bstart);
                    opos = bend;
                    continue;
                }
                assert_eq!(bstart, opos, "in-flight reads are never merged");
                assert!(
                    blen <= start + length - opos,
                    "reply covers less than the in-flight extent"
                );
                if let Some(e) = berr {
                    err = Some(e);
                }
                let oldpos = opos;
                opos = bend;
                match &result {
                    Err(CacheError::NoEntity) => {
                        // the range is an implicit zero now that the
                        // object is complete and absent
                        st.bh_remove(&loc);
                    }
                    Err(e) => {
                        st.bh_mut(&loc).error = Some(e.clone());
                        st.set_bh_state(&loc, BhState::Error);
                    }
                    Ok(bytes) => {
                        let lo = (oldpos - start) as usize;
                        st.bh_mut(&loc).data = bytes[lo..lo + blen as usize].to_vec();
                        st.set_bh_state(&loc, BhState::Clean);
                        st.try_merge_bh(loc);
                    }
                }
            }
        } else {
            debug!(event = "read_finish_no_object", ob = %key);
        }

        let r = match err {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.finish_waiters(&mut st, ls, r, &mut out);
        self.wake_blocked_writers(&st);
        drop(st);
        for f in out {
            f();
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bh_write_commit(
        self: &Arc<Self>,
        pool: PoolId,
        oid: ObjectId,
        snap: SnapId,
        start: u64,
        length: u64,
        tid: TxnId,
        result: Result<(), CacheError>,
    ) {
        let mut out: Vec<FinishFn> = Vec::new();
        let mut st = self.state.lock();
        debug!(
            event = "bh_write_commit",
            oid = %oid,
            tid = tid.0,
            start,
            length,
            err = result.is_err()
        );
        let key = ObjectKey::new(pool, oid, snap);
        if st.objects.contains_key(&key) {
            let set = st.ob(&key).set;
            let was_dirty_or_tx = st.sets.get(&set).map_or(0, |s| s.dirty_or_tx);

            if !st.ob(&key).exists {
                trace!(event = "commit_sets_exists", ob = %key);
                st.ob_mut(&key).exists = true;
                if self
                    .writeback
                    .may_copy_on_write(&key.oid, start, length, key.snap)
                {
                    // snapshot bifurcation: our completeness knowledge is
                    // no longer authoritative
                    debug!(event = "commit_may_cow_clears_complete", ob = %key);
                    st.ob_mut(&key).complete = false;
                }
            }

            let candidates: Vec<u64> = {
                let ob = st.ob(&key);
                match ob.lower_bound_start(start) {
                    Some(first) => ob
                        .data
                        .range(first..)
                        .take_while(|(&s, _)| s <= start + length)
                        .map(|(&s, _)| s)
                        .collect(),
                    None => Vec::new(),
                }
            };
            for s in candidates {
                let loc = BhLoc::new(&key, s);
                let (bstart, bend, bstate, btid) = {
                    let bh = st.bh(&loc);
                    (bh.start, bh.end(), bh.state, bh.last_write_tid)
                };
                if bstart < start && bend > start + length {
                    trace!(event = "commit_skip_wider", start = bstart);
                    continue;
                }
                if bstate != BhState::Tx {
                    trace!(event = "commit_skip_state", state = bstate.name(), start = bstart);
                    continue;
                }
                if btid != tid {
                    assert!(
                        btid > tid,
                        "extent carries an older tid than the commit being applied"
                    );
                    trace!(event = "commit_superseded", start = bstart, bh_tid = btid.0);
                    continue;
                }
                match &result {
                    Ok(()) => {
                        st.set_bh_state(&loc, BhState::Clean);
                    }
                    Err(e) => {
                        warn!(event = "commit_failed_redirty", ob = %key, start = bstart, error = %e);
                        st.set_bh_state(&loc, BhState::Dirty);
                    }
                }
            }

            assert!(
                st.ob(&key).last_commit_tid < tid,
                "commit tid went backwards"
            );
            st.ob_mut(&key).last_commit_tid = tid;

            if let Some(ws) = st.ob_mut(&key).waitfor_commit.remove(&tid) {
                self.finish_waiters(&mut st, ws, result.clone(), &mut out);
            }

            // did the set just become fully clean?
            if was_dirty_or_tx > 0 && st.sets.get(&set).map_or(0, |s| s.dirty_or_tx) == 0 {
                self.schedule_flush_callback(set, &mut out);
            }
        } else {
            debug!(event = "write_commit_no_object", ob = %key);
        }
        self.wake_blocked_writers(&st);
        drop(st);
        for f in out {
            f();
        }
    }

    // ── Waiter scheduling ───────────────────────────────────────────────

    fn finish_waiters(
        self: &Arc<Self>,
        st: &mut CacheState,
        waiters: Vec<Waiter>,
        r: Result<(), CacheError>,
        out: &mut Vec<FinishFn>,
    ) {
        for w in waiters {
            match w {
                Waiter::RetryRead(id) => {
                    let Some(pending) = st.pending_reads.remove(&id) else {
                        continue;
                    };
                    if let Some((cb, res)) = self.readx_locked(st, pending, false) {
                        out.push(Box::new(move || cb(res)));
                    }
                }
                Waiter::GatherSub(gid) => {
                    self.gather_sub_finish(st, gid, r.clone(), out);
                }
            }
        }
    }

    fn gather_sub_finish(
        &self,
        st: &mut CacheState,
        gid: GatherId,
        r: Result<(), CacheError>,
        out: &mut Vec<FinishFn>,
    ) {
        let done = {
            let g = st.gathers.get_mut(&gid).expect("gather lost a live entry");
            if g.first_err.is_none() {
                if let Err(e) = r {
                    g.first_err = Some(e);
                }
            }
            g.remaining -= 1;
            g.activated && g.remaining == 0
        };
        if done {
            self.gather_fire(st, gid, out);
        }
    }

    /// Seal a gather after registration. A gather that collected no subs
    /// is dropped without firing; callers report "already clean" instead.
    /// Subs cannot complete between registration and activation (both
    /// happen in one lock scope), so `remaining == 0` here always means
    /// no subs were added.
    fn gather_activate(&self, st: &mut CacheState, gid: GatherId) {
        let remaining = {
            let g = st.gathers.get_mut(&gid).expect("gather lost a live entry");
            g.activated = true;
            g.remaining
        };
        if remaining == 0 {
            st.gathers.remove(&gid);
        }
    }

    fn gather_fire(&self, st: &mut CacheState, gid: GatherId, out: &mut Vec<FinishFn>) {
        let g = st.gathers.remove(&gid).expect("gather lost a live entry");
        let res = g.result();
        match g.target {
            Some(GatherTarget::Callback(cb)) => out.push(Box::new(move || cb(res))),
            Some(GatherTarget::Sync(sig)) => out.push(Box::new(move || sig.set(res))),
            None => {}
        }
    }

    fn schedule_flush_callback(&self, set: SetId, out: &mut Vec<FinishFn>) {
        if let Some(cb) = &self.flush_callback {
            debug!(event = "set_fully_clean", set = set.0);
            let cb = Arc::clone(cb);
            out.push(Box::new(move || cb(set)));
        }
    }

    fn wake_blocked_writers(&self, st: &CacheState) {
        if st.stat_dirty_waiting > 0 {
            self.stat_cond.notify_all();
        }
    }

    // ── Flushing ────────────────────────────────────────────────────────

    /// Submit writeback for dirty extents, oldest first, until `amount`
    /// bytes are in flight (`0` = everything currently eligible).
    fn flush_locked(self: &Arc<Self>, st: &mut CacheState, amount: u64) {
        let cutoff = Instant::now();
        let mut did = 0_u64;
        // submitting moves the extent out of lru_dirty, so peeking the
        // tail again yields the next oldest
        while amount == 0 || did < amount {
            let Some(loc) = st.lru_dirty.peek_oldest().cloned() else {
                break;
            };
            let bh = st.bh(&loc);
            if bh.last_write > cutoff {
                break;
            }
            did += bh.len;
            self.bh_write(st, &loc);
        }
    }

    /// Flush any dirty extent a range touches. Returns true when the
    /// range was already clean (nothing dirty, nothing in flight).
    fn flush_ob_locked(
        self: &Arc<Self>,
        st: &mut CacheState,
        obkey: &ObjectKey,
        offset: u64,
        length: u64,
    ) -> bool {
        let mut clean = true;
        let mut dirty_starts = Vec::new();
        {
            let ob = st.ob(obkey);
            if let Some(first) = ob.lower_bound_start(offset) {
                for (&s, bh) in ob.data.range(first..) {
                    if length > 0 && s > offset + length {
                        break;
                    }
                    match bh.state {
                        BhState::Tx => clean = false,
                        BhState::Dirty => {
                            dirty_starts.push(s);
                            clean = false;
                        }
                        _ => {}
                    }
                }
            }
        }
        for s in dirty_starts {
            self.bh_write(st, &BhLoc::new(obkey, s));
        }
        clean
    }

    fn flush_extents_locked(
        self: &Arc<Self>,
        st: &mut CacheState,
        extents: &[ObjectExtent],
        gid: GatherId,
    ) -> bool {
        let mut safe = true;
        for ex in extents {
            let key = ObjectKey::new(ex.pool, ex.oid.clone(), SnapId::NOSNAP);
            if !st.objects.contains_key(&key) {
                continue;
            }
            if !self.flush_ob_locked(st, &key, ex.offset, ex.length) {
                safe = false;
                let tid = st.ob(&key).last_write_tid;
                st.gathers
                    .get_mut(&gid)
                    .expect("gather lost a live entry")
                    .remaining += 1;
                st.ob_mut(&key)
                    .waitfor_commit
                    .entry(tid)
                    .or_default()
                    .push(Waiter::GatherSub(gid));
            }
        }
        safe
    }

    /// Flush every object of a set. Returns true when the whole set was
    /// already clean; otherwise `on_finish` fires once all commits land.
    pub fn flush_set(
        self: &Arc<Self>,
        set: SetId,
        on_finish: CommitCallback,
    ) -> Result<bool, CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        if s.objects.is_empty() {
            debug!(event = "flush_set_empty", set = set.0);
            return Ok(true);
        }
        debug!(event = "flush_set", set = set.0);
        let gid = st.alloc_gather(Gather::new(GatherTarget::Callback(on_finish)));
        let keys: Vec<ObjectKey> = st.sets[&set].objects.iter().cloned().collect();
        let mut safe = true;
        for key in keys {
            if !self.flush_ob_locked(&mut st, &key, 0, 0) {
                safe = false;
                let tid = st.ob(&key).last_write_tid;
                trace!(event = "flush_set_wait", ob = %key, tid = tid.0);
                st.gathers
                    .get_mut(&gid)
                    .expect("gather lost a live entry")
                    .remaining += 1;
                st.ob_mut(&key)
                    .waitfor_commit
                    .entry(tid)
                    .or_default()
                    .push(Waiter::GatherSub(gid));
            }
        }
        self.gather_activate(&mut st, gid);
        drop(st);
        Ok(safe)
    }

    /// Flush only the objects a list of extents touches (sloppy ranges:
    /// any dirty extent a range overlaps goes out whole).
    pub fn flush_set_extents(
        self: &Arc<Self>,
        set: SetId,
        extents: &[ObjectExtent],
        on_finish: CommitCallback,
    ) -> Result<bool, CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        if s.objects.is_empty() {
            debug!(event = "flush_set_empty", set = set.0);
            return Ok(true);
        }
        debug!(event = "flush_set_extents", set = set.0, extents = extents.len());
        let gid = st.alloc_gather(Gather::new(GatherTarget::Callback(on_finish)));
        let safe = self.flush_extents_locked(&mut st, extents, gid);
        self.gather_activate(&mut st, gid);
        drop(st);
        Ok(safe)
    }

    /// Flush the set and wait for every write to be committed, not just
    /// submitted. Returns true when everything was already committed.
    pub fn commit_set(
        self: &Arc<Self>,
        set: SetId,
        on_finish: CommitCallback,
    ) -> Result<bool, CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        if s.objects.is_empty() {
            debug!(event = "commit_set_empty", set = set.0);
            return Ok(true);
        }
        debug!(event = "commit_set", set = set.0);
        let keys: Vec<ObjectKey> = st.sets[&set].objects.iter().cloned().collect();
        // make sure it's flushing
        for key in &keys {
            self.flush_ob_locked(&mut st, key, 0, 0);
        }
        let gid = st.alloc_gather(Gather::new(GatherTarget::Callback(on_finish)));
        let mut safe = true;
        for key in &keys {
            let ob = st.ob(key);
            if ob.last_write_tid > ob.last_commit_tid {
                let tid = ob.last_write_tid;
                trace!(event = "commit_set_wait", ob = %key, tid = tid.0);
                safe = false;
                st.gathers
                    .get_mut(&gid)
                    .expect("gather lost a live entry")
                    .remaining += 1;
                st.ob_mut(key)
                    .waitfor_commit
                    .entry(tid)
                    .or_default()
                    .push(Waiter::GatherSub(gid));
            }
        }
        self.gather_activate(&mut st, gid);
        drop(st);
        Ok(safe)
    }

    // ── Release / purge / discard ───────────────────────────────────────

    fn release_ob_locked(st: &mut CacheState, key: &ObjectKey) -> u64 {
        let (clean_starts, unclean) = {
            let ob = st.ob(key);
            let mut starts = Vec::new();
            let mut unclean = 0_u64;
            for (&s, bh) in &ob.data {
                if matches!(bh.state, BhState::Clean | BhState::Zero) {
                    starts.push(s);
                } else {
                    unclean += bh.len;
                }
            }
            (starts, unclean)
        };
        for s in clean_starts {
            st.bh_remove(&BhLoc::new(key, s));
        }
        if st.ob(key).can_close() {
            Self::close_object(st, key);
            debug_assert_eq!(unclean, 0);
            return 0;
        }
        let ob = st.ob_mut(key);
        if ob.complete {
            trace!(event = "release_clears_complete", ob = %key);
            ob.complete = false;
        }
        if !ob.exists {
            trace!(event = "release_sets_exists", ob = %key);
            ob.exists = true;
        }
        unclean
    }

    /// Drop all clean and zero extents of the set, closing objects that
    /// end up empty. Returns the bytes that could not be released
    /// (dirty, in flight, or failed).
    pub fn release_set(&self, set: SetId) -> Result<u64, CacheError> {
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        let keys: Vec<ObjectKey> = s.objects.iter().cloned().collect();
        let mut unclean = 0_u64;
        for key in keys {
            let left = Self::release_ob_locked(&mut st, &key);
            if left > 0 {
                debug!(event = "release_set_unclean", ob = %key, bytes = left);
            }
            unclean += left;
        }
        Ok(unclean)
    }

    /// [`release_set`](Self::release_set) across every set and pool.
    pub fn release_all(&self) -> u64 {
        let mut st = self.state.lock();
        debug!(event = "release_all");
        let keys: Vec<ObjectKey> = st.objects.keys().cloned().collect();
        let mut unclean = 0_u64;
        for key in keys {
            unclean += Self::release_ob_locked(&mut st, &key);
        }
        if unclean > 0 {
            debug!(event = "release_all_unclean", bytes = unclean);
        }
        unclean
    }

    /// Violently truncate every object of the set to zero, discarding
    /// dirty data without flushing. The caller owns the consequences.
    pub fn purge_set(self: &Arc<Self>, set: SetId) -> Result<(), CacheError> {
        let mut out: Vec<FinishFn> = Vec::new();
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        debug!(event = "purge_set", set = set.0);
        let keys: Vec<ObjectKey> = s.objects.iter().cloned().collect();
        let mut salvaged = Vec::new();
        for key in keys {
            salvaged.extend(st.truncate_object(&key, 0));
        }
        // parked reads re-map and observe the purged state
        self.finish_waiters(&mut st, salvaged, Ok(()), &mut out);
        self.wake_blocked_writers(&st);
        drop(st);
        for f in out {
            f();
        }
        Ok(())
    }

    /// Discard the given extents from the cache. Fires the flush-set
    /// callback if this transition left the set fully clean.
    pub fn discard_set(
        self: &Arc<Self>,
        set: SetId,
        extents: &[ObjectExtent],
    ) -> Result<(), CacheError> {
        let mut out: Vec<FinishFn> = Vec::new();
        let mut st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        if s.objects.is_empty() {
            return Ok(());
        }
        debug!(event = "discard_set", set = set.0, extents = extents.len());
        let were_dirty = s.dirty_or_tx > 0;
        let mut salvaged = Vec::new();
        for ex in extents {
            let key = ObjectKey::new(ex.pool, ex.oid.clone(), SnapId::NOSNAP);
            if !st.objects.contains_key(&key) {
                continue;
            }
            salvaged.extend(st.discard_object(&key, ex.offset, ex.length));
        }
        self.finish_waiters(&mut st, salvaged, Ok(()), &mut out);
        if were_dirty && st.sets.get(&set).map_or(0, |s| s.dirty_or_tx) == 0 {
            self.schedule_flush_callback(set, &mut out);
        }
        self.wake_blocked_writers(&st);
        drop(st);
        for f in out {
            f();
        }
        Ok(())
    }

    // ── Trim ────────────────────────────────────────────────────────────

    /// Evict clean/zero extents and close idle objects down to the
    /// configured ceilings. Stops early when the LRU tail is pinned by
    /// in-flight or dirty state.
    fn trim_locked(&self, st: &mut CacheState) {
        while st.stats.clean + st.stats.zero > self.cfg.max_bytes {
            let Some(loc) = st.lru_rest.peek_oldest().cloned() else {
                break;
            };
            if !matches!(st.bh(&loc).state, BhState::Clean | BhState::Zero) {
                break;
            }
            trace!(event = "trim_bh", ob = %loc.ob, start = loc.start);
            let bh = st.bh_remove(&loc);
            debug_assert!(bh.waiters.is_empty());
            let ob = st.ob_mut(&loc.ob);
            if ob.complete {
                trace!(event = "trim_clears_complete", ob = %loc.ob);
                ob.complete = false;
            }
        }
        while st.ob_lru.len() > self.cfg.max_objects {
            let Some(key) = st.ob_lru.peek_oldest().cloned() else {
                break;
            };
            if !st.ob(&key).can_close() {
                break;
            }
            trace!(event = "trim_object", ob = %key);
            Self::close_object(st, &key);
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Whether every byte of the extents is covered by cached state.
    pub fn is_cached(
        &self,
        set: SetId,
        extents: &[ObjectExtent],
        snap: SnapId,
    ) -> Result<bool, CacheError> {
        let st = self.state.lock();
        if !st.sets.contains_key(&set) {
            return Err(CacheError::UnknownSet);
        }
        for ex in extents {
            let key = ObjectKey::new(ex.pool, ex.oid.clone(), snap);
            match st.objects.get(&key) {
                None => return Ok(false),
                Some(ob) => {
                    if !ob.is_cached(ex.offset, ex.length) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Whether the set holds any extent that could be dropped without a
    /// flush (i.e. anything not dirty and not in flight).
    pub fn set_is_cached(&self, set: SetId) -> Result<bool, CacheError> {
        let st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        for key in &s.objects {
            let ob = st.ob(key);
            if ob
                .data
                .values()
                .any(|bh| !matches!(bh.state, BhState::Dirty | BhState::Tx))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the set holds dirty or in-flight write data.
    pub fn set_is_dirty_or_committing(&self, set: SetId) -> Result<bool, CacheError> {
        let st = self.state.lock();
        let s = st.sets.get(&set).ok_or(CacheError::UnknownSet)?;
        for key in &s.objects {
            let ob = st.ob(key);
            if ob
                .data
                .values()
                .any(|bh| matches!(bh.state, BhState::Dirty | BhState::Tx))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Snapshot of one object's extent map, for inspection and tests.
    #[must_use]
    pub fn extent_map(&self, pool: PoolId, oid: &ObjectId, snap: SnapId) -> Option<Vec<ExtentInfo>> {
        let st = self.state.lock();
        let key = ObjectKey::new(pool, oid.clone(), snap);
        st.objects.get(&key).map(|ob| {
            ob.data
                .values()
                .map(|bh| ExtentInfo {
                    start: bh.start,
                    len: bh.len,
                    state: bh.state,
                    last_write_tid: bh.last_write_tid,
                })
                .collect()
        })
    }

    /// Flags and version bookkeeping of one cached object.
    #[must_use]
    pub fn object_status(&self, pool: PoolId, oid: &ObjectId, snap: SnapId) -> Option<ObjectStatus> {
        let st = self.state.lock();
        let key = ObjectKey::new(pool, oid.clone(), snap);
        st.objects.get(&key).map(|ob| ObjectStatus {
            exists: ob.exists,
            complete: ob.complete,
            dirty_or_tx: ob.dirty_or_tx,
            last_write_tid: ob.last_write_tid,
            last_commit_tid: ob.last_commit_tid,
        })
    }

    /// Point-in-time per-state byte totals.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            missing: st.stats.missing,
            clean: st.stats.clean,
            zero: st.stats.zero,
            dirty: st.stats.dirty,
            tx: st.stats.tx,
            rx: st.stats.rx,
            error: st.stats.error,
            dirty_waiting: st.stat_dirty_waiting,
        }
    }

    /// Snapshot of the monotonic operation counters.
    #[must_use]
    pub fn perf(&self) -> PerfCounters {
        self.state.lock().perf.clone()
    }

    /// Recompute every counter and index from the extent maps and assert
    /// they match. Debugging and test aid; panics on drift.
    pub fn verify_stats(&self) {
        self.state.lock().verify_stats();
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    // ── Flusher ─────────────────────────────────────────────────────────

    /// Start the background flusher. One per cacher; the returned handle
    /// stops and joins the thread on `shutdown()` or drop.
    pub fn start_flusher(self: &Arc<Self>) -> Flusher {
        let stop = Arc::new(AtomicBool::new(false));
        let cache = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("obc-flusher".to_owned())
            .spawn(move || cache.flusher_entry(&stop_flag))
            .expect("spawn flusher thread");
        Flusher {
            cache: Arc::clone(self),
            stop,
            join: Some(join),
        }
    }

    fn flusher_entry(self: &Arc<Self>, stop: &AtomicBool) {
        info!(event = "flusher_start");
        let mut st = self.state.lock();
        while !stop.load(Ordering::Acquire) {
            trace!(
                event = "flusher_tick",
                clean = st.stats.clean,
                dirty = st.stats.dirty,
                tx = st.stats.tx,
                rx = st.stats.rx,
                dirty_waiting = st.stat_dirty_waiting,
                target_dirty = self.cfg.target_dirty,
                max = self.cfg.max_dirty
            );
            let actual = st.stats.dirty + st.stat_dirty_waiting;
            if actual > self.cfg.target_dirty {
                debug!(
                    event = "flusher_over_target",
                    actual,
                    target_dirty = self.cfg.target_dirty
                );
                self.flush_locked(&mut st, actual - self.cfg.target_dirty);
            } else if let Some(cutoff) = Instant::now().checked_sub(self.cfg.max_dirty_age) {
                // write back dirty extents past their age budget
                loop {
                    let Some(loc) = st.lru_dirty.peek_oldest().cloned() else {
                        break;
                    };
                    if st.bh(&loc).last_write >= cutoff {
                        break;
                    }
                    debug!(event = "flusher_age_flush", ob = %loc.ob, start = loc.start);
                    self.bh_write(&mut st, &loc);
                }
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            self.flusher_cond
                .wait_for(&mut st, Duration::from_secs(1));
        }
        drop(st);
        info!(event = "flusher_finish");
    }
}

/// Handle for the running background flusher.
#[derive(Debug)]
pub struct Flusher {
    cache: Arc<ObjectCacher>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Request shutdown and block until the flusher exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.cache.flusher_cond.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
