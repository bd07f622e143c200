//! Per-object extent maps and the interval algorithms that maintain them.
//!
//! An [`Object`] is a sorted map of non-overlapping [`BufferHead`]s keyed
//! by start offset. All mutations that touch byte accounting or recency
//! lists go through [`CacheState`] so that counters, LRU membership and
//! the extent map never drift apart.

use crate::completion::Waiter;
use crate::{CacheState, EXPECT_BH, EXPECT_OB};
use obc_error::CacheError;
use obc_types::{ObjectKey, SetId, SnapContext, TxnId};
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};
use tracing::trace;

/// Lifecycle state of one cached extent.
///
/// Exactly one state at a time; `Rx` and `Tx` each correspond to a single
/// in-flight backend operation and are therefore never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BhState {
    /// Known gap with no read issued yet. Only transiently observable:
    /// created by `map_read`/`map_write` and converted before the
    /// operation returns.
    Missing,
    /// Backed by data that matches the backing store.
    Clean,
    /// Known-zero range (object absent or hole in a complete object).
    Zero,
    /// Locally modified, not yet submitted.
    Dirty,
    /// Write submitted, commit outstanding.
    Tx,
    /// Read submitted, reply outstanding.
    Rx,
    /// A read against this range failed; carries the error.
    Error,
}

impl BhState {
    pub(crate) fn is_dirty_or_tx(self) -> bool {
        matches!(self, BhState::Dirty | BhState::Tx)
    }

    /// Whether a read can be served from this extent without waiting.
    pub(crate) fn is_readable(self) -> bool {
        matches!(
            self,
            BhState::Clean | BhState::Dirty | BhState::Tx | BhState::Zero
        )
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            BhState::Missing => "missing",
            BhState::Clean => "clean",
            BhState::Zero => "zero",
            BhState::Dirty => "dirty",
            BhState::Tx => "tx",
            BhState::Rx => "rx",
            BhState::Error => "error",
        }
    }
}

/// Address of one BufferHead in the arena: owning object plus start
/// offset. Starts never mutate after insertion (splits create, merges
/// consume), so a location is stable for the extent's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BhLoc {
    pub ob: ObjectKey,
    pub start: u64,
}

impl BhLoc {
    pub(crate) fn new(ob: &ObjectKey, start: u64) -> Self {
        Self {
            ob: ob.clone(),
            start,
        }
    }
}

/// One contiguous cached extent of an object.
#[derive(Debug)]
pub(crate) struct BufferHead {
    pub start: u64,
    pub len: u64,
    pub state: BhState,
    /// Payload; length equals `len` for Clean/Dirty/Tx, empty otherwise.
    pub data: Vec<u8>,
    /// Read waiters keyed by the offset the waiter originally asked for.
    /// Every key satisfies `start <= key < start + len`.
    pub waiters: BTreeMap<u64, Vec<Waiter>>,
    pub last_write_tid: TxnId,
    /// Monotonic timestamp of the last local write; drives flush aging.
    pub last_write: Instant,
    /// Wall-clock mtime forwarded to the backend on writeback.
    pub mtime: SystemTime,
    pub snapc: SnapContext,
    pub error: Option<CacheError>,
}

impl BufferHead {
    pub(crate) fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            state: BhState::Missing,
            data: Vec::new(),
            waiters: BTreeMap::new(),
            last_write_tid: TxnId(0),
            last_write: Instant::now(),
            mtime: SystemTime::now(),
            snapc: SnapContext::default(),
            error: None,
        }
    }

    pub(crate) fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Materialize the payload at full span, zero-filling what is not
    /// there yet. Used when an extent without backing bytes (gap, zero,
    /// superseded rx) is about to absorb write data.
    pub(crate) fn ensure_payload(&mut self) {
        if self.data.len() as u64 != self.len {
            self.data.resize(self.len as usize, 0);
        }
    }
}

/// Snapshot of one extent for external inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentInfo {
    pub start: u64,
    pub len: u64,
    pub state: BhState,
    pub last_write_tid: TxnId,
}

/// A cached object: extent map plus backing-store knowledge flags.
#[derive(Debug)]
pub(crate) struct Object {
    pub key: ObjectKey,
    pub set: SetId,
    pub data: BTreeMap<u64, BufferHead>,
    /// The object exists on the backing store (assumed until an ENOENT
    /// reply proves otherwise).
    pub exists: bool,
    /// Every byte range not covered by an extent is known to be zero.
    pub complete: bool,
    /// Bytes in Dirty or Tx extents.
    pub dirty_or_tx: u64,
    pub last_write_tid: TxnId,
    pub last_commit_tid: TxnId,
    /// Commit waiters keyed by the transaction id they wait for.
    pub waitfor_commit: BTreeMap<TxnId, Vec<Waiter>>,
}

impl Object {
    pub(crate) fn new(key: ObjectKey, set: SetId) -> Self {
        Self {
            key,
            set,
            data: BTreeMap::new(),
            exists: true,
            complete: false,
            dirty_or_tx: 0,
            last_write_tid: TxnId(0),
            last_commit_tid: TxnId(0),
            waitfor_commit: BTreeMap::new(),
        }
    }

    /// Start key of the first extent overlapping `off`, or of the first
    /// extent past it.
    pub(crate) fn lower_bound_start(&self, off: u64) -> Option<u64> {
        if let Some((&s, bh)) = self.data.range(..=off).next_back() {
            if bh.end() > off {
                return Some(s);
            }
        }
        self.data.range(off..).next().map(|(&s, _)| s)
    }

    /// Whether `[off, off + len)` is fully covered by extents (any state).
    pub(crate) fn is_cached(&self, off: u64, len: u64) -> bool {
        let mut cur = off;
        let mut left = len;
        while left > 0 {
            match self.lower_bound_start(cur) {
                Some(s) if s <= cur => {
                    let bh = &self.data[&s];
                    let span = (bh.end() - cur).min(left);
                    cur += span;
                    left -= span;
                }
                _ => return false,
            }
        }
        true
    }

    pub(crate) fn can_close(&self) -> bool {
        self.data.is_empty() && self.waitfor_commit.is_empty()
    }
}

/// Classification of one read extent against an object's map.
#[derive(Debug, Default)]
pub(crate) struct ReadClass {
    /// Cursor offset -> start of the readable extent serving it.
    pub hits: BTreeMap<u64, u64>,
    /// (cursor offset, extent start) pairs awaiting a read submission.
    pub missing: Vec<(u64, u64)>,
    /// (cursor offset, extent start) pairs with a read already in flight.
    pub rx: Vec<(u64, u64)>,
    /// (cursor offset, extent start) pairs that previously failed.
    pub errors: Vec<(u64, u64)>,
}

impl CacheState {
    pub(crate) fn ob(&self, key: &ObjectKey) -> &Object {
        self.objects.get(key).expect(EXPECT_OB)
    }

    pub(crate) fn ob_mut(&mut self, key: &ObjectKey) -> &mut Object {
        self.objects.get_mut(key).expect(EXPECT_OB)
    }

    pub(crate) fn bh(&self, loc: &BhLoc) -> &BufferHead {
        self.ob(&loc.ob).data.get(&loc.start).expect(EXPECT_BH)
    }

    pub(crate) fn bh_mut(&mut self, loc: &BhLoc) -> &mut BufferHead {
        self.ob_mut(&loc.ob)
            .data
            .get_mut(&loc.start)
            .expect(EXPECT_BH)
    }

    fn stat_add(&mut self, obkey: &ObjectKey, state: BhState, len: u64) {
        self.stats.add(state, len);
        if state.is_dirty_or_tx() {
            let ob = self.ob_mut(obkey);
            ob.dirty_or_tx += len;
            let set = ob.set;
            if let Some(s) = self.sets.get_mut(&set) {
                s.dirty_or_tx += len;
            }
        }
    }

    fn stat_sub(&mut self, obkey: &ObjectKey, state: BhState, len: u64) {
        self.stats.sub(state, len);
        if state.is_dirty_or_tx() {
            let ob = self.ob_mut(obkey);
            ob.dirty_or_tx -= len;
            let set = ob.set;
            if let Some(s) = self.sets.get_mut(&set) {
                s.dirty_or_tx -= len;
            }
        }
    }

    /// Insert a freshly built extent into its object and every index.
    pub(crate) fn bh_add(&mut self, obkey: &ObjectKey, bh: BufferHead) -> BhLoc {
        let loc = BhLoc::new(obkey, bh.start);
        let state = bh.state;
        let len = bh.len;
        let prev = self.ob_mut(obkey).data.insert(bh.start, bh);
        assert!(prev.is_none(), "extent map overlap at insert");
        if state == BhState::Dirty {
            self.lru_dirty.insert_top(loc.clone());
            self.dirty_bh.insert(loc.clone());
        } else {
            self.lru_rest.insert_top(loc.clone());
        }
        self.stat_add(obkey, state, len);
        loc
    }

    /// Remove an extent from its object and every index, returning it so
    /// callers can salvage waiters.
    pub(crate) fn bh_remove(&mut self, loc: &BhLoc) -> BufferHead {
        let bh = self
            .ob_mut(&loc.ob)
            .data
            .remove(&loc.start)
            .expect(EXPECT_BH);
        if bh.state == BhState::Dirty {
            self.lru_dirty.remove(loc);
            self.dirty_bh.remove(loc);
        } else {
            self.lru_rest.remove(loc);
        }
        self.stat_sub(&loc.ob, bh.state, bh.len);
        bh
    }

    /// Central state-change routine: moves the extent between recency
    /// lists and keeps the per-state byte counters balanced.
    pub(crate) fn set_bh_state(&mut self, loc: &BhLoc, new: BhState) {
        let (old, len) = {
            let bh = self.bh(loc);
            (bh.state, bh.len)
        };
        if new == BhState::Dirty && old != BhState::Dirty {
            self.lru_rest.remove(loc);
            self.lru_dirty.insert_top(loc.clone());
            self.dirty_bh.insert(loc.clone());
        }
        if new != BhState::Dirty && old == BhState::Dirty {
            self.lru_dirty.remove(loc);
            self.lru_rest.insert_top(loc.clone());
            self.dirty_bh.remove(loc);
        }
        self.stat_sub(&loc.ob, old, len);
        {
            let bh = self.bh_mut(loc);
            bh.state = new;
            if old == BhState::Error && new != BhState::Error {
                bh.error = None;
            }
        }
        self.stat_add(&loc.ob, new, len);
    }

    /// Bump an extent in whichever recency list holds it.
    pub(crate) fn touch_bh(&mut self, loc: &BhLoc) {
        if self.bh(loc).state == BhState::Dirty {
            self.lru_dirty.touch(loc);
        } else {
            self.lru_rest.touch(loc);
        }
    }

    /// Grow an extent in place by `delta` bytes (gap absorption during
    /// write mapping). Payload, when materialized, is zero-extended.
    pub(crate) fn extend_bh(&mut self, loc: &BhLoc, delta: u64) {
        let (state, old_len) = {
            let bh = self.bh(loc);
            (bh.state, bh.len)
        };
        self.stat_sub(&loc.ob, state, old_len);
        {
            let bh = self.bh_mut(loc);
            bh.len += delta;
            if !bh.data.is_empty() {
                bh.data.resize(bh.len as usize, 0);
            }
        }
        self.stat_add(&loc.ob, state, old_len + delta);
    }

    /// Split the extent at `loc` at offset `off`, producing a right-hand
    /// extent `[off, end)` that inherits state, version and snapshot
    /// context. Read waiters at or past `off` move to the new extent.
    pub(crate) fn split_bh(&mut self, loc: &BhLoc, off: u64) -> BhLoc {
        let (old_state, old_len, right) = {
            let left = self
                .objects
                .get_mut(&loc.ob)
                .expect(EXPECT_OB)
                .data
                .get_mut(&loc.start)
                .expect(EXPECT_BH);
            assert!(
                left.start < off && off < left.end(),
                "split point {off} outside extent [{}, {})",
                left.start,
                left.end()
            );
            let new_left_len = off - left.start;
            let mut right = BufferHead::new(off, left.end() - off);
            right.state = left.state;
            right.last_write_tid = left.last_write_tid;
            right.last_write = left.last_write;
            right.mtime = left.mtime;
            right.snapc = left.snapc.clone();
            right.error = left.error.clone();
            if !left.data.is_empty() {
                debug_assert_eq!(left.data.len() as u64, left.len);
                right.data = left.data.split_off(new_left_len as usize);
            }
            right.waiters = left.waiters.split_off(&off);
            let old = (left.state, left.len);
            left.len = new_left_len;
            (old.0, old.1, right)
        };
        self.stat_sub(&loc.ob, old_state, old_len);
        self.stat_add(&loc.ob, old_state, off - loc.start);
        trace!(
            event = "bh_split",
            ob = %loc.ob,
            left_start = loc.start,
            at = off,
            state = old_state.name()
        );
        self.bh_add(&loc.ob, right)
    }

    /// Merge the extent starting at `right_start` into its left neighbor
    /// at `left`. Both must be adjacent and in the same state; the left
    /// extent is the canonical survivor.
    ///
    /// Version metadata becomes the max of both sides, which is only
    /// meaningful when both sides are dirty and about to be flushed
    /// together; in-flight extents are never offered for merging.
    pub(crate) fn merge_left(&mut self, left: &BhLoc, right_start: u64) {
        let right = self.bh_remove(&BhLoc::new(&left.ob, right_start));
        let (state, old_len) = {
            let lb = self.bh(left);
            assert_eq!(lb.end(), right.start, "merge of non-adjacent extents");
            assert_eq!(lb.state, right.state, "merge of unequal states");
            (lb.state, lb.len)
        };
        self.stat_sub(&left.ob, state, old_len);
        {
            let lb = self.bh_mut(left);
            debug_assert_eq!(lb.data.is_empty(), right.data.is_empty());
            lb.len += right.len;
            lb.data.extend_from_slice(&right.data);
            lb.last_write_tid = lb.last_write_tid.max(right.last_write_tid);
            lb.last_write = lb.last_write.max(right.last_write);
            lb.mtime = lb.mtime.max(right.mtime);
            for (off, ws) in right.waiters {
                lb.waiters.entry(off).or_default().extend(ws);
            }
        }
        self.stat_add(&left.ob, state, old_len + right.len);
        trace!(
            event = "bh_merge",
            ob = %left.ob,
            start = left.start,
            absorbed = right_start,
            state = state.name()
        );
    }

    /// Merge `loc` with equal-state adjacent neighbors where policy
    /// allows. In-flight (Rx/Tx) and failed extents keep their identity.
    /// Returns the surviving location.
    pub(crate) fn try_merge_bh(&mut self, loc: BhLoc) -> BhLoc {
        let state = self.bh(&loc).state;
        if !matches!(state, BhState::Clean | BhState::Zero | BhState::Dirty) {
            return loc;
        }
        let mut cur = loc;
        // to the left?
        let left = self
            .ob(&cur.ob)
            .data
            .range(..cur.start)
            .next_back()
            .map(|(&s, bh)| (s, bh.end(), bh.state));
        if let Some((ls, lend, lstate)) = left {
            if lend == cur.start && lstate == state {
                let left_loc = BhLoc::new(&cur.ob, ls);
                self.merge_left(&left_loc, cur.start);
                cur = left_loc;
            }
        }
        // to the right?
        let cur_end = self.bh(&cur).end();
        let right = self
            .ob(&cur.ob)
            .data
            .range(cur_end..)
            .next()
            .map(|(&s, bh)| (s, bh.state));
        if let Some((rs, rstate)) = right {
            if rs == cur_end && rstate == state {
                self.merge_left(&cur, rs);
            }
        }
        cur
    }

    /// Map `[offset, offset + length)` of an object into extents,
    /// classifying each byte as hit / missing / rx / error. Uncovered
    /// ranges are materialized: as Zero hits when the object is complete,
    /// as Missing extents otherwise (so retries of the same read find
    /// them and attach waiters).
    pub(crate) fn map_read(&mut self, obkey: &ObjectKey, offset: u64, length: u64) -> ReadClass {
        let mut out = ReadClass::default();
        let mut cur = offset;
        let mut left = length;
        while left > 0 {
            match self.ob(obkey).lower_bound_start(cur) {
                None => {
                    // rest is a miss
                    self.map_read_gap(obkey, cur, left, &mut out);
                    cur += left;
                    left = 0;
                }
                Some(s) if s <= cur => {
                    let bh = &self.ob(obkey).data[&s];
                    match bh.state {
                        st if st.is_readable() => {
                            out.hits.insert(cur, s);
                        }
                        BhState::Rx => out.rx.push((cur, s)),
                        BhState::Error => out.errors.push((cur, s)),
                        BhState::Missing => {
                            unreachable!("missing extents never persist across operations")
                        }
                        _ => unreachable!(),
                    }
                    let span = (self.ob(obkey).data[&s].end() - cur).min(left);
                    cur += span;
                    left -= span;
                }
                Some(next) => {
                    // gap before the next extent
                    let glen = (next - cur).min(left);
                    self.map_read_gap(obkey, cur, glen, &mut out);
                    cur += glen;
                    left -= glen;
                }
            }
        }
        out
    }

    fn map_read_gap(&mut self, obkey: &ObjectKey, start: u64, len: u64, out: &mut ReadClass) {
        let complete = self.ob(obkey).complete;
        let loc = self.bh_add(obkey, BufferHead::new(start, len));
        if complete {
            self.set_bh_state(&loc, BhState::Zero);
            out.hits.insert(start, loc.start);
            trace!(event = "map_read_zero_fill", ob = %obkey, start, len);
        } else {
            out.missing.push((start, loc.start));
            trace!(event = "map_read_miss", ob = %obkey, start, len);
        }
    }

    /// Map a write over `[offset, offset + length)` into a single extent
    /// covering exactly that range, splitting and merging as needed.
    ///
    /// Overlapped pieces are marked dirty as they are absorbed; the
    /// returned extent still carries its pre-write state when the write
    /// hit one extent exactly (the caller marks it dirty after copying
    /// the payload in, and uses the pre-write state to detect overwrites
    /// of in-flight data).
    pub(crate) fn map_write(&mut self, obkey: &ObjectKey, offset: u64, length: u64) -> BhLoc {
        assert!(length > 0, "zero-length write mapping");
        let mut final_loc: Option<BhLoc> = None;
        let mut cur = offset;
        let mut left = length;
        while left > 0 {
            let max = left;
            match self.ob(obkey).lower_bound_start(cur) {
                None => {
                    // past the last extent
                    match &final_loc {
                        None => {
                            final_loc = Some(self.bh_add(obkey, BufferHead::new(cur, max)));
                        }
                        Some(f) => {
                            let f = f.clone();
                            self.extend_bh(&f, max);
                        }
                    }
                    cur += max;
                    left = 0;
                }
                Some(s) if s <= cur => {
                    let loc = BhLoc::new(obkey, s);
                    let (bh_end, bh_len) = {
                        let bh = self.bh(&loc);
                        (bh.end(), bh.len)
                    };
                    if s < cur {
                        assert!(
                            final_loc.is_none(),
                            "straddling overlap past the leading edge of a write"
                        );
                        if cur + max >= bh_end {
                            // take the right part (one split)
                            final_loc = Some(self.split_bh(&loc, cur));
                        } else {
                            // take the middle part (two splits)
                            let mid = self.split_bh(&loc, cur);
                            self.split_bh(&mid, cur + max);
                            final_loc = Some(mid);
                        }
                    } else {
                        // aligned at the cursor
                        if bh_len > max {
                            // keep only the left part of the extent
                            self.split_bh(&loc, cur + max);
                        }
                        match &final_loc {
                            Some(f) => {
                                let f = f.clone();
                                self.set_bh_state(&loc, BhState::Dirty);
                                self.set_bh_state(&f, BhState::Dirty);
                                self.bh_mut(&loc).ensure_payload();
                                self.bh_mut(&f).ensure_payload();
                                self.merge_left(&f, loc.start);
                            }
                            None => final_loc = Some(loc),
                        }
                    }
                    let f = final_loc.clone().expect("write mapping lost its extent");
                    let span = self.bh(&f).end() - cur;
                    cur += span;
                    left -= span;
                }
                Some(next) => {
                    // gap
                    let glen = (next - cur).min(max);
                    match &final_loc {
                        Some(f) => {
                            let f = f.clone();
                            self.extend_bh(&f, glen);
                        }
                        None => {
                            final_loc = Some(self.bh_add(obkey, BufferHead::new(cur, glen)));
                        }
                    }
                    cur += glen;
                    left -= glen;
                }
            }
        }
        let f = final_loc.expect("write mapping produced no extent");
        debug_assert_eq!(self.bh(&f).start, offset);
        debug_assert_eq!(self.bh(&f).end(), offset + length);
        f
    }

    /// Drop every extent at or past `size`, splitting the straddler.
    /// Returns read waiters salvaged from removed extents.
    pub(crate) fn truncate_object(&mut self, obkey: &ObjectKey, size: u64) -> Vec<Waiter> {
        let mut salvaged = Vec::new();
        loop {
            let last = {
                let ob = self.ob(obkey);
                ob.data.iter().next_back().map(|(&s, bh)| (s, bh.end()))
            };
            let Some((bstart, bend)) = last else { break };
            if bend <= size {
                break;
            }
            if bstart < size {
                self.split_bh(&BhLoc::new(obkey, bstart), size);
                continue;
            }
            let bh = self.bh_remove(&BhLoc::new(obkey, bstart));
            salvaged.extend(bh.waiters.into_values().flatten());
        }
        salvaged
    }

    /// Clear the `[off, off + len)` window: split at both edges, remove
    /// interior extents, forget completeness. The discard implicitly
    /// creates the object on the backing store.
    pub(crate) fn discard_object(&mut self, obkey: &ObjectKey, off: u64, len: u64) -> Vec<Waiter> {
        {
            let ob = self.ob_mut(obkey);
            if !ob.exists {
                trace!(event = "discard_sets_exists", ob = %obkey);
                ob.exists = true;
            }
            if ob.complete {
                trace!(event = "discard_clears_complete", ob = %obkey);
                ob.complete = false;
            }
        }
        let mut salvaged = Vec::new();
        let mut pos = off;
        loop {
            let Some(bstart) = self.ob(obkey).lower_bound_start(pos) else {
                break;
            };
            let bend = self.ob(obkey).data[&bstart].end();
            if bstart >= off + len {
                break;
            }
            if bstart < off {
                self.split_bh(&BhLoc::new(obkey, bstart), off);
                pos = off;
                continue;
            }
            if bend > off + len {
                self.split_bh(&BhLoc::new(obkey, bstart), off + len);
            }
            let bh = self.bh_remove(&BhLoc::new(obkey, bstart));
            salvaged.extend(bh.waiters.into_values().flatten());
            pos = bstart;
        }
        salvaged
    }

    /// Full audit of the invariants that every operation must preserve:
    /// map keys equal extent starts, extents do not overlap, waiter
    /// offsets fall inside their extent, per-state byte counters match,
    /// dirty accounting matches, and LRU membership matches state.
    ///
    /// Panics on any drift; meant for tests and debugging sweeps.
    pub(crate) fn verify_stats(&self) {
        let mut recomputed = crate::StateBytes::default();
        let mut set_dirty: BTreeMap<SetId, u64> = BTreeMap::new();
        for (key, ob) in &self.objects {
            assert_eq!(&ob.key, key, "object index key diverged from object");
            if let Some(s) = self.sets.get(&ob.set) {
                assert_eq!(s.pool, key.pool, "object pool diverged from its set");
            }
            let mut prev_end = 0_u64;
            let mut ob_dirty = 0_u64;
            for (&start, bh) in &ob.data {
                assert_eq!(start, bh.start, "map key diverged from extent start");
                assert!(
                    start >= prev_end,
                    "extent [{start}, {}) overlaps previous end {prev_end} in {key}",
                    bh.end()
                );
                prev_end = bh.end();
                for &woff in bh.waiters.keys() {
                    assert!(
                        woff >= bh.start && woff < bh.end(),
                        "waiter offset {woff} outside extent"
                    );
                }
                recomputed.add(bh.state, bh.len);
                if bh.state.is_dirty_or_tx() {
                    ob_dirty += bh.len;
                }
                let loc = BhLoc::new(key, start);
                if bh.state == BhState::Dirty {
                    assert!(self.lru_dirty.contains(&loc), "dirty extent not in lru_dirty");
                    assert!(self.dirty_bh.contains(&loc), "dirty extent not in dirty set");
                    assert!(!self.lru_rest.contains(&loc), "dirty extent in lru_rest");
                } else {
                    assert!(self.lru_rest.contains(&loc), "extent not in lru_rest");
                    assert!(!self.lru_dirty.contains(&loc), "clean extent in lru_dirty");
                    assert!(!self.dirty_bh.contains(&loc), "clean extent in dirty set");
                }
            }
            assert_eq!(ob.dirty_or_tx, ob_dirty, "object dirty_or_tx drift in {key}");
            *set_dirty.entry(ob.set).or_default() += ob_dirty;
            assert!(self.ob_lru.contains(key), "object missing from ob_lru");
            let in_set = self
                .sets
                .get(&ob.set)
                .is_some_and(|s| s.objects.contains(key));
            assert!(in_set, "object missing from its set membership");
        }
        assert_eq!(self.stats, recomputed, "per-state byte counters drifted");
        for (sid, set) in &self.sets {
            let expect = set_dirty.get(sid).copied().unwrap_or(0);
            assert_eq!(set.dirty_or_tx, expect, "set dirty_or_tx drift");
        }
        let bh_total: usize = self.objects.values().map(|o| o.data.len()).sum();
        assert_eq!(
            self.lru_rest.len() + self.lru_dirty.len(),
            bh_total,
            "recency lists out of sync with extent population"
        );
        for loc in self
            .lru_rest
            .iter_oldest_first()
            .chain(self.lru_dirty.iter_oldest_first())
        {
            let live = self
                .objects
                .get(&loc.ob)
                .is_some_and(|ob| ob.data.contains_key(&loc.start));
            assert!(live, "recency list entry points at a removed extent");
        }
        assert_eq!(self.ob_lru.len(), self.objects.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ReadId;
    use obc_types::{ObjectId, PoolId, SetId, SnapId};

    fn setup() -> (CacheState, ObjectKey) {
        let mut st = CacheState::new();
        let set = SetId(1);
        st.sets.insert(set, crate::ObjectSetState::new(PoolId(0)));
        let key = ObjectKey::new(PoolId(0), ObjectId::from("test"), SnapId::NOSNAP);
        st.objects.insert(key.clone(), Object::new(key.clone(), set));
        st.ob_lru.insert_top(key.clone());
        st.sets.get_mut(&set).unwrap().objects.insert(key.clone());
        (st, key)
    }

    fn add(st: &mut CacheState, key: &ObjectKey, state: BhState, start: u64, len: u64, fill: u8) -> BhLoc {
        let mut bh = BufferHead::new(start, len);
        bh.state = state;
        if matches!(state, BhState::Clean | BhState::Dirty | BhState::Tx) {
            bh.data = vec![fill; len as usize];
        }
        st.bh_add(key, bh)
    }

    fn spans(st: &CacheState, key: &ObjectKey) -> Vec<(u64, u64, BhState)> {
        st.ob(key)
            .data
            .values()
            .map(|bh| (bh.start, bh.len, bh.state))
            .collect()
    }

    #[test]
    fn split_moves_payload_and_waiters() {
        let (mut st, key) = setup();
        let loc = add(&mut st, &key, BhState::Clean, 0, 100, 7);
        st.bh_mut(&loc)
            .waiters
            .insert(60, vec![Waiter::RetryRead(ReadId(1))]);
        st.bh_mut(&loc)
            .waiters
            .insert(10, vec![Waiter::RetryRead(ReadId(2))]);

        let right = st.split_bh(&loc, 40);
        assert_eq!(right.start, 40);
        assert_eq!(spans(&st, &key), vec![(0, 40, BhState::Clean), (40, 60, BhState::Clean)]);
        assert_eq!(st.bh(&loc).data.len(), 40);
        assert_eq!(st.bh(&right).data.len(), 60);
        assert!(st.bh(&loc).waiters.contains_key(&10));
        assert!(!st.bh(&loc).waiters.contains_key(&60));
        assert!(st.bh(&right).waiters.contains_key(&60));
        st.verify_stats();
    }

    #[test]
    fn try_merge_combines_equal_neighbors() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 0, 50, 1);
        let mid = add(&mut st, &key, BhState::Clean, 50, 25, 2);
        add(&mut st, &key, BhState::Clean, 75, 25, 3);

        let survivor = st.try_merge_bh(mid);
        assert_eq!(survivor.start, 0);
        assert_eq!(spans(&st, &key), vec![(0, 100, BhState::Clean)]);
        let data = &st.bh(&survivor).data;
        assert_eq!(&data[..50], &[1; 50][..]);
        assert_eq!(&data[50..75], &[2; 25][..]);
        assert_eq!(&data[75..], &[3; 25][..]);
        st.verify_stats();
    }

    #[test]
    fn try_merge_leaves_inflight_extents_alone() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Rx, 0, 50, 0);
        let right = add(&mut st, &key, BhState::Rx, 50, 50, 0);
        let survivor = st.try_merge_bh(right);
        assert_eq!(survivor.start, 50);
        assert_eq!(spans(&st, &key).len(), 2);
        st.verify_stats();
    }

    #[test]
    fn map_write_into_middle_splits_both_sides() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 0, 4096, 0xAA);

        let floc = st.map_write(&key, 1024, 2048);
        assert_eq!((floc.start, st.bh(&floc).len), (1024, 2048));
        // single-piece mapping keeps the prior state; the write path
        // dirties it after copying the payload in
        assert_eq!(st.bh(&floc).state, BhState::Clean);
        st.set_bh_state(&floc, BhState::Dirty);
        st.bh_mut(&floc).ensure_payload();
        st.bh_mut(&floc).data.fill(0x55);
        assert_eq!(
            spans(&st, &key),
            vec![
                (0, 1024, BhState::Clean),
                (1024, 2048, BhState::Dirty),
                (3072, 1024, BhState::Clean),
            ]
        );
        assert_eq!(st.bh(&BhLoc::new(&key, 0)).data, vec![0xAA; 1024]);
        assert_eq!(st.bh(&BhLoc::new(&key, 3072)).data, vec![0xAA; 1024]);
        st.verify_stats();
    }

    #[test]
    fn map_write_bridges_gap_between_extents() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 0, 100, 1);
        add(&mut st, &key, BhState::Clean, 200, 100, 2);

        let floc = st.map_write(&key, 0, 300);
        assert_eq!((floc.start, st.bh(&floc).len), (0, 300));
        assert_eq!(st.bh(&floc).state, BhState::Dirty);
        assert_eq!(spans(&st, &key), vec![(0, 300, BhState::Dirty)]);
        // pre-existing payload survives at its offsets until overwritten
        let data = &st.bh(&floc).data;
        assert_eq!(&data[..100], &[1; 100][..]);
        assert_eq!(&data[100..200], &[0; 100][..]);
        assert_eq!(&data[200..], &[2; 100][..]);
        st.verify_stats();
    }

    #[test]
    fn map_write_takes_right_half_of_straddler() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 0, 100, 9);
        let floc = st.map_write(&key, 60, 140);
        assert_eq!((floc.start, st.bh(&floc).len), (60, 140));
        assert_eq!(
            spans(&st, &key),
            vec![(0, 60, BhState::Clean), (60, 140, BhState::Clean)]
        );
        st.verify_stats();
    }

    #[test]
    fn map_read_complete_object_synthesizes_zeros() {
        let (mut st, key) = setup();
        st.ob_mut(&key).complete = true;
        let class = st.map_read(&key, 0, 128);
        assert_eq!(class.hits.len(), 1);
        assert!(class.missing.is_empty());
        assert_eq!(spans(&st, &key), vec![(0, 128, BhState::Zero)]);
        st.verify_stats();
    }

    #[test]
    fn map_read_classifies_gaps_and_hits() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 50, 50, 4);
        let class = st.map_read(&key, 0, 150);
        assert_eq!(class.hits.len(), 1);
        assert_eq!(class.missing.len(), 2);
        assert_eq!(
            spans(&st, &key),
            vec![
                (0, 50, BhState::Missing),
                (50, 50, BhState::Clean),
                (100, 50, BhState::Missing),
            ]
        );
        st.verify_stats();
    }

    #[test]
    fn map_read_reports_rx_and_error() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Rx, 0, 64, 0);
        let eloc = add(&mut st, &key, BhState::Error, 64, 64, 0);
        st.bh_mut(&eloc).error = Some(CacheError::Backend(5));
        let class = st.map_read(&key, 0, 128);
        assert_eq!(class.rx.len(), 1);
        assert_eq!(class.errors.len(), 1);
        assert!(class.hits.is_empty() && class.missing.is_empty());
        st.verify_stats();
    }

    #[test]
    fn truncate_splits_the_straddler() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 0, 100, 1);
        add(&mut st, &key, BhState::Clean, 100, 100, 2);
        let salvaged = st.truncate_object(&key, 60);
        assert!(salvaged.is_empty());
        assert_eq!(spans(&st, &key), vec![(0, 60, BhState::Clean)]);
        st.verify_stats();
    }

    #[test]
    fn discard_clears_window_and_flags() {
        let (mut st, key) = setup();
        st.ob_mut(&key).complete = true;
        st.ob_mut(&key).exists = false;
        add(&mut st, &key, BhState::Clean, 0, 300, 6);
        let salvaged = st.discard_object(&key, 100, 100);
        assert!(salvaged.is_empty());
        assert_eq!(
            spans(&st, &key),
            vec![(0, 100, BhState::Clean), (200, 100, BhState::Clean)]
        );
        assert!(!st.ob(&key).complete);
        assert!(st.ob(&key).exists);
        st.verify_stats();
    }

    #[test]
    fn lower_bound_prefers_overlapping_extent() {
        let (mut st, key) = setup();
        add(&mut st, &key, BhState::Clean, 10, 30, 0);
        add(&mut st, &key, BhState::Clean, 100, 10, 0);
        let ob = st.ob(&key);
        assert_eq!(ob.lower_bound_start(0), Some(10));
        assert_eq!(ob.lower_bound_start(10), Some(10));
        assert_eq!(ob.lower_bound_start(25), Some(10));
        assert_eq!(ob.lower_bound_start(40), Some(100));
        assert_eq!(ob.lower_bound_start(105), Some(100));
        assert_eq!(ob.lower_bound_start(110), None);
    }

    #[test]
    fn dirty_accounting_follows_state_changes() {
        let (mut st, key) = setup();
        let loc = add(&mut st, &key, BhState::Dirty, 0, 500, 1);
        assert_eq!(st.ob(&key).dirty_or_tx, 500);
        assert_eq!(st.sets[&SetId(1)].dirty_or_tx, 500);
        st.set_bh_state(&loc, BhState::Tx);
        assert_eq!(st.ob(&key).dirty_or_tx, 500);
        st.set_bh_state(&loc, BhState::Clean);
        assert_eq!(st.ob(&key).dirty_or_tx, 0);
        assert_eq!(st.sets[&SetId(1)].dirty_or_tx, 0);
        st.verify_stats();
    }
}
