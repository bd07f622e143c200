//! Continuation plumbing: tagged waiters, gather aggregation, and the
//! scheduler contract.
//!
//! Waiter lists never store raw callbacks; they store tags that the
//! cacher resolves while still holding its lock (a parked read is re-run,
//! a gather sub is counted down). User-facing callbacks are collected
//! into a run list and invoked only after the lock is released.

use crate::ReadRequest;
use obc_error::CacheError;
use obc_types::SetId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Callback delivering the assembled bytes of a deferred read.
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, CacheError>) + Send>;

/// Callback delivering a flush/commit outcome.
pub type CommitCallback = Box<dyn FnOnce(Result<(), CacheError>) + Send>;

/// Per-set callback fired when a set transitions to fully clean.
pub type FlushSetCallback = Box<dyn Fn(SetId) + Send + Sync>;

/// Deferred user-visible work, executed after the state lock is dropped.
pub(crate) type FinishFn = Box<dyn FnOnce() + Send>;

/// Handle of a read request parked in the cacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ReadId(pub u64);

/// Handle of a gather aggregator stored in the cacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct GatherId(pub u64);

/// A continuation registered on an extent or a commit queue.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// Re-run the parked read; it either completes or re-parks itself.
    RetryRead(ReadId),
    /// Count down one sub-completion of a gather.
    GatherSub(GatherId),
}

/// A read request parked until its missing extents materialize.
pub(crate) struct PendingRead {
    pub rd: ReadRequest,
    pub set: SetId,
    pub on_finish: ReadCallback,
}

impl std::fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRead")
            .field("set", &self.set)
            .field("extents", &self.rd.extents.len())
            .finish_non_exhaustive()
    }
}

/// What a completed gather resolves into.
pub(crate) enum GatherTarget {
    Callback(CommitCallback),
    Sync(Arc<SyncSignal>),
}

impl std::fmt::Debug for GatherTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("GatherTarget::Callback"),
            Self::Sync(_) => f.write_str("GatherTarget::Sync"),
        }
    }
}

/// Counted aggregation of sub-completions; fires its target when the
/// last sub completes, delivering the first error seen.
#[derive(Debug)]
pub(crate) struct Gather {
    pub remaining: usize,
    pub activated: bool,
    pub first_err: Option<CacheError>,
    pub target: Option<GatherTarget>,
}

impl Gather {
    pub(crate) fn new(target: GatherTarget) -> Self {
        Self {
            remaining: 0,
            activated: false,
            first_err: None,
            target: Some(target),
        }
    }

    pub(crate) fn result(&self) -> Result<(), CacheError> {
        match &self.first_err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Condvar-backed one-shot result slot. Used by write-through mode: the
/// writing thread drops the cacher lock and sleeps here until the commit
/// scheduler fills the slot.
#[derive(Debug, Default)]
pub(crate) struct SyncSignal {
    slot: Mutex<Option<Result<(), CacheError>>>,
    cond: Condvar,
}

impl SyncSignal {
    pub(crate) fn set(&self, r: Result<(), CacheError>) {
        let mut slot = self.slot.lock();
        *slot = Some(r);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<(), CacheError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(r) = slot.take() {
                return r;
            }
            self.cond.wait(&mut slot);
        }
    }
}
