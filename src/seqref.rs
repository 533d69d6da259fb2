// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU32, AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Sequence number - a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
pub type SeqNo = u64;

/// Sentinel for "no sequence number assigned yet"
pub const SEQNO_INVALID: SeqNo = u64::MAX;

const UNRESOLVED: u64 = u64::MAX;
const ABORTED: u64 = u64::MAX - 1;

/// Ordinals at or above this collide with the slot sentinels and are
/// never handed out
const SEQNO_CEILING: SeqNo = ABORTED;

/// The kvdb-wide dispenser of ordinal sequence numbers
///
/// Every committed mutation in the staging index is stamped from one of
/// these; a multiset is bound to the dispenser at creation so its active
/// seqno and the ordinals in its value chains come from the same space.
/// Clones are cheap and all share the same counter.
#[derive(Clone, Default, Debug)]
pub struct SeqnoCounter {
    next: Arc<AtomicU64>,
}

impl SeqnoCounter {
    /// Resumes dispensing at `next`, e.g. after recovery has replayed
    /// everything up to `next - 1`.
    #[must_use]
    pub fn new(next: SeqNo) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(next)),
        }
    }

    /// The seqno the next mutation would receive.
    ///
    /// Readers use this as their view seqno when opening a snapshot.
    #[must_use]
    pub fn get(&self) -> SeqNo {
        self.next.load(Acquire)
    }

    /// Claims the next ordinal.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn next(&self) -> SeqNo {
        let seqno = self.next.fetch_add(1, Release);

        // Keep clear of UNRESOLVED/ABORTED; an ordinal equal to a slot
        // sentinel would corrupt seqref resolution
        assert!(seqno < SEQNO_CEILING, "sequence number space exhausted");

        seqno
    }

    /// Rewinds or advances the dispenser outright (recovery only).
    pub fn set(&self, seqno: SeqNo) {
        self.next.store(seqno, Release);
    }

    /// Advances the dispenser to at least `seqno`, never backwards.
    pub fn advance_to(&self, seqno: SeqNo) {
        self.next.fetch_max(seqno, AcqRel);
    }
}

/// A transaction's sequence number slot
///
/// Starts out unresolved; the transaction manager publishes the commit
/// seqno (or an abort) exactly once. Slot addresses are stable for the
/// life of the multiset whose pool they were allocated from, so value
/// nodes can hold a reference and resolve it lazily on every read.
#[derive(Debug)]
pub struct SeqnoSlot {
    state: AtomicU64,
    refs: AtomicU32,
}

impl SeqnoSlot {
    pub(crate) fn unresolved() -> Self {
        Self {
            state: AtomicU64::new(UNRESOLVED),
            refs: AtomicU32::new(1),
        }
    }

    /// Publishes the commit seqno. May be called at most once.
    pub fn publish(&self, seqno: SeqNo) {
        assert!(seqno < ABORTED);
        let prev = self.state.swap(seqno, Release);
        debug_assert_eq!(UNRESOLVED, prev, "seqno slot resolved twice");
    }

    /// Marks the owning transaction aborted. May be called at most once.
    pub fn abort(&self) {
        let prev = self.state.swap(ABORTED, Release);
        debug_assert_eq!(UNRESOLVED, prev, "seqno slot resolved twice");
    }

    /// Returns the committed seqno, if the transaction has committed.
    #[must_use]
    pub fn ordinal(&self) -> Option<SeqNo> {
        match self.state.load(Acquire) {
            UNRESOLVED | ABORTED => None,
            seqno => Some(seqno),
        }
    }

    /// Returns `true` if the owning transaction aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.load(Acquire) == ABORTED
    }

    /// Takes an additional reference on behalf of a transaction.
    pub fn addref(&self) {
        let prev = self.refs.fetch_add(1, AcqRel);
        assert!(prev > 0);
    }

    /// Drops a reference, e.g. when the owning multiset is destroyed.
    ///
    /// The transaction manager observes the count to learn that the slot
    /// has been cancelled out from under it.
    pub fn dropref(&self) {
        let prev = self.refs.fetch_sub(1, AcqRel);
        assert!(prev > 0, "seqno slot refcount underflow");
    }

    /// Current reference count.
    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Acquire)
    }
}

/// A discriminated reference to either an ordinal (committed) sequence
/// number or a live transaction's seqno slot
///
/// Ordering is total within ordinals; a live (unresolved) transaction
/// reference is newer than every ordinal until it resolves.
#[derive(Clone, Debug)]
pub enum SeqnoRef {
    /// A committed sequence number
    Ordinal(SeqNo),

    /// A reference into a multiset's seqno-slot pool
    Txn(Arc<SeqnoSlot>),
}

impl SeqnoRef {
    /// Resolves to an ordinal seqno, if one is known.
    ///
    /// Unresolved and aborted transaction references have no ordinal.
    #[must_use]
    pub fn ordinal(&self) -> Option<SeqNo> {
        match self {
            Self::Ordinal(seqno) => Some(*seqno),
            Self::Txn(slot) => slot.ordinal(),
        }
    }

    /// Identity comparison: same ordinal, or same transaction slot.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ordinal(a), Self::Ordinal(b)) => a == b,
            (Self::Txn(a), Self::Txn(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Returns `true` if `self` sorts strictly newer than `other` in a
    /// newest-first value chain.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a > b,
            // Live transactions are newer than all ordinals
            (None, Some(_)) => !self.same(other),
            (Some(_), None) => false,
            (None, None) => false,
        }
    }

    /// MVCC visibility: is a value written under `self` visible to a
    /// reader at `view_seqno` carrying `caller` as its own seqref?
    #[must_use]
    pub fn visible_at(&self, view_seqno: SeqNo, caller: Option<&SeqnoRef>) -> bool {
        if let Some(caller) = caller {
            if self.same(caller) {
                return true;
            }
        }

        match self.ordinal() {
            Some(seqno) => seqno <= view_seqno,
            None => false,
        }
    }
}
