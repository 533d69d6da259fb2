// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(unsafe_code)]

use crate::key::KeyImmediate;
use crate::seqref::{SeqNo, SeqnoRef};
use crate::{Slice, UserValue};
use std::cmp::Ordering as CmpOrdering;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicPtr, AtomicU32, AtomicU8,
    Ordering::{Acquire, Relaxed},
};

/// This key-value record lives in the reserved prefix-tombstone set
pub(crate) const BKV_FLAG_PTOMB: u8 = 1 << 0;

/// Head of a tombstone span; `tomb` points at the span's tail
pub(crate) const BKV_FLAG_TOMB_HEAD: u8 = 1 << 1;

/// The newest write against this key was a regular tombstone
pub(crate) const BKV_FLAG_TOMB: u8 = 1 << 2;

/// Payload of a versioned value
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueData {
    /// Existing value
    Value(UserValue),

    /// Deleted value
    Tombstone,

    /// Prefix tombstone: deletes all keys starting with the record's key
    /// within its table index
    PrefixTombstone,
}

impl ValueData {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone | Self::PrefixTombstone)
    }

    pub(crate) fn byte_len(&self) -> usize {
        match self {
            Self::Value(v) => v.len(),
            _ => 0,
        }
    }
}

/// A single versioned value in a key's newest-first chain
pub(crate) struct BonsaiVal {
    pub payload: ManuallyDrop<ValPayload>,
    pub next: AtomicPtr<BonsaiVal>,
}

pub(crate) struct ValPayload {
    pub data: ValueData,
    pub seqref: SeqnoRef,
}

impl BonsaiVal {
    pub fn new(data: ValueData, seqref: SeqnoRef) -> Self {
        Self {
            payload: ManuallyDrop::new(ValPayload { data, seqref }),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Per-unique-key record
///
/// Participates in both the balanced tree (via [`Node`]) and an intrusive
/// doubly-linked chain kept in lexicographic order across all keys.
pub(crate) struct BonsaiKv {
    pub key_imm: KeyImmediate,
    pub key: ManuallyDrop<Slice>,

    /// Value chain head, newest first
    pub values: AtomicPtr<BonsaiVal>,

    /// Sorted-chain links; terminated by the tree's sentinel
    pub prev: AtomicPtr<BonsaiKv>,
    pub next: AtomicPtr<BonsaiKv>,

    /// Tomb-span link: tail if this is a span head, else the span head
    pub tomb: AtomicPtr<BonsaiKv>,

    pub flags: AtomicU8,
    pub nvals: AtomicU32,
}

impl BonsaiKv {
    pub fn new(key_imm: KeyImmediate, key: Slice) -> Self {
        Self {
            key_imm,
            key: ManuallyDrop::new(key),
            values: AtomicPtr::new(std::ptr::null_mut()),
            prev: AtomicPtr::new(std::ptr::null_mut()),
            next: AtomicPtr::new(std::ptr::null_mut()),
            tomb: AtomicPtr::new(std::ptr::null_mut()),
            flags: AtomicU8::new(0),
            nvals: AtomicU32::new(0),
        }
    }

    /// Sentinel record rooting a circular sorted chain.
    pub fn sentinel() -> Box<Self> {
        #[allow(clippy::expect_used)]
        let imm = KeyImmediate::new(0, &[0]).expect("sentinel key is valid");
        let mut kv = Box::new(Self::new(imm, Slice::empty()));

        let ptr: *mut BonsaiKv = &mut *kv;
        kv.prev.store(ptr, Relaxed);
        kv.next.store(ptr, Relaxed);
        kv
    }
}

/// A balanced-tree node: children, AVL height, and a weight word that
/// front-loads the key comparison
///
/// Nodes are immutable once published; structural changes clone the
/// touched path and swing the root pointer.
pub(crate) struct Node {
    pub left: *const Node,
    pub right: *const Node,
    pub height: i32,
    pub weight: u64,
    pub bkv: NonNull<BonsaiKv>,
}

impl Node {
    pub fn height_of(node: *const Node) -> i32 {
        if node.is_null() {
            0
        } else {
            // SAFETY: non-null nodes are arena-pinned and initialized
            unsafe { (*node).height }
        }
    }
}

/// A borrowed handle to a [`BonsaiKv`]
///
/// Valid for as long as the kv-set that produced it is alive; all uses
/// inside this crate hold a reference on the owning multiset.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct BkvRef(pub NonNull<BonsaiKv>);

// SAFETY: BonsaiKv is only mutated through atomics; the pointee is
// arena-pinned for the life of the owning set.
unsafe impl Send for BkvRef {}
unsafe impl Sync for BkvRef {}

impl BkvRef {
    fn kv(&self) -> &BonsaiKv {
        // SAFETY: see type invariant
        unsafe { self.0.as_ref() }
    }

    pub fn key(&self) -> &[u8] {
        self.kv().key.as_ref()
    }

    pub fn key_imm(&self) -> &KeyImmediate {
        &self.kv().key_imm
    }

    pub fn skidx(&self) -> u16 {
        self.kv().key_imm.skidx()
    }

    pub fn flags(&self) -> u8 {
        self.kv().flags.load(Acquire)
    }

    pub fn is_tomb(&self) -> bool {
        self.flags() & BKV_FLAG_TOMB != 0
    }

    pub fn is_ptomb(&self) -> bool {
        self.flags() & BKV_FLAG_PTOMB != 0
    }

    pub fn nvals(&self) -> u32 {
        self.kv().nvals.load(Acquire)
    }

    pub(crate) fn chain_next(&self) -> *mut BonsaiKv {
        self.kv().next.load(Acquire)
    }

    pub(crate) fn chain_prev(&self) -> *mut BonsaiKv {
        self.kv().prev.load(Acquire)
    }

    pub(crate) fn values_head(&self) -> *mut BonsaiVal {
        self.kv().values.load(Acquire)
    }

    /// Walks the value chain, newest first.
    pub(crate) fn values(&self) -> ValIter {
        ValIter {
            cur: self.values_head(),
        }
    }

    /// MVCC value choice: the value written under the caller's own seqref
    /// if the chain holds one, else the value with the greatest ordinal
    /// seqno not greater than the view seqno.
    pub(crate) fn find_value(
        &self,
        view_seqno: SeqNo,
        caller: Option<&SeqnoRef>,
    ) -> Option<ValueView> {
        let mut best: Option<(ValueView, SeqNo)> = None;

        let mut iter = self.values();
        while let Some(val) = iter.next_ref() {
            let seqref = &val.payload.seqref;

            if let Some(caller) = caller {
                if seqref.same(caller) {
                    return Some(ValueView {
                        data: val.payload.data.clone(),
                        seqno: seqref.ordinal(),
                    });
                }
            }

            if let Some(ordinal) = seqref.ordinal() {
                if ordinal <= view_seqno && best.as_ref().is_none_or(|(_, b)| ordinal > *b) {
                    best = Some((
                        ValueView {
                            data: val.payload.data.clone(),
                            seqno: Some(ordinal),
                        },
                        ordinal,
                    ));
                }
            }
        }

        best.map(|(view, _)| view)
    }

    /// Prefix-tombstone chain choice: the newest visible prefix tombstone.
    pub(crate) fn find_ptomb(
        &self,
        view_seqno: SeqNo,
        caller: Option<&SeqnoRef>,
    ) -> Option<SeqNo> {
        let mut best: Option<SeqNo> = None;

        let mut iter = self.values();
        while let Some(val) = iter.next_ref() {
            if !matches!(val.payload.data, ValueData::PrefixTombstone) {
                continue;
            }

            let seqref = &val.payload.seqref;

            if let Some(caller) = caller {
                if seqref.same(caller) {
                    return seqref.ordinal().or(Some(view_seqno));
                }
            }

            if let Some(ordinal) = seqref.ordinal() {
                if ordinal <= view_seqno && best.is_none_or(|b| ordinal > b) {
                    best = Some(ordinal);
                }
            }
        }

        best
    }

    /// Snapshot of the whole value chain, newest first.
    pub(crate) fn value_snapshot(&self) -> Vec<(Option<SeqNo>, ValueData)> {
        let mut out = Vec::with_capacity(self.nvals() as usize);

        let mut iter = self.values();
        while let Some(val) = iter.next_ref() {
            out.push((val.payload.seqref.ordinal(), val.payload.data.clone()));
        }

        out
    }
}

/// A chosen value, as surfaced by point reads and cursors
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueView {
    /// The value payload
    pub data: ValueData,

    /// The resolved ordinal seqno, when known
    pub seqno: Option<SeqNo>,
}

pub(crate) struct ValIter {
    cur: *mut BonsaiVal,
}

impl ValIter {
    pub fn next_ref(&mut self) -> Option<&BonsaiVal> {
        if self.cur.is_null() {
            return None;
        }

        // SAFETY: value nodes are arena-pinned and never freed while the
        // owning set is alive
        let val = unsafe { &*self.cur };
        self.cur = val.next.load(Acquire);
        Some(val)
    }
}

/// Forward comparison for the merge heap: byte-lexicographic over
/// `(skidx ‖ key)`.
pub(crate) fn kv_cmp(a: &BkvRef, b: &BkvRef) -> CmpOrdering {
    crate::key::key_full_cmp(a.key_imm(), a.key(), b.key_imm(), b.key())
}

/// Reverse-iteration comparison for the merge heap.
///
/// Orders like [`kv_cmp`], except that a prefix tombstone ranks above any
/// key it is a prefix of, and above its exactly-equal key. A reverse walk
/// therefore surfaces the ptomb before the keys it covers.
pub(crate) fn kv_cmp_rev(a: &BkvRef, b: &BkvRef) -> CmpOrdering {
    let a_pt = a.is_ptomb();
    let b_pt = b.is_ptomb();

    if a_pt == b_pt {
        return kv_cmp(a, b);
    }

    let (pt, other, flip) = if a_pt { (a, b, false) } else { (b, a, true) };

    let covered = pt.skidx() == other.skidx() && other.key().starts_with(pt.key());

    let ord = if covered {
        // The ptomb outranks everything underneath it
        CmpOrdering::Greater
    } else {
        kv_cmp(pt, other)
    };

    if flip {
        ord.reverse()
    } else {
        ord
    }
}
