// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(unsafe_code)]

pub(crate) mod arena;
pub(crate) mod node;

use crate::key::{common_prefix_len, key_full_cmp, KeyImmediate};
use crate::seqref::{SeqNo, SeqnoRef};
use crate::{Error, Result, Slice};
use arena::Arena;
use node::{
    BkvRef, BonsaiKv, BonsaiVal, Node, BKV_FLAG_PTOMB, BKV_FLAG_TOMB, BKV_FLAG_TOMB_HEAD,
};
use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicPtr, AtomicU32, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::{Mutex, OnceLock};

pub use node::{ValueData, ValueView};

/// Outcome of an insert-or-replace
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IorCode {
    /// A new key was inserted
    Insert,

    /// A new value was added to an existing key's chain
    Add,

    /// An existing value with the same seqref was replaced
    Replace,
}

/// Where a new value lands in an existing chain
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Becomes the new chain head
    Head,

    /// Inserted in front of the value at this chain position
    Before(usize),

    /// Appended after the oldest value
    Tail,

    /// Replaces the value at this chain position
    Replace(usize),
}

/// Lending cursor over an existing value chain's seqrefs, newest first
pub struct ValueChainCursor<'t> {
    cur: *const BonsaiVal,
    _tree: PhantomData<&'t BonsaiTree>,
}

impl<'t> ValueChainCursor<'t> {
    /// Advances to the next (older) value and returns its seqref.
    pub fn next(&mut self) -> Option<&'t SeqnoRef> {
        if self.cur.is_null() {
            return None;
        }

        // SAFETY: chain nodes are arena-pinned; the cursor only exists
        // during an insert, under the writer lock.
        let val = unsafe { &*self.cur };
        self.cur = val.next.load(Acquire);
        Some(&val.payload.seqref)
    }
}

/// Decides how a new value slots into an existing key's chain
///
/// This is engine policy about seqref ordering; the tree performs the
/// chain surgery but does not hard-code the ordering rules.
pub trait IorPolicy: Send + Sync {
    /// Returns the placement for a value carrying `new`, given the chain's
    /// current seqrefs.
    fn placement(&self, new: &SeqnoRef, chain: &mut ValueChainCursor<'_>) -> Placement;
}

/// The c0 chain policy
///
/// Same seqref replaces in place; an ordinal slots in front of the first
/// older value; a live transaction value goes to the chain head.
#[derive(Default)]
pub struct C0IorPolicy;

impl IorPolicy for C0IorPolicy {
    fn placement(&self, new: &SeqnoRef, chain: &mut ValueChainCursor<'_>) -> Placement {
        let mut idx = 0;
        let mut slot = None;

        while let Some(old) = chain.next() {
            if new.same(old) {
                return Placement::Replace(idx);
            }
            if new.is_newer_than(old) {
                slot = Some(idx);
                break;
            }
            idx += 1;
        }

        if new.ordinal().is_none() {
            // Live transaction values always lead the chain
            return Placement::Head;
        }

        match slot {
            Some(idx) => Placement::Before(idx),
            None => Placement::Tail,
        }
    }
}

/// A key record surfaced by a tree query
///
/// Borrows the tree, so it can never outlive the storage backing it.
pub struct Entry<'t> {
    bkv: BkvRef,
    _tree: PhantomData<&'t BonsaiTree>,
}

impl<'t> Entry<'t> {
    pub(crate) fn new(bkv: BkvRef) -> Self {
        Self {
            bkv,
            _tree: PhantomData,
        }
    }

    /// The key bytes.
    #[must_use]
    pub fn key(&self) -> &'t [u8] {
        // SAFETY: arena-pinned for the tree's lifetime, which 't bounds
        unsafe { &*std::ptr::from_ref(self.bkv.key()) }
    }

    /// The table index.
    #[must_use]
    pub fn skidx(&self) -> u16 {
        self.bkv.skidx()
    }

    /// `true` if the newest write against this key was a regular tombstone.
    #[must_use]
    pub fn is_tomb(&self) -> bool {
        self.bkv.is_tomb()
    }

    /// Number of values currently chained.
    #[must_use]
    pub fn value_count(&self) -> u32 {
        self.bkv.nvals()
    }

    /// MVCC value choice for the given view: the value written under the
    /// caller's own seqref if the chain holds one, else the value with the
    /// greatest ordinal seqno not greater than the view seqno.
    #[must_use]
    pub fn find_value(&self, view_seqno: SeqNo, seqref: Option<&SeqnoRef>) -> Option<ValueView> {
        self.bkv.find_value(view_seqno, seqref)
    }

    /// Snapshot of the whole chain, newest first, as `(seqno, value)`.
    #[must_use]
    pub fn values(&self) -> Vec<(Option<SeqNo>, ValueData)> {
        self.bkv.value_snapshot()
    }

    pub(crate) fn bkv(&self) -> BkvRef {
        self.bkv
    }
}

struct Bounds {
    lcp: usize,
    skidx: u16,
    prefix: Slice,
}

#[derive(Default)]
struct WriterState {
    // Replaced value nodes; unreachable from any chain, but their payloads
    // still need dropping with the tree
    graveyard: Vec<NonNull<BonsaiVal>>,
}

/// A single-writer / many-reader balanced ordered map
///
/// Keys map to newest-first value chains ordered by seqref. Readers
/// traverse published pointers without locking; the single writer
/// rebalances by cloning the touched path and publishing the new root
/// with one release store. Nodes are arena-pinned and reclaimed wholesale
/// when the tree drops, so a reader can never observe freed memory.
pub struct BonsaiTree {
    arena: Arena,
    root: AtomicPtr<Node>,
    sentinel: Box<BonsaiKv>,
    writer: Mutex<WriterState>,
    policy: Box<dyn IorPolicy>,
    bounds: OnceLock<Option<Bounds>>,

    key_count: AtomicUsize,
    key_bytes: AtomicUsize,
    val_bytes: AtomicUsize,
    tomb_count: AtomicUsize,
    max_vals: AtomicU32,
}

// SAFETY: shared state is only mutated through atomics (or under the
// writer mutex); all pointers target arena-pinned or boxed memory owned
// by the tree.
unsafe impl Send for BonsaiTree {}
unsafe impl Sync for BonsaiTree {}

impl BonsaiTree {
    /// Creates a tree with the given slab budget and chain policy.
    pub fn new(slab_sz: usize, policy: Box<dyn IorPolicy>) -> Result<Self> {
        Ok(Self {
            arena: Arena::new(slab_sz)?,
            root: AtomicPtr::new(std::ptr::null_mut()),
            sentinel: BonsaiKv::sentinel(),
            writer: Mutex::new(WriterState::default()),
            policy,
            bounds: OnceLock::new(),
            key_count: AtomicUsize::new(0),
            key_bytes: AtomicUsize::new(0),
            val_bytes: AtomicUsize::new(0),
            tomb_count: AtomicUsize::new(0),
            max_vals: AtomicU32::new(0),
        })
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    fn sentinel_ptr(&self) -> *mut BonsaiKv {
        std::ptr::from_ref(&*self.sentinel).cast_mut()
    }

    /// `true` once [`BonsaiTree::finalize`] has run.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.bounds.get().is_some()
    }

    /// The latched LCP bound: `lcp + 1` when all keys share a table index,
    /// `1` otherwise, `0` before finalization.
    #[must_use]
    pub fn bounds(&self) -> u32 {
        match self.bounds.get() {
            #[allow(clippy::cast_possible_truncation)]
            Some(Some(b)) => b.lcp as u32 + 1,
            Some(None) => 1,
            None => 0,
        }
    }

    /// Number of unique keys.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.key_count.load(Acquire)
    }

    /// `(keys, height, max values-per-key)` in one sample.
    #[must_use]
    pub fn element_count2(&self) -> (usize, u32, u32) {
        (
            self.key_count.load(Acquire),
            self.height(),
            self.max_vals.load(Acquire),
        )
    }

    /// Height of the tree.
    #[must_use]
    pub fn height(&self) -> u32 {
        let root = self.root.load(Acquire);
        u32::try_from(Node::height_of(root)).unwrap_or(0)
    }

    pub(crate) fn key_bytes(&self) -> usize {
        self.key_bytes.load(Acquire)
    }

    pub(crate) fn val_bytes(&self) -> usize {
        self.val_bytes.load(Acquire)
    }

    pub(crate) fn tomb_count(&self) -> usize {
        self.tomb_count.load(Acquire)
    }

    /// Inserts a value for `key`, creating the key record if needed.
    ///
    /// With an existing key, the configured [`IorPolicy`] decides whether
    /// the value is added to the chain or replaces one with the same
    /// seqref.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the slab is exhausted (no structural
    /// mutation is committed), [`Error::Finalized`] after
    /// [`BonsaiTree::finalize`], [`Error::InvalidArgument`] for malformed
    /// keys.
    pub fn insert(
        &self,
        skidx: u16,
        key: &[u8],
        data: ValueData,
        seqref: SeqnoRef,
    ) -> Result<IorCode> {
        let imm = KeyImmediate::new(skidx, key)?;

        debug_assert!(!self.is_finalized(), "insert after finalize");

        #[allow(clippy::expect_used)]
        let mut writer = self.writer.lock().expect("lock poisoned");

        if self.is_finalized() {
            return Err(Error::Finalized);
        }

        let is_tomb = matches!(data, ValueData::Tombstone);
        let val_len = data.byte_len();

        let mut ctx = InsertCtx {
            imm,
            key,
            existing: None,
            new_bkv: None,
            pred: self.sentinel_ptr(),
            succ: self.sentinel_ptr(),
        };

        let old_root = self.root.load(Relaxed);
        let new_root = self.descend(old_root, &mut ctx)?;

        let code = if let Some(existing) = ctx.existing {
            self.chain_insert(&mut writer, existing, data, seqref)?
        } else {
            #[allow(clippy::expect_used)]
            let new_bkv = ctx.new_bkv.expect("insert created a record");
            self.attach_new_bkv(new_bkv, ctx.pred, ctx.succ, data, seqref)?;
            self.root.store(new_root.cast_mut(), Release);
            self.key_count.fetch_add(1, AcqRel);
            self.key_bytes.fetch_add(key.len(), AcqRel);
            IorCode::Insert
        };

        self.val_bytes.fetch_add(val_len, AcqRel);
        if is_tomb {
            self.tomb_count.fetch_add(1, AcqRel);
        }

        if let Some(bkv) = ctx.existing {
            self.tombspan_after_update(BkvRef(bkv), is_tomb);
        }

        Ok(code)
    }

    /// Exact lookup.
    #[must_use]
    pub fn find(&self, skidx: u16, key: &[u8]) -> Option<Entry<'_>> {
        let imm = KeyImmediate::new(skidx, key).ok()?;

        if let Some(Some(b)) = self.bounds.get() {
            // Every key in a finalized single-index tree shares the
            // latched prefix; a mismatch cannot be present
            if skidx != b.skidx || key.len() < b.lcp || !key.starts_with(&b.prefix) {
                return None;
            }
        }

        let mut cur = self.root.load(Acquire);
        while !cur.is_null() {
            // SAFETY: published nodes are arena-pinned and initialized
            let node = unsafe { &*cur };

            match self.cmp_node(&imm, key, node) {
                CmpOrdering::Equal => return Some(Entry::new(BkvRef(node.bkv))),
                CmpOrdering::Less => cur = node.left.cast_mut(),
                CmpOrdering::Greater => cur = node.right.cast_mut(),
            }
        }

        None
    }

    /// First key `>=` the given key.
    #[must_use]
    pub fn find_ge(&self, skidx: u16, key: &[u8]) -> Option<Entry<'_>> {
        self.find_ge_ref(skidx, key).map(Entry::new)
    }

    /// Last key `<=` the given key.
    #[must_use]
    pub fn find_le(&self, skidx: u16, key: &[u8]) -> Option<Entry<'_>> {
        self.find_le_ref(skidx, key).map(Entry::new)
    }

    pub(crate) fn find_ge_ref(&self, skidx: u16, key: &[u8]) -> Option<BkvRef> {
        let imm = KeyImmediate::new(skidx, key).ok()?;
        let mut cand = None;

        let mut cur = self.root.load(Acquire);
        while !cur.is_null() {
            // SAFETY: published nodes are arena-pinned and initialized
            let node = unsafe { &*cur };

            match self.cmp_node(&imm, key, node) {
                CmpOrdering::Equal => return Some(BkvRef(node.bkv)),
                CmpOrdering::Less => {
                    cand = Some(BkvRef(node.bkv));
                    cur = node.left.cast_mut();
                }
                CmpOrdering::Greater => cur = node.right.cast_mut(),
            }
        }

        cand
    }

    pub(crate) fn find_le_ref(&self, skidx: u16, key: &[u8]) -> Option<BkvRef> {
        let imm = KeyImmediate::new(skidx, key).ok()?;
        let mut cand = None;

        let mut cur = self.root.load(Acquire);
        while !cur.is_null() {
            // SAFETY: published nodes are arena-pinned and initialized
            let node = unsafe { &*cur };

            match self.cmp_node(&imm, key, node) {
                CmpOrdering::Equal => return Some(BkvRef(node.bkv)),
                CmpOrdering::Less => cur = node.left.cast_mut(),
                CmpOrdering::Greater => {
                    cand = Some(BkvRef(node.bkv));
                    cur = node.right.cast_mut();
                }
            }
        }

        cand
    }

    /// First non-tombstone key `>=` the given key.
    ///
    /// Runs of adjacent tombstones are linked into spans and skipped in
    /// one hop instead of being walked one by one.
    #[must_use]
    pub fn skip_tombs_ge(&self, skidx: u16, key: &[u8]) -> Option<Entry<'_>> {
        let mut cur = self.find_ge_ref(skidx, key)?;
        let sentinel = self.sentinel_ptr();

        loop {
            if !cur.is_tomb() {
                return Some(Entry::new(cur));
            }

            let mut next = cur.chain_next();

            if let Some((_, tail)) = span_of(cur) {
                // A stale span link could point behind us; only jump forward
                if kv_cmp_ge(tail, cur) {
                    next = tail.chain_next();
                }
            }

            if next == sentinel || next.is_null() {
                return None;
            }

            cur = BkvRef(NonNull::new(next)?);
        }
    }

    /// Latches the LCP bound and rejects writes from here on.
    ///
    /// Idempotent.
    pub fn finalize(&self) {
        #[allow(clippy::expect_used)]
        let _writer = self.writer.lock().expect("lock poisoned");

        self.bounds.get_or_init(|| {
            let sentinel = self.sentinel_ptr();
            let first = self.sentinel.next.load(Acquire);
            let last = self.sentinel.prev.load(Acquire);

            if first == sentinel {
                return None;
            }

            // SAFETY: chain members are arena-pinned
            let (first, last) = unsafe { (&*first, &*last) };

            if first.key_imm.skidx() != last.key_imm.skidx() {
                return None;
            }

            // In sorted order, the common prefix of the least and
            // greatest keys is the common prefix of every key
            let lcp = common_prefix_len(&first.key, &last.key);

            Some(Bounds {
                lcp,
                skidx: first.key_imm.skidx(),
                prefix: Slice::from(&first.key.as_ref()[0..lcp]),
            })
        });
    }

    /// First key in sorted order.
    pub(crate) fn first_ref(&self) -> Option<BkvRef> {
        let next = self.sentinel.next.load(Acquire);
        if next == self.sentinel_ptr() {
            None
        } else {
            Some(BkvRef(NonNull::new(next)?))
        }
    }

    /// Last key in sorted order.
    pub(crate) fn last_ref(&self) -> Option<BkvRef> {
        let prev = self.sentinel.prev.load(Acquire);
        if prev == self.sentinel_ptr() {
            None
        } else {
            Some(BkvRef(NonNull::new(prev)?))
        }
    }

    /// Chain successor, or `None` at the end.
    pub(crate) fn next_ref(&self, bkv: BkvRef) -> Option<BkvRef> {
        let next = bkv.chain_next();
        if next == self.sentinel_ptr() {
            None
        } else {
            Some(BkvRef(NonNull::new(next)?))
        }
    }

    /// Chain predecessor, or `None` at the start.
    pub(crate) fn prev_ref(&self, bkv: BkvRef) -> Option<BkvRef> {
        let prev = bkv.chain_prev();
        if prev == self.sentinel_ptr() {
            None
        } else {
            Some(BkvRef(NonNull::new(prev)?))
        }
    }

    /// Walks the sorted chain front to back.
    pub fn traverse<F: FnMut(Entry<'_>)>(&self, mut f: F) {
        let mut cur = self.first_ref();
        while let Some(bkv) = cur {
            f(Entry::new(bkv));
            cur = self.next_ref(bkv);
        }
    }

    fn cmp_node(&self, imm: &KeyImmediate, key: &[u8], node: &Node) -> CmpOrdering {
        let weight = imm.weight();
        if weight != node.weight {
            return weight.cmp(&node.weight);
        }

        // SAFETY: bkv pointers are arena-pinned
        let other = unsafe { node.bkv.as_ref() };
        key_full_cmp(imm, key, &other.key_imm, &other.key)
    }

    fn descend(&self, node: *const Node, ctx: &mut InsertCtx<'_>) -> Result<*const Node> {
        if node.is_null() {
            let bkv = self
                .arena
                .alloc_value(BonsaiKv::new(ctx.imm, Slice::from(ctx.key)))
                .ok_or(Error::OutOfMemory)?;
            ctx.new_bkv = Some(bkv);

            return self.mk_node(bkv, ctx.imm.weight(), std::ptr::null(), std::ptr::null());
        }

        // SAFETY: published nodes are arena-pinned and initialized
        let n = unsafe { &*node };

        match self.cmp_node(&ctx.imm, ctx.key, n) {
            CmpOrdering::Equal => {
                ctx.existing = Some(n.bkv);
                Ok(node)
            }
            CmpOrdering::Less => {
                ctx.succ = n.bkv.as_ptr();
                let left = self.descend(n.left, ctx)?;

                if std::ptr::eq(left, n.left) {
                    Ok(node)
                } else {
                    self.balance(n.bkv, n.weight, left, n.right)
                }
            }
            CmpOrdering::Greater => {
                ctx.pred = n.bkv.as_ptr();
                let right = self.descend(n.right, ctx)?;

                if std::ptr::eq(right, n.right) {
                    Ok(node)
                } else {
                    self.balance(n.bkv, n.weight, n.left, right)
                }
            }
        }
    }

    fn mk_node(
        &self,
        bkv: NonNull<BonsaiKv>,
        weight: u64,
        left: *const Node,
        right: *const Node,
    ) -> Result<*const Node> {
        let height = 1 + Node::height_of(left).max(Node::height_of(right));

        let node = self
            .arena
            .alloc_value(Node {
                left,
                right,
                height,
                weight,
                bkv,
            })
            .ok_or(Error::OutOfMemory)?;

        Ok(node.as_ptr())
    }

    fn balance(
        &self,
        bkv: NonNull<BonsaiKv>,
        weight: u64,
        left: *const Node,
        right: *const Node,
    ) -> Result<*const Node> {
        let bf = Node::height_of(left) - Node::height_of(right);

        if bf > 1 {
            // SAFETY: bf > 1 implies a non-null left child
            let l = unsafe { &*left };

            if Node::height_of(l.left) >= Node::height_of(l.right) {
                let new_right = self.mk_node(bkv, weight, l.right, right)?;
                self.mk_node(l.bkv, l.weight, l.left, new_right)
            } else {
                // SAFETY: the right-heavy left child is non-null here
                let lr = unsafe { &*l.right };
                let new_left = self.mk_node(l.bkv, l.weight, l.left, lr.left)?;
                let new_right = self.mk_node(bkv, weight, lr.right, right)?;
                self.mk_node(lr.bkv, lr.weight, new_left, new_right)
            }
        } else if bf < -1 {
            // SAFETY: bf < -1 implies a non-null right child
            let r = unsafe { &*right };

            if Node::height_of(r.right) >= Node::height_of(r.left) {
                let new_left = self.mk_node(bkv, weight, left, r.left)?;
                self.mk_node(r.bkv, r.weight, new_left, r.right)
            } else {
                // SAFETY: the left-heavy right child is non-null here
                let rl = unsafe { &*r.left };
                let new_left = self.mk_node(bkv, weight, left, rl.left)?;
                let new_right = self.mk_node(r.bkv, r.weight, rl.right, r.right)?;
                self.mk_node(rl.bkv, rl.weight, new_left, new_right)
            }
        } else {
            self.mk_node(bkv, weight, left, right)
        }
    }

    fn attach_new_bkv(
        &self,
        bkv: NonNull<BonsaiKv>,
        pred: *mut BonsaiKv,
        succ: *mut BonsaiKv,
        data: ValueData,
        seqref: SeqnoRef,
    ) -> Result<()> {
        let is_tomb = matches!(data, ValueData::Tombstone);
        let is_ptomb = matches!(data, ValueData::PrefixTombstone);

        let val = self
            .arena
            .alloc_value(BonsaiVal::new(data, seqref))
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: freshly allocated record; not yet visible to readers
        let kv = unsafe { bkv.as_ref() };
        kv.values.store(val.as_ptr(), Relaxed);
        kv.nvals.store(1, Relaxed);

        let mut flags = 0u8;
        if is_tomb {
            flags |= BKV_FLAG_TOMB;
        }
        if is_ptomb {
            flags |= BKV_FLAG_PTOMB;
        }
        kv.flags.store(flags, Relaxed);

        kv.prev.store(pred, Relaxed);
        kv.next.store(succ, Relaxed);

        // Publish into the sorted chain; the tree root follows
        // SAFETY: pred/succ are live chain members (or the sentinel)
        unsafe {
            (*pred).next.store(bkv.as_ptr(), Release);
            (*succ).prev.store(bkv.as_ptr(), Release);
        }

        self.max_vals.fetch_max(1, AcqRel);

        if is_tomb {
            self.tombspan_on_new_tomb(BkvRef(bkv), pred, succ);
        } else {
            self.tombspan_on_new_nontomb(pred, succ);
        }

        Ok(())
    }

    fn chain_insert(
        &self,
        writer: &mut WriterState,
        bkv: NonNull<BonsaiKv>,
        data: ValueData,
        seqref: SeqnoRef,
    ) -> Result<IorCode> {
        let new = self
            .arena
            .alloc_value(BonsaiVal::new(data, seqref.clone()))
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: live record; chain surgery below is writer-exclusive
        let kv = unsafe { bkv.as_ref() };

        let mut cursor = ValueChainCursor {
            cur: kv.values.load(Acquire),
            _tree: PhantomData,
        };
        let placement = self.policy.placement(&seqref, &mut cursor);

        // SAFETY: new is exclusively ours until the release store links it
        let new_ref = unsafe { new.as_ref() };

        let code = match placement {
            Placement::Head => {
                let head = kv.values.load(Acquire);
                new_ref.next.store(head, Relaxed);
                kv.values.store(new.as_ptr(), Release);
                IorCode::Add
            }
            Placement::Before(idx) => {
                let (link, old) = chain_link_at(kv, idx);
                new_ref.next.store(old, Relaxed);
                link.store(new.as_ptr(), Release);
                IorCode::Add
            }
            Placement::Tail => {
                let (link, old) = chain_link_at(kv, usize::MAX);
                debug_assert!(old.is_null());
                new_ref.next.store(std::ptr::null_mut(), Relaxed);
                link.store(new.as_ptr(), Release);
                IorCode::Add
            }
            Placement::Replace(idx) => {
                let (link, old) = chain_link_at(kv, idx);
                debug_assert!(!old.is_null());

                // SAFETY: old is the live chain node at idx
                let old_next = unsafe { (*old).next.load(Acquire) };
                new_ref.next.store(old_next, Relaxed);
                link.store(new.as_ptr(), Release);

                // Readers inside their read-side section may still walk the
                // old node; its payload is retired, not dropped
                if let Some(old) = NonNull::new(old) {
                    writer.graveyard.push(old);
                }
                IorCode::Replace
            }
        };

        if code == IorCode::Add {
            let nvals = kv.nvals.fetch_add(1, AcqRel) + 1;
            self.max_vals.fetch_max(nvals, AcqRel);
        }

        Ok(code)
    }

    // --- tomb spans -----------------------------------------------------

    fn tombspan_on_new_tomb(&self, x: BkvRef, pred: *mut BonsaiKv, succ: *mut BonsaiKv) {
        let sentinel = self.sentinel_ptr();

        if pred != sentinel {
            #[allow(clippy::expect_used)]
            let p = BkvRef(NonNull::new(pred).expect("chain members are non-null"));

            if p.is_tomb() {
                if let Some((head, tail)) = span_of(p) {
                    // Join the span; extend the tail if we sit past it
                    set_tomb_link(x, head.0.as_ptr());
                    if tail.0.as_ptr() == pred {
                        set_tomb_link(head, x.0.as_ptr());
                    }
                } else {
                    // Pair up into a fresh span [P, X]
                    set_flag(p, BKV_FLAG_TOMB_HEAD);
                    set_tomb_link(p, x.0.as_ptr());
                    set_tomb_link(x, pred);
                }
                return;
            }
        }

        if succ != sentinel {
            #[allow(clippy::expect_used)]
            let s = BkvRef(NonNull::new(succ).expect("chain members are non-null"));

            if s.is_tomb() {
                if let Some((head, tail)) = span_of(s) {
                    if head.0.as_ptr() == succ {
                        // X becomes the new head of S's span
                        set_flag(x, BKV_FLAG_TOMB_HEAD);
                        set_tomb_link(x, tail.0.as_ptr());
                        clear_flag(s, BKV_FLAG_TOMB_HEAD);
                        set_tomb_link(s, x.0.as_ptr());
                        return;
                    }
                } else {
                    // Pair up into a fresh span [X, S]
                    clear_flag(s, BKV_FLAG_TOMB_HEAD);
                    set_flag(x, BKV_FLAG_TOMB_HEAD);
                    set_tomb_link(x, succ);
                    set_tomb_link(s, x.0.as_ptr());
                }
            }
        }
    }

    /// A non-tombstone key landed between `pred` and `succ`; any span
    /// crossing that point no longer covers a contiguous run.
    fn tombspan_on_new_nontomb(&self, pred: *mut BonsaiKv, succ: *mut BonsaiKv) {
        let sentinel = self.sentinel_ptr();
        if pred == sentinel || succ == sentinel {
            return;
        }

        #[allow(clippy::expect_used)]
        let p = BkvRef(NonNull::new(pred).expect("chain members are non-null"));
        if !p.is_tomb() {
            return;
        }

        let Some((head, tail)) = span_of(p) else {
            return;
        };

        if tail.0.as_ptr() == pred {
            // Span ends right before us; it stays intact
            return;
        }

        // Truncate the left part at pred and re-head the right part
        set_tomb_link(head, pred);

        #[allow(clippy::expect_used)]
        let s = BkvRef(NonNull::new(succ).expect("chain members are non-null"));
        if s.is_tomb() {
            set_flag(s, BKV_FLAG_TOMB_HEAD);
            set_tomb_link(s, tail.0.as_ptr());
        }
    }

    /// An existing key was rewritten; keep its tomb flag and any span it
    /// participates in consistent with the newest value.
    fn tombspan_after_update(&self, b: BkvRef, is_tomb: bool) {
        if is_tomb {
            set_flag(b, BKV_FLAG_TOMB);
            return;
        }

        let was_tomb = b.is_tomb();
        clear_flag(b, BKV_FLAG_TOMB);

        if !was_tomb {
            return;
        }

        let Some((head, tail)) = span_of(b) else {
            clear_flag(b, BKV_FLAG_TOMB_HEAD);
            set_tomb_link(b, std::ptr::null_mut());
            return;
        };

        let b_ptr = b.0.as_ptr();

        if head.0.as_ptr() == b_ptr {
            clear_flag(b, BKV_FLAG_TOMB_HEAD);
            set_tomb_link(b, std::ptr::null_mut());
        } else {
            set_tomb_link(head, b.chain_prev());
        }

        if tail.0.as_ptr() != b_ptr {
            let next = b.chain_next();
            if next != self.sentinel_ptr() {
                #[allow(clippy::expect_used)]
                let r = BkvRef(NonNull::new(next).expect("chain members are non-null"));
                if r.is_tomb() {
                    set_flag(r, BKV_FLAG_TOMB_HEAD);
                    set_tomb_link(r, tail.0.as_ptr());
                }
            }
        }
    }
}

impl Drop for BonsaiTree {
    fn drop(&mut self) {
        let sentinel = self.sentinel_ptr();

        // Chain payloads (keys and live value chains)
        let mut cur = self.sentinel.next.load(Relaxed);
        while cur != sentinel {
            // SAFETY: exclusive access; arena memory is still alive
            unsafe {
                let kv = &mut *cur;
                ManuallyDrop::drop(&mut kv.key);

                let mut val = kv.values.load(Relaxed);
                while !val.is_null() {
                    let v = &mut *val;
                    val = v.next.load(Relaxed);
                    ManuallyDrop::drop(&mut v.payload);
                }

                cur = kv.next.load(Relaxed);
            }
        }

        // Retired (replaced) value payloads
        let writer = self
            .writer
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for val in writer.graveyard.drain(..) {
            // SAFETY: graveyard nodes are unlinked and uniquely retired
            unsafe {
                ManuallyDrop::drop(&mut (*val.as_ptr()).payload);
            }
        }
    }
}

struct InsertCtx<'a> {
    imm: KeyImmediate,
    key: &'a [u8],
    existing: Option<NonNull<BonsaiKv>>,
    new_bkv: Option<NonNull<BonsaiKv>>,
    pred: *mut BonsaiKv,
    succ: *mut BonsaiKv,
}

/// Resolves the span a tombstone participates in, if its links are intact.
///
/// Returns `(head, tail)`.
fn span_of(b: BkvRef) -> Option<(BkvRef, BkvRef)> {
    let head = if b.flags() & BKV_FLAG_TOMB_HEAD != 0 {
        b
    } else {
        // SAFETY: tomb links target arena-pinned records
        let ptr = unsafe { b.0.as_ref() }.tomb.load(Acquire);
        BkvRef(NonNull::new(ptr)?)
    };

    if head.flags() & BKV_FLAG_TOMB_HEAD == 0 {
        return None;
    }

    // SAFETY: as above
    let tail = unsafe { head.0.as_ref() }.tomb.load(Acquire);
    Some((head, BkvRef(NonNull::new(tail)?)))
}

fn set_flag(b: BkvRef, flag: u8) {
    // SAFETY: arena-pinned record
    unsafe { b.0.as_ref() }.flags.fetch_or(flag, AcqRel);
}

fn clear_flag(b: BkvRef, flag: u8) {
    // SAFETY: arena-pinned record
    unsafe { b.0.as_ref() }.flags.fetch_and(!flag, AcqRel);
}

fn set_tomb_link(b: BkvRef, target: *mut BonsaiKv) {
    // SAFETY: arena-pinned record
    unsafe { b.0.as_ref() }.tomb.store(target, Release);
}

fn kv_cmp_ge(a: BkvRef, b: BkvRef) -> bool {
    node::kv_cmp(&a, &b) != CmpOrdering::Less
}

/// Returns the link slot preceding chain position `idx` and the node
/// currently behind it; `usize::MAX` addresses the tail.
fn chain_link_at(kv: &BonsaiKv, idx: usize) -> (&AtomicPtr<BonsaiVal>, *mut BonsaiVal) {
    let mut link = &kv.values;
    let mut cur = link.load(Acquire);
    let mut i = 0;

    while i < idx && !cur.is_null() {
        // SAFETY: live chain node
        let next_link = unsafe { &(*cur).next };
        let next = next_link.load(Acquire);

        if idx == usize::MAX && next.is_null() {
            return (next_link, next);
        }

        link = next_link;
        cur = next;
        i += 1;
    }

    (link, cur)
}
