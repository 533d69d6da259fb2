// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bonsai::node::BkvRef;
use crate::bonsai::{BonsaiTree, C0IorPolicy, IorCode, ValueData, ValueView};
use crate::seqref::{SeqNo, SeqnoRef};
use crate::{Result, Slice, UserKey, UserValue};
use std::sync::Arc;

/// Point-read outcome
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// A visible value
    Found(ValueView),

    /// The key is deleted at this view
    Tombstone(Option<SeqNo>),

    /// No visible record
    NotFound,
}

/// Aggregated space/shape accounting for one or more kv-sets
#[derive(Clone, Copy, Debug, Default)]
pub struct Usage {
    /// Unique keys
    pub keys: usize,

    /// Tombstone values written
    pub tombs: usize,

    /// Key bytes stored
    pub key_bytes: usize,

    /// Value bytes stored
    pub val_bytes: usize,

    /// Slab bytes consumed
    pub alloc: usize,

    /// Slab bytes remaining
    pub free: usize,

    /// Smallest per-set consumption seen
    pub used_min: usize,

    /// Largest per-set consumption seen
    pub used_max: usize,

    /// Number of sets aggregated
    pub count: u32,
}

/// Iterator behavior flags
#[derive(Copy, Clone, Debug, Default)]
pub struct IterFlags {
    /// Iterate in descending key order
    pub reverse: bool,

    /// Only yield records whose table index matches
    pub index: Option<u16>,

    /// The underlying set is the reserved prefix-tombstone set
    pub ptomb: bool,
}

/// One Bonsai tree plus its slab allocator
///
/// The kv-set is the unit of slab locality: one allocator per set keeps
/// writers on distinct sets from contending on memory.
pub struct C0Kvset {
    tree: BonsaiTree,
    slab_sz: usize,
}

impl C0Kvset {
    /// Creates a kv-set with the given slab budget.
    pub fn new(slab_sz: usize) -> Result<Self> {
        Ok(Self {
            tree: BonsaiTree::new(slab_sz, Box::new(C0IorPolicy))?,
            slab_sz,
        })
    }

    /// The backing tree.
    #[must_use]
    pub fn tree(&self) -> &BonsaiTree {
        &self.tree
    }

    /// Stores a value for the key.
    pub fn put(
        &self,
        skidx: u16,
        key: &[u8],
        value: UserValue,
        seqref: SeqnoRef,
    ) -> Result<IorCode> {
        self.tree.insert(skidx, key, ValueData::Value(value), seqref)
    }

    /// Writes a tombstone for the key.
    pub fn del(&self, skidx: u16, key: &[u8], seqref: SeqnoRef) -> Result<IorCode> {
        self.tree.insert(skidx, key, ValueData::Tombstone, seqref)
    }

    /// Writes a prefix tombstone.
    ///
    /// Only meaningful on the multiset's reserved ptomb set.
    pub fn prefix_del(&self, skidx: u16, pfx: &[u8], seqref: SeqnoRef) -> Result<IorCode> {
        self.tree
            .insert(skidx, pfx, ValueData::PrefixTombstone, seqref)
    }

    /// Point read under MVCC visibility.
    #[must_use]
    pub fn get(
        &self,
        skidx: u16,
        key: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
    ) -> Lookup {
        let Some(entry) = self.tree.find(skidx, key) else {
            return Lookup::NotFound;
        };

        match entry.find_value(view_seqno, seqref) {
            Some(view) => match view.data {
                ValueData::Value(_) => Lookup::Found(view),
                ValueData::Tombstone | ValueData::PrefixTombstone => {
                    Lookup::Tombstone(view.seqno)
                }
            },
            None => Lookup::NotFound,
        }
    }

    /// Newest visible prefix tombstone for `pfx`, if any.
    ///
    /// Only meaningful on the multiset's reserved ptomb set.
    #[must_use]
    pub fn ptomb_get(
        &self,
        skidx: u16,
        pfx: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
    ) -> Option<SeqNo> {
        let bkv = self.tree.find(skidx, pfx)?;
        bkv.bkv().find_ptomb(view_seqno, seqref)
    }

    /// Scans keys starting with `pfx`, counting visible matches up to
    /// `max_seen` and retaining the first one.
    ///
    /// Values at or below `pt_seqno` are suppressed, which is how a
    /// covering prefix tombstone is applied to the probe.
    #[must_use]
    pub fn prefix_probe(
        &self,
        skidx: u16,
        pfx: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
        max_seen: u32,
        pt_seqno: Option<SeqNo>,
    ) -> ProbeResult {
        let mut result = ProbeResult::default();
        let mut cur = self.tree.find_ge_ref(skidx, pfx);

        while let Some(bkv) = cur {
            if result.seen >= max_seen {
                break;
            }
            if bkv.skidx() != skidx || !bkv.key().starts_with(pfx) {
                break;
            }

            if let Some(view) = bkv.find_value(view_seqno, seqref) {
                let shadowed = match (view.seqno, pt_seqno) {
                    (Some(seqno), Some(pt)) => seqno <= pt,
                    _ => false,
                };

                if !shadowed && matches!(view.data, ValueData::Value(_)) {
                    result.seen += 1;
                    if result.first.is_none() {
                        result.first = Some((Slice::from(bkv.key()), view));
                    }
                }
            }

            cur = self.tree.next_ref(bkv);
        }

        result
    }

    /// Freezes the set: latches the LCP bound and rejects further writes.
    pub fn finalize(&self) {
        self.tree.finalize();
    }

    /// `true` once frozen.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.tree.is_finalized()
    }

    /// Slab bytes consumed.
    #[must_use]
    pub fn used(&self) -> usize {
        self.tree.arena().used()
    }

    /// Slab bytes remaining.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.tree.arena().avail()
    }

    /// Configured slab budget.
    #[must_use]
    pub fn slab_sz(&self) -> usize {
        self.slab_sz
    }

    /// Number of unique keys.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.tree.element_count()
    }

    /// `(keys, tree height, max values-per-key)` in one sample.
    #[must_use]
    pub fn element_count2(&self) -> (usize, u32, u32) {
        self.tree.element_count2()
    }

    /// Space/shape accounting for this set alone.
    #[must_use]
    pub fn usage(&self) -> Usage {
        let used = self.used();

        Usage {
            keys: self.tree.element_count(),
            tombs: self.tree.tomb_count(),
            key_bytes: self.tree.key_bytes(),
            val_bytes: self.tree.val_bytes(),
            alloc: used,
            free: self.avail(),
            used_min: used,
            used_max: used,
            count: 1,
        }
    }

    pub(crate) fn charge(&self, bytes: usize) -> Result<()> {
        self.tree.arena().charge(bytes)
    }

    /// Opens an iterator over this set.
    #[must_use]
    pub fn iterator(self: &Arc<Self>, flags: IterFlags) -> C0KvsetIter {
        let mut iter = C0KvsetIter {
            set: self.clone(),
            flags,
            cur: None,
            last: None,
            seeked: None,
            started: false,
        };
        iter.rewind();
        iter
    }
}

/// Prefix-probe outcome
#[derive(Clone, Debug, Default)]
pub struct ProbeResult {
    /// Number of visible matches counted
    pub seen: u32,

    /// First visible match in key order
    pub first: Option<(UserKey, ValueView)>,
}

/// A record surfaced by a kv-set iterator or a merged cursor
///
/// Holds a reference on the owning set, so it stays valid for as long as
/// the caller keeps it.
#[derive(Clone)]
pub struct Element {
    // Held only to pin the arena the record lives in
    _set: Arc<C0Kvset>,
    bkv: BkvRef,
    ptomb_source: bool,
}

impl Element {
    pub(crate) fn new(set: Arc<C0Kvset>, bkv: BkvRef, ptomb_source: bool) -> Self {
        Self {
            _set: set,
            bkv,
            ptomb_source,
        }
    }

    /// The key bytes.
    #[must_use]
    pub fn key(&self) -> UserKey {
        Slice::from(self.bkv.key())
    }

    /// The table index.
    #[must_use]
    pub fn skidx(&self) -> u16 {
        self.bkv.skidx()
    }

    /// `true` if this element came out of the reserved ptomb set.
    #[must_use]
    pub fn is_ptomb(&self) -> bool {
        self.ptomb_source || self.bkv.is_ptomb()
    }

    /// `true` if the newest write against this key was a tombstone.
    #[must_use]
    pub fn is_tomb(&self) -> bool {
        self.bkv.is_tomb()
    }

    /// MVCC value choice for the given view.
    #[must_use]
    pub fn find_value(&self, view_seqno: SeqNo, seqref: Option<&SeqnoRef>) -> Option<ValueView> {
        self.bkv.find_value(view_seqno, seqref)
    }

    /// Snapshot of the whole value chain, newest first.
    #[must_use]
    pub fn values(&self) -> Vec<(Option<SeqNo>, ValueData)> {
        self.bkv.value_snapshot()
    }
}

/// An ordered (or reverse-ordered) iterator over one kv-set
///
/// Exposes the element-source interface the merge machinery drives:
/// `peek`, `pop`, `eof`, `unget` and `seek`. The source has no lifetime
/// independent of the iterator.
pub struct C0KvsetIter {
    set: Arc<C0Kvset>,
    flags: IterFlags,
    cur: Option<BkvRef>,
    last: Option<BkvRef>,
    seeked: Option<(u16, Vec<u8>)>,
    started: bool,
}

impl C0KvsetIter {
    /// `true` if the set had no keys at all when the iterator was opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.element_count() == 0
    }

    /// `true` once the iterator has run off the end.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.started && self.cur.is_none()
    }

    /// Repositions at the first (or last, reverse) record.
    pub fn rewind(&mut self) {
        let tree = self.set.tree();
        self.cur = if self.flags.reverse {
            tree.last_ref()
        } else {
            tree.first_ref()
        };
        self.started = true;
        self.last = None;
        self.seeked = None;
        self.skip_filtered();
    }

    /// Positions at the first record `>=` the key (`<=` for reverse).
    pub fn seek(&mut self, skidx: u16, key: &[u8]) {
        let tree = self.set.tree();
        self.cur = if self.flags.reverse {
            tree.find_le_ref(skidx, key)
        } else {
            tree.find_ge_ref(skidx, key)
        };
        self.started = true;
        self.last = None;
        self.seeked = Some((skidx, key.to_vec()));
        self.skip_filtered();
    }

    /// Returns the current record without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<Element> {
        self.cur
            .map(|bkv| Element::new(self.set.clone(), bkv, self.flags.ptomb))
    }

    pub(crate) fn peek_ref(&self) -> Option<BkvRef> {
        self.cur
    }

    /// Consumes and returns the current record.
    pub fn pop(&mut self) -> Option<Element> {
        self.pop_ref()
            .map(|bkv| Element::new(self.set.clone(), bkv, self.flags.ptomb))
    }

    pub(crate) fn pop_ref(&mut self) -> Option<BkvRef> {
        let bkv = self.cur?;
        self.last = Some(bkv);
        self.advance();
        Some(bkv)
    }

    /// Re-delivers the most recently popped record.
    pub fn unget(&mut self) {
        if let Some(last) = self.last.take() {
            self.cur = Some(last);
        }
    }

    /// Re-probes a source that previously hit EOF; the underlying set may
    /// have grown past the old end in the meantime.
    ///
    /// Returns `true` if the iterator has data again.
    pub(crate) fn refresh(&mut self) -> bool {
        if !self.eof() {
            return true;
        }

        let Some(last) = self.last else {
            // Never yielded anything: hold the seek position if there was
            // one, else this is a fresh source
            if let Some((skidx, key)) = self.seeked.take() {
                self.seek(skidx, &key);
            } else {
                self.rewind();
            }
            return self.cur.is_some();
        };

        let tree = self.set.tree();
        let (skidx, key) = (last.skidx(), last.key());

        self.cur = if self.flags.reverse {
            tree.find_le_ref(skidx, key).and_then(|b| {
                if b == last {
                    tree.prev_ref(b)
                } else {
                    Some(b)
                }
            })
        } else {
            tree.find_ge_ref(skidx, key).and_then(|b| {
                if b == last {
                    tree.next_ref(b)
                } else {
                    Some(b)
                }
            })
        };

        self.skip_filtered();
        self.cur.is_some()
    }

    fn advance(&mut self) {
        let tree = self.set.tree();
        self.cur = self.cur.and_then(|bkv| {
            if self.flags.reverse {
                tree.prev_ref(bkv)
            } else {
                tree.next_ref(bkv)
            }
        });
        self.skip_filtered();
    }

    fn skip_filtered(&mut self) {
        let Some(want) = self.flags.index else {
            return;
        };

        let tree = self.set.tree();
        while let Some(bkv) = self.cur {
            if bkv.skidx() == want {
                break;
            }
            self.cur = if self.flags.reverse {
                tree.prev_ref(bkv)
            } else {
                tree.next_ref(bkv)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    const SLAB: usize = 4 * 1_024 * 1_024;

    fn set() -> Arc<C0Kvset> {
        Arc::new(C0Kvset::new(SLAB).unwrap())
    }

    fn ord(seqno: SeqNo) -> SeqnoRef {
        SeqnoRef::Ordinal(seqno)
    }

    #[test]
    fn put_get_mvcc() {
        let s = set();

        s.put(2, b"alpha", Slice::from(b"1"), ord(3)).unwrap();

        match s.get(2, b"alpha", 5, None) {
            Lookup::Found(view) => {
                assert_eq!(ValueData::Value(Slice::from(b"1")), view.data);
            }
            other => panic!("expected Found, got {other:?}"),
        }

        assert_eq!(Lookup::NotFound, s.get(2, b"alpha", 2, None));
        assert_eq!(Lookup::NotFound, s.get(3, b"alpha", 5, None));
    }

    #[test]
    fn del_shadows_put() {
        let s = set();

        s.put(0, b"k", Slice::from(b"v"), ord(1)).unwrap();
        s.del(0, b"k", ord(2)).unwrap();

        assert_eq!(Lookup::Tombstone(Some(2)), s.get(0, b"k", 5, None));

        // The old value is still visible below the tombstone
        match s.get(0, b"k", 1, None) {
            Lookup::Found(_) => {}
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn ptomb_get_picks_newest_visible() {
        let s = set();

        s.prefix_del(1, b"ab", ord(5)).unwrap();
        s.prefix_del(1, b"ab", ord(9)).unwrap();

        assert_eq!(Some(9), s.ptomb_get(1, b"ab", 10, None));
        assert_eq!(Some(5), s.ptomb_get(1, b"ab", 7, None));
        assert_eq!(None, s.ptomb_get(1, b"ab", 4, None));
        assert_eq!(None, s.ptomb_get(1, b"ac", 10, None));
    }

    #[test]
    fn prefix_probe_counts_visible_matches() {
        let s = set();

        s.put(0, b"ab1", Slice::from(b"1"), ord(1)).unwrap();
        s.put(0, b"ab2", Slice::from(b"2"), ord(2)).unwrap();
        s.put(0, b"ab3", Slice::from(b"3"), ord(3)).unwrap();
        s.del(0, b"ab2", ord(4)).unwrap();
        s.put(0, b"ac1", Slice::from(b"x"), ord(1)).unwrap();

        let probe = s.prefix_probe(0, b"ab", 10, None, u32::MAX, None);
        assert_eq!(2, probe.seen);
        let (key, _) = probe.first.unwrap();
        assert_eq!(b"ab1", &*key);

        // Below the delete, all three are visible
        let probe = s.prefix_probe(0, b"ab", 3, None, u32::MAX, None);
        assert_eq!(3, probe.seen);

        // A covering ptomb seqno suppresses older values
        let probe = s.prefix_probe(0, b"ab", 10, None, u32::MAX, Some(2));
        assert_eq!(1, probe.seen);
    }

    #[test]
    fn iterator_forward_and_reverse() {
        let s = set();

        for key in [b"b", b"d", b"a", b"c"] {
            s.put(0, key, Slice::from(b"x"), ord(1)).unwrap();
        }

        let mut iter = s.iterator(IterFlags::default());
        let keys: Vec<_> = std::iter::from_fn(|| iter.pop().map(|e| e.key().to_vec())).collect();
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()], keys);
        assert!(iter.eof());

        let mut iter = s.iterator(IterFlags {
            reverse: true,
            ..Default::default()
        });
        let keys: Vec<_> = std::iter::from_fn(|| iter.pop().map(|e| e.key().to_vec())).collect();
        assert_eq!(vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()], keys);
    }

    #[test]
    fn iterator_seek_matches_find_ge() {
        let s = set();

        for i in (0..50u32).step_by(5) {
            s.put(0, &i.to_be_bytes(), Slice::from(b"x"), ord(1)).unwrap();
        }

        for i in 0..55u32 {
            let key = i.to_be_bytes();

            let mut iter = s.iterator(IterFlags::default());
            iter.seek(0, &key);
            let via_iter = iter.pop().map(|e| e.key().to_vec());

            let via_find = s.tree().find_ge(0, &key).map(|e| e.key().to_vec());
            assert_eq!(via_find, via_iter, "at {i}");
        }
    }

    #[test]
    fn iterator_skidx_filter() {
        let s = set();

        s.put(1, b"a", Slice::from(b"x"), ord(1)).unwrap();
        s.put(2, b"b", Slice::from(b"x"), ord(1)).unwrap();
        s.put(1, b"c", Slice::from(b"x"), ord(1)).unwrap();
        s.put(3, b"d", Slice::from(b"x"), ord(1)).unwrap();

        let mut iter = s.iterator(IterFlags {
            index: Some(1),
            ..Default::default()
        });

        let keys: Vec<_> = std::iter::from_fn(|| iter.pop().map(|e| e.key().to_vec())).collect();
        assert_eq!(vec![b"a".to_vec(), b"c".to_vec()], keys);
    }

    #[test]
    fn iterator_unget_redelivers() {
        let s = set();

        s.put(0, b"a", Slice::from(b"x"), ord(1)).unwrap();
        s.put(0, b"b", Slice::from(b"x"), ord(1)).unwrap();

        let mut iter = s.iterator(IterFlags::default());
        assert_eq!(b"a", &*iter.pop().unwrap().key());
        iter.unget();
        assert_eq!(b"a", &*iter.pop().unwrap().key());
        assert_eq!(b"b", &*iter.pop().unwrap().key());
    }

    #[test]
    fn iterator_refresh_after_growth() {
        let s = set();

        s.put(0, b"a", Slice::from(b"x"), ord(1)).unwrap();

        let mut iter = s.iterator(IterFlags::default());
        assert_eq!(b"a", &*iter.pop().unwrap().key());
        assert!(iter.eof());

        s.put(0, b"b", Slice::from(b"x"), ord(2)).unwrap();

        assert!(iter.refresh());
        assert_eq!(b"b", &*iter.pop().unwrap().key());
    }

    #[test]
    fn usage_accounting() {
        let s = set();

        s.put(0, b"key-1", Slice::from(b"value-1"), ord(1)).unwrap();
        s.put(0, b"key-2", Slice::from(b"value-2"), ord(2)).unwrap();
        s.del(0, b"key-1", ord(3)).unwrap();

        let usage = s.usage();
        assert_eq!(2, usage.keys);
        assert_eq!(1, usage.tombs);
        assert_eq!(10, usage.key_bytes);
        assert_eq!(14, usage.val_bytes);
        assert!(usage.alloc > 0);
        assert_eq!(1, usage.count);
        assert!(s.used() > 0);
        assert!(s.avail() < SLAB);
    }
}
