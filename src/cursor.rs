// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bin_heap::{BinHeap, HeapItem};
use crate::bonsai::node::{kv_cmp, kv_cmp_rev, BkvRef};
use crate::bonsai::ValueView;
use crate::key::KEY_LEN_MAX;
use crate::kvset::{C0KvsetIter, IterFlags};
use crate::multiset::Multiset;
use crate::seqref::{SeqNo, SeqnoRef};
use crate::{Slice, UserKey};
use std::cmp::Ordering;
use std::sync::Arc;

/// A record yielded by a [`MultisetCursor`]
#[derive(Clone, Debug)]
pub struct CursorEntry {
    /// The key bytes
    pub key: UserKey,

    /// The table index
    pub skidx: u16,

    /// `true` if this entry is a prefix tombstone from the reserved set;
    /// the caller applies prefix-tombstone logic to subsequent entries
    pub ptomb: bool,

    /// The value chosen for the cursor's view
    pub value: ValueView,
}

fn rev_for_heap(a: &BkvRef, b: &BkvRef) -> Ordering {
    kv_cmp_rev(a, b).reverse()
}

/// A merged cursor over one multiset
///
/// Runs one iterator per kv-set (the ptomb set's seek capped at the
/// container prefix length) through a k-way merge heap, yielding keys in
/// total order with MVCC value selection. Entries outside the cursor's
/// table index are discarded; prefix-tombstone entries are surfaced,
/// marked, for the caller to apply.
pub struct MultisetCursor {
    kvms: Arc<Multiset>,
    skidx: u16,
    prefix: Vec<u8>,
    ct_pfx_len: usize,
    reverse: bool,
    view_seqno: SeqNo,
    seqref: Option<SeqnoRef>,
    iters: Vec<Option<C0KvsetIter>>,
    heap: BinHeap,
}

impl MultisetCursor {
    /// Opens a cursor; takes a reference on the multiset for the cursor's
    /// lifetime.
    #[must_use]
    pub fn new(
        kvms: Arc<Multiset>,
        skidx: u16,
        prefix: &[u8],
        ct_pfx_len: usize,
        reverse: bool,
        view_seqno: SeqNo,
        seqref: Option<SeqnoRef>,
    ) -> Self {
        kvms.getref();

        let prefix = if reverse {
            // Reverse cursors seek with a maximally extended prefix so the
            // first record is the greatest key under it
            let mut buf = prefix.to_vec();
            buf.resize(KEY_LEN_MAX, 0xFF);
            buf
        } else {
            prefix.to_vec()
        };

        let mut cursor = Self {
            kvms,
            skidx,
            prefix,
            ct_pfx_len,
            reverse,
            view_seqno,
            seqref,
            iters: Vec::new(),
            heap: BinHeap::new(if reverse { rev_for_heap } else { kv_cmp }),
        };

        cursor.discover();
        cursor.prepare();
        cursor
    }

    fn new_iter(&self, index: usize) -> Option<C0KvsetIter> {
        let set = self.kvms.get_set(index);
        if set.element_count() == 0 {
            return None;
        }

        let mut iter = set.iterator(IterFlags {
            reverse: self.reverse,
            index: Some(self.skidx),
            ptomb: index == 0,
        });

        let seeklen = if self.reverse {
            self.prefix.len()
        } else if index == 0 {
            // Ptombs live at container-prefix granularity
            self.prefix.len().min(self.ct_pfx_len)
        } else {
            self.prefix.len()
        };

        #[allow(clippy::indexing_slicing)]
        seek_iter(&mut iter, self.skidx, &self.prefix[0..seeklen]);

        if iter.eof() {
            None
        } else {
            Some(iter)
        }
    }

    fn discover(&mut self) {
        self.iters = (0..=self.kvms.width()).map(|i| self.new_iter(i)).collect();
    }

    fn prepare(&mut self) {
        let items = self.iters.iter().enumerate().filter_map(|(src, iter)| {
            iter.as_ref()
                .and_then(C0KvsetIter::peek_ref)
                .map(|bkv| HeapItem { src, bkv })
        });

        // Borrow dance: collect before mutating the heap
        let items: Vec<_> = items.collect();
        self.heap.prepare(items);
    }

    /// Repositions every source at `seek` (the ptomb source capped at
    /// `ct_pfx_len`) and reloads the heap.
    pub fn seek(&mut self, seek: &[u8], ct_pfx_len: usize) {
        self.ct_pfx_len = ct_pfx_len;

        for (i, slot) in self.iters.iter_mut().enumerate() {
            let Some(iter) = slot else { continue };

            let mut len = seek.len();
            if i == 0 && len >= ct_pfx_len {
                len = ct_pfx_len;
            }

            #[allow(clippy::indexing_slicing)]
            seek_iter(iter, self.skidx, &seek[0..len]);
        }

        self.prepare();
    }

    /// Yields the next entry in total order, or `None` at the end.
    pub fn next(&mut self) -> Option<CursorEntry> {
        loop {
            let item = self.heap.pop()?;

            // Advance the source past the popped record and re-enter its
            // next one
            #[allow(clippy::indexing_slicing)]
            if let Some(iter) = self.iters[item.src].as_mut() {
                let _ = iter.pop_ref();
                if let Some(bkv) = iter.peek_ref() {
                    self.heap.insert_src(HeapItem {
                        src: item.src,
                        bkv,
                    });
                }
            }

            if item.bkv.skidx() != self.skidx {
                continue;
            }

            // MVCC: skip keys with nothing visible at this view
            let Some(value) = item.bkv.find_value(self.view_seqno, self.seqref.as_ref()) else {
                continue;
            };

            return Some(CursorEntry {
                key: Slice::from(item.bkv.key()),
                skidx: item.bkv.skidx(),
                ptomb: item.src == 0,
                value,
            });
        }
    }

    /// Picks up data written after the cursor was opened: sources that
    /// became non-empty or grew past their old end re-enter the merge.
    ///
    /// The heap is always emptied and reloaded from the current iterator
    /// positions, so already-consumed records are not re-yielded.
    ///
    /// Returns `true` if any source contributed new data.
    pub fn update(&mut self, ct_pfx_len: usize) -> bool {
        self.ct_pfx_len = ct_pfx_len;
        self.heap.remove_all();

        let mut added = false;

        for i in 0..self.iters.len() {
            #[allow(clippy::indexing_slicing)]
            if self.iters[i].is_none() {
                if let Some(iter) = self.new_iter(i) {
                    #[allow(clippy::indexing_slicing)]
                    {
                        self.iters[i] = Some(iter);
                    }
                    added = true;
                }
            } else {
                #[allow(clippy::indexing_slicing)]
                if let Some(iter) = self.iters[i].as_mut() {
                    if iter.eof() && iter.refresh() {
                        added = true;
                    }
                }
            }
        }

        self.prepare();
        added
    }

    /// The view seqno this cursor selects values at.
    #[must_use]
    pub fn view_seqno(&self) -> SeqNo {
        self.view_seqno
    }
}

impl Drop for MultisetCursor {
    fn drop(&mut self) {
        // Drop the per-set iterators (and their set references) before
        // releasing the cursor's multiset reference
        self.iters.clear();
        self.heap.remove_all();
        Multiset::putref(&self.kvms);
    }
}

fn seek_iter(iter: &mut C0KvsetIter, skidx: u16, key: &[u8]) {
    if key.is_empty() {
        iter.rewind();
    } else {
        iter.seek(skidx, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SLAB_SZ_MIN};
    use crate::seqref::SeqnoCounter;
    use crate::ValueData;
    use test_log::test;

    fn kvms(pfx_len: usize) -> Arc<Multiset> {
        Multiset::create(
            &Config::new()
                .ingest_width(4)
                .slab_sz(SLAB_SZ_MIN)
                .pfx_len(pfx_len),
            SeqnoCounter::default(),
        )
        .unwrap()
    }

    fn ord(seqno: SeqNo) -> SeqnoRef {
        SeqnoRef::Ordinal(seqno)
    }

    fn drain(cursor: &mut MultisetCursor) -> Vec<(Vec<u8>, bool)> {
        std::iter::from_fn(|| cursor.next().map(|e| (e.key.to_vec(), e.ptomb))).collect()
    }

    #[test]
    fn forward_total_order_across_sets() {
        let kvms = kvms(0);

        // Keys scatter across the hashed sets; the cursor must restore
        // total order
        for i in 0..64u32 {
            kvms.put(1, format!("key-{i:04}").as_bytes(), Slice::from(b"v"), ord(1))
                .unwrap();
        }

        let mut cursor = MultisetCursor::new(kvms.clone(), 1, b"", 0, false, 10, None);
        let keys = drain(&mut cursor);

        assert_eq!(64, keys.len());
        for (i, (key, ptomb)) in keys.iter().enumerate() {
            assert_eq!(format!("key-{i:04}").as_bytes(), key.as_slice());
            assert!(!ptomb);
        }

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn skidx_filtering() {
        let kvms = kvms(0);

        kvms.put(1, b"a", Slice::from(b"v"), ord(1)).unwrap();
        kvms.put(2, b"b", Slice::from(b"v"), ord(1)).unwrap();
        kvms.put(1, b"c", Slice::from(b"v"), ord(1)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 1, b"", 0, false, 10, None);
        let keys = drain(&mut cursor);
        assert_eq!(
            vec![(b"a".to_vec(), false), (b"c".to_vec(), false)],
            keys,
        );

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn mvcc_selection_skips_invisible() {
        let kvms = kvms(0);

        kvms.put(0, b"old", Slice::from(b"v"), ord(1)).unwrap();
        kvms.put(0, b"new", Slice::from(b"v"), ord(9)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 5, None);
        let keys = drain(&mut cursor);
        assert_eq!(vec![(b"old".to_vec(), false)], keys);

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn tombstones_are_yielded() {
        let kvms = kvms(0);

        kvms.put(0, b"a", Slice::from(b"v"), ord(1)).unwrap();
        kvms.del(0, b"a", ord(2)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 10, None);
        let entry = cursor.next().unwrap();
        assert_eq!(ValueData::Tombstone, entry.value.data);
        assert!(cursor.next().is_none());

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn seek_positions_all_sources() {
        let kvms = kvms(0);

        for key in [b"aa", b"bb", b"cc", b"dd"] {
            kvms.put(0, key, Slice::from(b"v"), ord(1)).unwrap();
        }

        let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 10, None);
        cursor.seek(b"bb", 0);

        let keys = drain(&mut cursor);
        assert_eq!(
            vec![
                (b"bb".to_vec(), false),
                (b"cc".to_vec(), false),
                (b"dd".to_vec(), false),
            ],
            keys,
        );

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn reverse_cursor_with_ptomb() {
        let kvms = kvms(2);

        kvms.prefix_del(1, b"ab", ord(5)).unwrap();
        kvms.put(1, b"ab1234", Slice::from(b"v"), ord(1)).unwrap();
        kvms.put(1, b"ac", Slice::from(b"v"), ord(2)).unwrap();
        kvms.put(1, b"aa", Slice::from(b"v"), ord(3)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 1, b"", 2, true, 10, None);
        let entries = drain(&mut cursor);

        // "ac", then the ptomb "ab" (before anything it covers), then the
        // covered key, then "aa"
        assert_eq!(
            vec![
                (b"ac".to_vec(), false),
                (b"ab".to_vec(), true),
                (b"ab1234".to_vec(), false),
                (b"aa".to_vec(), false),
            ],
            entries,
        );

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn forward_cursor_marks_ptomb() {
        let kvms = kvms(2);

        kvms.prefix_del(1, b"ab", ord(5)).unwrap();
        kvms.put(1, b"ab12", Slice::from(b"v"), ord(6)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 1, b"", 2, false, 10, None);
        let entries = drain(&mut cursor);

        assert_eq!(
            vec![(b"ab".to_vec(), true), (b"ab12".to_vec(), false)],
            entries,
        );

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn update_picks_up_new_writes() {
        let kvms = kvms(0);

        kvms.put(0, b"a", Slice::from(b"v"), ord(1)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 10, None);
        assert_eq!(b"a", &*cursor.next().unwrap().key);
        assert!(cursor.next().is_none());

        // New data lands after the cursor ran dry
        kvms.put(0, b"b", Slice::from(b"v"), ord(2)).unwrap();
        kvms.put(0, b"c", Slice::from(b"v"), ord(3)).unwrap();

        assert!(cursor.update(0));
        assert_eq!(b"b", &*cursor.next().unwrap().key);
        assert_eq!(b"c", &*cursor.next().unwrap().key);
        assert!(cursor.next().is_none());

        // Nothing new: update reports no change
        assert!(!cursor.update(0));

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn update_does_not_replay_consumed_keys() {
        let kvms = kvms(0);

        kvms.put(0, b"a", Slice::from(b"v"), ord(1)).unwrap();
        kvms.put(0, b"c", Slice::from(b"v"), ord(1)).unwrap();

        let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 10, None);
        assert_eq!(b"a", &*cursor.next().unwrap().key);

        kvms.put(0, b"b", Slice::from(b"v"), ord(2)).unwrap();
        cursor.update(0);

        // "b" may sort before the un-consumed "c" and must appear if its
        // source had not passed it; "a" must not reappear
        let rest = drain(&mut cursor);
        assert!(!rest.iter().any(|(k, _)| k == b"a"));
        assert!(rest.iter().any(|(k, _)| k == b"c"));

        drop(cursor);
        Multiset::putref(&kvms);
    }

    #[test]
    fn cursor_holds_a_multiset_reference() {
        let kvms = kvms(0);
        kvms.put(0, b"a", Slice::from(b"v"), ord(1)).unwrap();

        let cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 10, None);
        assert_eq!(2, kvms.refcnt());

        drop(cursor);
        assert_eq!(1, kvms.refcnt());

        Multiset::putref(&kvms);
    }
}
