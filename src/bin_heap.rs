// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bonsai::node::BkvRef;
use std::cmp::Ordering;

/// An item in the merge heap: the source's index plus its current record
#[derive(Copy, Clone)]
pub(crate) struct HeapItem {
    pub src: usize,
    pub bkv: BkvRef,
}

type CmpFn = fn(&BkvRef, &BkvRef) -> Ordering;

/// A comparator-parameterized k-way merge heap
///
/// Pops the least item per the comparator; ties break on source index so
/// the ptomb source (index 0) wins over ordinary sets.
pub(crate) struct BinHeap {
    cmp: CmpFn,
    items: Vec<HeapItem>,
}

impl BinHeap {
    pub fn new(cmp: CmpFn) -> Self {
        Self {
            cmp,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empties the heap; sources re-enter via `prepare` or `insert_src`.
    pub fn remove_all(&mut self) {
        self.items.clear();
    }

    /// Reloads the heap from scratch.
    pub fn prepare<I: IntoIterator<Item = HeapItem>>(&mut self, items: I) {
        self.items.clear();
        self.items.extend(items);

        let len = self.items.len();
        for i in (0..len / 2).rev() {
            self.sift_down(i);
        }
    }

    /// Adds one source's current record.
    pub fn insert_src(&mut self, item: HeapItem) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Removes and returns the least item.
    pub fn pop(&mut self) -> Option<HeapItem> {
        if self.items.is_empty() {
            return None;
        }

        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();

        if !self.items.is_empty() {
            self.sift_down(0);
        }

        top
    }

    fn less(&self, a: &HeapItem, b: &HeapItem) -> bool {
        match (self.cmp)(&a.bkv, &b.bkv) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.src < b.src,
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;

            #[allow(clippy::indexing_slicing)]
            if self.less(&self.items[i], &self.items[parent]) {
                self.items.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();

        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut least = i;

            #[allow(clippy::indexing_slicing)]
            {
                if left < len && self.less(&self.items[left], &self.items[least]) {
                    least = left;
                }
                if right < len && self.less(&self.items[right], &self.items[least]) {
                    least = right;
                }
            }

            if least == i {
                break;
            }

            self.items.swap(i, least);
            i = least;
        }
    }
}
