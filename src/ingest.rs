// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bonsai::ValueData;
use crate::kvset::{C0KvsetIter, IterFlags, Usage};
use crate::multiset::Multiset;
use crate::seqref::SeqNo;
use crate::UserKey;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

/// The surrounding write-staging layer, as seen by the ingest hand-off
///
/// Supplies the ingest ordering and the seqno window bookkeeping, and
/// owns the late-commit buffer.
pub trait C0sk {
    /// Lower bound of the next ingest's seqno window.
    fn min_seqno_get(&self) -> SeqNo;

    /// Advances the lower bound; called with the outgoing ingest's max.
    fn min_seqno_set(&self, seqno: SeqNo);

    /// Registers and returns the next ingest order.
    fn ingest_order_register(&self) -> u64;

    /// The late-commit buffer, if the engine runs one.
    fn lc(&self) -> Option<&dyn LcBuffer>;
}

/// The late-committed buffer collaborator
pub trait LcBuffer {
    /// Iterators over values whose commit seqno lies in `[min, max]`.
    fn ingest_sources(&self, min_seqno: SeqNo, max_seqno: SeqNo) -> Vec<Box<dyn IngestSource>>;
}

/// An external element source merged into an ingest
pub trait IngestSource: Send {
    /// The next entry in `(skidx, key)` order, or `None` at the end.
    fn next(&mut self) -> Option<IngestEntry>;
}

/// One key's worth of ingest data
#[derive(Clone, Debug)]
pub struct IngestEntry {
    /// The table index
    pub skidx: u16,

    /// The key bytes
    pub key: UserKey,

    /// `true` if this is a prefix tombstone
    pub ptomb: bool,

    /// The value chain, newest first, as `(seqno, value)`
    pub values: Vec<(Option<SeqNo>, ValueData)>,
}

/// Everything one ingest job needs, filled by
/// [`Multiset::ingest_work_prepare`]
///
/// The slot is pre-sized at multiset creation, so preparing an ingest
/// never allocates on the write path. The work item owns a reference on
/// the multiset; dropping the item (or calling
/// [`IngestWork::complete`]) releases it.
pub struct IngestWork {
    kvms: Option<Arc<Multiset>>,
    ingest_order: u64,
    max_seqno: SeqNo,
    min_seqno: SeqNo,
    t_ingesting: Option<Instant>,
    usage: Usage,
    sources: Vec<C0KvsetIter>,
    lc_sources: Vec<Box<dyn IngestSource>>,
}

impl IngestWork {
    pub(crate) fn new_slot() -> Box<Self> {
        Box::new(Self {
            kvms: None,
            ingest_order: 0,
            max_seqno: 0,
            min_seqno: 0,
            t_ingesting: None,
            usage: Usage::default(),
            sources: Vec::new(),
            lc_sources: Vec::new(),
        })
    }

    /// Position of this ingest in the global ingest order.
    #[must_use]
    pub fn ingest_order(&self) -> u64 {
        self.ingest_order
    }

    /// Upper bound (inclusive) of the seqno window.
    #[must_use]
    pub fn max_seqno(&self) -> SeqNo {
        self.max_seqno
    }

    /// Lower bound of the seqno window.
    #[must_use]
    pub fn min_seqno(&self) -> SeqNo {
        self.min_seqno
    }

    /// Number of kv-set element sources collected (non-empty sets only).
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Number of late-commit sources appended.
    #[must_use]
    pub fn lc_source_count(&self) -> usize {
        self.lc_sources.len()
    }

    /// When the multiset was first flagged as ingesting, if it was.
    #[must_use]
    pub fn t_ingesting(&self) -> Option<Instant> {
        self.t_ingesting
    }

    /// Usage snapshot taken at hand-off.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The multiset under ingest.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn multiset(&self) -> &Arc<Multiset> {
        #[allow(clippy::expect_used)]
        self.kvms.as_ref().expect("work item is prepared")
    }

    /// Merges all collected sources into one `(skidx, key)`-ordered
    /// stream. Keys are unique per source; the ptomb source wins ties.
    pub fn merged(&mut self) -> MergedIngest<'_> {
        let mut heap = BinaryHeap::new();

        for (src, iter) in self.sources.iter_mut().enumerate() {
            if let Some(entry) = next_set_entry(iter) {
                heap.push(MergeSlot { entry, src });
            }
        }

        let lc_base = self.sources.len();
        for (i, lc) in self.lc_sources.iter_mut().enumerate() {
            if let Some(entry) = lc.next() {
                heap.push(MergeSlot {
                    entry,
                    src: lc_base + i,
                });
            }
        }

        MergedIngest { work: self, heap }
    }

    /// Marks the ingest complete and releases the work item's multiset
    /// reference.
    pub fn complete(mut self: Box<Self>) {
        if let Some(kvms) = self.kvms.take() {
            kvms.ingested();
            log::debug!(
                "ingest order={} window=[{}, {}] complete",
                self.ingest_order,
                self.min_seqno,
                self.max_seqno,
            );
            Multiset::putref(&kvms);
        }
    }
}

impl Drop for IngestWork {
    fn drop(&mut self) {
        // An abandoned (never completed) work item still owes its
        // multiset reference back
        self.sources.clear();
        if let Some(kvms) = self.kvms.take() {
            Multiset::putref(&kvms);
        }
    }
}

impl Multiset {
    /// Fills the pre-sized ingest work item: registers the ingest order,
    /// latches the seqno window (bumping the layer's lower bound),
    /// collects one element source per non-empty kv-set (index 0 flagged
    /// as the ptomb source) and appends the late-commit buffer's sources
    /// for the window.
    ///
    /// Consecutive ingest orders therefore have non-overlapping seqno
    /// windows.
    ///
    /// # Panics
    ///
    /// Panics if called twice on one multiset, or before `finalize`.
    pub fn ingest_work_prepare(self: &Arc<Self>, c0sk: &dyn C0sk) -> Box<IngestWork> {
        #[allow(clippy::expect_used)]
        let mut work = self.take_ingest_work().expect("ingest work already taken");

        self.getref();
        work.kvms = Some(self.clone());

        work.ingest_order = c0sk.ingest_order_register();
        work.max_seqno = self.seqno_get();
        work.min_seqno = c0sk.min_seqno_get();
        c0sk.min_seqno_set(work.max_seqno);

        work.t_ingesting = self.t_ingesting();
        work.usage = self.usage();

        for i in 0..=self.width() {
            let set = self.get_set(i);
            if set.element_count() == 0 {
                continue;
            }

            // The element sources have no lifetime independent of the
            // iterators; they ride along inside the work item
            work.sources.push(set.iterator(IterFlags {
                reverse: false,
                index: None,
                ptomb: i == 0,
            }));
        }

        if let Some(lc) = c0sk.lc() {
            work.lc_sources = lc.ingest_sources(work.min_seqno, work.max_seqno);
        }

        log::debug!(
            "prepared ingest order={} window=[{}, {}] sources={} lc={}",
            work.ingest_order,
            work.min_seqno,
            work.max_seqno,
            work.sources.len(),
            work.lc_sources.len(),
        );

        work
    }
}

struct MergeSlot {
    entry: IngestEntry,
    src: usize,
}

impl Eq for MergeSlot {}

impl PartialEq for MergeSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Ord for MergeSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse for ascending (skidx, key),
        // ties broken toward the lower source index (the ptomb source)
        (self.entry.skidx, &self.entry.key, self.src)
            .cmp(&(other.entry.skidx, &other.entry.key, other.src))
            .reverse()
    }
}

impl PartialOrd for MergeSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn next_set_entry(iter: &mut C0KvsetIter) -> Option<IngestEntry> {
    let element = iter.pop()?;

    Some(IngestEntry {
        skidx: element.skidx(),
        key: element.key(),
        ptomb: element.is_ptomb(),
        values: element.values(),
    })
}

/// A `(skidx, key)`-ordered merge over an ingest's sources
pub struct MergedIngest<'a> {
    work: &'a mut IngestWork,
    heap: BinaryHeap<MergeSlot>,
}

impl Iterator for MergedIngest<'_> {
    type Item = IngestEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.heap.pop()?;

        let lc_base = self.work.sources.len();
        let refill = if slot.src < lc_base {
            self.work
                .sources
                .get_mut(slot.src)
                .and_then(next_set_entry)
        } else {
            self.work
                .lc_sources
                .get_mut(slot.src - lc_base)
                .and_then(|lc| lc.next())
        };

        if let Some(entry) = refill {
            self.heap.push(MergeSlot {
                entry,
                src: slot.src,
            });
        }

        Some(slot.entry)
    }
}
