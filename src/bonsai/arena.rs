// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CHUNK_SZ: usize = 64 * 1_024;

/// A bounded, chunked bump allocator
///
/// Allocations are pointer-stable for the lifetime of the arena and are
/// never individually freed; the chunks are reclaimed wholesale on drop.
/// Past the byte budget, allocation fails and the caller surfaces
/// [`Error::OutOfMemory`].
///
/// Allocation is serialized by the owning tree's writer lock; `used` and
/// `avail` may be sampled from any thread.
pub(crate) struct Arena {
    budget: usize,
    used: AtomicUsize,
    chunks: Mutex<Vec<Chunk>>,
}

struct Chunk {
    buf: Box<[u8]>,
    offset: usize,
}

impl Chunk {
    fn try_new(size: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
        buf.resize(size, 0u8);

        Ok(Self {
            buf: buf.into_boxed_slice(),
            offset: 0,
        })
    }

    fn try_alloc(&mut self, layout: Layout) -> Option<(NonNull<u8>, usize)> {
        let base = self.buf.as_mut_ptr();

        // SAFETY: offset <= buf.len(), so the pointer stays inside (or one
        // past) the allocation.
        let free_start = unsafe { base.add(self.offset) };
        let pad = free_start.align_offset(layout.align());

        let new_offset = self.offset.checked_add(pad)?.checked_add(layout.size())?;
        if new_offset > self.buf.len() {
            return None;
        }

        let taken = new_offset - self.offset;
        self.offset = new_offset;

        // SAFETY: in-bounds by the check above
        let ptr = unsafe { free_start.add(pad) };

        Some((NonNull::new(ptr)?, taken))
    }
}

impl Arena {
    /// Creates an arena with the given byte budget, eagerly reserving the
    /// first chunk so creation fails early on memory pressure.
    pub(crate) fn new(budget: usize) -> Result<Self> {
        let first = Chunk::try_new(CHUNK_SZ.min(budget))?;

        Ok(Self {
            budget,
            used: AtomicUsize::new(0),
            chunks: Mutex::new(vec![first]),
        })
    }

    /// Bytes handed out so far (including alignment padding and charges).
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes left before the budget is exhausted.
    pub(crate) fn avail(&self) -> usize {
        self.budget.saturating_sub(self.used())
    }

    /// Charges `bytes` against the budget without handing out memory.
    ///
    /// Used to account for sidecar allocations (seqno-slot pool, ingest
    /// work) that the multiset owns on this set's behalf.
    pub(crate) fn charge(&self, bytes: usize) -> Result<()> {
        if self.used().checked_add(bytes).is_none_or(|n| n > self.budget) {
            return Err(Error::OutOfMemory);
        }
        self.used.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Allocates zeroed memory for `layout`.
    pub(crate) fn alloc_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
        #[allow(clippy::expect_used)]
        let mut chunks = self.chunks.lock().expect("lock poisoned");

        let remaining = self.budget.saturating_sub(self.used.load(Ordering::Acquire));
        if layout.size().saturating_add(layout.align()) > remaining {
            return None;
        }

        if let Some((ptr, taken)) = chunks.last_mut().and_then(|c| c.try_alloc(layout)) {
            self.used.fetch_add(taken, Ordering::AcqRel);
            return Some(ptr);
        }

        let chunk_sz = CHUNK_SZ
            .max(layout.size() + layout.align())
            .min(remaining);
        let mut chunk = Chunk::try_new(chunk_sz).ok()?;

        let (ptr, taken) = chunk.try_alloc(layout)?;
        self.used.fetch_add(taken, Ordering::AcqRel);
        chunks.push(chunk);

        Some(ptr)
    }

    /// Moves `value` into the arena and returns its stable address.
    pub(crate) fn alloc_value<T>(&self, value: T) -> Option<NonNull<T>> {
        let ptr = self.alloc_layout(Layout::new::<T>())?.cast::<T>();

        // SAFETY: freshly allocated, aligned for T, exclusively ours
        unsafe { ptr.as_ptr().write(value) };

        Some(ptr)
    }
}
