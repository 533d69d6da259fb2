// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An in-memory write-staging index for LSM-style storage engines.
//!
//! ##### NOTE
//!
//! > This crate only provides the hot, in-memory half of a storage
//! > engine: the multiset bank that absorbs writes before they are
//! > flushed into on-disk storage. It does not ship a write-ahead log,
//! > so nothing is durable until the surrounding engine ingests a
//! > frozen multiset.
//!
//! ##### About
//!
//! Writes land in a [`Multiset`]: a fixed-width bank of single-writer /
//! many-reader balanced ordered maps ([`BonsaiTree`]), routed by key
//! hash, with one set reserved for prefix tombstones. Every key holds a
//! newest-first chain of versioned values ordered by seqno reference,
//! which is what makes MVCC point reads, probes and cursors possible
//! while writers keep appending.
//!
//! Readers never lock: trees publish structural changes by cloning the
//! touched path and swinging one pointer, and nothing a reader can see
//! is ever freed while the multiset lives.
//!
//! When a multiset grows past its thresholds (or its shape degrades, see
//! [`Multiset::should_ingest`]), the engine freezes it, hands it to the
//! ingest pipeline as a batch of ordered element sources, installs a
//! fresh multiset, and lets the frozen one be destroyed off the critical
//! path once the last reference drops.
//!
//! # Example usage
//!
//! ```
//! use c0_multiset::{Config, Lookup, Multiset, SeqnoCounter, SeqnoRef};
//!
//! let kvms = Multiset::create(&Config::new().ingest_width(4), SeqnoCounter::default())?;
//!
//! // Writes carry a table index (skidx) and a seqno reference
//! kvms.put(0, b"my_key", "my_value".into(), SeqnoRef::Ordinal(3))?;
//!
//! // Reads carry a view seqno; older views don't see newer writes
//! match kvms.get(0, b"my_key", 5, None) {
//!     Lookup::Found(_view) => { /* ... */ }
//!     _ => unreachable!("visible at seqno 5"),
//! }
//! assert_eq!(Lookup::NotFound, kvms.get(0, b"my_key", 2, None));
//!
//! // Deletes are tombstones, visible under the same MVCC rules
//! kvms.del(0, b"my_key", SeqnoRef::Ordinal(7))?;
//! assert!(matches!(kvms.get(0, b"my_key", 9, None), Lookup::Tombstone(_)));
//!
//! // Drop the birth reference; destruction is refcounted
//! c0_multiset::Multiset::putref(&kvms);
//! # Ok::<(), c0_multiset::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod bin_heap;

#[doc(hidden)]
pub mod bonsai;

mod config;
mod cursor;
mod error;

#[doc(hidden)]
pub mod hash;

mod ingest;
mod key;
mod kvset;
mod multiset;
mod seqref;
mod slice;
mod workqueue;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

pub use {
    bonsai::{
        BonsaiTree, C0IorPolicy, Entry, IorCode, IorPolicy, Placement, ValueChainCursor,
        ValueData, ValueView,
    },
    config::{Config, INGEST_WIDTH_MAX, INGEST_WIDTH_MIN, SLAB_SZ_MIN},
    cursor::{CursorEntry, MultisetCursor},
    error::{Error, Result},
    ingest::{C0sk, IngestEntry, IngestSource, IngestWork, LcBuffer, MergedIngest},
    key::{KeyImmediate, KEY_LEN_MAX, KI_DLEN_MAX},
    kvset::{C0Kvset, C0KvsetIter, Element, IterFlags, Lookup, ProbeResult, Usage},
    multiset::{gen_current, gen_init, Multiset},
    seqref::{SeqNo, SeqnoCounter, SeqnoRef, SeqnoSlot, SEQNO_INVALID},
    slice::Slice,
    workqueue::{WorkQueue, WorkSender},
};
