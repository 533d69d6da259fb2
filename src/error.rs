// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the write-staging index
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The slab allocator is exhausted
    ///
    /// No structural mutation was committed; the caller should rotate to a
    /// fresh multiset and retry there.
    OutOfMemory,

    /// Malformed key (empty or longer than [`KEY_LEN_MAX`](crate::KEY_LEN_MAX))
    InvalidArgument,

    /// The seqno-slot pool is full
    ///
    /// Transactions can no longer bind to this multiset; the caller should
    /// rotate to a fresh one.
    Exhausted,

    /// Write attempted against a finalized (frozen) tree
    Finalized,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C0MultisetError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
