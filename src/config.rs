// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Minimum number of ordinary kv-sets per multiset
pub const INGEST_WIDTH_MIN: usize = 2;

/// Maximum number of ordinary kv-sets per multiset
pub const INGEST_WIDTH_MAX: usize = 32;

/// Minimum per-set slab size in bytes
pub const SLAB_SZ_MIN: usize = 128 * 1_024;

/// Multiset configuration builder
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of ordinary kv-sets per multiset
    ///
    /// Clamped to `[INGEST_WIDTH_MIN, INGEST_WIDTH_MAX]`.
    pub ingest_width: usize,

    /// Per-set slab size in bytes
    pub slab_sz: usize,

    /// Seqno-slot (c0snr) pool size
    pub c0snr_max: usize,

    /// Container prefix length: the number of key prefix bytes at which
    /// prefix tombstones operate
    ///
    /// 0 disables prefix tombstones.
    pub pfx_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest_width: 16,
            slab_sz: /* 4 MiB */ 4 * 1_024 * 1_024,
            c0snr_max: 8_192,
            pfx_len: 0,
        }
    }
}

impl Config {
    /// Initializes a new config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of ordinary kv-sets per multiset.
    ///
    /// The effective width is clamped to
    /// `[INGEST_WIDTH_MIN, INGEST_WIDTH_MAX]`.
    ///
    /// Default = 16
    #[must_use]
    pub fn ingest_width(mut self, n: usize) -> Self {
        self.ingest_width = n;
        self
    }

    /// Sets the per-set slab size.
    ///
    /// Default = 4 MiB
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than [`SLAB_SZ_MIN`].
    #[must_use]
    pub fn slab_sz(mut self, n: usize) -> Self {
        assert!(n >= SLAB_SZ_MIN, "slab size too small");

        self.slab_sz = n;
        self
    }

    /// Sets the seqno-slot pool size.
    ///
    /// Default = 8192
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn c0snr_max(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.c0snr_max = n;
        self
    }

    /// Sets the container prefix length (0 disables prefix tombstones).
    ///
    /// Default = 0
    #[must_use]
    pub fn pfx_len(mut self, n: usize) -> Self {
        self.pfx_len = n;
        self
    }

    pub(crate) fn clamped_width(&self) -> usize {
        self.ingest_width
            .clamp(INGEST_WIDTH_MIN, INGEST_WIDTH_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn width_clamp() {
        assert_eq!(INGEST_WIDTH_MIN, Config::new().ingest_width(0).clamped_width());
        assert_eq!(
            INGEST_WIDTH_MAX,
            Config::new().ingest_width(1_000).clamped_width(),
        );
        assert_eq!(4, Config::new().ingest_width(4).clamped_width());
    }

    #[test]
    #[should_panic = "slab size too small"]
    fn slab_too_small() {
        let _ = Config::new().slab_sz(1);
    }
}
