// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use std::cmp::Ordering;

/// Maximum user key length in bytes
pub const KEY_LEN_MAX: usize = 1_344;

/// Number of key bytes inlined into a [`KeyImmediate`]
///
/// The table index occupies the first two bytes of the inline window, so a
/// key immediate discriminates keys that differ anywhere in their first
/// `KI_DLEN_MAX` bytes without touching the out-of-line key.
pub const KI_DLEN_MAX: usize = 22;

const KI_WINDOW: usize = 2 + KI_DLEN_MAX;

/// A packed, fixed-size key header
///
/// Holds the table index (skidx), the declared key length and the first
/// [`KI_DLEN_MAX`] key bytes, laid out so that comparing two key immediates
/// byte-wise is equivalent to a byte-lexicographic comparison of
/// `(skidx ‖ key)` over the inline window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyImmediate {
    window: [u8; KI_WINDOW],
    klen: u16,
}

impl KeyImmediate {
    /// Builds the key immediate for `key` in table `skidx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the key is empty or longer than
    /// [`KEY_LEN_MAX`].
    pub fn new(skidx: u16, key: &[u8]) -> Result<Self> {
        if key.is_empty() || key.len() > KEY_LEN_MAX {
            return Err(Error::InvalidArgument);
        }

        let mut window = [0u8; KI_WINDOW];
        window[0..2].copy_from_slice(&skidx.to_be_bytes());

        let dlen = key.len().min(KI_DLEN_MAX);

        // NOTE: Cannot panic, dlen <= KI_DLEN_MAX
        #[allow(clippy::indexing_slicing)]
        window[2..(2 + dlen)].copy_from_slice(&key[0..dlen]);

        // NOTE: klen fits, KEY_LEN_MAX < u16::MAX
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            window,
            klen: key.len() as u16,
        })
    }

    /// Returns the table index this key belongs to.
    #[must_use]
    pub fn skidx(&self) -> u16 {
        u16::from_be_bytes([self.window[0], self.window[1]])
    }

    /// Returns the declared key length.
    #[must_use]
    pub fn klen(&self) -> usize {
        usize::from(self.klen)
    }

    /// Returns the first 8 bytes of (skidx ‖ key) as a big-endian word.
    ///
    /// Two weights order the same way the corresponding windows do, which
    /// makes the weight a branch-free first-level comparison during tree
    /// descent.
    #[must_use]
    pub fn weight(&self) -> u64 {
        u64::from_be_bytes([
            self.window[0],
            self.window[1],
            self.window[2],
            self.window[3],
            self.window[4],
            self.window[5],
            self.window[6],
            self.window[7],
        ])
    }

    /// Compares two key immediates over the inline window only.
    ///
    /// `Ordering::Equal` means the inline window cannot discriminate the
    /// keys; callers must fall back to [`key_full_cmp`].
    #[must_use]
    pub fn cmp_window(&self, other: &Self) -> Ordering {
        self.window.cmp(&other.window)
    }
}

/// Compares two keys the way the sorted chain orders them: by
/// `(skidx ‖ key bytes)`, byte-lexicographic.
///
/// Uses the immediates to short-circuit; falls back to the full key bytes
/// only when both keys agree over the inline window.
#[must_use]
pub fn key_full_cmp(
    a_imm: &KeyImmediate,
    a_key: &[u8],
    b_imm: &KeyImmediate,
    b_key: &[u8],
) -> Ordering {
    match a_imm.cmp_window(b_imm) {
        Ordering::Equal => {
            if a_imm.klen() <= KI_DLEN_MAX && b_imm.klen() <= KI_DLEN_MAX {
                // Window equality saw every byte of both keys
                a_imm.klen().cmp(&b_imm.klen())
            } else {
                a_key.cmp(b_key)
            }
        }
        ord => ord,
    }
}

/// Length of the longest common prefix of two keys.
#[must_use]
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn cmp_reference(a_skidx: u16, a: &[u8], b_skidx: u16, b: &[u8]) -> Ordering {
        let mut ka = a_skidx.to_be_bytes().to_vec();
        ka.extend_from_slice(a);
        let mut kb = b_skidx.to_be_bytes().to_vec();
        kb.extend_from_slice(b);
        ka.cmp(&kb)
    }

    fn check(a_skidx: u16, a: &[u8], b_skidx: u16, b: &[u8]) {
        let ia = KeyImmediate::new(a_skidx, a).unwrap();
        let ib = KeyImmediate::new(b_skidx, b).unwrap();
        assert_eq!(
            cmp_reference(a_skidx, a, b_skidx, b),
            key_full_cmp(&ia, a, &ib, b),
            "{a_skidx}:{a:?} vs {b_skidx}:{b:?}",
        );
    }

    #[test]
    fn ki_rejects_bad_keys() {
        assert_eq!(Err(Error::InvalidArgument), KeyImmediate::new(0, b""));
        assert_eq!(
            Err(Error::InvalidArgument),
            KeyImmediate::new(0, &vec![0u8; KEY_LEN_MAX + 1]),
        );
        assert!(KeyImmediate::new(0, &vec![0u8; KEY_LEN_MAX]).is_ok());
    }

    #[test]
    fn ki_fields() {
        let ki = KeyImmediate::new(0x1234, b"hello").unwrap();
        assert_eq!(0x1234, ki.skidx());
        assert_eq!(5, ki.klen());
    }

    #[test]
    fn ki_skidx_dominates() {
        check(1, b"zzz", 2, b"aaa");
        check(2, b"aaa", 1, b"zzz");
    }

    #[test]
    fn ki_prefix_keys() {
        check(7, b"ab", 7, b"ab1234");
        check(7, b"ab1234", 7, b"ab");
        check(7, b"ab", 7, b"ab");
    }

    #[test]
    fn ki_embedded_zero_bytes() {
        check(0, b"a", 0, b"a\x00");
        check(0, b"a\x00", 0, b"a\x01");
        check(0, b"a\x00\x00", 0, b"a\x00");
    }

    // Edge-condition bytes of identical runs at varying lengths, the
    // combinations most likely to upset the inline-window comparison.
    #[test]
    fn ki_weight_edge_bytes() {
        let edge = [0u8, 1, 2, 127, 128, 129, 253, 254, 255];
        let max_len = 37;

        for &ab in &edge {
            for &bb in &edge {
                for alen in 1..max_len {
                    for blen in 1..max_len {
                        let a = vec![ab; alen];
                        let b = vec![bb; blen];
                        check(3, &a, 3, &b);
                    }
                }
            }
        }
    }

    #[test]
    fn ki_long_keys_fall_back() {
        let mut a = vec![9u8; KI_DLEN_MAX];
        let mut b = a.clone();
        a.push(1);
        b.push(2);
        check(0, &a, 0, &b);
        check(0, &b, 0, &a);
    }

    #[test]
    fn weight_orders_like_window() {
        let a = KeyImmediate::new(1, b"abcdef").unwrap();
        let b = KeyImmediate::new(1, b"abcdeg").unwrap();
        assert!(a.weight() < b.weight());

        // Keys that only differ past the weight word share a weight
        let c = KeyImmediate::new(1, b"abcdefgh").unwrap();
        let d = KeyImmediate::new(1, b"abcdefzz").unwrap();
        assert_eq!(c.weight(), d.weight());
        assert!(c.cmp_window(&d).is_lt());
    }

    #[test]
    fn common_prefix() {
        assert_eq!(2, common_prefix_len(b"abc", b"abd"));
        assert_eq!(3, common_prefix_len(b"abc", b"abc"));
        assert_eq!(0, common_prefix_len(b"x", b"y"));
        assert_eq!(1, common_prefix_len(b"a", b"abc"));
    }
}
