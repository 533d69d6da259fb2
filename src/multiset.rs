// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::{Config, INGEST_WIDTH_MAX, SLAB_SZ_MIN};
use crate::hash::key_hash64;
use crate::ingest::IngestWork;
use crate::kvset::{C0Kvset, Lookup, ProbeResult, Usage};
use crate::seqref::{SeqNo, SeqnoCounter, SeqnoRef, SeqnoSlot, SEQNO_INVALID};
use crate::workqueue::WorkSender;
use crate::{Error, IorCode, Result, UserValue};
use std::cell::Cell;
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Aliased routing table size: twice the maximum width (so any
/// `hash % (2 * INGEST_WIDTH_MAX)` is a valid slot) plus the ptomb set
const SETS_LEN: usize = INGEST_WIDTH_MAX * 2 + 1;

/// Process-wide multiset generation counter
static KVMS_GEN: AtomicU64 = AtomicU64::new(0);

/// Seeds the generation counter during recovery, so every multiset
/// created afterwards is strictly newer than anything replayed.
pub fn gen_init(gen: u64) {
    KVMS_GEN.store(gen, Release);
}

/// Current value of the process-wide generation counter.
#[must_use]
pub fn gen_current() -> u64 {
    KVMS_GEN.load(Acquire)
}

/// A fixed-width bank of kv-sets absorbing all writes to one key-value
/// space
///
/// Index 0 is reserved for prefix tombstones; ordinary keys are routed to
/// the remaining sets by key hash. The multiset is the unit of rotation
/// and ingest: it is frozen as a whole, handed to the ingest pipeline as
/// a whole, and destroyed as a whole once the last reference drops.
pub struct Multiset {
    gen: AtomicU64,
    seqno: AtomicU64,
    rsvd_sn: AtomicU64,
    ctime: Instant,

    ingesting: AtomicU32,
    ingested: AtomicBool,
    finalized: AtomicBool,
    refcnt: AtomicU32,
    used_cache: AtomicUsize,
    t_ingesting: Mutex<Option<Instant>>,

    txn_thresh_lo: usize,
    txn_thresh_hi: usize,
    pfx_len: usize,

    snr_cursor: AtomicUsize,
    snr_pool: Box<[Arc<SeqnoSlot>]>,

    ingest_work: Mutex<Option<Box<IngestWork>>>,
    wq: OnceLock<WorkSender>,

    kvdb_seq: SeqnoCounter,

    /// Effective number of ordinary sets
    width: usize,

    /// `sets[0]` is the ptomb set; slots `[1..SETS_LEN)` alias the
    /// ordinary sets cyclically
    sets: Vec<Arc<C0Kvset>>,
}

impl Multiset {
    /// Creates a multiset per `cfg`.
    ///
    /// The requested width is clamped; if allocation fails beyond half the
    /// clamped width, the multiset is created narrower (surfaced via
    /// [`Multiset::width`] and a warning), otherwise creation fails.
    pub fn create(cfg: &Config, kvdb_seq: SeqnoCounter) -> Result<Arc<Self>> {
        let requested = cfg.clamped_width();

        let snr_bytes = cfg.c0snr_max * std::mem::size_of::<SeqnoSlot>();
        let iw_bytes = std::mem::size_of::<IngestWork>();

        // The ptomb set is deliberately smaller, but it also donates space
        // for the seqno-slot pool and the ingest-work slot
        let ptomb_sz = (SLAB_SZ_MIN * 2 + snr_bytes + iw_bytes).max(cfg.slab_sz);

        let mut created: Vec<Arc<C0Kvset>> = Vec::with_capacity(requested + 1);

        for i in 0..=requested {
            let slab_sz = if i == 0 { ptomb_sz } else { cfg.slab_sz };

            match C0Kvset::new(slab_sz) {
                Ok(set) => created.push(Arc::new(set)),
                Err(e) => {
                    if i > requested / 2 {
                        break;
                    }
                    return Err(e);
                }
            }
        }

        let width = created.len() - 1;
        if width < requested {
            log::warn!("multiset created narrower than requested: {width} < {requested}");
        }

        #[allow(clippy::expect_used)]
        let ptomb_set = created.first().expect("ptomb set exists").clone();
        ptomb_set.charge(snr_bytes)?;
        ptomb_set.charge(iw_bytes)?;

        let mut sets = Vec::with_capacity(SETS_LEN);
        sets.push(ptomb_set);
        for slot in 1..SETS_LEN {
            #[allow(clippy::indexing_slicing)]
            sets.push(created[1 + ((slot - 1) % width)].clone());
        }

        let snr_pool: Box<[Arc<SeqnoSlot>]> = (0..cfg.c0snr_max)
            .map(|_| Arc::new(SeqnoSlot::unresolved()))
            .collect();

        let kvms_sz = width * cfg.slab_sz;

        let kvms = Arc::new(Self {
            gen: AtomicU64::new(0),
            seqno: AtomicU64::new(SEQNO_INVALID),
            rsvd_sn: AtomicU64::new(SEQNO_INVALID),
            ctime: Instant::now(),
            ingesting: AtomicU32::new(0),
            ingested: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            refcnt: AtomicU32::new(1), // birth reference
            used_cache: AtomicUsize::new(0),
            t_ingesting: Mutex::new(None),
            txn_thresh_lo: kvms_sz >> 4,
            txn_thresh_hi: kvms_sz >> 2,
            pfx_len: cfg.pfx_len,
            snr_cursor: AtomicUsize::new(0),
            snr_pool,
            ingest_work: Mutex::new(Some(IngestWork::new_slot())),
            wq: OnceLock::new(),
            kvdb_seq,
            width,
            sets,
        });

        log::debug!("created multiset width={width}");

        Ok(kvms)
    }

    // --- routing --------------------------------------------------------

    /// The reserved prefix-tombstone set.
    #[must_use]
    pub fn ptomb_set(&self) -> &Arc<C0Kvset> {
        #[allow(clippy::indexing_slicing)]
        &self.sets[0]
    }

    /// The ordinary set a key hash routes to.
    #[must_use]
    pub fn hashed_set(&self, hash: u64) -> &Arc<C0Kvset> {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hash % (INGEST_WIDTH_MAX as u64 * 2)) as usize;

        // Slots above the effective width alias the real sets, so any
        // in-range modulus lands on a valid set
        #[allow(clippy::indexing_slicing)]
        &self.sets[idx + 1]
    }

    /// Direct per-index access; `0` is the ptomb set.
    #[must_use]
    pub fn get_set(&self, index: usize) -> &Arc<C0Kvset> {
        assert!(index <= self.width);

        #[allow(clippy::indexing_slicing)]
        &self.sets[index]
    }

    /// Effective number of ordinary sets.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Routing hash for a key: when prefix tombstones are enabled, keys
    /// hash by their container prefix so a prefix and the keys under it
    /// land in the same set.
    #[must_use]
    pub fn route_hash(&self, skidx: u16, key: &[u8]) -> u64 {
        if self.pfx_len > 0 && key.len() >= self.pfx_len {
            #[allow(clippy::indexing_slicing)]
            key_hash64(skidx, &key[0..self.pfx_len])
        } else {
            key_hash64(skidx, key)
        }
    }

    /// Container prefix length (0 = prefix tombstones disabled).
    #[must_use]
    pub fn pfx_len(&self) -> usize {
        self.pfx_len
    }

    // --- write path -----------------------------------------------------

    /// Stores a value, routed by key hash.
    pub fn put(&self, skidx: u16, key: &[u8], value: UserValue, seqref: SeqnoRef) -> Result<IorCode> {
        self.hashed_set(self.route_hash(skidx, key))
            .put(skidx, key, value, seqref)
    }

    /// Writes a tombstone, routed by key hash.
    pub fn del(&self, skidx: u16, key: &[u8], seqref: SeqnoRef) -> Result<IorCode> {
        self.hashed_set(self.route_hash(skidx, key))
            .del(skidx, key, seqref)
    }

    /// Writes a prefix tombstone into the reserved set.
    pub fn prefix_del(&self, skidx: u16, pfx: &[u8], seqref: SeqnoRef) -> Result<IorCode> {
        self.ptomb_set().prefix_del(skidx, pfx, seqref)
    }

    // --- read path ------------------------------------------------------

    /// Point read, combining the hashed set's chain with any covering
    /// prefix tombstone.
    #[must_use]
    pub fn get(
        &self,
        skidx: u16,
        key: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
    ) -> Lookup {
        let result = self
            .hashed_set(self.route_hash(skidx, key))
            .get(skidx, key, view_seqno, seqref);

        let Some(pt_seqno) = self.covering_ptomb(skidx, key, view_seqno, seqref) else {
            return result;
        };

        match result {
            Lookup::Found(view) if view.seqno.is_none_or(|s| s <= pt_seqno) => {
                Lookup::Tombstone(Some(pt_seqno))
            }
            Lookup::Tombstone(seqno) if seqno.is_none_or(|s| s <= pt_seqno) => {
                Lookup::Tombstone(Some(pt_seqno))
            }
            other => other,
        }
    }

    /// Prefix probe inside an RCU read-side section (the common case).
    #[must_use]
    pub fn pfx_probe_rcu(
        &self,
        skidx: u16,
        pfx: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
        max_seen: u32,
    ) -> ProbeResult {
        let pt_seqno = self.covering_ptomb(skidx, pfx, view_seqno, seqref);

        self.hashed_set(self.route_hash(skidx, pfx))
            .prefix_probe(skidx, pfx, view_seqno, seqref, max_seen, pt_seqno)
    }

    /// Prefix probe against a frozen multiset.
    #[must_use]
    pub fn pfx_probe_excl(
        &self,
        skidx: u16,
        pfx: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
        max_seen: u32,
    ) -> ProbeResult {
        assert!(self.is_finalized(), "exclusive probe on a live multiset");
        self.pfx_probe_rcu(skidx, pfx, view_seqno, seqref, max_seen)
    }

    fn covering_ptomb(
        &self,
        skidx: u16,
        key: &[u8],
        view_seqno: SeqNo,
        seqref: Option<&SeqnoRef>,
    ) -> Option<SeqNo> {
        if self.pfx_len == 0 || key.len() < self.pfx_len {
            return None;
        }

        #[allow(clippy::indexing_slicing)]
        self.ptomb_set()
            .ptomb_get(skidx, &key[0..self.pfx_len], view_seqno, seqref)
    }

    // --- seqnos ---------------------------------------------------------

    /// Publishes the active sequence number.
    pub fn seqno_set(&self, seqno: SeqNo) {
        self.seqno.store(seqno, Release);
    }

    /// Reads the active sequence number.
    #[must_use]
    pub fn seqno_get(&self) -> SeqNo {
        self.seqno.load(Acquire)
    }

    /// Sets the reserved seqno. Transitions exactly once from INVALID.
    pub fn rsvd_sn_set(&self, seqno: SeqNo) {
        let prev = self
            .rsvd_sn
            .compare_exchange(SEQNO_INVALID, seqno, AcqRel, Acquire);
        assert!(prev.is_ok(), "reserved seqno set twice");
    }

    /// Reads the reserved seqno ([`SEQNO_INVALID`] until set).
    #[must_use]
    pub fn rsvd_sn_get(&self) -> SeqNo {
        self.rsvd_sn.load(Acquire)
    }

    /// The kvdb-wide seqno counter this multiset was bound to.
    #[must_use]
    pub fn kvdb_seq(&self) -> &SeqnoCounter {
        &self.kvdb_seq
    }

    // --- generation -----------------------------------------------------

    /// Assigns this multiset the next process-wide generation.
    pub fn gen_update(&self) -> u64 {
        let gen = KVMS_GEN.fetch_add(1, AcqRel) + 1;
        self.gen.store(gen, Release);
        gen
    }

    /// This multiset's generation.
    #[must_use]
    pub fn gen_read(&self) -> u64 {
        self.gen.load(Acquire)
    }

    /// Creation instant.
    #[must_use]
    pub fn ctime(&self) -> Instant {
        self.ctime
    }

    // --- ingestion lifecycle --------------------------------------------

    /// Flags the multiset as being ingested. Idempotent; the first call
    /// is timestamped for ingest latency accounting.
    pub fn ingesting(&self) {
        if self.ingesting.fetch_add(1, AcqRel) == 0 {
            #[allow(clippy::expect_used)]
            let mut t = self.t_ingesting.lock().expect("lock poisoned");
            *t = Some(Instant::now());
        }
    }

    /// Cheap sampled read of the ingesting flag.
    #[must_use]
    pub fn is_ingesting(&self) -> bool {
        self.ingesting.load(Acquire) > 0
    }

    pub(crate) fn t_ingesting(&self) -> Option<Instant> {
        #[allow(clippy::expect_used)]
        *self.t_ingesting.lock().expect("lock poisoned")
    }

    /// Freezes every kv-set and stores the queue that will carry the
    /// deferred destruction.
    pub fn finalize(&self, wq: &crate::WorkQueue) {
        self.finalized.store(true, Release);

        for i in 0..=self.width {
            self.get_set(i).finalize();
        }

        let _ = self.wq.set(wq.sender());
        self.used_cache.store(self.used(), Release);

        log::debug!("finalized multiset gen={}", self.gen_read());
    }

    /// `true` once frozen.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Acquire)
    }

    /// Marks ingest completion.
    pub fn ingested(&self) {
        self.ingested.store(true, Release);
    }

    /// `true` once ingest completed.
    #[must_use]
    pub fn is_ingested(&self) -> bool {
        self.ingested.load(Acquire)
    }

    pub(crate) fn take_ingest_work(&self) -> Option<Box<IngestWork>> {
        #[allow(clippy::expect_used)]
        self.ingest_work.lock().expect("lock poisoned").take()
    }

    // --- should-ingest heuristic ----------------------------------------

    /// Near-free sampled check for degenerate shapes: returns `true` when
    /// the multiset should be rotated out and ingested.
    ///
    /// 97% of calls return `false` after one PRNG draw. The rest sample
    /// half the ordinary sets and look for hot keys (values-per-key) and
    /// tall trees.
    #[must_use]
    pub fn should_ingest(&self) -> bool {
        const SCALER: u64 = 1 << 20;

        if self.is_ingesting() {
            return true;
        }

        let r = xrand64_tls();

        if (r % SCALER) < (97 * SCALER) / 100 {
            return false;
        }

        let mut sum_keyvals: u64 = 0;
        let mut sum_height: u64 = 0;
        let mut ndiv: u64 = 0;

        #[allow(clippy::cast_possible_truncation)]
        let mut idx = (r as usize % INGEST_WIDTH_MAX) + 1;
        let mut n = (self.width + 1) / 2;

        while n > 0 {
            #[allow(clippy::indexing_slicing)]
            let set = &self.sets[idx];
            let (count, height, keyvals) = set.element_count2();
            idx += 1;
            n -= 1;

            if count > 0 {
                if keyvals > 4_096 || height > 24 {
                    return true;
                }

                sum_keyvals += u64::from(keyvals);
                sum_height += u64::from(height);
                ndiv += 1;
            }
        }

        if ndiv == 0 {
            return false;
        }

        (sum_keyvals / 2_048) > ndiv || (sum_height / 22) > ndiv
    }

    // --- seqno-slot (c0snr) pool ----------------------------------------

    /// Hands out the next seqno slot, or `None` when the pool is
    /// exhausted (callers must rotate to a new multiset).
    #[must_use]
    pub fn c0snr_alloc(&self) -> Option<Arc<SeqnoSlot>> {
        let cur = self.snr_cursor.fetch_add(1, AcqRel);

        if cur >= self.snr_pool.len() {
            return None;
        }

        #[allow(clippy::indexing_slicing)]
        Some(self.snr_pool[cur].clone())
    }

    /// Convenience for callers that want an error instead of an option.
    pub fn c0snr_alloc_or_err(&self) -> Result<Arc<SeqnoSlot>> {
        self.c0snr_alloc().ok_or(Error::Exhausted)
    }

    // --- usage ----------------------------------------------------------

    /// Transaction merge thresholds `(lo, hi)`.
    #[must_use]
    pub fn thresholds_get(&self) -> (usize, usize) {
        (self.txn_thresh_lo, self.txn_thresh_hi)
    }

    /// Total unique keys across all sets.
    #[must_use]
    pub fn get_element_count(&self) -> usize {
        (0..=self.width)
            .map(|i| self.get_set(i).element_count())
            .sum()
    }

    /// Slab bytes consumed by the ordinary sets (excludes the ptomb set).
    #[must_use]
    pub fn used(&self) -> usize {
        (1..=self.width).map(|i| self.get_set(i).used()).sum()
    }

    /// Slab bytes remaining in the ordinary sets (excludes the ptomb set).
    #[must_use]
    pub fn avail(&self) -> usize {
        (1..=self.width).map(|i| self.get_set(i).avail()).sum()
    }

    /// Usage snapshot cached at finalize time.
    #[must_use]
    pub fn used_get(&self) -> usize {
        self.used_cache.load(Acquire)
    }

    /// Overrides the cached usage snapshot.
    pub fn used_set(&self, used: usize) {
        self.used_cache.store(used, Release);
    }

    /// Aggregated accounting across all sets.
    ///
    /// The ptomb set contributes key and tombstone counts but not slab
    /// accounting.
    #[must_use]
    pub fn usage(&self) -> Usage {
        let mut usage = Usage {
            used_min: usize::MAX,
            ..Usage::default()
        };

        for i in 0..=self.width {
            let u = self.get_set(i).usage();

            usage.keys += u.keys;
            usage.tombs += u.tombs;
            usage.key_bytes += u.key_bytes;
            usage.val_bytes += u.val_bytes;

            if i == 0 {
                continue;
            }

            usage.alloc += u.alloc;
            usage.free += u.free;
            usage.used_max = usage.used_max.max(u.used_max);
            usage.used_min = usage.used_min.min(u.used_min);
        }

        #[allow(clippy::cast_possible_truncation)]
        {
            usage.count = self.width as u32 + 1;
        }

        usage
    }

    // --- reference count ------------------------------------------------

    /// Takes a reference. The caller must already hold one.
    pub fn getref(&self) {
        let prev = self.refcnt.fetch_add(1, AcqRel);
        assert!(prev > 0, "getref on a dead multiset");
    }

    /// Drops a reference. On the last drop, destruction is posted to the
    /// workqueue stored at finalize time, or performed inline when no
    /// queue was ever attached.
    pub fn putref(this: &Arc<Self>) {
        let prev = this.refcnt.fetch_sub(1, AcqRel);
        assert!(prev > 0, "multiset refcount underflow");

        if prev != 1 {
            return;
        }

        if let Some(wq) = this.wq.get() {
            let kvms = this.clone();
            wq.queue(move || kvms.destroy());
        } else {
            this.destroy();
        }
    }

    /// Current reference count.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Acquire)
    }

    fn destroy(&self) {
        assert_eq!(0, self.refcnt(), "destroy with live references");

        // Cancel the seqno slots handed out so the transaction manager
        // sees them disappear
        let handed_out = self.snr_cursor.load(Acquire).min(self.snr_pool.len());

        #[allow(clippy::indexing_slicing)]
        for slot in &self.snr_pool[0..handed_out] {
            slot.dropref();
        }

        log::debug!(
            "destroyed multiset gen={} keys={}",
            self.gen_read(),
            self.get_element_count(),
        );
    }
}

/// Thread-local xorshift64 PRNG
///
/// Seeded per thread from the slot's own address; the samples only need
/// to be uncorrelated across threads, not of cryptographic quality.
fn xrand64_tls() -> u64 {
    thread_local! {
        static STATE: Cell<u64> = const { Cell::new(0) };
    }

    STATE.with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = (std::ptr::from_ref(state) as usize as u64) | 1;
        }

        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;

        state.set(s);
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Slice;
    use test_log::test;

    fn cfg() -> Config {
        Config::new().ingest_width(4).slab_sz(SLAB_SZ_MIN)
    }

    fn kvms() -> Arc<Multiset> {
        Multiset::create(&cfg(), SeqnoCounter::default()).unwrap()
    }

    fn ord(seqno: SeqNo) -> SeqnoRef {
        SeqnoRef::Ordinal(seqno)
    }

    #[test]
    fn create_clamps_width() {
        let kvms = Multiset::create(
            &Config::new().ingest_width(1_000).slab_sz(SLAB_SZ_MIN),
            SeqnoCounter::default(),
        )
        .unwrap();
        assert_eq!(INGEST_WIDTH_MAX, kvms.width());
        Multiset::putref(&kvms);
    }

    #[test]
    fn hashed_slots_alias_real_sets() {
        let kvms = kvms();
        let w = kvms.width();

        for i in 0..w {
            let a = kvms.get_set(1 + i);
            let b = kvms.hashed_set((w + i) as u64);
            let c = kvms.hashed_set(i as u64);
            assert!(Arc::ptr_eq(c, a));
            assert!(Arc::ptr_eq(b, a));
        }

        // Any hash value lands on some ordinary set
        for hash in 0..(INGEST_WIDTH_MAX as u64 * 2 + 10) {
            let set = kvms.hashed_set(hash);
            assert!(!Arc::ptr_eq(set, kvms.ptomb_set()));
        }

        Multiset::putref(&kvms);
    }

    #[test]
    fn basic_put_get() {
        let kvms = kvms();

        kvms.put(2, b"alpha", Slice::from(b"1"), ord(3)).unwrap();

        match kvms.get(2, b"alpha", 5, None) {
            Lookup::Found(view) => {
                assert_eq!(crate::ValueData::Value(Slice::from(b"1")), view.data);
            }
            other => panic!("expected Found, got {other:?}"),
        }

        assert_eq!(Lookup::NotFound, kvms.get(2, b"alpha", 2, None));

        Multiset::putref(&kvms);
    }

    #[test]
    fn ptomb_shadows_older_values() {
        let kvms = Multiset::create(
            &Config::new().ingest_width(4).slab_sz(SLAB_SZ_MIN).pfx_len(2),
            SeqnoCounter::default(),
        )
        .unwrap();

        kvms.put(0, b"ab123", Slice::from(b"old"), ord(1)).unwrap();
        kvms.prefix_del(0, b"ab", ord(5)).unwrap();
        kvms.put(0, b"ab456", Slice::from(b"new"), ord(7)).unwrap();

        // Written before the ptomb: reads deleted
        assert_eq!(
            Lookup::Tombstone(Some(5)),
            kvms.get(0, b"ab123", 10, None)
        );

        // Written after the ptomb: survives
        match kvms.get(0, b"ab456", 10, None) {
            Lookup::Found(_) => {}
            other => panic!("expected Found, got {other:?}"),
        }

        // Before the ptomb's seqno, the old value is visible
        match kvms.get(0, b"ab123", 4, None) {
            Lookup::Found(_) => {}
            other => panic!("expected Found, got {other:?}"),
        }

        Multiset::putref(&kvms);
    }

    #[test]
    fn seqno_and_rsvd_sn() {
        let kvms = kvms();

        assert_eq!(SEQNO_INVALID, kvms.seqno_get());
        kvms.seqno_set(7);
        assert_eq!(7, kvms.seqno_get());

        assert_eq!(SEQNO_INVALID, kvms.rsvd_sn_get());
        kvms.rsvd_sn_set(3);
        assert_eq!(3, kvms.rsvd_sn_get());

        Multiset::putref(&kvms);
    }

    #[test]
    #[should_panic = "reserved seqno set twice"]
    fn rsvd_sn_is_one_shot() {
        let kvms = kvms();
        kvms.rsvd_sn_set(3);
        kvms.rsvd_sn_set(4);
    }

    #[test]
    fn generation_is_monotonic() {
        let a = kvms();
        let b = kvms();

        let ga = a.gen_update();
        let gb = b.gen_update();

        assert!(ga < gb);
        assert_eq!(ga, a.gen_read());
        assert_eq!(gb, b.gen_read());
        assert!(gen_current() >= gb);

        Multiset::putref(&a);
        Multiset::putref(&b);
    }

    #[test]
    fn ingesting_flag_and_timestamp() {
        let kvms = kvms();

        assert!(!kvms.is_ingesting());
        kvms.ingesting();
        assert!(kvms.is_ingesting());
        let t0 = kvms.t_ingesting().unwrap();

        // Idempotent: the first timestamp wins
        kvms.ingesting();
        assert_eq!(t0, kvms.t_ingesting().unwrap());

        Multiset::putref(&kvms);
    }

    #[test]
    fn should_ingest_lifecycle() {
        let kvms = kvms();

        // Not ingesting, empty: the sampled path never trips
        let mut any = false;
        for _ in 0..10_000 {
            any |= kvms.should_ingest();
        }
        assert!(!any);

        kvms.ingesting();
        assert!(kvms.should_ingest());

        Multiset::putref(&kvms);
    }

    #[test]
    fn should_ingest_detects_hot_keys() {
        let kvms = Multiset::create(
            &Config::new().ingest_width(4).slab_sz(1_024 * 1_024),
            SeqnoCounter::default(),
        )
        .unwrap();

        // Give every ordinary set a key with an oversized value chain
        for i in 0..kvms.width() {
            let set = kvms.get_set(1 + i);
            for seqno in 0..5_000u64 {
                set.put(0, b"hot", Slice::from(b""), ord(seqno)).unwrap();
            }
        }

        // 3% of draws reach the sampling path, which must now trip
        let mut any = false;
        for _ in 0..10_000 {
            any |= kvms.should_ingest();
        }
        assert!(any);

        Multiset::putref(&kvms);
    }

    #[test]
    fn c0snr_pool_exhaustion() {
        let kvms = Multiset::create(
            &Config::new().ingest_width(4).slab_sz(SLAB_SZ_MIN).c0snr_max(8),
            SeqnoCounter::default(),
        )
        .unwrap();

        for _ in 0..8 {
            assert!(kvms.c0snr_alloc().is_some());
        }
        assert!(kvms.c0snr_alloc().is_none());
        assert_eq!(Err(Error::Exhausted), kvms.c0snr_alloc_or_err().map(|_| ()));

        Multiset::putref(&kvms);
    }

    #[test]
    fn c0snr_slots_cancelled_on_destroy() {
        let kvms = Multiset::create(
            &Config::new().ingest_width(4).slab_sz(SLAB_SZ_MIN).c0snr_max(8),
            SeqnoCounter::default(),
        )
        .unwrap();

        let slot = kvms.c0snr_alloc().unwrap();
        slot.addref(); // the transaction's own reference
        assert_eq!(2, slot.refs());

        Multiset::putref(&kvms);

        // Destroy ran inline (no workqueue attached) and dropped the
        // pool's reference
        assert_eq!(1, slot.refs());
    }

    #[test]
    fn thresholds() {
        let kvms = kvms();
        let (lo, hi) = kvms.thresholds_get();
        let kvms_sz = kvms.width() * SLAB_SZ_MIN;
        assert_eq!(kvms_sz >> 4, lo);
        assert_eq!(kvms_sz >> 2, hi);
        Multiset::putref(&kvms);
    }

    #[test]
    fn usage_aggregates_across_sets() {
        let kvms = kvms();

        kvms.put(0, b"a", Slice::from(b"1"), ord(1)).unwrap();
        kvms.put(0, b"b", Slice::from(b"2"), ord(1)).unwrap();
        kvms.del(0, b"a", ord(2)).unwrap();

        let usage = kvms.usage();
        assert_eq!(2, usage.keys);
        assert_eq!(1, usage.tombs);
        assert_eq!(kvms.width() as u32 + 1, usage.count);
        assert_eq!(2, kvms.get_element_count());
        assert!(kvms.used() > 0);

        Multiset::putref(&kvms);
    }

    #[test]
    fn refcount_and_deferred_destroy() {
        let wq = crate::WorkQueue::new(1);
        let kvms = kvms();

        kvms.getref();
        assert_eq!(2, kvms.refcnt());

        kvms.finalize(&wq);
        assert!(kvms.is_finalized());
        assert!(kvms.get_set(0).is_finalized());

        let slot = kvms.c0snr_alloc().unwrap();

        Multiset::putref(&kvms);
        assert_eq!(1, kvms.refcnt());

        Multiset::putref(&kvms);

        // Destruction happens on the workqueue; drain it
        drop(wq);
        assert_eq!(0, slot.refs());
    }

    #[test]
    fn finalize_freezes_writes() {
        let wq = crate::WorkQueue::new(1);
        let kvms = kvms();

        kvms.put(0, b"a", Slice::from(b"1"), ord(1)).unwrap();
        kvms.finalize(&wq);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            kvms.put(0, b"b", Slice::from(b"2"), ord(2))
        }));

        // Debug builds assert; release builds surface Finalized
        match result {
            Ok(Ok(_)) => panic!("write accepted after finalize"),
            Ok(Err(e)) => assert_eq!(Error::Finalized, e),
            Err(_) => {}
        }

        Multiset::putref(&kvms);
    }
}
