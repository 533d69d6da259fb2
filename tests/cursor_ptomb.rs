use c0_multiset::{Config, Multiset, MultisetCursor, SeqnoCounter, SeqnoRef, ValueData};
use test_log::test;

fn ord(seqno: u64) -> SeqnoRef {
    SeqnoRef::Ordinal(seqno)
}

// With a container prefix length of 2, a reverse cursor yields "ac",
// then the ptomb "ab" (marked), then whatever the reader elects to
// retain underneath it, in that order.
#[test]
fn reverse_cursor_surfaces_ptomb_before_covered_keys() {
    let kvms = Multiset::create(
        &Config::new()
            .ingest_width(4)
            .slab_sz(1_024 * 1_024)
            .pfx_len(2),
        SeqnoCounter::default(),
    )
    .unwrap();

    let skidx = 9;

    kvms.prefix_del(skidx, b"ab", ord(10)).unwrap();
    kvms.put(skidx, b"ab1234", "covered".into(), ord(5)).unwrap();
    kvms.put(skidx, b"ac", "kept".into(), ord(6)).unwrap();
    kvms.put(skidx, b"aa", "kept".into(), ord(7)).unwrap();

    let mut cursor = MultisetCursor::new(kvms.clone(), skidx, b"", 2, true, 100, None);

    let entries: Vec<_> =
        std::iter::from_fn(|| cursor.next().map(|e| (e.key.to_vec(), e.ptomb))).collect();

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

// A caller walking forward applies the marked ptomb to everything under
// its prefix with a lower seqno; values written after it survive.
#[test]
fn forward_walk_applies_ptomb_semantics() {
    let kvms = Multiset::create(
        &Config::new()
            .ingest_width(4)
            .slab_sz(1_024 * 1_024)
            .pfx_len(3),
        SeqnoCounter::default(),
    )
    .unwrap();

    kvms.put(0, b"usr-one", "old".into(), ord(1)).unwrap();
    kvms.put(0, b"usr-two", "old".into(), ord(2)).unwrap();
    kvms.prefix_del(0, b"usr", ord(5)).unwrap();
    kvms.put(0, b"usr-two", "new".into(), ord(8)).unwrap();

    let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 3, false, 100, None);

    // The caller's ptomb logic: remember the newest covering ptomb and
    // drop older entries beneath it
    let mut pt: Option<(Vec<u8>, u64)> = None;
    let mut survivors = Vec::new();

    while let Some(entry) = cursor.next() {
        if entry.ptomb {
            pt = Some((entry.key.to_vec(), entry.value.seqno.unwrap()));
            continue;
        }

        let covered = pt.as_ref().is_some_and(|(prefix, pt_seqno)| {
            entry.key.starts_with(prefix) && entry.value.seqno.unwrap_or(0) <= *pt_seqno
        });

        if !covered {
            survivors.push(entry.key.to_vec());
        }
    }

    assert_eq!(vec![b"usr-two".to_vec()], survivors);

    // The point-read path agrees with the cursor walk
    assert!(matches!(
        kvms.get(0, b"usr-one", 100, None),
        c0_multiset::Lookup::Tombstone(_)
    ));
    assert!(matches!(
        kvms.get(0, b"usr-two", 100, None),
        c0_multiset::Lookup::Found(_)
    ));

    drop(cursor);
    Multiset::putref(&kvms);
}

// Cursor update after new writes: the reloaded heap resumes from the
// current positions without replaying consumed keys.
#[test]
fn live_cursor_update_sees_new_data() {
    let kvms = Multiset::create(
        &Config::new().ingest_width(4).slab_sz(1_024 * 1_024),
        SeqnoCounter::default(),
    )
    .unwrap();

    for i in 0..10u32 {
        kvms.put(0, format!("a{i}").as_bytes(), "v".into(), ord(u64::from(i)))
            .unwrap();
    }

    let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 100, None);

    let mut seen = Vec::new();
    while let Some(entry) = cursor.next() {
        seen.push(entry.key.to_vec());
    }
    assert_eq!(10, seen.len());

    for i in 0..10u32 {
        kvms.put(0, format!("z{i}").as_bytes(), "v".into(), ord(100 + u64::from(i)))
            .unwrap();
    }

    assert!(cursor.update(0));

    while let Some(entry) = cursor.next() {
        seen.push(entry.key.to_vec());
    }
    assert_eq!(20, seen.len());

    let mut sorted = seen.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, seen, "cursor replayed or reordered keys");

    drop(cursor);
    Multiset::putref(&kvms);
}

// Tombstones flow through the cursor so the caller can merge them
// against older ingested data.
#[test]
fn cursor_yields_tombstones() {
    let kvms = Multiset::create(
        &Config::new().ingest_width(4).slab_sz(1_024 * 1_024),
        SeqnoCounter::default(),
    )
    .unwrap();

    kvms.put(0, b"a", "v".into(), ord(1)).unwrap();
    kvms.del(0, b"a", ord(2)).unwrap();
    kvms.put(0, b"b", "v".into(), ord(3)).unwrap();

    let mut cursor = MultisetCursor::new(kvms.clone(), 0, b"", 0, false, 100, None);

    let entry = cursor.next().unwrap();
    assert_eq!(b"a".as_slice(), &*entry.key);
    assert_eq!(ValueData::Tombstone, entry.value.data);

    let entry = cursor.next().unwrap();
    assert_eq!(b"b".as_slice(), &*entry.key);
    assert!(matches!(entry.value.data, ValueData::Value(_)));

    drop(cursor);
    Multiset::putref(&kvms);
}
