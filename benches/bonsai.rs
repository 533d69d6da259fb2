use c0_multiset::{BonsaiTree, C0IorPolicy, SeqnoRef, ValueData};
use criterion::{criterion_group, criterion_main, Criterion};

const N: u64 = 100_000;

fn populated_tree() -> BonsaiTree {
    let tree = BonsaiTree::new(256 * 1_024 * 1_024, Box::new(C0IorPolicy)).unwrap();

    for i in 0..N {
        let key = i.to_be_bytes();
        tree.insert(
            0,
            &key,
            ValueData::Value(key.as_slice().into()),
            SeqnoRef::Ordinal(i),
        )
        .unwrap();
    }

    tree
}

fn bonsai_find(c: &mut Criterion) {
    c.bench_function("bonsai find", |b| {
        let tree = populated_tree();

        let mut i = 0u64;
        b.iter(|| {
            let key = (i % N).to_be_bytes();
            assert!(tree.find(0, &key).is_some());
            i += 1;
        });
    });
}

fn bonsai_find_ge(c: &mut Criterion) {
    c.bench_function("bonsai find_ge", |b| {
        let tree = populated_tree();

        let mut i = 0u64;
        b.iter(|| {
            let key = (i % N).to_be_bytes();
            assert!(tree.find_ge(0, &key).is_some());
            i += 1;
        });
    });
}

criterion_group!(benches, bonsai_find, bonsai_find_ge);
criterion_main!(benches);
