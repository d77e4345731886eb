//! Hash-operation throughput benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::storage::hash::{ExpireSetCond, FieldSetCond};
use emberkv::storage::StorageEngine;
use std::sync::Arc;

fn b(s: String) -> Bytes {
    Bytes::from(s)
}

/// HSET into one growing hash (crosses the listpack → table boundary).
fn bench_hset(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());
    let key = Bytes::from_static(b"bench:hash");

    let mut group = c.benchmark_group("hset");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hset_new_fields", |bench| {
        let mut i = 0u64;
        bench.iter(|| {
            let field = b(format!("field:{i}"));
            engine
                .command(|db| db.hset(&key, &[(field, Bytes::from_static(b"value"))]))
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("hset_overwrite", |bench| {
        let field = Bytes::from_static(b"hot");
        bench.iter(|| {
            engine
                .command(|db| db.hset(&key, &[(field.clone(), Bytes::from_static(b"value"))]))
                .unwrap();
        });
    });

    group.finish();
}

/// HGET against listpack-sized and table-sized hashes.
fn bench_hget(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());
    let small = Bytes::from_static(b"bench:small");
    let big = Bytes::from_static(b"bench:big");

    engine.command(|db| {
        for i in 0..16 {
            db.hset(&small, &[(b(format!("f{i}")), Bytes::from_static(b"v"))])
                .unwrap();
        }
        for i in 0..10_000 {
            db.hset(&big, &[(b(format!("f{i}")), Bytes::from_static(b"v"))])
                .unwrap();
        }
    });

    let mut group = c.benchmark_group("hget");
    group.throughput(Throughput::Elements(1));

    group.bench_function("listpack", |bench| {
        let mut i = 0u64;
        bench.iter(|| {
            let field = b(format!("f{}", i % 16));
            black_box(engine.command(|db| db.hget(&small, &field)).unwrap());
            i += 1;
        });
    });

    group.bench_function("hashtable", |bench| {
        let mut i = 0u64;
        bench.iter(|| {
            let field = b(format!("f{}", i % 10_000));
            black_box(engine.command(|db| db.hget(&big, &field)).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Attaching deadlines: the ordered-insert path plus the global-index
/// registration.
fn bench_hexpire(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    let mut group = c.benchmark_group("hexpire");
    group.throughput(Throughput::Elements(1));

    group.bench_function("attach_deadline", |bench| {
        let mut i = 0u64;
        engine.command(|db| {
            for j in 0..10_000 {
                db.hset(
                    &Bytes::from_static(b"bench:ttl"),
                    &[(b(format!("f{j}")), Bytes::from_static(b"v"))],
                )
                .unwrap();
            }
        });
        bench.iter(|| {
            let field = b(format!("f{}", i % 10_000));
            engine
                .command(|db| {
                    let deadline = db.now() + 3_600_000;
                    db.hash_set_expiry_batch(
                        &Bytes::from_static(b"bench:ttl"),
                        deadline,
                        ExpireSetCond::None,
                        FieldSetCond::DontCreateReportNoField,
                        &[field],
                    )
                })
                .unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Active-expire cycles draining a hash with many due fields.
fn bench_active_expire(c: &mut Criterion) {
    let mut group = c.benchmark_group("active_expire");

    group.bench_function("drain_1000_fields", |bench| {
        bench.iter_with_setup(
            || {
                let engine = StorageEngine::new();
                let key = Bytes::from_static(b"bench:expire");
                engine.command(|db| {
                    db.set_time(1_000);
                    let pairs: Vec<(Bytes, Bytes)> = (0..1000)
                        .map(|i| (b(format!("f{i}")), Bytes::from_static(b"v")))
                        .collect();
                    db.hset(&key, &pairs).unwrap();
                    let fields: Vec<Bytes> = (0..1000).map(|i| b(format!("f{i}"))).collect();
                    db.hash_set_expiry_batch(
                        &key,
                        2_000,
                        ExpireSetCond::None,
                        FieldSetCond::DontCreateReportNoField,
                        &fields,
                    )
                    .unwrap();
                    db.set_time(10_000);
                });
                engine
            },
            |engine| {
                black_box(engine.command(|db| db.active_expire(1000)));
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_hset, bench_hget, bench_hexpire, bench_active_expire);
criterion_main!(benches);
