use criterion::{black_box, criterion_group, criterion_main, Criterion};
use depot::{Blob, Depot};

fn bench_vref_dedup(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let depot = Depot::open(dir.path()).expect("open depot");
    let payload = Blob(vec![0xA5; 4096]);
    // First store pays the write; the loop measures the dedup hit path.
    let first = depot.vref(&payload).expect("store blob");
    depot.sync().expect("sync");

    c.bench_function("vref_dedup_hit", |b| {
        b.iter(|| {
            let r = depot.vref(black_box(&payload)).expect("vref");
            assert_eq!(r.address(), first.address());
            black_box(r)
        })
    });
}

fn bench_load_cached(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let depot = Depot::open(dir.path()).expect("open depot");
    let value = depot.vref(&Blob(vec![0x5A; 4096])).expect("store blob");
    depot.sync().expect("sync");
    value.load().expect("prime cache");

    c.bench_function("load_cached", |b| {
        b.iter(|| black_box(value.load().expect("load")))
    });
}

fn bench_counter_transactions(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let depot = Depot::open(dir.path()).expect("open depot");
    let counter = depot.root_var("bench/counter", || 0u64).expect("root");

    c.bench_function("relaxed_increment", |b| {
        b.iter(|| {
            depot
                .transact(|tx| {
                    let v = tx.read(&counter);
                    tx.write(&counter, *v + 1);
                    Ok(())
                })
                .expect("transact")
        })
    });
    depot.sync().expect("drain writer");
}

criterion_group!(
    benches,
    bench_vref_dedup,
    bench_load_cached,
    bench_counter_transactions
);
criterion_main!(benches);
