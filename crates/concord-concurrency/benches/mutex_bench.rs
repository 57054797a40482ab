// Benchmarks for distributed mutex performance
// Measures uncontended acquire/release and fenced writes on the in-memory store

use std::hint::black_box;
use std::sync::Arc;

use concord_concurrency::{CancelSignal, Mutex, Session};
use concord_store::MemoryKvStore;
use criterion::{Criterion, criterion_group, criterion_main};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_lock_unlock_uncontended(c: &mut Criterion) {
    let rt = runtime();
    let store = MemoryKvStore::new();
    let session = rt.block_on(Session::open(Arc::new(store))).unwrap();
    let ctx = CancelSignal::never();

    c.bench_function("lock_unlock_uncontended", |b| {
        b.to_async(&rt).iter(|| {
            let session = session.clone();
            let ctx = ctx.clone();
            async move {
                let mut mutex = Mutex::new(&session, black_box("/bench"));
                mutex.lock(&ctx).await.unwrap();
                mutex.unlock().await.unwrap();
            }
        })
    });
}

fn bench_try_lock_would_block(c: &mut Criterion) {
    let rt = runtime();
    let store = MemoryKvStore::new();
    let holder_session = rt.block_on(Session::open(Arc::new(store.clone()))).unwrap();
    let session = rt.block_on(Session::open(Arc::new(store))).unwrap();
    let ctx = CancelSignal::never();

    let mut holder = Mutex::new(&holder_session, "/bench");
    rt.block_on(holder.lock(&ctx)).unwrap();

    c.bench_function("try_lock_would_block", |b| {
        b.to_async(&rt).iter(|| {
            let session = session.clone();
            let ctx = ctx.clone();
            async move {
                let mut mutex = Mutex::new(&session, "/bench");
                black_box(mutex.try_lock(&ctx).await).unwrap_err();
            }
        })
    });
}

fn bench_fenced_put(c: &mut Criterion) {
    let rt = runtime();
    let store = MemoryKvStore::new();
    let session = rt.block_on(Session::open(Arc::new(store))).unwrap();
    let ctx = CancelSignal::never();

    let mut mutex = Mutex::new(&session, "/bench");
    rt.block_on(mutex.lock(&ctx)).unwrap();
    let fence = mutex.fence().unwrap();

    c.bench_function("fenced_put", |b| {
        b.to_async(&rt).iter(|| {
            let fence = fence.clone();
            async move { fence.put("/bench-data", black_box("value")).await.unwrap() }
        })
    });
}

criterion_group!(
    benches,
    bench_lock_unlock_uncontended,
    bench_try_lock_would_block,
    bench_fenced_put
);
criterion_main!(benches);
