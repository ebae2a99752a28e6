use bytes::Bytes;
use core::{hint::black_box, time::Duration};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ferroid_pubsub::{cache::TtlCache, ordered_stream};
use tokio::runtime::Builder;

const SENDER: &str = "bench-sender";

/// Arrival orders the transport can produce for a stream of `n` chunks.
#[derive(Clone, Copy, Debug)]
enum Arrival {
    InOrder,
    Reversed,
    Interleaved,
}

impl Arrival {
    fn orders(self, n: u64) -> Vec<u64> {
        match self {
            Self::InOrder => (0..n).collect(),
            Self::Reversed => (0..n).rev().collect(),
            // Odd positions first, then even ones: every other chunk waits.
            Self::Interleaved => (0..n)
                .filter(|i| i % 2 == 1)
                .chain((0..n).filter(|i| i % 2 == 0))
                .collect(),
        }
    }
}

fn bench_reassembly(c: &mut Criterion) {
    let rt = Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    let payload = Bytes::from_static(b"chunk");

    let mut group = c.benchmark_group("ordered_stream");
    for n in [16u64, 256, 4096] {
        group.throughput(Throughput::Elements(n));
        for arrival in [Arrival::InOrder, Arrival::Reversed, Arrival::Interleaved] {
            let orders = arrival.orders(n);
            group.bench_with_input(
                BenchmarkId::new(format!("{arrival:?}"), n),
                &orders,
                |b, orders| {
                    b.to_async(&rt).iter(|| async {
                        let (writer, stream) = ordered_stream(Duration::from_secs(1));
                        writer.signal_end_of_stream(n, SENDER).expect("end marker");
                        for &order in orders {
                            writer
                                .add(payload.clone(), order, SENDER)
                                .expect("same sender");
                        }
                        let items = stream.try_collect().await.expect("complete stream");
                        black_box(items)
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_job_cache(c: &mut Criterion) {
    let rt = Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    // TtlCache reads tokio's clock, which needs a runtime context.
    let _guard = rt.enter();

    let keys: Vec<String> = (0..1024).map(|i| format!("job-{i}")).collect();
    let mut group = c.benchmark_group("job_cache");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("insert_then_remove", |b| {
        b.iter(|| {
            let mut cache = TtlCache::new(Duration::from_secs(3600), keys.len());
            for key in &keys {
                cache.insert(key.clone(), ());
            }
            for key in &keys {
                black_box(cache.remove(key));
            }
        });
    });
    group.bench_function("insert_over_capacity", |b| {
        b.iter(|| {
            let mut cache = TtlCache::new(Duration::from_secs(3600), keys.len() / 4);
            for key in &keys {
                cache.insert(key.clone(), ());
            }
            black_box(cache.len())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_reassembly, bench_job_cache);
criterion_main!(benches);
