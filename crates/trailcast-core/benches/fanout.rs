//! Routing benchmarks for trailcast-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::sync::mpsc;
use trailcast_core::{
    MessageRouter, NoopMetrics, PresenceTracker, Registry, SubscriptionKey, Viewer,
};

const PAYLOAD: &str = r#"{"trail":"pr9","athlete":"runner42","location":{"latitude":32.7,"longitude":-17.0},"gender":"male","elevation":812.4}"#;

fn setup(viewers: usize) -> (MessageRouter, Vec<mpsc::Receiver<bytes::Bytes>>) {
    let registry = Arc::new(Registry::new());
    let mut receivers = Vec::with_capacity(viewers);

    for i in 0..viewers {
        let (viewer, rx) = Viewer::channel(1024);
        let key = if i % 2 == 0 {
            SubscriptionKey::all("pr9")
        } else {
            SubscriptionKey::new("pr9", "runner42")
        };
        registry.register(viewer, key);
        receivers.push(rx);
    }

    let router = MessageRouter::new(
        registry,
        Arc::new(PresenceTracker::default()),
        Arc::new(NoopMetrics),
    );
    (router, receivers)
}

fn bench_lookup(c: &mut Criterion) {
    let (router, _receivers) = setup(1000);

    c.bench_function("lookup_1000", |b| {
        b.iter(|| {
            router
                .registry()
                .lookup(black_box("pr9"), black_box("runner42"))
        })
    });
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");

    for viewers in [1usize, 100, 1000] {
        let (router, mut receivers) = setup(viewers);
        group.throughput(Throughput::Elements(viewers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(viewers), &viewers, |b, _| {
            b.iter(|| {
                router.route(black_box(PAYLOAD)).unwrap();
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_route);
criterion_main!(benches);
