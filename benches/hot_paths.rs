use std::sync::Arc;
use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowagg::aggregator::accumulator::FlowAccumulator;
use flowagg::aggregator::collision::collision_queue;
use flowagg::clock::system_clock;
use flowagg::export::health::HealthMetrics;
use flowagg::flow::{FlowRecord, FlowType, Port};
use flowagg::payload::build_payload;
use flowagg::rollup::PortRollupStore;
use tracing::Span;

fn flow(i: u32) -> FlowRecord {
    FlowRecord {
        namespace: "default".to_string(),
        flow_type: FlowType::NetFlow9,
        exporter_addr: vec![192, 0, 2, 1],
        src_addr: vec![10, 0, (i >> 8) as u8, i as u8],
        dst_addr: vec![10, 1, 0, 1],
        src_port: Port::Concrete(40_000 + (i % 2_000) as u16),
        dst_port: Port::Concrete(443),
        ip_protocol: 6,
        ether_type: 0x0800,
        bytes: 1_500,
        packets: 1,
        start_timestamp: 1_700_000_000,
        end_timestamp: 1_700_000_010,
        tcp_flags: 0x18,
        src_mask: 24,
        dst_mask: 16,
        ..Default::default()
    }
}

fn accumulator(rollup: bool) -> FlowAccumulator {
    let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let (checker, _worker) = collision_queue(1024, metrics, Span::none());
    let store = rollup.then(|| Arc::new(PortRollupStore::new(10, Span::none())));
    FlowAccumulator::new(
        Duration::from_secs(300),
        Duration::from_secs(300),
        store,
        checker,
        system_clock(),
        Span::none(),
    )
}

fn bench_add(c: &mut Criterion) {
    let flows: Vec<FlowRecord> = (0..4_096).map(flow).collect();

    c.bench_function("accumulator/add_no_rollup", |b| {
        let acc = accumulator(false);
        let mut i = 0usize;
        b.iter(|| {
            acc.add(black_box(flows[i % flows.len()].clone()));
            i += 1;
        })
    });

    c.bench_function("accumulator/add_with_rollup", |b| {
        let acc = accumulator(true);
        let mut i = 0usize;
        b.iter(|| {
            acc.add(black_box(flows[i % flows.len()].clone()));
            i += 1;
        })
    });
}

fn bench_flush(c: &mut Criterion) {
    c.bench_function("accumulator/add_and_drain_10k", |b| {
        let acc = accumulator(false);
        b.iter(|| {
            for i in 0..10_000 {
                acc.add(flow(i));
            }
            black_box(acc.drain().len())
        })
    });
}

fn bench_payload(c: &mut Criterion) {
    let f = flow(7);
    let now = flowagg::clock::unix_millis(SystemTime::now());

    c.bench_function("payload/build_and_serialize", |b| {
        b.iter(|| {
            let doc = build_payload(black_box(&f), "bench-host", now);
            black_box(serde_json::to_vec(&doc).expect("serialize").len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_add(c);
    bench_flush(c);
    bench_payload(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
