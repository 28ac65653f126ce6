//! # SpiderCast Overlay Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | Wire codec | Frame encode/decode of a membership update |
//! | Attribute table | Delta extraction from a large table |
//! | Simulation | Full convergence of a small network |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spidercast::testing::SimNetwork;
use spidercast::{
    AttributeTable, Envelope, MembershipMessage, Message, NodeRecord, NodeVersion,
    SpiderCastConfig, WireCodec,
};
use std::net::SocketAddr;
use std::time::Duration;

fn record(i: usize) -> NodeRecord {
    NodeRecord {
        name: format!("node-{i:05}"),
        endpoints: vec![SocketAddr::from(([10, 0, (i / 250) as u8, (i % 250) as u8], 7000))],
        version: NodeVersion::new(1_700_000_000 + i as i64, 0),
    }
}

// ============================================================================
// Wire Codec
// ============================================================================

fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire-codec");
    let codec = WireCodec::default();

    for size in [10, 100, 1000] {
        let envelope = Envelope {
            bus_name: "bench".to_string(),
            sender: record(0),
            target: Some("node-00001".to_string()),
            body: Message::Membership(MembershipMessage::Update {
                joined: (0..size).map(record).collect(),
                departed: Vec::new(),
            }),
        };
        let frame = codec.encode_frame(&envelope).expect("frame fits");

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_update", size), &envelope, |b, env| {
            b.iter(|| black_box(codec.encode_frame(env).is_ok()))
        });
        group.bench_with_input(BenchmarkId::new("decode_update", size), &frame, |b, frame| {
            b.iter(|| black_box(codec.decode_frame(frame).is_ok()))
        });
    }

    group.finish();
}

// ============================================================================
// Attribute Table
// ============================================================================

fn bench_attribute_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute-table");

    let mut table = AttributeTable::new();
    for i in 0..10_000 {
        table
            .set(&format!("key-{i}"), format!("value-{i}").into_bytes())
            .expect("valid key");
    }
    let version = table.version();

    for behind in [1, 100, 5_000] {
        group.bench_with_input(BenchmarkId::new("delta_since", behind), &behind, |b, &behind| {
            b.iter(|| black_box(table.delta_since(version - behind).len()))
        });
    }

    group.finish();
}

// ============================================================================
// Simulated Convergence
// ============================================================================

fn bench_convergence(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    group.bench_function("converge_8_nodes", |b| {
        b.iter(|| {
            let mut net = SimNetwork::new(SpiderCastConfig::for_testing());
            for i in 0..8 {
                net.add_node(&format!("n{i}"));
            }
            net.start_all();
            black_box(net.run_until(Duration::from_secs(10), SimNetwork::views_converged))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_wire_codec, bench_attribute_delta, bench_convergence);
criterion_main!(benches);
