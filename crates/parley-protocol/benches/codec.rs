//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ClientEvent, ServerEvent};

fn send_message(size: usize) -> ClientEvent {
    ClientEvent::SendMessage {
        recipient_id: "user-42".into(),
        content: Some("x".repeat(size)),
        media_url: None,
        client_correlation_id: "c-1".into(),
    }
}

fn bench_encode(c: &mut Criterion) {
    let event = send_message(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("json_64B", |b| b.iter(|| codec::to_json(black_box(&event))));
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let event = send_message(64);
    let binary = codec::encode(&event).unwrap();
    let text = codec::to_json(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode::<ClientEvent>(black_box(&binary)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::from_json::<ClientEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_receive_roundtrip(c: &mut Criterion) {
    let event = ServerEvent::ReceiveMessage {
        id: "0b4f0c9e-3f57-4ad1-9e44-7c1d2b8c5a10".into(),
        sender_id: "user-1".into(),
        recipient_id: "user-2".into(),
        content: Some("x".repeat(256)),
        media_url: None,
        created_at: 1_700_000_000_000,
    };

    c.bench_function("receive_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<ServerEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_receive_roundtrip);
criterion_main!(benches);
