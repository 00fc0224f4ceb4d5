//! Envelope codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, ChatMessage, SenderInfo, WireFormat};

fn sample_chat(len: usize) -> ChatMessage {
    ChatMessage {
        sender: SenderInfo {
            id: "user-1".into(),
            name: "viewer".into(),
            profile_image_url: Some("https://cdn.example.com/u/1.png".into()),
        },
        content: "x".repeat(len),
        stream_id: "42".into(),
    }
}

fn bench_encode(c: &mut Criterion) {
    let chat = sample_chat(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("json_chat_64B", |b| {
        b.iter(|| codec::encode(WireFormat::Json, "chat", black_box(&chat)))
    });
    group.bench_function("msgpack_chat_64B", |b| {
        b.iter(|| codec::encode(WireFormat::MessagePack, "chat", black_box(&chat)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let chat = sample_chat(64);
    let json = codec::encode(WireFormat::Json, "chat", &chat).unwrap();
    let packed = codec::encode(WireFormat::MessagePack, "chat", &chat).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("json_chat_64B", |b| {
        b.iter(|| {
            let envelope = codec::decode(black_box(&json)).unwrap();
            envelope.payload_as::<ChatMessage>().unwrap()
        })
    });
    group.throughput(Throughput::Bytes(packed.len() as u64));
    group.bench_function("msgpack_chat_64B", |b| {
        b.iter(|| {
            let envelope = codec::decode(black_box(&packed)).unwrap();
            envelope.payload_as::<ChatMessage>().unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
