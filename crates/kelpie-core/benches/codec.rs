use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kelpie_core::{deserialize, serialize, Code, Message, MessageType};

fn sample(payload_len: usize) -> Message {
    let mut msg = Message::with_id(MessageType::Confirmable, Code::POST, 0x1234);
    msg.token = vec![0xAA; 6];
    msg.set_uri_path("/bench/target");
    msg.add_uri_query("k", "v");
    msg.payload = vec![0x42; payload_len];
    msg
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    for size in [0usize, 64, 512, 1024] {
        let msg = sample(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("payload_{size}"), |b| {
            b.iter(|| serialize(black_box(&msg)).unwrap())
        });
    }
    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("deserialize");
    for size in [0usize, 64, 512, 1024] {
        let bytes = serialize(&sample(size)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(format!("payload_{size}"), |b| {
            b.iter(|| deserialize(black_box(&bytes)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_serialize, bench_deserialize);
criterion_main!(benches);
