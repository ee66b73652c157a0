use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowgraph_checkpoint::{
    BincodeSerializer, ChannelFlavor, ChannelSnapshot, CheckPointStore, CheckpointRecord,
    CheckpointSerializer, InMemoryCheckPointStore, JsonSerializer, PersistedValue, RunMode,
};
use serde_json::json;

fn sample_record(channels: usize) -> CheckpointRecord {
    let mut record = CheckpointRecord::new(RunMode::Invoke, 4);
    for i in 0..channels {
        let mut snapshot = ChannelSnapshot::new(ChannelFlavor::Dag);
        snapshot.values.insert(
            format!("pred-{i}"),
            Some(PersistedValue(json!({"index": i, "payload": "x".repeat(64)}))),
        );
        snapshot.data.insert(format!("pred-{i}"), true);
        record.channels.insert(format!("node-{i}"), snapshot);
    }
    record
}

fn encode_benchmark(c: &mut Criterion) {
    let record = sample_record(32);
    let json = JsonSerializer::new();
    let bincode = BincodeSerializer::new();

    c.bench_function("record encode json", |b| {
        b.iter(|| json.encode(black_box(&record)).unwrap())
    });
    c.bench_function("record encode bincode", |b| {
        b.iter(|| bincode.encode(black_box(&record)).unwrap())
    });
}

fn store_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let bytes = JsonSerializer::new().encode(&sample_record(8)).unwrap();

    c.bench_function("memory store set+get", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = InMemoryCheckPointStore::new();
            store.set("bench", black_box(bytes.clone())).await.unwrap();
            store.get(black_box("bench")).await.unwrap();
        });
    });
}

criterion_group!(benches, encode_benchmark, store_benchmark);
criterion_main!(benches);
