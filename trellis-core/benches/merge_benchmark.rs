use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use trellis_core::{Entity, MapName, Mutation, Point, Record, RecordStore, Size};

fn node(i: usize) -> Entity {
    Entity::node(
        format!("n{i}"),
        "rect",
        Point::new(i as f64, i as f64),
        Size::new(50.0, 50.0),
        "bench",
    )
}

fn seeded_store(count: usize) -> RecordStore {
    let mut store = RecordStore::new();
    let _ = store.transact(|tx| {
        for i in 0..count {
            tx.put_node(node(i))?;
        }
        Ok(())
    });
    store
}

fn bench_local_mutation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_put_node", |b| {
        let mut store = RecordStore::new();
        let mut i = 0usize;
        b.iter(|| {
            // Moving one node back and forth keeps the map size constant.
            let mut entity = node(0);
            entity.move_to(Point::new((i % 2) as f64, 0.0));
            i += 1;
            let delta = store
                .apply_local_mutation(MapName::Nodes, "n0", Mutation::Put(Record::Entity(entity)))
                .unwrap();
            black_box(delta);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Engine");
    group.throughput(Throughput::Elements(1));

    let mut source = RecordStore::new();
    let delta = source
        .transact(|tx| tx.put_node(node(1)))
        .unwrap()
        .unwrap();

    group.bench_function("apply_remote_delta", |b| {
        let mut dest = seeded_store(100);
        b.iter(|| {
            dest.apply_remote_delta(black_box(delta.as_bytes())).unwrap();
        })
    });

    group.finish();
}

fn bench_full_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("Snapshot");
    let store = seeded_store(1_000);

    group.bench_function("encode_full_state_1k", |b| {
        b.iter(|| black_box(store.encode_full_state()))
    });

    let snapshot = store.encode_full_state();
    group.throughput(Throughput::Bytes(snapshot.len() as u64));
    group.bench_function("load_full_state_1k", |b| {
        b.iter(|| black_box(RecordStore::from_snapshot(&snapshot).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_local_mutation, bench_apply_remote, bench_full_state);
criterion_main!(benches);
