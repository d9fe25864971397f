use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use trellis_collab::{
    BroadcastGroup, DocumentStore, MemoryStore, OfflineQueue, PeerInfo, Room, SnapshotStore,
    StoreConfig, SyncMessage,
};
use trellis_core::{Entity, MapName, Mutation, Point, Record, RecordStore, Size};
use uuid::Uuid;

fn node(i: usize) -> Entity {
    Entity::node(
        format!("n{i}"),
        "rect",
        Point::new(i as f64, 0.0),
        Size::new(40.0, 40.0),
        "bench",
    )
}

fn document(count: usize) -> RecordStore {
    let mut store = RecordStore::new();
    let _ = store.transact(|tx| {
        for i in 0..count {
            tx.put_node(node(i))?;
        }
        Ok(())
    });
    store
}

// ─── Protocol ───────────────────────────────────────────────────

fn bench_message_codec(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let msg = SyncMessage::delta(peer, "room-1", 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_message_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
    c.bench_function("delta_message_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

// ─── Fan-out ────────────────────────────────────────────────────

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let _receivers: Vec<_> = (0..100).map(|_| group.subscribe(Uuid::new_v4())).collect();
                let origin = Uuid::new_v4();
                for i in 0..1000u64 {
                    group.broadcast_raw(origin, black_box(Arc::new(vec![i as u8; 64])));
                }
            });
        })
    });
}

fn bench_room_apply_and_relay(c: &mut Criterion) {
    let room = Room::open("bench", Arc::new(MemoryStore::new()), 4096);
    let members: Vec<_> = (0..10)
        .map(|i| room.join(PeerInfo::new(format!("user-{i}"), "bench")).unwrap().0)
        .collect();

    // Deltas produced by a separate replica, applied in order.
    let mut source = RecordStore::new();
    let deltas: Vec<Vec<u8>> = (0..1000)
        .map(|i| {
            source
                .apply_local_mutation(MapName::Nodes, &format!("n{i}"), Mutation::Put(Record::Entity(node(i))))
                .unwrap()
                .unwrap()
                .into_bytes()
        })
        .collect();

    let mut group = c.benchmark_group("Room");
    group.throughput(Throughput::Elements(deltas.len() as u64));
    group.bench_function("apply_relay_1000_deltas_10_members", |b| {
        b.iter(|| {
            for (i, delta) in deltas.iter().enumerate() {
                members[i % members.len()]
                    .submit_delta(i as u64, black_box(delta))
                    .unwrap();
            }
        })
    });
    group.finish();
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

// ─── Storage ────────────────────────────────────────────────────

fn bench_snapshot_storage(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let storage = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let snapshot = document(1000).encode_full_state();
    storage.save_snapshot("bench", &snapshot, 0).unwrap();

    let mut group = c.benchmark_group("Snapshot Storage");
    group.throughput(Throughput::Bytes(snapshot.len() as u64));
    group.bench_function("save_snapshot_1k_nodes", |b| {
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            storage.save_snapshot("bench", black_box(&snapshot), ts).unwrap();
        })
    });
    group.bench_function("load_snapshot_1k_nodes", |b| {
        b.iter(|| black_box(storage.load_snapshot("bench").unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_message_codec,
    bench_broadcast_1000_messages,
    bench_room_apply_and_relay,
    bench_offline_queue,
    bench_snapshot_storage,
);
criterion_main!(benches);
