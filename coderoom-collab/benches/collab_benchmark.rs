use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use coderoom_collab::broadcast::{BroadcastGroup, Frame};
use coderoom_collab::doc::SharedDoc;
use coderoom_collab::presence::{AwarenessUpdate, UserProfile};
use coderoom_collab::protocol::SyncMessage;
use coderoom_collab::relay::RelayRoom;

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(1), black_box("lobby-ABC"), black_box(1), update.clone());
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(1, "lobby-ABC", 1, vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let profile = UserProfile::new("Ada", "hsl(120, 100%, 50%)");
    let state = serde_json::json!({ "user": profile }).to_string();
    let update = AwarenessUpdate::new(1, 1, Some(state));

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(1, "lobby-ABC", black_box(&update)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_typing(c: &mut Criterion) {
    c.bench_function("doc_type_200_chars", |b| {
        b.iter(|| {
            let mut doc = SharedDoc::new();
            for i in 0..200u32 {
                black_box(doc.insert_text(i, "x").unwrap());
            }
        })
    });
}

fn bench_apply_remote_keystrokes(c: &mut Criterion) {
    let mut writer = SharedDoc::new();
    let updates: Vec<Vec<u8>> = (0..200u32)
        .map(|i| writer.insert_text(i, "x").unwrap().update)
        .collect();

    c.bench_function("doc_apply_200_updates", |b| {
        b.iter(|| {
            let mut reader = SharedDoc::new();
            for update in &updates {
                black_box(reader.apply_update(update).unwrap());
            }
        })
    });
}

fn bench_late_joiner_sync(c: &mut Criterion) {
    let mut relay = RelayRoom::new("lobby-ABC");
    relay.join(1);
    let mut writer = SharedDoc::new();
    for i in 0..1000u32 {
        let update = writer.insert_text(i, "y").unwrap().update;
        relay.handle(1, &SyncMessage::update(1, "lobby-ABC", u64::from(i), update));
    }
    relay.join(2);
    let empty_sv = SharedDoc::new().state_vector();

    c.bench_function("relay_sync_step1_1000_ops", |b| {
        b.iter(|| {
            black_box(relay.handle(2, &SyncMessage::sync_step1(2, "lobby-ABC", empty_sv.clone())));
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = Arc::new(Frame {
        origin: 1,
        bytes: vec![0u8; 64],
    });

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast_frame(frame.clone()));
            for rx in &mut receivers {
                black_box(rx.try_recv().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_typing,
    bench_apply_remote_keystrokes,
    bench_late_joiner_sync,
    bench_broadcast_100_peers,
);
criterion_main!(benches);
