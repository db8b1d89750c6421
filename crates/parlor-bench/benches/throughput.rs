//! Throughput benchmarks for the Parlor registries.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parlor_bench::{handle, populated_room, populated_sessions};
use parlor_core::room::derive_private_name;
use parlor_core::{RoomRegistry, SessionRegistry};

fn bench_sessions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sessions");

    group.bench_function("bind_unbind", |b| {
        let sessions = SessionRegistry::new();
        let mut i = 0usize;
        b.iter(|| {
            let id = handle(i);
            i += 1;
            let _ = sessions.bind(&id, 1, "dev-1", "127.0.0.1");
            sessions.unbind(black_box(&id))
        });
    });

    let sessions = populated_sessions(10_000, 2);
    group.bench_function("is_online_10k_users", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            sessions.is_online(black_box(i))
        });
    });

    group.bench_function("handles_for_10k_users", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            sessions.handles_for(black_box(i))
        });
    });

    group.finish();
}

fn bench_rooms(c: &mut Criterion) {
    let mut group = c.benchmark_group("rooms");

    group.bench_function("derive_private_name", |b| {
        b.iter(|| derive_private_name(black_box(1_234), black_box(987)))
    });

    group.bench_function("join_private", |b| {
        let rooms = RoomRegistry::new();
        let mut i = 0usize;
        b.iter(|| {
            let id = handle(i % 1_000);
            let peer = i64::try_from(i % 5_000).unwrap_or_default();
            i += 1;
            let _ = rooms.join_private(&id, 0, black_box(peer));
        });
    });

    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("members", size), &size, |b, &size| {
            let rooms = populated_room("group_1", size);
            b.iter(|| rooms.members(black_box("group_1")));
        });

        group.bench_with_input(
            BenchmarkId::new("remove_handle", size),
            &size,
            |b, &size| {
                b.iter_batched(
                    || populated_room("group_1", size),
                    |rooms| rooms.remove_handle(black_box(&handle(0))),
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sessions, bench_rooms, bench_fanout);
criterion_main!(benches);
