//! Latency benchmarks for event publication and dispatch planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parlor_bench::{device_session, populated_sessions, CountingHandler, NullOutbound};
use parlor_core::{
    plan, ConnectionEvent, DedupConfig, DedupWindow, DispatcherConfig, EventBus, EventDispatcher,
    EventHandler, EventKind, MemoryDirectory, MessageEvent, NewMessage, SafeEmitter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_bus_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_publish");
    let rt = runtime();

    let bus = EventBus::new();
    let counter = Arc::new(CountingHandler::default());
    let handler: Arc<dyn EventHandler> = counter.clone();
    bus.subscribe(EventKind::ConnectionOpened, Arc::clone(&handler));
    bus.subscribe(EventKind::PrivateMessageSent, handler);

    let session = device_session(1, 1);
    group.bench_function("connection_event", |b| {
        b.iter(|| {
            let event = ConnectionEvent::opened(&session, None);
            rt.block_on(bus.publish(black_box(event.into())))
        });
    });

    group.bench_function("message_event_unique", |b| {
        b.iter(|| {
            let record = NewMessage::private(1, 2, "hello").into_record();
            rt.block_on(bus.publish(MessageEvent::sent(record, None).into()))
        });
    });

    let repeated = NewMessage::private(1, 2, "hello").into_record();
    group.bench_function("message_event_duplicate", |b| {
        b.iter(|| rt.block_on(bus.publish(MessageEvent::sent(repeated.clone(), None).into())));
    });

    group.finish();
    black_box(counter.seen());
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");

    let window = DedupWindow::new(DedupConfig {
        window: Duration::from_secs(300),
        capacity: 10_000,
    });
    let mut i = 0u64;
    group.bench_function("first_sighting_at_capacity", |b| {
        b.iter(|| {
            i += 1;
            window.first_sighting(black_box(&format!("pm_{i}")))
        });
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let rt = runtime();

    group.bench_function("plan_all_kinds", |b| {
        b.iter(|| EventKind::ALL.iter().filter_map(|kind| plan(black_box(*kind))).count());
    });

    let directory = Arc::new(MemoryDirectory::new());
    directory.add_group(1, 0..1_000);
    let emitter = Arc::new(SafeEmitter::new(
        Arc::new(NullOutbound),
        1,
        Duration::ZERO,
        Duration::from_secs(1),
    ));
    let dispatcher = EventDispatcher::new(
        DispatcherConfig::default(),
        emitter,
        Arc::new(populated_sessions(1_000, 2)),
        directory.clone(),
        directory,
    );

    let private = NewMessage::private(1, 2, "hi").into_record();
    group.bench_function("fanout_targets_private", |b| {
        b.iter(|| rt.block_on(dispatcher.fanout_targets(black_box(&private), None)));
    });

    let grouped = NewMessage::group(1, 1, "hi").into_record();
    group.bench_function("fanout_targets_group_1000", |b| {
        b.iter(|| rt.block_on(dispatcher.fanout_targets(black_box(&grouped), None)));
    });

    group.finish();
}

criterion_group!(benches, bench_bus_publish, bench_dedup, bench_dispatch);
criterion_main!(benches);
