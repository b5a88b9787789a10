//! Drain loop benchmarks
//!
//! Measures the per-event overhead of the bus:
//! - publish + gather of a single batch with growing fan-out
//! - a recursive chain where every handler publishes the next event
//! - transaction-scoped handlers over the in-memory session factory
//!
//! Run with: `cargo bench -p context-bus-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use context_bus_core::composable::Composable;
use context_bus_core::session::{SessionScope, attached};
use context_bus_macros::{ContextEvent, PersistenceEvent};
use context_bus_runtime::{ContextBus, ContextExecutor};
use context_bus_testing::{InMemorySession, InMemorySessionFactory};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::convert::Infallible;

#[derive(ContextEvent, Clone, Debug)]
struct Tick(#[payload] u64);

#[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
struct Save {
    key: String,
    #[session]
    session: Option<SessionScope<InMemorySession>>,
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create runtime")
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let runtime = runtime();

    for executors in [1_u64, 4, 16] {
        group.throughput(Throughput::Elements(executors));
        group.bench_with_input(BenchmarkId::from_parameter(executors), &executors, |b, &n| {
            let bus = ContextBus::builder(InMemorySessionFactory::new())
                .with_executors((0..n).map(|offset| {
                    ContextExecutor::on::<Tick>()
                        .handle(move |_, tick| async move { Ok::<_, Infallible>(Some(tick + offset)) })
                }))
                .build();

            b.to_async(&runtime).iter(|| async {
                bus.publish(Tick(black_box(1))).await;
                let capture = bus.gather().await.expect("drain succeeds");
                black_box(capture.len());
            });
        });
    }

    group.finish();
}

fn bench_recursive_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("recursive_chain");
    let runtime = runtime();
    let depth = 32_u64;
    group.throughput(Throughput::Elements(depth));

    group.bench_function("publish_next", |b| {
        let bus = ContextBus::without_sessions();
        runtime.block_on(bus.add_executor(ContextExecutor::on::<Tick>().handle(
            move |bus, tick| async move {
                if tick + 1 < depth {
                    bus.publish(Tick(tick + 1)).await;
                }
                Ok::<_, Infallible>(Some(tick))
            },
        )));

        b.to_async(&runtime).iter(|| async {
            bus.publish(Tick(0)).await;
            let total = Composable::new(0_u64)
                .with_reducer(|sum, tick: u64| *sum += tick)
                .reduce(bus.gather().await.expect("drain succeeds").flatten());
            black_box(total);
        });
    });

    group.finish();
}

fn bench_sessions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sessions");
    let runtime = runtime();
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit", |b| {
        let bus = ContextBus::builder(InMemorySessionFactory::new())
            .with_executor(ContextExecutor::on::<Save>().handle_in_session(|_, save: Save| async move {
                let scope = attached(&save.session)?;
                scope.lock().await?.put(save.key, serde_json::Value::Bool(true));
                Ok::<Option<()>, anyhow::Error>(None)
            }))
            .build();

        b.to_async(&runtime).iter(|| async {
            bus.publish(Save {
                key: "bench".to_string(),
                session: None,
            })
            .await;
            bus.gather().await.expect("drain succeeds");
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_recursive_chain, bench_sessions);
criterion_main!(benches);
