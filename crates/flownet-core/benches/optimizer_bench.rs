//! Criterion benchmarks for flow optimization and process ticks.
//!
//! Two benchmark groups:
//! - `optimize`: one balancing run over grid networks of growing size,
//!   local and offloaded
//! - `processing`: one processing tick with many running conversions

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use flownet_core::config::EngineConfig;
use flownet_core::engine::FlowEngine;
use flownet_core::test_utils::*;

// ===========================================================================
// Network builders
// ===========================================================================

/// `width` producers each linked to `fanout` of `width` consumers, with
/// mixed priorities so every tier gets exercised.
fn build_grid(width: usize, fanout: usize, offload: bool) -> FlowEngine {
    let mut engine = FlowEngine::new(EngineConfig {
        auto_fill_converters: false,
        offload_enabled: offload,
        batch_size: 0,
        offload_timeout_ms: 10_000,
        ..deterministic_config()
    })
    .unwrap();

    for i in 0..width {
        engine
            .register_node(producer(&format!("p{i}"), ore(), 100.0, 1000.0, 5.0))
            .unwrap();
        engine
            .register_node(consumer(&format!("c{i}"), ore(), 1000.0, 30.0))
            .unwrap();
    }
    for i in 0..width {
        for k in 0..fanout {
            let j = (i + k) % width;
            engine
                .register_connection(
                    link(&format!("p{i}->c{j}"), &format!("p{i}"), &format!("c{j}"), ore(), 25.0)
                        .with_priority((k % 3) as i32),
                )
                .unwrap();
        }
    }
    engine
}

fn build_workshop(converters: usize) -> FlowEngine {
    let mut engine = FlowEngine::new(EngineConfig {
        auto_fill_converters: false,
        ..deterministic_config()
    })
    .unwrap();
    engine
        .register_recipe(recipe("smelt", 1_000_000, &[(ore(), 1.0)], &[(metal(), 1.0)]))
        .unwrap();
    for i in 0..converters {
        let id = format!("smelter{i}");
        engine.register_node(converter(&id, &[(ore(), 100.0)], 1000.0)).unwrap();
        engine.start_process(&id, "smelt").unwrap();
    }
    engine
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    for width in [50, 200, 1000] {
        let mut local = build_grid(width, 4, false);
        group.bench_with_input(BenchmarkId::new("local", width), &width, |b, _| {
            b.iter(|| local.optimize_flows())
        });

        let mut offloaded = build_grid(width, 4, true);
        group.bench_with_input(BenchmarkId::new("offloaded", width), &width, |b, _| {
            b.iter(|| offloaded.optimize_flows())
        });
    }
    group.finish();
}

fn bench_processing(c: &mut Criterion) {
    let mut engine = build_workshop(2000);
    c.bench_function("processing/2000_processes", |b| b.iter(|| engine.process_tick(1)));
}

criterion_group!(benches, bench_optimize, bench_processing);
criterion_main!(benches);
