//! Criterion benchmarks for StructLab hot paths.
//!
//! Benchmarks:
//! 1. Tick executor over the full factor chain (cold, whole series)
//! 2. Warm ingest of a short tail against a long window
//! 3. Rebuild replay of the resulting event log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use structlab_core::domain::Candle;
use structlab_core::planner::CandleBatch;
use structlab_core::replay::bootstrap_accumulators;
use structlab_core::{build_registry, EngineSettings, FactorAccumulators, SeriesId, TickExecutor};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_candles(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let x = i as f64;
            let close = 100.0 + (x * 0.07).sin() * 10.0 + (x * 0.31).sin() * 3.0;
            let open = close - 0.3;
            Candle::new(i as i64 * 60, open, close + 1.5, open - 1.5, close, 1_000.0)
        })
        .collect()
}

fn series() -> SeriesId {
    "bench:spot:BTC/USDT:1m".parse().expect("valid series id")
}

// ── 1. Full chain, cold ──────────────────────────────────────────────

fn bench_cold_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_chain_cold");
    let registry = build_registry(&EngineSettings::default()).expect("default registry");
    let executor = TickExecutor::new(&registry);
    let series = series();

    for &n in &[1_000usize, 5_000, 20_000] {
        let candles = make_candles(n);
        let up_to = candles[n - 1].candle_time;
        let batch = CandleBatch::new(candles, None, up_to);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                executor
                    .run_incremental(black_box(&series), black_box(&batch), FactorAccumulators::default())
                    .expect("tick run")
            });
        });
    }
    group.finish();
}

// ── 2. Warm tail ─────────────────────────────────────────────────────

fn bench_warm_tail(c: &mut Criterion) {
    let registry = build_registry(&EngineSettings::default()).expect("default registry");
    let executor = TickExecutor::new(&registry);
    let series = series();

    let candles = make_candles(2_100);
    let head = candles[2_099 - 10].candle_time;
    let up_to = candles[2_099].candle_time;
    let warmup = CandleBatch::new(candles.clone(), None, head);
    let acc = executor
        .run_incremental(&series, &warmup, FactorAccumulators::default())
        .expect("warmup run")
        .accumulators;
    let tail = CandleBatch::new(candles, Some(head), up_to);

    c.bench_function("tick_chain_warm_tail_10", |b| {
        b.iter(|| {
            executor
                .run_incremental(black_box(&series), black_box(&tail), acc.clone())
                .expect("tick run")
        });
    });
}

// ── 3. Rebuild replay ────────────────────────────────────────────────

fn bench_replay(c: &mut Criterion) {
    let registry = build_registry(&EngineSettings::default()).expect("default registry");
    let series = series();
    let candles = make_candles(20_000);
    let up_to = candles[19_999].candle_time;
    let batch = CandleBatch::new(candles, None, up_to);
    let events = TickExecutor::new(&registry)
        .run_incremental(&series, &batch, FactorAccumulators::default())
        .expect("tick run")
        .events;

    c.bench_function("bootstrap_20k_candles", |b| {
        b.iter(|| {
            bootstrap_accumulators(&registry, black_box(&series), events.iter().cloned())
                .expect("bootstrap")
        });
    });
}

criterion_group!(benches, bench_cold_chain, bench_warm_tail, bench_replay);
criterion_main!(benches);
