//! Property tests for engine invariants.
//!
//! Uses proptest to verify:
//! 1. Cold-start determinism — replaying the event log rebuilds exactly the
//!    accumulators continuous ticking produced
//! 2. Split ingestion — ticking in two calls equals ticking in one
//! 3. Pen shape — pens chain end to start and point the way they move
//! 4. Zone bands — non-empty at formation and frozen until death

use proptest::prelude::*;
use std::collections::HashMap;
use structlab_core::domain::{Candle, ConfirmedPen, FactorEvent, Zhongshu, ZhongshuDead};
use structlab_core::planner::CandleBatch;
use structlab_core::replay::bootstrap_accumulators;
use structlab_core::{
    build_registry, EngineSettings, FactorAccumulators, FactorRegistry, SeriesId, TickExecutor,
};

const TF: i64 = 60;

// ── Strategies (proptest) ────────────────────────────────────────────

/// Random walk on a half-unit grid so equal highs and lows actually occur.
fn arb_candles() -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::vec((-6i32..=6, 0i32..=4, 0i32..=4), 20..160).prop_map(|steps| {
        let mut price = 200.0_f64;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (delta, up, down))| {
                let open = price;
                price = (price + delta as f64 * 0.5).max(20.0);
                let close = price;
                Candle::new(
                    i as i64 * TF,
                    open,
                    open.max(close) + up as f64 * 0.5,
                    open.min(close) - down as f64 * 0.5,
                    close,
                    1.0,
                )
            })
            .collect()
    })
}

fn arb_settings() -> impl Strategy<Value = EngineSettings> {
    (1usize..=4, 1usize..=3)
        .prop_map(|(major, minor)| EngineSettings::default().with_pivot_windows(major, minor))
}

fn series() -> SeriesId {
    "test:spot:X/Y:1m".parse().unwrap()
}

fn tick(
    registry: &FactorRegistry,
    candles: &[Candle],
    head: Option<i64>,
    up_to: i64,
    acc: FactorAccumulators,
) -> (Vec<FactorEvent>, FactorAccumulators) {
    let batch = CandleBatch::new(candles.to_vec(), head, up_to);
    let run = TickExecutor::new(registry)
        .run_incremental(&series(), &batch, acc)
        .unwrap();
    (run.events, run.accumulators)
}

// ── 1. Cold-start determinism ────────────────────────────────────────

proptest! {
    #[test]
    fn replay_equals_continuous_ticking(candles in arb_candles(), settings in arb_settings()) {
        let registry = build_registry(&settings).unwrap();
        let up_to = candles.last().unwrap().candle_time;
        let (events, ticked) = tick(&registry, &candles, None, up_to, FactorAccumulators::default());

        let (replayed, _) = bootstrap_accumulators(&registry, &series(), events).unwrap();
        prop_assert_eq!(replayed, ticked);
    }

    /// Same property after a storage round trip: replay reads events back
    /// from JSON, in arbitrary order.
    #[test]
    fn replay_is_order_and_encoding_insensitive(candles in arb_candles(), seed in any::<u64>()) {
        let settings = EngineSettings::default().with_pivot_windows(2, 1);
        let registry = build_registry(&settings).unwrap();
        let up_to = candles.last().unwrap().candle_time;
        let (events, ticked) = tick(&registry, &candles, None, up_to, FactorAccumulators::default());

        let mut stored: Vec<FactorEvent> = events
            .iter()
            .map(|e| serde_json::from_str(&serde_json::to_string(e).unwrap()).unwrap())
            .collect();
        // Deterministic shuffle driven by the seed.
        let n = stored.len();
        let mut s = seed;
        for i in (1..n).rev() {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
            stored.swap(i, (s >> 33) as usize % (i + 1));
        }

        let (replayed, _) = bootstrap_accumulators(&registry, &series(), stored).unwrap();
        prop_assert_eq!(replayed, ticked);
    }
}

// ── 2. Split ingestion ───────────────────────────────────────────────

proptest! {
    #[test]
    fn split_run_equals_single_run(
        candles in arb_candles(),
        settings in arb_settings(),
        cut in 0.0..1.0_f64,
    ) {
        let registry = build_registry(&settings).unwrap();
        let up_to = candles.last().unwrap().candle_time;
        let (all_events, all_acc) =
            tick(&registry, &candles, None, up_to, FactorAccumulators::default());

        let split = candles[((candles.len() - 1) as f64 * cut) as usize].candle_time;
        let (mut first, acc) = tick(&registry, &candles, None, split, FactorAccumulators::default());
        // Warm path: second call carries accumulators over.
        let (second, warm_acc) = tick(&registry, &candles, Some(split), up_to, acc.clone());
        first.extend(second);
        prop_assert_eq!(&first, &all_events);
        prop_assert_eq!(&warm_acc, &all_acc);

        // Cold path: second call starts from a replay of the first half.
        let first_half: Vec<FactorEvent> =
            all_events.iter().filter(|e| e.candle_time <= split).cloned().collect();
        let (cold_acc, _) = bootstrap_accumulators(&registry, &series(), first_half).unwrap();
        prop_assert_eq!(&cold_acc, &acc);
        let (_, cold_final) = tick(&registry, &candles, Some(split), up_to, cold_acc);
        prop_assert_eq!(cold_final, all_acc);
    }
}

// ── 3. Pen shape ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn pens_chain_and_point_the_right_way(candles in arb_candles(), settings in arb_settings()) {
        let registry = build_registry(&settings).unwrap();
        let up_to = candles.last().unwrap().candle_time;
        let (events, _) = tick(&registry, &candles, None, up_to, FactorAccumulators::default());

        let pens: Vec<ConfirmedPen> = events
            .iter()
            .filter(|e| e.kind == "pen.confirmed")
            .map(|e| e.payload_as().unwrap())
            .collect();
        for pen in &pens {
            // An outside candle can be both pivots, giving a zero-length leg.
            prop_assert!(pen.start_time <= pen.end_time);
            prop_assert!(pen.visible_time > pen.end_time);
            if pen.end_price != pen.start_price {
                prop_assert_eq!(pen.direction as f64, (pen.end_price - pen.start_price).signum());
            }
        }
        for pair in pens.windows(2) {
            prop_assert_eq!(pair[0].end_time, pair[1].start_time);
            prop_assert_eq!(pair[0].end_price, pair[1].start_price);
        }
    }
}

// ── 4. Zone bands ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn zone_band_is_frozen_until_death(candles in arb_candles()) {
        let settings = EngineSettings::default().with_pivot_windows(1, 1);
        let registry = build_registry(&settings).unwrap();
        let up_to = candles.last().unwrap().candle_time;
        let (events, _) = tick(&registry, &candles, None, up_to, FactorAccumulators::default());

        let mut formed: HashMap<(i64, i64), Zhongshu> = HashMap::new();
        for event in &events {
            match event.kind.as_str() {
                "zhongshu.formed" => {
                    let zone: Zhongshu = event.payload_as().unwrap();
                    prop_assert!(zone.zd < zone.zg);
                    formed.insert((zone.start_time, zone.formed_time), zone);
                }
                "zhongshu.dead" => {
                    let dead: ZhongshuDead = event.payload_as().unwrap();
                    let zone = formed.get(&(dead.zone.start_time, dead.zone.formed_time));
                    prop_assert!(zone.is_some(), "death without formation");
                    let zone = zone.unwrap();
                    prop_assert_eq!(zone.zd, dead.zone.zd);
                    prop_assert_eq!(zone.zg, dead.zone.zg);
                    prop_assert!(dead.zone.end_time >= zone.end_time);
                }
                _ => {}
            }
        }
    }
}
