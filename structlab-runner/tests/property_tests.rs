//! Property tests for ingest invariants.
//!
//! Uses proptest to verify, over random candle walks and random sequences of
//! `up_to` calls:
//! 1. Head time never regresses and re-ingesting the same time adds nothing
//! 2. The final ledger does not depend on how ingestion was chunked

use std::sync::Arc;

use proptest::prelude::*;

use structlab_core::domain::{Candle, FactorEvent};
use structlab_core::{EngineSettings, Time};
use structlab_runner::{InMemoryCandleLedger, LedgerStore, Orchestrator};

const SERIES: &str = "test:spot:X/Y:1m";
const TF: i64 = 60;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_candles() -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::vec((-6i32..=6, 0i32..=4, 0i32..=4), 30..140).prop_map(|steps| {
        let mut price = 200.0_f64;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (delta, up, down))| {
                let open = price;
                price = (price + delta as f64 * 0.5).max(20.0);
                Candle::new(
                    i as i64 * TF,
                    open,
                    open.max(price) + up as f64 * 0.5,
                    open.min(price) - down as f64 * 0.5,
                    price,
                    1.0,
                )
            })
            .collect()
    })
}

/// Fractions of the series length, in call order (not sorted).
fn arb_calls() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0..=1.0_f64, 1..8)
}

fn build(candles: &[Candle]) -> Orchestrator {
    let ledger = Arc::new(InMemoryCandleLedger::new());
    ledger.append(SERIES, candles).unwrap();
    Orchestrator::new(
        EngineSettings::default().with_pivot_windows(2, 1),
        LedgerStore::in_memory(),
        ledger,
    )
    .unwrap()
}

fn time_at(candles: &[Candle], fraction: f64) -> Time {
    candles[((candles.len() - 1) as f64 * fraction) as usize].candle_time
}

fn events(orch: &Orchestrator) -> Vec<FactorEvent> {
    orch.get_events_between_times(SERIES, None, 0, Time::MAX, usize::MAX)
        .unwrap()
}

// ── 1. Monotonic head, idempotent re-ingest ──────────────────────────

proptest! {
    #[test]
    fn head_is_monotonic_and_reingest_is_noop(candles in arb_candles(), calls in arb_calls()) {
        let orch = build(&candles);
        let mut high_water: Option<Time> = None;

        for fraction in calls {
            let up_to = time_at(&candles, fraction);
            orch.ingest_closed(SERIES, up_to).unwrap();
            let head = orch.head_time(SERIES).unwrap();
            prop_assert!(head >= high_water);
            prop_assert_eq!(head, Some(high_water.map_or(up_to, |h| h.max(up_to))));
            high_water = head;

            let count = orch.store().event_count(SERIES).unwrap();
            let again = orch.ingest_closed(SERIES, up_to).unwrap();
            prop_assert_eq!(again.processed, 0);
            prop_assert_eq!(again.inserted_events, 0);
            prop_assert_eq!(orch.store().event_count(SERIES).unwrap(), count);
            prop_assert_eq!(orch.head_time(SERIES).unwrap(), head);
        }
    }
}

// ── 2. Chunking independence ─────────────────────────────────────────

proptest! {
    #[test]
    fn chunked_ingest_equals_one_shot(candles in arb_candles(), calls in arb_calls()) {
        let up_to = candles.last().unwrap().candle_time;

        let one_shot = build(&candles);
        one_shot.ingest_closed(SERIES, up_to).unwrap();

        let chunked = build(&candles);
        for fraction in calls {
            chunked.ingest_closed(SERIES, time_at(&candles, fraction)).unwrap();
        }
        chunked.ingest_closed(SERIES, up_to).unwrap();

        prop_assert_eq!(events(&chunked), events(&one_shot));
    }
}
