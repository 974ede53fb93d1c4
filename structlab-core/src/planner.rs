//! Ingest-window planning.
//!
//! Decides how many candles to read for one ingest call and which of them are
//! new. Reads always start early enough that every plugin sees its full
//! context window on both sides of the current head.

use std::collections::HashMap;

use crate::domain::{Candle, Time};

/// Set on the forced path: the whole series must be visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildWindow {
    pub first_time: Time,
    /// Exact count of candles in `[first_time, up_to]`.
    pub candle_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub head_time: Option<Time>,
    pub up_to: Time,
    pub timeframe_seconds: i64,
    pub lookback_candles: usize,
    pub max_plugin_window: usize,
    pub margin: usize,
    pub rebuild: Option<RebuildWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub start_time: Time,
    pub read_limit: usize,
    pub forced: bool,
}

pub fn plan_window(req: &WindowRequest) -> WindowPlan {
    if let Some(rebuild) = req.rebuild {
        return WindowPlan {
            start_time: rebuild.first_time,
            read_limit: rebuild.candle_count,
            forced: true,
        };
    }

    let tf = req.timeframe_seconds.max(1);
    let context = 2 * req.max_plugin_window as i64;
    let lookback = req.lookback_candles as i64 + context + req.margin as i64;

    let mut start_time = (req.up_to - lookback * tf).max(0);
    if let Some(head) = req.head_time {
        start_time = start_time.min((head - context * tf).max(0));
    }
    let span = ((req.up_to - start_time).max(0) / tf) as usize;

    WindowPlan {
        start_time,
        read_limit: span + 1 + req.margin,
        forced: false,
    }
}

/// Candles loaded for one ingest, with the subset still to be processed.
#[derive(Debug, Clone, Default)]
pub struct CandleBatch {
    pub candles: Vec<Candle>,
    pub time_to_idx: HashMap<Time, usize>,
    /// `{ t : head_time < t <= up_to }`, ascending. Empty means nothing new.
    pub process_times: Vec<Time>,
}

impl CandleBatch {
    /// `candles` must be ascending by time with no duplicates.
    pub fn new(candles: Vec<Candle>, head_time: Option<Time>, up_to: Time) -> Self {
        let time_to_idx = candles
            .iter()
            .enumerate()
            .map(|(i, c)| (c.candle_time, i))
            .collect();
        let process_times = candles
            .iter()
            .map(|c| c.candle_time)
            .filter(|&t| head_time.map_or(true, |h| t > h) && t <= up_to)
            .collect();
        Self {
            candles,
            time_to_idx,
            process_times,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.process_times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(head_time: Option<Time>, up_to: Time) -> WindowRequest {
        WindowRequest {
            head_time,
            up_to,
            timeframe_seconds: 60,
            lookback_candles: 100,
            max_plugin_window: 5,
            margin: 8,
            rebuild: None,
        }
    }

    #[test]
    fn normal_path_reads_lookback_plus_context() {
        let plan = plan_window(&request(Some(60_000), 60_060));
        // lookback = 100 + 10 + 8 = 118 candles
        assert_eq!(plan.start_time, 60_060 - 118 * 60);
        assert_eq!(plan.read_limit, 118 + 1 + 8);
        assert!(!plan.forced);
    }

    #[test]
    fn start_never_passes_head_context() {
        // Head lags far behind up_to: start is pulled back to head - 2w.
        let plan = plan_window(&request(Some(6_000), 600_000));
        assert_eq!(plan.start_time, 6_000 - 10 * 60);
        assert_eq!(plan.read_limit, ((600_000 - 5_400) / 60) as usize + 1 + 8);
    }

    #[test]
    fn start_clamps_at_zero() {
        let plan = plan_window(&request(Some(120), 180));
        assert_eq!(plan.start_time, 0);
        assert_eq!(plan.read_limit, 3 + 1 + 8);
    }

    #[test]
    fn forced_path_uses_exact_count() {
        let mut req = request(None, 6_000);
        req.rebuild = Some(RebuildWindow {
            first_time: 60,
            candle_count: 100,
        });
        let plan = plan_window(&req);
        assert_eq!(
            plan,
            WindowPlan {
                start_time: 60,
                read_limit: 100,
                forced: true
            }
        );
    }

    #[test]
    fn batch_selects_times_after_head() {
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle::new(i * 60, 1.0, 2.0, 0.5, 1.5, 1.0))
            .collect();
        let batch = CandleBatch::new(candles, Some(120), 180);
        assert_eq!(batch.process_times, vec![180]);
        assert_eq!(batch.time_to_idx[&240], 4);

        let nothing_new = CandleBatch::new(batch.candles.clone(), Some(240), 240);
        assert!(nothing_new.is_empty());

        let cold = CandleBatch::new(batch.candles.clone(), None, 240);
        assert_eq!(cold.process_times, vec![0, 60, 120, 180, 240]);
    }
}
