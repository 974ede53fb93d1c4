//! Tick executor.
//!
//! Time points are processed in strictly ascending order; within one time
//! point every plugin runs exactly once, in topological order. Both orders are
//! part of the observable contract: downstream plugins read what upstream
//! plugins wrote earlier in the same tick.

use serde_json::Value;
use tracing::trace;

use crate::domain::{FactorEvent, SeriesId, Time};
use crate::planner::CandleBatch;
use crate::plugin::{PluginError, TickState};
use crate::registry::FactorRegistry;
use crate::state::FactorAccumulators;

/// A head payload produced at the last processed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadPayload {
    pub factor_name: String,
    pub candle_time: Time,
    pub payload: Value,
}

/// Outcome of one incremental run.
#[derive(Debug, Clone, Default)]
pub struct TickRun {
    pub events: Vec<FactorEvent>,
    pub accumulators: FactorAccumulators,
    pub heads: Vec<HeadPayload>,
    pub ticks: usize,
    pub last_time: Option<Time>,
}

pub struct TickExecutor<'r> {
    registry: &'r FactorRegistry,
}

impl<'r> TickExecutor<'r> {
    pub fn new(registry: &'r FactorRegistry) -> Self {
        Self { registry }
    }

    /// Advance `accumulators` across every time in `batch.process_times`.
    ///
    /// On error nothing is returned; the caller's accumulators are untouched
    /// because they were moved in and dropped.
    pub fn run_incremental(
        &self,
        series_id: &SeriesId,
        batch: &CandleBatch,
        accumulators: FactorAccumulators,
    ) -> Result<TickRun, PluginError> {
        let mut acc = accumulators;
        let mut events = Vec::new();
        let mut heads = Vec::new();
        let last = batch.process_times.len().checked_sub(1);

        for (n, &time) in batch.process_times.iter().enumerate() {
            let idx = *batch
                .time_to_idx
                .get(&time)
                .ok_or_else(|| PluginError::Candle {
                    factor: "engine".into(),
                    reason: format!("process time {time} missing from candle window"),
                })?;

            let mut state = TickState::new(
                series_id,
                &batch.candles,
                &batch.time_to_idx,
                time,
                idx,
                &mut acc,
            );
            for plugin in self.registry.ordered() {
                plugin.run_tick(&mut state)?;
            }

            if Some(n) == last {
                for plugin in self.registry.ordered() {
                    if !plugin.capabilities().head_snapshot {
                        continue;
                    }
                    if let Some(payload) = plugin.build_head_snapshot(&state) {
                        heads.push(HeadPayload {
                            factor_name: plugin.name().to_string(),
                            candle_time: time,
                            payload,
                        });
                    }
                }
            }

            trace!(time, events = state.events.len(), "tick");
            events.append(&mut state.events);
        }

        Ok(TickRun {
            events,
            accumulators: acc,
            heads,
            ticks: batch.process_times.len(),
            last_time: batch.process_times.last().copied(),
        })
    }
}
