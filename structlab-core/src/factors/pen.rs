//! Pen factor — confirmed legs over the effective-pivot stack.
//!
//! Major pivots feed a stack of effective pivots. A same-direction pivot
//! replaces the top only if it is more extreme; an opposite pivot is pushed.
//! Every push that leaves three or more entries confirms the leg between the
//! third- and second-to-last entries.

use serde_json::Value;
use tracing::debug;

use super::{narrow, pivot};
use crate::domain::{
    move_direction, Candle, ConfirmedPen, FactorEvent, PenCandidate, PivotDirection, PivotPoint,
    SeriesId,
};
use crate::fingerprint::source_hash;
use crate::graph::FactorSpec;
use crate::plugin::{Capabilities, FactorPlugin, PluginError, ReplayState, TickState};

pub const NAME: &str = "pen";
pub const KIND_CONFIRMED: &str = "pen.confirmed";

const STACK_DEPTH: usize = 3;

/// Push one pivot onto the effective stack. Returns the pen it confirms.
pub fn push_effective_pivot(stack: &mut Vec<PivotPoint>, pivot: PivotPoint) -> Option<ConfirmedPen> {
    if let Some(top) = stack.last_mut() {
        if top.direction == pivot.direction {
            if pivot.is_more_extreme_than(top) {
                *top = pivot;
            }
            return None;
        }
    }

    stack.push(pivot);
    let n = stack.len();
    if n < STACK_DEPTH {
        return None;
    }
    let start = &stack[n - 3];
    let end = &stack[n - 2];
    let fallback = match end.direction {
        PivotDirection::Resistance => 1,
        PivotDirection::Support => -1,
    };
    let pen = ConfirmedPen {
        start_time: start.pivot_time,
        end_time: end.pivot_time,
        start_price: start.price,
        end_price: end.price,
        direction: move_direction(start.price, end.price, fallback),
        visible_time: stack[n - 1].visible_time,
        start_index: start.index,
        end_index: end.index,
    };
    stack.drain(..n - STACK_DEPTH);
    Some(pen)
}

/// The leg still forming from the last effective pivot to the most extreme
/// opposite price seen since, current candle included.
pub fn extending_candidate(stack: &[PivotPoint], visible: &[Candle]) -> Option<PenCandidate> {
    let last = stack.last()?;
    let from = visible.partition_point(|c| c.candle_time <= last.pivot_time);
    let tail = &visible[from..];
    let first = tail.first()?;

    let (end_time, end_price) = match last.direction {
        PivotDirection::Resistance => tail.iter().fold((first.candle_time, first.low), |best, c| {
            if c.low < best.1 {
                (c.candle_time, c.low)
            } else {
                best
            }
        }),
        PivotDirection::Support => tail.iter().fold((first.candle_time, first.high), |best, c| {
            if c.high > best.1 {
                (c.candle_time, c.high)
            } else {
                best
            }
        }),
    };
    let fallback = match last.direction {
        PivotDirection::Resistance => -1,
        PivotDirection::Support => 1,
    };
    Some(PenCandidate {
        start_time: last.pivot_time,
        end_time,
        start_price: last.price,
        end_price,
        direction: move_direction(last.price, end_price, fallback),
    })
}

#[derive(Debug, Clone)]
pub struct PenPlugin {
    spec: FactorSpec,
}

impl PenPlugin {
    pub fn new() -> Self {
        Self {
            spec: FactorSpec::new(NAME, &[pivot::NAME]),
        }
    }
}

impl Default for PenPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorPlugin for PenPlugin {
    fn spec(&self) -> &FactorSpec {
        &self.spec
    }

    fn event_kinds(&self) -> &'static [&'static str] {
        &[KIND_CONFIRMED]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn source_identity(&self) -> String {
        source_hash(include_str!("pen.rs"))
    }

    fn run_tick(&self, state: &mut TickState<'_>) -> Result<(), PluginError> {
        let pivots = std::mem::take(&mut state.scratch.new_major_pivots);
        for pivot in &pivots {
            let pen = match push_effective_pivot(&mut state.acc.pen.effective_pivots, pivot.clone())
            {
                Some(pen) => pen,
                None => continue,
            };
            state.acc.pen.confirmed.push(pen.clone());
            state.scratch.new_pens.push(pen.clone());
            let key = format!("confirmed:{}:{}", pen.start_time, pen.end_time);
            state.emit(NAME, KIND_CONFIRMED, key, pen);
        }
        state.scratch.new_major_pivots = pivots;

        state.scratch.pen_candidate =
            extending_candidate(&state.acc.pen.effective_pivots, state.visible());
        Ok(())
    }

    fn sort_rebuild_events(&self, bucket: &mut [FactorEvent]) {
        bucket.sort_by_key(|e| {
            let start = e
                .payload_as::<ConfirmedPen>()
                .map(|p| p.start_time)
                .unwrap_or(i64::MAX);
            (e.candle_time, start)
        });
    }

    fn bootstrap_from_history(
        &self,
        series_id: &SeriesId,
        replay: &mut ReplayState,
    ) -> Result<(), PluginError> {
        let confirmed = replay
            .bucket(NAME)
            .iter()
            .map(|e| narrow::<ConfirmedPen>(NAME, e))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stack = Vec::with_capacity(STACK_DEPTH + 1);
        let mut regenerated = 0usize;
        for event in replay.bucket(pivot::NAME) {
            if event.kind != pivot::KIND_MAJOR {
                continue;
            }
            let point: PivotPoint = narrow(pivot::NAME, event)?;
            if push_effective_pivot(&mut stack, point).is_some() {
                regenerated += 1;
            }
        }
        if regenerated != confirmed.len() {
            debug!(
                series = %series_id,
                stored = confirmed.len(),
                regenerated,
                "pen history and pivot replay disagree"
            );
        }

        replay.acc.pen.effective_pivots = stack;
        replay.acc.pen.confirmed = confirmed;
        Ok(())
    }

    fn build_head_snapshot(&self, state: &TickState<'_>) -> Option<Value> {
        let pens = &state.acc.pen;
        if pens.confirmed.is_empty() && state.scratch.pen_candidate.is_none() {
            return None;
        }
        Some(serde_json::json!({
            "confirmed_count": pens.confirmed.len(),
            "last_confirmed": pens.last_confirmed(),
            "extending": state.scratch.pen_candidate,
        }))
    }
}
