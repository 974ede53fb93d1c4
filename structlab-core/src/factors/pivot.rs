//! Pivot factor — local extrema with delayed visibility.
//!
//! A candle at index `i` is a resistance pivot over window `w` iff its high is
//! strictly greater than the `w` highs to its left and greater-or-equal to the
//! `w` highs to its right. Support is symmetric on lows. The pivot is only
//! known once candle `i + w` exists, so it is emitted at that tick.
//!
//! Major and minor pivots differ only in `w`. Minor pivots are additionally
//! scoped to the segment after the last major pivot.

use serde_json::Value;

use super::narrow;
use crate::domain::{Candle, FactorEvent, PivotDirection, PivotPoint, SeriesId};
use crate::fingerprint::source_hash;
use crate::graph::FactorSpec;
use crate::plugin::{Capabilities, FactorPlugin, PluginError, ReplayState, TickState};

pub const NAME: &str = "pivot";
pub const KIND_MAJOR: &str = "pivot.major";
pub const KIND_MINOR: &str = "pivot.minor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Major,
    Minor,
}

impl Variant {
    fn label(self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Major => KIND_MAJOR,
            Self::Minor => KIND_MINOR,
        }
    }
}

/// Directions of the pivots at `i`, resistance first.
///
/// Reads candles `i - w ..= i + w` only. Returns nothing when either side of
/// the window is out of range.
pub fn detect_pivots(candles: &[Candle], i: usize, w: usize) -> Vec<PivotDirection> {
    let mut found = Vec::with_capacity(2);
    if w == 0 || i < w || i + w >= candles.len() {
        return found;
    }
    let center = &candles[i];
    let left = &candles[i - w..i];
    let right = &candles[i + 1..=i + w];

    if left.iter().all(|c| center.high > c.high) && right.iter().all(|c| center.high >= c.high) {
        found.push(PivotDirection::Resistance);
    }
    if left.iter().all(|c| center.low < c.low) && right.iter().all(|c| center.low <= c.low) {
        found.push(PivotDirection::Support);
    }
    found
}

#[derive(Debug, Clone)]
pub struct PivotPlugin {
    spec: FactorSpec,
    major_window: usize,
    minor_window: usize,
}

impl PivotPlugin {
    pub fn new(major_window: usize, minor_window: usize) -> Self {
        Self {
            spec: FactorSpec::new(NAME, &[]),
            major_window,
            minor_window,
        }
    }

    fn window(&self, variant: Variant) -> usize {
        match variant {
            Variant::Major => self.major_window,
            Variant::Minor => self.minor_window,
        }
    }

    fn scan(&self, state: &mut TickState<'_>, variant: Variant) {
        let w = self.window(variant);
        // Only `[idx - 2w, idx]` is read, so `i + w == idx` is the newest
        // candle consulted.
        if w == 0 || state.idx < 2 * w {
            return;
        }
        let i = state.idx - w;
        let visible = state.visible();
        let center = &visible[i];

        for direction in detect_pivots(visible, i, w) {
            let pivots = &mut state.acc.pivot;
            if variant == Variant::Minor {
                if let Some(major) = &pivots.last_major {
                    if center.candle_time <= major.pivot_time {
                        continue;
                    }
                }
            }
            let index = match variant {
                Variant::Major => pivots.major_count,
                Variant::Minor => pivots.minor_count,
            };
            let point = PivotPoint {
                pivot_time: center.candle_time,
                price: match direction {
                    PivotDirection::Resistance => center.high,
                    PivotDirection::Support => center.low,
                },
                direction,
                visible_time: state.time,
                index,
            };
            match variant {
                Variant::Major => {
                    pivots.major_count += 1;
                    pivots.last_major = Some(point.clone());
                    state.scratch.new_major_pivots.push(point.clone());
                }
                Variant::Minor => {
                    pivots.minor_count += 1;
                    pivots.last_minor = Some(point.clone());
                    state.scratch.new_minor_pivots.push(point.clone());
                }
            }
            let key = format!(
                "{}:{}:{}",
                variant.label(),
                point.pivot_time,
                direction.as_str()
            );
            state.emit(NAME, variant.kind(), key, point);
        }
    }
}

fn variant_rank(kind: &str) -> u8 {
    if kind == KIND_MAJOR {
        0
    } else {
        1
    }
}

impl FactorPlugin for PivotPlugin {
    fn spec(&self) -> &FactorSpec {
        &self.spec
    }

    fn event_kinds(&self) -> &'static [&'static str] {
        &[KIND_MAJOR, KIND_MINOR]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn lookback_window(&self) -> usize {
        self.major_window.max(self.minor_window)
    }

    fn settings(&self) -> Value {
        serde_json::json!({
            "major_window": self.major_window,
            "minor_window": self.minor_window,
        })
    }

    fn source_identity(&self) -> String {
        source_hash(include_str!("pivot.rs"))
    }

    fn run_tick(&self, state: &mut TickState<'_>) -> Result<(), PluginError> {
        self.scan(state, Variant::Major);
        self.scan(state, Variant::Minor);
        Ok(())
    }

    fn sort_rebuild_events(&self, bucket: &mut [FactorEvent]) {
        bucket.sort_by_key(|e| {
            let index = e
                .payload_as::<PivotPoint>()
                .map(|p| p.index)
                .unwrap_or(u64::MAX);
            (e.candle_time, variant_rank(&e.kind), index)
        });
    }

    fn bootstrap_from_history(
        &self,
        _series_id: &SeriesId,
        replay: &mut ReplayState,
    ) -> Result<(), PluginError> {
        let mut acc = std::mem::take(&mut replay.acc.pivot);
        for event in replay.bucket(NAME) {
            let point: PivotPoint = narrow(NAME, event)?;
            if event.kind == KIND_MAJOR {
                acc.major_count = point.index + 1;
                acc.last_major = Some(point);
            } else {
                acc.minor_count = point.index + 1;
                acc.last_minor = Some(point);
            }
        }
        replay.acc.pivot = acc;
        Ok(())
    }

    fn build_head_snapshot(&self, state: &TickState<'_>) -> Option<Value> {
        let pivots = &state.acc.pivot;
        if pivots.major_count + pivots.minor_count == 0 {
            return None;
        }
        serde_json::to_value(pivots).ok()
    }
}
