//! The factor plugin contract and the per-tick context it operates on.
//!
//! A plugin is a capability set. Only `run_tick` is required; the rebuild
//! hooks and head snapshots have no-op defaults. Which optional hooks a plugin
//! actually relies on is declared up front through `Capabilities`, and the
//! registry checks those declarations once, at construction.
//!
//! # Look-ahead contamination guard
//! `run_tick` at time `t` may read candles with index `<= state.idx` only.
//! Candles after `idx` can be present in the window (the batch is loaded up to
//! `up_to`) and must never influence an event emitted at `t`.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::domain::{
    Candle, ConfirmedPen, EventPayload, FactorEvent, PenCandidate, PivotPoint, SeriesId, Time,
    Zhongshu, ZhongshuDead,
};
use crate::graph::FactorSpec;
use crate::state::FactorAccumulators;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PluginError {
    #[error("{factor}: malformed `{kind}` payload: {reason}")]
    Payload {
        factor: String,
        kind: String,
        reason: String,
    },
    #[error("{factor}: candle window error: {reason}")]
    Candle { factor: String, reason: String },
    #[error("{factor}: invariant violated: {reason}")]
    Invariant { factor: String, reason: String },
}

impl PluginError {
    pub fn payload(factor: &str, event: &FactorEvent, reason: impl ToString) -> Self {
        Self::Payload {
            factor: factor.to_string(),
            kind: event.kind.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Optional hooks a plugin participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Receives its own persisted events during rebuild and bootstraps from them.
    pub rebuild: bool,
    /// Publishes a head snapshot after each ingest.
    pub head_snapshot: bool,
}

impl Capabilities {
    pub const TICK_ONLY: Self = Self {
        rebuild: false,
        head_snapshot: false,
    };
    pub const FULL: Self = Self {
        rebuild: true,
        head_snapshot: true,
    };
}

/// Results one plugin hands to its downstream plugins within the same tick.
///
/// Cleared at every tick; nothing here survives into the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickScratch {
    pub new_major_pivots: Vec<PivotPoint>,
    pub new_minor_pivots: Vec<PivotPoint>,
    pub new_pens: Vec<ConfirmedPen>,
    pub pen_candidate: Option<PenCandidate>,
    /// Zones formed this tick, paired with their entry pen.
    pub formed_zhongshu: Vec<(Zhongshu, ConfirmedPen)>,
    pub dead_zhongshu: Vec<ZhongshuDead>,
}

/// Mutable context threaded through every plugin for one time point.
pub struct TickState<'a> {
    pub series_id: &'a SeriesId,
    pub candles: &'a [Candle],
    pub time_to_idx: &'a HashMap<Time, usize>,
    pub time: Time,
    pub idx: usize,
    /// Anchor strength as it stood when this tick began.
    pub baseline_anchor_strength: f64,
    pub acc: &'a mut FactorAccumulators,
    pub scratch: TickScratch,
    pub events: Vec<FactorEvent>,
}

impl<'a> TickState<'a> {
    pub fn new(
        series_id: &'a SeriesId,
        candles: &'a [Candle],
        time_to_idx: &'a HashMap<Time, usize>,
        time: Time,
        idx: usize,
        acc: &'a mut FactorAccumulators,
    ) -> Self {
        let baseline_anchor_strength = acc.anchor.strength;
        Self {
            series_id,
            candles,
            time_to_idx,
            time,
            idx,
            baseline_anchor_strength,
            acc,
            scratch: TickScratch::default(),
            events: Vec::new(),
        }
    }

    pub fn timeframe_seconds(&self) -> i64 {
        self.series_id.timeframe_seconds()
    }

    /// Candles visible at this tick, oldest first, ending with the current one.
    pub fn visible(&self) -> &'a [Candle] {
        let candles = self.candles;
        &candles[..=self.idx]
    }

    pub fn current(&self) -> &'a Candle {
        let candles = self.candles;
        &candles[self.idx]
    }

    pub fn emit(
        &mut self,
        factor_name: &str,
        kind: &str,
        event_key: String,
        payload: impl Into<EventPayload>,
    ) {
        self.events.push(FactorEvent::new(
            self.series_id.as_str(),
            factor_name,
            self.time,
            kind,
            event_key,
            payload,
        ));
    }
}

/// Working set of a rebuild: per-plugin event buckets and the accumulators
/// being reconstructed from them.
#[derive(Debug, Default)]
pub struct ReplayState {
    pub buckets: BTreeMap<String, Vec<FactorEvent>>,
    pub acc: FactorAccumulators,
}

impl ReplayState {
    pub fn bucket(&self, factor_name: &str) -> &[FactorEvent] {
        self.buckets
            .get(factor_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A factor in the engine.
///
/// Implementations are pure: no I/O, no clocks, no randomness. Everything a
/// plugin emits is a function of the accumulators at tick start and the
/// candles up to the current index.
pub trait FactorPlugin: Send + Sync {
    fn spec(&self) -> &FactorSpec;

    fn name(&self) -> &str {
        &self.spec().name
    }

    /// Event kinds this plugin writes to the ledger.
    fn event_kinds(&self) -> &'static [&'static str];

    fn capabilities(&self) -> Capabilities {
        Capabilities::TICK_ONLY
    }

    /// Candles of context this plugin needs on each side of a tick.
    fn lookback_window(&self) -> usize {
        0
    }

    /// Derivation settings that feed the series fingerprint.
    fn settings(&self) -> Value {
        Value::Null
    }

    /// Hash of the plugin's own logic.
    fn source_identity(&self) -> String;

    /// Advance this plugin's accumulators by one time point.
    fn run_tick(&self, state: &mut TickState<'_>) -> Result<(), PluginError>;

    /// Claim a stored event for this plugin's rebuild bucket.
    ///
    /// Returns false when the event is not one of this plugin's kinds.
    fn collect_rebuild_event(&self, event: &FactorEvent, bucket: &mut Vec<FactorEvent>) -> bool {
        if self.event_kinds().contains(&event.kind.as_str()) {
            bucket.push(event.clone());
            true
        } else {
            false
        }
    }

    /// Put a rebuild bucket into the order its events were originally emitted.
    fn sort_rebuild_events(&self, _bucket: &mut [FactorEvent]) {}

    /// Reconstruct this plugin's accumulators from its sorted bucket and the
    /// upstream accumulators already rebuilt.
    fn bootstrap_from_history(
        &self,
        _series_id: &SeriesId,
        _replay: &mut ReplayState,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Live state to publish at the end of an ingest. `None` means nothing yet.
    fn build_head_snapshot(&self, _state: &TickState<'_>) -> Option<Value> {
        None
    }
}
