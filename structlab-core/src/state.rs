//! Derived accumulators carried across ticks.
//!
//! Every field here must be reconstructible from the event ledger alone:
//! cold start replays events into a fresh `FactorAccumulators` and must land
//! on a value equal to the one continuous ticking produced.

use serde::{Deserialize, Serialize};

use crate::domain::{AnchorRef, ConfirmedPen, PivotPoint, Time, Zhongshu};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorAccumulators {
    pub pivot: PivotAccumulator,
    pub pen: PenAccumulator,
    pub zhongshu: ZhongshuAccumulator,
    pub anchor: AnchorAccumulator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PivotAccumulator {
    pub last_major: Option<PivotPoint>,
    pub last_minor: Option<PivotPoint>,
    pub major_count: u64,
    pub minor_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PenAccumulator {
    /// Working stack of effective pivots, at most three deep.
    pub effective_pivots: Vec<PivotPoint>,
    pub confirmed: Vec<ConfirmedPen>,
}

impl PenAccumulator {
    pub fn last_confirmed(&self) -> Option<&ConfirmedPen> {
        self.confirmed.last()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZhongshuAccumulator {
    pub alive: Option<Zhongshu>,
    /// Earliest start time an entry pen may have; set by the last death.
    pub next_entry_min_start: Option<Time>,
    pub formed_count: u64,
    pub dead_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnchorAccumulator {
    pub current: Option<AnchorRef>,
    /// Strength recorded at the last persisted switch.
    pub strength: f64,
    pub switch_count: u64,
}
