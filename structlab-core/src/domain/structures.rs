//! Chart-structure records produced by the factor plugins.
//!
//! Every record here is immutable once emitted. Accumulators hold copies of
//! these records; the ledger stores them inside `EventPayload`.

use serde::{Deserialize, Serialize};

use super::Time;

/// Which side of the market a pivot marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PivotDirection {
    /// Local low.
    Support,
    /// Local high.
    Resistance,
}

impl PivotDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Resistance => "resistance",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Support => Self::Resistance,
            Self::Resistance => Self::Support,
        }
    }
}

/// A confirmed local extremum.
///
/// `visible_time` is the time of the candle that completed the right-hand
/// window; the pivot must not be observed before it. `index` is the pivot's
/// ordinal among pivots of the same variant in this series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotPoint {
    pub pivot_time: Time,
    pub price: f64,
    pub direction: PivotDirection,
    pub visible_time: Time,
    pub index: u64,
}

impl PivotPoint {
    /// True if `self` is a more extreme pivot of the same direction than `other`.
    pub fn is_more_extreme_than(&self, other: &PivotPoint) -> bool {
        match self.direction {
            PivotDirection::Resistance => self.price > other.price,
            PivotDirection::Support => self.price < other.price,
        }
    }
}

/// A confirmed price leg between two effective pivots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedPen {
    pub start_time: Time,
    pub end_time: Time,
    pub start_price: f64,
    pub end_price: f64,
    /// +1 for an up leg, -1 for a down leg.
    pub direction: i8,
    pub visible_time: Time,
    pub start_index: u64,
    pub end_index: u64,
}

impl ConfirmedPen {
    pub fn strength(&self) -> f64 {
        (self.end_price - self.start_price).abs()
    }

    pub fn low(&self) -> f64 {
        self.start_price.min(self.end_price)
    }

    pub fn high(&self) -> f64 {
        self.start_price.max(self.end_price)
    }
}

/// The still-forming leg from the last effective pivot to the most extreme
/// opposite price seen since. Recomputed every tick, never persisted as an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenCandidate {
    pub start_time: Time,
    pub end_time: Time,
    pub start_price: f64,
    pub end_price: f64,
    pub direction: i8,
}

impl PenCandidate {
    pub fn strength(&self) -> f64 {
        (self.end_price - self.start_price).abs()
    }
}

/// A live consolidation zone.
///
/// `zg`/`zd` are frozen at formation. Only `end_time` and `visible_time`
/// advance while the zone is alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zhongshu {
    pub start_time: Time,
    pub end_time: Time,
    /// Upper bound of the band.
    pub zg: f64,
    /// Lower bound of the band.
    pub zd: f64,
    pub entry_direction: i8,
    pub entry_start_time: Time,
    pub formed_time: Time,
    pub visible_time: Time,
}

/// Terminal record of a zone whose band was fully exited by a pen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZhongshuDead {
    pub zone: Zhongshu,
    pub death_time: Time,
    pub exit_pen_start_time: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Confirmed,
    Candidate,
}

impl AnchorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Candidate => "candidate",
        }
    }
}

/// The tracked reference leg. Identity is `start_time` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRef {
    pub kind: AnchorKind,
    pub start_time: Time,
    pub end_time: Time,
    pub start_price: f64,
    pub end_price: f64,
    pub direction: i8,
}

impl AnchorRef {
    pub fn strength(&self) -> f64 {
        (self.end_price - self.start_price).abs()
    }

    pub fn same_identity(&self, other: &AnchorRef) -> bool {
        self.start_time == other.start_time
    }
}

impl From<&ConfirmedPen> for AnchorRef {
    fn from(pen: &ConfirmedPen) -> Self {
        Self {
            kind: AnchorKind::Confirmed,
            start_time: pen.start_time,
            end_time: pen.end_time,
            start_price: pen.start_price,
            end_price: pen.end_price,
            direction: pen.direction,
        }
    }
}

impl From<&PenCandidate> for AnchorRef {
    fn from(candidate: &PenCandidate) -> Self {
        Self {
            kind: AnchorKind::Candidate,
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            start_price: candidate.start_price,
            end_price: candidate.end_price,
            direction: candidate.direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    ZhongshuEntry,
    StrongPen,
}

impl SwitchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZhongshuEntry => "zhongshu_entry",
            Self::StrongPen => "strong_pen",
        }
    }
}

/// A persisted change of the tracked anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorSwitch {
    pub switch_time: Time,
    pub visible_time: Time,
    pub reason: SwitchReason,
    pub previous: Option<AnchorRef>,
    pub current: AnchorRef,
    pub strength: f64,
}

/// Recorded when a rebuild scan exceeded its single-pass limit and fell back
/// to paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildDiagnostic {
    pub window_start: Time,
    pub window_end: Time,
    pub scan_limit: usize,
    pub scanned_rows: usize,
    pub pages: usize,
}

/// Sign of a price move, falling back to `fallback` on a flat move.
pub fn move_direction(start_price: f64, end_price: f64, fallback: i8) -> i8 {
    if end_price > start_price {
        1
    } else if end_price < start_price {
        -1
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pivot(direction: PivotDirection, price: f64) -> PivotPoint {
        PivotPoint {
            pivot_time: 60,
            price,
            direction,
            visible_time: 120,
            index: 0,
        }
    }

    #[test]
    fn more_extreme_follows_direction() {
        let high = pivot(PivotDirection::Resistance, 110.0);
        let higher = pivot(PivotDirection::Resistance, 111.0);
        assert!(higher.is_more_extreme_than(&high));
        assert!(!high.is_more_extreme_than(&higher));

        let low = pivot(PivotDirection::Support, 90.0);
        let lower = pivot(PivotDirection::Support, 89.0);
        assert!(lower.is_more_extreme_than(&low));
        assert!(!low.is_more_extreme_than(&lower));
    }

    #[test]
    fn pen_range_and_strength() {
        let pen = ConfirmedPen {
            start_time: 60,
            end_time: 120,
            start_price: 130.0,
            end_price: 100.0,
            direction: -1,
            visible_time: 180,
            start_index: 0,
            end_index: 1,
        };
        assert_eq!(pen.low(), 100.0);
        assert_eq!(pen.high(), 130.0);
        assert_eq!(pen.strength(), 30.0);
        let anchor = AnchorRef::from(&pen);
        assert_eq!(anchor.kind, AnchorKind::Confirmed);
        assert_eq!(anchor.strength(), 30.0);
    }

    #[test]
    fn move_direction_sign() {
        assert_eq!(move_direction(1.0, 2.0, -1), 1);
        assert_eq!(move_direction(2.0, 1.0, 1), -1);
        assert_eq!(move_direction(2.0, 2.0, 1), 1);
    }

    #[test]
    fn pivot_direction_serializes_snake_case() {
        let json = serde_json::to_string(&PivotDirection::Resistance).unwrap();
        assert_eq!(json, "\"resistance\"");
        assert_eq!(PivotDirection::Support.opposite(), PivotDirection::Resistance);
    }
}
