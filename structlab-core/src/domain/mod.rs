//! Domain types for structlab

pub mod candle;
pub mod event;
pub mod series;
pub mod structures;

pub use candle::Candle;
pub use event::{EventPayload, FactorEvent, PayloadError};
pub use series::{timeframe_seconds, SeriesId, SeriesIdError};
pub use structures::{
    move_direction, AnchorKind, AnchorRef, AnchorSwitch, ConfirmedPen, PenCandidate,
    PivotDirection, PivotPoint, RebuildDiagnostic, SwitchReason, Zhongshu, ZhongshuDead,
};

/// Candle time in unix seconds.
pub type Time = i64;
