//! Factor events — the immutable, append-only rows of the factor ledger.
//!
//! Payloads are one internally tagged enum with a struct per event kind.
//! Plugins narrow a payload back to its struct through `TryFrom`, never by
//! poking at loosely typed JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::structures::{
    AnchorSwitch, ConfirmedPen, PivotPoint, RebuildDiagnostic, Zhongshu, ZhongshuDead,
};
use super::Time;

/// Typed payload of a factor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Pivot(PivotPoint),
    Pen(ConfirmedPen),
    ZhongshuFormed(Zhongshu),
    ZhongshuDead(ZhongshuDead),
    AnchorSwitch(AnchorSwitch),
    RebuildDiagnostic(RebuildDiagnostic),
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Pivot(_) => "pivot",
            Self::Pen(_) => "pen",
            Self::ZhongshuFormed(_) => "zhongshu_formed",
            Self::ZhongshuDead(_) => "zhongshu_dead",
            Self::AnchorSwitch(_) => "anchor_switch",
            Self::RebuildDiagnostic(_) => "rebuild_diagnostic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected `{expected}` payload, found `{found}`")]
pub struct PayloadError {
    pub expected: &'static str,
    pub found: &'static str,
}

macro_rules! payload_conversion {
    ($ty:ty, $variant:ident, $expected:literal) => {
        impl TryFrom<&EventPayload> for $ty {
            type Error = PayloadError;

            fn try_from(payload: &EventPayload) -> Result<Self, Self::Error> {
                match payload {
                    EventPayload::$variant(inner) => Ok(inner.clone()),
                    other => Err(PayloadError {
                        expected: $expected,
                        found: other.type_name(),
                    }),
                }
            }
        }

        impl From<$ty> for EventPayload {
            fn from(inner: $ty) -> Self {
                EventPayload::$variant(inner)
            }
        }
    };
}

payload_conversion!(PivotPoint, Pivot, "pivot");
payload_conversion!(ConfirmedPen, Pen, "pen");
payload_conversion!(Zhongshu, ZhongshuFormed, "zhongshu_formed");
payload_conversion!(ZhongshuDead, ZhongshuDead, "zhongshu_dead");
payload_conversion!(AnchorSwitch, AnchorSwitch, "anchor_switch");
payload_conversion!(RebuildDiagnostic, RebuildDiagnostic, "rebuild_diagnostic");

/// One immutable row of the factor ledger.
///
/// `(series_id, factor_name, event_key)` is the uniqueness key: re-inserting
/// the same key is silently absorbed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorEvent {
    pub series_id: String,
    pub factor_name: String,
    pub candle_time: Time,
    pub kind: String,
    pub event_key: String,
    pub payload: EventPayload,
}

impl FactorEvent {
    pub fn new(
        series_id: impl Into<String>,
        factor_name: impl Into<String>,
        candle_time: Time,
        kind: impl Into<String>,
        event_key: impl Into<String>,
        payload: impl Into<EventPayload>,
    ) -> Self {
        Self {
            series_id: series_id.into(),
            factor_name: factor_name.into(),
            candle_time,
            kind: kind.into(),
            event_key: event_key.into(),
            payload: payload.into(),
        }
    }

    /// Narrow the payload to a concrete record type.
    pub fn payload_as<T>(&self) -> Result<T, PayloadError>
    where
        T: for<'a> TryFrom<&'a EventPayload, Error = PayloadError>,
    {
        T::try_from(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::structures::PivotDirection;

    fn pivot_event() -> FactorEvent {
        FactorEvent::new(
            "binance:spot:BTC/USDT:1m",
            "pivot",
            180,
            "pivot.major",
            "major:120:resistance",
            PivotPoint {
                pivot_time: 120,
                price: 12.0,
                direction: PivotDirection::Resistance,
                visible_time: 180,
                index: 0,
            },
        )
    }

    #[test]
    fn payload_is_internally_tagged() {
        let json = serde_json::to_value(&pivot_event().payload).unwrap();
        assert_eq!(json["type"], "pivot");
        assert_eq!(json["direction"], "resistance");
        assert_eq!(json["pivot_time"], 120);
    }

    #[test]
    fn payload_narrowing() {
        let event = pivot_event();
        let pivot: PivotPoint = event.payload_as().unwrap();
        assert_eq!(pivot.price, 12.0);

        let err = event.payload_as::<ConfirmedPen>().unwrap_err();
        assert_eq!(err.expected, "pen");
        assert_eq!(err.found, "pivot");
    }

    #[test]
    fn event_json_survives_storage() {
        let event = pivot_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: FactorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
