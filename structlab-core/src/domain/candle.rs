//! Candle — the closed OHLCV unit the engine ticks over.

use serde::{Deserialize, Serialize};

use super::Time;

/// Closed OHLCV candle for a single series.
///
/// `candle_time` is the candle's open time in unix seconds. Candles handed to
/// the engine are closed: their values never change after they are persisted
/// upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub candle_time: Time,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn new(candle_time: Time, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            candle_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic OHLC sanity check: finite values, high >= open/close >= low.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite();
        finite
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }
}
