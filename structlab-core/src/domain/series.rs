//! Series identity: `exchange:market:symbol:timeframe`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesIdError {
    #[error("series id `{0}` must have the form exchange:market:symbol:timeframe")]
    Malformed(String),
    #[error("unknown timeframe `{0}` (expected <n>s, <n>m, <n>h, <n>d or <n>w)")]
    UnknownTimeframe(String),
}

/// Parsed series identifier.
///
/// The raw string is the storage key everywhere; the parsed parts exist so the
/// engine can derive `timeframe_seconds` without a side table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeriesId {
    raw: String,
    exchange: String,
    market: String,
    symbol: String,
    timeframe: String,
    timeframe_seconds: i64,
}

impl SeriesId {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn timeframe_seconds(&self) -> i64 {
        self.timeframe_seconds
    }
}

/// Convert a timeframe label (`1m`, `4h`, `1d`) into seconds.
pub fn timeframe_seconds(timeframe: &str) -> Option<i64> {
    let split = timeframe.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = timeframe.split_at(split);
    let count: i64 = digits.parse().ok()?;
    if count <= 0 {
        return None;
    }
    let unit_seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    count.checked_mul(unit_seconds)
}

impl FromStr for SeriesId {
    type Err = SeriesIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Symbols use '/' (BTC/USDT), never ':'.
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(SeriesIdError::Malformed(s.to_string()));
        }
        let timeframe = parts[3];
        let seconds = timeframe_seconds(timeframe)
            .ok_or_else(|| SeriesIdError::UnknownTimeframe(timeframe.to_string()))?;
        Ok(Self {
            raw: s.to_string(),
            exchange: parts[0].to_string(),
            market: parts[1].to_string(),
            symbol: parts[2].to_string(),
            timeframe: timeframe.to_string(),
            timeframe_seconds: seconds,
        })
    }
}

impl TryFrom<String> for SeriesId {
    type Error = SeriesIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeriesId> for String {
    fn from(id: SeriesId) -> Self {
        id.raw
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
