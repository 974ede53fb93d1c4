//! Candle ledger contract and an in-memory implementation.
//!
//! The engine only reads closed candles and, on rebuild, trims old ones. Where
//! candles come from is the caller's business.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use thiserror::Error;

use structlab_core::domain::Candle;
use structlab_core::Time;

#[derive(Debug, Error)]
pub enum CandleError {
    #[error("candle source error: {0}")]
    Source(String),
    #[error("no candles for series `{0}`")]
    UnknownSeries(String),
    #[error("rejected candle at t={time}: {reason}")]
    Rejected { time: Time, reason: String },
}

/// Read-only (plus retention trim) view of closed candles, per series.
pub trait CandleLedger: Send + Sync {
    fn head_time(&self, series_id: &str) -> Result<Option<Time>, CandleError>;

    fn first_time(&self, series_id: &str) -> Result<Option<Time>, CandleError>;

    /// Ascending candles in `[start, end]`; the first `limit` rows from `start`.
    fn get_closed_between_times(
        &self,
        series_id: &str,
        start: Time,
        end: Time,
        limit: usize,
    ) -> Result<Vec<Candle>, CandleError>;

    fn count_closed_between_times(
        &self,
        series_id: &str,
        start: Time,
        end: Time,
    ) -> Result<usize, CandleError>;

    /// Keep only the newest `keep` candles. Returns how many were removed.
    fn trim_to_recent(&self, series_id: &str, keep: usize) -> Result<usize, CandleError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCandleLedger {
    series: RwLock<HashMap<String, BTreeMap<Time, Candle>>>,
}

impl InMemoryCandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert candles, replacing any at the same time. Every candle is checked
    /// before any is written.
    pub fn append(&self, series_id: &str, candles: &[Candle]) -> Result<usize, CandleError> {
        if let Some(bad) = candles.iter().find(|c| !c.is_sane()) {
            return Err(CandleError::Rejected {
                time: bad.candle_time,
                reason: format!(
                    "inconsistent OHLC o={} h={} l={} c={}",
                    bad.open, bad.high, bad.low, bad.close
                ),
            });
        }
        let mut guard = self.write()?;
        let rows = guard.entry(series_id.to_string()).or_default();
        for candle in candles {
            rows.insert(candle.candle_time, *candle);
        }
        Ok(candles.len())
    }

    pub fn len(&self, series_id: &str) -> Result<usize, CandleError> {
        Ok(self.read()?.get(series_id).map_or(0, BTreeMap::len))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, BTreeMap<Time, Candle>>>, CandleError>
    {
        self.series
            .read()
            .map_err(|_| CandleError::Source("candle ledger lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, BTreeMap<Time, Candle>>>, CandleError>
    {
        self.series
            .write()
            .map_err(|_| CandleError::Source("candle ledger lock poisoned".into()))
    }
}

impl CandleLedger for InMemoryCandleLedger {
    fn head_time(&self, series_id: &str) -> Result<Option<Time>, CandleError> {
        Ok(self
            .read()?
            .get(series_id)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    fn first_time(&self, series_id: &str) -> Result<Option<Time>, CandleError> {
        Ok(self
            .read()?
            .get(series_id)
            .and_then(|rows| rows.keys().next().copied()))
    }

    fn get_closed_between_times(
        &self,
        series_id: &str,
        start: Time,
        end: Time,
        limit: usize,
    ) -> Result<Vec<Candle>, CandleError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .read()?
            .get(series_id)
            .map(|rows| rows.range(start..=end).take(limit).map(|(_, c)| *c).collect())
            .unwrap_or_default())
    }

    fn count_closed_between_times(
        &self,
        series_id: &str,
        start: Time,
        end: Time,
    ) -> Result<usize, CandleError> {
        if start > end {
            return Ok(0);
        }
        Ok(self
            .read()?
            .get(series_id)
            .map_or(0, |rows| rows.range(start..=end).count()))
    }

    fn trim_to_recent(&self, series_id: &str, keep: usize) -> Result<usize, CandleError> {
        let mut guard = self.write()?;
        let Some(rows) = guard.get_mut(series_id) else {
            return Ok(0);
        };
        let excess = rows.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }
        let Some(&cut) = rows.keys().nth(excess) else {
            let removed = rows.len();
            rows.clear();
            return Ok(removed);
        };
        *rows = rows.split_off(&cut);
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIES: &str = "test:spot:X/Y:1m";

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::new(i as i64 * 60, 10.0, 11.0, 9.0, 10.5, 1.0))
            .collect()
    }

    #[test]
    fn reads_are_bounded_and_ascending() {
        let ledger = InMemoryCandleLedger::new();
        ledger.append(SERIES, &candles(10)).unwrap();
        let rows = ledger.get_closed_between_times(SERIES, 120, 10_000, 3).unwrap();
        let times: Vec<Time> = rows.iter().map(|c| c.candle_time).collect();
        assert_eq!(times, vec![120, 180, 240]);
        assert_eq!(ledger.count_closed_between_times(SERIES, 120, 300).unwrap(), 4);
        assert_eq!(ledger.first_time(SERIES).unwrap(), Some(0));
        assert_eq!(ledger.head_time(SERIES).unwrap(), Some(540));
    }

    #[test]
    fn insane_candles_are_rejected_whole_batch() {
        let ledger = InMemoryCandleLedger::new();
        let mut batch = candles(3);
        batch.push(Candle::new(180, 10.0, 9.0, 8.0, 10.0, 1.0));
        assert!(matches!(
            ledger.append(SERIES, &batch),
            Err(CandleError::Rejected { time: 180, .. })
        ));
        assert_eq!(ledger.len(SERIES).unwrap(), 0);
    }

    #[test]
    fn trim_keeps_the_newest() {
        let ledger = InMemoryCandleLedger::new();
        ledger.append(SERIES, &candles(10)).unwrap();
        assert_eq!(ledger.trim_to_recent(SERIES, 4).unwrap(), 6);
        assert_eq!(ledger.first_time(SERIES).unwrap(), Some(360));
        assert_eq!(ledger.len(SERIES).unwrap(), 4);
        assert_eq!(ledger.trim_to_recent(SERIES, 4).unwrap(), 0);
        assert_eq!(ledger.trim_to_recent("other", 4).unwrap(), 0);
    }
}
