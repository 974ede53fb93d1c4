//! Rebuild loader — reconstructs accumulators from the persisted event log.
//!
//! Used whenever warm accumulators are unavailable. The bounded single read
//! is the fast path; when it fills up to `scan_limit` the loader re-reads the
//! window page by page instead of truncating, and reports the degradation as
//! a diagnostic event for the caller to persist.

use tracing::{debug, warn};

use structlab_core::domain::{FactorEvent, RebuildDiagnostic};
use structlab_core::fingerprint::ENGINE_IDENTITY;
use structlab_core::replay::{bootstrap_accumulators, collect_buckets, ReplayStats};
use structlab_core::{FactorAccumulators, FactorRegistry, PluginError, ReplayState, SeriesId, Time};

use crate::store::{LedgerStore, StoreError};

pub const KIND_SCAN_PAGED: &str = "rebuild.scan_paged";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// What a load read and how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStats {
    pub scanned_rows: usize,
    /// Zero on the single-read path.
    pub pages: usize,
    pub replay: ReplayStats,
}

#[derive(Debug)]
pub struct LoadedBuckets {
    pub replay: ReplayState,
    pub stats: LoadStats,
    /// Present when the scan limit forced the paged path.
    pub diagnostic: Option<FactorEvent>,
}

#[derive(Debug)]
pub struct Bootstrapped {
    pub accumulators: FactorAccumulators,
    pub stats: LoadStats,
    pub diagnostic: Option<FactorEvent>,
}

pub struct RebuildLoader<'a> {
    store: &'a LedgerStore,
    registry: &'a FactorRegistry,
    scan_limit: usize,
}

impl<'a> RebuildLoader<'a> {
    pub fn new(store: &'a LedgerStore, registry: &'a FactorRegistry, scan_limit: usize) -> Self {
        Self {
            store,
            registry,
            scan_limit: scan_limit.max(1),
        }
    }

    /// Every persisted event of `series` in `[start, end]`, in
    /// `(candle_time, seq)` order. Never truncated.
    fn read_window(
        &self,
        series: &SeriesId,
        start: Time,
        end: Time,
    ) -> Result<(Vec<FactorEvent>, LoadStats, Option<FactorEvent>), StoreError> {
        let rows =
            self.store
                .get_events_between_times(series.as_str(), None, start, end, self.scan_limit)?;
        if rows.len() < self.scan_limit {
            let stats = LoadStats {
                scanned_rows: rows.len(),
                ..LoadStats::default()
            };
            return Ok((rows, stats, None));
        }

        let mut events = Vec::with_capacity(rows.len());
        let mut pages = 0;
        for page in self
            .store
            .iter_events_between_times(series.as_str(), None, start, end, self.scan_limit)
        {
            events.extend(page?.into_iter().map(|row| row.event));
            pages += 1;
        }
        warn!(
            series = %series,
            scan_limit = self.scan_limit,
            scanned_rows = events.len(),
            pages,
            "rebuild scan limit reached, fell back to paged scan"
        );
        let diagnostic = FactorEvent::new(
            series.as_str(),
            ENGINE_IDENTITY,
            end,
            KIND_SCAN_PAGED,
            format!("scan_paged:{start}:{end}"),
            RebuildDiagnostic {
                window_start: start,
                window_end: end,
                scan_limit: self.scan_limit,
                scanned_rows: events.len(),
                pages,
            },
        );
        let stats = LoadStats {
            scanned_rows: events.len(),
            pages,
            ..LoadStats::default()
        };
        Ok((events, stats, Some(diagnostic)))
    }

    /// Read `[start, end]` and sort each row into its owner's replay bucket.
    pub fn collect_rebuild_event_buckets(
        &self,
        series: &SeriesId,
        start: Time,
        end: Time,
    ) -> Result<LoadedBuckets, LoadError> {
        let (events, mut stats, diagnostic) = self.read_window(series, start, end)?;
        let (replay, replay_stats) = collect_buckets(self.registry, events);
        stats.replay = replay_stats;
        Ok(LoadedBuckets {
            replay,
            stats,
            diagnostic,
        })
    }

    /// Reconstruct accumulators as of `head_time` from the whole history.
    pub fn bootstrap(&self, series: &SeriesId, head_time: Time) -> Result<Bootstrapped, LoadError> {
        let (events, mut stats, diagnostic) = self.read_window(series, 0, head_time)?;
        let (accumulators, replay_stats) = bootstrap_accumulators(self.registry, series, events)?;
        stats.replay = replay_stats;
        debug!(
            series = %series,
            head_time,
            scanned_rows = stats.scanned_rows,
            pages = stats.pages,
            "loader bootstrap complete"
        );
        Ok(Bootstrapped {
            accumulators,
            stats,
            diagnostic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use structlab_core::domain::{Candle, EventPayload};
    use structlab_core::planner::CandleBatch;
    use structlab_core::{build_registry, EngineSettings, TickExecutor};

    fn series() -> SeriesId {
        "test:spot:X/Y:1m".parse().unwrap()
    }

    fn seeded_store(registry: &FactorRegistry) -> (LedgerStore, FactorAccumulators, usize) {
        let candles: Vec<Candle> = (0..300)
            .map(|i| {
                let x = i as f64;
                let close = 100.0 + (x * 0.21).sin() * 8.0;
                Candle::new(i * 60, close - 0.5, close + 1.0, close - 1.5, close, 1.0)
            })
            .collect();
        let up_to = candles[299].candle_time;
        let run = TickExecutor::new(registry)
            .run_incremental(
                &series(),
                &CandleBatch::new(candles, None, up_to),
                FactorAccumulators::default(),
            )
            .unwrap();
        let store = LedgerStore::in_memory();
        let n = store.insert_events(&run.events).unwrap();
        (store, run.accumulators, n)
    }

    #[test]
    fn single_read_path_has_no_diagnostic() {
        let registry = build_registry(&EngineSettings::default().with_pivot_windows(2, 1)).unwrap();
        let (store, expected, n) = seeded_store(&registry);
        let loaded = RebuildLoader::new(&store, &registry, n + 1)
            .bootstrap(&series(), i64::MAX)
            .unwrap();
        assert!(loaded.diagnostic.is_none());
        assert_eq!(loaded.stats.pages, 0);
        assert_eq!(loaded.stats.scanned_rows, n);
        assert_eq!(loaded.accumulators, expected);
    }

    #[test]
    fn scan_limit_pages_without_losing_rows() {
        let registry = build_registry(&EngineSettings::default().with_pivot_windows(2, 1)).unwrap();
        let (store, expected, n) = seeded_store(&registry);
        assert!(n > 10);
        let loaded = RebuildLoader::new(&store, &registry, 7)
            .bootstrap(&series(), i64::MAX)
            .unwrap();
        assert_eq!(loaded.stats.scanned_rows, n);
        assert_eq!(loaded.stats.pages, n.div_ceil(7));
        assert_eq!(loaded.accumulators, expected);

        let diagnostic = loaded.diagnostic.unwrap();
        assert_eq!(diagnostic.factor_name, ENGINE_IDENTITY);
        assert_eq!(diagnostic.kind, KIND_SCAN_PAGED);
        match diagnostic.payload {
            EventPayload::RebuildDiagnostic(d) => {
                assert_eq!(d.scanned_rows, n);
                assert_eq!(d.scan_limit, 7);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn buckets_group_rows_by_owner() {
        let registry = build_registry(&EngineSettings::default().with_pivot_windows(2, 1)).unwrap();
        let (store, _, n) = seeded_store(&registry);
        let loaded = RebuildLoader::new(&store, &registry, 10_000)
            .collect_rebuild_event_buckets(&series(), 0, i64::MAX)
            .unwrap();
        let bucketed: usize = loaded.replay.buckets.values().map(Vec::len).sum();
        assert_eq!(bucketed, n);
        assert_eq!(loaded.stats.replay.dispatched, n);
        assert!(!loaded.replay.bucket("pivot").is_empty());
    }
}
