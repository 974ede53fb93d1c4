//! Ingest orchestrator — the public entry point.
//!
//! One `ingest_closed(series, up_to)` call:
//! 1. compares the series' stored fingerprint with the current one and, on a
//!    mismatch, trims the candle ledger and schedules a clear + full replay
//! 2. plans the candle window and the new tick times
//! 3. takes warm accumulators, or bootstraps them from the event log
//! 4. runs the tick executor
//! 5. persists events, head snapshots, head time (and fingerprint) in one
//!    transaction
//!
//! Any failure before step 5 commits leaves the store exactly as it was.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use structlab_core::domain::FactorEvent;
use structlab_core::fingerprint::registry_fingerprint;
use structlab_core::planner::{plan_window, CandleBatch, RebuildWindow, WindowRequest};
use structlab_core::{
    build_registry, EngineSettings, FactorAccumulators, FactorRegistry, PluginError,
    RegistryError, SeriesId, SettingsError, TickExecutor, Time,
};

use crate::candles::{CandleError, CandleLedger};
use crate::loader::{LoadError, RebuildLoader};
use crate::store::{HeadSnapshot, LedgerStore, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ledger store: {0}")]
    Store(#[from] StoreError),
    #[error("candle ledger: {0}")]
    Candles(#[from] CandleError),
    #[error("plugin failed: {0}")]
    Plugin(#[from] PluginError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("invalid series id: {0}")]
    InvalidSeries(String),
    #[error("series `{series}` is at {head_time:?}, behind requested t={requested}")]
    OutOfSync {
        series: String,
        head_time: Option<Time>,
        requested: Time,
    },
}

impl From<LoadError> for IngestError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Store(e) => Self::Store(e),
            LoadError::Plugin(e) => Self::Plugin(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Rebuild even when the fingerprint matches.
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub series_id: String,
    pub rebuilt: bool,
    pub fingerprint: Option<String>,
    /// Tick times processed by this call.
    pub processed: usize,
    pub inserted_events: usize,
    pub head_time: Option<Time>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestPath {
    /// Fingerprint matches; continue from the stored head.
    Normal,
    /// Nothing derived yet for this series.
    Initialize,
    /// Fingerprint changed (or forced); derived history is discarded.
    Rebuild,
}

#[derive(Debug, Clone)]
struct WarmState {
    head_time: Time,
    fingerprint: String,
    acc: FactorAccumulators,
}

pub struct Orchestrator {
    settings: EngineSettings,
    registry: FactorRegistry,
    store: LedgerStore,
    candles: Arc<dyn CandleLedger>,
    series_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    warm: Mutex<HashMap<String, WarmState>>,
}

impl Orchestrator {
    /// Build with the default factor set filtered by `settings.enabled_factors`.
    pub fn new(
        settings: EngineSettings,
        store: LedgerStore,
        candles: Arc<dyn CandleLedger>,
    ) -> Result<Self, IngestError> {
        settings.validate()?;
        let registry = build_registry(&settings)?;
        Ok(Self::with_registry(settings, registry, store, candles))
    }

    /// Build around an explicit registry.
    pub fn with_registry(
        settings: EngineSettings,
        registry: FactorRegistry,
        store: LedgerStore,
        candles: Arc<dyn CandleLedger>,
    ) -> Self {
        Self {
            settings,
            registry,
            store,
            candles,
            series_locks: Mutex::new(HashMap::new()),
            warm: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &FactorRegistry {
        &self.registry
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Give the store back, e.g. to reopen it under different settings.
    pub fn into_store(self) -> LedgerStore {
        self.store
    }

    /// The fingerprint this build records for `series_id`.
    pub fn fingerprint(&self, series_id: &str) -> String {
        registry_fingerprint(
            &self.registry,
            series_id,
            self.settings.logic_version.as_deref(),
        )
    }

    // ── Ingest ───────────────────────────────────────────────────────

    pub fn ingest_closed(&self, series_id: &str, up_to: Time) -> Result<IngestResult, IngestError> {
        self.ingest_closed_with(series_id, up_to, IngestOptions::default())
    }

    pub fn ingest_closed_with(
        &self,
        series_id: &str,
        up_to: Time,
        options: IngestOptions,
    ) -> Result<IngestResult, IngestError> {
        let series = series_id
            .parse::<SeriesId>()
            .map_err(|e| IngestError::InvalidSeries(e.to_string()))?;

        let lock = self.series_lock(series.as_str());
        // A panicked ingest committed nothing, so the lock's data is still valid.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let result = self.ingest_locked(&series, up_to, options);
        if result.is_err() {
            self.drop_warm(series.as_str());
        }
        result
    }

    /// Ingest several series in parallel. Results keep the input order.
    pub fn ingest_many(&self, requests: &[(String, Time)]) -> Vec<Result<IngestResult, IngestError>> {
        requests
            .par_iter()
            .map(|(series_id, up_to)| self.ingest_closed(series_id, *up_to))
            .collect()
    }

    fn ingest_locked(
        &self,
        series: &SeriesId,
        up_to: Time,
        options: IngestOptions,
    ) -> Result<IngestResult, IngestError> {
        let sid = series.as_str();
        let fingerprint = self.fingerprint(sid);
        let stored = self.store.get_fingerprint(sid)?;
        let head_time = self.store.head_time(sid)?;

        let path = match (&stored, head_time) {
            _ if options.force_rebuild => IngestPath::Rebuild,
            (Some(fp), _) if fp.fingerprint == fingerprint => IngestPath::Normal,
            (None, None) => IngestPath::Initialize,
            _ => IngestPath::Rebuild,
        };
        info!(series = %series, up_to, ?path, "ingest start");

        if path == IngestPath::Rebuild {
            let removed = self
                .candles
                .trim_to_recent(sid, self.settings.rebuild_keep_candles)?;
            info!(
                series = %series,
                stored = ?stored.as_ref().map(|fp| fp.fingerprint.as_str()),
                current = %fingerprint,
                forced = options.force_rebuild,
                trimmed_candles = removed,
                "rebuilding derived history"
            );
        }

        let effective_head = match path {
            IngestPath::Normal => head_time,
            IngestPath::Initialize | IngestPath::Rebuild => None,
        };
        if let Some(head) = effective_head {
            if up_to <= head {
                debug!(series = %series, head, up_to, "nothing new to ingest");
                return Ok(self.unchanged(sid, fingerprint, head_time));
            }
        }

        // ── Window ───────────────────────────────────────────────────
        let first_time = self
            .candles
            .first_time(sid)?
            .ok_or_else(|| CandleError::UnknownSeries(sid.to_string()))?;
        let rebuild_window = match effective_head {
            Some(_) => None,
            None => Some(RebuildWindow {
                first_time,
                candle_count: self
                    .candles
                    .count_closed_between_times(sid, first_time, up_to)?,
            }),
        };
        let plan = plan_window(&WindowRequest {
            head_time: effective_head,
            up_to,
            timeframe_seconds: series.timeframe_seconds(),
            lookback_candles: self.settings.lookback_candles,
            max_plugin_window: self.registry.max_lookback_window(),
            margin: self.settings.window_margin,
            rebuild: rebuild_window,
        });
        let candles = self
            .candles
            .get_closed_between_times(sid, plan.start_time, up_to, plan.read_limit)?;
        let batch = CandleBatch::new(candles, effective_head, up_to);
        debug!(
            series = %series,
            start_time = plan.start_time,
            read_limit = plan.read_limit,
            forced = plan.forced,
            loaded = batch.candles.len(),
            to_process = batch.process_times.len(),
            "planned window"
        );

        if batch.is_empty() && path != IngestPath::Rebuild {
            return Ok(self.unchanged(sid, fingerprint, head_time));
        }

        // ── Accumulators ─────────────────────────────────────────────
        let mut diagnostic: Option<FactorEvent> = None;
        let acc = match effective_head {
            None => FactorAccumulators::default(),
            Some(head) => match self.take_warm(sid, head, &fingerprint) {
                Some(acc) => acc,
                None => {
                    let loaded =
                        RebuildLoader::new(&self.store, &self.registry, self.settings.rebuild_scan_limit)
                            .bootstrap(series, head)?;
                    diagnostic = loaded.diagnostic;
                    loaded.accumulators
                }
            },
        };

        // ── Tick ─────────────────────────────────────────────────────
        let run = TickExecutor::new(&self.registry).run_incremental(series, &batch, acc)?;

        // ── Persist ──────────────────────────────────────────────────
        let mut txn = self.store.connect();
        match path {
            IngestPath::Rebuild => {
                txn.clear_series(sid);
                txn.set_fingerprint(sid, &fingerprint);
            }
            IngestPath::Initialize => txn.set_fingerprint(sid, &fingerprint),
            IngestPath::Normal => {}
        }
        let mut events = run.events;
        events.extend(diagnostic);
        let inserted_events = txn.insert_events(&events)?;
        for head in &run.heads {
            txn.insert_head_snapshot(sid, &head.factor_name, head.candle_time, head.payload.clone())?;
        }
        if let Some(last) = run.last_time {
            txn.upsert_head_time(sid, last);
        }
        txn.commit()?;

        let new_head = match (effective_head, run.last_time) {
            (Some(h), Some(t)) => Some(h.max(t)),
            (h, t) => t.or(h),
        };
        if let Some(head) = new_head {
            self.put_warm(
                sid,
                WarmState {
                    head_time: head,
                    fingerprint: fingerprint.clone(),
                    acc: run.accumulators,
                },
            );
        }

        info!(
            series = %series,
            processed = run.ticks,
            inserted_events,
            head_time = ?new_head,
            rebuilt = path == IngestPath::Rebuild,
            "ingest done"
        );
        Ok(IngestResult {
            series_id: sid.to_string(),
            rebuilt: path == IngestPath::Rebuild,
            fingerprint: Some(fingerprint),
            processed: run.ticks,
            inserted_events,
            head_time: new_head,
        })
    }

    fn unchanged(&self, sid: &str, fingerprint: String, head_time: Option<Time>) -> IngestResult {
        IngestResult {
            series_id: sid.to_string(),
            rebuilt: false,
            fingerprint: Some(fingerprint),
            processed: 0,
            inserted_events: 0,
            head_time,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn head_time(&self, series_id: &str) -> Result<Option<Time>, IngestError> {
        Ok(self.store.head_time(series_id)?)
    }

    pub fn get_events_between_times(
        &self,
        series_id: &str,
        factor: Option<&str>,
        start: Time,
        end: Time,
        limit: usize,
    ) -> Result<Vec<FactorEvent>, IngestError> {
        Ok(self
            .store
            .get_events_between_times(series_id, factor, start, end, limit)?)
    }

    pub fn get_head_at_or_before(
        &self,
        series_id: &str,
        factor: &str,
        time: Time,
    ) -> Result<Option<HeadSnapshot>, IngestError> {
        Ok(self.store.get_head_at_or_before(series_id, factor, time)?)
    }

    /// Like `get_events_between_times`, but refuses to answer for a series
    /// whose head is behind `requested_time`.
    pub fn read_events_fresh(
        &self,
        series_id: &str,
        factor: Option<&str>,
        start: Time,
        end: Time,
        limit: usize,
        requested_time: Time,
    ) -> Result<Vec<FactorEvent>, IngestError> {
        self.ensure_fresh(series_id, requested_time)?;
        self.get_events_between_times(series_id, factor, start, end, limit)
    }

    pub fn read_head_fresh(
        &self,
        series_id: &str,
        factor: &str,
        requested_time: Time,
    ) -> Result<Option<HeadSnapshot>, IngestError> {
        self.ensure_fresh(series_id, requested_time)?;
        self.get_head_at_or_before(series_id, factor, requested_time)
    }

    fn ensure_fresh(&self, series_id: &str, requested: Time) -> Result<(), IngestError> {
        let head_time = self.store.head_time(series_id)?;
        match head_time {
            Some(head) if head >= requested => Ok(()),
            _ => Err(IngestError::OutOfSync {
                series: series_id.to_string(),
                head_time,
                requested,
            }),
        }
    }

    // ── Per-series state ─────────────────────────────────────────────

    fn series_lock(&self, series_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .series_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(series_id.to_string()).or_default())
    }

    /// Warm accumulators, if they were left at exactly this head under this
    /// fingerprint.
    fn take_warm(&self, series_id: &str, head_time: Time, fingerprint: &str) -> Option<FactorAccumulators> {
        let mut warm = self.warm.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = warm.remove(series_id)?;
        if entry.head_time == head_time && entry.fingerprint == fingerprint {
            debug!(series = series_id, head_time, "using warm accumulators");
            Some(entry.acc)
        } else {
            None
        }
    }

    fn put_warm(&self, series_id: &str, state: WarmState) {
        self.warm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(series_id.to_string(), state);
    }

    fn drop_warm(&self, series_id: &str) {
        self.warm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(series_id);
    }
}
