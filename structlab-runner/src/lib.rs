//! StructLab Runner — the stateful side of the factor engine.
//!
//! This crate builds on `structlab-core` to provide:
//! - Ledger store: events, head snapshots, head time, fingerprints
//!   (in-memory or JSONL-journalled)
//! - Candle ledger contract with an in-memory implementation
//! - Rebuild loader with scan-limit paging
//! - Ingest orchestrator with fingerprint-triggered rebuilds
//! - TOML runner configuration

pub mod candles;
pub mod config;
pub mod loader;
pub mod orchestrator;
pub mod store;

pub use candles::{CandleError, CandleLedger, InMemoryCandleLedger};
pub use config::{ConfigError, RunnerConfig, StoreConfig};
pub use loader::{LoadError, LoadStats, RebuildLoader};
pub use orchestrator::{IngestError, IngestOptions, IngestResult, Orchestrator};
pub use store::{
    EventPager, HeadSnapshot, LedgerStore, LedgerTxn, SeriesFingerprint, StoreError, StoredEvent,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn ledger_store_is_send_sync() {
        assert_send::<LedgerStore>();
        assert_sync::<LedgerStore>();
    }

    #[test]
    fn candle_ledger_is_send_sync() {
        assert_send::<InMemoryCandleLedger>();
        assert_sync::<InMemoryCandleLedger>();
    }

    #[test]
    fn orchestrator_is_send_sync() {
        assert_send::<Orchestrator>();
        assert_sync::<Orchestrator>();
    }

    #[test]
    fn results_are_send() {
        assert_send::<IngestResult>();
        assert_send::<IngestError>();
    }
}
