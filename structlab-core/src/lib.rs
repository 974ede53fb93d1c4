//! StructLab Core — candle-driven chart-structure factor engine.
//!
//! This crate is pure computation; it performs no I/O:
//! - Domain types (candles, series ids, structure records, typed events)
//! - Factor dependency graph with a deterministic topological order
//! - Plugin contract, registry, and the per-tick context
//! - Tick executor and rebuild replay
//! - Ingest-window planning and series fingerprinting
//! - Built-in factors: pivot, pen, zhongshu, anchor

pub mod domain;
pub mod factors;
pub mod fingerprint;
pub mod graph;
pub mod planner;
pub mod plugin;
pub mod registry;
pub mod replay;
pub mod settings;
pub mod state;
pub mod tick;

pub use domain::{Candle, EventPayload, FactorEvent, SeriesId, Time};
pub use factors::build_registry;
pub use graph::{FactorGraph, FactorSpec, GraphError};
pub use plugin::{Capabilities, FactorPlugin, PluginError, ReplayState, TickState};
pub use registry::{FactorRegistry, RegistryError};
pub use settings::{EngineSettings, SettingsError};
pub use state::FactorAccumulators;
pub use tick::{TickExecutor, TickRun};
