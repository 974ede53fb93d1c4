//! Series fingerprinting — the cache-invalidation key for derived history.
//!
//! The fingerprint covers everything that can change what the engine would
//! emit for the same candles:
//! - the active plugin set and its topological order
//! - each plugin's derivation settings
//! - the source identity of each plugin and of the engine itself
//! - an explicit logic-version override
//!
//! Operational knobs (lookback, margin, scan limit, retention) are left out.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::registry::FactorRegistry;

/// Identity key under which the engine's own source hash is recorded.
pub const ENGINE_IDENTITY: &str = "engine";

const ENGINE_SOURCES: &[&str] = &[
    include_str!("tick.rs"),
    include_str!("plugin.rs"),
    include_str!("replay.rs"),
    include_str!("planner.rs"),
    include_str!("state.rs"),
];

/// blake3 hex of a source text.
pub fn source_hash(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

pub fn engine_source_identity() -> String {
    let mut hasher = blake3::Hasher::new();
    for source in ENGINE_SOURCES {
        hasher.update(source.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Canonical fingerprint input.
///
/// `BTreeMap` everywhere, so the serialized JSON has a fixed key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintInput {
    pub series_id: String,
    pub topo_order: Vec<String>,
    pub settings: BTreeMap<String, Value>,
    pub source_identities: BTreeMap<String, String>,
    pub logic_version: Option<String>,
}

impl FingerprintInput {
    pub fn from_registry(
        registry: &FactorRegistry,
        series_id: &str,
        logic_version: Option<&str>,
    ) -> Self {
        let settings = registry
            .ordered()
            .map(|p| (p.name().to_string(), p.settings()))
            .collect();
        let mut source_identities: BTreeMap<String, String> = registry
            .ordered()
            .map(|p| (p.name().to_string(), p.source_identity()))
            .collect();
        source_identities.insert(ENGINE_IDENTITY.to_string(), engine_source_identity());
        Self {
            series_id: series_id.to_string(),
            topo_order: registry.topo_order().to_vec(),
            settings,
            source_identities,
            logic_version: logic_version.map(str::to_string),
        }
    }

    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).expect("FingerprintInput must serialize");
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

pub fn compute_fingerprint(
    series_id: &str,
    topo_order: &[String],
    settings: &BTreeMap<String, Value>,
    source_identities: &BTreeMap<String, String>,
    logic_version: Option<&str>,
) -> String {
    FingerprintInput {
        series_id: series_id.to_string(),
        topo_order: topo_order.to_vec(),
        settings: settings.clone(),
        source_identities: source_identities.clone(),
        logic_version: logic_version.map(str::to_string),
    }
    .hash()
}

/// Fingerprint of `registry` as it would be recorded for `series_id`.
pub fn registry_fingerprint(
    registry: &FactorRegistry,
    series_id: &str,
    logic_version: Option<&str>,
) -> String {
    FingerprintInput::from_registry(registry, series_id, logic_version).hash()
}
