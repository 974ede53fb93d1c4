//! Engine settings.
//!
//! Two groups of knobs live here:
//! - Derivation settings (pivot windows, enabled factors, logic version) feed
//!   the series fingerprint. Changing any of them invalidates derived history.
//! - Operational settings (lookback, margin, scan limit, retention) only size
//!   reads and never trigger a rebuild.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Symmetric window of major pivots, in candles.
    pub pivot_window_major: usize,
    /// Symmetric window of minor pivots, in candles.
    pub pivot_window_minor: usize,
    /// Candles of history read before the first new candle on a warm ingest.
    pub lookback_candles: usize,
    /// Extra candles added on top of the computed lookback.
    pub window_margin: usize,
    /// Row count above which a rebuild scan switches to paging.
    pub rebuild_scan_limit: usize,
    /// Candles kept upstream when a fingerprint mismatch forces a rebuild.
    pub rebuild_keep_candles: usize,
    /// Explicit logic version; any change forces a rebuild.
    pub logic_version: Option<String>,
    /// Factors to run. `None` runs every built-in factor.
    pub enabled_factors: Option<Vec<String>>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pivot_window_major: 5,
            pivot_window_minor: 2,
            lookback_candles: 2_000,
            window_margin: 8,
            rebuild_scan_limit: 50_000,
            rebuild_keep_candles: 2_000,
            logic_version: None,
            enabled_factors: None,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("pivot_window_major", self.pivot_window_major),
            ("pivot_window_minor", self.pivot_window_minor),
            ("lookback_candles", self.lookback_candles),
            ("rebuild_scan_limit", self.rebuild_scan_limit),
            ("rebuild_keep_candles", self.rebuild_keep_candles),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(SettingsError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if let Some(enabled) = &self.enabled_factors {
            if enabled.is_empty() {
                return Err(SettingsError::Invalid {
                    field: "enabled_factors",
                    reason: "must name at least one factor when set".into(),
                });
            }
        }
        if matches!(&self.logic_version, Some(v) if v.trim().is_empty()) {
            return Err(SettingsError::Invalid {
                field: "logic_version",
                reason: "must not be blank when set".into(),
            });
        }
        Ok(())
    }

    pub fn with_logic_version(mut self, version: impl Into<String>) -> Self {
        self.logic_version = Some(version.into());
        self
    }

    pub fn with_pivot_windows(mut self, major: usize, minor: usize) -> Self {
        self.pivot_window_major = major;
        self.pivot_window_minor = minor;
        self
    }
}
