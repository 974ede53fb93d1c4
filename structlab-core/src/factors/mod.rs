//! Built-in factor plugins.
//!
//! Dependency chain: pivot → pen → zhongshu → anchor (anchor also reads pen).

pub mod anchor;
pub mod pen;
pub mod pivot;
pub mod zhongshu;

pub use anchor::AnchorPlugin;
pub use pen::PenPlugin;
pub use pivot::PivotPlugin;
pub use zhongshu::ZhongshuPlugin;

use std::sync::Arc;

use crate::domain::{EventPayload, FactorEvent, PayloadError};
use crate::plugin::{FactorPlugin, PluginError};
use crate::registry::{FactorRegistry, RegistryError};
use crate::settings::EngineSettings;

/// Every built-in plugin, configured from `settings`.
pub fn default_plugins(settings: &EngineSettings) -> Vec<Arc<dyn FactorPlugin>> {
    vec![
        Arc::new(PivotPlugin::new(
            settings.pivot_window_major,
            settings.pivot_window_minor,
        )),
        Arc::new(PenPlugin::new()),
        Arc::new(ZhongshuPlugin::new()),
        Arc::new(AnchorPlugin::new()),
    ]
}

/// Registry of the built-in plugins, restricted to `enabled_factors` if set.
pub fn build_registry(settings: &EngineSettings) -> Result<FactorRegistry, RegistryError> {
    let registry = FactorRegistry::register(default_plugins(settings))?;
    match &settings.enabled_factors {
        Some(enabled) => registry.filtered(enabled),
        None => Ok(registry),
    }
}

/// Narrow a stored event's payload, attributing failures to `factor`.
pub(crate) fn narrow<T>(factor: &str, event: &FactorEvent) -> Result<T, PluginError>
where
    T: for<'a> TryFrom<&'a EventPayload, Error = PayloadError>,
{
    event
        .payload_as::<T>()
        .map_err(|e| PluginError::payload(factor, event, e))
}
