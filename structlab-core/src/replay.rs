//! Rebuild replay: persisted events back into accumulators.
//!
//! Three passes. Dispatch hands each event to the plugin that owns it; every
//! bucket is then put back into emission order by its plugin; finally each
//! plugin bootstraps in topological order, so upstream accumulators are
//! complete before a downstream plugin reads them.

use tracing::debug;

use crate::domain::{FactorEvent, SeriesId};
use crate::plugin::{PluginError, ReplayState};
use crate::registry::FactorRegistry;
use crate::state::FactorAccumulators;

/// Summary of one bootstrap, for logging by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub dispatched: usize,
    /// Events whose factor is not a registered plugin, or whose kind the
    /// owning plugin refused.
    pub skipped: usize,
}

/// Split events into per-plugin buckets and sort each bucket.
pub fn collect_buckets<I>(registry: &FactorRegistry, events: I) -> (ReplayState, ReplayStats)
where
    I: IntoIterator<Item = FactorEvent>,
{
    let mut replay = ReplayState::default();
    let mut stats = ReplayStats::default();

    for event in events {
        let plugin = match registry.get(&event.factor_name) {
            Some(p) if p.capabilities().rebuild => p,
            _ => {
                stats.skipped += 1;
                continue;
            }
        };
        let bucket = replay
            .buckets
            .entry(plugin.name().to_string())
            .or_default();
        if plugin.collect_rebuild_event(&event, bucket) {
            stats.dispatched += 1;
        } else {
            stats.skipped += 1;
        }
    }

    for plugin in registry.ordered() {
        if let Some(bucket) = replay.buckets.get_mut(plugin.name()) {
            plugin.sort_rebuild_events(bucket);
        }
    }

    (replay, stats)
}

/// Rebuild accumulators from a full event history.
pub fn bootstrap_accumulators<I>(
    registry: &FactorRegistry,
    series_id: &SeriesId,
    events: I,
) -> Result<(FactorAccumulators, ReplayStats), PluginError>
where
    I: IntoIterator<Item = FactorEvent>,
{
    let (mut replay, stats) = collect_buckets(registry, events);
    for plugin in registry.ordered() {
        if plugin.capabilities().rebuild {
            plugin.bootstrap_from_history(series_id, &mut replay)?;
        }
    }
    debug!(
        series = %series_id,
        dispatched = stats.dispatched,
        skipped = stats.skipped,
        "bootstrapped accumulators"
    );
    Ok((replay.acc, stats))
}
