//! Plugin registry.
//!
//! All contract checks happen in `register`: a registry that exists is a
//! registry whose plugin set is consistent. Nothing downstream re-validates.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::graph::{FactorGraph, FactorSpec, GraphError};
use crate::plugin::FactorPlugin;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry needs at least one plugin")]
    Empty,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("event kind `{kind}` claimed by both `{first}` and `{second}`")]
    EventKindConflict {
        kind: String,
        first: String,
        second: String,
    },
    #[error("factor `{factor}` breaks the plugin contract: {reason}")]
    Contract { factor: String, reason: String },
    #[error("no factor named `{0}`")]
    MissingFactor(String),
}

/// Plugins by unique name, stored in topological order.
#[derive(Clone)]
pub struct FactorRegistry {
    plugins: Vec<Arc<dyn FactorPlugin>>,
    by_name: HashMap<String, usize>,
    graph: FactorGraph,
}

impl std::fmt::Debug for FactorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorRegistry")
            .field("topo_order", &self.graph.topo_order())
            .finish()
    }
}

impl FactorRegistry {
    pub fn register(plugins: Vec<Arc<dyn FactorPlugin>>) -> Result<Self, RegistryError> {
        if plugins.is_empty() {
            return Err(RegistryError::Empty);
        }

        let specs: Vec<FactorSpec> = plugins.iter().map(|p| p.spec().clone()).collect();
        let graph = FactorGraph::build(&specs)?;

        let mut kind_owner: HashMap<&'static str, String> = HashMap::new();
        for plugin in &plugins {
            let caps = plugin.capabilities();
            if caps.rebuild && plugin.event_kinds().is_empty() {
                return Err(RegistryError::Contract {
                    factor: plugin.name().to_string(),
                    reason: "declares rebuild support but no event kinds".into(),
                });
            }
            for &kind in plugin.event_kinds() {
                if let Some(first) = kind_owner.insert(kind, plugin.name().to_string()) {
                    return Err(RegistryError::EventKindConflict {
                        kind: kind.to_string(),
                        first,
                        second: plugin.name().to_string(),
                    });
                }
            }
        }

        let mut slots: HashMap<String, Arc<dyn FactorPlugin>> = plugins
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        let mut ordered = Vec::with_capacity(slots.len());
        for name in graph.topo_order() {
            if let Some(plugin) = slots.remove(name) {
                ordered.push(plugin);
            }
        }
        let by_name = ordered
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), i))
            .collect();

        Ok(Self {
            plugins: ordered,
            by_name,
            graph,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FactorPlugin>> {
        self.by_name.get(name).map(|&i| &self.plugins[i])
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn FactorPlugin>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::MissingFactor(name.to_string()))
    }

    /// Specs in topological order.
    pub fn specs(&self) -> Vec<FactorSpec> {
        self.plugins.iter().map(|p| p.spec().clone()).collect()
    }

    pub fn topo_order(&self) -> &[String] {
        self.graph.topo_order()
    }

    /// Plugins in topological order.
    pub fn ordered(&self) -> impl Iterator<Item = &Arc<dyn FactorPlugin>> {
        self.plugins.iter()
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    pub fn max_lookback_window(&self) -> usize {
        self.plugins
            .iter()
            .map(|p| p.lookback_window())
            .max()
            .unwrap_or(0)
    }

    /// A new registry restricted to `enabled`. The graph is rebuilt for the
    /// reduced set, so a disabled dependency surfaces as `MissingDependency`.
    pub fn filtered(&self, enabled: &[String]) -> Result<Self, RegistryError> {
        for name in enabled {
            self.require(name)?;
        }
        let plugins = self
            .plugins
            .iter()
            .filter(|p| enabled.iter().any(|e| e == p.name()))
            .cloned()
            .collect();
        Self::register(plugins)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
