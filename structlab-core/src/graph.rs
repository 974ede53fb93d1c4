//! Factor dependency graph and deterministic topological order.
//!
//! Kahn's algorithm with ties broken by declaration order: among all factors
//! whose dependencies are already scheduled, the one declared first runs
//! first. The order is therefore stable across runs for an unchanged spec set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Static declaration of a factor and the factors it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub name: String,
    pub depends_on: BTreeSet<String>,
}

impl FactorSpec {
    pub fn new(name: impl Into<String>, depends_on: &[&str]) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("factor name must not be empty")]
    EmptyName,
    #[error("duplicate factor name `{0}`")]
    DuplicateName(String),
    #[error("factor `{factor}` depends on unknown factor `{dependency}`")]
    MissingDependency { factor: String, dependency: String },
    #[error("dependency cycle among factors: {}", unresolved.join(", "))]
    Cycle { unresolved: Vec<String> },
}

/// Validated dependency DAG with its cached topological order.
#[derive(Debug, Clone)]
pub struct FactorGraph {
    order: Vec<String>,
    specs: HashMap<String, FactorSpec>,
}

impl FactorGraph {
    pub fn build(specs: &[FactorSpec]) -> Result<Self, GraphError> {
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(GraphError::EmptyName);
            }
            if position.insert(spec.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateName(spec.name.clone()));
            }
        }

        let mut in_degree = vec![0usize; specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let &j = position
                    .get(dep.as_str())
                    .ok_or_else(|| GraphError::MissingDependency {
                        factor: spec.name.clone(),
                        dependency: dep.clone(),
                    })?;
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }

        // Ready set ordered by declaration index.
        let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(specs.len());
        while let Some(i) = ready.pop_first() {
            order.push(specs[i].name.clone());
            for &k in &dependents[i] {
                in_degree[k] -= 1;
                if in_degree[k] == 0 {
                    ready.insert(k);
                }
            }
        }

        if order.len() < specs.len() {
            let unresolved = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.name.clone())
                .collect();
            return Err(GraphError::Cycle { unresolved });
        }

        Ok(Self {
            order,
            specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
        })
    }

    pub fn topo_order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.specs.get(name).map(|s| &s.depends_on)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
