//! Service dependency graph and boot ordering.

use crate::error::{CoreError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    dependencies: Vec<String>,
}

/// Dependency graph over named services.
///
/// Registration order matters: it is the tie-break whenever more than one
/// service is ready to be placed, so the boot order is fully deterministic.
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl ServiceGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and the services it depends on.
    ///
    /// Dependencies may name services registered later; they are checked
    /// when the order is computed.
    pub fn add<I, S>(&mut self, name: impl Into<String>, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::Configuration("service name must not be empty".into()));
        }
        if self.index.contains_key(&name) {
            return Err(CoreError::Configuration(format!(
                "service '{}' is already registered",
                name
            )));
        }

        let mut deps: Vec<String> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(Node {
            name,
            dependencies: deps,
        });
        Ok(())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Dependencies of a registered service.
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.index
            .get(name)
            .map(|&i| self.nodes[i].dependencies.as_slice())
    }

    /// Boot order: every service appears after all of its dependencies.
    ///
    /// Among the services that are ready, the one registered first is placed
    /// first.
    ///
    /// # Errors
    /// `Configuration` for a dependency on an unregistered service,
    /// `DependencyCycle` naming the services on or inside a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let n = self.nodes.len();
        let mut deps_idx: Vec<Vec<usize>> = Vec::with_capacity(n);
        for node in &self.nodes {
            let mut resolved = Vec::with_capacity(node.dependencies.len());
            for dep in &node.dependencies {
                let &i = self.index.get(dep).ok_or_else(|| {
                    CoreError::Configuration(format!(
                        "service '{}' depends on unknown service '{}'",
                        node.name, dep
                    ))
                })?;
                resolved.push(i);
            }
            deps_idx.push(resolved);
        }

        let mut remaining: Vec<usize> = deps_idx.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in deps_idx.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            // Smallest registration index among the ready services.
            let Some(next) = (0..n).find(|&i| !placed[i] && remaining[i] == 0) else {
                return Err(CoreError::DependencyCycle(self.cyclic_subset(&placed, &dependents)));
            };

            placed[next] = true;
            order.push(self.nodes[next].name.clone());
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
            }
        }

        tracing::debug!(order = ?order, "boot order computed");
        Ok(order)
    }

    /// Names of the unplaced services that sit on a cycle, or between cycles.
    ///
    /// Unplaced services nobody unplaced depends on are only blocked by a
    /// cycle, so they are peeled away until a fixed point is reached.
    fn cyclic_subset(&self, placed: &[bool], dependents: &[Vec<usize>]) -> Vec<String> {
        let mut alive: Vec<bool> = placed.iter().map(|p| !p).collect();
        loop {
            let mut changed = false;
            for i in 0..alive.len() {
                if alive[i] && !dependents[i].iter().any(|&d| alive[d]) {
                    alive[i] = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        self.nodes
            .iter()
            .zip(alive)
            .filter(|(_, alive)| *alive)
            .map(|(node, _)| node.name.clone())
            .collect()
    }
}
