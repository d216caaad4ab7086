//! # Adapter Dependency Graph
//!
//! Built once at engine start and read-only afterwards. Construction rejects
//! unknown upstream ids and cycles, then assigns each adapter a wave: roots
//! are wave 1 and every other node sits one wave after its deepest upstream.
//!
//! ```text
//! wave 1:  ocr      metadata
//!            \      /
//! wave 2:     nlp
//!              |
//! wave 3:   financial
//! ```

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub adapter: String,
    pub wave: u32,

    /// Direct upstream adapter ids, sorted
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DependencyNode>,
    order: Vec<String>,
    waves: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build from `(adapter, upstream adapters)` pairs
    pub fn new<I, A, D>(edges: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (A, Vec<D>)>,
        A: Into<String>,
        D: Into<String>,
    {
        let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (adapter, dependencies) in edges {
            upstream
                .entry(adapter.into())
                .or_default()
                .extend(dependencies.into_iter().map(Into::into));
        }

        for (adapter, dependencies) in &upstream {
            if let Some(unknown) = dependencies.iter().find(|dep| !upstream.contains_key(*dep)) {
                return Err(EngineError::configuration(format!(
                    "adapter '{adapter}' depends on unknown adapter '{unknown}'"
                )));
            }
        }

        // Kahn's algorithm over a sorted frontier keeps the order deterministic
        let mut remaining: BTreeMap<&str, usize> = upstream
            .iter()
            .map(|(adapter, deps)| (adapter.as_str(), deps.len()))
            .collect();
        let mut downstream: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (adapter, deps) in &upstream {
            for dep in deps {
                downstream.entry(dep.as_str()).or_default().push(adapter.as_str());
            }
        }

        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut frontier: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(adapter, _)| *adapter)
            .collect();
        let mut placed = 0usize;

        while !frontier.is_empty() {
            let mut next = BTreeSet::new();
            for adapter in &frontier {
                for child in downstream.get(adapter).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(*child);
                        }
                    }
                }
            }
            placed += frontier.len();
            waves.push(frontier.iter().map(|adapter| adapter.to_string()).collect());
            frontier = next;
        }

        if placed < upstream.len() {
            let cyclic: Vec<&str> = remaining
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(adapter, _)| *adapter)
                .collect();
            return Err(EngineError::configuration(format!(
                "dependency cycle among adapters: {}",
                cyclic.join(", ")
            )));
        }

        let mut nodes = BTreeMap::new();
        for (index, wave) in waves.iter().enumerate() {
            for adapter in wave {
                let dependencies = upstream
                    .get(adapter)
                    .map(|deps| deps.iter().cloned().collect())
                    .unwrap_or_default();
                nodes.insert(
                    adapter.clone(),
                    DependencyNode {
                        adapter: adapter.clone(),
                        wave: index as u32 + 1,
                        dependencies,
                    },
                );
            }
        }
        let order = waves.iter().flatten().cloned().collect();

        Ok(Self {
            nodes,
            order,
            waves,
        })
    }

    /// Graph with no adapters; every chain step is unconstrained
    pub fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            order: Vec::new(),
            waves: Vec::new(),
        }
    }

    /// Topological order: by wave, then adapter id
    pub fn execution_order(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn node(&self, adapter: &str) -> Option<&DependencyNode> {
        self.nodes.get(adapter)
    }

    pub fn contains(&self, adapter: &str) -> bool {
        self.nodes.contains_key(adapter)
    }

    pub fn roots(&self) -> Vec<String> {
        self.waves.first().cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `adapter` transitively depends on `upstream`
    pub fn depends_on(&self, adapter: &str, upstream: &str) -> bool {
        let Some(node) = self.nodes.get(adapter) else {
            return false;
        };
        let mut stack: Vec<&str> = node.dependencies.iter().map(String::as_str).collect();
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == upstream {
                return true;
            }
            if seen.insert(current) {
                if let Some(next) = self.nodes.get(current) {
                    stack.extend(next.dependencies.iter().map(String::as_str));
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DependencyGraph {
        DependencyGraph::new(vec![
            ("financial", vec!["nlp"]),
            ("nlp", vec!["ocr", "metadata"]),
            ("ocr", vec![]),
            ("metadata", vec![]),
            ("causal", vec!["financial", "ocr"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_waves_and_order() {
        let graph = sample();
        assert_eq!(
            graph.execution_order(),
            vec!["metadata", "ocr", "nlp", "financial", "causal"]
        );
        assert_eq!(graph.waves().len(), 4);
        assert_eq!(graph.node("nlp").unwrap().wave, 2);
        assert_eq!(graph.node("causal").unwrap().wave, 4);
        assert_eq!(graph.roots(), vec!["metadata", "ocr"]);
    }

    #[test]
    fn test_wave_exceeds_every_dependency() {
        let graph = sample();
        for adapter in graph.execution_order() {
            let node = graph.node(&adapter).unwrap();
            for dep in &node.dependencies {
                assert!(node.wave > graph.node(dep).unwrap().wave);
            }
        }
    }

    #[test]
    fn test_order_is_deterministic() {
        assert_eq!(sample().execution_order(), sample().execution_order());
    }

    #[test]
    fn test_cycle_rejected() {
        let result = DependencyGraph::new(vec![
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("d", vec![]),
        ]);
        match result {
            Err(EngineError::Configuration(message)) => {
                assert!(message.contains("cycle"));
                assert!(message.contains("a, b, c"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }

        assert!(DependencyGraph::new(vec![("self", vec!["self"])]).is_err());
    }

    #[test]
    fn test_unknown_upstream_rejected() {
        let result = DependencyGraph::new(vec![("nlp", vec!["ocr"])]);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_transitive_dependency() {
        let graph = sample();
        assert!(graph.depends_on("financial", "ocr"));
        assert!(graph.depends_on("causal", "metadata"));
        assert!(!graph.depends_on("ocr", "financial"));
        assert!(!graph.depends_on("unknown", "ocr"));
    }
}
