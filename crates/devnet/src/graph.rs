//! Service dependency graph.

use std::collections::BTreeSet;

/// Directed graph over service indices; an edge points from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl DependencyGraph {
    /// Create a graph of `len` services with no edges.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            dependents: vec![Vec::new(); len],
            in_degree: vec![0; len],
        }
    }

    /// Record that `dependent` must start after `dependency` is healthy.
    pub fn add_dependency(&mut self, dependent: usize, dependency: usize) {
        self.dependents[dependency].push(dependent);
        self.in_degree[dependent] += 1;
    }

    /// Kahn's algorithm, always taking the lowest ready index so ties keep declaration order.
    ///
    /// # Errors
    ///
    /// Returns the indices stuck on a cycle when the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(index, _)| index)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &dependent in &self.dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            Err(in_degree
                .iter()
                .enumerate()
                .filter(|&(_, &degree)| degree > 0)
                .map(|(index, _)| index)
                .collect())
        }
    }
}
