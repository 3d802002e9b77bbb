use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;

/// The output of planning: the affected set partitioned into wavefronts.
///
/// Invariants:
/// - the union of all waves equals `affected`;
/// - no two projects in the same wave have an edge between them in the
///   induced subgraph;
/// - every project in wave `k > 0` has at least one dependency in an
///   earlier wave.
///
/// Waves are sorted lexicographically, so planning the same input twice
/// yields identical output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub affected: BTreeSet<String>,
    pub waves: Vec<Vec<String>>,
}

impl BuildPlan {
    /// Total number of project builds across all waves.
    pub fn total_steps(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum()
    }
}

/// Partition `affected` into waves using Kahn's algorithm over the induced
/// subgraph.
///
/// Edges are restricted to pairs where both endpoints are affected. Each
/// round collects every node whose remaining in-degree is zero, sorts it,
/// emits it as a wave, and decrements the in-degrees of its dependents.
///
/// A round that produces an empty wave while nodes remain means the induced
/// subgraph has a cycle. The global cycle check runs before planning, so
/// this is unreachable in practice, but the planner refuses rather than
/// looping forever.
pub fn plan_waves(
    affected: &BTreeSet<String>,
    deps: &HashMap<String, BTreeSet<String>>,
) -> Result<BuildPlan> {
    // In-degree = number of dependencies inside the affected set.
    // `dependents` is the restricted reverse adjacency used for decrements.
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for name in affected {
        let count = deps
            .get(name)
            .into_iter()
            .flatten()
            .filter(|d| affected.contains(*d))
            .count();
        in_degree.insert(name, count);

        for dep in deps.get(name).into_iter().flatten() {
            if affected.contains(dep) {
                dependents.entry(dep).or_default().push(name);
            }
        }
    }

    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut remaining = affected.len();

    while remaining > 0 {
        // BTreeMap iteration keeps each wave lexicographically sorted.
        let wave: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        if wave.is_empty() {
            anyhow::bail!("cycle in affected subgraph; refusing to plan");
        }

        for node in &wave {
            in_degree.remove(node);
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                }
            }
        }

        remaining -= wave.len();
        waves.push(wave.into_iter().map(|s| s.to_string()).collect());
    }

    Ok(BuildPlan {
        affected: affected.clone(),
        waves,
    })
}
