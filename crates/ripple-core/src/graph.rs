use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::project::Project;

/// The workspace dependency graph: forward and reverse edge maps keyed by
/// project name.
///
/// An edge `A -> B` in `deps` means A depends on B (B must build first).
/// `rdeps` is the exact mirror: `B -> A`. Edges exist only between known
/// workspace projects; external package names are ignored. Constructed once
/// at startup and treated as immutable thereafter.
pub struct DependencyGraph {
    pub projects: BTreeMap<String, Project>,
    pub deps: HashMap<String, BTreeSet<String>>,
    pub rdeps: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph from discovered projects.
    ///
    /// Every project gets an entry in both maps even when it has no edges.
    /// Self-edges, if declared, are preserved so the cycle detector can
    /// report them.
    pub fn build(projects: &[Project]) -> Self {
        let project_map: BTreeMap<String, Project> = projects
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut rdeps: HashMap<String, BTreeSet<String>> = HashMap::new();

        for name in project_map.keys() {
            deps.entry(name.clone()).or_default();
            rdeps.entry(name.clone()).or_default();
        }

        for project in project_map.values() {
            for dep_name in project.manifest.all_dependency_names() {
                if !project_map.contains_key(&dep_name) {
                    continue;
                }
                deps.get_mut(&project.name)
                    .expect("entry inserted above")
                    .insert(dep_name.clone());
                rdeps.get_mut(&dep_name)
                    .expect("entry inserted above")
                    .insert(project.name.clone());
            }
        }

        DependencyGraph {
            projects: project_map,
            deps,
            rdeps,
        }
    }

    /// Direct dependencies of a project.
    pub fn deps_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.deps
            .get(name)
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
    }

    /// Direct dependents of a project.
    pub fn rdeps_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.rdeps
            .get(name)
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
    }

    /// Detect all cycles using a three-color depth-first search.
    ///
    /// WHITE = unseen, GRAY = on the current stack, BLACK = finished.
    /// Traversal roots are all projects in name order, so the report is
    /// deterministic. Each reported cycle is the stack slice from the first
    /// occurrence of the revisited node through the current node, with the
    /// revisited node appended (`[a, b, c, a]`).
    ///
    /// An empty result means the graph is acyclic.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> = self
            .projects
            .keys()
            .map(|n| (n.as_str(), Color::White))
            .collect();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            deps: &'a HashMap<String, BTreeSet<String>>,
            colors: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<&'a str>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            colors.insert(node, Color::Gray);
            stack.push(node);

            for child in deps.get(node).into_iter().flatten() {
                match colors.get(child.as_str()).copied() {
                    Some(Color::White) => visit(child, deps, colors, stack, cycles),
                    Some(Color::Gray) => {
                        let start = stack
                            .iter()
                            .position(|n| *n == child.as_str())
                            .expect("gray node is on the stack");
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(child.clone());
                        cycles.push(cycle);
                    }
                    _ => {}
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
        }

        for name in self.projects.keys() {
            if colors[name.as_str()] == Color::White {
                visit(name, &self.deps, &mut colors, &mut stack, &mut cycles);
            }
        }

        cycles
    }

    /// Compute the affected set: the smallest superset of `seeds` closed
    /// under reverse dependency edges.
    ///
    /// Breadth-first search with a visited set; linear in the edges touched.
    /// Seed names that are not workspace projects are ignored.
    pub fn affected(&self, seeds: &BTreeSet<String>) -> BTreeSet<String> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        for seed in seeds {
            if self.projects.contains_key(seed) && visited.insert(seed.clone()) {
                queue.push_back(seed);
            }
        }

        while let Some(node) = queue.pop_front() {
            for dependent in self.rdeps.get(node).into_iter().flatten() {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        visited
    }

    /// Compute the transitive dependency closure of `targets`, excluding the
    /// targets themselves. Used by the pre-dev build to bring a dev server's
    /// dependencies up to date before it starts.
    pub fn dependency_closure(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = targets
            .iter()
            .filter(|t| self.projects.contains_key(*t))
            .map(|t| t.as_str())
            .collect();

        while let Some(node) = queue.pop_front() {
            for dep in self.deps.get(node).into_iter().flatten() {
                if !targets.contains(dep) && visited.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }

        visited
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::make_project;
    use super::*;

    fn graph_of(projects: &[(&str, &[&str])]) -> DependencyGraph {
        let projects: Vec<Project> = projects
            .iter()
            .map(|(name, deps)| make_project(name, deps))
            .collect();
        DependencyGraph::build(&projects)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_edges_mirror_invariant() {
        let g = graph_of(&[
            ("a", &["b", "c"]),
            ("b", &["d"]),
            ("c", &["d"]),
            ("d", &[]),
        ]);

        for (from, tos) in &g.deps {
            for to in tos {
                assert!(
                    g.rdeps[to].contains(from),
                    "deps edge {}->{} missing its rdeps mirror",
                    from,
                    to
                );
            }
        }
        for (to, froms) in &g.rdeps {
            for from in froms {
                assert!(g.deps[from].contains(to));
            }
        }
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let g = graph_of(&[("a", &["b", "react", "lodash"]), ("b", &[])]);
        assert_eq!(g.deps["a"], set(&["b"]));
    }

    #[test]
    fn test_detect_cycles_acyclic() {
        let g = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert!(g.detect_cycles().is_empty());
    }

    #[test]
    fn test_detect_cycles_triangle() {
        let g = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let cycles = g.detect_cycles();
        assert!(!cycles.is_empty());

        // The reported cycle is a rotation of a -> b -> c -> a
        let cycle = &cycles[0];
        assert_eq!(cycle.len(), 4);
        assert_eq!(cycle.first(), cycle.last());
        let body: BTreeSet<&str> = cycle[..3].iter().map(|s| s.as_str()).collect();
        assert_eq!(body, ["a", "b", "c"].into_iter().collect());
    }

    #[test]
    fn test_detect_cycles_self_loop() {
        let g = graph_of(&[("solo", &["solo"])]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["solo".to_string(), "solo".to_string()]);
    }

    #[test]
    fn test_detect_cycles_reports_multiple() {
        let g = graph_of(&[
            ("a", &["b"]),
            ("b", &["a"]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]);
        assert_eq!(g.detect_cycles().len(), 2);
    }

    #[test]
    fn test_affected_diamond() {
        // a -> b, a -> c, b -> d, c -> d; change d
        let g = graph_of(&[
            ("a", &["b", "c"]),
            ("b", &["d"]),
            ("c", &["d"]),
            ("d", &[]),
        ]);
        assert_eq!(g.affected(&set(&["d"])), set(&["a", "b", "c", "d"]));
    }

    #[test]
    fn test_affected_includes_seeds_and_is_closed() {
        let g = graph_of(&[("a", &["b"]), ("b", &[]), ("c", &["a"])]);
        let affected = g.affected(&set(&["b"]));
        assert!(affected.is_superset(&set(&["b"])));
        // Closure: every rdep of a member is a member
        for name in &affected {
            for dependent in g.rdeps_of(name) {
                assert!(affected.contains(dependent));
            }
        }
        assert_eq!(affected, set(&["a", "b", "c"]));
    }

    #[test]
    fn test_affected_unrelated_project() {
        let g = graph_of(&[("a", &[]), ("b", &[]), ("c", &["a"])]);
        assert_eq!(g.affected(&set(&["b"])), set(&["b"]));
    }

    #[test]
    fn test_affected_ignores_unknown_seeds() {
        let g = graph_of(&[("a", &[])]);
        assert!(g.affected(&set(&["ghost"])).is_empty());
    }

    #[test]
    fn test_dependency_closure_excludes_targets() {
        let g = graph_of(&[
            ("app", &["api", "ui"]),
            ("api", &["core"]),
            ("ui", &["core"]),
            ("core", &[]),
        ]);
        let closure = g.dependency_closure(&set(&["app"]));
        assert_eq!(closure, set(&["api", "ui", "core"]));
        assert!(!closure.contains("app"));
    }
}
