//! Dependency analysis over decomposed sub-tasks.
//!
//! Dependencies are detected by a deliberately conservative textual
//! heuristic: task A depends on task B when A's description or acceptance
//! text contains `after <B.title>` or `depends on <B.title>`
//! (case-insensitive). The heuristic may under-detect; that is accepted
//! behaviour, not a gap to engineer around.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use ac_core::types::SubTask;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// DAG over sub-task ids. Edges point from the dependent task to the task
/// it depends on. Immutable once computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    /// `(dependent, dependency)` pairs.
    pub edges: Vec<(String, String)>,
    pub has_cycle: bool,
}

impl DependencyGraph {
    /// Dependencies of one node (the tasks it must wait for).
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, to)| to.as_str())
            .collect()
    }
}

/// Detect dependency edges across the given sub-tasks.
pub fn analyze(sub_tasks: &[SubTask]) -> DependencyGraph {
    let nodes: Vec<String> = sub_tasks.iter().map(|t| t.id.clone()).collect();
    let mut edges = Vec::new();

    for dependent in sub_tasks {
        let mut haystack = dependent.description.to_lowercase();
        for crit in &dependent.acceptance_criteria {
            haystack.push(' ');
            haystack.push_str(&crit.to_lowercase());
        }

        for dependency in sub_tasks {
            if dependency.id == dependent.id {
                continue;
            }
            let title = dependency.title.to_lowercase();
            if title.is_empty() {
                continue;
            }
            if haystack.contains(&format!("after {}", title))
                || haystack.contains(&format!("depends on {}", title))
            {
                edges.push((dependent.id.clone(), dependency.id.clone()));
            }
        }
    }

    let has_cycle = detect_cycle(&nodes, &edges);
    DependencyGraph {
        nodes,
        edges,
        has_cycle,
    }
}

/// Depth-first search with a gray set: a back edge into the current stack
/// means a cycle.
fn detect_cycle(nodes: &[String], edges: &[(String, String)]) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut done: HashSet<&str> = HashSet::new();
    let mut gray: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        done: &mut HashSet<&'a str>,
        gray: &mut HashSet<&'a str>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !gray.insert(node) {
            return true;
        }
        if let Some(next) = adjacency.get(node) {
            for n in next {
                if gray.contains(n) || visit(n, adjacency, done, gray) {
                    return true;
                }
            }
        }
        gray.remove(node);
        done.insert(node);
        false
    }

    nodes
        .iter()
        .any(|n| visit(n.as_str(), &adjacency, &mut done, &mut gray))
}

/// Group sub-task ids into parallel execution levels (Kahn-style).
///
/// Each emitted group contains every task whose dependencies have all been
/// emitted in earlier groups. When a cycle leaves a remainder that can
/// never become ready, the remainder is emitted as a single final group so
/// the union of groups always equals the input set.
pub fn parallel_levels(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut remaining: Vec<&str> = graph.nodes.iter().map(String::as_str).collect();
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut levels: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                graph
                    .dependencies_of(id)
                    .iter()
                    .all(|dep| emitted.contains(dep))
            })
            .collect();

        if ready.is_empty() {
            // Cycle remainder: emit as-is and stop.
            levels.push(remaining.iter().map(|s| s.to_string()).collect());
            break;
        }

        for id in &ready {
            emitted.insert(id);
        }
        remaining.retain(|id| !emitted.contains(id));
        levels.push(ready.iter().map(|s| s.to_string()).collect());
    }

    levels
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, title: &str, description: &str) -> SubTask {
        SubTask::new(id, "task-p-000000", title, description)
    }

    #[test]
    fn independent_tasks_have_no_edges() {
        let tasks = vec![
            task("t-001", "Create user service", "Build the user service"),
            task("t-002", "Create product service", "Build the product service"),
            task("t-003", "Create order service", "Build the order service"),
        ];
        let g = analyze(&tasks);
        assert_eq!(g.nodes.len(), 3);
        assert!(g.edges.is_empty());
        assert!(!g.has_cycle);

        let levels = parallel_levels(&g);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 3);
    }

    #[test]
    fn after_phrase_creates_edge() {
        let tasks = vec![
            task("t-001", "Create user model", "Define the schema"),
            task(
                "t-002",
                "Implement user API",
                "Build endpoints after Create user model is done",
            ),
        ];
        let g = analyze(&tasks);
        assert_eq!(g.edges, vec![("t-002".to_string(), "t-001".to_string())]);
        assert!(!g.has_cycle);
    }

    #[test]
    fn depends_on_phrase_is_case_insensitive() {
        let tasks = vec![
            task("t-001", "Database Migration", "Prepare the schema"),
            task(
                "t-002",
                "Seed data",
                "Load fixtures. Depends on DATABASE MIGRATION.",
            ),
        ];
        let g = analyze(&tasks);
        assert_eq!(g.edges.len(), 1);
    }

    #[test]
    fn acceptance_criteria_participate() {
        let mut dependent = task("t-002", "Wire it up", "Connect everything");
        dependent
            .acceptance_criteria
            .push("Works after Create config loader".to_string());
        let tasks = vec![
            task("t-001", "Create config loader", "Parse the file"),
            dependent,
        ];
        let g = analyze(&tasks);
        assert_eq!(g.edges, vec![("t-002".to_string(), "t-001".to_string())]);
    }

    #[test]
    fn edges_only_reference_known_nodes() {
        let tasks = vec![
            task("t-001", "Build parser", "after Build lexer"), // lexer is not a task
            task("t-002", "Build printer", "independent"),
        ];
        let g = analyze(&tasks);
        for (from, to) in &g.edges {
            assert!(g.nodes.contains(from));
            assert!(g.nodes.contains(to));
        }
        assert!(g.edges.is_empty());
    }

    #[test]
    fn cycle_is_detected() {
        let tasks = vec![
            task("t-001", "alpha step", "runs after beta step"),
            task("t-002", "beta step", "runs after alpha step"),
        ];
        let g = analyze(&tasks);
        assert!(g.has_cycle);
    }

    #[test]
    fn cycle_remainder_becomes_final_group() {
        let tasks = vec![
            task("t-001", "alpha step", "runs after beta step"),
            task("t-002", "beta step", "runs after alpha step"),
            task("t-003", "free step", "independent work"),
        ];
        let g = analyze(&tasks);
        assert!(g.has_cycle);

        let levels = parallel_levels(&g);
        // free step first, then the cyclic remainder as one group
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["t-003".to_string()]);
        let mut remainder = levels[1].clone();
        remainder.sort();
        assert_eq!(remainder, vec!["t-001".to_string(), "t-002".to_string()]);
    }

    #[test]
    fn levels_partition_the_input() {
        let tasks = vec![
            task("t-001", "Create schema", "Define tables"),
            task("t-002", "Write queries", "after Create schema"),
            task("t-003", "Expose API", "after Write queries"),
            task("t-004", "Write docs", "independent"),
        ];
        let g = analyze(&tasks);
        let levels = parallel_levels(&g);

        let mut all: Vec<String> = levels.iter().flatten().cloned().collect();
        all.sort();
        let mut nodes = g.nodes.clone();
        nodes.sort();
        assert_eq!(all, nodes);

        assert_eq!(levels.len(), 3);
        assert!(levels[0].contains(&"t-001".to_string()));
        assert!(levels[0].contains(&"t-004".to_string()));
        assert_eq!(levels[1], vec!["t-002".to_string()]);
        assert_eq!(levels[2], vec!["t-003".to_string()]);
    }

    #[test]
    fn empty_input_yields_empty_graph() {
        let g = analyze(&[]);
        assert!(g.nodes.is_empty());
        assert!(!g.has_cycle);
        assert!(parallel_levels(&g).is_empty());
    }

    #[test]
    fn self_reference_is_ignored() {
        // A task whose description mentions its own title must not create
        // a self-edge.
        let tasks = vec![task(
            "t-001",
            "deploy step",
            "the deploy step runs after deploy step approval",
        )];
        let g = analyze(&tasks);
        assert!(g.edges.is_empty());
        assert!(!g.has_cycle);
    }
}
