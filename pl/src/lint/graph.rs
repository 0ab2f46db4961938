//! Graph algorithms over `depends_on` edges
//!
//! Edges point from a node to the nodes it depends on. Cycle search follows
//! those edges; reachability walks them backwards, from each root to every
//! node that transitively depends on it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::domain::Node;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Find dependency cycles
///
/// Depth-first search with back-edge detection, started from each node in
/// document order. Every back edge yields one cycle, rotated to start at its
/// smallest id and closed by repeating that id, e.g. `["A", "C", "B", "A"]`.
/// The same cycle reached from different starts is reported once.
pub fn find_cycles(nodes: &[Node]) -> Vec<Vec<String>> {
    debug!(node_count = nodes.len(), "find_cycles: called");
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id.as_str(), i)).collect();
    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| n.depends_on.iter().filter_map(|d| index.get(d.as_str()).copied()).collect())
        .collect();

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut cycles = Vec::new();

    for start in 0..nodes.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnStack;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if top.1 >= edges[node].len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            let target = edges[node][top.1];
            top.1 += 1;

            match marks[target] {
                Mark::Unvisited => {
                    marks[target] = Mark::OnStack;
                    stack.push((target, 0));
                }
                Mark::OnStack => {
                    let Some(pos) = stack.iter().position(|&(n, _)| n == target) else {
                        continue;
                    };
                    let cycle = canonical(stack[pos..].iter().map(|&(n, _)| n).collect(), nodes);
                    if seen.insert(cycle.clone()) {
                        debug!(len = cycle.len(), "find_cycles: back edge found");
                        let mut ids: Vec<String> = cycle.iter().map(|&i| nodes[i].id.clone()).collect();
                        ids.push(nodes[cycle[0]].id.clone());
                        cycles.push(ids);
                    }
                }
                Mark::Done => {}
            }
        }
    }

    debug!(count = cycles.len(), "find_cycles: done");
    cycles
}

/// Rotate so the smallest id comes first
fn canonical(mut cycle: Vec<usize>, nodes: &[Node]) -> Vec<usize> {
    if let Some(min_pos) = (0..cycle.len()).min_by(|&a, &b| nodes[cycle[a]].id.cmp(&nodes[cycle[b]].id)) {
        cycle.rotate_left(min_pos);
    }
    cycle
}

/// Ids reachable from `roots` by walking `depends_on` edges in reverse
pub fn reachable_from<'a>(nodes: &'a [Node], roots: &[String]) -> BTreeSet<&'a str> {
    debug!(node_count = nodes.len(), roots = roots.len(), "reachable_from: called");
    let mut dependents: HashMap<&str, Vec<&'a str>> = HashMap::new();
    for node in nodes {
        for dep in &node.depends_on {
            dependents.entry(dep.as_str()).or_default().push(node.id.as_str());
        }
    }

    let mut reached: BTreeSet<&'a str> = BTreeSet::new();
    let mut queue: VecDeque<&'a str> = VecDeque::new();
    for node in nodes {
        if roots.iter().any(|r| r == &node.id) && reached.insert(node.id.as_str()) {
            queue.push_back(node.id.as_str());
        }
    }

    while let Some(id) = queue.pop_front() {
        if let Some(next) = dependents.get(id) {
            for &child in next {
                if reached.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeKind;

    fn node(id: &str, deps: &[&str]) -> Node {
        Node::new(id, NodeKind::Task, id).with_depends_on(deps.iter().copied())
    }

    fn is_real_cycle(path: &[String], nodes: &[Node]) -> bool {
        path.first() == path.last()
            && path.windows(2).all(|w| {
                nodes
                    .iter()
                    .find(|n| n.id == w[0])
                    .map(|n| n.depends_on_id(&w[1]))
                    .unwrap_or(false)
            })
    }

    #[test]
    fn test_no_cycles_in_chain() {
        let nodes = vec![node("A", &[]), node("B", &["A"]), node("C", &["B"])];
        assert!(find_cycles(&nodes).is_empty());
    }

    #[test]
    fn test_three_node_cycle_path() {
        let nodes = vec![node("A", &["C"]), node("B", &["A"]), node("C", &["B"])];
        let cycles = find_cycles(&nodes);
        assert_eq!(cycles, vec![vec!["A", "C", "B", "A"]]);
        assert!(is_real_cycle(&cycles[0], &nodes));
    }

    #[test]
    fn test_self_loop() {
        let nodes = vec![node("A", &["A"])];
        assert_eq!(find_cycles(&nodes), vec![vec!["A", "A"]]);
    }

    #[test]
    fn test_independent_cycles_each_reported_once() {
        let nodes = vec![
            node("A", &["B"]),
            node("B", &["A"]),
            node("X", &["Y"]),
            node("Y", &["X"]),
            node("Z", &["A", "X"]),
        ];
        let cycles = find_cycles(&nodes);
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec!["A".to_string(), "B".to_string(), "A".to_string()]));
        assert!(cycles.contains(&vec!["X".to_string(), "Y".to_string(), "X".to_string()]));
        for c in &cycles {
            assert!(is_real_cycle(c, &nodes));
        }
    }

    #[test]
    fn test_reachability_walks_dependents() {
        let nodes = vec![
            node("R", &[]),
            node("A", &["R"]),
            node("B", &["A"]),
            node("Q", &[]),
            node("Z", &["Q"]),
        ];
        let reached = reachable_from(&nodes, &["R".to_string()]);
        assert_eq!(reached.into_iter().collect::<Vec<_>>(), vec!["A", "B", "R"]);
    }
}
