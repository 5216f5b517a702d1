//! Cycle detection for a candidate edge.
//!
//! The committed graph is never touched: the search walks an immutable
//! [`AdjacencySnapshot`] and treats the candidate edge as an overlay.

use crate::document::AdjacencySnapshot;
use crate::model::NodeId;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

fn overlay_successors<'a>(
    adjacency: &'a AdjacencySnapshot,
    source: &'a NodeId,
    target: &'a NodeId,
    node: &NodeId,
) -> Vec<&'a NodeId> {
    let mut next: Vec<&'a NodeId> = adjacency.successors(node.as_str()).iter().collect();
    if node == source && !next.contains(&target) {
        next.push(target);
    }
    next
}

/// Search for a cycle reachable from `source` once `source -> target` is added.
///
/// Returns the nodes of the first cycle found, starting and ending at the
/// same node, or `None` if no node reaches itself.
pub fn find_cycle_with(
    adjacency: &AdjacencySnapshot,
    source: &NodeId,
    target: &NodeId,
) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();
    // (node, successors, next successor index)
    let mut stack: Vec<(&NodeId, Vec<&NodeId>, usize)> =
        vec![(source, overlay_successors(adjacency, source, target, source), 0)];
    marks.insert(source, Mark::InProgress);

    while let Some((node, next, index)) = stack.last_mut() {
        let Some(child) = next.get(*index).copied() else {
            marks.insert(*node, Mark::Done);
            stack.pop();
            continue;
        };
        *index += 1;

        match marks.get(child) {
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|(n, _, _)| *n == child).unwrap_or(0);
                let mut cycle: Vec<NodeId> =
                    stack[start..].iter().map(|(n, _, _)| (*n).clone()).collect();
                cycle.push(child.clone());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                marks.insert(child, Mark::InProgress);
                let child_next = overlay_successors(adjacency, source, target, child);
                stack.push((child, child_next, 0));
            }
        }
    }
    None
}

/// True when adding `source -> target` would let some node reach itself.
pub fn would_create_cycle(adjacency: &AdjacencySnapshot, source: &NodeId, target: &NodeId) -> bool {
    find_cycle_with(adjacency, source, target).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(edges: &[(&str, &str)]) -> AdjacencySnapshot {
        edges
            .iter()
            .map(|(a, b)| (NodeId::from(*a), NodeId::from(*b)))
            .collect()
    }

    #[test]
    fn test_back_edge_closes_cycle() {
        let adjacency = snapshot(&[("a", "b"), ("b", "c")]);
        let cycle = find_cycle_with(&adjacency, &"c".into(), &"a".into()).unwrap();
        assert_eq!(
            cycle,
            vec![NodeId::from("c"), "a".into(), "b".into(), "c".into()]
        );
    }

    #[test]
    fn test_forward_edge_is_acyclic() {
        let adjacency = snapshot(&[("a", "b"), ("b", "c")]);
        assert!(!would_create_cycle(&adjacency, &"c".into(), &"d".into()));
        assert!(!would_create_cycle(&adjacency, &"a".into(), &"c".into()));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let adjacency = snapshot(&[("a", "b"), ("a", "c"), ("b", "d")]);
        assert!(!would_create_cycle(&adjacency, &"c".into(), &"d".into()));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let adjacency = AdjacencySnapshot::default();
        assert!(would_create_cycle(&adjacency, &"a".into(), &"a".into()));
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let names: Vec<String> = (0..20_000).map(|i| format!("n{}", i)).collect();
        let adjacency: AdjacencySnapshot = names
            .windows(2)
            .map(|w| (NodeId::from(w[0].as_str()), NodeId::from(w[1].as_str())))
            .collect();
        let last = NodeId::from(names[names.len() - 1].as_str());
        assert!(would_create_cycle(&adjacency, &last, &"n0".into()));
    }
}
