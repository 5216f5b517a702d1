//! Deterministic tree layout by geometric centers.
//!
//! [`LayoutAligner`] places the leaves of a layered hierarchy symmetrically
//! about `x = 0` and then centers every parent over its children, bottom-up.
//! Optional passes compensate skew between layers and shift the whole tree
//! so the mean x is zero. The result is checked before it is returned: every
//! coordinate finite, every layer level.
//!
//! Layers usually come from [`layers_from_document`]; with the `layout`
//! feature, [`sugiyama_layers`] ranks nodes with the Sugiyama method instead.
//!
//! ```ignore
//! let layers = layers_from_document(&doc);
//! let current: HashMap<NodeId, Point> = doc.nodes().map(|n| (n.id.clone(), n.position)).collect();
//! let positions = aligner.calculate_geometric_alignment(&layers, &current)?;
//! ```

#[cfg(feature = "layout")]
mod sugiyama;

#[cfg(feature = "layout")]
pub use sugiyama::{sugiyama_layers, SugiyamaConfig};

use crate::config::AlignmentConfig;
use crate::document::FlowDocument;
use crate::error::LayoutError;
use crate::model::{NodeId, Point};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Tolerance when comparing y values of one layer.
const LEVEL_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNode {
    pub id: NodeId,
    /// An empty list makes the node a leaf.
    pub children: Vec<NodeId>,
}

impl LayerNode {
    pub fn new(id: impl Into<NodeId>, children: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            children,
        }
    }

    pub fn leaf(id: impl Into<NodeId>) -> Self {
        Self::new(id, Vec::new())
    }
}

/// One rank of the hierarchy, top layer first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layer {
    pub nodes: Vec<LayerNode>,
}

impl Layer {
    pub fn new(nodes: Vec<LayerNode>) -> Self {
        Self { nodes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlignmentStats {
    pub calculations: usize,
    pub leaves_placed: usize,
    /// Parents centered over their children plus layers shifted for skew.
    pub alignment_adjustments: usize,
    pub skew_cases: usize,
}

#[derive(Debug, Default)]
pub struct LayoutAligner {
    config: AlignmentConfig,
    stats: AlignmentStats,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

impl LayoutAligner {
    pub fn new(config: AlignmentConfig) -> Self {
        Self {
            config,
            stats: AlignmentStats::default(),
        }
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn stats(&self) -> AlignmentStats {
        self.stats
    }

    /// Horizontal distance between neighbouring leaves when `count` leaves
    /// are placed.
    pub fn leaf_step(&self, count: usize) -> f64 {
        if count < 2 {
            return 0.0;
        }
        let gaps = (count - 1) as f64;
        let width = self.config.max_width.min(gaps * self.config.preferred_spacing);
        (width / gaps).max(self.config.min_spacing)
    }

    /// Compute aligned positions for every node of `layers`.
    ///
    /// `current` supplies y values (unless a layer height is configured)
    /// and is returned unchanged for the nodes of a hierarchy without
    /// leaves.
    pub fn calculate_geometric_alignment(
        &mut self,
        layers: &[Layer],
        current: &HashMap<NodeId, Point>,
    ) -> Result<HashMap<NodeId, Point>, LayoutError> {
        self.stats.calculations += 1;

        // first occurrence of a node decides its layer
        let mut layer_of: HashMap<&NodeId, usize> = HashMap::new();
        let mut ordered: Vec<(&NodeId, usize)> = Vec::new();
        for (index, layer) in layers.iter().enumerate() {
            for node in &layer.nodes {
                if layer_of.contains_key(&node.id) {
                    warn!(node = %node.id, layer = index, "node listed in more than one layer");
                    continue;
                }
                layer_of.insert(&node.id, index);
                ordered.push((&node.id, index));
            }
        }

        let mut children: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for layer in layers {
            for node in &layer.nodes {
                if children.contains_key(&node.id) {
                    continue;
                }
                let known = node
                    .children
                    .iter()
                    .filter(|child| {
                        let found = layer_of.contains_key(child);
                        if !found {
                            warn!(parent = %node.id, child = %child, "child is not in any layer, ignored");
                        }
                        found
                    })
                    .collect();
                children.insert(&node.id, known);
            }
        }

        let mut positions: HashMap<NodeId, Point> = HashMap::with_capacity(ordered.len());
        for (index, layer) in layers.iter().enumerate() {
            let reference_y = layer
                .nodes
                .iter()
                .find_map(|n| current.get(&n.id).map(|p| p.y))
                .unwrap_or(index as f64 * self.config.min_spacing);
            for node in &layer.nodes {
                if positions.contains_key(&node.id) {
                    continue;
                }
                let known = current.get(&node.id).copied();
                let y = match self.config.layer_height {
                    Some(height) => index as f64 * height,
                    None => known.map_or(reference_y, |p| p.y),
                };
                let x = known.map_or(0.0, |p| p.x);
                positions.insert(node.id.clone(), Point::new(x, y));
            }
        }

        let leaves: Vec<&NodeId> = ordered
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| children.get(id).map_or(true, |c| c.is_empty()))
            .collect();
        if leaves.is_empty() {
            debug!(nodes = ordered.len(), "no leaves, layout unchanged");
            return Ok(positions);
        }

        // leaves
        let step = self.leaf_step(leaves.len());
        let center = (leaves.len() as f64 - 1.0) / 2.0;
        for (i, leaf) in leaves.iter().enumerate() {
            if let Some(p) = positions.get_mut(*leaf) {
                p.x = (i as f64 - center) * step;
            }
        }
        self.stats.leaves_placed += leaves.len();

        // parents, bottom-up with memoized post-order
        let mut finalize_order: Vec<&NodeId> = Vec::with_capacity(ordered.len());
        let mut visits: HashMap<&NodeId, Visit> = HashMap::new();
        for layer in layers.iter().rev() {
            for node in &layer.nodes {
                self.finalize(&node.id, &children, &mut visits, &mut finalize_order, &mut positions)?;
            }
        }

        // skew between layers
        if self.config.enable_skew_compensation {
            self.compensate_skew(layers, &children, &finalize_order, &mut positions);
        }

        // global shift
        if self.config.enable_global_alignment && !positions.is_empty() {
            let mean = positions.values().map(|p| p.x).sum::<f64>() / positions.len() as f64;
            if mean.abs() > f64::EPSILON {
                for p in positions.values_mut() {
                    p.x -= mean;
                }
            }
        }

        validate(layers, &positions)?;
        debug!(
            nodes = positions.len(),
            leaves = leaves.len(),
            step,
            "geometric alignment computed"
        );
        Ok(positions)
    }

    /// Center `root` and everything below it, children before parents,
    /// each node once.
    fn finalize<'a>(
        &mut self,
        root: &'a NodeId,
        children: &HashMap<&'a NodeId, Vec<&'a NodeId>>,
        visits: &mut HashMap<&'a NodeId, Visit>,
        order: &mut Vec<&'a NodeId>,
        positions: &mut HashMap<NodeId, Point>,
    ) -> Result<(), LayoutError> {
        if visits.contains_key(root) {
            return Ok(());
        }
        let kids_of = |id: &NodeId| children.get(id).cloned().unwrap_or_default();
        let mut stack: Vec<(&'a NodeId, Vec<&'a NodeId>, usize)> = vec![(root, kids_of(root), 0)];
        visits.insert(root, Visit::InProgress);

        while let Some((node, kids, index)) = stack.last_mut() {
            if let Some(child) = kids.get(*index).copied() {
                *index += 1;
                match visits.get(child) {
                    Some(Visit::InProgress) => return Err(LayoutError::CyclicHierarchy(child.clone())),
                    Some(Visit::Done) => {}
                    None => {
                        visits.insert(child, Visit::InProgress);
                        stack.push((child, kids_of(child), 0));
                    }
                }
                continue;
            }

            let node: &'a NodeId = *node;
            if !kids.is_empty() {
                let xs: Vec<f64> = kids
                    .iter()
                    .filter_map(|k| positions.get(*k).map(|p| p.x))
                    .collect();
                if !xs.is_empty() {
                    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
                    if let Some(p) = positions.get_mut(node) {
                        p.x = mean;
                    }
                    self.stats.alignment_adjustments += 1;
                }
            }
            visits.insert(node, Visit::Done);
            order.push(node);
            stack.pop();
        }
        Ok(())
    }

    fn compensate_skew(
        &mut self,
        layers: &[Layer],
        children: &HashMap<&NodeId, Vec<&NodeId>>,
        finalize_order: &[&NodeId],
        positions: &mut HashMap<NodeId, Point>,
    ) {
        let means: Vec<f64> = layers
            .iter()
            .filter(|l| !l.nodes.is_empty())
            .map(|l| {
                let xs: Vec<f64> = l
                    .nodes
                    .iter()
                    .filter_map(|n| positions.get(&n.id).map(|p| p.x))
                    .collect();
                xs.iter().sum::<f64>() / xs.len().max(1) as f64
            })
            .collect();
        if means.len() < 2 {
            return;
        }
        let overall = means.iter().sum::<f64>() / means.len() as f64;
        let variance = means.iter().map(|m| (m - overall).powi(2)).sum::<f64>() / means.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev <= self.config.skew_threshold {
            return;
        }

        self.stats.skew_cases += 1;
        debug!(std_dev, "layer skew detected");
        for (layer, mean) in layers.iter().filter(|l| !l.nodes.is_empty()).zip(means) {
            if mean.abs() <= self.config.skew_tolerance {
                continue;
            }
            for node in &layer.nodes {
                if let Some(p) = positions.get_mut(&node.id) {
                    p.x -= mean;
                }
            }
            self.stats.alignment_adjustments += 1;
        }

        // shifting layers broke parent centering; restore it in post-order
        for node in finalize_order {
            let Some(kids) = children.get(*node).filter(|k| !k.is_empty()) else {
                continue;
            };
            let xs: Vec<f64> = kids
                .iter()
                .filter_map(|k| positions.get(*k).map(|p| p.x))
                .collect();
            if xs.is_empty() {
                continue;
            }
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            if let Some(p) = positions.get_mut(*node) {
                p.x = mean;
            }
            self.stats.alignment_adjustments += 1;
        }
    }
}

fn validate(layers: &[Layer], positions: &HashMap<NodeId, Point>) -> Result<(), LayoutError> {
    for (id, p) in positions {
        if !p.is_finite() {
            return Err(LayoutError::NonFiniteCoordinate {
                node: id.clone(),
                x: p.x,
                y: p.y,
            });
        }
    }
    for (index, layer) in layers.iter().enumerate() {
        if layer.nodes.len() < 2 {
            continue;
        }
        let mut level: Option<f64> = None;
        for node in &layer.nodes {
            let Some(p) = positions.get(&node.id) else {
                continue;
            };
            match level {
                None => level = Some(p.y),
                Some(expected) if (expected - p.y).abs() > LEVEL_EPSILON => {
                    return Err(LayoutError::InconsistentLayerY {
                        layer: index,
                        node: node.id.clone(),
                        expected,
                        found: p.y,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Rank the nodes of `doc` by longest path from the roots over committed
/// edges. Nodes caught in a cycle end up in one extra layer after the rest.
pub fn layers_from_document(doc: &FlowDocument) -> Vec<Layer> {
    let ids: Vec<NodeId> = doc.nodes().map(|n| n.id.clone()).collect();
    let mut indegree: HashMap<&NodeId, usize> = ids.iter().map(|id| (id, 0)).collect();
    let mut children: HashMap<&NodeId, Vec<NodeId>> = HashMap::new();
    for id in &ids {
        let kids = doc.children(id.as_str());
        for kid in &kids {
            if let Some(count) = indegree.get_mut(kid) {
                *count += 1;
            }
        }
        children.insert(id, kids);
    }

    let mut rank: HashMap<&NodeId, usize> = HashMap::new();
    let mut queue: VecDeque<&NodeId> = ids.iter().filter(|id| indegree[id] == 0).collect();
    for root in &queue {
        rank.insert(*root, 0);
    }
    while let Some(id) = queue.pop_front() {
        let next = rank[id] + 1;
        for kid in children.get(id).into_iter().flatten() {
            let Some((kid, count)) = indegree.get_key_value(kid).map(|(k, c)| (*k, *c)) else {
                continue;
            };
            let entry = rank.entry(kid).or_insert(next);
            *entry = (*entry).max(next);
            if let Some(c) = indegree.get_mut(kid) {
                *c = count - 1;
                if *c == 0 {
                    queue.push_back(kid);
                }
            }
        }
    }

    let depth = rank
        .iter()
        .filter(|(id, _)| indegree[*id] == 0)
        .map(|(_, r)| *r)
        .max()
        .map_or(0, |d| d + 1);
    let mut layers: Vec<Layer> = vec![Layer::default(); depth];
    let mut stranded = Vec::new();
    let mut placed: HashSet<&NodeId> = HashSet::new();
    for id in &ids {
        let node = LayerNode::new(id.clone(), children.get(id).cloned().unwrap_or_default());
        match rank.get(id) {
            Some(r) if indegree[id] == 0 => {
                layers[*r].nodes.push(node);
                placed.insert(id);
            }
            _ => stranded.push(node),
        }
    }
    if !stranded.is_empty() {
        warn!(nodes = stranded.len(), "nodes on a cycle placed in a trailing layer");
        layers.push(Layer::new(stranded));
    }
    debug!(layers = layers.len(), placed = placed.len(), "layers derived from document");
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Node, NodeKind};

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    /// root -> (a, b), a -> (c, d)
    fn tree() -> Vec<Layer> {
        vec![
            Layer::new(vec![LayerNode::new("root", ids(&["a", "b"]))]),
            Layer::new(vec![
                LayerNode::new("a", ids(&["c", "d"])),
                LayerNode::leaf("b"),
            ]),
            Layer::new(vec![LayerNode::leaf("c"), LayerNode::leaf("d")]),
        ]
    }

    fn flat_positions(layers: &[Layer]) -> HashMap<NodeId, Point> {
        layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                l.nodes
                    .iter()
                    .map(move |n| (n.id.clone(), Point::new(0.0, i as f64 * 150.0)))
            })
            .collect()
    }

    fn aligner_without_shifts() -> LayoutAligner {
        LayoutAligner::new(AlignmentConfig {
            enable_skew_compensation: false,
            enable_global_alignment: false,
            ..AlignmentConfig::default()
        })
    }

    #[test]
    fn test_leaf_step_bounds() {
        let aligner = LayoutAligner::default();
        assert_eq!(aligner.leaf_step(1), 0.0);
        assert_eq!(aligner.leaf_step(2), 200.0);
        assert_eq!(aligner.leaf_step(5), 200.0);
        // 800 / 9 would be below the 150 minimum
        assert_eq!(aligner.leaf_step(10), 150.0);
    }

    #[test]
    fn test_parents_sit_over_children() {
        let layers = tree();
        let mut aligner = aligner_without_shifts();
        let positions = aligner
            .calculate_geometric_alignment(&layers, &flat_positions(&layers))
            .unwrap();

        // leaves in layer order: b, c, d
        assert_eq!(positions[&NodeId::from("b")].x, -200.0);
        assert_eq!(positions[&NodeId::from("c")].x, 0.0);
        assert_eq!(positions[&NodeId::from("d")].x, 200.0);
        assert_eq!(positions[&NodeId::from("a")].x, 100.0);
        assert_eq!(positions[&NodeId::from("root")].x, -50.0);
        assert_eq!(aligner.stats().leaves_placed, 3);
        assert_eq!(aligner.stats().alignment_adjustments, 2);
    }

    #[test]
    fn test_global_shift_centers_tree() {
        let layers = tree();
        let mut aligner = LayoutAligner::new(AlignmentConfig {
            enable_skew_compensation: false,
            ..AlignmentConfig::default()
        });
        let positions = aligner
            .calculate_geometric_alignment(&layers, &flat_positions(&layers))
            .unwrap();
        let mean = positions.values().map(|p| p.x).sum::<f64>() / positions.len() as f64;
        assert!(mean.abs() < 1e-9);
        let a = positions[&NodeId::from("a")].x;
        let c = positions[&NodeId::from("c")].x;
        let d = positions[&NodeId::from("d")].x;
        assert!((a - (c + d) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_skew_compensation_keeps_parents_centered() {
        let layers = tree();
        let mut aligner = LayoutAligner::default();
        let positions = aligner
            .calculate_geometric_alignment(&layers, &flat_positions(&layers))
            .unwrap();
        assert_eq!(aligner.stats().skew_cases, 1);
        for layer in &layers {
            for node in &layer.nodes {
                if node.children.is_empty() {
                    continue;
                }
                let mean = node.children.iter().map(|c| positions[c].x).sum::<f64>()
                    / node.children.len() as f64;
                assert!((positions[&node.id].x - mean).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_single_leaf_sits_at_zero() {
        let layers = vec![Layer::new(vec![LayerNode::leaf("only")])];
        let current = HashMap::from([(NodeId::from("only"), Point::new(300.0, 75.0))]);
        let positions = LayoutAligner::default()
            .calculate_geometric_alignment(&layers, &current)
            .unwrap();
        assert_eq!(positions[&NodeId::from("only")], Point::new(0.0, 75.0));
    }

    #[test]
    fn test_layer_height_sets_y() {
        let layers = tree();
        let mut aligner = LayoutAligner::new(AlignmentConfig {
            layer_height: Some(120.0),
            ..AlignmentConfig::default()
        });
        let positions = aligner
            .calculate_geometric_alignment(&layers, &HashMap::new())
            .unwrap();
        assert_eq!(positions[&NodeId::from("root")].y, 0.0);
        assert_eq!(positions[&NodeId::from("b")].y, 120.0);
        assert_eq!(positions[&NodeId::from("d")].y, 240.0);
    }

    #[test]
    fn test_uneven_layer_is_rejected() {
        let layers = tree();
        let mut current = flat_positions(&layers);
        current.insert(NodeId::from("b"), Point::new(0.0, 999.0));
        let err = LayoutAligner::default()
            .calculate_geometric_alignment(&layers, &current)
            .unwrap_err();
        assert!(matches!(err, LayoutError::InconsistentLayerY { layer: 1, .. }));
    }

    #[test]
    fn test_non_finite_input_is_rejected() {
        let layers = vec![Layer::new(vec![LayerNode::leaf("x")])];
        let current = HashMap::from([(NodeId::from("x"), Point::new(0.0, f64::NAN))]);
        let err = LayoutAligner::default()
            .calculate_geometric_alignment(&layers, &current)
            .unwrap_err();
        assert!(matches!(err, LayoutError::NonFiniteCoordinate { .. }));
    }

    #[test]
    fn test_cycle_among_children_is_an_error() {
        let layers = vec![
            Layer::new(vec![LayerNode::new("a", ids(&["b"]))]),
            Layer::new(vec![LayerNode::new("b", ids(&["a"])), LayerNode::leaf("c")]),
        ];
        let err = LayoutAligner::default()
            .calculate_geometric_alignment(&layers, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, LayoutError::CyclicHierarchy(_)));
    }

    #[test]
    fn test_unknown_child_is_ignored() {
        let layers = vec![
            Layer::new(vec![LayerNode::new("p", ids(&["ghost", "k"]))]),
            Layer::new(vec![LayerNode::leaf("k")]),
        ];
        let positions = aligner_without_shifts()
            .calculate_geometric_alignment(&layers, &HashMap::new())
            .unwrap();
        assert_eq!(positions[&NodeId::from("p")].x, positions[&NodeId::from("k")].x);
    }

    #[test]
    fn test_no_leaves_is_a_no_op() {
        let positions = LayoutAligner::default()
            .calculate_geometric_alignment(&[], &HashMap::new())
            .unwrap();
        assert!(positions.is_empty());
    }

    #[test]
    fn test_layers_from_document_use_longest_path() {
        let mut doc = FlowDocument::new();
        for (id, kind) in [
            ("start", NodeKind::Start),
            ("sms", NodeKind::Sms),
            ("wait", NodeKind::Wait),
            ("end", NodeKind::End),
        ] {
            doc.add_node(Node::new(id, kind, id, Point::ORIGIN)).unwrap();
        }
        doc.add_edge(Endpoint::node("start"), Endpoint::node("sms"), None).unwrap();
        doc.add_edge(Endpoint::node("sms"), Endpoint::node("wait"), None).unwrap();
        doc.add_edge(Endpoint::node("wait"), Endpoint::node("end"), None).unwrap();

        let layers = layers_from_document(&doc);
        let names: Vec<Vec<&str>> = layers
            .iter()
            .map(|l| l.nodes.iter().map(|n| n.id.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["start"], vec!["sms"], vec!["wait"], vec!["end"]]);
        assert_eq!(layers[0].nodes[0].children, ids(&["sms"]));
    }
}
