//! Layer assignment through `rust-sugiyama`.
//!
//! Sugiyama ranking also minimises crossings, so the order of nodes inside
//! each returned layer is usually better than the insertion order
//! [`layers_from_document`](super::layers_from_document) keeps.

use super::{Layer, LayerNode};
use crate::document::FlowDocument;
use crate::model::NodeId;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Rows closer than this are the same layer.
const ROW_EPSILON: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SugiyamaConfig {
    /// Minimum spacing between vertices; `0.0` keeps the crate default.
    pub vertex_spacing: f64,
    /// Minimum edge length in layers; `0` keeps the crate default.
    pub minimum_length: u32,
    /// Width and height assumed for every node.
    pub node_size: (f64, f64),
}

impl Default for SugiyamaConfig {
    fn default() -> Self {
        Self {
            vertex_spacing: 0.0,
            minimum_length: 0,
            node_size: (200.0, 80.0),
        }
    }
}

/// Rank the nodes of `doc` with the Sugiyama method.
///
/// Layers are ordered top to bottom, nodes inside a layer left to right.
pub fn sugiyama_layers(doc: &FlowDocument, config: &SugiyamaConfig) -> Vec<Layer> {
    let mut id_to_idx: HashMap<&NodeId, u32> = HashMap::new();
    let mut idx_to_id: Vec<&NodeId> = Vec::with_capacity(doc.node_count());
    for node in doc.nodes() {
        id_to_idx.insert(&node.id, idx_to_id.len() as u32);
        idx_to_id.push(&node.id);
    }
    if idx_to_id.is_empty() {
        return Vec::new();
    }

    let vertices: Vec<(u32, (f64, f64))> = (0..idx_to_id.len() as u32)
        .map(|idx| (idx, config.node_size))
        .collect();
    let edges: Vec<(u32, u32)> = doc
        .edges()
        .iter()
        .filter_map(|e| {
            let src = id_to_idx.get(&e.source.node)?;
            let dst = id_to_idx.get(&e.target.node)?;
            Some((*src, *dst))
        })
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let mut sg_config = rust_sugiyama::configure::Config {
        dummy_vertices: false,
        ..Default::default()
    };
    if config.vertex_spacing > 0.0 {
        sg_config.vertex_spacing = config.vertex_spacing;
    }
    if config.minimum_length > 0 {
        sg_config.minimum_length = config.minimum_length;
    }

    let subgraphs = rust_sugiyama::from_vertices_and_edges(&vertices, &edges, &sg_config);

    // row key -> (x, node)
    let mut rows: BTreeMap<i64, Vec<(f64, &NodeId)>> = BTreeMap::new();
    for (layout, _width, _height) in &subgraphs {
        for &(idx, (x, y)) in layout {
            if let Some(id) = idx_to_id.get(idx) {
                let key = (y / ROW_EPSILON).round() as i64;
                rows.entry(key).or_default().push((x, *id));
            }
        }
    }

    let layers: Vec<Layer> = rows
        .into_values()
        .map(|mut row| {
            row.sort_by(|a, b| a.0.total_cmp(&b.0));
            Layer::new(
                row.into_iter()
                    .map(|(_, id)| LayerNode::new(id.clone(), doc.children(id.as_str())))
                    .collect(),
            )
        })
        .collect();
    debug!(layers = layers.len(), subgraphs = subgraphs.len(), "sugiyama layers computed");
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Node, NodeKind, Point};

    fn diamond() -> FlowDocument {
        let mut doc = FlowDocument::new();
        for (id, kind) in [
            ("start", NodeKind::Start),
            ("a", NodeKind::Sms),
            ("b", NodeKind::Wait),
            ("end", NodeKind::End),
        ] {
            doc.add_node(Node::new(id, kind, id, Point::ORIGIN)).unwrap();
        }
        for (s, t) in [("start", "a"), ("start", "b"), ("a", "end"), ("b", "end")] {
            doc.add_edge(Endpoint::node(s), Endpoint::node(t), None).unwrap();
        }
        doc
    }

    #[test]
    fn test_empty_document() {
        assert!(sugiyama_layers(&FlowDocument::new(), &SugiyamaConfig::default()).is_empty());
    }

    #[test]
    fn test_diamond_has_three_layers() {
        let layers = sugiyama_layers(&diamond(), &SugiyamaConfig::default());
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].nodes[0].id.as_str(), "start");
        assert_eq!(layers[1].nodes.len(), 2);
        assert_eq!(layers[2].nodes[0].id.as_str(), "end");
        assert_eq!(layers[0].nodes[0].children.len(), 2);
    }
}
