//! The flow document: nodes, committed edges and port geometry.
//!
//! [`FlowDocument`] is the single owner of committed graph state. Port
//! connection counts are kept in step with the edge list, so a port never
//! holds more edges than its capacity.

use crate::error::GraphError;
use crate::model::{
    BranchId, Edge, EdgeId, EdgeKind, Endpoint, Node, NodeConfig, NodeId, Point, PortCategory,
    PortDirection, PortId,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Default vertical distance from a node's anchor to its ports.
const PORT_OFFSET_Y: f64 = 40.0;
/// Default horizontal spacing between branch output ports.
const BRANCH_PORT_SPACING: f64 = 60.0;

/// Immutable successor lists of the committed graph.
#[derive(Debug, Clone, Default)]
pub struct AdjacencySnapshot {
    successors: HashMap<NodeId, Vec<NodeId>>,
}

impl AdjacencySnapshot {
    pub fn successors(&self, node: &str) -> &[NodeId] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.successors.keys()
    }
}

impl FromIterator<(NodeId, NodeId)> for AdjacencySnapshot {
    fn from_iter<T: IntoIterator<Item = (NodeId, NodeId)>>(iter: T) -> Self {
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (from, to) in iter {
            let targets = successors.entry(from).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
        }
        Self { successors }
    }
}

/// Structural relations of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRelations {
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
    pub edges: usize,
}

impl NodeRelations {
    pub fn is_connected(&self) -> bool {
        self.edges > 0 || !self.parents.is_empty() || !self.children.is_empty()
    }
}

/// Owns every node and committed edge of a flow.
#[derive(Debug, Clone, Default)]
pub struct FlowDocument {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    port_offsets: HashMap<(NodeId, PortId), Point>,
    next_edge: u64,
}

impl FlowDocument {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        debug!(node = %node.id, kind = %node.kind, "node added");
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<Node, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(NodeId::from(id)));
        }
        let touching: Vec<EdgeId> = self
            .edges
            .iter()
            .filter(|e| e.source.node.as_str() == id || e.target.node.as_str() == id)
            .map(|e| e.id.clone())
            .collect();
        for edge_id in touching {
            self.remove_edge(edge_id.as_str())?;
        }
        self.order.retain(|n| n.as_str() != id);
        self.port_offsets.retain(|(node, _), _| node.as_str() != id);
        self.nodes
            .remove(id)
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(id)))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn set_position(&mut self, id: &str, position: Point) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        node.position = position;
        Ok(())
    }

    pub fn set_configured(&mut self, id: &str, is_configured: bool) -> Result<(), GraphError> {
        self.node_mut(id)?.is_configured = is_configured;
        Ok(())
    }

    /// Replace a node's configuration, re-deriving its branch ports.
    ///
    /// Ports that survive keep their connection counts. Dropping a branch
    /// whose port still carries an edge is refused.
    pub fn set_config(&mut self, id: &str, config: NodeConfig) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        if !config.matches(&node.kind) {
            return Err(GraphError::ConfigKindMismatch {
                node: node.kind.to_string(),
                config: config.kind_name().to_owned(),
            });
        }

        let mut ports = crate::model::port_template(&node.id, &node.kind, config.branches());
        for old in &node.ports {
            match ports.iter_mut().find(|p| p.id == old.id) {
                Some(kept) => kept.set_connections(old.connections()),
                None if old.connections() > 0 => {
                    return Err(GraphError::PortInUse {
                        node: node.id.clone(),
                        port: old.id.clone(),
                        connections: old.connections(),
                    })
                }
                None => {}
            }
        }
        node.ports = ports;
        node.config = config;
        Ok(())
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(id)))
    }

    // ------------------------------------------------------------------
    // Port geometry
    // ------------------------------------------------------------------

    /// Record where the render layer placed a port, relative to its node.
    pub fn report_port_offset(&mut self, node: &str, port: &str, offset: Point) {
        self.port_offsets
            .insert((NodeId::from(node), PortId::from(port)), offset);
    }

    /// Absolute position of a port.
    ///
    /// Falls back to a vertical layout (inputs on top, outputs below) when
    /// the render layer has not reported the port.
    pub fn port_position(&self, node: &str, port: &str) -> Option<Point> {
        let owner = self.nodes.get(node)?;
        let port_def = owner.port(port)?;
        if let Some(offset) = self.port_offsets.get(&(owner.id.clone(), port_def.id.clone())) {
            return Some(owner.position.offset(offset.x, offset.y));
        }
        let offset = match port_def.category {
            PortCategory::Input => Point::new(0.0, -PORT_OFFSET_Y),
            PortCategory::Output => Point::new(0.0, PORT_OFFSET_Y),
            PortCategory::BranchOutput => {
                let branches: Vec<_> = owner
                    .ports
                    .iter()
                    .filter(|p| p.category == PortCategory::BranchOutput)
                    .collect();
                let index = branches.iter().position(|p| p.id == port_def.id).unwrap_or(0);
                let center = (branches.len() as f64 - 1.0) / 2.0;
                Point::new((index as f64 - center) * BRANCH_PORT_SPACING, PORT_OFFSET_Y)
            }
        };
        Some(owner.position.offset(offset.x, offset.y))
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id.as_str() == id)
    }

    /// Add a committed edge.
    ///
    /// Missing ports are resolved to the node's default output or input.
    /// The branch id defaults to the branch served by the source port.
    /// Rule checks are the caller's business; this only guards the
    /// structural invariants.
    pub fn add_edge(
        &mut self,
        source: Endpoint,
        target: Endpoint,
        branch_id: Option<BranchId>,
    ) -> Result<EdgeId, GraphError> {
        if source.node == target.node {
            return Err(GraphError::SelfConnection(source.node));
        }
        let source_port = self.resolve_port(&source, PortDirection::Output)?;
        let target_port = self.resolve_port(&target, PortDirection::Input)?;

        let branch_id = match branch_id {
            Some(branch) => Some(branch),
            None => self
                .nodes
                .get(&source.node)
                .and_then(|n| n.port(source_port.as_str()))
                .and_then(|p| p.branch_id.clone()),
        };

        for (endpoint, port) in [(&source, &source_port), (&target, &target_port)] {
            let node = self.node_mut(endpoint.node.as_str())?;
            let port_def = node
                .port_mut(port.as_str())
                .ok_or_else(|| GraphError::PortNotFound {
                    node: endpoint.node.clone(),
                    port: port.clone(),
                })?;
            if !port_def.has_capacity() {
                return Err(GraphError::PortFull {
                    node: endpoint.node.clone(),
                    port: port.clone(),
                    capacity: port_def.capacity,
                });
            }
        }
        self.bump_port(&source.node, &source_port, 1);
        self.bump_port(&target.node, &target_port, 1);

        self.next_edge += 1;
        let id = EdgeId::new(format!("edge_{}", self.next_edge));
        debug!(edge = %id, source = %source.node, target = %target.node, "committed edge added");
        self.edges.push(Edge {
            id: id.clone(),
            source: Endpoint {
                node: source.node,
                port: Some(source_port),
            },
            target: Endpoint {
                node: target.node,
                port: Some(target_port),
            },
            kind: EdgeKind::Committed,
            branch_id,
        });
        Ok(id)
    }

    pub fn remove_edge(&mut self, id: &str) -> Result<Edge, GraphError> {
        let index = self
            .edges
            .iter()
            .position(|e| e.id.as_str() == id)
            .ok_or_else(|| GraphError::EdgeNotFound(EdgeId::from(id)))?;
        let edge = self.edges.remove(index);
        if let Some(port) = &edge.source.port {
            self.bump_port(&edge.source.node, port, -1);
        }
        if let Some(port) = &edge.target.port {
            self.bump_port(&edge.target.node, port, -1);
        }
        Ok(edge)
    }

    fn resolve_port(&self, endpoint: &Endpoint, direction: PortDirection) -> Result<PortId, GraphError> {
        let node = self
            .nodes
            .get(&endpoint.node)
            .ok_or_else(|| GraphError::NodeNotFound(endpoint.node.clone()))?;
        if let Some(port) = &endpoint.port {
            return Ok(port.clone());
        }
        node.default_port(direction)
            .map(|p| p.id.clone())
            .ok_or_else(|| GraphError::PortNotFound {
                node: endpoint.node.clone(),
                port: PortId::from(match direction {
                    PortDirection::Input => "in",
                    PortDirection::Output => "out",
                }),
            })
    }

    fn bump_port(&mut self, node: &NodeId, port: &PortId, delta: isize) {
        if let Some(port) = self
            .nodes
            .get_mut(node)
            .and_then(|n| n.port_mut(port.as_str()))
        {
            let next = port.connections().saturating_add_signed(delta);
            port.set_connections(next);
        }
    }

    pub fn outgoing_count(&self, node: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.source.node.as_str() == node)
            .count()
    }

    pub fn incoming_count(&self, node: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.target.node.as_str() == node)
            .count()
    }

    /// Look for an edge between the same nodes on the same branch.
    pub fn find_duplicate(
        &self,
        source: &str,
        target: &str,
        branch: Option<&BranchId>,
        ignore: Option<&EdgeId>,
    ) -> Option<&Edge> {
        self.edges.iter().find(|e| {
            e.source.node.as_str() == source
                && e.target.node.as_str() == target
                && e.branch_id.as_ref() == branch
                && Some(&e.id) != ignore
        })
    }

    /// True when `branch` of `source` already leads somewhere.
    pub fn has_committed_branch(&self, source: &str, branch: &BranchId) -> bool {
        self.edges
            .iter()
            .any(|e| e.source.node.as_str() == source && e.branch_id.as_ref() == Some(branch))
    }

    /// True when `source` has a committed edge that is not tied to a branch.
    pub fn has_committed_main(&self, source: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source.node.as_str() == source && e.branch_id.is_none())
    }

    pub fn adjacency(&self) -> AdjacencySnapshot {
        self.edges
            .iter()
            .map(|e| (e.source.node.clone(), e.target.node.clone()))
            .collect()
    }

    /// Distinct targets of `node`'s outgoing edges, in edge order.
    pub fn children(&self, node: &str) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source.node.as_str() == node)
            .filter(|e| seen.insert(e.target.node.clone()))
            .map(|e| e.target.node.clone())
            .collect()
    }

    pub fn parents(&self, node: &str) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target.node.as_str() == node)
            .filter(|e| seen.insert(e.source.node.clone()))
            .map(|e| e.source.node.clone())
            .collect()
    }

    pub fn relations(&self, node: &str) -> NodeRelations {
        NodeRelations {
            parents: self.parents(node),
            children: self.children(node),
            edges: self
                .edges
                .iter()
                .filter(|e| e.source.node.as_str() == node || e.target.node.as_str() == node)
                .count(),
        }
    }
}
