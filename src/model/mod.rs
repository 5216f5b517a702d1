//! Core data types of a flow document: identifiers, node kinds, ports,
//! nodes and edges.
//!
//! Nodes receive their ports from a per-kind template when they are created.
//! Port membership only changes when a split node's branch list is
//! reconfigured; connection counts are maintained by
//! [`FlowDocument`](crate::document::FlowDocument).

mod business;

pub use business::{
    AbTestConfig, AiCallConfig, AudienceSplitConfig, BenefitConfig, BranchDef, CustomConfig,
    EndConfig, EventSplitConfig, ManualCallConfig, NodeConfig, SmsConfig, StartConfig,
    WaitConfig,
};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True for empty or whitespace-only ids.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a node in the flow document.
    NodeId
);
string_id!(
    /// Identifier of a port, unique within its node (`in`, `out`, `branch-<id>`).
    PortId
);
string_id!(
    /// Identifier of a committed or preview edge.
    EdgeId
);
string_id!(
    /// Identifier of one named output path of a splitting node.
    BranchId
);

/// A point in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }

    pub fn distance_sq(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// The flow-step kinds a marketing canvas offers.
///
/// Kinds serialize as kebab-case strings; anything unrecognized decodes to
/// [`NodeKind::Custom`] so host applications can register their own steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    AudienceSplit,
    EventSplit,
    AbTest,
    Sms,
    AiCall,
    ManualCall,
    Wait,
    Benefit,
    End,
    Custom(String),
}

impl NodeKind {
    /// All built-in kinds, in palette order.
    pub fn builtin() -> [NodeKind; 10] {
        [
            NodeKind::Start,
            NodeKind::AudienceSplit,
            NodeKind::EventSplit,
            NodeKind::AbTest,
            NodeKind::Sms,
            NodeKind::AiCall,
            NodeKind::ManualCall,
            NodeKind::Wait,
            NodeKind::Benefit,
            NodeKind::End,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::AudienceSplit => "audience-split",
            NodeKind::EventSplit => "event-split",
            NodeKind::AbTest => "ab-test",
            NodeKind::Sms => "sms",
            NodeKind::AiCall => "ai-call",
            NodeKind::ManualCall => "manual-call",
            NodeKind::Wait => "wait",
            NodeKind::Benefit => "benefit",
            NodeKind::End => "end",
            NodeKind::Custom(name) => name,
        }
    }

    /// Kinds that may start edges but never receive them.
    pub fn is_source_only(&self) -> bool {
        matches!(self, NodeKind::Start)
    }

    /// Kinds that may receive edges but never start them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::End)
    }

    /// Kinds whose outputs are named branches.
    pub fn is_split(&self) -> bool {
        matches!(
            self,
            NodeKind::AudienceSplit | NodeKind::EventSplit | NodeKind::AbTest
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for NodeKind {
    fn from(name: &str) -> Self {
        match name {
            "start" => NodeKind::Start,
            "audience-split" => NodeKind::AudienceSplit,
            "event-split" => NodeKind::EventSplit,
            "ab-test" => NodeKind::AbTest,
            "sms" => NodeKind::Sms,
            "ai-call" => NodeKind::AiCall,
            "manual-call" => NodeKind::ManualCall,
            "wait" => NodeKind::Wait,
            "benefit" => NodeKind::Benefit,
            "end" => NodeKind::End,
            other => NodeKind::Custom(other.to_owned()),
        }
    }
}

impl From<String> for NodeKind {
    fn from(name: String) -> Self {
        NodeKind::from(name.as_str())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Custom(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Category used by the port compatibility matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortCategory {
    Input,
    Output,
    BranchOutput,
}

impl PortCategory {
    pub fn direction(self) -> PortDirection {
        match self {
            PortCategory::Input => PortDirection::Input,
            PortCategory::Output | PortCategory::BranchOutput => PortDirection::Output,
        }
    }
}

/// A named attachment point on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub node_id: NodeId,
    pub category: PortCategory,
    /// Maximum number of simultaneous edges.
    pub capacity: usize,
    /// Set on branch output ports.
    pub branch_id: Option<BranchId>,
    connections: usize,
}

impl Port {
    pub fn new(node_id: NodeId, id: impl Into<PortId>, category: PortCategory, capacity: usize) -> Self {
        Self {
            id: id.into(),
            node_id,
            category,
            capacity,
            branch_id: None,
            connections: 0,
        }
    }

    pub fn for_branch(node_id: NodeId, branch: &BranchId) -> Self {
        Self {
            branch_id: Some(branch.clone()),
            ..Self::new(node_id, branch_port_id(branch), PortCategory::BranchOutput, 1)
        }
    }

    pub fn direction(&self) -> PortDirection {
        self.category.direction()
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    pub fn has_capacity(&self) -> bool {
        self.connections < self.capacity
    }

    pub(crate) fn set_connections(&mut self, connections: usize) {
        self.connections = connections;
    }
}

/// Port id of the output serving `branch`.
pub fn branch_port_id(branch: &BranchId) -> PortId {
    PortId::new(format!("branch-{}", branch))
}

/// Field names a node declares for data compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSchema {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A flow step on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub position: Point,
    pub ports: Vec<Port>,
    pub config: NodeConfig,
    pub is_configured: bool,
    pub schema: Option<NodeSchema>,
}

impl Node {
    /// Create a node with an empty configuration and its template ports.
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, name: impl Into<String>, position: Point) -> Self {
        let id = id.into();
        let config = NodeConfig::empty_for(&kind);
        let ports = port_template(&id, &kind, config.branches());
        Self {
            id,
            kind,
            name: name.into(),
            position,
            ports,
            config,
            is_configured: false,
            schema: None,
        }
    }

    /// Attach a configuration, deriving branch ports from it.
    ///
    /// Only valid on freshly built nodes; reconfiguring a node that already
    /// has edges goes through [`FlowDocument::set_config`](crate::document::FlowDocument::set_config).
    pub fn with_config(mut self, config: NodeConfig) -> Result<Self, crate::error::GraphError> {
        if !config.matches(&self.kind) {
            return Err(crate::error::GraphError::ConfigKindMismatch {
                node: self.kind.to_string(),
                config: config.kind_name().to_owned(),
            });
        }
        self.ports = port_template(&self.id, &self.kind, config.branches());
        self.config = config;
        Ok(self)
    }

    pub fn with_schema(mut self, schema: NodeSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn configured(mut self, is_configured: bool) -> Self {
        self.is_configured = is_configured;
        self
    }

    pub fn port(&self, id: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.id.as_str() == id)
    }

    pub(crate) fn port_mut(&mut self, id: &str) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.id.as_str() == id)
    }

    /// The port an edge uses when none is named: the first port of the
    /// given direction with spare capacity, else the first of that direction.
    pub fn default_port(&self, direction: PortDirection) -> Option<&Port> {
        self.ports
            .iter()
            .find(|p| p.direction() == direction && p.has_capacity())
            .or_else(|| self.ports.iter().find(|p| p.direction() == direction))
    }

    /// The primary input port, if the kind accepts incoming edges.
    pub fn input_port(&self) -> Option<&Port> {
        self.ports.iter().find(|p| p.category == PortCategory::Input)
    }

    /// Output ports, branch outputs included.
    pub fn output_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports
            .iter()
            .filter(|p| p.direction() == PortDirection::Output)
    }
}

/// Build the ports a node of `kind` starts with.
pub fn port_template(node_id: &NodeId, kind: &NodeKind, branches: &[BranchDef]) -> Vec<Port> {
    let input = |capacity| Port::new(node_id.clone(), "in", PortCategory::Input, capacity);
    let output = |capacity| Port::new(node_id.clone(), "out", PortCategory::Output, capacity);

    let mut ports = match kind {
        NodeKind::Start => vec![output(1)],
        NodeKind::End => vec![input(10)],
        NodeKind::AudienceSplit | NodeKind::EventSplit | NodeKind::AbTest => vec![input(1)],
        NodeKind::Wait => vec![input(1), output(1)],
        NodeKind::Sms | NodeKind::AiCall | NodeKind::ManualCall | NodeKind::Benefit => {
            vec![input(5), output(1)]
        }
        NodeKind::Custom(_) => vec![input(5), output(5)],
    };
    if kind.is_split() {
        ports.extend(
            branches
                .iter()
                .map(|branch| Port::for_branch(node_id.clone(), &branch.id)),
        );
    }
    ports
}

/// Whether an edge is part of the document or only drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Committed,
    Preview,
}

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub port: Option<PortId>,
}

impl Endpoint {
    pub fn node(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            port: None,
        }
    }

    pub fn port(node: impl Into<NodeId>, port: impl Into<PortId>) -> Self {
        Self {
            node: node.into(),
            port: Some(port.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: Endpoint,
    pub target: Endpoint,
    pub kind: EdgeKind,
    pub branch_id: Option<BranchId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_round_trips_through_strings() {
        for kind in NodeKind::builtin() {
            assert_eq!(NodeKind::from(kind.as_str()), kind);
        }
        assert_eq!(
            NodeKind::from("webhook"),
            NodeKind::Custom("webhook".into())
        );
    }

    #[test]
    fn test_node_kind_serde_uses_kebab_strings() {
        let json = serde_json::to_string(&NodeKind::AudienceSplit).unwrap();
        assert_eq!(json, "\"audience-split\"");
        let kind: NodeKind = serde_json::from_str("\"ai-call\"").unwrap();
        assert_eq!(kind, NodeKind::AiCall);
    }

    #[test]
    fn test_start_template_has_single_output() {
        let node = Node::new("s", NodeKind::Start, "Start", Point::ORIGIN);
        assert_eq!(node.ports.len(), 1);
        let out = node.port("out").unwrap();
        assert_eq!(out.direction(), PortDirection::Output);
        assert_eq!(out.capacity, 1);
        assert!(node.input_port().is_none());
    }

    #[test]
    fn test_split_template_derives_branch_ports() {
        let config = NodeConfig::AudienceSplit(AudienceSplitConfig {
            branches: vec![BranchDef::new("vip", "VIP"), BranchDef::new("rest", "Others")],
            rule: None,
        });
        let node = Node::new("split", NodeKind::AudienceSplit, "Split", Point::ORIGIN)
            .with_config(config)
            .unwrap();

        let outputs: Vec<_> = node.output_ports().map(|p| p.id.as_str()).collect();
        assert_eq!(outputs, vec!["branch-vip", "branch-rest"]);
        assert_eq!(
            node.port("branch-vip").unwrap().branch_id,
            Some(BranchId::from("vip"))
        );
    }

    #[test]
    fn test_with_config_rejects_other_kind() {
        let node = Node::new("n", NodeKind::Sms, "Sms", Point::ORIGIN);
        let result = node.with_config(NodeConfig::empty_for(&NodeKind::Wait));
        assert!(result.is_err());
    }

    #[test]
    fn test_id_blank_detection() {
        assert!(NodeId::from("  ").is_blank());
        assert!(!NodeId::from("n1").is_blank());
    }
}
