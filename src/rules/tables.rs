//! Lookup tables of the rule engine: connection limits, allowed target
//! kinds and the port compatibility matrix.

use crate::model::{Node, NodeId, NodeKind, PortCategory};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Maximum simultaneous edges of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLimits {
    pub max_incoming: usize,
    pub max_outgoing: usize,
}

impl ConnectionLimits {
    pub const fn new(max_incoming: usize, max_outgoing: usize) -> Self {
        Self {
            max_incoming,
            max_outgoing,
        }
    }
}

/// Where a node's limits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    NodeOverride,
    KindDefault,
    GlobalDefault,
}

#[derive(Debug, Clone)]
pub struct RuleTables {
    default_limits: ConnectionLimits,
    kind_limits: HashMap<NodeKind, ConnectionLimits>,
    node_overrides: HashMap<NodeId, ConnectionLimits>,
    allowed_targets: HashMap<NodeKind, HashSet<NodeKind>>,
    port_matrix: HashMap<PortCategory, HashSet<PortCategory>>,
}

impl Default for RuleTables {
    fn default() -> Self {
        Self::marketing(ConnectionLimits::new(5, 5))
    }
}

impl RuleTables {
    /// Tables for the built-in marketing node kinds.
    pub fn marketing(default_limits: ConnectionLimits) -> Self {
        let kind_limits = HashMap::from([
            (NodeKind::Start, ConnectionLimits::new(0, 1)),
            (NodeKind::End, ConnectionLimits::new(10, 0)),
            (NodeKind::AudienceSplit, ConnectionLimits::new(1, 10)),
            (NodeKind::EventSplit, ConnectionLimits::new(1, 10)),
            (NodeKind::AbTest, ConnectionLimits::new(1, 2)),
            (NodeKind::Wait, ConnectionLimits::new(1, 1)),
            (NodeKind::Sms, ConnectionLimits::new(5, 1)),
            (NodeKind::AiCall, ConnectionLimits::new(5, 1)),
            (NodeKind::ManualCall, ConnectionLimits::new(5, 1)),
            (NodeKind::Benefit, ConnectionLimits::new(5, 1)),
        ]);

        let receivers: HashSet<NodeKind> = NodeKind::builtin()
            .into_iter()
            .filter(|k| !k.is_source_only())
            .collect();
        let allowed_targets = NodeKind::builtin()
            .into_iter()
            .map(|kind| {
                let targets = if kind.is_terminal() {
                    HashSet::new()
                } else {
                    receivers.clone()
                };
                (kind, targets)
            })
            .collect();

        let port_matrix = HashMap::from([
            (PortCategory::Output, HashSet::from([PortCategory::Input])),
            (PortCategory::BranchOutput, HashSet::from([PortCategory::Input])),
            (PortCategory::Input, HashSet::new()),
        ]);

        Self {
            default_limits,
            kind_limits,
            node_overrides: HashMap::new(),
            allowed_targets,
            port_matrix,
        }
    }

    /// Limits of `node`: per-node override, then kind default, then global default.
    pub fn limits_for(&self, node: &Node) -> (ConnectionLimits, LimitSource) {
        if let Some(limits) = self.node_overrides.get(&node.id) {
            return (*limits, LimitSource::NodeOverride);
        }
        if let Some(limits) = self.kind_limits.get(&node.kind) {
            return (*limits, LimitSource::KindDefault);
        }
        (self.default_limits, LimitSource::GlobalDefault)
    }

    pub fn set_default_limits(&mut self, limits: ConnectionLimits) {
        self.default_limits = limits;
    }

    pub fn set_kind_limits(&mut self, kind: NodeKind, limits: ConnectionLimits) {
        self.kind_limits.insert(kind, limits);
    }

    pub fn set_node_override(&mut self, node: impl Into<NodeId>, limits: ConnectionLimits) {
        self.node_overrides.insert(node.into(), limits);
    }

    pub fn clear_node_override(&mut self, node: &str) -> bool {
        self.node_overrides.remove(node).is_some()
    }

    /// Kinds `source` may connect to, or `None` if the kind is not in the table.
    pub fn allowed_targets(&self, source: &NodeKind) -> Option<&HashSet<NodeKind>> {
        self.allowed_targets.get(source)
    }

    pub fn is_known(&self, kind: &NodeKind) -> bool {
        self.allowed_targets.contains_key(kind)
    }

    /// Replace the target set of `source`, registering the kind if new.
    pub fn allow_targets<I>(&mut self, source: NodeKind, targets: I)
    where
        I: IntoIterator<Item = NodeKind>,
    {
        self.allowed_targets
            .insert(source, targets.into_iter().collect());
    }

    /// Categories a port of `source` category may connect to.
    pub fn port_targets(&self, source: PortCategory) -> Option<&HashSet<PortCategory>> {
        self.port_matrix.get(&source)
    }

    pub fn set_port_targets<I>(&mut self, source: PortCategory, targets: I)
    where
        I: IntoIterator<Item = PortCategory>,
    {
        self.port_matrix.insert(source, targets.into_iter().collect());
    }
}
