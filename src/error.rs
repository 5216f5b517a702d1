//! Error types for the flow canvas engine.
//!
//! Validation never fails with an `Err`; rule violations are reported as
//! [`ValidationIssue`](crate::rules::ValidationIssue)s. The enums here cover
//! the conditions that do propagate: document mutations, render layer
//! synchronization, layout sanity checks and configuration loading.

use crate::model::{EdgeId, NodeId, PortId};
use thiserror::Error;

/// The render layer refused to create or remove an edge primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The render layer rejected the primitive.
    #[error("render layer rejected edge {edge_id}: {reason}")]
    Rejected { edge_id: EdgeId, reason: String },
    /// Removal of a primitive the render layer does not know about.
    #[error("render layer has no edge {0}")]
    UnknownEdge(EdgeId),
}

/// Errors raised while mutating a [`FlowDocument`](crate::document::FlowDocument).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("port {port} not found on node {node}")]
    PortNotFound { node: NodeId, port: PortId },
    #[error("port {port} on node {node} still has {connections} connection(s)")]
    PortInUse {
        node: NodeId,
        port: PortId,
        connections: usize,
    },
    #[error("port {port} on node {node} is at capacity {capacity}")]
    PortFull {
        node: NodeId,
        port: PortId,
        capacity: usize,
    },
    #[error("cannot connect node {0} to itself")]
    SelfConnection(NodeId),
    #[error("edge {0} not found")]
    EdgeNotFound(EdgeId),
    #[error("configuration of kind `{config}` does not fit node kind `{node}`")]
    ConfigKindMismatch { node: String, config: String },
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Sanity-check failures of a computed layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayoutError {
    #[error("node {node} has a non-finite coordinate ({x}, {y})")]
    NonFiniteCoordinate { node: NodeId, x: f64, y: f64 },
    #[error("layer {layer} is not level: node {node} has y={found}, expected {expected}")]
    InconsistentLayerY {
        layer: usize,
        node: NodeId,
        expected: f64,
        found: f64,
    },
    #[error("node {0} is its own descendant")]
    CyclicHierarchy(NodeId),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of the [`FlowEditor`](crate::editor::FlowEditor) facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no drag session is active")]
    NoSession,
}
