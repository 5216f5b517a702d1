//! # Slint Flow Canvas
//!
//! Interaction engine for marketing flow canvases: campaigns drawn as
//! directed graphs of typed nodes (start, audience split, SMS, AI call,
//! wait, ...) joined by edges, on a Slint canvas.
//!
//! The crate owns the editing rules and leaves drawing to the UI:
//!
//! - [`DragStateMachine`] - the single drag session and its transitions
//! - [`ConnectionRuleEngine`] - whether an edge may be created, and why not
//! - [`PreviewEdgeManager`] - dangling preview lines, one per open output
//! - [`LayoutAligner`] - tree layout by geometric centers
//! - [`NodeConfigValidator`] - whether a node is configured enough to
//!   grow previews
//! - [`FlowEditor`] - facade wiring the above to pointer gestures
//!
//! ## Quick Start
//!
//! ```ignore
//! use slint_flow_canvas::*;
//!
//! let layer = MemoryRenderLayer::new();
//! let editor = FlowEditor::new(EngineConfig::default(), layer.clone(), Rc::new(SystemClock))?;
//! editor.add_node(Node::new("start", NodeKind::Start, "Start", Point::ORIGIN))?;
//! editor.add_node(Node::new("sms", NodeKind::Sms, "Welcome SMS", Point::new(0.0, 200.0)))?;
//! editor.connect(&ConnectionContext::new("start", "sms"))?;
//! ```
//!
//! Edges reach the UI through a [`RenderLayer`]. [`ModelRenderLayer`]
//! mirrors them into a Slint `VecModel`; [`MemoryRenderLayer`] keeps them in
//! memory for headless hosts and tests.
//!
//! All time comes from an injected [`Clock`], and deferred work (drag
//! recovery, debounced layout refresh) runs from [`FlowEditor::poll`].
//!
//! The `layout` feature adds Sugiyama layer assignment through
//! `rust-sugiyama`.

pub mod config;
pub mod document;
pub mod drag;
pub mod editor;
pub mod error;
pub mod events;
pub mod layout;
pub mod model;
pub mod node_config;
pub mod path;
pub mod preview;
pub mod render;
pub mod rules;
pub mod schedule;
pub mod snap;

pub use config::{
    AlignmentConfig, DragConfig, EngineConfig, NodeValidationConfig, PreviewConfig, RefreshConfig,
    RuleConfig,
};
pub use document::{AdjacencySnapshot, FlowDocument, NodeRelations};
pub use drag::{
    DragEvent, DragOutcome, DragSession, DragSource, DragState, DragStateMachine, DragType,
    NodeCreationRequest, StateInfo, TransitionContext, TransitionRecord,
};
pub use editor::{DropResult, FlowEditor, HoverFeedback, PollReport};
pub use error::{ConfigError, EngineError, GraphError, LayoutError, RenderError};
pub use events::{EventBus, SubscriptionId};
pub use layout::{layers_from_document, AlignmentStats, Layer, LayerNode, LayoutAligner};
#[cfg(feature = "layout")]
pub use layout::{sugiyama_layers, SugiyamaConfig};
pub use model::{
    BranchDef, BranchId, Edge, EdgeId, EdgeKind, Endpoint, Node, NodeConfig, NodeId, NodeKind,
    NodeSchema, Point, Port, PortCategory, PortDirection, PortId,
};
pub use node_config::{NodeConfigValidator, NodeValidation, StepResult, ValidationStep, ValidatorStats};
pub use path::{edge_path, CubicBezier};
pub use preview::{
    BranchTarget, CommitOutcome, PreviewEdgeManager, PreviewLine, PreviewStats, PreviewTarget,
};
pub use render::{EdgePrimitive, MemoryRenderLayer, ModelRenderLayer, RenderLayer, RenderOp};
pub use rules::{
    ConnectionCheck, ConnectionContext, ConnectionLimits, ConnectionRuleEngine, IssueCategory,
    IssueKind, LimitReport, RuleTables, Severity, ValidationIssue, ValidationReport,
};
pub use schedule::{Clock, ManualClock, RefreshCoordinator, Scheduler, SharedClock, SystemClock};
pub use snap::{find_snap_target, SnapTarget};
