//! Editor facade for flow canvas applications.
//!
//! [`FlowEditor`] owns the document and every engine part, and turns
//! pointer gestures into drag transitions, rule checks, preview updates and
//! committed edges. Layout refreshes are debounced per node and run from
//! [`FlowEditor::poll`].
//!
//! # Example
//!
//! ```ignore
//! use slint_flow_canvas::{EngineConfig, FlowEditor, ModelRenderLayer, SystemClock};
//!
//! slint::include_modules!();
//!
//! fn main() {
//!     let window = MainWindow::new().unwrap();
//!     let edges = Rc::new(VecModel::<EdgePath>::default());
//!     let layer = ModelRenderLayer::new(edges.clone(), |id, path, color, width| EdgePath {
//!         id,
//!         path_commands: path,
//!         color,
//!         width,
//!     });
//!     let editor = FlowEditor::new(EngineConfig::default(), layer, Rc::new(SystemClock)).unwrap();
//!     window.set_edge_paths(ModelRc::from(edges));
//!
//!     window.on_port_pressed(editor.pointer_down_callback());
//!     window.on_pointer_moved(editor.pointer_move_callback());
//!     window.on_pointer_released(editor.pointer_up_callback());
//!
//!     let timer = slint::Timer::default();
//!     timer.start(slint::TimerMode::Repeated, Duration::from_millis(50), {
//!         let editor = editor.clone();
//!         move || {
//!             if let Err(err) = editor.poll() {
//!                 tracing::warn!(error = %err, "editor poll failed");
//!             }
//!         }
//!     });
//!
//!     window.run().unwrap();
//! }
//! ```

use crate::config::EngineConfig;
use crate::document::FlowDocument;
use crate::drag::{
    DragEvent, DragOutcome, DragSource, DragState, DragStateMachine, DragType,
    NodeCreationRequest, StateInfo, TransitionContext,
};
use crate::error::{EngineError, GraphError};
use crate::events::{EventBus, SubscriptionId};
use crate::layout::{layers_from_document, AlignmentStats, Layer, LayoutAligner};
use crate::model::{
    BranchId, Edge, EdgeId, Endpoint, Node, NodeConfig, NodeId, NodeKind, Point, PortDirection,
    PortId,
};
use crate::node_config::{NodeConfigValidator, NodeValidation, ValidatorStats};
use crate::preview::{CommitOutcome, PreviewEdgeManager, PreviewStats, PreviewTarget};
use crate::render::RenderLayer;
use crate::rules::{ConnectionContext, ConnectionRuleEngine, ValidationReport};
use crate::schedule::{RefreshCoordinator, RefreshRequest, SharedClock};
use crate::snap::{find_snap_target, SnapTarget};
use slint::SharedString;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the pointer is hovering during a drag.
#[derive(Debug, Clone, PartialEq)]
pub enum HoverFeedback {
    /// No drag in progress.
    Idle,
    /// Empty canvas.
    Free,
    Valid(SnapTarget),
    Invalid { target: SnapTarget, reason: String },
}

/// How a pointer release was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum DropResult {
    Connected(EdgeId),
    Rejected(String),
    /// Dropped on empty canvas; finish with
    /// [`FlowEditor::complete_node_creation`] or [`FlowEditor::cancel`].
    AwaitingNode(NodeCreationRequest),
    /// The drag machine refused the drop, e.g. because it came within the
    /// minimum operation interval. The drag is cancelled and its previews
    /// put back.
    Refused(String),
    /// Nothing was being dragged.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    pub drag_tasks: usize,
    pub refreshes: usize,
}

/// The preview line a drag is moving.
#[derive(Debug, Clone)]
struct ActiveDrag {
    source: NodeId,
}

/// Editor handle. Clone it to share it across UI callbacks.
#[derive(Clone)]
pub struct FlowEditor {
    config: Rc<EngineConfig>,
    clock: SharedClock,
    doc: Rc<RefCell<FlowDocument>>,
    rules: Rc<RefCell<ConnectionRuleEngine>>,
    previews: Rc<RefCell<PreviewEdgeManager>>,
    drag: Rc<RefCell<DragStateMachine>>,
    drag_events: Rc<EventBus<DragEvent>>,
    validator: Rc<RefCell<NodeConfigValidator>>,
    aligner: Rc<RefCell<LayoutAligner>>,
    refresh: Rc<RefCell<RefreshCoordinator<NodeId>>>,
    active: Rc<RefCell<Option<ActiveDrag>>>,
    next_node: Rc<Cell<u64>>,
}

impl FlowEditor {
    pub fn new<L>(config: EngineConfig, layer: L, clock: SharedClock) -> Result<Self, EngineError>
    where
        L: RenderLayer + 'static,
    {
        config.validate()?;
        let doc = Rc::new(RefCell::new(FlowDocument::new()));
        let previews = Rc::new(RefCell::new(PreviewEdgeManager::new(
            doc.clone(),
            Box::new(layer),
            config.preview.clone(),
            clock.clone(),
        )));
        let drag = Rc::new(RefCell::new(DragStateMachine::new(
            config.drag.clone(),
            clock.clone(),
        )));
        drag.borrow_mut().queue_events();
        let drag_events = drag.borrow().event_bus();
        let active: Rc<RefCell<Option<ActiveDrag>>> = Rc::new(RefCell::new(None));

        // an interrupted drag puts its source's dangling previews back
        drag.borrow_mut().set_cleanup_hook({
            let previews = previews.clone();
            let active = active.clone();
            move || {
                let Some(drag) = active.borrow_mut().take() else {
                    return Ok(());
                };
                let mut previews = previews.borrow_mut();
                previews.end_node_creation();
                previews.regenerate(drag.source.as_str())?;
                Ok(())
            }
        });

        Ok(Self {
            rules: Rc::new(RefCell::new(ConnectionRuleEngine::new(config.rules.clone()))),
            validator: Rc::new(RefCell::new(NodeConfigValidator::new(
                config.node_validation.clone(),
                clock.clone(),
            ))),
            aligner: Rc::new(RefCell::new(LayoutAligner::new(config.layout.clone()))),
            refresh: Rc::new(RefCell::new(RefreshCoordinator::new(
                config.refresh.debounce(),
                config.refresh.max_in_flight,
            ))),
            config: Rc::new(config),
            clock,
            doc,
            previews,
            drag,
            drag_events,
            active,
            next_node: Rc::new(Cell::new(0)),
        })
    }

    /// Replace the rule engine, e.g. with one carrying extra checks.
    pub fn with_rules(self, rules: ConnectionRuleEngine) -> Self {
        *self.rules.borrow_mut() = rules;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn document(&self) -> Rc<RefCell<FlowDocument>> {
        self.doc.clone()
    }

    pub fn rules(&self) -> Rc<RefCell<ConnectionRuleEngine>> {
        self.rules.clone()
    }

    // === Document ===

    /// Add a node and draw its previews if it passes the config gate.
    pub fn add_node(&self, node: Node) -> Result<(), EngineError> {
        let id = node.id.clone();
        self.doc.borrow_mut().add_node(node)?;
        self.refresh_previews(id.as_str())?;
        Ok(())
    }

    /// Remove a node with its edges and previews. Parents that regain an
    /// open output get their previews back.
    pub fn remove_node(&self, id: &str) -> Result<Node, EngineError> {
        self.cancel_if_source(id, "source node removed");
        let (parents, touching) = {
            let doc = self.doc.borrow();
            if !doc.contains_node(id) {
                return Err(GraphError::NodeNotFound(NodeId::from(id)).into());
            }
            let touching: Vec<EdgeId> = doc
                .edges()
                .iter()
                .filter(|e| e.source.node.as_str() == id || e.target.node.as_str() == id)
                .map(|e| e.id.clone())
                .collect();
            (doc.parents(id), touching)
        };
        {
            let mut previews = self.previews.borrow_mut();
            previews.remove_lines_for(id)?;
            for edge in &touching {
                previews.erase_committed_edge(edge)?;
            }
        }
        let node = self.doc.borrow_mut().remove_node(id)?;
        self.validator.borrow_mut().invalidate(id);
        self.refresh.borrow_mut().cancel(&node.id);
        for parent in parents {
            self.validator.borrow_mut().invalidate(parent.as_str());
            self.refresh_previews(parent.as_str())?;
        }
        info!(node = id, "node removed");
        Ok(node)
    }

    /// Validate and commit a connection without a drag.
    pub fn connect(&self, ctx: &ConnectionContext) -> Result<CommitOutcome, EngineError> {
        let report = self.rules.borrow().validate(&self.doc.borrow(), ctx);
        if !report.is_valid {
            debug!(source = %ctx.source, target = %ctx.target, reason = ?report.reason(), "connection rejected");
            return Ok(CommitOutcome::Rejected(report));
        }
        let source = Endpoint {
            node: ctx.source.clone(),
            port: ctx.source_port.clone(),
        };
        let target = Endpoint {
            node: ctx.target.clone(),
            port: ctx.target_port.clone(),
        };
        let edge_id = self
            .doc
            .borrow_mut()
            .add_edge(source, target, ctx.branch_id.clone())?;
        let edge = self
            .doc
            .borrow()
            .edge(edge_id.as_str())
            .cloned()
            .ok_or_else(|| GraphError::EdgeNotFound(edge_id.clone()))?;
        {
            let mut previews = self.previews.borrow_mut();
            if let Err(err) = previews.draw_committed_edge(&edge) {
                if let Err(undo) = self.doc.borrow_mut().remove_edge(edge_id.as_str()) {
                    warn!(edge = %edge_id, error = %undo, "failed to drop undrawable edge");
                }
                return Err(err.into());
            }
            previews.on_edge_committed(&edge)?;
        }
        self.after_commit(&edge)?;
        Ok(CommitOutcome::Committed {
            edge: edge_id,
            report,
        })
    }

    /// Remove a committed edge and redraw the previews it was hiding.
    pub fn disconnect(&self, edge: &str) -> Result<Edge, EngineError> {
        let id = self
            .doc
            .borrow()
            .edge(edge)
            .map(|e| e.id.clone())
            .ok_or_else(|| GraphError::EdgeNotFound(EdgeId::from(edge)))?;
        self.previews.borrow_mut().erase_committed_edge(&id)?;
        let removed = self.doc.borrow_mut().remove_edge(edge)?;
        for node in [&removed.source.node, &removed.target.node] {
            self.validator.borrow_mut().invalidate(node.as_str());
            self.refresh_previews(node.as_str())?;
        }
        Ok(removed)
    }

    /// Replace a node's configuration and mark it configured, then gate its
    /// previews on the result and schedule a layout refresh.
    pub fn set_node_config(&self, node: &str, config: NodeConfig) -> Result<NodeValidation, EngineError> {
        self.cancel_if_source(node, "source reconfigured");
        {
            let mut doc = self.doc.borrow_mut();
            doc.set_config(node, config)?;
            doc.set_configured(node, true)?;
        }
        self.validator.borrow_mut().invalidate(node);
        let validation = self
            .validate_node(node)
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(node)))?;
        {
            let mut previews = self.previews.borrow_mut();
            if validation.should_generate_preview_line {
                previews.regenerate(node)?;
            } else {
                previews.remove_lines_for(node)?;
            }
        }
        debug!(node, valid = validation.valid, score = validation.score, "node reconfigured");
        self.request_refresh(node);
        Ok(validation)
    }

    pub fn move_node(&self, node: &str, to: Point) -> Result<(), EngineError> {
        self.doc.borrow_mut().set_position(node, to)?;
        let dragging_from = self
            .active
            .borrow()
            .as_ref()
            .is_some_and(|a| a.source.as_str() == node);
        let has_lines = !self.previews.borrow().lines_for(node).is_empty();
        {
            let mut previews = self.previews.borrow_mut();
            if has_lines && !dragging_from {
                previews.regenerate(node)?;
            }
            previews.redraw_committed_edges(Some(node))?;
        }
        self.request_refresh(node);
        Ok(())
    }

    /// Record where the UI placed a port relative to its node.
    pub fn report_port_offset(&self, node: &str, port: &str, offset: Point) {
        self.doc.borrow_mut().report_port_offset(node, port, offset);
    }

    pub fn validate_node(&self, node: &str) -> Option<NodeValidation> {
        let doc = self.doc.borrow();
        let owner = doc.node(node)?;
        Some(self.validator.borrow_mut().validate_node(owner, &doc))
    }

    // === Pointer gestures ===

    /// Start dragging the preview line of `node`'s output `port` (its
    /// default output when `None`). Returns whether a drag started.
    pub fn pointer_down(&self, node: &str, port: Option<&str>, at: Point) -> Result<bool, EngineError> {
        if self.drag.borrow().session().is_some() {
            return Ok(false);
        }
        let (port_id, branch) = {
            let doc = self.doc.borrow();
            let owner = doc
                .node(node)
                .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(node)))?;
            let chosen = match port {
                Some(port) => owner.port(port).ok_or_else(|| GraphError::PortNotFound {
                    node: owner.id.clone(),
                    port: PortId::from(port),
                })?,
                None => match owner.default_port(PortDirection::Output) {
                    Some(port) => port,
                    None => return Ok(false),
                },
            };
            if chosen.direction() != PortDirection::Output {
                debug!(node, port = %chosen.id, "drag from an input port ignored");
                return Ok(false);
            }
            (chosen.id.clone(), chosen.branch_id.clone())
        };

        let line = match self.line_of(node, branch.as_ref()) {
            Some(line) => Some(line),
            None => {
                self.refresh_previews(node)?;
                self.line_of(node, branch.as_ref())
            }
        };
        let Some(line) = line else {
            debug!(node, port = %port_id, "no preview line to drag");
            return Ok(false);
        };

        let source = DragSource::new(Endpoint::port(node, port_id))
            .with_branch(branch)
            .with_preview_line(line.clone());
        *self.active.borrow_mut() = Some(ActiveDrag {
            source: NodeId::from(node),
        });
        if !self.with_drag(|d| d.start_drag(DragType::PreviewLine, source, at)) {
            *self.active.borrow_mut() = None;
            return Ok(false);
        }
        if self.drag_source().is_none() {
            // a listener cancelled the drag it was told about
            return Ok(false);
        }
        self.retarget(&line, PreviewTarget::Point(at))?;
        Ok(true)
    }

    /// Follow the pointer, snapping to a valid input port nearby.
    pub fn pointer_move(&self, at: Point) -> Result<HoverFeedback, EngineError> {
        let Some(source) = self.drag_source() else {
            return Ok(HoverFeedback::Idle);
        };
        if !self.with_drag(|d| d.update_drag_position(at)) {
            return Ok(HoverFeedback::Idle);
        }
        let line = source.preview_line.clone();

        match self.target_under(&source, at) {
            Some((target, report)) if report.is_valid => {
                let snapped = self.with_drag(|d| d.start_snapping(target.clone()));
                let end = if snapped {
                    PreviewTarget::Node(target.node.clone())
                } else {
                    PreviewTarget::Point(at)
                };
                if let Some(line) = &line {
                    self.retarget(line, end)?;
                }
                Ok(HoverFeedback::Valid(target))
            }
            Some((target, report)) => {
                self.with_drag(|d| d.stop_snapping());
                if let Some(line) = &line {
                    self.retarget(line, PreviewTarget::Point(at))?;
                }
                Ok(HoverFeedback::Invalid {
                    target,
                    reason: reason_of(&report),
                })
            }
            None => {
                self.with_drag(|d| d.stop_snapping());
                if let Some(line) = &line {
                    self.retarget(line, PreviewTarget::Point(at))?;
                }
                Ok(HoverFeedback::Free)
            }
        }
    }

    /// Finish the gesture: connect to a valid port under the pointer,
    /// reject an invalid one, or ask for a new node on empty canvas.
    pub fn pointer_up(&self, at: Point) -> Result<DropResult, EngineError> {
        let Some(source) = self.drag_source() else {
            return Ok(DropResult::Ignored);
        };
        self.with_drag(|d| d.update_drag_position(at));

        match self.target_under(&source, at) {
            Some((target, report)) if report.is_valid => self.finish_connect(&source, target),
            Some((_, report)) => {
                let reason = reason_of(&report);
                self.with_drag(|d| d.end_drag(DragOutcome::Rejected(reason.clone())));
                self.restore_source(&source.endpoint.node)?;
                Ok(DropResult::Rejected(reason))
            }
            None => {
                let request = NodeCreationRequest {
                    position: at,
                    source: source.endpoint.clone(),
                    branch_id: source.branch_id.clone(),
                    suggested_kind: None,
                };
                if !self.with_drag(|d| d.start_creating_node(request.clone())) {
                    return Ok(self.refuse_drop());
                }
                if let Some(line) = &source.preview_line {
                    self.previews.borrow_mut().begin_node_creation(line.as_str());
                }
                Ok(DropResult::AwaitingNode(request))
            }
        }
    }

    /// Create the node a drop on empty canvas asked for and connect the
    /// dragged preview line to it.
    ///
    /// A configuration of the wrong kind leaves the drag waiting, so the
    /// host can retry or [`cancel`](Self::cancel).
    pub fn complete_node_creation(
        &self,
        kind: NodeKind,
        name: &str,
        config: Option<NodeConfig>,
    ) -> Result<(NodeId, EdgeId), EngineError> {
        let (request, line) = {
            let drag = self.drag.borrow();
            let session = drag
                .session()
                .filter(|s| s.phase == DragState::CreatingNode)
                .ok_or(EngineError::NoSession)?;
            let request = session.creation.clone().ok_or(EngineError::NoSession)?;
            let line = session
                .source
                .preview_line
                .clone()
                .ok_or(EngineError::NoSession)?;
            (request, line)
        };

        let id = self.next_node_id(&kind);
        let mut node = Node::new(id.clone(), kind, name, request.position);
        if let Some(config) = config {
            node = node.with_config(config)?.configured(true);
        }
        self.doc.borrow_mut().add_node(node)?;

        let committed = self.previews.borrow_mut().commit_preview_line(
            line.as_str(),
            Endpoint::node(id.clone()),
            &self.rules.borrow(),
        );
        match committed {
            Ok(CommitOutcome::Committed { edge, .. }) => {
                *self.active.borrow_mut() = None;
                self.previews.borrow_mut().end_node_creation();
                self.with_drag(|d| d.end_drag(DragOutcome::NodeCreated {
                    node: id.clone(),
                    edge: edge.clone(),
                }));
                let edge_def = self.doc.borrow().edge(edge.as_str()).cloned();
                if let Some(edge_def) = edge_def {
                    self.after_commit(&edge_def)?;
                }
                info!(node = %id, edge = %edge, "node created from drag");
                Ok((id, edge))
            }
            Ok(CommitOutcome::Rejected(report)) => {
                self.doc.borrow_mut().remove_node(id.as_str())?;
                let reason = reason_of(&report);
                self.with_drag(|d| d.end_drag(DragOutcome::Rejected(reason.clone())));
                self.restore_source(&request.source.node)?;
                Err(GraphError::Rejected(reason).into())
            }
            Err(err) => {
                if let Err(undo) = self.doc.borrow_mut().remove_node(id.as_str()) {
                    warn!(node = %id, error = %undo, "failed to drop node of a failed creation");
                }
                self.fail(&err);
                Err(err.into())
            }
        }
    }

    /// Abort the current drag. Returns `false` when nothing was dragging.
    pub fn cancel(&self, reason: &str) -> bool {
        self.with_drag(|d| d.cancel_drag(reason))
    }

    // === Timers ===

    /// Run due drag-machine tasks and layout refreshes.
    pub fn poll(&self) -> Result<PollReport, EngineError> {
        let drag_tasks = self.with_drag(|d| d.poll());
        let due = self.refresh.borrow_mut().take_due(self.clock.now());

        let mut report = PollReport {
            drag_tasks,
            refreshes: 0,
        };
        let mut failure = None;
        for key in due {
            let outcome = self.run_refresh(&key);
            self.refresh.borrow_mut().complete(&key, self.clock.now());
            match outcome {
                Ok(()) => report.refreshes += 1,
                Err(err) => {
                    warn!(node = %key, error = %err, "layout refresh failed");
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// When [`poll`](Self::poll) next has work, for host timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        let drag = self.drag.borrow().next_deadline();
        let refresh = self.refresh.borrow().next_deadline();
        match (drag, refresh) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn request_refresh(&self, node: &str) -> RefreshRequest {
        self.refresh
            .borrow_mut()
            .request(NodeId::from(node), self.clock.now())
    }

    // === Previews ===

    pub fn preview_line_at(&self, point: Point, tolerance: f64) -> Option<EdgeId> {
        self.previews.borrow().line_at(point, tolerance)
    }

    /// Remove a preview line, keeping it for [`restore_preview_line`](Self::restore_preview_line).
    pub fn delete_preview_line(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self
            .previews
            .borrow_mut()
            .remove_single_preview_line(id)?
            .is_some())
    }

    pub fn restore_preview_line(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.previews.borrow_mut().restore_deleted_line(id)?.is_some())
    }

    pub fn preview_lines_for(&self, node: &str) -> Vec<EdgeId> {
        self.previews
            .borrow()
            .lines_for(node)
            .into_iter()
            .map(|l| l.id)
            .collect()
    }

    // === Status ===

    pub fn drag_state(&self) -> DragState {
        self.drag.borrow().state()
    }

    pub fn drag_state_info(&self) -> StateInfo {
        self.drag.borrow().state_info()
    }

    pub fn subscribe_drag<F: Fn(&DragEvent) + 'static>(&self, listener: F) -> SubscriptionId {
        self.drag_events.subscribe(listener)
    }

    pub fn unsubscribe_drag(&self, id: SubscriptionId) -> bool {
        self.drag_events.unsubscribe(id)
    }

    pub fn preview_stats(&self) -> PreviewStats {
        self.previews.borrow().stats()
    }

    pub fn validator_stats(&self) -> ValidatorStats {
        self.validator.borrow().stats()
    }

    pub fn alignment_stats(&self) -> AlignmentStats {
        self.aligner.borrow().stats()
    }

    // === Callback factories ===

    /// Returns a callback for `port-pressed(node, port, x, y) -> bool`.
    /// An empty port name picks the node's default output.
    pub fn pointer_down_callback(&self) -> impl Fn(SharedString, SharedString, f32, f32) -> bool {
        let editor = self.clone();
        move |node, port, x, y| {
            let port = (!port.is_empty()).then(|| port.to_string());
            editor
                .pointer_down(node.as_str(), port.as_deref(), Point::new(x as f64, y as f64))
                .unwrap_or_else(|err| {
                    warn!(node = node.as_str(), error = %err, "pointer down failed");
                    false
                })
        }
    }

    /// Returns a callback for `pointer-moved(x, y) -> bool`, true while a
    /// valid target is hovered.
    pub fn pointer_move_callback(&self) -> impl Fn(f32, f32) -> bool {
        let editor = self.clone();
        move |x, y| match editor.pointer_move(Point::new(x as f64, y as f64)) {
            Ok(feedback) => matches!(feedback, HoverFeedback::Valid(_)),
            Err(err) => {
                warn!(error = %err, "pointer move failed");
                false
            }
        }
    }

    /// Returns a callback for `pointer-released(x, y)`.
    pub fn pointer_up_callback(&self) -> impl Fn(f32, f32) {
        let editor = self.clone();
        move |x, y| {
            if let Err(err) = editor.pointer_up(Point::new(x as f64, y as f64)) {
                warn!(error = %err, "pointer release failed");
            }
        }
    }

    /// Returns a callback for `preview-line-at(x, y) -> string`, empty when
    /// no preview line is within `tolerance`.
    pub fn preview_line_at_callback(&self, tolerance: f64) -> impl Fn(f32, f32) -> SharedString {
        let previews = self.previews.clone();
        move |x, y| {
            previews
                .borrow()
                .line_at(Point::new(x as f64, y as f64), tolerance)
                .map(|id| SharedString::from(id.as_str()))
                .unwrap_or_default()
        }
    }

    // === Internals ===

    /// Run `f` on the drag machine, then deliver the events it queued once
    /// the machine is no longer borrowed, so listeners may call back into
    /// the editor.
    fn with_drag<R>(&self, f: impl FnOnce(&mut DragStateMachine) -> R) -> R {
        let (result, events) = {
            let mut drag = self.drag.borrow_mut();
            let result = f(&mut drag);
            (result, drag.take_queued_events())
        };
        for event in &events {
            self.drag_events.emit(event);
        }
        result
    }

    fn drag_source(&self) -> Option<DragSource> {
        self.drag.borrow().session().map(|s| s.source.clone())
    }

    fn line_of(&self, node: &str, branch: Option<&BranchId>) -> Option<EdgeId> {
        let previews = self.previews.borrow();
        match branch {
            Some(branch) => previews.branch_line(node, branch).map(|l| l.id.clone()),
            None => previews
                .lines_for(node)
                .into_iter()
                .find(|l| !l.is_branch())
                .map(|l| l.id),
        }
    }

    /// Nearest input port under `at` and whether the drag may connect to it.
    fn target_under(&self, source: &DragSource, at: Point) -> Option<(SnapTarget, ValidationReport)> {
        let doc = self.doc.borrow();
        let target = find_snap_target(
            &doc,
            at,
            self.config.drag.snap_radius,
            source.endpoint.node.as_str(),
        )?;
        let mut ctx = ConnectionContext::new(source.endpoint.node.clone(), target.node.clone());
        ctx.source_port = source.endpoint.port.clone();
        ctx.target_port = Some(target.port.clone());
        ctx.branch_id = source.branch_id.clone();
        let report = self.rules.borrow().validate(&doc, &ctx);
        Some((target, report))
    }

    fn finish_connect(&self, source: &DragSource, target: SnapTarget) -> Result<DropResult, EngineError> {
        let Some(line) = source.preview_line.clone() else {
            self.cancel("drag has no preview line");
            return Ok(DropResult::Refused("drag has no preview line".to_owned()));
        };
        let endpoint = Endpoint::port(target.node.clone(), target.port.clone());
        if !self.with_drag(|d| d.start_connecting(endpoint.clone())) {
            return Ok(self.refuse_drop());
        }

        let committed =
            self.previews
                .borrow_mut()
                .commit_preview_line(line.as_str(), endpoint, &self.rules.borrow());
        match committed {
            Ok(CommitOutcome::Committed { edge, .. }) => {
                *self.active.borrow_mut() = None;
                self.with_drag(|d| d.end_drag(DragOutcome::Connected(edge.clone())));
                let edge_def = self.doc.borrow().edge(edge.as_str()).cloned();
                if let Some(edge_def) = edge_def {
                    self.after_commit(&edge_def)?;
                }
                Ok(DropResult::Connected(edge))
            }
            Ok(CommitOutcome::Rejected(report)) => {
                let reason = reason_of(&report);
                self.with_drag(|d| d.end_drag(DragOutcome::Rejected(reason.clone())));
                self.restore_source(&source.endpoint.node)?;
                Ok(DropResult::Rejected(reason))
            }
            Err(err) => {
                self.fail(&err);
                Err(err.into())
            }
        }
    }

    /// Cancel a drag whose drop the machine would not take, saying why.
    fn refuse_drop(&self) -> DropResult {
        let reason = if self.drag.borrow().is_throttled() {
            "drop arrived within the minimum operation interval"
        } else {
            "drop refused by the drag state machine"
        };
        debug!(reason, "drop refused");
        self.cancel(reason);
        DropResult::Refused(reason.to_owned())
    }

    /// Put the dangling previews of a drag source back after a drag that
    /// ended without the cleanup hook.
    fn restore_source(&self, source: &NodeId) -> Result<(), EngineError> {
        *self.active.borrow_mut() = None;
        let mut previews = self.previews.borrow_mut();
        previews.end_node_creation();
        previews.regenerate(source.as_str())?;
        Ok(())
    }

    fn after_commit(&self, edge: &Edge) -> Result<(), EngineError> {
        for node in [&edge.source.node, &edge.target.node] {
            self.validator.borrow_mut().invalidate(node.as_str());
            self.refresh_previews(node.as_str())?;
        }
        self.request_refresh(edge.source.node.as_str());
        Ok(())
    }

    /// Run the config gate on `node` and draw or drop its previews
    /// accordingly. Returns the number of lines drawn.
    fn refresh_previews(&self, node: &str) -> Result<usize, EngineError> {
        let gate = {
            let doc = self.doc.borrow();
            let Some(owner) = doc.node(node) else {
                return Ok(0);
            };
            self.validator
                .borrow_mut()
                .should_generate_preview_line(owner, &doc)
        };
        let mut previews = self.previews.borrow_mut();
        if gate {
            Ok(previews.regenerate(node)?)
        } else {
            previews.remove_lines_for(node)?;
            Ok(0)
        }
    }

    fn retarget(&self, line: &EdgeId, target: PreviewTarget) -> Result<(), EngineError> {
        let moved = self.previews.borrow_mut().retarget(line.as_str(), target);
        if let Err(err) = moved {
            self.fail(&err);
            return Err(err.into());
        }
        Ok(())
    }

    fn fail(&self, err: &dyn std::error::Error) {
        let message = err.to_string();
        self.with_drag(|d| d.handle_error(message, TransitionContext::because("engine failure")));
    }

    fn cancel_if_source(&self, node: &str, reason: &str) {
        let is_source = self
            .active
            .borrow()
            .as_ref()
            .is_some_and(|a| a.source.as_str() == node);
        if is_source {
            self.cancel(reason);
        }
    }

    fn next_node_id(&self, kind: &NodeKind) -> NodeId {
        let doc = self.doc.borrow();
        loop {
            let n = self.next_node.get() + 1;
            self.next_node.set(n);
            let id = NodeId::new(format!("{}_{}", kind.as_str(), n));
            if !doc.contains_node(id.as_str()) {
                return id;
            }
        }
    }

    fn run_refresh(&self, key: &NodeId) -> Result<(), EngineError> {
        if self.drag.borrow().session().is_some() {
            // nodes must not move under the pointer; retry after the drag
            self.refresh
                .borrow_mut()
                .request(key.clone(), self.clock.now());
            return Ok(());
        }

        let (layers, current) = {
            let doc = self.doc.borrow();
            let layers = layers_from_document(&doc);
            let current = self.level_positions(&doc, &layers);
            (layers, current)
        };
        let positions = self
            .aligner
            .borrow_mut()
            .calculate_geometric_alignment(&layers, &current)?;
        {
            let mut doc = self.doc.borrow_mut();
            for (id, position) in &positions {
                doc.set_position(id.as_str(), *position)?;
            }
        }
        self.previews.borrow_mut().redraw_committed_edges(None)?;

        let redraw: Vec<NodeId> = {
            let doc = self.doc.borrow();
            let previews = self.previews.borrow();
            doc.nodes()
                .filter(|n| n.id == *key || !previews.lines_for(n.id.as_str()).is_empty())
                .map(|n| n.id.clone())
                .collect()
        };
        for id in redraw {
            self.refresh_previews(id.as_str())?;
        }
        info!(node = %key, nodes = positions.len(), "layout refreshed");
        Ok(())
    }

    /// Current positions with every layer brought to one level: the y of
    /// its first node, pushed down to keep at least the minimum spacing
    /// below the layer above.
    fn level_positions(&self, doc: &FlowDocument, layers: &[Layer]) -> HashMap<NodeId, Point> {
        let spacing = self.config.layout.min_spacing;
        let mut positions = HashMap::new();
        let mut previous: Option<f64> = None;
        for layer in layers {
            let first = layer
                .nodes
                .iter()
                .find_map(|n| doc.node(n.id.as_str()).map(|node| node.position.y));
            let Some(first) = first else {
                continue;
            };
            let y = match previous {
                Some(above) => first.max(above + spacing),
                None => first,
            };
            previous = Some(y);
            for entry in &layer.nodes {
                if let Some(node) = doc.node(entry.id.as_str()) {
                    positions.insert(entry.id.clone(), Point::new(node.position.x, y));
                }
            }
        }
        positions
    }
}

fn reason_of(report: &ValidationReport) -> String {
    report
        .reason()
        .unwrap_or_else(|| "connection not allowed".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SmsConfig, StartConfig};
    use crate::render::MemoryRenderLayer;
    use crate::schedule::ManualClock;

    fn start_config() -> NodeConfig {
        NodeConfig::Start(StartConfig {
            audience: Some("all members".into()),
            trigger: Some("signup".into()),
            start_time: None,
        })
    }

    fn sms_config() -> NodeConfig {
        NodeConfig::Sms(SmsConfig {
            template_id: Some("tpl-1".into()),
            content: Some("Welcome aboard, here is your coupon".into()),
            sign_name: None,
        })
    }

    fn editor() -> (FlowEditor, MemoryRenderLayer, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::new());
        let layer = MemoryRenderLayer::new();
        let editor = FlowEditor::new(EngineConfig::default(), layer.clone(), clock.clone()).unwrap();
        (editor, layer, clock)
    }

    fn start_node() -> Node {
        Node::new("start", NodeKind::Start, "Start", Point::ORIGIN)
            .with_config(start_config())
            .unwrap()
            .configured(true)
    }

    #[test]
    fn test_configured_start_gets_a_preview() {
        let (editor, layer, _clock) = editor();
        editor.add_node(start_node()).unwrap();
        assert_eq!(editor.preview_lines_for("start").len(), 1);
        assert_eq!(layer.previews().len(), 1);
    }

    #[test]
    fn test_unconfigured_node_gets_no_preview() {
        let (editor, layer, _clock) = editor();
        editor
            .add_node(Node::new("start", NodeKind::Start, "Start", Point::ORIGIN))
            .unwrap();
        assert!(editor.preview_lines_for("start").is_empty());
        assert!(layer.previews().is_empty());
    }

    #[test]
    fn test_drag_to_port_connects() {
        let (editor, layer, clock) = editor();
        editor.add_node(start_node()).unwrap();
        editor
            .add_node(Node::new("sms", NodeKind::Sms, "SMS", Point::new(0.0, 200.0)))
            .unwrap();

        assert!(editor.pointer_down("start", None, Point::new(0.0, 40.0)).unwrap());
        clock.advance_ms(100);
        let hover = editor.pointer_move(Point::new(5.0, 158.0)).unwrap();
        assert!(matches!(hover, HoverFeedback::Valid(ref t) if t.node.as_str() == "sms"));
        assert_eq!(editor.drag_state(), DragState::Snapping);

        clock.advance_ms(100);
        let result = editor.pointer_up(Point::new(5.0, 158.0)).unwrap();
        assert!(matches!(result, DropResult::Connected(_)));
        assert_eq!(editor.drag_state(), DragState::Idle);
        assert_eq!(editor.document().borrow().edges().len(), 1);
        assert_eq!(layer.committed().len(), 1);
        // start's single output is used up
        assert!(editor.preview_lines_for("start").is_empty());
    }

    #[test]
    fn test_cancel_restores_dangling_preview() {
        let (editor, layer, _clock) = editor();
        editor.add_node(start_node()).unwrap();
        assert!(editor.pointer_down("start", None, Point::new(300.0, 300.0)).unwrap());
        assert!(editor.cancel("escape"));
        assert_eq!(editor.drag_state(), DragState::Idle);
        let line = layer.previews().pop().unwrap();
        assert_eq!(line.end, Point::new(0.0, 160.0));
        assert!(!editor.cancel("again"));
    }

    #[test]
    fn test_node_config_gate_controls_previews() {
        let (editor, _layer, _clock) = editor();
        editor.add_node(start_node()).unwrap();
        editor
            .add_node(Node::new("sms", NodeKind::Sms, "SMS", Point::new(0.0, 200.0)))
            .unwrap();
        let ctx = ConnectionContext::new("start", "sms");
        assert!(matches!(editor.connect(&ctx).unwrap(), CommitOutcome::Committed { .. }));
        assert!(editor.preview_lines_for("sms").is_empty());

        let validation = editor.set_node_config("sms", sms_config()).unwrap();
        assert!(validation.should_generate_preview_line);
        assert_eq!(editor.preview_lines_for("sms").len(), 1);
    }

    #[test]
    fn test_poll_runs_debounced_layout() {
        let (editor, _layer, clock) = editor();
        editor.add_node(start_node()).unwrap();
        editor
            .add_node(Node::new("sms", NodeKind::Sms, "SMS", Point::new(333.0, 200.0)))
            .unwrap();
        editor.connect(&ConnectionContext::new("start", "sms")).unwrap();

        assert_eq!(editor.poll().unwrap().refreshes, 0);
        clock.advance_ms(1_000);
        assert_eq!(editor.poll().unwrap().refreshes, 1);
        let doc = editor.document();
        let doc = doc.borrow();
        assert_eq!(doc.node("start").unwrap().position.x, 0.0);
        assert_eq!(doc.node("sms").unwrap().position.x, 0.0);
        assert_eq!(doc.node("sms").unwrap().position.y, 200.0);
    }
}
