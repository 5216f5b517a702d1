//! Test harness around a headless flow editor.
//!
//! Provides an editor wired to an in-memory render layer and a manual
//! clock, with event tracking and helpers for simulating pointer gestures.

#![allow(dead_code)]

use super::{sms_config, start_config, EventTracker};
use slint_flow_canvas::{
    ConnectionContext, DropResult, EdgeId, EngineConfig, FlowDocument, FlowEditor, HoverFeedback,
    ManualClock, MemoryRenderLayer, Node, NodeConfig, NodeKind, Point, PortDirection,
};
use std::cell::Ref;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Longer than the minimum interval between drag operations.
pub const SETTLE: Duration = Duration::from_millis(60);

pub struct FlowHarness {
    pub editor: FlowEditor,
    pub layer: MemoryRenderLayer,
    pub clock: Rc<ManualClock>,
    pub tracker: EventTracker,
    doc: Rc<RefCell<FlowDocument>>,
}

impl FlowHarness {
    /// Empty canvas with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Rc::new(ManualClock::new());
        let layer = MemoryRenderLayer::new();
        let editor = FlowEditor::new(config, layer.clone(), clock.clone()).unwrap();
        let tracker = EventTracker::new();
        editor.subscribe_drag(tracker.listener());
        let doc = editor.document();
        Self {
            editor,
            layer,
            clock,
            tracker,
            doc,
        }
    }

    /// A configured start node at the origin followed by a configured SMS
    /// node 200 below it:
    ///
    /// ```text
    /// start (0, 0)
    ///   |
    /// sms   (0, 200)
    /// ```
    pub fn campaign() -> Self {
        let harness = Self::new();
        harness.add("start", NodeKind::Start, Point::ORIGIN, Some(start_config()));
        harness.add("sms", NodeKind::Sms, Point::new(0.0, 200.0), None);
        harness.connect("start", "sms");
        harness.editor.set_node_config("sms", sms_config()).unwrap();
        harness.tracker.clear();
        harness
    }

    /// Add a node; a configuration marks it configured.
    pub fn add(&self, id: &str, kind: NodeKind, position: Point, config: Option<NodeConfig>) {
        let mut node = Node::new(id, kind, id, position);
        if let Some(config) = config {
            node = node.with_config(config).unwrap().configured(true);
        }
        self.editor.add_node(node).unwrap();
    }

    /// Commit `source -> target` through the rule engine, panicking on rejection.
    pub fn connect(&self, source: &str, target: &str) -> EdgeId {
        match self
            .editor
            .connect(&ConnectionContext::new(source, target))
            .unwrap()
        {
            slint_flow_canvas::CommitOutcome::Committed { edge, .. } => edge,
            slint_flow_canvas::CommitOutcome::Rejected(report) => {
                panic!("{} -> {} rejected: {:?}", source, target, report.errors)
            }
        }
    }

    pub fn doc(&self) -> Ref<'_, FlowDocument> {
        self.doc.borrow()
    }

    /// Let the drag throttle pass.
    pub fn settle(&self) {
        self.clock.advance(SETTLE);
    }

    pub fn output_port(&self, node: &str) -> Point {
        let doc = self.doc();
        let port = doc
            .node(node)
            .and_then(|n| n.default_port(PortDirection::Output))
            .map(|p| p.id.clone())
            .unwrap();
        doc.port_position(node, port.as_str()).unwrap()
    }

    pub fn input_port(&self, node: &str) -> Point {
        self.doc().port_position(node, "in").unwrap()
    }

    /// Press on `node`'s `port` (default output when `None`).
    pub fn press(&self, node: &str, port: Option<&str>) -> bool {
        let at = match port {
            Some(port) => self.doc().port_position(node, port).unwrap(),
            None => self.output_port(node),
        };
        self.editor.pointer_down(node, port, at).unwrap()
    }

    pub fn hover(&self, at: Point) -> HoverFeedback {
        self.settle();
        self.editor.pointer_move(at).unwrap()
    }

    pub fn release(&self, at: Point) -> DropResult {
        self.settle();
        self.editor.pointer_up(at).unwrap()
    }

    /// Full gesture: press, hover over `to`, release there.
    pub fn drag(&self, node: &str, port: Option<&str>, to: Point) -> DropResult {
        assert!(self.press(node, port), "drag from {} did not start", node);
        self.hover(to);
        self.release(to)
    }

    /// Drag onto the input port of `target`, slightly off center.
    pub fn drag_to_node(&self, node: &str, port: Option<&str>, target: &str) -> DropResult {
        let at = self.input_port(target).offset(4.0, -3.0);
        self.drag(node, port, at)
    }
}
