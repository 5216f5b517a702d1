//! Property tests over randomized inputs.
//!
//! 1. Alignment centers every parent over its children and the whole
//!    layout about x = 0, for any tree.
//! 2. Connections accepted by the rule engine can always be committed and
//!    never close a cycle.
//! 3. The drag machine only ever moves along its transition table, and
//!    an open session always mirrors the current state.
//! 4. Preview lines stay one slot per source, mirrored 1:1 by the render
//!    layer, whatever order lines are drawn, deleted and restored in.

mod common;

use common::split_config;
use proptest::prelude::*;
use slint_flow_canvas::{
    layers_from_document, AlignmentConfig, ConnectionContext, ConnectionRuleEngine, DragConfig,
    DragEvent, DragOutcome, DragSource, DragState, DragStateMachine, DragType, Endpoint,
    FlowDocument, Layer, LayerNode, LayoutAligner, ManualClock, MemoryRenderLayer, Node, NodeId,
    NodeKind, Point, PortId, PreviewConfig, PreviewEdgeManager, PreviewTarget, RuleConfig,
    Severity, SnapTarget, TransitionContext,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

// ── Helpers ─────────────────────────────────────────────────────────────

/// `parents[i]` is the parent of node `i + 1`; node 0 is the root.
fn tree_strategy() -> impl Strategy<Value = Vec<usize>> {
    (1usize..24).prop_flat_map(|n| {
        (1..=n)
            .map(|i| (0..i).boxed())
            .collect::<Vec<_>>()
    })
}

fn tree_layers(parents: &[usize]) -> Vec<Layer> {
    let count = parents.len() + 1;
    let mut depth = vec![0usize; count];
    let mut children: Vec<Vec<NodeId>> = vec![Vec::new(); count];
    for (i, parent) in parents.iter().enumerate() {
        depth[i + 1] = depth[*parent] + 1;
        children[*parent].push(NodeId::new(format!("n{}", i + 1)));
    }
    let max_depth = depth.iter().copied().max().unwrap_or(0);
    let mut layers = vec![Layer::default(); max_depth + 1];
    for (i, kids) in children.into_iter().enumerate() {
        layers[depth[i]]
            .nodes
            .push(LayerNode::new(format!("n{}", i), kids));
    }
    layers
}

fn kind_strategy() -> impl Strategy<Value = NodeKind> {
    prop_oneof![
        Just(NodeKind::Start),
        Just(NodeKind::AudienceSplit),
        Just(NodeKind::Sms),
        Just(NodeKind::Wait),
        Just(NodeKind::AiCall),
        Just(NodeKind::End),
        Just(NodeKind::Custom("webhook".into())),
    ]
}

fn campaign_node(index: usize, kind: NodeKind) -> Node {
    let position = Point::new(index as f64 * 120.0, index as f64 * 80.0);
    let node = Node::new(format!("n{}", index), kind.clone(), "step", position);
    match kind {
        NodeKind::AudienceSplit => node
            .with_config(split_config(&[("a", "A"), ("b", "B")]))
            .unwrap(),
        _ => node,
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Alignment
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn alignment_centers_parents(parents in tree_strategy(), row in 100.0f64..400.0) {
        let layers = tree_layers(&parents);
        let mut current = HashMap::new();
        for (i, layer) in layers.iter().enumerate() {
            for node in &layer.nodes {
                current.insert(node.id.clone(), Point::new(i as f64 * 37.0, i as f64 * row));
            }
        }

        let positions = LayoutAligner::new(AlignmentConfig::default())
            .calculate_geometric_alignment(&layers, &current)
            .unwrap();
        prop_assert_eq!(positions.len(), parents.len() + 1);

        for (i, layer) in layers.iter().enumerate() {
            for node in &layer.nodes {
                let p = positions[&node.id];
                prop_assert!(p.is_finite());
                prop_assert!((p.y - i as f64 * row).abs() < 1e-9);
                if node.children.is_empty() {
                    continue;
                }
                let mean = node.children.iter().map(|c| positions[c].x).sum::<f64>()
                    / node.children.len() as f64;
                prop_assert!((p.x - mean).abs() < 1e-6, "{} at {} not over {}", node.id, p.x, mean);
            }
        }

        let mean = positions.values().map(|p| p.x).sum::<f64>() / positions.len() as f64;
        prop_assert!(mean.abs() < 1e-6);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Connection rules
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn accepted_connections_commit_without_cycles(
        kinds in prop::collection::vec(kind_strategy(), 2..8),
        attempts in prop::collection::vec((0usize..8, 0usize..8), 0..40),
    ) {
        let mut doc = FlowDocument::new();
        for (i, kind) in kinds.iter().enumerate() {
            doc.add_node(campaign_node(i, kind.clone())).unwrap();
        }
        let rules = ConnectionRuleEngine::new(RuleConfig::default());

        for (s, t) in attempts {
            let ctx = ConnectionContext::new(format!("n{}", s), format!("n{}", t));
            let report = rules.validate(&doc, &ctx);

            prop_assert_eq!(report.is_valid, report.errors.is_empty());
            prop_assert!(report.errors.iter().all(|i| i.severity != Severity::Warning));
            prop_assert!(report.warnings.iter().all(|i| i.severity == Severity::Warning));
            if s == t || s >= kinds.len() || t >= kinds.len() {
                prop_assert!(!report.is_valid);
            }

            if report.is_valid {
                let added = doc.add_edge(Endpoint::node(ctx.source.clone()), Endpoint::node(ctx.target.clone()), None);
                prop_assert!(added.is_ok(), "{:?} accepted but not committed: {:?}", ctx, added);
            }
        }

        // every committed edge points one layer down or further
        let layers = layers_from_document(&doc);
        let rank: HashMap<&NodeId, usize> = layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| l.nodes.iter().map(move |n| (&n.id, i)))
            .collect();
        prop_assert_eq!(rank.len(), kinds.len());
        for edge in doc.edges() {
            prop_assert!(rank[&edge.source.node] < rank[&edge.target.node]);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Drag state machine
// ═════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum DragOp {
    Advance(u64),
    Start,
    Move(f64, f64),
    Snap,
    Unsnap,
    Connect,
    Create,
    End,
    Cancel,
    Fail,
    Poll,
    Force(usize),
}

fn drag_op() -> impl Strategy<Value = DragOp> {
    prop_oneof![
        (0u64..200).prop_map(DragOp::Advance),
        Just(DragOp::Start),
        (-500.0f64..500.0, -500.0f64..500.0).prop_map(|(x, y)| DragOp::Move(x, y)),
        Just(DragOp::Snap),
        Just(DragOp::Unsnap),
        Just(DragOp::Connect),
        Just(DragOp::Create),
        Just(DragOp::End),
        Just(DragOp::Cancel),
        Just(DragOp::Fail),
        Just(DragOp::Poll),
        (0usize..7).prop_map(DragOp::Force),
    ]
}

const ALL_STATES: [DragState; 7] = [
    DragState::Idle,
    DragState::Dragging,
    DragState::Snapping,
    DragState::Connecting,
    DragState::CreatingNode,
    DragState::Error,
    DragState::Recovering,
];

proptest! {
    #[test]
    fn drag_machine_follows_table(ops in prop::collection::vec(drag_op(), 0..60)) {
        let clock = Rc::new(ManualClock::new());
        let mut machine = DragStateMachine::new(DragConfig::default(), clock.clone());
        let seen: Rc<RefCell<Vec<(DragState, DragState)>>> = Rc::default();
        machine.subscribe({
            let seen = seen.clone();
            move |event| {
                if let DragEvent::StateChanged { from, to, .. } = event {
                    seen.borrow_mut().push((*from, *to));
                }
            }
        });

        for op in ops {
            match op {
                DragOp::Advance(ms) => clock.advance_ms(ms),
                DragOp::Start => {
                    machine.start_drag(
                        DragType::PreviewLine,
                        DragSource::new(Endpoint::port("n0", "out")),
                        Point::ORIGIN,
                    );
                }
                DragOp::Move(x, y) => {
                    machine.update_drag_position(Point::new(x, y));
                }
                DragOp::Snap => {
                    machine.start_snapping(SnapTarget {
                        node: NodeId::from("n1"),
                        port: PortId::from("in"),
                        position: Point::ORIGIN,
                        distance: 0.0,
                    });
                }
                DragOp::Unsnap => {
                    machine.stop_snapping();
                }
                DragOp::Connect => {
                    machine.start_connecting(Endpoint::node("n1"));
                }
                DragOp::Create => {
                    machine.start_creating_node(slint_flow_canvas::NodeCreationRequest {
                        position: Point::ORIGIN,
                        source: Endpoint::node("n0"),
                        branch_id: None,
                        suggested_kind: None,
                    });
                }
                DragOp::End => {
                    machine.end_drag(DragOutcome::Dropped);
                }
                DragOp::Cancel => {
                    machine.cancel_drag("property");
                }
                DragOp::Fail => machine.handle_error("property", TransitionContext::default()),
                DragOp::Poll => {
                    machine.poll();
                }
                DragOp::Force(i) => {
                    machine.transition_to(ALL_STATES[i], TransitionContext::because("forced"));
                }
            }

            let state = machine.state();
            if let Some(session) = machine.session() {
                prop_assert_ne!(state, DragState::Idle);
                prop_assert_eq!(session.phase, state);
            }
        }

        let mut expected_from = DragState::Idle;
        for (from, to) in seen.borrow().iter() {
            prop_assert_eq!(*from, expected_from);
            prop_assert!(from.can_transition_to(*to), "{} -> {}", from, to);
            expected_from = *to;
        }
        prop_assert_eq!(expected_from, machine.state());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Preview slots
// ═════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum PreviewOp {
    Regenerate(usize),
    RemoveAll(usize),
    Delete(usize, usize),
    Restore(usize),
    Retarget(usize, f64, f64),
    Clear,
}

fn preview_op() -> impl Strategy<Value = PreviewOp> {
    prop_oneof![
        4 => (0usize..4).prop_map(PreviewOp::Regenerate),
        1 => (0usize..4).prop_map(PreviewOp::RemoveAll),
        3 => (0usize..4, 0usize..3).prop_map(|(n, k)| PreviewOp::Delete(n, k)),
        3 => (0usize..8).prop_map(PreviewOp::Restore),
        2 => (0usize..4, -400.0f64..400.0, 0.0f64..800.0)
            .prop_map(|(n, x, y)| PreviewOp::Retarget(n, x, y)),
        1 => Just(PreviewOp::Clear),
    ]
}

const SOURCES: [&str; 4] = ["start", "segment", "sms", "wait"];

fn preview_fixture() -> (PreviewEdgeManager, MemoryRenderLayer) {
    let doc = Rc::new(RefCell::new(FlowDocument::new()));
    {
        let mut doc = doc.borrow_mut();
        doc.add_node(Node::new("start", NodeKind::Start, "Start", Point::ORIGIN))
            .unwrap();
        doc.add_node(
            Node::new("segment", NodeKind::AudienceSplit, "Segment", Point::new(0.0, 200.0))
                .with_config(split_config(&[("vip", "VIP"), ("new", "New"), ("rest", "Others")]))
                .unwrap(),
        )
        .unwrap();
        doc.add_node(Node::new("sms", NodeKind::Sms, "SMS", Point::new(-300.0, 400.0)))
            .unwrap();
        doc.add_node(Node::new("wait", NodeKind::Wait, "Wait", Point::new(300.0, 400.0)))
            .unwrap();
    }
    let layer = MemoryRenderLayer::new();
    let manager = PreviewEdgeManager::new(
        doc,
        Box::new(layer.clone()),
        PreviewConfig::default(),
        Rc::new(ManualClock::new()),
    );
    (manager, layer)
}

proptest! {
    #[test]
    fn preview_slots_mirror_render_layer(ops in prop::collection::vec(preview_op(), 0..50)) {
        let (mut previews, layer) = preview_fixture();

        for op in ops {
            match op {
                PreviewOp::Regenerate(n) => {
                    previews.regenerate(SOURCES[n]).unwrap();
                }
                PreviewOp::RemoveAll(n) => {
                    previews.remove_lines_for(SOURCES[n]).unwrap();
                }
                PreviewOp::Delete(n, k) => {
                    if let Some(line) = previews.lines_for(SOURCES[n]).get(k) {
                        prop_assert!(previews.remove_single_preview_line(line.id.as_str()).unwrap().is_some());
                    }
                }
                PreviewOp::Restore(k) => {
                    let id = previews.deleted_lines().get(k).map(|l| l.id.clone());
                    if let Some(id) = id {
                        previews.restore_deleted_line(id.as_str()).unwrap();
                    }
                }
                PreviewOp::Retarget(n, x, y) => {
                    if let Some(line) = previews.lines_for(SOURCES[n]).first() {
                        prop_assert!(previews
                            .retarget(line.id.as_str(), PreviewTarget::Point(Point::new(x, y)))
                            .unwrap());
                    }
                }
                PreviewOp::Clear => {
                    previews.clear_all_preview_lines();
                }
            }

            let mut live = HashSet::new();
            for source in SOURCES {
                let lines = previews.lines_for(source);
                if source == "segment" {
                    let branches: HashSet<_> = lines.iter().map(|l| l.branch_id.clone()).collect();
                    prop_assert_eq!(branches.len(), lines.len());
                    prop_assert!(lines.iter().all(|l| l.is_branch()));
                } else {
                    prop_assert!(lines.len() <= 1);
                    prop_assert!(lines.iter().all(|l| !l.is_branch()));
                }
                for line in lines {
                    prop_assert_eq!(line.source.as_str(), source);
                    prop_assert!(live.insert(line.id.clone()));
                }
            }
            let drawn: HashSet<_> = layer.previews().into_iter().map(|e| e.id).collect();
            prop_assert_eq!(&drawn, &live);
            prop_assert!(previews.deleted_lines().iter().all(|l| !live.contains(&l.id)));
        }
    }
}
