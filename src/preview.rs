//! Ephemeral preview edges.
//!
//! A preview edge shows where a connection could go before it exists. For
//! each source node [`PreviewEdgeManager`] holds either one main line or a
//! group of branch lines, one per named branch of a split node, never both.
//! Every mutation is mirrored to the [`RenderLayer`] within the same call.
//! New lines are drawn before the lines they replace are taken down, so a
//! rejected add leaves the source with its previous lines.
//!
//! The manager also draws the committed edges of the document, since it
//! owns the render layer: a commit swaps the preview primitive for a
//! committed one.
//!
//! ```ignore
//! let mut previews = PreviewEdgeManager::new(doc.clone(), Box::new(layer), config, clock);
//! previews.create_main_preview_line("sms-1", PreviewTarget::Point(pointer))?;
//! previews.retarget("main_sms-1_1", PreviewTarget::Node("wait-1".into()))?;
//! ```

use crate::config::PreviewConfig;
use crate::document::FlowDocument;
use crate::error::{GraphError, RenderError};
use crate::model::{
    branch_port_id, BranchId, Edge, EdgeId, EdgeKind, Endpoint, NodeId, Point, PortDirection,
    PortId,
};
use crate::path::{distance_to_bezier, edge_path, preview_end_point, CubicBezier};
use crate::render::{EdgePrimitive, RenderLayer};
use crate::rules::{ConnectionContext, ConnectionRuleEngine, ValidationReport};
use crate::schedule::SharedClock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Where the free end of a preview line points.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewTarget {
    /// The input port of a node.
    Node(NodeId),
    /// A canvas position, e.g. the pointer.
    Point(Point),
}

/// One requested line of a branch group.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchTarget {
    pub branch_id: BranchId,
    pub label: String,
    pub target: PreviewTarget,
}

impl BranchTarget {
    pub fn new(branch_id: impl Into<BranchId>, label: impl Into<String>, target: PreviewTarget) -> Self {
        Self {
            branch_id: branch_id.into(),
            label: label.into(),
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewLine {
    pub id: EdgeId,
    pub source: NodeId,
    pub source_port: PortId,
    pub target: PreviewTarget,
    pub branch_id: Option<BranchId>,
    pub branch_label: Option<String>,
    /// Position within the branch group, used to fan lines out.
    pub branch_index: usize,
    pub created_at: Instant,
    pub deleted_at: Option<Instant>,
}

impl PreviewLine {
    pub fn is_branch(&self) -> bool {
        self.branch_id.is_some()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Main(PreviewLine),
    Branches(Vec<PreviewLine>),
}

impl Slot {
    fn lines(&self) -> &[PreviewLine] {
        match self {
            Slot::Main(line) => std::slice::from_ref(line),
            Slot::Branches(lines) => lines,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreviewStats {
    pub main_lines: usize,
    pub branch_lines: usize,
    pub total_lines: usize,
    /// Number of branch groups.
    pub branches: usize,
    pub deleted_lines: usize,
    /// A line is held while a node is created at its end.
    pub is_creating: bool,
}

/// Result of promoting a preview line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed { edge: EdgeId, report: ValidationReport },
    Rejected(ValidationReport),
}

pub struct PreviewEdgeManager {
    doc: Rc<RefCell<FlowDocument>>,
    layer: Box<dyn RenderLayer>,
    config: PreviewConfig,
    clock: SharedClock,
    slots: HashMap<NodeId, Slot>,
    deleted: Vec<PreviewLine>,
    next_id: u64,
    /// Line held while the host creates a node at its end.
    creating: Option<EdgeId>,
}

impl PreviewEdgeManager {
    pub fn new(
        doc: Rc<RefCell<FlowDocument>>,
        layer: Box<dyn RenderLayer>,
        config: PreviewConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            doc,
            layer,
            config,
            clock,
            slots: HashMap::new(),
            deleted: Vec::new(),
            next_id: 0,
            creating: None,
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Draw the main preview line of `source`, replacing whatever preview
    /// lines the source had.
    ///
    /// Returns `None` when the source or a target node does not exist.
    pub fn create_main_preview_line(
        &mut self,
        source: &str,
        target: PreviewTarget,
    ) -> Result<Option<PreviewLine>, RenderError> {
        let source_port = {
            let doc = self.doc.borrow();
            let Some(node) = doc.node(source) else {
                debug!(source, "main preview skipped, unknown source");
                return Ok(None);
            };
            if let PreviewTarget::Node(id) = &target {
                if !doc.contains_node(id.as_str()) {
                    debug!(source, target = %id, "main preview skipped, unknown target");
                    return Ok(None);
                }
            }
            node.default_port(PortDirection::Output)
                .map(|p| p.id.clone())
                .unwrap_or_else(|| PortId::from("out"))
        };

        self.install_main(source, source_port, target).map(Some)
    }

    fn install_main(
        &mut self,
        source: &str,
        source_port: PortId,
        target: PreviewTarget,
    ) -> Result<PreviewLine, RenderError> {
        let line = PreviewLine {
            id: self.allocate_id(format!("main_{}", source)),
            source: NodeId::from(source),
            source_port,
            target,
            branch_id: None,
            branch_label: None,
            branch_index: 0,
            created_at: self.clock.now(),
            deleted_at: None,
        };
        let primitive = self.primitive(&line, 1);
        self.layer.add_edge(&primitive)?;
        if let Err(err) = self.discard_slot(source) {
            self.undraw(&line.id);
            return Err(err);
        }
        debug!(line = %line.id, source, "main preview line created");
        self.slots.insert(line.source.clone(), Slot::Main(line.clone()));
        Ok(line)
    }

    /// Draw one preview line per branch target, replacing whatever preview
    /// lines the source had. Branches that already have a committed edge
    /// are skipped.
    ///
    /// Returns `None` when the source does not exist or `targets` is empty.
    /// If the render layer rejects any line, the lines drawn so far by this
    /// call are removed again.
    pub fn create_branch_preview_lines(
        &mut self,
        source: &str,
        targets: &[BranchTarget],
    ) -> Result<Option<Vec<PreviewLine>>, RenderError> {
        if targets.is_empty() {
            return Ok(None);
        }
        let pending: Vec<BranchTarget> = {
            let doc = self.doc.borrow();
            if !doc.contains_node(source) {
                debug!(source, "branch previews skipped, unknown source");
                return Ok(None);
            }
            targets
                .iter()
                .filter(|t| {
                    let committed = doc.has_committed_branch(source, &t.branch_id);
                    if committed {
                        trace!(source, branch = %t.branch_id, "branch already committed");
                    }
                    !committed
                })
                .filter(|t| match &t.target {
                    PreviewTarget::Node(id) => doc.contains_node(id.as_str()),
                    PreviewTarget::Point(_) => true,
                })
                .cloned()
                .collect()
        };

        self.install_branches(source, targets.len(), pending).map(Some)
    }

    fn install_branches(
        &mut self,
        source: &str,
        requested: usize,
        pending: Vec<BranchTarget>,
    ) -> Result<Vec<PreviewLine>, RenderError> {
        let now = self.clock.now();
        let mut lines: Vec<PreviewLine> = Vec::with_capacity(pending.len());
        for (index, target) in pending.into_iter().enumerate() {
            let port = branch_port_id(&target.branch_id);
            let line = PreviewLine {
                id: self.allocate_id(format!("branch_{}_{}", source, target.branch_id)),
                source: NodeId::from(source),
                source_port: port,
                target: target.target,
                branch_id: Some(target.branch_id),
                branch_label: Some(target.label),
                branch_index: index,
                created_at: now,
                deleted_at: None,
            };
            let primitive = self.primitive(&line, requested);
            if let Err(err) = self.layer.add_edge(&primitive) {
                warn!(line = %line.id, error = %err, "branch preview rejected, rolling back group");
                for drawn in &lines {
                    self.undraw(&drawn.id);
                }
                return Err(err);
            }
            lines.push(line);
        }
        if let Err(err) = self.discard_slot(source) {
            for drawn in &lines {
                self.undraw(&drawn.id);
            }
            return Err(err);
        }

        debug!(source, lines = lines.len(), requested, "branch preview lines created");
        if !lines.is_empty() {
            self.slots
                .insert(NodeId::from(source), Slot::Branches(lines.clone()));
        }
        Ok(lines)
    }

    /// Regenerate the dangling preview lines of `source` from its ports:
    /// one per uncommitted branch of a split node, else one main line while
    /// the main output still has room. Returns the number of lines drawn.
    pub fn regenerate(&mut self, source: &str) -> Result<usize, RenderError> {
        enum Plan {
            Branches(Vec<BranchTarget>),
            Main(Point),
            Nothing,
        }
        let plan = {
            let doc = self.doc.borrow();
            let Some(node) = doc.node(source) else {
                return Ok(0);
            };
            let branches = node.config.branches();
            if node.kind.is_split() && !branches.is_empty() {
                let count = branches.len();
                let targets = branches
                    .iter()
                    .enumerate()
                    .map(|(index, branch)| {
                        let port = branch_port_id(&branch.id);
                        let anchor = doc
                            .port_position(source, port.as_str())
                            .unwrap_or(node.position);
                        let end = preview_end_point(
                            anchor,
                            index,
                            count,
                            self.config.line_length,
                            self.config.branch_spread,
                        );
                        BranchTarget::new(branch.id.clone(), branch.label.clone(), PreviewTarget::Point(end))
                    })
                    .collect();
                Plan::Branches(targets)
            } else {
                match node.default_port(PortDirection::Output) {
                    Some(port) if port.has_capacity() && !node.kind.is_terminal() => {
                        let anchor = doc
                            .port_position(source, port.id.as_str())
                            .unwrap_or(node.position);
                        Plan::Main(preview_end_point(anchor, 0, 1, self.config.line_length, 0.0))
                    }
                    _ => Plan::Nothing,
                }
            }
        };

        match plan {
            Plan::Branches(targets) => Ok(self
                .create_branch_preview_lines(source, &targets)?
                .map_or(0, |lines| lines.len())),
            Plan::Main(end) => Ok(self
                .create_main_preview_line(source, PreviewTarget::Point(end))?
                .map_or(0, |_| 1)),
            Plan::Nothing => {
                self.remove_lines_for(source)?;
                Ok(0)
            }
        }
    }

    // ------------------------------------------------------------------
    // Removal and restore
    // ------------------------------------------------------------------

    /// Remove one line, keeping it in the deleted list for restore.
    pub fn remove_single_preview_line(&mut self, id: &str) -> Result<Option<PreviewLine>, RenderError> {
        let Some(source) = self.source_of(id) else {
            return Ok(None);
        };
        self.layer.remove_edge(&EdgeId::from(id))?;

        let mut removed = None;
        let mut empty = false;
        match self.slots.get_mut(&source) {
            Some(Slot::Main(line)) if line.id.as_str() == id => {
                removed = Some(line.clone());
                empty = true;
            }
            Some(Slot::Branches(lines)) => {
                if let Some(index) = lines.iter().position(|l| l.id.as_str() == id) {
                    removed = Some(lines.remove(index));
                    empty = lines.is_empty();
                }
            }
            _ => {}
        }
        if empty {
            self.slots.remove(&source);
        }

        if self.creating.as_ref().is_some_and(|c| c.as_str() == id) {
            self.creating = None;
        }
        Ok(removed.map(|mut line| {
            line.deleted_at = Some(self.clock.now());
            debug!(line = %line.id, "preview line removed");
            self.deleted.push(line.clone());
            line
        }))
    }

    /// Put a removed line back.
    ///
    /// Returns `None` when `id` was never removed, when its source node is
    /// gone, or when its branch has been committed meanwhile; the record
    /// then stays in the deleted list. A main line or branch line of the
    /// same source that occupies the slot is moved to the deleted list.
    pub fn restore_deleted_line(&mut self, id: &str) -> Result<Option<PreviewLine>, RenderError> {
        let Some(position) = self.deleted.iter().position(|l| l.id.as_str() == id) else {
            return Ok(None);
        };
        let record = self.deleted[position].clone();
        {
            let doc = self.doc.borrow();
            if !doc.contains_node(record.source.as_str()) {
                debug!(line = id, "restore skipped, source is gone");
                return Ok(None);
            }
            if let Some(branch) = &record.branch_id {
                if doc.has_committed_branch(record.source.as_str(), branch) {
                    debug!(line = id, branch = %branch, "restore skipped, branch is committed");
                    return Ok(None);
                }
            }
        }

        let conflicts: Vec<EdgeId> = match (self.slots.get(&record.source), &record.branch_id) {
            (None, _) => Vec::new(),
            (Some(Slot::Branches(lines)), Some(branch)) => lines
                .iter()
                .filter(|l| l.branch_id.as_ref() == Some(branch))
                .map(|l| l.id.clone())
                .collect(),
            (Some(slot), _) => slot.lines().iter().map(|l| l.id.clone()).collect(),
        };
        if let Some(missing) = conflicts.iter().find(|id| !self.layer.contains(id)) {
            return Err(RenderError::UnknownEdge(missing.clone()));
        }

        let group_size = match &record.branch_id {
            Some(_) => self.group_len(&record.source) + 1,
            None => 1,
        };
        let primitive = self.primitive(&record, group_size);
        self.layer.add_edge(&primitive)?;
        for conflict in &conflicts {
            self.layer.remove_edge(conflict)?;
        }

        let now = self.clock.now();
        for conflict in &conflicts {
            if let Some(mut displaced) = self.take_line(&record.source, conflict.as_str()) {
                displaced.deleted_at = Some(now);
                trace!(line = %displaced.id, "preview line displaced by restore");
                self.deleted.push(displaced);
            }
        }

        self.deleted.retain(|l| l.id.as_str() != id);
        let mut restored = record;
        restored.deleted_at = None;
        match (self.slots.get_mut(&restored.source), restored.branch_id.is_some()) {
            (Some(Slot::Branches(lines)), true) => {
                lines.push(restored.clone());
                lines.sort_by_key(|l| l.branch_index);
            }
            (_, true) => {
                self.slots
                    .insert(restored.source.clone(), Slot::Branches(vec![restored.clone()]));
            }
            (_, false) => {
                self.slots
                    .insert(restored.source.clone(), Slot::Main(restored.clone()));
            }
        }
        debug!(line = id, "preview line restored");
        Ok(Some(restored))
    }

    /// Remove every preview line and forget the deleted list.
    pub fn clear_all_preview_lines(&mut self) -> usize {
        let ids: Vec<EdgeId> = self
            .slots
            .values()
            .flat_map(|slot| slot.lines().iter().map(|l| l.id.clone()))
            .collect();
        for id in &ids {
            if let Err(err) = self.layer.remove_edge(id) {
                warn!(line = %id, error = %err, "render layer failed to drop preview line");
            }
        }
        self.slots.clear();
        self.deleted.clear();
        self.creating = None;
        debug!(removed = ids.len(), "all preview lines cleared");
        ids.len()
    }

    /// Remove every line of `source` without keeping them for restore.
    pub fn remove_lines_for(&mut self, source: &str) -> Result<usize, RenderError> {
        let count = self.slots.get(source).map_or(0, |s| s.lines().len());
        self.discard_slot(source)?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Point an existing line somewhere else. Returns false for unknown
    /// lines and unknown target nodes.
    pub fn retarget(&mut self, id: &str, target: PreviewTarget) -> Result<bool, RenderError> {
        if let PreviewTarget::Node(node) = &target {
            if !self.doc.borrow().contains_node(node.as_str()) {
                return Ok(false);
            }
        }
        let Some(source) = self.source_of(id) else {
            return Ok(false);
        };
        let group = self.group_len(&source).max(1);
        let Some(mut line) = self.line(id).cloned() else {
            return Ok(false);
        };
        line.target = target;
        let primitive = self.primitive(&line, group);
        self.layer.update_edge(&primitive)?;
        if let Some(slot_line) = self.line_mut(&source, id) {
            slot_line.target = line.target;
        }
        trace!(line = id, "preview line retargeted");
        Ok(true)
    }

    /// Validate and commit the edge a preview line proposes.
    ///
    /// On success the committed edge is added to the document and drawn,
    /// and the previews it supersedes are dropped. If the layer refuses the
    /// committed edge, the document edge is removed again.
    pub fn commit_preview_line(
        &mut self,
        id: &str,
        target: Endpoint,
        rules: &ConnectionRuleEngine,
    ) -> Result<CommitOutcome, GraphError> {
        let line = self
            .line(id)
            .cloned()
            .ok_or_else(|| GraphError::EdgeNotFound(EdgeId::from(id)))?;

        let mut ctx = ConnectionContext::new(line.source.clone(), target.node.clone())
            .with_source_port(line.source_port.clone());
        ctx.target_port = target.port.clone();
        ctx.branch_id = line.branch_id.clone();

        let report = rules.validate(&self.doc.borrow(), &ctx);
        if !report.is_valid {
            debug!(line = id, reason = ?report.reason(), "preview commit rejected");
            return Ok(CommitOutcome::Rejected(report));
        }

        let edge_id = self.doc.borrow_mut().add_edge(
            Endpoint::port(line.source.clone(), line.source_port.clone()),
            target,
            line.branch_id.clone(),
        )?;
        let edge = self
            .doc
            .borrow()
            .edge(edge_id.as_str())
            .cloned()
            .ok_or_else(|| GraphError::EdgeNotFound(edge_id.clone()))?;
        if let Err(err) = self.draw_committed_edge(&edge) {
            if let Err(undo) = self.doc.borrow_mut().remove_edge(edge_id.as_str()) {
                warn!(edge = %edge_id, error = %undo, "failed to drop undrawable edge");
            }
            return Err(err.into());
        }
        self.on_edge_committed(&edge)?;
        debug!(line = id, edge = %edge_id, "preview line committed");
        Ok(CommitOutcome::Committed {
            edge: edge_id,
            report,
        })
    }

    /// Drop the previews a newly committed edge supersedes: the lines of
    /// its branch, or the main line for an edge without a branch.
    pub fn on_edge_committed(&mut self, edge: &Edge) -> Result<usize, RenderError> {
        let source = &edge.source.node;
        let stale: Vec<EdgeId> = match (self.slots.get(source), &edge.branch_id) {
            (Some(Slot::Branches(lines)), Some(branch)) => lines
                .iter()
                .filter(|l| l.branch_id.as_ref() == Some(branch))
                .map(|l| l.id.clone())
                .collect(),
            (Some(Slot::Main(line)), None) => vec![line.id.clone()],
            _ => Vec::new(),
        };
        for id in &stale {
            self.layer.remove_edge(id)?;
            self.take_line(source, id.as_str());
        }
        if let Some(branch) = &edge.branch_id {
            self.deleted
                .retain(|l| !(l.source == *source && l.branch_id.as_ref() == Some(branch)));
        }
        Ok(stale.len())
    }

    /// Hold `id` while a node is created at its end. Returns false for
    /// unknown lines.
    pub fn begin_node_creation(&mut self, id: &str) -> bool {
        if self.line(id).is_none() {
            return false;
        }
        self.creating = Some(EdgeId::from(id));
        true
    }

    /// Release the line held by [`begin_node_creation`](Self::begin_node_creation).
    pub fn end_node_creation(&mut self) -> Option<EdgeId> {
        self.creating.take()
    }

    // ------------------------------------------------------------------
    // Committed edges
    // ------------------------------------------------------------------

    /// Draw a committed edge of the document.
    pub fn draw_committed_edge(&mut self, edge: &Edge) -> Result<(), RenderError> {
        let primitive = self.committed_primitive(edge);
        self.layer.add_edge(&primitive)?;
        trace!(edge = %edge.id, "committed edge drawn");
        Ok(())
    }

    /// Take a committed edge off the layer. Ids the layer does not hold
    /// are ignored.
    pub fn erase_committed_edge(&mut self, id: &EdgeId) -> Result<(), RenderError> {
        if self.layer.contains(id) {
            self.layer.remove_edge(id)?;
        }
        Ok(())
    }

    /// Redraw the committed edges touching `node`, or all of them, after
    /// nodes moved. Edges missing from the layer are added.
    pub fn redraw_committed_edges(&mut self, node: Option<&str>) -> Result<usize, RenderError> {
        let edges: Vec<Edge> = self
            .doc
            .borrow()
            .edges()
            .iter()
            .filter(|e| {
                node.map_or(true, |n| e.source.node.as_str() == n || e.target.node.as_str() == n)
            })
            .cloned()
            .collect();
        for edge in &edges {
            let primitive = self.committed_primitive(edge);
            if self.layer.contains(&edge.id) {
                self.layer.update_edge(&primitive)?;
            } else {
                self.layer.add_edge(&primitive)?;
            }
        }
        Ok(edges.len())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn stats(&self) -> PreviewStats {
        let mut stats = PreviewStats {
            deleted_lines: self.deleted.len(),
            is_creating: self.creating.is_some(),
            ..Default::default()
        };
        for slot in self.slots.values() {
            match slot {
                Slot::Main(_) => stats.main_lines += 1,
                Slot::Branches(lines) => {
                    stats.branches += 1;
                    stats.branch_lines += lines.len();
                }
            }
        }
        stats.total_lines = stats.main_lines + stats.branch_lines;
        stats
    }

    pub fn line(&self, id: &str) -> Option<&PreviewLine> {
        self.slots
            .values()
            .flat_map(|slot| slot.lines().iter())
            .find(|l| l.id.as_str() == id)
    }

    pub fn lines_for(&self, source: &str) -> Vec<PreviewLine> {
        self.slots
            .get(source)
            .map(|slot| slot.lines().to_vec())
            .unwrap_or_default()
    }

    /// The line of `source` serving `branch`.
    pub fn branch_line(&self, source: &str, branch: &BranchId) -> Option<&PreviewLine> {
        match self.slots.get(source) {
            Some(Slot::Branches(lines)) => lines.iter().find(|l| l.branch_id.as_ref() == Some(branch)),
            _ => None,
        }
    }

    /// The preview line drawn within `tolerance` of `point`, closest first.
    pub fn line_at(&self, point: Point, tolerance: f64) -> Option<EdgeId> {
        let mut best: Option<(f64, EdgeId)> = None;
        for slot in self.slots.values() {
            let group = slot.lines().len();
            for line in slot.lines() {
                let primitive = self.primitive(line, group);
                let curve = CubicBezier::vertical(primitive.start, primitive.end, self.config.bezier_offset);
                let distance = distance_to_bezier(point, &curve, 20);
                if distance <= tolerance && best.as_ref().map_or(true, |(d, _)| distance < *d) {
                    best = Some((distance, line.id.clone()));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    pub fn deleted_lines(&self) -> &[PreviewLine] {
        &self.deleted
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn allocate_id(&mut self, prefix: String) -> EdgeId {
        self.next_id += 1;
        EdgeId::new(format!("{}_{}", prefix, self.next_id))
    }

    fn source_of(&self, id: &str) -> Option<NodeId> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.lines().iter().any(|l| l.id.as_str() == id))
            .map(|(source, _)| source.clone())
    }

    fn group_len(&self, source: &NodeId) -> usize {
        match self.slots.get(source) {
            Some(Slot::Branches(lines)) => lines.len(),
            _ => 0,
        }
    }

    fn line_mut(&mut self, source: &NodeId, id: &str) -> Option<&mut PreviewLine> {
        match self.slots.get_mut(source)? {
            Slot::Main(line) => Some(line).filter(|l| l.id.as_str() == id),
            Slot::Branches(lines) => lines.iter_mut().find(|l| l.id.as_str() == id),
        }
    }

    /// Detach a line from its slot, dropping the slot once empty.
    fn take_line(&mut self, source: &NodeId, id: &str) -> Option<PreviewLine> {
        if self.creating.as_ref().is_some_and(|c| c.as_str() == id) {
            self.creating = None;
        }
        let (taken, empty) = match self.slots.get_mut(source)? {
            Slot::Main(line) if line.id.as_str() == id => (Some(line.clone()), true),
            Slot::Main(_) => (None, false),
            Slot::Branches(lines) => {
                let taken = lines
                    .iter()
                    .position(|l| l.id.as_str() == id)
                    .map(|index| lines.remove(index));
                (taken, lines.is_empty())
            }
        };
        if empty {
            self.slots.remove(source);
        }
        taken
    }

    /// Remove the lines of `source` from the layer and forget them.
    fn discard_slot(&mut self, source: &str) -> Result<(), RenderError> {
        let Some(slot) = self.slots.get(source) else {
            return Ok(());
        };
        let ids: Vec<EdgeId> = slot.lines().iter().map(|l| l.id.clone()).collect();
        for id in &ids {
            self.layer.remove_edge(id)?;
            self.take_line(&NodeId::from(source), id.as_str());
        }
        Ok(())
    }

    /// Best-effort removal while rolling back.
    fn undraw(&mut self, id: &EdgeId) {
        if let Err(err) = self.layer.remove_edge(id) {
            warn!(line = %id, error = %err, "rollback of preview line failed");
        }
    }

    fn committed_primitive(&self, edge: &Edge) -> EdgePrimitive {
        let doc = self.doc.borrow();
        let anchor = |end: &Endpoint| {
            end.port
                .as_ref()
                .and_then(|port| doc.port_position(end.node.as_str(), port.as_str()))
                .or_else(|| doc.node(end.node.as_str()).map(|n| n.position))
                .unwrap_or_default()
        };
        let start = anchor(&edge.source);
        let end = anchor(&edge.target);
        let label = edge.branch_id.as_ref().and_then(|branch| {
            doc.node(edge.source.node.as_str())?
                .config
                .branches()
                .iter()
                .find(|b| b.id == *branch)
                .map(|b| b.label.clone())
        });
        EdgePrimitive {
            id: edge.id.clone(),
            kind: EdgeKind::Committed,
            start,
            end,
            path_commands: edge_path(start, end, self.config.bezier_offset),
            color: self.config.edge_stroke_color(),
            line_width: self.config.line_width,
            label,
        }
    }

    fn end_point(&self, doc: &FlowDocument, line: &PreviewLine, start: Point, group: usize) -> Point {
        match &line.target {
            PreviewTarget::Point(point) => *point,
            PreviewTarget::Node(id) => doc
                .node(id.as_str())
                .map(|node| {
                    node.input_port()
                        .and_then(|port| doc.port_position(id.as_str(), port.id.as_str()))
                        .unwrap_or(node.position)
                })
                .unwrap_or_else(|| {
                    preview_end_point(
                        start,
                        line.branch_index,
                        group,
                        self.config.line_length,
                        self.config.branch_spread,
                    )
                }),
        }
    }

    fn primitive(&self, line: &PreviewLine, group: usize) -> EdgePrimitive {
        let doc = self.doc.borrow();
        let start = doc
            .port_position(line.source.as_str(), line.source_port.as_str())
            .or_else(|| doc.node(line.source.as_str()).map(|n| n.position))
            .unwrap_or_default();
        let end = self.end_point(&doc, line, start, group);
        EdgePrimitive {
            id: line.id.clone(),
            kind: EdgeKind::Preview,
            start,
            end,
            path_commands: edge_path(start, end, self.config.bezier_offset),
            color: self.config.stroke_color(),
            line_width: self.config.line_width,
            label: line.branch_label.clone(),
        }
    }
}
