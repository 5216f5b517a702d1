//! Render layer seam.
//!
//! The engine never draws. Committed and preview edges are pushed to a
//! [`RenderLayer`] as [`EdgePrimitive`]s; the layer may reject an edge, in
//! which case the caller rolls its own state back.
//!
//! [`ModelRenderLayer`] mirrors primitives into a Slint `VecModel` so a
//! `.slint` canvas can bind to it directly:
//!
//! ```ignore
//! let model = Rc::new(VecModel::<EdgePath>::default());
//! let layer = ModelRenderLayer::new(model.clone(), |id, path, color, width| EdgePath {
//!     id,
//!     path_commands: path,
//!     color,
//!     width,
//! });
//! window.set_edge_paths(ModelRc::from(model));
//! ```
//!
//! [`MemoryRenderLayer`] keeps primitives in memory, for headless hosts.

use crate::error::RenderError;
use crate::model::{EdgeId, EdgeKind, Point};
use slint::{Color, Model, SharedString, VecModel};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Everything needed to draw one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgePrimitive {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub start: Point,
    pub end: Point,
    pub path_commands: String,
    pub color: Color,
    pub line_width: f32,
    /// Branch label drawn next to branch preview lines.
    pub label: Option<String>,
}

pub trait RenderLayer {
    fn add_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError>;

    /// Redraw an edge that is already present.
    fn update_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError>;

    fn remove_edge(&mut self, id: &EdgeId) -> Result<(), RenderError>;

    fn contains(&self, id: &EdgeId) -> bool;
}

/// Mirrors edge primitives into a Slint model, one row per edge.
pub struct ModelRenderLayer<P> {
    model: Rc<VecModel<P>>,
    constructor: Box<dyn Fn(SharedString, SharedString, Color, f32) -> P>,
    rows: Vec<EdgeId>,
}

impl<P: Clone + 'static> ModelRenderLayer<P> {
    /// `constructor` builds a row from (id, path commands, color, line width).
    pub fn new<F>(model: Rc<VecModel<P>>, constructor: F) -> Self
    where
        F: Fn(SharedString, SharedString, Color, f32) -> P + 'static,
    {
        Self {
            model,
            constructor: Box::new(constructor),
            rows: Vec::new(),
        }
    }

    pub fn model(&self) -> Rc<VecModel<P>> {
        self.model.clone()
    }

    fn row(&self, edge: &EdgePrimitive) -> P {
        (self.constructor)(
            SharedString::from(edge.id.as_str()),
            SharedString::from(edge.path_commands.as_str()),
            edge.color,
            edge.line_width,
        )
    }

    fn index_of(&self, id: &EdgeId) -> Option<usize> {
        self.rows.iter().position(|row| row == id)
    }
}

impl<P: Clone + 'static> RenderLayer for ModelRenderLayer<P> {
    fn add_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError> {
        if self.index_of(&edge.id).is_some() {
            return Err(RenderError::Rejected {
                edge_id: edge.id.clone(),
                reason: "edge already drawn".into(),
            });
        }
        self.model.push(self.row(edge));
        self.rows.push(edge.id.clone());
        Ok(())
    }

    fn update_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError> {
        let index = self
            .index_of(&edge.id)
            .ok_or_else(|| RenderError::UnknownEdge(edge.id.clone()))?;
        if index < self.model.row_count() {
            self.model.set_row_data(index, self.row(edge));
        }
        Ok(())
    }

    fn remove_edge(&mut self, id: &EdgeId) -> Result<(), RenderError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| RenderError::UnknownEdge(id.clone()))?;
        self.rows.remove(index);
        if index < self.model.row_count() {
            self.model.remove(index);
        }
        Ok(())
    }

    fn contains(&self, id: &EdgeId) -> bool {
        self.index_of(id).is_some()
    }
}

/// One call received by a [`MemoryRenderLayer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOp {
    Add(EdgeId),
    Update(EdgeId),
    Remove(EdgeId),
}

#[derive(Debug, Default)]
struct MemoryState {
    edges: Vec<EdgePrimitive>,
    ops: Vec<RenderOp>,
    reject_ids: HashSet<EdgeId>,
    /// Successful adds left before every further add is rejected.
    accept_budget: Option<usize>,
}

/// Keeps primitives in memory.
///
/// Clones share state, so a handle kept outside the engine observes what
/// the engine drew. Rejections can be armed to exercise rollback paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryRenderLayer {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryRenderLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any future add of `id`.
    pub fn reject(&self, id: impl Into<EdgeId>) {
        self.state.borrow_mut().reject_ids.insert(id.into());
    }

    /// Accept `count` more adds, then reject the rest.
    pub fn accept_only(&self, count: usize) {
        self.state.borrow_mut().accept_budget = Some(count);
    }

    pub fn accept_all(&self) {
        let mut state = self.state.borrow_mut();
        state.accept_budget = None;
        state.reject_ids.clear();
    }

    pub fn edges(&self) -> Vec<EdgePrimitive> {
        self.state.borrow().edges.clone()
    }

    /// Preview primitives, in drawing order.
    pub fn previews(&self) -> Vec<EdgePrimitive> {
        self.of_kind(EdgeKind::Preview)
    }

    /// Committed-edge primitives, in drawing order.
    pub fn committed(&self) -> Vec<EdgePrimitive> {
        self.of_kind(EdgeKind::Committed)
    }

    fn of_kind(&self, kind: EdgeKind) -> Vec<EdgePrimitive> {
        self.state
            .borrow()
            .edges
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn edge(&self, id: &str) -> Option<EdgePrimitive> {
        self.state
            .borrow()
            .edges
            .iter()
            .find(|e| e.id.as_str() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ops(&self) -> Vec<RenderOp> {
        self.state.borrow().ops.clone()
    }
}

impl RenderLayer for MemoryRenderLayer {
    fn add_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError> {
        let mut state = self.state.borrow_mut();
        let exhausted = state.accept_budget == Some(0);
        if exhausted || state.reject_ids.contains(&edge.id) {
            return Err(RenderError::Rejected {
                edge_id: edge.id.clone(),
                reason: "render layer refused the edge".into(),
            });
        }
        if state.edges.iter().any(|e| e.id == edge.id) {
            return Err(RenderError::Rejected {
                edge_id: edge.id.clone(),
                reason: "edge already drawn".into(),
            });
        }
        if let Some(budget) = state.accept_budget.as_mut() {
            *budget -= 1;
        }
        state.edges.push(edge.clone());
        state.ops.push(RenderOp::Add(edge.id.clone()));
        Ok(())
    }

    fn update_edge(&mut self, edge: &EdgePrimitive) -> Result<(), RenderError> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .edges
            .iter_mut()
            .find(|e| e.id == edge.id)
            .ok_or_else(|| RenderError::UnknownEdge(edge.id.clone()))?;
        *slot = edge.clone();
        state.ops.push(RenderOp::Update(edge.id.clone()));
        Ok(())
    }

    fn remove_edge(&mut self, id: &EdgeId) -> Result<(), RenderError> {
        let mut state = self.state.borrow_mut();
        let index = state
            .edges
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| RenderError::UnknownEdge(id.clone()))?;
        state.edges.remove(index);
        state.ops.push(RenderOp::Remove(id.clone()));
        Ok(())
    }

    fn contains(&self, id: &EdgeId) -> bool {
        self.state.borrow().edges.iter().any(|e| &e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct EdgeRow {
        id: SharedString,
        path: SharedString,
        width: f32,
    }

    fn primitive(id: &str, path: &str) -> EdgePrimitive {
        EdgePrimitive {
            id: EdgeId::from(id),
            kind: EdgeKind::Preview,
            start: Point::ORIGIN,
            end: Point::new(0.0, 120.0),
            path_commands: path.into(),
            color: Color::from_rgb_u8(24, 144, 255),
            line_width: 2.0,
            label: None,
        }
    }

    #[test]
    fn test_model_layer_mirrors_rows() {
        let model = Rc::new(VecModel::<EdgeRow>::default());
        let mut layer = ModelRenderLayer::new(model.clone(), |id, path, _color, width| EdgeRow {
            id,
            path,
            width,
        });

        layer.add_edge(&primitive("a", "M 0 0 L 0 1")).unwrap();
        layer.add_edge(&primitive("b", "M 0 0 L 0 2")).unwrap();
        assert_eq!(model.row_count(), 2);

        layer.update_edge(&primitive("b", "M 0 0 L 0 3")).unwrap();
        assert_eq!(model.row_data(1).unwrap().path.as_str(), "M 0 0 L 0 3");

        layer.remove_edge(&EdgeId::from("a")).unwrap();
        assert_eq!(model.row_count(), 1);
        assert_eq!(model.row_data(0).unwrap().id.as_str(), "b");
        assert!(!layer.contains(&EdgeId::from("a")));
    }

    #[test]
    fn test_model_layer_rejects_duplicates_and_unknown_ids() {
        let model = Rc::new(VecModel::<EdgeRow>::default());
        let mut layer = ModelRenderLayer::new(model, |id, path, _color, width| EdgeRow {
            id,
            path,
            width,
        });
        layer.add_edge(&primitive("a", "")).unwrap();
        assert!(layer.add_edge(&primitive("a", "")).is_err());
        assert_eq!(
            layer.remove_edge(&EdgeId::from("zz")),
            Err(RenderError::UnknownEdge(EdgeId::from("zz")))
        );
    }

    #[test]
    fn test_memory_layer_budget_and_rejections() {
        let layer = MemoryRenderLayer::new();
        let mut handle = layer.clone();
        layer.accept_only(1);
        assert!(handle.add_edge(&primitive("a", "")).is_ok());
        assert!(handle.add_edge(&primitive("b", "")).is_err());

        layer.accept_all();
        layer.reject("c");
        assert!(handle.add_edge(&primitive("c", "")).is_err());
        assert!(handle.add_edge(&primitive("b", "")).is_ok());
        assert_eq!(layer.len(), 2);
        assert_eq!(
            layer.ops(),
            vec![RenderOp::Add("a".into()), RenderOp::Add("b".into())]
        );
    }
}
