//! Snap targeting: the input port a dragged connection would attach to.

use crate::document::FlowDocument;
use crate::model::{NodeId, Point, PortDirection, PortId};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapTarget {
    pub node: NodeId,
    pub port: PortId,
    pub position: Point,
    pub distance: f64,
}

/// Nearest input port within `radius` of `pointer`, ignoring the ports of
/// `exclude` (the node the drag started from). Ties go to the node added
/// first.
pub fn find_snap_target(
    doc: &FlowDocument,
    pointer: Point,
    radius: f64,
    exclude: &str,
) -> Option<SnapTarget> {
    let radius_sq = radius * radius;
    let mut best: Option<(f64, SnapTarget)> = None;

    for node in doc.nodes().filter(|n| n.id.as_str() != exclude) {
        for port in node
            .ports
            .iter()
            .filter(|p| p.direction() == PortDirection::Input)
        {
            let Some(position) = doc.port_position(node.id.as_str(), port.id.as_str()) else {
                continue;
            };
            let dist_sq = position.distance_sq(&pointer);
            if dist_sq > radius_sq {
                continue;
            }
            if best.as_ref().map_or(true, |(d, _)| dist_sq < *d) {
                best = Some((
                    dist_sq,
                    SnapTarget {
                        node: node.id.clone(),
                        port: port.id.clone(),
                        position,
                        distance: dist_sq.sqrt(),
                    },
                ));
            }
        }
    }
    best.map(|(_, target)| target)
}
