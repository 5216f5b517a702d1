//! Built-in connection checks, in the order the engine runs them.

use super::cycle::find_cycle_with;
use super::{CheckFault, CheckInput, ConnectionCheck, IssueKind, ValidationIssue, ValidationReport};
use crate::model::{Node, Port, PortDirection, PortId};

/// An identical edge (same nodes, same branch) is already committed.
#[derive(Clone, Copy, Debug, Default)]
pub struct DuplicateCheck;

impl ConnectionCheck for DuplicateCheck {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let ctx = input.ctx;
        let branch = ctx.branch_id.as_ref().or_else(|| {
            ctx.source_port
                .as_ref()
                .and_then(|p| input.source.port(p.as_str()))
                .and_then(|p| p.branch_id.as_ref())
        });
        if let Some(existing) = input.doc.find_duplicate(
            ctx.source.as_str(),
            ctx.target.as_str(),
            branch,
            ctx.edge_id.as_ref(),
        ) {
            report.push(
                ValidationIssue::warning(
                    IssueKind::DuplicateConnection,
                    format!(
                        "edge {} already connects {} to {}",
                        existing.id, ctx.source, ctx.target
                    ),
                )
                .on(&ctx.source),
            );
        }
        Ok(())
    }
}

/// Node kinds must be able to play their role and be paired in the table.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeKindCheck;

impl ConnectionCheck for NodeKindCheck {
    fn name(&self) -> &'static str {
        "node-kind"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let (source, target) = (input.source, input.target);
        let mut blocked = false;

        if source.kind.is_terminal() {
            blocked = true;
            report.push(
                ValidationIssue::error(
                    IssueKind::SourceCannotConnect,
                    format!("{} nodes cannot start a connection", source.kind),
                )
                .on(&source.id),
            );
        }
        if target.kind.is_source_only() {
            blocked = true;
            report.push(
                ValidationIssue::error(
                    IssueKind::TargetCannotReceive,
                    format!("{} nodes cannot receive a connection", target.kind),
                )
                .on(&target.id),
            );
        }

        let tables = input.tables;
        for node in [source, target] {
            if !tables.is_known(&node.kind) {
                report.push(
                    ValidationIssue::warning(
                        IssueKind::UnknownNodeKind,
                        format!("node kind `{}` has no connection rules", node.kind),
                    )
                    .on(&node.id),
                );
            }
        }

        if !blocked {
            if let Some(allowed) = tables.allowed_targets(&source.kind) {
                if tables.is_known(&target.kind) && !allowed.contains(&target.kind) {
                    report.push(
                        ValidationIssue::error(
                            IssueKind::IncompatibleNodeKinds,
                            format!("{} cannot connect to {}", source.kind, target.kind),
                        )
                        .on(&target.id),
                    );
                }
            }
        }

        if source.kind.is_split() && target.kind.is_split() {
            report.push(ValidationIssue::warning(
                IssueKind::SplitToSplit,
                format!(
                    "{} feeds directly into {}; consider merging the conditions",
                    source.kind, target.kind
                ),
            ));
        }
        Ok(())
    }
}

/// Outgoing and incoming edge counts against node limits.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapacityCheck;

impl ConnectionCheck for CapacityCheck {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let ratio = input.config.near_limit_ratio;

        let (source_limits, _) = input.tables.limits_for(input.source);
        let outgoing = input.doc.outgoing_count(input.source.id.as_str());
        check_usage(
            report,
            input.source,
            outgoing,
            source_limits.max_outgoing,
            ratio,
            (IssueKind::OutgoingLimitReached, IssueKind::OutgoingNearLimit),
            "outgoing",
        );

        let (target_limits, _) = input.tables.limits_for(input.target);
        let incoming = input.doc.incoming_count(input.target.id.as_str());
        check_usage(
            report,
            input.target,
            incoming,
            target_limits.max_incoming,
            ratio,
            (IssueKind::IncomingLimitReached, IssueKind::IncomingNearLimit),
            "incoming",
        );
        Ok(())
    }
}

fn check_usage(
    report: &mut ValidationReport,
    node: &Node,
    count: usize,
    max: usize,
    ratio: f64,
    (reached, near): (IssueKind, IssueKind),
    label: &str,
) {
    if count >= max {
        report.push(
            ValidationIssue::error(
                reached,
                format!(
                    "node {} has reached its {} limit ({}/{})",
                    node.id, label, count, max
                ),
            )
            .on(&node.id),
        );
    } else if count as f64 >= max as f64 * ratio {
        report.push(
            ValidationIssue::warning(
                near,
                format!(
                    "node {} is close to its {} limit ({}/{})",
                    node.id, label, count, max
                ),
            )
            .on(&node.id),
        );
    }
}

/// The port an edge would use on `node`: the named one, else the default.
///
/// `Err` carries the named port that does not exist.
pub(super) fn resolve_port<'n>(
    node: &'n Node,
    named: Option<&PortId>,
    direction: PortDirection,
) -> Result<Option<&'n Port>, PortId> {
    match named {
        Some(id) => node.port(id.as_str()).map(Some).ok_or_else(|| id.clone()),
        None => Ok(node.default_port(direction)),
    }
}

/// Output ports only start edges, input ports only end them, each within capacity.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortDirectionCheck;

impl ConnectionCheck for PortDirectionCheck {
    fn name(&self) -> &'static str {
        "port-direction"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let sides = [
            (input.source, input.ctx.source_port.as_ref(), PortDirection::Output, "source"),
            (input.target, input.ctx.target_port.as_ref(), PortDirection::Input, "target"),
        ];
        for (node, named, direction, role) in sides {
            let port = match resolve_port(node, named, direction) {
                Ok(Some(port)) => port,
                Ok(None) => continue,
                Err(missing) => {
                    report.push(
                        ValidationIssue::error(
                            IssueKind::PortNotFound,
                            format!("{} port {} does not exist on node {}", role, missing, node.id),
                        )
                        .on(&node.id),
                    );
                    continue;
                }
            };
            if port.direction() != direction {
                report.push(
                    ValidationIssue::error(
                        IssueKind::PortDirection,
                        format!(
                            "port {} on node {} cannot be used as a connection {}",
                            port.id, node.id, role
                        ),
                    )
                    .on(&node.id),
                );
            } else if !port.has_capacity() {
                report.push(
                    ValidationIssue::error(
                        IssueKind::PortCapacity,
                        format!(
                            "port {} on node {} is full ({}/{})",
                            port.id,
                            node.id,
                            port.connections(),
                            port.capacity
                        ),
                    )
                    .on(&node.id),
                );
            }
        }
        Ok(())
    }
}

/// Port categories must be paired in the compatibility matrix.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortCompatibilityCheck;

impl ConnectionCheck for PortCompatibilityCheck {
    fn name(&self) -> &'static str {
        "port-compatibility"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let source = resolve_port(input.source, input.ctx.source_port.as_ref(), PortDirection::Output);
        let target = resolve_port(input.target, input.ctx.target_port.as_ref(), PortDirection::Input);
        let (Ok(Some(source)), Ok(Some(target))) = (source, target) else {
            return Ok(());
        };
        let allowed = input
            .tables
            .port_targets(source.category)
            .is_some_and(|targets| targets.contains(&target.category));
        if !allowed {
            report.push(ValidationIssue::error(
                IssueKind::PortTypeMismatch,
                format!(
                    "{:?} port {} cannot connect to {:?} port {}",
                    source.category, source.id, target.category, target.id
                ),
            ));
        }
        Ok(())
    }
}

/// The candidate edge must not close a loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleCheck;

impl ConnectionCheck for CycleCheck {
    fn name(&self) -> &'static str {
        "cycle"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let adjacency = input.doc.adjacency();
        if let Some(cycle) = find_cycle_with(&adjacency, &input.ctx.source, &input.ctx.target) {
            let path = cycle
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            report.push(
                ValidationIssue::error(
                    IssueKind::CycleDetected,
                    format!("connection would create a cycle: {}", path),
                )
                .on(&input.ctx.source),
            );
        }
        Ok(())
    }
}

/// Fields the target consumes should be produced by the source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaCheck;

impl ConnectionCheck for SchemaCheck {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault> {
        let (Some(produced), Some(consumed)) = (&input.source.schema, &input.target.schema) else {
            return Ok(());
        };
        let missing: Vec<&str> = consumed
            .inputs
            .iter()
            .filter(|field| !produced.outputs.contains(field))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            report.push(
                ValidationIssue::warning(
                    IssueKind::SchemaMismatch,
                    format!(
                        "node {} does not provide field(s) {} required by {}",
                        input.source.id,
                        missing.join(", "),
                        input.target.id
                    ),
                )
                .on(&input.target.id),
            );
        }
        Ok(())
    }
}
