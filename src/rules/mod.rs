//! Connection validation.
//!
//! [`ConnectionRuleEngine`] checks a prospective edge against the committed
//! document and returns a [`ValidationReport`]. It never fails with an
//! `Err`; every problem, including faults inside a check, becomes an issue
//! in the report.
//!
//! Checks run in a fixed order:
//!
//! 1. structural (ids present, no self connection, both nodes exist)
//! 2. duplicate edge (warning)
//! 3. node kind compatibility
//! 4. node capacity
//! 5. port direction and capacity
//! 6. port category compatibility
//! 7. cycle detection
//! 8. data schema compatibility (warning)
//!
//! Structural failures stop the run; later checks accumulate.
//!
//! # Example
//!
//! ```ignore
//! let engine = ConnectionRuleEngine::new(RuleConfig::default());
//! let report = engine.validate(&doc, &ConnectionContext::new("sms_1", "end_1"));
//! if !report.is_valid {
//!     eprintln!("cannot connect: {}", report.reason().unwrap_or_default());
//! }
//! ```

mod checks;
pub mod cycle;
mod tables;

pub use checks::{
    CapacityCheck, CycleCheck, DuplicateCheck, NodeKindCheck, PortCompatibilityCheck,
    PortDirectionCheck, SchemaCheck,
};
pub use tables::{ConnectionLimits, LimitSource, RuleTables};

use crate::config::RuleConfig;
use crate::document::FlowDocument;
use crate::model::{BranchId, EdgeId, Node, NodeId, NodeKind, PortId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, error};

/// A prospective edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub source: NodeId,
    pub target: NodeId,
    pub source_port: Option<PortId>,
    pub target_port: Option<PortId>,
    pub branch_id: Option<BranchId>,
    /// An existing edge being re-validated; it does not count as its own duplicate.
    pub edge_id: Option<EdgeId>,
}

impl ConnectionContext {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
            branch_id: None,
            edge_id: None,
        }
    }

    pub fn with_ports(mut self, source_port: impl Into<PortId>, target_port: impl Into<PortId>) -> Self {
        self.source_port = Some(source_port.into());
        self.target_port = Some(target_port.into());
        self
    }

    pub fn with_source_port(mut self, port: impl Into<PortId>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<BranchId>) -> Self {
        self.branch_id = Some(branch.into());
        self
    }

    pub fn excluding(mut self, edge: impl Into<EdgeId>) -> Self {
        self.edge_id = Some(edge.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Error taxonomy of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueCategory {
    Structural,
    Capacity,
    Compatibility,
    Cycle,
    Duplicate,
    SchemaMismatch,
    ValidationException,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueKind {
    MissingSourceId,
    MissingTargetId,
    SelfConnection,
    SourceNotFound,
    TargetNotFound,
    DuplicateConnection,
    SourceCannotConnect,
    TargetCannotReceive,
    IncompatibleNodeKinds,
    UnknownNodeKind,
    SplitToSplit,
    OutgoingLimitReached,
    IncomingLimitReached,
    OutgoingNearLimit,
    IncomingNearLimit,
    PortNotFound,
    PortDirection,
    PortCapacity,
    PortTypeMismatch,
    CycleDetected,
    SchemaMismatch,
    ValidationException,
    BatchValidationError,
}

impl IssueKind {
    pub fn category(self) -> IssueCategory {
        use IssueKind::*;
        match self {
            MissingSourceId | MissingTargetId | SelfConnection | SourceNotFound | TargetNotFound => {
                IssueCategory::Structural
            }
            DuplicateConnection => IssueCategory::Duplicate,
            SourceCannotConnect | TargetCannotReceive | IncompatibleNodeKinds | UnknownNodeKind
            | SplitToSplit | PortNotFound | PortDirection | PortTypeMismatch => {
                IssueCategory::Compatibility
            }
            OutgoingLimitReached | IncomingLimitReached | OutgoingNearLimit | IncomingNearLimit
            | PortCapacity => IssueCategory::Capacity,
            CycleDetected => IssueCategory::Cycle,
            SchemaMismatch => IssueCategory::SchemaMismatch,
            ValidationException | BatchValidationError => IssueCategory::ValidationException,
        }
    }

    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        use IssueKind::*;
        match self {
            MissingSourceId => "MISSING_SOURCE_ID",
            MissingTargetId => "MISSING_TARGET_ID",
            SelfConnection => "SELF_CONNECTION",
            SourceNotFound => "SOURCE_NOT_FOUND",
            TargetNotFound => "TARGET_NOT_FOUND",
            DuplicateConnection => "DUPLICATE_CONNECTION",
            SourceCannotConnect => "SOURCE_CANNOT_CONNECT",
            TargetCannotReceive => "TARGET_CANNOT_RECEIVE",
            IncompatibleNodeKinds => "INCOMPATIBLE_NODE_TYPES",
            UnknownNodeKind => "UNKNOWN_NODE_TYPE",
            SplitToSplit => "SPLIT_TO_SPLIT",
            OutgoingLimitReached => "OUTGOING_LIMIT_REACHED",
            IncomingLimitReached => "INCOMING_LIMIT_REACHED",
            OutgoingNearLimit => "OUTGOING_NEAR_LIMIT",
            IncomingNearLimit => "INCOMING_NEAR_LIMIT",
            PortNotFound => "PORT_NOT_FOUND",
            PortDirection => "PORT_DIRECTION",
            PortCapacity => "PORT_CAPACITY",
            PortTypeMismatch => "PORT_TYPE_MISMATCH",
            CycleDetected => "CYCLE_DETECTED",
            SchemaMismatch => "SCHEMA_MISMATCH",
            ValidationException => "VALIDATION_EXCEPTION",
            BatchValidationError => "BATCH_VALIDATION_ERROR",
        }
    }
}

/// One finding of a validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    /// The node the issue is about, when there is one.
    pub node: Option<NodeId>,
}

impl ValidationIssue {
    pub fn error(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            node: None,
        }
    }

    pub fn warning(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(kind, message)
        }
    }

    pub fn critical(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            ..Self::error(kind, message)
        }
    }

    pub fn on(mut self, node: &NodeId) -> Self {
        self.node = Some(node.clone());
        self
    }

    pub fn category(&self) -> IssueCategory {
        self.kind.category()
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

/// Outcome of validating one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue; anything above a warning invalidates the report.
    pub fn push(&mut self, issue: ValidationIssue) {
        if issue.severity == Severity::Warning {
            self.warnings.push(issue);
        } else {
            self.is_valid = false;
            self.errors.push(issue);
        }
    }

    pub fn has(&self, kind: IssueKind) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|i| i.kind == kind)
    }

    pub fn has_error_in(&self, category: IssueCategory) -> bool {
        self.errors.iter().any(|i| i.category() == category)
    }

    pub fn has_warning_in(&self, category: IssueCategory) -> bool {
        self.warnings.iter().any(|i| i.category() == category)
    }

    pub fn is_critical(&self) -> bool {
        self.errors.iter().any(|i| i.severity == Severity::Critical)
    }

    /// Human-readable reason for rejection, joining all error messages.
    pub fn reason(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|i| i.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Everything a check may look at.
pub struct CheckInput<'a> {
    pub ctx: &'a ConnectionContext,
    pub doc: &'a FlowDocument,
    pub source: &'a Node,
    pub target: &'a Node,
    pub tables: &'a RuleTables,
    pub config: &'a RuleConfig,
}

/// An internal failure of a check, as opposed to a rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CheckFault(pub String);

/// A fault reported through the side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub check: &'static str,
    pub source: NodeId,
    pub target: NodeId,
    pub message: String,
}

/// One validation rule.
///
/// Implement this to add domain rules on top of the built-in ones; see
/// [`ConnectionRuleEngine::with_check`].
pub trait ConnectionCheck {
    fn name(&self) -> &'static str;

    /// Push issues into `report`. Return `Err` only for internal faults.
    fn check(&self, input: &CheckInput<'_>, report: &mut ValidationReport) -> Result<(), CheckFault>;
}

type FaultReporter = Box<dyn Fn(&FaultReport)>;

/// Validates prospective edges against the committed document.
pub struct ConnectionRuleEngine {
    config: RuleConfig,
    tables: RuleTables,
    checks: Vec<Box<dyn ConnectionCheck>>,
    fault_reporter: Option<FaultReporter>,
}

impl Default for ConnectionRuleEngine {
    fn default() -> Self {
        Self::new(RuleConfig::default())
    }
}

impl ConnectionRuleEngine {
    /// Engine with the marketing rule tables and all built-in checks the
    /// configuration enables.
    pub fn new(config: RuleConfig) -> Self {
        let tables = RuleTables::marketing(ConnectionLimits::new(
            config.default_max_incoming,
            config.default_max_outgoing,
        ));
        let mut checks: Vec<Box<dyn ConnectionCheck>> = vec![
            Box::new(DuplicateCheck),
            Box::new(NodeKindCheck),
            Box::new(CapacityCheck),
        ];
        if config.check_ports {
            checks.push(Box::new(PortDirectionCheck));
            checks.push(Box::new(PortCompatibilityCheck));
        }
        if config.check_cycles {
            checks.push(Box::new(CycleCheck));
        }
        if config.check_schema {
            checks.push(Box::new(SchemaCheck));
        }
        Self {
            config,
            tables,
            checks,
            fault_reporter: None,
        }
    }

    pub fn with_tables(mut self, tables: RuleTables) -> Self {
        self.tables = tables;
        self
    }

    /// Append a check; it runs after the built-in ones.
    pub fn with_check<C: ConnectionCheck + 'static>(mut self, check: C) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Install the side channel that receives internal check faults.
    pub fn on_fault<F: Fn(&FaultReport) + 'static>(&mut self, reporter: F) {
        self.fault_reporter = Some(Box::new(reporter));
    }

    pub fn tables(&self) -> &RuleTables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut RuleTables {
        &mut self.tables
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    pub fn validate(&self, doc: &FlowDocument, ctx: &ConnectionContext) -> ValidationReport {
        let mut report = ValidationReport::new();

        let Some((source, target)) = self.resolve_endpoints(doc, ctx, &mut report) else {
            debug!(source = %ctx.source, target = %ctx.target, "connection rejected by structural check");
            return report;
        };

        let input = CheckInput {
            ctx,
            doc,
            source,
            target,
            tables: &self.tables,
            config: &self.config,
        };
        for check in &self.checks {
            let outcome = catch_unwind(AssertUnwindSafe(|| check.check(&input, &mut report)));
            let (fault, verb) = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(fault)) => (fault, "failed"),
                Err(panic) => (CheckFault(panic_message(panic.as_ref())), "panicked"),
            };
            self.report_fault(check.name(), ctx, &fault);
            report.push(ValidationIssue::critical(
                IssueKind::ValidationException,
                format!("validation check `{}` {}: {}", check.name(), verb, fault),
            ));
        }

        debug!(
            source = %ctx.source,
            target = %ctx.target,
            valid = report.is_valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "connection validated"
        );
        report
    }

    /// Validate each context independently.
    ///
    /// A check that panics only spoils its own entry, which becomes a
    /// critical batch-validation error.
    pub fn validate_multiple(&self, doc: &FlowDocument, contexts: &[ConnectionContext]) -> Vec<ValidationReport> {
        contexts
            .iter()
            .map(|ctx| {
                catch_unwind(AssertUnwindSafe(|| self.validate(doc, ctx))).unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    self.report_fault("batch", ctx, &CheckFault(message.clone()));
                    let mut report = ValidationReport::new();
                    report.push(ValidationIssue::critical(
                        IssueKind::BatchValidationError,
                        format!(
                            "validation of {} -> {} aborted: {}",
                            ctx.source, ctx.target, message
                        ),
                    ));
                    report
                })
            })
            .collect()
    }

    /// Whether the kind table lets `source` connect to `target` at all.
    pub fn can_connect_kinds(&self, source: &NodeKind, target: &NodeKind) -> bool {
        if source.is_terminal() || target.is_source_only() {
            return false;
        }
        self.tables
            .allowed_targets(source)
            .map_or(true, |allowed| allowed.contains(target) || !self.tables.is_known(target))
    }

    /// Per-node limit usage over the whole document.
    pub fn limit_report(&self, doc: &FlowDocument) -> LimitReport {
        let ratio = self.config.near_limit_ratio;
        let mut report = LimitReport::default();
        for node in doc.nodes() {
            let (limits, _) = self.tables.limits_for(node);
            let outgoing = doc.outgoing_count(node.id.as_str());
            let incoming = doc.incoming_count(node.id.as_str());
            let mut status = NodeLimitStatus {
                node: node.id.clone(),
                outgoing,
                incoming,
                limits,
                violations: Vec::new(),
                warnings: Vec::new(),
            };
            for (label, count, max) in [
                ("outgoing", outgoing, limits.max_outgoing),
                ("incoming", incoming, limits.max_incoming),
            ] {
                if count > max {
                    status
                        .violations
                        .push(format!("{} connections {} exceed limit {}", label, count, max));
                } else if max > 0 && count as f64 >= max as f64 * ratio {
                    status
                        .warnings
                        .push(format!("{} connections {} of {} in use", label, count, max));
                }
            }
            report.total_violations += status.violations.len();
            report.total_warnings += status.warnings.len();
            report.nodes.push(status);
        }
        report
    }

    fn resolve_endpoints<'d>(
        &self,
        doc: &'d FlowDocument,
        ctx: &ConnectionContext,
        report: &mut ValidationReport,
    ) -> Option<(&'d Node, &'d Node)> {
        if ctx.source.is_blank() {
            report.push(ValidationIssue::error(IssueKind::MissingSourceId, "source node id is empty"));
        }
        if ctx.target.is_blank() {
            report.push(ValidationIssue::error(IssueKind::MissingTargetId, "target node id is empty"));
        }
        if !report.is_valid {
            return None;
        }
        if ctx.source == ctx.target {
            report.push(
                ValidationIssue::error(
                    IssueKind::SelfConnection,
                    format!("node {} cannot connect to itself", ctx.source),
                )
                .on(&ctx.source),
            );
            return None;
        }

        let source = doc.node(ctx.source.as_str());
        let target = doc.node(ctx.target.as_str());
        if source.is_none() {
            report.push(
                ValidationIssue::error(
                    IssueKind::SourceNotFound,
                    format!("source node {} does not exist", ctx.source),
                )
                .on(&ctx.source),
            );
        }
        if target.is_none() {
            report.push(
                ValidationIssue::error(
                    IssueKind::TargetNotFound,
                    format!("target node {} does not exist", ctx.target),
                )
                .on(&ctx.target),
            );
        }
        Some((source?, target?))
    }

    fn report_fault(&self, check: &'static str, ctx: &ConnectionContext, fault: &CheckFault) {
        error!(check, source = %ctx.source, target = %ctx.target, fault = %fault, "validation check faulted");
        if let Some(reporter) = &self.fault_reporter {
            reporter(&FaultReport {
                check,
                source: ctx.source.clone(),
                target: ctx.target.clone(),
                message: fault.0.clone(),
            });
        }
    }
}

/// Limit usage of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLimitStatus {
    pub node: NodeId,
    pub outgoing: usize,
    pub incoming: usize,
    pub limits: ConnectionLimits,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitReport {
    pub nodes: Vec<NodeLimitStatus>,
    pub total_violations: usize,
    pub total_warnings: usize,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
