//! Drag and connection state machine.
//!
//! [`DragStateMachine`] owns the single drag session of a canvas and walks
//! it through a fixed transition table:
//!
//! ```text
//! Idle         -> Dragging | Error
//! Dragging     -> Snapping | Connecting | CreatingNode | Idle | Error
//! Snapping     -> Dragging | Connecting | CreatingNode | Idle | Error
//! Connecting   -> Idle | Error
//! CreatingNode -> Idle | Error
//! Error        -> Recovering | Idle
//! Recovering   -> Idle | Error
//! ```
//!
//! Rejected transitions return `false` and change nothing. Errors schedule
//! a recovery that runs from [`DragStateMachine::poll`], so the host must
//! call `poll` from its event loop (a Slint `Timer` works well).
//!
//! ```ignore
//! let machine = Rc::new(RefCell::new(DragStateMachine::new(config.drag, clock)));
//! machine.borrow().events().subscribe(|event| tracing::debug!(?event));
//! machine.borrow_mut().start_drag(DragType::PreviewLine, source, pointer);
//! ```

use crate::config::DragConfig;
use crate::error::GraphError;
use crate::events::{EventBus, SubscriptionId};
use crate::model::{BranchId, EdgeId, Endpoint, NodeId, NodeKind, Point};
use crate::schedule::{Scheduler, SharedClock};
use crate::snap::SnapTarget;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lock taken by [`DragStateMachine::start_drag`].
pub const DRAG_START_LOCK: &str = "drag_start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DragState {
    Idle,
    Dragging,
    Snapping,
    Connecting,
    CreatingNode,
    Error,
    Recovering,
}

impl DragState {
    pub fn as_str(self) -> &'static str {
        match self {
            DragState::Idle => "idle",
            DragState::Dragging => "dragging",
            DragState::Snapping => "snapping",
            DragState::Connecting => "connecting",
            DragState::CreatingNode => "creating_node",
            DragState::Error => "error",
            DragState::Recovering => "recovering",
        }
    }

    /// States that represent user-driven progress and are throttled.
    pub fn is_engaging(self) -> bool {
        matches!(
            self,
            DragState::Dragging | DragState::Snapping | DragState::Connecting | DragState::CreatingNode
        )
    }

    pub fn allowed_targets(self) -> &'static [DragState] {
        use DragState::*;
        match self {
            Idle => &[Dragging, Error],
            Dragging => &[Snapping, Connecting, CreatingNode, Idle, Error],
            Snapping => &[Dragging, Connecting, CreatingNode, Idle, Error],
            Connecting => &[Idle, Error],
            CreatingNode => &[Idle, Error],
            Error => &[Recovering, Idle],
            Recovering => &[Idle, Error],
        }
    }

    pub fn can_transition_to(self, target: DragState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for DragState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragType {
    Node,
    Edge,
    PreviewLine,
}

/// What a drag started from.
#[derive(Debug, Clone, PartialEq)]
pub struct DragSource {
    pub endpoint: Endpoint,
    pub branch_id: Option<BranchId>,
    /// The preview line following the pointer, if any.
    pub preview_line: Option<EdgeId>,
}

impl DragSource {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            branch_id: None,
            preview_line: None,
        }
    }

    pub fn with_branch(mut self, branch: Option<BranchId>) -> Self {
        self.branch_id = branch;
        self
    }

    pub fn with_preview_line(mut self, line: EdgeId) -> Self {
        self.preview_line = Some(line);
        self
    }
}

/// Where a node should be created when a drag ends on empty canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCreationRequest {
    pub position: Point,
    pub source: Endpoint,
    pub branch_id: Option<BranchId>,
    pub suggested_kind: Option<NodeKind>,
}

/// The active drag.
#[derive(Debug, Clone, PartialEq)]
pub struct DragSession {
    pub drag_type: DragType,
    pub source: DragSource,
    pub target: Option<Endpoint>,
    pub start: Point,
    pub current: Point,
    pub phase: DragState,
    pub snap_target: Option<SnapTarget>,
    pub creation: Option<NodeCreationRequest>,
    pub started_at: Instant,
}

/// How a drag finished.
#[derive(Debug, Clone, PartialEq)]
pub enum DragOutcome {
    Connected(EdgeId),
    Rejected(String),
    NodeCreated { node: NodeId, edge: EdgeId },
    Dropped,
}

/// Extra information attached to a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionContext {
    pub reason: Option<String>,
}

impl TransitionContext {
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub from: DragState,
    pub to: DragState,
    pub at: Instant,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DragEvent {
    StateChanged {
        from: DragState,
        to: DragState,
        reason: Option<String>,
    },
    DragStarted {
        drag_type: DragType,
        source: Endpoint,
    },
    DragMoved(Point),
    StartPositionSet(Point),
    SnapStarted(SnapTarget),
    ConnectStarted(Endpoint),
    NodeCreateStarted(NodeCreationRequest),
    DragEnded(DragOutcome),
    DragCancelled(String),
    Error(String),
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed(String),
}

/// Snapshot of the machine for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    pub current: DragState,
    pub previous: Option<DragState>,
    pub has_session: bool,
    pub is_idle: bool,
    pub is_dragging: bool,
    pub is_snapping: bool,
    pub is_connecting: bool,
    pub is_creating_node: bool,
    pub is_error: bool,
    pub is_recovering: bool,
}

/// Undoes whatever the host attached to a drag, e.g. its preview line.
pub type CleanupHook = Box<dyn FnMut() -> Result<(), GraphError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DragTask {
    Recovery,
}

pub struct DragStateMachine {
    config: DragConfig,
    clock: SharedClock,
    state: DragState,
    previous: Option<DragState>,
    session: Option<DragSession>,
    /// Lock key to expiry.
    locks: HashMap<String, Instant>,
    last_operation: Option<Instant>,
    history: VecDeque<TransitionRecord>,
    tasks: Scheduler<DragTask>,
    events: Rc<EventBus<DragEvent>>,
    /// Events held back for [`take_queued_events`](Self::take_queued_events).
    queued: Option<Vec<DragEvent>>,
    cleanup: Option<CleanupHook>,
    last_error: Option<String>,
}

impl DragStateMachine {
    pub fn new(config: DragConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: DragState::Idle,
            previous: None,
            session: None,
            locks: HashMap::new(),
            last_operation: None,
            history: VecDeque::new(),
            tasks: Scheduler::new(),
            events: Rc::new(EventBus::new()),
            queued: None,
            cleanup: None,
            last_error: None,
        }
    }

    pub fn set_cleanup_hook<F>(&mut self, hook: F)
    where
        F: FnMut() -> Result<(), GraphError> + 'static,
    {
        self.cleanup = Some(Box::new(hook));
    }

    pub fn events(&self) -> &EventBus<DragEvent> {
        &self.events
    }

    /// Shared handle to the event bus, for delivering queued events.
    pub fn event_bus(&self) -> Rc<EventBus<DragEvent>> {
        self.events.clone()
    }

    /// Hold events back instead of delivering them from inside the
    /// mutating call. Owners that keep the machine in a `RefCell` use this
    /// so listeners can read the machine again.
    pub fn queue_events(&mut self) {
        self.queued.get_or_insert_with(Vec::new);
    }

    /// Events held back since the last call, in emission order.
    pub fn take_queued_events(&mut self) -> Vec<DragEvent> {
        self.queued.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn emit(&mut self, event: DragEvent) {
        match self.queued.as_mut() {
            Some(queue) => queue.push(event),
            None => self.events.emit(&event),
        }
    }

    pub fn subscribe<F: Fn(&DragEvent) + 'static>(&self, listener: F) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Move to `target` if the table allows it, no lock named after the
    /// target is held, and engaging targets are not throttled.
    pub fn transition_to(&mut self, target: DragState, ctx: TransitionContext) -> bool {
        if !self.state.can_transition_to(target) {
            debug!(from = %self.state, to = %target, "transition not allowed");
            return false;
        }
        let now = self.clock.now();
        if self.is_locked_at(target.as_str(), now) {
            debug!(to = %target, "transition blocked by lock");
            return false;
        }
        if target.is_engaging() && self.is_throttled_at(now) {
            debug!(to = %target, "transition throttled");
            return false;
        }
        self.apply(target, ctx.reason, now);
        true
    }

    /// Whether an engaging transition would be refused right now for
    /// following the last locked operation too closely.
    pub fn is_throttled(&self) -> bool {
        self.is_throttled_at(self.clock.now())
    }

    fn is_throttled_at(&self, now: Instant) -> bool {
        let interval = self.config.min_operation_interval();
        self.last_operation
            .is_some_and(|last| now.duration_since(last) < interval)
    }

    fn apply(&mut self, target: DragState, reason: Option<String>, now: Instant) {
        let from = self.state;
        self.previous = Some(from);
        self.state = target;
        if let Some(session) = self.session.as_mut() {
            session.phase = target;
        }

        self.history.push_back(TransitionRecord {
            from,
            to: target,
            at: now,
            reason: reason.clone(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        if target == DragState::Idle {
            self.locks.clear();
            self.tasks.cancel(&DragTask::Recovery);
            self.session = None;
        }
        trace!(%from, to = %target, ?reason, "drag state changed");
        self.emit(DragEvent::StateChanged {
            from,
            to: target,
            reason,
        });
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Hold `key` until released or until `ttl` passes.
    pub fn acquire_lock(&mut self, key: &str, ttl: Duration) -> bool {
        let now = self.clock.now();
        if self.is_locked_at(key, now) {
            return false;
        }
        self.locks.insert(key.to_owned(), now + ttl);
        self.last_operation = Some(now);
        true
    }

    pub fn release_lock(&mut self, key: &str) -> bool {
        self.locks.remove(key).is_some()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.is_locked_at(key, self.clock.now())
    }

    fn is_locked_at(&self, key: &str, now: Instant) -> bool {
        self.locks.get(key).is_some_and(|expiry| now < *expiry)
    }

    // ------------------------------------------------------------------
    // Drag operations
    // ------------------------------------------------------------------

    /// Open a session and enter Dragging.
    pub fn start_drag(&mut self, drag_type: DragType, source: DragSource, at: Point) -> bool {
        if self.session.is_some() || self.is_locked(DRAG_START_LOCK) {
            debug!("drag start rejected, a drag is already active");
            return false;
        }
        let endpoint = source.endpoint.clone();
        if !self.transition_to(DragState::Dragging, TransitionContext::because("drag started")) {
            return false;
        }
        self.acquire_lock(DRAG_START_LOCK, self.config.lock_timeout());
        self.session = Some(DragSession {
            drag_type,
            source,
            target: None,
            start: at,
            current: at,
            phase: DragState::Dragging,
            snap_target: None,
            creation: None,
            started_at: self.clock.now(),
        });
        debug!(node = %endpoint.node, ?drag_type, "drag started");
        self.emit(DragEvent::DragStarted {
            drag_type,
            source: endpoint,
        });
        true
    }

    pub fn update_drag_position(&mut self, at: Point) -> bool {
        if !matches!(self.state, DragState::Dragging | DragState::Snapping) {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.current = at;
        self.emit(DragEvent::DragMoved(at));
        true
    }

    pub fn set_drag_start_position(&mut self, at: Point) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.start = at;
        self.emit(DragEvent::StartPositionSet(at));
        true
    }

    /// Enter Snapping, or move the snap target while already snapping.
    pub fn start_snapping(&mut self, target: SnapTarget) -> bool {
        if self.session.is_none() {
            return false;
        }
        if self.state != DragState::Snapping
            && !self.transition_to(DragState::Snapping, TransitionContext::because("snap target found"))
        {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.snap_target = Some(target.clone());
        }
        self.emit(DragEvent::SnapStarted(target));
        true
    }

    /// Leave Snapping for plain Dragging.
    pub fn stop_snapping(&mut self) -> bool {
        if self.state != DragState::Snapping {
            return false;
        }
        if !self.transition_to(DragState::Dragging, TransitionContext::because("snap target lost")) {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.snap_target = None;
        }
        true
    }

    pub fn start_connecting(&mut self, target: Endpoint) -> bool {
        if self.session.is_none()
            || !self.transition_to(DragState::Connecting, TransitionContext::because("connecting"))
        {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.target = Some(target.clone());
        }
        self.emit(DragEvent::ConnectStarted(target));
        true
    }

    pub fn start_creating_node(&mut self, request: NodeCreationRequest) -> bool {
        if self.session.is_none()
            || !self.transition_to(DragState::CreatingNode, TransitionContext::because("creating node"))
        {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.creation = Some(request.clone());
        }
        self.emit(DragEvent::NodeCreateStarted(request));
        true
    }

    /// Finish the drag. Ending while idle is a successful no-op.
    pub fn end_drag(&mut self, outcome: DragOutcome) -> bool {
        if self.state == DragState::Idle {
            return true;
        }
        if !self.transition_to(DragState::Idle, TransitionContext::because("drag ended")) {
            return false;
        }
        debug!(?outcome, "drag ended");
        self.emit(DragEvent::DragEnded(outcome));
        true
    }

    /// Abort whatever is in progress and return to Idle.
    ///
    /// The cleanup hook runs first; its failure is logged and does not stop
    /// the cancellation. Returns `false` when there was nothing to cancel.
    pub fn cancel_drag(&mut self, reason: &str) -> bool {
        if self.state == DragState::Idle && self.session.is_none() {
            return false;
        }
        self.run_cleanup_logged(reason);
        self.session = None;
        self.locks.clear();
        self.tasks.cancel(&DragTask::Recovery);
        if self.state != DragState::Idle {
            let now = self.clock.now();
            self.apply(DragState::Idle, Some(reason.to_owned()), now);
        }
        info!(reason, "drag cancelled");
        self.emit(DragEvent::DragCancelled(reason.to_owned()));
        true
    }

    fn run_cleanup_logged(&mut self, reason: &str) {
        if let Some(hook) = self.cleanup.as_mut() {
            if let Err(err) = hook() {
                warn!(reason, error = %err, "drag cleanup failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Errors and recovery
    // ------------------------------------------------------------------

    /// Enter Error and schedule a recovery after the recovery delay.
    pub fn handle_error(&mut self, message: impl Into<String>, ctx: TransitionContext) {
        let message = message.into();
        error!(state = %self.state, error = %message, "drag error");
        let now = self.clock.now();
        if self.state != DragState::Error {
            let reason = ctx.reason.or_else(|| Some(message.clone()));
            self.apply(DragState::Error, reason, now);
        }
        self.last_error = Some(message.clone());
        self.emit(DragEvent::Error(message));
        self.tasks
            .schedule(DragTask::Recovery, now + self.config.recovery_delay());
    }

    /// Run due tasks. Returns how many ran.
    pub fn poll(&mut self) -> usize {
        let due = self.tasks.take_due(self.clock.now());
        let count = due.len();
        for task in due {
            match task {
                DragTask::Recovery => self.recover(),
            }
        }
        count
    }

    /// When the next task is due, for host timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.next_deadline()
    }

    fn recover(&mut self) {
        if self.state != DragState::Error {
            trace!(state = %self.state, "recovery skipped");
            return;
        }
        self.transition_to(DragState::Recovering, TransitionContext::because("recovery"));
        if self.state != DragState::Recovering {
            return;
        }
        self.emit(DragEvent::RecoveryStarted);

        let cleanup = match self.cleanup.as_mut() {
            Some(hook) => hook(),
            None => Ok(()),
        };
        if let Err(err) = cleanup {
            let message = err.to_string();
            error!(error = %message, "drag recovery failed");
            self.last_error = Some(message.clone());
            self.emit(DragEvent::RecoveryFailed(message.clone()));
            self.transition_to(DragState::Error, TransitionContext::because(message));
            return;
        }

        self.session = None;
        self.locks.clear();
        self.transition_to(DragState::Idle, TransitionContext::because("recovered"));
        self.last_error = None;
        info!("drag recovered");
        self.emit(DragEvent::RecoveryCompleted);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> DragState {
        self.state
    }

    pub fn session(&self) -> Option<&DragSession> {
        self.session.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn state_info(&self) -> StateInfo {
        StateInfo {
            current: self.state,
            previous: self.previous,
            has_session: self.session.is_some(),
            is_idle: self.state == DragState::Idle,
            is_dragging: self.state == DragState::Dragging,
            is_snapping: self.state == DragState::Snapping,
            is_connecting: self.state == DragState::Connecting,
            is_creating_node: self.state == DragState::CreatingNode,
            is_error: self.state == DragState::Error,
            is_recovering: self.state == DragState::Recovering,
        }
    }
}
