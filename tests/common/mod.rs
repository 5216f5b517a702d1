//! Common test utilities for integration tests.

#![allow(dead_code)]

pub mod harness;

use slint_flow_canvas::model::{AiCallConfig, AudienceSplitConfig, SmsConfig, StartConfig, WaitConfig};
use slint_flow_canvas::{BranchDef, DragEvent, DragOutcome, DragState, NodeConfig};
use std::cell::RefCell;
use std::rc::Rc;

/// Records drag machine events for assertions.
///
/// Each field collects one kind of event, in emission order.
#[derive(Default, Clone)]
pub struct EventTracker {
    /// (from, to)
    pub transitions: Rc<RefCell<Vec<(DragState, DragState)>>>,
    pub outcomes: Rc<RefCell<Vec<DragOutcome>>>,
    pub cancellations: Rc<RefCell<Vec<String>>>,
    pub errors: Rc<RefCell<Vec<String>>>,
    /// Count of RecoveryCompleted events
    pub recoveries: Rc<RefCell<usize>>,
    pub recovery_failures: Rc<RefCell<Vec<String>>>,
    /// Count of SnapStarted events
    pub snaps: Rc<RefCell<usize>>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener feeding this tracker.
    pub fn listener(&self) -> impl Fn(&DragEvent) + 'static {
        let tracker = self.clone();
        move |event| match event {
            DragEvent::StateChanged { from, to, .. } => {
                tracker.transitions.borrow_mut().push((*from, *to))
            }
            DragEvent::DragEnded(outcome) => tracker.outcomes.borrow_mut().push(outcome.clone()),
            DragEvent::DragCancelled(reason) => {
                tracker.cancellations.borrow_mut().push(reason.clone())
            }
            DragEvent::Error(message) => tracker.errors.borrow_mut().push(message.clone()),
            DragEvent::RecoveryCompleted => *tracker.recoveries.borrow_mut() += 1,
            DragEvent::RecoveryFailed(message) => {
                tracker.recovery_failures.borrow_mut().push(message.clone())
            }
            DragEvent::SnapStarted(_) => *tracker.snaps.borrow_mut() += 1,
            _ => {}
        }
    }

    /// Target states of every recorded transition.
    pub fn states(&self) -> Vec<DragState> {
        self.transitions.borrow().iter().map(|(_, to)| *to).collect()
    }

    /// Clear all recorded events.
    pub fn clear(&self) {
        self.transitions.borrow_mut().clear();
        self.outcomes.borrow_mut().clear();
        self.cancellations.borrow_mut().clear();
        self.errors.borrow_mut().clear();
        *self.recoveries.borrow_mut() = 0;
        self.recovery_failures.borrow_mut().clear();
        *self.snaps.borrow_mut() = 0;
    }
}

// ============================================================================
// Configuration fixtures
// ============================================================================

pub fn start_config() -> NodeConfig {
    NodeConfig::Start(StartConfig {
        audience: Some("all members".into()),
        trigger: Some("signup".into()),
        start_time: None,
    })
}

pub fn sms_config() -> NodeConfig {
    NodeConfig::Sms(SmsConfig {
        template_id: Some("tpl-welcome".into()),
        content: Some("Welcome aboard, your coupon is waiting".into()),
        sign_name: Some("Shop".into()),
    })
}

pub fn wait_config(minutes: u32) -> NodeConfig {
    NodeConfig::Wait(WaitConfig {
        duration_minutes: Some(minutes),
        until: None,
    })
}

pub fn ai_call_config() -> NodeConfig {
    NodeConfig::AiCall(AiCallConfig {
        call_script: Some("Introduce the spring promotion and ask for feedback".into()),
        call_strategy: Some("friendly follow-up".into()),
        target_audience: Some("members inactive for 30 days".into()),
        call_timing: Some("weekdays 10:00-18:00".into()),
        success_criteria: Some("customer books a visit".into()),
        ..AiCallConfig::default()
    })
}

pub fn split_config(branches: &[(&str, &str)]) -> NodeConfig {
    NodeConfig::AudienceSplit(AudienceSplitConfig {
        branches: branches
            .iter()
            .map(|(id, label)| BranchDef::new(*id, *label))
            .collect(),
        rule: Some("lifetime spend above 1000".into()),
    })
}
