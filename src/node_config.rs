//! Node configuration gate.
//!
//! [`NodeConfigValidator`] decides whether a node is configured well enough
//! to take part in preview-edge generation. It runs four ordered steps:
//!
//! | step | severity | weight |
//! |------|----------|--------|
//! | basic structure (id, kind, name, position) | critical | 20 |
//! | business configuration coverage | critical below half, else advisory | 40 |
//! | configuration completeness | critical | 30 |
//! | preview eligibility | advisory | 10 |
//!
//! The 0-100 score is diagnostic only. Results are memoized per
//! (node id, kind, configuration hash) for a bounded time.

use crate::config::NodeValidationConfig;
use crate::document::FlowDocument;
use crate::model::{Node, NodeId, NodeKind};
use crate::schedule::SharedClock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Window of [`ValidatorStats::recent_success_rate`].
const RECENT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStep {
    BasicStructure,
    BusinessConfiguration,
    ConfigurationCompleteness,
    PreviewEligibility,
}

impl ValidationStep {
    pub fn weight(self) -> f64 {
        match self {
            ValidationStep::BasicStructure => 20.0,
            ValidationStep::BusinessConfiguration => 40.0,
            ValidationStep::ConfigurationCompleteness => 30.0,
            ValidationStep::PreviewEligibility => 10.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStep::BasicStructure => "basic-structure",
            ValidationStep::BusinessConfiguration => "business-configuration",
            ValidationStep::ConfigurationCompleteness => "configuration-completeness",
            ValidationStep::PreviewEligibility => "preview-eligibility",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step: ValidationStep,
    pub passed: bool,
    /// A failed critical step makes the node invalid.
    pub critical: bool,
    pub message: String,
}

/// Verdict on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValidation {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub valid: bool,
    pub message: String,
    pub score: u8,
    pub eligible: bool,
    pub should_generate_preview_line: bool,
    /// Share of required fields filled in, 0-100.
    pub configuration_completeness: f64,
    pub steps: Vec<StepResult>,
}

impl NodeValidation {
    pub fn step(&self, step: ValidationStep) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    node: NodeId,
    kind: String,
    config_hash: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    result: NodeValidation,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    at: Instant,
    valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ValidatorStats {
    pub total_validations: usize,
    pub cache_hits: usize,
    pub cache_size: usize,
    pub recent_validations: usize,
    /// Share of valid results among recent validations, 0-100.
    pub recent_success_rate: f64,
}

pub struct NodeConfigValidator {
    config: NodeValidationConfig,
    clock: SharedClock,
    cache: HashMap<CacheKey, CacheEntry>,
    history: VecDeque<HistoryEntry>,
    total_validations: usize,
    cache_hits: usize,
}

impl NodeConfigValidator {
    pub fn new(config: NodeValidationConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            cache: HashMap::new(),
            history: VecDeque::new(),
            total_validations: 0,
            cache_hits: 0,
        }
    }

    /// Validate `node`, reusing a fresh memoized verdict when available.
    pub fn validate_node(&mut self, node: &Node, doc: &FlowDocument) -> NodeValidation {
        let now = self.clock.now();
        let key = CacheKey {
            node: node.id.clone(),
            kind: node.kind.to_string(),
            config_hash: node.config.content_hash(),
        };
        if let Some(entry) = self.cache.get(&key) {
            if now.duration_since(entry.stored_at) < self.config.cache_ttl() {
                self.cache_hits += 1;
                trace!(node = %node.id, "node validation served from cache");
                return entry.result.clone();
            }
        }

        let result = self.evaluate(node, doc);
        debug!(
            node = %node.id,
            valid = result.valid,
            score = result.score,
            preview = result.should_generate_preview_line,
            "node validated"
        );

        self.total_validations += 1;
        self.record_history(now, result.valid);
        self.cache.insert(
            key,
            CacheEntry {
                stored_at: now,
                result: result.clone(),
            },
        );
        if self.cache.len() > self.config.cache_capacity {
            self.purge_stale(now);
        }
        result
    }

    /// Shorthand for the preview gate.
    pub fn should_generate_preview_line(&mut self, node: &Node, doc: &FlowDocument) -> bool {
        self.validate_node(node, doc).should_generate_preview_line
    }

    /// Forget memoized verdicts of `node`, e.g. after its edges changed.
    pub fn invalidate(&mut self, node: &str) {
        self.cache.retain(|key, _| key.node.as_str() != node);
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> ValidatorStats {
        let now = self.clock.now();
        let recent: Vec<&HistoryEntry> = self
            .history
            .iter()
            .filter(|h| now.duration_since(h.at) <= RECENT_WINDOW)
            .collect();
        let passed = recent.iter().filter(|h| h.valid).count();
        ValidatorStats {
            total_validations: self.total_validations,
            cache_hits: self.cache_hits,
            cache_size: self.cache.len(),
            recent_validations: recent.len(),
            recent_success_rate: if recent.is_empty() {
                0.0
            } else {
                passed as f64 * 100.0 / recent.len() as f64
            },
        }
    }

    fn evaluate(&self, node: &Node, doc: &FlowDocument) -> NodeValidation {
        let required = node.config.required_fields();
        let total = required.len();
        let present = required.iter().filter(|(_, filled)| *filled).count();
        let coverage = if total == 0 {
            100.0
        } else {
            present as f64 * 100.0 / total as f64
        };
        let actually_configured = total == 0 || present >= (total + 1) / 2;

        let mut steps = Vec::with_capacity(4);

        // basic structure
        let mut missing_basic = Vec::new();
        if node.id.is_blank() {
            missing_basic.push("id");
        }
        if node.kind.as_str().trim().is_empty() {
            missing_basic.push("type");
        }
        if node.name.trim().is_empty() {
            missing_basic.push("name");
        }
        if !node.position.is_finite() {
            missing_basic.push("position");
        }
        steps.push(StepResult {
            step: ValidationStep::BasicStructure,
            passed: missing_basic.is_empty(),
            critical: !missing_basic.is_empty(),
            message: if missing_basic.is_empty() {
                "basic structure complete".into()
            } else {
                format!("missing basic field(s): {}", missing_basic.join(", "))
            },
        });

        // business configuration coverage
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, filled)| !*filled)
            .map(|(name, _)| *name)
            .collect();
        let business_critical = missing.len() > total / 2;
        steps.push(StepResult {
            step: ValidationStep::BusinessConfiguration,
            passed: missing.is_empty(),
            critical: business_critical,
            message: if missing.is_empty() {
                "business configuration complete".into()
            } else if business_critical {
                format!("business configuration missing: {}", missing.join(", "))
            } else {
                format!("business configuration partially complete, missing: {}", missing.join(", "))
            },
        });

        // configuration completeness
        let structural_only = total > 0 && !node.config.has_business_data();
        let contradiction = node.is_configured != actually_configured;
        let completeness_message = if structural_only {
            "node carries only structural data".to_owned()
        } else if contradiction && node.is_configured {
            format!("node is marked configured but only {:.0}% of required fields are set", coverage)
        } else if contradiction {
            "node is marked unconfigured but its required fields are set".to_owned()
        } else {
            "configuration state consistent".to_owned()
        };
        let completeness_ok = !structural_only && !contradiction;
        steps.push(StepResult {
            step: ValidationStep::ConfigurationCompleteness,
            passed: completeness_ok,
            critical: !completeness_ok,
            message: completeness_message,
        });

        // preview eligibility
        let min_len = self.config.min_content_length;
        let has_content = match node.config.business_content() {
            None => true,
            Some(fields) => fields.iter().any(|f| f.trim().chars().count() > min_len),
        };
        let has_relation = node.kind.is_source_only() || doc.relations(node.id.as_str()).is_connected();
        let eligible = actually_configured && has_content && has_relation;
        let mut reasons = Vec::new();
        if !actually_configured {
            reasons.push("not sufficiently configured");
        }
        if !has_content {
            reasons.push("no substantial business content");
        }
        if !has_relation {
            reasons.push("no structural relationship");
        }
        steps.push(StepResult {
            step: ValidationStep::PreviewEligibility,
            passed: eligible,
            critical: false,
            message: if eligible {
                "eligible for preview lines".into()
            } else {
                format!("not eligible for preview lines: {}", reasons.join(", "))
            },
        });

        let valid = steps.iter().all(|s| s.passed || !s.critical);
        let score: f64 = steps
            .iter()
            .map(|s| {
                if s.passed {
                    s.step.weight()
                } else if s.step == ValidationStep::BusinessConfiguration {
                    s.step.weight() * coverage / 100.0
                } else {
                    0.0
                }
            })
            .sum();

        let message = if valid {
            match steps.iter().find(|s| !s.passed) {
                Some(advisory) => format!("valid with warnings: {}", advisory.message),
                None => "node configuration is valid".to_owned(),
            }
        } else {
            steps
                .iter()
                .find(|s| !s.passed && s.critical)
                .map(|s| s.message.clone())
                .unwrap_or_default()
        };

        NodeValidation {
            node_id: node.id.clone(),
            kind: node.kind.clone(),
            valid,
            message,
            score: score.round().clamp(0.0, 100.0) as u8,
            eligible,
            should_generate_preview_line: valid && eligible,
            configuration_completeness: coverage,
            steps,
        }
    }

    fn record_history(&mut self, at: Instant, valid: bool) {
        self.history.push_back(HistoryEntry { at, valid });
        let limit = self.config.history_limit.max(2);
        if self.history.len() > limit {
            let keep = limit / 2;
            let drop = self.history.len() - keep;
            self.history.drain(..drop);
        }
    }

    fn purge_stale(&mut self, now: Instant) {
        let max_age = self.config.cache_ttl() * 2;
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| now.duration_since(entry.stored_at) <= max_age);
        trace!(removed = before - self.cache.len(), "purged stale node validations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AiCallConfig, Endpoint, NodeConfig, Point, WaitConfig};
    use crate::schedule::ManualClock;
    use std::rc::Rc;

    fn validator() -> (NodeConfigValidator, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::new());
        let validator = NodeConfigValidator::new(NodeValidationConfig::default(), clock.clone());
        (validator, clock)
    }

    fn full_ai_call() -> AiCallConfig {
        AiCallConfig {
            call_script: Some("Hi, we noticed you left items in your cart".into()),
            call_strategy: Some("friendly".into()),
            target_audience: Some("cart abandoners".into()),
            call_timing: Some("weekday evenings".into()),
            success_criteria: Some("order placed".into()),
            ..Default::default()
        }
    }

    fn connected_doc(node: Node) -> FlowDocument {
        let mut doc = FlowDocument::new();
        doc.add_node(Node::new("start", NodeKind::Start, "Start", Point::ORIGIN))
            .unwrap();
        let id = node.id.clone();
        doc.add_node(node).unwrap();
        doc.add_edge(Endpoint::node("start"), Endpoint::node(id.as_str()), None)
            .unwrap();
        doc
    }

    #[test]
    fn test_fully_configured_node_gets_full_score() {
        let (mut validator, _) = validator();
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(full_ai_call()))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());

        let result = validator.validate_node(&node, &doc);
        assert!(result.valid, "{}", result.message);
        assert_eq!(result.score, 100);
        assert!(result.should_generate_preview_line);
    }

    #[test]
    fn test_fresh_node_is_structural_only() {
        let (mut validator, _) = validator();
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN);
        let doc = connected_doc(node.clone());

        let result = validator.validate_node(&node, &doc);
        assert!(!result.valid);
        assert!(!result.should_generate_preview_line);
        let completeness = result.step(ValidationStep::ConfigurationCompleteness).unwrap();
        assert!(!completeness.passed);
        // basic structure only
        assert_eq!(result.score, 20);
    }

    #[test]
    fn test_partial_configuration_is_advisory() {
        let (mut validator, _) = validator();
        let config = AiCallConfig {
            success_criteria: None,
            call_timing: None,
            ..full_ai_call()
        };
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(config))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());

        let result = validator.validate_node(&node, &doc);
        assert!(result.valid, "{}", result.message);
        let business = result.step(ValidationStep::BusinessConfiguration).unwrap();
        assert!(!business.passed);
        assert!(!business.critical);
        assert_eq!(result.configuration_completeness, 60.0);
        // 20 + 40 * 0.6 + 30 + 10
        assert_eq!(result.score, 84);
    }

    #[test]
    fn test_configured_flag_contradiction_is_critical() {
        let (mut validator, _) = validator();
        let config = AiCallConfig {
            call_script: Some("Short".into()),
            ..Default::default()
        };
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(config))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());

        let result = validator.validate_node(&node, &doc);
        assert!(!result.valid);
        let completeness = result.step(ValidationStep::ConfigurationCompleteness).unwrap();
        assert!(completeness.critical);
        assert!(completeness.message.contains("marked configured"));
    }

    #[test]
    fn test_unrelated_node_is_not_eligible() {
        let (mut validator, _) = validator();
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(full_ai_call()))
            .unwrap()
            .configured(true);
        let mut doc = FlowDocument::new();
        doc.add_node(node.clone()).unwrap();

        let result = validator.validate_node(&node, &doc);
        assert!(result.valid);
        assert!(!result.eligible);
        assert!(!result.should_generate_preview_line);
        assert_eq!(result.score, 90);
    }

    #[test]
    fn test_short_script_is_not_eligible() {
        let (mut validator, _) = validator();
        let config = AiCallConfig {
            call_script: Some("Hello".into()),
            call_strategy: Some("direct".into()),
            target_audience: Some("vip".into()),
            ..full_ai_call()
        };
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(config))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());

        let result = validator.validate_node(&node, &doc);
        assert!(result.valid);
        assert!(!result.eligible);
    }

    #[test]
    fn test_kind_without_content_field_is_eligible() {
        let (mut validator, _) = validator();
        let node = Node::new("wait", NodeKind::Wait, "Wait", Point::ORIGIN)
            .with_config(NodeConfig::Wait(WaitConfig {
                duration_minutes: Some(60),
                until: None,
            }))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());
        assert!(validator.should_generate_preview_line(&node, &doc));
    }

    #[test]
    fn test_results_are_memoized_until_ttl() {
        let (mut validator, clock) = validator();
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(full_ai_call()))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());

        validator.validate_node(&node, &doc);
        validator.validate_node(&node, &doc);
        assert_eq!(validator.stats().cache_hits, 1);
        assert_eq!(validator.stats().total_validations, 1);

        clock.advance(Duration::from_secs(31));
        validator.validate_node(&node, &doc);
        assert_eq!(validator.stats().total_validations, 2);

        validator.invalidate("call");
        validator.validate_node(&node, &doc);
        assert_eq!(validator.stats().total_validations, 3);
    }

    #[test]
    fn test_config_change_misses_cache() {
        let (mut validator, _) = validator();
        let node = Node::new("call", NodeKind::AiCall, "Call", Point::ORIGIN)
            .with_config(NodeConfig::AiCall(full_ai_call()))
            .unwrap()
            .configured(true);
        let doc = connected_doc(node.clone());
        validator.validate_node(&node, &doc);

        let changed = node
            .clone()
            .with_config(NodeConfig::AiCall(AiCallConfig {
                retry_policy: Some("twice".into()),
                ..full_ai_call()
            }))
            .unwrap();
        validator.validate_node(&changed, &doc);
        assert_eq!(validator.stats().cache_hits, 0);
        assert_eq!(validator.stats().total_validations, 2);
        assert_eq!(validator.stats().recent_success_rate, 100.0);
    }

    #[test]
    fn test_blank_name_fails_basic_structure() {
        let (mut validator, _) = validator();
        let node = Node::new("wait", NodeKind::Wait, " ", Point::new(f64::NAN, 0.0));
        let doc = connected_doc(node.clone());
        let result = validator.validate_node(&node, &doc);
        let basic = result.step(ValidationStep::BasicStructure).unwrap();
        assert!(!basic.passed);
        assert!(basic.message.contains("name"));
        assert!(basic.message.contains("position"));
    }
}
