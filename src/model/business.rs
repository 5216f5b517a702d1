//! Typed business configuration of each node kind.
//!
//! Payloads arrive as loosely shaped JSON from forms and are decoded once,
//! when a node is created or reconfigured. Fields stay optional so coverage
//! of the required set can be measured by the node validator.

use super::{BranchId, NodeKind};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// One named output path of a splitting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDef {
    pub id: BranchId,
    #[serde(default)]
    pub label: String,
}

impl BranchDef {
    pub fn new(id: impl Into<BranchId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartConfig {
    pub audience: Option<String>,
    pub trigger: Option<String>,
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudienceSplitConfig {
    pub branches: Vec<BranchDef>,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventSplitConfig {
    pub event_name: Option<String>,
    pub wait_window_minutes: Option<u32>,
    pub branches: Vec<BranchDef>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbTestConfig {
    pub branches: Vec<BranchDef>,
    pub traffic_split: Option<Vec<u8>>,
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmsConfig {
    pub template_id: Option<String>,
    pub content: Option<String>,
    pub sign_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiCallConfig {
    pub call_script: Option<String>,
    pub call_strategy: Option<String>,
    pub target_audience: Option<String>,
    pub call_timing: Option<String>,
    pub success_criteria: Option<String>,
    pub callback_settings: Option<String>,
    pub retry_policy: Option<String>,
    pub escalation_rules: Option<String>,
    pub reporting_config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManualCallConfig {
    pub call_script: Option<String>,
    pub assignee_group: Option<String>,
    pub call_timing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitConfig {
    pub duration_minutes: Option<u32>,
    pub until: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BenefitConfig {
    pub coupon_id: Option<String>,
    pub quantity: Option<u32>,
    pub expiry_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndConfig {
    pub reason: Option<String>,
}

/// Free-form settings of a host-registered node kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomConfig {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Business configuration, one variant per node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeConfig {
    Start(StartConfig),
    AudienceSplit(AudienceSplitConfig),
    EventSplit(EventSplitConfig),
    AbTest(AbTestConfig),
    Sms(SmsConfig),
    AiCall(AiCallConfig),
    ManualCall(ManualCallConfig),
    Wait(WaitConfig),
    Benefit(BenefitConfig),
    End(EndConfig),
    Custom(CustomConfig),
}

fn text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

impl NodeConfig {
    /// The unconfigured payload a freshly dropped node carries.
    pub fn empty_for(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::Start => NodeConfig::Start(Default::default()),
            NodeKind::AudienceSplit => NodeConfig::AudienceSplit(Default::default()),
            NodeKind::EventSplit => NodeConfig::EventSplit(Default::default()),
            NodeKind::AbTest => NodeConfig::AbTest(Default::default()),
            NodeKind::Sms => NodeConfig::Sms(Default::default()),
            NodeKind::AiCall => NodeConfig::AiCall(Default::default()),
            NodeKind::ManualCall => NodeConfig::ManualCall(Default::default()),
            NodeKind::Wait => NodeConfig::Wait(Default::default()),
            NodeKind::Benefit => NodeConfig::Benefit(Default::default()),
            NodeKind::End => NodeConfig::End(Default::default()),
            NodeKind::Custom(_) => NodeConfig::Custom(Default::default()),
        }
    }

    /// Decode an untagged form payload for a node of `kind`.
    pub fn decode(kind: &NodeKind, payload: serde_json::Value) -> Result<Self, ConfigError> {
        let serde_json::Value::Object(mut map) = payload else {
            return Err(ConfigError::Invalid(format!(
                "configuration of {} node must be an object",
                kind
            )));
        };
        if let NodeKind::Custom(_) = kind {
            return Ok(NodeConfig::Custom(CustomConfig {
                fields: map.into_iter().collect(),
            }));
        }
        map.insert("type".into(), serde_json::Value::from(kind.as_str()));
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeConfig::Start(_) => "start",
            NodeConfig::AudienceSplit(_) => "audience-split",
            NodeConfig::EventSplit(_) => "event-split",
            NodeConfig::AbTest(_) => "ab-test",
            NodeConfig::Sms(_) => "sms",
            NodeConfig::AiCall(_) => "ai-call",
            NodeConfig::ManualCall(_) => "manual-call",
            NodeConfig::Wait(_) => "wait",
            NodeConfig::Benefit(_) => "benefit",
            NodeConfig::End(_) => "end",
            NodeConfig::Custom(_) => "custom",
        }
    }

    pub fn matches(&self, kind: &NodeKind) -> bool {
        match (self, kind) {
            (NodeConfig::Custom(_), NodeKind::Custom(_)) => true,
            (NodeConfig::Custom(_), _) | (_, NodeKind::Custom(_)) => false,
            (config, kind) => config.kind_name() == kind.as_str(),
        }
    }

    /// Required fields and whether each one is filled in.
    pub fn required_fields(&self) -> Vec<(&'static str, bool)> {
        match self {
            NodeConfig::Start(c) => vec![("audience", text(&c.audience)), ("trigger", text(&c.trigger))],
            NodeConfig::AudienceSplit(c) => {
                vec![("branches", !c.branches.is_empty()), ("rule", text(&c.rule))]
            }
            NodeConfig::EventSplit(c) => vec![
                ("eventName", text(&c.event_name)),
                ("waitWindowMinutes", c.wait_window_minutes.is_some()),
                ("branches", !c.branches.is_empty()),
            ],
            NodeConfig::AbTest(c) => vec![
                ("branches", c.branches.len() >= 2),
                ("trafficSplit", c.traffic_split.as_ref().is_some_and(|s| !s.is_empty())),
            ],
            NodeConfig::Sms(c) => vec![("templateId", text(&c.template_id)), ("content", text(&c.content))],
            NodeConfig::AiCall(c) => vec![
                ("callScript", text(&c.call_script)),
                ("callStrategy", text(&c.call_strategy)),
                ("targetAudience", text(&c.target_audience)),
                ("callTiming", text(&c.call_timing)),
                ("successCriteria", text(&c.success_criteria)),
            ],
            NodeConfig::ManualCall(c) => vec![
                ("callScript", text(&c.call_script)),
                ("assigneeGroup", text(&c.assignee_group)),
            ],
            NodeConfig::Wait(c) => vec![("durationMinutes", c.duration_minutes.is_some())],
            NodeConfig::Benefit(c) => {
                vec![("couponId", text(&c.coupon_id)), ("quantity", c.quantity.is_some())]
            }
            NodeConfig::End(_) | NodeConfig::Custom(_) => Vec::new(),
        }
    }

    /// Optional fields and whether each one is filled in.
    pub fn optional_fields(&self) -> Vec<(&'static str, bool)> {
        match self {
            NodeConfig::Start(c) => vec![("startTime", text(&c.start_time))],
            NodeConfig::AbTest(c) => vec![("goal", text(&c.goal))],
            NodeConfig::Sms(c) => vec![("signName", text(&c.sign_name))],
            NodeConfig::AiCall(c) => vec![
                ("callbackSettings", text(&c.callback_settings)),
                ("retryPolicy", text(&c.retry_policy)),
                ("escalationRules", text(&c.escalation_rules)),
                ("reportingConfig", text(&c.reporting_config)),
            ],
            NodeConfig::ManualCall(c) => vec![("callTiming", text(&c.call_timing))],
            NodeConfig::Wait(c) => vec![("until", text(&c.until))],
            NodeConfig::Benefit(c) => vec![("expiryDays", c.expiry_days.is_some())],
            NodeConfig::End(c) => vec![("reason", text(&c.reason))],
            NodeConfig::AudienceSplit(_) | NodeConfig::EventSplit(_) | NodeConfig::Custom(_) => {
                Vec::new()
            }
        }
    }

    /// True when any business field at all carries a value.
    pub fn has_business_data(&self) -> bool {
        if let NodeConfig::Custom(c) = self {
            return !c.fields.is_empty();
        }
        self.required_fields()
            .iter()
            .chain(self.optional_fields().iter())
            .any(|(_, present)| *present)
    }

    /// Script-like content fields, or `None` for kinds that have none.
    pub fn business_content(&self) -> Option<Vec<&str>> {
        let fields: Vec<&Option<String>> = match self {
            NodeConfig::AudienceSplit(c) => vec![&c.rule],
            NodeConfig::Sms(c) => vec![&c.content],
            NodeConfig::AiCall(c) => vec![&c.call_script, &c.call_strategy, &c.target_audience],
            NodeConfig::ManualCall(c) => vec![&c.call_script],
            _ => return None,
        };
        Some(fields.into_iter().filter_map(|f| f.as_deref()).collect())
    }

    pub fn branches(&self) -> &[BranchDef] {
        match self {
            NodeConfig::AudienceSplit(c) => &c.branches,
            NodeConfig::EventSplit(c) => &c.branches,
            NodeConfig::AbTest(c) => &c.branches,
            _ => &[],
        }
    }

    /// Stable hash of the payload, used as a memoization key.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match serde_json::to_string(self) {
            Ok(json) => json.hash(&mut hasher),
            Err(_) => format!("{:?}", self).hash(&mut hasher),
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_injects_kind_tag() {
        let config = NodeConfig::decode(
            &NodeKind::Sms,
            json!({ "templateId": "tpl-1", "content": "Your coupon is waiting" }),
        )
        .unwrap();
        match config {
            NodeConfig::Sms(sms) => {
                assert_eq!(sms.template_id.as_deref(), Some("tpl-1"));
                assert!(sms.sign_name.is_none());
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(NodeConfig::decode(&NodeKind::Wait, json!(42)).is_err());
    }

    #[test]
    fn test_decode_custom_kind_keeps_fields() {
        let kind = NodeKind::Custom("webhook".into());
        let config = NodeConfig::decode(&kind, json!({ "url": "https://example.org" })).unwrap();
        assert!(config.matches(&kind));
        assert!(config.has_business_data());
    }

    #[test]
    fn test_required_field_coverage() {
        let config = NodeConfig::AiCall(AiCallConfig {
            call_script: Some("Hello, this is a follow-up call".into()),
            call_strategy: Some("  ".into()),
            ..Default::default()
        });
        let present = config
            .required_fields()
            .iter()
            .filter(|(_, present)| *present)
            .count();
        assert_eq!(present, 1);
        assert_eq!(config.required_fields().len(), 5);
    }

    #[test]
    fn test_content_hash_tracks_payload() {
        let a = NodeConfig::Wait(WaitConfig {
            duration_minutes: Some(30),
            until: None,
        });
        let b = NodeConfig::Wait(WaitConfig {
            duration_minutes: Some(45),
            until: None,
        });
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_business_content_absent_for_wait() {
        assert!(NodeConfig::empty_for(&NodeKind::Wait).business_content().is_none());
        assert_eq!(
            NodeConfig::empty_for(&NodeKind::Sms).business_content(),
            Some(vec![])
        );
    }
}
