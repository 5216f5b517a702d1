//! Engine configuration.
//!
//! Every section has working defaults, so a host can deserialize a partial
//! JSON document and only override what it cares about:
//!
//! ```ignore
//! let config = EngineConfig::from_json_str(r#"{ "layout": { "preferredSpacing": 240 } }"#)?;
//! assert_eq!(config.drag.min_operation_interval_ms, 50);
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub drag: DragConfig,
    pub rules: RuleConfig,
    pub layout: AlignmentConfig,
    pub preview: PreviewConfig,
    pub node_validation: NodeValidationConfig,
    pub refresh: RefreshConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = &self.layout;
        if !(layout.min_spacing > 0.0 && layout.preferred_spacing > 0.0 && layout.max_width > 0.0) {
            return Err(ConfigError::Invalid(
                "layout spacing and width must be positive".into(),
            ));
        }
        if layout.min_spacing > layout.preferred_spacing {
            return Err(ConfigError::Invalid(format!(
                "minSpacing {} exceeds preferredSpacing {}",
                layout.min_spacing, layout.preferred_spacing
            )));
        }
        if !(self.rules.near_limit_ratio > 0.0 && self.rules.near_limit_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "nearLimitRatio must be in (0, 1], got {}",
                self.rules.near_limit_ratio
            )));
        }
        if self.refresh.max_in_flight == 0 {
            return Err(ConfigError::Invalid("refresh.maxInFlight must be at least 1".into()));
        }
        if self.drag.history_limit == 0 {
            return Err(ConfigError::Invalid("drag.historyLimit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Timing of the drag state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DragConfig {
    pub min_operation_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub recovery_delay_ms: u64,
    pub history_limit: usize,
    /// Distance within which a hovered input port captures the pointer.
    pub snap_radius: f64,
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            min_operation_interval_ms: 50,
            lock_timeout_ms: 1000,
            recovery_delay_ms: 100,
            history_limit: 50,
            snap_radius: 30.0,
        }
    }
}

impl DragConfig {
    pub fn min_operation_interval(&self) -> Duration {
        Duration::from_millis(self.min_operation_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

/// Global defaults of the connection rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleConfig {
    pub default_max_incoming: usize,
    pub default_max_outgoing: usize,
    /// Utilization at which a capacity warning is raised.
    pub near_limit_ratio: f64,
    pub check_ports: bool,
    pub check_cycles: bool,
    pub check_schema: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            default_max_incoming: 5,
            default_max_outgoing: 5,
            near_limit_ratio: 0.8,
            check_ports: true,
            check_cycles: true,
            check_schema: true,
        }
    }
}

/// Parameters of geometric center alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlignmentConfig {
    pub min_spacing: f64,
    pub preferred_spacing: f64,
    pub max_width: f64,
    /// Standard deviation of layer means above which layers are re-centered.
    pub skew_threshold: f64,
    /// Layers whose mean lies within this distance of zero are left alone.
    pub skew_tolerance: f64,
    pub enable_skew_compensation: bool,
    pub enable_global_alignment: bool,
    /// When set, layer `i` is placed at `y = i * layer_height`.
    pub layer_height: Option<f64>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            min_spacing: 150.0,
            preferred_spacing: 200.0,
            max_width: 800.0,
            skew_threshold: 10.0,
            skew_tolerance: 5.0,
            enable_skew_compensation: true,
            enable_global_alignment: true,
            layer_height: None,
        }
    }
}

/// Look of preview edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreviewConfig {
    /// Length of a dangling preview below an unconnected node.
    pub line_length: f64,
    /// Horizontal distance between dangling branch previews.
    pub branch_spread: f64,
    /// Stroke color as `#rrggbb`.
    pub color: String,
    /// Stroke color of committed edges.
    pub edge_color: String,
    pub line_width: f32,
    pub bezier_offset: f64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            line_length: 120.0,
            branch_spread: 160.0,
            color: "#1890ff".into(),
            edge_color: "#5f6b7a".into(),
            line_width: 2.0,
            bezier_offset: 50.0,
        }
    }
}

impl PreviewConfig {
    /// Parsed stroke color, falling back to the default blue.
    pub fn stroke_color(&self) -> slint::Color {
        parse_hex_color(&self.color).unwrap_or_else(|| slint::Color::from_rgb_u8(0x18, 0x90, 0xff))
    }

    pub fn edge_stroke_color(&self) -> slint::Color {
        parse_hex_color(&self.edge_color).unwrap_or_else(|| slint::Color::from_rgb_u8(0x5f, 0x6b, 0x7a))
    }
}

fn parse_hex_color(value: &str) -> Option<slint::Color> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some(slint::Color::from_rgb_u8(channel(0)?, channel(2)?, channel(4)?))
}

/// Node configuration gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeValidationConfig {
    pub cache_ttl_ms: u64,
    /// Cache size above which stale entries are purged.
    pub cache_capacity: usize,
    /// Business content must be longer than this after trimming.
    pub min_content_length: usize,
    pub history_limit: usize,
}

impl Default for NodeValidationConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            cache_capacity: 100,
            min_content_length: 10,
            history_limit: 1000,
        }
    }
}

impl NodeValidationConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Debounced layout and preview refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
    pub debounce_ms: u64,
    pub max_in_flight: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_in_flight: 1,
        }
    }
}

impl RefreshConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.drag.min_operation_interval(), Duration::from_millis(50));
        assert_eq!(config.drag.lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.drag.recovery_delay(), Duration::from_millis(100));
        assert_eq!(config.layout.preferred_spacing, 200.0);
        assert_eq!(config.node_validation.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.refresh.debounce(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "layout": { "preferredSpacing": 240 } }"#).unwrap();
        assert_eq!(config.layout.preferred_spacing, 240.0);
        assert_eq!(config.layout.min_spacing, 150.0);
        assert_eq!(config.drag.history_limit, 50);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "rules": { "nearLimitRatio": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_stroke_color_parsing() {
        let mut preview = PreviewConfig::default();
        assert_eq!(preview.stroke_color(), slint::Color::from_rgb_u8(0x18, 0x90, 0xff));
        preview.color = "#ff0000".into();
        assert_eq!(preview.stroke_color(), slint::Color::from_rgb_u8(255, 0, 0));
        preview.color = "red".into();
        assert_eq!(preview.stroke_color(), slint::Color::from_rgb_u8(0x18, 0x90, 0xff));
    }
}
