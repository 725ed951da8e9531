//! Router configuration document.
//!
//! Accepted as JSON or TOML. Keys are camelCase in both formats:
//!
//! ```json
//! {
//!   "routes": [
//!     {
//!       "name": "broadcast-on-click",
//!       "sourceEvent": "ButtonClicked",
//!       "conditions": [{ "property": "ButtonId", "operator": "==", "value": "broadcast" }],
//!       "actions": [{ "targetEvent": "Broadcast", "parameters": { "Message": "clicks: ${ClickCount}" } }],
//!       "priority": 10
//!     }
//!   ],
//!   "settings": { "maxConcurrentActions": 4 }
//! }
//! ```
//!
//! A top-level `workflows` section is tolerated for compatibility and ignored.

use crate::error::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Complete router configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub settings: RouterSettings,
}

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub name: String,

    /// Event kind name that triggers this route.
    pub source_event: String,

    /// Conjunctive; evaluated in order and short-circuited.
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    /// Dotted field path on the source event.
    pub property: String,

    pub operator: String,

    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    /// Event kind name to synthesize.
    pub target_event: String,

    /// Field values; strings may contain `${path}` placeholders.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Seconds to wait after acquiring a slot.
    #[serde(default)]
    pub delay: f64,
}

impl ActionConfig {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay > 0.0).then(|| saturating_secs(self.delay))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSettings {
    /// Promote per-route trace lines to `info`.
    #[serde(default)]
    pub enable_debug_logging: bool,

    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,

    /// Seconds an action may wait for a concurrency slot.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout: f64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            enable_debug_logging: false,
            max_concurrent_actions: default_max_concurrent_actions(),
            default_timeout: default_timeout_secs(),
        }
    }
}

impl RouterSettings {
    pub fn default_timeout(&self) -> Duration {
        saturating_secs(self.default_timeout.max(0.0))
    }
}

/// Seconds as a `Duration`, or `None` if negative, NaN or out of range.
fn checked_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Like [`checked_secs`] but saturating, for configs built without `validate`.
fn saturating_secs(secs: f64) -> Duration {
    checked_secs(secs).unwrap_or(Duration::MAX)
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_actions() -> usize {
    10
}

fn default_timeout_secs() -> f64 {
    30.0
}

impl RouterConfig {
    pub fn from_json_str(content: &str) -> RouterResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> RouterResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> RouterResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RouterError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml_str(&content),
            _ => Err(RouterError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Check settings and route shapes.
    ///
    /// Problems that only affect one route (unknown operator, unknown kind)
    /// are left to the router, which skips that route.
    pub fn validate(&self) -> RouterResult<()> {
        if self.settings.max_concurrent_actions == 0 {
            return Err(RouterError::InvalidConfig(
                "maxConcurrentActions must be greater than 0".to_string(),
            ));
        }

        if self.settings.default_timeout <= 0.0 || checked_secs(self.settings.default_timeout).is_none() {
            return Err(RouterError::InvalidConfig(format!(
                "defaultTimeout must be a positive number of seconds, got {}",
                self.settings.default_timeout
            )));
        }

        let mut names = HashSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            if route.name.trim().is_empty() {
                return Err(RouterError::InvalidConfig(format!(
                    "route #{} has an empty name",
                    i
                )));
            }
            if route.source_event.trim().is_empty() {
                return Err(RouterError::InvalidConfig(format!(
                    "route '{}' has an empty sourceEvent",
                    route.name
                )));
            }
            for action in &route.actions {
                if action.target_event.trim().is_empty() {
                    return Err(RouterError::InvalidConfig(format!(
                        "route '{}' has an action with an empty targetEvent",
                        route.name
                    )));
                }
                if checked_secs(action.delay).is_none() {
                    return Err(RouterError::InvalidConfig(format!(
                        "route '{}' has an action with invalid delay {}",
                        route.name, action.delay
                    )));
                }
            }
            if !names.insert(route.name.as_str()) {
                warn!(route = %route.name, "Duplicate route name");
            }
        }

        Ok(())
    }

    /// Enabled routes only, in declaration order.
    pub fn enabled_routes(&self) -> impl Iterator<Item = &RouteConfig> {
        self.routes.iter().filter(|r| r.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults_applied() {
        let config = RouterConfig::from_json_str(
            r#"{ "routes": [ { "name": "r", "sourceEvent": "A" } ] }"#,
        )
        .unwrap();

        let route = &config.routes[0];
        assert!(route.enabled);
        assert_eq!(route.priority, 0);
        assert!(route.conditions.is_empty());
        assert_eq!(config.settings.max_concurrent_actions, 10);
        assert_eq!(config.settings.default_timeout(), Duration::from_secs(30));
        assert!(!config.settings.enable_debug_logging);
    }

    #[test]
    fn test_full_json_document() {
        let config = RouterConfig::from_json_str(
            r#"{
                "routes": [{
                    "name": "big-purchase",
                    "sourceEvent": "Purchase",
                    "conditions": [{ "property": "Parameters.amount", "operator": ">", "value": 100 }],
                    "actions": [{
                        "targetEvent": "Notify",
                        "parameters": { "Text": "${Item}" },
                        "delay": 0.5
                    }],
                    "enabled": false,
                    "priority": 7
                }],
                "settings": { "enableDebugLogging": true, "maxConcurrentActions": 3, "defaultTimeout": 2.5 },
                "workflows": [{ "name": "unused" }]
            }"#,
        )
        .unwrap();

        let route = &config.routes[0];
        assert!(!route.enabled);
        assert_eq!(route.priority, 7);
        assert_eq!(route.conditions[0].property, "Parameters.amount");
        assert_eq!(route.conditions[0].value, serde_json::json!(100));
        assert_eq!(route.actions[0].delay(), Some(Duration::from_millis(500)));
        assert_eq!(config.settings.max_concurrent_actions, 3);
        assert_eq!(config.enabled_routes().count(), 0);
    }

    #[test]
    fn test_toml_document() {
        let config = RouterConfig::from_toml_str(
            r#"
            [settings]
            maxConcurrentActions = 2

            [[routes]]
            name = "r1"
            sourceEvent = "A"
            priority = 5

            [[routes.conditions]]
            property = "Count"
            operator = ">="
            value = 3

            [[routes.actions]]
            targetEvent = "B"
            parameters = { Note = "${Count}" }
            "#,
        )
        .unwrap();

        assert_eq!(config.settings.max_concurrent_actions, 2);
        assert_eq!(config.routes[0].conditions[0].value, serde_json::json!(3));
        assert_eq!(
            config.routes[0].actions[0].parameters.get("Note"),
            Some(&serde_json::json!("${Count}"))
        );
        assert_eq!(config.routes[0].actions[0].delay(), None);
    }

    #[test]
    fn test_validation_rejects_zero_limiter() {
        let err = RouterConfig::from_json_str(r#"{ "settings": { "maxConcurrentActions": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidConfig(_)));
    }

    #[test]
    fn test_validation_rejects_negative_delay() {
        let err = RouterConfig::from_json_str(
            r#"{ "routes": [ { "name": "r", "sourceEvent": "A",
                 "actions": [ { "targetEvent": "B", "delay": -1 } ] } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::InvalidConfig(_)));
    }

    #[test]
    fn test_validation_rejects_unrepresentable_durations() {
        let err = RouterConfig::from_json_str(
            r#"{ "routes": [ { "name": "r", "sourceEvent": "A",
                 "actions": [ { "targetEvent": "B", "delay": 1e30 } ] } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::InvalidConfig(_)));

        let err = RouterConfig::from_json_str(r#"{ "settings": { "defaultTimeout": 1e30 } }"#)
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidConfig(_)));
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let action = ActionConfig {
            target_event: "B".to_string(),
            parameters: Map::new(),
            delay: 1e30,
        };
        assert_eq!(action.delay(), Some(Duration::MAX));

        let settings = RouterSettings {
            default_timeout: f64::NAN,
            ..Default::default()
        };
        assert_eq!(settings.default_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_from_file_by_extension() {
        let mut json = Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{ "routes": [] }}"#).unwrap();
        assert!(RouterConfig::from_file(json.path()).unwrap().routes.is_empty());

        let mut yaml = Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(yaml, "routes: []").unwrap();
        assert!(matches!(
            RouterConfig::from_file(yaml.path()),
            Err(RouterError::UnsupportedFormat(_))
        ));
    }
}
