//! Host configuration file loading and management
//!
//! This module handles loading and parsing the host configuration from
//! `$XDG_CONFIG_HOME/modlink/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.
//!
//! The host configuration only points at the other documents: the router
//! document and the security policy are loaded from their own files.

use anyhow::{Context, Result};
use modlink_bus::CorrelatorConfig;
use modlink_plugin_api::DefaultPaths;
use modlink_router::RouterConfig;
use modlink_runtime::SecurityPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub requests: RequestsConfig,
}

/// Host process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
    /// Interval between behaviour ticks in milliseconds
    /// Default: 50
    pub tick_interval_ms: u64,
}

/// Overrides for the platform directories
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
}

/// Router document location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouterSection {
    /// JSON or TOML router document. No routes when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<PathBuf>,
}

/// Security policy location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecuritySection {
    /// JSON or TOML policy document. Built-in policy when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PathBuf>,
}

/// Request/response correlator timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestsConfig {
    pub default_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tick_interval_ms: 50,
        }
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            sweep_interval_secs: 10,
            stale_threshold_secs: 60,
        }
    }
}

impl RequestsConfig {
    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/modlink/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "raibid-labs", "modlink")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    pub fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    fn default_config_content() -> &'static str {
        r#"# modlink host configuration

[host]
# Log level: trace, debug, info, warn, error
# RUST_LOG takes precedence when set.
log_level = "info"

# Milliseconds between behaviour ticks
tick_interval_ms = 50

[paths]
# Each root defaults to the platform directory for modlink.
# bundle_root = "/path/to/mods"
# config_root = "/path/to/config"
# temp_root = "/tmp/modlink"
# data_root = "/path/to/data"

[router]
# Router document (.json or .toml). Without one no events are routed.
# document = "/path/to/routes.json"

[security]
# Security policy (.toml or .json). Without one the built-in policy applies:
# unsigned bundles accepted, events.publish/events.subscribe/objects.create
# granted by default.
# policy = "/path/to/policy.toml"

[requests]
default_timeout_secs = 30
sweep_interval_secs = 10
stale_threshold_secs = 60
"#
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.host.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.host.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.host.tick_interval_ms == 0 {
            anyhow::bail!("host.tick_interval_ms must be greater than 0");
        }

        let requests = &self.requests;
        if requests.default_timeout_secs == 0 || requests.sweep_interval_secs == 0 {
            anyhow::bail!("requests.default_timeout_secs and requests.sweep_interval_secs must be greater than 0");
        }
        if requests.stale_threshold_secs < requests.default_timeout_secs {
            anyhow::bail!(
                "requests.stale_threshold_secs ({}) must not be shorter than requests.default_timeout_secs ({})",
                requests.stale_threshold_secs,
                requests.default_timeout_secs
            );
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.host.tick_interval_ms)
    }

    /// Platform directories with the `[paths]` overrides applied.
    pub fn host_paths(&self) -> Result<DefaultPaths> {
        let mut paths = DefaultPaths::new().context("Failed to determine project directories")?;
        let overrides = &self.paths;
        if let Some(root) = &overrides.bundle_root {
            paths.bundle_root = root.clone();
        }
        if let Some(root) = &overrides.config_root {
            paths.config_root = root.clone();
        }
        if let Some(root) = &overrides.temp_root {
            paths.temp_root = root.clone();
        }
        if let Some(root) = &overrides.data_root {
            paths.data_root = root.clone();
        }
        Ok(paths)
    }

    /// Read the security policy, or the built-in one.
    ///
    /// A policy without a `bundle_root` gets `bundle_root`, so bundles found
    /// by discovery pass path containment.
    pub fn load_policy(&self, bundle_root: &Path) -> Result<SecurityPolicy> {
        let mut policy = match &self.security.policy {
            Some(path) => SecurityPolicy::from_file(path)
                .with_context(|| format!("Failed to load security policy: {}", path.display()))?,
            None => SecurityPolicy::default(),
        };
        if policy.bundle_root.is_none() {
            policy.bundle_root = Some(bundle_root.to_path_buf());
        }
        Ok(policy)
    }

    /// Read the router document, or an empty one.
    pub fn load_router(&self) -> Result<RouterConfig> {
        match &self.router.document {
            Some(path) => RouterConfig::from_file(path)
                .with_context(|| format!("Failed to load router document: {}", path.display())),
            None => Ok(RouterConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.host.tick_interval_ms, 50);
        assert!(config.paths.bundle_root.is_none());
        assert!(config.router.document.is_none());
        assert!(config.security.policy.is_none());
        assert_eq!(config.requests.default_timeout_secs, 30);
    }

    #[test]
    fn test_default_content_parses_to_default() {
        let config: Config = toml::from_str(Config::default_config_content()).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[host]
log_level = "debug"
tick_interval_ms = 100

[paths]
bundle_root = "/srv/game/mods"

[router]
document = "/srv/game/routes.json"

[requests]
default_timeout_secs = 5
sweep_interval_secs = 1
stale_threshold_secs = 20
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.host.log_level, "debug");
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.paths.bundle_root, Some(PathBuf::from("/srv/game/mods")));
        assert_eq!(config.router.document, Some(PathBuf::from("/srv/game/routes.json")));

        let correlator = config.requests.correlator_config();
        assert_eq!(correlator.default_timeout, Duration::from_secs(5));
        assert_eq!(correlator.stale_threshold, Duration::from_secs(20));
    }

    #[test]
    fn test_load_minimal_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[host]\nlog_level = \"warn\"\ntick_interval_ms = 16\n").unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.host.log_level, "warn");
        assert_eq!(config.requests, RequestsConfig::default());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.host.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_tick_interval() {
        let mut config = Config::default();
        config.host.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_stale_threshold_below_timeout() {
        let mut config = Config::default();
        config.requests.stale_threshold_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_create_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::create_default_file(&path).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_policy_fills_bundle_root() {
        let dir = TempDir::new().unwrap();
        let policy_path = dir.path().join("policy.toml");
        fs::write(&policy_path, "require_signed_bundles = false\ntrusted_mods = [\"core\"]\n").unwrap();

        let mut config = Config::default();
        let root = dir.path().join("mods");
        assert_eq!(config.load_policy(&root).unwrap().bundle_root, Some(root.clone()));

        config.security.policy = Some(policy_path);
        let policy = config.load_policy(&root).unwrap();
        assert!(policy.is_trusted("core"));
        assert_eq!(policy.bundle_root, Some(root));
    }

    #[test]
    fn test_load_router_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(
            &path,
            r#"{ "routes": [{ "name": "r", "sourceEvent": "ButtonClicked", "actions": [{ "targetEvent": "Broadcast" }] }] }"#,
        )
        .unwrap();

        let mut config = Config::default();
        assert!(config.load_router().unwrap().routes.is_empty());

        config.router.document = Some(path);
        assert_eq!(config.load_router().unwrap().routes.len(), 1);

        config.router.document = Some(dir.path().join("missing.json"));
        assert!(config.load_router().is_err());
    }
}
