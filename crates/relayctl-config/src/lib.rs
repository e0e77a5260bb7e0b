#![deny(unsafe_code)]

//! Configuration loading, validation, and exit-policy engine for relayctl.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! and the [`exit_policy`] module for evaluating a relay's accept/reject chain.

/// Exit-policy rule chains (`accept|reject addr[/mask]:port[-port]`).
pub mod exit_policy;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use exit_policy::{ExitPolicy, PolicyError};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control port the default connector dials.
    #[serde(default)]
    pub control: ControlConfig,

    /// Session behaviour: caching, reload confirmation, notifications.
    #[serde(default)]
    pub session: SessionConfig,

    /// The monitored daemon process.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Location of the daemon's control port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Address of the control port.
    #[serde(default = "default_control_address")]
    pub address: String,

    /// Control port number.
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: default_control_address(),
            port: default_control_port(),
        }
    }
}

fn default_control_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    9051
}

/// Session behaviour.
///
/// ## TOML Example
///
/// ```toml
/// [session]
/// path_prefix = "/var/jail/relay"
/// reload_confirm_timeout_ms = 1000
///
/// [session.option_aliases]
/// HiddenServiceDir = "HiddenServiceOptions"
/// HiddenServicePort = "HiddenServiceOptions"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Prefix prepended to daemon resource paths (chroot or jail root).
    #[serde(default)]
    pub path_prefix: String,

    /// How long a signal-based reload waits for the daemon to confirm it.
    #[serde(default = "default_reload_confirm_timeout_ms")]
    pub reload_confirm_timeout_ms: u64,

    /// Sleep between checks while waiting for reload confirmation.
    #[serde(default = "default_reload_poll_interval_ms")]
    pub reload_poll_interval_ms: u64,

    /// Skip event types a daemon already rejected earlier in this session.
    #[serde(default = "default_true")]
    pub drop_failed_events: bool,

    /// Capacity of the status-notification queue.
    #[serde(default = "default_notification_queue")]
    pub notification_queue: usize,

    /// Memoize exit-policy verdicts per `(address, port)`.
    #[serde(default = "default_true")]
    pub exit_lookup_cache: bool,

    /// Options only retrievable through a parent option, mapped to that parent.
    #[serde(default)]
    pub option_aliases: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path_prefix: String::new(),
            reload_confirm_timeout_ms: default_reload_confirm_timeout_ms(),
            reload_poll_interval_ms: default_reload_poll_interval_ms(),
            drop_failed_events: true,
            notification_queue: default_notification_queue(),
            exit_lookup_cache: true,
            option_aliases: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Look up the parent option for `option`, ignoring case.
    pub fn alias_for(&self, option: &str) -> Option<&str> {
        self.option_aliases
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(option))
            .map(|(_, parent)| parent.as_str())
    }

    /// Options read through `parent`, ignoring case.
    pub fn aliases_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.option_aliases
            .iter()
            .filter(move |(_, target)| target.eq_ignore_ascii_case(parent))
            .map(|(name, _)| name.as_str())
    }
}

fn default_reload_confirm_timeout_ms() -> u64 {
    1000
}

fn default_reload_poll_interval_ms() -> u64 {
    100
}

fn default_notification_queue() -> usize {
    64
}

fn default_true() -> bool {
    true
}

/// The daemon process being controlled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Executable name used when searching for the daemon's pid.
    #[serde(default = "default_process_name")]
    pub process_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
        }
    }
}

fn default_process_name() -> String {
    "tor".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Number of transport log lines retained for display.
    #[serde(default = "default_transport_log_capacity")]
    pub transport_log_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            transport_log_capacity: default_transport_log_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transport_log_capacity() -> usize {
    500
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.address.is_empty() {
            return Err(ConfigError::Validation(
                "control.address must not be empty".to_string(),
            ));
        }
        if self.control.port == 0 {
            return Err(ConfigError::Validation(
                "control.port must be non-zero".to_string(),
            ));
        }

        let session = &self.session;
        if session.reload_confirm_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "session.reload_confirm_timeout_ms must be non-zero".to_string(),
            ));
        }
        if session.reload_poll_interval_ms == 0
            || session.reload_poll_interval_ms > session.reload_confirm_timeout_ms
        {
            return Err(ConfigError::Validation(format!(
                "session.reload_poll_interval_ms must be in (0, {}], got {}",
                session.reload_confirm_timeout_ms, session.reload_poll_interval_ms
            )));
        }
        if session.notification_queue == 0 {
            return Err(ConfigError::Validation(
                "session.notification_queue must be at least 1".to_string(),
            ));
        }
        for (option, parent) in &session.option_aliases {
            if option.is_empty() || parent.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "session.option_aliases entry {option:?} = {parent:?} must not be empty"
                )));
            }
        }

        if self.daemon.process_name.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.process_name must not be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.control.address, "127.0.0.1");
        assert_eq!(config.control.port, 9051);
        assert_eq!(config.session.reload_confirm_timeout_ms, 1000);
        assert_eq!(config.session.reload_poll_interval_ms, 100);
        assert!(config.session.drop_failed_events);
        assert_eq!(config.daemon.process_name, "tor");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.control.port, 9051);
        assert!(config.session.option_aliases.is_empty());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [control]
            address = "10.0.0.2"
            port = 9151

            [session]
            path_prefix = "/var/jail/relay"
            reload_confirm_timeout_ms = 2000
            reload_poll_interval_ms = 50
            drop_failed_events = false
            notification_queue = 8

            [session.option_aliases]
            HiddenServiceDir = "HiddenServiceOptions"

            [daemon]
            process_name = "relayd"

            [logging]
            level = "debug"
            transport_log_capacity = 20
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.control.address, "10.0.0.2");
        assert_eq!(config.control.port, 9151);
        assert_eq!(config.session.path_prefix, "/var/jail/relay");
        assert_eq!(config.session.reload_confirm_timeout_ms, 2000);
        assert!(!config.session.drop_failed_events);
        assert_eq!(config.session.notification_queue, 8);
        assert_eq!(config.daemon.process_name, "relayd");
        assert_eq!(config.logging.transport_log_capacity, 20);
    }

    #[test]
    fn test_alias_lookup_ignores_case() {
        let toml = r#"
            [session.option_aliases]
            HiddenServiceDir = "HiddenServiceOptions"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(
            config.session.alias_for("hiddenservicedir"),
            Some("HiddenServiceOptions")
        );
        assert_eq!(config.session.alias_for("ORPort"), None);
    }

    #[test]
    fn test_aliases_of_parent() {
        let toml = r#"
            [session.option_aliases]
            HiddenServiceDir = "HiddenServiceOptions"
            HiddenServicePort = "HiddenServiceOptions"
            ExitNodes = "Nodes"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        let mut children: Vec<&str> = config
            .session
            .aliases_of("hiddenserviceoptions")
            .collect();
        children.sort_unstable();
        assert_eq!(children, vec!["HiddenServiceDir", "HiddenServicePort"]);
        assert_eq!(config.session.aliases_of("HiddenServiceDir").count(), 0);
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let toml = r#"
            [control]
            port = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_address() {
        let toml = r#"
            [control]
            address = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_poll_longer_than_timeout() {
        let toml = r#"
            [session]
            reload_confirm_timeout_ms = 100
            reload_poll_interval_ms = 500
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let toml = r#"
            [session]
            notification_queue = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_alias() {
        let toml = r#"
            [session.option_aliases]
            HiddenServiceDir = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let toml = r#"
            [logging]
            level = "loud"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("relayctl.toml");
        tokio::fs::write(&path, b"[control]\nport = 9151\naddress = \"0.0.0.0\"\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.control.port, 9151);
        assert_eq!(config.control.address, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
