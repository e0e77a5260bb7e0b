//! Configuration builders for tests.

use relayctl_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .reload_timeout_ms(200)
///     .option_alias("HiddenServiceDir", "HiddenServiceOptions")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn path_prefix(mut self, prefix: &str) -> Self {
        self.config.session.path_prefix = prefix.to_string();
        self
    }

    /// Shorten the signal-reload wait, keeping the poll step below it.
    pub fn reload_timeout_ms(mut self, ms: u64) -> Self {
        self.config.session.reload_confirm_timeout_ms = ms;
        self.config.session.reload_poll_interval_ms =
            self.config.session.reload_poll_interval_ms.min(ms);
        self
    }

    pub fn drop_failed_events(mut self, enabled: bool) -> Self {
        self.config.session.drop_failed_events = enabled;
        self
    }

    pub fn notification_queue(mut self, capacity: usize) -> Self {
        self.config.session.notification_queue = capacity;
        self
    }

    pub fn exit_lookup_cache(mut self, enabled: bool) -> Self {
        self.config.session.exit_lookup_cache = enabled;
        self
    }

    pub fn option_alias(mut self, option: &str, parent: &str) -> Self {
        self.config
            .session
            .option_aliases
            .insert(option.to_string(), parent.to_string());
        self
    }

    pub fn process_name(mut self, name: &str) -> Self {
        self.config.daemon.process_name = name.to_string();
        self
    }

    pub fn transport_log_capacity(mut self, capacity: usize) -> Self {
        self.config.logging.transport_log_capacity = capacity;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
