//! Session test helpers.
//!
//! Builds a [`Controller`] from a temporary config file and attaches it to a
//! [`MockTransport`].

use std::path::PathBuf;
use std::sync::Arc;

use relayctl_config::AppConfig;
use relayctl_core::{ControlTransport, Controller};
use tempfile::TempDir;

use crate::mock::MockTransport;

/// A test-scoped session with an owned temp directory for config files.
///
/// The temp directory is deleted when this value is dropped.
pub struct TestSession {
    pub controller: Controller,
    pub transport: Arc<MockTransport>,
    pub config_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestSession {
    /// Load `toml_content` from a temp file and attach `transport`.
    pub async fn with_toml(toml_content: &str, transport: MockTransport) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config_path = temp_dir.path().join("relayctl.toml");
        tokio::fs::write(&config_path, toml_content)
            .await
            .expect("failed to write test config");

        let config = AppConfig::load(&config_path)
            .await
            .expect("failed to parse test config");
        let controller = Controller::new(&config).expect("failed to build controller");

        let transport = transport.shared();
        controller
            .init(Some(Arc::clone(&transport) as Arc<dyn ControlTransport>))
            .expect("failed to attach mock transport");

        Self {
            controller,
            transport,
            config_path,
            _temp_dir: temp_dir,
        }
    }

    /// Default config, attached to `transport`.
    pub async fn attached(transport: MockTransport) -> Self {
        Self::with_toml("", transport).await
    }
}
