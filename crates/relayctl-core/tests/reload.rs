//! Configuration reloads over the control port and by signal.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relayctl_config::AppConfig;
use relayctl_core::{ControlError, ControlTransport, Controller};
use relayctl_test_utils::config::TestConfigBuilder;
use relayctl_test_utils::mock::{MockSignaller, MockTransport};
use tempfile::TempDir;

struct Fixture {
    controller: Controller,
    transport: Arc<MockTransport>,
    signaller: Arc<MockSignaller>,
    _pid_dir: TempDir,
}

/// A session whose daemon reports `pid` through its `PidFile`.
fn fixture(
    config: AppConfig,
    pid: u32,
    signaller: impl FnOnce(Arc<MockTransport>) -> MockSignaller,
) -> Fixture {
    let pid_dir = TempDir::new().unwrap();
    let pid_file = pid_dir.path().join("relay.pid");
    std::fs::write(&pid_file, format!("{pid}\n")).unwrap();

    let transport = MockTransport::new()
        .with_info("version", "0.4.8.9")
        .with_option("PidFile", &pid_file.to_string_lossy())
        .shared();
    let signaller = Arc::new(signaller(Arc::clone(&transport)));
    let controller = Controller::builder(&config)
        .signaller(signaller.clone())
        .build()
        .unwrap();
    controller
        .init(Some(Arc::clone(&transport) as Arc<dyn ControlTransport>))
        .unwrap();

    Fixture {
        controller,
        transport,
        signaller,
        _pid_dir: pid_dir,
    }
}

#[test_log::test]
fn test_reload_in_band() {
    let f = fixture(AppConfig::default(), 4242, |_| MockSignaller::silent());
    f.controller.get_info("version").unwrap();

    f.controller.reload(false).unwrap();

    assert_eq!(f.transport.signals(), vec!["RELOAD"]);
    assert!(f.signaller.pids().is_empty());
    f.controller.get_info("version").unwrap();
    assert_eq!(f.transport.info_calls("version"), 2);
}

#[test_log::test]
fn test_reload_via_signal_confirmed() {
    let config = TestConfigBuilder::new().reload_timeout_ms(5000).build();
    let f = fixture(config, 4242, MockSignaller::confirming);

    f.controller.reload(true).unwrap();

    assert_eq!(f.signaller.pids(), vec![4242]);
    assert!(f.transport.signals().is_empty());
    assert_eq!(f.controller.my_pid(), Some(4242));
}

#[test_log::test]
fn test_reload_via_signal_unconfirmed() {
    let config = TestConfigBuilder::new().reload_timeout_ms(50).build();
    let f = fixture(config, 4242, |_| MockSignaller::silent());

    let err = f.controller.reload(true).unwrap_err();
    match err {
        ControlError::ReloadUnconfirmed(reason) => assert_eq!(reason, "failed silently"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.signaller.pids(), vec![4242]);
    assert!(f.controller.is_alive());
}

#[test_log::test]
fn test_reload_via_signal_reports_signal_error() {
    let config = TestConfigBuilder::new().reload_timeout_ms(50).build();
    let f = fixture(config, 4242, |_| MockSignaller::failing("Operation not permitted"));

    let err = f.controller.reload(true).unwrap_err();
    assert!(matches!(err, ControlError::ReloadUnconfirmed(_)));
    assert!(err.to_string().contains("Operation not permitted"));
}

#[test_log::test]
fn test_reload_without_pid() {
    let config = TestConfigBuilder::new()
        .process_name("relayctl-test-no-such-daemon")
        .reload_timeout_ms(50)
        .build();
    let signaller = Arc::new(MockSignaller::silent());
    let controller = Controller::builder(&config)
        .signaller(signaller.clone())
        .build()
        .unwrap();
    controller
        .init(Some(MockTransport::new().shared() as Arc<dyn ControlTransport>))
        .unwrap();

    let err = controller.reload(true).unwrap_err();
    assert!(matches!(err, ControlError::ReloadUnconfirmed(_)));
    assert!(signaller.pids().is_empty());
}

#[test_log::test]
fn test_reload_detached() {
    let controller = Controller::new(&AppConfig::default()).unwrap();
    assert!(matches!(controller.reload(false), Err(ControlError::NotConnected)));
    assert!(matches!(controller.reload(true), Err(ControlError::NotConnected)));
}
