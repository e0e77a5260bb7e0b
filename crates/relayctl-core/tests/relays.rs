//! Relay attributes and fingerprint resolution through the session.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relayctl_config::AppConfig;
use relayctl_core::{
    ControlError, ControlEvent, ControlTransport, Controller, RouterStatus,
    DEFAULT_DIR_AUTHORITIES,
};
use relayctl_test_utils::config::TestConfigBuilder;
use relayctl_test_utils::mock::MockTransport;

const OWN_FP: &str = "F00D000000000000000000000000000000000000";
const FP_A: &str = "AAAA000000000000000000000000000000000001";
const FP_B: &str = "BBBB000000000000000000000000000000000002";
const FP_C: &str = "CCCC000000000000000000000000000000000003";

fn attach_with(config: &AppConfig, transport: MockTransport) -> (Controller, Arc<MockTransport>) {
    let controller = Controller::new(config).unwrap();
    let transport = transport.shared();
    controller
        .init(Some(Arc::clone(&transport) as Arc<dyn ControlTransport>))
        .unwrap();
    (controller, transport)
}

fn attach(transport: MockTransport) -> (Controller, Arc<MockTransport>) {
    attach_with(&AppConfig::default(), transport)
}

fn network() -> MockTransport {
    MockTransport::new()
        .with_info("address", "203.0.113.5")
        .with_info("fingerprint", OWN_FP)
        .with_option("ORPort", "9001")
        .with_option("Nickname", "relayctl")
        .with_relays(vec![
            RouterStatus::new("alpha", FP_A, "198.51.100.1", 9001).with_flags(&["Running"]),
            RouterStatus::new("bravo", FP_B, "198.51.100.2", 9001).with_flags(&["Running"]),
            RouterStatus::new("charlie", FP_C, "198.51.100.2", 443).with_flags(&["Running"]),
        ])
}

#[test_log::test]
fn test_resolve_unique_address() {
    let (controller, transport) = attach(network());

    assert_eq!(
        controller.relay_fingerprint("198.51.100.1", None).as_deref(),
        Some(FP_A)
    );
    assert_eq!(
        controller.relay_fingerprint("198.51.100.2", Some(443)).as_deref(),
        Some(FP_C)
    );
    assert_eq!(
        controller.relay_fingerprint("198.51.100.1", Some(9002)),
        None
    );
    assert_eq!(transport.network_calls(), 1);

    controller.relay_fingerprint("198.51.100.1", None);
    assert_eq!(transport.network_calls(), 1);
}

#[test_log::test]
fn test_resolve_own_relay() {
    let (controller, transport) = attach(network());

    assert_eq!(
        controller.relay_fingerprint("203.0.113.5", Some(9001)).as_deref(),
        Some(OWN_FP)
    );
    assert_eq!(transport.network_calls(), 0);
    assert_eq!(controller.relay_nickname(OWN_FP).as_deref(), Some("relayctl"));
}

#[test_log::test]
fn test_resolve_ambiguous_and_unknown() {
    let (controller, _transport) = attach(network());

    match controller.try_relay_fingerprint("198.51.100.2", None) {
        Err(ControlError::AmbiguousIdentity { address, candidates }) => {
            assert_eq!(address, "198.51.100.2");
            assert_eq!(candidates, 2);
        }
        other => panic!("unexpected resolution: {other:?}"),
    }
    assert!(matches!(
        controller.try_relay_fingerprint("192.0.2.9", Some(80)),
        Err(ControlError::UnknownRelay(target)) if target == "192.0.2.9:80"
    ));
}

#[test_log::test]
fn test_resolve_prefers_connected_relay() {
    let (controller, _transport) = attach(
        network().with_info("orconn-status", &format!("${FP_B}=bravo CONNECTED")),
    );

    assert_eq!(
        controller.relay_fingerprint("198.51.100.2", None).as_deref(),
        Some(FP_B)
    );
}

#[test_log::test]
fn test_resolve_skips_down_relays() {
    let (controller, _transport) = attach(
        network()
            .with_info(&format!("desc/id/{FP_B}"), "router bravo 198.51.100.2 9001 0 0\nbandwidth 100 200 0")
            .with_info(&format!("desc/id/{FP_C}"), "router charlie 198.51.100.2 443 0 0\nbandwidth 100 200 300"),
    );

    assert_eq!(
        controller.relay_fingerprint("198.51.100.2", None).as_deref(),
        Some(FP_C)
    );
}

#[test_log::test]
fn test_consensus_replaces_address_map() {
    let (controller, transport) = attach(network());
    controller.relay_fingerprint("198.51.100.1", None);

    transport.emit(ControlEvent::NewConsensus(vec![RouterStatus::new(
        "alpha", FP_A, "198.51.100.9", 9001,
    )]));

    assert_eq!(
        controller.relay_fingerprint("198.51.100.9", None).as_deref(),
        Some(FP_A)
    );
    assert_eq!(controller.relay_fingerprint("198.51.100.1", None), None);
    assert_eq!(transport.network_calls(), 1);
}

#[test_log::test]
fn test_new_descriptor_patches_address_map() {
    let (controller, transport) = attach(network());
    controller.relay_fingerprint("198.51.100.1", None);

    transport.set_relays(vec![
        RouterStatus::new("alpha", FP_A, "198.51.100.7", 9001).with_flags(&["Running"]),
    ]);
    transport.emit(ControlEvent::NewDescriptor(vec![FP_A.to_string()]));

    assert_eq!(
        controller.relay_fingerprint("198.51.100.7", None).as_deref(),
        Some(FP_A)
    );
    // Full listing fetched once; the patch looked up a single relay.
    assert_eq!(transport.network_calls(), 2);
}

#[test_log::test]
fn test_resolver_reset_on_reattach() {
    let (controller, first) = attach(network());
    controller.relay_fingerprint("198.51.100.1", None);
    assert_eq!(first.network_calls(), 1);

    let second = MockTransport::new()
        .with_relays(vec![RouterStatus::new("delta", FP_B, "198.51.100.1", 9001)])
        .shared();
    controller
        .init(Some(Arc::clone(&second) as Arc<dyn ControlTransport>))
        .unwrap();

    assert_eq!(
        controller.relay_fingerprint("198.51.100.1", None).as_deref(),
        Some(FP_B)
    );
    assert_eq!(second.network_calls(), 1);
}

#[test_log::test]
fn test_relay_nickname_lookup() {
    let (controller, transport) = attach(network());

    assert_eq!(controller.relay_nickname(FP_C).as_deref(), Some("charlie"));
    assert_eq!(controller.relay_nickname(FP_C).as_deref(), Some("charlie"));
    assert_eq!(transport.network_calls(), 1);
    assert_eq!(controller.relay_nickname("0000"), None);
}

#[test_log::test]
fn test_bandwidth_rate_and_burst() {
    let (controller, _transport) = attach(
        MockTransport::new()
            .with_option("BandwidthRate", "5242880")
            .with_option("RelayBandwidthRate", "1048576")
            .with_option("MaxAdvertisedBandwidth", "2097152")
            .with_option("BandwidthBurst", "10485760")
            .with_option("RelayBandwidthBurst", "0"),
    );

    assert_eq!(controller.my_bandwidth_rate(), Some(1_048_576));
    assert_eq!(controller.my_bandwidth_burst(), Some(10_485_760));
}

#[test_log::test]
fn test_dir_authorities() {
    let (controller, _transport) = attach(MockTransport::new());
    assert_eq!(controller.my_dir_authorities().len(), DEFAULT_DIR_AUTHORITIES.len());

    let (controller, _transport) = attach(MockTransport::new().with_option(
        "DirServer",
        "moria1 orport=9101 v3ident=D586D183 128.31.0.39:9131 9695DFC35FFEB861329B9F1AB04C46397020CE31",
    ));
    assert_eq!(
        controller.my_dir_authorities(),
        vec![("128.31.0.39".to_string(), 9131)]
    );
}

#[test_log::test]
fn test_path_prefix() {
    let dir = tempfile::TempDir::new().unwrap();
    let prefix = format!("{}/", dir.path().display());
    let config = TestConfigBuilder::new().path_prefix(&prefix).build();
    let (controller, _transport) = attach_with(&config, MockTransport::new());
    assert_eq!(controller.path_prefix(), dir.path().display().to_string());

    let config = TestConfigBuilder::new()
        .path_prefix("/nonexistent/relayctl/jail")
        .build();
    let (controller, _transport) = attach_with(&config, MockTransport::new());
    assert_eq!(controller.path_prefix(), "");
}

#[test_log::test]
fn test_relay_attributes_need_a_session() {
    let controller = Controller::new(&AppConfig::default()).unwrap();

    assert_eq!(controller.my_flags(), None);
    assert_eq!(controller.my_pid(), None);
    assert_eq!(controller.path_prefix(), "");
    assert!(controller.my_dir_authorities().is_empty());
    assert_eq!(controller.relay_fingerprint("198.51.100.1", None), None);
    assert!(matches!(
        controller.try_relay_fingerprint("198.51.100.1", None),
        Err(ControlError::NotConnected)
    ));
}
