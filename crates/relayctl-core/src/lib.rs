#![deny(unsafe_code)]

//! Control-port session runtime for relayctl.
//!
//! Wraps a transport speaking a relay daemon's control protocol in a
//! long-lived [`Controller`] session that survives reconnects, caches what
//! does not change between daemon events, negotiates event subscriptions,
//! and resolves relay addresses to identities.

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Session parameter and option caches.
pub mod cache;
/// The control-port session and its state machine.
pub mod controller;
/// Event subscription negotiation and notice classification.
pub mod events;
/// Address → relay fingerprint resolution.
pub mod fingerprint;
/// Transport log capture and re-emission.
pub mod logging;
/// Bounded notification worker.
pub mod notifier;
/// Daemon pid discovery and signalling.
pub mod process;
/// Boundary traits for the control-port transport.
pub mod transport;

pub use controller::{
    ControlError, Controller, ControllerBuilder, ListenerId, Status, StatusListener,
    DEFAULT_DIR_AUTHORITIES,
};
pub use logging::{LogEntry, LogListener, SessionLog};
pub use process::{NixSignaller, ProcessSignaller};
pub use transport::{
    Connector, ControlEvent, ControlTransport, EventListener, LogSeverity, RouterStatus,
    TransportError,
};
