//! Boundary with the control-port transport library.
//!
//! The wire codec (socket framing, reply parsing, the event-reader thread)
//! lives outside this crate. A transport exposes the primitives below and
//! delivers parsed [`ControlEvent`]s and its own diagnostic log lines to the
//! [`EventListener`]s registered on it.
//!
//! ```text
//! ┌────────────┐  get_info / get_option / set_options  ┌──────────────┐
//! │ Controller │──────────────────────────────────────▶│  Transport   │
//! │            │◀──────────────────────────────────────│ (event thr.) │
//! └────────────┘     on_event / on_transport_log       └──────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use relayctl_config::ControlConfig;

/// Errors surfaced by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("{0}")]
    Reply(String),

    #[error("control connection closed")]
    Closed,
}

/// Severity of a transport log line or a daemon log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogSeverity {
    Debug,
    Info,
    Notice,
    Warn,
    Err,
}

impl LogSeverity {
    /// Parse a daemon runlevel label such as `"NOTICE"` or `"warn"`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "NOTICE" => Some(Self::Notice),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERR" | "ERROR" => Some(Self::Err),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warn => "WARN",
            Self::Err => "ERR",
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One relay's entry in the network status (consensus) listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStatus {
    pub nickname: String,
    /// Hex-encoded identity fingerprint.
    pub fingerprint: String,
    pub address: String,
    pub or_port: u16,
    pub flags: Vec<String>,
}

impl RouterStatus {
    pub fn new(
        nickname: impl Into<String>,
        fingerprint: impl Into<String>,
        address: impl Into<String>,
        or_port: u16,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            fingerprint: fingerprint.into(),
            address: address.into(),
            or_port,
            flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// A parsed asynchronous event from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// `NEWCONSENSUS`: a new consensus with every listed relay.
    NewConsensus(Vec<RouterStatus>),
    /// `NS`: status changes for a handful of relays.
    NetworkStatus(Vec<RouterStatus>),
    /// `NEWDESC`: fingerprints of relays that published new descriptors.
    NewDescriptor(Vec<String>),
    /// `CIRC`: a circuit changed state.
    CircuitStatus {
        id: String,
        status: String,
        path: Vec<String>,
    },
    /// `DEBUG`/`INFO`/`NOTICE`/`WARN`/`ERR` log events from the daemon.
    Log {
        severity: LogSeverity,
        message: String,
    },
    /// Any other event type, by name.
    Other(String),
}

impl ControlEvent {
    /// The event type name used when subscribing.
    pub fn name(&self) -> &str {
        match self {
            ControlEvent::NewConsensus(_) => "NEWCONSENSUS",
            ControlEvent::NetworkStatus(_) => "NS",
            ControlEvent::NewDescriptor(_) => "NEWDESC",
            ControlEvent::CircuitStatus { .. } => "CIRC",
            ControlEvent::Log { severity, .. } => severity.label(),
            ControlEvent::Other(name) => name,
        }
    }
}

/// Receives events from a transport's event thread.
///
/// Callbacks run on that thread and must not block on transport round-trips.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ControlEvent);

    /// Diagnostic output of the transport itself (not daemon events).
    fn on_transport_log(&self, _severity: LogSeverity, _message: &str) {}
}

/// An attached control connection.
pub trait ControlTransport: Send + Sync {
    /// Whether the connection is still usable.
    fn is_live(&self) -> bool;

    /// GETINFO for a single key. `None` if the daemon has no value.
    fn get_info(&self, key: &str) -> Result<Option<String>, TransportError>;

    /// GETCONF, returning every `(key, value)` pair of the reply.
    fn get_option(&self, key: &str) -> Result<Vec<(String, Option<String>)>, TransportError>;

    /// SETCONF with one or more `(key, value)` pairs.
    fn set_options(&self, pairs: &[(String, String)]) -> Result<(), TransportError>;

    fn set_option(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.set_options(&[(key.to_string(), value.to_string())])
    }

    /// SIGNAL, such as `RELOAD`.
    fn send_signal(&self, name: &str) -> Result<(), TransportError>;

    /// SETEVENTS with the full set of event names to receive.
    fn set_events(&self, names: &[String]) -> Result<(), TransportError>;

    fn add_event_listener(&self, listener: Arc<dyn EventListener>);

    /// Network status entries, optionally filtered (e.g. `id/<fingerprint>`).
    fn get_network_status(&self, filter: Option<&str>) -> Result<Vec<RouterStatus>, TransportError>;

    /// Shut the connection down.
    fn close(&self);

    /// Wait for the event thread to finish after [`close`](Self::close).
    fn join_event_thread(&self);

    /// Thread delivering this transport's events, if it runs one.
    fn event_thread(&self) -> Option<ThreadId>;
}

/// Opens new control connections.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ControlConfig) -> Result<Arc<dyn ControlTransport>, TransportError>;
}

/// Close `transport` and wait for its event thread, unless called from that
/// thread (which cannot join itself).
pub(crate) fn shut_down(transport: &dyn ControlTransport) {
    transport.close();
    if transport.event_thread() != Some(std::thread::current().id()) {
        transport.join_event_thread();
    }
}
