//! Scriptable in-memory control transport.
//!
//! [`MockTransport`] answers GETINFO/GETCONF from tables set up by the test,
//! counts every request, and lets the test push events and transport log
//! lines to the registered listeners as if they came from an event thread.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use relayctl_config::ControlConfig;
use relayctl_core::{
    Connector, ControlEvent, ControlTransport, EventListener, LogSeverity, ProcessSignaller,
    RouterStatus, TransportError,
};

/// Failure to inject into the next transport request.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Daemon error reply with this text.
    Reply(String),
    /// Socket-level error.
    Socket,
    /// The transport tore the connection down.
    Closed,
}

impl MockFailure {
    fn into_error(self) -> TransportError {
        match self {
            MockFailure::Reply(text) => TransportError::Reply(text),
            MockFailure::Socket => TransportError::Socket(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset",
            )),
            MockFailure::Closed => TransportError::Closed,
        }
    }
}

#[derive(Default)]
struct MockState {
    info: HashMap<String, String>,
    /// GETCONF replies keyed by lowercased option name.
    options: HashMap<String, Vec<(String, Option<String>)>>,
    network: Vec<RouterStatus>,
    unsupported_events: HashSet<String>,
    event_names: Option<String>,
    failures: Vec<MockFailure>,
    set_error: Option<String>,

    info_calls: HashMap<String, usize>,
    option_calls: HashMap<String, usize>,
    network_calls: usize,
    set_calls: Vec<Vec<(String, String)>>,
    signals: Vec<String>,
    event_requests: Vec<Vec<String>>,
    subscribed: Vec<String>,
}

/// An in-memory [`ControlTransport`].
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
    dead: AtomicBool,
    event_thread: Mutex<Option<ThreadId>>,
    close_calls: AtomicUsize,
    join_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_info(self, key: &str, value: &str) -> Self {
        self.set_info(key, value);
        self
    }

    pub fn with_option(self, key: &str, value: &str) -> Self {
        self.set_option_reply(key, &[(key, value)]);
        self
    }

    /// GETCONF reply for `key` made of several `(key, value)` lines.
    pub fn with_option_reply(self, key: &str, reply: &[(&str, &str)]) -> Self {
        self.set_option_reply(key, reply);
        self
    }

    pub fn with_relays(self, relays: Vec<RouterStatus>) -> Self {
        self.state.lock().network = relays;
        self
    }

    /// Reject subscriptions to `name` as an unrecognized event.
    pub fn with_unsupported_event(self, name: &str) -> Self {
        self.state.lock().unsupported_events.insert(name.to_string());
        self
    }

    /// Answer GETINFO `events/names` with this listing.
    pub fn with_event_names(self, names: &str) -> Self {
        self.state.lock().event_names = Some(names.to_string());
        self
    }

    pub fn set_info(&self, key: &str, value: &str) {
        self.state.lock().info.insert(key.to_string(), value.to_string());
    }

    /// Replace the network status listing.
    pub fn set_relays(&self, relays: Vec<RouterStatus>) {
        self.state.lock().network = relays;
    }

    pub fn remove_info(&self, key: &str) {
        self.state.lock().info.remove(key);
    }

    pub fn set_option_reply(&self, key: &str, reply: &[(&str, &str)]) {
        let reply = reply
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect();
        self.state.lock().options.insert(key.to_ascii_lowercase(), reply);
    }

    /// Fail the next request with `failure`.
    pub fn fail_next(&self, failure: MockFailure) {
        self.state.lock().failures.push(failure);
    }

    /// Reject the next SETCONF with this reply text.
    pub fn reject_next_set(&self, reply: &str) {
        self.state.lock().set_error = Some(reply.to_string());
    }

    /// Drop the connection without telling anyone.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Deliver `event` to the listeners on the calling thread, which becomes
    /// this transport's event thread.
    pub fn emit(&self, event: ControlEvent) {
        *self.event_thread.lock() = Some(thread::current().id());
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Deliver a NOTICE log event.
    pub fn emit_notice(&self, message: &str) {
        self.emit(ControlEvent::Log {
            severity: LogSeverity::Notice,
            message: message.to_string(),
        });
    }

    /// Report a transport diagnostic to the listeners.
    pub fn emit_log(&self, severity: LogSeverity, message: &str) {
        *self.event_thread.lock() = Some(thread::current().id());
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_transport_log(severity, message);
        }
    }

    pub fn info_calls(&self, key: &str) -> usize {
        self.state.lock().info_calls.get(key).copied().unwrap_or(0)
    }

    pub fn option_calls(&self, key: &str) -> usize {
        self.state
            .lock()
            .option_calls
            .get(&key.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn network_calls(&self) -> usize {
        self.state.lock().network_calls
    }

    pub fn set_calls(&self) -> Vec<Vec<(String, String)>> {
        self.state.lock().set_calls.clone()
    }

    pub fn signals(&self) -> Vec<String> {
        self.state.lock().signals.clone()
    }

    /// Every SETEVENTS request, including rejected ones.
    pub fn event_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().event_requests.clone()
    }

    /// Events from the last accepted SETEVENTS.
    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }

    fn check(&self, state: &mut MockState) -> Result<(), TransportError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match state.failures.pop() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }
}

impl ControlTransport for MockTransport {
    fn is_live(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn get_info(&self, key: &str) -> Result<Option<String>, TransportError> {
        let mut state = self.state.lock();
        *state.info_calls.entry(key.to_string()).or_default() += 1;
        self.check(&mut state)?;
        if key == "events/names" && state.event_names.is_some() {
            return Ok(state.event_names.clone());
        }
        Ok(state.info.get(key).cloned())
    }

    fn get_option(&self, key: &str) -> Result<Vec<(String, Option<String>)>, TransportError> {
        let mut state = self.state.lock();
        let lowered = key.to_ascii_lowercase();
        *state.option_calls.entry(lowered.clone()).or_default() += 1;
        self.check(&mut state)?;
        Ok(state
            .options
            .get(&lowered)
            .cloned()
            .unwrap_or_else(|| vec![(key.to_string(), None)]))
    }

    fn set_options(&self, pairs: &[(String, String)]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.set_calls.push(pairs.to_vec());
        self.check(&mut state)?;
        if let Some(reply) = state.set_error.take() {
            return Err(TransportError::Reply(reply));
        }

        let mut written: HashMap<String, Vec<(String, Option<String>)>> = HashMap::new();
        for (key, value) in pairs {
            let value = (!value.is_empty()).then(|| value.clone());
            written
                .entry(key.to_ascii_lowercase())
                .or_default()
                .push((key.clone(), value));
        }
        state.options.extend(written);
        Ok(())
    }

    fn send_signal(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.signals.push(name.to_string());
        self.check(&mut state)
    }

    fn set_events(&self, names: &[String]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.event_requests.push(names.to_vec());
        self.check(&mut state)?;
        if let Some(name) = names
            .iter()
            .find(|name| state.unsupported_events.contains(*name))
        {
            return Err(TransportError::Reply(format!(
                "552 Unrecognized event \"{name}\""
            )));
        }
        state.subscribed = names.to_vec();
        Ok(())
    }

    fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.lock().push(listener);
    }

    fn get_network_status(&self, filter: Option<&str>) -> Result<Vec<RouterStatus>, TransportError> {
        let mut state = self.state.lock();
        state.network_calls += 1;
        self.check(&mut state)?;
        let relays = match filter.and_then(|filter| filter.strip_prefix("id/")) {
            Some(fingerprint) => state
                .network
                .iter()
                .filter(|relay| relay.fingerprint == fingerprint)
                .cloned()
                .collect(),
            None => state.network.clone(),
        };
        Ok(relays)
    }

    fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn join_event_thread(&self) {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn event_thread(&self) -> Option<ThreadId> {
        *self.event_thread.lock()
    }
}

/// Hands out prepared transports, one per connection attempt.
#[derive(Default)]
pub struct MockConnector {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    /// Connections are served in the order given; once exhausted, connecting
    /// fails.
    pub fn new(transports: Vec<Arc<MockTransport>>) -> Self {
        let mut transports = transports;
        transports.reverse();
        Self {
            transports: Mutex::new(transports),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _config: &ControlConfig) -> Result<Arc<dyn ControlTransport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.transports.lock().pop() {
            Some(transport) => Ok(transport),
            None => Err(TransportError::Socket(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }
}

/// Records reload signals and optionally has the daemon confirm them.
#[derive(Default)]
pub struct MockSignaller {
    confirm_via: Option<Arc<MockTransport>>,
    error: Option<String>,
    pids: Mutex<Vec<u32>>,
}

impl MockSignaller {
    /// Signals succeed but the daemon never logs the reload.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Signals are followed by the daemon's reload notice on `transport`,
    /// delivered from a separate thread.
    pub fn confirming(transport: Arc<MockTransport>) -> Self {
        Self {
            confirm_via: Some(transport),
            ..Self::default()
        }
    }

    /// Signals fail with `error`.
    pub fn failing(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().clone()
    }
}

impl ProcessSignaller for MockSignaller {
    fn signal_reload(&self, pid: u32) -> Result<(), String> {
        self.pids.lock().push(pid);
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if let Some(transport) = &self.confirm_via {
            let transport = Arc::clone(transport);
            thread::spawn(move || {
                transport.emit_notice("Received reload signal (hup). Reloading config and resetting internal state.");
            });
        }
        Ok(())
    }
}
