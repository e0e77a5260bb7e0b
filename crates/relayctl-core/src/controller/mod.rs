//! The control-port session.
//!
//! A [`Controller`] owns at most one attached transport and moves between two
//! states: [`Status::Init`] (attached and usable) and [`Status::Closed`].
//! Queries go through a per-session cache that is wiped on every transition
//! and selectively invalidated by daemon events.
//!
//! All session state sits behind one lock. It is held across transport
//! round-trips, so nothing that runs under it calls back into the session:
//! status listeners are notified from a worker thread, and transports
//! detached while the lock is held are shut down only once it is released.

mod dispatch;
mod relay;
mod reload;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use relayctl_config::{AppConfig, ControlConfig, ExitPolicy, SessionConfig};
use tracing::{debug, info, warn};

use crate::cache::{CachedValue, OptionCache, OptionShape, OptionValue, Param, ParamCache};
use crate::fingerprint::FingerprintResolver;
use crate::logging::{LogListener, SessionLog};
use crate::notifier::Notifier;
use crate::process::{NixSignaller, ProcessSignaller};
use crate::transport::{self, Connector, ControlTransport, EventListener, TransportError};

use dispatch::SessionEvents;

pub use relay::DEFAULT_DIR_AUTHORITIES;

/// Errors surfaced by the session.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no live control connection")]
    NotConnected,

    #[error("unable to connect: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("{0}")]
    Protocol(String),

    #[error("event subscription abandoned: {0}")]
    SubscriptionAbandoned(String),

    #[error("reload unconfirmed: {0}")]
    ReloadUnconfirmed(String),

    #[error("{candidates} relays match {address}")]
    AmbiguousIdentity { address: String, candidates: usize },

    #[error("no relay matches {0}")]
    UnknownRelay(String),
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Attached to a live transport.
    Init,
    /// No usable transport.
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Init => f.write_str("INIT"),
            Status::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Handle for removing a status listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Notified on the session's notification worker after each transition.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, controller: &Controller, status: Status);
}

impl<F> StatusListener for F
where
    F: Fn(&Controller, Status) + Send + Sync,
{
    fn on_status(&self, controller: &Controller, status: Status) {
        self(controller, status)
    }
}

/// Builds a [`Controller`].
pub struct ControllerBuilder {
    config: AppConfig,
    connector: Option<Arc<dyn Connector>>,
    signaller: Arc<dyn ProcessSignaller>,
}

impl ControllerBuilder {
    /// Connector used when [`Controller::init`] is given no transport.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the `SIGHUP` sender used by signal-based reloads.
    pub fn signaller(mut self, signaller: Arc<dyn ProcessSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn build(self) -> Result<Controller, ControlError> {
        let notifier = Notifier::spawn(
            "relayctl-status",
            self.config.session.notification_queue,
            deliver_status,
        )?;

        let transport_log = SessionLog::new(self.config.logging.transport_log_capacity);
        let mut state = SessionState::new();
        state.log_listeners.push(Arc::new(transport_log.clone()));

        let shared = Arc::new_cyclic(|this: &Weak<Shared>| Shared {
            this: this.clone(),
            events: Arc::new(SessionEvents::new(this.clone())),
            session: self.config.session,
            control: self.config.control,
            process_name: self.config.daemon.process_name,
            connector: self.connector,
            signaller: self.signaller,
            state: Mutex::new(state),
            transport_log,
            heartbeat: Mutex::new(None),
            reload_observed: AtomicBool::new(false),
            notifier,
        });

        Ok(Controller { shared })
    }
}

/// A control-port session. Cloning yields another handle to the same
/// session.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (status, _) = self.status();
        f.debug_struct("Controller").field("status", &status).finish()
    }
}

pub(crate) struct Shared {
    this: Weak<Shared>,
    /// Listener registered on every attached transport.
    events: Arc<dyn EventListener>,
    session: SessionConfig,
    control: ControlConfig,
    process_name: String,
    connector: Option<Arc<dyn Connector>>,
    signaller: Arc<dyn ProcessSignaller>,
    state: Mutex<SessionState>,
    /// Recent transport log lines, sized by `logging.transport_log_capacity`.
    transport_log: SessionLog,
    heartbeat: Mutex<Option<Instant>>,
    /// Set by the event thread when the daemon logs a reload.
    reload_observed: AtomicBool,
    notifier: Notifier<(Weak<Shared>, Status)>,
}

impl Shared {
    fn lock(&self) -> Locked<'_> {
        Locked {
            shared: self,
            state: self.state.lock(),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(transport) = self.state.get_mut().transport.take() {
            transport::shut_down(&*transport);
        }
    }
}

pub(crate) struct SessionState {
    transport: Option<Arc<dyn ControlTransport>>,
    status: Status,
    status_at: SystemTime,
    params: ParamCache,
    options: OptionCache,
    relays: FingerprintResolver,
    exit_policy: Option<Arc<ExitPolicy>>,
    exit_lookups: HashMap<(String, u16), bool>,
    /// Applied subscriptions, or the pending request while detached.
    controller_events: BTreeSet<String>,
    failed_events: HashSet<String>,
    event_listeners: Vec<Arc<dyn EventListener>>,
    status_listeners: Vec<(ListenerId, Arc<dyn StatusListener>)>,
    log_listeners: Vec<Arc<dyn LogListener>>,
    next_listener_id: u64,
    path_prefix_warned: bool,
    /// Detached transports awaiting shutdown once the lock is released.
    retired: Vec<Arc<dyn ControlTransport>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            transport: None,
            status: Status::Closed,
            status_at: SystemTime::now(),
            params: ParamCache::new(),
            options: OptionCache::new(),
            relays: FingerprintResolver::new(),
            exit_policy: None,
            exit_lookups: HashMap::new(),
            controller_events: BTreeSet::new(),
            failed_events: HashSet::new(),
            event_listeners: Vec::new(),
            status_listeners: Vec::new(),
            log_listeners: Vec::new(),
            next_listener_id: 0,
            path_prefix_warned: false,
            retired: Vec::new(),
        }
    }
}

/// Held session lock.
pub(crate) struct Locked<'a> {
    shared: &'a Shared,
    state: MutexGuard<'a, SessionState>,
}

impl Deref for Locked<'_> {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        if self.state.retired.is_empty() {
            return;
        }
        let retired = std::mem::take(&mut self.state.retired);
        MutexGuard::unlocked(&mut self.state, || {
            for transport in retired {
                transport::shut_down(&*transport);
            }
        });
    }
}

fn deliver_status((shared, status): (Weak<Shared>, Status)) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let listeners: Vec<Arc<dyn StatusListener>> = shared
        .state
        .lock()
        .status_listeners
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();

    let controller = Controller { shared };
    for listener in listeners {
        listener.on_status(&controller, status);
    }
}

/// Strip the boilerplate from a rejected SETCONF, turning
/// `513 Unacceptable option value: Value 'BandwidthRate la de da' is malformed`
/// into `Value 'la de da' is malformed`.
pub(crate) fn simplify_setconf_error(option: &str, reply: &str) -> String {
    const PREFIX: &str = "513 Unacceptable option value: ";
    let Some(rest) = reply.strip_prefix(PREFIX) else {
        return reply.to_string();
    };
    if rest.starts_with("Value '") {
        rest.replacen(&format!("{option} "), "", 1)
    } else {
        rest.to_string()
    }
}

fn same_transport(a: &Arc<dyn ControlTransport>, b: &Arc<dyn ControlTransport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Locked<'_> {
    /// The attached transport if it is still live. A dead one is detached.
    fn live_transport(&mut self) -> Result<Arc<dyn ControlTransport>, ControlError> {
        match &self.transport {
            Some(transport) if transport.is_live() => Ok(Arc::clone(transport)),
            Some(_) => {
                debug!("transport no longer live");
                self.close_transition();
                Err(ControlError::NotConnected)
            }
            None => Err(ControlError::NotConnected),
        }
    }

    /// Map a transport failure, detaching if the transport has closed.
    fn fail(&mut self, err: TransportError) -> ControlError {
        match err {
            TransportError::Closed => {
                self.close_transition();
                ControlError::NotConnected
            }
            TransportError::Socket(err) => ControlError::Transport(err),
            TransportError::Reply(text) => ControlError::Protocol(text),
        }
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
        self.status_at = SystemTime::now();
        self.clear_caches();
        if status == Status::Closed {
            info!("control port closed");
        }
        self.shared.notifier.post((self.shared.this.clone(), status));
    }

    fn clear_caches(&mut self) {
        self.params.clear();
        self.options.clear();
    }

    fn close_transition(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        self.retired.push(transport);
        self.relays.reset();
        self.exit_policy = None;
        self.exit_lookups.clear();
        self.set_status(Status::Closed);
    }

    fn get_info(&mut self, key: &str) -> Result<Option<String>, ControlError> {
        let transport = self.live_transport()?;
        let param = Param::from_info_key(key);
        if let Some(param) = param
            && self.params.get(param).is_some()
        {
            debug!(key, cached = true, runtime_ms = 0u64, "GETINFO");
            return Ok(self.params.text(param).map(str::to_string));
        }

        let started = Instant::now();
        let result = transport.get_info(key);
        let runtime_ms = started.elapsed().as_millis() as u64;
        debug!(key, cached = false, runtime_ms, "GETINFO");

        let value = match result {
            Ok(value) => value.filter(|value| !value.is_empty()),
            Err(err) => return Err(self.fail(err)),
        };
        if let Some(param) = param {
            self.params.store(param, value.clone().map(CachedValue::Text));
        }
        Ok(value)
    }

    fn get_option_shaped(
        &mut self,
        option: &str,
        shape: OptionShape,
    ) -> Result<Option<OptionValue>, ControlError> {
        let transport = self.live_transport()?;
        if let Some(cached) = self.options.get(option, shape) {
            let cached = cached.clone();
            debug!(key = option, cached = true, runtime_ms = 0u64, "GETCONF");
            return Ok(cached);
        }

        let shared = self.shared;
        let parent = shared.session.alias_for(option);
        let started = Instant::now();
        let result = transport.get_option(parent.unwrap_or(option));
        let runtime_ms = started.elapsed().as_millis() as u64;
        debug!(key = option, cached = false, runtime_ms, "GETCONF");

        let mut reply = match result {
            Ok(reply) => reply,
            Err(err) => return Err(self.fail(err)),
        };
        if parent.is_some() {
            reply.retain(|(key, _)| key.eq_ignore_ascii_case(option));
        }

        let value = OptionValue::from_reply(shape, reply);
        self.options.store(option, shape, value.clone());
        Ok(value)
    }

    fn get_option(&mut self, option: &str) -> Result<Option<String>, ControlError> {
        match self.get_option_shaped(option, OptionShape::Single)? {
            Some(OptionValue::Single(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    fn get_option_list(&mut self, option: &str) -> Result<Vec<String>, ControlError> {
        match self.get_option_shaped(option, OptionShape::List)? {
            Some(OptionValue::List(values)) => Ok(values),
            _ => Ok(Vec::new()),
        }
    }

    fn set_options(&mut self, option: &str, values: &[&str]) -> Result<(), ControlError> {
        let shared = self.shared;
        let transport = self.live_transport()?;

        self.options.evict(option);
        if let Some(parent) = shared.session.alias_for(option) {
            self.options.evict(parent);
        }
        for child in shared.session.aliases_of(option) {
            self.options.evict(child);
        }

        let pairs: Vec<(String, String)> = if values.is_empty() {
            vec![(option.to_string(), String::new())]
        } else {
            values
                .iter()
                .map(|value| (option.to_string(), value.to_string()))
                .collect()
        };

        let started = Instant::now();
        let result = transport.set_options(&pairs);
        let runtime_ms = started.elapsed().as_millis() as u64;
        let call = values.join(", ");

        match result {
            Ok(()) => info!(key = option, value = %call, runtime_ms, "SETCONF"),
            Err(TransportError::Reply(reply)) => {
                let message = simplify_setconf_error(option, &reply);
                info!(key = option, value = %call, runtime_ms, error = %message, "SETCONF failed");
                return Err(ControlError::Protocol(message));
            }
            Err(err) => {
                info!(key = option, value = %call, runtime_ms, error = %err, "SETCONF failed");
                return Err(self.fail(err));
            }
        }

        if option.eq_ignore_ascii_case("ExitPolicy")
            || option.eq_ignore_ascii_case("ExitPolicyRejectPrivate")
        {
            self.rebuild_exit_policy();
        }
        Ok(())
    }

    fn rebuild_exit_policy(&mut self) {
        self.exit_lookups.clear();
        self.exit_policy = if self.transport.is_some() {
            let entries = self.exit_policy_entries();
            match ExitPolicy::from_entries(&entries) {
                Ok(policy) => policy,
                Err(err) => {
                    warn!(error = %err, "unable to parse exit policy");
                    None
                }
            }
        } else {
            None
        };
    }

    fn exit_policy_entries(&mut self) -> Vec<String> {
        fn split(text: &str) -> impl Iterator<Item = String> + '_ {
            text.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
        }

        let mut entries = Vec::new();
        let reject_private = self
            .get_option("ExitPolicyRejectPrivate")
            .ok()
            .flatten()
            .is_none_or(|value| value.trim() != "0");
        if reject_private {
            entries.push("reject private:*".to_string());
            if let Ok(Some(address)) = self.get_info("address") {
                entries.push(format!("reject {address}:*"));
            }
        }

        for configured in self.get_option_list("ExitPolicy").unwrap_or_default() {
            entries.extend(split(&configured));
        }
        if let Ok(Some(default)) = self.get_info("exit-policy/default") {
            entries.extend(split(&default));
        }
        entries
    }
}

impl Controller {
    /// A session configured from `config`, with the default signaller and no
    /// connector.
    pub fn new(config: &AppConfig) -> Result<Self, ControlError> {
        Self::builder(config).build()
    }

    pub fn builder(config: &AppConfig) -> ControllerBuilder {
        ControllerBuilder {
            config: config.clone(),
            connector: None,
            signaller: Arc::new(NixSignaller),
        }
    }

    /// Attach `transport`, or one opened by the configured connector.
    ///
    /// A previously attached transport is detached and shut down first.
    /// Re-attaching the transport already in use is a no-op.
    pub fn init(&self, transport: Option<Arc<dyn ControlTransport>>) -> Result<(), ControlError> {
        let transport = match transport {
            Some(transport) => transport,
            None => {
                let connector = self
                    .shared
                    .connector
                    .as_ref()
                    .ok_or_else(|| ControlError::Connection("no connector configured".to_string()))?;
                connector
                    .connect(&self.shared.control)
                    .map_err(|err| ControlError::Connection(err.to_string()))?
            }
        };
        if !transport.is_live() {
            return Err(ControlError::Connection(
                "transport is not live".to_string(),
            ));
        }

        let mut session = self.shared.lock();
        if session.status == Status::Init
            && session
                .transport
                .as_ref()
                .is_some_and(|current| same_transport(current, &transport))
        {
            return Ok(());
        }

        session.close_transition();
        transport.add_event_listener(Arc::clone(&self.shared.events));
        session.transport = Some(transport);
        session.relays.reset();
        session.set_status(Status::Init);
        session.rebuild_exit_policy();

        let requested = session.controller_events.clone();
        if let Err(err) = session.negotiate_events(&requested) {
            warn!(error = %err, "unable to restore event subscriptions");
        }
        info!("attached to control port");
        Ok(())
    }

    /// Detach and shut down the transport, if any.
    pub fn close(&self) {
        self.shared.lock().close_transition();
    }

    /// Whether a live transport is attached. Detaches a dead one.
    pub fn is_alive(&self) -> bool {
        self.shared.lock().live_transport().is_ok()
    }

    /// Current status and when it was entered.
    pub fn status(&self) -> (Status, SystemTime) {
        let session = self.shared.state.lock();
        (session.status, session.status_at)
    }

    /// When the last event arrived from the daemon.
    pub fn heartbeat(&self) -> Option<Instant> {
        *self.shared.heartbeat.lock()
    }

    /// The attached transport, if live.
    pub fn transport(&self) -> Option<Arc<dyn ControlTransport>> {
        self.shared.lock().live_transport().ok()
    }

    /// GETINFO `key`, cached for the session when the key is cacheable.
    pub fn get_info(&self, key: &str) -> Result<Option<String>, ControlError> {
        self.shared.lock().get_info(key)
    }

    /// GETINFO `key`, or `default` if it fails or has no value.
    pub fn get_info_or(&self, key: &str, default: &str) -> String {
        self.get_info(key)
            .ok()
            .flatten()
            .unwrap_or_else(|| default.to_string())
    }

    /// First value of option `name`.
    pub fn get_option(&self, name: &str) -> Result<Option<String>, ControlError> {
        self.shared.lock().get_option(name)
    }

    pub fn get_option_or(&self, name: &str, default: &str) -> String {
        self.get_option(name)
            .ok()
            .flatten()
            .unwrap_or_else(|| default.to_string())
    }

    /// Every value of option `name`.
    pub fn get_option_list(&self, name: &str) -> Result<Vec<String>, ControlError> {
        self.shared.lock().get_option_list(name)
    }

    /// Every key returned for option `name` with its values.
    pub fn get_option_map(&self, name: &str) -> Result<BTreeMap<String, Vec<String>>, ControlError> {
        match self
            .shared
            .lock()
            .get_option_shaped(name, OptionShape::Map)?
        {
            Some(OptionValue::Map(map)) => Ok(map),
            _ => Ok(BTreeMap::new()),
        }
    }

    /// SETCONF `name` to `value`.
    pub fn set_option(&self, name: &str, value: &str) -> Result<(), ControlError> {
        self.shared.lock().set_options(name, &[value])
    }

    /// SETCONF `name` to several values. No values resets it to its default.
    pub fn set_options(&self, name: &str, values: &[&str]) -> Result<(), ControlError> {
        self.shared.lock().set_options(name, values)
    }

    /// The relay's effective exit policy, with aliases expanded.
    pub fn exit_policy(&self) -> Option<Arc<ExitPolicy>> {
        self.shared.state.lock().exit_policy.clone()
    }

    /// Whether the relay's exit policy lets traffic out to `address:port`.
    /// `false` when detached or no policy could be derived.
    pub fn is_exiting_allowed(&self, address: &str, port: u16) -> bool {
        let mut session = self.shared.lock();
        if session.live_transport().is_err() {
            return false;
        }
        let Some(policy) = session.exit_policy.clone() else {
            return false;
        };
        if !self.shared.session.exit_lookup_cache {
            return policy.check(address, port);
        }

        let key = (address.to_string(), port);
        if let Some(allowed) = session.exit_lookups.get(&key) {
            return *allowed;
        }
        let allowed = policy.check(address, port);
        session.exit_lookups.insert(key, allowed);
        allowed
    }

    /// Forward raw events to `listener`, across reconnects.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.shared.state.lock().event_listeners.push(listener);
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> ListenerId {
        let mut session = self.shared.state.lock();
        session.next_listener_id += 1;
        let id = ListenerId(session.next_listener_id);
        session.status_listeners.push((id, listener));
        id
    }

    /// Returns whether a listener was registered under `id`.
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut session = self.shared.state.lock();
        let before = session.status_listeners.len();
        session.status_listeners.retain(|(existing, _)| *existing != id);
        session.status_listeners.len() != before
    }

    /// Recent log lines from the transport, oldest first.
    pub fn transport_log(&self) -> &SessionLog {
        &self.shared.transport_log
    }

    /// Receive the transport's own log lines.
    pub fn add_log_listener(&self, listener: Arc<dyn LogListener>) {
        self.shared.state.lock().log_listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simplify_setconf_error() {
        assert_eq!(
            simplify_setconf_error(
                "BandwidthRate",
                "513 Unacceptable option value: Value 'BandwidthRate la de da' is malformed or out of bounds."
            ),
            "Value 'la de da' is malformed or out of bounds."
        );
        assert_eq!(
            simplify_setconf_error("ORPort", "513 Unacceptable option value: Invalid ORPort"),
            "Invalid ORPort"
        );
        assert_eq!(
            simplify_setconf_error("ORPort", "552 Unrecognized option"),
            "552 Unrecognized option"
        );
    }

    #[test]
    fn test_detached_session() {
        let controller = Controller::new(&AppConfig::default()).unwrap();

        assert!(!controller.is_alive());
        assert_eq!(controller.status().0, Status::Closed);
        assert!(matches!(
            controller.get_info("version"),
            Err(ControlError::NotConnected)
        ));
        assert_eq!(controller.get_info_or("version", "unknown"), "unknown");
        assert!(!controller.is_exiting_allowed("8.8.8.8", 80));
        assert!(controller.transport().is_none());
    }

    #[test]
    fn test_init_without_connector() {
        let controller = Controller::new(&AppConfig::default()).unwrap();
        assert!(matches!(
            controller.init(None),
            Err(ControlError::Connection(_))
        ));
    }

    #[test]
    fn test_listener_ids() {
        let controller = Controller::new(&AppConfig::default()).unwrap();
        let first = controller.add_status_listener(Arc::new(|_: &Controller, _: Status| {}));
        let second = controller.add_status_listener(Arc::new(|_: &Controller, _: Status| {}));

        assert_ne!(first, second);
        assert!(controller.remove_status_listener(first));
        assert!(!controller.remove_status_listener(first));
        assert!(controller.remove_status_listener(second));
    }
}
