//! Event handling and subscription negotiation.
//!
//! Handlers run on the transport's event thread. They only evict cached
//! state and never issue transport requests.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{ControlError, Controller, Locked, Shared, Status};
use crate::cache::Param;
use crate::events::{self, Abandoned, Negotiation};
use crate::logging::{self, LogListener};
use crate::transport::{ControlEvent, EventListener, LogSeverity, TransportError};

/// Parameters derived from our own consensus entry.
const CONSENSUS_PARAMS: [Param; 3] = [Param::Flags, Param::NsEntry, Param::BwMeasured];

/// Parameters derived from our own descriptor.
const DESCRIPTOR_PARAMS: [Param; 2] = [Param::DescEntry, Param::BwObserved];

/// The session's listener on the attached transport.
pub(crate) struct SessionEvents {
    shared: Weak<Shared>,
}

impl SessionEvents {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

impl EventListener for SessionEvents {
    fn on_event(&self, event: &ControlEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        *shared.heartbeat.lock() = Some(Instant::now());

        if let ControlEvent::Log {
            severity: LogSeverity::Notice,
            message,
        } = event
            && events::is_reload_notice(message)
        {
            shared.reload_observed.store(true, Ordering::SeqCst);
        }

        let listeners = {
            let mut session = shared.lock();
            session.invalidate(event);
            session.event_listeners.clone()
        };
        for listener in listeners {
            listener.on_event(event);
        }
    }

    fn on_transport_log(&self, severity: LogSeverity, message: &str) {
        logging::emit(severity, message);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let listeners: Vec<Arc<dyn LogListener>> = {
            let mut session = shared.lock();
            if events::is_address_change(message) {
                session.forget_address();
            }
            if events::is_transport_closed(message) {
                session.close_transition();
            }
            session.log_listeners.clone()
        };
        for listener in listeners {
            listener.on_log(severity, message);
        }
    }
}

impl Locked<'_> {
    /// Whether an update naming `fingerprints` concerns our own relay. Treated
    /// as yes when our fingerprint is not known.
    fn mentions_own<'f>(&self, mut fingerprints: impl Iterator<Item = &'f str>) -> bool {
        match self.params.text(Param::Fingerprint) {
            Some(own) => fingerprints.any(|fingerprint| fingerprint == own),
            None => true,
        }
    }

    fn forget_address(&mut self) {
        debug!("address changed");
        self.params.evict(&[Param::Address]);
        self.relays.clear_lookups();
    }

    fn invalidate(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::NewConsensus(entries) => {
                self.params.evict(&CONSENSUS_PARAMS);
                self.relays.on_consensus(entries);
            }
            ControlEvent::NetworkStatus(entries) => {
                if self.mentions_own(entries.iter().map(|entry| entry.fingerprint.as_str())) {
                    self.params.evict(&CONSENSUS_PARAMS);
                }
            }
            ControlEvent::NewDescriptor(fingerprints) => {
                if self.mentions_own(fingerprints.iter().map(String::as_str)) {
                    self.params.evict(&DESCRIPTOR_PARAMS);
                }
                self.relays.on_descriptors(fingerprints);
            }
            ControlEvent::CircuitStatus { .. } => self.relays.on_circuit_change(),
            ControlEvent::Log { severity, message } => {
                if *severity == LogSeverity::Notice
                    && events::is_reload_notice(message)
                    && self.transport.is_some()
                {
                    info!("daemon reloaded its configuration");
                    self.set_status(Status::Init);
                }
                if events::is_address_change(message) {
                    self.forget_address();
                }
            }
            ControlEvent::Other(_) => {}
        }
    }

    /// Subscribe to `requested` plus the required events, dropping types the
    /// daemon does not support.
    pub(super) fn negotiate_events(
        &mut self,
        requested: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, ControlError> {
        let transport = self.live_transport()?;
        let available = self.get_info("events/names").ok().flatten();
        let known_failed = if self.shared.session.drop_failed_events {
            self.failed_events.clone()
        } else {
            HashSet::new()
        };

        let outcome = events::negotiate(requested, &known_failed, available.as_deref(), |names| {
            transport.set_events(names)
        });
        let (result, unavailable) = match outcome {
            Ok(Negotiation {
                applied,
                unavailable,
            }) => (Ok(applied), unavailable),
            Err(Abandoned { unavailable, error }) => (Err(error), unavailable),
        };

        let newly_failed: Vec<String> = unavailable
            .into_iter()
            .filter(|name| self.failed_events.insert(name.clone()))
            .collect();

        match result {
            Ok(applied) => {
                for name in &newly_failed {
                    match events::required_event_consequence(name) {
                        Some(consequence) => {
                            error!(event = %name, "unsupported event type, {consequence}")
                        }
                        None => warn!(event = %name, "unsupported event type"),
                    }
                }
                debug!(events = ?applied, "event subscriptions applied");
                self.controller_events = applied.clone();
                Ok(applied)
            }
            Err(TransportError::Closed) => Err(self.fail(TransportError::Closed)),
            Err(err) => Err(ControlError::SubscriptionAbandoned(err.to_string())),
        }
    }
}

impl Controller {
    /// Subscribe to `events` (plus the events the session depends on).
    ///
    /// Returns the applied set. While detached the request is stored for the
    /// next [`init`](Controller::init) and returned as is.
    pub fn set_controller_events(&self, events: &[&str]) -> Result<BTreeSet<String>, ControlError> {
        let requested: BTreeSet<String> = events.iter().map(|name| name.to_string()).collect();
        let mut session = self.shared.lock();
        if session.live_transport().is_err() {
            session.controller_events = requested.clone();
            return Ok(requested);
        }
        session.negotiate_events(&requested)
    }

    /// Subscribed event types, or the pending request while detached.
    pub fn controller_events(&self) -> BTreeSet<String> {
        self.shared.state.lock().controller_events.clone()
    }
}
