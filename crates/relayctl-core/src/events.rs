//! Event subscription negotiation and notice classification.
//!
//! Daemons differ in which event types they support, and the only reliable
//! way to find out is to ask: submit the wanted set, and when the daemon
//! answers `Unrecognized event "X"`, drop `X` and try again. Any other
//! rejection abandons the attempt without applying anything.

use std::collections::{BTreeSet, HashSet};

use crate::transport::TransportError;

/// Events the session itself depends on, with what is lost without them.
pub const REQUIRED_EVENTS: [(&str, &str); 4] = [
    ("NOTICE", "this will be unable to detect when the daemon is shut down"),
    ("NEWDESC", "information related to descriptors will grow stale"),
    ("NS", "information related to the consensus will grow stale"),
    ("NEWCONSENSUS", "information related to the consensus will grow stale"),
];

/// Notice logged by the daemon when it re-reads its configuration.
pub const RELOAD_NOTICE_PREFIX: &str = "Received reload signal (hup)";

/// Notices logged by the daemon when its external address changes.
pub const ADDRESS_CHANGED_PREFIXES: [&str; 2] =
    ["Our IP Address has changed from", "Guessed our IP address as"];

/// Transport log line emitted when the daemon hangs up on us.
pub const TRANSPORT_CLOSED_MSG: &str = "closed control connection. Exiting event thread.";

/// Consequence text for a required event, if `name` is one.
pub fn required_event_consequence(name: &str) -> Option<&'static str> {
    REQUIRED_EVENTS
        .iter()
        .find(|(event, _)| *event == name)
        .map(|(_, consequence)| *consequence)
}

/// Extract the rejected event type from an `Unrecognized event "X"` reply.
pub fn parse_unrecognized_event(reply: &str) -> Option<&str> {
    if !reply.contains("Unrecognized event") {
        return None;
    }
    let start = reply.find("event \"")? + "event \"".len();
    let end = reply.rfind('"')?;
    (end > start).then(|| &reply[start..end])
}

pub fn is_reload_notice(message: &str) -> bool {
    message.starts_with(RELOAD_NOTICE_PREFIX)
}

pub fn is_address_change(message: &str) -> bool {
    ADDRESS_CHANGED_PREFIXES
        .iter()
        .any(|prefix| message.starts_with(prefix))
}

pub fn is_transport_closed(message: &str) -> bool {
    message.contains(TRANSPORT_CLOSED_MSG)
}

/// Outcome of a completed negotiation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// Event types now subscribed.
    pub applied: BTreeSet<String>,
    /// Requested event types the daemon does not support.
    pub unavailable: BTreeSet<String>,
}

/// A negotiation stopped by an error other than an unsupported event.
#[derive(Debug)]
pub struct Abandoned {
    /// Unsupported types discovered before stopping.
    pub unavailable: BTreeSet<String>,
    pub error: TransportError,
}

/// Work out and apply the subscribable subset of `requested`.
///
/// `known_failed` holds types rejected earlier in the session and is skipped
/// without asking again. `available` is the daemon's `events/names` listing,
/// when it could be fetched. `submit` issues the subscription request.
pub fn negotiate<F>(
    requested: &BTreeSet<String>,
    known_failed: &HashSet<String>,
    available: Option<&str>,
    mut submit: F,
) -> Result<Negotiation, Abandoned>
where
    F: FnMut(&[String]) -> Result<(), TransportError>,
{
    let mut events: BTreeSet<String> = requested
        .iter()
        .cloned()
        .chain(REQUIRED_EVENTS.iter().map(|(name, _)| name.to_string()))
        .collect();

    let mut unavailable: BTreeSet<String> = events
        .iter()
        .filter(|name| known_failed.contains(*name))
        .cloned()
        .collect();
    events.retain(|name| !known_failed.contains(name));

    if let Some(available) = available {
        let available: HashSet<&str> = available.split_whitespace().collect();
        let (kept, dropped): (BTreeSet<String>, BTreeSet<String>) = events
            .into_iter()
            .partition(|name| available.contains(name.as_str()));
        events = kept;
        unavailable.extend(dropped);
    }

    loop {
        let attempt: Vec<String> = events.iter().cloned().collect();
        match submit(&attempt) {
            Ok(()) => {
                return Ok(Negotiation {
                    applied: events,
                    unavailable,
                });
            }
            Err(TransportError::Reply(reply)) => {
                let rejected = parse_unrecognized_event(&reply).map(str::to_string);
                match rejected {
                    Some(name) if events.remove(&name) => {
                        unavailable.insert(name);
                    }
                    _ => {
                        return Err(Abandoned {
                            unavailable,
                            error: TransportError::Reply(reply),
                        });
                    }
                }
            }
            Err(error) => return Err(Abandoned { unavailable, error }),
        }
    }
}
