//! Transport log capture.
//!
//! The transport reports its own diagnostics as `(severity, message)` pairs.
//! These are re-emitted through `tracing` and handed to any registered
//! [`LogListener`]s, such as a [`SessionLog`] retaining recent lines for
//! display.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::transport::LogSeverity;

/// Receives translated transport log lines.
pub trait LogListener: Send + Sync {
    fn on_log(&self, severity: LogSeverity, message: &str);
}

impl<F> LogListener for F
where
    F: Fn(LogSeverity, &str) + Send + Sync,
{
    fn on_log(&self, severity: LogSeverity, message: &str) {
        self(severity, message)
    }
}

/// Re-emit a transport log line at the matching `tracing` level.
pub(crate) fn emit(severity: LogSeverity, message: &str) {
    match severity {
        LogSeverity::Debug => debug!(target: "relayctl::transport", "{message}"),
        LogSeverity::Info | LogSeverity::Notice => {
            info!(target: "relayctl::transport", "{message}")
        }
        LogSeverity::Warn => warn!(target: "relayctl::transport", "{message}"),
        LogSeverity::Err => error!(target: "relayctl::transport", "{message}"),
    }
}

/// A single retained log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Seconds since the log was created.
    pub elapsed_secs: f64,
    pub severity: LogSeverity,
    pub message: String,
}

#[derive(Debug)]
struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    start_time: Instant,
}

/// Bounded ring buffer of transport log lines.
///
/// Clones share the same buffer, so one can be registered on the session
/// while another is kept for reading.
#[derive(Debug, Clone)]
pub struct SessionLog {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                start_time: Instant::now(),
            })),
        }
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.buffer.lock().entries.iter().cloned().collect()
    }

    /// Retained lines at or above `severity`.
    pub fn at_least(&self, severity: LogSeverity) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.severity >= severity)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogListener for SessionLog {
    fn on_log(&self, severity: LogSeverity, message: &str) {
        let mut buf = self.buffer.lock();
        if buf.capacity == 0 {
            return;
        }
        if buf.entries.len() >= buf.capacity {
            buf.entries.pop_front();
        }
        let elapsed_secs = buf.start_time.elapsed().as_secs_f64();
        buf.entries.push_back(LogEntry {
            elapsed_secs,
            severity,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_log_ring_buffer() {
        let log = SessionLog::new(3);
        let reader = log.clone();

        for message in ["one", "two", "three", "four"] {
            log.on_log(LogSeverity::Info, message);
        }

        let entries = reader.entries();
        assert_eq!(entries.len(), 3);
        // "one" was evicted
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[2].message, "four");
    }

    #[test]
    fn test_severity_filter() {
        let log = SessionLog::new(10);
        log.on_log(LogSeverity::Debug, "noise");
        log.on_log(LogSeverity::Warn, "careful");
        log.on_log(LogSeverity::Err, "broken");

        let serious: Vec<String> = log
            .at_least(LogSeverity::Warn)
            .into_iter()
            .map(|entry| entry.message)
            .collect();
        assert_eq!(serious, vec!["careful", "broken"]);
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let log = SessionLog::new(0);
        log.on_log(LogSeverity::Err, "dropped");
        assert!(log.is_empty());
    }

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |severity: LogSeverity, message: &str| {
            sink.lock().push(format!("{severity}: {message}"));
        };

        listener.on_log(LogSeverity::Notice, "hello");
        emit(LogSeverity::Notice, "hello");
        assert_eq!(*seen.lock(), vec!["NOTICE: hello".to_string()]);
    }
}
