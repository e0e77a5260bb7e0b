//! Bounded hand-off of notifications to a dedicated worker thread.
//!
//! Status changes are produced while the session lock is held, and a
//! listener is free to call straight back into the session. Delivery
//! therefore happens on a separate thread fed by a bounded queue: posting
//! never blocks, and a full queue drops the notification.

use std::io;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sending half of a notification worker.
///
/// The worker exits once every `Notifier` for it has been dropped and the
/// queue has drained.
#[derive(Debug)]
pub struct Notifier<T> {
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> Notifier<T> {
    /// Start a worker named `name` that passes each notification to `handler`.
    pub fn spawn<F>(name: &str, capacity: usize, mut handler: F) -> io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let worker = name.to_string();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Some(notification) = rx.blocking_recv() {
                handler(notification);
            }
            debug!(worker = %worker, "notification worker stopped");
        })?;

        Ok(Self { tx })
    }

    /// Queue `notification` without blocking. Returns `false` if it was
    /// dropped.
    pub fn post(&self, notification: T) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("notification queue full, dropping notification");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("notification worker gone, dropping notification");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_notifications_delivered_in_order() {
        let (done_tx, done_rx) = std_mpsc::channel();
        let notifier = Notifier::spawn("test-notify", 8, move |n: u32| {
            let _ = done_tx.send(n);
        })
        .unwrap();

        assert!(notifier.post(1));
        assert!(notifier.post(2));

        let timeout = Duration::from_secs(5);
        assert_eq!(done_rx.recv_timeout(timeout).unwrap(), 1);
        assert_eq!(done_rx.recv_timeout(timeout).unwrap(), 2);
    }

    #[test]
    fn test_full_queue_drops() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let (seen_tx, seen_rx) = std_mpsc::channel();
        let notifier = Notifier::spawn("test-notify-full", 1, move |n: u32| {
            let _ = seen_tx.send(n);
            let _ = gate_rx.recv();
        })
        .unwrap();

        assert!(notifier.post(1));
        // Wait until the worker holds the first one, blocked on the gate.
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

        assert!(notifier.post(2));
        assert!(!notifier.post(3));

        drop(gate_tx);
    }
}
