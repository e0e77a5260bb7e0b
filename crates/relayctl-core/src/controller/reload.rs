//! Configuration reloads.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{ControlError, Controller};
use crate::cache::{CachedValue, Param};

impl Controller {
    /// Have the daemon reload its configuration, either with a `RELOAD`
    /// signal over the control port or, if `via_signal`, with `SIGHUP`.
    ///
    /// `SIGHUP` gives no acknowledgement, so that path waits (up to
    /// `session.reload_confirm_timeout_ms`) for the daemon to log the reload
    /// and fails with [`ControlError::ReloadUnconfirmed`] if it does not.
    /// Cached parameters are discarded on success.
    pub fn reload(&self, via_signal: bool) -> Result<(), ControlError> {
        if via_signal {
            self.reload_via_signal()?;
        } else {
            self.reload_in_band()?;
        }

        let mut session = self.shared.lock();
        session.clear_caches();
        session.rebuild_exit_policy();
        info!(via_signal, "configuration reloaded");
        Ok(())
    }

    fn reload_in_band(&self) -> Result<(), ControlError> {
        let mut session = self.shared.lock();
        let transport = session.live_transport()?;
        transport
            .send_signal("RELOAD")
            .map_err(|err| session.fail(err))
    }

    fn reload_via_signal(&self) -> Result<(), ControlError> {
        let pid = {
            let mut session = self.shared.lock();
            session.live_transport()?;
            match session.relay_attr(Param::Pid) {
                Some(CachedValue::Number(pid)) => u32::try_from(pid).ok(),
                _ => None,
            }
        };
        let Some(pid) = pid else {
            return Err(ControlError::ReloadUnconfirmed(
                "unable to determine the daemon's pid".to_string(),
            ));
        };

        self.shared.reload_observed.store(false, Ordering::SeqCst);
        let signal_error = self.shared.signaller.signal_reload(pid).err();
        if let Some(err) = &signal_error {
            warn!(pid, error = %err, "unable to signal daemon");
        }

        // The daemon's reload notice arrives on the event thread, so wait
        // without holding the session lock.
        let config = &self.shared.session;
        let timeout = Duration::from_millis(config.reload_confirm_timeout_ms);
        let step = Duration::from_millis(config.reload_poll_interval_ms);
        let started = Instant::now();
        loop {
            if self.shared.reload_observed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            thread::sleep(step.min(timeout - elapsed));
        }

        Err(ControlError::ReloadUnconfirmed(
            signal_error.unwrap_or_else(|| "failed silently".to_string()),
        ))
    }
}
