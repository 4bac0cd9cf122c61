//! Termination signals for `flowforge run`.
//!
//! SIGINT goes through `ctrlc`; SIGTERM gets a plain handler. Both only
//! record the signal number, and a forwarder thread hands it to the
//! controller so the incident names the signal that actually arrived.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use flowforge_core::task::TaskHandle;
use flowforge_core::ShutdownHandle;

const FORWARD_POLL: Duration = Duration::from_millis(50);

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::SeqCst);
}

/// Takes the recorded signal, if any.
fn take_pending() -> Option<i32> {
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        signal => Some(signal),
    }
}

/// Installs the handlers and starts forwarding to `shutdown`. Dropping the
/// returned handle stops the forwarder.
pub fn forward_to(shutdown: ShutdownHandle) -> Option<TaskHandle> {
    if let Err(err) = ctrlc::set_handler(|| record_signal(libc::SIGINT)) {
        warn!(error = %err, "Failed to install SIGINT handler");
    }
    // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
    let previous = unsafe {
        libc::signal(
            libc::SIGTERM,
            record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        )
    };
    if previous == libc::SIG_ERR {
        warn!("Failed to install SIGTERM handler");
    }

    let spawned = TaskHandle::spawn("signals", move |token| {
        while !token.wait_timeout(FORWARD_POLL) {
            if let Some(signal) = take_pending() {
                info!(signal, "Termination signal received");
                shutdown.request(signal);
            }
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "Failed to start signal forwarder");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_signal_is_taken_once() {
        record_signal(libc::SIGTERM);
        assert_eq!(take_pending(), Some(libc::SIGTERM));
        assert_eq!(take_pending(), None);
    }
}
