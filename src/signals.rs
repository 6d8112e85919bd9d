//! Process signal plumbing
//!
//! Signal handlers only flip atomics; all real work happens on the threads
//! that poll them. The stop token is cloned into the drive loop and into
//! every audio device thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Requests a replay save. Set from the SIGUSR1 handler, consumed (swapped
/// back to false) once per drive-loop iteration.
static SAVE_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);

        // Lock briefly so waiters observe the flag before the notify
        let _guard = self.shared.mutex.lock().unwrap();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    /// Block until cancelled, or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: std::time::Duration) {
        let guard = self.shared.mutex.lock().unwrap();
        if !self.cancelled() {
            let _ = self.shared.condvar.wait_timeout(guard, timeout).unwrap();
        }
    }
}

impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

/// Take the pending save request, clearing it.
pub fn take_save_request() -> bool {
    SAVE_REQUESTED.swap(false, Ordering::Relaxed)
}

extern "C" fn save_handler(_: libc::c_int) {
    SAVE_REQUESTED.store(true, Ordering::Relaxed);
}

/// Install the stop (SIGINT/SIGTERM) and save-replay (SIGUSR1) handlers.
pub fn install(sos: &SignalOfStop) -> anyhow::Result<()> {
    let stop = sos.clone();
    ctrlc::set_handler(move || {
        stop.cancel();
    })?;

    unsafe {
        let handler = save_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGUSR1, handler);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_visible_across_clones() {
        let sos = SignalOfStop::new();
        let cloned = sos.clone();
        assert!(!cloned.cancelled());
        sos.cancel();
        assert!(cloned.cancelled());
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let handle = thread::spawn(move || {
            // Generous timeout; the cancel below should wake us early
            waiter.wait_timeout(Duration::from_secs(10));
            waiter.cancelled()
        });
        thread::sleep(Duration::from_millis(20));
        sos.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_save_request_is_consumed_once() {
        SAVE_REQUESTED.store(true, Ordering::Relaxed);
        assert!(take_save_request());
        assert!(!take_save_request());
    }
}
