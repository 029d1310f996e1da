//! Message pump thread.
//!
//! One pump per session. A [`PumpDriver`] supplies the role-specific steps;
//! [`Pump`] owns the thread, the running flag, and the loop:
//!
//! ```text
//! start ──ok──► ┌─ process_commands
//!   │           │  poll_incoming_messages ──err──┐
//!   │           │  poll_connection_state_changes ├─► teardown (once) ─► exit
//!   │           └─ sleep(poll_interval) ◄────────┘
//!   └──err──► on_start_failed ─► teardown (once) ─► exit
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use net_protocol::TransportError;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;

/// Role-specific pump steps. Every method runs on the pump thread.
pub(crate) trait PumpDriver: Send + 'static {
    /// Bring the transport up and open the link or listen socket.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Record a fatal-at-start condition.
    fn on_start_failed(&mut self, err: &SessionError);

    /// Apply queued application commands.
    fn process_commands(&mut self) {}

    /// Drain inbound messages until none remain or `running` is cleared.
    /// An `Err` stops the pump.
    fn poll_incoming_messages(&mut self, running: &AtomicBool) -> Result<(), TransportError>;

    /// Drain status changes. Returns false when the session has nothing left
    /// to pump.
    fn poll_connection_state_changes(&mut self) -> bool;

    /// Close everything and release the transport. Called exactly once.
    fn teardown(&mut self);
}

pub(crate) struct Pump {
    config: SessionConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Pump {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the pump thread with the driver built by `make_driver`.
    /// Returns `Ok(false)` without building a driver if a pump is already running.
    pub fn start<D, F>(&self, make_driver: F) -> Result<bool, SessionError>
    where
        D: PumpDriver,
        F: FnOnce() -> D,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Pump already running");
            return Ok(false);
        }

        let mut thread = self.thread.lock();
        if let Some(previous) = thread.take() {
            join_unless_current(previous);
        }

        let driver = make_driver();
        let running = Arc::clone(&self.running);
        let interval = self.config.poll_interval;
        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run(driver, &running, interval));

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(SessionError::ThreadSpawn(e))
            }
        }
    }

    /// Clear the running flag and wait for the pump to finish. From the pump
    /// thread itself this only clears the flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = {
            let mut thread = self.thread.lock();
            match thread.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                _ => thread.take(),
            }
        };
        if let Some(handle) = handle {
            join_unless_current(handle);
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("Pump thread panicked");
    }
}

fn run<D: PumpDriver>(mut driver: D, running: &AtomicBool, interval: std::time::Duration) {
    if let Err(e) = driver.start() {
        error!("Session failed to start: {e}");
        driver.on_start_failed(&e);
        driver.teardown();
        running.store(false, Ordering::Release);
        return;
    }

    while running.load(Ordering::Acquire) {
        driver.process_commands();

        if let Err(e) = driver.poll_incoming_messages(running) {
            error!("Error receiving messages: {e}");
            break;
        }

        if !driver.poll_connection_state_changes() {
            break;
        }

        if running.load(Ordering::Acquire) {
            thread::sleep(interval);
        }
    }

    driver.teardown();
    running.store(false, Ordering::Release);
    debug!("Pump exited");
}
