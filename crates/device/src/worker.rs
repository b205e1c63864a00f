//! Event pump thread
//!
//! Dedicated thread that runs the host library's event loop for one session.
//! Each iteration waits at most one timeout interval, so a stop request is
//! seen promptly even when no I/O is pending. Completion callbacks run on this
//! thread from inside `handle_events`.

use crate::backend::EventSource;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Back-off after an unexpected event-handling error
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Running event pump
///
/// Stopping joins the thread, so once [`EventPump::stop`] returns no further
/// completion callback can run. Dropping a pump stops it.
pub struct EventPump {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl EventPump {
    /// Spawn the pump thread
    pub fn start(source: Arc<dyn EventSource>, timeout: Duration) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || run(source, flag, timeout))?;
        let thread_id = thread.thread().id();

        debug!("Event pump started ({:?} timeout)", timeout);
        Ok(Self {
            running,
            thread: Some(thread),
            thread_id,
        })
    }

    /// True while the loop has not been asked to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// True when called from inside a completion callback on this pump
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Ask the loop to exit after the current iteration
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Signal the loop and wait for the thread to exit
    ///
    /// Called from the pump thread itself this only signals: the loop exits
    /// once the running callback returns, and the thread is joined when the
    /// pump is next stopped or dropped from another thread.
    pub fn stop(&mut self) {
        self.request_stop();

        if self.is_current_thread() {
            debug!("Event pump stop requested from its own thread");
            return;
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Event pump thread panicked");
            }
            debug!("Event pump joined");
        }
    }

    /// True once the thread has been joined
    pub fn is_joined(&self) -> bool {
        self.thread.is_none()
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(source: Arc<dyn EventSource>, running: Arc<AtomicBool>, timeout: Duration) {
    info!("USB event pump running");

    while running.load(Ordering::Acquire) {
        match source.handle_events(timeout) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                // Transient failures are retried; a dead device surfaces through
                // transfer completions instead
                warn!("Error handling USB events: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    // Reap completions for transfers cancelled by the teardown that stopped us
    if let Err(e) = source.handle_events(timeout) {
        debug!("Final event pass: {}", e);
    }

    info!("USB event pump stopped");
}
