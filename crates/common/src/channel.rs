//! Async channel bridge between the USB event pump and the Tokio runtime
//!
//! Completion handlers run on the event pump thread and must not block it,
//! so the sending side only ever uses `try_send`: when the runtime falls
//! behind, reports are dropped and counted instead of stalling USB I/O.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default bridge capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// Events from the event pump thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    /// Data received on an IN endpoint
    Report {
        /// Endpoint address, direction bit included
        endpoint: u8,
        data: Vec<u8>,
    },

    /// A transfer finished with an error status
    TransferError {
        endpoint: u8,
        status: String,
    },

    /// The session stopped delivering reports
    Stopped {
        reason: String,
    },
}

/// Sending half, used from completion handlers (never blocks)
#[derive(Clone)]
pub struct ReportSender {
    tx: Sender<ReportEvent>,
    dropped: Arc<AtomicU64>,
}

impl ReportSender {
    /// Queue an event; returns false if it was dropped
    pub fn send(&self, event: ReportEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, used from the Tokio runtime
pub struct ReportReceiver {
    rx: Receiver<ReportEvent>,
    dropped: Arc<AtomicU64>,
}

impl ReportReceiver {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<ReportEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take a queued event without waiting; still yields events queued
    /// before `close`
    pub fn try_recv(&self) -> Option<ReportEvent> {
        self.rx.try_recv().ok()
    }

    /// Events the sender had to drop so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events; further sends report failure
    pub fn close(&self) {
        self.rx.close();
    }
}

/// Create the report bridge
///
/// Returns (ReportSender for the pump thread, ReportReceiver for Tokio)
pub fn create_report_bridge(capacity: usize) -> (ReportSender, ReportReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    (
        ReportSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        ReportReceiver { rx, dropped },
    )
}
