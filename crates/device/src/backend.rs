//! Host library seam
//!
//! The session never talks to libusb directly. It drives these three traits,
//! implemented for real hardware in [`crate::rusb_backend`] and by the mock
//! backend in [`crate::test_utils`].
//!
//! Contract for implementors:
//! - `RawHandle::submit` must not invoke the completion callback on the
//!   submitting thread; completions are delivered from
//!   `EventSource::handle_events`, exactly once per accepted submission.
//! - `RawHandle::cancel` on an id that is not in flight returns `Ok(())`.
//! - A cancelled transfer still completes, with [`TransferStatus::Cancelled`].

use crate::descriptors::{ConfigDescriptor, DeviceDescriptor, Speed};
use crate::transfers::{Transfer, TransferId};
use std::sync::Arc;
use std::time::Duration;

/// Result type for host library calls
pub type BackendResult<T> = std::result::Result<T, rusb::Error>;

/// Final status of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// Data delivered to a completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: TransferStatus,
    /// Bytes actually transferred (truncated to the actual length)
    pub data: Vec<u8>,
}

impl Completion {
    pub fn new(status: TransferStatus, data: Vec<u8>) -> Self {
        Self { status, data }
    }

    pub fn cancelled() -> Self {
        Self::new(TransferStatus::Cancelled, Vec::new())
    }
}

/// Completion callback bound at submission time
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A host library context able to wait for and dispatch transfer events
pub trait EventSource: Send + Sync {
    /// Wait at most `timeout` for events, running any completion callbacks
    /// on the calling thread
    fn handle_events(&self, timeout: Duration) -> BackendResult<()>;
}

/// An enumerated, not necessarily opened, device
pub trait RawDevice: Send + Sync {
    fn bus_number(&self) -> u8;
    fn address(&self) -> u8;
    fn speed(&self) -> Speed;
    fn device_descriptor(&self) -> BackendResult<DeviceDescriptor>;
    fn config_descriptor(&self, index: u8) -> BackendResult<ConfigDescriptor>;
    /// bConfigurationValue of the active configuration
    fn active_config_value(&self) -> BackendResult<u8>;
    fn open(&self) -> BackendResult<Arc<dyn RawHandle>>;
}

/// An open device handle
pub trait RawHandle: Send + Sync {
    fn claim_interface(&self, interface: u8) -> BackendResult<()>;
    fn release_interface(&self, interface: u8) -> BackendResult<()>;

    /// Synchronous control IN transfer
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> BackendResult<usize>;

    /// Start an asynchronous transfer using `buffer` as its data stage
    fn submit(&self, transfer: &Transfer, buffer: Vec<u8>, done: CompletionFn) -> BackendResult<()>;

    /// Request cancellation of an in-flight transfer
    fn cancel(&self, id: TransferId) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_completion_is_empty() {
        let c = Completion::cancelled();
        assert_eq!(c.status, TransferStatus::Cancelled);
        assert!(c.data.is_empty());
        assert!(!c.status.is_success());
    }
}
