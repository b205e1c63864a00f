//! Session error types

use thiserror::Error;

/// Errors raised while extracting descriptor records from raw bytes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Descriptor shorter than its header or declared length
    #[error("Descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Descriptor type byte did not match the requested record
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// The control request reading the descriptor failed
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Errors surfaced by [`crate::DeviceSession`] operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// No device is bound, or an argument was missing
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation needs an open device handle
    #[error("Device handle is not open")]
    NotOpen,

    /// Claiming an interface failed; earlier claims stay in place
    #[error("Failed to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// The engine could not submit or resubmit a transfer
    #[error("Failed to submit transfer on endpoint {endpoint:#04x}: {source}")]
    TransferSubmission {
        endpoint: u8,
        #[source]
        source: rusb::Error,
    },

    /// A required descriptor could not be read
    #[error("Descriptor read failed: {0}")]
    DescriptorRead(#[from] DescriptorError),

    /// Session is being torn down
    #[error("Session is shutting down")]
    ShuttingDown,

    /// Cancelled transfers did not complete within the drain timeout
    #[error("{remaining} transfer(s) still pending after drain timeout")]
    DrainTimeout { remaining: usize },

    /// One or more shutdown steps failed; every step was still attempted
    #[error("Shutdown incomplete: {}", join_errors(.0))]
    Shutdown(Vec<SessionError>),

    /// Any other host library failure
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Spawning the event pump thread failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[SessionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Type alias for session results
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_error_carries_interface() {
        let err = SessionError::Claim {
            interface: 3,
            source: rusb::Error::Busy,
        };
        let msg = err.to_string();
        assert!(msg.contains("interface 3"));
        assert!(matches!(err, SessionError::Claim { interface: 3, .. }));
    }

    #[test]
    fn test_shutdown_error_lists_every_step() {
        let err = SessionError::Shutdown(vec![
            SessionError::DrainTimeout { remaining: 2 },
            SessionError::Usb(rusb::Error::NoDevice),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 transfer(s)"));
        assert!(msg.contains("No such device"));
    }

    #[test]
    fn test_submission_error_display() {
        let err = SessionError::TransferSubmission {
            endpoint: 0x81,
            source: rusb::Error::Pipe,
        };
        assert!(err.to_string().contains("0x81"));
    }
}
