//! Common utilities for the USB session tools
//!
//! This crate provides functionality shared by the binaries: error handling,
//! logging setup, and the async channel bridge that carries reports from the
//! USB event pump thread into the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{ReportEvent, ReportReceiver, ReportSender, create_report_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
