//! USB device session layer
//!
//! Binds one USB device to a device-class strategy: reads and caches its
//! descriptors, claims the interfaces the class wants, keeps asynchronous
//! transfers running on their endpoints and pumps host library events on a
//! dedicated thread.
//!
//! The session talks to the host library through the traits in [`backend`].
//! [`rusb_backend`] implements them on libusb; [`test_utils`] provides an
//! in-memory backend for tests.

pub mod backend;
pub mod descriptors;
pub mod dump;
pub mod error;
pub mod options;
pub mod rusb_backend;
pub mod session;
pub mod test_utils;
pub mod transfers;
pub mod worker;

pub use backend::{Completion, EventSource, RawDevice, RawHandle, TransferStatus};
pub use descriptors::{
    DescriptorCatalog, DeviceDescriptor, DeviceIdentity, Direction, EndpointAddress,
    EndpointDescriptor, EndpointType, InterfaceDescriptor, Speed,
};
pub use error::{DescriptorError, Result, SessionError};
pub use options::SessionOptions;
pub use rusb_backend::{RusbContext, RusbDevice};
pub use session::{DeviceClass, DeviceSession, DispatchOutcome, WeakSession};
pub use transfers::{Transfer, TransferId, TransferKind, TransferSetup, TransferState};
pub use worker::EventPump;
