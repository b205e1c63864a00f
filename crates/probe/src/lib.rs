//! USB probe
//!
//! Lists devices, dumps their descriptors and watches IN endpoints through a
//! [`device::DeviceSession`].

pub mod class;
pub mod config;
pub mod devices;
