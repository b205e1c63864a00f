//! libusb backend
//!
//! Implements the backend traits on top of rusb. Descriptor access and
//! control requests go through rusb's safe API. Asynchronous transfers use
//! the libusb transfer API directly through `rusb::ffi`, since rusb only
//! exposes synchronous I/O.

use crate::backend::{
    BackendResult, Completion, CompletionFn, EventSource, RawDevice, RawHandle, TransferStatus,
};
use crate::descriptors::{
    ConfigDescriptor, DeviceDescriptor, EndpointAddress, EndpointDescriptor, EndpointType,
    Interface, InterfaceDescriptor, Speed,
};
use crate::transfers::{Transfer, TransferId, TransferKind};
use rusb::constants::*;
use rusb::ffi;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pointer to a submitted libusb transfer
struct RawTransfer(*mut ffi::libusb_transfer);

// SAFETY: the pointer is only dereferenced by libusb and by the completion
// callback, which removes it from the in-flight map before freeing it.
unsafe impl Send for RawTransfer {}

/// libusb handle plus the transfers submitted on it
///
/// Every in-flight transfer holds a reference, so the device is closed only
/// after libusb has handed back the last of them.
struct OpenHandle {
    handle: Mutex<Option<DeviceHandle<Context>>>,
    in_flight: Mutex<HashMap<TransferId, RawTransfer>>,
}

impl OpenHandle {
    fn new(handle: Option<DeviceHandle<Context>>) -> Self {
        Self {
            handle: Mutex::new(handle),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Ask libusb to cancel everything still in flight
    fn cancel_all(&self) -> usize {
        let in_flight = lock(&self.in_flight);
        for (id, raw) in in_flight.iter() {
            // SAFETY: still registered, so not yet freed
            match unsafe { ffi::libusb_cancel_transfer(raw.0) } {
                0 | LIBUSB_ERROR_NOT_FOUND => {}
                rc => debug!("Cancel of transfer {} failed: {}", id, error_from_code(rc)),
            }
        }
        in_flight.len()
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        if lock(&self.handle).is_some() {
            debug!("Closing device handle");
        }
    }
}

/// State reclaimed by the completion callback
struct InFlight {
    id: TransferId,
    buffer: Vec<u8>,
    iso_packets: c_int,
    open: Arc<OpenHandle>,
    done: CompletionFn,
}

// ============================================================================
// Context
// ============================================================================

/// libusb context driving event handling for every session created from it
#[derive(Clone)]
pub struct RusbContext {
    context: Context,
}

impl RusbContext {
    pub fn new() -> BackendResult<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Enumerate the devices currently attached
    pub fn devices(&self) -> BackendResult<Vec<RusbDevice>> {
        let list = self.context.devices()?;
        Ok(list.iter().map(RusbDevice::new).collect())
    }
}

impl EventSource for RusbContext {
    fn handle_events(&self, timeout: Duration) -> BackendResult<()> {
        self.context.handle_events(Some(timeout))
    }
}

// ============================================================================
// Device
// ============================================================================

/// Enumerated libusb device
pub struct RusbDevice {
    device: Device<Context>,
}

impl RusbDevice {
    pub fn new(device: Device<Context>) -> Self {
        Self { device }
    }
}

impl RawDevice for RusbDevice {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn speed(&self) -> Speed {
        map_device_speed(self.device.speed())
    }

    fn device_descriptor(&self) -> BackendResult<DeviceDescriptor> {
        Ok(convert_device_descriptor(&self.device.device_descriptor()?))
    }

    fn config_descriptor(&self, index: u8) -> BackendResult<ConfigDescriptor> {
        Ok(convert_config_descriptor(&self.device.config_descriptor(index)?))
    }

    fn active_config_value(&self) -> BackendResult<u8> {
        Ok(self.device.active_config_descriptor()?.number())
    }

    fn open(&self) -> BackendResult<Arc<dyn RawHandle>> {
        let handle = self.device.open()?;
        debug!(
            "Opened device on bus {} address {}",
            self.device.bus_number(),
            self.device.address()
        );
        Ok(Arc::new(RusbHandle {
            open: Arc::new(OpenHandle::new(Some(handle))),
            detached: Mutex::new(Vec::new()),
        }))
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Open libusb device handle
pub struct RusbHandle {
    open: Arc<OpenHandle>,
    /// Interfaces whose kernel driver we detached
    detached: Mutex<Vec<u8>>,
}

impl RusbHandle {
    fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut DeviceHandle<Context>) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut guard = lock(&self.open.handle);
        let handle = guard.as_mut().ok_or(rusb::Error::NoDevice)?;
        f(handle)
    }
}

impl RawHandle for RusbHandle {
    fn claim_interface(&self, interface: u8) -> BackendResult<()> {
        self.with_handle(|handle| {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    match handle.detach_kernel_driver(interface) {
                        Ok(()) => lock(&self.detached).push(interface),
                        Err(e) => warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        ),
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(
                    "Kernel driver check on interface {} not supported: {}",
                    interface, e
                ),
            }
            handle.claim_interface(interface)
        })
    }

    fn release_interface(&self, interface: u8) -> BackendResult<()> {
        self.with_handle(|handle| {
            let result = handle.release_interface(interface);

            let mut detached = lock(&self.detached);
            if let Some(index) = detached.iter().position(|&n| n == interface) {
                detached.remove(index);
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            }
            result
        })
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> BackendResult<usize> {
        self.with_handle(|handle| handle.read_control(request_type, request, value, index, buf, timeout))
    }

    fn submit(&self, transfer: &Transfer, mut buffer: Vec<u8>, done: CompletionFn) -> BackendResult<()> {
        let (transfer_type, iso_packets) = match transfer.kind() {
            TransferKind::Interrupt => (LIBUSB_TRANSFER_TYPE_INTERRUPT, 0),
            TransferKind::Bulk => (LIBUSB_TRANSFER_TYPE_BULK, 0),
            TransferKind::Isochronous { packets } => (
                LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
                c_int::try_from(packets).map_err(|_| rusb::Error::InvalidParam)?,
            ),
        };
        let length = c_int::try_from(buffer.len()).map_err(|_| rusb::Error::InvalidParam)?;
        let id = transfer.id();

        // SAFETY: plain allocation, checked for null below
        let raw = unsafe { ffi::libusb_alloc_transfer(iso_packets) };
        if raw.is_null() {
            return Err(rusb::Error::NoMem);
        }

        // The Vec's heap storage does not move when the Vec is boxed
        let buffer_ptr = buffer.as_mut_ptr();
        let user_data = Box::into_raw(Box::new(InFlight {
            id,
            buffer,
            iso_packets,
            open: Arc::clone(&self.open),
            done,
        }));

        {
            let guard = lock(&self.open.handle);
            let Some(handle) = guard.as_ref() else {
                // SAFETY: never submitted; reclaim what we allocated
                unsafe {
                    drop(Box::from_raw(user_data));
                    ffi::libusb_free_transfer(raw);
                }
                return Err(rusb::Error::NoDevice);
            };

            // SAFETY: `raw` was allocated with room for `iso_packets` packet
            // descriptors and is exclusively ours until submitted
            unsafe {
                (*raw).dev_handle = handle.as_raw();
                (*raw).endpoint = transfer.endpoint().raw();
                (*raw).transfer_type = transfer_type;
                (*raw).timeout = 0;
                (*raw).length = length;
                (*raw).buffer = buffer_ptr;
                (*raw).callback = transfer_finished;
                (*raw).user_data = user_data.cast();
                (*raw).num_iso_packets = iso_packets;

                if iso_packets > 0 {
                    let per_packet = (length / iso_packets) as u32;
                    let descs = std::ptr::addr_of_mut!((*raw).iso_packet_desc)
                        .cast::<ffi::libusb_iso_packet_descriptor>();
                    for i in 0..iso_packets as usize {
                        (*descs.add(i)).length = per_packet;
                    }
                }
            }
        }

        lock(&self.open.in_flight).insert(id, RawTransfer(raw));

        // SAFETY: fully initialised above
        let rc = unsafe { ffi::libusb_submit_transfer(raw) };
        if rc != 0 {
            lock(&self.open.in_flight).remove(&id);
            // SAFETY: rejected by libusb, so the callback will never run
            unsafe {
                drop(Box::from_raw(user_data));
                ffi::libusb_free_transfer(raw);
            }
            return Err(error_from_code(rc));
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> BackendResult<()> {
        // Holding the map lock keeps the callback from freeing the transfer
        let in_flight = lock(&self.open.in_flight);
        let Some(raw) = in_flight.get(&id) else {
            return Ok(());
        };

        // SAFETY: still registered, so not yet freed
        match unsafe { ffi::libusb_cancel_transfer(raw.0) } {
            0 | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            rc => Err(error_from_code(rc)),
        }
    }
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        // The device closes once the last of these completes
        let pending = self.open.cancel_all();
        if pending > 0 {
            debug!(
                "Device handle dropped with {} transfer(s) in flight; closing after they complete",
                pending
            );
        }
    }
}

extern "system" fn transfer_finished(raw: *mut ffi::libusb_transfer) {
    // SAFETY: user_data came from Box::into_raw in `submit` and libusb calls
    // this exactly once per submitted transfer
    let state = unsafe { Box::from_raw((*raw).user_data.cast::<InFlight>()) };
    let InFlight {
        id,
        mut buffer,
        iso_packets,
        open,
        done,
    } = *state;

    lock(&open.in_flight).remove(&id);

    // SAFETY: `raw` stays valid until freed below
    let (status, actual_length) = unsafe { ((*raw).status, (*raw).actual_length) };

    if iso_packets > 0 {
        let per_packet = buffer.len() / iso_packets as usize;
        // SAFETY: allocated with `iso_packets` descriptors
        let descs = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!((*raw).iso_packet_desc).cast::<ffi::libusb_iso_packet_descriptor>(),
                iso_packets as usize,
            )
        };
        let mut data = Vec::with_capacity(buffer.len());
        for (i, desc) in descs.iter().enumerate() {
            let start = i * per_packet;
            let n = (desc.actual_length as usize).min(per_packet);
            data.extend_from_slice(&buffer[start..start + n]);
        }
        buffer = data;
    } else {
        buffer.truncate(actual_length.max(0) as usize);
    }

    // SAFETY: removed from the map, nothing else references it
    unsafe { ffi::libusb_free_transfer(raw) };

    let completion = Completion::new(map_transfer_status(status), buffer);
    if panic::catch_unwind(AssertUnwindSafe(|| done(completion))).is_err() {
        error!("Completion handler for transfer {} panicked", id);
    }

    // Closes the device if its session handle is already gone
    drop(open);
}

// ============================================================================
// Conversions
// ============================================================================

/// Map rusb speed to the session's speed type
fn map_device_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointType {
    match transfer_type {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}

/// Map a libusb transfer status code
fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map a libusb error code returned by the raw transfer API
fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

/// Rebuild the BCD word rusb decoded into a `Version`
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

fn convert_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: version_to_bcd(desc.usb_version()),
        class_code: desc.class_code(),
        sub_class_code: desc.sub_class_code(),
        protocol_code: desc.protocol_code(),
        max_packet_size: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: version_to_bcd(desc.device_version()),
        manufacturer_string_index: desc.manufacturer_string_index(),
        product_string_index: desc.product_string_index(),
        serial_number_string_index: desc.serial_number_string_index(),
        num_configurations: desc.num_configurations(),
    }
}

fn convert_config_descriptor(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    ConfigDescriptor {
        number: config.number(),
        max_power_ma: config.max_power(),
        self_powered: config.self_powered(),
        remote_wakeup: config.remote_wakeup(),
        description_string_index: config.description_string_index(),
        interfaces: config
            .interfaces()
            .map(|interface| Interface {
                number: interface.number(),
                alt_settings: interface
                    .descriptors()
                    .map(|alt| InterfaceDescriptor {
                        interface_number: alt.interface_number(),
                        setting_number: alt.setting_number(),
                        class_code: alt.class_code(),
                        sub_class_code: alt.sub_class_code(),
                        protocol_code: alt.protocol_code(),
                        description_string_index: alt.description_string_index(),
                        endpoints: alt
                            .endpoint_descriptors()
                            .map(|ep| EndpointDescriptor {
                                address: EndpointAddress(ep.address()),
                                transfer_type: map_transfer_type(ep.transfer_type()),
                                max_packet_size: ep.max_packet_size(),
                                interval: ep.interval(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}
