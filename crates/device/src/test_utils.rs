//! Test utilities for the device session
//!
//! An in-memory host backend: [`MockContext`] queues completions and runs them
//! from `handle_events`, [`MockDevice`] serves descriptors and string tables
//! from a builder, and [`MockIo`] lets a test finish, fail or inspect the
//! transfers a session has in flight.
//!
//! # Example
//!
//! ```
//! use device::test_utils::{bulk_in, MockContext, MockDevice};
//!
//! let context = MockContext::new();
//! let device = MockDevice::builder(0x1234, 0x5678)
//!     .product("Widget")
//!     .interface(0, 0xFF, vec![bulk_in(0x81, 512)])
//!     .build(&context);
//! assert_eq!(device.io().submissions(), 0);
//! ```

use crate::backend::{
    BackendResult, Completion, CompletionFn, EventSource, RawDevice, RawHandle, TransferStatus,
};
use crate::descriptors::{
    ConfigDescriptor, DeviceDescriptor, EndpointAddress, EndpointDescriptor, EndpointType,
    Interface, InterfaceDescriptor, Speed,
};
use crate::transfers::{Transfer, TransferId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const DT_CONFIG: u8 = 0x02;
const DT_STRING: u8 = 0x03;
const DT_BOS: u8 = 0x0F;

const MANUFACTURER_INDEX: u8 = 1;
const PRODUCT_INDEX: u8 = 2;
const SERIAL_INDEX: u8 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `cond` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Bulk IN endpoint descriptor
pub fn bulk_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    endpoint(address | 0x80, EndpointType::Bulk, max_packet_size, 0)
}

/// Bulk OUT endpoint descriptor
pub fn bulk_out(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    endpoint(address & 0x7F, EndpointType::Bulk, max_packet_size, 0)
}

/// Interrupt IN endpoint descriptor
pub fn interrupt_in(address: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    endpoint(address | 0x80, EndpointType::Interrupt, max_packet_size, interval)
}

/// Isochronous IN endpoint descriptor
pub fn iso_in(address: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    endpoint(address | 0x80, EndpointType::Isochronous, max_packet_size, interval)
}

fn endpoint(address: u8, transfer_type: EndpointType, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address: EndpointAddress(address),
        transfer_type,
        max_packet_size,
        interval,
    }
}

// ============================================================================
// Event context
// ============================================================================

/// Event source that runs queued completions from `handle_events`
#[derive(Default)]
pub struct MockContext {
    queue: Mutex<VecDeque<(CompletionFn, Completion)>>,
    ready: Condvar,
}

impl MockContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, done: CompletionFn, completion: Completion) {
        lock(&self.queue).push_back((done, completion));
        self.ready.notify_all();
    }

    /// Completions waiting for the next `handle_events`
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl EventSource for MockContext {
    fn handle_events(&self, timeout: Duration) -> BackendResult<()> {
        let batch: Vec<_> = {
            let queue = lock(&self.queue);
            let (mut queue, _) = self
                .ready
                .wait_timeout_while(queue, timeout, |q| q.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
            queue.drain(..).collect()
        };

        for (done, completion) in batch {
            done(completion);
        }
        Ok(())
    }
}

// ============================================================================
// I/O state shared by a device and its handles
// ============================================================================

struct Pending {
    id: TransferId,
    endpoint: u8,
    capacity: usize,
    done: CompletionFn,
}

#[derive(Default)]
struct IoState {
    fail_submissions: bool,
    fail_open: bool,
    swallow_cancels: bool,
    claim_failures: Vec<u8>,
    claimed: Vec<u8>,
    pending: Vec<Pending>,
    submissions: usize,
    cancels: usize,
    opens: usize,
}

/// Test-side control over a mock device's transfers and claims
pub struct MockIo {
    context: Arc<MockContext>,
    state: Mutex<IoState>,
}

impl MockIo {
    fn state(&self) -> MutexGuard<'_, IoState> {
        lock(&self.state)
    }

    /// Make every following submission fail with `Io`
    pub fn fail_submissions(&self, fail: bool) {
        self.state().fail_submissions = fail;
    }

    /// Accept cancel requests without ever completing the transfer
    pub fn swallow_cancels(&self, swallow: bool) {
        self.state().swallow_cancels = swallow;
    }

    /// Make the next `open` calls fail with `Access`
    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Finish the oldest in-flight transfer on `endpoint`
    ///
    /// `data` is truncated to the transfer's buffer length. Returns false if
    /// nothing is in flight on that endpoint.
    pub fn complete(&self, endpoint: u8, status: TransferStatus, data: &[u8]) -> bool {
        let pending = {
            let mut state = self.state();
            match state.pending.iter().position(|p| p.endpoint == endpoint) {
                Some(index) => state.pending.remove(index),
                None => return false,
            }
        };
        let len = data.len().min(pending.capacity);
        self.context
            .push(pending.done, Completion::new(status, data[..len].to_vec()));
        true
    }

    /// Finish every in-flight transfer with `status` and no data
    pub fn complete_all(&self, status: TransferStatus) -> usize {
        let pending: Vec<Pending> = self.state().pending.drain(..).collect();
        let count = pending.len();
        for p in pending {
            self.context.push(p.done, Completion::new(status, Vec::new()));
        }
        count
    }

    /// Simulate unplugging: in-flight transfers fail with `NoDevice`
    pub fn disconnect(&self) -> usize {
        self.complete_all(TransferStatus::NoDevice)
    }

    /// Transfers submitted and not yet completed or cancelled
    pub fn in_flight(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_flight_on(&self, endpoint: u8) -> usize {
        self.state()
            .pending
            .iter()
            .filter(|p| p.endpoint == endpoint)
            .count()
    }

    /// Accepted submissions since the device was built
    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    /// Cancel requests that hit an in-flight transfer
    pub fn cancels(&self) -> usize {
        self.state().cancels
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    /// Interfaces currently claimed through any handle
    pub fn claimed(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }
}

// ============================================================================
// Device
// ============================================================================

struct DeviceData {
    bus_number: u8,
    address: u8,
    speed: Speed,
    descriptor: DeviceDescriptor,
    descriptor_readable: bool,
    config: ConfigDescriptor,
    /// Index of the only readable configuration
    config_index: u8,
    languages: Vec<u16>,
    strings: HashMap<u8, String>,
    bos: Option<Vec<u8>>,
    raw_config: Option<Vec<u8>>,
    io: Arc<MockIo>,
}

/// In-memory device served from builder data
pub struct MockDevice {
    data: Arc<DeviceData>,
}

/// Builder for [`MockDevice`]
pub struct MockDeviceBuilder {
    bus_number: u8,
    address: u8,
    speed: Speed,
    descriptor: DeviceDescriptor,
    descriptor_readable: bool,
    interfaces: Vec<InterfaceDescriptor>,
    config_index: u8,
    languages: Vec<u16>,
    strings: HashMap<u8, String>,
    bos: Option<Vec<u8>>,
    raw_config: Option<Vec<u8>>,
    claim_failures: Vec<u8>,
}

impl MockDevice {
    /// Full-speed USB 2.0 device with English (US) strings and no interfaces
    pub fn builder(vendor_id: u16, product_id: u16) -> MockDeviceBuilder {
        MockDeviceBuilder {
            bus_number: 1,
            address: 2,
            speed: Speed::Full,
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                max_packet_size: 64,
                vendor_id,
                product_id,
                device_version: 0x0100,
                num_configurations: 1,
                ..DeviceDescriptor::default()
            },
            descriptor_readable: true,
            interfaces: Vec::new(),
            config_index: 0,
            languages: vec![0x0409],
            strings: HashMap::new(),
            bos: None,
            raw_config: None,
            claim_failures: Vec::new(),
        }
    }

    pub fn io(&self) -> &Arc<MockIo> {
        &self.data.io
    }

    /// Open a handle without going through the trait object
    pub fn open_mock(&self) -> Arc<MockHandle> {
        self.data.io.state().opens += 1;
        Arc::new(MockHandle {
            data: Arc::clone(&self.data),
        })
    }
}

impl MockDeviceBuilder {
    pub fn location(mut self, bus_number: u8, address: u8) -> Self {
        self.bus_number = bus_number;
        self.address = address;
        self
    }

    pub fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn usb_version(mut self, bcd: u16) -> Self {
        self.descriptor.usb_version = bcd;
        self
    }

    /// bDeviceClass (9 = hub)
    pub fn device_class(mut self, class_code: u8) -> Self {
        self.descriptor.class_code = class_code;
        self
    }

    pub fn manufacturer(mut self, s: &str) -> Self {
        self.descriptor.manufacturer_string_index = Some(MANUFACTURER_INDEX);
        self.strings.insert(MANUFACTURER_INDEX, s.to_string());
        self
    }

    pub fn product(mut self, s: &str) -> Self {
        self.descriptor.product_string_index = Some(PRODUCT_INDEX);
        self.strings.insert(PRODUCT_INDEX, s.to_string());
        self
    }

    pub fn serial(mut self, s: &str) -> Self {
        self.descriptor.serial_number_string_index = Some(SERIAL_INDEX);
        self.strings.insert(SERIAL_INDEX, s.to_string());
        self
    }

    /// Supported languages; an empty list makes string descriptor 0 stall
    pub fn languages(mut self, languages: Vec<u16>) -> Self {
        self.languages = languages;
        self
    }

    /// Device descriptor reads fail with `Io`
    pub fn unreadable_descriptor(mut self) -> Self {
        self.descriptor_readable = false;
        self
    }

    /// Add interface `number` (alternate setting 0) to the only configuration
    pub fn interface(mut self, number: u8, class_code: u8, endpoints: Vec<EndpointDescriptor>) -> Self {
        self.interfaces.push(InterfaceDescriptor {
            interface_number: number,
            setting_number: 0,
            class_code,
            sub_class_code: 0,
            protocol_code: 0,
            description_string_index: None,
            endpoints,
        });
        self
    }

    /// Serve the configuration at `index`; lower indices fail to read
    pub fn config_index(mut self, index: u8) -> Self {
        self.config_index = index;
        self.descriptor.num_configurations = index + 1;
        self
    }

    /// Raw BOS descriptor served to GET_DESCRIPTOR(BOS)
    pub fn bos(mut self, raw: Vec<u8>) -> Self {
        self.bos = Some(raw);
        self
    }

    /// Raw configuration descriptor served to GET_DESCRIPTOR(CONFIG)
    pub fn raw_config(mut self, raw: Vec<u8>) -> Self {
        self.raw_config = Some(raw);
        self
    }

    /// Claiming `interface` fails with `Busy`
    pub fn fail_claim(mut self, interface: u8) -> Self {
        self.claim_failures.push(interface);
        self
    }

    pub fn build(self, context: &Arc<MockContext>) -> Arc<MockDevice> {
        let config = ConfigDescriptor {
            number: 1,
            max_power_ma: 100,
            self_powered: false,
            remote_wakeup: false,
            description_string_index: None,
            interfaces: self
                .interfaces
                .into_iter()
                .map(|alt| Interface {
                    number: alt.interface_number,
                    alt_settings: vec![alt],
                })
                .collect(),
        };

        let io = Arc::new(MockIo {
            context: Arc::clone(context),
            state: Mutex::new(IoState {
                claim_failures: self.claim_failures,
                ..IoState::default()
            }),
        });

        Arc::new(MockDevice {
            data: Arc::new(DeviceData {
                bus_number: self.bus_number,
                address: self.address,
                speed: self.speed,
                descriptor: self.descriptor,
                descriptor_readable: self.descriptor_readable,
                config,
                config_index: self.config_index,
                languages: self.languages,
                strings: self.strings,
                bos: self.bos,
                raw_config: self.raw_config,
                io,
            }),
        })
    }
}

impl RawDevice for MockDevice {
    fn bus_number(&self) -> u8 {
        self.data.bus_number
    }

    fn address(&self) -> u8 {
        self.data.address
    }

    fn speed(&self) -> Speed {
        self.data.speed
    }

    fn device_descriptor(&self) -> BackendResult<DeviceDescriptor> {
        if !self.data.descriptor_readable {
            return Err(rusb::Error::Io);
        }
        Ok(self.data.descriptor.clone())
    }

    fn config_descriptor(&self, index: u8) -> BackendResult<ConfigDescriptor> {
        if index == self.data.config_index {
            Ok(self.data.config.clone())
        } else {
            Err(rusb::Error::NotFound)
        }
    }

    fn active_config_value(&self) -> BackendResult<u8> {
        Ok(self.data.config.number)
    }

    fn open(&self) -> BackendResult<Arc<dyn RawHandle>> {
        if self.data.io.state().fail_open {
            return Err(rusb::Error::Access);
        }
        Ok(self.open_mock())
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Open handle onto a [`MockDevice`]
pub struct MockHandle {
    data: Arc<DeviceData>,
}

impl MockHandle {
    fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        let units: Vec<u16> = if index == 0 {
            if self.data.languages.is_empty() {
                return None;
            }
            self.data.languages.clone()
        } else {
            self.data.strings.get(&index)?.encode_utf16().collect()
        };

        let mut raw = vec![0u8, DT_STRING];
        for unit in units {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        raw[0] = raw.len().min(255) as u8;
        Some(raw)
    }
}

impl RawHandle for MockHandle {
    fn claim_interface(&self, interface: u8) -> BackendResult<()> {
        let mut state = self.data.io.state();
        if state.claim_failures.contains(&interface) {
            return Err(rusb::Error::Busy);
        }
        if !state.claimed.contains(&interface) {
            state.claimed.push(interface);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> BackendResult<()> {
        let mut state = self.data.io.state();
        match state.claimed.iter().position(|&n| n == interface) {
            Some(index) => {
                state.claimed.remove(index);
                Ok(())
            }
            None => Err(rusb::Error::NotFound),
        }
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> BackendResult<usize> {
        if request_type != REQUEST_TYPE_STANDARD_IN || request != REQUEST_GET_DESCRIPTOR {
            return Err(rusb::Error::NotSupported);
        }

        let descriptor_type = (value >> 8) as u8;
        let descriptor_index = (value & 0xFF) as u8;
        let raw = match descriptor_type {
            DT_STRING => self.string_descriptor(descriptor_index),
            DT_BOS => self.data.bos.clone(),
            DT_CONFIG if descriptor_index == self.data.config_index => self.data.raw_config.clone(),
            _ => None,
        }
        .ok_or(rusb::Error::Pipe)?;

        let n = raw.len().min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);
        Ok(n)
    }

    fn submit(&self, transfer: &Transfer, buffer: Vec<u8>, done: CompletionFn) -> BackendResult<()> {
        let mut state = self.data.io.state();
        if state.fail_submissions {
            return Err(rusb::Error::Io);
        }
        state.submissions += 1;
        state.pending.push(Pending {
            id: transfer.id(),
            endpoint: transfer.endpoint().raw(),
            capacity: buffer.len(),
            done,
        });
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> BackendResult<()> {
        let pending = {
            let mut state = self.data.io.state();
            let Some(index) = state.pending.iter().position(|p| p.id == id) else {
                return Ok(());
            };
            state.cancels += 1;
            if state.swallow_cancels {
                return Ok(());
            }
            state.pending.remove(index)
        };
        self.data.io.context.push(pending.done, Completion::cancelled());
        Ok(())
    }
}

// ============================================================================
// Presets
// ============================================================================

/// HID-style device: interface 0 with an 8-byte interrupt IN endpoint
pub fn mock_hid_device(context: &Arc<MockContext>) -> Arc<MockDevice> {
    MockDevice::builder(0x046d, 0xc077)
        .manufacturer("Test Manufacturer")
        .product("Test Mouse")
        .serial("SN000001")
        .interface(0, 0x03, vec![interrupt_in(0x81, 8, 10)])
        .build(context)
}

/// Vendor-class device: bulk IN 0x81 and bulk OUT 0x02 on interface 0
pub fn mock_bulk_device(context: &Arc<MockContext>) -> Arc<MockDevice> {
    MockDevice::builder(0x1234, 0x5678)
        .speed(Speed::High)
        .manufacturer("Test Manufacturer")
        .product("Bulk Widget")
        .serial("SN000002")
        .interface(0, 0xFF, vec![bulk_in(0x81, 512), bulk_out(0x02, 512)])
        .build(context)
}
