//! Descriptor catalog
//!
//! Owned copies of the device, configuration, interface and endpoint
//! descriptors, plus the optional extended records (BOS, USB 2.0 extension,
//! SuperSpeed capability and endpoint companions) and the string-table
//! lookups used to resolve manufacturer/product/serial names.
//!
//! Only the device descriptor is required. Everything else is advisory: a read
//! or parse failure is logged and leaves the field empty.

use crate::backend::{RawDevice, RawHandle};
use crate::error::DescriptorError;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Standard request: GET_DESCRIPTOR
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Device-to-host, standard, device recipient
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;

const DT_CONFIG: u8 = 0x02;
const DT_STRING: u8 = 0x03;
const DT_ENDPOINT: u8 = 0x05;
const DT_BOS: u8 = 0x0F;
const DT_DEVICE_CAPABILITY: u8 = 0x10;
const DT_SS_ENDPOINT_COMPANION: u8 = 0x30;

const CAP_USB2_EXTENSION: u8 = 0x02;
const CAP_SS_USB_DEVICE: u8 = 0x03;

const BOS_HEADER_LEN: usize = 5;
const CONFIG_HEADER_LEN: usize = 9;
const MAX_STRING_DESCRIPTOR_LEN: usize = 255;

/// Endpoint direction, taken from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Raw endpoint address (direction bit plus 4-bit endpoint number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    const DIRECTION_IN: u8 = 0x80;
    const NUMBER_MASK: u8 = 0x0F;

    /// IN endpoint address for endpoint number `n`
    pub const fn input(n: u8) -> Self {
        Self(Self::DIRECTION_IN | (n & Self::NUMBER_MASK))
    }

    /// OUT endpoint address for endpoint number `n`
    pub const fn output(n: u8) -> Self {
        Self(n & Self::NUMBER_MASK)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn direction(self) -> Direction {
        if self.0 & Self::DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(self) -> u8 {
        self.0 & Self::NUMBER_MASK
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction() {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        write!(f, "{:#04x} ({} {})", self.0, dir, self.number())
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Speed::Unknown => "unknown",
            Speed::Low => "low (1.5 Mbps)",
            Speed::Full => "full (12 Mbps)",
            Speed::High => "high (480 Mbps)",
            Speed::Super => "super (5 Gbps)",
            Speed::SuperPlus => "super+ (10 Gbps)",
        };
        f.write_str(s)
    }
}

/// Device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_string_index: Option<u8>,
    pub product_string_index: Option<u8>,
    pub serial_number_string_index: Option<u8>,
    pub num_configurations: u8,
}

/// Configuration descriptor with its interface tree
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDescriptor {
    /// bConfigurationValue
    pub number: u8,
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub description_string_index: Option<u8>,
    pub interfaces: Vec<Interface>,
}

impl ConfigDescriptor {
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.number == number)
    }
}

/// One interface and its alternate settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub number: u8,
    pub alt_settings: Vec<InterfaceDescriptor>,
}

impl Interface {
    /// The default (first) alternate setting
    pub fn primary(&self) -> Option<&InterfaceDescriptor> {
        self.alt_settings.first()
    }
}

/// Interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub setting_number: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub description_string_index: Option<u8>,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub transfer_type: EndpointType,
    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Bytes per service interval: packet size times the additional
    /// transaction multiplier encoded in bits 11..12
    pub fn packet_size(&self) -> usize {
        let base = (self.max_packet_size & 0x07FF) as usize;
        let mult = ((self.max_packet_size >> 11) & 0x03) as usize + 1;
        base * mult
    }
}

/// Raw device capability record from the BOS descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub capability_type: u8,
    /// Bytes following bDevCapabilityType
    pub data: Vec<u8>,
}

/// Binary device Object Store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BosDescriptor {
    pub total_length: u16,
    pub capabilities: Vec<DeviceCapability>,
}

/// USB 2.0 extension capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usb2Extension {
    pub attributes: u32,
}

impl Usb2Extension {
    /// Link power management supported
    pub fn lpm_supported(&self) -> bool {
        self.attributes & 0x02 != 0
    }
}

/// SuperSpeed USB device capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsDeviceCapability {
    pub attributes: u8,
    pub speeds_supported: u16,
    pub functionality_support: u8,
    pub u1_exit_latency: u8,
    pub u2_exit_latency: u16,
}

/// SuperSpeed endpoint companion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsEndpointCompanion {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

/// Identity fields resolved from the device descriptor and string table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: Speed,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// 0 means no language negotiated (ASCII fallback)
    pub language_id: u16,
}

/// Descriptor set cached by a session
#[derive(Debug, Clone, Default)]
pub struct DescriptorCatalog {
    device: DeviceDescriptor,
    configs: Vec<ConfigDescriptor>,
    current_config: usize,
    bos: Option<BosDescriptor>,
    usb2_extension: Option<Usb2Extension>,
    ss_capability: Option<SsDeviceCapability>,
    ss_companions: HashMap<u8, SsEndpointCompanion>,
}

impl DescriptorCatalog {
    /// Build the catalog from an unopened device
    ///
    /// Uses `descriptor` when the caller already read it during enumeration.
    /// Configuration descriptors that fail to read are skipped.
    pub fn load(
        device: &dyn RawDevice,
        descriptor: Option<DeviceDescriptor>,
    ) -> Result<Self, DescriptorError> {
        let device_desc = match descriptor {
            Some(d) => d,
            None => device.device_descriptor()?,
        };

        let mut configs = Vec::with_capacity(device_desc.num_configurations as usize);
        for index in 0..device_desc.num_configurations {
            match device.config_descriptor(index) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("Failed to read configuration descriptor {}: {}", index, e),
            }
        }

        // An unconfigured device reports an error here; fall back to the first config
        let current_config = device
            .active_config_value()
            .ok()
            .and_then(|value| configs.iter().position(|c| c.number == value))
            .unwrap_or(0);

        debug!(
            "Loaded {} configuration(s) for {:04x}:{:04x}, active index {}",
            configs.len(),
            device_desc.vendor_id,
            device_desc.product_id,
            current_config
        );

        Ok(Self {
            device: device_desc,
            configs,
            current_config,
            ..Self::default()
        })
    }

    /// Read the records that need an open handle: BOS capabilities and
    /// SuperSpeed endpoint companions
    pub fn load_extended(&mut self, handle: &dyn RawHandle, timeout: Duration) {
        self.bos = None;
        self.usb2_extension = None;
        self.ss_capability = None;
        self.ss_companions.clear();

        // BOS only exists from bcdUSB 2.01 on
        if self.device.usb_version >= 0x0201 {
            match read_bos(handle, timeout) {
                Ok(bos) => {
                    self.usb2_extension = bos.usb2_extension();
                    self.ss_capability = bos.ss_device_capability();
                    self.bos = Some(bos);
                }
                Err(e) => debug!("No BOS descriptor: {}", e),
            }
        }

        // Indices follow the device, not `configs`, which skips unreadable entries
        for index in 0..self.device.num_configurations {
            match read_raw_config(handle, index, timeout) {
                Ok(raw) => self.ss_companions.extend(parse_ss_companions(&raw)),
                Err(e) => debug!("Raw configuration {} unavailable: {}", index, e),
            }
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn configs(&self) -> &[ConfigDescriptor] {
        &self.configs
    }

    pub fn current_config_index(&self) -> usize {
        self.current_config
    }

    /// The active configuration, if any configuration could be read
    pub fn active_config(&self) -> Option<&ConfigDescriptor> {
        self.configs.get(self.current_config)
    }

    pub fn bos(&self) -> Option<&BosDescriptor> {
        self.bos.as_ref()
    }

    pub fn usb2_extension(&self) -> Option<&Usb2Extension> {
        self.usb2_extension.as_ref()
    }

    pub fn ss_capability(&self) -> Option<&SsDeviceCapability> {
        self.ss_capability.as_ref()
    }

    pub fn ss_companion(&self, endpoint: EndpointAddress) -> Option<&SsEndpointCompanion> {
        self.ss_companions.get(&endpoint.raw())
    }

    pub fn ss_companions(&self) -> &HashMap<u8, SsEndpointCompanion> {
        &self.ss_companions
    }
}

impl BosDescriptor {
    pub fn usb2_extension(&self) -> Option<Usb2Extension> {
        self.capabilities
            .iter()
            .find(|c| c.capability_type == CAP_USB2_EXTENSION && c.data.len() >= 4)
            .map(|c| Usb2Extension {
                attributes: LittleEndian::read_u32(&c.data[0..4]),
            })
    }

    pub fn ss_device_capability(&self) -> Option<SsDeviceCapability> {
        self.capabilities
            .iter()
            .find(|c| c.capability_type == CAP_SS_USB_DEVICE && c.data.len() >= 7)
            .map(|c| SsDeviceCapability {
                attributes: c.data[0],
                speeds_supported: LittleEndian::read_u16(&c.data[1..3]),
                functionality_support: c.data[3],
                u1_exit_latency: c.data[4],
                u2_exit_latency: LittleEndian::read_u16(&c.data[5..7]),
            })
    }
}

/// Issue a standard GET_DESCRIPTOR request
fn get_descriptor(
    handle: &dyn RawHandle,
    descriptor_type: u8,
    index: u8,
    language: u16,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, rusb::Error> {
    handle.read_control(
        REQUEST_TYPE_STANDARD_IN,
        REQUEST_GET_DESCRIPTOR,
        (u16::from(descriptor_type) << 8) | u16::from(index),
        language,
        buf,
        timeout,
    )
}

/// Read a descriptor whose total length sits at bytes 2..4 of its header
fn read_with_total_length(
    handle: &dyn RawHandle,
    descriptor_type: u8,
    index: u8,
    header_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, DescriptorError> {
    let mut header = vec![0u8; header_len];
    let n = get_descriptor(handle, descriptor_type, index, 0, &mut header, timeout)?;
    if n < 4 {
        return Err(DescriptorError::Truncated {
            needed: header_len,
            available: n,
        });
    }

    let total = LittleEndian::read_u16(&header[2..4]) as usize;
    let mut full = vec![0u8; total.max(header_len)];
    let n = get_descriptor(handle, descriptor_type, index, 0, &mut full, timeout)?;
    full.truncate(n);
    Ok(full)
}

/// Read and parse the BOS descriptor
pub fn read_bos(handle: &dyn RawHandle, timeout: Duration) -> Result<BosDescriptor, DescriptorError> {
    let raw = read_with_total_length(handle, DT_BOS, 0, BOS_HEADER_LEN, timeout)?;
    parse_bos(&raw)
}

/// Read the full raw configuration descriptor at `index`
pub fn read_raw_config(
    handle: &dyn RawHandle,
    index: u8,
    timeout: Duration,
) -> Result<Vec<u8>, DescriptorError> {
    read_with_total_length(handle, DT_CONFIG, index, CONFIG_HEADER_LEN, timeout)
}

/// Parse a BOS descriptor and its device capability records
pub fn parse_bos(bytes: &[u8]) -> Result<BosDescriptor, DescriptorError> {
    if bytes.len() < BOS_HEADER_LEN {
        return Err(DescriptorError::Truncated {
            needed: BOS_HEADER_LEN,
            available: bytes.len(),
        });
    }
    if bytes[1] != DT_BOS {
        return Err(DescriptorError::UnexpectedType {
            expected: DT_BOS,
            found: bytes[1],
        });
    }

    let total_length = LittleEndian::read_u16(&bytes[2..4]);
    let num_caps = bytes[4] as usize;
    let end = (total_length as usize).min(bytes.len());

    let mut capabilities = Vec::with_capacity(num_caps);
    let mut offset = (bytes[0] as usize).max(BOS_HEADER_LEN);
    while capabilities.len() < num_caps && offset + 3 <= end {
        let len = bytes[offset] as usize;
        if len < 3 || offset + len > end {
            warn!("Malformed BOS capability at offset {}", offset);
            break;
        }
        if bytes[offset + 1] == DT_DEVICE_CAPABILITY {
            capabilities.push(DeviceCapability {
                capability_type: bytes[offset + 2],
                data: bytes[offset + 3..offset + len].to_vec(),
            });
        }
        offset += len;
    }

    Ok(BosDescriptor {
        total_length,
        capabilities,
    })
}

/// Collect SuperSpeed endpoint companions from a raw configuration
/// descriptor, keyed by the address of the endpoint they follow
pub fn parse_ss_companions(raw_config: &[u8]) -> HashMap<u8, SsEndpointCompanion> {
    let mut companions = HashMap::new();
    let mut current_endpoint = None;
    let mut offset = 0;

    while offset + 2 <= raw_config.len() {
        let len = raw_config[offset] as usize;
        if len < 2 || offset + len > raw_config.len() {
            break;
        }
        let desc = &raw_config[offset..offset + len];
        match desc[1] {
            DT_ENDPOINT if len >= 3 => current_endpoint = Some(desc[2]),
            DT_SS_ENDPOINT_COMPANION if len >= 6 => {
                if let Some(ep) = current_endpoint.take() {
                    companions.insert(
                        ep,
                        SsEndpointCompanion {
                            max_burst: desc[2],
                            attributes: desc[3],
                            bytes_per_interval: LittleEndian::read_u16(&desc[4..6]),
                        },
                    );
                }
            }
            _ => {}
        }
        offset += len;
    }

    companions
}

/// Decode a UTF-16LE string descriptor
pub fn decode_string_descriptor(bytes: &[u8]) -> Result<String, DescriptorError> {
    if bytes.len() < 2 {
        return Err(DescriptorError::Truncated {
            needed: 2,
            available: bytes.len(),
        });
    }
    if bytes[1] != DT_STRING {
        return Err(DescriptorError::UnexpectedType {
            expected: DT_STRING,
            found: bytes[1],
        });
    }

    let len = (bytes[0] as usize).min(bytes.len());
    let units: Vec<u16> = bytes[2..len.max(2)]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Read the supported-language list (string descriptor 0)
pub fn read_languages(handle: &dyn RawHandle, timeout: Duration) -> Result<Vec<u16>, DescriptorError> {
    let mut buf = [0u8; MAX_STRING_DESCRIPTOR_LEN];
    let n = get_descriptor(handle, DT_STRING, 0, 0, &mut buf, timeout)?;
    let raw = &buf[..n];
    if raw.len() < 2 {
        return Err(DescriptorError::Truncated {
            needed: 2,
            available: raw.len(),
        });
    }
    if raw[1] != DT_STRING {
        return Err(DescriptorError::UnexpectedType {
            expected: DT_STRING,
            found: raw[1],
        });
    }
    let len = (raw[0] as usize).min(raw.len());
    Ok(raw[2..len.max(2)]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}

/// Fetch string descriptor `index` in `language`
///
/// Returns an empty string for index 0 or when the descriptor cannot be read
/// or decoded. With `language == 0` non-ASCII characters are replaced by `?`.
pub fn pull_string(handle: &dyn RawHandle, index: u8, language: u16, timeout: Duration) -> String {
    if index == 0 {
        return String::new();
    }

    let mut buf = [0u8; MAX_STRING_DESCRIPTOR_LEN];
    let decoded = get_descriptor(handle, DT_STRING, index, language, &mut buf, timeout)
        .map_err(DescriptorError::from)
        .and_then(|n| decode_string_descriptor(&buf[..n]));

    match decoded {
        Ok(s) if language == 0 => s
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect(),
        Ok(s) => {
            trace!("String {} (lang {:#06x}): {:?}", index, language, s);
            s
        }
        Err(e) => {
            debug!("String descriptor {} unavailable: {}", index, e);
            String::new()
        }
    }
}
