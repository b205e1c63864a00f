//! Device enumeration and filtering

use device::{DeviceDescriptor, DeviceSession, RawDevice, SessionOptions, Speed};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::class::IdleClass;

/// Linux Foundation root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// An enumerated device that passed the filters
#[derive(Clone)]
pub struct Candidate {
    pub device: Arc<dyn RawDevice>,
    pub descriptor: DeviceDescriptor,
}

impl Candidate {
    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }
}

/// `--device` selector: `VID:PID` in hex, `0x` prefix optional, `*` for any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceSelector {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid device '{}', expected VID:PID", s))?;
        Ok(Self {
            vendor_id: parse_id(vid)?,
            product_id: parse_id(pid)?,
        })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

fn parse_id(s: &str) -> anyhow::Result<Option<u16>> {
    if s == "*" {
        return Ok(None);
    }
    let hex = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(hex, 16)
        .map(Some)
        .map_err(|_| anyhow::anyhow!("Invalid id '{}', expected up to 4 hex digits", s))
}

/// Check whether a device passes the configured filters
///
/// Filters are `0xVID:0xPID` or `0xVID:*` and are assumed validated by the
/// config loader; an empty list allows every device.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((vid_str, pid_str)) = filter.split_once(':') else {
            return false;
        };
        id_matches(vid_str, vid) && id_matches(pid_str, pid)
    })
}

fn id_matches(pattern: &str, id: u16) -> bool {
    pattern == "*"
        || u16::from_str_radix(pattern.trim_start_matches("0x"), 16)
            .map(|v| v == id)
            .unwrap_or(false)
}

/// Keep devices that pass `filters`, skipping root hubs and devices whose
/// descriptor cannot be read
pub fn filter_devices(devices: Vec<Arc<dyn RawDevice>>, filters: &[String]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for device in devices {
        let bus = device.bus_number();
        let address = device.address();

        let descriptor = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                debug!("Skipping {:03}:{:03}: {}", bus, address, e);
                continue;
            }
        };

        if descriptor.vendor_id == ROOT_HUB_VENDOR && descriptor.class_code == HUB_CLASS {
            debug!(
                "Skipping root hub: bus={}, addr={}, vid={:#x}, pid={:#x}",
                bus, address, descriptor.vendor_id, descriptor.product_id
            );
            continue;
        }

        if !check_filter(descriptor.vendor_id, descriptor.product_id, filters) {
            debug!(
                "Filtered out {:04x}:{:04x}",
                descriptor.vendor_id, descriptor.product_id
            );
            continue;
        }

        candidates.push(Candidate { device, descriptor });
    }

    candidates
}

/// First candidate matching `selector`
pub fn find_device(candidates: &[Candidate], selector: &DeviceSelector) -> Option<Candidate> {
    candidates
        .iter()
        .find(|c| selector.matches(c.vendor_id(), c.product_id()))
        .cloned()
}

/// One line-group of `--list` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: Speed,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

impl DeviceSummary {
    /// Read identity strings through a short-lived session
    ///
    /// Devices that cannot be opened (permissions, busy) still get a summary,
    /// just without strings.
    pub fn probe(candidate: &Candidate, options: &SessionOptions) -> Self {
        let session = DeviceSession::new(Arc::new(IdleClass), options.clone());
        let _ = session.set_device(
            Arc::clone(&candidate.device),
            Some(candidate.descriptor.clone()),
        );
        if let Err(e) = session.open_handle() {
            debug!(
                "Cannot open {:04x}:{:04x} for strings: {}",
                candidate.vendor_id(),
                candidate.product_id(),
                e
            );
        }

        let identity = session.identity();
        let summary = Self {
            bus_number: candidate.device.bus_number(),
            address: candidate.device.address(),
            vendor_id: candidate.vendor_id(),
            product_id: candidate.product_id(),
            speed: identity.speed,
            manufacturer: identity.manufacturer,
            product: identity.product,
            serial_number: identity.serial_number,
        };

        if let Err(e) = session.shutdown() {
            debug!("Closing probe session: {}", e);
        }
        summary
    }
}

fn or_unknown<'a>(s: &'a str, fallback: &'a str) -> &'a str {
    if s.is_empty() { fallback } else { s }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  {:04x}:{:04x} - {} {}",
            self.vendor_id,
            self.product_id,
            or_unknown(&self.manufacturer, "Unknown Manufacturer"),
            or_unknown(&self.product, "Unknown Product")
        )?;
        writeln!(
            f,
            "      Bus {:03} Device {:03} Speed: {}",
            self.bus_number, self.address, self.speed
        )?;
        if !self.serial_number.is_empty() {
            writeln!(f, "      Serial: {}", self.serial_number)?;
        }
        Ok(())
    }
}
