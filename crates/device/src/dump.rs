//! Human-readable device report for `DeviceSession::dump_info`

use crate::descriptors::{DescriptorCatalog, DeviceIdentity, InterfaceDescriptor};
use crate::session::DeviceClass;
use std::io::{self, Write};

/// Session state captured under the lock, written out after it is released
pub(crate) struct InfoSnapshot {
    /// (bus, address) of the bound device
    pub location: Option<(u8, u8)>,
    pub identity: DeviceIdentity,
    pub catalog: Option<DescriptorCatalog>,
    pub claimed: Vec<u8>,
    pub active_transfers: usize,
    pub open: bool,
}

/// Format a BCD version such as 0x0210 as "2.10"
pub fn format_bcd(value: u16) -> String {
    format!("{:x}.{:02x}", value >> 8, value & 0xff)
}

fn or_none(s: &str) -> &str {
    if s.is_empty() { "(none)" } else { s }
}

pub(crate) fn write_info(
    out: &mut dyn Write,
    snapshot: &InfoSnapshot,
    class: &dyn DeviceClass,
) -> io::Result<()> {
    let id = &snapshot.identity;

    match snapshot.location {
        Some((bus, address)) => writeln!(
            out,
            "Device {:03}:{:03} {:04x}:{:04x}",
            bus, address, id.vendor_id, id.product_id
        )?,
        None => {
            writeln!(out, "No device bound")?;
            return Ok(());
        }
    }

    writeln!(out, "  Manufacturer: {}", or_none(&id.manufacturer))?;
    writeln!(out, "  Product:      {}", or_none(&id.product))?;
    writeln!(out, "  Serial:       {}", or_none(&id.serial_number))?;
    writeln!(out, "  Language:     {:#06x}", id.language_id)?;
    writeln!(out, "  Speed:        {}", id.speed)?;
    writeln!(
        out,
        "  Handle:       {}",
        if snapshot.open { "open" } else { "closed" }
    )?;

    let Some(catalog) = snapshot.catalog.as_ref() else {
        writeln!(out, "  Descriptors unavailable")?;
        return write_claim_summary(out, snapshot);
    };

    let desc = catalog.device();
    writeln!(
        out,
        "  USB {}  device version {}",
        format_bcd(desc.usb_version),
        format_bcd(desc.device_version)
    )?;
    writeln!(
        out,
        "  Class {:#04x} subclass {:#04x} protocol {:#04x}, EP0 max packet {}",
        desc.class_code, desc.sub_class_code, desc.protocol_code, desc.max_packet_size
    )?;

    if let Some(bos) = catalog.bos() {
        writeln!(
            out,
            "  BOS: {} bytes, {} capabilities",
            bos.total_length,
            bos.capabilities.len()
        )?;
        if let Some(ext) = catalog.usb2_extension() {
            writeln!(
                out,
                "    USB 2.0 extension: attributes {:#010x}{}",
                ext.attributes,
                if ext.lpm_supported() { ", LPM" } else { "" }
            )?;
        }
        if let Some(ss) = catalog.ss_capability() {
            writeln!(
                out,
                "    SuperSpeed: speeds {:#06x}, functionality {}, U1 {}us, U2 {}us",
                ss.speeds_supported, ss.functionality_support, ss.u1_exit_latency, ss.u2_exit_latency
            )?;
        }
    }

    for (index, config) in catalog.configs().iter().enumerate() {
        let active = index == catalog.current_config_index();
        writeln!(
            out,
            "  Configuration {}{}: {}mA{}{}",
            config.number,
            if active { " (active)" } else { "" },
            config.max_power_ma,
            if config.self_powered { ", self-powered" } else { "" },
            if config.remote_wakeup { ", remote wakeup" } else { "" }
        )?;

        for interface in &config.interfaces {
            let claimed = active && snapshot.claimed.contains(&interface.number);
            writeln!(
                out,
                "    Interface {}{}",
                interface.number,
                if claimed { " [claimed]" } else { "" }
            )?;
            for alt in &interface.alt_settings {
                write_alt_setting(out, catalog, alt, class)?;
            }
        }
    }

    write_claim_summary(out, snapshot)
}

fn write_alt_setting(
    out: &mut dyn Write,
    catalog: &DescriptorCatalog,
    alt: &InterfaceDescriptor,
    class: &dyn DeviceClass,
) -> io::Result<()> {
    writeln!(
        out,
        "      Alt {}: class {:#04x} subclass {:#04x} protocol {:#04x}, {} endpoint(s)",
        alt.setting_number,
        alt.class_code,
        alt.sub_class_code,
        alt.protocol_code,
        alt.endpoints.len()
    )?;

    for ep in &alt.endpoints {
        writeln!(
            out,
            "        Endpoint {}: {:?}, max packet {}, interval {}",
            ep.address, ep.transfer_type, ep.max_packet_size, ep.interval
        )?;
        if let Some(companion) = catalog.ss_companion(ep.address) {
            writeln!(
                out,
                "          SS companion: max burst {}, attributes {:#04x}, {} bytes/interval",
                companion.max_burst, companion.attributes, companion.bytes_per_interval
            )?;
        }
    }

    class.dump_extra_interface_info(out, alt)
}

fn write_claim_summary(out: &mut dyn Write, snapshot: &InfoSnapshot) -> io::Result<()> {
    let claimed: Vec<String> = snapshot.claimed.iter().map(|n| n.to_string()).collect();
    writeln!(
        out,
        "  Claimed interfaces: {}",
        if claimed.is_empty() {
            "none".to_string()
        } else {
            claimed.join(", ")
        }
    )?;
    writeln!(out, "  Active transfers: {}", snapshot.active_transfers)
}
