//! Device classes used by the probe

use common::{ReportEvent, ReportSender};
use device::{
    DeviceClass, EndpointAddress, InterfaceDescriptor, Transfer, TransferStatus,
};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Forwards every IN report to the report bridge and keeps polling
pub struct HexDumpClass {
    interfaces: Vec<u8>,
    sender: ReportSender,
    reports: AtomicU64,
}

impl HexDumpClass {
    /// `interfaces` limits claiming; empty claims every interface
    pub fn new(interfaces: Vec<u8>, sender: ReportSender) -> Self {
        Self {
            interfaces,
            sender,
            reports: AtomicU64::new(0),
        }
    }

    /// Reports received so far
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }
}

impl DeviceClass for HexDumpClass {
    fn handle_event(&self, endpoint: EndpointAddress, data: &[u8], transfer: &Transfer) -> bool {
        let status = transfer.status().unwrap_or(TransferStatus::Error);
        match status {
            TransferStatus::Completed => {
                self.reports.fetch_add(1, Ordering::Relaxed);
                if !data.is_empty() {
                    self.sender.send(ReportEvent::Report {
                        endpoint: endpoint.raw(),
                        data: data.to_vec(),
                    });
                }
                // Nobody is listening any more
                !self.sender.is_closed()
            }
            TransferStatus::TimedOut => true,
            TransferStatus::NoDevice => {
                warn!("Device disconnected (endpoint {})", endpoint);
                self.sender.send(ReportEvent::Stopped {
                    reason: "device disconnected".to_string(),
                });
                false
            }
            other => {
                debug!("Transfer on {} ended: {:?}", endpoint, other);
                self.sender.send(ReportEvent::TransferError {
                    endpoint: endpoint.raw(),
                    status: format!("{:?}", other),
                });
                false
            }
        }
    }

    fn want_interface(&self, iface: &InterfaceDescriptor) -> bool {
        self.interfaces.is_empty() || self.interfaces.contains(&iface.interface_number)
    }

    fn dump_extra_interface_info(
        &self,
        out: &mut dyn io::Write,
        iface: &InterfaceDescriptor,
    ) -> io::Result<()> {
        let watched = self.want_interface(iface);
        writeln!(
            out,
            "        Watch: {}",
            if watched { "yes" } else { "no" }
        )
    }
}

/// Claims nothing and never resubmits; used for listing and dumping
pub struct IdleClass;

impl DeviceClass for IdleClass {
    fn handle_event(&self, _endpoint: EndpointAddress, _data: &[u8], _transfer: &Transfer) -> bool {
        false
    }

    fn want_interface(&self, _iface: &InterfaceDescriptor) -> bool {
        false
    }
}

/// Format bytes as space-separated hex, 16 per line
pub fn format_hex(data: &[u8]) -> String {
    data.chunks(16)
        .map(|chunk| {
            chunk
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_report_bridge;

    fn iface(number: u8) -> InterfaceDescriptor {
        InterfaceDescriptor {
            interface_number: number,
            ..InterfaceDescriptor::default()
        }
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex(&[0x00, 0xab, 0x10]), "00 ab 10");

        let long: Vec<u8> = (0..18).collect();
        let text = format_hex(&long);
        assert_eq!(text.lines().count(), 2);
        assert_eq!(text.lines().nth(1), Some("10 11"));
    }

    #[test]
    fn test_want_interface() {
        let (sender, _receiver) = create_report_bridge(4);
        let all = HexDumpClass::new(Vec::new(), sender.clone());
        assert!(all.want_interface(&iface(0)));
        assert!(all.want_interface(&iface(3)));

        let some = HexDumpClass::new(vec![1], sender);
        assert!(!some.want_interface(&iface(0)));
        assert!(some.want_interface(&iface(1)));
    }

    #[test]
    fn test_idle_class_wants_nothing() {
        assert!(!IdleClass.want_interface(&iface(0)));
    }

    #[test]
    fn test_dump_extra_info() {
        let (sender, _receiver) = create_report_bridge(4);
        let class = HexDumpClass::new(vec![2], sender);
        let mut out = Vec::new();
        class.dump_extra_interface_info(&mut out, &iface(2)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "        Watch: yes\n");
    }
}
