//! Device discovery.
//!
//! USB discovery enumerates serial ports and matches known controller
//! VID:PID pairs. Network (mDNS) discovery is an external collaborator
//! plugged in through the [Discoverer] trait.

use serialport::SerialPortType;

use crate::{Error, ErrorKind, Result};

/// USB VID:PID pairs of known controller boards.
pub const KNOWN_USB_DEVICES: [(u16, u16, &str); 4] = [
    (0x2d04, 0xc006, "Photon"),
    (0x2d04, 0xc008, "P1"),
    (0x2d04, 0xc00a, "Electron"),
    (0x1d50, 0x607d, "Spark Core"),
];

/// A discovered controller endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveredDevice {
    /// Local serial device path
    Serial(String),
    /// Networked controller host and port
    Tcp(String, u16),
}

/// Discovery seam.
///
/// Implementations must return exactly one device; ambiguous or empty
/// results fail with `DISCOVERY_ABORTED`.
pub trait Discoverer: Send + Sync {
    fn discover(&self, device_id: Option<&str>) -> Result<DiscoveredDevice>;
}

/// Discovers controllers on local USB serial ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct UsbDiscoverer;

impl UsbDiscoverer {
    pub fn new() -> Self {
        Self
    }

    fn is_known(vid: u16, pid: u16) -> Option<&'static str> {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, known_pid, _)| *known_vid == vid && *known_pid == pid)
            .map(|(_, _, name)| *name)
    }
}

impl Discoverer for UsbDiscoverer {
    fn discover(&self, device_id: Option<&str>) -> Result<DiscoveredDevice> {
        let ports = serialport::available_ports()?;

        let matches: Vec<(String, &'static str)> = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    let name = Self::is_known(usb.vid, usb.pid)?;
                    if let Some(wanted) = device_id {
                        let serial = usb.serial_number.unwrap_or_default();
                        if !serial.eq_ignore_ascii_case(wanted) {
                            return None;
                        }
                    }
                    Some((port.port_name, name))
                }
                _ => None,
            })
            .collect();

        match matches.as_slice() {
            [(port, name)] => {
                log::info!("discovered {name} on {port}");
                Ok(DiscoveredDevice::Serial(port.clone()))
            }
            [] => Err(Error::new(
                ErrorKind::DiscoveryAborted,
                "no known USB device found",
            )),
            multiple => Err(Error::new(
                ErrorKind::DiscoveryAborted,
                format!("{} matching USB devices found", multiple.len()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_device_table() {
        assert_eq!(UsbDiscoverer::is_known(0x2d04, 0xc006), Some("Photon"));
        assert_eq!(UsbDiscoverer::is_known(0x2d04, 0xc008), Some("P1"));
        assert_eq!(UsbDiscoverer::is_known(0x1234, 0x5678), None);
    }
}
