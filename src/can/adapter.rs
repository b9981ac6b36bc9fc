// One interface over every CAN adapter family.
//
// The protocol layer in `can::CanDevice` only ever talks to this trait, so
// SocketCAN interfaces, serial-line (SLCAN) dongles and the in-process
// simulator are interchangeable.

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use super::sim::SimBus;
use super::slcan::SlcanAdapter;
use super::{CanError, Result};

/// Raw frame I/O on a physical or virtual CAN adapter
pub trait CanAdapter: Send {
    /// Read one frame.
    ///
    /// In non-blocking mode an empty receive queue yields `Ok(None)`.
    /// A blocking read that times out yields [`CanError::Timeout`].
    fn read_frame(&mut self, blocking: bool) -> Result<Option<Frame>>;

    /// Queue one frame for transmission
    fn write_frame(&mut self, frame: &Frame, blocking: bool) -> Result<()>;

    /// Human-readable adapter description for logs
    fn describe(&self) -> String;
}

/// Adapter family, selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Linux SocketCAN network interface (`can<port>`)
    #[default]
    Socket,
    /// Serial-line CAN (Lawicel ASCII protocol) over a USB serial port
    Slcan,
    /// In-process simulated WAM
    Sim,
}

impl AdapterKind {
    /// Open the adapter for a zero-indexed bus port.
    ///
    /// `device` overrides the default interface name (socket), names the
    /// serial device (slcan, required) or selects a simulator preset.
    pub fn open(self, port: u32, device: Option<&str>) -> Result<Box<dyn CanAdapter>> {
        match self {
            AdapterKind::Socket => open_socket(port, device),
            AdapterKind::Slcan => {
                let path = device.ok_or_else(|| CanError::DeviceOpen {
                    device: format!("slcan port {}", port),
                    reason: "no serial device configured".to_string(),
                })?;
                Ok(Box::new(SlcanAdapter::open(path)?))
            }
            AdapterKind::Sim => {
                let dof = match device {
                    None | Some("wam4") => 4,
                    Some("wam7") => 7,
                    Some(other) => {
                        return Err(CanError::DeviceOpen {
                            device: other.to_string(),
                            reason: "unknown simulator preset (expected wam4 or wam7)".to_string(),
                        });
                    }
                };
                Ok(Box::new(SimBus::wam(dof)))
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn open_socket(port: u32, device: Option<&str>) -> Result<Box<dyn CanAdapter>> {
    let interface = device
        .map(str::to_string)
        .unwrap_or_else(|| format!("can{}", port));
    Ok(Box::new(super::socket::SocketAdapter::open(&interface)?))
}

#[cfg(not(target_os = "linux"))]
fn open_socket(port: u32, device: Option<&str>) -> Result<Box<dyn CanAdapter>> {
    Err(CanError::DeviceOpen {
        device: device
            .map(str::to_string)
            .unwrap_or_else(|| format!("can{}", port)),
        reason: "SocketCAN is only available on Linux".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_serde_names() {
        let kind: AdapterKind = serde_json::from_str("\"slcan\"").unwrap();
        assert_eq!(kind, AdapterKind::Slcan);
        assert_eq!(serde_json::to_string(&AdapterKind::Sim).unwrap(), "\"sim\"");
        assert_eq!(AdapterKind::default(), AdapterKind::Socket);
    }

    #[test]
    fn test_slcan_requires_device() {
        assert!(matches!(
            AdapterKind::Slcan.open(0, None),
            Err(CanError::DeviceOpen { .. })
        ));
    }

    #[test]
    fn test_sim_presets() {
        assert!(AdapterKind::Sim.open(0, Some("wam7")).is_ok());
        assert!(matches!(
            AdapterKind::Sim.open(0, Some("wam9")),
            Err(CanError::DeviceOpen { .. })
        ));
    }
}
