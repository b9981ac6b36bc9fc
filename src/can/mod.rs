// CAN transport for Barrett Pucks
//
// Provides:
// - Frame codec for the Puck property protocol (frame.rs)
// - Adapter trait with SocketCAN, SLCAN and simulated backends
// - CanDevice: mutex-guarded request/reply operations over one adapter

mod adapter;
pub mod frame;
pub mod sim;
mod slcan;
#[cfg(target_os = "linux")]
mod socket;

use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

pub use adapter::{AdapterKind, CanAdapter};
pub use frame::{Destination, Frame, Message};

/// Highest node ID probed during discovery (exclusive)
pub const MAX_NODES: u8 = 31;

/// STAT is index 5 in every firmware layout; discovery needs it before the
/// property table exists
pub const STAT_INDEX: u8 = 5;

/// Error types for CAN communication
#[derive(Debug, thiserror::Error)]
pub enum CanError {
    #[error("Cannot open CAN device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Timeout waiting for a CAN frame")]
    Timeout,

    #[error("Adapter error: {reason}")]
    Adapter { reason: String },

    #[error("Empty frame from address 0x{address:03X}")]
    EmptyFrame { address: u16 },

    #[error("Illegal message header {header} from address 0x{address:03X}")]
    IllegalHeader { address: u16, header: u8 },

    #[error("Frame payload of {len} bytes exceeds 8")]
    FrameTooLong { len: usize },

    #[error("Asked puck {node} for property {property}, got {reply:?}")]
    ReplyMismatch {
        node: u8,
        property: u8,
        reply: Message,
    },

    #[error("Puck {node} property {property}: wrote {expected}, read back {actual}")]
    VerifyMismatch {
        node: u8,
        property: u8,
        expected: i64,
        actual: i64,
    },

    #[error("CAN device lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, CanError>;

/// One CAN bus port. Every operation holds the device lock for its full
/// duration, so a request and its reply are never interleaved with another
/// caller's traffic.
pub struct CanDevice {
    adapter: Mutex<Box<dyn CanAdapter>>,
    name: String,
}

impl CanDevice {
    /// Open the adapter for a zero-indexed port
    pub fn open(kind: AdapterKind, port: u32, device: Option<&str>) -> Result<Self> {
        Ok(Self::new(kind.open(port, device)?))
    }

    /// Wrap an already-open adapter
    pub fn new(adapter: Box<dyn CanAdapter>) -> Self {
        let name = adapter.describe();
        Self {
            adapter: Mutex::new(adapter),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn CanAdapter>>> {
        self.adapter.lock().map_err(|_| CanError::LockPoisoned)
    }

    /// Read one raw frame
    pub fn read_frame(&self, blocking: bool) -> Result<Option<Frame>> {
        self.lock()?.read_frame(blocking)
    }

    /// Write one raw frame
    pub fn write_frame(&self, frame: &Frame, blocking: bool) -> Result<()> {
        self.lock()?.write_frame(frame, blocking)
    }

    /// Drain and discard every queued inbound frame. Returns how many were dropped.
    pub fn clear_pending(&self) -> Result<usize> {
        let mut adapter = self.lock()?;
        let mut cleared = 0;
        while let Some(frame) = adapter.read_frame(false)? {
            warn!("Cleared unexpected message from CAN bus: {:?}", frame);
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Read a property from one puck and check the reply really answers it
    pub fn get_property(&self, node: u8, property: u8) -> Result<i64> {
        let request = Frame::new(Destination::Node(node).address(), &frame::encode_get(property))?;

        let reply = {
            let mut adapter = self.lock()?;
            adapter.write_frame(&request, true)?;
            adapter.read_frame(true)?.ok_or(CanError::Timeout)?
        };

        let message = frame::parse(&reply)?;
        match message {
            Message::Property {
                node: from,
                property: prop,
                value,
            } if from == node && prop == property => Ok(value),
            other => {
                warn!(
                    "Asked puck {} for property {}, returned id or property do not match: {:?}",
                    node, property, other
                );
                Err(CanError::ReplyMismatch {
                    node,
                    property,
                    reply: other,
                })
            }
        }
    }

    /// Write a property to a puck or group, optionally reading it back
    pub fn set_property(
        &self,
        destination: Destination,
        property: u8,
        value: i64,
        verify: bool,
    ) -> Result<()> {
        let request = Frame::new(destination.address(), &frame::encode_set(property, value))?;
        debug!("Set {:?} property {} = {}", destination, property, value);
        self.lock()?.write_frame(&request, true)?;

        if verify {
            match destination {
                Destination::Node(node) => {
                    let actual = self.get_property(node, property)?;
                    if actual != value {
                        return Err(CanError::VerifyMismatch {
                            node,
                            property,
                            expected: value,
                            actual,
                        });
                    }
                }
                Destination::Group(group) => {
                    warn!("Cannot verify property {} on group {}", property, group);
                }
            }
        }
        Ok(())
    }

    /// Broadcast a GET to a group and collect `expected` packed replies.
    ///
    /// Each reply lands in `out[node]`. Non-packed traffic seen while waiting
    /// is logged and skipped.
    pub fn get_packed(
        &self,
        group: u8,
        expected: usize,
        property: u8,
        out: &mut [Option<i32>],
    ) -> Result<()> {
        let request = Frame::new(Destination::Group(group).address(), &frame::encode_get(property))?;

        let mut adapter = self.lock()?;
        adapter.write_frame(&request, true)?;

        let mut remaining = expected;
        while remaining > 0 {
            let reply = adapter.read_frame(true)?.ok_or(CanError::Timeout)?;
            match frame::parse(&reply)? {
                Message::Packed { node, value } => {
                    match out.get_mut(node as usize) {
                        Some(slot) => *slot = Some(value),
                        None => warn!("Packed reply from unexpected puck {}", node),
                    }
                    remaining -= 1;
                }
                other => {
                    warn!(
                        "Asked group {} for packed property {}, received {:?}",
                        group, property, other
                    );
                }
            }
        }
        Ok(())
    }

    /// Broadcast four packed torques to a group
    pub fn set_torques(&self, group: u8, values: [i32; 4], property: u8) -> Result<()> {
        let request = Frame::new(
            Destination::Group(group).address(),
            &frame::pack_torques(property, values),
        )?;
        self.lock()?.write_frame(&request, true)
    }

    /// Probe one node for its status. `Ok(None)` means nobody answered.
    pub fn probe(&self, node: u8, wait: Duration) -> Result<Option<i64>> {
        let request = Frame::new(Destination::Node(node).address(), &frame::encode_get(STAT_INDEX))?;

        let mut adapter = self.lock()?;
        adapter.write_frame(&request, true)?;
        sleep(wait);

        let reply = match adapter.read_frame(false) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!("No status from node {}: {}", node, e);
                return Ok(None);
            }
        };
        match frame::parse(&reply) {
            Ok(Message::Property {
                node: from,
                property,
                value,
            }) if from == node && property == STAT_INDEX && value >= 0 => Ok(Some(value)),
            Ok(other) => {
                debug!("Node {} probe answered with {:?}", node, other);
                Ok(None)
            }
            Err(e) => {
                debug!("Node {} probe reply unreadable: {}", node, e);
                Ok(None)
            }
        }
    }

    /// Iterate every live node on the bus, yielding `(node, status)`
    pub fn scan(&self, wait: Duration) -> NodeScan<'_> {
        NodeScan {
            device: self,
            next: 0,
            wait,
        }
    }
}

/// Iterator over live nodes, see [`CanDevice::scan`]
pub struct NodeScan<'a> {
    device: &'a CanDevice,
    next: u8,
    wait: Duration,
}

impl Iterator for NodeScan<'_> {
    type Item = Result<(u8, i64)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < MAX_NODES {
            let node = self.next;
            self.next += 1;
            match self.device.probe(node, self.wait) {
                Ok(Some(status)) => return Some(Ok((node, status))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
