// Linux SocketCAN adapter

use std::io::ErrorKind;
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};
use tracing::{debug, info};

use super::adapter::CanAdapter;
use super::frame::Frame;
use super::{CanError, Result};

/// Blocking read/write timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

pub struct SocketAdapter {
    socket: CanSocket,
    interface: String,
    nonblocking: bool,
}

impl SocketAdapter {
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|e| CanError::DeviceOpen {
            device: interface.to_string(),
            reason: e.to_string(),
        })?;
        socket.set_read_timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))?;
        socket.set_write_timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))?;
        info!("Opened SocketCAN interface {}", interface);

        Ok(Self {
            socket,
            interface: interface.to_string(),
            nonblocking: false,
        })
    }

    fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        if self.nonblocking == blocking {
            self.socket.set_nonblocking(!blocking)?;
            self.nonblocking = !blocking;
        }
        Ok(())
    }

    /// One read attempt. `Ok(None)` when the socket has nothing queued.
    fn try_read(&mut self) -> Result<Option<CanFrame>> {
        match self.socket.read_frame() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CanAdapter for SocketAdapter {
    fn read_frame(&mut self, blocking: bool) -> Result<Option<Frame>> {
        self.set_blocking(blocking)?;
        loop {
            let frame = match self.try_read()? {
                Some(frame) => frame,
                None if blocking => return Err(CanError::Timeout),
                None => return Ok(None),
            };

            match frame {
                CanFrame::Data(data) => match data.id() {
                    Id::Standard(id) => return Frame::new(id.as_raw(), data.data()).map(Some),
                    Id::Extended(id) => debug!("Ignoring extended frame 0x{:08X}", id.as_raw()),
                },
                CanFrame::Remote(_) => debug!("Ignoring remote frame on {}", self.interface),
                CanFrame::Error(e) => debug!("CAN error frame on {}: {:?}", self.interface, e),
            }
        }
    }

    fn write_frame(&mut self, frame: &Frame, blocking: bool) -> Result<()> {
        self.set_blocking(blocking)?;
        let id = StandardId::new(frame.id()).ok_or_else(|| CanError::Adapter {
            reason: format!("identifier 0x{:X} out of standard range", frame.id()),
        })?;
        let out = CanFrame::new(id, frame.data()).ok_or(CanError::FrameTooLong {
            len: frame.len(),
        })?;
        self.socket.write_frame(&out)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("socketcan:{}", self.interface)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    // needs: ip link add dev vcan0 type vcan && ip link set up vcan0
    #[test]
    #[ignore]
    fn test_nonblocking_read_returns_at_once() {
        let mut adapter = SocketAdapter::open("vcan0").unwrap();

        let start = Instant::now();
        for _ in 0..20 {
            assert!(adapter.read_frame(false).unwrap().is_none());
        }
        assert!(start.elapsed() < Duration::from_millis(10), "took {:?}", start.elapsed());
    }
}
