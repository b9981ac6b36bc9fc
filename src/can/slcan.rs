// Serial-line CAN adapter (Lawicel ASCII protocol)
//
// Frames travel as text lines over a USB serial port:
//   t<id:3 hex><len:1 hex><data:2*len hex>\r   standard data frame
//   \r                                          command accepted
//   \x07                                        command rejected
//   z\r / Z\r                                   transmit acknowledged

use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::adapter::CanAdapter;
use super::frame::Frame;
use super::{CanError, Result};

/// Serial line rate between host and adapter
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 50;

/// "S8": 1 Mbit/s CAN bit rate
const BITRATE_1M: &str = "S8";

const CR: u8 = b'\r';
const BELL: u8 = 0x07;

pub struct SlcanAdapter {
    port: Box<dyn SerialPort>,
    path: String,
    pending: Vec<u8>,
}

impl SlcanAdapter {
    /// Open the serial device and bring the CAN channel up at 1 Mbit/s
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, DEFAULT_BAUDRATE)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()
            .map_err(|e| CanError::DeviceOpen {
                device: path.to_string(),
                reason: e.to_string(),
            })?;
        Self::with_port(port, path)
    }

    /// Bring up the CAN channel on an already-open serial port
    fn with_port(port: Box<dyn SerialPort>, path: &str) -> Result<Self> {
        let mut adapter = Self {
            port,
            path: path.to_string(),
            pending: Vec::new(),
        };
        // close first in case a previous session left the channel open
        adapter.command("C")?;
        adapter.command(BITRATE_1M)?;
        adapter.command("O")?;
        adapter.port.clear(ClearBuffer::Input)?;
        info!("Opened SLCAN adapter on {}", path);
        Ok(adapter)
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        debug!("slcan {} <- {}", self.path, cmd);
        self.port.write_all(cmd.as_bytes())?;
        self.port.write_all(&[CR])?;
        self.port.flush()?;
        Ok(())
    }

    /// Pop one complete line (terminator included) off the receive buffer
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == CR || b == BELL)?;
        Some(self.pending.drain(..=end).collect())
    }

    /// Pull whatever the port has into the receive buffer.
    /// Returns false when nothing arrived; a non-blocking fill never waits.
    fn fill(&mut self, blocking: bool) -> Result<bool> {
        if !blocking && self.port.bytes_to_read()? == 0 {
            return Ok(false);
        }

        let mut buf = [0u8; 64];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl CanAdapter for SlcanAdapter {
    fn read_frame(&mut self, blocking: bool) -> Result<Option<Frame>> {
        loop {
            while let Some(line) = self.next_line() {
                if let Some(frame) = parse_line(&line)? {
                    return Ok(Some(frame));
                }
            }
            if !self.fill(blocking)? {
                return if blocking {
                    Err(CanError::Timeout)
                } else {
                    Ok(None)
                };
            }
        }
    }

    fn write_frame(&mut self, frame: &Frame, _blocking: bool) -> Result<()> {
        self.port.write_all(encode_frame(frame).as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("slcan:{}", self.path)
    }
}

impl Drop for SlcanAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.command("C") {
            debug!("Failed to close SLCAN channel on {}: {}", self.path, e);
        }
    }
}

/// Transmit line for a standard data frame
fn encode_frame(frame: &Frame) -> String {
    let mut line = format!("t{:03X}{:X}", frame.id(), frame.len());
    for b in frame.data() {
        line.push_str(&format!("{:02X}", b));
    }
    line.push(CR as char);
    line
}

/// Decode one received line. Acknowledgements and frame types the puck
/// protocol never uses yield `Ok(None)`.
fn parse_line(line: &[u8]) -> Result<Option<Frame>> {
    let Some((&last, body)) = line.split_last() else {
        return Ok(None);
    };
    if last == BELL {
        return Err(CanError::Adapter {
            reason: "command rejected by SLCAN adapter".to_string(),
        });
    }

    match body.first() {
        Some(b't') => {}
        Some(b'z') | Some(b'Z') | None => return Ok(None),
        Some(other) => {
            debug!("Ignoring SLCAN line of type {:?}", *other as char);
            return Ok(None);
        }
    }

    let text = std::str::from_utf8(&body[1..]).map_err(|_| malformed(body))?;
    if !text.is_ascii() || text.len() < 4 {
        return Err(malformed(body));
    }
    let id = u16::from_str_radix(&text[..3], 16).map_err(|_| malformed(body))?;
    let len = usize::from_str_radix(&text[3..4], 16).map_err(|_| malformed(body))?;
    let hex = &text[4..];
    if hex.len() < len * 2 {
        return Err(malformed(body));
    }

    let data = (0..len)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| malformed(body))?;
    Frame::new(id, &data).map(Some)
}

fn malformed(line: &[u8]) -> CanError {
    CanError::Adapter {
        reason: format!("malformed SLCAN frame {:?}", String::from_utf8_lossy(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_nonblocking_read_returns_at_once() {
        use std::time::Instant;

        let (_host_side, adapter_side) = serialport::TTYPort::pair().unwrap();
        let mut adapter = SlcanAdapter::with_port(Box::new(adapter_side), "pty").unwrap();

        let start = Instant::now();
        for _ in 0..20 {
            assert!(adapter.read_frame(false).unwrap().is_none());
        }
        // a single millisecond of waiting per read would already add up to 20 ms
        assert!(start.elapsed() < Duration::from_millis(10), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_encode_frame() {
        let frame = Frame::new(0x401, &[0xAA, 0x00, 0x12]).unwrap();
        assert_eq!(encode_frame(&frame), "t4013AA0012\r");

        let get = Frame::new(0x003, &[0x05]).unwrap();
        assert_eq!(encode_frame(&get), "t003105\r");
    }

    #[test]
    fn test_parse_data_frame() {
        let frame = parse_line(b"t0206850002000000\r").unwrap().unwrap();
        assert_eq!(frame.id(), 0x020);
        assert_eq!(frame.data(), &[0x85, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_acks_and_other_types() {
        assert!(parse_line(b"\r").unwrap().is_none());
        assert!(parse_line(b"z\r").unwrap().is_none());
        assert!(parse_line(b"T0000001080\r").unwrap().is_none());
        assert!(parse_line(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_bell_is_error() {
        assert!(matches!(
            parse_line(&[BELL]),
            Err(CanError::Adapter { .. })
        ));
    }

    #[test]
    fn test_parse_truncated_frame() {
        assert!(matches!(
            parse_line(b"t0203AA\r"),
            Err(CanError::Adapter { .. })
        ));
        assert!(matches!(parse_line(b"t02\r"), Err(CanError::Adapter { .. })));
    }
}
