// Puck wire protocol: frame addressing and payload codecs.
//
// Standard 11-bit identifiers. A frame to a puck is addressed
// (host mailbox << 5) | node, a frame to a group is 0x400 | group, and a
// reply from a puck carries the sender's node ID in bits 5..9.
//
// Payloads:
//   GET         [prop]
//   SET         [prop | 0x80, 0, v0, v1, v2, v3]          (little-endian)
//   packed get  [0x80 | v[21:16], v[15:8], v[7:0]]        (22-bit signed)
//   packed torq [prop | 0x80, 4 x 14-bit values, MSB first]

use super::{CanError, Result};

/// Largest CAN payload
pub const MAX_PAYLOAD: usize = 8;

/// Top bit of byte 0 marks a SET
pub const SET_BIT: u8 = 0x80;

/// Group addressing flag
pub const GROUP_FLAG: u16 = 0x0400;

/// Group that every puck on the bus listens to
pub const WHOLE_ARM: u8 = 0;

/// Group pucks send packed position/acceleration replies to
pub const PACKED_REPLY_GROUP: u8 = 3;

/// Packed torque commands are clamped to 14-bit signed range
pub const TORQUE_LIMIT: i32 = 8191;

const HOST_MAILBOX: u16 = 0;

/// Raw CAN frame (standard identifier, up to 8 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: u16,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl Frame {
    pub fn new(id: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CanError::FrameTooLong { len: payload.len() });
        }
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id: id & 0x07FF,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame(0x{:03X} {:02X?})", self.id, self.data())
    }
}

/// Where a request is sent: a single puck or a broadcast group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node(u8),
    Group(u8),
}

impl Destination {
    pub fn address(self) -> u16 {
        match self {
            Destination::Node(id) => (HOST_MAILBOX << 5) | (id as u16 & 0x1F),
            Destination::Group(group) => (HOST_MAILBOX << 5) | GROUP_FLAG | (group as u16 & 0x1F),
        }
    }
}

impl From<u8> for Destination {
    fn from(id: u8) -> Self {
        Destination::Node(id)
    }
}

/// Node ID of the puck that sent a frame
pub fn sender(address: u16) -> u8 {
    ((address >> 5) & 0x1F) as u8
}

/// Address a puck uses to reply to the host
pub fn reply_address(node: u8) -> u16 {
    ((node as u16 & 0x1F) << 5) | HOST_MAILBOX
}

/// Address a puck uses for packed broadcast replies
pub fn packed_reply_address(node: u8) -> u16 {
    ((node as u16 & 0x1F) << 5) | GROUP_FLAG | PACKED_REPLY_GROUP as u16
}

/// Decoded inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// 22-bit packed position/acceleration broadcast reply
    Packed { node: u8, value: i32 },
    /// Property value (a SET-style frame)
    Property { node: u8, property: u8, value: i64 },
    /// A GET request echoed on the bus
    Request { node: u8, property: u8 },
}

impl Message {
    pub fn node(&self) -> u8 {
        match *self {
            Message::Packed { node, .. }
            | Message::Property { node, .. }
            | Message::Request { node, .. } => node,
        }
    }
}

/// Decode a frame received from a puck
pub fn parse(frame: &Frame) -> Result<Message> {
    let data = frame.data();
    let address = frame.id();
    if data.is_empty() {
        return Err(CanError::EmptyFrame { address });
    }

    let node = sender(address);
    let packed_group = address & 0x041F;
    let header = ((data[0] >> 6) & 0x02)
        | (packed_group == 0x0403) as u8
        | (packed_group == 0x0407) as u8;

    match header {
        3 => {
            if data.len() < 3 {
                return Err(CanError::IllegalHeader { address, header });
            }
            Ok(Message::Packed {
                node,
                value: decode_packed([data[0], data[1], data[2]]),
            })
        }
        2 => Ok(Message::Property {
            node,
            property: data[0] & 0x7F,
            value: decode_value(&data[2.min(data.len())..]),
        }),
        0 => Ok(Message::Request {
            node,
            property: data[0] & 0x7F,
        }),
        _ => Err(CanError::IllegalHeader { address, header }),
    }
}

/// Sign-extend a 22-bit packed value
pub fn decode_packed(bytes: [u8; 3]) -> i32 {
    let raw = ((bytes[0] as i32 & 0x3F) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    if raw & 0x0020_0000 != 0 {
        raw - 0x0040_0000
    } else {
        raw
    }
}

/// Inverse of [`decode_packed`], as the firmware emits it
pub fn encode_packed(value: i32) -> [u8; 3] {
    let raw = value & 0x003F_FFFF;
    [
        SET_BIT | ((raw >> 16) & 0x3F) as u8,
        ((raw >> 8) & 0xFF) as u8,
        (raw & 0xFF) as u8,
    ]
}

/// Little-endian value, sign-extended from its top byte
pub(crate) fn decode_value(bytes: &[u8]) -> i64 {
    let bytes = &bytes[..bytes.len().min(MAX_PAYLOAD - 2)];
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as i64) << (i * 8);
    }
    let bits = bytes.len() * 8;
    if value & (1 << (bits - 1)) != 0 {
        value |= -1i64 << bits;
    }
    value
}

/// GET payload
pub fn encode_get(property: u8) -> [u8; 1] {
    [property & 0x7F]
}

/// SET payload; the padding byte keeps the value word-aligned for the puck DSP
pub fn encode_set(property: u8, value: i64) -> [u8; 6] {
    let v = (value as i32).to_le_bytes();
    [(property & 0x7F) | SET_BIT, 0, v[0], v[1], v[2], v[3]]
}

/// Pack four torques into one group frame.
///
/// ```text
///     0        1        2        3        4        5        6        7
/// ATPPPPPP AAAAAAaa aaaaaaBB BBBBbbbb bbbbCCCC CCcccccc ccDDDDDD dddddddd
/// ```
pub fn pack_torques(property: u8, values: [i32; 4]) -> [u8; 8] {
    let v = values.map(|x| x.clamp(-TORQUE_LIMIT, TORQUE_LIMIT));
    [
        property | SET_BIT,
        ((v[0] >> 6) & 0xFF) as u8,
        (((v[0] << 2) & 0xFC) | ((v[1] >> 12) & 0x03)) as u8,
        ((v[1] >> 4) & 0xFF) as u8,
        (((v[1] << 4) & 0xF0) | ((v[2] >> 10) & 0x0F)) as u8,
        ((v[2] >> 2) & 0xFF) as u8,
        (((v[2] << 6) & 0xC0) | ((v[3] >> 8) & 0x3F)) as u8,
        (v[3] & 0xFF) as u8,
    ]
}

/// Puck-side unpacking of a [`pack_torques`] payload
pub fn unpack_torques(data: &[u8; 8]) -> [i32; 4] {
    let d = data.map(|b| b as i32);
    let raw = [
        (d[1] << 6) | (d[2] >> 2),
        ((d[2] & 0x03) << 12) | (d[3] << 4) | (d[4] >> 4),
        ((d[4] & 0x0F) << 10) | (d[5] << 2) | (d[6] >> 6),
        ((d[6] & 0x3F) << 8) | d[7],
    ];
    raw.map(|v| if v & 0x2000 != 0 { v - 0x4000 } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        assert_eq!(Destination::Node(3).address(), 0x003);
        assert_eq!(Destination::Group(0).address(), 0x400);
        assert_eq!(Destination::Group(2).address(), 0x402);
        assert_eq!(sender(reply_address(7)), 7);
        assert_eq!(packed_reply_address(4), 0x483);
    }

    #[test]
    fn test_torque_layout() {
        // T = 42, one value per slot
        let data = pack_torques(42, [1, -1, 0x1FFF, -0x2000 + 1]);
        assert_eq!(data[0], 42 | 0x80);
        assert_eq!(data[1], 0x00);
        assert_eq!(data[2], 0x04 | 0x03);
        assert_eq!(data[3], 0xFF);
        assert_eq!(data[4], 0xF0 | 0x07);
        assert_eq!(data[7], 0x01);
    }

    #[test]
    fn test_torque_unpack_matches_pack() {
        let cases = [
            [0, 0, 0, 0],
            [1000, -1000, 0, 0],
            [8191, -8191, 1, -1],
            [-4096, 4095, -1234, 777],
        ];
        for values in cases {
            assert_eq!(unpack_torques(&pack_torques(42, values)), values);
        }
    }

    #[test]
    fn test_torque_clamped_before_packing() {
        let data = pack_torques(42, [20000, -20000, 8192, -8192]);
        assert_eq!(unpack_torques(&data), [8191, -8191, 8191, -8191]);
    }

    #[test]
    fn test_packed_sign_extension() {
        // bit 21 clear
        assert_eq!(decode_packed([0x80 | 0x1F, 0xFF, 0xFF]), 0x1F_FFFF);
        assert_eq!(decode_packed([0x80, 0x10, 0x00]), 4096);
        // bit 21 set
        assert_eq!(decode_packed([0x80 | 0x3F, 0xFF, 0xFF]), 0x3F_FFFF - 0x40_0000);
        assert_eq!(decode_packed([0x80 | 0x20, 0x00, 0x00]), -0x20_0000);
        assert_eq!(decode_packed(encode_packed(-200)), -200);
    }

    #[test]
    fn test_parse_packed_reply() {
        let frame = Frame::new(packed_reply_address(2), &encode_packed(-5)).unwrap();
        assert_eq!(parse(&frame).unwrap(), Message::Packed { node: 2, value: -5 });
    }

    #[test]
    fn test_parse_property_reply() {
        let frame = Frame::new(reply_address(5), &encode_set(48, -70000)).unwrap();
        assert_eq!(
            parse(&frame).unwrap(),
            Message::Property {
                node: 5,
                property: 48,
                value: -70000
            }
        );

        // two value bytes, sign bit in the second
        let frame = Frame::new(reply_address(1), &[0x85, 0, 0xFE, 0xFF]).unwrap();
        assert_eq!(
            parse(&frame).unwrap(),
            Message::Property {
                node: 1,
                property: 5,
                value: -2
            }
        );
    }

    #[test]
    fn test_parse_request_echo() {
        let frame = Frame::new(reply_address(1), &encode_get(5)).unwrap();
        assert_eq!(parse(&frame).unwrap(), Message::Request { node: 1, property: 5 });
    }

    #[test]
    fn test_parse_illegal_header() {
        // GET-style payload on the packed reply group
        let frame = Frame::new(packed_reply_address(1), &[0x05]).unwrap();
        assert!(matches!(
            parse(&frame),
            Err(CanError::IllegalHeader { header: 1, .. })
        ));
    }

    #[test]
    fn test_set_payload_shape() {
        let data = encode_set(8, 0);
        assert_eq!(data[0] & SET_BIT, SET_BIT);
        assert_eq!(data[1], 0);
        assert_eq!(encode_set(48, 1 << 24)[5], 1);
        assert_eq!(encode_get(0x85), [0x05]);
    }

    #[test]
    fn test_frame_too_long() {
        assert!(matches!(
            Frame::new(1, &[0u8; 9]),
            Err(CanError::FrameTooLong { len: 9 })
        ));
    }
}
