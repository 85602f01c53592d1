use uuid::{Uuid, uuid};

use crate::error::{Error, Result};

/// Characteristic every outbound message is written to.
pub const WRITE_CHARACTERISTIC: Uuid = uuid!("0000fa02-0000-1000-8000-00805f9b34fb");
/// Characteristic the panel sends its acknowledgments on.
pub const NOTIFY_CHARACTERISTIC: Uuid = uuid!("0000fa03-0000-1000-8000-00805f9b34fb");

pub const HANDSHAKE_FIRST: [u8; 8] = [0x08, 0x00, 0x01, 0x80, 0x0E, 0x06, 0x32, 0x00];
pub const HANDSHAKE_SECOND: [u8; 4] = [0x04, 0x00, 0x05, 0x80];
pub const ACK_STAGE_ONE: [u8; 12] = [
    0x0C, 0x00, 0x01, 0x80, 0x81, 0x06, 0x32, 0x00, 0x00, 0x01, 0x00, 0x01,
];
pub const ACK_STAGE_TWO: [u8; 8] = [0x08, 0x00, 0x05, 0x80, 0x0B, 0x03, 0x07, 0x02];
pub const ACK_FRAME: [u8; 5] = [0x05, 0x00, 0x02, 0x00, 0x03];
pub const FRAME_VALIDATION: [u8; 5] = [0x05, 0x00, 0x00, 0x01, 0x00];

/// Bytes preceding the payload in every frame.
pub const FRAME_HEADER_LEN: usize = 15;
pub const FRAME_TYPE_IMAGE: u8 = 0x02;
pub const FRAME_TRAILER: [u8; 2] = [0x00, 0x65];
/// Largest payload whose total length still fits the 2-byte length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - FRAME_HEADER_LEN;

/// An encoded, ready-to-write image frame.
///
/// Layout (little-endian):
/// - `[0..2]`   total length (`payload + 15`)
/// - `[2]`      type marker `0x02`
/// - `[3..5]`   reserved, zero
/// - `[5..7]`   payload length
/// - `[7..9]`   reserved, zero
/// - `[9..13]`  CRC-32 of the payload
/// - `[13..15]` trailer `00 65`
/// - `[15..]`   payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_HEADER_LEN..]
    }
}

/// Accepts bytes that came from elsewhere (a capture, a file) only if they
/// pass the same checks as [`decode`].
impl TryFrom<Vec<u8>> for Frame {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        decode(&bytes)?;
        Ok(Frame { bytes })
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Frame::try_from(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Header fields read back out of an encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub total_length: u16,
    pub payload_length: u16,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

/// CRC-32 (IEEE) of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Wraps an opaque payload (usually PNG bytes) into a frame.
///
/// Empty payloads are legal and produce the bare 15-byte header.
pub fn encode(payload: &[u8]) -> Result<Frame> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let data_len = payload.len() as u16;
    let total_len = data_len + FRAME_HEADER_LEN as u16;

    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.push(FRAME_TYPE_IMAGE);
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&checksum(payload).to_le_bytes());
    out.extend_from_slice(&FRAME_TRAILER);
    out.extend_from_slice(payload);
    Ok(Frame { bytes: out })
}

/// Parses and validates a frame produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<DecodedFrame> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(Error::InvalidFrame("shorter than header"));
    }
    let total_length = u16::from_le_bytes([data[0], data[1]]);
    if data[2] != FRAME_TYPE_IMAGE {
        return Err(Error::InvalidFrame("unknown type marker"));
    }
    let payload_length = u16::from_le_bytes([data[5], data[6]]);
    let checksum_field = u32::from_le_bytes([data[9], data[10], data[11], data[12]]);
    if data[13..15] != FRAME_TRAILER {
        return Err(Error::InvalidFrame("bad header trailer"));
    }
    if total_length as usize != data.len() {
        return Err(Error::InvalidFrame("total length does not match frame size"));
    }
    if payload_length as usize + FRAME_HEADER_LEN != data.len() {
        return Err(Error::InvalidFrame("payload length does not match frame size"));
    }
    let payload = data[FRAME_HEADER_LEN..].to_vec();
    let actual = checksum(&payload);
    if actual != checksum_field {
        return Err(Error::ChecksumMismatch {
            expected: checksum_field,
            actual,
        });
    }
    Ok(DecodedFrame {
        total_length,
        payload_length,
        checksum: checksum_field,
        payload,
    })
}

/// Formats bytes as `0C-00-01-80`, the way notifications are logged.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}
