//! Framed binary bus payloads
//!
//! Every message on the capture bus is a fixed 20-byte header followed by a
//! bincode payload:
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ payload_len│ 4 bytes   │ Payload size                       │
//! │ frame_type │ 1 byte    │ CaptureRequest / SwapBlotter / ... │
//! │ version    │ 1 byte    │ Payload format version (0-255)     │
//! │ reserved   │ 2 bytes   │ Zero                               │
//! │ seq        │ 8 bytes   │ Producer-local frame counter       │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! The checksum is verified on decode; a mismatch or short frame surfaces as
//! `SERIALIZATION_ERROR` and the message routes to the DLQ.

use crc32fast::Hasher;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CaptureError;

pub const FRAME_HEADER_SIZE: usize = 20;

/// Frame kinds on the capture bus
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    CaptureRequest = 1,
    SwapBlotter = 2,
    DeadLetter = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = CaptureError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::CaptureRequest),
            2 => Ok(Self::SwapBlotter),
            3 => Ok(Self::DeadLetter),
            _ => Err(CaptureError::Serialization(format!(
                "unknown frame type {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub frame_type: u8,
    pub version: u8,
    pub seq: u64,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, seq: u64, payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u32,
            frame_type: frame_type as u8,
            version: 0,
            seq,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4] = self.frame_type;
        buf[5] = self.version;
        // buf[6..8] reserved
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            frame_type: buf[4],
            version: buf[5],
            seq: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            checksum: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

fn crc32_checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize a value into a framed message.
pub fn encode_frame<T: Serialize>(
    frame_type: FrameType,
    seq: u64,
    value: &T,
) -> Result<Vec<u8>, CaptureError> {
    let payload =
        bincode::serialize(value).map_err(|e| CaptureError::Serialization(e.to_string()))?;
    let header = FrameHeader::new(frame_type, seq, &payload);

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a framed message, verifying length and checksum.
pub fn decode_frame<T: DeserializeOwned>(
    expected: FrameType,
    bytes: &[u8],
) -> Result<(FrameHeader, T), CaptureError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(CaptureError::Serialization(format!(
            "frame shorter than header: {} bytes",
            bytes.len()
        )));
    }
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    header_buf.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&header_buf);

    if header.frame_type != expected as u8 {
        return Err(CaptureError::Serialization(format!(
            "expected frame type {}, got {}",
            expected as u8, header.frame_type
        )));
    }

    let payload = &bytes[FRAME_HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(CaptureError::Serialization(format!(
            "payload length mismatch: header {} actual {}",
            header.payload_len,
            payload.len()
        )));
    }
    if !header.verify_checksum(payload) {
        return Err(CaptureError::Serialization("checksum mismatch".into()));
    }

    let value =
        bincode::deserialize(payload).map_err(|e| CaptureError::Serialization(e.to_string()))?;
    Ok((header, value))
}
