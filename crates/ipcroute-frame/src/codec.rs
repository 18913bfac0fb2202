use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: big-endian payload length.
pub const HEADER_SIZE: usize = 2;

/// Largest payload a 2-byte header can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    /// Consume the frame and return its payload as an owned string.
    pub fn into_text(self) -> Result<String> {
        self.as_str().map(str::to_owned)
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode `payload` into `dst`.
///
/// ```text
/// ┌──────────────┬─────────────────────┐
/// │ Length (2B)  │ Payload             │
/// │ big-endian   │ (Length bytes)      │
/// └──────────────┴─────────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u16(payload.len() as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let payload_len = u16::from_be_bytes([src[0], src[1]]) as usize;
    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Frame { payload }))
}

/// Stream timeouts applied by [`crate::FrameReader::with_config_ipc`] and
/// [`crate::FrameWriter::with_config_ipc`]. `None` blocks indefinitely.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}
