//! Length-prefixed message framing.
//!
//! Every message is a 2-byte big-endian payload length followed by that many
//! bytes of UTF-8 text. A payload is at most 65,535 bytes; larger payloads are
//! rejected, never split or truncated.
//!
//! End-of-stream exactly on a frame boundary is a clean close and reads as
//! `Ok(None)`; end-of-stream inside a frame is [`FrameError::Truncated`].

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, HEADER_SIZE, MAX_PAYLOAD};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
