use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use ipcroute_transport::IpcStream;

use crate::codec::{decode_frame, Frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames. The
/// reader may buffer bytes past the frame it returns, so a stream must keep
/// one `FrameReader` for its whole life.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Ok(None)` when the stream ends on a frame boundary.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return match self.buf.len() {
                    0 => Ok(None),
                    received => Err(FrameError::Truncated {
                        expected: self.pending_frame_len(),
                        received,
                    }),
                };
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read the next frame as UTF-8 text.
    pub fn read_text(&mut self) -> Result<Option<String>> {
        self.read_frame()?.map(Frame::into_text).transpose()
    }

    fn pending_frame_len(&self) -> usize {
        if self.buf.len() < HEADER_SIZE {
            return HEADER_SIZE;
        }
        HEADER_SIZE + u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply the read timeout.
    pub fn with_config_ipc(inner: IpcStream, config: &FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::new(inner))
    }
}
