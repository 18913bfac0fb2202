use std::time::Duration;

use crate::channel::ChannelId;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ipcroute_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] ipcroute_frame::FrameError),

    /// The rendezvous handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The channel cannot carry messages any more: it was accepted passively
    /// (no peer name to reconnect to) or it was disposed.
    #[error("channel {0} is closed")]
    Closed(ChannelId),

    /// The link is down; the next send on this outbound channel reconnects.
    #[error("channel {0} is disconnected")]
    Disconnected(ChannelId),

    /// Non-blocking send on a channel that is not connected right now.
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The address cannot be turned into a channel name.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The message cannot be routed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The operation makes no sense on this kind of channel.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Spawning a thread failed.
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),
}

impl ChannelError {
    /// True if the error means the remote end cannot be reached through this
    /// channel right now.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            ChannelError::Transport(_)
            | ChannelError::HandshakeFailed(_)
            | ChannelError::Closed(_)
            | ChannelError::Disconnected(_)
            | ChannelError::NotConnected(_)
            | ChannelError::Timeout(_) => true,
            ChannelError::Frame(err) => matches!(
                err,
                ipcroute_frame::FrameError::Io(_)
                    | ipcroute_frame::FrameError::ConnectionClosed
                    | ipcroute_frame::FrameError::Truncated { .. }
                    | ipcroute_frame::FrameError::Transport(_)
            ),
            ChannelError::InvalidAddress { .. }
            | ChannelError::InvalidMessage(_)
            | ChannelError::Unsupported(_)
            | ChannelError::Spawn(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
