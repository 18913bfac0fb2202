use std::time::Duration;

use ipcroute_channel::ChannelError;
use ipcroute_wire::WireError;

/// Errors raised by services and service proxies.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The underlying channel failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A message or its params could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A service handler rejected the request.
    #[error("{0}")]
    Handler(String),

    /// The locator knows no address for the service.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// No response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    pub fn handler(message: impl Into<String>) -> Self {
        ServiceError::Handler(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
