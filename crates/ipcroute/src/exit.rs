use std::fmt;
use std::io;

use ipcroute_channel::ChannelError;
use ipcroute_frame::FrameError;
use ipcroute_service::ServiceError;
use ipcroute_transport::TransportError;
use ipcroute_wire::{ErrorCode, Message};

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::InvalidName { .. } | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::PayloadTooLarge { .. } | FrameError::InvalidUtf8(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Frame(err) => frame_error(context, err),
        ChannelError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ChannelError::InvalidAddress { .. } | ChannelError::InvalidMessage(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ChannelError::Spawn(_) | ChannelError::Unsupported(_) => {
            CliError::new(INTERNAL, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn service_error(context: &str, err: ServiceError) -> CliError {
    match err {
        ServiceError::Channel(err) => channel_error(context, err),
        ServiceError::Wire(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ServiceError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ServiceError::UnknownService(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ServiceError::Handler(_) => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

/// Exit code for a response: success unless it carries an error.
pub fn response_code(response: &Message) -> i32 {
    match response.error.as_ref().and_then(|e| e.error_code()) {
        None if response.error.is_none() => SUCCESS,
        Some(ErrorCode::ConnectionBroken) => TRANSPORT_ERROR,
        Some(ErrorCode::InvalidParams | ErrorCode::ParseError | ErrorCode::InvalidRequest) => {
            DATA_INVALID
        }
        _ => FAILURE,
    }
}
