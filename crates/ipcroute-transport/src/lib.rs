//! Named, connection-oriented stream transport.
//!
//! The messaging layers above only need two capabilities from a transport:
//! open a stream to a *name*, and listen on a *name* for incoming streams.
//! Each stream is used in one direction only; full duplex is synthesized by
//! the rendezvous handshake in `ipcroute-channel`.
//!
//! [`UdsTransport`] implements the capability over Unix domain sockets, mapping
//! every name to a socket file inside one runtime directory.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use traits::{validate_name, IpcStream, StreamListener, Transport, MAX_NAME_LEN};

#[cfg(unix)]
pub use uds::{effective_uid, UdsTransport, UnixDomainSocket};
