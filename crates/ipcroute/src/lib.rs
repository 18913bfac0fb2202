//! JSON-RPC service routing over local IPC channels.
//!
//! Services exchange JSON-RPC 2.0 messages wrapped in envelopes, framed with
//! a 2-byte length prefix, over duplex channels built from pairs of
//! unidirectional streams.
//!
//! # Crate Structure
//!
//! - [`transport`]: Named stream transport (Unix domain sockets)
//! - [`frame`]: Length-prefixed framing
//! - [`wire`]: Messages, serializer and envelopes
//! - [`channel`]: Duplex channels, listener, multiplexer
//! - [`service`]: Router, host router, service proxies (behind `service` feature)

/// Re-export transport types.
pub mod transport {
    pub use ipcroute_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipcroute_frame::*;
}

/// Re-export wire types.
pub mod wire {
    pub use ipcroute_wire::*;
}

/// Re-export channel types.
pub mod channel {
    pub use ipcroute_channel::*;
}

/// Re-export service types (requires `service` feature).
#[cfg(feature = "service")]
pub mod service {
    pub use ipcroute_service::*;
}
