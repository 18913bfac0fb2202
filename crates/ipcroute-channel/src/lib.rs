//! Duplex message channels over unidirectional streams.
//!
//! - [`DuplexChannel`]: one full-duplex link built by the rendezvous
//!   handshake, with a lazy single-flight reconnect on send.
//! - [`Connector`] / [`ChannelFactory`]: outbound channels by name or address.
//! - [`Listener`]: accepts inbound channels on a well-known name and announces
//!   them through [`ChannelConnectNotifier`].
//! - [`Multiplexer`]: merges every accepted channel into one event stream.
//! - [`ChannelPair`]: two in-memory channels wired back to back.
//!
//! Messages are whole UTF-8 strings; event listeners receive them on the
//! shared [`WorkerPool`].

pub mod channel;
pub mod connector;
pub mod duplex;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod memory;
pub mod multiplexer;
pub mod pool;
pub mod sync;

pub use channel::{
    Channel, ChannelEvent, ChannelEvents, ChannelId, ListenerId, Listeners, SharedChannel,
};
pub use connector::{host_of, ChannelFactory, Connector};
pub use duplex::{ChannelConfig, ConnectionState, DuplexChannel};
pub use error::{ChannelError, Result};
pub use handshake::{
    rendezvous_client, rendezvous_server, validate_channel_name, HandshakeConfig,
    RendezvousStreams,
};
pub use listener::{
    AuthorizationCheck, ChannelConnectNotifier, ConnectionEvent, Listener, ListenerConfig,
    SameUserCheck,
};
pub use memory::{ChannelPair, MemoryChannel};
pub use multiplexer::Multiplexer;
pub use pool::{panic_message, WorkerPool};
