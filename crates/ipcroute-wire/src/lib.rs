//! JSON-RPC message model and envelope wire format.
//!
//! A [`Message`] is one JSON-RPC request, response or notification. On the
//! wire it always travels inside an [`Envelope`], which adds the destination
//! service name or carries a subscribe/unsubscribe command instead.
//!
//! ```
//! use ipcroute_wire::{serialize, Message};
//!
//! let request = Message::request_with_id("test", 7);
//! assert_eq!(
//!     serialize(&request),
//!     r#"{"jsonrpc":"2.0","method":"test","id":7,"params":null}"#
//! );
//! ```

pub mod envelope;
pub mod error;
pub mod message;
pub mod serializer;

pub use envelope::{pack, Envelope};
pub use error::{Result, WireError};
pub use message::{generate_id, ErrorCode, Message, MessageKind, RpcError};
pub use serializer::{deserialize, from_object, serialize, strip_whitespace, to_object};
