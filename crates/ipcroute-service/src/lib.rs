//! JSON-RPC services over ipcroute channels.
//!
//! - [`Router`]: server side; dispatches requests and subscriptions to
//!   [`Service`]s by route prefix.
//! - [`ServiceInterface`]: client side; a [`Service`] backed by a remote one.
//! - [`HostRouter`]: a [`Channel`](ipcroute_channel::Channel) that forwards
//!   envelopes to the host named in their service field.
//! - [`RouteTable`]: a service built from explicit method, property and
//!   event routes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipcroute_channel::{Listener, Multiplexer, SharedChannel};
//! use ipcroute_service::{RouteTable, Router};
//! use ipcroute_transport::UdsTransport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(UdsTransport::new("/tmp/ipcroute")?);
//! let listener = Arc::new(Listener::bind(transport, "Clock")?);
//! let incoming: SharedChannel = Multiplexer::new(&*listener);
//!
//! let router = Router::new();
//! router.add_service(
//!     &RouteTable::builder()
//!         .method("Clock/now", |_| Ok(serde_json::json!(0)))
//!         .build(),
//! );
//! router.attach(&incoming);
//! listener.start()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod host_router;
pub mod locator;
pub mod registry;
pub mod route_table;
pub mod router;
pub mod service;
pub mod service_interface;

pub use error::{Result, ServiceError};
pub use host_router::HostRouter;
pub use locator::{ServiceInterfaceFactory, ServiceLocator, StaticLocator};
pub use registry::ListenerRegistry;
pub use route_table::{EventSource, RouteTable, RouteTableBuilder};
pub use router::Router;
pub use service::{Handler, Service};
pub use service_interface::ServiceInterface;
