use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipcroute_wire::Message;

use crate::error::Result;

/// A message callback with an identity.
///
/// Clones share the identity, so the same handler can be passed to
/// `subscribe` and later to `unsubscribe`.
#[derive(Clone)]
pub struct Handler {
    id: u64,
    callback: Arc<dyn Fn(Message) + Send + Sync>,
}

impl Handler {
    pub fn new(callback: impl Fn(Message) + Send + Sync + 'static) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call(&self, message: Message) {
        (self.callback)(message)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handler {}

impl Hash for Handler {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.id).finish()
    }
}

/// Request/subscribe contract shared by local services and remote proxies.
pub trait Service: Send + Sync {
    /// Handle a request. `reply` receives the response.
    ///
    /// An `Err` means no response was produced; the router answers with a
    /// `ServerException` in that case.
    fn request(&self, message: Message, reply: Handler) -> Result<()>;

    /// Deliver notifications for `command` to `handler`.
    fn subscribe(&self, command: &str, handler: &Handler) -> Result<()>;

    /// Undo one matching `subscribe`.
    fn unsubscribe(&self, command: &str, handler: &Handler) -> Result<()>;
}
