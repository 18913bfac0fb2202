use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::error::Result;
use crate::pool::panic_message;
use crate::sync::{read, write};

/// Process-unique channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// A bidirectional message pipe carrying whole text messages.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Send one message (blocking).
    fn send(&self, message: &str) -> Result<()>;

    /// Lifecycle and message notifications of this channel.
    fn events(&self) -> &ChannelEvents;

    /// Release the channel. Idempotent.
    fn dispose(&self);
}

pub type SharedChannel = Arc<dyn Channel>;

/// Notification raised by a channel.
///
/// `sender` is the channel that observed the event: replies to a received
/// message go out through `sender`.
#[derive(Clone)]
pub enum ChannelEvent {
    MessageReceived {
        sender: SharedChannel,
        message: String,
    },
    Reconnected {
        sender: SharedChannel,
    },
    Disconnected {
        sender: SharedChannel,
    },
}

impl ChannelEvent {
    pub fn sender(&self) -> &SharedChannel {
        match self {
            ChannelEvent::MessageReceived { sender, .. }
            | ChannelEvent::Reconnected { sender }
            | ChannelEvent::Disconnected { sender } => sender,
        }
    }
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::MessageReceived { sender, message } => f
                .debug_struct("MessageReceived")
                .field("sender", &sender.id())
                .field("message", message)
                .finish(),
            ChannelEvent::Reconnected { sender } => f
                .debug_struct("Reconnected")
                .field("sender", &sender.id())
                .finish(),
            ChannelEvent::Disconnected { sender } => f
                .debug_struct("Disconnected")
                .field("sender", &sender.id())
                .finish(),
        }
    }
}

/// Handle returned by [`Listeners::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of event callbacks.
///
/// `emit` calls every callback registered at the time of the call, in
/// registration order, without holding the registry lock. A panicking
/// callback is logged and does not stop the others.
pub struct Listeners<E> {
    callbacks: RwLock<Vec<(ListenerId, Callback<E>)>>,
    next_id: AtomicU64,
}

pub type ChannelEvents = Listeners<ChannelEvent>;

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.callbacks).push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut callbacks = write(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        read(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = read(&self.callbacks)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(panic = %panic_message(panic.as_ref()), "event listener panicked");
            }
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("ch-"));
    }

    #[test]
    fn add_emit_remove() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let sum = Arc::clone(&total);
        let first = listeners.add(move |n| {
            sum.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let sum = Arc::clone(&total);
        listeners.add(move |n| {
            sum.fetch_add(*n as usize * 10, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 2);

        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);

        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        listeners.emit(&1);
        assert_eq!(total.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let listeners = Listeners::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        listeners.add(|_| panic!("listener failure"));
        let seen = Arc::clone(&hits);
        listeners.add(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unregister_itself_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(std::sync::Mutex::new(None));

        let registry = Arc::clone(&listeners);
        let own_id = Arc::clone(&slot);
        let seen = Arc::clone(&hits);
        let id = listeners.add(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_id.lock().unwrap() {
                registry.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }
}
