use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::channel::{Channel, ChannelEvent, ChannelEvents, ChannelId, SharedChannel};
use crate::error::{ChannelError, Result};

/// One end of an in-memory [`ChannelPair`].
///
/// A send raises `MessageReceived` on the other end synchronously, on the
/// sender's thread.
pub struct MemoryChannel {
    id: ChannelId,
    this: Weak<MemoryChannel>,
    peer: OnceLock<Weak<MemoryChannel>>,
    closed: Arc<AtomicBool>,
    events: ChannelEvents,
}

impl MemoryChannel {
    fn new(closed: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ChannelId::next(),
            this: this.clone(),
            peer: OnceLock::new(),
            closed,
            events: ChannelEvents::new(),
        })
    }

    fn peer(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    /// Close both ends; each raises `Disconnected` once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for end in [self.this.upgrade(), self.peer()].into_iter().flatten() {
            let sender: SharedChannel = Arc::clone(&end) as SharedChannel;
            end.events.emit(&ChannelEvent::Disconnected { sender });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, message: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id));
        }
        let peer = self.peer().ok_or(ChannelError::Closed(self.id))?;
        let sender: SharedChannel = Arc::clone(&peer) as SharedChannel;
        peer.events.emit(&ChannelEvent::MessageReceived {
            sender,
            message: message.to_string(),
        });
        Ok(())
    }

    fn events(&self) -> &ChannelEvents {
        &self.events
    }

    fn dispose(&self) {
        self.close();
    }
}

/// Two channels wired back to back in memory.
pub struct ChannelPair {
    pub left: Arc<MemoryChannel>,
    pub right: Arc<MemoryChannel>,
}

impl ChannelPair {
    pub fn new() -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let left = MemoryChannel::new(Arc::clone(&closed));
        let right = MemoryChannel::new(closed);
        let _ = left.peer.set(Arc::downgrade(&right));
        let _ = right.peer.set(Arc::downgrade(&left));
        Self { left, right }
    }
}

impl Default for ChannelPair {
    fn default() -> Self {
        Self::new()
    }
}
