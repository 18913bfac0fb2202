use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::channel::{Channel, ChannelEvents, ChannelId, ListenerId, SharedChannel};
use crate::error::{ChannelError, Result};
use crate::listener::{ChannelConnectNotifier, ConnectionEvent};
use crate::sync::lock;

/// Merges the events of every channel a listener accepts into one stream.
///
/// Events keep their original `sender`, so replies go back through the
/// channel the message arrived on. The multiplexer itself has no outbound
/// path: [`Channel::send`] fails with [`ChannelError::Unsupported`].
pub struct Multiplexer {
    id: ChannelId,
    this: Weak<Multiplexer>,
    events: ChannelEvents,
    attached: Mutex<HashMap<ChannelId, (SharedChannel, ListenerId)>>,
}

impl Multiplexer {
    /// Attach to `notifier`; every channel it announces from now on is merged.
    pub fn new(notifier: &dyn ChannelConnectNotifier) -> Arc<Self> {
        let multiplexer = Arc::new_cyclic(|this: &Weak<Multiplexer>| Self {
            id: ChannelId::next(),
            this: this.clone(),
            events: ChannelEvents::new(),
            attached: Mutex::new(HashMap::new()),
        });
        let this = Arc::downgrade(&multiplexer);
        notifier.connection_events().add(move |event| {
            if let Some(multiplexer) = this.upgrade() {
                multiplexer.on_connection(event);
            }
        });
        multiplexer
    }

    /// Number of channels currently merged.
    pub fn channel_count(&self) -> usize {
        lock(&self.attached).len()
    }

    fn on_connection(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(channel) => self.attach(channel),
            ConnectionEvent::Disconnected(channel) => {
                let detached = lock(&self.attached).remove(&channel.id());
                if let Some((channel, listener)) = detached {
                    channel.events().remove(listener);
                    trace!(multiplexer = %self.id, channel = %channel.id(), "detached channel");
                }
            }
        }
    }

    /// Merge the events of `channel`.
    pub fn attach(&self, channel: &SharedChannel) {
        let this = self.this.clone();
        let listener = channel.events().add(move |event| {
            if let Some(multiplexer) = this.upgrade() {
                multiplexer.events.emit(event);
            }
        });
        lock(&self.attached).insert(channel.id(), (Arc::clone(channel), listener));
        trace!(multiplexer = %self.id, channel = %channel.id(), "attached channel");
    }
}

impl Channel for Multiplexer {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, _message: &str) -> Result<()> {
        Err(ChannelError::Unsupported(
            "a multiplexer has no outbound path; reply through the event sender",
        ))
    }

    fn events(&self) -> &ChannelEvents {
        &self.events
    }

    /// Detach from every merged channel. The channels stay open.
    fn dispose(&self) {
        let attached: Vec<_> = lock(&self.attached).drain().map(|(_, entry)| entry).collect();
        for (channel, listener) in attached {
            channel.events().remove(listener);
        }
    }
}
