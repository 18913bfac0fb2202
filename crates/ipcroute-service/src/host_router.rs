use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use ipcroute_channel::sync::{lock, read, write};
use ipcroute_channel::{
    Channel, ChannelError, ChannelEvent, ChannelEvents, ChannelFactory, ChannelId, ListenerId,
    SharedChannel, WorkerPool,
};
use ipcroute_wire::{pack, Envelope};
use tracing::{debug, error, warn};

use crate::service_interface::broken_response;

struct HostConnection {
    factory: Arc<dyn ChannelFactory>,
    channel: Mutex<Option<(SharedChannel, ListenerId)>>,
}

/// Sends envelopes to the host named in their `service` field.
///
/// Channels are opened lazily, on the first send to a host, and reused.
/// Sends run on the shared [`WorkerPool`], so a slow host does not hold up
/// the caller or other hosts.
///
/// When a host is unknown or unreachable, the router answers with a
/// `ConnectionBroken` response raised as its own `MessageReceived` event.
/// Events of the host channels are re-raised with the router as sender, so
/// replies to them are routed again.
pub struct HostRouter {
    id: ChannelId,
    this: Weak<HostRouter>,
    events: ChannelEvents,
    hosts: RwLock<HashMap<String, Arc<HostConnection>>>,
}

impl HostRouter {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ChannelId::next(),
            this: this.clone(),
            events: ChannelEvents::new(),
            hosts: RwLock::new(HashMap::new()),
        })
    }

    /// Register `host`; `factory` opens its channel on first use.
    ///
    /// The factory is asked for `host` itself.
    pub fn add_connection(&self, host: impl Into<String>, factory: Arc<dyn ChannelFactory>) {
        let host = host.into();
        debug!(router = %self.id, host = %host, "host registered");
        let previous = write(&self.hosts).insert(
            host,
            Arc::new(HostConnection {
                factory,
                channel: Mutex::new(None),
            }),
        );
        if let Some(previous) = previous {
            release(&previous);
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        read(&self.hosts).keys().cloned().collect()
    }

    /// Channel for `host`, connecting first if needed.
    fn resolve(&self, host: &str) -> Option<SharedChannel> {
        let Some(connection) = read(&self.hosts).get(host).cloned() else {
            warn!(router = %self.id, host, "unknown host");
            return None;
        };

        let mut slot = lock(&connection.channel);
        if let Some((channel, _)) = slot.as_ref() {
            return Some(Arc::clone(channel));
        }
        match connection.factory.channel_for(host) {
            Ok(channel) => {
                let listener = self.forward_events(&channel);
                *slot = Some((Arc::clone(&channel), listener));
                Some(channel)
            }
            Err(err) => {
                warn!(router = %self.id, host, error = %err, "cannot connect to host");
                None
            }
        }
    }

    fn forward_events(&self, channel: &SharedChannel) -> ListenerId {
        let this = self.this.clone();
        channel.events().add(move |event| {
            let Some(router) = this.upgrade() else {
                return;
            };
            let sender = Arc::clone(&router) as SharedChannel;
            match event {
                ChannelEvent::MessageReceived { message, .. } => {
                    router.events.emit(&ChannelEvent::MessageReceived {
                        sender,
                        message: message.clone(),
                    })
                }
                ChannelEvent::Reconnected { .. } => {
                    router.events.emit(&ChannelEvent::Reconnected { sender })
                }
                ChannelEvent::Disconnected { .. } => {}
            }
        })
    }

    fn notify_broken(&self, envelope: &Envelope) {
        let request = match envelope {
            Envelope::Message { message, .. } => Some(message),
            _ => None,
        };
        let response = broken_response(request);
        if let Some(router) = self.this.upgrade() {
            let sender = router as SharedChannel;
            self.events.emit(&ChannelEvent::MessageReceived {
                sender,
                message: pack(&response, ""),
            });
        }
    }
}

impl Channel for HostRouter {
    fn id(&self) -> ChannelId {
        self.id
    }

    /// Route one envelope. Delivery failures are reported as events, not
    /// errors; only a message that is not an envelope fails here.
    fn send(&self, message: &str) -> ipcroute_channel::Result<()> {
        let envelope =
            Envelope::unpack(message).map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        let Some(channel) = self.resolve(envelope.service()) else {
            self.notify_broken(&envelope);
            return Ok(());
        };

        let this = self.this.clone();
        let text = message.to_string();
        WorkerPool::shared().spawn(move || {
            let Err(err) = channel.send(&text) else {
                return;
            };
            if err.is_connection_broken() {
                warn!(host = %envelope.service(), error = %err, "send to host failed");
                if let Some(router) = this.upgrade() {
                    router.notify_broken(&envelope);
                }
            } else {
                error!(host = %envelope.service(), error = %err, "send to host failed");
            }
        });
        Ok(())
    }

    fn events(&self) -> &ChannelEvents {
        &self.events
    }

    /// Dispose every host channel opened so far.
    fn dispose(&self) {
        let connections: Vec<Arc<HostConnection>> = read(&self.hosts).values().cloned().collect();
        for connection in connections {
            release(&connection);
        }
    }
}

fn release(connection: &HostConnection) {
    if let Some((channel, listener)) = lock(&connection.channel).take() {
        channel.events().remove(listener);
        channel.dispose();
    }
}
