use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use ipcroute_frame::{FrameError, FrameReader, FrameWriter};
use ipcroute_transport::{IpcStream, Transport};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelEvent, ChannelEvents, ChannelId, SharedChannel};
use crate::error::{ChannelError, Result};
use crate::handshake::{rendezvous_client, HandshakeConfig, RendezvousStreams};
use crate::pool::WorkerPool;
use crate::sync::lock;

/// Connection state of a [`DuplexChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub handshake: HandshakeConfig,
    /// Write timeout of the outbound stream. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl ChannelConfig {
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

enum Role {
    /// Opened by us; can reconnect to `peer`.
    Outbound {
        transport: Arc<dyn Transport>,
        peer: String,
    },
    /// Accepted by a listener; the peer reconnects, we cannot.
    Accepted { reply_name: String },
}

/// One established pair of streams.
struct Link {
    generation: u64,
    writer: Mutex<FrameWriter<IpcStream>>,
    inbound: IpcStream,
    outbound: IpcStream,
}

impl Link {
    fn write(&self, message: &str) -> std::result::Result<(), FrameError> {
        lock(&self.writer).write_text(message)
    }

    fn shutdown(&self) {
        let _ = self.outbound.shutdown();
        let _ = self.inbound.shutdown();
    }
}

struct Inner {
    state: ConnectionState,
    link: Option<Arc<Link>>,
    /// Reader of the current link until `start` hands it to a receive thread.
    pending_reader: Option<(u64, FrameReader<IpcStream>)>,
    generation: u64,
    disposed: bool,
}

/// Full-duplex message channel over two unidirectional streams.
///
/// Outbound channels (see [`DuplexChannel::connect`]) reconnect lazily: a
/// send observed while `Disconnected` runs the rendezvous again, and only one
/// sender at a time does so; concurrent senders wait for its outcome. Channels
/// accepted by a [`crate::Listener`] are passive and report
/// [`ChannelError::Closed`] once their link is gone.
///
/// Every received frame is dispatched to the event listeners on the shared
/// [`WorkerPool`], never on the receive thread. `Reconnected` and
/// `Disconnected` are raised on the thread that observed the transition.
pub struct DuplexChannel {
    id: ChannelId,
    this: Weak<DuplexChannel>,
    role: Role,
    config: ChannelConfig,
    inner: Mutex<Inner>,
    state_changed: Condvar,
    events: ChannelEvents,
}

impl DuplexChannel {
    fn create(role: Role, config: ChannelConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ChannelId::next(),
            this: this.clone(),
            role,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                link: None,
                pending_reader: None,
                generation: 0,
                disposed: false,
            }),
            state_changed: Condvar::new(),
            events: ChannelEvents::new(),
        })
    }

    /// Open a channel to the listener on `name` and start receiving.
    pub fn connect(
        transport: Arc<dyn Transport>,
        name: &str,
        config: ChannelConfig,
    ) -> Result<Arc<Self>> {
        let streams = rendezvous_client(transport.as_ref(), name, &config.handshake)?;
        let channel = Self::create(
            Role::Outbound {
                transport,
                peer: name.to_string(),
            },
            config,
        );
        channel.install(streams)?;
        channel.start()?;
        info!(channel = %channel.id, peer = name, "channel connected");
        Ok(channel)
    }

    /// Wrap the streams of a server-side rendezvous.
    ///
    /// The channel is connected but does not read until [`DuplexChannel::start`]
    /// is called, so listeners can be attached first.
    pub fn accepted(streams: RendezvousStreams, config: ChannelConfig) -> Result<Arc<Self>> {
        let channel = Self::create(
            Role::Accepted {
                reply_name: streams.reply_name.clone(),
            },
            config,
        );
        channel.install(streams)?;
        Ok(channel)
    }

    /// Start the receive loop of the current link. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let pending = lock(&self.inner).pending_reader.take();
        let Some((generation, reader)) = pending else {
            return Ok(());
        };

        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name(format!("ipcroute-recv-{}", self.id.get()))
            .spawn(move || receive_loop(this, generation, reader));
        if let Err(err) = spawned {
            self.teardown(generation);
            return Err(ChannelError::Spawn(err));
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Name of the listener this channel connects to, for outbound channels.
    pub fn peer_name(&self) -> Option<&str> {
        match &self.role {
            Role::Outbound { peer, .. } => Some(peer),
            Role::Accepted { .. } => None,
        }
    }

    /// Send one message, reconnecting first if the channel is disconnected.
    ///
    /// A failed write tears the link down and is retried once, over a fresh
    /// link, on outbound channels.
    pub fn send(&self, message: &str) -> Result<()> {
        let mut retried = false;
        loop {
            let link = self.ensure_connected()?;
            let err = match link.write(message) {
                Ok(()) => {
                    trace!(channel = %self.id, len = message.len(), "sent frame");
                    return Ok(());
                }
                Err(err @ FrameError::PayloadTooLarge { .. }) => return Err(err.into()),
                Err(err) => err,
            };

            self.teardown(link.generation);
            match &self.role {
                Role::Outbound { .. } if !retried => {
                    debug!(channel = %self.id, error = %err, "write failed; retrying once");
                    retried = true;
                }
                Role::Outbound { .. } => {
                    warn!(channel = %self.id, error = %err, "write failed after retry");
                    return Err(ChannelError::Disconnected(self.id));
                }
                Role::Accepted { .. } => {
                    debug!(channel = %self.id, error = %err, "write on accepted channel failed");
                    return Err(ChannelError::Closed(self.id));
                }
            }
        }
    }

    /// Send only if connected right now; never runs a handshake.
    pub fn try_send(&self, message: &str) -> Result<()> {
        let link = {
            let inner = lock(&self.inner);
            if inner.disposed {
                return Err(ChannelError::Closed(self.id));
            }
            match (&inner.state, &inner.link) {
                (ConnectionState::Connected, Some(link)) => Arc::clone(link),
                _ => return Err(ChannelError::NotConnected(self.id)),
            }
        };
        link.write(message).map_err(|err| {
            if !matches!(err, FrameError::PayloadTooLarge { .. }) {
                self.teardown(link.generation);
            }
            err.into()
        })
    }

    /// Close both streams. Idempotent.
    pub fn dispose(&self) {
        let link = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.state = ConnectionState::Disconnected;
            inner.pending_reader = None;
            self.state_changed.notify_all();
            inner.link.take()
        };
        debug!(channel = %self.id, "channel disposed");
        if let Some(link) = link {
            link.shutdown();
            self.emit(|sender| ChannelEvent::Disconnected { sender });
        }
    }

    /// Current link, connecting first if needed.
    fn ensure_connected(&self) -> Result<Arc<Link>> {
        let mut inner = lock(&self.inner);
        let mut waited = false;
        loop {
            if inner.disposed {
                return Err(ChannelError::Closed(self.id));
            }
            match inner.state {
                ConnectionState::Connected => {
                    if let Some(link) = &inner.link {
                        return Ok(Arc::clone(link));
                    }
                    inner.state = ConnectionState::Disconnected;
                }
                ConnectionState::Connecting => {
                    waited = true;
                    inner = self
                        .state_changed
                        .wait(inner)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                ConnectionState::Disconnected if waited => {
                    // Another sender's handshake just failed.
                    return Err(ChannelError::Disconnected(self.id));
                }
                ConnectionState::Disconnected => {
                    let Role::Outbound { transport, peer } = &self.role else {
                        return Err(ChannelError::Closed(self.id));
                    };
                    inner.state = ConnectionState::Connecting;
                    drop(inner);
                    return self.reconnect(transport.as_ref(), peer);
                }
            }
        }
    }

    fn reconnect(&self, transport: &dyn Transport, peer: &str) -> Result<Arc<Link>> {
        debug!(channel = %self.id, peer, "reconnecting");
        let result = rendezvous_client(transport, peer, &self.config.handshake)
            .and_then(|streams| self.install(streams))
            .and_then(|link| self.start().map(|()| link));

        match result {
            Ok(link) => {
                info!(channel = %self.id, peer, "channel reconnected");
                self.emit(|sender| ChannelEvent::Reconnected { sender });
                Ok(link)
            }
            Err(err) => {
                let mut inner = lock(&self.inner);
                if inner.state == ConnectionState::Connecting {
                    inner.state = ConnectionState::Disconnected;
                }
                self.state_changed.notify_all();
                drop(inner);
                warn!(channel = %self.id, peer, error = %err, "reconnect failed");
                Err(err)
            }
        }
    }

    fn install(&self, streams: RendezvousStreams) -> Result<Arc<Link>> {
        let RendezvousStreams { reader, writer, .. } = streams;
        writer
            .get_ref()
            .set_write_timeout(self.config.write_timeout)?;
        let inbound = reader.get_ref().try_clone()?;
        let outbound = writer.get_ref().try_clone()?;

        let mut inner = lock(&self.inner);
        if inner.disposed {
            let _ = outbound.shutdown();
            let _ = inbound.shutdown();
            return Err(ChannelError::Closed(self.id));
        }
        inner.generation += 1;
        let link = Arc::new(Link {
            generation: inner.generation,
            writer: Mutex::new(writer),
            inbound,
            outbound,
        });
        inner.link = Some(Arc::clone(&link));
        inner.pending_reader = Some((inner.generation, reader));
        inner.state = ConnectionState::Connected;
        self.state_changed.notify_all();
        Ok(link)
    }

    /// Drop link `generation` if it is still the current one.
    fn teardown(&self, generation: u64) {
        let link = {
            let mut inner = lock(&self.inner);
            match &inner.link {
                Some(link) if link.generation == generation => {}
                _ => return,
            }
            inner.state = ConnectionState::Disconnected;
            self.state_changed.notify_all();
            inner.link.take()
        };
        if let Some(link) = link {
            link.shutdown();
            info!(channel = %self.id, "channel disconnected");
            self.emit(|sender| ChannelEvent::Disconnected { sender });
        }
    }

    fn emit(&self, make: impl FnOnce(SharedChannel) -> ChannelEvent) {
        if let Some(this) = self.this.upgrade() {
            self.events.emit(&make(this));
        }
    }

    fn dispatch(self: Arc<Self>, message: String) {
        WorkerPool::shared().spawn(move || {
            let sender: SharedChannel = Arc::clone(&self) as SharedChannel;
            self.events
                .emit(&ChannelEvent::MessageReceived { sender, message });
        });
    }

    fn label(&self) -> &str {
        match &self.role {
            Role::Outbound { peer, .. } => peer,
            Role::Accepted { reply_name } => reply_name,
        }
    }
}

fn receive_loop(this: Weak<DuplexChannel>, generation: u64, mut reader: FrameReader<IpcStream>) {
    loop {
        let outcome = reader.read_text();
        let Some(channel) = this.upgrade() else {
            return;
        };
        match outcome {
            Ok(Some(message)) => {
                trace!(channel = %channel.id, len = message.len(), "received frame");
                channel.dispatch(message);
            }
            Ok(None) => {
                debug!(channel = %channel.id, peer = channel.label(), "end of stream");
                channel.teardown(generation);
                return;
            }
            Err(FrameError::InvalidUtf8(err)) => {
                warn!(channel = %channel.id, error = %err, "dropping frame with invalid UTF-8");
            }
            Err(err) => {
                debug!(channel = %channel.id, error = %err, "receive loop stopped");
                channel.teardown(generation);
                return;
            }
        }
    }
}

impl Channel for DuplexChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, message: &str) -> Result<()> {
        DuplexChannel::send(self, message)
    }

    fn events(&self) -> &ChannelEvents {
        &self.events
    }

    fn dispose(&self) {
        DuplexChannel::dispose(self)
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(link) = inner.link.take() {
            link.shutdown();
        }
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("id", &self.id)
            .field("peer", &self.label())
            .field("state", &self.state())
            .finish()
    }
}
