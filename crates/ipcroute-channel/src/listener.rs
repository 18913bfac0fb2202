use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ipcroute_transport::{effective_uid, IpcStream, StreamListener, Transport};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelId, Listeners, SharedChannel};
use crate::duplex::{ChannelConfig, DuplexChannel};
use crate::error::{ChannelError, Result};
use crate::handshake::rendezvous_server;
use crate::sync::lock;

/// Decides whether a freshly accepted stream may proceed to the rendezvous.
pub trait AuthorizationCheck: Send + Sync {
    fn check(&self, stream: &IpcStream) -> bool;
}

impl<F> AuthorizationCheck for F
where
    F: Fn(&IpcStream) -> bool + Send + Sync,
{
    fn check(&self, stream: &IpcStream) -> bool {
        self(stream)
    }
}

/// Admit only peers running as our effective user.
///
/// Peers whose credentials cannot be read are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameUserCheck;

impl AuthorizationCheck for SameUserCheck {
    fn check(&self, stream: &IpcStream) -> bool {
        stream
            .peer_credentials()
            .is_some_and(|(uid, _, _)| uid == effective_uid())
    }
}

/// Accepted-connection lifecycle notification.
#[derive(Clone)]
pub enum ConnectionEvent {
    Connected(SharedChannel),
    Disconnected(SharedChannel),
}

impl ConnectionEvent {
    pub fn channel(&self) -> &SharedChannel {
        match self {
            ConnectionEvent::Connected(channel) | ConnectionEvent::Disconnected(channel) => channel,
        }
    }
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Connected(channel) => {
                f.debug_tuple("Connected").field(&channel.id()).finish()
            }
            ConnectionEvent::Disconnected(channel) => {
                f.debug_tuple("Disconnected").field(&channel.id()).finish()
            }
        }
    }
}

/// Source of accepted-connection notifications.
pub trait ChannelConnectNotifier: Send + Sync {
    fn connection_events(&self) -> &Listeners<ConnectionEvent>;
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Configuration of every accepted channel.
    pub channel: ChannelConfig,
    /// How often the accept loop checks for shutdown while idle.
    pub accept_poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            accept_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Accepts inbound connections on a well-known name and turns each into a
/// [`DuplexChannel`].
///
/// Every accepted stream is checked by the authorization check (if any), then
/// completes the rendezvous on its own thread. Once a channel is ready it is
/// announced with [`ConnectionEvent::Connected`] before it starts reading, so
/// subscribers never miss its first message. When its link goes down it is
/// announced with [`ConnectionEvent::Disconnected`] and forgotten.
pub struct Listener {
    name: String,
    transport: Arc<dyn Transport>,
    socket: Mutex<Option<Box<dyn StreamListener>>>,
    config: ListenerConfig,
    authorization: Option<Arc<dyn AuthorizationCheck>>,
    events: Listeners<ConnectionEvent>,
    channels: Mutex<HashMap<ChannelId, SharedChannel>>,
    running: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind the well-known `name`. Nothing is accepted before [`Listener::start`].
    pub fn bind(transport: Arc<dyn Transport>, name: &str) -> Result<Self> {
        let socket = transport.bind(name)?;
        Ok(Self {
            name: name.to_string(),
            transport,
            socket: Mutex::new(Some(socket)),
            config: ListenerConfig::default(),
            authorization: None,
            events: Listeners::new(),
            channels: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            accept_thread: Mutex::new(None),
        })
    }

    /// Override listener config.
    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install an authorization check.
    pub fn with_authorization(mut self, check: impl AuthorizationCheck + 'static) -> Self {
        self.authorization = Some(Arc::new(check));
        self
    }

    /// Start the accept loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("ipcroute-accept-{}", self.name))
            .spawn(move || accept_loop(this))
            .map_err(|err| {
                self.running.store(false, Ordering::Release);
                ChannelError::Spawn(err)
            })?;
        *lock(&self.accept_thread) = Some(handle);
        info!(name = %self.name, transport = self.transport.transport_name(), "listener started");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channels currently connected through this listener.
    pub fn channels(&self) -> Vec<SharedChannel> {
        lock(&self.channels).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Stop accepting, release the name and dispose every accepted channel.
    pub fn dispose(&self) {
        self.running.store(false, Ordering::Release);
        let handle = lock(&self.accept_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        lock(&self.socket).take();

        for channel in self.channels() {
            channel.dispose();
        }
        lock(&self.channels).clear();
        debug!(name = %self.name, "listener disposed");
    }

    fn accept_once(self: &Arc<Self>) -> bool {
        let accepted = {
            let socket = lock(&self.socket);
            let Some(socket) = socket.as_ref() else {
                return false;
            };
            socket.accept_timeout(self.config.accept_poll_interval)
        };
        match accepted {
            Ok(stream) => self.admit(stream),
            Err(err) if err.is_timeout() => {}
            Err(err) => {
                error!(name = %self.name, error = %err, "accept failed");
                thread::sleep(self.config.accept_poll_interval);
            }
        }
        true
    }

    fn admit(self: &Arc<Self>, stream: IpcStream) {
        if let Some(check) = &self.authorization {
            if !check.check(&stream) {
                warn!(name = %self.name, peer = ?stream.peer_credentials(), "connection refused by authorization check");
                let _ = stream.shutdown();
                return;
            }
        }

        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("ipcroute-handshake-{}", self.name))
            .spawn(move || {
                if let Err(err) = this.complete(stream) {
                    warn!(name = %this.name, error = %err, "inbound rendezvous failed");
                }
            });
        if let Err(err) = spawned {
            error!(name = %self.name, error = %err, "failed to spawn handshake thread");
        }
    }

    fn complete(self: &Arc<Self>, stream: IpcStream) -> Result<()> {
        let streams = rendezvous_server(
            self.transport.as_ref(),
            stream,
            &self.config.channel.handshake,
        )?;
        let channel = DuplexChannel::accepted(streams, self.config.channel.clone())?;
        let shared: SharedChannel = Arc::clone(&channel) as SharedChannel;

        let this: Weak<Listener> = Arc::downgrade(self);
        channel.events().add(move |event| {
            if let ChannelEvent::Disconnected { sender } = event {
                if let Some(listener) = this.upgrade() {
                    listener.forget(sender);
                }
            }
        });

        if !self.running.load(Ordering::Acquire) {
            channel.dispose();
            return Err(ChannelError::Closed(channel.id()));
        }
        lock(&self.channels).insert(channel.id(), Arc::clone(&shared));
        info!(name = %self.name, channel = %channel.id(), "client connected");
        self.events.emit(&ConnectionEvent::Connected(shared));
        channel.start()
    }

    fn forget(&self, channel: &SharedChannel) {
        let removed = lock(&self.channels).remove(&channel.id());
        if let Some(channel) = removed {
            info!(name = %self.name, channel = %channel.id(), "client disconnected");
            self.events.emit(&ConnectionEvent::Disconnected(channel));
        }
    }
}

fn accept_loop(this: Weak<Listener>) {
    loop {
        let Some(listener) = this.upgrade() else {
            return;
        };
        if !listener.running.load(Ordering::Acquire) || !listener.accept_once() {
            return;
        }
    }
}

impl ChannelConnectNotifier for Listener {
    fn connection_events(&self) -> &Listeners<ConnectionEvent> {
        &self.events
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
