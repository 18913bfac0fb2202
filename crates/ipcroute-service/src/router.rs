use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};

use ipcroute_channel::sync::{lock, read, write};
use ipcroute_channel::{panic_message, ChannelEvent, ChannelId, ListenerId, SharedChannel};
use ipcroute_wire::{pack, Envelope, ErrorCode, Message};
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::route_table::RouteTable;
use crate::service::{Handler, Service};

/// The notification sink shared by every subscription of one channel.
struct Subscriber {
    sink: Handler,
    commands: HashMap<String, usize>,
}

/// Dispatches inbound envelopes to services by route prefix.
///
/// A route matches a request method or a (un)subscribe command when it is a
/// string prefix of it. Each matching service is called once per envelope.
///
/// - Requests with no matching route are answered with `MethodNotFound`.
/// - Subscriptions are never answered, matched or not.
/// - Responses and notifications go back on the channel the envelope came
///   from, packed with an empty service name.
///
/// When a channel disconnects, or a notification cannot be delivered to it,
/// all of its subscriptions are released.
pub struct Router {
    this: Weak<Router>,
    routes: RwLock<HashMap<String, Arc<dyn Service>>>,
    subscribers: Mutex<HashMap<ChannelId, Subscriber>>,
    attached: Mutex<Vec<(SharedChannel, ListenerId)>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            routes: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            attached: Mutex::new(Vec::new()),
        })
    }

    /// Serve envelopes received on `channel`.
    ///
    /// `channel` may be a [`Multiplexer`](ipcroute_channel::Multiplexer):
    /// replies follow the original sender of each event.
    pub fn attach(&self, channel: &SharedChannel) {
        let this = self.this.clone();
        let listener = channel.events().add(move |event| {
            if let Some(router) = this.upgrade() {
                router.on_event(event);
            }
        });
        lock(&self.attached).push((Arc::clone(channel), listener));
    }

    pub fn add_route(&self, prefix: impl Into<String>, service: Arc<dyn Service>) {
        let prefix = prefix.into();
        debug!(route = %prefix, "route added");
        write(&self.routes).insert(prefix, service);
    }

    pub fn remove_route(&self, prefix: &str) -> bool {
        write(&self.routes).remove(prefix).is_some()
    }

    /// Route every entry of `table` to it.
    pub fn add_service(&self, table: &Arc<RouteTable>) {
        for route in table.routes() {
            self.add_route(route, Arc::clone(table) as Arc<dyn Service>);
        }
    }

    pub fn routes(&self) -> Vec<String> {
        read(&self.routes).keys().cloned().collect()
    }

    /// Number of channels currently holding a notification sink.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Handle one envelope received from `sender`.
    pub fn dispatch(&self, sender: &SharedChannel, text: &str) {
        let envelope = match Envelope::unpack(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel = %sender.id(), error = %err, "dropping malformed envelope");
                return;
            }
        };

        match envelope {
            Envelope::Subscribe { command, .. } => self.subscribe(sender, &command),
            Envelope::Unsubscribe { command, .. } => self.unsubscribe(sender.id(), &command),
            Envelope::Message { message, .. } if message.is_request() => {
                self.request(sender, message)
            }
            Envelope::Message { message, .. } => {
                debug!(channel = %sender.id(), method = %message.method, "not a request");
                send_reply(
                    sender,
                    &Message::failed_response(Some(&message), ErrorCode::MethodNotFound),
                );
            }
        }
    }

    /// Detach from every channel and release all subscriptions.
    pub fn dispose(&self) {
        let attached: Vec<_> = lock(&self.attached).drain(..).collect();
        for (channel, listener) in attached {
            channel.events().remove(listener);
        }
        let channels: Vec<ChannelId> = lock(&self.subscribers).keys().copied().collect();
        for channel in channels {
            self.forget(channel);
        }
    }

    fn on_event(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived { sender, message } => self.dispatch(sender, message),
            ChannelEvent::Disconnected { sender } => self.forget(sender.id()),
            ChannelEvent::Reconnected { .. } => {}
        }
    }

    /// Services whose route prefixes `key`, each listed once.
    fn services_for(&self, key: &str) -> Vec<Arc<dyn Service>> {
        let routes = read(&self.routes);
        let mut services: Vec<Arc<dyn Service>> = Vec::new();
        for (prefix, service) in routes.iter() {
            if key.starts_with(prefix.as_str()) && !services.iter().any(|s| Arc::ptr_eq(s, service))
            {
                services.push(Arc::clone(service));
            }
        }
        services
    }

    fn request(&self, sender: &SharedChannel, message: Message) {
        let services = self.services_for(&message.method);
        if services.is_empty() {
            debug!(channel = %sender.id(), method = %message.method, "no route for request");
            send_reply(
                sender,
                &Message::failed_response(Some(&message), ErrorCode::MethodNotFound),
            );
            return;
        }

        let reply = reply_sink(sender);
        for service in services {
            trace!(channel = %sender.id(), method = %message.method, id = message.id, "dispatching request");
            let outcome =
                catch_unwind(AssertUnwindSafe(|| service.request(message.clone(), reply.clone())));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    Message::server_exception(&message, err.to_string(), format!("{err:?}"))
                }
                Err(panic) => {
                    let text = panic_message(panic.as_ref());
                    let detail = format!("service panicked handling '{}': {text}", message.method);
                    Message::server_exception(&message, text, detail)
                }
            };
            warn!(method = %message.method, id = message.id, "request failed in service");
            reply.call(failure);
        }
    }

    fn subscribe(&self, sender: &SharedChannel, command: &str) {
        let sink = {
            let mut subscribers = lock(&self.subscribers);
            let subscriber = subscribers
                .entry(sender.id())
                .or_insert_with(|| Subscriber {
                    sink: self.notification_sink(sender),
                    commands: HashMap::new(),
                });
            *subscriber.commands.entry(command.to_string()).or_insert(0) += 1;
            subscriber.sink.clone()
        };

        let services = self.services_for(command);
        if services.is_empty() {
            debug!(channel = %sender.id(), command, "no route for subscription");
        }
        for service in services {
            guarded(command, || service.subscribe(command, &sink));
        }
    }

    fn unsubscribe(&self, channel: ChannelId, command: &str) {
        let sink = {
            let mut subscribers = lock(&self.subscribers);
            let Some(subscriber) = subscribers.get_mut(&channel) else {
                debug!(channel = %channel, command, "unsubscribe without subscription");
                return;
            };
            if let Some(count) = subscriber.commands.get_mut(command) {
                *count -= 1;
                if *count == 0 {
                    subscriber.commands.remove(command);
                }
            }
            subscriber.sink.clone()
        };

        for service in self.services_for(command) {
            guarded(command, || service.unsubscribe(command, &sink));
        }
    }

    /// Release every subscription `channel` holds.
    fn forget(&self, channel: ChannelId) {
        let Some(subscriber) = lock(&self.subscribers).remove(&channel) else {
            return;
        };
        debug!(channel = %channel, commands = subscriber.commands.len(), "releasing subscriptions");
        for (command, count) in &subscriber.commands {
            for service in self.services_for(command) {
                for _ in 0..*count {
                    guarded(command, || service.unsubscribe(command, &subscriber.sink));
                }
            }
        }
    }

    fn notification_sink(&self, channel: &SharedChannel) -> Handler {
        let router = self.this.clone();
        let channel = Arc::clone(channel);
        Handler::new(move |message: Message| {
            let Err(err) = channel.send(&pack(&message, "")) else {
                return;
            };
            if err.is_connection_broken() {
                warn!(
                    channel = %channel.id(),
                    method = %message.method,
                    error = %err,
                    "subscriber unreachable; unsubscribing"
                );
                if let Some(router) = router.upgrade() {
                    router.forget(channel.id());
                }
            } else {
                error!(channel = %channel.id(), method = %message.method, error = %err, "failed to send notification");
            }
        })
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let attached = std::mem::take(&mut *lock(&self.attached));
        for (channel, listener) in attached {
            channel.events().remove(listener);
        }
    }
}

fn reply_sink(channel: &SharedChannel) -> Handler {
    let channel = Arc::clone(channel);
    Handler::new(move |message: Message| send_reply(&channel, &message))
}

fn send_reply(channel: &SharedChannel, message: &Message) {
    if let Err(err) = channel.send(&pack(message, "")) {
        error!(channel = %channel.id(), id = message.id, error = %err, "failed to send response");
    }
}

fn guarded(command: &str, action: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(command, error = %err, "service rejected subscription change"),
        Err(panic) => {
            error!(command, panic = %panic_message(panic.as_ref()), "service panicked")
        }
    }
}
