use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use ipcroute_channel::sync::lock;
use ipcroute_channel::{ChannelEvent, ListenerId, SharedChannel};
use ipcroute_wire::{pack, Envelope, ErrorCode, Message};
use tracing::{debug, trace, warn};

use crate::error::{Result, ServiceError};
use crate::registry::ListenerRegistry;
use crate::service::{Handler, Service};

pub(crate) const CONNECTION_BROKEN_MESSAGE: &str = "Can't connect to the service.";

struct Pending {
    request: Message,
    on_response: Handler,
    /// Its `send` has not returned yet.
    sending: bool,
    /// A disconnect was seen while sending, with no reconnect after it.
    lost: bool,
}

/// Client-side proxy for a remote service.
///
/// Requests are tagged with the service name and correlated with their
/// responses by id. There is no timeout on [`Service::request`]: a response
/// that never arrives leaves the entry pending until the channel reports a
/// disconnect, which answers every pending request with `ConnectionBroken`.
/// A request whose send is still in progress is judged when the send
/// returns: it survives a disconnect followed by a successful reconnect.
/// Use [`call`](Self::call) for a bounded wait.
///
/// Each distinct subscription command is announced to the remote end once,
/// when it gets its first handler, and withdrawn when it loses its last.
/// All active commands are announced again after a reconnect, except one
/// whose first announcement is the send that reconnected.
pub struct ServiceInterface {
    channel: SharedChannel,
    service: String,
    pending: Mutex<HashMap<i32, Pending>>,
    subscriptions: ListenerRegistry<String>,
    announcing: Mutex<HashSet<String>>,
    listener: OnceLock<ListenerId>,
}

impl ServiceInterface {
    pub fn new(channel: SharedChannel, service: impl Into<String>) -> Arc<Self> {
        let interface = Arc::new(Self {
            channel,
            service: service.into(),
            pending: Mutex::new(HashMap::new()),
            subscriptions: ListenerRegistry::new(),
            announcing: Mutex::new(HashSet::new()),
            listener: OnceLock::new(),
        });
        let this: Weak<Self> = Arc::downgrade(&interface);
        let listener = interface.channel.events().add(move |event| {
            if let Some(interface) = this.upgrade() {
                interface.on_event(event);
            }
        });
        let _ = interface.listener.set(listener);
        interface
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send `message` and wait up to `timeout` for its response.
    ///
    /// On timeout the request is forgotten; a late response is dropped.
    pub fn call(&self, message: Message, timeout: Duration) -> Result<Message> {
        let id = message.id;
        let (tx, rx) = mpsc::channel();
        let on_response = Handler::new(move |response| {
            let _ = tx.send(response);
        });
        self.request(message, on_response)?;
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(_) => {
                lock(&self.pending).remove(&id);
                debug!(service = %self.service, id, "request timed out");
                Err(ServiceError::Timeout(timeout))
            }
        }
    }

    fn on_event(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived { message, .. } => self.on_message(message),
            ChannelEvent::Disconnected { .. } => self.fail_pending(),
            ChannelEvent::Reconnected { .. } => {
                for entry in lock(&self.pending).values_mut() {
                    entry.lost = false;
                }
                self.resubscribe();
            }
        }
    }

    fn on_message(&self, text: &str) {
        let message = match Envelope::unpack(text) {
            Ok(Envelope::Message { message, .. }) => message,
            Ok(other) => {
                trace!(service = %self.service, envelope = ?other, "ignoring envelope");
                return;
            }
            Err(err) => {
                warn!(service = %self.service, error = %err, "dropping malformed envelope");
                return;
            }
        };

        if message.is_response() {
            let pending = lock(&self.pending).remove(&message.id);
            match pending {
                Some(pending) => pending.on_response.call(message),
                None => trace!(service = %self.service, id = message.id, "unmatched response"),
            }
        } else if message.is_notification() {
            let handlers = self
                .subscriptions
                .matching(|command| message.method.starts_with(command.as_str()));
            for (_, handler) in handlers {
                handler.call(message.clone());
            }
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<Pending> = {
            let mut pending = lock(&self.pending);
            let mut settled = Vec::new();
            for (id, entry) in pending.iter_mut() {
                if entry.sending {
                    entry.lost = true;
                } else {
                    settled.push(*id);
                }
            }
            settled.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if !drained.is_empty() {
            debug!(service = %self.service, count = drained.len(), "failing pending requests");
        }
        for pending in drained {
            pending.on_response.call(broken_response(Some(&pending.request)));
        }
    }

    fn resubscribe(&self) {
        let announcing = lock(&self.announcing).clone();
        for command in self.subscriptions.keys() {
            if announcing.contains(&command) {
                continue;
            }
            debug!(service = %self.service, command = %command, "resubscribing");
            if let Err(err) = self
                .channel
                .send(&Envelope::subscribe(self.service.as_str(), command.as_str()).pack())
            {
                warn!(service = %self.service, command = %command, error = %err, "resubscribe failed");
            }
        }
    }
}

impl Service for ServiceInterface {
    /// Send a request; `reply` receives exactly one response unless the
    /// remote end never answers.
    ///
    /// A send that fails because the connection is broken answers `reply`
    /// with `ConnectionBroken` and returns `Ok`.
    fn request(&self, message: Message, reply: Handler) -> Result<()> {
        let id = message.id;
        let text = pack(&message, &self.service);
        let request = Message::request_with_id(message.method, id);
        lock(&self.pending).insert(
            id,
            Pending {
                request,
                on_response: reply,
                sending: true,
                lost: false,
            },
        );

        let sent = self.channel.send(&text);
        let failed = {
            let mut pending = lock(&self.pending);
            let delivered = match (&sent, pending.get_mut(&id)) {
                (Ok(()), Some(entry)) if !entry.lost => {
                    entry.sending = false;
                    true
                }
                (Ok(()), None) => true,
                _ => false,
            };
            if delivered {
                None
            } else {
                pending.remove(&id)
            }
        };

        if let Err(err) = sent {
            if !err.is_connection_broken() {
                return Err(err.into());
            }
            warn!(service = %self.service, id, error = %err, "request not sent");
        } else if failed.is_some() {
            debug!(service = %self.service, id, "connection lost while sending");
        }
        if let Some(pending) = failed {
            pending.on_response.call(broken_response(Some(&pending.request)));
        }
        Ok(())
    }

    fn subscribe(&self, command: &str, handler: &Handler) -> Result<()> {
        if !self.subscriptions.add(command.to_string(), handler) {
            return Ok(());
        }
        let envelope = Envelope::subscribe(self.service.as_str(), command);
        lock(&self.announcing).insert(command.to_string());
        let sent = self.channel.send(&envelope.pack());
        lock(&self.announcing).remove(command);
        if let Err(err) = sent {
            self.subscriptions.remove(&command.to_string(), handler);
            return Err(err.into());
        }
        Ok(())
    }

    fn unsubscribe(&self, command: &str, handler: &Handler) -> Result<()> {
        if !self.subscriptions.remove(&command.to_string(), handler) {
            return Ok(());
        }
        let envelope = Envelope::unsubscribe(self.service.as_str(), command);
        self.channel.send(&envelope.pack())?;
        Ok(())
    }
}

impl Drop for ServiceInterface {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get() {
            self.channel.events().remove(*listener);
        }
    }
}

pub(crate) fn broken_response(request: Option<&Message>) -> Message {
    Message::failed_response_with_message(
        request,
        ErrorCode::ConnectionBroken,
        CONNECTION_BROKEN_MESSAGE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use std::sync::atomic::AtomicBool;

    use ipcroute_channel::{Channel, ChannelEvents, ChannelId, ChannelPair};

    use crate::route_table::{EventSource, RouteTable};
    use crate::router::Router;

    /// Interface on `pair.left`, router with `table` on `pair.right`.
    fn connected(table: Arc<RouteTable>) -> (ChannelPair, Arc<Router>, Arc<ServiceInterface>) {
        let pair = ChannelPair::new();
        let router = Router::new();
        router.add_service(&table);
        router.attach(&(Arc::clone(&pair.right) as SharedChannel));
        let interface = ServiceInterface::new(Arc::clone(&pair.left) as SharedChannel, "Test");
        (pair, router, interface)
    }

    /// Records what it sends. When armed, the next send first loses its
    /// link and, unless `stays_down`, reconnects before the write goes out,
    /// raising the same events a duplex channel raises on a retried write.
    struct FlakyChannel {
        id: ChannelId,
        this: Weak<FlakyChannel>,
        events: ChannelEvents,
        armed: AtomicBool,
        stays_down: bool,
        sent: Mutex<Vec<String>>,
    }

    impl FlakyChannel {
        fn new(stays_down: bool) -> Arc<Self> {
            Arc::new_cyclic(|this| Self {
                id: ChannelId::next(),
                this: this.clone(),
                events: ChannelEvents::new(),
                armed: AtomicBool::new(false),
                stays_down,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn shared(&self) -> SharedChannel {
            self.this.upgrade().expect("channel alive") as SharedChannel
        }

        fn deliver(&self, message: &Message) {
            self.events.emit(&ChannelEvent::MessageReceived {
                sender: self.shared(),
                message: pack(message, "Test"),
            });
        }

        fn sent(&self) -> Vec<Envelope> {
            self.sent
                .lock()
                .expect("lock")
                .iter()
                .map(|text| Envelope::unpack(text).expect("envelope"))
                .collect()
        }
    }

    impl Channel for FlakyChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn send(&self, message: &str) -> ipcroute_channel::Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.events
                    .emit(&ChannelEvent::Disconnected { sender: self.shared() });
                if !self.stays_down {
                    self.events
                        .emit(&ChannelEvent::Reconnected { sender: self.shared() });
                }
            }
            self.sent.lock().expect("lock").push(message.to_string());
            Ok(())
        }

        fn events(&self) -> &ChannelEvents {
            &self.events
        }

        fn dispose(&self) {}
    }

    fn counter() -> (Handler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler = Handler::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn call_round_trip() {
        let table = RouteTable::builder()
            .method("Test/echo", |m| Ok(m.params.clone().unwrap_or_default()))
            .build();
        let (_pair, _router, interface) = connected(table);

        let request = Message::request("Test/echo").with_params(json!({"a": 1}));
        let id = request.id;
        let response = interface
            .call(request, Duration::from_secs(1))
            .expect("response");

        assert_eq!(response.id, id);
        assert_eq!(response.result, Some(json!({"a": 1})));
        assert_eq!(interface.pending_requests(), 0);
    }

    #[test]
    fn subscribe_twice_unsubscribe_twice() {
        let source = EventSource::new();
        let table = RouteTable::builder().event("Test/data", &source).build();
        let (pair, _router, interface) = connected(table);

        let announcements = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&announcements);
        pair.right.events().add(move |event| {
            if let ChannelEvent::MessageReceived { message, .. } = event {
                if matches!(
                    Envelope::unpack(message),
                    Ok(Envelope::Subscribe { .. } | Envelope::Unsubscribe { .. })
                ) {
                    a.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let (handler, count) = counter();
        interface.subscribe("Test/data", &handler).expect("subscribe");
        interface.subscribe("Test/data", &handler).expect("subscribe");
        assert_eq!(announcements.load(Ordering::SeqCst), 1);

        source.publish(json!(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        interface.unsubscribe("Test/data", &handler).expect("unsubscribe");
        source.publish(json!(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        interface.unsubscribe("Test/data", &handler).expect("unsubscribe");
        assert_eq!(announcements.load(Ordering::SeqCst), 2);
        source.publish(json!(3));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notifications_reach_prefix_subscriptions() {
        let pair = ChannelPair::new();
        let interface = ServiceInterface::new(Arc::clone(&pair.left) as SharedChannel, "Test");
        let (data, data_count) = counter();
        let (other, other_count) = counter();
        interface.subscribe("Test/data", &data).expect("subscribe");
        interface.subscribe("Other", &other).expect("subscribe");

        let notification = Message::notification("Test/data/get").with_params(json!(1));
        pair.right.send(&pack(&notification, "")).expect("send");

        assert_eq!(data_count.load(Ordering::SeqCst), 1);
        assert_eq!(other_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_fails_pending_requests() {
        let pair = ChannelPair::new();
        let interface = ServiceInterface::new(Arc::clone(&pair.left) as SharedChannel, "Test");
        let (tx, rx) = mpsc::channel();
        let on_response = Handler::new(move |m| {
            let _ = tx.send(m);
        });

        interface
            .request(Message::request_with_id("Test/slow", 9), on_response)
            .expect("request");
        assert_eq!(interface.pending_requests(), 1);

        pair.right.close();
        let response = rx.recv_timeout(Duration::from_secs(1)).expect("response");
        assert_eq!(response.id, 9);
        assert!(response.is_error(ErrorCode::ConnectionBroken));
        assert_eq!(interface.pending_requests(), 0);
    }

    #[test]
    fn send_failure_answers_connection_broken() {
        let pair = ChannelPair::new();
        let interface = ServiceInterface::new(Arc::clone(&pair.left) as SharedChannel, "Test");
        pair.left.close();

        let response = interface
            .call(Message::request_with_id("Test/any", 4), Duration::from_secs(1))
            .expect("synthesized response");
        assert!(response.is_error(ErrorCode::ConnectionBroken));
        assert_eq!(
            response.error.map(|e| e.message),
            Some(CONNECTION_BROKEN_MESSAGE.to_string())
        );
    }

    #[test]
    fn call_times_out_and_forgets_request() {
        let pair = ChannelPair::new();
        let interface = ServiceInterface::new(Arc::clone(&pair.left) as SharedChannel, "Test");

        let result = interface.call(
            Message::request_with_id("Test/silent", 3),
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(ServiceError::Timeout(_))));
        assert_eq!(interface.pending_requests(), 0);
    }

    #[test]
    fn retried_send_keeps_request_pending() {
        let channel = FlakyChannel::new(false);
        let interface = ServiceInterface::new(channel.shared(), "Test");
        let (tx, rx) = mpsc::channel();
        let on_response = Handler::new(move |m| {
            let _ = tx.send(m);
        });

        channel.armed.store(true, Ordering::SeqCst);
        let request = Message::request_with_id("Test/do", 77);
        interface
            .request(request.clone(), on_response)
            .expect("request");
        assert!(rx.try_recv().is_err());
        assert_eq!(interface.pending_requests(), 1);

        channel.deliver(&Message::response(&request, "OK"));
        let response = rx.recv_timeout(Duration::from_secs(1)).expect("response");
        assert_eq!(response.id, 77);
        assert_eq!(response.result, Some(json!("OK")));
        assert!(response.error.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(interface.pending_requests(), 0);
    }

    #[test]
    fn link_lost_during_send_answers_connection_broken() {
        let channel = FlakyChannel::new(true);
        let interface = ServiceInterface::new(channel.shared(), "Test");
        let (tx, rx) = mpsc::channel();
        let on_response = Handler::new(move |m| {
            let _ = tx.send(m);
        });

        channel.armed.store(true, Ordering::SeqCst);
        interface
            .request(Message::request_with_id("Test/do", 5), on_response)
            .expect("request");

        let response = rx.recv_timeout(Duration::from_secs(1)).expect("response");
        assert_eq!(response.id, 5);
        assert!(response.is_error(ErrorCode::ConnectionBroken));
        assert!(rx.try_recv().is_err());
        assert_eq!(interface.pending_requests(), 0);
    }

    #[test]
    fn subscribe_that_reconnects_is_announced_once() {
        let channel = FlakyChannel::new(false);
        let interface = ServiceInterface::new(channel.shared(), "Test");
        let (existing, _) = counter();
        interface.subscribe("Test/old", &existing).expect("subscribe");

        let (handler, _) = counter();
        channel.armed.store(true, Ordering::SeqCst);
        interface.subscribe("Test/new", &handler).expect("subscribe");

        let subscribes: Vec<String> = channel
            .sent()
            .into_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Subscribe { command, .. } => Some(command),
                _ => None,
            })
            .collect();
        assert_eq!(subscribes, vec!["Test/old", "Test/old", "Test/new"]);
    }
}
