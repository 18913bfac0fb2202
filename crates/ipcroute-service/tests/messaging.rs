#![cfg(unix)]

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipcroute_channel::{
    rendezvous_server, Connector, DuplexChannel, HandshakeConfig, Listener, Multiplexer,
    RendezvousStreams, SharedChannel,
};
use ipcroute_service::{
    EventSource, Handler, HostRouter, Result, RouteTable, Router, Service, ServiceInterface,
};
use ipcroute_transport::{Transport, UdsTransport};
use ipcroute_wire::{pack, Envelope, ErrorCode, Message};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(3);

fn unique_temp_dir(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/ipcr-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// A listening service: listener, multiplexer and router on `name`.
struct Server {
    listener: Arc<Listener>,
    router: Arc<Router>,
    _incoming: SharedChannel,
}

impl Server {
    fn start(transport: &Arc<dyn Transport>, name: &str, service: Arc<dyn Service>) -> Self {
        let listener =
            Arc::new(Listener::bind(Arc::clone(transport), name).expect("listener should bind"));
        let incoming: SharedChannel = Multiplexer::new(&*listener);
        let router = Router::new();
        router.add_route(name, service);
        router.attach(&incoming);
        listener.start().expect("listener should start");
        Self {
            listener,
            router,
            _incoming: incoming,
        }
    }

    fn stop(self) {
        self.listener.dispose();
        self.router.dispose();
    }
}

struct Fixture {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
}

impl Fixture {
    fn new(tag: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let transport: Arc<dyn Transport> =
            Arc::new(UdsTransport::new(&dir).expect("runtime dir should be creatable"));
        Self { dir, transport }
    }

    fn client(&self, name: &str) -> Arc<ServiceInterface> {
        let connector = Connector::new(Arc::clone(&self.transport));
        let channel = connector.connect(name).expect("client should connect");
        ServiceInterface::new(channel as SharedChannel, name)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn stub_table(seen: Arc<Mutex<Vec<Message>>>) -> Arc<RouteTable> {
    RouteTable::builder()
        .method("Test/route", move |m| {
            seen.lock().expect("lock").push(m.clone());
            Ok(json!("OK"))
        })
        .build()
}

/// Never answers.
struct BlackHole;

impl Service for BlackHole {
    fn request(&self, _message: Message, _reply: Handler) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self, _command: &str, _handler: &Handler) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(&self, _command: &str, _handler: &Handler) -> Result<()> {
        Ok(())
    }
}

#[test]
fn request_reaches_service_and_response_returns() {
    let fixture = Fixture::new("msg-rpc");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = Server::start(&fixture.transport, "Test", stub_table(Arc::clone(&seen)));
    let client = fixture.client("Test");

    let request = Message::request("Test/route").with_params(json!({"x": [1, 2]}));
    let response = client.call(request.clone(), WAIT).expect("response");

    assert_eq!(response.id, request.id);
    assert_eq!(response.result, Some(json!("OK")));
    assert_eq!(*seen.lock().expect("lock"), vec![request]);
    server.stop();
}

#[test]
fn unknown_method_is_method_not_found() {
    let fixture = Fixture::new("msg-404");
    let server = Server::start(
        &fixture.transport,
        "Test",
        stub_table(Arc::new(Mutex::new(Vec::new()))),
    );
    let client = fixture.client("Test");

    let response = client
        .call(Message::request("Test/missing"), WAIT)
        .expect("response");
    assert!(response.is_error(ErrorCode::MethodNotFound));
    server.stop();
}

#[test]
fn subscription_refcount_over_sockets() {
    let fixture = Fixture::new("msg-sub");
    let source = EventSource::new();
    let table = RouteTable::builder().event("Test/data", &source).build();
    let server = Server::start(&fixture.transport, "Test", table);
    let client = fixture.client("Test");

    let (tx, rx) = mpsc::channel();
    let handler = Handler::new(move |m: Message| {
        let _ = tx.send(m);
    });
    client.subscribe("Test/data", &handler).expect("subscribe");
    client.subscribe("Test/data", &handler).expect("subscribe");
    assert!(wait_until(WAIT, || source.subscriber_count() == 1));

    source.publish(json!(1));
    let first = rx.recv_timeout(WAIT).expect("first notification");
    assert_eq!(first.method, "Test/data");
    assert_eq!(first.params, Some(json!(1)));

    client.unsubscribe("Test/data", &handler).expect("unsubscribe");
    source.publish(json!(2));
    let second = rx.recv_timeout(WAIT).expect("still subscribed");
    assert_eq!(second.params, Some(json!(2)));

    client.unsubscribe("Test/data", &handler).expect("unsubscribe");
    assert!(wait_until(WAIT, || source.subscriber_count() == 0));
    source.publish(json!(3));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    server.stop();
}

#[test]
fn server_shutdown_fails_pending_requests() {
    let fixture = Fixture::new("msg-down");
    let server = Server::start(&fixture.transport, "Test", Arc::new(BlackHole));
    let client = fixture.client("Test");

    let (tx, rx) = mpsc::channel();
    client
        .request(
            Message::request("Test/never"),
            Handler::new(move |m| {
                let _ = tx.send(m);
            }),
        )
        .expect("request");
    assert!(wait_until(WAIT, || server.listener.connection_count() == 1));

    server.stop();
    let response = rx.recv_timeout(WAIT).expect("synthesized response");
    assert!(response.is_error(ErrorCode::ConnectionBroken));
    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn client_resubscribes_after_server_restart() {
    let fixture = Fixture::new("msg-restart");
    let source = EventSource::new();
    let table = RouteTable::builder()
        .event("Test/data", &source)
        .method("Test/ping", |_| Ok(json!("pong")))
        .build();
    let server = Server::start(&fixture.transport, "Test", Arc::clone(&table) as Arc<dyn Service>);
    let client = fixture.client("Test");

    let (tx, rx) = mpsc::channel();
    let handler = Handler::new(move |m: Message| {
        let _ = tx.send(m);
    });
    client.subscribe("Test/data", &handler).expect("subscribe");
    assert!(wait_until(WAIT, || source.subscriber_count() == 1));

    server.stop();
    assert!(wait_until(WAIT, || source.subscriber_count() == 0));

    let server = Server::start(&fixture.transport, "Test", table);
    let pong = client
        .call(Message::request("Test/ping"), WAIT)
        .expect("call after restart");
    assert_eq!(pong.result, Some(json!("pong")));

    assert!(wait_until(WAIT, || source.subscriber_count() == 1));
    source.publish(json!("again"));
    let notification = rx.recv_timeout(WAIT).expect("notification after restart");
    assert_eq!(notification.params, Some(json!("again")));
    server.stop();
}

#[test]
fn host_router_forwards_to_lazily_connected_host() {
    let fixture = Fixture::new("msg-host");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = Server::start(&fixture.transport, "Test", stub_table(Arc::clone(&seen)));

    let hosts = HostRouter::new();
    hosts.add_connection("Test", Arc::new(Connector::new(Arc::clone(&fixture.transport))));
    let via_router = ServiceInterface::new(Arc::clone(&hosts) as SharedChannel, "Test");
    let nowhere = ServiceInterface::new(Arc::clone(&hosts) as SharedChannel, "Nowhere");

    let ok = via_router
        .call(Message::request("Test/route"), WAIT)
        .expect("routed response");
    assert_eq!(ok.result, Some(json!("OK")));
    assert_eq!(seen.lock().expect("lock").len(), 1);

    let broken = nowhere
        .call(Message::request("Nowhere/route"), WAIT)
        .expect("synthesized response");
    assert!(broken.is_error(ErrorCode::ConnectionBroken));
    server.stop();
}

#[test]
fn retried_write_delivers_request_once() {
    let fixture = Fixture::new("msg-retry");
    let transport = Arc::clone(&fixture.transport);
    let listener = transport.bind("Svc").expect("bind");
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let server = std::thread::spawn(move || {
        let config = HandshakeConfig::default();
        let stream = listener.accept_timeout(WAIT).expect("first accept");
        let RendezvousStreams {
            reader,
            writer: first_writer,
            ..
        } = rendezvous_server(&*transport, stream, &config).expect("first rendezvous");
        // Stop reading from the client but keep the reverse stream open, so
        // only the client's next write notices.
        drop(reader);
        ready_tx.send(()).expect("ready");

        let stream = listener.accept_timeout(WAIT).expect("second accept");
        let mut second =
            rendezvous_server(&*transport, stream, &config).expect("second rendezvous");
        let text = second
            .reader
            .read_text()
            .expect("read")
            .expect("request frame");
        let Envelope::Message { message, .. } = Envelope::unpack(&text).expect("envelope") else {
            panic!("expected a message envelope, got {text}");
        };
        second
            .writer
            .write_text(&pack(&Message::response(&message, "OK"), "Svc"))
            .expect("reply");
        let _ = done_rx.recv_timeout(WAIT);
        drop(first_writer);
        message
    });

    let client = fixture.client("Svc");
    ready_rx.recv_timeout(WAIT).expect("server stopped reading");

    let (tx, rx) = mpsc::channel();
    client
        .request(
            Message::request_with_id("Svc/do", 77),
            Handler::new(move |m| {
                let _ = tx.send(m);
            }),
        )
        .expect("request");

    let response = rx.recv_timeout(WAIT).expect("response");
    assert_eq!(response.id, 77);
    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    assert_eq!(response.result, Some(json!("OK")));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(client.pending_requests(), 0);

    let _ = done_tx.send(());
    let delivered = server.join().expect("server thread");
    assert_eq!(delivered.id, 77);
    assert_eq!(delivered.method, "Svc/do");
}

#[test]
fn subscribe_while_disconnected_is_counted_once() {
    let fixture = Fixture::new("msg-resub-once");
    let source = EventSource::new();
    let table = RouteTable::builder().event("Test/data", &source).build();
    let server = Server::start(&fixture.transport, "Test", Arc::clone(&table) as Arc<dyn Service>);

    let channel: Arc<DuplexChannel> = Connector::new(Arc::clone(&fixture.transport))
        .connect("Test")
        .expect("client should connect");
    let client = ServiceInterface::new(Arc::clone(&channel) as SharedChannel, "Test");
    assert!(wait_until(WAIT, || server.listener.connection_count() == 1));

    server.stop();
    assert!(wait_until(WAIT, || !channel.is_connected()));
    let server = Server::start(&fixture.transport, "Test", table);

    let (tx, rx) = mpsc::channel();
    let handler = Handler::new(move |m: Message| {
        let _ = tx.send(m);
    });
    client.subscribe("Test/data", &handler).expect("subscribe");
    assert!(channel.is_connected());
    assert!(wait_until(WAIT, || source.subscriber_count() == 1));

    source.publish(json!(1));
    let notification = rx.recv_timeout(WAIT).expect("notification");
    assert_eq!(notification.params, Some(json!(1)));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    client.unsubscribe("Test/data", &handler).expect("unsubscribe");
    assert!(wait_until(WAIT, || source.subscriber_count() == 0));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(source.subscriber_count(), 0);
    source.publish(json!(2));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    server.stop();
}
