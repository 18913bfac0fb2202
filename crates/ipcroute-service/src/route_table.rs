use std::collections::HashMap;
use std::sync::Arc;

use ipcroute_wire::{ErrorCode, Message};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, ServiceError};
use crate::registry::ListenerRegistry;
use crate::service::{Handler, Service};

type MethodFn = Arc<dyn Fn(&Message) -> Result<Value> + Send + Sync>;
type Getter = Arc<dyn Fn() -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// Publisher behind a subscribable route.
///
/// The service author keeps a clone and calls [`publish`](Self::publish);
/// the route table attaches and detaches subscribers.
#[derive(Clone, Default)]
pub struct EventSource {
    sinks: Arc<ListenerRegistry<String>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a notification to every subscriber, named after the route it
    /// subscribed to. `Value::Null` sends no params. Returns the number of
    /// subscribers notified.
    pub fn publish(&self, params: impl Into<Value>) -> usize {
        let params = params.into();
        let sinks = self.sinks.matching(|_| true);
        for (route, sink) in &sinks {
            sink.call(Message::notification(route.as_str()).with_params(params.clone()));
        }
        sinks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.matching(|_| true).len()
    }

    fn attach(&self, route: &str, sink: &Handler) {
        self.sinks.add(route.to_string(), sink);
    }

    fn detach(&self, route: &str, sink: &Handler) {
        self.sinks.remove(&route.to_string(), sink);
    }
}

struct Property {
    get: Getter,
    set: Option<Setter>,
}

struct Event {
    source: EventSource,
    snapshot: Option<Getter>,
}

/// A service assembled from explicitly registered routes.
///
/// - methods match their route exactly;
/// - a property `p` answers `p/get` and `p/set`: a get, or a set without
///   params, returns the value; a set with params stores them and returns
///   `"OK"`. A bare `p` request is not a property access;
/// - events deliver notifications to subscribers of their route.
///
/// Unknown requests are answered with `MethodNotFound`.
pub struct RouteTable {
    methods: HashMap<String, MethodFn>,
    properties: HashMap<String, Property>,
    events: HashMap<String, Event>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Every route this table answers, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.methods.keys().cloned().collect();
        for (name, property) in &self.properties {
            routes.push(format!("{name}/get"));
            if property.set.is_some() {
                routes.push(format!("{name}/set"));
            }
        }
        routes.extend(self.events.keys().cloned());
        routes.sort();
        routes.dedup();
        routes
    }

    fn property_for(&self, method: &str) -> Option<(&Property, bool)> {
        let (name, is_get) = match method.rsplit_once('/') {
            Some((name, "get")) => (name, true),
            Some((name, "set")) => (name, false),
            _ => return None,
        };
        self.properties.get(name).map(|p| (p, is_get))
    }

    fn handle_property(
        &self,
        property: &Property,
        is_get: bool,
        message: &Message,
    ) -> Result<Message> {
        let params = match &message.params {
            Some(params) if !is_get => params.clone(),
            _ => return Ok(Message::response(message, (property.get)())),
        };
        let set = property.set.as_ref().ok_or_else(|| {
            ServiceError::handler(format!("property '{}' is read-only", message.method))
        })?;
        set(params)?;
        Ok(Message::response(message, "OK"))
    }
}

impl Service for RouteTable {
    fn request(&self, message: Message, reply: Handler) -> Result<()> {
        let response = if let Some(method) = self.methods.get(&message.method) {
            Message::response(&message, method(&message)?)
        } else if let Some((property, is_get)) = self.property_for(&message.method) {
            self.handle_property(property, is_get, &message)?
        } else {
            Message::failed_response(Some(&message), ErrorCode::MethodNotFound)
        };
        reply.call(response);
        Ok(())
    }

    fn subscribe(&self, command: &str, handler: &Handler) -> Result<()> {
        let Some(event) = self.events.get(command) else {
            debug!(command, "no event for subscription");
            return Ok(());
        };
        event.source.attach(command, handler);
        if let Some(snapshot) = &event.snapshot {
            handler.call(Message::notification(command).with_params(snapshot()));
        }
        Ok(())
    }

    fn unsubscribe(&self, command: &str, handler: &Handler) -> Result<()> {
        if let Some(event) = self.events.get(command) {
            event.source.detach(command, handler);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RouteTableBuilder {
    methods: HashMap<String, MethodFn>,
    properties: HashMap<String, Property>,
    events: HashMap<String, Event>,
}

impl RouteTableBuilder {
    /// A method whose return value becomes the response result.
    pub fn method(
        mut self,
        route: impl Into<String>,
        handler: impl Fn(&Message) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(route.into(), Arc::new(handler));
        self
    }

    /// A method without a result; it responds with `"OK"`.
    pub fn action(
        self,
        route: impl Into<String>,
        handler: impl Fn(&Message) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.method(route, move |message| {
            handler(message)?;
            Ok(Value::from("OK"))
        })
    }

    pub fn property(
        mut self,
        route: impl Into<String>,
        get: impl Fn() -> Value + Send + Sync + 'static,
        set: impl Fn(Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.properties.insert(
            route.into(),
            Property {
                get: Arc::new(get),
                set: Some(Arc::new(set)),
            },
        );
        self
    }

    pub fn read_only(
        mut self,
        route: impl Into<String>,
        get: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.properties.insert(
            route.into(),
            Property {
                get: Arc::new(get),
                set: None,
            },
        );
        self
    }

    pub fn event(mut self, route: impl Into<String>, source: &EventSource) -> Self {
        self.events.insert(
            route.into(),
            Event {
                source: source.clone(),
                snapshot: None,
            },
        );
        self
    }

    /// An event that sends `snapshot()` to every new subscriber right away.
    pub fn event_with_snapshot(
        mut self,
        route: impl Into<String>,
        source: &EventSource,
        snapshot: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.events.insert(
            route.into(),
            Event {
                source: source.clone(),
                snapshot: Some(Arc::new(snapshot)),
            },
        );
        self
    }

    pub fn build(self) -> Arc<RouteTable> {
        Arc::new(RouteTable {
            methods: self.methods,
            properties: self.properties,
            events: self.events,
        })
    }
}
