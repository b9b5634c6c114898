//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Port lifecycle, inbound dispatch and the event layer.
//!
//! A [`Port`] moves `Closed -> Open -> Connected` and back to `Closed` on
//! [`Port::close`]. While not connected, outbound events and requests are
//! held on a connect queue and flushed in issue order by
//! [`Port::connect`].
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use frau_common::{PortConfig, WILDCARD_ORIGIN};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::envelope::{Envelope, MessageClass};
use crate::id::PortIdGenerator;
use crate::logging::{log_envelope, MessageDirection, PortMetricsExporter};
use crate::requests::RequestState;
use crate::transport::{Endpoint, InboundMessage, MessageListener, Subscription, TransportError};
use crate::validate::validate_event;
use crate::{PortError, Result};

type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
type CloseCallback = Box<dyn FnMut() + Send>;

/// Value a plugin hands back from [`Port::use_plugin`].
pub enum PluginStartup {
    /// Nothing to wait for.
    Ready,
    /// Settles before [`Port::connect`] completes.
    Pending(BoxFuture<'static, anyhow::Result<()>>),
}

impl PluginStartup {
    /// Plugin that needs no startup work.
    pub fn ready() -> Self {
        PluginStartup::Ready
    }

    /// Plugin whose startup completes with `future`.
    pub fn pending<F>(future: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        PluginStartup::Pending(future.boxed())
    }
}

/// Whether an outbound message left immediately or waits for `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Posted to the endpoint.
    Sent,
    /// Held on the connect queue.
    Queued,
}

/// Lifecycle state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No inbound subscription.
    Closed,
    /// Subscribed, outbound traffic still queued.
    Open,
    /// Outbound traffic flows immediately.
    Connected,
}

/// Named fire-and-forget broadcast.
pub trait EventChannel {
    /// Subscribe `handler` to `name`. Handlers run in registration order
    /// with the event's positional arguments.
    fn on_event<F>(&self, name: &str, handler: F) -> &Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static;

    /// Broadcast `name` with `args`, or queue it until connected.
    fn send_event(&self, name: &str, args: Vec<Value>) -> Result<Delivery>;
}

pub(crate) struct ProtocolState {
    pub(crate) is_open: bool,
    pub(crate) is_connected: bool,
    pub(crate) connect_queue: Vec<Envelope>,
    plugin_startups: Vec<BoxFuture<'static, anyhow::Result<()>>>,
    event_handlers: HashMap<String, Vec<EventHandler>>,
    close_callbacks: Vec<CloseCallback>,
    subscription: Option<Subscription>,
    pub(crate) runtime: Option<Handle>,
    pub(crate) requests: RequestState,
}

impl ProtocolState {
    fn new() -> Self {
        Self {
            is_open: false,
            is_connected: false,
            connect_queue: Vec::new(),
            plugin_startups: Vec::new(),
            event_handlers: HashMap::new(),
            close_callbacks: Vec::new(),
            subscription: None,
            runtime: None,
            requests: RequestState::default(),
        }
    }
}

pub(crate) struct PortShared {
    pub(crate) id: String,
    target_origin: String,
    endpoint: Arc<dyn Endpoint>,
    pub(crate) config: PortConfig,
    pub(crate) metrics: Option<PortMetricsExporter>,
    pub(crate) state: Mutex<ProtocolState>,
}

/// Builder for [`Port`].
pub struct PortBuilder {
    endpoint: Arc<dyn Endpoint>,
    target_origin: String,
    config: PortConfig,
    metrics: Option<PortMetricsExporter>,
    ids: Option<Arc<PortIdGenerator>>,
}

impl PortBuilder {
    /// Origin outbound messages are addressed to and inbound messages must
    /// come from. Defaults to `*`.
    pub fn target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = origin.into();
        self
    }

    /// Apply a loaded port configuration.
    pub fn config(mut self, config: PortConfig) -> Self {
        self.config = config;
        self
    }

    /// Toggle verbose protocol traces.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Record envelope traffic into `metrics`.
    pub fn metrics(mut self, metrics: PortMetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Draw the port id from `ids` instead of the process-wide generator.
    pub fn id_generator(mut self, ids: Arc<PortIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Build a closed port.
    pub fn build(self) -> Port {
        let ids = self.ids.unwrap_or_else(PortIdGenerator::global);
        Port {
            shared: Arc::new(PortShared {
                id: ids.next_id(),
                target_origin: self.target_origin,
                endpoint: self.endpoint,
                config: self.config,
                metrics: self.metrics,
                state: Mutex::new(ProtocolState::new()),
            }),
        }
    }
}

/// One side of a cross-context channel.
///
/// Cloning yields another handle to the same port.
#[derive(Clone)]
pub struct Port {
    pub(crate) shared: Arc<PortShared>,
}

/// Non-owning handle to a [`Port`].
#[derive(Clone)]
pub struct WeakPort {
    shared: Weak<PortShared>,
}

impl WeakPort {
    /// Recover the port if it still exists.
    pub fn upgrade(&self) -> Option<Port> {
        self.shared.upgrade().map(|shared| Port { shared })
    }
}

impl Port {
    /// Start building a port over `endpoint`.
    pub fn builder(endpoint: impl Endpoint + 'static) -> PortBuilder {
        Self::builder_shared(Arc::new(endpoint))
    }

    /// Start building a port over an already shared endpoint.
    pub fn builder_shared(endpoint: Arc<dyn Endpoint>) -> PortBuilder {
        PortBuilder {
            endpoint,
            target_origin: WILDCARD_ORIGIN.to_owned(),
            config: PortConfig::default(),
            metrics: None,
            ids: None,
        }
    }

    /// Closed port over `endpoint` targeting `target_origin`.
    pub fn new(endpoint: impl Endpoint + 'static, target_origin: impl Into<String>) -> Self {
        Self::builder(endpoint).target_origin(target_origin).build()
    }

    /// Process-unique port id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Origin this port addresses and accepts.
    pub fn target_origin(&self) -> &str {
        &self.shared.target_origin
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        let state = self.shared.state.lock();
        match (state.is_open, state.is_connected) {
            (_, true) => ConnectionState::Connected,
            (true, false) => ConnectionState::Open,
            (false, false) => ConnectionState::Closed,
        }
    }

    /// Whether the inbound subscription is active.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().is_open
    }

    /// Whether outbound traffic is sent immediately.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected
    }

    /// Non-owning handle, for callbacks registered on this port.
    pub fn downgrade(&self) -> WeakPort {
        WeakPort {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn trace(&self, message: &str) {
        if self.shared.config.debug {
            debug!(port = %self.shared.id, "{}", message);
        }
    }

    /// Activate the inbound subscription. Must be called from within a tokio
    /// runtime, which is also where request handlers will run.
    pub fn open(&self) -> Result<&Self> {
        let mut state = self.shared.state.lock();
        if state.is_open {
            return Err(PortError::AlreadyOpen);
        }
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let weak = Arc::downgrade(&self.shared);
        let listener: MessageListener = Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                Port { shared }.receive_message(message);
            }
        });
        state.subscription = Some(self.shared.endpoint.subscribe(listener)?);
        state.runtime = Some(runtime);
        state.is_open = true;
        drop(state);

        self.trace("opened");
        Ok(self)
    }

    /// Tear down the inbound subscription and run close callbacks.
    ///
    /// Pending requests are left untouched and will never resolve.
    pub fn close(&self) -> Result<()> {
        let (subscription, mut callbacks) = {
            let mut state = self.shared.state.lock();
            if !state.is_open {
                return Err(PortError::NotOpen);
            }
            state.is_open = false;
            state.is_connected = false;
            (
                state.subscription.take(),
                std::mem::take(&mut state.close_callbacks),
            )
        };
        drop(subscription);

        for callback in callbacks.iter_mut() {
            callback();
        }

        {
            let mut state = self.shared.state.lock();
            callbacks.append(&mut state.close_callbacks);
            state.close_callbacks = callbacks;
        }
        self.trace("closed");
        Ok(())
    }

    /// Run `callback` every time this port closes.
    pub fn on_close(&self, callback: impl FnMut() + Send + 'static) -> &Self {
        self.shared
            .state
            .lock()
            .close_callbacks
            .push(Box::new(callback));
        self
    }

    /// Mark the port connected and flush the connect queue in order.
    ///
    /// The flush happens before this returns; the returned future resolves
    /// once every plugin startup has succeeded, or with the first failure.
    pub fn connect(&self) -> BoxFuture<'static, Result<Port>> {
        let startups = {
            let mut state = self.shared.state.lock();
            state.is_connected = true;
            let queue = std::mem::take(&mut state.connect_queue);
            for envelope in queue {
                let id = envelope.payload.get("id").and_then(Value::as_str).map(str::to_owned);
                if let Err(err) = self.post(&envelope) {
                    warn!(port = %self.shared.id, key = %envelope.key(), error = %err, "queued envelope could not be sent");
                    if let (MessageClass::Request, Some(id)) = (envelope.class, id) {
                        state.requests.fail_pending(&envelope.subtype, &id, err);
                    }
                }
            }
            std::mem::take(&mut state.plugin_startups)
        };
        self.trace("connected");

        let port = self.clone();
        async move {
            future::try_join_all(startups)
                .await
                .map_err(PortError::PluginStartup)?;
            Ok(port)
        }
        .boxed()
    }

    /// Run `plugin` against this port now; its startup is awaited by
    /// [`Port::connect`].
    pub fn use_plugin<F>(&self, plugin: F) -> &Self
    where
        F: FnOnce(&Port) -> PluginStartup,
    {
        let startup = plugin(self);
        let mut state = self.shared.state.lock();
        if state.is_connected {
            warn!(port = %self.shared.id, "plugin registered after connect, its startup is not awaited");
        }
        if let PluginStartup::Pending(future) = startup {
            state.plugin_startups.push(future);
        }
        self
    }

    /// Send now if connected, otherwise queue. Caller holds the state lock.
    pub(crate) fn send_or_queue_locked(
        &self,
        state: &mut ProtocolState,
        envelope: Envelope,
    ) -> std::result::Result<Delivery, TransportError> {
        if !state.is_connected {
            state.connect_queue.push(envelope);
            return Ok(Delivery::Queued);
        }
        self.post(&envelope)?;
        Ok(Delivery::Sent)
    }

    /// Encode and post one envelope, bypassing the connect queue.
    pub(crate) fn post(&self, envelope: &Envelope) -> std::result::Result<(), TransportError> {
        let key = envelope.key();
        if self.shared.config.debug {
            log_envelope(&self.shared.id, MessageDirection::Outbound, &key);
        }
        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_sent(envelope.class);
        }
        self.shared
            .endpoint
            .post_message(envelope.to_value(), &self.shared.target_origin)
    }

    fn receive_message(&self, message: InboundMessage) {
        let accepted = {
            let state = self.shared.state.lock();
            state.is_open
                && validate_event(
                    &self.shared.target_origin,
                    self.shared.endpoint.remote_source(),
                    &message,
                )
        };
        let envelope = match accepted.then(|| Envelope::decode(&message.data)).flatten() {
            Some(envelope) => envelope,
            None => {
                if self.shared.config.debug {
                    let key = message.data.get("key").and_then(Value::as_str).unwrap_or("");
                    log_envelope(&self.shared.id, MessageDirection::Dropped, key);
                }
                if let Some(metrics) = &self.shared.metrics {
                    metrics.observe_dropped();
                }
                return;
            }
        };

        if self.shared.config.debug {
            log_envelope(&self.shared.id, MessageDirection::Inbound, &envelope.key());
        }
        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_received(envelope.class);
        }

        match envelope.class {
            MessageClass::Event => self.receive_event(&envelope.subtype, envelope.payload),
            MessageClass::Request => self.receive_request(&envelope.subtype, envelope.payload),
            MessageClass::Response => self.receive_response(&envelope.subtype, envelope.payload),
        }
    }

    /// Number of handlers subscribed to event `name`.
    pub fn event_handlers(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .event_handlers
            .get(name)
            .map_or(0, Vec::len)
    }

    fn receive_event(&self, name: &str, payload: Value) {
        let args = match payload {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => {
                self.trace(&format!("event \"{name}\" dropped, payload is not an argument list: {other}"));
                return;
            }
        };
        let handlers: Vec<EventHandler> = match self.shared.state.lock().event_handlers.get(name) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            handler(&args);
        }
    }
}

impl EventChannel for Port {
    fn on_event<F>(&self, name: &str, handler: F) -> &Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.trace(&format!("onEvent handler added for \"{name}\""));
        let mut state = self.shared.state.lock();
        if state.is_connected {
            warn!(port = %self.shared.id, event = name, "event handler attached after connecting, earlier events may have been missed");
        }
        state
            .event_handlers
            .entry(name.to_owned())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    fn send_event(&self, name: &str, args: Vec<Value>) -> Result<Delivery> {
        let envelope = Envelope::new(MessageClass::Event, name, Value::Array(args));
        let mut state = self.shared.state.lock();
        Ok(self.send_or_queue_locked(&mut state, envelope)?)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.shared.id)
            .field("target_origin", &self.shared.target_origin)
            .field("endpoint", &self.shared.endpoint.name())
            .field("state", &self.state())
            .finish()
    }
}
