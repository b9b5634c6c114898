//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::panic_message;

/// Failures reported by a transport endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Subscribing needs a tokio runtime to deliver inbound messages on.
    #[error("no async runtime available to deliver messages")]
    NoRuntime,
    /// The receiving side no longer exists.
    #[error("{0} endpoint closed")]
    Closed(&'static str),
    /// Wrapper for JSON serialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque identity of a messaging context, compared by equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a process-unique identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Inbound message as observed by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Origin of the sending context; may be empty.
    pub origin: String,
    /// Identity of the sending context.
    pub source: SourceId,
    /// Untrusted message data.
    pub data: Value,
}

/// Callback receiving inbound messages.
pub type MessageListener = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Active inbound subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap the action that tears the subscription down.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Bidirectional channel to one remote context.
///
/// Neither `post_message` nor `subscribe` may call a listener synchronously:
/// ports invoke both while holding their protocol lock.
pub trait Endpoint: Send + Sync {
    /// Send a structurally cloneable value to the remote context. Delivery
    /// is skipped when the remote origin does not match `target_origin`.
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError>;
    /// Identity stamped on messages arriving from the remote context.
    fn remote_source(&self) -> SourceId;
    /// Subscribe to every message arriving in the local context.
    fn subscribe(&self, listener: MessageListener) -> Result<Subscription, TransportError>;
    /// Human-readable endpoint name for logging/metrics.
    fn name(&self) -> &'static str;
}

type ListenerTable = Arc<Mutex<Vec<(u64, MessageListener)>>>;

struct FrameInner {
    id: SourceId,
    origin: String,
    listeners: ListenerTable,
    next_listener: AtomicU64,
    inbox_tx: mpsc::UnboundedSender<InboundMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

/// In-process messaging context with an origin and a set of subscribers.
///
/// Inbound messages are fanned out to all current subscribers from a
/// dispatch task started by the first subscription. Messages posted before
/// that are held until then; messages arriving while nobody is subscribed
/// afterwards are discarded.
#[derive(Clone)]
pub struct InMemoryFrame {
    inner: Arc<FrameInner>,
}

impl InMemoryFrame {
    /// Create a frame for the given origin.
    pub fn new(origin: impl Into<String>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(FrameInner {
                id: SourceId::next(),
                origin: origin.into(),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_listener: AtomicU64::new(1),
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
            }),
        }
    }

    /// Identity of this frame as seen by receivers.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Origin of this frame.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Endpoint posting from this frame into `remote`.
    pub fn endpoint_to(&self, remote: &InMemoryFrame) -> InMemoryEndpoint {
        InMemoryEndpoint {
            local: self.clone(),
            remote: remote.clone(),
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Subscribe to every message arriving in this frame.
    pub fn subscribe(&self, listener: MessageListener) -> Result<Subscription, TransportError> {
        self.ensure_dispatcher()?;
        let token = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((token, listener));

        let listeners: Weak<Mutex<Vec<(u64, MessageListener)>>> =
            Arc::downgrade(&self.inner.listeners);
        Ok(Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|(id, _)| *id != token);
            }
        }))
    }

    fn deliver(&self, message: InboundMessage) -> Result<(), TransportError> {
        self.inner
            .inbox_tx
            .send(message)
            .map_err(|_| TransportError::Closed("in_memory"))
    }

    fn ensure_dispatcher(&self) -> Result<(), TransportError> {
        let mut slot = self.inner.inbox_rx.lock();
        let Some(inbox) = slot.take() else {
            return Ok(());
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                *slot = Some(inbox);
                return Err(TransportError::NoRuntime);
            }
        };
        runtime.spawn(dispatch(inbox, Arc::clone(&self.inner.listeners)));
        Ok(())
    }
}

impl fmt::Debug for InMemoryFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFrame")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

async fn dispatch(mut inbox: mpsc::UnboundedReceiver<InboundMessage>, listeners: ListenerTable) {
    while let Some(message) = inbox.recv().await {
        let current: Vec<MessageListener> = listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if current.is_empty() {
            trace!(source = %message.source, "no subscribers, message discarded");
            continue;
        }
        for listener in current {
            let delivery = message.clone();
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener(delivery))) {
                warn!(
                    source = %message.source,
                    panic = %panic_message(panic.as_ref()),
                    "message listener panicked"
                );
            }
        }
    }
}

/// Endpoint between two [`InMemoryFrame`]s.
#[derive(Clone, Debug)]
pub struct InMemoryEndpoint {
    local: InMemoryFrame,
    remote: InMemoryFrame,
}

impl InMemoryEndpoint {
    /// Frame this endpoint posts from and subscribes on.
    pub fn local(&self) -> &InMemoryFrame {
        &self.local
    }

    /// Frame this endpoint posts into.
    pub fn remote(&self) -> &InMemoryFrame {
        &self.remote
    }

    /// Post arbitrary data, bypassing envelope encoding.
    pub fn post_raw(&self, data: Value, target_origin: &str) -> Result<(), TransportError> {
        if !origin_matches(target_origin, self.remote.origin()) {
            trace!(
                target_origin,
                remote_origin = self.remote.origin(),
                "target origin mismatch, message not delivered"
            );
            return Ok(());
        }
        self.remote.deliver(InboundMessage {
            origin: self.local.origin().to_owned(),
            source: self.local.id(),
            data,
        })
    }
}

impl Endpoint for InMemoryEndpoint {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError> {
        self.post_raw(message, target_origin)
    }

    fn remote_source(&self) -> SourceId {
        self.remote.id()
    }

    fn subscribe(&self, listener: MessageListener) -> Result<Subscription, TransportError> {
        self.local.subscribe(listener)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

fn origin_matches(target_origin: &str, origin: &str) -> bool {
    target_origin == frau_common::WILDCARD_ORIGIN || target_origin.eq_ignore_ascii_case(origin)
}

/// Builder for linked in-memory frame pairs.
pub struct InMemoryTransport;

impl InMemoryTransport {
    /// Two linked frames; returns `(host -> child, child -> host)` endpoints.
    pub fn pair(
        host_origin: impl Into<String>,
        child_origin: impl Into<String>,
    ) -> (InMemoryEndpoint, InMemoryEndpoint) {
        let host = InMemoryFrame::new(host_origin);
        let child = InMemoryFrame::new(child_origin);
        (host.endpoint_to(&child), child.endpoint_to(&host))
    }
}
