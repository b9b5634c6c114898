//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "test"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::transport::{
    Endpoint, InboundMessage, MessageListener, SourceId, Subscription, TransportError,
};

/// Origin stamped on injected messages unless overridden.
pub const REMOTE_ORIGIN: &str = "https://child.test";

/// Give spawned tasks and dispatchers a chance to run to quiescence.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct Recorded {
    sent: Vec<(Value, String)>,
    listener: Option<MessageListener>,
}

/// Endpoint that records outbound posts and lets tests inject inbound data
/// synchronously.
#[derive(Clone)]
pub struct RecordingEndpoint {
    remote: SourceId,
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingEndpoint {
    pub fn new() -> Self {
        Self {
            remote: SourceId::next(),
            inner: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    /// Every `(message, target_origin)` posted so far.
    pub fn sent(&self) -> Vec<(Value, String)> {
        self.inner.lock().sent.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.lock().listener.is_some()
    }

    pub fn inject(&self, data: Value) {
        self.inject_from(REMOTE_ORIGIN, data);
    }

    pub fn inject_from(&self, origin: &str, data: Value) {
        let listener = self.inner.lock().listener.clone();
        if let Some(listener) = listener {
            listener(InboundMessage {
                origin: origin.to_owned(),
                source: self.remote,
                data,
            });
        }
    }
}

impl Endpoint for RecordingEndpoint {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError> {
        self.inner
            .lock()
            .sent
            .push((message, target_origin.to_owned()));
        Ok(())
    }

    fn remote_source(&self) -> SourceId {
        self.remote
    }

    fn subscribe(&self, listener: MessageListener) -> Result<Subscription, TransportError> {
        self.inner.lock().listener = Some(listener);
        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().listener = None;
            }
        }))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
