//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Host/client handshake.
//!
//! The embedded client opens, announces itself with a `ready` event and
//! connects. The host opens and connects only once that `ready` arrives, so
//! nothing it queued is posted before the client is listening.
use std::ops::Deref;
use std::sync::Arc;

use frau_common::{extract_origin, ClientConfig, HostConfig};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{Envelope, MessageClass};
use crate::port::{EventChannel, Port, PortBuilder};
use crate::{PortError, Result};

/// Event the client sends once it is listening.
pub const READY_EVENT: &str = "ready";

type Connecting = BoxFuture<'static, Result<Port>>;

/// Embedding side of a channel, addressed at the origin of the embedded
/// content.
#[derive(Debug, Clone)]
pub struct Host {
    port: Port,
}

impl Host {
    /// Build a host port whose target origin is taken from `src`.
    ///
    /// Fails when `src` has no http(s) origin; protocol-relative sources
    /// use the configured default scheme.
    pub fn new(builder: PortBuilder, src: &str, config: &HostConfig) -> Result<Self> {
        let origin = extract_origin(src, &config.default_scheme)
            .ok_or_else(|| PortError::InvalidSource(src.to_owned()))?;
        Ok(Self {
            port: builder.target_origin(origin).build(),
        })
    }

    /// Underlying port.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Open now; resolve once the client's `ready` has been seen and the
    /// port has connected. Repeated `ready` events are ignored.
    pub fn connect(&self) -> Connecting {
        if let Err(err) = self.port.open() {
            return future::ready(Err(err)).boxed();
        }

        let (ready_tx, ready_rx) = oneshot::channel::<Connecting>();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
        let port = self.port.downgrade();
        self.port.on_event(READY_EVENT, move |_| {
            let Some(ready_tx) = ready_tx.lock().take() else {
                return;
            };
            if let Some(port) = port.upgrade() {
                let _ = ready_tx.send(port.connect());
            }
        });
        async move {
            let connecting = ready_rx.await.map_err(|_| PortError::HandshakeAborted)?;
            connecting.await
        }
        .boxed()
    }
}

impl Deref for Host {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

/// Embedded side of a channel.
#[derive(Debug, Clone)]
pub struct Client {
    port: Port,
}

impl Client {
    /// Build a client port targeting the configured origin (`*` by default).
    pub fn new(builder: PortBuilder, config: &ClientConfig) -> Self {
        Self {
            port: builder.target_origin(config.target_origin.clone()).build(),
        }
    }

    /// Underlying port.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Open, announce `ready` ahead of anything queued, then connect.
    pub fn connect(&self) -> Connecting {
        if let Err(err) = self.announce() {
            return future::ready(Err(err)).boxed();
        }
        self.port.connect()
    }

    fn announce(&self) -> Result<()> {
        self.port.open()?;
        let ready = Envelope::new(MessageClass::Event, READY_EVENT, Value::Array(Vec::new()));
        self.port.post(&ready)?;
        Ok(())
    }
}

impl Deref for Client {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settle, RecordingEndpoint};
    use serde_json::json;

    #[test]
    fn host_requires_an_http_origin() {
        let config = HostConfig::default();
        let err = Host::new(Port::builder(RecordingEndpoint::new()), "ftp://files.test/x", &config)
            .expect_err("ftp rejected");
        assert_eq!(err.to_string(), "Unable to extract origin from \"ftp://files.test/x\"");

        let host = Host::new(
            Port::builder(RecordingEndpoint::new()),
            "//child.test/app/index.html",
            &config,
        )
        .expect("protocol relative");
        assert_eq!(host.target_origin(), "https://child.test");
    }

    #[tokio::test]
    async fn client_announces_ready_before_queued_traffic() {
        let endpoint = RecordingEndpoint::new();
        let client = Client::new(Port::builder(endpoint.clone()), &ClientConfig::default());
        client.send_event("early", vec![json!(1)]).expect("queued");

        client.connect().await.expect("connect");
        let keys: Vec<Value> = endpoint.sent().into_iter().map(|(v, _)| v["key"].clone()).collect();
        assert_eq!(keys, vec![json!("frau.evt.ready"), json!("frau.evt.early")]);
        assert_eq!(endpoint.sent()[0].1, "*");
    }

    #[tokio::test]
    async fn host_connects_on_first_ready_only() {
        let endpoint = RecordingEndpoint::new();
        let host = Host::new(
            Port::builder(endpoint.clone()),
            "https://child.test/index.html",
            &HostConfig::default(),
        )
        .expect("host");
        host.send_event("hello", vec![]).expect("queued");

        let connecting = tokio::spawn(host.connect());
        settle().await;
        assert!(host.is_open());
        assert!(!host.is_connected());
        assert!(endpoint.sent().is_empty());

        endpoint.inject(json!({ "key": "frau.evt.ready" }));
        endpoint.inject(json!({ "key": "frau.evt.ready" }));
        connecting.await.expect("join").expect("connected");

        assert!(host.is_connected());
        assert_eq!(endpoint.sent().len(), 1);
    }

    #[tokio::test]
    async fn second_connect_fails_without_arming_another_ready_handler() {
        let endpoint = RecordingEndpoint::new();
        let host = Host::new(
            Port::builder(endpoint.clone()),
            "https://child.test/index.html",
            &HostConfig::default(),
        )
        .expect("host");
        let connecting = tokio::spawn(host.connect());
        settle().await;

        let err = host.connect().await.expect_err("already open");
        assert!(matches!(err, PortError::AlreadyOpen));

        endpoint.inject(json!({ "key": "frau.evt.ready" }));
        connecting.await.expect("join").expect("connected");
        // A repeated ready must not reach a second connect attempt.
        endpoint.inject(json!({ "key": "frau.evt.ready" }));
        settle().await;
        assert!(host.is_connected());
        assert_eq!(host.event_handlers(READY_EVENT), 1);
    }
}
