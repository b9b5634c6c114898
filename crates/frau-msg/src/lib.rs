//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Bidirectional messaging between two separately scripted contexts over an
//! untyped, string-keyed message channel.
//!
//! The stack is layered by capability:
//!
//! * [`EventChannel`] - named fire-and-forget broadcast, queued until connect.
//! * [`RequestChannel`] - correlated request/response calls.
//! * [`ServiceChannel`] - versioned multi-method service proxies built purely
//!   on top of [`RequestChannel`].
//!
//! All three are implemented over one shared protocol state owned by a
//! [`Port`], which also drives the `closed -> open -> connected` lifecycle.
#![warn(missing_docs)]

pub mod envelope;
pub mod handler;
pub mod handshake;
pub mod id;
pub mod logging;
pub mod port;
pub mod requests;
pub mod services;
pub mod transform_error;
pub mod transport;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_support;

/// Shared result type for port operations.
pub type Result<T> = std::result::Result<T, PortError>;

/// Programmer-misuse and plumbing errors raised synchronously at the call site.
///
/// Failures attributable to a specific in-flight request never surface here;
/// they reject that request's [`ResponseFuture`] with a [`RequestError`].
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// `open()` on a port whose inbound subscription is already active.
    #[error("Port is already open.")]
    AlreadyOpen,
    /// `close()` on a port that was never opened or is already closed.
    #[error("Port cannot be closed, call open() first")]
    NotOpen,
    /// A second `on_request` registration for the same request type.
    #[error("Duplicate onRequest handler for type \"{0}\"")]
    DuplicateRequestHandler(String),
    /// `on_request` after the port has connected.
    #[error("Add request handlers before connecting")]
    HandlersAfterConnect,
    /// `register_service` after the port has connected.
    #[error("Register services before connecting")]
    ServicesAfterConnect,
    /// Service type names must match `^[a-zA-Z]+[a-zA-Z-]*$`.
    #[error("Invalid service type \"{0}\"")]
    InvalidServiceType(String),
    /// Operation requires a connected port.
    #[error("Cannot getService() before connect() has completed")]
    NotConnected,
    /// Message class codes are exactly three ASCII letters.
    #[error("message class name must be 3 characters, got {0:?}")]
    InvalidMessageClass(String),
    /// The embeddable source has no http(s) origin to target.
    #[error("Unable to extract origin from \"{0}\"")]
    InvalidSource(String),
    /// The port went away before the remote side signalled readiness.
    #[error("handshake aborted before the remote side was ready")]
    HandshakeAborted,
    /// Failure reported by the transport endpoint.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A plugin startup future failed; only the first failure is reported.
    #[error("plugin startup failed: {0}")]
    PluginStartup(#[source] anyhow::Error),
}

pub use envelope::{Envelope, MessageClass, RequestPayload, ResponseOutcome, ResponsePayload, KEY_PREFIX};
pub use handler::{HandlerResult, RequestHandler};
pub use handshake::{Client, Host, READY_EVENT};
pub use id::PortIdGenerator;
pub use logging::{log_envelope, MessageDirection, PortMetricsExporter};
pub use port::{
    ConnectionState, Delivery, EventChannel, PluginStartup, Port, PortBuilder, WeakPort,
};
pub use requests::{RequestChannel, RequestError, ResponseFuture};
pub use services::{Service, ServiceChannel, ServiceError, ServiceProxy};
pub use transform_error::{
    from_transferable, to_transferable, LocalValue, NativeError, ERROR_OBJECT_SENTINEL,
    REQUEST_TYPE_ERROR,
};
pub use transport::{
    Endpoint, InMemoryEndpoint, InMemoryFrame, InMemoryTransport, InboundMessage,
    MessageListener, SourceId, Subscription, TransportError,
};
pub use validate::validate_event;

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
