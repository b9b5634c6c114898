//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Correlated request/response calls over `req` and `res` envelopes.
//!
//! The reply to a request of type `T` travels back under the same type `T`;
//! only the payload `id` tells concurrent calls apart.
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

use crate::envelope::{Envelope, MessageClass, RequestPayload, ResponseOutcome, ResponsePayload};
use crate::handler::RequestHandler;
use crate::port::{Port, ProtocolState};
use crate::transform_error::{from_transferable, to_transferable, LocalValue, NativeError};
use crate::transport::TransportError;
use crate::{panic_message, PortError, Result};

type Reply = std::result::Result<Value, RequestError>;

/// Why a request future rejected.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The remote handler failed with an error, or no handler existed.
    #[error("{0}")]
    Remote(NativeError),
    /// The remote handler failed with something other than an error.
    #[error("request rejected with {0:?}")]
    Value(LocalValue),
    /// The request could not be handed to the endpoint.
    #[error("request could not be sent: {0}")]
    Send(#[source] TransportError),
    /// The port went away before a response arrived.
    #[error("request abandoned before a response arrived")]
    Abandoned,
}

impl RequestError {
    /// The remote error, when the failure carried one.
    pub fn remote(&self) -> Option<&NativeError> {
        match self {
            RequestError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the remote side had no handler for the request type.
    pub fn is_no_handler(&self) -> bool {
        self.remote().is_some_and(NativeError::is_no_handler)
    }

    fn from_transferred(err: &Value) -> Self {
        match from_transferable(err) {
            LocalValue::Error(err) => RequestError::Remote(*err),
            other => RequestError::Value(other),
        }
    }
}

/// Eventual reply to one [`RequestChannel::request`] call.
#[must_use = "the response is only observable by awaiting it"]
pub struct ResponseFuture {
    inner: ResponseInner,
}

enum ResponseInner {
    Waiting(oneshot::Receiver<Reply>),
    Failed(Option<RequestError>),
}

impl ResponseFuture {
    fn waiting(receiver: oneshot::Receiver<Reply>) -> Self {
        Self {
            inner: ResponseInner::Waiting(receiver),
        }
    }

    fn failed(err: RequestError) -> Self {
        Self {
            inner: ResponseInner::Failed(Some(err)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ResponseInner::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|reply| reply.unwrap_or(Err(RequestError::Abandoned))),
            ResponseInner::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(RequestError::Abandoned)))
            }
        }
    }
}

struct PendingRequest {
    id: String,
    reply: oneshot::Sender<Reply>,
    issued_at: Instant,
}

struct WaitingRequest {
    id: String,
    args: Vec<Value>,
}

/// Request bookkeeping held inside the port's protocol state.
#[derive(Default)]
pub(crate) struct RequestState {
    counter: u64,
    pending: HashMap<String, Vec<PendingRequest>>,
    waiting: HashMap<String, Vec<WaitingRequest>>,
    handlers: HashMap<String, RequestHandler>,
}

impl RequestState {
    /// Reject a pending request whose queued envelope failed to send.
    pub(crate) fn fail_pending(&mut self, request_type: &str, id: &str, err: TransportError) {
        if let Some(pending) = self.take_pending(request_type, id) {
            let _ = pending.reply.send(Err(RequestError::Send(err)));
        }
    }

    fn take_pending(&mut self, request_type: &str, id: &str) -> Option<PendingRequest> {
        let requests = self.pending.get_mut(request_type)?;
        let index = requests.iter().position(|request| request.id == id)?;
        let pending = requests.remove(index);
        if requests.is_empty() {
            self.pending.remove(request_type);
        }
        Some(pending)
    }

    fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

/// Correlated request/response calls.
pub trait RequestChannel {
    /// Whether outbound requests are sent immediately.
    fn is_connected(&self) -> bool;

    /// Register the single handler for `request_type`. Only legal before
    /// connecting. Requests of that type that arrived earlier are served
    /// immediately.
    fn on_request(&self, request_type: &str, handler: impl Into<RequestHandler>) -> Result<&Self>;

    /// Call `request_type` on the remote side. Queued until connected.
    fn request(&self, request_type: &str, args: Vec<Value>) -> ResponseFuture;
}

impl RequestChannel for Port {
    fn is_connected(&self) -> bool {
        Port::is_connected(self)
    }

    fn on_request(&self, request_type: &str, handler: impl Into<RequestHandler>) -> Result<&Self> {
        let mut state = self.shared.state.lock();
        if state.is_connected {
            return Err(PortError::HandlersAfterConnect);
        }
        if state.requests.handlers.contains_key(request_type) {
            return Err(PortError::DuplicateRequestHandler(request_type.to_owned()));
        }
        state
            .requests
            .handlers
            .insert(request_type.to_owned(), handler.into());
        self.trace(&format!("onRequest handler added for \"{request_type}\""));

        self.drain_waiting(&mut state, request_type);
        Ok(self)
    }

    fn request(&self, request_type: &str, args: Vec<Value>) -> ResponseFuture {
        let (reply, receiver) = oneshot::channel();
        let mut state = self.shared.state.lock();
        state.requests.counter += 1;
        let id = format!("{}_{}", self.shared.id, state.requests.counter);

        state
            .requests
            .pending
            .entry(request_type.to_owned())
            .or_default()
            .push(PendingRequest {
                id: id.clone(),
                reply,
                issued_at: Instant::now(),
            });

        let payload = RequestPayload { id: id.clone(), args }.to_value();
        let envelope = Envelope::new(MessageClass::Request, request_type, payload);
        match self.send_or_queue_locked(&mut state, envelope) {
            Ok(_) => ResponseFuture::waiting(receiver),
            Err(err) => {
                state.requests.take_pending(request_type, &id);
                ResponseFuture::failed(RequestError::Send(err))
            }
        }
    }
}

impl Port {
    /// Requests issued by this port still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().requests.pending_count()
    }

    pub(crate) fn receive_request(&self, request_type: &str, payload: Value) {
        let Some(RequestPayload { id, args }) = RequestPayload::from_value(payload) else {
            self.trace(&format!("malformed request payload for \"{request_type}\" dropped"));
            return;
        };
        let mut state = self.shared.state.lock();
        state
            .requests
            .waiting
            .entry(request_type.to_owned())
            .or_default()
            .push(WaitingRequest { id, args });
        self.drain_waiting(&mut state, request_type);
    }

    /// Serve every waiting request of `request_type` exactly once, replying
    /// with the no-handler error when nothing is registered.
    fn drain_waiting(&self, state: &mut ProtocolState, request_type: &str) {
        let Some(waiting) = state.requests.waiting.remove(request_type) else {
            return;
        };
        if waiting.is_empty() {
            return;
        }

        let Some(handler) = state.requests.handlers.get(request_type).cloned() else {
            let no_handler = to_transferable(&NativeError::no_handler(request_type).into());
            for request in waiting {
                self.reply(request_type, ResponsePayload::failure(request.id, no_handler.clone()));
            }
            return;
        };

        let Some(runtime) = state.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(port = %self.shared.id, request_type, "no runtime to run request handlers on, requests dropped");
            return;
        };
        for WaitingRequest { id, args } in waiting {
            let port = self.downgrade();
            let handler = handler.clone();
            let request_type = request_type.to_owned();
            runtime.spawn(async move {
                let outcome = AssertUnwindSafe(async move { handler.invoke(args).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        warn!(request_type, %message, "request handler panicked");
                        Err(NativeError::error(message).into())
                    });
                let Some(port) = port.upgrade() else {
                    return;
                };
                let response = match outcome {
                    Ok(value) => ResponsePayload::success(id, value),
                    Err(err) => ResponsePayload::failure(id, to_transferable(&err)),
                };
                port.reply(&request_type, response);
            });
        }
    }

    /// Responses bypass the connect queue.
    fn reply(&self, request_type: &str, response: ResponsePayload) {
        let envelope = Envelope::new(MessageClass::Response, request_type, response.to_value());
        if let Err(err) = self.post(&envelope) {
            warn!(port = %self.shared.id, request_type, error = %err, "response could not be sent");
        }
    }

    pub(crate) fn receive_response(&self, request_type: &str, payload: Value) {
        let Some(response) = ResponsePayload::from_value(&payload) else {
            return;
        };
        let Some(pending) = self
            .shared
            .state
            .lock()
            .requests
            .take_pending(request_type, &response.id)
        else {
            return;
        };

        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_roundtrip(pending.issued_at.elapsed());
        }
        let reply = match &response.outcome {
            ResponseOutcome::Value(value) => Ok(value.clone()),
            ResponseOutcome::Error(err) => Err(RequestError::from_transferred(err)),
        };
        let _ = pending.reply.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settle, RecordingEndpoint};
    use crate::ERROR_OBJECT_SENTINEL;
    use serde_json::json;

    fn connected_port() -> (Port, RecordingEndpoint) {
        let endpoint = RecordingEndpoint::new();
        let port = Port::new(endpoint.clone(), "*");
        (port, endpoint)
    }

    #[tokio::test]
    async fn request_ids_are_namespaced_by_port() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");
        port.connect().await.expect("connect");

        let _first = port.request("sum", vec![json!(1)]);
        let _second = port.request("sum", vec![]);
        let sent = endpoint.sent();
        assert_eq!(sent[0].0["key"], "frau.req.sum");
        assert_eq!(sent[0].0["payload"]["id"], format!("{}_1", port.id()));
        assert_eq!(sent[0].0["payload"]["args"], json!([1]));
        assert_eq!(sent[1].0["payload"]["id"], format!("{}_2", port.id()));
        assert_eq!(port.pending_requests(), 2);
    }

    #[tokio::test]
    async fn responses_resolve_matching_pending_entries_by_id() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");
        port.connect().await.expect("connect");

        let first = port.request("sum", vec![]);
        let second = port.request("sum", vec![]);
        let first_id = format!("{}_1", port.id());
        let second_id = format!("{}_2", port.id());

        endpoint.inject(json!({ "key": "frau.res.sum", "payload": { "id": second_id, "val": 2 } }));
        endpoint.inject(json!({ "key": "frau.res.sum", "payload": { "id": "unknown", "val": 9 } }));
        endpoint.inject(json!({ "key": "frau.res.other", "payload": { "id": first_id, "val": 9 } }));
        endpoint.inject(json!({ "key": "frau.res.sum", "payload": { "id": first_id, "val": 1 } }));
        endpoint.inject(json!({ "key": "frau.res.sum", "payload": { "id": first_id, "val": 3 } }));

        assert_eq!(first.await.expect("first"), json!(1));
        assert_eq!(second.await.expect("second"), json!(2));
        assert_eq!(port.pending_requests(), 0);
    }

    #[tokio::test]
    async fn error_responses_reject_with_reconstructed_error() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");
        port.connect().await.expect("connect");

        let call = port.request("boom", vec![]);
        let id = format!("{}_1", port.id());
        endpoint.inject(json!({
            "key": "frau.res.boom",
            "payload": {
                "id": id,
                "err": { "name": "TypeError", "message": "bad", "props": {}, ERROR_OBJECT_SENTINEL: true }
            }
        }));

        let err = call.await.expect_err("rejects");
        let remote = err.remote().expect("remote error");
        assert_eq!(remote.name, "TypeError");
        assert_eq!(remote.message, "bad");
    }

    #[tokio::test]
    async fn non_error_rejection_surfaces_as_value() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");
        port.connect().await.expect("connect");

        let call = port.request("odd", vec![]);
        let id = format!("{}_1", port.id());
        endpoint.inject(json!({ "key": "frau.res.odd", "payload": { "id": id, "err": "nope" } }));

        assert!(matches!(
            call.await,
            Err(RequestError::Value(LocalValue::String(s))) if s == "nope"
        ));
    }

    #[tokio::test]
    async fn requests_without_handler_get_no_handler_reply() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");

        endpoint.inject(json!({ "key": "frau.req.ping", "payload": { "id": "peer_1", "args": [] } }));
        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1, "responses are not queued behind connect");
        assert_eq!(sent[0].0["key"], "frau.res.ping");
        assert_eq!(sent[0].0["payload"]["id"], "peer_1");
        assert_eq!(sent[0].0["payload"]["err"]["name"], "RequestTypeError");

        // Already answered; a later handler must not see it again.
        port.on_request("ping", json!("pong")).expect("register");
        settle().await;
        assert_eq!(endpoint.sent().len(), 1);
    }

    #[tokio::test]
    async fn handlers_run_asynchronously_and_reply() {
        let (port, endpoint) = connected_port();
        port.on_request(
            "sum",
            RequestHandler::from_fn(|args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            }),
        )
        .expect("register");
        port.open().expect("open");

        endpoint.inject(json!({ "key": "frau.req.sum", "payload": { "id": "peer_1", "args": [2, 3] } }));
        assert!(endpoint.sent().is_empty(), "handler must not run synchronously");
        settle().await;

        let sent = endpoint.sent();
        assert_eq!(
            sent[0].0,
            json!({ "key": "frau.res.sum", "payload": { "id": "peer_1", "val": 5 } })
        );
    }

    #[tokio::test]
    async fn handler_failures_are_transferred() {
        let (port, endpoint) = connected_port();
        port.on_request(
            "boom",
            RequestHandler::from_fn(|_| Err(NativeError::type_error("bad").with_prop("code", 7i64).into())),
        )
        .expect("register");
        port.open().expect("open");

        endpoint.inject(json!({ "key": "frau.req.boom", "payload": { "id": "peer_1", "args": [] } }));
        settle().await;

        let err = &endpoint.sent()[0].0["payload"]["err"];
        assert_eq!(err["name"], "TypeError");
        assert_eq!(err["props"]["code"], 7);
        assert_eq!(err[ERROR_OBJECT_SENTINEL], true);
    }

    #[tokio::test]
    async fn panicking_handler_still_replies_with_an_error() {
        let (port, endpoint) = connected_port();
        port.on_request("crash", RequestHandler::from_fn(|_| panic!("handler exploded")))
            .expect("register");
        port.open().expect("open");

        endpoint.inject(json!({ "key": "frau.req.crash", "payload": { "id": "peer_1", "args": [] } }));
        settle().await;

        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0["key"], "frau.res.crash");
        assert_eq!(sent[0].0["payload"]["id"], "peer_1");
        let err = &sent[0].0["payload"]["err"];
        assert_eq!(err["name"], "Error");
        assert_eq!(err["message"], "handler exploded");
        assert_eq!(err[ERROR_OBJECT_SENTINEL], true);
    }

    #[tokio::test]
    async fn close_leaves_pending_requests_untouched() {
        let (port, endpoint) = connected_port();
        port.open().expect("open");
        port.connect().await.expect("connect");

        let mut call = port.request("slow", vec![]);
        let id = format!("{}_1", port.id());
        port.close().expect("close");
        settle().await;

        assert_eq!(port.pending_requests(), 1);
        assert!(futures::poll!(&mut call).is_pending());

        port.open().expect("reopen");
        endpoint.inject(json!({ "key": "frau.res.slow", "payload": { "id": id, "val": "late" } }));
        assert_eq!(call.await.expect("late response"), json!("late"));
        assert_eq!(port.pending_requests(), 0);
    }

    #[tokio::test]
    async fn registration_rules_are_enforced() {
        let (port, _endpoint) = connected_port();
        port.on_request("x", json!(1)).expect("first");
        let err = port.on_request("x", json!(2)).expect_err("duplicate");
        assert_eq!(err.to_string(), "Duplicate onRequest handler for type \"x\"");

        port.open().expect("open");
        port.connect().await.expect("connect");
        assert!(matches!(
            port.on_request("y", json!(1)),
            Err(PortError::HandlersAfterConnect)
        ));
    }

    #[tokio::test]
    async fn dropped_port_abandons_pending_requests() {
        let (port, _endpoint) = connected_port();
        let call = port.request("never", vec![]);
        drop(port);
        assert!(matches!(call.await, Err(RequestError::Abandoned)));
    }
}
