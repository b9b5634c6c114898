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
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::transform_error::LocalValue;

/// Outcome of a request handler: the reply value, or a local value (usually
/// a [`NativeError`](crate::NativeError)) to reject the caller with.
pub type HandlerResult = Result<Value, LocalValue>;

type HandlerFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Responder for one request type.
#[derive(Clone)]
pub enum RequestHandler {
    /// Invoked with the request arguments; may complete later.
    Function(HandlerFn),
    /// Replied as-is, arguments ignored.
    Constant(Value),
    /// Eventual value shared by every request of this type.
    Deferred(Shared<BoxFuture<'static, HandlerResult>>),
}

impl RequestHandler {
    /// Synchronous handler.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        RequestHandler::Function(Arc::new(move |args| {
            let result = handler(args);
            async move { result }.boxed()
        }))
    }

    /// Handler returning a future.
    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        RequestHandler::Function(Arc::new(move |args| handler(args).boxed()))
    }

    /// Constant reply.
    pub fn constant(value: Value) -> Self {
        RequestHandler::Constant(value)
    }

    /// Reply with the eventual outcome of `future`, computed once.
    pub fn deferred<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        RequestHandler::Deferred(future.boxed().shared())
    }

    /// Produce the reply for one request.
    pub fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        match self {
            RequestHandler::Function(handler) => handler(args),
            RequestHandler::Constant(value) => {
                let value = value.clone();
                async move { Ok(value) }.boxed()
            }
            RequestHandler::Deferred(shared) => shared.clone().boxed(),
        }
    }
}

impl From<Value> for RequestHandler {
    fn from(value: Value) -> Self {
        RequestHandler::Constant(value)
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestHandler::Function(_) => f.write_str("RequestHandler::Function"),
            RequestHandler::Constant(value) => {
                f.debug_tuple("RequestHandler::Constant").field(value).finish()
            }
            RequestHandler::Deferred(_) => f.write_str("RequestHandler::Deferred"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform_error::NativeError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn function_handler_receives_arguments() {
        let handler = RequestHandler::from_fn(|args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        assert_eq!(handler.invoke(vec![json!(2), json!(3)]).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn constant_ignores_arguments() {
        let handler = RequestHandler::from(json!(["add", "sub"]));
        assert_eq!(handler.invoke(vec![json!(1)]).await, Ok(json!(["add", "sub"])));
    }

    #[tokio::test]
    async fn async_handler_rejection_is_reported() {
        let handler = RequestHandler::from_async(|_| async {
            Err(NativeError::type_error("bad").into())
        });
        let err = handler.invoke(Vec::new()).await.expect_err("rejects");
        assert_eq!(err.as_error().map(|e| e.name.as_str()), Some("TypeError"));
    }

    #[tokio::test]
    async fn deferred_value_is_computed_once() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let handler = RequestHandler::deferred(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("late"))
        });

        assert_eq!(handler.invoke(Vec::new()).await, Ok(json!("late")));
        assert_eq!(handler.invoke(Vec::new()).await, Ok(json!("late")));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
