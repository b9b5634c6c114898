//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Versioned multi-method services, layered purely on [`RequestChannel`].
//!
//! A service `math` version `1.0` exposing `add` answers two request types:
//! `service:math:1.0` (the method name list) and `service:math:1.0:add`.
use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::Value;

use crate::handler::{HandlerResult, RequestHandler};
use crate::requests::{RequestChannel, RequestError, ResponseFuture};
use crate::transform_error::NativeError;
use crate::{PortError, Result};

/// Errors raised by a [`ServiceProxy`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The remote service did not advertise this method.
    #[error("service \"{service}\" has no method \"{method}\"")]
    UnknownMethod {
        /// Service request prefix, `service:<type>:<version>`.
        service: String,
        /// Requested method name.
        method: String,
    },
}

enum ServiceMember {
    Method(RequestHandler),
    Field(Value),
}

/// Object registered with [`ServiceChannel::register_service`].
///
/// Only methods are advertised and callable remotely; fields are kept
/// locally and never exposed.
#[derive(Default)]
pub struct Service {
    members: IndexMap<String, ServiceMember>,
}

impl Service {
    /// Empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a synchronous method.
    pub fn method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.members
            .insert(name.into(), ServiceMember::Method(RequestHandler::from_fn(method)));
        self
    }

    /// Add a method returning a future.
    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.members
            .insert(name.into(), ServiceMember::Method(RequestHandler::from_async(method)));
        self
    }

    /// Add a plain data member.
    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.members.insert(name.into(), ServiceMember::Field(value));
        self
    }

    /// Names of callable members, in insertion order.
    pub fn method_names(&self) -> Vec<String> {
        self.methods().map(|(name, _)| name.clone()).collect()
    }

    fn methods(&self) -> impl Iterator<Item = (&String, &RequestHandler)> {
        self.members.iter().filter_map(|(name, member)| match member {
            ServiceMember::Method(handler) => Some((name, handler)),
            ServiceMember::Field(_) => None,
        })
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("methods", &self.method_names())
            .field("members", &self.members.len())
            .finish()
    }
}

/// Service type names: one or more ASCII letters, then letters or dashes.
pub fn is_valid_service_type(service_type: &str) -> bool {
    let mut chars = service_type.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphabetic() || c == '-')
}

fn service_prefix(service_type: &str, version: &str) -> String {
    format!("service:{service_type}:{version}")
}

/// Versioned multi-method services over any [`RequestChannel`].
pub trait ServiceChannel: RequestChannel + Clone + Send + Sync + 'static {
    /// Expose `service` as `service_type` at `version`. Only legal before
    /// connecting.
    fn register_service(&self, service_type: &str, version: &str, service: Service) -> Result<&Self> {
        if self.is_connected() {
            return Err(PortError::ServicesAfterConnect);
        }
        if !is_valid_service_type(service_type) {
            return Err(PortError::InvalidServiceType(service_type.to_owned()));
        }

        let prefix = service_prefix(service_type, version);
        let names: Vec<Value> = service
            .method_names()
            .into_iter()
            .map(Value::String)
            .collect();
        self.on_request(&prefix, RequestHandler::constant(Value::Array(names)))?;
        for (name, handler) in service.methods() {
            self.on_request(&format!("{prefix}:{name}"), handler.clone())?;
        }
        Ok(self)
    }

    /// Discover `service_type` at `version` on the remote side and build a
    /// proxy for it. Only legal once connected; every call performs a fresh
    /// discovery round-trip.
    fn get_service(
        &self,
        service_type: &str,
        version: &str,
    ) -> Result<BoxFuture<'static, std::result::Result<ServiceProxy<Self>, RequestError>>> {
        if !self.is_connected() {
            return Err(PortError::NotConnected);
        }
        let prefix = service_prefix(service_type, version);
        let discovery = self.request(&prefix, Vec::new());
        let channel = self.clone();
        Ok(async move {
            let methods = match discovery.await? {
                Value::Array(names) => names
                    .into_iter()
                    .filter_map(|name| match name {
                        Value::String(name) => Some(name),
                        _ => None,
                    })
                    .collect(),
                other => {
                    return Err(RequestError::Remote(NativeError::type_error(format!(
                        "service \"{prefix}\" answered discovery with {other}"
                    ))))
                }
            };
            Ok(ServiceProxy {
                channel,
                prefix,
                methods,
            })
        }
        .boxed())
    }
}

impl<T> ServiceChannel for T where T: RequestChannel + Clone + Send + Sync + 'static {}

/// Client-side stub for a remote service.
#[derive(Clone)]
pub struct ServiceProxy<C> {
    channel: C,
    prefix: String,
    methods: Vec<String>,
}

impl<C: RequestChannel> ServiceProxy<C> {
    /// Methods advertised by the remote service.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Whether the remote service advertised `method`.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|name| name == method)
    }

    /// Invoke `method` remotely.
    pub fn call(&self, method: &str, args: Vec<Value>) -> std::result::Result<ResponseFuture, ServiceError> {
        if !self.has_method(method) {
            return Err(ServiceError::UnknownMethod {
                service: self.prefix.clone(),
                method: method.to_owned(),
            });
        }
        Ok(self.channel.request(&format!("{}:{}", self.prefix, method), args))
    }
}

impl<C> fmt::Debug for ServiceProxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("prefix", &self.prefix)
            .field("methods", &self.methods)
            .finish()
    }
}
