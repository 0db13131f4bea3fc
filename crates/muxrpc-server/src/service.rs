//! Service definitions: a named receiver plus an explicit table of
//! dispatchable methods.
//!
//! There is no runtime reflection to enumerate methods from, so each
//! method is registered with a closure whose signature carries the shape
//! rules: a shared receiver, one decodable argument, one mutable
//! default-initialized reply, and a single error-typed return. The
//! per-method table keeps the same moving parts a reflective dispatcher
//! would: an argument factory, a reply factory, the invoker, and an
//! invocation counter.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use muxrpc_common::{Result, RpcError};

/// Error returned by a dispatched method. Its text travels back to the
/// caller in the response header; the reply body becomes a placeholder.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        MethodError(message.into())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        MethodError(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        MethodError(message.to_string())
    }
}

type BoxedValue = Box<dyn Any + Send>;
type ArgFactory = Box<dyn Fn(Value) -> Result<BoxedValue> + Send + Sync>;
type ReplyFactory = Box<dyn Fn() -> BoxedValue + Send + Sync>;
type Invoker =
    Box<dyn Fn(BoxedValue, &mut BoxedValue) -> std::result::Result<(), MethodError> + Send + Sync>;
type ReplyEncoder = Box<dyn Fn(&BoxedValue) -> Result<Value> + Send + Sync>;

/// One dispatchable method.
struct MethodSpec {
    new_arg: ArgFactory,
    new_reply: ReplyFactory,
    invoke: Invoker,
    encode_reply: ReplyEncoder,
    calls: AtomicU64,
}

/// A named target exposing registered methods. Built with
/// [`Service::build`], then handed to the server's registry.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodSpec>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Starts building a service named `name` around `receiver`. The
    /// receiver is shared by every method handler.
    pub fn build<T>(name: impl Into<String>, receiver: T) -> ServiceBuilder<T>
    where
        T: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Number of invocations of `method` so far, or `None` for an
    /// unknown method.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods
            .get(method)
            .map(|spec| spec.calls.load(Ordering::Relaxed))
    }

    /// Decodes a request body into the argument value for `method`.
    pub(crate) fn new_arg(&self, method: &str, body: Value) -> Result<BoxedValue> {
        (self.method(method)?.new_arg)(body)
    }

    /// Invokes `method` with a decoded argument: allocates the default
    /// reply, runs the handler, and encodes the reply. The invocation
    /// counter is bumped whether or not the handler succeeds.
    pub(crate) fn call(&self, method: &str, arg: BoxedValue) -> Result<Value> {
        let spec = self.method(method)?;
        spec.calls.fetch_add(1, Ordering::Relaxed);

        let mut reply = (spec.new_reply)();
        match (spec.invoke)(arg, &mut reply) {
            Ok(()) => (spec.encode_reply)(&reply),
            Err(err) => Err(RpcError::Method(err.to_string())),
        }
    }

    fn method(&self, name: &str) -> Result<&MethodSpec> {
        self.methods
            .get(name)
            .ok_or_else(|| RpcError::UnknownMethod(name.to_string()))
    }
}

/// Builder collecting method registrations for one service.
///
/// Validation failures are deferred: the first one is remembered and
/// surfaced by [`ServiceBuilder::finish`], so registrations can chain.
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, MethodSpec>,
    error: Option<RpcError>,
}

impl<T> ServiceBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Registers `handler` under `name`.
    ///
    /// The handler receives the service receiver, the decoded argument,
    /// and a reply slot initialized to `R::default()` — a fresh zero
    /// value per invocation, which also covers the empty-map and
    /// empty-sequence cases.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(&T, A, &mut R) -> std::result::Result<(), MethodError> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Err(err) = validate_name(&name, "method") {
            self.error.get_or_insert(err);
            return self;
        }
        if self.methods.contains_key(&name) {
            self.error.get_or_insert(RpcError::InvalidService(format!(
                "method {name} registered twice"
            )));
            return self;
        }

        let receiver = Arc::clone(&self.receiver);
        let spec = MethodSpec {
            new_arg: Box::new(|body| {
                let arg = serde_json::from_value::<A>(body)?;
                Ok(Box::new(arg) as BoxedValue)
            }),
            new_reply: Box::new(|| Box::new(R::default()) as BoxedValue),
            invoke: Box::new(move |arg, reply| {
                let arg = arg
                    .downcast::<A>()
                    .map_err(|_| MethodError::new("argument type mismatch"))?;
                let reply = reply
                    .downcast_mut::<R>()
                    .ok_or_else(|| MethodError::new("reply type mismatch"))?;
                handler(&receiver, *arg, reply)
            }),
            encode_reply: Box::new(|reply| {
                let reply = reply
                    .downcast_ref::<R>()
                    .ok_or_else(|| RpcError::Method("reply type mismatch".to_string()))?;
                Ok(serde_json::to_value(reply)?)
            }),
            calls: AtomicU64::new(0),
        };
        self.methods.insert(name, spec);
        self
    }

    /// Finalizes the service. Fails if the service name, any method name,
    /// or the method set was invalid.
    pub fn finish(self) -> Result<Service> {
        if let Some(err) = self.error {
            return Err(err);
        }
        validate_name(&self.name, "service")?;
        if self.methods.is_empty() {
            return Err(RpcError::InvalidService(format!(
                "service {} has no methods",
                self.name
            )));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Service and method names must be identifier-shaped so that
/// `Service.Method` addressing parses unambiguously.
fn validate_name(name: &str, kind: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RpcError::InvalidService(format!(
            "{kind} name {name:?} is not a valid identifier"
        )))
    }
}
