//! Method dispatch for client calls.
//!
//! The embedding application registers named async handlers; the session
//! worker looks them up for every `call` frame and spawns them, so a slow
//! handler never delays the next frame and responses go out in completion
//! order, not arrival order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

/// Identity of the session a call arrived on, handed to every handler.
#[derive(Debug, Clone)]
pub struct Caller {
    pub client_id: String,
}

/// Failure returned by a method handler. The message travels back to the
/// caller on an error-flagged response; the connection stays open.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

pub type MethodResult = Result<Value, MethodError>;

/// A boxed future returned by method handlers.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

type BoxedMethod = Arc<dyn Fn(Caller, Value) -> MethodFuture + Send + Sync>;

/// Name-to-handler table consulted for every inbound call.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, BoxedMethod>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Caller, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.methods.insert(
            name.into(),
            Arc::new(move |caller, args| Box::pin(handler(caller, args))),
        );
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<BoxedMethod> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
