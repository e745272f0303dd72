//! Event router: maps event names to local handlers and runs them.

use super::envelope::ResponsePayload;
use crate::types::ShardId;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Boxed handler future; the error is already stringified.
pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// Type-erased async handler: `(payload, sender) -> result`.
pub type Handler = Arc<dyn Fn(Value, ShardId) -> HandlerFuture + Send + Sync>;

/// Erase a concrete async closure into a [`Handler`].
pub fn handler_fn<F, Fut, E>(f: F) -> Handler
where
    F: Fn(Value, ShardId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
    E: fmt::Display,
{
    Arc::new(move |payload, sender| {
        let fut = f(payload, sender);
        async move { fut.await.map_err(|e| e.to_string()) }.boxed()
    })
}

/// Event name -> handler. Last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&String> = self.handlers.keys().collect();
        events.sort();
        f.debug_struct("HandlerRegistry").field("events", &events).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, returning the handler it replaced.
    pub fn insert(&mut self, event: &str, handler: Handler) -> Option<Handler> {
        self.handlers.insert(event.to_string(), handler)
    }

    pub fn remove(&mut self, event: &str) -> Option<Handler> {
        self.handlers.remove(event)
    }

    pub fn get(&self, event: &str) -> Option<Handler> {
        self.handlers.get(event).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run a handler, converting errors and panics into a failure payload.
pub async fn invoke(handler: Handler, payload: Value, sender: ShardId) -> ResponsePayload {
    // The call happens inside the guarded future so a synchronous panic in
    // the handler body is caught too.
    let run = async move { handler(payload, sender).await };
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(result)) => ResponsePayload::ok(result),
        Ok(Err(error)) => ResponsePayload::handler_failed(error),
        Err(panic) => ResponsePayload::handler_failed(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
