//! Handlers for requests and notifications initiated by the peer.
//!
//! The editor can call back into the client (and a server built on this
//! crate answers the editor's calls), so an `RpcStream` optionally carries
//! an [`RpcHandler`]. Inbound requests receive a [`Responder`] bound to
//! the request's sequence id.

use crate::config::RpcConfig;
use crate::stream::Command;
use futures::future::BoxFuture;
use futures::FutureExt;
use rmpv::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Trait for serving inbound calls on a stream.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Whether an inbound request for `method` has somewhere to go.
    ///
    /// When this returns false the stream answers the peer with an
    /// "unknown method" error without calling [`RpcHandler::request`].
    fn handles_request(&self, method: &str) -> bool;

    /// Serve an inbound request. The answer goes through `responder`.
    async fn request(&self, method: &str, params: Vec<Value>, responder: Responder);

    /// Serve an inbound notification. There is no response path.
    async fn notify(&self, method: &str, params: Vec<Value>);
}

/// Response capability for one inbound request.
///
/// Consuming methods guarantee at most one answer. A responder dropped
/// without answering replies with an error so the peer never waits forever.
pub struct Responder {
    seq: u32,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl Responder {
    pub(crate) fn new(seq: u32, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            seq,
            commands: Some(commands),
        }
    }

    /// Sequence id of the inbound request this responder answers.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Answer with a result.
    pub fn result(mut self, value: Value) {
        self.send(Ok(value));
    }

    /// Answer with an error payload.
    pub fn error(mut self, error: Value) {
        self.send(Err(error));
    }

    /// Answer with either outcome.
    pub fn respond(mut self, outcome: std::result::Result<Value, Value>) {
        self.send(outcome);
    }

    fn send(&mut self, outcome: std::result::Result<Value, Value>) {
        if let Some(commands) = self.commands.take() {
            let seq = self.seq;
            if commands.send(Command::Respond { seq, outcome }).is_err() {
                debug!("Dropping response for seq {}: stream is gone", seq);
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.commands.is_some() {
            warn!("Request handler for seq {} finished without responding", self.seq);
            self.send(Err(Value::from("request handler dropped without responding")));
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("seq", &self.seq)
            .field("answered", &self.commands.is_none())
            .finish()
    }
}

type RequestFn = Arc<dyn Fn(Vec<Value>, Responder) -> BoxFuture<'static, ()> + Send + Sync>;
type NotifyFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of handlers keyed by method name.
///
/// Methods addressed by numeric id are looked up by their decimal string,
/// so the bootstrap method `0` is registered as `"0"`.
///
/// # Example
///
/// ```rust,ignore
/// let handlers = Handlers::new()
///     .on_call("ping", |_params| async { Ok(Value::from("pong")) })
///     .on_notification("redraw", |params| async move {
///         println!("redraw: {:?}", params);
///     });
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    requests: HashMap<String, RequestFn>,
    notifications: HashMap<String, NotifyFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler that answers through a [`Responder`].
    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.requests.insert(
            method.into(),
            Arc::new(move |params, responder| handler(params, responder).boxed()),
        );
        self
    }

    /// Register a request handler whose return value becomes the response.
    pub fn on_call<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request(method, move |params, responder| {
            let handler = handler.clone();
            async move {
                let outcome = handler(params).await;
                responder.respond(outcome);
            }
        })
    }

    /// Register a notification handler.
    pub fn on_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notifications.insert(
            method.into(),
            Arc::new(move |params| handler(params).boxed()),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.notifications.is_empty()
    }
}

#[async_trait::async_trait]
impl RpcHandler for Handlers {
    fn handles_request(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    async fn request(&self, method: &str, params: Vec<Value>, responder: Responder) {
        match self.requests.get(method) {
            Some(handler) => handler(params, responder).await,
            None => responder.error(Value::from(RpcConfig::UNKNOWN_METHOD_ERROR)),
        }
    }

    async fn notify(&self, method: &str, params: Vec<Value>) {
        match self.notifications.get(method) {
            Some(handler) => handler(params).await,
            None => debug!("No handler for notification {}", method),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        requests.sort();
        notifications.sort();
        f.debug_struct("Handlers")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> (Responder, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Responder::new(9, tx), rx)
    }

    fn expect_respond(rx: &mut mpsc::UnboundedReceiver<Command>) -> (u32, Result<Value, Value>) {
        match rx.try_recv() {
            Ok(Command::Respond { seq, outcome }) => (seq, outcome),
            other => panic!("Expected Respond command, got: {:?}", other),
        }
    }

    #[test]
    fn test_responder_answers_once() {
        let (responder, mut rx) = responder();
        responder.result(Value::from(42));

        assert_eq!(expect_respond(&mut rx), (9, Ok(Value::from(42))));
        // Nothing else after the consuming call and the drop
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_responder_sends_error() {
        let (responder, mut rx) = responder();
        drop(responder);

        let (seq, outcome) = expect_respond(&mut rx);
        assert_eq!(seq, 9);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_registered_call_responds_with_return_value() {
        let handlers = Handlers::new().on_call("add", |params| async move {
            let sum: i64 = params.iter().filter_map(|v| v.as_i64()).sum();
            Ok(Value::from(sum))
        });
        assert!(handlers.handles_request("add"));

        let (responder, mut rx) = responder();
        handlers
            .request("add", vec![Value::from(3), Value::from(4)], responder)
            .await;

        assert_eq!(expect_respond(&mut rx), (9, Ok(Value::from(7))));
    }

    #[tokio::test]
    async fn test_unregistered_request_gets_unknown_method() {
        let handlers = Handlers::new();
        assert!(!handlers.handles_request("nope"));

        let (responder, mut rx) = responder();
        handlers.request("nope", vec![], responder).await;

        let (_, outcome) = expect_respond(&mut rx);
        assert_eq!(outcome, Err(Value::from("unknown method")));
    }

    #[tokio::test]
    async fn test_notification_handler_runs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = Handlers::new().on_notification("redraw", move |params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(params);
            }
        });

        handlers.notify("redraw", vec![Value::from("flush")]).await;
        handlers.notify("unknown", vec![]).await;

        assert_eq!(rx.recv().await, Some(vec![Value::from("flush")]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_debug_lists_methods() {
        let handlers = Handlers::new()
            .on_call("b", |_| async { Ok(Value::Nil) })
            .on_call("a", |_| async { Ok(Value::Nil) });
        let debug = format!("{:?}", handlers);
        assert!(debug.contains("[\"a\", \"b\"]"));
        assert!(!handlers.is_empty());
    }
}
